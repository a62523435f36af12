//! Device and precision policy for the update computation

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use tracing::info;

/// Where the solve runs and in which precision.
///
/// Built once per edit session and handed to the editor; every tensor that
/// enters the solve goes through [`ComputeContext::to_solve`].
#[derive(Debug, Clone)]
pub struct ComputeContext {
    device: Device,
    solve_dtype: DType,
}

impl ComputeContext {
    /// Solve on the given device in double precision
    pub fn new(device: Device) -> Self {
        Self {
            device,
            solve_dtype: DType::F64,
        }
    }

    /// CPU context
    pub fn cpu() -> Self {
        Self::new(Device::Cpu)
    }

    /// Use CUDA when available unless `force_cpu` is set
    pub fn auto(force_cpu: bool) -> Self {
        if force_cpu {
            info!("Forcing CPU mode");
            return Self::cpu();
        }
        match Device::cuda_if_available(0) {
            Ok(dev) if dev.is_cuda() => {
                info!("Using CUDA device");
                Self::new(dev)
            }
            _ => {
                info!("CUDA not available, using CPU");
                Self::cpu()
            }
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn solve_dtype(&self) -> DType {
        self.solve_dtype
    }

    /// Move a tensor to the compute device in solve precision
    pub fn to_solve(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor
            .to_device(&self.device)?
            .to_dtype(self.solve_dtype)?)
    }

    /// Move a tensor back to host memory
    pub fn to_host(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.to_device(&Device::Cpu)?)
    }
}

impl Default for ComputeContext {
    fn default() -> Self {
        Self::cpu()
    }
}
