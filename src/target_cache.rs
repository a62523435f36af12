//! On-disk cache of computed target representations
//!
//! One safetensors file per `(layer, clamp_norm_factor, case_id)` holding a
//! single tensor named `v_star`. Unreadable files are recomputed, never fatal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use tracing::{info, warn};

use crate::request::CaseId;

const V_STAR: &str = "v_star";

/// File-name template with three positional `{}` slots:
/// layer, clamp norm factor, case id
#[derive(Debug, Clone)]
pub struct TargetCache {
    template: String,
}

impl TargetCache {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Cache file for a request
    pub fn path_for(&self, layer: usize, clamp_norm_factor: f64, case_id: &CaseId) -> PathBuf {
        let args = [
            layer.to_string(),
            clamp_norm_factor.to_string(),
            case_id.to_string(),
        ];
        PathBuf::from(format_positional(&self.template, &args))
    }

    /// Read a cached target, `None` when absent or unreadable
    pub fn load(&self, path: &Path, device: &Device) -> Option<Tensor> {
        if !path.exists() {
            return None;
        }
        match read_v_star(path, device) {
            Ok(z) => Some(z),
            Err(e) => {
                warn!("Error reading cache file due to {e:#}. Recomputing...");
                None
            }
        }
    }

    /// Write a target, creating parent directories
    pub fn store(&self, path: &Path, z: &Tensor) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tensors = HashMap::from([(V_STAR.to_string(), z.to_device(&Device::Cpu)?)]);
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Cached k/v pair at {}", path.display());
        Ok(())
    }
}

fn read_v_star(path: &Path, device: &Device) -> Result<Tensor> {
    let mut tensors = candle_core::safetensors::load(path, device)?;
    tensors
        .remove(V_STAR)
        .ok_or_else(|| anyhow::anyhow!("{} has no {V_STAR} tensor", path.display()))
}

/// Fill `{}` slots left to right; surplus slots stay as written
fn format_positional(template: &str, args: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut args = args.iter();
    while let Some(pos) = rest.find("{}") {
        let Some(arg) = args.next() else { break };
        out.push_str(&rest[..pos]);
        out.push_str(arg);
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_path_for() {
        let cache = TargetCache::new("kv/layer_{}_clamp_{}_case_{}.safetensors");
        let path = cache.path_for(17, 0.75, &CaseId::Number(42));
        assert_eq!(
            path,
            PathBuf::from("kv/layer_17_clamp_0.75_case_42.safetensors")
        );
        let path = cache.path_for(3, 4.0, &CaseId::Text("x".into()));
        assert_eq!(path, PathBuf::from("kv/layer_3_clamp_4_case_x.safetensors"));
    }

    #[test]
    fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TargetCache::new(
            dir.path()
                .join("nested/{}_{}_{}.safetensors")
                .to_string_lossy()
                .into_owned(),
        );
        let path = cache.path_for(1, 4.0, &CaseId::Number(0));
        assert!(cache.load(&path, &Device::Cpu).is_none());

        let z = Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu).unwrap();
        cache.store(&path, &z).unwrap();
        let loaded = cache.load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.to_vec1::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_corrupt_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.safetensors");
        std::fs::write(&path, b"not a tensor file").unwrap();

        let cache = TargetCache::new("unused");
        assert!(cache.load(&path, &Device::Cpu).is_none());

        // A valid file without v_star is treated the same way
        let other = HashMap::from([(
            "other".to_string(),
            Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap(),
        )]);
        candle_core::safetensors::save(&other, &path).unwrap();
        assert!(cache.load(&path, &Device::Cpu).is_none());
    }
}
