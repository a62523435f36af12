//! Covariance statistics of a layer's input distribution
//!
//! The solve is regularised by the uncentered second moment `E[k kᵀ]` of the
//! edited module's inputs over a reference corpus. Estimating it means
//! streaming a dataset through the model, which is a backend concern behind
//! [`StatsProvider`]; this module owns the caching and the accumulator.

use std::collections::HashMap;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use rand::seq::index::sample;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::cache::EditCache;
use crate::hparams::parse_dtype;

/// Identifies a statistics request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsQuery {
    pub model_name: String,
    pub layer_name: String,
    pub dataset: String,
    pub sample_size: usize,
    /// Accumulation precision, e.g. `"float32"`
    pub dtype: String,
}

/// Statistics returned by a provider
#[derive(Debug, Clone)]
pub struct LayerStats {
    /// `[d_in, d_in]` second moment
    pub mom2: Tensor,
    /// `[n_preserved, d_in]` retained sample of inputs
    pub preserved_keys: Tensor,
}

/// Source of per-layer second-moment statistics
pub trait StatsProvider {
    fn layer_stats(&self, query: &StatsQuery, force_recompute: bool) -> Result<LayerStats>;
}

/// Covariance and preserved keys for a layer, served from the cache when
/// possible.
///
/// `force_recompute` bypasses the cache and overwrites the entry. The
/// covariance is returned on `device` in the cached F32 precision.
pub fn get_covariance(
    cache: &mut EditCache,
    provider: &dyn StatsProvider,
    query: &StatsQuery,
    force_recompute: bool,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    info!(
        "Retrieving covariance statistics for {} @ {}.",
        query.model_name, query.layer_name
    );

    let cached = if force_recompute {
        None
    } else {
        cache
            .covariance(&query.model_name, &query.layer_name)
            .cloned()
    };

    let entry = match cached {
        Some(entry) => entry,
        None => {
            let stats = provider
                .layer_stats(query, force_recompute)
                .with_context(|| format!("Failed to collect statistics for {}", query.layer_name))?;
            cache
                .insert_covariance(
                    &query.model_name,
                    &query.layer_name,
                    &stats.mom2,
                    stats.preserved_keys,
                )?
                .clone()
        }
    };

    Ok((entry.mom2.to_device(device)?, entry.preserved_keys))
}

/// Running uncentered second moment of row vectors
#[derive(Debug, Clone)]
pub struct SecondMoment {
    count: usize,
    mom2: Option<Tensor>,
}

impl SecondMoment {
    pub fn new() -> Self {
        Self {
            count: 0,
            mom2: None,
        }
    }

    /// Accumulate a batch of rows, shape `[n, d]`
    pub fn add(&mut self, batch: &Tensor) -> Result<()> {
        let (n, _) = batch.dims2()?;
        if n == 0 {
            return Ok(());
        }
        let outer = batch.t()?.contiguous()?.matmul(batch)?;
        self.mom2 = Some(match self.mom2.take() {
            Some(acc) => acc.add(&outer)?,
            None => outer,
        });
        self.count += n;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// `Σ xᵀx / n`
    pub fn moment(&self) -> Result<Tensor> {
        match &self.mom2 {
            Some(acc) if self.count > 0 => Ok((acc / self.count as f64)?),
            _ => anyhow::bail!("SecondMoment: no samples accumulated"),
        }
    }
}

impl Default for SecondMoment {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics over reference activations already held in memory.
///
/// Each layer maps to a `[n_samples, d_in]` matrix of module inputs collected
/// from the reference dataset.
#[derive(Debug, Clone)]
pub struct SampleStats {
    samples: HashMap<String, Tensor>,
    batch_size: usize,
    n_preserved: usize,
    seed: u64,
}

impl SampleStats {
    pub fn new() -> Self {
        Self {
            samples: HashMap::new(),
            batch_size: 100,
            n_preserved: 1000,
            seed: 42,
        }
    }

    /// Register reference activations for a layer
    pub fn with_layer(mut self, layer_name: impl Into<String>, samples: Tensor) -> Self {
        self.samples.insert(layer_name.into(), samples);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Number of rows retained as preserved keys
    pub fn with_preserved(mut self, n_preserved: usize) -> Self {
        self.n_preserved = n_preserved;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

impl Default for SampleStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsProvider for SampleStats {
    fn layer_stats(&self, query: &StatsQuery, _force_recompute: bool) -> Result<LayerStats> {
        let samples = self
            .samples
            .get(&query.layer_name)
            .ok_or_else(|| anyhow::anyhow!("No reference samples for {}", query.layer_name))?;
        let (available, _) = samples.dims2()?;
        let n = available.min(query.sample_size);
        anyhow::ensure!(n > 0, "No reference samples for {}", query.layer_name);

        let dtype = match parse_dtype(&query.dtype)? {
            // Half precision accumulators lose too much over long sums
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        debug!(
            "Accumulating {n} samples for {} in {dtype:?}",
            query.layer_name
        );

        let samples = samples.narrow(0, 0, n)?.to_dtype(dtype)?;
        let mut stat = SecondMoment::new();
        let mut offset = 0;
        while offset < n {
            let len = self.batch_size.min(n - offset);
            stat.add(&samples.narrow(0, offset, len)?)?;
            offset += len;
        }

        let mut rng = rand::rngs::StdRng::seed_from_u64(self.seed);
        let mut picked: Vec<u32> = sample(&mut rng, n, self.n_preserved.min(n))
            .into_iter()
            .map(|i| i as u32)
            .collect();
        picked.sort_unstable();
        let n_picked = picked.len();
        let index = Tensor::from_vec(picked, n_picked, samples.device())?;
        let preserved_keys = samples.index_select(&index, 0)?;

        Ok(LayerStats {
            mom2: stat.moment()?,
            preserved_keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingStats {
        calls: Cell<usize>,
        scale: Cell<f64>,
    }

    impl StatsProvider for CountingStats {
        fn layer_stats(&self, _query: &StatsQuery, _force: bool) -> Result<LayerStats> {
            self.calls.set(self.calls.get() + 1);
            let mom2 = (Tensor::eye(3, DType::F64, &Device::Cpu)? * self.scale.get())?;
            let preserved_keys = Tensor::ones((2, 3), DType::F32, &Device::Cpu)?;
            Ok(LayerStats {
                mom2,
                preserved_keys,
            })
        }
    }

    fn query() -> StatsQuery {
        StatsQuery {
            model_name: "toy".into(),
            layer_name: "layers.0.mlp".into(),
            dataset: "wikipedia".into(),
            sample_size: 10,
            dtype: "float32".into(),
        }
    }

    #[test]
    fn test_covariance_cached_between_calls() {
        let provider = CountingStats {
            calls: Cell::new(0),
            scale: Cell::new(2.0),
        };
        let mut cache = EditCache::new();

        let (c1, p1) = get_covariance(&mut cache, &provider, &query(), false, &Device::Cpu).unwrap();
        let (c2, p2) = get_covariance(&mut cache, &provider, &query(), false, &Device::Cpu).unwrap();

        assert_eq!(provider.calls.get(), 1);
        assert_eq!(c1.to_vec2::<f32>().unwrap(), c2.to_vec2::<f32>().unwrap());
        assert_eq!(p1.to_vec2::<f32>().unwrap(), p2.to_vec2::<f32>().unwrap());
        assert_eq!(c1.dtype(), DType::F32);
    }

    #[test]
    fn test_force_recompute_overwrites() {
        let provider = CountingStats {
            calls: Cell::new(0),
            scale: Cell::new(2.0),
        };
        let mut cache = EditCache::new();
        get_covariance(&mut cache, &provider, &query(), false, &Device::Cpu).unwrap();

        provider.scale.set(5.0);
        let (forced, _) = get_covariance(&mut cache, &provider, &query(), true, &Device::Cpu).unwrap();
        assert_eq!(provider.calls.get(), 2);
        assert_eq!(forced.to_vec2::<f32>().unwrap()[0][0], 5.0);

        // The overwritten entry is what later cache hits return
        let (cached, _) = get_covariance(&mut cache, &provider, &query(), false, &Device::Cpu).unwrap();
        assert_eq!(provider.calls.get(), 2);
        assert_eq!(cached.to_vec2::<f32>().unwrap()[0][0], 5.0);
    }

    #[test]
    fn test_second_moment() {
        let mut stat = SecondMoment::new();
        assert!(stat.moment().is_err());

        let a = Tensor::new(&[[1.0f64, 0.0], [0.0, 2.0]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[1.0f64, 1.0], [1.0, 1.0]], &Device::Cpu).unwrap();
        stat.add(&a).unwrap();
        stat.add(&b).unwrap();
        assert_eq!(stat.count(), 4);

        // (diag(1, 4) + [[2, 2], [2, 2]]) / 4
        let m = stat.moment().unwrap().to_vec2::<f64>().unwrap();
        assert!((m[0][0] - 0.75).abs() < 1e-12);
        assert!((m[0][1] - 0.5).abs() < 1e-12);
        assert!((m[1][1] - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_sample_stats_batches_and_truncates() {
        let rows: Vec<f64> = (0..20).map(|i| f64::from(i % 4)).collect();
        let samples = Tensor::from_vec(rows, (10, 2), &Device::Cpu).unwrap();
        let provider = SampleStats::new()
            .with_layer("layers.0.mlp", samples.clone())
            .with_batch_size(3)
            .with_preserved(4);

        let mut q = query();
        q.dtype = "float64".into();
        let stats = provider.layer_stats(&q, false).unwrap();

        let expected = (samples.t().unwrap().contiguous().unwrap().matmul(&samples).unwrap() / 10.0).unwrap();
        let got = stats.mom2.to_vec2::<f64>().unwrap();
        let want = expected.to_vec2::<f64>().unwrap();
        for (g, w) in got.iter().flatten().zip(want.iter().flatten()) {
            assert!((g - w).abs() < 1e-12);
        }
        assert_eq!(stats.preserved_keys.dims(), &[4, 2]);

        // sample_size caps the rows used
        q.sample_size = 2;
        let stats = provider.layer_stats(&q, false).unwrap();
        let head = samples.narrow(0, 0, 2).unwrap();
        let expected = (head.t().unwrap().contiguous().unwrap().matmul(&head).unwrap() / 2.0).unwrap();
        assert_eq!(
            stats.mom2.to_vec2::<f64>().unwrap(),
            expected.to_vec2::<f64>().unwrap()
        );
        assert_eq!(stats.preserved_keys.dims(), &[2, 2]);
    }

    #[test]
    fn test_sample_stats_unknown_layer() {
        let provider = SampleStats::new();
        assert!(provider.layer_stats(&query(), false).is_err());
    }
}
