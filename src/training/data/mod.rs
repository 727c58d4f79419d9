//! Beam-training measurement batches
//!
//! A [`DataSource`] yields [`RawBatch`]es of per-timestep sequences;
//! [`BatchTargets::from_raw`] cuts each batch into the historical model input
//! and the one-step-ahead targets of the three tasks.

pub mod loaders;

pub use loaders::ShardDataLoader;

use candle_core::{DType, IndexOp, Tensor};

use crate::config::SystemParams;
use crate::error::{Error, Result};

/// Source of batches for one pass over a dataset split
pub trait DataSource {
    /// Rewind to the start of the split
    fn reset(&mut self) -> Result<()>;

    /// Next batch, or `None` once the split is exhausted
    fn next_batch(&mut self) -> Result<Option<RawBatch>>;
}

/// Per-timestep sequences for a batch of UE trajectories
///
/// `L` is the stored sequence length (history plus prediction steps).
#[derive(Debug, Clone)]
pub struct RawBatch {
    /// (b, 2, L, BS, beam) received signal, real and imaginary parts
    pub channels: Tensor,
    /// (b, L) optimal BS index
    pub bs_label: Tensor,
    /// (b, L) optimal beam index
    pub beam_label: Tensor,
    /// (b, L, BS, beam) received beam power
    pub beam_power: Tensor,
    /// (b, L, 2) UE position
    pub ue_loc: Tensor,
    /// (b, L, BS, 2) BS positions
    pub bs_loc: Tensor,
}

impl RawBatch {
    /// Number of trajectories in the batch
    pub fn len(&self) -> usize {
        self.channels.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check every field against the system dimensions
    pub fn validate(&self, system: &SystemParams) -> Result<()> {
        let (n, iq, seq_len, bs_num, beam_num) = self.channels.dims5()?;
        if iq != 2 || bs_num != system.bs_num || beam_num != system.beam_num {
            return Err(Error::shape(
                ("b", 2, "L", system.bs_num, system.beam_num),
                self.channels.dims(),
            ));
        }
        if seq_len < system.seq_len() {
            return Err(Error::data(format!(
                "Sequences hold {} steps, at least {} required",
                seq_len,
                system.seq_len()
            )));
        }

        let expected: [(&str, &Tensor, Vec<usize>); 5] = [
            ("bs_label", &self.bs_label, vec![n, seq_len]),
            ("beam_label", &self.beam_label, vec![n, seq_len]),
            ("beam_power", &self.beam_power, vec![n, seq_len, bs_num, beam_num]),
            ("ue_loc", &self.ue_loc, vec![n, seq_len, 2]),
            ("bs_loc", &self.bs_loc, vec![n, seq_len, bs_num, 2]),
        ];
        for (name, tensor, dims) in expected {
            if tensor.dims() != dims.as_slice() {
                return Err(Error::Shape {
                    expected: format!("{} {:?}", name, dims),
                    actual: format!("{:?}", tensor.dims()),
                });
            }
        }
        Ok(())
    }

    /// Select trajectories along the batch axis
    pub fn index_select(&self, indexes: &Tensor) -> Result<Self> {
        Ok(Self {
            channels: self.channels.index_select(indexes, 0)?,
            bs_label: self.bs_label.index_select(indexes, 0)?,
            beam_label: self.beam_label.index_select(indexes, 0)?,
            beam_power: self.beam_power.index_select(indexes, 0)?,
            ue_loc: self.ue_loc.index_select(indexes, 0)?,
            bs_loc: self.bs_loc.index_select(indexes, 0)?,
        })
    }

    /// Concatenate batches along the batch axis
    pub fn cat(batches: &[RawBatch]) -> Result<Self> {
        if batches.is_empty() {
            return Err(Error::data("No batches to concatenate"));
        }
        let field = |f: fn(&RawBatch) -> &Tensor| -> Result<Tensor> {
            let tensors: Vec<&Tensor> = batches.iter().map(f).collect();
            Ok(Tensor::cat(&tensors, 0)?)
        };
        Ok(Self {
            channels: field(|b| &b.channels)?,
            bs_label: field(|b| &b.bs_label)?,
            beam_label: field(|b| &b.beam_label)?,
            beam_power: field(|b| &b.beam_power)?,
            ue_loc: field(|b| &b.ue_loc)?,
            bs_loc: field(|b| &b.bs_loc)?,
        })
    }
}

/// Model input and task targets of one batch
#[derive(Debug, Clone)]
pub struct BatchTargets {
    /// (b, 2, his_len, BS, beam) historical window
    pub channel_history: Tensor,
    /// (b) BS label one step after the history, `u32`
    pub bs_label: Tensor,
    /// (b) beam label one step after the history, `u32`
    pub beam_label: Tensor,
    /// (b, BS, beam) beam power one step after the history
    pub beam_power: Tensor,
    /// (b, 2) UE position relative to the BS centroid
    pub position: Tensor,
}

impl BatchTargets {
    /// Extract the historical window and the targets
    ///
    /// Labels and beam power are taken at index `his_len`; the position at
    /// `position_index`.
    pub fn from_raw(raw: &RawBatch, his_len: usize, position_index: usize) -> Result<Self> {
        let seq_len = raw.bs_label.dim(1)?;
        if his_len >= seq_len || position_index >= seq_len {
            return Err(Error::invalid_input(format!(
                "Target index out of range: his_len {}, position {}, sequence {}",
                his_len, position_index, seq_len
            )));
        }

        let channel_history = raw.channels.narrow(2, 0, his_len)?.contiguous()?;
        let bs_label = raw.bs_label.i((.., his_len))?.to_dtype(DType::U32)?.contiguous()?;
        let beam_label = raw.beam_label.i((.., his_len))?.to_dtype(DType::U32)?.contiguous()?;
        let beam_power = raw.beam_power.i((.., his_len))?.contiguous()?;

        let centroid = raw.bs_loc.mean(2)?;
        let relative = raw.ue_loc.sub(&centroid)?;
        let position = relative.i((.., position_index))?.contiguous()?;

        Ok(Self {
            channel_history,
            bs_label,
            beam_label,
            beam_power,
            position,
        })
    }

    /// Number of samples
    pub fn batch_size(&self) -> usize {
        self.channel_history.dims().first().copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn raw(n: usize, seq_len: usize, system: &SystemParams) -> Result<RawBatch> {
        let device = Device::Cpu;
        let (bs, beam) = (system.bs_num, system.beam_num);
        let steps: Vec<f32> = (0..n * seq_len).map(|i| (i % seq_len) as f32).collect();
        let labels = Tensor::from_vec(steps, (n, seq_len), &device)?;

        // UE at (t, 2t); BS at (0, 0), (2, 0), ... so the centroid is (bs - 1, 0)
        let ue: Vec<f32> = (0..n * seq_len)
            .flat_map(|i| {
                let t = (i % seq_len) as f32;
                [t, 2.0 * t]
            })
            .collect();
        let bs_loc: Vec<f32> = (0..n * seq_len)
            .flat_map(|_| (0..bs).flat_map(|k| [2.0 * k as f32, 0.0]))
            .collect();

        Ok(RawBatch {
            channels: Tensor::randn(0f32, 1., (n, 2, seq_len, bs, beam), &device)?,
            bs_label: labels.clone(),
            beam_label: labels,
            beam_power: Tensor::ones((n, seq_len, bs, beam), DType::F32, &device)?,
            ue_loc: Tensor::from_vec(ue, (n, seq_len, 2), &device)?,
            bs_loc: Tensor::from_vec(bs_loc, (n, seq_len, bs, 2), &device)?,
        })
    }

    fn small_system() -> SystemParams {
        SystemParams {
            bs_num: 3,
            beam_num: 4,
            his_len: 4,
            pre_len: 1,
            cnn_feature_num: 4,
            lstm_feature_num: 8,
        }
    }

    #[test]
    fn test_targets_are_one_step_ahead() -> Result<()> {
        let system = small_system();
        let batch = raw(2, system.seq_len(), &system)?;
        batch.validate(&system)?;

        let targets = BatchTargets::from_raw(&batch, system.his_len, system.his_len)?;
        assert_eq!(targets.channel_history.dims(), &[2, 2, 4, 3, 4]);
        assert_eq!(targets.bs_label.dtype(), DType::U32);
        assert_eq!(targets.bs_label.to_vec1::<u32>()?, vec![4, 4]);
        assert_eq!(targets.beam_label.to_vec1::<u32>()?, vec![4, 4]);
        assert_eq!(targets.beam_power.dims(), &[2, 3, 4]);
        assert_eq!(targets.batch_size(), 2);

        // (4, 8) - centroid (2, 0)
        assert_eq!(targets.position.to_vec2::<f32>()?, vec![vec![2.0, 8.0]; 2]);
        Ok(())
    }

    #[test]
    fn test_position_from_last_observed_step() -> Result<()> {
        let system = small_system();
        let batch = raw(1, system.seq_len(), &system)?;
        let targets = BatchTargets::from_raw(&batch, system.his_len, system.his_len - 1)?;
        assert_eq!(targets.position.to_vec2::<f32>()?, vec![vec![1.0, 6.0]]);
        Ok(())
    }

    #[test]
    fn test_target_index_out_of_range() -> Result<()> {
        let system = small_system();
        let batch = raw(1, system.seq_len(), &system)?;
        assert!(BatchTargets::from_raw(&batch, 5, 4).is_err());
        Ok(())
    }

    #[test]
    fn test_validate_rejects_wrong_bs_count() -> Result<()> {
        let system = small_system();
        let batch = raw(2, system.seq_len(), &system)?;
        let other = SystemParams {
            bs_num: 4,
            ..system
        };
        assert!(matches!(batch.validate(&other), Err(Error::Shape { .. })));

        let short = SystemParams {
            his_len: 9,
            ..system
        };
        assert!(matches!(batch.validate(&short), Err(Error::Data(_))));
        Ok(())
    }

    #[test]
    fn test_cat_and_select() -> Result<()> {
        let system = small_system();
        let a = raw(2, system.seq_len(), &system)?;
        let b = raw(3, system.seq_len(), &system)?;
        let joined = RawBatch::cat(&[a, b])?;
        assert_eq!(joined.len(), 5);

        let picked = joined.index_select(&Tensor::new(&[4u32, 0], &Device::Cpu)?)?;
        assert_eq!(picked.len(), 2);
        picked.validate(&system)?;
        Ok(())
    }
}
