//! Per-timestep convolutional feature extractor
//!
//! Each timestep's (2, BS, beam) measurement is folded into `2 * BS` channels
//! over the beam axis and passed through three `Conv1d` + ReLU stages. The
//! beam axis is then averaged away, leaving one `lstm_feature_num` vector per
//! timestep.

use candle_core::Tensor;
use candle_nn::{conv1d, Conv1d, Conv1dConfig, Module, VarBuilder};

use crate::config::SystemParams;
use crate::error::{Error, Result};

const KERNEL_SIZE: usize = 3;

/// Shared convolutional encoder
#[derive(Debug, Clone)]
pub struct Encoder {
    hidden: Vec<Conv1d>,
    shared: Conv1d,
    bs_num: usize,
    beam_num: usize,
    out_features: usize,
}

impl Encoder {
    pub fn new(system: &SystemParams, vb: VarBuilder) -> Result<Self> {
        let config = Conv1dConfig {
            padding: KERNEL_SIZE / 2,
            ..Default::default()
        };
        let hidden = vec![
            conv1d(2 * system.bs_num, system.cnn_feature_num, KERNEL_SIZE, config, vb.pp("conv0"))?,
            conv1d(system.cnn_feature_num, system.cnn_feature_num, KERNEL_SIZE, config, vb.pp("conv1"))?,
        ];
        let shared = conv1d(
            system.cnn_feature_num,
            system.lstm_feature_num,
            KERNEL_SIZE,
            config,
            vb.pp("conv2"),
        )?;

        Ok(Self {
            hidden,
            shared,
            bs_num: system.bs_num,
            beam_num: system.beam_num,
            out_features: system.lstm_feature_num,
        })
    }

    /// (b, 2, T, BS, beam) -> (b, T, lstm_feature_num)
    pub fn forward(&self, history: &Tensor) -> Result<Tensor> {
        let (batch, iq, steps, bs_num, beam_num) = history.dims5()?;
        if iq != 2 || bs_num != self.bs_num || beam_num != self.beam_num {
            return Err(Error::shape(
                ("b", 2, "T", self.bs_num, self.beam_num),
                history.dims(),
            ));
        }

        let mut xs = history
            .permute((0, 2, 1, 3, 4))?
            .reshape((batch * steps, 2 * bs_num, beam_num))?;
        for conv in &self.hidden {
            xs = conv.forward(&xs)?.relu()?;
        }
        xs = self.shared.forward(&xs)?.relu()?;

        Ok(xs.mean(2)?.reshape((batch, steps, self.out_features))?)
    }

    /// Weight of the last convolution, (lstm_feature_num, cnn_feature_num, 3)
    pub fn shared_weight(&self) -> &Tensor {
        self.shared.weight()
    }

    /// Width of the per-timestep feature vector
    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::tiny_system;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_encoder_shapes() -> Result<()> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let system = tiny_system();
        let encoder = Encoder::new(&system, vb)?;

        let history = Tensor::ones((2, 2, 3, 2, 4), DType::F32, &Device::Cpu)?;
        let features = encoder.forward(&history)?;
        assert_eq!(features.dims(), &[2, 3, 6]);
        assert_eq!(encoder.shared_weight().dims(), &[6, 4, 3]);

        let names: Vec<String> = var_map.data().lock().unwrap().keys().cloned().collect();
        assert!(names.iter().any(|n| n == "conv2.weight"));
        Ok(())
    }

    #[test]
    fn test_encoder_rejects_wrong_bs_axis() -> Result<()> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let encoder = Encoder::new(&tiny_system(), vb)?;

        let history = Tensor::ones((2, 2, 3, 3, 4), DType::F32, &Device::Cpu)?;
        assert!(matches!(encoder.forward(&history), Err(Error::Shape { .. })));
        Ok(())
    }
}
