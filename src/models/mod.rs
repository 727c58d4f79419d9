//! Multi-task networks for BS selection, beam tracking and UE positioning
//!
//! Every variant shares a per-timestep convolutional [`Encoder`] whose last
//! convolution is the designated shared layer, followed by LSTM branches for
//! the three tasks. The variants differ only in how those branches feed each
//! other:
//!
//! - **Vanilla**: one shared LSTM, three independent heads
//! - **Bs2bt2Up**: BS branch -> beam branch -> positioning branch
//! - **Up2bt2Bs**: positioning branch -> beam branch -> BS branch
//! - **Dual_Cascaded**: BS and positioning branches both feed the beam branch
//!
//! Parameters are created through a `VarBuilder`, so the caller's `VarMap`
//! owns them for optimization, listing and saving.

pub mod architectures;
pub mod encoder;

pub use architectures::{Bs2bt2Up, DualCascaded, Up2bt2Bs, Vanilla};
pub use encoder::Encoder;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

use crate::config::{ModelVariant, SystemParams};
use crate::error::Result;

/// Train or eval behaviour of stochastic layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Train,
    Eval,
}

impl Mode {
    /// Whether dropout is active
    pub fn is_train(&self) -> bool {
        matches!(self, Mode::Train)
    }
}

/// Raw outputs of the three task heads
#[derive(Debug, Clone)]
pub struct TaskOutputs {
    /// (b, BS) BS-selection logits
    pub bs_logits: Tensor,
    /// (b, beam) beam logits
    pub beam_logits: Tensor,
    /// (b, 2) relative UE position
    pub position: Tensor,
}

/// Interface the training loop drives
pub trait MultiTaskModel {
    /// Variant name
    fn name(&self) -> &str;

    /// Forward a (b, 2, his_len, BS, beam) history window
    fn forward(&self, history: &Tensor) -> Result<TaskOutputs>;

    /// Switch between training and evaluation behaviour
    fn set_mode(&mut self, mode: Mode);

    /// Current mode
    fn mode(&self) -> Mode;

    /// Weight of the designated shared layer
    fn shared_layer_weight(&self) -> &Tensor;
}

/// Build the requested variant, registering its parameters in `vb`
pub fn create_model(
    variant: ModelVariant,
    system: &SystemParams,
    dropout: f64,
    vb: VarBuilder,
) -> Result<Box<dyn MultiTaskModel>> {
    let model: Box<dyn MultiTaskModel> = match variant {
        ModelVariant::Vanilla => Box::new(Vanilla::new(system, vb)?),
        ModelVariant::Bs2bt2Up => Box::new(Bs2bt2Up::new(system, dropout, vb)?),
        ModelVariant::Up2bt2Bs => Box::new(Up2bt2Bs::new(system, dropout, vb)?),
        ModelVariant::DualCascaded => Box::new(DualCascaded::new(system, dropout, vb)?),
    };
    Ok(model)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use test_case::test_case;

    pub(crate) fn tiny_system() -> SystemParams {
        SystemParams {
            bs_num: 2,
            beam_num: 4,
            his_len: 3,
            pre_len: 1,
            cnn_feature_num: 4,
            lstm_feature_num: 6,
        }
    }

    fn build(variant: ModelVariant) -> Result<(VarMap, Box<dyn MultiTaskModel>)> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let model = create_model(variant, &tiny_system(), 0.5, vb)?;
        Ok((var_map, model))
    }

    fn history(batch: usize) -> Result<Tensor> {
        let s = tiny_system();
        Ok(Tensor::randn(
            0f32,
            1.,
            (batch, 2, s.his_len, s.bs_num, s.beam_num),
            &Device::Cpu,
        )?)
    }

    #[test_case(ModelVariant::Vanilla)]
    #[test_case(ModelVariant::Bs2bt2Up)]
    #[test_case(ModelVariant::Up2bt2Bs)]
    #[test_case(ModelVariant::DualCascaded)]
    fn test_output_shapes(variant: ModelVariant) {
        let (var_map, model) = build(variant).unwrap();
        let outputs = model.forward(&history(5).unwrap()).unwrap();

        assert_eq!(outputs.bs_logits.dims(), &[5, 2]);
        assert_eq!(outputs.beam_logits.dims(), &[5, 4]);
        assert_eq!(outputs.position.dims(), &[5, 2]);
        assert_eq!(model.shared_layer_weight().dims(), &[6, 4, 3]);
        assert!(!var_map.all_vars().is_empty());
    }

    #[test_case(ModelVariant::Vanilla)]
    #[test_case(ModelVariant::Bs2bt2Up)]
    #[test_case(ModelVariant::Up2bt2Bs)]
    #[test_case(ModelVariant::DualCascaded)]
    fn test_eval_mode_is_deterministic(variant: ModelVariant) {
        let (_var_map, mut model) = build(variant).unwrap();
        assert_eq!(model.mode(), Mode::Train);
        model.set_mode(Mode::Eval);
        assert_eq!(model.mode(), Mode::Eval);

        let input = history(3).unwrap();
        let first = model.forward(&input).unwrap();
        let second = model.forward(&input).unwrap();

        for (a, b) in [
            (&first.bs_logits, &second.bs_logits),
            (&first.beam_logits, &second.beam_logits),
            (&first.position, &second.position),
        ] {
            assert_eq!(a.to_vec2::<f32>().unwrap(), b.to_vec2::<f32>().unwrap());
        }
    }

    #[test]
    fn test_shared_layer_receives_gradient_from_every_head() {
        let (_var_map, model) = build(ModelVariant::DualCascaded).unwrap();
        let outputs = model.forward(&history(2).unwrap()).unwrap();
        let shared = model.shared_layer_weight();

        for head in [&outputs.bs_logits, &outputs.beam_logits, &outputs.position] {
            let grads = head.sum_all().unwrap().backward().unwrap();
            assert!(grads.get(shared).is_some());
        }
    }

    #[test]
    fn test_variant_names() {
        for (variant, name) in [
            (ModelVariant::Vanilla, "Vanilla"),
            (ModelVariant::Bs2bt2Up, "Bs2bt2Up"),
            (ModelVariant::Up2bt2Bs, "Up2bt2Bs"),
            (ModelVariant::DualCascaded, "Dual_Cascaded"),
        ] {
            assert_eq!(build(variant).unwrap().1.name(), name);
        }
    }
}
