//! Adam optimizer over a candle `VarMap`
//!
//! Wraps `candle_nn::AdamW`. With the default zero weight decay the decoupled
//! decay term vanishes and the update is plain Adam.

use candle_core::backprop::GradStore;
use candle_nn::{AdamW, Optimizer as _, ParamsAdamW, VarMap};

use super::Optimizer;
use crate::error::Result;
use crate::training::config::OptimizerConfig;

/// Adam optimizer
pub struct AdamOptimizer {
    inner: AdamW,
    parameter_count: usize,
    step_count: usize,
}

impl AdamOptimizer {
    /// Create an optimizer over all variables of `var_map`
    pub fn new(var_map: &VarMap, config: &OptimizerConfig) -> Result<Self> {
        let vars = var_map.all_vars();
        let parameter_count = vars.iter().map(|v| v.elem_count()).sum();

        let params = ParamsAdamW {
            lr: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.epsilon,
            weight_decay: config.weight_decay,
        };

        Ok(Self {
            inner: AdamW::new(vars, params)?,
            parameter_count,
            step_count: 0,
        })
    }

    /// Total number of scalar parameters being optimized
    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }
}

impl Optimizer for AdamOptimizer {
    fn name(&self) -> &str {
        "adam"
    }

    fn step(&mut self, gradients: &GradStore) -> Result<()> {
        self.inner.step(gradients)?;
        self.step_count += 1;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }

    fn step_count(&self) -> usize {
        self.step_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::Init;

    #[test]
    fn test_step_moves_parameters_against_gradient() -> Result<()> {
        let var_map = VarMap::new();
        let weight = var_map.get((3,), "w", Init::Const(1.0), DType::F32, &Device::Cpu)?;

        let mut optimizer = AdamOptimizer::new(&var_map, &OptimizerConfig::default())?;
        assert_eq!(optimizer.parameter_count(), 3);

        let loss = weight.sum_all()?;
        optimizer.step(&loss.backward()?)?;

        // first Adam step moves each coordinate by ~lr
        let updated = weight.to_vec1::<f32>()?;
        for value in updated {
            assert!((value - (1.0 - 1e-3)).abs() < 1e-5);
        }
        assert_eq!(optimizer.step_count(), 1);
        Ok(())
    }

    #[test]
    fn test_learning_rate_can_be_changed() -> Result<()> {
        let var_map = VarMap::new();
        var_map.get((2, 2), "w", Init::Const(0.0), DType::F32, &Device::Cpu)?;

        let mut optimizer = AdamOptimizer::new(&var_map, &OptimizerConfig::default())?;
        assert_eq!(optimizer.learning_rate(), 1e-3);
        optimizer.set_learning_rate(5e-4);
        assert_eq!(optimizer.learning_rate(), 5e-4);
        Ok(())
    }
}
