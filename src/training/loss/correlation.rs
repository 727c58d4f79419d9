//! Gradient-level task correlation on the shared feature layer
//!
//! Each weighted task loss is back-propagated on its own and the gradient it
//! leaves on the designated shared layer is captured. The two auxiliary
//! classification gradients are summed and compared against the positioning
//! gradient with one of two scalar measures:
//!
//! - **ratio**: `lr * sum((g_bs + g_bt) / (g_up + sign(g_up) * eps))`, with a
//!   zero sign mapped to `+1` so exact zeros never divide.
//! - **cossim**: view every gradient as rows of its last dimension (one row per
//!   filter), pick the row where the positioning gradient has the largest norm
//!   and take the cosine similarity of `g_bs + g_bt` and `g_up` on that row.
//!
//! candle hands every `backward()` call a fresh [`GradStore`], so the captured
//! gradients never leak into the store the optimizer later steps with.
//!
//! [`GradStore`]: candle_core::backprop::GradStore

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::training::config::{CorrelationMeasure, GradientAnalysisConfig};
use crate::training::task::{Task, NUM_TASKS};

/// A task's gradient on the shared layer, copied off the device
#[derive(Debug, Clone, PartialEq)]
pub struct GradientSnapshot {
    dims: Vec<usize>,
    values: Vec<f32>,
}

impl GradientSnapshot {
    /// Copy a gradient tensor to host memory
    pub fn from_tensor(grad: &Tensor) -> Result<Self> {
        let dims = grad.dims().to_vec();
        let values = grad.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        Ok(Self { dims, values })
    }

    /// Build from raw values
    pub fn new(dims: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        let expected: usize = dims.iter().product();
        if expected != values.len() {
            return Err(Error::shape(dims, values.len()));
        }
        Ok(Self { dims, values })
    }

    /// Shape of the full gradient
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Flattened values
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Euclidean norm
    pub fn norm(&self) -> f64 {
        l2_norm(&self.values)
    }

    /// Length of one filter row (the last dimension)
    fn row_len(&self) -> usize {
        self.dims.last().copied().unwrap_or(1).max(1)
    }
}

/// Result of analyzing one batch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrelationReport {
    /// Scalar correlation measure for this batch
    pub measure: f64,
    /// Norm of each task's shared-layer gradient, in task order
    pub grad_norms: [f64; NUM_TASKS],
}

/// Measures how the auxiliary tasks' gradients line up with positioning's
#[derive(Debug, Clone)]
pub struct GradientCorrelationAnalyzer {
    measure: CorrelationMeasure,
    eps: f64,
    learning_rate: f64,
}

impl GradientCorrelationAnalyzer {
    /// Create an analyzer; `learning_rate` scales the ratio measure
    pub fn new(config: &GradientAnalysisConfig, learning_rate: f64) -> Self {
        Self {
            measure: config.measure,
            eps: config.eps,
            learning_rate,
        }
    }

    /// Back-propagate each weighted loss on its own and capture the shared-layer gradient
    pub fn capture(
        &self,
        weighted_losses: &[Tensor; NUM_TASKS],
        shared_weight: &Tensor,
    ) -> Result<[GradientSnapshot; NUM_TASKS]> {
        let mut snapshots = Vec::with_capacity(NUM_TASKS);
        for (task, loss) in Task::ALL.iter().zip(weighted_losses) {
            let grads = loss.backward()?;
            let snapshot = match grads.get(shared_weight) {
                Some(grad) => GradientSnapshot::from_tensor(grad)?,
                None => {
                    debug!("{} loss leaves no gradient on the shared layer", task);
                    GradientSnapshot::from_tensor(&shared_weight.zeros_like()?)?
                }
            };
            snapshots.push(snapshot);
            // `grads` drops here; nothing survives into the next pass
        }

        snapshots
            .try_into()
            .map_err(|_| Error::internal("expected one gradient snapshot per task"))
    }

    /// Capture per-task gradients and reduce them to a [`CorrelationReport`]
    pub fn analyze(
        &self,
        weighted_losses: &[Tensor; NUM_TASKS],
        shared_weight: &Tensor,
    ) -> Result<CorrelationReport> {
        let grads = self.capture(weighted_losses, shared_weight)?;
        let grad_norms = [grads[0].norm(), grads[1].norm(), grads[2].norm()];
        let measure = self.measure(&grads)?;

        if !measure.is_finite() {
            warn!("Task correlation measure is not finite: {}", measure);
        }

        Ok(CorrelationReport {
            measure,
            grad_norms,
        })
    }

    /// Scalar measure over already captured gradients
    pub fn measure(&self, grads: &[GradientSnapshot; NUM_TASKS]) -> Result<f64> {
        let [g_bs, g_bt, g_up] = grads;
        if g_bs.dims() != g_up.dims() || g_bt.dims() != g_up.dims() {
            return Err(Error::shape(g_up.dims(), g_bs.dims()));
        }

        match self.measure {
            CorrelationMeasure::Ratio => Ok(ratio_measure(
                g_bs.values(),
                g_bt.values(),
                g_up.values(),
                self.eps,
                self.learning_rate,
            )),
            CorrelationMeasure::CosineSimilarity => Ok(cosine_measure(
                g_bs.values(),
                g_bt.values(),
                g_up.values(),
                g_up.row_len(),
                self.eps,
            )),
        }
    }
}

/// `lr * sum((g0 + g1) / (g2 + s * eps))`, `s = sign(g2)` with `sign(0) = +1`
pub fn ratio_measure(g0: &[f32], g1: &[f32], g2: &[f32], eps: f64, learning_rate: f64) -> f64 {
    let sum: f64 = g0
        .iter()
        .zip(g1)
        .zip(g2)
        .map(|((&a, &b), &c)| {
            let c = c as f64;
            let sign = if c < 0.0 { -1.0 } else { 1.0 };
            (a as f64 + b as f64) / (c + sign * eps)
        })
        .sum();
    learning_rate * sum
}

/// Cosine similarity of `g0 + g1` and `g2` on the row where `g2` is largest
///
/// Both norms are floored at `eps`, so an all-zero row yields `0.0`.
pub fn cosine_measure(g0: &[f32], g1: &[f32], g2: &[f32], row_len: usize, eps: f64) -> f64 {
    let Some(top) = top_row(g2, row_len) else {
        return 0.0;
    };
    let range = top * row_len..(top + 1) * row_len;

    let combined: Vec<f64> = g0[range.clone()]
        .iter()
        .zip(&g1[range.clone()])
        .map(|(&a, &b)| a as f64 + b as f64)
        .collect();
    let target: Vec<f64> = g2[range].iter().map(|&c| c as f64).collect();

    let dot: f64 = combined.iter().zip(&target).map(|(a, b)| a * b).sum();
    let norm_combined = combined.iter().map(|v| v * v).sum::<f64>().sqrt();
    let norm_target = target.iter().map(|v| v * v).sum::<f64>().sqrt();

    dot / (norm_combined.max(eps) * norm_target.max(eps))
}

/// Index of the row with the largest norm; first one wins ties
fn top_row(values: &[f32], row_len: usize) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, row) in values.chunks_exact(row_len).enumerate() {
        let norm = l2_norm(row);
        match best {
            Some((_, best_norm)) if best_norm >= norm => {}
            _ => best = Some((i, norm)),
        }
    }
    best.map(|(i, _)| i)
}

fn l2_norm(values: &[f32]) -> f64 {
    values
        .iter()
        .map(|&v| (v as f64) * (v as f64))
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{Device, Var};

    fn analyzer(measure: CorrelationMeasure) -> GradientCorrelationAnalyzer {
        GradientCorrelationAnalyzer::new(
            &GradientAnalysisConfig {
                enabled: true,
                measure,
                eps: 1e-6,
            },
            1e-3,
        )
    }

    #[test]
    fn test_ratio_with_exact_zero_denominator() {
        let g0 = [1.0f32, 0.5, -2.0];
        let g1 = [1.0f32, 0.5, 0.0];
        let g2 = [0.0f32, -1.0, 2.0];

        let value = ratio_measure(&g0, &g1, &g2, 1e-6, 1.0);
        assert!(value.is_finite());

        let expected = 2.0 / 1e-6 + 1.0 / (-1.0 - 1e-6) + (-2.0) / (2.0 + 1e-6);
        assert_relative_eq!(value, expected, max_relative = 1e-12);
    }

    #[test]
    fn test_ratio_scales_with_learning_rate() {
        let g = [1.0f32, 2.0];
        let h = [2.0f32, 4.0];
        let base = ratio_measure(&g, &g, &h, 1e-6, 1.0);
        assert_relative_eq!(ratio_measure(&g, &g, &h, 1e-6, 1e-3), base * 1e-3, max_relative = 1e-12);
        assert_relative_eq!(base, 2.0, max_relative = 1e-5);
    }

    #[test]
    fn test_cosine_picks_largest_positioning_row() {
        // rows of 3: positioning gradient is largest on row 1
        let g0 = [1.0f32, 0.0, 0.0, 0.0, 1.0, 0.0];
        let g1 = [0.0f32, 0.0, 0.0, 0.0, 0.0, 0.0];
        let g2 = [1.0f32, 0.0, 0.0, 0.0, 5.0, 0.0];

        let value = cosine_measure(&g0, &g1, &g2, 3, 1e-6);
        assert_relative_eq!(value, 1.0, epsilon = 1e-12);

        // opposite direction on the selected row
        let g0 = [1.0f32, 0.0, 0.0, 0.0, -1.0, 0.0];
        let value = cosine_measure(&g0, &g1, &g2, 3, 1e-6);
        assert_relative_eq!(value, -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_cosine_zero_gradients_are_guarded() {
        let zeros = [0.0f32; 6];
        let value = cosine_measure(&zeros, &zeros, &zeros, 3, 1e-6);
        assert_eq!(value, 0.0);
    }

    #[test]
    fn test_snapshot_shape_checked() {
        assert!(GradientSnapshot::new(vec![2, 3], vec![0.0; 5]).is_err());
        let snapshot = GradientSnapshot::new(vec![2, 3], vec![3.0, 4.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        assert_relative_eq!(snapshot.norm(), 5.0);
        assert_eq!(snapshot.row_len(), 3);
    }

    #[test]
    fn test_capture_isolates_each_task() -> Result<()> {
        let device = Device::Cpu;
        let weight = Var::from_tensor(&Tensor::ones((2, 1, 3), DType::F32, &device)?)?;

        let a0 = Tensor::new(&[[[1f32, 2., 3.]], [[0., 0., 1.]]], &device)?;
        let a1 = Tensor::new(&[[[0f32, 1., 0.]], [[1., 0., 0.]]], &device)?;
        let a2 = Tensor::new(&[[[2f32, 0., 0.]], [[0., 4., 0.]]], &device)?;

        let losses = [
            (weight.as_tensor() * &a0)?.sum_all()?,
            (weight.as_tensor() * &a1)?.sum_all()?,
            ((weight.as_tensor() * &a2)?.sum_all()? * 0.5)?,
        ];

        let grads = analyzer(CorrelationMeasure::CosineSimilarity).capture(&losses, weight.as_tensor())?;
        assert_eq!(grads[0].values(), &[1., 2., 3., 0., 0., 1.]);
        assert_eq!(grads[1].values(), &[0., 1., 0., 1., 0., 0.]);
        assert_eq!(grads[2].values(), &[1., 0., 0., 0., 2., 0.]);
        assert_eq!(grads[2].dims(), &[2, 1, 3]);
        Ok(())
    }

    #[test]
    fn test_analyze_reports_norms_and_measure() -> Result<()> {
        let device = Device::Cpu;
        let weight = Var::from_tensor(&Tensor::ones((1, 1, 3), DType::F32, &device)?)?;
        let a = Tensor::new(&[[[3f32, 4., 0.]]], &device)?;

        let losses = [
            (weight.as_tensor() * &a)?.sum_all()?,
            (weight.as_tensor() * &a)?.sum_all()?,
            (weight.as_tensor() * &a)?.sum_all()?,
        ];

        let report = analyzer(CorrelationMeasure::CosineSimilarity).analyze(&losses, weight.as_tensor())?;
        assert_relative_eq!(report.grad_norms[0], 5.0, epsilon = 1e-6);
        assert_relative_eq!(report.grad_norms[2], 5.0, epsilon = 1e-6);
        assert_relative_eq!(report.measure, 1.0, epsilon = 1e-6);

        let report = analyzer(CorrelationMeasure::Ratio).analyze(&losses, weight.as_tensor())?;
        // element 2 is an exact zero: 0 / (0 + eps) contributes nothing
        assert_relative_eq!(report.measure, 1e-3 * 4.0, max_relative = 1e-5);
        Ok(())
    }

    #[test]
    fn test_unrelated_loss_gives_zero_gradient() -> Result<()> {
        let device = Device::Cpu;
        let weight = Var::from_tensor(&Tensor::ones((1, 1, 3), DType::F32, &device)?)?;
        let other = Var::from_tensor(&Tensor::ones((3,), DType::F32, &device)?)?;

        let losses = [
            weight.as_tensor().sum_all()?,
            other.as_tensor().sum_all()?,
            weight.as_tensor().sum_all()?,
        ];
        let grads = analyzer(CorrelationMeasure::Ratio).capture(&losses, weight.as_tensor())?;
        assert_eq!(grads[1].values(), &[0., 0., 0.]);
        Ok(())
    }
}
