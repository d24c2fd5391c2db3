//! Compute collaborator seams
//!
//! The routing engine never does expert math itself. Workers call an
//! [`ExpertComputeKernel`] and the router calls a [`GateProjection`]; both are
//! black boxes from the engine's point of view. The concrete types here are
//! deterministic stand-ins used by tests, the benchmark and demo workers.

use crate::errors::{MoeError, Result};
use crate::routing::ExpertId;
use crate::tensor::TensorBuffer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Expert feed-forward computation executed on a worker node.
///
/// `run` is synchronous from the engine's point of view; workers call it on
/// the blocking thread pool.
pub trait ExpertComputeKernel: Send + Sync {
    /// Run `expert_id` over every row of `hidden` and return one output row
    /// per input row.
    fn run(&self, expert_id: ExpertId, hidden: &TensorBuffer) -> Result<TensorBuffer>;

    /// Relative cost of running `rows` tokens through `expert_id`.
    /// Used only for load balancing.
    fn cost_estimate(&self, _expert_id: ExpertId, rows: usize) -> f64 {
        rows as f64
    }
}

/// Gating projection producing one logit per expert.
pub trait GateProjection: Send + Sync {
    /// Width of the hidden states this gate accepts
    fn hidden_size(&self) -> usize;

    /// Number of logits produced
    fn expert_count(&self) -> usize;

    /// Project a single hidden state to expert logits.
    fn project(&self, hidden: &[f32]) -> Result<Vec<f32>>;
}

/// Dense linear gate: `logits = W · h (+ b)` with `W` of shape
/// `[expert_count, hidden_size]`.
#[derive(Debug, Clone)]
pub struct LinearGate {
    weights: TensorBuffer,
    bias: Option<Vec<f32>>,
}

impl LinearGate {
    pub fn new(weights: TensorBuffer, bias: Option<Vec<f32>>) -> Result<Self> {
        if let Some(ref b) = bias {
            if b.len() != weights.rows() {
                return Err(MoeError::InvalidDimension {
                    expected: weights.rows(),
                    actual: b.len(),
                });
            }
        }
        Ok(Self { weights, bias })
    }

    /// Gate with reproducible pseudo-random weights in `[-1, 1)`.
    pub fn seeded(hidden_size: usize, expert_count: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..hidden_size * expert_count)
            .map(|_| rng.gen_range(-1.0f32..1.0))
            .collect();
        Self {
            weights: TensorBuffer::new(data, expert_count, hidden_size)
                .unwrap_or_else(|_| TensorBuffer::zeros(expert_count, hidden_size)),
            bias: None,
        }
    }
}

impl GateProjection for LinearGate {
    fn hidden_size(&self) -> usize {
        self.weights.width()
    }

    fn expert_count(&self) -> usize {
        self.weights.rows()
    }

    fn project(&self, hidden: &[f32]) -> Result<Vec<f32>> {
        if hidden.len() != self.hidden_size() {
            return Err(MoeError::InvalidDimension {
                expected: self.hidden_size(),
                actual: hidden.len(),
            });
        }

        let logits = self
            .weights
            .iter_rows()
            .enumerate()
            .map(|(expert, row)| {
                let dot: f32 = row.iter().zip(hidden).map(|(w, h)| w * h).sum();
                dot + self.bias.as_ref().map_or(0.0, |b| b[expert])
            })
            .collect();
        Ok(logits)
    }
}

/// Synthetic expert: expert `e` maps `x` to `(e + 1) * x`.
///
/// Cheap and exactly predictable, so aggregated outputs can be checked
/// against a closed form in tests.
#[derive(Debug, Clone)]
pub struct AffineExpertKernel {
    hidden_size: usize,
}

impl AffineExpertKernel {
    pub fn new(hidden_size: usize) -> Self {
        Self { hidden_size }
    }

    /// Scale applied by `expert_id`
    pub fn scale(expert_id: ExpertId) -> f32 {
        expert_id as f32 + 1.0
    }
}

impl ExpertComputeKernel for AffineExpertKernel {
    fn run(&self, expert_id: ExpertId, hidden: &TensorBuffer) -> Result<TensorBuffer> {
        if hidden.width() != self.hidden_size {
            return Err(MoeError::InvalidDimension {
                expected: self.hidden_size,
                actual: hidden.width(),
            });
        }
        let scale = Self::scale(expert_id);
        let data = hidden.as_slice().iter().map(|v| v * scale).collect();
        TensorBuffer::new(data, hidden.rows(), hidden.width())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_gate_projection() {
        let weights = TensorBuffer::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], 3, 2).unwrap();
        let gate = LinearGate::new(weights, Some(vec![0.0, 0.5, -1.0])).unwrap();
        assert_eq!(gate.hidden_size(), 2);
        assert_eq!(gate.expert_count(), 3);

        let logits = gate.project(&[2.0, 3.0]).unwrap();
        assert_eq!(logits, vec![2.0, 3.5, 4.0]);
    }

    #[test]
    fn test_linear_gate_rejects_width_mismatch() {
        let gate = LinearGate::seeded(4, 8, 7);
        assert!(matches!(
            gate.project(&[1.0; 3]),
            Err(MoeError::InvalidDimension {
                expected: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_seeded_gate_is_reproducible() {
        let a = LinearGate::seeded(16, 8, 42);
        let b = LinearGate::seeded(16, 8, 42);
        let h = vec![0.25; 16];
        assert_eq!(a.project(&h).unwrap(), b.project(&h).unwrap());
    }

    #[test]
    fn test_affine_kernel() {
        let kernel = AffineExpertKernel::new(2);
        let input = TensorBuffer::from_rows(&[vec![1.0, 2.0], vec![-1.0, 0.5]], 2).unwrap();
        let out = kernel.run(3, &input).unwrap();
        assert_eq!(out.row(0), &[4.0, 8.0]);
        assert_eq!(out.row(1), &[-4.0, 2.0]);
        assert_eq!(kernel.cost_estimate(3, 2), 2.0);
    }
}
