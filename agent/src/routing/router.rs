use crate::errors::{MoeError, Result};
use crate::kernel::GateProjection;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::trace;

use super::decision::{ExpertId, ExpertSelection, RoutingDecision, Token};

/// Top-k softmax router for one MoE layer.
///
/// Deterministic: identical gate weights and input always produce the same
/// decision, including the order of equal-weight experts.
#[derive(Clone)]
pub struct Router {
    gate: Arc<dyn GateProjection>,
    hidden_size: usize,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("hidden_size", &self.hidden_size)
            .field("expert_count", &self.gate.expert_count())
            .finish()
    }
}

impl Router {
    /// Create a router for models of width `hidden_size`.
    ///
    /// # Errors
    /// `InvalidDimension` if the gate was built for another width.
    pub fn new(gate: Arc<dyn GateProjection>, hidden_size: usize) -> Result<Self> {
        if gate.hidden_size() != hidden_size {
            return Err(MoeError::InvalidDimension {
                expected: hidden_size,
                actual: gate.hidden_size(),
            });
        }
        Ok(Self { gate, hidden_size })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn expert_count(&self) -> usize {
        self.gate.expert_count()
    }

    /// Select the `top_k` experts for one hidden state.
    ///
    /// Gate logits are softmax-normalized over all experts, the `top_k`
    /// largest are kept (ties: lowest expert id first) and their weights are
    /// rescaled to sum to 1.0.
    pub fn select_experts(
        &self,
        hidden_state: &[f32],
        top_k: usize,
        expert_count: usize,
    ) -> Result<Vec<ExpertSelection>> {
        if hidden_state.len() != self.hidden_size {
            return Err(MoeError::InvalidDimension {
                expected: self.hidden_size,
                actual: hidden_state.len(),
            });
        }
        if expert_count != self.gate.expert_count() {
            return Err(MoeError::InvalidDimension {
                expected: self.gate.expert_count(),
                actual: expert_count,
            });
        }
        if top_k == 0 || top_k > expert_count {
            return Err(MoeError::Config(format!(
                "top_k must be in 1..={}, got {}",
                expert_count, top_k
            )));
        }

        let logits = self.gate.project(hidden_state)?;
        if logits.len() != expert_count {
            return Err(MoeError::InvalidDimension {
                expected: expert_count,
                actual: logits.len(),
            });
        }
        if logits.iter().any(|l| !l.is_finite()) {
            return Err(MoeError::Kernel("gate produced non-finite logits".into()));
        }

        let probs = softmax(&logits);

        let mut order: Vec<usize> = (0..expert_count).collect();
        order.sort_by(|&a, &b| match probs[b].total_cmp(&probs[a]) {
            Ordering::Equal => a.cmp(&b),
            other => other,
        });
        order.truncate(top_k);

        let kept: f32 = order.iter().map(|&i| probs[i]).sum();
        let selections = order
            .into_iter()
            .map(|i| ExpertSelection {
                expert_id: i as ExpertId,
                gate_weight: if kept > 0.0 {
                    probs[i] / kept
                } else {
                    1.0 / top_k as f32
                },
            })
            .collect();

        Ok(selections)
    }

    /// Route a single token to its `top_k` experts.
    ///
    /// See [`select_experts`](Self::select_experts) for the selection rule.
    pub fn route(
        &self,
        token: &Token,
        top_k: usize,
        expert_count: usize,
    ) -> Result<RoutingDecision> {
        let selections = self.select_experts(&token.hidden_state, top_k, expert_count)?;
        trace!(token_id = token.id, ?selections, "Routed token");
        Ok(RoutingDecision {
            token_id: token.id,
            selections,
        })
    }

    /// Route every token of a batch. Fails on the first invalid token.
    pub fn route_batch(
        &self,
        tokens: &[Token],
        top_k: usize,
        expert_count: usize,
    ) -> Result<Vec<RoutingDecision>> {
        tokens
            .iter()
            .map(|t| self.route(t, top_k, expert_count))
            .collect()
    }
}

/// Numerically stable softmax
fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
