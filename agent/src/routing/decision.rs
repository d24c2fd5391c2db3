use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Opaque token identifier, unique within a forward pass
pub type TokenId = u64;

/// Expert index within one MoE layer
pub type ExpertId = u32;

/// A token entering an MoE layer: its id and the hidden state produced by the
/// previous layer. The hidden state is shared, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub id: TokenId,
    pub hidden_state: Arc<[f32]>,
}

impl Token {
    pub fn new(id: TokenId, hidden_state: impl Into<Arc<[f32]>>) -> Self {
        Self {
            id,
            hidden_state: hidden_state.into(),
        }
    }

    pub fn width(&self) -> usize {
        self.hidden_state.len()
    }
}

/// One selected expert and its normalized gate weight
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpertSelection {
    pub expert_id: ExpertId,
    pub gate_weight: f32,
}

/// Routing plan for a single token.
///
/// Invariants (established by the router):
/// - `selections.len() == top_k`
/// - weights sorted descending, equal weights ordered by ascending expert id
/// - weights sum to 1.0 within floating-point epsilon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub token_id: TokenId,
    pub selections: Vec<ExpertSelection>,
}

impl RoutingDecision {
    pub fn top_k(&self) -> usize {
        self.selections.len()
    }

    /// Gate weight assigned to `expert_id`, if it was selected
    pub fn weight_for(&self, expert_id: ExpertId) -> Option<f32> {
        self.selections
            .iter()
            .find(|s| s.expert_id == expert_id)
            .map(|s| s.gate_weight)
    }

    pub fn expert_ids(&self) -> impl Iterator<Item = ExpertId> + '_ {
        self.selections.iter().map(|s| s.expert_id)
    }

    pub fn total_weight(&self) -> f32 {
        self.selections.iter().map(|s| s.gate_weight).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision() -> RoutingDecision {
        RoutingDecision {
            token_id: 9,
            selections: vec![
                ExpertSelection {
                    expert_id: 4,
                    gate_weight: 0.7,
                },
                ExpertSelection {
                    expert_id: 1,
                    gate_weight: 0.3,
                },
            ],
        }
    }

    #[test]
    fn test_weight_lookup() {
        let d = decision();
        assert_eq!(d.top_k(), 2);
        assert_eq!(d.weight_for(4), Some(0.7));
        assert_eq!(d.weight_for(2), None);
        assert_eq!(d.expert_ids().collect::<Vec<_>>(), vec![4, 1]);
        assert!((d.total_weight() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_token_shares_hidden_state() {
        let token = Token::new(1, vec![0.5f32, 1.5]);
        let copy = token.clone();
        assert!(Arc::ptr_eq(&token.hidden_state, &copy.hidden_state));
        assert_eq!(token.width(), 2);
    }
}
