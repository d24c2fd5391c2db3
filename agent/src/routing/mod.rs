//! Token-to-expert routing
//!
//! The [`Router`] turns one hidden state into a [`RoutingDecision`]: the top-k
//! experts by gate weight, renormalized so the selected weights sum to 1.0.
//! Decisions are created per token per MoE layer and consumed immediately by
//! the dispatch coordinator.

mod decision;
mod router;

pub use decision::{ExpertId, ExpertSelection, RoutingDecision, Token, TokenId};
pub use router::Router;
