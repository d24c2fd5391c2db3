//! Model-forward driver
//!
//! Runs the MoE part of a forward pass layer by layer:
//!
//! ```text
//! tokens ─► Router::route_batch ─► DispatchCoordinator::dispatch ─► Aggregator::await_batch
//!   ▲                                                                       │
//!   └──────────────── combined rows become the next layer's hidden states ──┘
//! ```

use crate::cancel::CancelToken;
use crate::errors::{MoeError, Result};
use crate::routing::{RoutingDecision, Router, Token};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use super::aggregator::{Aggregator, CombinedOutput};
use super::dispatch::DispatchCoordinator;
use super::stats::MoeStats;

/// Model shape and partial-output policy for a driver
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub hidden_size: usize,
    pub expert_count: usize,
    pub top_k: usize,
    /// Return `Partial` outputs instead of failing with `DegradedOutput`
    pub accept_partial: bool,
}

/// Result of a full multi-layer pass
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    pub forward_id: Uuid,
    /// Tokens carrying the last layer's combined hidden states
    pub tokens: Vec<Token>,
    /// Layers whose output was `Partial`
    pub partial_layers: Vec<u32>,
}

impl ForwardOutput {
    pub fn is_partial(&self) -> bool {
        !self.partial_layers.is_empty()
    }
}

/// Drives route → dispatch → aggregate for every MoE layer.
pub struct ForwardDriver {
    routers: Vec<Router>,
    coordinator: Arc<DispatchCoordinator>,
    aggregator: Aggregator,
    settings: DriverSettings,
    stats: Arc<MoeStats>,
}

impl ForwardDriver {
    /// Create a driver with one router per MoE layer.
    ///
    /// # Errors
    /// `Config` if there are no routers or `top_k` is out of range;
    /// `InvalidDimension` if a router disagrees with `settings`.
    pub fn new(
        routers: Vec<Router>,
        coordinator: Arc<DispatchCoordinator>,
        settings: DriverSettings,
    ) -> Result<Self> {
        if routers.is_empty() {
            return Err(MoeError::Config("at least one MoE layer is required".into()));
        }
        if settings.top_k == 0 || settings.top_k > settings.expert_count {
            return Err(MoeError::Config(format!(
                "top_k must be in 1..={}, got {}",
                settings.expert_count, settings.top_k
            )));
        }
        for router in &routers {
            if router.hidden_size() != settings.hidden_size {
                return Err(MoeError::InvalidDimension {
                    expected: settings.hidden_size,
                    actual: router.hidden_size(),
                });
            }
            if router.expert_count() != settings.expert_count {
                return Err(MoeError::InvalidDimension {
                    expected: settings.expert_count,
                    actual: router.expert_count(),
                });
            }
        }

        let stats = coordinator.stats().clone();
        let aggregator = Aggregator::new(settings.hidden_size, stats.clone());
        Ok(Self {
            routers,
            coordinator,
            aggregator,
            settings,
            stats,
        })
    }

    pub fn layers(&self) -> usize {
        self.routers.len()
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn stats(&self) -> &Arc<MoeStats> {
        &self.stats
    }

    /// Run one MoE layer over `tokens`.
    ///
    /// # Errors
    /// Fatal errors from routing or dispatch, `Cancelled`, and
    /// `DegradedOutput` when the output is partial and `accept_partial` is off.
    #[instrument(skip_all, fields(layer = layer, tokens = tokens.len()))]
    pub async fn forward_layer(
        &mut self,
        layer: u32,
        tokens: &[Token],
        cancel: &CancelToken,
    ) -> Result<CombinedOutput> {
        let started = Instant::now();
        let outcome = self.run_layer(layer, tokens, cancel).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let combined = match outcome {
            Ok(combined) => combined,
            Err(e) => {
                self.stats.record_layer_failure();
                warn!(error = %e, "Layer failed");
                return Err(e);
            }
        };
        self.stats
            .record_layer(tokens.len(), elapsed_ms, combined.is_partial());

        if combined.is_partial() {
            warn!(
                missing = combined.missing.len(),
                degraded_tokens = combined.degraded_tokens().len(),
                "Layer output is partial"
            );
            if !self.settings.accept_partial {
                return Err(MoeError::DegradedOutput {
                    missing: combined.missing.len(),
                });
            }
        }
        Ok(combined)
    }

    async fn run_layer(
        &mut self,
        layer: u32,
        tokens: &[Token],
        cancel: &CancelToken,
    ) -> Result<CombinedOutput> {
        let router = self
            .routers
            .get(layer as usize)
            .ok_or_else(|| MoeError::Config(format!("no router for layer {layer}")))?;

        let decisions: Arc<[RoutingDecision]> = router
            .route_batch(tokens, self.settings.top_k, self.settings.expert_count)?
            .into();

        let sink = self.aggregator.sink();
        let pending = match self
            .coordinator
            .dispatch(layer, tokens, decisions, &sink, cancel)
            .await
        {
            Ok(pending) => pending,
            Err(MoeError::Cancelled) => {
                self.stats.record_cancellation();
                return Err(MoeError::Cancelled);
            }
            Err(e) => return Err(e),
        };

        self.aggregator.expect(&pending)?;
        let combined = self
            .aggregator
            .await_batch(&pending.token_ids(), cancel)
            .await;
        // Retries still running past the deadline are no longer useful
        pending.abandon();
        combined
    }

    /// Run every layer in order, feeding each layer's combined output to the
    /// next as hidden states.
    pub async fn forward(&mut self, tokens: Vec<Token>, cancel: &CancelToken) -> Result<ForwardOutput> {
        let forward_id = Uuid::new_v4();
        let span = info_span!("forward", %forward_id, layers = self.routers.len(), tokens = tokens.len());

        async move {
            let started = Instant::now();
            let mut tokens = tokens;
            let mut partial_layers = Vec::new();

            for layer in 0..self.routers.len() as u32 {
                let combined = self.forward_layer(layer, &tokens, cancel).await?;
                if combined.is_partial() {
                    partial_layers.push(layer);
                }
                tokens = combined
                    .token_ids
                    .iter()
                    .zip(combined.outputs.iter_rows())
                    .map(|(&id, row)| Token::new(id, row.to_vec()))
                    .collect();
            }

            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                partial_layers = partial_layers.len(),
                "Forward pass complete"
            );
            Ok(ForwardOutput {
                forward_id,
                tokens,
                partial_layers,
            })
        }
        .instrument(span)
        .await
    }
}

impl std::fmt::Debug for ForwardDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardDriver")
            .field("layers", &self.routers.len())
            .field("settings", &self.settings)
            .finish()
    }
}
