//! Backend probing chain
//!
//! Candidate backends are tried in the caller's order; the first one that
//! reports itself available wins. Backends differ in capability (dual-fan,
//! readback, max command) and the core widens behavior on those tags
//! rather than special-casing any particular backend.

use std::sync::Arc;

use tracing::{info, warn};

use crate::hw::FanController;

/// Probe `candidates` in order, returning the first available backend.
pub async fn probe_controllers(
    candidates: Vec<Arc<dyn FanController>>,
) -> Option<Arc<dyn FanController>> {
    for candidate in candidates {
        let name = candidate.backend_name().to_string();
        if candidate.is_available().await {
            info!(
                backend = %name,
                capabilities = ?candidate.capabilities(),
                "fan controller backend selected"
            );
            return Some(candidate);
        }
        warn!(backend = %name, "backend not available, trying next");
    }

    warn!("no fan controller backend available");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::SimulatedFan;

    #[tokio::test]
    async fn first_available_backend_wins() {
        let dead = SimulatedFan::builder().name("dead").available(false).build();
        let live = SimulatedFan::builder().name("live").build();
        let never = SimulatedFan::builder().name("never").build();

        let chosen = probe_controllers(vec![
            Arc::new(dead) as Arc<dyn FanController>,
            Arc::new(live),
            Arc::new(never),
        ])
        .await
        .expect("a backend should be available");

        assert_eq!(chosen.backend_name(), "live");
    }

    #[tokio::test]
    async fn empty_or_dead_chain_yields_none() {
        assert!(probe_controllers(vec![]).await.is_none());

        let dead = SimulatedFan::builder().name("dead").available(false).build();
        let chain: Vec<Arc<dyn FanController>> = vec![Arc::new(dead)];
        assert!(probe_controllers(chain).await.is_none());
    }
}
