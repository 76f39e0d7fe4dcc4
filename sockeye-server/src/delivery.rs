//! Best-effort fan-out of a publisher's payload.
//!
//! The push envelope is encoded once and queued to every live connection of
//! every requested identifier. A failed send (writer gone, or its queue
//! full) only affects that connection; there is no retry and no redelivery.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{Identifier, Reply};
use crate::registry::ConnectionRegistry;

/// Outcome of one `deliver` call. Informational only: the publisher is
/// acknowledged whatever it says.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Distinct identifiers requested.
    pub requested: usize,
    /// Identifiers that had at least one live connection.
    pub matched: usize,
    /// Connections the push was queued to.
    pub delivered: usize,
    /// Connections whose send failed.
    pub failed: usize,
    /// Identifiers with no registered connection.
    pub skipped: Vec<Identifier>,
}

/// Lifetime delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub deliveries: u64,
    pub pushes_sent: u64,
    pub pushes_failed: u64,
}

struct AtomicDeliveryStats {
    deliveries: AtomicU64,
    pushes_sent: AtomicU64,
    pushes_failed: AtomicU64,
}

impl AtomicDeliveryStats {
    fn new() -> Self {
        Self {
            deliveries: AtomicU64::new(0),
            pushes_sent: AtomicU64::new(0),
            pushes_failed: AtomicU64::new(0),
        }
    }
}

/// Resolves identifiers against the registry and pushes to each connection.
#[derive(Clone)]
pub struct DeliveryEngine {
    registry: ConnectionRegistry,
    stats: Arc<AtomicDeliveryStats>,
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl DeliveryEngine {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            registry,
            stats: Arc::new(AtomicDeliveryStats::new()),
        }
    }

    /// Push `payload` to every connection registered under `identifiers`.
    ///
    /// Duplicate identifiers are processed once.
    pub async fn deliver(&self, payload: &Value, identifiers: &[Identifier]) -> DeliveryReport {
        self.stats.deliveries.fetch_add(1, Ordering::Relaxed);

        let mut report = DeliveryReport::default();
        let envelope = match Reply::push(payload.clone()).encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to encode push envelope: {e}");
                return report;
            }
        };
        let message = Message::text(envelope);

        let mut seen = HashSet::with_capacity(identifiers.len());
        for identifier in identifiers {
            if !seen.insert(identifier.as_str()) {
                continue;
            }
            report.requested += 1;

            let targets = self.registry.lookup(identifier).await;
            if targets.is_empty() {
                log::debug!("No live connections for {identifier}, skipping");
                report.skipped.push(identifier.clone());
                continue;
            }
            report.matched += 1;

            for conn in targets {
                match conn.send(message.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        log::debug!("Push to {identifier} failed: {e}");
                        report.failed += 1;
                    }
                }
            }
        }

        self.stats
            .pushes_sent
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.stats
            .pushes_failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);

        log::info!(
            "Delivered to {}/{} identifiers ({} pushes, {} failed)",
            report.matched,
            report.requested,
            report.delivered,
            report.failed
        );
        report
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            pushes_sent: self.stats.pushes_sent.load(Ordering::Relaxed),
            pushes_failed: self.stats.pushes_failed.load(Ordering::Relaxed),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }
}
