//! Periodic snapshot broadcast.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pistats_common::encode;

use crate::collector::{GuardedCollector, TelemetryCollector};
use crate::registry::{BroadcastReport, SubscriberRegistry};

/// Broadcast one snapshot per `period` until `cancel` fires.
pub async fn run<C: TelemetryCollector>(
    registry: Arc<SubscriberRegistry>,
    collector: GuardedCollector<C>,
    period: Duration,
    cancel: CancellationToken,
) {
    info!("Broadcasting every {}ms", period.as_millis());

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        tick(&registry, &collector).await;
    }

    debug!("Broadcast loop stopped");
}

/// Run a single broadcast tick.
///
/// Nothing is collected while nobody is subscribed. Returns `None` when the
/// tick was skipped.
pub async fn tick<C: TelemetryCollector>(
    registry: &SubscriberRegistry,
    collector: &GuardedCollector<C>,
) -> Option<BroadcastReport> {
    let clients = registry.len();
    if clients == 0 {
        return None;
    }

    let snapshot = collector.collect(clients).await;

    let frame = match encode(&snapshot) {
        Ok(json) => Utf8Bytes::from(json),
        Err(e) => {
            warn!("Failed to serialize snapshot, skipping tick: {}", e);
            return None;
        }
    };

    let report = registry.broadcast(&frame);
    if report.removed > 0 || report.lagged > 0 {
        debug!(
            delivered = report.delivered,
            lagged = report.lagged,
            removed = report.removed,
            "Broadcast tick"
        );
    }

    Some(report)
}
