use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedBooking, SharedSpotState, WalCommand};

/// Writer-side view of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalStatus {
    pub appends_since_compact: u64,
    /// False after a failed flush, until the next successful compaction.
    pub healthy: bool,
}

impl Engine {
    /// Rewrite the WAL as the minimal record set that rebuilds current state.
    /// Blocks new units until the swap is done; in-flight units finish first.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut events = Vec::new();

        let mut spots: Vec<(Ulid, SharedSpotState)> = self
            .spots
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        spots.sort_by_key(|(id, _)| *id);
        for (_, handle) in spots {
            let st = handle.read().await;
            events.push(Event::SpotRegistered {
                spot: st.spot.clone(),
            });
        }

        for entry in self.rules.iter() {
            for rule in entry.value() {
                events.push(Event::RulePut { rule: rule.clone() });
            }
        }

        for entry in self.subscriptions.iter() {
            events.push(Event::SubscriptionGranted {
                subscription: entry.value().clone(),
            });
        }

        let mut bookings: Vec<(Ulid, SharedBooking)> = self
            .bookings
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        bookings.sort_by_key(|(id, _)| *id);
        for (_, handle) in bookings {
            let booking = handle.lock().await;
            events.push(Event::BookingRestored {
                booking: booking.clone(),
            });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!("compacted WAL to {count} records");
        Ok(count)
    }

    pub async fn wal_status(&self) -> WalStatus {
        let (tx, rx) = oneshot::channel();
        let unknown = WalStatus {
            appends_since_compact: 0,
            healthy: false,
        };
        if self.wal_tx.send(WalCommand::Status { response: tx }).await.is_err() {
            return unknown;
        }
        rx.await.unwrap_or(unknown)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal_status().await.appends_since_compact
    }
}
