mod allocate;
mod catalog;
mod claims;
mod compaction;
mod complete;
mod conflict;
mod error;
mod extend;
mod queries;
#[cfg(test)]
mod tests;

pub use claims::generate_ticket;
pub use compaction::WalStatus;
pub use conflict::{check_accommodates, check_no_conflict, now_ms};
pub use error::EngineError;

use std::collections::HashMap;
use std::future::IntoFuture;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{
    mpsc, oneshot, Mutex, MutexGuard, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard,
    RwLock, RwLockReadGuard,
};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::lifecycle::BookingStatus;
use crate::model::*;
use crate::pricing::PricingRule;
use crate::wal::{Replay, Wal};

use self::claims::{EntryClaim, SpentEntry, TicketClaim};

pub type SharedSpotState = Arc<RwLock<SpotState>>;
pub type SharedBooking = Arc<Mutex<Booking>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Status {
        response: oneshot::Sender<WalStatus>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
///
/// After a failed flush the file may end in a partial frame, so every later
/// append is refused until a compaction rewrites the log from memory.
async fn wal_writer_loop(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
    let mut broken: Option<String> = None;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        // Anything else waits until this batch is durable.
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, batch, &mut broken);
                if let Some(cmd) = deferred {
                    handle_non_append(&mut wal, cmd, &mut broken);
                }
            }
            other => handle_non_append(&mut wal, other, &mut broken),
        }
    }
}

fn commit_batch(wal: &mut Wal<Event>, batch: Vec<Pending>, broken: &mut Option<String>) {
    if let Some(reason) = broken.as_deref() {
        for (_, tx) in batch {
            let _ = tx.send(Err(io::Error::other(format!(
                "log closed after failed flush ({reason}); awaiting compaction"
            ))));
        }
        return;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        error!("WAL flush failed for {} records: {e}", batch.len());
        *broken = Some(e.to_string());
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal<Event>, batch: &[Pending]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal<Event>, cmd: WalCommand, broken: &mut Option<String>) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::<Event>::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            if result.is_ok() && broken.take().is_some() {
                info!("WAL rewritten by compaction, accepting appends again");
            }
            let _ = response.send(result);
        }
        WalCommand::Status { response } => {
            let _ = response.send(WalStatus {
                appends_since_compact: wal.appends_since_compact(),
                healthy: broken.is_none(),
            });
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)], broken),
    }
}

/// A record handed to the writer. It will be written whatever happens to the
/// caller; `durable` reports whether the flush succeeded.
struct Queued(oneshot::Receiver<io::Result<()>>);

impl Queued {
    async fn durable(self) -> Result<(), EngineError> {
        self.0
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }
}

// ── Event application ────────────────────────────────────

/// Apply an event to the spot it touches (caller holds the spot lock).
fn apply_to_spot(st: &mut SpotState, event: &Event) {
    match event {
        Event::BookingOpened { booking } | Event::BookingRestored { booking } => {
            if booking.status.holds_spot() {
                st.insert_claim(booking.claim());
                st.spot.occupant = Some(booking.id);
                st.spot.status = if booking.status == BookingStatus::Active {
                    SpotStatus::Occupied
                } else {
                    SpotStatus::Reserved
                };
            }
        }
        Event::BookingCheckedIn { id, .. } => {
            if let Some(claim) = st.claim_mut(*id) {
                claim.status = BookingStatus::Active;
            }
            st.spot.status = SpotStatus::Occupied;
        }
        Event::BookingExtended { extension, .. } => {
            if let Some(claim) = st.claim_mut(extension.booking_id) {
                claim.end = Some(extension.new_exit);
            }
        }
        Event::BookingClosed { id, .. } => {
            st.remove_claim(*id);
            if st.spot.occupant == Some(*id) {
                st.spot.occupant = None;
                st.spot.status = SpotStatus::Available;
            }
        }
        Event::SpotRetired { .. } => st.spot.active = false,
        Event::SpotReactivated { .. } => st.spot.active = true,
        Event::SpotMaintenanceStarted { .. } => st.spot.status = SpotStatus::Maintenance,
        Event::SpotMaintenanceEnded { .. } => st.spot.status = SpotStatus::Available,
        _ => {}
    }
}

/// Apply a transition event to its booking (caller holds the booking lock).
fn apply_to_booking(booking: &mut Booking, event: &Event) {
    match event {
        Event::BookingCheckedIn { .. } => booking.status = BookingStatus::Active,
        Event::BookingExtended { extension, .. } => {
            booking.expected_exit = Some(extension.new_exit);
            booking.estimated_price = Some(
                booking.estimated_price.unwrap_or_default() + extension.additional_price,
            );
            booking.extensions.push(extension.clone());
        }
        Event::BookingClosed {
            status,
            actual_exit,
            final_price,
            consumed_subscription,
            ..
        } => {
            booking.status = *status;
            booking.actual_exit = *actual_exit;
            booking.final_price = *final_price;
            if consumed_subscription.is_some() {
                booking.subscription_id = *consumed_subscription;
            }
        }
        _ => {}
    }
}

fn apply_to_catalog(
    rules: &DashMap<Ulid, Vec<PricingRule>>,
    subscriptions: &DashMap<Ulid, UserSubscription>,
    event: &Event,
) {
    match event {
        Event::RulePut { rule } => {
            let mut facility_rules = rules.entry(rule.facility_id).or_default();
            match facility_rules.iter_mut().find(|r| r.id == rule.id) {
                Some(existing) => *existing = rule.clone(),
                None => facility_rules.push(rule.clone()),
            }
        }
        Event::RuleRemoved { id, facility_id } => {
            if let Some(mut facility_rules) = rules.get_mut(facility_id) {
                facility_rules.retain(|r| r.id != *id);
            }
        }
        Event::SubscriptionGranted { subscription } => {
            subscriptions.insert(subscription.id, subscription.clone());
        }
        Event::SubscriptionRevoked { id } => {
            if let Some(mut sub) = subscriptions.get_mut(id) {
                sub.active = false;
            }
        }
        _ => {}
    }
}

/// Catalog entry as it was before a change, for undoing a failed write.
enum CatalogUndo {
    Rules(Ulid, Option<Vec<PricingRule>>),
    Subscription(Ulid, Option<UserSubscription>),
    Nothing,
}

/// Replay-side entry consumption. The live path spends entries through
/// `claims::EntryClaim` before the record is written.
fn spend_entry(subscriptions: &DashMap<Ulid, UserSubscription>, id: Ulid) {
    if let Some(mut sub) = subscriptions.get_mut(&id)
        && let Some(n) = sub.entries_remaining.as_mut()
    {
        *n = n.saturating_sub(1);
    }
}

pub struct Engine {
    pub(super) spots: DashMap<Ulid, SharedSpotState>,
    pub(super) bookings: DashMap<Ulid, SharedBooking>,
    /// Ticket → booking. Tickets are never reused.
    pub(super) tickets: DashMap<String, Ulid>,
    /// Spot → every booking ever made on it.
    pub(super) spot_bookings: DashMap<Ulid, Vec<Ulid>>,
    /// Facility → pricing rules.
    pub(super) rules: DashMap<Ulid, Vec<PricingRule>>,
    pub(super) subscriptions: DashMap<Ulid, UserSubscription>,
    /// Mutations hold it shared for their whole unit; compaction takes it
    /// exclusively so its snapshot and the log swap see no half-applied unit.
    pub(super) commit_gate: RwLock<()>,
    /// Serializes catalog feed changes (spot registration, rules, passes).
    /// Never taken by allocation or completion.
    pub(super) catalog_lock: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) config: EngineConfig,
}

impl Engine {
    pub fn new(wal_path: PathBuf, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let Replay {
            records,
            discarded_tail,
        } = Wal::<Event>::replay(&wal_path).map_err(|e| EngineError::WalError(e.to_string()))?;
        if discarded_tail {
            warn!("discarded torn tail of {}", wal_path.display());
        }
        let wal = Wal::<Event>::open(&wal_path).map_err(|e| EngineError::WalError(e.to_string()))?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            spots: DashMap::new(),
            bookings: DashMap::new(),
            tickets: DashMap::new(),
            spot_bookings: DashMap::new(),
            rules: DashMap::new(),
            subscriptions: DashMap::new(),
            commit_gate: RwLock::new(()),
            catalog_lock: Mutex::new(()),
            wal_tx,
            config,
        };

        // Rebuild into plain maps first; nothing else can see them yet.
        let mut spots: HashMap<Ulid, SpotState> = HashMap::new();
        let mut bookings: HashMap<Ulid, Booking> = HashMap::new();
        for event in &records {
            match event {
                Event::SpotRegistered { spot } => {
                    spots.insert(spot.id, SpotState::new(spot.clone()));
                }
                Event::SpotRetired { id }
                | Event::SpotReactivated { id }
                | Event::SpotMaintenanceStarted { id }
                | Event::SpotMaintenanceEnded { id } => {
                    if let Some(st) = spots.get_mut(id) {
                        apply_to_spot(st, event);
                    }
                }
                Event::BookingOpened { booking } | Event::BookingRestored { booking } => {
                    if let (Event::BookingOpened { .. }, Some(sub)) = (event, booking.subscription_id) {
                        spend_entry(&engine.subscriptions, sub);
                    }
                    if let Some(st) = spots.get_mut(&booking.spot_id) {
                        apply_to_spot(st, event);
                    }
                    bookings.insert(booking.id, booking.clone());
                }
                Event::BookingCheckedIn { id, spot_id }
                | Event::BookingClosed { id, spot_id, .. }
                | Event::BookingExtended {
                    spot_id,
                    extension: BookingExtension { booking_id: id, .. },
                } => {
                    if let Event::BookingClosed {
                        consumed_subscription: Some(sub),
                        ..
                    } = event
                    {
                        spend_entry(&engine.subscriptions, *sub);
                    }
                    if let Some(st) = spots.get_mut(spot_id) {
                        apply_to_spot(st, event);
                    }
                    if let Some(booking) = bookings.get_mut(id) {
                        apply_to_booking(booking, event);
                    }
                }
                Event::RulePut { .. }
                | Event::RuleRemoved { .. }
                | Event::SubscriptionGranted { .. }
                | Event::SubscriptionRevoked { .. } => {
                    apply_to_catalog(&engine.rules, &engine.subscriptions, event);
                }
            }
        }

        for (id, st) in spots {
            engine.spots.insert(id, Arc::new(RwLock::new(st)));
        }
        for (id, booking) in bookings {
            engine.tickets.insert(booking.ticket.clone(), id);
            engine.spot_bookings.entry(booking.spot_id).or_default().push(id);
            engine.bookings.insert(id, Arc::new(Mutex::new(booking)));
        }
        for mut ids in engine.spot_bookings.iter_mut() {
            ids.sort();
        }

        info!(
            "replayed {} records: {} spots, {} bookings",
            records.len(),
            engine.spots.len(),
            engine.bookings.len()
        );
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Hand `event` to the group-commit writer.
    ///
    /// The send happens in the same poll that returns `Queued`, and callers
    /// apply the event before their next await. A caller dropped at any await
    /// therefore leaves either nothing or both the record and its effect.
    async fn wal_enqueue(&self, event: &Event) -> Result<Queued, EngineError> {
        let permit = self
            .wal_tx
            .reserve()
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let (tx, rx) = oneshot::channel();
        permit.send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        });
        Ok(Queued(rx))
    }

    // ── Bounded locking ──────────────────────────────────

    /// Await `fut` for at most the configured lock timeout.
    async fn bounded<F: IntoFuture>(&self, id: Ulid, fut: F) -> Result<F::Output, EngineError> {
        tokio::time::timeout(self.config.lock_timeout, fut)
            .await
            .map_err(|_| {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                warn!("lock wait on {id} exceeded {:?}", self.config.lock_timeout);
                EngineError::LockTimeout(id)
            })
    }

    /// Enter a mutating unit of work. `id` names the entity for timeout errors.
    pub(super) async fn begin_unit(&self, id: Ulid) -> Result<RwLockReadGuard<'_, ()>, EngineError> {
        self.bounded(id, self.commit_gate.read()).await
    }

    /// Take the catalog lock. Call after `begin_unit`.
    pub(super) async fn lock_catalog(&self, id: Ulid) -> Result<MutexGuard<'_, ()>, EngineError> {
        self.bounded(id, self.catalog_lock.lock()).await
    }

    pub(super) fn spot_handle(&self, id: &Ulid) -> Option<SharedSpotState> {
        self.spots.get(id).map(|e| e.value().clone())
    }

    pub(super) fn booking_handle(&self, id: &Ulid) -> Option<SharedBooking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub(super) async fn lock_spot(
        &self,
        spot_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SpotState>, EngineError> {
        let st = self.spot_handle(&spot_id).ok_or(EngineError::NotFound(spot_id))?;
        self.bounded(spot_id, st.write_owned()).await
    }

    pub(super) async fn read_spot(
        &self,
        spot_id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<SpotState>, EngineError> {
        let st = self.spot_handle(&spot_id).ok_or(EngineError::NotFound(spot_id))?;
        self.bounded(spot_id, st.read_owned()).await
    }

    pub(super) async fn lock_booking(
        &self,
        booking_id: Ulid,
    ) -> Result<OwnedMutexGuard<Booking>, EngineError> {
        let booking = self
            .booking_handle(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        self.bounded(booking_id, booking.lock_owned()).await
    }

    // ── Persist + apply ──────────────────────────────────
    //
    // Every unit: enqueue the record, apply it in memory, commit its claims,
    // then wait for the flush. A failed flush puts memory back as it was.

    /// Open a new booking. Caller holds the spot lock; the ticket and any pass
    /// entry are already claimed.
    async fn persist_opened(
        &self,
        st: &mut SpotState,
        booking: &Booking,
        ticket: TicketClaim<'_>,
        entry: Option<EntryClaim<'_>>,
    ) -> Result<(), EngineError> {
        let event = Event::BookingOpened {
            booking: booking.clone(),
        };
        let spot_before = st.clone();
        let queued = self.wal_enqueue(&event).await?;
        apply_to_spot(st, &event);
        self.spot_bookings.entry(booking.spot_id).or_default().push(booking.id);
        self.bookings
            .insert(booking.id, Arc::new(Mutex::new(booking.clone())));
        ticket.commit();
        let spent = entry.map(EntryClaim::commit);

        if let Err(e) = queued.durable().await {
            *st = spot_before;
            self.bookings.remove(&booking.id);
            if let Some(mut ids) = self.spot_bookings.get_mut(&booking.spot_id) {
                ids.retain(|id| *id != booking.id);
            }
            self.tickets.remove(&booking.ticket);
            self.refund(spent);
            return Err(e);
        }
        Ok(())
    }

    /// Apply a transition of an existing booking to it and its spot. Caller
    /// holds both locks.
    async fn persist_transition(
        &self,
        booking: &mut Booking,
        st: &mut SpotState,
        event: &Event,
        entry: Option<EntryClaim<'_>>,
    ) -> Result<(), EngineError> {
        let (booking_before, spot_before) = (booking.clone(), st.clone());
        let queued = self.wal_enqueue(event).await?;
        apply_to_spot(st, event);
        apply_to_booking(booking, event);
        let spent = entry.map(EntryClaim::commit);

        if let Err(e) = queued.durable().await {
            *booking = booking_before;
            *st = spot_before;
            self.refund(spent);
            return Err(e);
        }
        Ok(())
    }

    /// Spot-level catalog change. Caller holds the spot lock.
    async fn persist_spot(&self, st: &mut SpotState, event: &Event) -> Result<(), EngineError> {
        let before = st.clone();
        let queued = self.wal_enqueue(event).await?;
        apply_to_spot(st, event);
        if let Err(e) = queued.durable().await {
            *st = before;
            return Err(e);
        }
        Ok(())
    }

    /// Add a spot to the table. Caller holds the catalog lock.
    async fn persist_registered(&self, spot: &Spot) -> Result<(), EngineError> {
        let queued = self
            .wal_enqueue(&Event::SpotRegistered { spot: spot.clone() })
            .await?;
        self.spots
            .insert(spot.id, Arc::new(RwLock::new(SpotState::new(spot.clone()))));
        if let Err(e) = queued.durable().await {
            self.spots.remove(&spot.id);
            return Err(e);
        }
        Ok(())
    }

    /// Rule or subscription change. Caller holds the catalog lock.
    async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        let undo = match event {
            Event::RulePut { rule } => CatalogUndo::Rules(
                rule.facility_id,
                self.rules.get(&rule.facility_id).map(|r| r.value().clone()),
            ),
            Event::RuleRemoved { facility_id, .. } => CatalogUndo::Rules(
                *facility_id,
                self.rules.get(facility_id).map(|r| r.value().clone()),
            ),
            Event::SubscriptionGranted { subscription } => {
                CatalogUndo::Subscription(subscription.id, self.get_subscription(&subscription.id))
            }
            Event::SubscriptionRevoked { id } => CatalogUndo::Subscription(*id, self.get_subscription(id)),
            _ => CatalogUndo::Nothing,
        };
        let queued = self.wal_enqueue(event).await?;
        apply_to_catalog(&self.rules, &self.subscriptions, event);

        if let Err(e) = queued.durable().await {
            match undo {
                CatalogUndo::Rules(facility_id, Some(rules)) => {
                    self.rules.insert(facility_id, rules);
                }
                CatalogUndo::Rules(facility_id, None) => {
                    self.rules.remove(&facility_id);
                }
                CatalogUndo::Subscription(id, Some(sub)) => {
                    self.subscriptions.insert(id, sub);
                }
                CatalogUndo::Subscription(id, None) => {
                    self.subscriptions.remove(&id);
                }
                CatalogUndo::Nothing => {}
            }
            return Err(e);
        }
        Ok(())
    }

    fn refund(&self, spent: Option<SpentEntry>) {
        if let Some(spent) = spent {
            spent.refund(&self.subscriptions);
        }
    }
}
