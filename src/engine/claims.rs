//! Scoped claims on shared indexes. A claim takes effect immediately so
//! concurrent units see it, and is rolled back on drop unless committed.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::warn;
use ulid::Ulid;

use crate::model::{Ms, UserSubscription};
use crate::pricing::check_subscription;

use super::{Engine, EngineError};

/// Fresh generation plus one retry.
const TICKET_ATTEMPTS: usize = 2;

/// `PREFIX-XXXXXXXX`: eight uppercase hex digits from the OS CSPRNG.
pub fn generate_ticket(prefix: &str) -> String {
    format!("{prefix}-{:08X}", OsRng.next_u32())
}

pub(super) struct TicketClaim<'a> {
    index: &'a DashMap<String, Ulid>,
    ticket: String,
    committed: bool,
}

impl<'a> TicketClaim<'a> {
    fn try_claim(index: &'a DashMap<String, Ulid>, ticket: String, booking_id: Ulid) -> Option<Self> {
        match index.entry(ticket.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(booking_id);
                Some(Self {
                    index,
                    ticket,
                    committed: false,
                })
            }
        }
    }

    pub(super) fn ticket(&self) -> &str {
        &self.ticket
    }

    pub(super) fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for TicketClaim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.index.remove(&self.ticket);
        }
    }
}

/// Claim a ticket from `generate`, retrying once on collision.
pub(super) fn claim_ticket<'a>(
    index: &'a DashMap<String, Ulid>,
    booking_id: Ulid,
    mut generate: impl FnMut() -> String,
) -> Result<TicketClaim<'a>, EngineError> {
    for attempt in 1..=TICKET_ATTEMPTS {
        let ticket = generate();
        match TicketClaim::try_claim(index, ticket, booking_id) {
            Some(claim) => return Ok(claim),
            None => {
                metrics::counter!(crate::observability::TICKET_COLLISIONS_TOTAL).increment(1);
                warn!("ticket collision for booking {booking_id} (attempt {attempt})");
            }
        }
    }
    Err(EngineError::TicketGenerationExhausted)
}

/// One entry of a subscription, spent up front. Unlimited passes hold a claim
/// without touching any counter.
pub(super) struct EntryClaim<'a> {
    subscriptions: &'a DashMap<Ulid, UserSubscription>,
    id: Ulid,
    decremented: bool,
    committed: bool,
}

impl<'a> EntryClaim<'a> {
    /// Spend one entry of `id` if the pass is still valid at `now`.
    fn try_claim(subscriptions: &'a DashMap<Ulid, UserSubscription>, id: Ulid, now: Ms) -> Option<Self> {
        let mut sub = subscriptions.get_mut(&id)?;
        if !sub.is_valid_at(now) {
            return None;
        }
        let decremented = match sub.entries_remaining.as_mut() {
            Some(n) => {
                *n -= 1;
                true
            }
            None => false,
        };
        Some(Self {
            subscriptions,
            id,
            decremented,
            committed: false,
        })
    }

    pub(super) fn id(&self) -> Ulid {
        self.id
    }

    /// Keep the entry spent. The returned token can still give it back if
    /// the unit's record fails to reach disk.
    pub(super) fn commit(mut self) -> SpentEntry {
        self.committed = true;
        metrics::counter!(crate::observability::SUBSCRIPTION_ENTRIES_TOTAL).increment(1);
        SpentEntry {
            id: self.id,
            decremented: self.decremented,
        }
    }
}

impl Drop for EntryClaim<'_> {
    fn drop(&mut self) {
        if !self.committed && self.decremented {
            restore_entry(self.subscriptions, self.id);
        }
    }
}

pub(super) struct SpentEntry {
    id: Ulid,
    decremented: bool,
}

impl SpentEntry {
    pub(super) fn refund(self, subscriptions: &DashMap<Ulid, UserSubscription>) {
        if self.decremented {
            restore_entry(subscriptions, self.id);
        }
    }
}

fn restore_entry(subscriptions: &DashMap<Ulid, UserSubscription>, id: Ulid) {
    if let Some(mut sub) = subscriptions.get_mut(&id)
        && let Some(n) = sub.entries_remaining.as_mut()
    {
        *n += 1;
    }
}

impl Engine {
    pub(super) fn claim_ticket(&self, booking_id: Ulid) -> Result<TicketClaim<'_>, EngineError> {
        claim_ticket(&self.tickets, booking_id, || generate_ticket(&self.config.ticket_prefix))
    }

    /// Spend an entry of the user's most recent valid pass for `facility_id`.
    /// A pass drained by a concurrent unit between lookup and claim is skipped.
    pub(super) fn claim_subscription(&self, user_id: Ulid, facility_id: Ulid, now: Ms) -> Option<EntryClaim<'_>> {
        loop {
            let candidate = check_subscription(self, user_id, facility_id, now)?;
            if let Some(claim) = EntryClaim::try_claim(&self.subscriptions, candidate.id, now) {
                return Some(claim);
            }
        }
    }
}
