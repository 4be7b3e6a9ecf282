use ulid::Ulid;

use crate::model::{Ms, UserSubscription};

/// Source of a user's passes for a facility.
pub trait SubscriptionRepository {
    fn subscriptions_for(&self, user_id: Ulid, facility_id: Ulid) -> Vec<UserSubscription>;
}

impl SubscriptionRepository for [UserSubscription] {
    fn subscriptions_for(&self, user_id: Ulid, facility_id: Ulid) -> Vec<UserSubscription> {
        self.iter()
            .filter(|s| s.user_id == user_id && s.facility_id == facility_id)
            .cloned()
            .collect()
    }
}

/// The most recently activated pass that is active, unexpired and not
/// exhausted at `now`. Callers price the transaction at zero when one exists.
pub fn check_subscription<R: SubscriptionRepository + ?Sized>(
    repo: &R,
    user_id: Ulid,
    facility_id: Ulid,
    now: Ms,
) -> Option<UserSubscription> {
    repo.subscriptions_for(user_id, facility_id)
        .into_iter()
        .filter(|s| s.is_valid_at(now))
        .max_by_key(|s| (s.activated_at, s.id))
}
