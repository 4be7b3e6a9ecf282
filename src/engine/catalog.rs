use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::pricing::{PricingRule, RuleRepository, SubscriptionRepository};

use super::{Engine, EngineError};

impl Engine {
    pub async fn register_spot(
        &self,
        id: Ulid,
        facility_id: Ulid,
        zone_id: Ulid,
        label: impl Into<String>,
        size: SpotSize,
        features: SpotFeatures,
    ) -> Result<Spot, EngineError> {
        let label = label.into();
        if label.len() > MAX_LABEL_LEN {
            return Err(EngineError::LimitExceeded("spot label too long"));
        }
        let _unit = self.begin_unit(id).await?;
        let _catalog = self.lock_catalog(id).await?;
        if self.spots.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.spots.len() >= MAX_SPOTS {
            return Err(EngineError::LimitExceeded("too many spots"));
        }

        let spot = Spot::new(id, facility_id, zone_id, label, size, features);
        self.persist_registered(&spot).await?;
        info!("registered spot {} ({id}) in facility {facility_id}", spot.label);
        Ok(spot)
    }

    /// Take a spot out of service. Only a free spot can be retired; its
    /// booking history stays queryable.
    pub async fn retire_spot(&self, id: Ulid) -> Result<(), EngineError> {
        let _unit = self.begin_unit(id).await?;
        let mut st = self.lock_spot(id).await?;
        super::conflict::check_bookable(&st.spot)?;
        self.persist_spot(&mut st, &Event::SpotRetired { id }).await?;
        info!("retired spot {} ({id})", st.spot.label);
        Ok(())
    }

    /// Put a retired spot back in service.
    pub async fn reactivate_spot(&self, id: Ulid) -> Result<(), EngineError> {
        let _unit = self.begin_unit(id).await?;
        let mut st = self.lock_spot(id).await?;
        if st.spot.active {
            return Err(EngineError::InvalidState {
                spot_id: id,
                status: st.spot.status,
            });
        }
        self.persist_spot(&mut st, &Event::SpotReactivated { id })
            .await?;
        info!("reactivated spot {} ({id})", st.spot.label);
        Ok(())
    }

    /// Block a free spot for upkeep. It takes no bookings until
    /// `end_maintenance`.
    pub async fn start_maintenance(&self, id: Ulid) -> Result<(), EngineError> {
        let _unit = self.begin_unit(id).await?;
        let mut st = self.lock_spot(id).await?;
        super::conflict::check_bookable(&st.spot)?;
        self.persist_spot(&mut st, &Event::SpotMaintenanceStarted { id })
            .await?;
        info!("spot {} ({id}) under maintenance", st.spot.label);
        Ok(())
    }

    pub async fn end_maintenance(&self, id: Ulid) -> Result<(), EngineError> {
        let _unit = self.begin_unit(id).await?;
        let mut st = self.lock_spot(id).await?;
        if st.spot.status != SpotStatus::Maintenance {
            return Err(EngineError::InvalidState {
                spot_id: id,
                status: st.spot.status,
            });
        }
        self.persist_spot(&mut st, &Event::SpotMaintenanceEnded { id })
            .await?;
        info!("spot {} ({id}) back from maintenance", st.spot.label);
        Ok(())
    }

    /// Insert or replace a pricing rule.
    pub async fn put_rule(&self, rule: PricingRule) -> Result<(), EngineError> {
        rule.validate()?;
        let _unit = self.begin_unit(rule.id).await?;
        let _catalog = self.lock_catalog(rule.id).await?;
        let replacing = self
            .rules
            .get(&rule.facility_id)
            .is_some_and(|rules| rules.iter().any(|r| r.id == rule.id));
        if !replacing
            && self
                .rules
                .get(&rule.facility_id)
                .is_some_and(|rules| rules.len() >= MAX_RULES_PER_FACILITY)
        {
            return Err(EngineError::LimitExceeded("too many rules for facility"));
        }
        info!(
            "{} rule {} ({}) for facility {}",
            if replacing { "replacing" } else { "adding" },
            rule.name,
            rule.id,
            rule.facility_id
        );
        self.persist_catalog(&Event::RulePut { rule }).await
    }

    pub async fn remove_rule(&self, id: Ulid) -> Result<(), EngineError> {
        let _unit = self.begin_unit(id).await?;
        let _catalog = self.lock_catalog(id).await?;
        let facility_id = self
            .rules
            .iter()
            .find(|entry| entry.value().iter().any(|r| r.id == id))
            .map(|entry| *entry.key())
            .ok_or(EngineError::NotFound(id))?;
        self.persist_catalog(&Event::RuleRemoved { id, facility_id })
            .await
    }

    pub async fn grant_subscription(&self, subscription: UserSubscription) -> Result<(), EngineError> {
        if let Some(exp) = subscription.expires_at
            && exp < subscription.activated_at
        {
            return Err(EngineError::InvalidConfig("subscription expires before activation".into()));
        }
        let _unit = self.begin_unit(subscription.id).await?;
        let _catalog = self.lock_catalog(subscription.id).await?;
        if self.subscriptions.contains_key(&subscription.id) {
            return Err(EngineError::AlreadyExists(subscription.id));
        }
        info!(
            "granted subscription {} to user {} at facility {}",
            subscription.id, subscription.user_id, subscription.facility_id
        );
        self.persist_catalog(&Event::SubscriptionGranted { subscription })
            .await
    }

    /// Deactivate a pass. Bookings already paid by it keep their price.
    pub async fn revoke_subscription(&self, id: Ulid) -> Result<(), EngineError> {
        let _unit = self.begin_unit(id).await?;
        let _catalog = self.lock_catalog(id).await?;
        if !self.subscriptions.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_catalog(&Event::SubscriptionRevoked { id }).await
    }

    pub fn get_subscription(&self, id: &Ulid) -> Option<UserSubscription> {
        self.subscriptions.get(id).map(|s| s.value().clone())
    }
}

impl RuleRepository for Engine {
    fn rules_for_facility(&self, facility_id: Ulid) -> Vec<PricingRule> {
        self.rules
            .get(&facility_id)
            .map(|rules| rules.value().clone())
            .unwrap_or_default()
    }
}

impl SubscriptionRepository for Engine {
    fn subscriptions_for(&self, user_id: Ulid, facility_id: Ulid) -> Vec<UserSubscription> {
        self.subscriptions
            .iter()
            .filter(|s| s.user_id == user_id && s.facility_id == facility_id)
            .map(|s| s.value().clone())
            .collect()
    }
}
