//! Entitlement transition engine
//!
//! The single write path for entitlement state. Every mutation source
//! (webhook, user cancellation, admin override, expiry sweep) funnels into
//! this engine; nothing else writes plan or credit fields.
//!
//! Each transition is computed by a pure planner that maps the current
//! snapshot to a partial update. Webhook delivery is at-least-once and
//! unordered, so planners are written to be idempotent on their resulting
//! state: re-applying any transition, or applying a redundant pair (renewal
//! via subscription update and via invoice), converges to the same snapshot.
//!
//! Subscription phases per user: NEW -> ACTIVE -> CANCEL_PENDING -> EXPIRED,
//! with ACTIVE re-entrant on renewal. A downgrade changes the plan label
//! immediately but defers the credit-limit cut to the next renewal; the
//! pre-downgrade values ride along as a pending-downgrade marker until then.

use time::OffsetDateTime;
use uuid::Uuid;

use stageright_shared::{
    Entitlement, PendingDowngrade, PlanType, SubscriptionStatus, FREE_PHOTOS_LIMIT,
};

use crate::error::BillingResult;
use crate::events::{
    ActorType, EntitlementEventBuilder, EntitlementEventLogger, EntitlementEventType,
};
use crate::plans::Plan;
use crate::store::{EntitlementStore, EntitlementUpdate};

/// Lifecycle phase of a user's subscription, derived from the snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPhase {
    New,
    Active,
    CancelPending,
    Expired,
}

pub fn phase_of(ent: &Entitlement, now: OffsetDateTime) -> SubscriptionPhase {
    match ent.subscription_status {
        SubscriptionStatus::Inactive => SubscriptionPhase::New,
        SubscriptionStatus::Active => SubscriptionPhase::Active,
        SubscriptionStatus::Canceled => {
            if ent.is_lapsed(now) {
                SubscriptionPhase::Expired
            } else {
                SubscriptionPhase::CancelPending
            }
        }
    }
}

/// How an admin override changes the credit limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitChange {
    Absolute(i32),
    Delta(i32),
}

/// What a plan-change event turned out to be
#[derive(Debug, Clone, PartialEq)]
pub enum PlanChangeOutcome {
    /// Allotment grew or stayed equal; applied in full immediately
    Immediate(EntitlementUpdate),
    /// Allotment shrank; label applied now, limit cut deferred to renewal
    Deferred(EntitlementUpdate),
    /// Redundant delivery; nothing to do
    Noop,
}

// ---------------------------------------------------------------------------
// Pure planners
// ---------------------------------------------------------------------------

/// Plan the activation of a new subscription.
///
/// Returns an empty update when the same subscription is already active:
/// replaying an activation must not re-zero `photos_used`, or a duplicate
/// delivery would hand out free credits.
pub fn plan_activation(
    current: Option<&Entitlement>,
    plan: Plan,
    subscription_id: Option<&str>,
    customer_id: Option<&str>,
) -> EntitlementUpdate {
    if let Some(current) = current {
        let same_subscription = match (subscription_id, current.stripe_subscription_id.as_deref())
        {
            (Some(new), Some(known)) => new == known,
            // Without ids to compare, fall back to "already on this plan"
            _ => current.plan_type == plan.plan_type && current.photos_limit == plan.photos_limit,
        };
        if same_subscription && current.subscription_status == SubscriptionStatus::Active {
            return EntitlementUpdate::default();
        }
    }

    EntitlementUpdate {
        plan_type: Some(plan.plan_type),
        photos_limit: Some(plan.photos_limit),
        photos_used: Some(0),
        subscription_status: Some(SubscriptionStatus::Active),
        stripe_customer_id: customer_id.map(str::to_string),
        stripe_subscription_id: subscription_id.map(str::to_string),
        pending_downgrade: Some(None),
        cancellation_date: Some(None),
        subscription_end_date: Some(None),
        ..Default::default()
    }
}

/// Plan a mid-cycle plan change.
///
/// Upgrades (and equal-allotment moves) apply immediately and supersede any
/// pending downgrade. Downgrades change the label now but keep the paid-for
/// limit until renewal, recording the pre-downgrade values.
pub fn plan_change(current: &Entitlement, new_plan: Plan) -> PlanChangeOutcome {
    if new_plan.photos_limit >= current.photos_limit {
        if current.plan_type == new_plan.plan_type
            && current.photos_limit == new_plan.photos_limit
            && current.pending_downgrade.is_none()
        {
            return PlanChangeOutcome::Noop;
        }
        return PlanChangeOutcome::Immediate(EntitlementUpdate {
            plan_type: Some(new_plan.plan_type),
            photos_limit: Some(new_plan.photos_limit),
            subscription_status: Some(SubscriptionStatus::Active),
            pending_downgrade: Some(None),
            ..Default::default()
        });
    }

    // Downgrade. A redundant delivery shows up as the label already moved
    // with the marker in place.
    if current.plan_type == new_plan.plan_type && current.pending_downgrade.is_some() {
        return PlanChangeOutcome::Noop;
    }

    PlanChangeOutcome::Deferred(EntitlementUpdate {
        plan_type: Some(new_plan.plan_type),
        subscription_status: Some(SubscriptionStatus::Active),
        pending_downgrade: Some(Some(PendingDowngrade {
            previous_plan_type: current.plan_type,
            previous_photos_limit: current.photos_limit,
        })),
        ..Default::default()
    })
}

/// Plan a billing-period renewal.
///
/// Usage always resets. The limit becomes the allotment of the plan active
/// after applying any pending downgrade: the event's own price wins when
/// present, otherwise the (already downgraded) local plan label decides.
pub fn plan_renewal(current: &Entitlement, event_plan: Option<Plan>) -> EntitlementUpdate {
    let effective = event_plan.unwrap_or_else(|| {
        if current.pending_downgrade.is_some() {
            Plan::for_plan_type(current.plan_type)
        } else {
            Plan {
                plan_type: current.plan_type,
                photos_limit: current.photos_limit,
            }
        }
    });

    EntitlementUpdate {
        plan_type: Some(effective.plan_type),
        photos_limit: Some(effective.photos_limit),
        photos_used: Some(0),
        subscription_status: Some(SubscriptionStatus::Active),
        pending_downgrade: Some(None),
        cancellation_date: Some(None),
        subscription_end_date: Some(None),
        ..Default::default()
    }
}

/// Plan a cancellation.
///
/// The current plan and limit are preserved until the period end; only the
/// status and dates move. Re-cancelling keeps the original cancellation
/// date and at most refreshes the end date.
pub fn plan_cancellation(
    current: &Entitlement,
    period_end: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> EntitlementUpdate {
    if current.subscription_status == SubscriptionStatus::Canceled {
        match period_end {
            Some(end) if current.subscription_end_date != Some(end) => EntitlementUpdate {
                subscription_end_date: Some(Some(end)),
                ..Default::default()
            },
            _ => EntitlementUpdate::default(),
        }
    } else {
        EntitlementUpdate {
            subscription_status: Some(SubscriptionStatus::Canceled),
            cancellation_date: Some(Some(now)),
            subscription_end_date: Some(period_end.or(current.subscription_end_date)),
            ..Default::default()
        }
    }
}

/// Plan the lazy CANCEL_PENDING -> EXPIRED drop back to free-tier defaults.
///
/// Returns None while the paid period is still running. `photos_used` is
/// left alone; the plan reset makes the ratio moot.
pub fn plan_expiry(current: &Entitlement, now: OffsetDateTime) -> Option<EntitlementUpdate> {
    if !current.is_lapsed(now) {
        return None;
    }

    Some(EntitlementUpdate {
        plan_type: Some(PlanType::Free),
        photos_limit: Some(FREE_PHOTOS_LIMIT),
        subscription_status: Some(SubscriptionStatus::Inactive),
        pending_downgrade: Some(None),
        ..Default::default()
    })
}

/// Plan an admin override. Usage is clamped to the new limit so the
/// used-within-limit invariant holds after a manual cut.
pub fn plan_admin_adjustment(
    current: &Entitlement,
    plan_type: Option<PlanType>,
    limit_change: Option<LimitChange>,
) -> EntitlementUpdate {
    let new_limit = limit_change.map(|change| match change {
        LimitChange::Absolute(limit) => limit.max(0),
        LimitChange::Delta(delta) => (current.photos_limit + delta).max(0),
    });

    EntitlementUpdate {
        plan_type,
        photos_limit: new_limit,
        photos_used: new_limit
            .filter(|&limit| current.photos_used > limit)
            .map(|limit| limit.min(current.photos_used)),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Context attached to a transition for audit logging
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub actor: Option<ActorType>,
    pub stripe_event_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
}

impl EventContext {
    pub fn stripe(event_id: &str) -> Self {
        Self {
            actor: Some(ActorType::Stripe),
            stripe_event_id: Some(event_id.to_string()),
            ..Default::default()
        }
    }

    pub fn user() -> Self {
        Self {
            actor: Some(ActorType::User),
            ..Default::default()
        }
    }

    pub fn admin() -> Self {
        Self {
            actor: Some(ActorType::Admin),
            ..Default::default()
        }
    }

    pub fn system() -> Self {
        Self {
            actor: Some(ActorType::System),
            ..Default::default()
        }
    }

    pub fn subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(subscription_id.into());
        self
    }

    pub fn customer(mut self, customer_id: impl Into<String>) -> Self {
        self.stripe_customer_id = Some(customer_id.into());
        self
    }
}

/// The state machine, persisted through the store adapter
#[derive(Clone)]
pub struct TransitionEngine {
    store: EntitlementStore,
    events: EntitlementEventLogger,
}

impl TransitionEngine {
    pub fn new(store: EntitlementStore, events: EntitlementEventLogger) -> Self {
        Self { store, events }
    }

    pub fn store(&self) -> &EntitlementStore {
        &self.store
    }

    /// NEW/any -> ACTIVE on a new subscription
    pub async fn activate(
        &self,
        user_id: Uuid,
        plan: Plan,
        email: Option<&str>,
        subscription_id: Option<&str>,
        customer_id: Option<&str>,
        ctx: &EventContext,
    ) -> BillingResult<Entitlement> {
        let current = self.store.get(user_id).await?;

        let mut update = plan_activation(current.as_ref(), plan, subscription_id, customer_id);

        if let (Some(current), true) = (&current, update == EntitlementUpdate::default()) {
            tracing::debug!(user_id = %user_id, "Activation replay - already active on this subscription");
            return Ok(current.clone());
        }

        if let Some(email) = email {
            update.email = Some(email.to_string());
        }

        let next = self.store.upsert(user_id, update).await?;

        self.audit(
            user_id,
            EntitlementEventType::SubscriptionActivated,
            serde_json::json!({
                "plan_type": next.plan_type,
                "photos_limit": next.photos_limit,
            }),
            ctx,
        )
        .await;

        tracing::info!(
            user_id = %user_id,
            plan_type = %next.plan_type,
            photos_limit = next.photos_limit,
            "Subscription activated"
        );

        Ok(next)
    }

    /// ACTIVE -> ACTIVE on an upgrade or (deferred) downgrade
    pub async fn change_plan(
        &self,
        user_id: Uuid,
        new_plan: Plan,
        ctx: &EventContext,
    ) -> BillingResult<Entitlement> {
        let Some(current) = self.store.get(user_id).await? else {
            // The plan-change event can beat our first sight of the user;
            // treat it as an activation.
            return self
                .activate(
                    user_id,
                    new_plan,
                    None,
                    ctx.stripe_subscription_id.as_deref(),
                    ctx.stripe_customer_id.as_deref(),
                    ctx,
                )
                .await;
        };

        match plan_change(&current, new_plan) {
            PlanChangeOutcome::Noop => {
                tracing::debug!(user_id = %user_id, "Plan change replay - no state to move");
                Ok(current)
            }
            PlanChangeOutcome::Immediate(update) => {
                let from = current.plan_type;
                let next = self.store.upsert(user_id, update).await?;

                self.audit(
                    user_id,
                    EntitlementEventType::PlanChanged,
                    serde_json::json!({
                        "from_plan": from,
                        "to_plan": next.plan_type,
                        "photos_limit": next.photos_limit,
                    }),
                    ctx,
                )
                .await;

                tracing::info!(
                    user_id = %user_id,
                    from_plan = %from,
                    to_plan = %next.plan_type,
                    "Plan changed"
                );

                Ok(next)
            }
            PlanChangeOutcome::Deferred(update) => {
                let from = current.plan_type;
                let next = self.store.upsert(user_id, update).await?;

                self.audit(
                    user_id,
                    EntitlementEventType::DowngradeDeferred,
                    serde_json::json!({
                        "from_plan": from,
                        "to_plan": next.plan_type,
                        "kept_photos_limit": next.photos_limit,
                        "limit_at_renewal": Plan::for_plan_type(next.plan_type).photos_limit,
                    }),
                    ctx,
                )
                .await;

                tracing::info!(
                    user_id = %user_id,
                    from_plan = %from,
                    to_plan = %next.plan_type,
                    kept_photos_limit = next.photos_limit,
                    "Downgrade deferred to next renewal"
                );

                Ok(next)
            }
        }
    }

    /// ACTIVE -> ACTIVE on a billing-period rollover
    pub async fn renew(
        &self,
        user_id: Uuid,
        event_plan: Option<Plan>,
        ctx: &EventContext,
    ) -> BillingResult<Entitlement> {
        let Some(current) = self.store.get(user_id).await? else {
            // First contact with this user is a renewal: seed the record as
            // an activation with whatever plan the event carries.
            let plan = event_plan.unwrap_or(Plan::standard());
            return self
                .activate(
                    user_id,
                    plan,
                    None,
                    ctx.stripe_subscription_id.as_deref(),
                    ctx.stripe_customer_id.as_deref(),
                    ctx,
                )
                .await;
        };

        let had_pending = current.pending_downgrade.is_some();
        let update = plan_renewal(&current, event_plan);

        if update.is_noop_against(&current) {
            tracing::debug!(user_id = %user_id, "Renewal replay - state already reset");
            return Ok(current);
        }

        let next = self.store.upsert(user_id, update).await?;

        self.audit(
            user_id,
            EntitlementEventType::SubscriptionRenewed,
            serde_json::json!({
                "plan_type": next.plan_type,
                "photos_limit": next.photos_limit,
                "applied_deferred_downgrade": had_pending,
            }),
            ctx,
        )
        .await;

        tracing::info!(
            user_id = %user_id,
            plan_type = %next.plan_type,
            photos_limit = next.photos_limit,
            applied_deferred_downgrade = had_pending,
            "Subscription renewed"
        );

        Ok(next)
    }

    /// ACTIVE -> CANCEL_PENDING. Creates the record if the user has none so
    /// a cancellation always lands somewhere.
    pub async fn cancel(
        &self,
        user_id: Uuid,
        period_end: Option<OffsetDateTime>,
        ctx: &EventContext,
    ) -> BillingResult<Entitlement> {
        let now = OffsetDateTime::now_utc();
        let current = match self.store.get(user_id).await? {
            Some(current) => current,
            None => {
                self.store
                    .upsert(user_id, EntitlementUpdate::default())
                    .await?
            }
        };

        let update = plan_cancellation(&current, period_end, now);
        if update == EntitlementUpdate::default() {
            tracing::debug!(user_id = %user_id, "Cancellation replay - already canceled");
            return Ok(current);
        }

        let next = self.store.upsert(user_id, update).await?;

        self.audit(
            user_id,
            EntitlementEventType::SubscriptionCanceled,
            serde_json::json!({
                "plan_type": next.plan_type,
                "photos_limit": next.photos_limit,
                "subscription_end_date": next.subscription_end_date,
            }),
            ctx,
        )
        .await;

        tracing::info!(
            user_id = %user_id,
            subscription_end_date = ?next.subscription_end_date,
            "Subscription canceled - entitlement preserved until period end"
        );

        Ok(next)
    }

    /// CANCEL_PENDING -> EXPIRED when the paid period has lapsed. No-op
    /// otherwise. There is no scheduler guarantee; this runs from the sync
    /// pass and on-demand reads.
    pub async fn expire_if_lapsed(&self, user_id: Uuid) -> BillingResult<Option<Entitlement>> {
        let now = OffsetDateTime::now_utc();
        let Some(current) = self.store.get(user_id).await? else {
            return Ok(None);
        };

        let Some(update) = plan_expiry(&current, now) else {
            return Ok(None);
        };

        let next = self.store.upsert(user_id, update).await?;

        self.audit(
            user_id,
            EntitlementEventType::SubscriptionExpired,
            serde_json::json!({
                "previous_plan": current.plan_type,
                "previous_photos_limit": current.photos_limit,
            }),
            &EventContext::system(),
        )
        .await;

        tracing::info!(
            user_id = %user_id,
            previous_plan = %current.plan_type,
            "Lapsed subscription expired to free tier"
        );

        Ok(Some(next))
    }

    /// Expire every canceled subscription whose end date has passed.
    /// Returns the number of entitlements reset.
    pub async fn sweep_expired(&self) -> BillingResult<usize> {
        let lapsed = self.store.lapsed_user_ids(200).await?;
        let mut expired = 0;

        for user_id in lapsed {
            match self.expire_if_lapsed(user_id).await {
                Ok(Some(_)) => expired += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(user_id = %user_id, error = %e, "Failed to expire lapsed subscription");
                }
            }
        }

        Ok(expired)
    }

    /// Support-initiated override: set a plan and/or grant or revoke
    /// credits, bypassing event classification.
    pub async fn admin_adjust(
        &self,
        user_id: Uuid,
        plan_type: Option<PlanType>,
        limit_change: Option<LimitChange>,
        ctx: &EventContext,
    ) -> BillingResult<Entitlement> {
        let current = match self.store.get(user_id).await? {
            Some(current) => current,
            None => {
                self.store
                    .upsert(user_id, EntitlementUpdate::default())
                    .await?
            }
        };

        let update = plan_admin_adjustment(&current, plan_type, limit_change);
        let next = self.store.upsert(user_id, update).await?;

        self.audit(
            user_id,
            EntitlementEventType::AdminAdjusted,
            serde_json::json!({
                "plan_type": next.plan_type,
                "photos_limit": next.photos_limit,
                "previous_photos_limit": current.photos_limit,
            }),
            ctx,
        )
        .await;

        tracing::info!(
            user_id = %user_id,
            plan_type = %next.plan_type,
            photos_limit = next.photos_limit,
            "Admin entitlement adjustment applied"
        );

        Ok(next)
    }

    /// Audit writes are auxiliary: failure is logged, never propagated.
    async fn audit(
        &self,
        user_id: Uuid,
        event_type: EntitlementEventType,
        data: serde_json::Value,
        ctx: &EventContext,
    ) {
        let mut builder = EntitlementEventBuilder::new(user_id, event_type)
            .data(data)
            .actor_type(ctx.actor.unwrap_or(ActorType::System));

        if let Some(event_id) = &ctx.stripe_event_id {
            builder = builder.stripe_event(event_id);
        }
        if let Some(subscription_id) = &ctx.stripe_subscription_id {
            builder = builder.stripe_subscription(subscription_id);
        }
        if let Some(customer_id) = &ctx.stripe_customer_id {
            builder = builder.stripe_customer(customer_id);
        }

        if let Err(e) = self.events.log_event(builder).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to write entitlement audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::apply_update;

    fn active_agency() -> Entitlement {
        let now = OffsetDateTime::now_utc();
        let mut ent = Entitlement::free_defaults(Uuid::new_v4(), Some("a@b.com".into()), now);
        ent.plan_type = PlanType::Agency;
        ent.photos_limit = 300;
        ent.photos_used = 40;
        ent.subscription_status = SubscriptionStatus::Active;
        ent.stripe_subscription_id = Some("sub_1".into());
        ent
    }

    #[test]
    fn test_activation_resets_usage_and_dates() {
        let update = plan_activation(None, Plan::agency(), Some("sub_1"), Some("cus_1"));
        assert_eq!(update.plan_type, Some(PlanType::Agency));
        assert_eq!(update.photos_limit, Some(300));
        assert_eq!(update.photos_used, Some(0));
        assert_eq!(update.subscription_status, Some(SubscriptionStatus::Active));
        assert_eq!(update.cancellation_date, Some(None));
    }

    #[test]
    fn test_activation_replay_is_noop() {
        let current = active_agency();
        let update = plan_activation(Some(&current), Plan::agency(), Some("sub_1"), None);
        // A replay must not re-zero photos_used
        assert_eq!(update, EntitlementUpdate::default());
    }

    #[test]
    fn test_activation_of_new_subscription_resets() {
        let current = active_agency();
        let update = plan_activation(Some(&current), Plan::standard(), Some("sub_2"), None);
        assert_eq!(update.photos_used, Some(0));
        assert_eq!(update.photos_limit, Some(50));
    }

    #[test]
    fn test_deferred_downgrade_keeps_limit() {
        // Downgrade agency/300 -> standard/50: label moves, limit stays
        let current = active_agency();
        let outcome = plan_change(&current, Plan::standard());

        let PlanChangeOutcome::Deferred(update) = outcome else {
            panic!("expected deferred downgrade");
        };
        assert_eq!(update.plan_type, Some(PlanType::Standard));
        assert_eq!(update.photos_limit, None);
        assert_eq!(
            update.pending_downgrade,
            Some(Some(PendingDowngrade {
                previous_plan_type: PlanType::Agency,
                previous_photos_limit: 300,
            }))
        );

        // The following renewal applies the cut and resets usage
        let now = OffsetDateTime::now_utc();
        let downgraded = apply_update(&current, &update, now);
        let renewal = plan_renewal(&downgraded, Some(Plan::standard()));
        assert_eq!(renewal.photos_limit, Some(50));
        assert_eq!(renewal.photos_used, Some(0));
        assert_eq!(renewal.pending_downgrade, Some(None));
    }

    #[test]
    fn test_deferred_downgrade_replay_is_noop() {
        let now = OffsetDateTime::now_utc();
        let current = active_agency();
        let PlanChangeOutcome::Deferred(update) = plan_change(&current, Plan::standard()) else {
            panic!("expected deferred downgrade");
        };
        let downgraded = apply_update(&current, &update, now);

        assert_eq!(
            plan_change(&downgraded, Plan::standard()),
            PlanChangeOutcome::Noop
        );
    }

    #[test]
    fn test_upgrade_applies_immediately_and_clears_pending() {
        let now = OffsetDateTime::now_utc();
        let mut current = active_agency();
        current.plan_type = PlanType::Standard;
        current.photos_limit = 50;
        current.pending_downgrade = Some(PendingDowngrade {
            previous_plan_type: PlanType::Agency,
            previous_photos_limit: 300,
        });

        let PlanChangeOutcome::Immediate(update) = plan_change(&current, Plan::agency()) else {
            panic!("expected immediate upgrade");
        };
        let next = apply_update(&current, &update, now);
        assert_eq!(next.plan_type, PlanType::Agency);
        assert_eq!(next.photos_limit, 300);
        assert!(next.pending_downgrade.is_none());
    }

    #[test]
    fn test_renewal_is_idempotent() {
        // Applying the same renewal twice must equal applying it once
        let now = OffsetDateTime::now_utc();
        let current = active_agency();

        let first = apply_update(&current, &plan_renewal(&current, Some(Plan::agency())), now);
        let second = apply_update(&first, &plan_renewal(&first, Some(Plan::agency())), now);

        assert_eq!(first.photos_used, 0);
        assert_eq!(first.photos_limit, 300);
        assert_eq!(second.photos_used, first.photos_used);
        assert_eq!(second.photos_limit, first.photos_limit);
        assert_eq!(second.plan_type, first.plan_type);

        // And the second application is detectably a no-op
        assert!(plan_renewal(&first, Some(Plan::agency())).is_noop_against(&first));
    }

    #[test]
    fn test_out_of_order_change_and_renewal_converge() {
        // A downgrade event and the following renewal may arrive in either
        // order; both orders must land on the same plan and limit.
        let now = OffsetDateTime::now_utc();
        let start = active_agency();

        // Causal order: plan change, then renewal
        let causal = {
            let after_change = match plan_change(&start, Plan::standard()) {
                PlanChangeOutcome::Deferred(u) | PlanChangeOutcome::Immediate(u) => {
                    apply_update(&start, &u, now)
                }
                PlanChangeOutcome::Noop => start.clone(),
            };
            apply_update(
                &after_change,
                &plan_renewal(&after_change, Some(Plan::standard())),
                now,
            )
        };

        // Late plan-change: renewal (already carrying the new price) first
        let reversed = {
            let after_renewal =
                apply_update(&start, &plan_renewal(&start, Some(Plan::standard())), now);
            match plan_change(&after_renewal, Plan::standard()) {
                PlanChangeOutcome::Deferred(u) | PlanChangeOutcome::Immediate(u) => {
                    apply_update(&after_renewal, &u, now)
                }
                PlanChangeOutcome::Noop => after_renewal,
            }
        };

        assert_eq!(causal.plan_type, reversed.plan_type);
        assert_eq!(causal.photos_limit, reversed.photos_limit);
        assert_eq!(causal.plan_type, PlanType::Standard);
        assert_eq!(causal.photos_limit, 50);
    }

    #[test]
    fn test_cancellation_preserves_entitlement() {
        let now = OffsetDateTime::now_utc();
        let current = active_agency();
        let period_end = now + time::Duration::days(12);

        let update = plan_cancellation(&current, Some(period_end), now);
        let next = apply_update(&current, &update, now);

        assert_eq!(next.subscription_status, SubscriptionStatus::Canceled);
        assert_eq!(next.plan_type, PlanType::Agency);
        assert_eq!(next.photos_limit, 300);
        assert_eq!(next.subscription_end_date, Some(period_end));
        assert!(next.cancellation_date.is_some());
    }

    #[test]
    fn test_cancellation_replay_keeps_original_date() {
        let now = OffsetDateTime::now_utc();
        let current = active_agency();
        let period_end = now + time::Duration::days(12);

        let first = apply_update(&current, &plan_cancellation(&current, Some(period_end), now), now);
        let later = now + time::Duration::hours(2);
        let replay = plan_cancellation(&first, Some(period_end), later);

        assert_eq!(replay, EntitlementUpdate::default());
    }

    #[test]
    fn test_expiry_only_after_end_date() {
        let now = OffsetDateTime::now_utc();
        let mut current = active_agency();
        current.subscription_status = SubscriptionStatus::Canceled;
        current.subscription_end_date = Some(now + time::Duration::days(3));

        assert!(plan_expiry(&current, now).is_none());

        current.subscription_end_date = Some(now - time::Duration::days(1));
        let update = plan_expiry(&current, now).expect("should expire");
        let next = apply_update(&current, &update, now);

        assert_eq!(next.plan_type, PlanType::Free);
        assert_eq!(next.photos_limit, FREE_PHOTOS_LIMIT);
        assert_eq!(next.subscription_status, SubscriptionStatus::Inactive);
        // Usage is deliberately untouched
        assert_eq!(next.photos_used, current.photos_used);

        // Once expired, the sweep sees nothing to do
        assert!(plan_expiry(&next, now).is_none());
    }

    #[test]
    fn test_admin_delta_and_absolute() {
        let current = active_agency();

        let granted = plan_admin_adjustment(&current, None, Some(LimitChange::Delta(25)));
        assert_eq!(granted.photos_limit, Some(325));
        assert_eq!(granted.photos_used, None);

        let cut = plan_admin_adjustment(&current, None, Some(LimitChange::Absolute(10)));
        assert_eq!(cut.photos_limit, Some(10));
        // Usage clamps down so remaining credits stay non-negative
        assert_eq!(cut.photos_used, Some(10));

        let floor = plan_admin_adjustment(&current, None, Some(LimitChange::Delta(-1000)));
        assert_eq!(floor.photos_limit, Some(0));
    }

    #[test]
    fn test_credits_remaining_nonnegative_across_transitions() {
        // Walk a full lifecycle and check the derived credit count never
        // goes negative at any step.
        let now = OffsetDateTime::now_utc();
        let mut ent = Entitlement::free_defaults(Uuid::new_v4(), None, now);
        assert!(ent.credits_remaining() >= 0);

        ent = apply_update(
            &ent,
            &plan_activation(None, Plan::agency(), Some("sub_1"), Some("cus_1")),
            now,
        );
        ent.photos_used = 299;
        assert!(ent.credits_remaining() >= 0);

        if let PlanChangeOutcome::Deferred(u) = plan_change(&ent, Plan::standard()) {
            ent = apply_update(&ent, &u, now);
        }
        assert!(ent.credits_remaining() >= 0);

        ent = apply_update(&ent, &plan_renewal(&ent, Some(Plan::standard())), now);
        assert!(ent.credits_remaining() >= 0);

        ent = apply_update(&ent, &plan_cancellation(&ent, Some(now), now), now);
        assert!(ent.credits_remaining() >= 0);

        if let Some(u) = plan_expiry(&ent, now + time::Duration::seconds(1)) {
            ent = apply_update(&ent, &u, now);
        }
        assert!(ent.credits_remaining() >= 0);
    }

    #[test]
    fn test_phase_derivation() {
        let now = OffsetDateTime::now_utc();
        let mut ent = Entitlement::free_defaults(Uuid::new_v4(), None, now);
        assert_eq!(phase_of(&ent, now), SubscriptionPhase::New);

        ent.subscription_status = SubscriptionStatus::Active;
        assert_eq!(phase_of(&ent, now), SubscriptionPhase::Active);

        ent.subscription_status = SubscriptionStatus::Canceled;
        ent.subscription_end_date = Some(now + time::Duration::days(1));
        assert_eq!(phase_of(&ent, now), SubscriptionPhase::CancelPending);

        ent.subscription_end_date = Some(now - time::Duration::days(1));
        assert_eq!(phase_of(&ent, now), SubscriptionPhase::Expired);
    }
}
