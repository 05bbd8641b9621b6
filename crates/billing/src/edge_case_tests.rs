// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Entitlement Engine
//!
//! Scenario-level tests that chain classification, plan resolution, and
//! transition planning the way the webhook pipeline does, covering:
//! - Duplicate and out-of-order event delivery
//! - Deferred downgrades across renewals
//! - Cancellation under provider outage
//! - Store drift repair convergence

#[cfg(test)]
mod renewal_idempotency_tests {
    use crate::plans::Plan;
    use crate::store::apply_update;
    use crate::transition::plan_renewal;
    use stageright_shared::{Entitlement, PlanType, SubscriptionStatus};
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn active(plan: PlanType, limit: i32, used: i32) -> Entitlement {
        let now = OffsetDateTime::now_utc();
        let mut ent = Entitlement::free_defaults(Uuid::new_v4(), Some("a@b.com".into()), now);
        ent.plan_type = plan;
        ent.photos_limit = limit;
        ent.photos_used = used;
        ent.subscription_status = SubscriptionStatus::Active;
        ent.stripe_subscription_id = Some("sub_1".into());
        ent
    }

    // =========================================================================
    // Same renewal delivered twice in sequence: identical end state
    // =========================================================================
    #[test]
    fn test_double_renewal_equals_single_renewal() {
        let now = OffsetDateTime::now_utc();
        let start = active(PlanType::Agency, 300, 120);

        let once = apply_update(&start, &plan_renewal(&start, Some(Plan::agency())), now);
        let twice = apply_update(&once, &plan_renewal(&once, Some(Plan::agency())), now);

        assert_eq!(once.photos_used, 0);
        assert_eq!(once.photos_limit, 300);
        assert_eq!(twice.photos_used, once.photos_used);
        assert_eq!(twice.photos_limit, once.photos_limit);
        assert_eq!(twice.plan_type, once.plan_type);
    }

    // =========================================================================
    // The two redundant renewal paths (subscription update + invoice) land
    // on the same state even when the second carries no price detail
    // =========================================================================
    #[test]
    fn test_redundant_renewal_paths_converge() {
        let now = OffsetDateTime::now_utc();
        let start = active(PlanType::Standard, 50, 31);

        let via_subscription =
            apply_update(&start, &plan_renewal(&start, Some(Plan::standard())), now);
        let via_invoice = apply_update(
            &via_subscription,
            &plan_renewal(&via_subscription, None),
            now,
        );

        assert_eq!(via_invoice.photos_used, 0);
        assert_eq!(via_invoice.photos_limit, 50);
        assert_eq!(via_invoice.plan_type, PlanType::Standard);
    }
}

#[cfg(test)]
mod deferred_downgrade_tests {
    use crate::plans::Plan;
    use crate::store::apply_update;
    use crate::transition::{plan_change, plan_renewal, PlanChangeOutcome};
    use stageright_shared::{Entitlement, PlanType, SubscriptionStatus};
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn agency_with_usage(used: i32) -> Entitlement {
        let now = OffsetDateTime::now_utc();
        let mut ent = Entitlement::free_defaults(Uuid::new_v4(), None, now);
        ent.plan_type = PlanType::Agency;
        ent.photos_limit = 300;
        ent.photos_used = used;
        ent.subscription_status = SubscriptionStatus::Active;
        ent
    }

    // =========================================================================
    // Downgrade agency/300 -> standard/50: label moves now, limit at renewal
    // =========================================================================
    #[test]
    fn test_downgrade_label_now_limit_later() {
        let now = OffsetDateTime::now_utc();
        let start = agency_with_usage(210);

        let PlanChangeOutcome::Deferred(update) = plan_change(&start, Plan::standard()) else {
            panic!("expected deferral");
        };
        let mid_cycle = apply_update(&start, &update, now);

        assert_eq!(mid_cycle.plan_type, PlanType::Standard);
        assert_eq!(mid_cycle.photos_limit, 300);
        assert_eq!(mid_cycle.photos_used, 210);
        assert!(mid_cycle.pending_downgrade.is_some());

        let renewed = apply_update(
            &mid_cycle,
            &plan_renewal(&mid_cycle, Some(Plan::standard())),
            now,
        );
        assert_eq!(renewed.photos_limit, 50);
        assert_eq!(renewed.photos_used, 0);
        assert!(renewed.pending_downgrade.is_none());
    }

    // =========================================================================
    // User downgrades, regrets it, upgrades back before renewal: the
    // pending marker is gone and nothing fires at renewal
    // =========================================================================
    #[test]
    fn test_upgrade_cancels_pending_downgrade() {
        let now = OffsetDateTime::now_utc();
        let start = agency_with_usage(10);

        let PlanChangeOutcome::Deferred(down) = plan_change(&start, Plan::standard()) else {
            panic!("expected deferral");
        };
        let downgraded = apply_update(&start, &down, now);

        let PlanChangeOutcome::Immediate(up) = plan_change(&downgraded, Plan::agency()) else {
            panic!("expected immediate upgrade");
        };
        let restored = apply_update(&downgraded, &up, now);

        assert_eq!(restored.plan_type, PlanType::Agency);
        assert_eq!(restored.photos_limit, 300);
        assert!(restored.pending_downgrade.is_none());

        let renewed = apply_update(&restored, &plan_renewal(&restored, Some(Plan::agency())), now);
        assert_eq!(renewed.photos_limit, 300);
    }

    // =========================================================================
    // A renewal without price detail still applies the pending cut from
    // the (already downgraded) plan label
    // =========================================================================
    #[test]
    fn test_renewal_without_price_applies_pending_cut() {
        let now = OffsetDateTime::now_utc();
        let start = agency_with_usage(5);

        let PlanChangeOutcome::Deferred(down) = plan_change(&start, Plan::standard()) else {
            panic!("expected deferral");
        };
        let downgraded = apply_update(&start, &down, now);

        let renewed = apply_update(&downgraded, &plan_renewal(&downgraded, None), now);
        assert_eq!(renewed.plan_type, PlanType::Standard);
        assert_eq!(renewed.photos_limit, 50);
    }
}

#[cfg(test)]
mod heuristic_plan_tests {
    use crate::classifier::{classify, EventClass, WebhookData, WebhookEnvelope};
    use crate::plans::{Plan, PlanCatalog};
    use crate::store::apply_update;
    use crate::transition::{plan_activation, plan_renewal};
    use stageright_shared::{Entitlement, PlanType};
    use time::OffsetDateTime;
    use uuid::Uuid;

    // =========================================================================
    // Price id containing "agency" with no catalog entry resolves to the
    // agency tier via fallback; the following renewal keeps the limit
    // =========================================================================
    #[test]
    fn test_uncataloged_agency_price_end_to_end() {
        let now = OffsetDateTime::now_utc();
        let catalog = PlanCatalog::with_entries([("price_std".to_string(), Plan::standard())]);

        let envelope = WebhookEnvelope {
            id: "evt_77".to_string(),
            event_type: "customer.subscription.created".to_string(),
            created: now.unix_timestamp(),
            data: WebhookData {
                object: serde_json::json!({
                    "id": "sub_77",
                    "customer": "cus_77",
                    "items": {"data": [{"price": {"id": "price_agency_2024_promo"}}]}
                }),
                previous_attributes: None,
            },
        };

        let EventClass::NewSubscription(facts) = classify(&envelope) else {
            panic!("expected new subscription");
        };

        let resolution = catalog.resolve(facts.price_id.as_deref().unwrap());
        assert!(resolution.is_heuristic());
        assert_eq!(resolution.plan().plan_type, PlanType::Agency);
        assert_eq!(resolution.plan().photos_limit, 300);

        let activated = apply_update(
            &Entitlement::free_defaults(Uuid::new_v4(), None, now),
            &plan_activation(
                None,
                resolution.plan(),
                facts.subscription_id.as_deref(),
                facts.customer_id.as_deref(),
            ),
            now,
        );
        assert_eq!(activated.photos_limit, 300);
        assert_eq!(activated.photos_used, 0);

        let renewed = apply_update(
            &activated,
            &plan_renewal(&activated, Some(resolution.plan())),
            now,
        );
        assert_eq!(renewed.photos_limit, 300);
        assert_eq!(renewed.photos_used, 0);
    }
}

#[cfg(test)]
mod cancellation_tests {
    use crate::store::apply_update;
    use crate::transition::{plan_cancellation, plan_expiry};
    use stageright_shared::{Entitlement, PlanType, SubscriptionStatus, FREE_PHOTOS_LIMIT};
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    // =========================================================================
    // Cancel with no provider record located: still succeeds locally with
    // the plan and limit untouched
    // =========================================================================
    #[test]
    fn test_cancel_without_provider_record_preserves_entitlement() {
        let now = OffsetDateTime::now_utc();
        let mut ent = Entitlement::free_defaults(Uuid::new_v4(), None, now);
        ent.plan_type = PlanType::Standard;
        ent.photos_limit = 50;
        ent.photos_used = 18;
        ent.subscription_status = SubscriptionStatus::Active;

        let canceled = apply_update(&ent, &plan_cancellation(&ent, None, now), now);

        assert_eq!(canceled.subscription_status, SubscriptionStatus::Canceled);
        assert_eq!(canceled.plan_type, PlanType::Standard);
        assert_eq!(canceled.photos_limit, 50);
        assert_eq!(canceled.photos_used, 18);
        assert!(canceled.subscription_end_date.is_none());
    }

    // =========================================================================
    // Full cancel lifecycle: entitlement survives until the period end,
    // then drops to free defaults
    // =========================================================================
    #[test]
    fn test_cancel_then_expire() {
        let now = OffsetDateTime::now_utc();
        let mut ent = Entitlement::free_defaults(Uuid::new_v4(), None, now);
        ent.plan_type = PlanType::Agency;
        ent.photos_limit = 300;
        ent.photos_used = 123;
        ent.subscription_status = SubscriptionStatus::Active;

        let period_end = now + Duration::days(9);
        let canceled = apply_update(&ent, &plan_cancellation(&ent, Some(period_end), now), now);

        // Before the end date nothing expires
        assert!(plan_expiry(&canceled, now).is_none());
        assert_eq!(canceled.photos_limit, 300);

        // After the end date the sweep resets to free defaults
        let later = period_end + Duration::minutes(1);
        let update = plan_expiry(&canceled, later).expect("lapsed");
        let expired = apply_update(&canceled, &update, later);

        assert_eq!(expired.plan_type, PlanType::Free);
        assert_eq!(expired.photos_limit, FREE_PHOTOS_LIMIT);
        assert_eq!(expired.subscription_status, SubscriptionStatus::Inactive);
    }
}

#[cfg(test)]
mod drift_tests {
    use crate::store::ProfileRow;
    use crate::sync::{repair_action, RepairAction};
    use stageright_shared::{Entitlement, PlanType, SubscriptionStatus};
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn pair(
        primary_plan: PlanType,
        primary_limit: i32,
        mirror_plan: PlanType,
        mirror_limit: i32,
    ) -> (Entitlement, ProfileRow) {
        let now = OffsetDateTime::now_utc();
        let mut primary = Entitlement::free_defaults(Uuid::new_v4(), Some("a@b.com".into()), now);
        primary.plan_type = primary_plan;
        primary.photos_limit = primary_limit;
        primary.subscription_status = SubscriptionStatus::Active;

        let mirror = ProfileRow {
            id: Uuid::new_v4(),
            user_id: primary.user_id,
            email: primary.email.clone(),
            plan_type: mirror_plan,
            photos_limit: mirror_limit,
            updated_at: now,
        };
        (primary, mirror)
    }

    // =========================================================================
    // Drifted pair converges in one repair; the second pass is a no-op
    // =========================================================================
    #[test]
    fn test_one_pass_convergence() {
        let (primary, mut mirror) = pair(PlanType::Agency, 300, PlanType::Standard, 50);

        let action = repair_action(Some(&primary), Some(&mirror)).expect("drift detected");
        let RepairAction::CopyToSecondary {
            plan_type,
            photos_limit,
        } = action
        else {
            panic!("expected primary-wins copy");
        };

        mirror.plan_type = plan_type;
        mirror.photos_limit = photos_limit;

        assert_eq!(mirror.plan_type, PlanType::Agency);
        assert_eq!(mirror.photos_limit, 300);
        assert_eq!(repair_action(Some(&primary), Some(&mirror)), None);
    }

    // =========================================================================
    // The mirror never wins, whichever side holds the bigger number
    // =========================================================================
    #[test]
    fn test_primary_wins_both_directions() {
        let (p1, m1) = pair(PlanType::Standard, 50, PlanType::Agency, 300);
        assert_eq!(
            repair_action(Some(&p1), Some(&m1)),
            Some(RepairAction::CopyToSecondary {
                plan_type: PlanType::Standard,
                photos_limit: 50,
            })
        );

        let (p2, m2) = pair(PlanType::Agency, 300, PlanType::Standard, 50);
        assert_eq!(
            repair_action(Some(&p2), Some(&m2)),
            Some(RepairAction::CopyToSecondary {
                plan_type: PlanType::Agency,
                photos_limit: 300,
            })
        );
    }
}

#[cfg(test)]
mod out_of_order_tests {
    use crate::plans::Plan;
    use crate::store::{apply_update, ProfileRow};
    use crate::sync::{repair_action, RepairAction};
    use crate::transition::{plan_change, plan_renewal, PlanChangeOutcome};
    use stageright_shared::{Entitlement, PlanType, SubscriptionStatus};
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn apply_change(ent: &Entitlement, plan: Plan, now: OffsetDateTime) -> Entitlement {
        match plan_change(ent, plan) {
            PlanChangeOutcome::Immediate(u) | PlanChangeOutcome::Deferred(u) => {
                apply_update(ent, &u, now)
            }
            PlanChangeOutcome::Noop => ent.clone(),
        }
    }

    // =========================================================================
    // Plan-change and renewal for the same subscription processed in both
    // orders, then a sync pass: identical final state to causal order
    // =========================================================================
    #[test]
    fn test_either_order_plus_sync_converges() {
        let now = OffsetDateTime::now_utc();
        let mut start = Entitlement::free_defaults(Uuid::new_v4(), None, now);
        start.plan_type = PlanType::Agency;
        start.photos_limit = 300;
        start.photos_used = 44;
        start.subscription_status = SubscriptionStatus::Active;

        // Causal: downgrade first, renewal second
        let causal = {
            let changed = apply_change(&start, Plan::standard(), now);
            apply_update(&changed, &plan_renewal(&changed, Some(Plan::standard())), now)
        };

        // Reversed: the renewal (already priced at the new plan) arrives
        // before the late plan-change event
        let reversed = {
            let renewed = apply_update(&start, &plan_renewal(&start, Some(Plan::standard())), now);
            apply_change(&renewed, Plan::standard(), now)
        };

        assert_eq!(causal.plan_type, reversed.plan_type);
        assert_eq!(causal.photos_limit, reversed.photos_limit);
        assert_eq!(causal.plan_type, PlanType::Standard);
        assert_eq!(causal.photos_limit, 50);

        // A sync pass then brings a stale mirror to the same values in
        // one repair regardless of which order produced the primary
        for primary in [&causal, &reversed] {
            let mut mirror = ProfileRow {
                id: Uuid::new_v4(),
                user_id: primary.user_id,
                email: None,
                plan_type: PlanType::Agency,
                photos_limit: 300,
                updated_at: now,
            };

            if let Some(RepairAction::CopyToSecondary {
                plan_type,
                photos_limit,
            }) = repair_action(Some(primary), Some(&mirror))
            {
                mirror.plan_type = plan_type;
                mirror.photos_limit = photos_limit;
            }

            assert_eq!(mirror.plan_type, primary.plan_type);
            assert_eq!(mirror.photos_limit, primary.photos_limit);
            assert_eq!(repair_action(Some(primary), Some(&mirror)), None);
        }
    }
}
