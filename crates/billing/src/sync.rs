//! Credit synchronizer
//!
//! Detects and repairs drift between the authoritative `user_entitlements`
//! table and the legacy `profiles` mirror. The primary always wins: it is
//! the only store that tracks usage, so its plan and limit are copied over
//! whatever the mirror holds. A mirror row missing entirely is seeded; a
//! primary record missing for a legacy profile is seeded the other way with
//! zeroed usage.
//!
//! Safe to run concurrently with ordinary traffic and safe to re-run: a
//! pass over already-synced data writes nothing.

use time::OffsetDateTime;
use uuid::Uuid;

use stageright_shared::{Entitlement, PlanType};

use crate::error::BillingResult;
use crate::events::{EntitlementEventBuilder, EntitlementEventLogger, EntitlementEventType};
use crate::store::{EntitlementStore, EntitlementUpdate, ProfileRow};

/// What a sync pass decided to do for one user
#[derive(Debug, Clone, PartialEq)]
pub enum RepairAction {
    /// Mirror disagrees with the primary; overwrite it
    CopyToSecondary {
        plan_type: PlanType,
        photos_limit: i32,
    },
    /// Mirror row does not exist yet
    SeedSecondary {
        plan_type: PlanType,
        photos_limit: i32,
    },
    /// Primary record missing for a legacy profile
    SeedPrimary {
        plan_type: PlanType,
        photos_limit: i32,
    },
}

/// Pure repair decision for one user's pair of records
pub fn repair_action(
    primary: Option<&Entitlement>,
    secondary: Option<&ProfileRow>,
) -> Option<RepairAction> {
    match (primary, secondary) {
        (Some(primary), Some(secondary)) => {
            if primary.plan_type == secondary.plan_type
                && primary.photos_limit == secondary.photos_limit
            {
                None
            } else {
                Some(RepairAction::CopyToSecondary {
                    plan_type: primary.plan_type,
                    photos_limit: primary.photos_limit,
                })
            }
        }
        (Some(primary), None) => Some(RepairAction::SeedSecondary {
            plan_type: primary.plan_type,
            photos_limit: primary.photos_limit,
        }),
        (None, Some(secondary)) => Some(RepairAction::SeedPrimary {
            plan_type: secondary.plan_type,
            photos_limit: secondary.photos_limit,
        }),
        (None, None) => None,
    }
}

/// Per-user sync result
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    InSync,
    Repaired,
    Seeded,
    /// Neither store knows this user
    Unknown,
}

/// Summary of a full pass
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct SyncReport {
    pub checked: usize,
    pub repaired: usize,
    pub seeded: usize,
    pub failures: usize,
}

/// Page size for full-table passes; keeps each chunk's pool usage bounded
const SYNC_PAGE_SIZE: i64 = 200;

/// Reconciles the two entitlement stores
#[derive(Clone)]
pub struct CreditSynchronizer {
    store: EntitlementStore,
    events: EntitlementEventLogger,
}

impl CreditSynchronizer {
    pub fn new(store: EntitlementStore, events: EntitlementEventLogger) -> Self {
        Self { store, events }
    }

    /// Reconcile one user's records
    pub async fn sync_user(&self, user_id: Uuid) -> BillingResult<SyncOutcome> {
        let primary = self.store.get(user_id).await?;
        let secondary = self.store.secondary(user_id).await?;

        let Some(action) = repair_action(primary.as_ref(), secondary.as_ref()) else {
            return Ok(match (&primary, &secondary) {
                (None, None) => SyncOutcome::Unknown,
                _ => SyncOutcome::InSync,
            });
        };

        let outcome = match &action {
            RepairAction::CopyToSecondary { .. } => {
                // primary is present by construction of the action
                if let Some(primary) = &primary {
                    self.store.repair_secondary(primary).await?;
                }
                SyncOutcome::Repaired
            }
            RepairAction::SeedSecondary { .. } => {
                if let Some(primary) = &primary {
                    self.store.repair_secondary(primary).await?;
                }
                SyncOutcome::Seeded
            }
            RepairAction::SeedPrimary {
                plan_type,
                photos_limit,
            } => {
                let email = secondary.as_ref().and_then(|row| row.email.clone());
                self.store
                    .upsert(
                        user_id,
                        EntitlementUpdate {
                            email,
                            plan_type: Some(*plan_type),
                            photos_limit: Some(*photos_limit),
                            photos_used: Some(0),
                            ..Default::default()
                        },
                    )
                    .await?;
                SyncOutcome::Seeded
            }
        };

        self.audit_repair(user_id, &action).await;

        tracing::info!(
            user_id = %user_id,
            action = ?action,
            "Entitlement drift repaired"
        );

        Ok(outcome)
    }

    /// Reconcile every user. Chunked; a failure for one user is logged and
    /// counted, never aborts the pass.
    pub async fn sync_all(&self) -> BillingResult<SyncReport> {
        let started = OffsetDateTime::now_utc();
        let mut report = SyncReport::default();

        let mut cursor: Option<Uuid> = None;
        loop {
            let ids = self.store.user_ids_after(cursor, SYNC_PAGE_SIZE).await?;
            let Some(last) = ids.last().copied() else {
                break;
            };

            for user_id in ids {
                report.checked += 1;
                match self.sync_user(user_id).await {
                    Ok(SyncOutcome::Repaired) => report.repaired += 1,
                    Ok(SyncOutcome::Seeded) => report.seeded += 1,
                    Ok(_) => {}
                    Err(e) => {
                        report.failures += 1;
                        tracing::error!(user_id = %user_id, error = %e, "Sync failed for user");
                    }
                }
            }

            cursor = Some(last);
        }

        // Legacy profiles with no primary record at all
        let orphans = self.store.orphaned_secondary_rows(SYNC_PAGE_SIZE).await?;
        for row in orphans {
            report.checked += 1;
            match self.sync_user(row.user_id).await {
                Ok(SyncOutcome::Seeded) => report.seeded += 1,
                Ok(SyncOutcome::Repaired) => report.repaired += 1,
                Ok(_) => {}
                Err(e) => {
                    report.failures += 1;
                    tracing::error!(user_id = %row.user_id, error = %e, "Sync failed for orphaned profile");
                }
            }
        }

        tracing::info!(
            checked = report.checked,
            repaired = report.repaired,
            seeded = report.seeded,
            failures = report.failures,
            elapsed_secs = (OffsetDateTime::now_utc() - started).whole_seconds(),
            "Credit sync pass complete"
        );

        Ok(report)
    }

    async fn audit_repair(&self, user_id: Uuid, action: &RepairAction) {
        let builder = EntitlementEventBuilder::new(user_id, EntitlementEventType::DriftRepaired)
            .data(serde_json::json!({ "action": format!("{:?}", action) }));

        if let Err(e) = self.events.log_event(builder).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to write drift repair audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stageright_shared::SubscriptionStatus;

    fn primary(plan: PlanType, limit: i32) -> Entitlement {
        let now = OffsetDateTime::now_utc();
        let mut ent = Entitlement::free_defaults(Uuid::new_v4(), Some("a@b.com".into()), now);
        ent.plan_type = plan;
        ent.photos_limit = limit;
        ent.subscription_status = SubscriptionStatus::Active;
        ent
    }

    fn secondary_for(ent: &Entitlement, plan: PlanType, limit: i32) -> ProfileRow {
        ProfileRow {
            id: Uuid::new_v4(),
            user_id: ent.user_id,
            email: ent.email.clone(),
            plan_type: plan,
            photos_limit: limit,
            updated_at: ent.updated_at,
        }
    }

    #[test]
    fn test_in_sync_pair_needs_nothing() {
        let p = primary(PlanType::Agency, 300);
        let s = secondary_for(&p, PlanType::Agency, 300);
        assert_eq!(repair_action(Some(&p), Some(&s)), None);
    }

    #[test]
    fn test_primary_wins_on_drift() {
        let p = primary(PlanType::Agency, 300);
        let s = secondary_for(&p, PlanType::Standard, 50);

        assert_eq!(
            repair_action(Some(&p), Some(&s)),
            Some(RepairAction::CopyToSecondary {
                plan_type: PlanType::Agency,
                photos_limit: 300,
            })
        );
    }

    #[test]
    fn test_repair_is_idempotent() {
        // Applying the decided repair leaves a pair the next pass skips
        let p = primary(PlanType::Agency, 300);
        let mut s = secondary_for(&p, PlanType::Standard, 50);

        if let Some(RepairAction::CopyToSecondary {
            plan_type,
            photos_limit,
        }) = repair_action(Some(&p), Some(&s))
        {
            s.plan_type = plan_type;
            s.photos_limit = photos_limit;
        }

        assert_eq!(repair_action(Some(&p), Some(&s)), None);
    }

    #[test]
    fn test_missing_secondary_is_seeded() {
        let p = primary(PlanType::Standard, 50);
        assert_eq!(
            repair_action(Some(&p), None),
            Some(RepairAction::SeedSecondary {
                plan_type: PlanType::Standard,
                photos_limit: 50,
            })
        );
    }

    #[test]
    fn test_missing_primary_seeded_from_profile() {
        let p = primary(PlanType::Standard, 50);
        let s = secondary_for(&p, PlanType::Standard, 50);
        assert_eq!(
            repair_action(None, Some(&s)),
            Some(RepairAction::SeedPrimary {
                plan_type: PlanType::Standard,
                photos_limit: 50,
            })
        );
    }

    #[test]
    fn test_unknown_user_everywhere() {
        assert_eq!(repair_action(None, None), None);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_sync_user_converges_and_second_pass_is_noop() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect(&url)
            .await
            .expect("connect");

        let store = EntitlementStore::new(pool.clone());
        let events = EntitlementEventLogger::new(pool.clone());
        let sync = CreditSynchronizer::new(store.clone(), events);

        // Seed a primary record, then force mirror drift
        let user_id = Uuid::new_v4();
        store
            .upsert(
                user_id,
                EntitlementUpdate {
                    plan_type: Some(PlanType::Agency),
                    photos_limit: Some(300),
                    ..Default::default()
                },
            )
            .await
            .expect("seed primary");

        sqlx::query("UPDATE profiles SET plan_type = 'standard', photos_limit = 50 WHERE user_id = $1")
            .bind(user_id)
            .execute(&pool)
            .await
            .expect("force drift");

        assert_eq!(sync.sync_user(user_id).await.expect("first pass"), SyncOutcome::Repaired);
        assert_eq!(sync.sync_user(user_id).await.expect("second pass"), SyncOutcome::InSync);

        let mirror = store.secondary(user_id).await.expect("read").expect("row");
        assert_eq!(mirror.plan_type, PlanType::Agency);
        assert_eq!(mirror.photos_limit, 300);
    }
}
