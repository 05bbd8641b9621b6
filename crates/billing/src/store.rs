//! Entitlement store adapter
//!
//! One interface over the two redundant entitlement records:
//! `user_entitlements` (authoritative, carries usage tracking) and the
//! legacy `profiles` table (plan + limit mirror read by older dashboard
//! paths).
//!
//! Every write lands on the primary inside a per-user transaction
//! (`SELECT ... FOR UPDATE`), then mirrors to the secondary best-effort: a
//! secondary failure is logged and swallowed, and the credit synchronizer
//! repairs the resulting drift on its next pass. A primary failure is a hard
//! failure of the operation.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use stageright_shared::{Entitlement, PendingDowngrade, PlanType, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};

/// Partial update applied to an entitlement.
///
/// `None` leaves a field untouched. Nullable columns use a nested Option:
/// `Some(None)` clears, `Some(Some(v))` sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntitlementUpdate {
    pub email: Option<String>,
    pub plan_type: Option<PlanType>,
    pub photos_limit: Option<i32>,
    pub photos_used: Option<i32>,
    pub subscription_status: Option<SubscriptionStatus>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub pending_downgrade: Option<Option<PendingDowngrade>>,
    pub cancellation_date: Option<Option<OffsetDateTime>>,
    pub subscription_end_date: Option<Option<OffsetDateTime>>,
}

impl EntitlementUpdate {
    /// True when applying this update would change nothing
    pub fn is_noop_against(&self, current: &Entitlement) -> bool {
        self.email.as_ref().map_or(true, |v| current.email.as_deref() == Some(v))
            && self.plan_type.map_or(true, |v| current.plan_type == v)
            && self.photos_limit.map_or(true, |v| current.photos_limit == v)
            && self.photos_used.map_or(true, |v| current.photos_used == v)
            && self
                .subscription_status
                .map_or(true, |v| current.subscription_status == v)
            && self
                .stripe_customer_id
                .as_ref()
                .map_or(true, |v| current.stripe_customer_id.as_deref() == Some(v))
            && self
                .stripe_subscription_id
                .as_ref()
                .map_or(true, |v| current.stripe_subscription_id.as_deref() == Some(v))
            && self
                .pending_downgrade
                .map_or(true, |v| current.pending_downgrade == v)
            && self
                .cancellation_date
                .map_or(true, |v| current.cancellation_date == v)
            && self
                .subscription_end_date
                .map_or(true, |v| current.subscription_end_date == v)
    }
}

/// Pure merge of an update into a snapshot. `updated_at` is always bumped.
pub fn apply_update(
    current: &Entitlement,
    update: &EntitlementUpdate,
    now: OffsetDateTime,
) -> Entitlement {
    let mut next = current.clone();

    if let Some(email) = &update.email {
        next.email = Some(email.clone());
    }
    if let Some(plan_type) = update.plan_type {
        next.plan_type = plan_type;
    }
    if let Some(photos_limit) = update.photos_limit {
        next.photos_limit = photos_limit;
    }
    if let Some(photos_used) = update.photos_used {
        next.photos_used = photos_used;
    }
    if let Some(status) = update.subscription_status {
        next.subscription_status = status;
    }
    if let Some(customer_id) = &update.stripe_customer_id {
        next.stripe_customer_id = Some(customer_id.clone());
    }
    if let Some(subscription_id) = &update.stripe_subscription_id {
        next.stripe_subscription_id = Some(subscription_id.clone());
    }
    if let Some(pending) = update.pending_downgrade {
        next.pending_downgrade = pending;
    }
    if let Some(cancellation_date) = update.cancellation_date {
        next.cancellation_date = cancellation_date;
    }
    if let Some(end_date) = update.subscription_end_date {
        next.subscription_end_date = end_date;
    }

    next.updated_at = now;
    next
}

/// Row shape of the legacy `profiles` mirror.
///
/// `id` is a surrogate key distinct from `user_id`; joins against the
/// primary table must use `user_id` or `email`, never `id`.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct ProfileRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub email: Option<String>,
    pub plan_type: PlanType,
    pub photos_limit: i32,
    pub updated_at: OffsetDateTime,
}

/// Outcome of an atomic credit consume
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    pub remaining: i32,
}

/// Read/write access to both entitlement records
#[derive(Clone)]
pub struct EntitlementStore {
    pool: PgPool,
}

const ENTITLEMENT_COLUMNS: &str = r#"
    user_id, email, plan_type, photos_limit, photos_used,
    subscription_status, stripe_customer_id, stripe_subscription_id,
    previous_plan_type, previous_photos_limit,
    cancellation_date, subscription_end_date, created_at, updated_at
"#;

impl EntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fetch the authoritative entitlement for a user
    pub async fn get(&self, user_id: Uuid) -> BillingResult<Option<Entitlement>> {
        let row: Option<Entitlement> = sqlx::query_as(&format!(
            "SELECT {ENTITLEMENT_COLUMNS} FROM user_entitlements WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Fetch by email (case-insensitive), used as a secondary lookup key
    pub async fn get_by_email(&self, email: &str) -> BillingResult<Option<Entitlement>> {
        let row: Option<Entitlement> = sqlx::query_as(&format!(
            "SELECT {ENTITLEMENT_COLUMNS} FROM user_entitlements WHERE LOWER(email) = LOWER($1)"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Page through user ids for full-table passes. Keyset pagination keeps
    /// the sync job from holding long cursors against the pooler.
    pub async fn user_ids_after(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> BillingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = match after {
            Some(after) => {
                sqlx::query_as(
                    "SELECT user_id FROM user_entitlements WHERE user_id > $1 ORDER BY user_id LIMIT $2",
                )
                .bind(after)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT user_id FROM user_entitlements ORDER BY user_id LIMIT $1")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Users whose canceled subscription has passed its end date
    pub async fn lapsed_user_ids(&self, limit: i64) -> BillingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT user_id FROM user_entitlements
            WHERE subscription_status = 'canceled'
              AND subscription_end_date IS NOT NULL
              AND subscription_end_date <= NOW()
            ORDER BY subscription_end_date
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Apply a partial update to a user's entitlement, creating the record
    /// with free-tier defaults if it does not exist yet.
    ///
    /// The read-merge-write runs inside a transaction with the row locked,
    /// so concurrent transitions for the same user serialize. The secondary
    /// mirror write happens after commit and never fails the caller.
    pub async fn upsert(
        &self,
        user_id: Uuid,
        update: EntitlementUpdate,
    ) -> BillingResult<Entitlement> {
        let now = OffsetDateTime::now_utc();

        let mut tx = self.pool.begin().await?;

        let current: Option<Entitlement> = sqlx::query_as(&format!(
            "SELECT {ENTITLEMENT_COLUMNS} FROM user_entitlements WHERE user_id = $1 FOR UPDATE"
        ))
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let base = current
            .unwrap_or_else(|| Entitlement::free_defaults(user_id, update.email.clone(), now));
        let merged = apply_update(&base, &update, now);

        sqlx::query(
            r#"
            INSERT INTO user_entitlements (
                user_id, email, plan_type, photos_limit, photos_used,
                subscription_status, stripe_customer_id, stripe_subscription_id,
                previous_plan_type, previous_photos_limit,
                cancellation_date, subscription_end_date, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14
            )
            ON CONFLICT (user_id) DO UPDATE SET
                email = EXCLUDED.email,
                plan_type = EXCLUDED.plan_type,
                photos_limit = EXCLUDED.photos_limit,
                photos_used = EXCLUDED.photos_used,
                subscription_status = EXCLUDED.subscription_status,
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                previous_plan_type = EXCLUDED.previous_plan_type,
                previous_photos_limit = EXCLUDED.previous_photos_limit,
                cancellation_date = EXCLUDED.cancellation_date,
                subscription_end_date = EXCLUDED.subscription_end_date,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(merged.user_id)
        .bind(&merged.email)
        .bind(merged.plan_type)
        .bind(merged.photos_limit)
        .bind(merged.photos_used)
        .bind(merged.subscription_status)
        .bind(&merged.stripe_customer_id)
        .bind(&merged.stripe_subscription_id)
        .bind(merged.pending_downgrade.map(|p| p.previous_plan_type))
        .bind(merged.pending_downgrade.map(|p| p.previous_photos_limit))
        .bind(merged.cancellation_date)
        .bind(merged.subscription_end_date)
        .bind(merged.created_at)
        .bind(merged.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.mirror_to_profiles(&merged).await;

        Ok(merged)
    }

    /// Best-effort mirror write. Failure is logged, never propagated; the
    /// synchronizer is the backstop.
    async fn mirror_to_profiles(&self, entitlement: &Entitlement) {
        let result = sqlx::query(
            r#"
            INSERT INTO profiles (user_id, email, plan_type, photos_limit, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                email = EXCLUDED.email,
                plan_type = EXCLUDED.plan_type,
                photos_limit = EXCLUDED.photos_limit,
                updated_at = NOW()
            "#,
        )
        .bind(entitlement.user_id)
        .bind(&entitlement.email)
        .bind(entitlement.plan_type)
        .bind(entitlement.photos_limit)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(
                user_id = %entitlement.user_id,
                error = %e,
                "Secondary entitlement write failed - synchronizer will repair"
            );
        }
    }

    /// Write the mirror row and propagate failure. Used by the
    /// synchronizer, which needs to count repair failures; ordinary
    /// transition writes go through the swallowing mirror instead.
    pub async fn repair_secondary(&self, entitlement: &Entitlement) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (user_id, email, plan_type, photos_limit, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                email = EXCLUDED.email,
                plan_type = EXCLUDED.plan_type,
                photos_limit = EXCLUDED.photos_limit,
                updated_at = NOW()
            "#,
        )
        .bind(entitlement.user_id)
        .bind(&entitlement.email)
        .bind(entitlement.plan_type)
        .bind(entitlement.photos_limit)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Legacy mirror rows with no matching primary record
    pub async fn orphaned_secondary_rows(&self, limit: i64) -> BillingResult<Vec<ProfileRow>> {
        let rows: Vec<ProfileRow> = sqlx::query_as(
            r#"
            SELECT p.id, p.user_id, p.email, p.plan_type, p.photos_limit, p.updated_at
            FROM profiles p
            WHERE NOT EXISTS (
                SELECT 1 FROM user_entitlements e WHERE e.user_id = p.user_id
            )
            ORDER BY p.user_id
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// The legacy mirror row, if any
    pub async fn secondary(&self, user_id: Uuid) -> BillingResult<Option<ProfileRow>> {
        let row: Option<ProfileRow> = sqlx::query_as(
            "SELECT id, user_id, email, plan_type, photos_limit, updated_at FROM profiles WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Look up a user id by email in the legacy mirror
    pub async fn secondary_user_by_email(&self, email: &str) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT user_id FROM profiles WHERE LOWER(email) = LOWER($1)")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id,)| id))
    }

    /// Atomically consume one photo credit.
    ///
    /// The guarded single-statement update is what serializes usage
    /// decrements against concurrent transitions for the same user; it can
    /// never drive `photos_used` past `photos_limit`.
    pub async fn consume_photo(&self, user_id: Uuid) -> BillingResult<ConsumeOutcome> {
        let updated: Option<(i32, i32)> = sqlx::query_as(
            r#"
            UPDATE user_entitlements
            SET photos_used = photos_used + 1, updated_at = NOW()
            WHERE user_id = $1 AND photos_used < photos_limit
            RETURNING photos_limit, photos_used
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((limit, used)) = updated {
            return Ok(ConsumeOutcome {
                allowed: true,
                remaining: (limit - used).max(0),
            });
        }

        // Either the user has no record or no credits remain
        match self.get(user_id).await? {
            Some(ent) => Ok(ConsumeOutcome {
                allowed: false,
                remaining: ent.credits_remaining(),
            }),
            None => Err(BillingError::NotFound(format!(
                "No entitlement for user {}",
                user_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> Entitlement {
        let now = OffsetDateTime::now_utc();
        let mut ent = Entitlement::free_defaults(Uuid::new_v4(), Some("a@b.com".into()), now);
        ent.plan_type = PlanType::Standard;
        ent.photos_limit = 50;
        ent.photos_used = 12;
        ent.subscription_status = SubscriptionStatus::Active;
        ent
    }

    #[test]
    fn test_apply_update_partial() {
        let current = snapshot();
        let update = EntitlementUpdate {
            photos_used: Some(0),
            ..Default::default()
        };

        let next = apply_update(&current, &update, OffsetDateTime::now_utc());
        assert_eq!(next.photos_used, 0);
        assert_eq!(next.plan_type, current.plan_type);
        assert_eq!(next.photos_limit, current.photos_limit);
    }

    #[test]
    fn test_apply_update_clears_nullable() {
        let mut current = snapshot();
        current.pending_downgrade = Some(PendingDowngrade {
            previous_plan_type: PlanType::Agency,
            previous_photos_limit: 300,
        });

        let update = EntitlementUpdate {
            pending_downgrade: Some(None),
            ..Default::default()
        };

        let next = apply_update(&current, &update, OffsetDateTime::now_utc());
        assert!(next.pending_downgrade.is_none());
    }

    #[test]
    fn test_is_noop_against() {
        let current = snapshot();

        let noop = EntitlementUpdate {
            plan_type: Some(PlanType::Standard),
            photos_limit: Some(50),
            ..Default::default()
        };
        assert!(noop.is_noop_against(&current));

        let real = EntitlementUpdate {
            photos_used: Some(0),
            ..Default::default()
        };
        assert!(!real.is_noop_against(&current));
    }
}
