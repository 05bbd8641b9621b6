//! Entitlement invariants
//!
//! Runnable consistency checks over the entitlement stores. These can be
//! run after any mutation, webhook replay, or sync pass to confirm the
//! system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - users may have credits they did not pay for, or vice versa
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct UsageOverLimitRow {
    user_id: Uuid,
    photos_used: i32,
    photos_limit: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledNoEndDateRow {
    user_id: Uuid,
    cancellation_date: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct StoreDriftRow {
    user_id: Uuid,
    primary_plan: String,
    primary_limit: i32,
    mirror_plan: String,
    mirror_limit: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct StalePendingRow {
    user_id: Uuid,
    subscription_status: String,
    previous_plan_type: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingMirrorRow {
    user_id: Uuid,
}

/// Service for running entitlement invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_usage_within_limit().await?);
        violations.extend(self.check_canceled_has_end_date().await?);
        violations.extend(self.check_stores_agree().await?);
        violations.extend(self.check_pending_downgrade_active().await?);
        violations.extend(self.check_mirror_exists().await?);

        let checks_run = 5;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: photos_used never exceeds photos_limit
    ///
    /// Usage beyond the limit means the atomic consume guard was bypassed
    /// somewhere, or a limit cut skipped the usage clamp.
    async fn check_usage_within_limit(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UsageOverLimitRow> = sqlx::query_as(
            r#"
            SELECT user_id, photos_used, photos_limit
            FROM user_entitlements
            WHERE photos_used > photos_limit
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "usage_within_limit".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has consumed {} photos against a limit of {}",
                    row.photos_used, row.photos_limit
                ),
                context: serde_json::json!({
                    "photos_used": row.photos_used,
                    "photos_limit": row.photos_limit,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: canceled entitlements carry an end date
    ///
    /// Without an end date the expiry sweep can never move the user off the
    /// paid plan. Expected for cancellations where the provider could not
    /// be reached; the row stays flagged until resolved manually.
    async fn check_canceled_has_end_date(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledNoEndDateRow> = sqlx::query_as(
            r#"
            SELECT user_id, cancellation_date
            FROM user_entitlements
            WHERE subscription_status = 'canceled'
              AND subscription_end_date IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_has_end_date".to_string(),
                user_ids: vec![row.user_id],
                description: "Canceled entitlement has no subscription end date".to_string(),
                context: serde_json::json!({
                    "cancellation_date": row.cancellation_date,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 3: both stores agree on plan and limit
    ///
    /// Drift is repairable (the synchronizer copies the primary over), but
    /// persistent drift means the synchronizer is not running.
    async fn check_stores_agree(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StoreDriftRow> = sqlx::query_as(
            r#"
            SELECT
                e.user_id,
                e.plan_type as primary_plan,
                e.photos_limit as primary_limit,
                p.plan_type as mirror_plan,
                p.photos_limit as mirror_limit
            FROM user_entitlements e
            JOIN profiles p ON p.user_id = e.user_id
            WHERE e.plan_type != p.plan_type
               OR e.photos_limit != p.photos_limit
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "stores_agree".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Stores disagree: primary {}/{} vs mirror {}/{}",
                    row.primary_plan, row.primary_limit, row.mirror_plan, row.mirror_limit
                ),
                context: serde_json::json!({
                    "primary_plan": row.primary_plan,
                    "primary_limit": row.primary_limit,
                    "mirror_plan": row.mirror_plan,
                    "mirror_limit": row.mirror_limit,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: pending downgrades only exist on active subscriptions
    ///
    /// A deferred downgrade is applied at renewal; an inactive or canceled
    /// subscription will never renew, so the marker would sit forever.
    async fn check_pending_downgrade_active(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StalePendingRow> = sqlx::query_as(
            r#"
            SELECT user_id, subscription_status, previous_plan_type
            FROM user_entitlements
            WHERE previous_plan_type IS NOT NULL
              AND subscription_status != 'active'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "pending_downgrade_active".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Pending downgrade on a subscription in status '{}'",
                    row.subscription_status
                ),
                context: serde_json::json!({
                    "subscription_status": row.subscription_status,
                    "previous_plan_type": row.previous_plan_type,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 5: every primary record has a mirror row
    ///
    /// A missing mirror is harmless for new accounts (first sync seeds it)
    /// but worth surfacing in bulk.
    async fn check_mirror_exists(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingMirrorRow> = sqlx::query_as(
            r#"
            SELECT e.user_id
            FROM user_entitlements e
            WHERE NOT EXISTS (SELECT 1 FROM profiles p WHERE p.user_id = e.user_id)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "mirror_exists".to_string(),
                user_ids: vec![row.user_id],
                description: "Primary entitlement has no mirror profile row".to_string(),
                context: serde_json::json!({}),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }
}
