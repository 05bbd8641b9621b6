//! Common types used across StageRight

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Plans
// =============================================================================

/// Subscription plan tier
///
/// `trial` is a legacy alias of `free` kept for rows written before the
/// standard/agency split; new writes use `free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanType {
    Free,
    Trial,
    Standard,
    Agency,
}

impl Default for PlanType {
    fn default() -> Self {
        Self::Free
    }
}

impl PlanType {
    /// Photos included per billing cycle for this plan
    pub fn photos_included(&self) -> i32 {
        match self {
            Self::Free => FREE_PHOTOS_LIMIT,
            Self::Trial => FREE_PHOTOS_LIMIT, // Legacy tier - same as Free
            Self::Standard => 50,
            Self::Agency => 300,
        }
    }

    /// Ordering used to distinguish upgrades from downgrades.
    /// Free and Trial share rank 0.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Free | Self::Trial => 0,
            Self::Standard => 1,
            Self::Agency => 2,
        }
    }

    pub fn is_paid(&self) -> bool {
        self.rank() > 0
    }
}

impl std::fmt::Display for PlanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Trial => write!(f, "trial"),
            Self::Standard => write!(f, "standard"),
            Self::Agency => write!(f, "agency"),
        }
    }
}

impl std::str::FromStr for PlanType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "trial" => Ok(Self::Trial),
            "standard" => Ok(Self::Standard),
            "agency" => Ok(Self::Agency),
            _ => Err(format!("Invalid plan type: {}", s)),
        }
    }
}

/// Photos granted to accounts without a paid subscription
pub const FREE_PHOTOS_LIMIT: i32 = 5;

// =============================================================================
// Subscription status
// =============================================================================

/// Billing subscription status as tracked locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Inactive,
    Active,
    Canceled,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Inactive
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inactive => write!(f, "inactive"),
            Self::Active => write!(f, "active"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inactive" => Ok(Self::Inactive),
            "active" => Ok(Self::Active),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid subscription status: {}", s)),
        }
    }
}

// =============================================================================
// Entitlement
// =============================================================================

/// A downgrade that has been accepted but whose credit-limit effect is
/// deferred to the next renewal. Records the pre-downgrade values; its
/// presence means `photos_limit` still reflects the old plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDowngrade {
    pub previous_plan_type: PlanType,
    pub previous_photos_limit: i32,
}

/// A user's current plan tier and usage credits.
///
/// Persisted redundantly: the `user_entitlements` table is authoritative and
/// carries usage tracking; the legacy `profiles` table mirrors plan and limit
/// for older read paths. The mirror may lag; the credit synchronizer repairs
/// drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entitlement {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub plan_type: PlanType,
    pub photos_limit: i32,
    pub photos_used: i32,
    pub subscription_status: SubscriptionStatus,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub pending_downgrade: Option<PendingDowngrade>,
    pub cancellation_date: Option<OffsetDateTime>,
    pub subscription_end_date: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Entitlement {
    /// Default entitlement for a user who has never purchased a plan
    pub fn free_defaults(user_id: Uuid, email: Option<String>, now: OffsetDateTime) -> Self {
        Self {
            user_id,
            email,
            plan_type: PlanType::Free,
            photos_limit: FREE_PHOTOS_LIMIT,
            photos_used: 0,
            subscription_status: SubscriptionStatus::Inactive,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            pending_downgrade: None,
            cancellation_date: None,
            subscription_end_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Credits still usable this cycle. Derived, never persisted.
    pub fn credits_remaining(&self) -> i32 {
        (self.photos_limit - self.photos_used).max(0)
    }

    /// A canceled subscription whose paid period has ended
    pub fn is_lapsed(&self, now: OffsetDateTime) -> bool {
        self.subscription_status == SubscriptionStatus::Canceled
            && self
                .subscription_end_date
                .map(|end| end <= now)
                .unwrap_or(false)
    }
}

// Manual FromRow: the pending downgrade pair is stored as two nullable
// columns and folded into one Option here.
impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for Entitlement {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let previous_plan_type: Option<PlanType> = row.try_get("previous_plan_type")?;
        let previous_photos_limit: Option<i32> = row.try_get("previous_photos_limit")?;
        let pending_downgrade = match (previous_plan_type, previous_photos_limit) {
            (Some(plan), Some(limit)) => Some(PendingDowngrade {
                previous_plan_type: plan,
                previous_photos_limit: limit,
            }),
            _ => None,
        };

        Ok(Self {
            user_id: row.try_get("user_id")?,
            email: row.try_get("email")?,
            plan_type: row.try_get("plan_type")?,
            photos_limit: row.try_get("photos_limit")?,
            photos_used: row.try_get("photos_used")?,
            subscription_status: row.try_get("subscription_status")?,
            stripe_customer_id: row.try_get("stripe_customer_id")?,
            stripe_subscription_id: row.try_get("stripe_subscription_id")?,
            pending_downgrade,
            cancellation_date: row.try_get("cancellation_date")?,
            subscription_end_date: row.try_get("subscription_end_date")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_type_display_roundtrip() {
        for plan in [
            PlanType::Free,
            PlanType::Trial,
            PlanType::Standard,
            PlanType::Agency,
        ] {
            let parsed: PlanType = plan.to_string().parse().unwrap();
            assert_eq!(parsed, plan);
        }
    }

    #[test]
    fn test_plan_rank_ordering() {
        assert_eq!(PlanType::Free.rank(), PlanType::Trial.rank());
        assert!(PlanType::Standard.rank() < PlanType::Agency.rank());
        assert!(!PlanType::Trial.is_paid());
        assert!(PlanType::Standard.is_paid());
    }

    #[test]
    fn test_credits_remaining_never_negative() {
        let now = OffsetDateTime::now_utc();
        let mut ent = Entitlement::free_defaults(Uuid::new_v4(), None, now);
        ent.photos_limit = 10;
        ent.photos_used = 25;
        assert_eq!(ent.credits_remaining(), 0);

        ent.photos_used = 3;
        assert_eq!(ent.credits_remaining(), 7);
    }

    #[test]
    fn test_is_lapsed() {
        let now = OffsetDateTime::now_utc();
        let mut ent = Entitlement::free_defaults(Uuid::new_v4(), None, now);
        assert!(!ent.is_lapsed(now));

        ent.subscription_status = SubscriptionStatus::Canceled;
        // Canceled with no end date recorded: never considered lapsed
        assert!(!ent.is_lapsed(now));

        ent.subscription_end_date = Some(now - time::Duration::days(1));
        assert!(ent.is_lapsed(now));

        ent.subscription_end_date = Some(now + time::Duration::days(10));
        assert!(!ent.is_lapsed(now));
    }
}
