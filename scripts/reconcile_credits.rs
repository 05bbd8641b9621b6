#!/usr/bin/env rust-script
//! Credit Reconciliation Script
//!
//! Fixes drift between the authoritative user_entitlements table and the
//! legacy profiles mirror. The primary table is the source of truth.
//!
//! ## Usage
//! ```bash
//! # Dry run (preview changes without applying)
//! cargo run --bin reconcile_credits
//!
//! # Apply fixes
//! cargo run --bin reconcile_credits -- --apply
//! ```
//!
//! ## Environment Variables
//! - DATABASE_URL: PostgreSQL connection string
//!
//! ## Actions Performed
//! 1. Copy primary plan/limit over drifted mirror rows
//! 2. Seed mirror rows missing for primary records
//! 3. Seed primary records missing for legacy profiles (zeroed usage)
//! 4. Report canceled entitlements with no end date (manual follow-up)

use std::env;
use std::error::Error;

#[derive(Debug)]
struct ReconciliationAction {
    user_id: uuid::Uuid,
    action_type: String,
    current_state: String,
    new_state: String,
    reason: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    println!("StageRight Credit Reconciliation");
    println!("=================================\n");

    let args: Vec<String> = env::args().collect();
    let dry_run = !args.contains(&"--apply".to_string());

    if dry_run {
        println!("DRY RUN MODE - No changes will be applied");
        println!("   Use --apply flag to execute changes\n");
    } else {
        println!("LIVE MODE - Changes will be applied to the database\n");
    }

    dotenvy::dotenv().ok();
    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = sqlx::postgres::PgPool::connect(&database_url).await?;
    println!("Connected to database\n");

    let mut actions = Vec::new();

    // ========================================================================
    // Action 1: mirror rows that disagree with the primary
    // ========================================================================
    println!("Scanning for drifted mirror rows...");

    let drifted: Vec<(uuid::Uuid, String, i32, String, i32)> = sqlx::query_as(
        r#"
        SELECT e.user_id, e.plan_type, e.photos_limit, p.plan_type, p.photos_limit
        FROM user_entitlements e
        JOIN profiles p ON p.user_id = e.user_id
        WHERE e.plan_type != p.plan_type OR e.photos_limit != p.photos_limit
        "#,
    )
    .fetch_all(&pool)
    .await?;

    for (user_id, primary_plan, primary_limit, mirror_plan, mirror_limit) in drifted {
        actions.push(ReconciliationAction {
            user_id,
            action_type: "COPY_TO_MIRROR".to_string(),
            current_state: format!("{}/{}", mirror_plan, mirror_limit),
            new_state: format!("{}/{}", primary_plan, primary_limit),
            reason: "Mirror disagrees with primary".to_string(),
        });
    }

    println!("  Found {} drifted mirror rows", actions.len());

    // ========================================================================
    // Action 2: primary records with no mirror row
    // ========================================================================
    println!("\nScanning for missing mirror rows...");

    let missing_mirror: Vec<(uuid::Uuid, String, i32)> = sqlx::query_as(
        r#"
        SELECT e.user_id, e.plan_type, e.photos_limit
        FROM user_entitlements e
        WHERE NOT EXISTS (SELECT 1 FROM profiles p WHERE p.user_id = e.user_id)
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let missing_mirror_count = missing_mirror.len();
    for (user_id, plan, limit) in missing_mirror {
        actions.push(ReconciliationAction {
            user_id,
            action_type: "SEED_MIRROR".to_string(),
            current_state: "(none)".to_string(),
            new_state: format!("{}/{}", plan, limit),
            reason: "No mirror row for primary record".to_string(),
        });
    }

    println!("  Found {} missing mirror rows", missing_mirror_count);

    // ========================================================================
    // Action 3: legacy profiles with no primary record
    // ========================================================================
    println!("\nScanning for legacy profiles without primary records...");

    let orphaned: Vec<(uuid::Uuid, String, i32)> = sqlx::query_as(
        r#"
        SELECT p.user_id, p.plan_type, p.photos_limit
        FROM profiles p
        WHERE NOT EXISTS (SELECT 1 FROM user_entitlements e WHERE e.user_id = p.user_id)
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let orphaned_count = orphaned.len();
    for (user_id, plan, limit) in orphaned {
        actions.push(ReconciliationAction {
            user_id,
            action_type: "SEED_PRIMARY".to_string(),
            current_state: "(none)".to_string(),
            new_state: format!("{}/{} used=0", plan, limit),
            reason: "Legacy profile has no primary record".to_string(),
        });
    }

    println!("  Found {} orphaned legacy profiles", orphaned_count);

    // ========================================================================
    // Report: canceled entitlements with no end date (not auto-fixable)
    // ========================================================================
    let canceled_no_end: Vec<(uuid::Uuid,)> = sqlx::query_as(
        r#"
        SELECT user_id FROM user_entitlements
        WHERE subscription_status = 'canceled' AND subscription_end_date IS NULL
        "#,
    )
    .fetch_all(&pool)
    .await?;

    if !canceled_no_end.is_empty() {
        println!(
            "\nNOTE: {} canceled entitlements have no end date; these never expire automatically.",
            canceled_no_end.len()
        );
        println!("   Resolve manually against the billing provider's records.");
    }

    // ========================================================================
    // Apply
    // ========================================================================
    println!("\n{} total actions", actions.len());
    for action in &actions {
        println!(
            "  [{}] user {}: {} -> {} ({})",
            action.action_type, action.user_id, action.current_state, action.new_state, action.reason
        );
    }

    if dry_run || actions.is_empty() {
        println!("\nDone (no changes applied).");
        return Ok(());
    }

    let mut applied = 0usize;
    for action in &actions {
        let result = match action.action_type.as_str() {
            "COPY_TO_MIRROR" | "SEED_MIRROR" => {
                sqlx::query(
                    r#"
                    INSERT INTO profiles (user_id, email, plan_type, photos_limit, updated_at)
                    SELECT user_id, email, plan_type, photos_limit, NOW()
                    FROM user_entitlements WHERE user_id = $1
                    ON CONFLICT (user_id) DO UPDATE SET
                        plan_type = EXCLUDED.plan_type,
                        photos_limit = EXCLUDED.photos_limit,
                        updated_at = NOW()
                    "#,
                )
                .bind(action.user_id)
                .execute(&pool)
                .await
            }
            "SEED_PRIMARY" => {
                sqlx::query(
                    r#"
                    INSERT INTO user_entitlements
                        (user_id, email, plan_type, photos_limit, photos_used, subscription_status)
                    SELECT user_id, email, plan_type, photos_limit, 0, 'inactive'
                    FROM profiles WHERE user_id = $1
                    ON CONFLICT (user_id) DO NOTHING
                    "#,
                )
                .bind(action.user_id)
                .execute(&pool)
                .await
            }
            _ => continue,
        };

        match result {
            Ok(_) => applied += 1,
            Err(e) => eprintln!("  FAILED user {}: {}", action.user_id, e),
        }
    }

    println!("\nApplied {}/{} actions.", applied, actions.len());
    Ok(())
}
