use std::collections::HashSet;

use proptest::prelude::*;
use rusqlite::Connection;

use sunupay::model::rollout::{RollbackTrigger, RolloutStatus, RolloutStrategy, UpgradeOutcome};
use sunupay::rollout::backup::{NewBackup, cleanup_expired, create_backup, get_latest_backup};
use sunupay::rollout::rollback::{RollbackCompletion, complete_rollback, initiate_rollback};
use sunupay::rollout::{
    NewRollout, RolloutError, auto_check, create_rollout, hashing, latest_rollout, record_upgrade,
    set_status, should_upgrade,
};
use sunupay::store;

// ── Helpers ─────────────────────────────────────────────────────────

fn setup() -> Connection {
    store::open_in_memory().unwrap()
}

fn rollout(plugin: &str, percentage: f64) -> NewRollout {
    NewRollout {
        plugin_name: plugin.to_string(),
        version: "2.0.0".to_string(),
        percentage,
        strategy: RolloutStrategy::Random,
        target_countries: None,
        target_tiers: None,
        error_threshold: 0.05,
        metadata: serde_json::json!({}),
    }
}

fn backup(merchant: &str, plugin: &str, version: &str) -> NewBackup {
    NewBackup {
        merchant: merchant.to_string(),
        plugin: plugin.to_string(),
        version: version.to_string(),
        path: format!("/backups/{merchant}/{plugin}-{version}.tar.gz"),
        db_snapshot: None,
        size_bytes: 1_048_576,
        metadata: serde_json::json!({}),
    }
}

// ── Admission determinism ───────────────────────────────────────────

#[test]
fn ten_percent_rollout_admits_a_stable_ten_percent_subset() {
    let conn = setup();
    create_rollout(&conn, &rollout("P1", 10.0)).unwrap();

    let admitted_once: HashSet<String> = (0..10_000)
        .map(|i| format!("m{i}"))
        .filter(|m| should_upgrade(&conn, m, "P1", "SN", "standard").unwrap())
        .collect();
    let admitted_twice: HashSet<String> = (0..10_000)
        .map(|i| format!("m{i}"))
        .filter(|m| should_upgrade(&conn, m, "P1", "SN", "standard").unwrap())
        .collect();

    assert_eq!(admitted_once, admitted_twice, "same decision across calls");
    assert!(
        (900..=1100).contains(&admitted_once.len()),
        "admitted {} of 10000",
        admitted_once.len()
    );
}

#[test]
fn geo_strategy_requires_a_target_country() {
    let conn = setup();
    create_rollout(
        &conn,
        &NewRollout {
            strategy: RolloutStrategy::Geo,
            target_countries: Some(vec!["SN".into(), "CI".into()]),
            ..rollout("P2", 100.0)
        },
    )
    .unwrap();

    assert!(should_upgrade(&conn, "m1", "P2", "SN", "standard").unwrap());
    assert!(should_upgrade(&conn, "m1", "P2", "CI", "standard").unwrap());
    assert!(!should_upgrade(&conn, "m1", "P2", "ML", "standard").unwrap());
}

#[test]
fn tier_strategy_requires_a_target_tier() {
    let conn = setup();
    create_rollout(
        &conn,
        &NewRollout {
            strategy: RolloutStrategy::MerchantTier,
            target_tiers: Some(vec!["premium".into()]),
            ..rollout("P3", 100.0)
        },
    )
    .unwrap();

    assert!(should_upgrade(&conn, "m1", "P3", "SN", "premium").unwrap());
    assert!(!should_upgrade(&conn, "m1", "P3", "SN", "standard").unwrap());
}

#[test]
fn missing_or_inactive_rollout_denies() {
    let mut conn = setup();
    assert!(!should_upgrade(&conn, "m1", "nope", "SN", "standard").unwrap());

    let created = create_rollout(&conn, &rollout("P4", 100.0)).unwrap();
    assert!(should_upgrade(&conn, "m1", "P4", "SN", "standard").unwrap());

    set_status(&mut conn, &created.id, RolloutStatus::Paused, Some("manual pause")).unwrap();
    assert!(!should_upgrade(&conn, "m1", "P4", "SN", "standard").unwrap());
}

#[test]
fn latest_rollout_wins_for_targeting() {
    let conn = setup();
    create_rollout(&conn, &rollout("P5", 0.0)).unwrap();
    create_rollout(&conn, &rollout("P5", 100.0)).unwrap();

    let latest = latest_rollout(&conn, "P5").unwrap().unwrap();
    assert_eq!(latest.percentage, 100.0);
    assert!(should_upgrade(&conn, "m1", "P5", "SN", "standard").unwrap());
}

#[test]
fn percentage_must_be_in_range() {
    let conn = setup();
    assert!(matches!(
        create_rollout(&conn, &rollout("P6", 101.0)),
        Err(RolloutError::PercentageOutOfRange(_))
    ));
    assert!(matches!(
        create_rollout(&conn, &rollout("P6", -1.0)),
        Err(RolloutError::PercentageOutOfRange(_))
    ));
}

proptest! {
    /// The bucket never depends on process state, only on its inputs.
    #[test]
    fn bucket_is_pure(merchant in "[a-z0-9-]{1,24}", plugin in "[a-z0-9-]{1,24}") {
        let a = hashing::bucket(&merchant, &plugin);
        let b = hashing::bucket(&merchant, &plugin);
        prop_assert_eq!(a, b);
        prop_assert!(a < hashing::BUCKETS);
    }
}

// ── Terminal monotonicity ───────────────────────────────────────────

#[test]
fn terminal_states_do_not_transition_out() {
    let mut conn = setup();
    let created = create_rollout(&conn, &rollout("P7", 50.0)).unwrap();

    set_status(&mut conn, &created.id, RolloutStatus::Completed, None).unwrap();
    let err = set_status(&mut conn, &created.id, RolloutStatus::Active, None).unwrap_err();
    assert!(matches!(err, RolloutError::Terminal { .. }));
}

// ── Auto-pause ──────────────────────────────────────────────────────

#[test]
fn auto_check_pauses_rollouts_over_their_error_threshold() {
    let mut conn = setup();
    let hot = create_rollout(&conn, &rollout("hot-plugin", 50.0)).unwrap();
    let calm = create_rollout(&conn, &rollout("calm-plugin", 50.0)).unwrap();

    // 3 failures out of 10 on the hot plugin, all clean on the calm one
    for i in 0..10 {
        let outcome = if i < 3 { UpgradeOutcome::Failed } else { UpgradeOutcome::Success };
        record_upgrade(&conn, &format!("m{i}"), "hot-plugin", "2.0.0", outcome).unwrap();
        record_upgrade(&conn, &format!("m{i}"), "calm-plugin", "2.0.0", UpgradeOutcome::Success)
            .unwrap();
    }

    let paused = auto_check(&mut conn).unwrap();
    assert_eq!(paused, 1);

    let hot_now = latest_rollout(&conn, "hot-plugin").unwrap().unwrap();
    assert_eq!(hot_now.status, RolloutStatus::Paused);
    assert!(
        hot_now.metadata["pause_reason"].as_str().unwrap().contains("error rate"),
        "pause reason recorded: {}",
        hot_now.metadata
    );
    assert_eq!(hot_now.id, hot.id);

    let calm_now = latest_rollout(&conn, "calm-plugin").unwrap().unwrap();
    assert_eq!(calm_now.status, RolloutStatus::Active);
    assert_eq!(calm_now.id, calm.id);

    // the sweep is idempotent once the rollout is paused
    assert_eq!(auto_check(&mut conn).unwrap(), 0);
}

#[test]
fn auto_check_ignores_rollouts_with_no_observations() {
    let mut conn = setup();
    create_rollout(&conn, &rollout("quiet-plugin", 50.0)).unwrap();
    assert_eq!(auto_check(&mut conn).unwrap(), 0);
    let quiet = latest_rollout(&conn, "quiet-plugin").unwrap().unwrap();
    assert_eq!(quiet.status, RolloutStatus::Active);
}

// ── Backups ─────────────────────────────────────────────────────────

#[test]
fn latest_backup_skips_expired_and_failed_rows() {
    let conn = setup();
    let old = create_backup(&conn, &backup("m1", "P8", "1.0.0"), 3600).unwrap();
    conn.execute(
        "UPDATE plugin_backups SET expires_at = expires_at - 7200 WHERE id = ?1",
        [&old.id],
    )
    .unwrap();
    assert!(get_latest_backup(&conn, "m1", "P8", Some("1.0.0")).unwrap().is_none());

    let fresh = create_backup(&conn, &backup("m1", "P8", "1.0.0"), 3600).unwrap();
    conn.execute(
        "UPDATE plugin_backups SET status = 'failed' WHERE id = ?1",
        [&fresh.id],
    )
    .unwrap();
    assert!(get_latest_backup(&conn, "m1", "P8", Some("1.0.0")).unwrap().is_none());

    let good = create_backup(&conn, &backup("m1", "P8", "1.0.0"), 3600).unwrap();
    let found = get_latest_backup(&conn, "m1", "P8", Some("1.0.0")).unwrap().unwrap();
    assert_eq!(found.id, good.id);

    assert_eq!(cleanup_expired(&conn).unwrap(), 1, "only the expired row is removed");
}

// ── Rollback lifecycle ──────────────────────────────────────────────

#[test]
fn rollback_requires_a_live_backup() {
    let mut conn = setup();
    let err = initiate_rollback(
        &mut conn,
        "m1",
        "P9",
        "2.0.0",
        "1.0.0",
        RollbackTrigger::Manual,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, RolloutError::BackupRequired { .. }));

    create_backup(&conn, &backup("m1", "P9", "1.0.0"), 3600).unwrap();
    initiate_rollback(&mut conn, "m1", "P9", "2.0.0", "1.0.0", RollbackTrigger::Manual, None)
        .unwrap();
}

#[test]
fn completed_rollback_is_immutable_and_stamps_the_upgrade_log() {
    let mut conn = setup();
    create_backup(&conn, &backup("m1", "P10", "1.0.0"), 3600).unwrap();
    record_upgrade(&conn, "m1", "P10", "2.0.0", UpgradeOutcome::Failed).unwrap();

    let attempt = initiate_rollback(
        &mut conn,
        "m1",
        "P10",
        "2.0.0",
        "1.0.0",
        RollbackTrigger::Auto,
        Some("error rate breach"),
    )
    .unwrap();

    let done = complete_rollback(
        &mut conn,
        &attempt.id,
        &RollbackCompletion {
            success: true,
            error_message: None,
            duration_ms: Some(4_200),
            files_restored: Some(true),
            db_restored: Some(false),
        },
    )
    .unwrap();
    assert_eq!(done.success, Some(true));
    assert!(done.completed_at.is_some());

    let err = complete_rollback(
        &mut conn,
        &attempt.id,
        &RollbackCompletion {
            success: false,
            error_message: None,
            duration_ms: None,
            files_restored: None,
            db_restored: None,
        },
    )
    .unwrap_err();
    assert!(matches!(err, RolloutError::AttemptCompleted(_)));

    let rollback_status: String = conn
        .query_row(
            "SELECT rollback_status FROM plugin_upgrade_logs WHERE merchant = 'm1' AND plugin = 'P10'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(rollback_status, "success");
}
