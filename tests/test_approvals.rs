use rusqlite::Connection;

use sunupay::approval::expiry::{expire_due, sweep};
use sunupay::approval::{
    ApprovalError, create_ops_action, create_request, get_ops_action, get_request, list_requests,
    reject, sign,
};
use sunupay::events::NoopBus;
use sunupay::model::approval::{ApprovalStatus, OpsActionStatus};
use sunupay::store;

// ── Helpers ─────────────────────────────────────────────────────────

fn setup() -> Connection {
    store::open_in_memory().unwrap()
}

fn roles(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// `treasury_transfer` is seeded with required_signatures = 2 and roles
/// {pay_admin, fraud_ops, compliance}.
fn open_request(conn: &mut Connection, reference_id: Option<&str>) -> String {
    create_request(
        conn,
        "treasury_transfer",
        reference_id,
        "treasury_transfer",
        "ops-console",
        serde_json::json!({ "amount": 250_000 }),
    )
    .unwrap()
    .id
}

// ── Threshold state machine ─────────────────────────────────────────

#[test]
fn two_signatures_cross_the_threshold_exactly_once() {
    let mut conn = setup();
    let id = open_request(&mut conn, None);

    let first = sign(&mut conn, &id, "u1", &roles(&["pay_admin"]), None).unwrap();
    assert_eq!(first.request.status, ApprovalStatus::PartiallyApproved);
    assert!(!first.newly_approved);

    let second = sign(&mut conn, &id, "u2", &roles(&["fraud_ops"]), Some("checked")).unwrap();
    assert_eq!(second.request.status, ApprovalStatus::Approved);
    assert!(second.newly_approved, "the crossing signature announces approval");

    // a third qualified signer is refused: the request is terminal
    let err = sign(&mut conn, &id, "u3", &roles(&["compliance"]), None).unwrap_err();
    assert!(matches!(err, ApprovalError::Terminal { .. }));

    let (request, signatures) = get_request(&conn, &id).unwrap();
    assert_eq!(request.status, ApprovalStatus::Approved);
    assert_eq!(signatures.len(), 2);
}

#[test]
fn a_signer_appears_at_most_once() {
    let mut conn = setup();
    let id = open_request(&mut conn, None);

    sign(&mut conn, &id, "u1", &roles(&["pay_admin"]), None).unwrap();
    let err = sign(&mut conn, &id, "u1", &roles(&["pay_admin"]), None).unwrap_err();
    assert!(matches!(err, ApprovalError::AlreadySigned { .. }));

    let (request, signatures) = get_request(&conn, &id).unwrap();
    assert_eq!(signatures.len(), 1, "rejected replay left no state");
    assert_eq!(request.status, ApprovalStatus::PartiallyApproved);
}

#[test]
fn signer_roles_must_intersect_the_policy() {
    let mut conn = setup();
    let id = open_request(&mut conn, None);

    let err = sign(&mut conn, &id, "intern", &roles(&["support"]), None).unwrap_err();
    assert!(matches!(err, ApprovalError::RoleNotAllowed { .. }));
}

#[test]
fn approval_authorizes_the_linked_ops_action() {
    let mut conn = setup();
    let action = create_ops_action(&conn, "treasury_transfer", serde_json::json!({})).unwrap();
    assert_eq!(action.status, OpsActionStatus::PendingApproval);
    let id = open_request(&mut conn, Some(&action.id));

    sign(&mut conn, &id, "u1", &roles(&["pay_admin"]), None).unwrap();
    assert_eq!(
        get_ops_action(&conn, &action.id).unwrap().unwrap().status,
        OpsActionStatus::PendingApproval
    );

    sign(&mut conn, &id, "u2", &roles(&["compliance"]), None).unwrap();
    assert_eq!(
        get_ops_action(&conn, &action.id).unwrap().unwrap().status,
        OpsActionStatus::Authorized
    );
}

#[test]
fn rejection_is_terminal_and_rejects_the_ops_action() {
    let mut conn = setup();
    let action = create_ops_action(&conn, "treasury_transfer", serde_json::json!({})).unwrap();
    let id = open_request(&mut conn, Some(&action.id));

    sign(&mut conn, &id, "u1", &roles(&["pay_admin"]), None).unwrap();
    reject(&mut conn, &id, "u2", "supporting documents missing").unwrap();

    assert_eq!(
        get_ops_action(&conn, &action.id).unwrap().unwrap().status,
        OpsActionStatus::Rejected
    );

    let err = sign(&mut conn, &id, "u3", &roles(&["compliance"]), None).unwrap_err();
    assert!(matches!(err, ApprovalError::Terminal { .. }));
}

#[test]
fn unknown_policy_is_refused() {
    let mut conn = setup();
    let err = create_request(&mut conn, "x", None, "no-such-policy", "ops", serde_json::json!({}))
        .unwrap_err();
    assert!(matches!(err, ApprovalError::PolicyNotFound(_)));
}

#[test]
fn list_filters_by_status_and_type() {
    let mut conn = setup();
    let a = open_request(&mut conn, None);
    let _b = open_request(&mut conn, None);
    sign(&mut conn, &a, "u1", &roles(&["pay_admin"]), None).unwrap();

    let open = list_requests(&conn, Some(ApprovalStatus::Open), None).unwrap();
    assert_eq!(open.len(), 1);

    let partial =
        list_requests(&conn, Some(ApprovalStatus::PartiallyApproved), None).unwrap();
    assert_eq!(partial.len(), 1);
    assert_eq!(partial[0].id, a);

    let by_type = list_requests(&conn, None, Some("treasury_transfer")).unwrap();
    assert_eq!(by_type.len(), 2);
    assert!(list_requests(&conn, None, Some("other")).unwrap().is_empty());
}

// ── Expiry ──────────────────────────────────────────────────────────

#[test]
fn signing_an_expired_request_is_refused() {
    let mut conn = setup();
    let id = open_request(&mut conn, None);
    conn.execute(
        "UPDATE approval_requests SET expires_at = expires_at - 100000 WHERE id = ?1",
        [&id],
    )
    .unwrap();

    let err = sign(&mut conn, &id, "u1", &roles(&["pay_admin"]), None).unwrap_err();
    assert!(matches!(err, ApprovalError::Expired(_)));
}

#[test]
fn expire_due_is_idempotent() {
    let mut conn = setup();
    let action = create_ops_action(&conn, "treasury_transfer", serde_json::json!({})).unwrap();
    let id = open_request(&mut conn, Some(&action.id));
    let live = open_request(&mut conn, None);

    conn.execute(
        "UPDATE approval_requests SET expires_at = expires_at - 100000 WHERE id = ?1",
        [&id],
    )
    .unwrap();

    let now = chrono::Utc::now().timestamp();
    let expired = expire_due(&mut conn, now).unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, id);

    let (request, _) = get_request(&conn, &id).unwrap();
    assert_eq!(request.status, ApprovalStatus::Expired);
    assert_eq!(
        get_ops_action(&conn, &action.id).unwrap().unwrap().status,
        OpsActionStatus::Rejected
    );

    let audit_events: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM approval_audit WHERE request_id = ?1 AND event = 'expired'",
            [&id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(audit_events, 1);

    // re-running the worker is a no-op
    assert!(expire_due(&mut conn, now).unwrap().is_empty());

    let (still_open, _) = get_request(&conn, &live).unwrap();
    assert_eq!(still_open.status, ApprovalStatus::Open);
}

#[tokio::test]
async fn sweep_reports_the_processed_count_even_if_the_bus_is_quiet() {
    let conn = setup();
    let db = std::sync::Arc::new(tokio::sync::Mutex::new(conn));
    {
        let mut guard = db.lock().await;
        let id = create_request(
            &mut guard,
            "treasury_transfer",
            None,
            "treasury_transfer",
            "ops",
            serde_json::json!({}),
        )
        .unwrap()
        .id;
        guard
            .execute(
                "UPDATE approval_requests SET expires_at = expires_at - 100000 WHERE id = ?1",
                [&id],
            )
            .unwrap();
    }

    assert_eq!(sweep(&db, &NoopBus).await.unwrap(), 1);
    assert_eq!(sweep(&db, &NoopBus).await.unwrap(), 0);
}
