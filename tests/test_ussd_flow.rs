use rusqlite::Connection;

use sunupay::model::session::UssdReply;
use sunupay::store;
use sunupay::ussd::{GatewayRequest, UssdConfig, handle_turn};

// ── Helpers ─────────────────────────────────────────────────────────

fn setup() -> Connection {
    store::open_in_memory().unwrap()
}

fn add_subscriber(conn: &Connection, phone: &str, pin: &str, balance: i64) {
    // low bcrypt cost keeps the suite fast; production uses the default
    let hash = bcrypt::hash(pin, 4).unwrap();
    conn.execute(
        "INSERT INTO subscribers (phone, country, pin_hash, balance_minor, language)
         VALUES (?1, 'SN', ?2, ?3, 'fr')",
        rusqlite::params![phone, hash, balance],
    )
    .unwrap();
}

fn turn(conn: &mut Connection, cfg: &UssdConfig, session: &str, msisdn: &str, text: &str) -> UssdReply {
    handle_turn(
        conn,
        cfg,
        &GatewayRequest {
            session_id: session.to_string(),
            msisdn: msisdn.to_string(),
            text: text.to_string(),
            country: None,
        },
    )
    .unwrap()
}

fn balance_of(conn: &Connection, phone: &str) -> i64 {
    conn.query_row(
        "SELECT balance_minor FROM subscribers WHERE phone = ?1",
        [phone],
        |row| row.get(0),
    )
    .unwrap()
}

fn session_exists(conn: &Connection, session: &str) -> bool {
    let n: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM ussd_sessions WHERE session_id = ?1",
            [session],
            |row| row.get(0),
        )
        .unwrap();
    n > 0
}

// ── Transfer happy path ─────────────────────────────────────────────

#[test]
fn transfer_happy_path() {
    let mut conn = setup();
    let cfg = UssdConfig::default();
    add_subscriber(&conn, "+221771112233", "1234", 10_000);
    add_subscriber(&conn, "+221771234567", "9999", 0);

    let r = turn(&mut conn, &cfg, "S1", "+221771112233", "");
    assert!(!r.end);
    assert!(r.text.contains("1."));

    let r = turn(&mut conn, &cfg, "S1", "+221771112233", "3");
    assert!(!r.end, "transfer asks for PIN first");

    let r = turn(&mut conn, &cfg, "S1", "+221771112233", "3*1234");
    assert!(!r.end, "valid PIN prompts for recipient");

    let r = turn(&mut conn, &cfg, "S1", "+221771112233", "3*1234*771234567");
    assert!(!r.end, "recipient prompts for amount");

    let r = turn(&mut conn, &cfg, "S1", "+221771112233", "3*1234*771234567*500");
    assert!(!r.end, "amount prompts for confirmation");
    assert!(r.text.contains("500"));

    let r = turn(&mut conn, &cfg, "S1", "+221771112233", "3*1234*771234567*500*1");
    assert!(r.end, "confirmation is terminal");
    assert!(r.text.contains("Ref:"), "localized success text: {}", r.text);

    assert_eq!(balance_of(&conn, "+221771112233"), 9_500);
    assert_eq!(balance_of(&conn, "+221771234567"), 500);
    assert!(!session_exists(&conn, "S1"), "terminal turn deletes the session");

    let (kind, amount, status): (String, i64, String) = conn
        .query_row(
            "SELECT kind, amount_minor, status FROM ussd_transactions WHERE phone = '+221771112233'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap();
    assert_eq!(kind, "transfer");
    assert_eq!(amount, 500);
    assert_eq!(status, "completed");

    let metrics: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM metrics WHERE name = 'ussd_session'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(metrics, 1);
}

#[test]
fn declined_confirmation_returns_to_menu() {
    let mut conn = setup();
    let cfg = UssdConfig::default();
    add_subscriber(&conn, "+221771112233", "1234", 10_000);

    turn(&mut conn, &cfg, "S2", "+221771112233", "");
    turn(&mut conn, &cfg, "S2", "+221771112233", "3");
    turn(&mut conn, &cfg, "S2", "+221771112233", "3*1234");
    turn(&mut conn, &cfg, "S2", "+221771112233", "3*1234*771234567");
    turn(&mut conn, &cfg, "S2", "+221771112233", "3*1234*771234567*500");
    let r = turn(&mut conn, &cfg, "S2", "+221771112233", "3*1234*771234567*500*2");

    assert!(!r.end, "declined confirmation reprints the menu");
    assert_eq!(balance_of(&conn, "+221771112233"), 10_000);
}

#[test]
fn transfer_with_insufficient_funds_is_terminal() {
    let mut conn = setup();
    let cfg = UssdConfig::default();
    add_subscriber(&conn, "+221771112233", "1234", 100);

    turn(&mut conn, &cfg, "S3", "+221771112233", "");
    turn(&mut conn, &cfg, "S3", "+221771112233", "3");
    turn(&mut conn, &cfg, "S3", "+221771112233", "3*1234");
    turn(&mut conn, &cfg, "S3", "+221771112233", "3*1234*771234567");
    turn(&mut conn, &cfg, "S3", "+221771112233", "3*1234*771234567*500");
    let r = turn(&mut conn, &cfg, "S3", "+221771112233", "3*1234*771234567*500*1");

    assert!(r.end);
    assert!(r.text.contains("insuffisant"), "got: {}", r.text);
    assert_eq!(balance_of(&conn, "+221771112233"), 100);
}

// ── PIN lockout ─────────────────────────────────────────────────────

#[test]
fn three_wrong_pins_lock_the_account() {
    let mut conn = setup();
    let cfg = UssdConfig::default();
    add_subscriber(&conn, "+221771112233", "1234", 5_000);

    turn(&mut conn, &cfg, "L1", "+221771112233", "");
    turn(&mut conn, &cfg, "L1", "+221771112233", "1");

    let r = turn(&mut conn, &cfg, "L1", "+221771112233", "1*0000");
    assert!(!r.end);
    assert!(r.text.contains('2'), "two attempts left: {}", r.text);

    let r = turn(&mut conn, &cfg, "L1", "+221771112233", "1*0000*0000");
    assert!(!r.end);

    let before = chrono::Utc::now().timestamp();
    let r = turn(&mut conn, &cfg, "L1", "+221771112233", "1*0000*0000*0000");
    assert!(r.end, "third failure is terminal");

    let locked_until: i64 = conn
        .query_row(
            "SELECT pin_locked_until FROM ussd_sessions WHERE session_id = 'L1'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    let lock = locked_until - before;
    assert!((29 * 60..=31 * 60).contains(&lock), "lock window was {lock}s");

    // further turns bounce straight off the lock
    let r = turn(&mut conn, &cfg, "L1", "+221771112233", "");
    assert!(r.end);
}

#[test]
fn correct_pin_resets_the_attempt_counter() {
    let mut conn = setup();
    let cfg = UssdConfig::default();
    add_subscriber(&conn, "+221771112233", "1234", 5_000);

    turn(&mut conn, &cfg, "L2", "+221771112233", "");
    turn(&mut conn, &cfg, "L2", "+221771112233", "1");
    turn(&mut conn, &cfg, "L2", "+221771112233", "1*0000");
    let r = turn(&mut conn, &cfg, "L2", "+221771112233", "1*0000*1234");
    assert!(r.end, "balance is terminal");
    assert!(r.text.contains("5000"), "balance in reply: {}", r.text);
}

// ── Session expiry ──────────────────────────────────────────────────

#[test]
fn stale_session_restarts_at_menu() {
    let mut conn = setup();
    let cfg = UssdConfig::default();
    add_subscriber(&conn, "+221771112233", "1234", 5_000);

    turn(&mut conn, &cfg, "E1", "+221771112233", "");
    turn(&mut conn, &cfg, "E1", "+221771112233", "3");

    // age the session past the timeout
    conn.execute(
        "UPDATE ussd_sessions SET last_interaction_at = last_interaction_at - 300
         WHERE session_id = 'E1'",
        [],
    )
    .unwrap();

    let r = turn(&mut conn, &cfg, "E1", "+221771112233", "1");
    assert!(!r.end);
    let state: String = conn
        .query_row(
            "SELECT state FROM ussd_sessions WHERE session_id = 'E1'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(state, "awaiting_pin", "fresh session dispatched the input");
}

// ── Other flows ─────────────────────────────────────────────────────

#[test]
fn recharge_credits_balance() {
    let mut conn = setup();
    let cfg = UssdConfig::default();
    add_subscriber(&conn, "+221771112233", "1234", 1_000);

    turn(&mut conn, &cfg, "R1", "+221771112233", "");
    turn(&mut conn, &cfg, "R1", "+221771112233", "2");
    let r = turn(&mut conn, &cfg, "R1", "+221771112233", "2*2500");
    assert!(r.end);
    assert_eq!(balance_of(&conn, "+221771112233"), 3_500);
}

#[test]
fn withdrawal_over_balance_is_refused() {
    let mut conn = setup();
    let cfg = UssdConfig::default();
    add_subscriber(&conn, "+221771112233", "1234", 1_000);

    turn(&mut conn, &cfg, "W1", "+221771112233", "");
    turn(&mut conn, &cfg, "W1", "+221771112233", "4");
    turn(&mut conn, &cfg, "W1", "+221771112233", "4*1234");
    let r = turn(&mut conn, &cfg, "W1", "+221771112233", "4*1234*5000");
    assert!(r.end);
    assert!(r.text.contains("insuffisant"));
    assert_eq!(balance_of(&conn, "+221771112233"), 1_000);
}

#[test]
fn pin_reset_updates_the_hash() {
    let mut conn = setup();
    let cfg = UssdConfig::default();
    add_subscriber(&conn, "+221771112233", "1234", 0);

    turn(&mut conn, &cfg, "P1", "+221771112233", "");
    turn(&mut conn, &cfg, "P1", "+221771112233", "99");
    turn(&mut conn, &cfg, "P1", "+221771112233", "99*5678");
    let r = turn(&mut conn, &cfg, "P1", "+221771112233", "99*5678*5678");
    assert!(r.end);

    let hash: String = conn
        .query_row(
            "SELECT pin_hash FROM subscribers WHERE phone = '+221771112233'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert!(bcrypt::verify("5678", &hash).unwrap());
    assert!(!bcrypt::verify("1234", &hash).unwrap());
}

#[test]
fn pin_reset_mismatch_cancels() {
    let mut conn = setup();
    let cfg = UssdConfig::default();
    add_subscriber(&conn, "+221771112233", "1234", 0);

    turn(&mut conn, &cfg, "P2", "+221771112233", "");
    turn(&mut conn, &cfg, "P2", "+221771112233", "99");
    turn(&mut conn, &cfg, "P2", "+221771112233", "99*5678");
    let r = turn(&mut conn, &cfg, "P2", "+221771112233", "99*5678*8765");
    assert!(r.end);

    let hash: String = conn
        .query_row(
            "SELECT pin_hash FROM subscribers WHERE phone = '+221771112233'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert!(bcrypt::verify("1234", &hash).unwrap(), "old PIN still valid");
}

#[test]
fn invalid_msisdn_is_rejected_up_front() {
    let mut conn = setup();
    let cfg = UssdConfig::default();
    let r = turn(&mut conn, &cfg, "X1", "12345", "");
    assert!(r.end);
}
