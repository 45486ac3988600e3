use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tokio::sync::Mutex;

pub type Db = Arc<Mutex<Connection>>;

/// Current wall clock, unix seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current wall clock, unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn open(path: &std::path::Path) -> Result<Db> {
    std::fs::create_dir_all(path.parent().unwrap_or(path))
        .context("creating db directory")?;

    let conn = Connection::open(path)
        .with_context(|| format!("opening sqlite at {}", path.display()))?;

    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
    migrate(&conn)?;
    seed(&conn)?;

    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory store with the full schema, for tests and the harness CLI.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    migrate(&conn)?;
    seed(&conn)?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS config (
            key    TEXT PRIMARY KEY,
            value  TEXT NOT NULL
        );

        -- ── USSD ───────────────────────────────────────────────────────

        CREATE TABLE IF NOT EXISTS subscribers (
            phone          TEXT PRIMARY KEY,
            country        TEXT NOT NULL DEFAULT 'SN',
            pin_hash       TEXT NOT NULL,
            balance_minor  INTEGER NOT NULL DEFAULT 0,
            language       TEXT NOT NULL DEFAULT 'fr'
        );

        CREATE TABLE IF NOT EXISTS ussd_sessions (
            session_id           TEXT PRIMARY KEY,
            phone                TEXT NOT NULL,
            country              TEXT NOT NULL DEFAULT 'SN',
            state                TEXT NOT NULL,
            scratch              TEXT NOT NULL DEFAULT '{\"kind\":\"empty\"}',
            pin_attempts         INTEGER NOT NULL DEFAULT 0,
            pin_locked_until     INTEGER,
            last_interaction_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ussd_transactions (
            id            TEXT PRIMARY KEY,
            phone         TEXT NOT NULL,
            kind          TEXT NOT NULL,
            amount_minor  INTEGER NOT NULL,
            counterparty  TEXT,
            reference     TEXT,
            status        TEXT NOT NULL,
            created_at    INTEGER NOT NULL DEFAULT (unixepoch())
        );

        CREATE TABLE IF NOT EXISTS metrics (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            name         TEXT NOT NULL,
            value        REAL NOT NULL DEFAULT 1,
            recorded_at  INTEGER NOT NULL DEFAULT (unixepoch())
        );

        CREATE TABLE IF NOT EXISTS menu_texts (
            country   TEXT NOT NULL,
            language  TEXT NOT NULL,
            menu_key  TEXT NOT NULL,
            text      TEXT NOT NULL,
            PRIMARY KEY (country, language, menu_key)
        );

        -- ── Payouts ────────────────────────────────────────────────────

        CREATE TABLE IF NOT EXISTS sellers (
            id                   TEXT PRIMARY KEY,
            marketplace          TEXT NOT NULL,
            seller_ref           TEXT NOT NULL,
            kyc_status           TEXT NOT NULL DEFAULT 'pending',
            advance_limit_minor  INTEGER NOT NULL DEFAULT 0,
            UNIQUE (marketplace, seller_ref)
        );

        CREATE TABLE IF NOT EXISTS seller_holds (
            id          TEXT PRIMARY KEY,
            seller_ref  TEXT NOT NULL,
            status      TEXT NOT NULL DEFAULT 'active',
            reason      TEXT,
            created_at  INTEGER NOT NULL DEFAULT (unixepoch())
        );

        CREATE TABLE IF NOT EXISTS payout_parents (
            id                      TEXT PRIMARY KEY,
            external_id             TEXT NOT NULL UNIQUE,
            origin                  TEXT NOT NULL,
            seller_ref              TEXT NOT NULL,
            currency                TEXT NOT NULL,
            requested_amount_minor  INTEGER NOT NULL,
            priority                TEXT NOT NULL DEFAULT 'normal',
            reference_code          TEXT NOT NULL UNIQUE,
            status                  TEXT NOT NULL DEFAULT 'pending',
            metadata                TEXT NOT NULL DEFAULT '{}',
            created_at              INTEGER NOT NULL DEFAULT (unixepoch())
        );

        CREATE TABLE IF NOT EXISTS payout_slices (
            id                   TEXT PRIMARY KEY,
            parent_id            TEXT NOT NULL REFERENCES payout_parents(id),
            treasury_account_id  TEXT NOT NULL,
            amount_minor         INTEGER NOT NULL,
            order_index          INTEGER NOT NULL,
            dispatched_at        INTEGER
        );

        CREATE TABLE IF NOT EXISTS sira_recommendations (
            id                   TEXT PRIMARY KEY,
            external_id          TEXT,
            seller_ref           TEXT NOT NULL,
            priority_score       INTEGER NOT NULL,
            risk_score           INTEGER NOT NULL,
            multi_bank           INTEGER NOT NULL DEFAULT 0,
            recommended_action   TEXT NOT NULL,
            slices               TEXT,
            treasury_account_id  TEXT,
            reasons              TEXT NOT NULL DEFAULT '[]',
            model_version        TEXT NOT NULL,
            created_at           INTEGER NOT NULL DEFAULT (unixepoch())
        );

        CREATE TABLE IF NOT EXISTS seller_escrows (
            id            TEXT PRIMARY KEY,
            external_id   TEXT,
            seller_ref    TEXT NOT NULL,
            amount_minor  INTEGER NOT NULL,
            currency      TEXT NOT NULL,
            reason        TEXT NOT NULL,
            risk_score    INTEGER NOT NULL,
            created_at    INTEGER NOT NULL DEFAULT (unixepoch())
        );

        CREATE TABLE IF NOT EXISTS advances (
            id                  TEXT PRIMARY KEY,
            external_id         TEXT NOT NULL UNIQUE,
            seller_ref          TEXT NOT NULL,
            amount_minor        INTEGER NOT NULL,
            currency            TEXT NOT NULL,
            fee_minor           INTEGER NOT NULL,
            repayment_schedule  TEXT NOT NULL DEFAULT 'future_sales',
            status              TEXT NOT NULL DEFAULT 'requested',
            created_at          INTEGER NOT NULL DEFAULT (unixepoch())
        );

        -- `seq` carries the slice table's rowid so consumers can order by
        -- insertion without relying on id lexicography.
        CREATE VIEW IF NOT EXISTS active_payout_slices AS
            SELECT s.rowid AS seq, s.id, s.parent_id, s.treasury_account_id,
                   s.amount_minor, s.order_index, s.dispatched_at
            FROM payout_slices s
            JOIN payout_parents p ON p.id = s.parent_id
            WHERE s.dispatched_at IS NULL
              AND p.status IN ('pending', 'processing');

        -- ── Rollouts ───────────────────────────────────────────────────

        CREATE TABLE IF NOT EXISTS rollouts (
            id                TEXT PRIMARY KEY,
            plugin_name       TEXT NOT NULL,
            version           TEXT NOT NULL,
            percentage        REAL NOT NULL,
            strategy          TEXT NOT NULL DEFAULT 'random',
            target_countries  TEXT,
            target_tiers      TEXT,
            error_threshold   REAL NOT NULL DEFAULT 0.05,
            status            TEXT NOT NULL DEFAULT 'active',
            metadata          TEXT NOT NULL DEFAULT '{}',
            created_at        INTEGER NOT NULL DEFAULT (unixepoch())
        );

        CREATE TABLE IF NOT EXISTS rollback_attempts (
            id             TEXT PRIMARY KEY,
            merchant       TEXT NOT NULL,
            plugin         TEXT NOT NULL,
            from_version   TEXT NOT NULL,
            to_version     TEXT NOT NULL,
            trigger_kind   TEXT NOT NULL DEFAULT 'manual',
            reason         TEXT,
            started_at     INTEGER NOT NULL DEFAULT (unixepoch()),
            completed_at   INTEGER,
            success        INTEGER,
            error_message  TEXT,
            duration_ms    INTEGER,
            files_restored INTEGER,
            db_restored    INTEGER
        );

        CREATE TABLE IF NOT EXISTS plugin_backups (
            id           TEXT PRIMARY KEY,
            merchant     TEXT NOT NULL,
            plugin       TEXT NOT NULL,
            version      TEXT NOT NULL,
            path         TEXT NOT NULL,
            db_snapshot  TEXT,
            size_bytes   INTEGER NOT NULL DEFAULT 0,
            status       TEXT NOT NULL DEFAULT 'completed',
            expires_at   INTEGER NOT NULL,
            metadata     TEXT NOT NULL DEFAULT '{}',
            created_at   INTEGER NOT NULL DEFAULT (unixepoch())
        );

        CREATE TABLE IF NOT EXISTS plugin_upgrade_logs (
            id               TEXT PRIMARY KEY,
            merchant         TEXT NOT NULL,
            plugin           TEXT NOT NULL,
            version          TEXT NOT NULL,
            status           TEXT NOT NULL,
            rollback_status  TEXT,
            created_at       INTEGER NOT NULL DEFAULT (unixepoch())
        );

        -- ── Approvals ──────────────────────────────────────────────────

        CREATE TABLE IF NOT EXISTS approval_policies (
            policy_id            TEXT PRIMARY KEY,
            required_signatures  INTEGER NOT NULL,
            allowed_roles        TEXT NOT NULL,
            ttl_seconds          INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS approval_requests (
            id                  TEXT PRIMARY KEY,
            request_type        TEXT NOT NULL,
            reference_id        TEXT,
            policy_id           TEXT NOT NULL REFERENCES approval_policies(policy_id),
            required_threshold  INTEGER NOT NULL,
            requested_by        TEXT NOT NULL,
            status              TEXT NOT NULL DEFAULT 'open',
            expires_at          INTEGER NOT NULL,
            metadata            TEXT NOT NULL DEFAULT '{}',
            created_at          INTEGER NOT NULL DEFAULT (unixepoch())
        );

        CREATE TABLE IF NOT EXISTS approval_signatures (
            id          TEXT PRIMARY KEY,
            request_id  TEXT NOT NULL REFERENCES approval_requests(id),
            signer      TEXT NOT NULL,
            roles       TEXT NOT NULL DEFAULT '[]',
            signed_at   INTEGER NOT NULL DEFAULT (unixepoch()),
            comment     TEXT,
            UNIQUE (request_id, signer)
        );

        CREATE TABLE IF NOT EXISTS approval_audit (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id  TEXT NOT NULL,
            event       TEXT NOT NULL,
            actor       TEXT,
            detail      TEXT,
            created_at  INTEGER NOT NULL DEFAULT (unixepoch())
        );

        CREATE TABLE IF NOT EXISTS ops_actions (
            id           TEXT PRIMARY KEY,
            action_type  TEXT NOT NULL,
            status       TEXT NOT NULL DEFAULT 'pending_approval',
            payload      TEXT NOT NULL DEFAULT '{}',
            created_at   INTEGER NOT NULL DEFAULT (unixepoch())
        );

        -- ── Simulations ────────────────────────────────────────────────

        CREATE TABLE IF NOT EXISTS simulation_runs (
            id               TEXT PRIMARY KEY,
            seed             INTEGER NOT NULL,
            sdk_language     TEXT NOT NULL,
            scenario         TEXT NOT NULL DEFAULT '{}',
            patch_reference  TEXT,
            status           TEXT NOT NULL DEFAULT 'queued',
            container_id     TEXT,
            metrics          TEXT,
            artifact_key     TEXT,
            exit_code        INTEGER,
            error_message    TEXT,
            started_at       INTEGER,
            completed_at     INTEGER,
            created_at       INTEGER NOT NULL DEFAULT (unixepoch())
        );

        CREATE TABLE IF NOT EXISTS simulation_journal (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id      TEXT NOT NULL,
            event       TEXT NOT NULL,
            detail      TEXT,
            created_at  INTEGER NOT NULL DEFAULT (unixepoch())
        );

        CREATE TABLE IF NOT EXISTS sim_patches (
            reference      TEXT PRIMARY KEY,
            patch_code     TEXT NOT NULL,
            rollback_code  TEXT
        );

        CREATE TABLE IF NOT EXISTS anonymized_errors (
            id               TEXT PRIMARY KEY,
            run_id           TEXT NOT NULL,
            error_signature  TEXT NOT NULL,
            category         TEXT NOT NULL,
            sdk_language     TEXT NOT NULL,
            frequency        REAL NOT NULL,
            context_hash     TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

/// Reference data: approval policies and the USSD menu strings. Idempotent.
fn seed(conn: &Connection) -> Result<()> {
    let policies: &[(&str, u32, &str, i64)] = &[
        ("treasury_transfer", 2, r#"["pay_admin","fraud_ops","compliance"]"#, 86_400),
        ("seller_unblock", 2, r#"["pay_admin","fraud_ops","compliance"]"#, 43_200),
        ("manual_payout", 3, r#"["pay_admin","fraud_ops","compliance"]"#, 21_600),
    ];
    for (id, required, roles, ttl) in policies {
        conn.execute(
            "INSERT OR IGNORE INTO approval_policies
                 (policy_id, required_signatures, allowed_roles, ttl_seconds)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![id, required, roles, ttl],
        )?;
    }

    for (country, language, key, text) in default_menu_texts() {
        conn.execute(
            "INSERT OR IGNORE INTO menu_texts (country, language, menu_key, text)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![country, language, key, text],
        )?;
    }
    Ok(())
}

/// Signing secret for API tokens: generated once and persisted, unless the
/// deployment injects its own via config.
pub fn ensure_auth_secret(conn: &Connection) -> Result<String> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM config WHERE key = 'auth_secret'",
            [],
            |row| row.get(0),
        )
        .ok();

    if let Some(secret) = existing {
        return Ok(secret);
    }

    use rand::Rng;
    let bytes: [u8; 32] = rand::rng().random();
    let secret: String = bytes.iter().map(|b| format!("{b:02x}")).collect();

    conn.execute(
        "INSERT INTO config (key, value) VALUES ('auth_secret', ?1)",
        [&secret],
    )?;

    Ok(secret)
}

fn default_menu_texts() -> Vec<(&'static str, &'static str, &'static str, &'static str)> {
    vec![
        ("SN", "fr", "main_menu", "SunuPay\n1. Solde\n2. Recharge\n3. Transfert\n4. Retrait\n99. Changer PIN"),
        ("SN", "fr", "enter_pin", "Entrez votre code PIN"),
        ("SN", "fr", "invalid_pin_retry", "Code PIN incorrect. {remaining} essai(s) restant(s)"),
        ("SN", "fr", "pin_locked", "Trop de tentatives. Compte bloque pendant {minutes} minutes"),
        ("SN", "fr", "balance_result", "Votre solde est de {balance} {currency}"),
        ("SN", "fr", "enter_recipient", "Numero du beneficiaire"),
        ("SN", "fr", "enter_amount", "Montant"),
        ("SN", "fr", "confirm_transfer", "Transfert de {amount} {currency} au {recipient}\n1. Confirmer\n2. Annuler"),
        ("SN", "fr", "success_message", "Transaction reussie. Ref: {reference}"),
        ("SN", "fr", "cancelled", "Operation annulee"),
        ("SN", "fr", "insufficient_funds", "Solde insuffisant"),
        ("SN", "fr", "invalid_phone", "Numero invalide"),
        ("SN", "fr", "invalid_amount", "Montant invalide"),
        ("SN", "fr", "unknown_subscriber", "Numero non enregistre"),
        ("SN", "fr", "pin_reset_new", "Entrez un nouveau code PIN (4 chiffres)"),
        ("SN", "fr", "pin_reset_confirm", "Confirmez le nouveau code PIN"),
        ("SN", "fr", "pin_reset_done", "Code PIN mis a jour"),
        ("SN", "fr", "pin_reset_cancelled", "Les codes ne correspondent pas. Annule"),
        ("SN", "en", "main_menu", "SunuPay\n1. Balance\n2. Recharge\n3. Transfer\n4. Withdrawal\n99. Change PIN"),
        ("SN", "en", "enter_pin", "Enter your PIN"),
        ("SN", "en", "invalid_pin_retry", "Wrong PIN. {remaining} attempt(s) left"),
        ("SN", "en", "pin_locked", "Too many attempts. Account locked for {minutes} minutes"),
        ("SN", "en", "balance_result", "Your balance is {balance} {currency}"),
        ("SN", "en", "enter_recipient", "Recipient number"),
        ("SN", "en", "enter_amount", "Amount"),
        ("SN", "en", "confirm_transfer", "Transfer {amount} {currency} to {recipient}\n1. Confirm\n2. Cancel"),
        ("SN", "en", "success_message", "Transaction successful. Ref: {reference}"),
        ("SN", "en", "cancelled", "Operation cancelled"),
        ("SN", "en", "insufficient_funds", "Insufficient funds"),
        ("SN", "en", "invalid_phone", "Invalid number"),
        ("SN", "en", "invalid_amount", "Invalid amount"),
        ("SN", "en", "unknown_subscriber", "Number not registered"),
        ("SN", "en", "pin_reset_new", "Enter a new 4-digit PIN"),
        ("SN", "en", "pin_reset_confirm", "Confirm the new PIN"),
        ("SN", "en", "pin_reset_done", "PIN updated"),
        ("SN", "en", "pin_reset_cancelled", "PINs do not match. Cancelled"),
    ]
}
