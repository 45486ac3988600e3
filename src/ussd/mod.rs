pub mod menu;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::warn;

use crate::model::session::{MenuState, NextAction, Scratch, UssdReply, UssdSession};
use crate::model::subscriber::{Subscriber, TxKind};
use crate::store::now_ts;

const CURRENCY: &str = "XOF";

#[derive(Debug, Clone)]
pub struct UssdConfig {
    pub session_timeout_secs: i64,
    pub max_pin_attempts: u32,
    pub pin_lock_secs: i64,
}

impl Default for UssdConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: 120,
            max_pin_attempts: 3,
            pin_lock_secs: 30 * 60,
        }
    }
}

/// One gateway turn, as received on the wire.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct GatewayRequest {
    pub session_id: String,
    pub msisdn: String,
    #[serde(default)]
    pub text: String,
    pub country: Option<String>,
}

/// Money movement to record once the turn's transaction has committed.
struct TxRecord {
    phone: String,
    kind: TxKind,
    amount_minor: i64,
    counterparty: Option<String>,
    reference: String,
    count_session_metric: bool,
}

struct TurnOutcome {
    reply: UssdReply,
    record: Option<TxRecord>,
}

/// Normalize a Senegalese MSISDN: optional `+221` prefix, then exactly nine
/// digits. Returns the canonical `+221XXXXXXXXX` form.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix("+221").unwrap_or(trimmed);
    if digits.len() == 9 && digits.bytes().all(|b| b.is_ascii_digit()) {
        Some(format!("+221{digits}"))
    } else {
        None
    }
}

fn is_pin_format(s: &str) -> bool {
    s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_amount(s: &str) -> Option<i64> {
    s.trim().parse::<i64>().ok().filter(|a| *a > 0)
}

/// The gateway accumulates input as `*`-separated segments; only the last
/// segment is this turn's answer.
fn salient_segment(text: &str) -> &str {
    text.rsplit('*').next().unwrap_or("").trim()
}

/// Advance one USSD dialogue by one turn. State is rehydrated from the store
/// each turn, so a retried gateway request is safe: the store is the only
/// memory this engine has.
pub fn handle_turn(
    conn: &mut Connection,
    cfg: &UssdConfig,
    req: &GatewayRequest,
) -> Result<UssdReply> {
    let country = req.country.as_deref().unwrap_or("SN").to_string();

    let Some(phone) = normalize_phone(&req.msisdn) else {
        let text = menu::render(conn, &country, "fr", "invalid_phone", &[]);
        return Ok(UssdReply::end(text));
    };

    let language = subscriber_language(conn, &phone)?.unwrap_or_else(|| "fr".to_string());
    let input = salient_segment(&req.text).to_string();
    let now = now_ts();

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("beginning ussd turn transaction")?;

    let mut session = load_session(&tx, &req.session_id)?;

    // An active PIN lock outlives the dialogue: the row is kept solely to
    // carry `pin_locked_until`, and every turn against it ends immediately.
    if let Some(s) = &session {
        if let Some(locked_until) = s.pin_locked_until {
            if locked_until > now {
                let minutes = ((locked_until - now) + 59) / 60;
                let text = menu::render(
                    &tx,
                    &country,
                    &language,
                    "pin_locked",
                    &[("minutes", minutes.to_string())],
                );
                tx.commit()?;
                return Ok(UssdReply::end(text));
            }
        }
    }

    if let Some(s) = &session {
        let lock_expired = s.pin_locked_until.is_some_and(|t| t <= now);
        if lock_expired || now - s.last_interaction_at > cfg.session_timeout_secs {
            delete_session(&tx, &s.session_id)?;
            session = None;
        }
    }

    let mut session = match session {
        Some(s) => s,
        None => {
            let fresh = UssdSession {
                session_id: req.session_id.clone(),
                phone: phone.clone(),
                country: country.clone(),
                state: MenuState::Menu,
                scratch: Scratch::Empty,
                pin_attempts: 0,
                pin_locked_until: None,
                last_interaction_at: now,
            };
            insert_session(&tx, &fresh)?;
            fresh
        }
    };

    let outcome = step(&tx, cfg, &mut session, &input, &country, &language, now)?;

    tx.commit().context("committing ussd turn")?;

    // Best-effort bookkeeping after the reply is durable. A failure here
    // must not fail the turn.
    if let Some(record) = outcome.record {
        if let Err(err) = record_transaction(conn, &record) {
            warn!(phone = %record.phone, error = %format!("{err:#}"), "ussd transaction log failed");
        }
        if record.count_session_metric {
            if let Err(err) = record_metric(conn, "ussd_session") {
                warn!(error = %format!("{err:#}"), "ussd metric recording failed");
            }
        }
    }

    Ok(outcome.reply)
}

#[allow(clippy::too_many_arguments)]
fn step(
    tx: &Connection,
    cfg: &UssdConfig,
    s: &mut UssdSession,
    input: &str,
    country: &str,
    language: &str,
    now: i64,
) -> Result<TurnOutcome> {
    let t = |key: &str, vars: &[(&str, String)]| menu::render(tx, country, language, key, vars);

    let cont = |reply: String| TurnOutcome { reply: UssdReply::cont(reply), record: None };
    let end = |reply: String| TurnOutcome { reply: UssdReply::end(reply), record: None };

    match s.state.clone() {
        MenuState::Menu => {
            let (state, scratch, key) = match input {
                "1" => (
                    MenuState::AwaitingPin,
                    Scratch::AwaitingPin { next_action: NextAction::Balance },
                    "enter_pin",
                ),
                "2" => (MenuState::RechargeAmount, Scratch::Empty, "enter_amount"),
                "3" => (
                    MenuState::AwaitingPin,
                    Scratch::AwaitingPin { next_action: NextAction::Transfer },
                    "enter_pin",
                ),
                "4" => (
                    MenuState::AwaitingPin,
                    Scratch::AwaitingPin { next_action: NextAction::Withdrawal },
                    "enter_pin",
                ),
                "99" => (MenuState::PinResetNew, Scratch::Empty, "pin_reset_new"),
                _ => (MenuState::Menu, Scratch::Empty, "main_menu"),
            };
            s.state = state;
            s.scratch = scratch;
            save_session(tx, s, now)?;
            Ok(cont(t(key, &[])))
        }

        MenuState::AwaitingPin => {
            let next_action = match &s.scratch {
                Scratch::AwaitingPin { next_action } => *next_action,
                _ => {
                    s.state = MenuState::Menu;
                    s.scratch = Scratch::Empty;
                    save_session(tx, s, now)?;
                    return Ok(cont(t("main_menu", &[])));
                }
            };

            let Some(sub) = load_subscriber(tx, &s.phone)? else {
                delete_session(tx, &s.session_id)?;
                return Ok(end(t("unknown_subscriber", &[])));
            };

            if !is_pin_format(input) {
                save_session(tx, s, now)?;
                return Ok(cont(t("enter_pin", &[])));
            }

            if bcrypt::verify(input, &sub.pin_hash).unwrap_or(false) {
                s.pin_attempts = 0;
                match next_action {
                    NextAction::Balance => {
                        delete_session(tx, &s.session_id)?;
                        Ok(end(t(
                            "balance_result",
                            &[
                                ("balance", sub.balance_minor.to_string()),
                                ("currency", CURRENCY.to_string()),
                            ],
                        )))
                    }
                    NextAction::Transfer => {
                        s.state = MenuState::TransferRecipient;
                        s.scratch = Scratch::Transfer { recipient: None, amount_minor: None };
                        save_session(tx, s, now)?;
                        Ok(cont(t("enter_recipient", &[])))
                    }
                    NextAction::Withdrawal => {
                        s.state = MenuState::WithdrawalAmount;
                        s.scratch = Scratch::Empty;
                        save_session(tx, s, now)?;
                        Ok(cont(t("enter_amount", &[])))
                    }
                }
            } else {
                s.pin_attempts += 1;
                if s.pin_attempts >= cfg.max_pin_attempts {
                    s.pin_locked_until = Some(now + cfg.pin_lock_secs);
                    save_session(tx, s, now)?;
                    let minutes = (cfg.pin_lock_secs + 59) / 60;
                    Ok(end(t("pin_locked", &[("minutes", minutes.to_string())])))
                } else {
                    save_session(tx, s, now)?;
                    let remaining = cfg.max_pin_attempts - s.pin_attempts;
                    Ok(cont(t("invalid_pin_retry", &[("remaining", remaining.to_string())])))
                }
            }
        }

        MenuState::TransferRecipient => match normalize_phone(input) {
            Some(recipient) => {
                s.state = MenuState::TransferAmount;
                s.scratch = Scratch::Transfer { recipient: Some(recipient), amount_minor: None };
                save_session(tx, s, now)?;
                Ok(cont(t("enter_amount", &[])))
            }
            None => {
                save_session(tx, s, now)?;
                Ok(cont(t("invalid_phone", &[])))
            }
        },

        MenuState::TransferAmount => {
            let recipient = match &s.scratch {
                Scratch::Transfer { recipient: Some(r), .. } => r.clone(),
                _ => {
                    s.state = MenuState::Menu;
                    s.scratch = Scratch::Empty;
                    save_session(tx, s, now)?;
                    return Ok(cont(t("main_menu", &[])));
                }
            };
            match parse_amount(input) {
                Some(amount) => {
                    s.state = MenuState::TransferConfirm;
                    s.scratch = Scratch::Transfer {
                        recipient: Some(recipient.clone()),
                        amount_minor: Some(amount),
                    };
                    save_session(tx, s, now)?;
                    Ok(cont(t(
                        "confirm_transfer",
                        &[
                            ("amount", amount.to_string()),
                            ("currency", CURRENCY.to_string()),
                            ("recipient", recipient),
                        ],
                    )))
                }
                None => {
                    save_session(tx, s, now)?;
                    Ok(cont(t("invalid_amount", &[])))
                }
            }
        }

        MenuState::TransferConfirm => {
            if input != "1" {
                s.state = MenuState::Menu;
                s.scratch = Scratch::Empty;
                save_session(tx, s, now)?;
                return Ok(cont(t("main_menu", &[])));
            }

            let (recipient, amount) = match &s.scratch {
                Scratch::Transfer { recipient: Some(r), amount_minor: Some(a) } => (r.clone(), *a),
                _ => {
                    s.state = MenuState::Menu;
                    s.scratch = Scratch::Empty;
                    save_session(tx, s, now)?;
                    return Ok(cont(t("main_menu", &[])));
                }
            };

            let Some(sub) = load_subscriber(tx, &s.phone)? else {
                delete_session(tx, &s.session_id)?;
                return Ok(end(t("unknown_subscriber", &[])));
            };
            if sub.balance_minor < amount {
                delete_session(tx, &s.session_id)?;
                return Ok(end(t("insufficient_funds", &[])));
            }

            tx.execute(
                "UPDATE subscribers SET balance_minor = balance_minor - ?1 WHERE phone = ?2",
                params![amount, s.phone],
            )?;
            // Off-net recipients are not subscribers; the credit is a no-op
            // for them and settlement happens downstream.
            tx.execute(
                "UPDATE subscribers SET balance_minor = balance_minor + ?1 WHERE phone = ?2",
                params![amount, recipient],
            )?;
            delete_session(tx, &s.session_id)?;

            let reference = short_reference();
            Ok(TurnOutcome {
                reply: UssdReply::end(t("success_message", &[("reference", reference.clone())])),
                record: Some(TxRecord {
                    phone: s.phone.clone(),
                    kind: TxKind::Transfer,
                    amount_minor: amount,
                    counterparty: Some(recipient),
                    reference,
                    count_session_metric: true,
                }),
            })
        }

        MenuState::RechargeAmount => match parse_amount(input) {
            Some(amount) => {
                if load_subscriber(tx, &s.phone)?.is_none() {
                    delete_session(tx, &s.session_id)?;
                    return Ok(end(t("unknown_subscriber", &[])));
                }
                tx.execute(
                    "UPDATE subscribers SET balance_minor = balance_minor + ?1 WHERE phone = ?2",
                    params![amount, s.phone],
                )?;
                delete_session(tx, &s.session_id)?;
                let reference = short_reference();
                Ok(TurnOutcome {
                    reply: UssdReply::end(t("success_message", &[("reference", reference.clone())])),
                    record: Some(TxRecord {
                        phone: s.phone.clone(),
                        kind: TxKind::Recharge,
                        amount_minor: amount,
                        counterparty: None,
                        reference,
                        count_session_metric: false,
                    }),
                })
            }
            None => {
                save_session(tx, s, now)?;
                Ok(cont(t("invalid_amount", &[])))
            }
        },

        MenuState::WithdrawalAmount => match parse_amount(input) {
            Some(amount) => {
                let Some(sub) = load_subscriber(tx, &s.phone)? else {
                    delete_session(tx, &s.session_id)?;
                    return Ok(end(t("unknown_subscriber", &[])));
                };
                if amount > sub.balance_minor {
                    delete_session(tx, &s.session_id)?;
                    return Ok(end(t("insufficient_funds", &[])));
                }
                tx.execute(
                    "UPDATE subscribers SET balance_minor = balance_minor - ?1 WHERE phone = ?2",
                    params![amount, s.phone],
                )?;
                delete_session(tx, &s.session_id)?;
                let reference = short_reference();
                Ok(TurnOutcome {
                    reply: UssdReply::end(t("success_message", &[("reference", reference.clone())])),
                    record: Some(TxRecord {
                        phone: s.phone.clone(),
                        kind: TxKind::Withdrawal,
                        amount_minor: amount,
                        counterparty: None,
                        reference,
                        count_session_metric: false,
                    }),
                })
            }
            None => {
                save_session(tx, s, now)?;
                Ok(cont(t("invalid_amount", &[])))
            }
        },

        MenuState::PinResetNew => {
            if is_pin_format(input) {
                s.state = MenuState::PinResetConfirm;
                s.scratch = Scratch::PinReset { new_pin: Some(input.to_string()) };
                save_session(tx, s, now)?;
                Ok(cont(t("pin_reset_confirm", &[])))
            } else {
                save_session(tx, s, now)?;
                Ok(cont(t("pin_reset_new", &[])))
            }
        }

        MenuState::PinResetConfirm => {
            let matches = matches!(&s.scratch, Scratch::PinReset { new_pin: Some(p) } if p == input);
            delete_session(tx, &s.session_id)?;
            if matches {
                let hash = bcrypt::hash(input, bcrypt::DEFAULT_COST)
                    .context("hashing new pin")?;
                tx.execute(
                    "UPDATE subscribers SET pin_hash = ?1 WHERE phone = ?2",
                    params![hash, s.phone],
                )?;
                Ok(end(t("pin_reset_done", &[])))
            } else {
                Ok(end(t("pin_reset_cancelled", &[])))
            }
        }
    }
}

fn short_reference() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_uppercase()
}

// ── Row access ──────────────────────────────────────────────────────

fn load_session(conn: &Connection, session_id: &str) -> Result<Option<UssdSession>> {
    let row = conn
        .query_row(
            "SELECT session_id, phone, country, state, scratch, pin_attempts,
                    pin_locked_until, last_interaction_at
             FROM ussd_sessions WHERE session_id = ?1",
            params![session_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, MenuState>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            },
        )
        .optional()?;

    Ok(row.map(
        |(session_id, phone, country, state, scratch, pin_attempts, locked, last)| UssdSession {
            session_id,
            phone,
            country,
            state,
            scratch: serde_json::from_str(&scratch).unwrap_or_default(),
            pin_attempts,
            pin_locked_until: locked,
            last_interaction_at: last,
        },
    ))
}

fn insert_session(conn: &Connection, s: &UssdSession) -> Result<()> {
    conn.execute(
        "INSERT INTO ussd_sessions
             (session_id, phone, country, state, scratch, pin_attempts,
              pin_locked_until, last_interaction_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            s.session_id,
            s.phone,
            s.country,
            s.state,
            serde_json::to_string(&s.scratch)?,
            s.pin_attempts,
            s.pin_locked_until,
            s.last_interaction_at,
        ],
    )?;
    Ok(())
}

fn save_session(conn: &Connection, s: &UssdSession, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE ussd_sessions
         SET state = ?2, scratch = ?3, pin_attempts = ?4, pin_locked_until = ?5,
             last_interaction_at = ?6
         WHERE session_id = ?1",
        params![
            s.session_id,
            s.state,
            serde_json::to_string(&s.scratch)?,
            s.pin_attempts,
            s.pin_locked_until,
            now,
        ],
    )?;
    Ok(())
}

fn delete_session(conn: &Connection, session_id: &str) -> Result<()> {
    conn.execute("DELETE FROM ussd_sessions WHERE session_id = ?1", params![session_id])?;
    Ok(())
}

fn load_subscriber(conn: &Connection, phone: &str) -> Result<Option<Subscriber>> {
    let sub = conn
        .query_row(
            "SELECT phone, country, pin_hash, balance_minor, language
             FROM subscribers WHERE phone = ?1",
            params![phone],
            |row| {
                Ok(Subscriber {
                    phone: row.get(0)?,
                    country: row.get(1)?,
                    pin_hash: row.get(2)?,
                    balance_minor: row.get(3)?,
                    language: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(sub)
}

fn subscriber_language(conn: &Connection, phone: &str) -> Result<Option<String>> {
    let lang = conn
        .query_row(
            "SELECT language FROM subscribers WHERE phone = ?1",
            params![phone],
            |row| row.get(0),
        )
        .optional()?;
    Ok(lang)
}

fn record_transaction(conn: &Connection, record: &TxRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO ussd_transactions (id, phone, kind, amount_minor, counterparty, reference, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'completed')",
        params![
            uuid::Uuid::new_v4().to_string(),
            record.phone,
            record.kind,
            record.amount_minor,
            record.counterparty,
            record.reference,
        ],
    )?;
    Ok(())
}

fn record_metric(conn: &Connection, name: &str) -> Result<()> {
    conn.execute("INSERT INTO metrics (name, value) VALUES (?1, 1)", params![name])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("771234567").as_deref(), Some("+221771234567"));
        assert_eq!(normalize_phone("+221771234567").as_deref(), Some("+221771234567"));
        assert_eq!(normalize_phone("77123456").as_deref(), None);
        assert_eq!(normalize_phone("+33771234567"), None);
        assert_eq!(normalize_phone("77123456a"), None);
    }

    #[test]
    fn salient_segment_takes_last() {
        assert_eq!(salient_segment(""), "");
        assert_eq!(salient_segment("3"), "3");
        assert_eq!(salient_segment("3*1234*771234567"), "771234567");
    }

    #[test]
    fn pin_format_is_four_digits() {
        assert!(is_pin_format("1234"));
        assert!(!is_pin_format("123"));
        assert!(!is_pin_format("12345"));
        assert!(!is_pin_format("12a4"));
    }
}
