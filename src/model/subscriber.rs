use serde::{Deserialize, Serialize};

use super::text_enum;

/// A feature-phone wallet holder. Balance is kept in minor currency units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub phone: String,
    pub country: String,
    #[serde(skip_serializing)]
    pub pin_hash: String,
    pub balance_minor: i64,
    pub language: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Transfer,
    Recharge,
    Withdrawal,
}

text_enum!(TxKind {
    Transfer => "transfer",
    Recharge => "recharge",
    Withdrawal => "withdrawal",
});

/// Money movement recorded by a terminal USSD turn. Written best-effort
/// after the reply is committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UssdTransaction {
    pub id: String,
    pub phone: String,
    pub kind: TxKind,
    pub amount_minor: i64,
    pub counterparty: Option<String>,
    /// Receipt code shown to the subscriber on the terminal reply.
    pub reference: Option<String>,
    pub status: String,
    pub created_at: i64,
}
