use serde::{Deserialize, Serialize};

use super::text_enum;

/// Menu position of a USSD dialogue. One row per live gateway session;
/// the row is deleted on any terminal response or on expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MenuState {
    Menu,
    AwaitingPin,
    RechargeAmount,
    TransferRecipient,
    TransferAmount,
    TransferConfirm,
    WithdrawalAmount,
    PinResetNew,
    PinResetConfirm,
}

text_enum!(MenuState {
    Menu => "menu",
    AwaitingPin => "awaiting_pin",
    RechargeAmount => "recharge_amount",
    TransferRecipient => "transfer_recipient",
    TransferAmount => "transfer_amount",
    TransferConfirm => "transfer_confirm",
    WithdrawalAmount => "withdrawal_amount",
    PinResetNew => "pin_reset_new",
    PinResetConfirm => "pin_reset_confirm",
});

/// Operation the subscriber selected from the root menu; resolved after the
/// PIN gate passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    Balance,
    Transfer,
    Withdrawal,
}

/// Per-state working data. Stored as opaque JSON so old rows survive
/// additions to any variant.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scratch {
    #[default]
    Empty,
    AwaitingPin {
        next_action: NextAction,
    },
    Transfer {
        recipient: Option<String>,
        amount_minor: Option<i64>,
    },
    PinReset {
        new_pin: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UssdSession {
    pub session_id: String,
    pub phone: String,
    pub country: String,
    pub state: MenuState,
    pub scratch: Scratch,
    pub pin_attempts: u32,
    /// Unix seconds; set once `pin_attempts` breaches the limit.
    pub pin_locked_until: Option<i64>,
    pub last_interaction_at: i64,
}

/// What the gateway gets back for one turn. `end = true` closes the dialogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UssdReply {
    pub text: String,
    pub end: bool,
}

impl UssdReply {
    pub fn cont(text: impl Into<String>) -> Self {
        Self { text: text.into(), end: false }
    }

    pub fn end(text: impl Into<String>) -> Self {
        Self { text: text.into(), end: true }
    }
}
