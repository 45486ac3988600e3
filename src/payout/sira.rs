//! SIRA risk oracle client and its deterministic fallback.
//!
//! The orchestrator only knows the [`RiskOracle`] trait. The HTTP client
//! talks to the real service; when it is slow or unreachable the caller
//! degrades to [`fallback_recommendation`], which is pure and fast.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::payout::{RecommendedAction, SliceAdvice};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutMode {
    #[default]
    Auto,
    Instant,
    Manual,
}

/// What the oracle is asked to judge.
#[derive(Debug, Clone, Serialize)]
pub struct PayoutContext {
    pub marketplace: String,
    pub seller_ref: String,
    pub amount_minor: i64,
    pub currency: String,
    pub mode: PayoutMode,
}

/// Oracle verdict, not yet persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct Recommendation {
    pub priority_score: i64,
    pub risk_score: i64,
    pub multi_bank: bool,
    pub recommended_action: RecommendedAction,
    pub slices: Option<Vec<SliceAdvice>>,
    pub treasury_account_id: Option<String>,
    pub reasons: Vec<String>,
    pub model_version: String,
}

#[async_trait]
pub trait RiskOracle: Send + Sync {
    async fn recommend(&self, ctx: &PayoutContext) -> anyhow::Result<Recommendation>;
}

// ── HTTP client ─────────────────────────────────────────────────────

pub struct HttpSiraOracle {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSiraOracle {
    pub fn new(base_url: String, timeout: std::time::Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl RiskOracle for HttpSiraOracle {
    async fn recommend(&self, ctx: &PayoutContext) -> anyhow::Result<Recommendation> {
        let url = format!("{}/v1/recommendations", self.base_url.trim_end_matches('/'));
        let rec = self
            .client
            .post(&url)
            .json(ctx)
            .send()
            .await?
            .error_for_status()?
            .json::<Recommendation>()
            .await?;
        Ok(rec)
    }
}

// ── Deterministic fallback ──────────────────────────────────────────

const PRIORITY_AMOUNT_THRESHOLD: i64 = 10_000;
const RISK_AMOUNT_THRESHOLD: i64 = 50_000;
const MULTI_BANK_THRESHOLD: i64 = 100_000;
const SLICE_CHUNK: i64 = 50_000;
const BASE_PRIORITY: i64 = 50;
const BASE_RISK: i64 = 20;

/// Pure scoring used whenever the oracle cannot answer in time. Same inputs,
/// same recommendation.
pub fn fallback_recommendation(ctx: &PayoutContext) -> Recommendation {
    let mut priority = BASE_PRIORITY;
    let mut risk = BASE_RISK;
    let mut reasons = vec!["fallback: oracle unavailable".to_string()];

    if ctx.mode == PayoutMode::Instant {
        priority += 30;
        reasons.push("instant mode requested".to_string());
    }
    if ctx.amount_minor > PRIORITY_AMOUNT_THRESHOLD {
        priority += 20;
        reasons.push("amount above priority threshold".to_string());
    }
    if ctx.amount_minor > RISK_AMOUNT_THRESHOLD {
        risk += 30;
        reasons.push("amount above risk threshold".to_string());
    }

    let multi_bank = ctx.amount_minor > MULTI_BANK_THRESHOLD;
    let slices = multi_bank.then(|| chunk_slices(ctx.amount_minor));
    if multi_bank {
        reasons.push("amount above multi-bank threshold".to_string());
    }

    let recommended_action = if ctx.mode == PayoutMode::Instant {
        RecommendedAction::Instant
    } else {
        RecommendedAction::Batch
    };

    Recommendation {
        priority_score: priority,
        risk_score: risk,
        multi_bank,
        recommended_action,
        slices,
        treasury_account_id: None,
        reasons,
        model_version: "fallback-1".to_string(),
    }
}

/// Split an amount into `ceil(amount / 50k)` even chunks, integer remainder
/// on the last slice. The slices always sum to the input.
fn div_ceil_i64(lhs: i64, rhs: i64) -> i64 {
    let d = lhs / rhs;
    let r = lhs % rhs;
    if (r > 0 && rhs > 0) || (r < 0 && rhs < 0) { d + 1 } else { d }
}

fn chunk_slices(amount_minor: i64) -> Vec<SliceAdvice> {
    let n = div_ceil_i64(amount_minor, SLICE_CHUNK).max(1);
    let base = amount_minor / n;
    (1..=n)
        .map(|i| SliceAdvice {
            treasury_account_id: format!("TREAS-{i:02}"),
            amount_minor: if i == n { amount_minor - base * (n - 1) } else { base },
        })
        .collect()
}

/// Oracle that always answers with the fallback scoring. Useful for tests
/// and environments without a SIRA deployment.
pub struct FallbackOracle;

#[async_trait]
impl RiskOracle for FallbackOracle {
    async fn recommend(&self, ctx: &PayoutContext) -> anyhow::Result<Recommendation> {
        Ok(fallback_recommendation(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(amount: i64, mode: PayoutMode) -> PayoutContext {
        PayoutContext {
            marketplace: "mk1".into(),
            seller_ref: "s1".into(),
            amount_minor: amount,
            currency: "XOF".into(),
            mode,
        }
    }

    #[test]
    fn small_auto_payout_scores_base() {
        let rec = fallback_recommendation(&ctx(5_000, PayoutMode::Auto));
        assert_eq!(rec.priority_score, 50);
        assert_eq!(rec.risk_score, 20);
        assert!(!rec.multi_bank);
        assert_eq!(rec.recommended_action, RecommendedAction::Batch);
    }

    #[test]
    fn instant_mode_raises_priority() {
        let rec = fallback_recommendation(&ctx(5_000, PayoutMode::Instant));
        assert_eq!(rec.priority_score, 80);
        assert_eq!(rec.recommended_action, RecommendedAction::Instant);
    }

    #[test]
    fn large_amount_slices_evenly() {
        let rec = fallback_recommendation(&ctx(120_000, PayoutMode::Auto));
        assert!(rec.multi_bank);
        let slices = rec.slices.unwrap();
        assert_eq!(slices.len(), 3);
        assert!(slices.iter().all(|s| s.amount_minor == 40_000));
    }

    #[test]
    fn slices_always_sum_to_amount() {
        for amount in [100_001, 120_000, 149_999, 250_000, 1_000_003] {
            let slices = chunk_slices(amount);
            assert_eq!(slices.iter().map(|s| s.amount_minor).sum::<i64>(), amount);
            assert_eq!(slices.len() as i64, div_ceil_i64(amount, SLICE_CHUNK));
        }
    }
}
