use std::sync::Arc;
use std::time::Duration;

use crate::events::EventBus;
use crate::payout::sira::RiskOracle;
use crate::store::Db;
use crate::ussd::UssdConfig;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub oracle: Arc<dyn RiskOracle>,
    pub oracle_timeout: Duration,
    pub bus: Arc<dyn EventBus>,
    pub ussd: UssdConfig,
    pub auth_secret: String,
}
