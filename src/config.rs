use std::path::PathBuf;
use std::time::Duration;

use crate::ussd::UssdConfig;

/// Process configuration, read once from the environment. Every knob has a
/// default that works for a local deployment.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub sira_url: Option<String>,
    pub sira_timeout: Duration,
    pub event_bus_url: Option<String>,
    /// Injected token-signing secret; generated and persisted when absent.
    pub auth_secret: Option<String>,
    pub ussd: UssdConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = env_str("SUNUPAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("sunupay")
            });

        let ussd = UssdConfig {
            session_timeout_secs: env_i64("SUNUPAY_SESSION_TIMEOUT_SECS", 120),
            max_pin_attempts: env_i64("SUNUPAY_MAX_PIN_ATTEMPTS", 3) as u32,
            pin_lock_secs: env_i64("SUNUPAY_PIN_LOCK_SECS", 30 * 60),
        };

        Self {
            data_dir,
            sira_url: env_str("SUNUPAY_SIRA_URL"),
            sira_timeout: Duration::from_millis(env_i64("SUNUPAY_SIRA_TIMEOUT_MS", 1_500) as u64),
            event_bus_url: env_str("SUNUPAY_EVENT_BUS_URL"),
            auth_secret: env_str("SUNUPAY_AUTH_SECRET"),
            ussd,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("sunupay.db")
    }

    /// Scratch workspaces mounted into simulation sandboxes.
    pub fn sim_workdir(&self) -> PathBuf {
        self.data_dir.join("sim-work")
    }

    /// Root of the local artifact store (archived simulation logs).
    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
