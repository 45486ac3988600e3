use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Mobile-money platform core — USSD sessions, smart payouts, plugin
/// rollouts, multi-signature approvals, and sandboxed SDK simulations.
#[derive(Parser)]
#[command(name = "sunupay", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Serve the HTTP API (USSD gateway, payouts, rollouts, approvals,
    /// simulation enqueue)
    Api {
        /// Bind host
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Bind port
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },

    /// Run the approval TTL expiry worker
    ExpiryWorker {
        /// Seconds between sweeps
        #[arg(long, default_value_t = 30)]
        interval_secs: u64,
    },

    /// Run the sandboxed simulation worker
    SimulatorWorker,

    /// Run the payout slice dispatch worker
    DispatchWorker {
        /// Slices per sweep
        #[arg(long, default_value_t = 50)]
        batch: u32,

        /// Seconds to sleep when the queue is empty
        #[arg(long, default_value_t = 5)]
        interval_secs: u64,
    },

    /// Run the rollout auto-pause sweep
    RolloutSweep {
        /// Sweep repeatedly instead of once
        #[arg(long)]
        watch: bool,

        /// Seconds between sweeps when watching
        #[arg(long, default_value_t = 60)]
        interval_secs: u64,
    },

    /// Execute a simulation scenario (sandbox-internal entrypoint)
    Harness {
        /// Path to the scenario file
        #[arg(long, default_value = "/work/scenario.json")]
        scenario: PathBuf,
    },

    /// Create the store schema and seed reference data, then exit
    Migrate,
}
