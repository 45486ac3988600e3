use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sunupay::archive::FsObjectStore;
use sunupay::config::Config;
use sunupay::events::{EventBus, NoopBus, WebhookBus};
use sunupay::simulator::sandbox::DockerRuntime;
use sunupay::simulator::worker::SimulatorWorker;
use sunupay::{api, approval, payout, rollout, simulator, store};

mod cli;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = cli::Cli::parse();
    let config = Config::from_env();

    match cli.command {
        cli::Command::Api { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(api::serve(&host, port, &config))
        }

        cli::Command::ExpiryWorker { interval_secs } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let db = store::open(&config.db_path())?;
                let bus = make_bus(&config)?;
                approval::expiry::run(db, bus, Duration::from_secs(interval_secs)).await;
                Ok(())
            })
        }

        cli::Command::SimulatorWorker => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let db = store::open(&config.db_path())?;
                let worker = SimulatorWorker::new(
                    db,
                    Arc::new(DockerRuntime::new()),
                    Arc::new(FsObjectStore::new(config.artifacts_dir())),
                    config.sim_workdir(),
                );
                worker.run().await;
                Ok(())
            })
        }

        cli::Command::DispatchWorker { batch, interval_secs } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let db = store::open(&config.db_path())?;
                payout::run_dispatch_worker(db, batch, Duration::from_secs(interval_secs)).await;
                Ok(())
            })
        }

        cli::Command::RolloutSweep { watch, interval_secs } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let db = store::open(&config.db_path())?;
                loop {
                    let paused = {
                        let mut conn = db.lock().await;
                        rollout::auto_check(&mut conn)
                    };
                    match paused {
                        Ok(0) => {}
                        Ok(count) => info!(count, "rollouts auto-paused"),
                        Err(err) => warn!(error = %format!("{err:#}"), "rollout sweep failed"),
                    }
                    if !watch {
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(interval_secs)).await;
                }
                Ok(())
            })
        }

        cli::Command::Harness { scenario } => {
            let run_id = std::env::var("RUN_ID").unwrap_or_default();
            let exit_code = simulator::harness::execute(&scenario, &run_id)?;
            std::process::exit(exit_code);
        }

        cli::Command::Migrate => {
            store::open(&config.db_path())?;
            info!(path = %config.db_path().display(), "store migrated and seeded");
            Ok(())
        }
    }
}

fn make_bus(config: &Config) -> Result<Arc<dyn EventBus>> {
    Ok(match &config.event_bus_url {
        Some(url) => Arc::new(WebhookBus::new(url.clone())?),
        None => Arc::new(NoopBus),
    })
}
