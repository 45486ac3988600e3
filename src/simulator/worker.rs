//! Simulation worker: claim queued runs, execute them in a network-denied
//! sandbox under a hard wall clock, archive the logs, and distill
//! anonymized error aggregates for offline training.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{TransactionBehavior, params};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::archive::ObjectStore;
use crate::model::simulation::{JournalEvent, RunMetrics, RunStatus, SimulationRun};
use crate::store::{Db, now_ts};

use super::sandbox::{SandboxRuntime, SandboxSpec, ensure_network_denied};
use super::{MAX_RUN_TIME_MS, dequeue_next, get_run, get_patch, image_for, journal};

const TIMEOUT_EXIT_CODE: i64 = 124;

pub struct SimulatorWorker {
    db: Db,
    runtime: Arc<dyn SandboxRuntime>,
    objects: Arc<dyn ObjectStore>,
    workdir: PathBuf,
    pub max_run_time: Duration,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
}

impl SimulatorWorker {
    pub fn new(
        db: Db,
        runtime: Arc<dyn SandboxRuntime>,
        objects: Arc<dyn ObjectStore>,
        workdir: PathBuf,
    ) -> Self {
        Self {
            db,
            runtime,
            objects,
            workdir,
            max_run_time: Duration::from_millis(MAX_RUN_TIME_MS),
            poll_interval: Duration::from_secs(5),
            error_backoff: Duration::from_secs(10),
        }
    }

    /// Main loop. Never returns; every failure is absorbed into the run it
    /// belongs to, or logged and backed off.
    pub async fn run(&self) {
        info!("simulator worker started");
        loop {
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.poll_interval).await,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "simulator worker tick failed");
                    tokio::time::sleep(self.error_backoff).await;
                }
            }
        }
    }

    /// Process at most one run. `Ok(true)` when a run was claimed.
    pub async fn tick(&self) -> Result<bool> {
        let run_id = {
            let mut conn = self.db.lock().await;
            dequeue_next(&mut conn)?
        };
        let Some(run_id) = run_id else {
            return Ok(false);
        };

        if let Err(err) = self.process(&run_id).await {
            warn!(run_id = %run_id, error = %format!("{err:#}"), "simulation run failed");
            self.fail_run(&run_id, &err).await;
        }
        Ok(true)
    }

    async fn process(&self, run_id: &str) -> Result<()> {
        let (run, patch) = {
            let conn = self.db.lock().await;
            let run = get_run(&conn, run_id)?
                .with_context(|| format!("run {run_id} disappeared after dequeue"))?;
            let patch = match run.patch_reference.as_deref() {
                Some(reference) => get_patch(&conn, reference)?,
                None => None,
            };
            (run, patch)
        };

        let workspace = self.workdir.join(&run.id);
        tokio::fs::create_dir_all(&workspace)
            .await
            .with_context(|| format!("creating workspace {}", workspace.display()))?;

        let scenario_file = serde_json::json!({ "seed": run.seed, "scenario": run.scenario });
        tokio::fs::write(
            workspace.join("scenario.json"),
            serde_json::to_vec_pretty(&scenario_file)?,
        )
        .await
        .context("writing scenario.json")?;

        if let Some((patch_code, rollback_code)) = &patch {
            tokio::fs::write(workspace.join("patch.js"), patch_code)
                .await
                .context("writing patch.js")?;
            if let Some(rollback_code) = rollback_code {
                tokio::fs::write(workspace.join("rollback.js"), rollback_code)
                    .await
                    .context("writing rollback.js")?;
            }
        }

        let spec = SandboxSpec {
            image: image_for(&run.sdk_language).to_string(),
            workspace: workspace.clone(),
            env: vec![
                ("SEED".to_string(), run.seed.to_string()),
                ("RUN_ID".to_string(), run.id.clone()),
            ],
            network_enabled: false,
        };
        ensure_network_denied(&spec)?;

        let container_id = self.runtime.create(&spec).await?;
        {
            let conn = self.db.lock().await;
            conn.execute(
                "UPDATE simulation_runs SET container_id = ?2 WHERE id = ?1",
                params![run.id, container_id],
            )?;
        }

        self.runtime.start(&container_id).await?;

        let mut timed_out = false;
        let exit_code = tokio::select! {
            exit = self.runtime.wait(&container_id) => exit?,
            _ = tokio::time::sleep(self.max_run_time) => {
                timed_out = true;
                if let Err(err) = self.runtime.kill(&container_id).await {
                    warn!(run_id = %run.id, error = %format!("{err:#}"), "killing timed-out sandbox failed");
                }
                TIMEOUT_EXIT_CODE
            }
        };

        let logs = match self.runtime.logs(&container_id).await {
            Ok(logs) => logs,
            Err(err) => {
                warn!(run_id = %run.id, error = %format!("{err:#}"), "collecting sandbox logs failed");
                String::new()
            }
        };

        let (parsed_status, metrics) = parse_summary(&logs)
            .unwrap_or((RunStatus::Failed, RunMetrics::default()));

        let artifact_key = format!("simulations/{}.log", run.id);
        if let Err(err) = self.objects.put(&artifact_key, logs.as_bytes()).await {
            warn!(run_id = %run.id, error = %format!("{err:#}"), "log archival failed");
        }

        let final_status = if timed_out || exit_code == TIMEOUT_EXIT_CODE {
            RunStatus::Timeout
        } else if exit_code != 0 && parsed_status == RunStatus::Success {
            RunStatus::Failed
        } else {
            parsed_status
        };

        {
            let mut conn = self.db.lock().await;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "UPDATE simulation_runs
                 SET status = ?2, metrics = ?3, artifact_key = ?4, exit_code = ?5,
                     error_message = ?6, completed_at = ?7
                 WHERE id = ?1",
                params![
                    run.id,
                    final_status,
                    serde_json::to_string(&metrics)?,
                    artifact_key,
                    exit_code,
                    timed_out.then(|| format!("run exceeded {MAX_RUN_TIME_MS}ms wall clock")),
                    now_ts(),
                ],
            )?;
            if timed_out {
                journal(&tx, &run.id, JournalEvent::Timeout, Some("sandbox killed"))?;
            } else {
                journal(&tx, &run.id, JournalEvent::Completed, Some(final_status.as_str()))?;
            }
            tx.commit()?;
        }

        if metrics.total_requests > 0 {
            let errors = collect_error_messages(&logs);
            if !errors.is_empty() {
                let conn = self.db.lock().await;
                insert_anonymized_errors(&conn, &run, &errors, metrics.total_requests)?;
            }
        }

        if let Err(err) = self.runtime.remove(&container_id).await {
            warn!(run_id = %run.id, error = %format!("{err:#}"), "sandbox removal failed");
        }

        info!(run_id = %run.id, status = %final_status, exit_code, "simulation run finished");
        Ok(())
    }

    /// Pipeline failure path: mark the run failed, journal it, and try to
    /// reap whatever sandbox was created.
    async fn fail_run(&self, run_id: &str, err: &anyhow::Error) {
        let container_id = {
            let mut conn = self.db.lock().await;
            let container_id = get_run(&conn, run_id)
                .ok()
                .flatten()
                .and_then(|r| r.container_id);
            if let Err(update_err) = record_failure(&mut conn, run_id, &format!("{err:#}")) {
                warn!(run_id = %run_id, error = %format!("{update_err:#}"), "recording run failure failed");
            }
            container_id
        };

        if let Some(container_id) = container_id {
            if let Err(remove_err) = self.runtime.remove(&container_id).await {
                warn!(run_id = %run_id, error = %format!("{remove_err:#}"), "sandbox removal failed");
            }
        }
    }
}

fn record_failure(conn: &mut rusqlite::Connection, run_id: &str, err_text: &str) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        "UPDATE simulation_runs SET status = 'failed', error_message = ?2, completed_at = ?3
         WHERE id = ?1",
        params![run_id, err_text, now_ts()],
    )?;
    journal(&tx, run_id, JournalEvent::Failed, Some(err_text))?;
    tx.commit()?;
    Ok(())
}

/// The summary is the last JSON line carrying `status` and `metrics`.
fn parse_summary(logs: &str) -> Option<(RunStatus, RunMetrics)> {
    let value: serde_json::Value = logs
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .find_map(|l| serde_json::from_str(l).ok())?;

    let status = RunStatus::parse(value.get("status")?.as_str()?)?;
    let metrics = serde_json::from_value(value.get("metrics")?.clone()).ok()?;
    Some((status, metrics))
}

fn collect_error_messages(logs: &str) -> Vec<String> {
    logs.lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line.trim()).ok())
        .filter(|v| v.get("event").and_then(|e| e.as_str()) == Some("error"))
        .filter_map(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .collect()
}

/// Errors are tokenized by the prefix before the first `:`; nothing after
/// it (which may carry merchant data) leaves the run except as a hash.
fn insert_anonymized_errors(
    conn: &rusqlite::Connection,
    run: &SimulationRun,
    messages: &[String],
    total_requests: u64,
) -> Result<()> {
    let mut grouped: HashMap<String, Vec<&str>> = HashMap::new();
    for message in messages {
        let signature = message.split(':').next().unwrap_or(message).trim().to_string();
        grouped.entry(signature).or_default().push(message);
    }

    for (signature, group) in grouped {
        let mut hasher = Sha256::new();
        for message in &group {
            hasher.update(message.as_bytes());
            hasher.update(b"\n");
        }
        let context_hash = format!("{:x}", hasher.finalize());
        let frequency = group.len() as f64 / total_requests as f64;

        conn.execute(
            "INSERT INTO anonymized_errors
                 (id, run_id, error_signature, category, sdk_language, frequency, context_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                uuid::Uuid::new_v4().to_string(),
                run.id,
                signature,
                categorize(&signature),
                run.sdk_language,
                frequency,
                context_hash,
            ],
        )?;
    }
    Ok(())
}

fn categorize(signature: &str) -> &'static str {
    let lower = signature.to_lowercase();
    if lower.contains("timeout") {
        "timeout"
    } else if lower.contains("connection") || lower.contains("reset") || lower.contains("network") {
        "network"
    } else if lower.contains("validation") {
        "validation"
    } else if lower.contains("rate") {
        "throttling"
    } else {
        "runtime"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_is_last_json_line() {
        let logs = concat!(
            "{\"event\":\"start\"}\n",
            "not json at all\n",
            "{\"status\":\"partial_success\",\"metrics\":{\"success_rate\":0.9,\"avg_latency_ms\":120.0,\"total_requests\":100,\"failed_requests\":10}}\n",
        );
        let (status, metrics) = parse_summary(logs).unwrap();
        assert_eq!(status, RunStatus::PartialSuccess);
        assert_eq!(metrics.failed_requests, 10);
    }

    #[test]
    fn missing_summary_means_failed() {
        assert!(parse_summary("plain text only\n").is_none());
        assert!(parse_summary("").is_none());
    }

    #[test]
    fn categorize_by_signature() {
        assert_eq!(categorize("TimeoutError"), "timeout");
        assert_eq!(categorize("ConnectionReset"), "network");
        assert_eq!(categorize("ValidationError"), "validation");
        assert_eq!(categorize("RateLimited"), "throttling");
        assert_eq!(categorize("Boom"), "runtime");
    }
}
