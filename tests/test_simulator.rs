use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use sunupay::archive::FsObjectStore;
use sunupay::model::simulation::{JournalEvent, RunStatus};
use sunupay::simulator::harness::{Scenario, ScenarioFile, run_scenario};
use sunupay::simulator::sandbox::{SandboxRuntime, SandboxSpec, ensure_network_denied};
use sunupay::simulator::worker::SimulatorWorker;
use sunupay::simulator::{anonymized_errors_of, enqueue_run, get_run, journal_entries};
use sunupay::store::{self, Db};

// ── In-process sandbox ──────────────────────────────────────────────

/// Runs the harness directly instead of spawning a container. Same code
/// path the sandbox image executes, minus the isolation.
#[derive(Default)]
struct InProcessSandbox {
    workspaces: StdMutex<HashMap<String, (PathBuf, String)>>,
    removed: StdMutex<Vec<String>>,
}

impl InProcessSandbox {
    fn output(&self, container_id: &str) -> Result<(Vec<String>, i32)> {
        let (workspace, run_id) = self
            .workspaces
            .lock()
            .unwrap()
            .get(container_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown container {container_id}"))?;

        let raw = std::fs::read_to_string(workspace.join("scenario.json"))?;
        let file: ScenarioFile = serde_json::from_str(&raw)?;
        let scenario: Scenario = serde_json::from_value(file.scenario)?;
        let lines = run_scenario(file.seed, &scenario, &run_id);

        let all_failed = lines
            .last()
            .and_then(|l| serde_json::from_str::<serde_json::Value>(l).ok())
            .map(|v| v["status"] == "failed")
            .unwrap_or(true);
        Ok((lines, if all_failed { 1 } else { 0 }))
    }
}

#[async_trait]
impl SandboxRuntime for InProcessSandbox {
    async fn create(&self, spec: &SandboxSpec) -> Result<String> {
        ensure_network_denied(spec)?;
        let run_id = spec
            .env
            .iter()
            .find(|(k, _)| k == "RUN_ID")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        let id = format!("sbx-{run_id}");
        self.workspaces
            .lock()
            .unwrap()
            .insert(id.clone(), (spec.workspace.clone(), run_id));
        Ok(id)
    }

    async fn start(&self, _container_id: &str) -> Result<()> {
        Ok(())
    }

    async fn wait(&self, container_id: &str) -> Result<i64> {
        Ok(self.output(container_id)?.1 as i64)
    }

    async fn kill(&self, _container_id: &str) -> Result<()> {
        Ok(())
    }

    async fn logs(&self, container_id: &str) -> Result<String> {
        Ok(self.output(container_id)?.0.join("\n"))
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.removed.lock().unwrap().push(container_id.to_string());
        Ok(())
    }
}

/// Sandbox that never terminates; exercises the wall-clock kill.
struct HangingSandbox;

#[async_trait]
impl SandboxRuntime for HangingSandbox {
    async fn create(&self, spec: &SandboxSpec) -> Result<String> {
        ensure_network_denied(spec)?;
        Ok("sbx-hung".to_string())
    }

    async fn start(&self, _container_id: &str) -> Result<()> {
        Ok(())
    }

    async fn wait(&self, _container_id: &str) -> Result<i64> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(0)
    }

    async fn kill(&self, _container_id: &str) -> Result<()> {
        Ok(())
    }

    async fn logs(&self, _container_id: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn remove(&self, _container_id: &str) -> Result<()> {
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn test_dirs() -> (PathBuf, PathBuf) {
    let base = std::env::temp_dir().join(format!("sunupay-test-{}", uuid::Uuid::new_v4()));
    (base.join("work"), base.join("artifacts"))
}

fn open_db() -> Db {
    Arc::new(tokio::sync::Mutex::new(store::open_in_memory().unwrap()))
}

fn worker_with(db: Db, runtime: Arc<dyn SandboxRuntime>) -> (SimulatorWorker, PathBuf) {
    let (workdir, artifacts) = test_dirs();
    let worker = SimulatorWorker::new(
        db,
        runtime,
        Arc::new(FsObjectStore::new(artifacts.clone())),
        workdir,
    );
    (worker, artifacts)
}

fn scenario_json(total: u64, error_frequency: f64, latency_ms: f64) -> serde_json::Value {
    serde_json::json!({
        "total_requests": total,
        "error_frequency": error_frequency,
        "latency_ms": latency_ms,
    })
}

async fn run_once(db: &Db, worker: &SimulatorWorker, seed: u64, scenario: serde_json::Value) -> String {
    let run_id = {
        let conn = db.lock().await;
        enqueue_run(&conn, seed, "node", scenario, None).unwrap().id
    };
    assert!(worker.tick().await.unwrap(), "worker claimed the run");
    run_id
}

// ── Determinism ─────────────────────────────────────────────────────

#[tokio::test]
async fn same_seed_and_scenario_give_identical_metrics() {
    let db = open_db();
    let sandbox = Arc::new(InProcessSandbox::default());
    let (worker, _) = worker_with(db.clone(), sandbox);

    let a = run_once(&db, &worker, 12345, scenario_json(100, 0.1, 120.0)).await;
    let b = run_once(&db, &worker, 12345, scenario_json(100, 0.1, 120.0)).await;

    let conn = db.lock().await;
    let run_a = get_run(&conn, &a).unwrap().unwrap();
    let run_b = get_run(&conn, &b).unwrap().unwrap();

    let ma = run_a.metrics.unwrap();
    let mb = run_b.metrics.unwrap();
    assert_eq!(ma.success_rate, mb.success_rate);
    assert_eq!(ma.avg_latency_ms, mb.avg_latency_ms);

    assert!(ma.success_rate > 0.85 && ma.success_rate < 0.95, "rate {}", ma.success_rate);
    assert!(ma.failed_requests > 5 && ma.failed_requests < 15, "failed {}", ma.failed_requests);
    assert_eq!(run_a.status, RunStatus::PartialSuccess);
}

#[tokio::test]
async fn different_seeds_give_observably_different_metrics() {
    let db = open_db();
    let sandbox = Arc::new(InProcessSandbox::default());
    let (worker, _) = worker_with(db.clone(), sandbox);

    let a = run_once(&db, &worker, 12345, scenario_json(100, 0.1, 120.0)).await;
    let b = run_once(&db, &worker, 54321, scenario_json(100, 0.1, 120.0)).await;

    let conn = db.lock().await;
    let ma = get_run(&conn, &a).unwrap().unwrap().metrics.unwrap();
    let mb = get_run(&conn, &b).unwrap().unwrap().metrics.unwrap();
    assert_ne!(ma.avg_latency_ms, mb.avg_latency_ms);
}

#[tokio::test]
async fn slow_scenario_reports_a_high_latency_regression() {
    let db = open_db();
    let sandbox = Arc::new(InProcessSandbox::default());
    let (worker, _) = worker_with(db.clone(), sandbox);

    let id = run_once(&db, &worker, 12345, scenario_json(100, 0.1, 5_000.0)).await;

    let conn = db.lock().await;
    let metrics = get_run(&conn, &id).unwrap().unwrap().metrics.unwrap();
    assert!(
        metrics.regressions.iter().any(|r| r.contains("high latency")),
        "regressions: {:?}",
        metrics.regressions
    );
}

// ── Pipeline bookkeeping ────────────────────────────────────────────

#[tokio::test]
async fn run_lifecycle_archives_logs_and_journals_once() {
    let db = open_db();
    let sandbox = Arc::new(InProcessSandbox::default());
    let (worker, artifacts) = worker_with(db.clone(), sandbox.clone());

    let id = run_once(&db, &worker, 7, scenario_json(50, 0.0, 100.0)).await;

    let conn = db.lock().await;
    let run = get_run(&conn, &id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.exit_code, Some(0));
    assert!(run.completed_at.is_some());
    assert!(run.container_id.is_some());

    let key = run.artifact_key.unwrap();
    assert_eq!(key, format!("simulations/{id}.log"));
    let archived = std::fs::read_to_string(artifacts.join(&key)).unwrap();
    assert!(archived.lines().count() > 50, "full log archived");

    let entries = journal_entries(&conn, &id).unwrap();
    let events: Vec<JournalEvent> = entries.iter().map(|e| e.event).collect();
    assert_eq!(events, vec![JournalEvent::Started, JournalEvent::Completed]);

    assert_eq!(sandbox.removed.lock().unwrap().len(), 1, "sandbox removed");
}

#[tokio::test]
async fn wall_clock_breach_kills_and_journals_timeout() {
    let db = open_db();
    let (mut worker, _) = worker_with(db.clone(), Arc::new(HangingSandbox));
    worker.max_run_time = Duration::from_millis(50);

    let id = run_once(&db, &worker, 1, scenario_json(10, 0.0, 100.0)).await;

    let conn = db.lock().await;
    let run = get_run(&conn, &id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Timeout);
    assert_eq!(run.exit_code, Some(124));

    let events: Vec<JournalEvent> =
        journal_entries(&conn, &id).unwrap().iter().map(|e| e.event).collect();
    assert_eq!(events, vec![JournalEvent::Started, JournalEvent::Timeout]);
}

#[tokio::test]
async fn idle_tick_claims_nothing() {
    let db = open_db();
    let (worker, _) = worker_with(db.clone(), Arc::new(InProcessSandbox::default()));
    assert!(!worker.tick().await.unwrap());
}

// ── Anonymized errors ───────────────────────────────────────────────

#[tokio::test]
async fn error_logs_distill_into_anonymized_signatures() {
    let db = open_db();
    let sandbox = Arc::new(InProcessSandbox::default());
    let (worker, _) = worker_with(db.clone(), sandbox);

    let id = run_once(&db, &worker, 4242, scenario_json(100, 0.25, 120.0)).await;

    let conn = db.lock().await;
    let errors = anonymized_errors_of(&conn, &id).unwrap();
    assert!(!errors.is_empty());

    let total_frequency: f64 = errors.iter().map(|e| e.frequency).sum();
    assert!((total_frequency - 0.25).abs() < 1e-9, "frequencies sum to the error rate");

    for error in &errors {
        assert!(!error.error_signature.contains(':'), "signature is the prefix only");
        assert_eq!(error.context_hash.len(), 64, "sha-256 hex");
        assert_eq!(error.sdk_language, "node");
        assert!(
            ["timeout", "network", "validation", "throttling", "runtime"]
                .contains(&error.category.as_str())
        );
    }
}
