use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use scanhost::scan_plugin::{EntryKind, FailureReason, PluginMetadata, PluginStatus, Severity, TaskStatus};
use scanhost::store::{FilePluginStore, PluginStore};
use scanhost::{EngineConfig, EngineError, PluginEngine};
use serde_json::{Value, json};
use tempfile::TempDir;

const P1: &str = r#"
export function scan_request(ctx: any): void {
    emitFinding({
        title: "t",
        description: "d",
        severity: "high",
        vuln_type: "xss",
        confidence: "medium",
    });
}
globalThis.scan_request = scan_request;
"#;

const P2: &str = r#"
function scan_request(ctx) {
    throw new Error("boom");
}
globalThis.scan_request = scan_request;
"#;

const SPIN: &str = r#"
function scan_request(ctx) {
    while (true) { }
}
globalThis.scan_request = scan_request;
"#;

// every frame keeps its own 256 KiB string alive while the next one is built
const HOG: &str = r#"
function hold(depth) {
    let s = "x";
    while s.len() < 262144 { s += s; }
    if depth == 0 { return s.len(); }
    return s.len() + hold(depth - 1);
}
function scan_request(ctx) {
    return hold(15);
}
globalThis.scan_request = scan_request;
"#;

fn cfg(pool_size: usize) -> EngineConfig {
    EngineConfig { pool_size, ..EngineConfig::default() }
}

fn ctx() -> Value {
    json!({"id": "req-1", "method": "GET", "url": "https://example.test/"})
}

async fn engine_with(cfg: EngineConfig, plugins: &[(&str, &str)]) -> PluginEngine {
    let engine = PluginEngine::new(cfg, PluginStore::memory()).unwrap();
    for (id, source) in plugins {
        engine.create_plugin(PluginMetadata::new(*id, *id, "1.0.0"), *source).await.unwrap();
        engine.enable_plugin(id).await.unwrap();
    }
    engine
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn emitted_finding_comes_back_stamped() {
    let engine = engine_with(cfg(1), &[("p1", P1)]).await;

    let result = engine.submit_execution("p1", EntryKind::ScanRequest, ctx()).await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.findings.len(), 1);
    assert_eq!(result.findings[0].severity, Severity::High);
    assert_eq!(result.findings[0].task_id, result.task_id);
    assert_eq!(result.findings[0].request_id.as_deref(), Some("req-1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn thrown_error_fails_the_task_but_not_the_worker() {
    let engine = engine_with(cfg(1), &[("p1", P1), ("p2", P2)]).await;

    let failed = engine.submit_execution("p2", EntryKind::ScanRequest, ctx()).await.unwrap();
    assert!(!failed.success);
    assert_eq!(failed.failure, Some(FailureReason::RuntimeError));
    assert!(failed.error.as_deref().unwrap_or_default().contains("boom"));

    let ok = engine.submit_execution("p1", EntryKind::ScanRequest, ctx()).await.unwrap();
    assert!(ok.success);
    assert_eq!(ok.worker_id, failed.worker_id);
    assert_eq!(engine.worker(0).unwrap().restart_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn endless_loop_times_out_and_the_pool_recovers() {
    let cfg = EngineConfig { call_timeout_ms: 300, ..cfg(1) };
    let engine = engine_with(cfg, &[("spin", SPIN), ("p1", P1)]).await;

    let started = Instant::now();
    let result = engine.submit_execution("spin", EntryKind::ScanRequest, ctx()).await.unwrap();
    assert_eq!(result.status, TaskStatus::TimedOut);
    assert!(!result.success);
    assert!(started.elapsed() < Duration::from_millis(300 + 2_000));

    // the single worker is rebuilt and serves the next task
    let next = engine.submit_execution("p1", EntryKind::ScanRequest, ctx()).await.unwrap();
    assert!(next.success, "{:?}", next.error);

    let stats = engine.plugin_stats("spin").unwrap();
    assert_eq!(stats.timeout_count, 1);
    assert_eq!(stats.restart_count, 1);
    assert_eq!(engine.worker(0).unwrap().restart_count, 1);
    assert_eq!(engine.worker(0).unwrap().loaded_plugin_ids.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn saturation_rejects_exactly_the_overflow() {
    let cfg = EngineConfig { pool_size: 2, queue_depth: 3, call_timeout_ms: 400, ..EngineConfig::default() };
    let engine = engine_with(cfg, &[("spin", SPIN)]).await;

    let submissions = (0..9).map(|_| engine.submit_execution("spin", EntryKind::ScanRequest, ctx()));
    let outcomes = join_all(submissions).await;

    let rejected = outcomes.iter().filter(|o| matches!(o, Err(EngineError::Backpressure { .. }))).count();
    let finished = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(rejected, 9 - (2 + 3));
    assert_eq!(finished, 5);

    // rejected submissions never reach the stats
    assert_eq!(engine.plugin_stats("spin").unwrap().total_invocations, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hot_update_is_idempotent_and_visible_to_the_next_call() {
    let doubler = "function analyze(input) { return input.n * 2; }\nglobalThis.analyze = analyze;";
    let tripler = "function analyze(input) { return input.n * 3; }\nglobalThis.analyze = analyze;";
    let engine = engine_with(cfg(2), &[("calc", doubler)]).await;
    let meta = PluginMetadata::new("calc", "calc", "1.0.1");

    for _ in 0..2 {
        let record = engine.update_plugin(meta.clone(), tripler).await.unwrap();
        assert_eq!(record.status, PluginStatus::Enabled);
        let result = engine.submit_execution("calc", EntryKind::Analyze, json!({"n": 5})).await.unwrap();
        assert_eq!(result.output, Some(json!(15)));
    }
    for worker in engine.workers() {
        assert_eq!(worker.loaded_plugin_ids.iter().filter(|id| *id == "calc").count(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_plugin_does_not_disturb_others() {
    let engine = engine_with(cfg(2), &[("p1", P1), ("p2", P2)]).await;

    for _ in 0..6 {
        engine.submit_execution("p2", EntryKind::ScanRequest, ctx()).await.unwrap();
    }
    let ok = engine.submit_execution("p1", EntryKind::ScanRequest, ctx()).await.unwrap();
    assert!(ok.success);

    assert!(engine.workers().iter().all(|w| w.restart_count == 0));
    let p1 = engine.plugin_stats("p1").unwrap();
    assert_eq!(p1.total_invocations, 1);
    assert_eq!(p1.error_count, 0);
    assert_eq!(engine.plugin_stats("p2").unwrap().error_count, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_clears_memory_but_not_history() {
    let engine = engine_with(cfg(1), &[("p1", P1)]).await;
    for _ in 0..3 {
        engine.submit_execution("p1", EntryKind::ScanRequest, ctx()).await.unwrap();
    }
    let before = engine.worker(0).unwrap();
    assert!(before.memory_high_water_mark > 0);

    engine.restart_worker(0, false).await.unwrap();

    let after = engine.worker(0).unwrap();
    assert_eq!(after.memory_high_water_mark, 0);
    assert_eq!(after.loaded_plugin_ids, before.loaded_plugin_ids);
    assert_eq!(after.restart_count, before.restart_count + 1);
    assert_eq!(engine.plugin_stats("p1").unwrap().total_invocations, 3);
    assert_eq!(engine.worker_stats(0).unwrap().total_invocations, 3);

    engine.restart_worker(0, true).await.unwrap();
    assert_eq!(engine.worker_stats(0).unwrap().total_invocations, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn log_flood_stays_bounded() {
    let flood = r#"
function scan_request(ctx) {
    let i = 0;
    while (i < 10000) {
        console.log("line " + i);
        i += 1;
    }
    emitFinding({ title: "t", description: "d", severity: "low", vuln_type: "info", confidence: "low" });
}
globalThis.scan_request = scan_request;
"#;
    let engine = engine_with(cfg(1), &[("flood", flood)]).await;
    let cap = engine.config().log_capacity;

    let result = engine.submit_execution("flood", EntryKind::ScanRequest, ctx()).await.unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.findings.len(), 1);
    assert_eq!(result.logs.len(), cap);
    assert_eq!(result.dropped_log_lines, 10_000 - cap as u64);
    assert_eq!(result.logs.last().unwrap().message, "line 9999");
}

async fn fastest_of_three(engine: &PluginEngine, plugin_id: &str) -> Duration {
    let mut best = Duration::MAX;
    for _ in 0..3 {
        let started = Instant::now();
        let result = engine.submit_execution(plugin_id, EntryKind::ScanRequest, ctx()).await.unwrap();
        assert!(result.success, "{:?}", result.error);
        best = best.min(started.elapsed());
    }
    best
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn log_flood_costs_about_as_much_as_the_same_loop_without_logging() {
    let flood = r#"
function scan_request(ctx) {
    let i = 0;
    while (i < 10000) {
        let line = "line " + i;
        console.log(line);
        i += 1;
    }
}
globalThis.scan_request = scan_request;
"#;
    let quiet = r#"
function scan_request(ctx) {
    let i = 0;
    while (i < 10000) {
        let line = "line " + i;
        i += 1;
    }
}
globalThis.scan_request = scan_request;
"#;
    let engine = engine_with(cfg(1), &[("flood", flood), ("quiet", quiet)]).await;

    let flooding = fastest_of_three(&engine, "flood").await;
    let silent = fastest_of_three(&engine, "quiet").await;
    assert!(
        flooding <= silent * 2 + Duration::from_millis(20),
        "logging loop took {flooding:?}, silent loop {silent:?}"
    );
}

#[cfg(feature = "heap-accounting")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_heap_over_the_ceiling_fails_and_rebuilds_the_worker() {
    let cfg = EngineConfig { max_memory_bytes: 1 << 20, ..cfg(1) };
    let engine = engine_with(cfg, &[("hog", HOG), ("p1", P1)]).await;

    let result = engine.submit_execution("hog", EntryKind::ScanRequest, ctx()).await.unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.failure, Some(FailureReason::ResourceExceeded));
    assert!(result.output.is_none());

    // the rebuilt worker still carries both plugins and serves the next task
    let next = engine.submit_execution("p1", EntryKind::ScanRequest, ctx()).await.unwrap();
    assert!(next.success, "{:?}", next.error);
    assert_eq!(next.worker_id, Some(0));

    let worker = engine.worker(0).unwrap();
    assert_eq!(worker.restart_count, 1);
    assert_eq!(worker.loaded_plugin_ids.len(), 2);
    let hog = engine.plugin_stats("hog").unwrap();
    assert_eq!(hog.restart_count, 1);
    assert_eq!(hog.error_count, 1);
    assert_eq!(engine.plugin_stats("p1").unwrap().restart_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn host_capabilities_are_simply_undefined() {
    let snoop = "function analyze(x) { return readFile(\"/etc/passwd\"); }\nglobalThis.analyze = analyze;";
    let engine = engine_with(cfg(1), &[("snoop", snoop)]).await;

    let result = engine.submit_execution("snoop", EntryKind::Analyze, json!({})).await.unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.failure, Some(FailureReason::RuntimeError));
    assert!(result.error.unwrap().contains("readFile"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submissions_are_checked_against_the_registry() {
    let engine = engine_with(cfg(1), &[("p1", P1)]).await;

    let missing = engine.submit_execution("nope", EntryKind::ScanRequest, ctx()).await;
    assert!(matches!(missing, Err(EngineError::NotFound(_))));

    let wrong_kind = engine.submit_execution("p1", EntryKind::Analyze, ctx()).await;
    assert!(matches!(wrong_kind, Err(EngineError::MissingEntryPoint(_, EntryKind::Analyze))));

    engine.disable_plugin("p1").await.unwrap();
    let disabled = engine.submit_execution("p1", EntryKind::ScanRequest, ctx()).await;
    assert!(matches!(disabled, Err(EngineError::NotEnabled(_, PluginStatus::Disabled))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn advanced_runs_count_unique_findings() {
    let engine = engine_with(cfg(2), &[("p1", P1)]).await;

    let result = engine.run_advanced("p1", EntryKind::ScanRequest, ctx(), 5, 2).await.unwrap();
    assert_eq!(result.total_runs, 5);
    assert_eq!(result.concurrency, 2);
    assert_eq!(result.runs.len(), 5);
    assert_eq!(result.total_findings, 5);
    assert_eq!(result.unique_findings, 1);
    assert!(result.runs.iter().enumerate().all(|(i, r)| r.run_index == i && r.error.is_none()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn enabled_plugins_survive_a_restart_of_the_engine() {
    let dir = TempDir::new().unwrap();
    let store = || PluginStore(Arc::new(FilePluginStore::new(dir.path()).unwrap()));

    let first = engine_with_store(store()).await;
    first.create_plugin(PluginMetadata::new("p1", "P1", "1.0.0"), P1).await.unwrap();
    first.enable_plugin("p1").await.unwrap();
    first.create_plugin(PluginMetadata::new("p2", "P2", "1.0.0"), P2).await.unwrap();
    first.shutdown().await;

    let second = PluginEngine::start(cfg(1), store()).await.unwrap();
    assert_eq!(second.plugin("p1").unwrap().status, PluginStatus::Enabled);
    assert_eq!(second.plugin("p2").unwrap().status, PluginStatus::Disabled);
    let result = second.submit_execution("p1", EntryKind::ScanRequest, ctx()).await.unwrap();
    assert!(result.success);
    assert_eq!(second.plugin_stats("p1").unwrap().total_invocations, 1);
}

async fn engine_with_store(store: PluginStore) -> PluginEngine {
    PluginEngine::start(cfg(1), store).await.unwrap()
}
