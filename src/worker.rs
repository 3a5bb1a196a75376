//! A single isolated execution context.
//!
//! Each worker is an OS thread owning one Rhai engine, the bridge sink and
//! the compiled scripts loaded into it. The host talks to it through
//! [`WorkerHandle`], which sends [`Command`]s over a channel; commands are
//! handled strictly in order, one at a time, so at most one task is ever
//! running inside a context.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rhai::module_resolvers::DummyModuleResolver;
use rhai::{AST, CallFnOptions, Dynamic, Engine, EvalAltResult, Scope};
use scan_plugin::{EntryKind, FailureReason};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::bridge::{self, ExecutionSink, SharedSink, SinkLimits, SinkReport};
use crate::config::EngineConfig;
use crate::error::LoadError;
use crate::normalizer::CompiledScript;

/// Termination tokens raised from the progress hook.
const DEADLINE: &str = "deadline";
const ABORTED: &str = "aborted";
const OVER_BUDGET: &str = "over_budget";

/// Operations between two checks of the deadline and abort flag.
const PROGRESS_STRIDE: u64 = 256;

/// One call of a plugin entry point.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub task_id: String,
    pub plugin_id: String,
    pub kind: EntryKind,
    pub context: Arc<Value>,
    pub deadline: Instant,
}

/// How a call ended, from the worker's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum CallStatus {
    Completed { output: Option<Value> },
    Failed { reason: FailureReason, message: String },
    TimedOut,
}

impl CallStatus {
    /// The context is no longer trustworthy and must be rebuilt.
    pub fn poisons_worker(&self) -> bool {
        matches!(
            self,
            CallStatus::TimedOut
                | CallStatus::Failed { reason: FailureReason::ResourceExceeded | FailureReason::WorkerLost, .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: CallStatus,
    pub report: SinkReport,
    pub elapsed: Duration,
}

impl Outcome {
    pub fn without_report(status: CallStatus, elapsed: Duration) -> Self {
        Self { status, report: SinkReport::default(), elapsed }
    }
}

#[derive(Debug)]
pub enum Command {
    Load { plugin_id: String, script: Arc<CompiledScript>, reply: oneshot::Sender<Result<(), LoadError>> },
    Unload { plugin_id: String, reply: oneshot::Sender<bool> },
    Invoke { invocation: Invocation, reply: oneshot::Sender<Outcome> },
    Shutdown,
}

/// Host-side handle to a worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    id: usize,
    generation: u64,
    tx: mpsc::UnboundedSender<Command>,
    abort: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Start a fresh context on its own thread.
    pub fn spawn(id: usize, generation: u64, cfg: &EngineConfig) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let abort = Arc::new(AtomicBool::new(false));

        let thread = std::thread::Builder::new().name(format!("scanhost-worker-{id}.{generation}")).spawn({
            let cfg = cfg.clone();
            let abort = abort.clone();
            move || WorkerRuntime::new(id, &cfg, abort).run(rx)
        })?;

        debug!(worker_id = id, generation, "worker started");
        Ok(Self { id, generation, tx, abort, thread: Mutex::new(Some(thread)) })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    pub async fn load(&self, plugin_id: &str, script: Arc<CompiledScript>) -> Result<(), LoadError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Load { plugin_id: plugin_id.to_string(), script, reply })
            .map_err(|_| LoadError::WorkerGone(self.id))?;
        rx.await.map_err(|_| LoadError::WorkerGone(self.id))?
    }

    /// `true` when the plugin was loaded and is now gone.
    pub async fn unload(&self, plugin_id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Unload { plugin_id: plugin_id.to_string(), reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Queue a call; the receiver resolves once the worker is done with it,
    /// or errors if the worker goes away first.
    pub fn invoke(&self, invocation: Invocation) -> Option<oneshot::Receiver<Outcome>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Invoke { invocation, reply }).ok()?;
        Some(rx)
    }

    /// Ask the running call to stop at its next progress check.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Stop the context and wait up to `timeout` for its thread to exit.
    ///
    /// Returns `false` when the thread did not finish in time; it is then left
    /// detached with its abort flag raised.
    pub async fn terminate(&self, timeout: Duration) -> bool {
        self.abort.store(true, Ordering::SeqCst);
        let _ = self.tx.send(Command::Shutdown);

        let thread = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(thread) = thread else {
            return true;
        };
        let joined = tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || thread.join())).await;
        matches!(joined, Ok(Ok(Ok(()))))
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.abort.store(true, Ordering::SeqCst);
        let _ = self.tx.send(Command::Shutdown);
    }
}

struct EntryPoint {
    function: String,
    arity: usize,
}

struct LoadedPlugin {
    ast: AST,
    scope: Scope<'static>,
    entries: BTreeMap<EntryKind, EntryPoint>,
}

/// State living on the worker thread.
struct WorkerRuntime {
    id: usize,
    engine: Engine,
    sink: SharedSink,
    deadline: Rc<Cell<Option<Instant>>>,
    load_timeout: Duration,
    abort: Arc<AtomicBool>,
    plugins: HashMap<String, LoadedPlugin>,
}

impl WorkerRuntime {
    fn new(id: usize, cfg: &EngineConfig, abort: Arc<AtomicBool>) -> Self {
        let sink = ExecutionSink::shared(SinkLimits::from(cfg));
        let deadline = Rc::new(Cell::new(None));
        let engine = build_engine(cfg, &sink, &deadline, abort.clone());
        Self { id, engine, sink, deadline, load_timeout: cfg.call_timeout(), abort, plugins: HashMap::new() }
    }

    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.blocking_recv() {
            match command {
                Command::Load { plugin_id, script, reply } => {
                    let result = match self.load(&plugin_id, &script) {
                        // the context is going away, the failure says nothing about the script
                        Err(_) if self.abort.load(Ordering::SeqCst) => Err(LoadError::WorkerGone(self.id)),
                        other => other,
                    };
                    let _ = reply.send(result);
                }
                Command::Unload { plugin_id, reply } => {
                    let _ = reply.send(self.plugins.remove(&plugin_id).is_some());
                }
                Command::Invoke { invocation, reply } => {
                    let outcome = self.invoke(&invocation);
                    let _ = reply.send(outcome);
                }
                Command::Shutdown => break,
            }
        }
        debug!(worker_id = self.id, "worker stopped");
    }

    /// Compile and evaluate a script, replacing any previous copy of the plugin.
    fn load(&mut self, plugin_id: &str, script: &CompiledScript) -> Result<(), LoadError> {
        // a failed reload must not leave the previous version callable
        self.plugins.remove(plugin_id);

        // 1) compile with this worker's engine
        let ast = self.engine.compile(&script.body).map_err(|err| LoadError::Compile {
            plugin_id: plugin_id.to_string(),
            message: err.to_string(),
        })?;

        // 2) resolve bindings into the entry table
        let mut entries = BTreeMap::new();
        for (kind, function) in &script.bindings {
            let arity = ast
                .iter_functions()
                .filter(|f| f.name == function.as_str())
                .map(|f| f.params.len())
                .filter(|&n| n <= 1)
                .max();
            let Some(arity) = arity else {
                return Err(LoadError::MissingFunction {
                    plugin_id: plugin_id.to_string(),
                    entry: *kind,
                    function: function.clone(),
                });
            };
            entries.insert(*kind, EntryPoint { function: function.clone(), arity });
        }

        // 3) run top-level statements once, under the same deadline as a call
        let mut scope = Scope::new();
        self.sink.borrow_mut().begin(plugin_id, 0);
        self.deadline.set(Some(Instant::now() + self.load_timeout));
        let evaluated = panic::catch_unwind(AssertUnwindSafe(|| self.engine.run_ast_with_scope(&mut scope, &ast)));
        self.deadline.set(None);
        self.sink.borrow_mut().finish();

        let failure = match evaluated {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(describe(&err)),
            Err(_) => Some("top-level evaluation panicked".to_string()),
        };
        if let Some(message) = failure {
            return Err(LoadError::Evaluation { plugin_id: plugin_id.to_string(), message });
        }

        trace!(worker_id = self.id, plugin_id, entries = entries.len(), "plugin loaded");
        self.plugins.insert(plugin_id.to_string(), LoadedPlugin { ast, scope, entries });
        Ok(())
    }

    fn invoke(&mut self, invocation: &Invocation) -> Outcome {
        let started = Instant::now();
        let internal = |message: String| CallStatus::Failed { reason: FailureReason::Internal, message };

        let Some(plugin) = self.plugins.get_mut(&invocation.plugin_id) else {
            let status = internal(format!("plugin `{}` is not loaded in worker {}", invocation.plugin_id, self.id));
            return Outcome::without_report(status, started.elapsed());
        };
        let Some(entry) = plugin.entries.get(&invocation.kind) else {
            let status = internal(format!("plugin `{}` has no `{}` entry point", invocation.plugin_id, invocation.kind));
            return Outcome::without_report(status, started.elapsed());
        };
        let arg = match rhai::serde::to_dynamic(invocation.context.as_ref()) {
            Ok(arg) => arg,
            Err(err) => return Outcome::without_report(internal(format!("unusable context: {err}")), started.elapsed()),
        };

        let context_bytes = serde_json::to_vec(invocation.context.as_ref()).map(|v| v.len()).unwrap_or(0);
        self.sink.borrow_mut().begin(&invocation.plugin_id, context_bytes);
        self.deadline.set(Some(invocation.deadline));

        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        let engine = &self.engine;
        let called = panic::catch_unwind(AssertUnwindSafe(|| {
            if entry.arity == 0 {
                engine.call_fn_with_options::<Dynamic>(options, &mut plugin.scope, &plugin.ast, &entry.function, ())
            } else {
                engine.call_fn_with_options::<Dynamic>(options, &mut plugin.scope, &plugin.ast, &entry.function, (arg,))
            }
        }));
        self.deadline.set(None);

        let mut status = match called {
            Ok(Ok(value)) => {
                let output = (invocation.kind == EntryKind::Analyze)
                    .then(|| rhai::serde::from_dynamic::<Value>(&value).ok())
                    .flatten()
                    .filter(|v| !v.is_null());
                if let Some(output) = &output {
                    let bytes = serde_json::to_vec(output).map(|v| v.len()).unwrap_or(0);
                    self.sink.borrow_mut().add_bytes(bytes);
                }
                CallStatus::Completed { output }
            }
            Ok(Err(err)) => classify(&err),
            Err(_) => internal("plugin call panicked".to_string()),
        };

        let report = self.sink.borrow_mut().finish();
        if report.over_budget && matches!(status, CallStatus::Completed { .. }) {
            status = CallStatus::Failed {
                reason: FailureReason::ResourceExceeded,
                message: "memory ceiling exceeded".to_string(),
            };
        }
        if let CallStatus::Failed { reason, message } = &status {
            debug!(worker_id = self.id, plugin_id = %invocation.plugin_id, %reason, "call failed: {message}");
        }
        Outcome { status, report, elapsed: started.elapsed() }
    }
}

fn build_engine(cfg: &EngineConfig, sink: &SharedSink, deadline: &Rc<Cell<Option<Instant>>>, abort: Arc<AtomicBool>) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_call_levels(cfg.max_call_levels);
    engine.set_max_string_size(cfg.max_string_size);
    engine.set_max_array_size(cfg.max_array_size);
    engine.set_max_map_size(cfg.max_map_size);
    engine.set_max_operations(cfg.max_operations);
    engine.set_module_resolver(DummyModuleResolver::new());
    engine.disable_symbol("eval");

    bridge::install(&mut engine, sink);

    let deadline = deadline.clone();
    let sink = sink.clone();
    engine.on_progress(move |ops| {
        // heap is a thread-local read, cheap enough for every operation
        if sink.borrow_mut().sample_heap() {
            return Some(Dynamic::from(OVER_BUDGET));
        }
        if ops % PROGRESS_STRIDE != 0 {
            return None;
        }
        if abort.load(Ordering::Relaxed) {
            return Some(Dynamic::from(ABORTED));
        }
        if deadline.get().is_some_and(|d| Instant::now() >= d) {
            return Some(Dynamic::from(DEADLINE));
        }
        None
    });
    engine
}

/// Map a script error onto the task outcome.
fn classify(err: &EvalAltResult) -> CallStatus {
    let resource = |message: String| CallStatus::Failed { reason: FailureReason::ResourceExceeded, message };
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) | EvalAltResult::ErrorInModule(_, inner, _) => classify(inner),
        EvalAltResult::ErrorTerminated(token, _) => match token.clone().into_string().as_deref() {
            Ok(OVER_BUDGET) => resource("memory ceiling exceeded".to_string()),
            Ok(ABORTED) => CallStatus::Failed {
                reason: FailureReason::WorkerLost,
                message: "worker was shut down during the call".to_string(),
            },
            _ => CallStatus::TimedOut,
        },
        EvalAltResult::ErrorTooManyOperations(_) => resource("operation budget exhausted".to_string()),
        EvalAltResult::ErrorDataTooLarge(what, _) => resource(format!("{what} exceeds the configured limit")),
        EvalAltResult::ErrorStackOverflow(_) => resource("call stack too deep".to_string()),
        EvalAltResult::ErrorRuntime(value, _) => CallStatus::Failed {
            reason: FailureReason::RuntimeError,
            message: thrown_message(value),
        },
        other => CallStatus::Failed { reason: FailureReason::RuntimeError, message: other.to_string() },
    }
}

/// `throw Error("boom")` and `throw "boom"` both read as `boom`.
fn thrown_message(value: &Dynamic) -> String {
    if let Some(map) = value.read_lock::<rhai::Map>() {
        if let Some(message) = map.get("message") {
            return bridge::render(message);
        }
    }
    bridge::render(value)
}

fn describe(err: &EvalAltResult) -> String {
    match classify(err) {
        CallStatus::Failed { message, .. } => message,
        CallStatus::TimedOut => "top-level evaluation timed out".to_string(),
        CallStatus::Completed { .. } => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::normalize;
    use serde_json::json;

    fn cfg() -> EngineConfig {
        EngineConfig { call_timeout_ms: 200, ..EngineConfig::default() }
    }

    fn invocation(plugin_id: &str, kind: EntryKind, context: Value, timeout: Duration) -> Invocation {
        Invocation {
            task_id: "t".into(),
            plugin_id: plugin_id.into(),
            kind,
            context: Arc::new(context),
            deadline: Instant::now() + timeout,
        }
    }

    async fn call(worker: &WorkerHandle, inv: Invocation) -> Outcome {
        worker.invoke(inv).unwrap().await.unwrap()
    }

    #[tokio::test]
    async fn thrown_errors_leave_the_worker_usable() {
        let worker = WorkerHandle::spawn(0, 0, &cfg()).unwrap();
        let bad = normalize("function scan_request(ctx) { throw new Error(\"boom\"); }\nglobalThis.scan_request = scan_request;").unwrap();
        let good = normalize("function analyze(input) { input.n + 1 }\nglobalThis.analyze = analyze;").unwrap();
        worker.load("bad", Arc::new(bad)).await.unwrap();
        worker.load("good", Arc::new(good)).await.unwrap();

        let out = call(&worker, invocation("bad", EntryKind::ScanRequest, json!({}), Duration::from_secs(1))).await;
        match out.status {
            CallStatus::Failed { reason, message } => {
                assert_eq!(reason, FailureReason::RuntimeError);
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let out = call(&worker, invocation("good", EntryKind::Analyze, json!({"n": 41}), Duration::from_secs(1))).await;
        assert_eq!(out.status, CallStatus::Completed { output: Some(json!(42)) });
    }

    #[tokio::test]
    async fn endless_loop_hits_the_deadline() {
        let worker = WorkerHandle::spawn(1, 0, &cfg()).unwrap();
        let spin = normalize("function analyze() { while (true) { } }\nglobalThis.analyze = analyze;").unwrap();
        worker.load("spin", Arc::new(spin)).await.unwrap();

        let started = Instant::now();
        let out = call(&worker, invocation("spin", EntryKind::Analyze, json!(null), Duration::from_millis(100))).await;
        assert_eq!(out.status, CallStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(out.status.poisons_worker());
    }

    #[tokio::test]
    async fn load_failures_are_reported_and_isolated() {
        let worker = WorkerHandle::spawn(2, 0, &cfg()).unwrap();
        let ok = normalize("function analyze(x) { 1 }\nglobalThis.analyze = analyze;").unwrap();
        worker.load("ok", Arc::new(ok)).await.unwrap();

        let broken = normalize("let x = missing_fn();\nfunction analyze(x) { 1 }\nglobalThis.analyze = analyze;").unwrap();
        let err = worker.load("broken", Arc::new(broken)).await.unwrap_err();
        assert!(matches!(err, LoadError::Evaluation { .. }));

        let out = call(&worker, invocation("ok", EntryKind::Analyze, json!({}), Duration::from_secs(1))).await;
        assert!(matches!(out.status, CallStatus::Completed { .. }));
        let out = call(&worker, invocation("broken", EntryKind::Analyze, json!({}), Duration::from_secs(1))).await;
        assert!(matches!(out.status, CallStatus::Failed { reason: FailureReason::Internal, .. }));
    }

    #[tokio::test]
    async fn oversized_strings_are_resource_failures() {
        let small = EngineConfig { max_string_size: 1024, ..cfg() };
        let worker = WorkerHandle::spawn(3, 0, &small).unwrap();
        let grow = normalize("function analyze() { let s = \"x\"; while (true) { s += s; } }\nglobalThis.analyze = analyze;").unwrap();
        worker.load("grow", Arc::new(grow)).await.unwrap();
        let out = call(&worker, invocation("grow", EntryKind::Analyze, json!({}), Duration::from_secs(1))).await;
        assert!(matches!(out.status, CallStatus::Failed { reason: FailureReason::ResourceExceeded, .. }));
    }

    #[cfg(feature = "heap-accounting")]
    #[tokio::test]
    async fn script_heap_counts_against_the_ceiling() {
        let capped = EngineConfig { max_memory_bytes: 1 << 20, ..cfg() };
        let worker = WorkerHandle::spawn(5, 0, &capped).unwrap();
        // no single value is large, together they are
        let hog = normalize(
            "function hold(d) { let s = \"x\"; while s.len() < 131072 { s += s; } if d == 0 { return 0; } return hold(d - 1) + 1; }\n\
             function analyze() { hold(20) }\nglobalThis.analyze = analyze;",
        )
        .unwrap();
        let light = normalize("function analyze() { let s = \"x\"; while s.len() < 131072 { s += s; } s.len() }\nglobalThis.analyze = analyze;").unwrap();
        worker.load("hog", Arc::new(hog)).await.unwrap();
        worker.load("light", Arc::new(light)).await.unwrap();

        let out = call(&worker, invocation("hog", EntryKind::Analyze, json!({}), Duration::from_secs(2))).await;
        assert!(matches!(out.status, CallStatus::Failed { reason: FailureReason::ResourceExceeded, .. }), "{:?}", out.status);
        assert!(out.report.peak_bytes > 1 << 20);

        let out = call(&worker, invocation("light", EntryKind::Analyze, json!({}), Duration::from_secs(2))).await;
        assert_eq!(out.status, CallStatus::Completed { output: Some(json!(131072)) });
        assert!(out.report.peak_bytes >= 131072);
        assert!(out.report.peak_bytes < 1 << 20);
    }

    #[tokio::test]
    async fn terminate_stops_the_thread() {
        let worker = WorkerHandle::spawn(4, 0, &cfg()).unwrap();
        assert!(worker.is_alive());
        assert!(worker.terminate(Duration::from_secs(1)).await);
        assert!(worker.invoke(invocation("x", EntryKind::Analyze, json!({}), Duration::from_secs(1))).is_none());
    }
}
