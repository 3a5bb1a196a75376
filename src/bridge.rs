//! The host surface visible to plugin code.
//!
//! Everything a plugin can reach is registered here: finding reporting,
//! bounded logging, and a few byte/string and JSON helpers. Nothing touching
//! the filesystem, processes or the network is ever registered, so such calls
//! fail inside the plugin as undefined functions.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::str::FromStr;

use rhai::{Blob, Dynamic, Engine, EvalAltResult, ImmutableString, Map, Module};
use scan_plugin::{Confidence, LogEntry, LogLevel, RequestSummary, ResponseSummary, Severity};
use serde::{Deserialize, Deserializer, Serialize, de::Error as _};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::heap;

type FnResult<T> = Result<T, Box<EvalAltResult>>;

/// Sink shared between one worker's bridge closures and the worker loop.
pub type SharedSink = Rc<RefCell<ExecutionSink>>;

/// A finding as emitted by a plugin, before the collector stamps identity on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftFinding {
    pub title: String,
    pub description: String,
    #[serde(deserialize_with = "case_insensitive")]
    pub severity: Severity,
    pub vuln_type: String,
    #[serde(deserialize_with = "case_insensitive")]
    pub confidence: Confidence,
    pub evidence: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub param_name: Option<String>,
    pub param_value: Option<String>,
    pub request: Option<RequestSummary>,
    pub response: Option<ResponseSummary>,
    pub cwe: Option<String>,
    pub owasp: Option<String>,
    pub remediation: Option<String>,
}

fn case_insensitive<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
{
    let raw = String::deserialize(de)?;
    raw.trim()
        .parse()
        .map_err(|_| D::Error::custom(format!("unknown value `{raw}`")))
}

impl DraftFinding {
    /// Validate a plugin-supplied value; `None` if it is not a usable finding.
    pub fn from_dynamic(value: &Dynamic) -> Option<Self> {
        if !value.is_map() {
            return None;
        }
        let draft: DraftFinding = rhai::serde::from_dynamic(value).ok()?;
        let required = [&draft.title, &draft.description, &draft.vuln_type];
        if required.iter().any(|s| s.trim().is_empty()) {
            return None;
        }
        Some(draft)
    }

    fn approx_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// Per-execution ceilings, taken from [`EngineConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkLimits {
    pub log_capacity: usize,
    pub max_log_line_bytes: usize,
    pub max_findings: usize,
    pub max_memory_bytes: usize,
}

impl From<&EngineConfig> for SinkLimits {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            log_capacity: cfg.log_capacity.max(1),
            max_log_line_bytes: cfg.max_log_line_bytes.max(16),
            max_findings: cfg.max_findings,
            max_memory_bytes: cfg.max_memory_bytes,
        }
    }
}

/// What one execution left behind in the sink.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkReport {
    pub logs: Vec<LogEntry>,
    pub dropped_log_lines: u64,
    pub findings: Vec<DraftFinding>,
    pub malformed_findings: u64,
    pub dropped_findings: u64,
    /// Largest footprint seen during the execution: host-side buffers or
    /// heap the script held, whichever was larger.
    pub peak_bytes: usize,
    pub over_budget: bool,
}

/// Bounded buffers owned by whichever task is running in the worker.
#[derive(Debug)]
pub struct ExecutionSink {
    limits: SinkLimits,
    plugin_id: String,
    logs: VecDeque<LogEntry>,
    log_bytes: usize,
    dropped_log_lines: u64,
    findings: Vec<DraftFinding>,
    finding_bytes: usize,
    malformed_findings: u64,
    dropped_findings: u64,
    context_bytes: usize,
    base_bytes: usize,
    peak_bytes: usize,
    over_budget: bool,
}

impl ExecutionSink {
    pub fn new(limits: SinkLimits) -> Self {
        Self {
            limits,
            plugin_id: String::new(),
            logs: VecDeque::with_capacity(limits.log_capacity),
            log_bytes: 0,
            dropped_log_lines: 0,
            findings: Vec::new(),
            finding_bytes: 0,
            malformed_findings: 0,
            dropped_findings: 0,
            context_bytes: 0,
            base_bytes: 0,
            peak_bytes: 0,
            over_budget: false,
        }
    }

    pub fn shared(limits: SinkLimits) -> SharedSink {
        Rc::new(RefCell::new(Self::new(limits)))
    }

    /// Reset for a new execution of `plugin_id` whose input is `context_bytes`
    /// large, and start counting this thread's heap.
    pub fn begin(&mut self, plugin_id: &str, context_bytes: usize) {
        let limits = self.limits;
        *self = Self::new(limits);
        self.plugin_id = plugin_id.to_string();
        self.context_bytes = context_bytes;
        self.base_bytes = context_bytes;
        heap::start();
        self.account();
    }

    /// Hand over everything collected since [`ExecutionSink::begin`].
    pub fn finish(&mut self) -> SinkReport {
        // catch spikes that came and went between two samples
        let held = self.context_bytes.saturating_add(heap::stop());
        self.peak_bytes = self.peak_bytes.max(held);
        if held > self.limits.max_memory_bytes {
            self.over_budget = true;
        }
        SinkReport {
            logs: self.logs.drain(..).collect(),
            dropped_log_lines: std::mem::take(&mut self.dropped_log_lines),
            findings: std::mem::take(&mut self.findings),
            malformed_findings: std::mem::take(&mut self.malformed_findings),
            dropped_findings: std::mem::take(&mut self.dropped_findings),
            peak_bytes: self.peak_bytes,
            over_budget: self.over_budget,
        }
    }

    pub fn over_budget(&self) -> bool {
        self.over_budget
    }

    /// Count bytes held outside the sink's buffers, e.g. a returned value.
    pub fn add_bytes(&mut self, bytes: usize) {
        self.base_bytes = self.base_bytes.saturating_add(bytes);
        self.account();
    }

    /// Re-read the thread's heap; `true` once the ceiling has been crossed.
    pub fn sample_heap(&mut self) -> bool {
        self.account();
        self.over_budget
    }

    fn account(&mut self) {
        // buffers are on the heap too, so the two figures overlap
        let host = self.base_bytes + self.log_bytes + self.finding_bytes;
        let script = self.context_bytes + heap::live();
        let current = host.max(script);
        self.peak_bytes = self.peak_bytes.max(current);
        if current > self.limits.max_memory_bytes {
            self.over_budget = true;
        }
    }

    pub fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        let mut message = message.into();
        truncate_utf8(&mut message, self.limits.max_log_line_bytes);

        tracing::trace!(target: "plugin", plugin_id = %self.plugin_id, %level, "{message}");

        if self.logs.len() >= self.limits.log_capacity {
            if let Some(evicted) = self.logs.pop_front() {
                self.log_bytes -= evicted.message.len();
            }
            self.dropped_log_lines += 1;
        }
        self.log_bytes += message.len();
        self.logs.push_back(LogEntry { level, message });
        self.account();
    }

    /// Never fails: malformed values are counted and dropped.
    pub fn emit_finding(&mut self, value: &Dynamic) {
        let Some(draft) = DraftFinding::from_dynamic(value) else {
            self.malformed_findings += 1;
            tracing::debug!(plugin_id = %self.plugin_id, "dropping malformed finding");
            return;
        };
        if self.findings.len() >= self.limits.max_findings {
            self.dropped_findings += 1;
            return;
        }
        self.finding_bytes += draft.approx_bytes();
        self.findings.push(draft);
        self.account();
    }
}

const ELLIPSIS: &str = "...";

fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max.saturating_sub(ELLIPSIS.len());
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
    s.push_str(ELLIPSIS);
}

/// Strings print as-is, everything else as JSON when it converts cleanly.
pub fn render(value: &Dynamic) -> String {
    if value.is_string() {
        return value.clone().into_string().unwrap_or_default();
    }
    match rhai::serde::from_dynamic::<Value>(value) {
        Ok(json) => json.to_string(),
        Err(_) => value.to_string(),
    }
}

fn error_value(message: &str) -> Map {
    let mut map = Map::new();
    map.insert("name".into(), Dynamic::from("Error"));
    map.insert("message".into(), Dynamic::from(message.to_string()));
    map
}

/// Register the whole plugin-visible surface on `engine`, writing into `sink`.
pub fn install(engine: &mut Engine, sink: &SharedSink) {
    // print/debug statements land in the same ring as console output
    let s = sink.clone();
    engine.on_print(move |text| s.borrow_mut().push_log(LogLevel::Info, text));
    let s = sink.clone();
    engine.on_debug(move |text, _source, _pos| s.borrow_mut().push_log(LogLevel::Debug, text));

    let s = sink.clone();
    engine.register_fn("emitFinding", move |finding: Dynamic| s.borrow_mut().emit_finding(&finding));
    let s = sink.clone();
    engine.register_fn("log", move |level: ImmutableString, message: Dynamic| {
        let level = LogLevel::from_str(&level).unwrap_or(LogLevel::Info);
        s.borrow_mut().push_log(level, render(&message));
    });
    engine.register_fn("Error", |message: ImmutableString| error_value(&message));
    engine.register_fn("Error", || error_value(""));

    engine.register_static_module("console", console_module(sink).into());
    engine.register_static_module("Host", host_module(sink).into());
    engine.register_static_module("text", text_module().into());
    engine.register_static_module("JSON", json_module().into());
}

fn console_module(sink: &SharedSink) -> Module {
    let mut module = Module::new();
    let levels = [
        ("log", LogLevel::Info),
        ("info", LogLevel::Info),
        ("warn", LogLevel::Warn),
        ("error", LogLevel::Error),
        ("debug", LogLevel::Debug),
    ];
    for (name, level) in levels {
        let s = sink.clone();
        module.set_native_fn(name, move |a: Dynamic| -> FnResult<()> {
            s.borrow_mut().push_log(level, render(&a));
            Ok(())
        });
        let s = sink.clone();
        module.set_native_fn(name, move |a: Dynamic, b: Dynamic| -> FnResult<()> {
            s.borrow_mut().push_log(level, format!("{} {}", render(&a), render(&b)));
            Ok(())
        });
        let s = sink.clone();
        module.set_native_fn(name, move |a: Dynamic, b: Dynamic, c: Dynamic| -> FnResult<()> {
            s.borrow_mut()
                .push_log(level, format!("{} {} {}", render(&a), render(&b), render(&c)));
            Ok(())
        });
    }
    module
}

fn host_module(sink: &SharedSink) -> Module {
    let mut module = Module::new();
    let s = sink.clone();
    module.set_native_fn("emitFinding", move |finding: Dynamic| -> FnResult<()> {
        s.borrow_mut().emit_finding(&finding);
        Ok(())
    });
    let s = sink.clone();
    module.set_native_fn("log", move |level: ImmutableString, message: Dynamic| -> FnResult<()> {
        let level = LogLevel::from_str(&level).unwrap_or(LogLevel::Info);
        s.borrow_mut().push_log(level, render(&message));
        Ok(())
    });
    module
}

fn text_module() -> Module {
    let mut module = Module::new();
    module.set_native_fn("encode", |s: ImmutableString| -> FnResult<Blob> { Ok(s.as_bytes().to_vec()) });
    module.set_native_fn("decode", |b: Blob| -> FnResult<String> {
        Ok(String::from_utf8_lossy(&b).into_owned())
    });
    module.set_native_fn("hex", |b: Blob| -> FnResult<String> { Ok(to_hex(&b)) });
    module.set_native_fn("hex", |s: ImmutableString| -> FnResult<String> { Ok(to_hex(s.as_bytes())) });
    module.set_native_fn("truncate", |s: ImmutableString, max: rhai::INT| -> FnResult<String> {
        let max = usize::try_from(max).unwrap_or(0);
        Ok(s.chars().take(max).collect())
    });
    module
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn json_module() -> Module {
    let mut module = Module::new();
    module.set_native_fn("stringify", |value: Dynamic| -> FnResult<String> {
        let json: Value = rhai::serde::from_dynamic(&value)?;
        Ok(json.to_string())
    });
    module.set_native_fn("parse", |raw: ImmutableString| -> FnResult<Dynamic> {
        let json: Value = serde_json::from_str(&raw).map_err(|e| format!("JSON.parse: {e}"))?;
        rhai::serde::to_dynamic(json)
    });
    module
}
