use chrono::Utc;
use scan_plugin::{EntryKind, ExecutionResult, FailureReason, Finding, RequestSummary, ResponseSummary, TaskStatus};
use serde_json::Value;
use uuid::Uuid;

use crate::bridge::{DraftFinding, SinkReport};

/// Identity of the task a batch of findings came from.
#[derive(Debug, Clone, Copy)]
pub struct TaskIdentity<'a> {
    pub task_id: &'a str,
    pub plugin_id: &'a str,
    pub kind: EntryKind,
    pub context: &'a Value,
    pub worker_id: Option<usize>,
}

/// How the task ended, already mapped from the worker's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Completed { output: Option<Value> },
    Failed { reason: FailureReason, message: String },
    TimedOut { message: String },
}

/// Stamp identity on every finding and assemble the final result.
///
/// Findings are kept in emission order; nothing is deduplicated.
pub fn assemble(id: TaskIdentity<'_>, verdict: Verdict, report: SinkReport, execution_time_ms: u64) -> ExecutionResult {
    let request_id = request_id(id.context);
    let findings: Vec<Finding> = report
        .findings
        .into_iter()
        .map(|draft| stamp(&id, request_id.as_deref(), draft))
        .collect();

    let (status, success, message, error, failure, output) = match verdict {
        Verdict::Completed { output } => {
            let message = format!("{} finding(s) reported", findings.len());
            (TaskStatus::Completed, true, Some(message), None, None, output)
        }
        Verdict::Failed { reason, message } => (TaskStatus::Failed, false, None, Some(message), Some(reason), None),
        Verdict::TimedOut { message } => (TaskStatus::TimedOut, false, None, Some(message), None, None),
    };

    ExecutionResult {
        task_id: id.task_id.to_string(),
        plugin_id: id.plugin_id.to_string(),
        kind: id.kind,
        status,
        success,
        message,
        findings,
        error,
        failure,
        execution_time_ms,
        output,
        logs: report.logs,
        dropped_log_lines: report.dropped_log_lines,
        malformed_findings: report.malformed_findings,
        dropped_findings: report.dropped_findings,
        worker_id: id.worker_id,
    }
}

fn stamp(id: &TaskIdentity<'_>, request_id: Option<&str>, draft: DraftFinding) -> Finding {
    let request = draft.request.or_else(|| request_summary(id.context));
    let response = draft.response.or_else(|| response_summary(id.context));
    Finding {
        id: Uuid::new_v4().to_string(),
        plugin_id: id.plugin_id.to_string(),
        task_id: id.task_id.to_string(),
        request_id: request_id.map(str::to_string),
        title: draft.title,
        description: draft.description,
        severity: draft.severity,
        vuln_type: draft.vuln_type,
        confidence: draft.confidence,
        evidence: draft.evidence,
        location: draft.location,
        url: draft.url.or_else(|| request.as_ref().map(|r| r.url.clone()).filter(|u| !u.is_empty())),
        method: draft.method,
        param_name: draft.param_name,
        param_value: draft.param_value,
        request,
        response,
        cwe: draft.cwe,
        owasp: draft.owasp,
        remediation: draft.remediation,
        created_at: Utc::now(),
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Traffic contexts carry their identity as `id`, `request_id` or `request.id`.
fn request_id(ctx: &Value) -> Option<String> {
    text(ctx.get("id"))
        .or_else(|| text(ctx.get("request_id")))
        .or_else(|| text(ctx.pointer("/request/id")))
}

fn request_summary(ctx: &Value) -> Option<RequestSummary> {
    let source = ctx.get("request").filter(|r| r.is_object()).unwrap_or(ctx);
    let method = text(source.get("method"))?;
    let url = text(source.get("url")).unwrap_or_default();
    Some(RequestSummary { method, url })
}

fn response_summary(ctx: &Value) -> Option<ResponseSummary> {
    let status = ctx
        .pointer("/response/status")
        .or_else(|| ctx.get("status"))
        .and_then(Value::as_u64)?;
    Some(ResponseSummary { status: u16::try_from(status).ok()? })
}

#[cfg(test)]
mod tests {
    use super::*;
    use scan_plugin::{Confidence, Severity};
    use serde_json::json;

    fn draft(title: &str) -> DraftFinding {
        DraftFinding {
            title: title.into(),
            description: "d".into(),
            severity: Severity::High,
            vuln_type: "xss".into(),
            confidence: Confidence::Medium,
            evidence: None,
            location: None,
            url: None,
            method: None,
            param_name: None,
            param_value: None,
            request: None,
            response: None,
            cwe: None,
            owasp: None,
            remediation: None,
        }
    }

    #[test]
    fn findings_carry_task_and_request_identity() {
        let ctx = json!({"id": "req-7", "method": "GET", "url": "https://a.test/x", "status": 200});
        let id = TaskIdentity { task_id: "t1", plugin_id: "p1", kind: EntryKind::ScanResponse, context: &ctx, worker_id: Some(2) };
        let report = SinkReport { findings: vec![draft("a"), draft("a")], ..SinkReport::default() };

        let result = assemble(id, Verdict::Completed { output: None }, report, 12);
        assert!(result.success);
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.findings.len(), 2, "no deduplication");
        let f = &result.findings[0];
        assert_eq!(f.task_id, "t1");
        assert_eq!(f.plugin_id, "p1");
        assert_eq!(f.request_id.as_deref(), Some("req-7"));
        assert_eq!(f.request.as_ref().unwrap().method, "GET");
        assert_eq!(f.response.as_ref().unwrap().status, 200);
        assert_eq!(f.url.as_deref(), Some("https://a.test/x"));
        assert_ne!(result.findings[0].id, result.findings[1].id);
    }

    #[test]
    fn nested_request_and_response_are_understood() {
        let ctx = json!({"request": {"id": 41, "method": "POST", "url": "/login"}, "response": {"status": 302}});
        assert_eq!(request_id(&ctx).as_deref(), Some("41"));
        assert_eq!(request_summary(&ctx).unwrap().url, "/login");
        assert_eq!(response_summary(&ctx).unwrap().status, 302);
    }

    #[test]
    fn failures_keep_partial_findings_and_logs() {
        let ctx = json!({});
        let id = TaskIdentity { task_id: "t", plugin_id: "p", kind: EntryKind::Analyze, context: &ctx, worker_id: None };
        let report = SinkReport { findings: vec![draft("early")], dropped_log_lines: 3, ..SinkReport::default() };
        let verdict = Verdict::Failed { reason: FailureReason::RuntimeError, message: "boom".into() };

        let result = assemble(id, verdict, report, 1);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert_eq!(result.failure, Some(FailureReason::RuntimeError));
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.dropped_log_lines, 3);
        assert!(result.findings[0].request.is_none());
    }
}
