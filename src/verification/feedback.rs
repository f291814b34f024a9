//! Turning a rejection into instructions for the next attempt

use super::{VerificationResult, VerificationStatus};
use serde_json::{json, Value};

/// Instruction block handed to the agent on its next attempt
pub fn format_feedback(result: &VerificationResult, attempt: u32, max_attempts: u32) -> String {
    let mut out = format!(
        "Attempt {} of {} was rejected by verification.\n",
        attempt, max_attempts
    );

    let failed: Vec<&str> = result.failed_phases().collect();
    if !failed.is_empty() {
        out.push_str(&format!("Failed phases: {}\n", failed.join(", ")));
    }

    if result.feedback_for_agent.is_empty() {
        out.push_str("No specific feedback was given. Re-check the acceptance criteria.\n");
    } else {
        out.push_str("Address every item below before finishing:\n");
        for (i, line) in result.feedback_for_agent.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, line.trim()));
        }
    }

    for phase in result.phases.iter().filter(|p| !p.passed) {
        if let Some(details) = &phase.details {
            out.push_str(&format!("\n[{}]\n{}\n", phase.phase, details.trim()));
        }
    }
    out
}

/// Value persisted in the ticket's `sentinel_feedback`
pub fn feedback_record(result: &VerificationResult, attempt: u32, max_attempts: u32) -> Value {
    json!({
        "attempt": attempt,
        "status": result.status,
        "instructions": format_feedback(result, attempt, max_attempts),
        "result": result,
    })
}

/// Instructions stored by a previous rejection, if any
pub fn instructions_from(sentinel_feedback: Option<&Value>) -> Option<String> {
    let feedback = sentinel_feedback?;
    match feedback.get("instructions").and_then(Value::as_str) {
        Some(text) => Some(text.to_string()),
        None => match feedback {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        },
    }
}

/// Treat an agent-level failure as a rejection so it follows the retry path
pub fn rejection_from_failure(error: &str, evidence: &Value) -> VerificationResult {
    let mut lines = vec![format!("The previous run failed: {}", error)];
    if let Some(stderr) = evidence
        .get("stderr_tail")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
    {
        lines.push(format!("Last error output:\n{}", stderr.trim()));
    }
    VerificationResult {
        status: VerificationStatus::Failed,
        phases: Vec::new(),
        feedback_for_agent: lines,
        feedback: json!({"execution_error": error, "evidence": evidence}),
    }
}
