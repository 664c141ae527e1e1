// Turn a lookup outcome into the next entry of a watch's history

use crate::models::{ExecutionResult, ExtractionOutcome};
use crate::source::FetchOutcome;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Classify a lookup against the most recent non-failed result
///
/// Only that one previous result is consulted. Data that differs from it, or
/// data found where there was none, is a change.
pub fn classify(fetched: &FetchOutcome, previous: Option<&ExecutionResult>) -> ExtractionOutcome {
    match fetched {
        FetchOutcome::NotFound => ExtractionOutcome::NotFound,
        FetchOutcome::Found(fields) => match previous.and_then(|p| p.fields.as_ref()) {
            Some(previous_fields) if previous_fields == fields => ExtractionOutcome::NoChange,
            _ => ExtractionOutcome::Success,
        },
    }
}

/// Build the result to append for a completed lookup
pub fn reconcile(
    watch_id: Uuid,
    executed_at: DateTime<Utc>,
    fetched: FetchOutcome,
    previous: Option<&ExecutionResult>,
) -> ExecutionResult {
    let outcome = classify(&fetched, previous);
    let fields = match fetched {
        FetchOutcome::Found(fields) => Some(fields),
        FetchOutcome::NotFound => None,
    };
    ExecutionResult::new(watch_id, executed_at, fields, outcome)
}
