//! Run identity resolution
//!
//! Computes the `(run_id, logical_timestamp)` pair for a downstream run.
//! Pure: the only input besides the request is the caller-supplied `now`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike, Utc};

use crate::errors::{Result, TriggerError};
use crate::types::{RunIdentity, RunKind};

/// Render a timestamp the way run ids embed it:
/// `2021-01-02T03:04:05+00:00`, with `.ffffff` only when there are sub-second digits.
pub fn format_logical_timestamp(ts: &DateTime<Utc>) -> String {
    if ts.nanosecond() / 1_000 == 0 {
        ts.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
    } else {
        ts.format("%Y-%m-%dT%H:%M:%S%.6f%:z").to_string()
    }
}

/// Run id for a run of `kind` at `logical_timestamp`, e.g. `manual__2019-01-01T00:00:00+00:00`.
pub fn generate_run_id(kind: RunKind, logical_timestamp: &DateTime<Utc>) -> String {
    format!("{}__{}", kind, format_logical_timestamp(logical_timestamp))
}

/// Resolve the identity of the run to create.
///
/// - explicit run id: used verbatim
/// - explicit logical timestamp: run id derived from it (idempotent)
/// - neither: `now` becomes the logical timestamp
pub fn resolve_identity(
    workflow_id: &str,
    run_id: Option<&str>,
    logical_timestamp: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> RunIdentity {
    // Sub-microsecond precision is not representable in stored timestamps.
    let logical_timestamp = truncate_to_micros(logical_timestamp.unwrap_or(now));

    let run_id = match run_id {
        Some(id) => id.to_string(),
        None => generate_run_id(RunKind::Manual, &logical_timestamp),
    };

    RunIdentity {
        workflow_id: workflow_id.to_string(),
        run_id,
        logical_timestamp,
    }
}

/// Parse a user-supplied logical date. Accepts RFC 3339, a naive
/// `YYYY-MM-DDTHH:MM:SS` (taken as UTC) or a bare `YYYY-MM-DD`.
pub fn parse_logical_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(ts.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
        .ok_or_else(|| TriggerError::configuration(format!("Invalid logical date: '{}'", value)))
}

fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let micros = ts.nanosecond() / 1_000 * 1_000;
    ts.with_nanosecond(micros).unwrap_or(ts)
}
