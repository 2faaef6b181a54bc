//! CDR normalization
//!
//! Each PBX family has one adapter: a table of accepted field aliases per
//! normalized field. Every adapter feeds the same `NormalizedCdr` shape, and
//! numbers may arrive as JSON numbers or strings.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::error::PipelineError;
use crate::models::{Disposition, NormalizedCdr, PbxSystem};

/// Accepted field names per normalized field, in priority order
struct FieldAliases {
    uniqueid: &'static [&'static str],
    source: &'static [&'static str],
    destination: &'static [&'static str],
    started_at: &'static [&'static str],
    /// Billable seconds first, wall-clock duration as a fallback
    duration: &'static [&'static str],
    disposition: &'static [&'static str],
    recording: &'static [&'static str],
}

const FREEPBX: FieldAliases = FieldAliases {
    uniqueid: &["uniqueid"],
    source: &["src"],
    destination: &["dst"],
    started_at: &["calldate", "start"],
    duration: &["billsec", "duration"],
    disposition: &["disposition"],
    recording: &["recordingfile"],
};

const THREECX: FieldAliases = FieldAliases {
    uniqueid: &["CallID", "call_id", "CallId"],
    source: &["Caller", "from", "From"],
    destination: &["Callee", "to", "To"],
    started_at: &["StartTime", "start_time"],
    duration: &["Duration", "duration"],
    disposition: &["Status", "status"],
    recording: &["RecordingUrl", "recording_url"],
};

const GENERIC: FieldAliases = FieldAliases {
    uniqueid: &["call_id", "uniqueid", "id"],
    source: &["source", "from"],
    destination: &["destination", "to"],
    started_at: &["start_time", "started_at"],
    duration: &["duration"],
    disposition: &["disposition", "status"],
    recording: &["recording_url", "recording_path"],
};

fn aliases_for(system: PbxSystem) -> &'static FieldAliases {
    match system {
        PbxSystem::FreePbx => &FREEPBX,
        PbxSystem::ThreeCx => &THREECX,
        PbxSystem::Generic => &GENERIC,
    }
}

/// Parse a raw webhook body into the normalized CDR shape
pub fn normalize(system: PbxSystem, payload: &Value) -> Result<NormalizedCdr, PipelineError> {
    let object = payload
        .as_object()
        .ok_or_else(|| malformed("payload must be a JSON object"))?;
    let fields = aliases_for(system);

    let uniqueid = text_field(object, fields.uniqueid)?
        .ok_or_else(|| malformed(format!("missing call identifier ({})", fields.uniqueid.join("/"))))?;

    let duration_seconds = match first_present(object, fields.duration) {
        Some((name, value)) => Some(parse_duration(name, value)?),
        None => None,
    };

    let disposition = match text_field(object, fields.disposition)? {
        Some(raw) => normalize_disposition(&raw)?,
        None => None,
    };

    let started_at = match text_field(object, fields.started_at)? {
        Some(raw) => Some(parse_timestamp(&raw)?),
        None => None,
    };

    Ok(NormalizedCdr {
        uniqueid,
        source_number: text_field(object, fields.source)?,
        destination_number: text_field(object, fields.destination)?,
        started_at,
        duration_seconds,
        disposition,
        recording_ref: text_field(object, fields.recording)?,
    })
}

/// Map vendor disposition strings; `None` means the call is not final yet
pub fn normalize_disposition(raw: &str) -> Result<Option<Disposition>, PipelineError> {
    let upper = raw.trim().to_ascii_uppercase().replace(['_', '-'], " ");
    match upper.as_str() {
        "ANSWERED" | "ANSWER" | "COMPLETED" => Ok(Some(Disposition::Answered)),
        "NO ANSWER" | "NOANSWER" | "MISSED" => Ok(Some(Disposition::NoAnswer)),
        "BUSY" => Ok(Some(Disposition::Busy)),
        "FAILED" | "CONGESTION" | "CANCEL" => Ok(Some(Disposition::Failed)),
        "RINGING" | "" => Ok(None),
        _ => Err(malformed(format!("unknown disposition '{}'", raw))),
    }
}

fn malformed(message: impl Into<String>) -> PipelineError {
    PipelineError::MalformedPayload(message.into())
}

fn first_present<'a>(
    object: &'a Map<String, Value>,
    names: &[&'static str],
) -> Option<(&'static str, &'a Value)> {
    names
        .iter()
        .find_map(|name| match object.get(*name) {
            None | Some(Value::Null) => None,
            Some(value) => Some((*name, value)),
        })
}

/// String or number field as trimmed text; empty strings count as absent
fn text_field(
    object: &Map<String, Value>,
    names: &[&'static str],
) -> Result<Option<String>, PipelineError> {
    for name in names {
        match object.get(*name) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    continue;
                }
                return Ok(Some(trimmed.to_string()));
            }
            Some(Value::Number(n)) => return Ok(Some(n.to_string())),
            Some(_) => {
                return Err(malformed(format!("field '{}' must be a string or number", name)));
            }
        }
    }
    Ok(None)
}

/// Longest call accepted from a PBX (7 days)
pub const MAX_DURATION_SECONDS: i64 = 7 * 24 * 3600;

fn parse_duration(name: &str, value: &Value) -> Result<i64, PipelineError> {
    let seconds = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(round_seconds)),
        Value::String(s) => parse_duration_text(s.trim()),
        _ => None,
    };

    match seconds {
        Some(s) if (0..=MAX_DURATION_SECONDS).contains(&s) => Ok(s),
        _ => Err(malformed(format!("field '{}' is not a valid duration", name))),
    }
}

fn round_seconds(value: f64) -> Option<i64> {
    let rounded = value.round();
    if rounded.is_finite() && rounded.abs() <= MAX_DURATION_SECONDS as f64 {
        Some(rounded as i64)
    } else {
        None
    }
}

/// Seconds as an integer, a decimal, or `HH:MM:SS`
fn parse_duration_text(text: &str) -> Option<i64> {
    if let Ok(seconds) = text.parse::<i64>() {
        return Some(seconds);
    }
    if let Ok(seconds) = text.parse::<f64>() {
        return round_seconds(seconds);
    }

    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() == 3 {
        let h = parts[0].parse::<i64>().ok()?;
        let m = parts[1].parse::<i64>().ok()?;
        let s = parts[2].split('.').next()?.parse::<i64>().ok()?;
        return h
            .checked_mul(3600)?
            .checked_add(m.checked_mul(60)?)?
            .checked_add(s);
    }
    None
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS` (taken as UTC), or unix epoch seconds
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, PipelineError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(epoch) = raw.parse::<i64>() {
        if let Some(dt) = DateTime::from_timestamp(epoch, 0) {
            return Ok(dt);
        }
    }
    Err(malformed(format!("unparseable start time '{}'", raw)))
}
