//! Append-only NDJSON event logs — input edits and produced artefacts —
//! with lazy, restartable replay in append order.

use crate::core::types::{ArtefactEvent, InputEvent};
use crate::store::{artefacts_log_path, inputs_log_path, Store};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;

/// Generate an ISO 8601 UTC timestamp. No chrono dependency.
pub fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let mut days = secs / 86400;
    let rem = secs % 86400;
    let (hours, minutes, seconds) = (rem / 3600, (rem % 3600) / 60, rem % 60);

    let mut year = 1970u64;
    while days >= days_in_year(year) {
        days -= days_in_year(year);
        year += 1;
    }

    let mut month = 1u64;
    loop {
        let len = days_in_month(year, month);
        if days < len {
            break;
        }
        days -= len;
        month += 1;
    }

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        days + 1,
        hours,
        minutes,
        seconds
    )
}

fn is_leap(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_year(year: u64) -> u64 {
    if is_leap(year) {
        366
    } else {
        365
    }
}

fn days_in_month(year: u64, month: u64) -> u64 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        _ => {
            if is_leap(year) {
                29
            } else {
                28
            }
        }
    }
}

/// Generate a run id.
pub fn generate_run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("run-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Append an input edit to the project's input log.
pub fn append_input(store: &dyn Store, project: &str, event: &InputEvent) -> Result<(), String> {
    let json = serde_json::to_string(event).map_err(|e| format!("JSON serialize error: {}", e))?;
    store.append_line(&inputs_log_path(project), &json)
}

/// Append a produced artefact to the project's artefact log.
pub fn append_artefact(
    store: &dyn Store,
    project: &str,
    event: &ArtefactEvent,
) -> Result<(), String> {
    let json = serde_json::to_string(event).map_err(|e| format!("JSON serialize error: {}", e))?;
    store.append_line(&artefacts_log_path(project), &json)
}

/// Lazy iterator over one event log, in append order. Restartable by
/// streaming again; finite — it ends at the log's current tail.
pub struct EventStream<T> {
    buf: String,
    pos: usize,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> EventStream<T> {
    fn new(buf: String) -> Self {
        Self { buf, pos: 0, _marker: PhantomData }
    }

    pub fn empty() -> Self {
        Self::new(String::new())
    }
}

impl<T: DeserializeOwned> Iterator for EventStream<T> {
    type Item = Result<T, String>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.buf.len() {
            let rest = &self.buf[self.pos..];
            let (line, consumed) = match rest.find('\n') {
                Some(nl) => (&rest[..nl], nl + 1),
                None => (rest, rest.len()),
            };
            self.pos += consumed;

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return Some(
                serde_json::from_str(line).map_err(|e| format!("corrupt event line: {}", e)),
            );
        }
        None
    }
}

fn stream_log<T: DeserializeOwned>(
    store: &dyn Store,
    path: &str,
) -> Result<EventStream<T>, String> {
    if !store.exists(path) {
        return Ok(EventStream::empty());
    }
    let bytes = store.read(path)?;
    let buf = String::from_utf8(bytes).map_err(|e| format!("event log not UTF-8: {}", e))?;
    Ok(EventStream::new(buf))
}

/// Replay input events in append order.
pub fn stream_inputs(store: &dyn Store, project: &str) -> Result<EventStream<InputEvent>, String> {
    stream_log(store, &inputs_log_path(project))
}

/// Replay artefact events in append order.
pub fn stream_artefacts(
    store: &dyn Store,
    project: &str,
) -> Result<EventStream<ArtefactEvent>, String> {
    stream_log(store, &artefacts_log_path(project))
}
