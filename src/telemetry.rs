use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::util::{ensure_directory, now_utc_string};

const REDACTED: &str = "[redacted]";
const SECRET_KEY_MARKERS: [&str; 8] = [
    "api_key",
    "apikey",
    "api-key",
    "token",
    "secret",
    "password",
    "authorization",
    "cookie",
];

/// Append-only `events.jsonl` writer. Cloning shares the file; `scoped` returns a
/// handle that stamps every event with a step name and attempt number.
#[derive(Clone)]
pub struct EventSink {
    run_id: String,
    step: Option<String>,
    attempt: Option<u32>,
    file: Option<Arc<Mutex<File>>>,
}

impl EventSink {
    pub fn open(path: &Path, run_id: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            ensure_directory(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open event stream: {}", path.display()))?;

        Ok(Self {
            run_id: run_id.to_string(),
            step: None,
            attempt: None,
            file: Some(Arc::new(Mutex::new(file))),
        })
    }

    pub fn disabled() -> Self {
        Self {
            run_id: String::new(),
            step: None,
            attempt: None,
            file: None,
        }
    }

    pub fn scoped(&self, step: &str, attempt: u32) -> Self {
        Self {
            run_id: self.run_id.clone(),
            step: Some(step.to_string()),
            attempt: Some(attempt),
            file: self.file.clone(),
        }
    }

    pub fn emit(&self, event: &str, fields: Value) {
        let Some(file) = &self.file else {
            return;
        };

        let line = json!({
            "ts": now_utc_string(),
            "runId": self.run_id,
            "step": self.step,
            "attempt": self.attempt,
            "event": event,
            "fields": redact_value(fields),
        });

        let Ok(mut serialized) = serde_json::to_vec(&line) else {
            return;
        };
        serialized.push(b'\n');

        match file.lock() {
            Ok(mut guard) => {
                if let Err(err) = guard.write_all(&serialized) {
                    warn!(error = %err, event, "failed to append telemetry event");
                }
            }
            Err(_) => warn!(event, "telemetry writer lock poisoned"),
        }
    }
}

fn is_secret_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SECRET_KEY_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

pub fn redact_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, inner) in map {
                if is_secret_key(&key) {
                    out.insert(key, Value::String(REDACTED.to_string()));
                } else {
                    out.insert(key, redact_value(inner));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(redact_value).collect()),
        Value::String(text) => Value::String(redact_url_query(&text)),
        other => other,
    }
}

pub fn redact_url_query(text: &str) -> String {
    let trimmed = text.trim();
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return text.to_string();
    }

    match url::Url::parse(trimmed) {
        Ok(mut parsed) if parsed.query().is_some() => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            format!("{}?{}", parsed, REDACTED)
        }
        _ => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_keys_are_replaced_recursively() {
        let value = redact_value(json!({
            "apiKey": "sk-123",
            "nested": {"Authorization": "Bearer abc", "count": 2},
            "items": [{"session_token": "t"}],
        }));
        assert_eq!(value["apiKey"], REDACTED);
        assert_eq!(value["nested"]["Authorization"], REDACTED);
        assert_eq!(value["nested"]["count"], 2);
        assert_eq!(value["items"][0]["session_token"], REDACTED);
    }

    #[test]
    fn url_query_strings_are_stripped() {
        assert_eq!(
            redact_url_query("https://example.lg.jp/search?q=gomi&key=abc"),
            "https://example.lg.jp/search?[redacted]"
        );
        assert_eq!(
            redact_url_query("https://example.lg.jp/gomi.csv"),
            "https://example.lg.jp/gomi.csv"
        );
        assert_eq!(redact_url_query("plain text"), "plain text");
    }

    #[test]
    fn scoped_events_carry_step_and_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = EventSink::open(&path, "run-1").unwrap();
        sink.scoped("discover", 2)
            .emit("round-start", json!({"url": "https://a.lg.jp/?x=1"}));

        let raw = std::fs::read_to_string(&path).unwrap();
        let line: Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(line["step"], "discover");
        assert_eq!(line["attempt"], 2);
        assert_eq!(line["fields"]["url"], "https://a.lg.jp/?[redacted]");
    }
}
