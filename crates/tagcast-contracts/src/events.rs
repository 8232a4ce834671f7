use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Shared JSONL sink for engine events. Every line carries `type`,
/// `session_id` and `ts`; payload keys are applied afterwards and win on
/// collision.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<Sink>,
}

#[derive(Debug)]
struct Sink {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Sink {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Appends one event and returns it as written.
    pub fn emit(&self, event_type: &str, extra: EventPayload) -> anyhow::Result<Value> {
        let mut event = payload([
            ("type", Value::from(event_type)),
            ("session_id", Value::from(self.session_id())),
            ("ts", Value::from(now_utc_iso())),
        ]);
        event.extend(extra);
        self.append_line(&serde_json::to_string(&event)?)?;
        Ok(Value::Object(event))
    }

    /// Emits and swallows write failures after reporting them on stderr;
    /// a broken log never stops a processing pass.
    pub fn record(&self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.emit(event_type, payload) {
            eprintln!("tagcast events: failed writing {event_type}: {err:#}");
        }
    }

    fn append_line(&self, line: &str) -> anyhow::Result<()> {
        let path = &self.inner.path;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed creating {}", dir.display()))?;
        }
        let _held = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("events lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed opening {}", path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

/// Builds a payload from key/value pairs.
pub fn payload<I, K>(pairs: I) -> EventPayload
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value))
        .collect()
}

/// Parses every line of an events file, oldest first.
pub fn read_events(path: &Path) -> anyhow::Result<Vec<Value>> {
    let raw = std::fs::read_to_string(path)?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<Value>(line).map_err(anyhow::Error::from))
        .collect()
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    #[test]
    fn each_event_is_one_line_with_session_and_timestamp() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("logs").join("events.jsonl");
        let writer = EventWriter::new(&path, "session-123");

        let emitted = writer.emit("message_mounted", payload([("message", json!(4))]))?;

        let events = read_events(&path)?;
        assert_eq!(events, vec![emitted.clone()]);
        assert_eq!(emitted["type"], "message_mounted");
        assert_eq!(emitted["session_id"], "session-123");
        assert_eq!(emitted["message"], 4);
        DateTime::parse_from_rfc3339(emitted["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn payload_keys_replace_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "session-123");
        let emitted = writer.emit(
            "slot_generated",
            payload([("type", json!("slot_restored")), ("session_id", json!("other"))]),
        )?;
        assert_eq!(emitted["type"], "slot_restored");
        assert_eq!(emitted["session_id"], "other");
        Ok(())
    }

    #[test]
    fn clones_share_one_file_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "session-123");
        let engine_side = writer.clone();

        writer.emit("slot_generated", EventPayload::new())?;
        engine_side.emit("processing_finished", EventPayload::new())?;

        let types: Vec<Value> = read_events(&path)?
            .into_iter()
            .map(|event| event["type"].clone())
            .collect();
        assert_eq!(types, vec![json!("slot_generated"), json!("processing_finished")]);
        Ok(())
    }

    #[test]
    fn record_survives_unwritable_path() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, "file, not a directory")?;
        let writer = EventWriter::new(blocker.join("events.jsonl"), "session-123");
        writer.record("slot_failed", payload([("slot", json!("image-0"))]));
        assert!(!blocker.join("events.jsonl").exists());
        Ok(())
    }
}
