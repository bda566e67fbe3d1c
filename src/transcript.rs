use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only JSONL log of one CLI session
pub struct Transcript {
    pub path: PathBuf,
    session_id: String,
    file: File,
}

#[derive(Serialize)]
struct Event<'a> {
    ts: DateTime<Utc>,
    session_id: &'a str,
    #[serde(rename = "type")]
    event_type: &'a str,
    #[serde(flatten)]
    data: serde_json::Value,
}

impl Transcript {
    pub fn new(path: &Path, session_id: &str) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            session_id: session_id.to_string(),
            file,
        })
    }

    pub fn log(&mut self, event_type: &str, data: serde_json::Value) -> Result<()> {
        let event = Event {
            ts: Utc::now(),
            session_id: &self.session_id,
            event_type,
            data,
        };
        let line = serde_json::to_string(&event)?;
        writeln!(self.file, "{}", line)?;
        self.file.flush()?;
        Ok(())
    }

    pub fn command(&mut self, line: &str) -> Result<()> {
        self.log("command", json!({ "line": line }))
    }

    /// Wizard moved to `step`
    pub fn auth_step(&mut self, step: &str, provider: Option<&str>) -> Result<()> {
        self.log("auth_step", json!({ "step": step, "provider": provider }))
    }

    pub fn auth_error(&mut self, step: &str, message: &str) -> Result<()> {
        self.log("auth_error", json!({ "step": step, "message": message }))
    }

    /// Log a completed backend request
    pub fn request(&mut self, method: &str, path: &str, status: u16, duration_ms: u64) -> Result<()> {
        self.log(
            "request",
            json!({
                "method": method,
                "path": path,
                "status": status,
                "duration_ms": duration_ms,
            }),
        )
    }

    /// Log a cache maintenance action
    pub fn cache(&mut self, action: &str, entries: usize) -> Result<()> {
        self.log("cache", json!({ "action": action, "entries": entries }))
    }

    pub fn logout(&mut self, user_id: Option<&str>) -> Result<()> {
        self.log("logout", json!({ "user_id": user_id }))
    }

    pub fn profile_saved(&mut self, action: &str, profile_id: &str) -> Result<()> {
        self.log(
            "profile_saved",
            json!({ "action": action, "profile_id": profile_id }),
        )
    }
}
