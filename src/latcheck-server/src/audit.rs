//! Pipe-separated audit trail.
//!
//! One line per security-relevant event:
//! `timestamp|user_id|action|SUCCESS/FAILURE|details`. The writer is a
//! cheap-clone handle; `disabled()` produces a no-op sink for tests and for
//! deployments that do not configure an audit path.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::error;

/// Handle to the audit sink. Clones share the same file.
#[derive(Clone)]
pub struct AuditLog {
    sink: Option<Arc<Mutex<BufWriter<File>>>>,
}

impl AuditLog {
    /// Open (or create) the audit file in append mode.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening audit log {}", path.display()))?;
        Ok(Self {
            sink: Some(Arc::new(Mutex::new(BufWriter::new(file)))),
        })
    }

    /// A sink that drops every event.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Append one event line. Failures are logged, never propagated: an
    /// unwritable audit file must not take down request handling.
    pub fn record(&self, user_id: &str, action: &str, success: bool, details: &str) {
        let Some(sink) = &self.sink else {
            return;
        };
        let line = format_line(user_id, action, success, details);
        let mut writer = sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.flush())
        {
            error!(error = %e, "failed to write audit line");
        }
    }
}

fn format_line(user_id: &str, action: &str, success: bool, details: &str) -> String {
    let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let outcome = if success { "SUCCESS" } else { "FAILURE" };
    // Keep the field separator unambiguous.
    let details = details.replace('|', "/");
    format!("{timestamp}|{user_id}|{action}|{outcome}|{details}\n")
}
