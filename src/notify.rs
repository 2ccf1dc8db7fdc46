use anyhow::Context;
use chrono::Utc;
use rusqlite::Connection;
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

use crate::db;

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_SENT: &str = "sent";
pub const STATUS_FAILED: &str = "failed";

const DEFAULT_FROM_ADDR: &str = "noreply@campusrec.local";
const DEFAULT_MAX_ATTEMPTS: i64 = 3;

/// Delivery seam. The engine only ever queues outbox rows; draining pushes
/// them through this trait so the transport can be swapped without touching
/// workflow state handling.
pub trait NotificationSender {
    fn send(&mut self, from: &str, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Default transport: append one JSON line per delivery to a spool file under
/// the workspace. Rendering real mail out of the spool is someone else's job.
pub struct SpoolSender {
    spool_path: std::path::PathBuf,
}

impl SpoolSender {
    pub fn new(workspace: &Path) -> Self {
        Self {
            spool_path: workspace.join("outbox").join("sent.ndjson"),
        }
    }
}

impl NotificationSender for SpoolSender {
    fn send(&mut self, from: &str, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.spool_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create spool dir {}", parent.to_string_lossy())
            })?;
        }
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.spool_path)
            .with_context(|| {
                format!("failed to open spool {}", self.spool_path.to_string_lossy())
            })?;
        let line = serde_json::json!({
            "from": from,
            "to": to,
            "subject": subject,
            "body": body,
            "sentAt": Utc::now().to_rfc3339(),
        });
        writeln!(f, "{}", line).context("failed to append spool line")?;
        Ok(())
    }
}

/// Queue a notification intent. Callers invoke this inside the same
/// transaction as the state change it describes, so a rolled-back operation
/// leaves no orphan intent behind.
pub fn queue(conn: &Connection, to_addr: &str, subject: &str, body: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO notification_outbox(id, to_addr, subject, body, status, attempts, created_at)
         VALUES(?, ?, ?, ?, ?, 0, ?)",
        (
            Uuid::new_v4().to_string(),
            to_addr,
            subject,
            body,
            STATUS_QUEUED,
            Utc::now().to_rfc3339(),
        ),
    )?;
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct DrainSummary {
    pub sent: usize,
    pub failed: usize,
    pub remaining: i64,
}

fn sender_settings(conn: &Connection) -> (String, i64) {
    let section = db::settings_get_json(conn, "setup.notifications")
        .ok()
        .flatten()
        .unwrap_or(serde_json::Value::Null);
    let from = section
        .get("fromAddr")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(DEFAULT_FROM_ADDR)
        .to_string();
    let max_attempts = section
        .get("maxAttempts")
        .and_then(|v| v.as_i64())
        .filter(|n| (1..=10).contains(n))
        .unwrap_or(DEFAULT_MAX_ATTEMPTS);
    (from, max_attempts)
}

/// Walk queued rows oldest-first through the sender. Delivery failure marks
/// the row, never the caller: attempts and last_error accumulate until the
/// attempt cap flips the row to failed.
pub fn drain_outbox(
    conn: &Connection,
    sender: &mut dyn NotificationSender,
) -> anyhow::Result<DrainSummary> {
    let (from_addr, max_attempts) = sender_settings(conn);

    let mut stmt = conn.prepare(
        "SELECT id, to_addr, subject, body, attempts
         FROM notification_outbox
         WHERE status = ?
         ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map([STATUS_QUEUED], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut summary = DrainSummary::default();
    for (id, to_addr, subject, body, attempts) in rows {
        match sender.send(&from_addr, &to_addr, &subject, &body) {
            Ok(()) => {
                conn.execute(
                    "UPDATE notification_outbox
                     SET status = ?, attempts = ?, sent_at = ?, last_error = NULL
                     WHERE id = ?",
                    (STATUS_SENT, attempts + 1, Utc::now().to_rfc3339(), &id),
                )?;
                summary.sent += 1;
            }
            Err(e) => {
                let attempts = attempts + 1;
                let status = if attempts >= max_attempts {
                    STATUS_FAILED
                } else {
                    STATUS_QUEUED
                };
                conn.execute(
                    "UPDATE notification_outbox
                     SET status = ?, attempts = ?, last_error = ?
                     WHERE id = ?",
                    (status, attempts, e.to_string(), &id),
                )?;
                summary.failed += 1;
            }
        }
    }

    summary.remaining = conn.query_row(
        "SELECT COUNT(*) FROM notification_outbox WHERE status = ?",
        [STATUS_QUEUED],
        |r| r.get(0),
    )?;
    Ok(summary)
}
