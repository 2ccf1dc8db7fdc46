use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::notify::{self, SpoolSender};
use serde_json::json;

fn handle_drain(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (Some(conn), Some(workspace)) = (state.db.as_ref(), state.workspace.as_ref()) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut sender = SpoolSender::new(workspace);
    match notify::drain_outbox(conn, &mut sender) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "sent": summary.sent,
                "failed": summary.failed,
                "remaining": summary.remaining,
            }),
        ),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let status = req.params.get("status").and_then(|v| v.as_str());
    let mut stmt = match conn.prepare(
        "SELECT id, to_addr, subject, body, status, attempts, last_error, created_at, sent_at
         FROM notification_outbox
         WHERE (?1 IS NULL OR status = ?1)
         ORDER BY created_at, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([status], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "to": r.get::<_, String>(1)?,
                "subject": r.get::<_, String>(2)?,
                "body": r.get::<_, String>(3)?,
                "status": r.get::<_, String>(4)?,
                "attempts": r.get::<_, i64>(5)?,
                "lastError": r.get::<_, Option<String>>(6)?,
                "createdAt": r.get::<_, String>(7)?,
                "sentAt": r.get::<_, Option<String>>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(notifications) => ok(&req.id, json!({ "notifications": notifications })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "outbox.drain" => Some(handle_drain(state, req)),
        "outbox.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
