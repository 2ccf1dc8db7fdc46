use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::workflow::{self, Decision, ListFilter, WorkflowError};
use rusqlite::Connection;
use serde_json::{json, Value};

fn get_required_str(params: &Value, key: &str) -> Result<String, WorkflowError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| WorkflowError::Validation(format!("missing {}", key)))
}

fn record_response(record: workflow::WorkflowRecord) -> Value {
    json!({ "record": serde_json::to_value(&record).unwrap_or(Value::Null) })
}

fn submit(conn: &Connection, params: &Value) -> Result<Value, WorkflowError> {
    let subject = get_required_str(params, "subjectUserId")?;
    let kind = get_required_str(params, "kind")?;
    let actor = get_required_str(params, "actorId")?;
    let payload = params.get("payload").cloned().unwrap_or(json!({}));
    let record = workflow::submit(conn, &subject, &kind, payload, &actor)?;
    Ok(record_response(record))
}

fn resubmit(conn: &Connection, params: &Value) -> Result<Value, WorkflowError> {
    let record_id = get_required_str(params, "recordId")?;
    let actor = get_required_str(params, "actorId")?;
    let payload = params.get("payload").cloned().unwrap_or(json!({}));
    let record = workflow::resubmit(conn, &record_id, &actor, payload)?;
    Ok(record_response(record))
}

fn resolve(conn: &Connection, params: &Value) -> Result<Value, WorkflowError> {
    let record_id = get_required_str(params, "recordId")?;
    let approver = get_required_str(params, "approverId")?;
    let decision_raw = get_required_str(params, "decision")?;
    let decision = Decision::parse(&decision_raw).ok_or_else(|| {
        WorkflowError::Validation(format!(
            "decision must be approve or reject, got {}",
            decision_raw
        ))
    })?;
    let comment = params.get("comment").and_then(|v| v.as_str());
    let record = workflow::resolve(conn, &record_id, &approver, decision, comment)?;
    Ok(record_response(record))
}

fn delete(conn: &Connection, params: &Value) -> Result<Value, WorkflowError> {
    let record_id = get_required_str(params, "recordId")?;
    let actor = get_required_str(params, "actorId")?;
    workflow::delete(conn, &record_id, &actor)?;
    Ok(json!({ "deleted": true, "recordId": record_id }))
}

fn get(conn: &Connection, params: &Value) -> Result<Value, WorkflowError> {
    let record_id = get_required_str(params, "recordId")?;
    let record = workflow::get_record(conn, &record_id)?
        .ok_or_else(|| WorkflowError::NotFound(format!("record {} not found", record_id)))?;
    Ok(record_response(record))
}

fn parse_filter(params: &Value) -> ListFilter {
    ListFilter {
        subject_user_id: params
            .get("subjectUserId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        approver_id: params
            .get("approverId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        kind: params
            .get("kind")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        limit: params.get("limit").and_then(|v| v.as_i64()).unwrap_or(0),
    }
}

fn list(conn: &Connection, params: &Value, pending: bool) -> Result<Value, WorkflowError> {
    let mut filter = parse_filter(params);
    if filter.limit <= 0 {
        // Fall back to the workspace page-size preference.
        filter.limit = db::settings_get_json(conn, "setup.records")
            .ok()
            .flatten()
            .and_then(|v| v.get("pageSize").and_then(|n| n.as_i64()))
            .unwrap_or(200);
    }
    let records = workflow::list_records(conn, pending, &filter)?;
    let records: Vec<Value> = records
        .into_iter()
        .map(|r| serde_json::to_value(&r).unwrap_or(Value::Null))
        .collect();
    Ok(json!({ "records": records }))
}

fn messages(conn: &Connection, params: &Value) -> Result<Value, WorkflowError> {
    let record_id = get_required_str(params, "recordId")?;
    if workflow::get_record(conn, &record_id)?.is_none() {
        return Err(WorkflowError::NotFound(format!(
            "record {} not found",
            record_id
        )));
    }
    let messages = workflow::list_messages(conn, &record_id)?;
    Ok(json!({ "messages": messages }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "records.submit"
            | "records.resubmit"
            | "records.resolve"
            | "records.delete"
            | "records.get"
            | "records.listPending"
            | "records.listResolved"
            | "records.messages"
    );
    if !handled {
        return None;
    }

    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let result = match req.method.as_str() {
        "records.submit" => submit(conn, &req.params),
        "records.resubmit" => resubmit(conn, &req.params),
        "records.resolve" => resolve(conn, &req.params),
        "records.delete" => delete(conn, &req.params),
        "records.get" => get(conn, &req.params),
        "records.listPending" => list(conn, &req.params, true),
        "records.listResolved" => list(conn, &req.params, false),
        "records.messages" => messages(conn, &req.params),
        _ => unreachable!(),
    };

    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, e.code(), e.message(), None),
    })
}
