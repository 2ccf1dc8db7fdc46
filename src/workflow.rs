use chrono::Utc;
use rusqlite::{params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::grades;
use crate::kinds::{self, RecordKind};
use crate::notify;

pub const ROLE_STUDENT: &str = "student";
pub const ROLE_TUTOR: &str = "tutor";
pub const ROLE_ADMIN: &str = "admin";

pub const STATUS_UNRESOLVED: &str = "unresolved";
pub const STATUS_APPROVED: &str = "approved";
pub const STATUS_REJECTED: &str = "rejected";

#[derive(Debug)]
pub enum WorkflowError {
    Validation(String),
    NotFound(String),
    Forbidden(String),
    AlreadyResolved,
    Store {
        op: &'static str,
        source: rusqlite::Error,
    },
}

impl WorkflowError {
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::Validation(_) => "bad_params",
            WorkflowError::NotFound(_) => "not_found",
            WorkflowError::Forbidden(_) => "forbidden",
            WorkflowError::AlreadyResolved => "already_resolved",
            WorkflowError::Store { op, .. } => match *op {
                "insert" => "db_insert_failed",
                "update" => "db_update_failed",
                "delete" => "db_delete_failed",
                "tx" => "db_tx_failed",
                "commit" => "db_commit_failed",
                _ => "db_query_failed",
            },
        }
    }

    pub fn message(&self) -> String {
        match self {
            WorkflowError::Validation(m)
            | WorkflowError::NotFound(m)
            | WorkflowError::Forbidden(m) => m.clone(),
            WorkflowError::AlreadyResolved => "record is already resolved".to_string(),
            WorkflowError::Store { source, .. } => source.to_string(),
        }
    }
}

fn store(op: &'static str) -> impl Fn(rusqlite::Error) -> WorkflowError {
    move |source| WorkflowError::Store { op, source }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn parse(s: &str) -> Option<Decision> {
        match s {
            "approve" => Some(Decision::Approve),
            "reject" => Some(Decision::Reject),
            _ => None,
        }
    }

    fn status(&self) -> &'static str {
        match self {
            Decision::Approve => STATUS_APPROVED,
            Decision::Reject => STATUS_REJECTED,
        }
    }

    fn past_tense(&self) -> &'static str {
        match self {
            Decision::Approve => "approved",
            Decision::Reject => "rejected",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRecord {
    pub id: String,
    pub kind: String,
    pub subject_user_id: String,
    pub payload: Value,
    pub pending: bool,
    pub approval_status: String,
    pub approver_id: Option<String>,
    pub approved_at: Option<String>,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub full_name: String,
    pub email: String,
    pub role: String,
    pub tutor_id: Option<String>,
    pub active: bool,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn load_user(conn: &Connection, user_id: &str) -> Result<Option<UserRow>, WorkflowError> {
    conn.query_row(
        "SELECT id, full_name, email, role, tutor_id, active FROM users WHERE id = ?",
        [user_id],
        |r| {
            Ok(UserRow {
                id: r.get(0)?,
                full_name: r.get(1)?,
                email: r.get(2)?,
                role: r.get(3)?,
                tutor_id: r.get(4)?,
                active: r.get::<_, i64>(5)? != 0,
            })
        },
    )
    .optional()
    .map_err(store("query"))
}

/// Resolve the subject's assigned tutor. Must fail explicitly, never default:
/// a submission without a reachable approver is rejected before any write.
pub fn resolve_approver(conn: &Connection, subject: &UserRow) -> Result<UserRow, WorkflowError> {
    let tutor_id = subject.tutor_id.as_deref().ok_or_else(|| {
        WorkflowError::NotFound(format!("no tutor assigned for user {}", subject.id))
    })?;
    let tutor = load_user(conn, tutor_id)?.ok_or_else(|| {
        WorkflowError::NotFound(format!("assigned tutor {} does not exist", tutor_id))
    })?;
    if !tutor.active {
        return Err(WorkflowError::NotFound(format!(
            "assigned tutor {} is inactive",
            tutor_id
        )));
    }
    Ok(tutor)
}

fn record_title(kind_tag: &str, payload: &Value) -> String {
    // Most kinds carry a "title"; fall back to the kind tag so notification
    // bodies always have something readable.
    payload
        .get("title")
        .or_else(|| payload.get("company"))
        .or_else(|| payload.get("reason"))
        .or_else(|| payload.get("institution"))
        .or_else(|| payload.get("course_title"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| kind_tag.to_string())
}

/// For NPTEL enrollments the letter grade is derived, never client-supplied.
/// Recomputed on every submit/resubmit so edits to marks stay consistent.
fn enrich_nptel_grade(conn: &Connection, kind: RecordKind, payload: &mut Value) -> Result<(), WorkflowError> {
    if kind != RecordKind::NptelEnrollment {
        return Ok(());
    }
    let marks = match payload.get("marks") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let Some(marks) = marks else {
        return Err(WorkflowError::Validation(
            "marks must be a number".to_string(),
        ));
    };
    if !marks.is_finite() || marks < 0.0 {
        return Err(WorkflowError::Validation(
            "marks must be a non-negative number".to_string(),
        ));
    }
    let course_code = payload
        .get("course_code")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let scale = grades::load_scale(conn, &course_code).map_err(store("query"))?;
    if let Some(scale) = scale {
        if let Some(obj) = payload.as_object_mut() {
            obj.insert(
                "grade".to_string(),
                Value::String(grades::compute_grade(marks, &scale).to_string()),
            );
        }
    }
    Ok(())
}

fn validate_payload(kind: RecordKind, payload: &Value) -> Result<(), WorkflowError> {
    if !payload.is_object() {
        return Err(WorkflowError::Validation(
            "payload must be an object".to_string(),
        ));
    }
    let missing = kinds::missing_required_fields(kind, payload);
    if !missing.is_empty() {
        return Err(WorkflowError::Validation(format!(
            "missing required fields: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

pub fn submit(
    conn: &Connection,
    subject_user_id: &str,
    kind_tag: &str,
    payload: Value,
    actor_id: &str,
) -> Result<WorkflowRecord, WorkflowError> {
    let kind = RecordKind::parse(kind_tag)
        .ok_or_else(|| WorkflowError::Validation(format!("unknown kind: {}", kind_tag)))?;
    validate_payload(kind, &payload)?;

    let subject = load_user(conn, subject_user_id)?
        .ok_or_else(|| WorkflowError::NotFound(format!("user {} not found", subject_user_id)))?;
    if subject.role != ROLE_STUDENT {
        return Err(WorkflowError::Validation(format!(
            "records can only be submitted for student users, {} is {}",
            subject.id, subject.role
        )));
    }
    let actor = load_user(conn, actor_id)?
        .ok_or_else(|| WorkflowError::NotFound(format!("actor {} not found", actor_id)))?;
    if actor.id != subject.id && actor.role != ROLE_ADMIN {
        return Err(WorkflowError::Forbidden(
            "only the subject or an admin may submit".to_string(),
        ));
    }

    // Hard precondition, checked before any write.
    let approver = resolve_approver(conn, &subject)?;

    let mut payload = payload;
    enrich_nptel_grade(conn, kind, &mut payload)?;

    let record = WorkflowRecord {
        id: Uuid::new_v4().to_string(),
        kind: kind.as_str().to_string(),
        subject_user_id: subject.id.clone(),
        payload,
        pending: true,
        approval_status: STATUS_UNRESOLVED.to_string(),
        approver_id: None,
        approved_at: None,
        created_by: actor_id.to_string(),
        updated_by: actor_id.to_string(),
        created_at: now_rfc3339(),
        updated_at: now_rfc3339(),
    };

    let tx = conn.unchecked_transaction().map_err(store("tx"))?;
    if let Err(e) = insert_record(&tx, &record) {
        let _ = tx.rollback();
        return Err(e);
    }
    let title = record_title(kind.as_str(), &record.payload);
    if let Err(e) = notify::queue(
        &tx,
        &approver.email,
        &format!("New {} submission from {}", kind.as_str(), subject.full_name),
        &format!(
            "{} submitted a {} record \"{}\" for your review (record {}).",
            subject.full_name,
            kind.as_str(),
            title,
            record.id
        ),
    ) {
        let _ = tx.rollback();
        return Err(store("insert")(e));
    }
    tx.commit().map_err(store("commit"))?;

    Ok(record)
}

fn insert_record(conn: &Connection, record: &WorkflowRecord) -> Result<(), WorkflowError> {
    conn.execute(
        "INSERT INTO workflow_records(
            id, kind, subject_user_id, payload, pending, approval_status,
            approver_id, approved_at, created_by, updated_by, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &record.id,
            &record.kind,
            &record.subject_user_id,
            serde_json::to_string(&record.payload).unwrap_or_else(|_| "{}".to_string()),
            record.pending as i64,
            &record.approval_status,
            &record.approver_id,
            &record.approved_at,
            &record.created_by,
            &record.updated_by,
            &record.created_at,
            &record.updated_at,
        ),
    )
    .map(|_| ())
    .map_err(store("insert"))
}

pub fn get_record(conn: &Connection, record_id: &str) -> Result<Option<WorkflowRecord>, WorkflowError> {
    conn.query_row(
        "SELECT id, kind, subject_user_id, payload, pending, approval_status,
                approver_id, approved_at, created_by, updated_by, created_at, updated_at
         FROM workflow_records WHERE id = ?",
        [record_id],
        row_to_record,
    )
    .optional()
    .map_err(store("query"))
}

fn row_to_record(r: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowRecord> {
    let payload_raw: String = r.get(3)?;
    Ok(WorkflowRecord {
        id: r.get(0)?,
        kind: r.get(1)?,
        subject_user_id: r.get(2)?,
        payload: serde_json::from_str(&payload_raw).unwrap_or_else(|_| json!({})),
        pending: r.get::<_, i64>(4)? != 0,
        approval_status: r.get(5)?,
        approver_id: r.get(6)?,
        approved_at: r.get(7)?,
        created_by: r.get(8)?,
        updated_by: r.get(9)?,
        created_at: r.get(10)?,
        updated_at: r.get(11)?,
    })
}

pub fn resubmit(
    conn: &Connection,
    record_id: &str,
    actor_id: &str,
    new_payload: Value,
) -> Result<WorkflowRecord, WorkflowError> {
    let record = get_record(conn, record_id)?
        .ok_or_else(|| WorkflowError::NotFound(format!("record {} not found", record_id)))?;
    let actor = load_user(conn, actor_id)?
        .ok_or_else(|| WorkflowError::NotFound(format!("actor {} not found", actor_id)))?;
    if actor.id != record.subject_user_id && actor.role != ROLE_ADMIN {
        return Err(WorkflowError::Forbidden(
            "only the subject or an admin may resubmit".to_string(),
        ));
    }

    let kind = RecordKind::parse(&record.kind)
        .ok_or_else(|| WorkflowError::Validation(format!("unknown kind: {}", record.kind)))?;
    let mut merged = kinds::merge_payload(&record.payload, &new_payload);
    validate_payload(kind, &merged)?;
    enrich_nptel_grade(conn, kind, &mut merged)?;

    let subject = load_user(conn, &record.subject_user_id)?.ok_or_else(|| {
        WorkflowError::NotFound(format!("user {} not found", record.subject_user_id))
    })?;
    // Unlike submit, a missing tutor does not block a resubmission; it only
    // suppresses the review notification.
    let approver = resolve_approver(conn, &subject).ok();

    let updated_at = now_rfc3339();
    let tx = conn.unchecked_transaction().map_err(store("tx"))?;
    let res = tx.execute(
        "UPDATE workflow_records
         SET payload = ?, pending = 1, approval_status = ?, approver_id = NULL,
             approved_at = NULL, updated_by = ?, updated_at = ?
         WHERE id = ?",
        (
            serde_json::to_string(&merged).unwrap_or_else(|_| "{}".to_string()),
            STATUS_UNRESOLVED,
            actor_id,
            &updated_at,
            record_id,
        ),
    );
    if let Err(e) = res {
        let _ = tx.rollback();
        return Err(store("update")(e));
    }
    if let Some(approver) = &approver {
        let title = record_title(kind.as_str(), &merged);
        if let Err(e) = notify::queue(
            &tx,
            &approver.email,
            &format!("Updated {} record requires review", kind.as_str()),
            &format!(
                "{} updated the {} record \"{}\" (record {}); it is pending again and requires review.",
                subject.full_name,
                kind.as_str(),
                title,
                record_id
            ),
        ) {
            let _ = tx.rollback();
            return Err(store("insert")(e));
        }
    }
    tx.commit().map_err(store("commit"))?;

    Ok(WorkflowRecord {
        payload: merged,
        pending: true,
        approval_status: STATUS_UNRESOLVED.to_string(),
        approver_id: None,
        approved_at: None,
        updated_by: actor_id.to_string(),
        updated_at,
        ..record
    })
}

pub fn resolve(
    conn: &Connection,
    record_id: &str,
    approver_id: &str,
    decision: Decision,
    comment: Option<&str>,
) -> Result<WorkflowRecord, WorkflowError> {
    let actor = load_user(conn, approver_id)?
        .ok_or_else(|| WorkflowError::NotFound(format!("approver {} not found", approver_id)))?;

    let tx = conn.unchecked_transaction().map_err(store("tx"))?;

    // Re-read inside the write transaction: two racing resolves must not both
    // pass the pending check.
    let record = match tx
        .query_row(
            "SELECT id, kind, subject_user_id, payload, pending, approval_status,
                    approver_id, approved_at, created_by, updated_by, created_at, updated_at
             FROM workflow_records WHERE id = ?",
            [record_id],
            row_to_record,
        )
        .optional()
    {
        Ok(Some(r)) => r,
        Ok(None) => {
            let _ = tx.rollback();
            return Err(WorkflowError::NotFound(format!(
                "record {} not found",
                record_id
            )));
        }
        Err(e) => {
            let _ = tx.rollback();
            return Err(store("query")(e));
        }
    };

    let subject = match load_user(&tx, &record.subject_user_id) {
        Ok(Some(u)) => u,
        Ok(None) => {
            let _ = tx.rollback();
            return Err(WorkflowError::NotFound(format!(
                "user {} not found",
                record.subject_user_id
            )));
        }
        Err(e) => {
            let _ = tx.rollback();
            return Err(e);
        }
    };
    let is_assigned_tutor = subject.tutor_id.as_deref() == Some(actor.id.as_str());
    if !is_assigned_tutor && actor.role != ROLE_ADMIN {
        let _ = tx.rollback();
        return Err(WorkflowError::Forbidden(
            "only the assigned tutor or an admin may resolve".to_string(),
        ));
    }
    if !record.pending {
        let _ = tx.rollback();
        return Err(WorkflowError::AlreadyResolved);
    }

    let approved_at = now_rfc3339();
    let status = decision.status();
    let res = tx.execute(
        "UPDATE workflow_records
         SET pending = 0, approval_status = ?, approver_id = ?, approved_at = ?,
             updated_by = ?, updated_at = ?
         WHERE id = ?",
        (status, approver_id, &approved_at, approver_id, &approved_at, record_id),
    );
    if let Err(e) = res {
        let _ = tx.rollback();
        return Err(store("update")(e));
    }

    if let Some(comment) = comment.map(str::trim).filter(|c| !c.is_empty()) {
        let res = tx.execute(
            "INSERT INTO record_messages(id, record_id, author_id, body, created_at)
             VALUES(?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                record_id,
                approver_id,
                comment,
                &approved_at,
            ),
        );
        if let Err(e) = res {
            let _ = tx.rollback();
            return Err(store("insert")(e));
        }
    }

    let title = record_title(&record.kind, &record.payload);
    let mut body = format!(
        "Your {} record \"{}\" (record {}) was {} by {}.",
        record.kind,
        title,
        record_id,
        decision.past_tense(),
        actor.full_name
    );
    if let Some(comment) = comment.map(str::trim).filter(|c| !c.is_empty()) {
        body.push_str(&format!(" Comment: {}", comment));
    }
    if let Err(e) = notify::queue(
        &tx,
        &subject.email,
        &format!("Your {} record was {}", record.kind, decision.past_tense()),
        &body,
    ) {
        let _ = tx.rollback();
        return Err(store("insert")(e));
    }

    tx.commit().map_err(store("commit"))?;

    Ok(WorkflowRecord {
        pending: false,
        approval_status: status.to_string(),
        approver_id: Some(approver_id.to_string()),
        approved_at: Some(approved_at.clone()),
        updated_by: approver_id.to_string(),
        updated_at: approved_at,
        ..record
    })
}

pub fn delete(conn: &Connection, record_id: &str, actor_id: &str) -> Result<(), WorkflowError> {
    let record = get_record(conn, record_id)?
        .ok_or_else(|| WorkflowError::NotFound(format!("record {} not found", record_id)))?;
    let actor = load_user(conn, actor_id)?
        .ok_or_else(|| WorkflowError::NotFound(format!("actor {} not found", actor_id)))?;
    let subject = load_user(conn, &record.subject_user_id)?.ok_or_else(|| {
        WorkflowError::NotFound(format!("user {} not found", record.subject_user_id))
    })?;

    let is_subject = actor.id == subject.id;
    let is_assigned_tutor = subject.tutor_id.as_deref() == Some(actor.id.as_str());
    if !is_subject && !is_assigned_tutor && actor.role != ROLE_ADMIN {
        return Err(WorkflowError::Forbidden(
            "only the subject, the assigned tutor, or an admin may delete".to_string(),
        ));
    }

    let title = record_title(&record.kind, &record.payload);

    let tx = conn.unchecked_transaction().map_err(store("tx"))?;
    if let Err(e) = tx.execute("DELETE FROM record_messages WHERE record_id = ?", [record_id]) {
        let _ = tx.rollback();
        return Err(store("delete")(e));
    }
    if let Err(e) = tx.execute("DELETE FROM workflow_records WHERE id = ?", [record_id]) {
        let _ = tx.rollback();
        return Err(store("delete")(e));
    }

    // Best-effort notices; a student with no tutor still gets their own.
    let notice = format!(
        "The {} record \"{}\" (record {}) was deleted by {}.",
        record.kind, title, record_id, actor.full_name
    );
    let subject_line = format!("{} record deleted", record.kind);
    if let Err(e) = notify::queue(&tx, &subject.email, &subject_line, &notice) {
        let _ = tx.rollback();
        return Err(store("insert")(e));
    }
    if let Ok(approver) = resolve_approver(&tx, &subject) {
        if let Err(e) = notify::queue(&tx, &approver.email, &subject_line, &notice) {
            let _ = tx.rollback();
            return Err(store("insert")(e));
        }
    }
    tx.commit().map_err(store("commit"))?;
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub subject_user_id: Option<String>,
    pub approver_id: Option<String>,
    pub kind: Option<String>,
    pub limit: i64,
}

/// List pending (awaiting decision) or resolved records. The approver filter
/// scopes by tutor assignment, not by the resolver column: pending records
/// have no approver yet but still belong to the assigned tutor's queue.
pub fn list_records(
    conn: &Connection,
    pending: bool,
    filter: &ListFilter,
) -> Result<Vec<WorkflowRecord>, WorkflowError> {
    let mut sql = String::from(
        "SELECT w.id, w.kind, w.subject_user_id, w.payload, w.pending, w.approval_status,
                w.approver_id, w.approved_at, w.created_by, w.updated_by, w.created_at, w.updated_at
         FROM workflow_records w
         JOIN users s ON s.id = w.subject_user_id
         WHERE w.pending = ?",
    );
    let mut params: Vec<SqlValue> = vec![SqlValue::Integer(if pending { 1 } else { 0 })];
    if let Some(subject) = &filter.subject_user_id {
        sql.push_str(" AND w.subject_user_id = ?");
        params.push(SqlValue::Text(subject.clone()));
    }
    if let Some(approver) = &filter.approver_id {
        sql.push_str(" AND s.tutor_id = ?");
        params.push(SqlValue::Text(approver.clone()));
    }
    if let Some(kind) = &filter.kind {
        sql.push_str(" AND w.kind = ?");
        params.push(SqlValue::Text(kind.clone()));
    }
    sql.push_str(" ORDER BY w.created_at, w.id LIMIT ?");
    params.push(SqlValue::Integer(if filter.limit > 0 {
        filter.limit
    } else {
        200
    }));

    let mut stmt = conn.prepare(&sql).map_err(store("query"))?;
    let rows = stmt
        .query_map(params_from_iter(params), row_to_record)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(store("query"))?;
    Ok(rows)
}

pub fn list_messages(
    conn: &Connection,
    record_id: &str,
) -> Result<Vec<serde_json::Value>, WorkflowError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, author_id, body, created_at
             FROM record_messages
             WHERE record_id = ?
             ORDER BY created_at, id",
        )
        .map_err(store("query"))?;
    let rows = stmt
        .query_map([record_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "authorId": r.get::<_, String>(1)?,
                "body": r.get::<_, String>(2)?,
                "createdAt": r.get::<_, String>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(store("query"))?;
    Ok(rows)
}
