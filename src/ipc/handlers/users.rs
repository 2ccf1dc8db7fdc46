use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::workflow::{self, ROLE_ADMIN, ROLE_STUDENT, ROLE_TUTOR};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn user_json(u: &workflow::UserRow) -> Value {
    json!({
        "id": u.id,
        "fullName": u.full_name,
        "email": u.email,
        "role": u.role,
        "tutorId": u.tutor_id,
        "active": u.active,
    })
}

fn create_user(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let full_name = get_required_str(params, "fullName")?;
    let email = get_required_str(params, "email")?.to_ascii_lowercase();
    let role = get_required_str(params, "role")?.to_ascii_lowercase();
    if role != ROLE_STUDENT && role != ROLE_TUTOR && role != ROLE_ADMIN {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("invalid role: {}", role),
            details: None,
        });
    }

    let tutor_id = params
        .get("tutorId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if let Some(tid) = &tutor_id {
        let tutor = workflow::load_user(conn, tid).map_err(from_workflow)?;
        match tutor {
            Some(t) if t.role == ROLE_TUTOR => {}
            Some(_) => {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: format!("user {} is not a tutor", tid),
                    details: None,
                })
            }
            None => {
                return Err(HandlerErr {
                    code: "not_found",
                    message: format!("tutor {} not found", tid),
                    details: None,
                })
            }
        }
    }

    let exists: Option<String> = conn
        .query_row("SELECT id FROM users WHERE email = ?", [&email], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err("db_query_failed"))?;
    if exists.is_some() {
        return Err(HandlerErr {
            code: "conflict",
            message: format!("email already registered: {}", email),
            details: Some(json!({ "duplicates": [email] })),
        });
    }

    let user_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    if let Err(e) = tx.execute(
        "INSERT INTO users(id, full_name, email, role, tutor_id, active, created_at)
         VALUES(?, ?, ?, ?, ?, 1, ?)",
        (&user_id, &full_name, &email, &role, &tutor_id, &now),
    ) {
        let _ = tx.rollback();
        return Err(db_err("db_insert_failed")(e));
    }
    if role == ROLE_STUDENT {
        let register_no = params.get("registerNo").and_then(|v| v.as_str());
        let program = params.get("program").and_then(|v| v.as_str());
        let year = params.get("yearOfStudy").and_then(|v| v.as_i64());
        if let Err(e) = tx.execute(
            "INSERT INTO student_profiles(user_id, register_no, program, year_of_study, created_at)
             VALUES(?, ?, ?, ?, ?)",
            (&user_id, register_no, program, year, &now),
        ) {
            let _ = tx.rollback();
            return Err(db_err("db_insert_failed")(e));
        }
    }
    tx.commit().map_err(db_err("db_commit_failed"))?;

    Ok(json!({ "userId": user_id, "email": email, "role": role }))
}

fn assign_tutor(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let tutor_id = get_required_str(params, "tutorId")?;

    let student = workflow::load_user(conn, &user_id)
        .map_err(from_workflow)?
        .ok_or_else(|| HandlerErr {
            code: "not_found",
            message: format!("user {} not found", user_id),
            details: None,
        })?;
    if student.role != ROLE_STUDENT {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("user {} is not a student", user_id),
            details: None,
        });
    }
    let tutor = workflow::load_user(conn, &tutor_id)
        .map_err(from_workflow)?
        .ok_or_else(|| HandlerErr {
            code: "not_found",
            message: format!("tutor {} not found", tutor_id),
            details: None,
        })?;
    if tutor.role != ROLE_TUTOR {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("user {} is not a tutor", tutor_id),
            details: None,
        });
    }

    conn.execute(
        "UPDATE users SET tutor_id = ?, updated_at = ? WHERE id = ?",
        (&tutor_id, Utc::now().to_rfc3339(), &user_id),
    )
    .map_err(db_err("db_update_failed"))?;

    Ok(json!({ "userId": user_id, "tutorId": tutor_id }))
}

fn get_user(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let user = workflow::load_user(conn, &user_id)
        .map_err(from_workflow)?
        .ok_or_else(|| HandlerErr {
            code: "not_found",
            message: format!("user {} not found", user_id),
            details: None,
        })?;
    let mut out = user_json(&user);
    if user.role == ROLE_STUDENT {
        let profile: Option<Value> = conn
            .query_row(
                "SELECT register_no, program, year_of_study FROM student_profiles WHERE user_id = ?",
                [&user_id],
                |r| {
                    Ok(json!({
                        "registerNo": r.get::<_, Option<String>>(0)?,
                        "program": r.get::<_, Option<String>>(1)?,
                        "yearOfStudy": r.get::<_, Option<i64>>(2)?,
                    }))
                },
            )
            .optional()
            .map_err(db_err("db_query_failed"))?;
        out["profile"] = profile.unwrap_or(Value::Null);
    }
    Ok(out)
}

fn list_users(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let role = params
        .get("role")
        .and_then(|v| v.as_str())
        .map(|s| s.to_ascii_lowercase());
    let mut stmt = conn
        .prepare(
            "SELECT id, full_name, email, role, tutor_id, active
             FROM users
             WHERE (?1 IS NULL OR role = ?1)
             ORDER BY full_name, id",
        )
        .map_err(db_err("db_query_failed"))?;
    let rows = stmt
        .query_map([role], row_to_user_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    Ok(json!({ "users": rows }))
}

fn row_to_user_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "fullName": r.get::<_, String>(1)?,
        "email": r.get::<_, String>(2)?,
        "role": r.get::<_, String>(3)?,
        "tutorId": r.get::<_, Option<String>>(4)?,
        "active": r.get::<_, i64>(5)? != 0,
    }))
}

fn db_err(code: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| HandlerErr {
        code,
        message: e.to_string(),
        details: None,
    }
}

fn from_workflow(e: workflow::WorkflowError) -> HandlerErr {
    HandlerErr {
        code: e.code(),
        message: e.message(),
        details: None,
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "users.create" | "users.assignTutor" | "users.get" | "users.list"
    );
    if !handled {
        return None;
    }

    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let result = match req.method.as_str() {
        "users.create" => create_user(conn, &req.params),
        "users.assignTutor" => assign_tutor(conn, &req.params),
        "users.get" => get_user(conn, &req.params),
        "users.list" => list_users(conn, &req.params),
        _ => unreachable!(),
    };

    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
