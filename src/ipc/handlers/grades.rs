use crate::grades::{self, GradeScale};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};

fn get_cut(params: &Value, key: &str) -> Result<f64, String> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| format!("missing {}", key))
}

fn set_bands(conn: &Connection, params: &Value) -> Result<Value, (String, String)> {
    let course_code = params
        .get("courseCode")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ("bad_params".to_string(), "missing courseCode".to_string()))?;
    let title = params
        .get("title")
        .and_then(|v| v.as_str())
        .unwrap_or(&course_code)
        .to_string();

    let bad = |m: String| ("bad_params".to_string(), m);
    let scale = GradeScale {
        course_code,
        title,
        cut_o: get_cut(params, "cutO").map_err(bad)?,
        cut_a_plus: get_cut(params, "cutAPlus").map_err(bad)?,
        cut_a: get_cut(params, "cutA").map_err(bad)?,
        cut_b_plus: get_cut(params, "cutBPlus").map_err(bad)?,
        cut_b: get_cut(params, "cutB").map_err(bad)?,
        cut_c: get_cut(params, "cutC").map_err(bad)?,
    };
    scale
        .validate()
        .map_err(|e| (e.code.clone(), e.message.clone()))?;
    grades::store_scale(conn, &scale)
        .map_err(|e| ("db_insert_failed".to_string(), e.to_string()))?;
    Ok(json!({ "courseCode": scale.course_code }))
}

fn get_bands(conn: &Connection, params: &Value) -> Result<Value, (String, String)> {
    let course_code = params
        .get("courseCode")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ("bad_params".to_string(), "missing courseCode".to_string()))?;
    let scale = grades::load_scale(conn, course_code)
        .map_err(|e| ("db_query_failed".to_string(), e.to_string()))?
        .ok_or_else(|| {
            (
                "not_found".to_string(),
                format!("no grade bands for course {}", course_code),
            )
        })?;
    Ok(json!({ "scale": serde_json::to_value(&scale).unwrap_or(Value::Null) }))
}

fn compute(conn: &Connection, params: &Value) -> Result<Value, (String, String)> {
    let course_code = params
        .get("courseCode")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ("bad_params".to_string(), "missing courseCode".to_string()))?;
    let marks = params
        .get("marks")
        .and_then(|v| v.as_f64())
        .filter(|m| m.is_finite() && *m >= 0.0)
        .ok_or_else(|| {
            (
                "bad_params".to_string(),
                "marks must be a non-negative number".to_string(),
            )
        })?;
    let scale = grades::load_scale(conn, course_code)
        .map_err(|e| ("db_query_failed".to_string(), e.to_string()))?
        .ok_or_else(|| {
            (
                "not_found".to_string(),
                format!("no grade bands for course {}", course_code),
            )
        })?;
    Ok(json!({
        "courseCode": course_code,
        "marks": marks,
        "grade": grades::compute_grade(marks, &scale),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "courses.setBands" | "courses.getBands" | "grades.compute"
    );
    if !handled {
        return None;
    }

    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let result = match req.method.as_str() {
        "courses.setBands" => set_bands(conn, &req.params),
        "courses.getBands" => get_bands(conn, &req.params),
        "grades.compute" => compute(conn, &req.params),
        _ => unreachable!(),
    };

    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err((code, message)) => err(&req.id, &code, message, None),
    })
}
