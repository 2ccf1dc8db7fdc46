use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

fn notifications_defaults() -> Value {
    json!({
        "fromAddr": "noreply@campusrec.local",
        "maxAttempts": 3,
    })
}

fn records_defaults() -> Value {
    json!({
        "pageSize": 200,
        "defaultListScope": "pending",
    })
}

fn section_key(section: &str) -> Option<(&'static str, Value)> {
    match section {
        "notifications" => Some(("setup.notifications", notifications_defaults())),
        "records" => Some(("setup.records", records_defaults())),
        _ => None,
    }
}

fn merged_section(conn: &Connection, section: &str) -> Value {
    let Some((key, defaults)) = section_key(section) else {
        return json!({});
    };
    let mut out: Map<String, Value> = defaults.as_object().cloned().unwrap_or_default();
    if let Ok(Some(stored)) = db::settings_get_json(conn, key) {
        if let Some(obj) = stored.as_object() {
            for (k, v) in obj {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(out)
}

fn validate_patch(section: &str, patch: &Value) -> Result<(), String> {
    let Some(obj) = patch.as_object() else {
        return Err("patch must be an object".to_string());
    };
    match section {
        "notifications" => {
            for (k, v) in obj {
                match k.as_str() {
                    "fromAddr" => {
                        let valid = v
                            .as_str()
                            .map(|s| !s.trim().is_empty() && s.contains('@'))
                            .unwrap_or(false);
                        if !valid {
                            return Err("fromAddr must be an address".to_string());
                        }
                    }
                    "maxAttempts" => {
                        let valid = v.as_i64().map(|n| (1..=10).contains(&n)).unwrap_or(false);
                        if !valid {
                            return Err("maxAttempts must be between 1 and 10".to_string());
                        }
                    }
                    other => return Err(format!("unknown field: {}", other)),
                }
            }
        }
        "records" => {
            for (k, v) in obj {
                match k.as_str() {
                    "pageSize" => {
                        let valid = v.as_i64().map(|n| (1..=500).contains(&n)).unwrap_or(false);
                        if !valid {
                            return Err("pageSize must be between 1 and 500".to_string());
                        }
                    }
                    "defaultListScope" => {
                        let valid = matches!(v.as_str(), Some("pending") | Some("resolved"));
                        if !valid {
                            return Err("defaultListScope must be pending or resolved".to_string());
                        }
                    }
                    other => return Err(format!("unknown field: {}", other)),
                }
            }
        }
        _ => return Err(format!("unknown section: {}", section)),
    }
    Ok(())
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    ok(
        &req.id,
        json!({
            "notifications": merged_section(conn, "notifications"),
            "records": merged_section(conn, "records"),
        }),
    )
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some((key, _)) = section_key(section) else {
        return err(
            &req.id,
            "bad_params",
            format!("unknown section: {}", section),
            None,
        );
    };
    let patch = req.params.get("patch").cloned().unwrap_or(json!({}));
    if let Err(m) = validate_patch(section, &patch) {
        return err(&req.id, "bad_params", m, None);
    }

    let mut merged = merged_section(conn, section)
        .as_object()
        .cloned()
        .unwrap_or_default();
    if let Some(obj) = patch.as_object() {
        for (k, v) in obj {
            merged.insert(k.clone(), v.clone());
        }
    }
    if let Err(e) = db::settings_set_json(conn, key, &Value::Object(merged.clone())) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    let mut result = Map::new();
    result.insert(section.to_string(), Value::Object(merged));
    ok(&req.id, Value::Object(result))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_get(state, req)),
        "setup.update" => Some(handle_update(state, req)),
        _ => None,
    }
}
