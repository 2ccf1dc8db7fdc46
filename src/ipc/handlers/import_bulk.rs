use crate::import;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if req.method != "import.bulk" {
        return None;
    }

    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let artifact = req
        .params
        .get("artifactPath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(artifact) = artifact else {
        return Some(err(&req.id, "bad_params", "missing artifactPath", None));
    };
    let actor = req
        .params
        .get("actorId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let Some(actor) = actor else {
        return Some(err(&req.id, "bad_params", "missing actorId", None));
    };

    Some(match import::run_import(conn, &artifact, &actor) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "processed": summary.processed,
                "totalRows": summary.total_rows,
                "duplicates": [],
                "artifactDigest": summary.artifact_digest,
            }),
        ),
        Err(e) => err(&req.id, e.code(), e.message(), e.details()),
    })
}
