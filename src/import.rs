use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use uuid::Uuid;

use crate::workflow::{ROLE_ADMIN, ROLE_STUDENT, ROLE_TUTOR};

#[derive(Debug)]
pub enum ImportError {
    Validation(String, Option<Value>),
    Forbidden(String),
    NotFound(String),
    Conflict { duplicates: Vec<String> },
    Store {
        op: &'static str,
        source: rusqlite::Error,
    },
}

impl ImportError {
    pub fn code(&self) -> &'static str {
        match self {
            ImportError::Validation(..) => "bad_params",
            ImportError::Forbidden(_) => "forbidden",
            ImportError::NotFound(_) => "not_found",
            ImportError::Conflict { .. } => "conflict",
            ImportError::Store { op, .. } => match *op {
                "insert" => "db_insert_failed",
                "tx" => "db_tx_failed",
                "commit" => "db_commit_failed",
                _ => "db_query_failed",
            },
        }
    }

    pub fn message(&self) -> String {
        match self {
            ImportError::Validation(m, _) => m.clone(),
            ImportError::Forbidden(m) | ImportError::NotFound(m) => m.clone(),
            ImportError::Conflict { duplicates } => {
                format!("{} duplicate email(s) in import", duplicates.len())
            }
            ImportError::Store { source, .. } => source.to_string(),
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            ImportError::Validation(_, d) => d.clone(),
            ImportError::Conflict { duplicates } => Some(json!({ "duplicates": duplicates })),
            _ => None,
        }
    }
}

fn store(op: &'static str) -> impl Fn(rusqlite::Error) -> ImportError {
    move |source| ImportError::Store { op, source }
}

#[derive(Debug, Clone)]
struct ImportRow {
    line_no: usize,
    role: String,
    full_name: String,
    email: String,
    register_no: Option<String>,
    program: Option<String>,
    year_of_study: Option<i64>,
    tutor_email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub processed: usize,
    pub total_rows: usize,
    pub artifact_digest: String,
}

fn normalize_key(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

fn non_empty_trimmed(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(buf);
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    out.push(buf);
    out
}

const HEADER_COLUMNS: [&str; 7] = [
    "role",
    "full_name",
    "email",
    "register_no",
    "program",
    "year_of_study",
    "tutor_email",
];

fn parse_header(line: &str) -> Result<HashMap<String, usize>, ImportError> {
    let cols = parse_csv_record(line);
    let mut map = HashMap::new();
    for (i, raw) in cols.iter().enumerate() {
        let name = normalize_key(raw);
        if HEADER_COLUMNS.contains(&name.as_str()) {
            map.insert(name, i);
        }
    }
    for required in ["role", "full_name", "email"] {
        if !map.contains_key(required) {
            return Err(ImportError::Validation(
                format!("artifact header missing column: {}", required),
                None,
            ));
        }
    }
    Ok(map)
}

fn parse_rows(text: &str) -> Result<Vec<ImportRow>, ImportError> {
    let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
    let Some((_, header_line)) = lines.next() else {
        return Err(ImportError::Validation("artifact has no rows".to_string(), None));
    };
    let header = parse_header(header_line)?;

    let field = |cols: &[String], name: &str| -> Option<String> {
        header
            .get(name)
            .and_then(|&i| cols.get(i))
            .and_then(|s| non_empty_trimmed(s))
    };

    let mut rows = Vec::new();
    let mut bad: Vec<Value> = Vec::new();
    for (idx, line) in lines {
        let line_no = idx + 1;
        let cols = parse_csv_record(line);
        let role = field(&cols, "role").map(|s| s.to_ascii_lowercase());
        let full_name = field(&cols, "full_name");
        let email = field(&cols, "email");

        let mut problems: Vec<String> = Vec::new();
        let role = match role.as_deref() {
            Some(ROLE_STUDENT) => ROLE_STUDENT.to_string(),
            Some(ROLE_TUTOR) => ROLE_TUTOR.to_string(),
            Some(other) => {
                problems.push(format!("unsupported role: {}", other));
                other.to_string()
            }
            None => {
                problems.push("missing role".to_string());
                String::new()
            }
        };
        if full_name.is_none() {
            problems.push("missing full_name".to_string());
        }
        if email.is_none() {
            problems.push("missing email".to_string());
        }

        let tutor_email = field(&cols, "tutor_email");
        let register_no = field(&cols, "register_no");
        let program = field(&cols, "program");
        let year_of_study = field(&cols, "year_of_study").and_then(|s| s.parse::<i64>().ok());
        if role == ROLE_STUDENT {
            if tutor_email.is_none() {
                problems.push("missing tutor_email".to_string());
            }
            if register_no.is_none() {
                problems.push("missing register_no".to_string());
            }
        }

        if !problems.is_empty() {
            bad.push(json!({ "line": line_no, "problems": problems }));
            continue;
        }

        rows.push(ImportRow {
            line_no,
            role,
            full_name: full_name.unwrap_or_default(),
            email: email.unwrap_or_default(),
            register_no,
            program,
            year_of_study,
            tutor_email,
        });
    }

    if !bad.is_empty() {
        return Err(ImportError::Validation(
            format!("{} row(s) failed validation", bad.len()),
            Some(json!({ "rows": bad })),
        ));
    }
    if rows.is_empty() {
        return Err(ImportError::Validation("artifact has no rows".to_string(), None));
    }
    Ok(rows)
}

/// Run the whole batch as one unit: either every row lands (users, student
/// detail rows, audit entry) or none do. The uploaded artifact is removed on
/// success and failure alike.
pub fn run_import(
    conn: &Connection,
    artifact_path: &Path,
    actor_id: &str,
) -> Result<ImportSummary, ImportError> {
    let result = import_batch(conn, artifact_path, actor_id);
    // Idempotent cleanup; a missing artifact is not an error.
    let _ = std::fs::remove_file(artifact_path);
    result
}

fn import_batch(
    conn: &Connection,
    artifact_path: &Path,
    actor_id: &str,
) -> Result<ImportSummary, ImportError> {
    let actor_role: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?", [actor_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(store("query"))?;
    let actor_role =
        actor_role.ok_or_else(|| ImportError::NotFound(format!("actor {} not found", actor_id)))?;
    if actor_role != ROLE_ADMIN {
        return Err(ImportError::Forbidden(
            "only an admin may run a bulk import".to_string(),
        ));
    }

    let bytes = std::fs::read(artifact_path).map_err(|e| {
        ImportError::Validation(
            format!(
                "cannot read artifact {}: {}",
                artifact_path.to_string_lossy(),
                e
            ),
            None,
        )
    })?;
    let digest = format!("{:x}", Sha256::digest(&bytes));
    let text = String::from_utf8_lossy(&bytes);

    let rows = parse_rows(&text)?;
    let total_rows = rows.len();

    // Duplicates inside the batch itself abort before touching the store.
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut in_batch_dups: Vec<String> = Vec::new();
    for row in &rows {
        let key = normalize_key(&row.email);
        if seen.insert(key, row.line_no).is_some() {
            in_batch_dups.push(row.email.clone());
        }
    }
    if !in_batch_dups.is_empty() {
        in_batch_dups.sort();
        in_batch_dups.dedup();
        return Err(ImportError::Conflict {
            duplicates: in_batch_dups,
        });
    }

    let tx = conn.unchecked_transaction().map_err(store("tx"))?;

    // Consistent snapshot of existing emails, taken inside the transaction.
    let existing: HashSet<String> = {
        let mut stmt = tx
            .prepare("SELECT email FROM users")
            .map_err(store("query"))?;
        let it = stmt
            .query_map([], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(store("query"))?;
        it.into_iter().map(|e| normalize_key(&e)).collect()
    };

    let mut store_dups: Vec<String> = Vec::new();
    for row in &rows {
        if existing.contains(&normalize_key(&row.email)) {
            store_dups.push(row.email.clone());
        }
    }
    // All-or-nothing even for partial duplication: one pre-existing email
    // sinks the whole batch, with the full conflicting set reported back.
    if !store_dups.is_empty() {
        let _ = tx.rollback();
        store_dups.sort();
        return Err(ImportError::Conflict {
            duplicates: store_dups,
        });
    }

    let now = Utc::now().to_rfc3339();

    // Tutors first so student rows may reference a tutor from the same batch.
    let mut ordered: Vec<&ImportRow> = rows.iter().filter(|r| r.role == ROLE_TUTOR).collect();
    ordered.extend(rows.iter().filter(|r| r.role == ROLE_STUDENT));

    let mut processed = 0usize;
    for row in ordered {
        let user_id = Uuid::new_v4().to_string();
        let tutor_id: Option<String> = if row.role == ROLE_STUDENT {
            let tutor_email = row.tutor_email.as_deref().unwrap_or_default();
            let resolved = tx
                .query_row(
                    "SELECT id FROM users WHERE email = ? AND role = ?",
                    (tutor_email, ROLE_TUTOR),
                    |r| r.get::<_, String>(0),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => ImportError::NotFound(format!(
                        "row {}: tutor {} not found",
                        row.line_no, tutor_email
                    )),
                    other => ImportError::Store {
                        op: "query",
                        source: other,
                    },
                });
            match resolved {
                Ok(id) => Some(id),
                Err(e) => {
                    let _ = tx.rollback();
                    return Err(e);
                }
            }
        } else {
            None
        };

        let res = tx.execute(
            "INSERT INTO users(id, full_name, email, role, tutor_id, active, created_at)
             VALUES(?, ?, ?, ?, ?, 1, ?)",
            (
                &user_id,
                &row.full_name,
                normalize_key(&row.email),
                &row.role,
                &tutor_id,
                &now,
            ),
        );
        if let Err(e) = res {
            let _ = tx.rollback();
            return Err(store("insert")(e));
        }

        if row.role == ROLE_STUDENT {
            let res = tx.execute(
                "INSERT INTO student_profiles(user_id, register_no, program, year_of_study, created_at)
                 VALUES(?, ?, ?, ?, ?)",
                (
                    &user_id,
                    &row.register_no,
                    &row.program,
                    &row.year_of_study,
                    &now,
                ),
            );
            if let Err(e) = res {
                let _ = tx.rollback();
                return Err(store("insert")(e));
            }
        }
        processed += 1;
    }

    let res = tx.execute(
        "INSERT INTO import_audit(id, actor_id, total_rows, processed, artifact_digest, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            actor_id,
            total_rows as i64,
            processed as i64,
            &digest,
            &now,
        ),
    );
    if let Err(e) = res {
        let _ = tx.rollback();
        return Err(store("insert")(e));
    }

    tx.commit().map_err(store("commit"))?;

    Ok(ImportSummary {
        processed,
        total_rows,
        artifact_digest: digest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_record_handles_quotes_and_embedded_commas() {
        assert_eq!(
            parse_csv_record(r#"student,"Lee, Ana",ana@x.edu"#),
            vec!["student", "Lee, Ana", "ana@x.edu"]
        );
        assert_eq!(
            parse_csv_record(r#"a,"say ""hi""",c"#),
            vec!["a", r#"say "hi""#, "c"]
        );
    }

    #[test]
    fn header_requires_core_columns() {
        let err = parse_header("full_name,email").expect_err("role column required");
        assert_eq!(err.code(), "bad_params");
        let map = parse_header("role,full_name,email,tutor_email").expect("valid header");
        assert_eq!(map.get("tutor_email"), Some(&3));
    }

    #[test]
    fn rows_collect_all_validation_problems() {
        let text = "role,full_name,email,register_no,tutor_email\n\
                    student,Ana Lee,ana@x.edu,R1,tutor@x.edu\n\
                    student,,missing@x.edu,,\n";
        let err = parse_rows(text).expect_err("second row invalid");
        let details = err.details().expect("details");
        let rows = details.get("rows").and_then(|v| v.as_array()).unwrap().clone();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("line").and_then(|v| v.as_u64()), Some(3));
    }
}
