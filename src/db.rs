use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "campusrec.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            full_name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            role TEXT NOT NULL,
            tutor_id TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(tutor_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_tutor ON users(tutor_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_profiles(
            user_id TEXT PRIMARY KEY,
            register_no TEXT,
            program TEXT,
            year_of_study INTEGER,
            created_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;

    // One polymorphic table for every record kind; the kind tag discriminates
    // the JSON payload shape. The four approval columns move together:
    // pending=1 <=> approval_status='unresolved' <=> approver_id/approved_at NULL.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS workflow_records(
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            subject_user_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            pending INTEGER NOT NULL,
            approval_status TEXT NOT NULL,
            approver_id TEXT,
            approved_at TEXT,
            created_by TEXT NOT NULL,
            updated_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(subject_user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_workflow_records_subject ON workflow_records(subject_user_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_workflow_records_kind ON workflow_records(kind)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_workflow_records_pending ON workflow_records(pending)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS record_messages(
            id TEXT PRIMARY KEY,
            record_id TEXT NOT NULL,
            author_id TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(record_id) REFERENCES workflow_records(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_record_messages_record ON record_messages(record_id)",
        [],
    )?;

    // Six cut-points per course, evaluated high-to-low; below cut_c is F.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_grade_bands(
            course_code TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            cut_o REAL NOT NULL,
            cut_a_plus REAL NOT NULL,
            cut_a REAL NOT NULL,
            cut_b_plus REAL NOT NULL,
            cut_b REAL NOT NULL,
            cut_c REAL NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notification_outbox(
            id TEXT PRIMARY KEY,
            to_addr TEXT NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            sent_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notification_outbox_status ON notification_outbox(status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_audit(
            id TEXT PRIMARY KEY,
            actor_id TEXT NOT NULL,
            total_rows INTEGER NOT NULL,
            processed INTEGER NOT NULL,
            artifact_digest TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    // Workspaces created before tutors could be deactivated lack the
    // users.active column default path; keep migrations idempotent.
    ensure_users_updated_at(&conn)?;
    ensure_outbox_last_error(&conn)?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value_json FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn ensure_users_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "users", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE users ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn ensure_outbox_last_error(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "notification_outbox", "last_error")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE notification_outbox ADD COLUMN last_error TEXT",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
