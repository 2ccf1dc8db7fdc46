use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

pub const FAIL_LABEL: &str = "F";

/// Per-course grade scale: six cut-points evaluated high-to-low. Marks at or
/// above a cut-point earn its label; marks below every cut-point earn F.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeScale {
    pub course_code: String,
    pub title: String,
    pub cut_o: f64,
    pub cut_a_plus: f64,
    pub cut_a: f64,
    pub cut_b_plus: f64,
    pub cut_b: f64,
    pub cut_c: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GradeError {
    pub code: String,
    pub message: String,
}

impl GradeError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl GradeScale {
    /// Cut-points paired with labels, highest first. The evaluation order is
    /// fixed here so compute_grade stays deterministic for a given scale.
    pub fn bands(&self) -> [(f64, &'static str); 6] {
        [
            (self.cut_o, "O"),
            (self.cut_a_plus, "A+"),
            (self.cut_a, "A"),
            (self.cut_b_plus, "B+"),
            (self.cut_b, "B"),
            (self.cut_c, "C"),
        ]
    }

    pub fn validate(&self) -> Result<(), GradeError> {
        if self.course_code.trim().is_empty() {
            return Err(GradeError::new("bad_params", "course_code must not be empty"));
        }
        let bands = self.bands();
        for pair in bands.windows(2) {
            if pair[0].0 <= pair[1].0 {
                return Err(GradeError::new(
                    "bad_params",
                    format!(
                        "cut-points must strictly decrease: {} ({}) <= {} ({})",
                        pair[0].1, pair[0].0, pair[1].1, pair[1].0
                    ),
                ));
            }
        }
        for (cut, label) in bands {
            if !cut.is_finite() || cut < 0.0 {
                return Err(GradeError::new(
                    "bad_params",
                    format!("cut-point {} must be a non-negative number", label),
                ));
            }
        }
        Ok(())
    }
}

/// First band (highest first) whose cut-point is <= marks wins; below every
/// cut-point is the failing label. Inclusive lower bound: marks exactly at a
/// cut-point earn that band.
pub fn compute_grade(marks: f64, scale: &GradeScale) -> &'static str {
    for (cut, label) in scale.bands() {
        if marks >= cut {
            return label;
        }
    }
    FAIL_LABEL
}

pub fn load_scale(conn: &Connection, course_code: &str) -> rusqlite::Result<Option<GradeScale>> {
    conn.query_row(
        "SELECT course_code, title, cut_o, cut_a_plus, cut_a, cut_b_plus, cut_b, cut_c
         FROM course_grade_bands
         WHERE course_code = ?",
        [course_code],
        |r| {
            Ok(GradeScale {
                course_code: r.get(0)?,
                title: r.get(1)?,
                cut_o: r.get(2)?,
                cut_a_plus: r.get(3)?,
                cut_a: r.get(4)?,
                cut_b_plus: r.get(5)?,
                cut_b: r.get(6)?,
                cut_c: r.get(7)?,
            })
        },
    )
    .optional()
}

pub fn store_scale(conn: &Connection, scale: &GradeScale) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO course_grade_bands(course_code, title, cut_o, cut_a_plus, cut_a, cut_b_plus, cut_b, cut_c)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(course_code) DO UPDATE SET
           title = excluded.title,
           cut_o = excluded.cut_o,
           cut_a_plus = excluded.cut_a_plus,
           cut_a = excluded.cut_a,
           cut_b_plus = excluded.cut_b_plus,
           cut_b = excluded.cut_b,
           cut_c = excluded.cut_c",
        (
            &scale.course_code,
            &scale.title,
            scale.cut_o,
            scale.cut_a_plus,
            scale.cut_a,
            scale.cut_b_plus,
            scale.cut_b,
            scale.cut_c,
        ),
    )?;
    Ok(())
}
