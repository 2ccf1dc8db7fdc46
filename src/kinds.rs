use serde_json::{Map, Value};

/// Every record kind students can submit for tutor verification. The kind tag
/// discriminates the payload shape stored in workflow_records.payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Internship,
    Scholarship,
    EventOrganized,
    EventAttended,
    OnlineCourse,
    Leave,
    Achievement,
    Project,
    EducationRecord,
    NptelEnrollment,
    NonCgpaEntry,
    Publication,
}

pub const ALL_KINDS: [RecordKind; 12] = [
    RecordKind::Internship,
    RecordKind::Scholarship,
    RecordKind::EventOrganized,
    RecordKind::EventAttended,
    RecordKind::OnlineCourse,
    RecordKind::Leave,
    RecordKind::Achievement,
    RecordKind::Project,
    RecordKind::EducationRecord,
    RecordKind::NptelEnrollment,
    RecordKind::NonCgpaEntry,
    RecordKind::Publication,
];

impl RecordKind {
    pub fn parse(s: &str) -> Option<RecordKind> {
        match s {
            "internship" => Some(RecordKind::Internship),
            "scholarship" => Some(RecordKind::Scholarship),
            "event_organized" => Some(RecordKind::EventOrganized),
            "event_attended" => Some(RecordKind::EventAttended),
            "online_course" => Some(RecordKind::OnlineCourse),
            "leave" => Some(RecordKind::Leave),
            "achievement" => Some(RecordKind::Achievement),
            "project" => Some(RecordKind::Project),
            "education_record" => Some(RecordKind::EducationRecord),
            "nptel_enrollment" => Some(RecordKind::NptelEnrollment),
            "non_cgpa_entry" => Some(RecordKind::NonCgpaEntry),
            "publication" => Some(RecordKind::Publication),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Internship => "internship",
            RecordKind::Scholarship => "scholarship",
            RecordKind::EventOrganized => "event_organized",
            RecordKind::EventAttended => "event_attended",
            RecordKind::OnlineCourse => "online_course",
            RecordKind::Leave => "leave",
            RecordKind::Achievement => "achievement",
            RecordKind::Project => "project",
            RecordKind::EducationRecord => "education_record",
            RecordKind::NptelEnrollment => "nptel_enrollment",
            RecordKind::NonCgpaEntry => "non_cgpa_entry",
            RecordKind::Publication => "publication",
        }
    }

    /// Required payload fields, checked on submit and after a resubmit merge.
    /// Values must be present and non-empty when stringly typed.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            RecordKind::Internship => &["company", "role", "start_date", "end_date"],
            RecordKind::Scholarship => &["title", "provider", "amount"],
            RecordKind::EventOrganized => &["title", "venue", "event_date"],
            RecordKind::EventAttended => &["title", "venue", "event_date"],
            RecordKind::OnlineCourse => &["title", "platform", "completed_on"],
            RecordKind::Leave => &["reason", "from_date", "to_date"],
            RecordKind::Achievement => &["title", "description", "achieved_on"],
            RecordKind::Project => &["title", "description", "guide"],
            RecordKind::EducationRecord => &["institution", "degree", "year_of_passing"],
            RecordKind::NptelEnrollment => &["course_code", "course_title", "marks"],
            RecordKind::NonCgpaEntry => &["title", "category", "awarded_on"],
            RecordKind::Publication => &["title", "journal", "published_on"],
        }
    }
}

/// Check the payload against the kind's required-field table. Returns the
/// missing/empty field names; empty means valid.
pub fn missing_required_fields(kind: RecordKind, payload: &Value) -> Vec<&'static str> {
    let mut missing = Vec::new();
    let obj = payload.as_object();
    for field in kind.required_fields() {
        let present = obj
            .and_then(|m| m.get(*field))
            .map(|v| match v {
                Value::Null => false,
                Value::String(s) => !s.trim().is_empty(),
                _ => true,
            })
            .unwrap_or(false);
        if !present {
            missing.push(*field);
        }
    }
    missing
}

/// Shallow-merge an edit over a stored payload: absent keys are preserved,
/// explicit nulls remove the field.
pub fn merge_payload(base: &Value, edit: &Value) -> Value {
    let mut out: Map<String, Value> = base.as_object().cloned().unwrap_or_default();
    if let Some(patch) = edit.as_object() {
        for (k, v) in patch {
            if v.is_null() {
                out.remove(k);
            } else {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_tags_round_trip() {
        for kind in ALL_KINDS {
            assert_eq!(RecordKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RecordKind::parse("mark_set"), None);
    }

    #[test]
    fn missing_fields_reports_empty_strings() {
        let payload = json!({
            "company": "Acme",
            "role": "   ",
            "start_date": "2026-05-01"
        });
        let missing = missing_required_fields(RecordKind::Internship, &payload);
        assert_eq!(missing, vec!["role", "end_date"]);
    }

    #[test]
    fn merge_preserves_absent_and_removes_null() {
        let base = json!({ "company": "Acme", "role": "Intern", "stipend": "1000" });
        let edit = json!({ "role": "SDE Intern", "stipend": null });
        let merged = merge_payload(&base, &edit);
        assert_eq!(merged.get("company").and_then(|v| v.as_str()), Some("Acme"));
        assert_eq!(
            merged.get("role").and_then(|v| v.as_str()),
            Some("SDE Intern")
        );
        assert!(merged.get("stipend").is_none());
    }
}
