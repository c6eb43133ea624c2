//! Core domain model and the close-date rule engine for orgkeeper.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "orgkeeper-core";

/// Issue snapshot as fetched from the tracker. Immutable per fetch; the
/// engine never mutates it directly, it only emits field-update requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub number: u64,
    pub title: String,
    pub repository: String,
    pub state: IssueState,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub project_items: Vec<ProjectItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueState {
    Open,
    Closed,
}

impl Issue {
    pub fn is_closed(&self) -> bool {
        self.state == IssueState::Closed
    }

    /// Close date as YYYY-MM-DD, the value written into date fields.
    pub fn closed_date(&self) -> Option<NaiveDate> {
        self.closed_at.map(|ts| ts.date_naive())
    }
}

/// Raw ProjectV2 item attached to an issue: the item id plus the field
/// values the query inlines (single-select status, date fields by name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectItem {
    pub item_id: String,
    pub project_id: String,
    pub project_number: u64,
    pub project_title: String,
    pub status: Option<String>,
    /// Lowercased date-field name -> current value.
    #[serde(default)]
    pub date_values: std::collections::BTreeMap<String, NaiveDate>,
}

impl ProjectItem {
    pub fn date_value(&self, field_name: &str) -> Option<NaiveDate> {
        self.date_values
            .get(&field_name.trim().to_lowercase())
            .copied()
    }
}

/// One issue's membership in a tracked project, resolved against the
/// project catalog so the monitored field's id is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMembership {
    pub project_id: String,
    pub project_title: String,
    pub item_id: String,
    pub status: Option<String>,
    pub field_id: String,
    pub field_value: Option<NaiveDate>,
}

/// Decision for one (issue, tracked project) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    None,
    Clear { field_id: String },
    Fill { field_id: String, date: NaiveDate },
}

impl Action {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

const DONE_STATUS: &str = "done";

/// Decide what to do with the monitored date field for one membership.
///
/// Stateless over the current tuple, so re-running on the post-action
/// state always yields `Action::None`:
/// - status != "Done" and the field holds a value -> clear it
/// - status == "Done", issue closed, field empty -> fill with the close date
/// - status == "Done" and the field holds a value -> keep it as-is
/// - anything else (no status set, Done but still open) -> nothing
pub fn decide(
    membership: &ProjectMembership,
    issue_closed: bool,
    closed_at: Option<NaiveDate>,
) -> Action {
    let Some(status) = membership.status.as_deref() else {
        return Action::None;
    };

    if !status.trim().eq_ignore_ascii_case(DONE_STATUS) {
        return match membership.field_value {
            Some(_) => Action::Clear {
                field_id: membership.field_id.clone(),
            },
            None => Action::None,
        };
    }

    if membership.field_value.is_some() {
        return Action::None;
    }

    match (issue_closed, closed_at) {
        (true, Some(date)) => Action::Fill {
            field_id: membership.field_id.clone(),
            date,
        },
        _ => Action::None,
    }
}

/// Deterministic digest of an issue's externally relevant state. Equal
/// fingerprints mean reprocessing would be a no-op; collisions are an
/// accepted negligible risk.
pub fn fingerprint(issue: &Issue, memberships: &[ProjectMembership]) -> String {
    let mut tuples: Vec<(&str, Option<&str>, Option<NaiveDate>)> = memberships
        .iter()
        .map(|m| (m.project_id.as_str(), m.status.as_deref(), m.field_value))
        .collect();
    tuples.sort();

    let doc = serde_json::json!({
        "id": issue.id,
        "closed": issue.is_closed(),
        "closed_at": issue.closed_at.map(|ts| ts.to_rfc3339()),
        "updated_at": issue.updated_at.to_rfc3339(),
        "memberships": tuples
            .iter()
            .map(|(project, status, value)| {
                serde_json::json!({
                    "project": project,
                    "status": status,
                    "value": value.map(|d| d.to_string()),
                })
            })
            .collect::<Vec<_>>(),
    });

    let mut hasher = Sha256::new();
    hasher.update(doc.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Project schema as carried by the YAML catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDef {
    pub id: String,
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub id: String,
    pub name: String,
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<FieldOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOption {
    pub id: String,
    pub name: String,
}

impl ProjectDef {
    /// Field lookup by name, trimmed and case-insensitive (catalog files
    /// are hand-edited).
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        let wanted = name.trim().to_lowercase();
        self.fields
            .iter()
            .find(|f| f.name.trim().to_lowercase() == wanted)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }
}

/// Row of the repository inventory CSV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoEntry {
    pub name: String,
    #[serde(default)]
    pub archived: bool,
}

/// Label template entry (YAML) and REST label shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn membership(status: Option<&str>, field_value: Option<&str>) -> ProjectMembership {
        ProjectMembership {
            project_id: "PVT_1".into(),
            project_title: "Roadmap".into(),
            item_id: "PVTI_1".into(),
            status: status.map(str::to_string),
            field_id: "PVTF_date".into(),
            field_value: field_value.map(|d| d.parse().expect("date literal")),
        }
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().expect("date literal")
    }

    #[test]
    fn done_and_closed_fills_with_close_date() {
        let action = decide(&membership(Some("Done"), None), true, Some(date("2024-01-10")));
        assert_eq!(
            action,
            Action::Fill {
                field_id: "PVTF_date".into(),
                date: date("2024-01-10"),
            }
        );
    }

    #[test]
    fn not_done_with_value_clears() {
        let action = decide(
            &membership(Some("In Progress"), Some("2024-01-10")),
            false,
            None,
        );
        assert_eq!(
            action,
            Action::Clear {
                field_id: "PVTF_date".into()
            }
        );
    }

    #[test]
    fn done_with_existing_value_is_never_overwritten() {
        let action = decide(
            &membership(Some("Done"), Some("2024-01-10")),
            true,
            Some(date("2024-02-01")),
        );
        assert_eq!(action, Action::None);
    }

    #[test]
    fn rule_table_is_complete() {
        let d = date("2024-01-10");
        // (status, field present, closed) -> expected
        let cases = [
            (Some("Done"), false, true, true),   // fill
            (Some("Done"), false, false, false), // done but still open
            (Some("Done"), true, true, false),   // keep
            (Some("Done"), true, false, false),  // keep
            (Some("Todo"), true, true, true),    // clear (closed state irrelevant)
            (Some("Todo"), true, false, true),   // clear
            (Some("Todo"), false, true, false),
            (Some("Todo"), false, false, false),
            (None, true, true, false), // no status set -> leave alone
        ];
        for (status, has_value, closed, expect_action) in cases {
            let m = membership(status, has_value.then_some("2024-01-01"));
            let action = decide(&m, closed, closed.then_some(d));
            assert_eq!(
                !action.is_none(),
                expect_action,
                "status={status:?} has_value={has_value} closed={closed}"
            );
        }
    }

    #[test]
    fn decide_is_idempotent_after_applying_the_action() {
        let closed = Some(date("2024-01-10"));
        for (status, field_value) in [
            (Some("Done"), None),
            (Some("Done"), Some("2024-01-10")),
            (Some("In Review"), Some("2024-01-10")),
            (Some("In Review"), None),
            (None, None),
        ] {
            let before = membership(status, field_value);
            let mut after = before.clone();
            match decide(&before, true, closed) {
                Action::Clear { .. } => after.field_value = None,
                Action::Fill { date, .. } => after.field_value = Some(date),
                Action::None => {}
            }
            assert_eq!(
                decide(&after, true, closed),
                Action::None,
                "status={status:?} value={field_value:?}"
            );
        }
    }

    #[test]
    fn status_comparison_ignores_case_and_whitespace() {
        let action = decide(&membership(Some(" done "), None), true, Some(date("2024-03-05")));
        assert!(matches!(action, Action::Fill { .. }));
    }

    fn sample_issue() -> Issue {
        Issue {
            id: "I_abc".into(),
            number: 42,
            title: "Fix the importer".into(),
            repository: "data-pipeline".into(),
            state: IssueState::Closed,
            closed_at: Some(Utc.with_ymd_and_hms(2024, 1, 10, 18, 30, 0).single().expect("ts")),
            updated_at: Utc.with_ymd_and_hms(2024, 1, 11, 9, 0, 0).single().expect("ts"),
            project_items: vec![],
        }
    }

    #[test]
    fn fingerprint_is_stable_for_identical_state() {
        let issue = sample_issue();
        let ms = vec![membership(Some("Done"), Some("2024-01-10"))];
        assert_eq!(fingerprint(&issue, &ms), fingerprint(&issue.clone(), &ms.clone()));
    }

    #[test]
    fn fingerprint_ignores_membership_order() {
        let issue = sample_issue();
        let mut a = membership(Some("Done"), None);
        a.project_id = "PVT_a".into();
        let mut b = membership(Some("Todo"), None);
        b.project_id = "PVT_b".into();
        assert_eq!(
            fingerprint(&issue, &[a.clone(), b.clone()]),
            fingerprint(&issue, &[b, a])
        );
    }

    #[test]
    fn fingerprint_changes_when_any_tracked_field_changes() {
        let issue = sample_issue();
        let ms = vec![membership(Some("Done"), Some("2024-01-10"))];
        let base = fingerprint(&issue, &ms);

        let mut status_changed = ms.clone();
        status_changed[0].status = Some("In Progress".into());
        assert_ne!(base, fingerprint(&issue, &status_changed));

        let mut value_changed = ms.clone();
        value_changed[0].field_value = Some(date("2024-01-11"));
        assert_ne!(base, fingerprint(&issue, &value_changed));

        let mut reopened = issue.clone();
        reopened.state = IssueState::Open;
        reopened.closed_at = None;
        assert_ne!(base, fingerprint(&reopened, &ms));

        let mut touched = issue;
        touched.updated_at += chrono::Duration::minutes(1);
        assert_ne!(base, fingerprint(&touched, &ms));
    }

    #[test]
    fn closed_date_truncates_to_day() {
        assert_eq!(sample_issue().closed_date(), Some(date("2024-01-10")));
    }

    #[test]
    fn project_field_lookup_is_case_insensitive() {
        let project = ProjectDef {
            id: "PVT_1".into(),
            number: 3,
            title: "Roadmap".into(),
            fields: vec![FieldDef {
                id: "PVTF_date".into(),
                name: "Data Fim".into(),
                data_type: "DATE".into(),
                options: vec![],
            }],
        };
        assert!(project.has_field("data fim"));
        assert!(project.has_field(" DATA FIM "));
        assert!(!project.has_field("Due"));
        assert_eq!(project.field("Data Fim").map(|f| f.id.as_str()), Some("PVTF_date"));
    }
}
