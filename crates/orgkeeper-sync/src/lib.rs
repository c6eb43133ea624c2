//! Catalog loaders, label sync planning and the date-field synchronizer.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use orgkeeper_cache::{CacheStore, FingerprintTracker};
use orgkeeper_core::{decide, Action, Issue, Label, ProjectDef, ProjectMembership, RepoEntry};
use orgkeeper_github::{ApiError, FieldWriter, IssueSource, LabelEndpoint};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "orgkeeper-sync";

pub const DEFAULT_FIELD_NAME: &str = "Data Fim";
pub const DEFAULT_SINCE_DAYS: u32 = 7;

// ---------------------------------------------------------------------------
// Catalogs

#[derive(Debug, Serialize, Deserialize)]
struct ProjectCatalogFile {
    #[serde(default)]
    projects: Vec<ProjectDef>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LabelTemplateFile {
    #[serde(default)]
    labels: Vec<Label>,
}

/// Repository inventory CSV (`name,archived`), as produced by the repos
/// export.
pub fn load_repo_catalog(path: impl AsRef<Path>) -> Result<Vec<RepoEntry>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("reading repository catalog {}", path.display()))?;
    let mut repos = Vec::new();
    for row in reader.deserialize() {
        let repo: RepoEntry =
            row.with_context(|| format!("parsing repository catalog {}", path.display()))?;
        repos.push(repo);
    }
    Ok(repos)
}

pub fn write_repo_catalog(path: impl AsRef<Path>, repos: &[RepoEntry]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("writing repository catalog {}", path.display()))?;
    for repo in repos {
        writer
            .serialize(repo)
            .with_context(|| format!("serializing repository row for {}", repo.name))?;
    }
    writer.flush().context("flushing repository catalog")?;
    Ok(())
}

/// Project/field schema catalog (YAML with a top-level `projects` list).
pub fn load_project_catalog(path: impl AsRef<Path>) -> Result<Vec<ProjectDef>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading project catalog {}", path.display()))?;
    let file: ProjectCatalogFile = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing project catalog {}", path.display()))?;
    Ok(file.projects)
}

pub fn write_project_catalog(path: impl AsRef<Path>, projects: &[ProjectDef]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = ProjectCatalogFile {
        projects: projects.to_vec(),
    };
    let text = serde_yaml::to_string(&file).context("serializing project catalog")?;
    std::fs::write(path, text)
        .with_context(|| format!("writing project catalog {}", path.display()))?;
    Ok(())
}

/// Label template (YAML with a top-level `labels` list).
pub fn load_label_template(path: impl AsRef<Path>) -> Result<Vec<Label>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading label template {}", path.display()))?;
    let file: LabelTemplateFile = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing label template {}", path.display()))?;
    Ok(file.labels)
}

/// A project whose schema actually carries the monitored field, with the
/// field id resolved.
#[derive(Debug, Clone)]
pub struct TrackedProject {
    pub project: ProjectDef,
    pub field_id: String,
}

/// Filter the catalog down to projects carrying the monitored field.
/// Projects lacking it are a schema mismatch: warned about and skipped,
/// never fatal.
pub fn tracked_projects(
    projects: &[ProjectDef],
    field_name: &str,
    number_filter: Option<&[u64]>,
) -> Vec<TrackedProject> {
    let mut tracked = Vec::new();
    for project in projects {
        if let Some(numbers) = number_filter {
            if !numbers.contains(&project.number) {
                continue;
            }
        }
        match project.field(field_name) {
            Some(field) => tracked.push(TrackedProject {
                project: project.clone(),
                field_id: field.id.clone(),
            }),
            None => warn!(
                project = %project.title,
                number = project.number,
                field = field_name,
                "project lacks the monitored field, skipping"
            ),
        }
    }
    tracked
}

/// Resolve one issue's memberships in the tracked projects, pairing each
/// project item with the monitored field's id and current value.
pub fn resolve_memberships(
    issue: &Issue,
    tracked: &[TrackedProject],
    field_name: &str,
) -> Vec<ProjectMembership> {
    let mut memberships = Vec::new();
    for item in &issue.project_items {
        let Some(target) = tracked.iter().find(|t| t.project.id == item.project_id) else {
            continue;
        };
        memberships.push(ProjectMembership {
            project_id: item.project_id.clone(),
            project_title: item.project_title.clone(),
            item_id: item.item_id.clone(),
            status: item.status.clone(),
            field_id: target.field_id.clone(),
            field_value: item.date_value(field_name),
        });
    }
    memberships
}

// ---------------------------------------------------------------------------
// Date-field synchronizer

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub org: String,
    pub field_name: String,
    pub since_days: u32,
    pub process_all: bool,
    pub project_numbers: Option<Vec<u64>>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            org: String::new(),
            field_name: DEFAULT_FIELD_NAME.to_string(),
            since_days: DEFAULT_SINCE_DAYS,
            process_all: false,
            project_numbers: None,
        }
    }
}

impl SyncOptions {
    /// Lower bound pushed into the issue query; `None` means full scan.
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.process_all || self.since_days == 0 {
            None
        } else {
            Some(now - Duration::days(i64::from(self.since_days)))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub repository: String,
    pub issue_number: Option<u64>,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub repos_scanned: usize,
    pub repos_skipped: usize,
    pub issues_processed: usize,
    pub issues_skipped: usize,
    pub fields_cleared: usize,
    pub fields_filled: usize,
    pub failures: Vec<ItemFailure>,
}

impl RunSummary {
    pub fn actions_applied(&self) -> usize {
        self.fields_cleared + self.fields_filled
    }

    /// Everything that was attempted failed; the CLI exits nonzero then.
    /// Fingerprint-skipped issues count as successful work: a run that
    /// confirmed most issues unchanged is not a total failure.
    pub fn all_failed(&self) -> bool {
        !self.failures.is_empty()
            && self.issues_processed == 0
            && self.issues_skipped == 0
            && self.actions_applied() == 0
    }
}

/// Orchestrates one reconciliation run: per repository fetch, per issue
/// fingerprint check and rule decision, one field-update call per
/// non-trivial action. Failures on one issue or repository are recorded
/// and the run continues; only an authentication failure is fatal.
pub struct DateFieldSynchronizer<'a> {
    source: &'a dyn IssueSource,
    writer: &'a dyn FieldWriter,
    store: &'a CacheStore,
    options: SyncOptions,
}

impl<'a> DateFieldSynchronizer<'a> {
    pub fn new(
        source: &'a dyn IssueSource,
        writer: &'a dyn FieldWriter,
        store: &'a CacheStore,
        options: SyncOptions,
    ) -> Self {
        Self {
            source,
            writer,
            store,
            options,
        }
    }

    pub async fn run(
        &self,
        repos: &[RepoEntry],
        projects: &[ProjectDef],
    ) -> Result<RunSummary> {
        let tracked = tracked_projects(
            projects,
            &self.options.field_name,
            self.options.project_numbers.as_deref(),
        );
        let mut summary = RunSummary::default();

        if tracked.is_empty() {
            warn!(field = %self.options.field_name, "no tracked projects carry the monitored field");
            return Ok(summary);
        }

        match self.store.maybe_clean_expired().await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "swept expired cache records"),
            Err(err) => warn!(%err, "cache sweep failed"),
        }

        let since = self.options.since(Utc::now());
        let tracker = FingerprintTracker::new(self.store);

        info!(
            org = %self.options.org,
            tracked = tracked.len(),
            since = ?since.map(|ts| ts.to_rfc3339()),
            "starting date-field run"
        );

        for repo in repos {
            if repo.archived {
                debug!(repo = %repo.name, "skipping archived repository");
                summary.repos_skipped += 1;
                continue;
            }

            match self.source.repo_issue_count(&self.options.org, &repo.name).await {
                Ok(0) => {
                    debug!(repo = %repo.name, "repository has no issues, skipping fetch");
                    summary.repos_skipped += 1;
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    self.record_repo_failure(&mut summary, &repo.name, err)?;
                    continue;
                }
            }

            let issues = match self
                .source
                .fetch_issues(&self.options.org, &repo.name, since)
                .await
            {
                Ok(issues) => issues,
                Err(err) => {
                    self.record_repo_failure(&mut summary, &repo.name, err)?;
                    continue;
                }
            };

            summary.repos_scanned += 1;
            debug!(repo = %repo.name, issues = issues.len(), "processing repository");

            for issue in &issues {
                self.process_issue(issue, &tracked, &tracker, &mut summary)
                    .await?;
            }
        }

        info!(
            repos_scanned = summary.repos_scanned,
            repos_skipped = summary.repos_skipped,
            processed = summary.issues_processed,
            skipped = summary.issues_skipped,
            cleared = summary.fields_cleared,
            filled = summary.fields_filled,
            failed = summary.failures.len(),
            "date-field run finished"
        );
        Ok(summary)
    }

    async fn process_issue(
        &self,
        issue: &Issue,
        tracked: &[TrackedProject],
        tracker: &FingerprintTracker<'_>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let memberships = resolve_memberships(issue, tracked, &self.options.field_name);
        if memberships.is_empty() {
            return Ok(());
        }

        let check = tracker.should_process(issue, &memberships).await;
        if !check.changed {
            debug!(
                repo = %issue.repository,
                issue = issue.number,
                "fingerprint unchanged, skipping"
            );
            summary.issues_skipped += 1;
            return Ok(());
        }

        let mut issue_failed = false;
        for membership in &memberships {
            let action = decide(membership, issue.is_closed(), issue.closed_date());
            match action {
                Action::None => {}
                Action::Clear { ref field_id } => {
                    info!(
                        repo = %issue.repository,
                        issue = issue.number,
                        project = %membership.project_title,
                        before = %membership
                            .field_value
                            .map(|d| d.to_string())
                            .unwrap_or_default(),
                        after = "null",
                        "clearing date field"
                    );
                    if let Err(err) = self
                        .writer
                        .set_field(&membership.project_id, &membership.item_id, field_id, None)
                        .await
                    {
                        issue_failed = true;
                        self.record_issue_failure(summary, issue, err)?;
                    } else {
                        summary.fields_cleared += 1;
                    }
                }
                Action::Fill { ref field_id, date } => {
                    info!(
                        repo = %issue.repository,
                        issue = issue.number,
                        project = %membership.project_title,
                        before = "null",
                        after = %date,
                        "filling date field with close date"
                    );
                    if let Err(err) = self
                        .writer
                        .set_field(
                            &membership.project_id,
                            &membership.item_id,
                            field_id,
                            Some(date),
                        )
                        .await
                    {
                        issue_failed = true;
                        self.record_issue_failure(summary, issue, err)?;
                    } else {
                        summary.fields_filled += 1;
                    }
                }
            }
        }

        if issue_failed {
            // Leaving the old fingerprint in place makes the next run
            // retry this issue.
            return Ok(());
        }

        summary.issues_processed += 1;
        if let Err(err) = tracker.mark_processed(&issue.id, &check.current).await {
            warn!(issue = issue.number, %err, "failed to persist fingerprint");
        }
        Ok(())
    }

    /// Fatal errors bubble out; everything else lands in the summary.
    fn record_repo_failure(
        &self,
        summary: &mut RunSummary,
        repo: &str,
        err: ApiError,
    ) -> Result<()> {
        if err.is_fatal() {
            return Err(err).context("authentication failed, aborting run");
        }
        warn!(repo, %err, "repository failed, continuing");
        summary.failures.push(ItemFailure {
            repository: repo.to_string(),
            issue_number: None,
            error: err.to_string(),
        });
        Ok(())
    }

    fn record_issue_failure(
        &self,
        summary: &mut RunSummary,
        issue: &Issue,
        err: ApiError,
    ) -> Result<()> {
        if err.is_fatal() {
            return Err(err).context("authentication failed, aborting run");
        }
        warn!(
            repo = %issue.repository,
            issue = issue.number,
            %err,
            "field update failed, continuing"
        );
        summary.failures.push(ItemFailure {
            repository: issue.repository.clone(),
            issue_number: Some(issue.number),
            error: err.to_string(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Label sync

#[derive(Debug, Clone, Default)]
pub struct LabelPlan {
    pub create: Vec<Label>,
    pub update: Vec<Label>,
    pub delete: Vec<String>,
}

impl LabelPlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

fn normalize_color(color: &str) -> String {
    color.trim_start_matches('#').to_lowercase()
}

/// Diff the desired template against the labels a repository actually has.
/// Name matching is case-insensitive; a label counts as drifted when its
/// color or description differ. Deletes are only planned when
/// `delete_extras` is set.
pub fn plan_labels(desired: &[Label], existing: &[Label], delete_extras: bool) -> LabelPlan {
    let existing_by_name: BTreeMap<String, &Label> = existing
        .iter()
        .map(|l| (l.name.to_lowercase(), l))
        .collect();
    let desired_names: Vec<String> = desired.iter().map(|l| l.name.to_lowercase()).collect();

    let mut plan = LabelPlan::default();
    for label in desired {
        match existing_by_name.get(&label.name.to_lowercase()) {
            None => plan.create.push(label.clone()),
            Some(current) => {
                let color_drift = normalize_color(&current.color) != normalize_color(&label.color);
                let description_drift = current.description.as_deref().unwrap_or("")
                    != label.description.as_deref().unwrap_or("");
                if color_drift || description_drift {
                    plan.update.push(label.clone());
                }
            }
        }
    }

    if delete_extras {
        for label in existing {
            if !desired_names.contains(&label.name.to_lowercase()) {
                plan.delete.push(label.name.clone());
            }
        }
    }

    plan
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LabelSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Apply the label template to one repository. Idempotent: a second run
/// against the resulting state plans nothing.
pub async fn sync_repo_labels(
    endpoint: &dyn LabelEndpoint,
    org: &str,
    repo: &str,
    desired: &[Label],
    delete_extras: bool,
) -> Result<LabelSummary, ApiError> {
    let existing = endpoint.list_labels(org, repo).await?;
    let plan = plan_labels(desired, &existing, delete_extras);
    let mut summary = LabelSummary::default();

    if plan.is_empty() {
        debug!(repo, "labels already in sync");
        return Ok(summary);
    }

    for label in &plan.create {
        match endpoint.create_label(org, repo, label).await {
            Ok(()) => summary.created += 1,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(repo, label = %label.name, %err, "label create failed");
                summary.failed += 1;
            }
        }
    }
    for label in &plan.update {
        match endpoint.update_label(org, repo, label).await {
            Ok(()) => summary.updated += 1,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(repo, label = %label.name, %err, "label update failed");
                summary.failed += 1;
            }
        }
    }
    for name in &plan.delete {
        match endpoint.delete_label(org, repo, name).await {
            Ok(()) => summary.deleted += 1,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(repo, label = %name, %err, "label delete failed");
                summary.failed += 1;
            }
        }
    }

    info!(
        repo,
        created = summary.created,
        updated = summary.updated,
        deleted = summary.deleted,
        failed = summary.failed,
        "labels synchronized"
    );
    Ok(summary)
}
