//! orgkeeper command-line interface.
//!
//! Configuration precedence: command-line flag > environment variable >
//! built-in default.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use orgkeeper_cache::{CacheMode, CacheStore};
use orgkeeper_github::{
    AppCredentials, AppTokenProvider, GithubClient, IssueFetcher, StaticTokenProvider,
    TokenProvider,
};
use orgkeeper_sync::{
    load_label_template, load_project_catalog, load_repo_catalog, sync_repo_labels,
    write_project_catalog, write_repo_catalog, DateFieldSynchronizer, SyncOptions,
    DEFAULT_FIELD_NAME, DEFAULT_SINCE_DAYS,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "orgkeeper")]
#[command(about = "Keeps GitHub organization metadata in shape: close-date fields, labels, catalogs")]
struct Cli {
    /// Organization to operate on.
    #[arg(long, env = "GITHUB_ORG", global = true)]
    org: Option<String>,

    /// Directory holding the durable cache records.
    #[arg(long, env = "ORGKEEPER_CACHE_DIR", default_value = "cache", global = true)]
    cache_dir: PathBuf,

    /// Bypass the cache entirely (reads miss, writes are dropped).
    #[arg(long, global = true)]
    skip_cache: bool,

    /// Treat every cache entry as expired for this run without deleting it.
    #[arg(long, global = true)]
    force_refresh: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the monitored close-date field across tracked projects.
    SyncDates {
        /// Only consider issues updated in the last N days (0 = no bound).
        #[arg(long, default_value_t = DEFAULT_SINCE_DAYS)]
        since_days: u32,

        /// Full scan: ignore the since-days window entirely.
        #[arg(long)]
        all: bool,

        /// Name of the monitored date field.
        #[arg(long, default_value = DEFAULT_FIELD_NAME)]
        field: String,

        /// Restrict to specific project numbers (comma separated).
        #[arg(long, value_delimiter = ',')]
        projects: Option<Vec<u64>>,

        #[arg(long, default_value = "config/repos_list.csv")]
        repos_file: PathBuf,

        #[arg(long, default_value = "config/projects-panels.yml")]
        projects_file: PathBuf,
    },

    /// Export the organization's repositories to the CSV inventory.
    Repos {
        #[arg(long, default_value = "config/repos_list.csv")]
        output: PathBuf,
    },

    /// Export ProjectV2 schemas to the YAML project catalog.
    Panels {
        #[arg(long, default_value = "config/projects-panels.yml")]
        output: PathBuf,
    },

    /// Synchronize the label template across repositories.
    Labels {
        #[arg(long, default_value = "config/labels.yaml")]
        labels_file: PathBuf,

        #[arg(long, default_value = "config/repos_list.csv")]
        repos_file: PathBuf,

        /// Also delete labels not present in the template.
        #[arg(long)]
        delete_extras: bool,

        /// Restrict to specific repositories (comma separated).
        #[arg(long, value_delimiter = ',')]
        repos: Option<Vec<String>>,
    },

    /// Report cache statistics without touching the network.
    CacheStats,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// GitHub App credentials when configured, plain `GITHUB_TOKEN` otherwise.
fn token_provider() -> Result<Box<dyn TokenProvider>> {
    match AppCredentials::from_env() {
        Ok(creds) => {
            info!("authenticating as a GitHub App installation");
            Ok(Box::new(AppTokenProvider::new(creds)?))
        }
        Err(app_err) => match std::env::var("GITHUB_TOKEN") {
            Ok(token) if !token.is_empty() => Ok(Box::new(StaticTokenProvider::new(token))),
            _ => bail!(
                "no credentials: set GITHUB_APP_ID/GITHUB_APP_INSTALLATION_ID/GITHUB_APP_PRIVATE_KEY \
                 or GITHUB_TOKEN ({app_err})"
            ),
        },
    }
}

fn require_org(org: Option<String>) -> Result<String> {
    org.context("no organization given: pass --org or set GITHUB_ORG")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mode = if cli.skip_cache {
        CacheMode::Bypass
    } else if cli.force_refresh {
        CacheMode::RefreshAll
    } else {
        CacheMode::Normal
    };
    let store = CacheStore::new(&cli.cache_dir, mode);

    match cli.command {
        Commands::SyncDates {
            since_days,
            all,
            field,
            projects,
            repos_file,
            projects_file,
        } => {
            let org = require_org(cli.org)?;
            let repos = load_repo_catalog(&repos_file)
                .context("repository catalog missing; run `orgkeeper repos` first")?;
            let project_defs = load_project_catalog(&projects_file)
                .context("project catalog missing; run `orgkeeper panels` first")?;

            let client = GithubClient::new(token_provider()?)?;
            let fetcher = IssueFetcher::new(&client, &store);
            let options = SyncOptions {
                org,
                field_name: field,
                since_days,
                process_all: all,
                project_numbers: projects,
            };
            let sync = DateFieldSynchronizer::new(&fetcher, &client, &store, options);
            let summary = sync.run(&repos, &project_defs).await?;

            println!(
                "sync complete: {} scanned, {} skipped repos, {} processed, {} unchanged, \
                 {} cleared, {} filled, {} failures",
                summary.repos_scanned,
                summary.repos_skipped,
                summary.issues_processed,
                summary.issues_skipped,
                summary.fields_cleared,
                summary.fields_filled,
                summary.failures.len(),
            );
            for failure in &summary.failures {
                warn!(
                    repo = %failure.repository,
                    issue = ?failure.issue_number,
                    error = %failure.error,
                    "item failed"
                );
            }
            if summary.all_failed() {
                bail!("every attempted item failed");
            }
        }

        Commands::Repos { output } => {
            let org = require_org(cli.org)?;
            let client = GithubClient::new(token_provider()?)?;
            let repos = match store
                .get::<Vec<orgkeeper_core::RepoEntry>>(
                    orgkeeper_cache::CacheCategory::Repositories,
                    &org,
                )
                .await
            {
                Some(cached) => cached,
                None => {
                    let fetched = client.list_repositories(&org).await?;
                    if let Err(err) = store
                        .put(orgkeeper_cache::CacheCategory::Repositories, &org, &fetched)
                        .await
                    {
                        warn!(%err, "failed to cache repository list");
                    }
                    fetched
                }
            };
            write_repo_catalog(&output, &repos)?;
            println!("exported {} repositories to {}", repos.len(), output.display());
        }

        Commands::Panels { output } => {
            let org = require_org(cli.org)?;
            let client = GithubClient::new(token_provider()?)?;
            let projects = match store
                .get::<Vec<orgkeeper_core::ProjectDef>>(
                    orgkeeper_cache::CacheCategory::Projects,
                    &org,
                )
                .await
            {
                Some(cached) => cached,
                None => {
                    let fetched = client.list_org_projects(&org).await?;
                    if let Err(err) = store
                        .put(orgkeeper_cache::CacheCategory::Projects, &org, &fetched)
                        .await
                    {
                        warn!(%err, "failed to cache project catalog");
                    }
                    fetched
                }
            };
            write_project_catalog(&output, &projects)?;
            println!("exported {} projects to {}", projects.len(), output.display());
        }

        Commands::Labels {
            labels_file,
            repos_file,
            delete_extras,
            repos,
        } => {
            let org = require_org(cli.org)?;
            let template = load_label_template(&labels_file)?;
            let inventory = load_repo_catalog(&repos_file)
                .context("repository catalog missing; run `orgkeeper repos` first")?;
            let client = GithubClient::new(token_provider()?)?;

            let mut synced = 0usize;
            let mut failed = 0usize;
            for repo in &inventory {
                if repo.archived {
                    continue;
                }
                if let Some(only) = &repos {
                    if !only.contains(&repo.name) {
                        continue;
                    }
                }
                match sync_repo_labels(&client, &org, &repo.name, &template, delete_extras).await {
                    Ok(_) => synced += 1,
                    Err(err) if err.is_fatal() => return Err(err.into()),
                    Err(err) => {
                        warn!(repo = %repo.name, %err, "label sync failed for repository");
                        failed += 1;
                    }
                }
            }
            println!("labels synchronized: {synced} repositories ok, {failed} failed");
            if failed > 0 && synced == 0 {
                bail!("label sync failed for every repository");
            }
        }

        Commands::CacheStats => {
            let stats = store.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
