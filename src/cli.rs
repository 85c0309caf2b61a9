//! Operator commands.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use figment::providers::Serialized;
use kairan::config::{DEFAULT_CONFIG_FILE, KairanConfig};
use kairan::{
    JobFilter, JobId, JobStatus, JobStore, ListJobsOptions, PostgresStore, RequestType, SortField,
    SortOrder, UserId,
};
use serde::Serialize;

/// Inspect and operate the kairan job queue.
#[derive(Debug, Parser)]
#[command(name = "kairan", version, about)]
pub struct Cli {
    /// Configuration file.
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Database URL, overriding `database.url`.
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply pending schema migrations.
    Migrate,

    /// Count jobs per status.
    Stats,

    /// List jobs, newest first by default.
    List(ListArgs),

    /// Show one job.
    Show(JobArgs),

    /// Put a failed job back in the queue.
    Retry(JobArgs),

    /// Cancel a job that has not been claimed yet.
    Cancel(JobArgs),

    /// Move exhausted jobs to dead letter.
    DeadLetter,

    /// Delete old completed, cancelled and dead-lettered jobs.
    Purge(PurgeArgs),
}

#[derive(Debug, Args)]
pub struct JobArgs {
    /// Job id.
    pub id: JobId,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    pub status: Option<JobStatus>,

    #[arg(long)]
    pub request_type: Option<RequestType>,

    #[arg(long)]
    pub user: Option<UserId>,

    /// 1-based page number.
    #[arg(long, default_value_t = 1)]
    pub page: u32,

    #[arg(long, default_value_t = ListJobsOptions::DEFAULT_PAGE_SIZE)]
    pub page_size: u32,

    /// created_at, processed_at or attempts.
    #[arg(long, default_value = "created_at")]
    pub sort: SortField,

    /// asc or desc.
    #[arg(long, default_value = "desc")]
    pub order: SortOrder,
}

impl From<ListArgs> for ListJobsOptions {
    fn from(args: ListArgs) -> Self {
        ListJobsOptions {
            filter: JobFilter {
                status: args.status,
                request_type: args.request_type,
                user_id: args.user,
            },
            page: args.page,
            page_size: args.page_size,
            sort: args.sort,
            order: args.order,
        }
    }
}

#[derive(Debug, Args)]
pub struct PurgeArgs {
    /// Keep jobs resolved within this many days.
    #[arg(long)]
    pub older_than_days: u32,
}

impl Cli {
    fn load_config(&self) -> Result<KairanConfig> {
        let mut figment = KairanConfig::figment(&self.config);
        if let Some(url) = &self.database_url {
            figment = figment.merge(Serialized::default("database.url", url));
        }
        KairanConfig::from_figment(&figment)
            .with_context(|| format!("failed to load configuration from {}", self.config.display()))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run(cli: Cli) -> Result<()> {
    let config = cli.load_config()?;
    let pool = config
        .database
        .connect()
        .await
        .context("failed to connect to database")?;
    let store = PostgresStore::new(pool).options(config.queue.into());

    match cli.command {
        Command::Migrate => {
            store.migrate().await.context("migration failed")?;
            tracing::info!("migrations applied");
        }
        Command::Stats => print_json(&store.stats().await?)?,
        Command::List(args) => {
            let options = ListJobsOptions::from(args);
            print_json(&store.list(&options).await?)?;
        }
        Command::Show(JobArgs { id }) => {
            let job = store
                .get(id)
                .await?
                .with_context(|| format!("job {id} not found"))?;
            print_json(&job)?;
        }
        Command::Retry(JobArgs { id }) => {
            let job = store
                .reset_to_pending(id)
                .await?
                .with_context(|| format!("job {id} not found or not failed"))?;
            print_json(&job)?;
        }
        Command::Cancel(JobArgs { id }) => {
            let job = store
                .cancel(id)
                .await?
                .with_context(|| format!("job {id} not found or no longer pending"))?;
            print_json(&job)?;
        }
        Command::DeadLetter => {
            let moved = store.dead_letter_exhausted().await?;
            print_json(&moved)?;
        }
        Command::Purge(PurgeArgs { older_than_days }) => {
            let before = chrono::Utc::now() - chrono::Duration::days(i64::from(older_than_days));
            let purged = store.purge_terminal(before).await?;
            print_json(&serde_json::json!({ "purged": purged, "before": before }))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_arguments_parse_into_options() {
        let cli = Cli::try_parse_from([
            "kairan",
            "list",
            "--status",
            "failed",
            "--request-type",
            "page_draft",
            "--page",
            "2",
            "--sort",
            "attempts",
            "--order",
            "asc",
        ])
        .unwrap();

        let Command::List(args) = cli.command else {
            panic!("expected list command");
        };
        let options = ListJobsOptions::from(args);
        assert_eq!(options.filter.status, Some(JobStatus::Failed));
        assert_eq!(options.filter.request_type, Some(RequestType::PageDraft));
        assert_eq!(options.page, 2);
        assert_eq!(options.page_size, ListJobsOptions::DEFAULT_PAGE_SIZE);
        assert_eq!(options.sort, SortField::Attempts);
        assert_eq!(options.order, SortOrder::Asc);
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(Cli::try_parse_from(["kairan", "list", "--status", "stuck"]).is_err());
    }

    #[test]
    fn purge_requires_an_age() {
        assert!(Cli::try_parse_from(["kairan", "purge"]).is_err());
        let cli = Cli::try_parse_from(["kairan", "purge", "--older-than-days", "30"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Purge(PurgeArgs { older_than_days: 30 })
        ));
    }

    #[test]
    fn database_url_flag_overrides_configuration() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("kairan.toml", "[database]\nurl = \"postgres://file/db\"\n")?;
            let cli = Cli::try_parse_from([
                "kairan",
                "--database-url",
                "postgres://flag/db",
                "stats",
            ])
            .unwrap();
            let config = cli.load_config().unwrap();
            assert_eq!(config.database.url, "postgres://flag/db");
            Ok(())
        });
    }
}
