//! IAM Audit Agent
//!
//! Inventories IAM policies and roles, classifies roles as Keep / Review /
//! Remove and writes the results as CSV. Credentials come from the standard
//! `AWS_*` environment variables.
//!
//! # Usage
//! ```bash
//! # Export customer-managed policies with their attached roles
//! iam-audit policies --output s3://audit-reports/Polices/custom_iam_policies_with_roles.csv
//!
//! # Classify every role in the account
//! iam-audit roles --output classified_roles.csv
//!
//! # Classify an exported role inventory
//! iam-audit classify --input roles.csv --output classified_roles.csv
//! ```

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, Instrument};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use iam_audit::classifier::{DEFAULT_ABANDONED_AFTER_DAYS, DEFAULT_REQUIRED_PREFIX, DEFAULT_STALE_AFTER_DAYS};
use iam_audit::collector::DEFAULT_MAX_WORKERS;
use iam_audit::exporter::{DEFAULT_POLICY_REPORT, DEFAULT_ROLE_REPORT};
use iam_audit::inventory;
use iam_audit::types::{ClassifiedRecord, PolicyScope};
use iam_audit::{
    AbsentLastUsed, Classifier, ClassifierConfig, CollectionStats, Collector, CollectorSettings, Credentials,
    Destination, Exporter, IamQueryClient, LastUsedCache, RetryPolicy, SigV4Signer,
};

// ============================================================
// CLI Definition
// ============================================================

#[derive(Parser)]
#[command(name = "iam-audit")]
#[command(about = "Lornu AI IAM Audit Agent", long_about = None)]
#[command(version)]
struct Cli {
    /// AWS region used for S3 exports
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1", global = true)]
    region: String,

    /// Override the IAM endpoint (e.g. a local test server)
    #[arg(long, env = "IAM_ENDPOINT_URL", global = true)]
    iam_endpoint: Option<String>,

    /// IAM page size (MaxItems, 1-1000)
    #[arg(long, env = "IAM_AUDIT_PAGE_SIZE", default_value_t = 50, global = true)]
    page_size: u32,

    /// Maximum entities enriched concurrently
    #[arg(long, env = "IAM_AUDIT_MAX_WORKERS", default_value_t = DEFAULT_MAX_WORKERS, global = true)]
    max_workers: usize,

    /// Retries for throttled or failed IAM calls (0 disables)
    #[arg(long, env = "IAM_AUDIT_RETRIES", default_value_t = 2, global = true)]
    retries: u32,

    /// Base backoff between retries in milliseconds
    #[arg(long, default_value_t = 200, global = true)]
    retry_delay_ms: u64,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, env = "IAM_AUDIT_JSON_LOGS", global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export managed policies with their attached roles and last-used times
    Policies {
        /// Which managed policies to list
        #[arg(long, value_enum, default_value_t = PolicyScope::Local)]
        scope: PolicyScope,

        /// Local path or s3://bucket/key
        #[arg(short, long, env = "IAM_AUDIT_OUTPUT", default_value = DEFAULT_POLICY_REPORT)]
        output: String,
    },

    /// Classify every role in the account
    Roles {
        #[command(flatten)]
        rules: RuleArgs,

        /// Local path or s3://bucket/key
        #[arg(short, long, default_value = DEFAULT_ROLE_REPORT)]
        output: String,
    },

    /// Classify roles from an inventory CSV
    Classify {
        /// CSV with Role Name, Creation Date, Last Used and Attached Policies columns
        #[arg(short, long)]
        input: PathBuf,

        #[command(flatten)]
        rules: RuleArgs,

        /// Local path or s3://bucket/key
        #[arg(short, long, default_value = DEFAULT_ROLE_REPORT)]
        output: String,
    },
}

#[derive(Args)]
struct RuleArgs {
    /// Roles whose name lacks this prefix are flagged for review
    #[arg(long, env = "IAM_AUDIT_REQUIRED_PREFIX", default_value = DEFAULT_REQUIRED_PREFIX)]
    required_prefix: String,

    /// Days without use before a role is abandoned
    #[arg(long, default_value_t = DEFAULT_ABANDONED_AFTER_DAYS)]
    abandoned_days: i64,

    /// Days without use before a role is stale
    #[arg(long, default_value_t = DEFAULT_STALE_AFTER_DAYS)]
    stale_days: i64,

    /// How roles that were never used are treated
    #[arg(long, value_enum, default_value_t = AbsentLastUsed::Abandoned)]
    absent_last_used: AbsentLastUsed,

    /// Evaluation date (YYYY-MM-DD), defaults to today in UTC
    #[arg(long)]
    as_of: Option<NaiveDate>,
}

impl RuleArgs {
    fn classifier(self) -> Classifier {
        let config = ClassifierConfig {
            required_prefix: self.required_prefix,
            abandoned_after_days: self.abandoned_days,
            stale_after_days: self.stale_days,
            absent_last_used: self.absent_last_used,
        };
        match self.as_of {
            Some(date) => Classifier::new(config, date),
            None => Classifier::today(config),
        }
    }
}

/// Printed to stdout when a run finishes
#[derive(Debug, Serialize)]
struct RunSummary {
    run_id: String,
    command: &'static str,
    destination: String,
    records: usize,
    bytes_written: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    collection: Option<CollectionStats>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    verdicts: BTreeMap<String, usize>,
}

// ============================================================
// Main Entry Point
// ============================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs)?;

    let run_id = Uuid::new_v4();
    let summary = run(cli, run_id)
        .instrument(info_span!("run", run_id = %run_id))
        .await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn init_tracing(verbose: bool, json: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

async fn run(cli: Cli, run_id: Uuid) -> Result<RunSummary> {
    info!("🚀 IAM Audit Agent starting...");

    let settings = CollectorSettings {
        max_workers: cli.max_workers.max(1),
        retry: RetryPolicy::new(cli.retries, Duration::from_millis(cli.retry_delay_ms)),
    };

    match cli.command {
        Commands::Policies { scope, output } => {
            let destination: Destination = output.parse().context("Invalid --output")?;
            let credentials = aws_credentials()?;
            let collector = build_collector(credentials.clone(), cli.iam_endpoint.as_deref(), cli.page_size, settings)?;

            let collection = collector
                .collect_policies(scope)
                .await
                .context("Failed to collect IAM policy inventory")?;

            let exporter = Exporter::new(Some(SigV4Signer::new(credentials, &cli.region, "s3")))?;
            let bytes_written = exporter
                .export(&collection.rows, &destination)
                .await
                .context("Failed to export policy inventory")?;

            Ok(RunSummary {
                run_id: run_id.to_string(),
                command: "policies",
                destination: destination.to_string(),
                records: collection.rows.len(),
                bytes_written,
                collection: Some(collection.stats),
                verdicts: BTreeMap::new(),
            })
        }

        Commands::Roles { rules, output } => {
            let destination: Destination = output.parse().context("Invalid --output")?;
            let credentials = aws_credentials()?;
            let collector = build_collector(credentials.clone(), cli.iam_endpoint.as_deref(), cli.page_size, settings)?;

            let collection = collector
                .collect_roles()
                .await
                .context("Failed to collect IAM role inventory")?;

            let classifier = rules.classifier();
            info!(roles = collection.roles.len(), as_of = %classifier.evaluation_date(), "⚖️  Classifying roles");
            let classified = classifier.classify_all(&collection.roles);

            let exporter = Exporter::new(Some(SigV4Signer::new(credentials, &cli.region, "s3")))?;
            let bytes_written = exporter
                .export(&classified, &destination)
                .await
                .context("Failed to export role classification")?;

            Ok(RunSummary {
                run_id: run_id.to_string(),
                command: "roles",
                destination: destination.to_string(),
                records: classified.len(),
                bytes_written,
                collection: Some(collection.stats),
                verdicts: verdict_histogram(&classified),
            })
        }

        Commands::Classify { input, rules, output } => {
            let destination: Destination = output.parse().context("Invalid --output")?;

            info!("📂 Reading role inventory from {}", input.display());
            let roles = inventory::load_roles(&input)
                .await
                .with_context(|| format!("Failed to read role inventory {}", input.display()))?;

            let classifier = rules.classifier();
            info!(roles = roles.len(), as_of = %classifier.evaluation_date(), "⚖️  Classifying roles");
            let classified = classifier.classify_all(&roles);

            // Credentials are only needed when writing to S3
            let signer = Credentials::from_env()
                .ok()
                .map(|credentials| SigV4Signer::new(credentials, &cli.region, "s3"));
            let bytes_written = Exporter::new(signer)?
                .export(&classified, &destination)
                .await
                .context("Failed to export role classification")?;

            Ok(RunSummary {
                run_id: run_id.to_string(),
                command: "classify",
                destination: destination.to_string(),
                records: classified.len(),
                bytes_written,
                collection: None,
                verdicts: verdict_histogram(&classified),
            })
        }
    }
}

fn aws_credentials() -> Result<Credentials> {
    info!("🔐 Loading AWS credentials from environment");
    Credentials::from_env().context("AWS credentials are required to query IAM")
}

fn build_collector(
    credentials: Credentials,
    endpoint: Option<&str>,
    page_size: u32,
    settings: CollectorSettings,
) -> Result<Collector> {
    let client = match endpoint {
        Some(endpoint) => IamQueryClient::with_endpoint(credentials, endpoint)?,
        None => IamQueryClient::new(credentials)?,
    }
    .with_page_size(page_size);
    info!("✅ IAM client ready");

    Ok(Collector::new(Arc::new(client), Arc::new(LastUsedCache::new()), settings))
}

/// Count of records per `Action / Category`
fn verdict_histogram(records: &[ClassifiedRecord]) -> BTreeMap<String, usize> {
    let mut histogram = BTreeMap::new();
    for record in records {
        *histogram
            .entry(format!("{} / {}", record.action, record.category))
            .or_insert(0) += 1;
    }
    histogram
}
