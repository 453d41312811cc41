//! Command surface for the sharded activity store.
//!
//! [`run_cli`] executes a parsed [`Cli`] against the shards named in the
//! sharding config. Query commands print an `activity_page.v1` JSON envelope
//! on stdout; diagnostics go to stderr through `tracing`.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use taskflow_activity_core::{
    parse_rfc3339_utc, Action, Activity, ActivityQuery, ActivityQueryService, BucketRouter,
    DomainEvent, EntityType, OpContext, Recorder, ShardedActivityStore, ShardingConfig,
    TopologyReport,
};
use taskflow_activity_store_sqlite::open_sharded_store;
use time::OffsetDateTime;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

pub const ACTIVITY_PAGE_CONTRACT: &str = "activity_page.v1";
pub const SHARD_ROUTE_CONTRACT: &str = "shard_route.v1";
pub const INGEST_REPORT_CONTRACT: &str = "ingest_report.v1";
pub const DEFAULT_PAGE_LIMIT: usize = 20;

#[derive(Debug, Parser)]
#[command(name = "tfa")]
#[command(about = "Taskflow sharded activity store CLI")]
pub struct Cli {
    #[arg(long, env = "TFA_CONFIG", default_value = "./activity.yaml")]
    config: PathBuf,

    #[arg(long, env = "TFA_LOG", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the schema on every shard and print the topology.
    Init,
    Topology(TopologyArgs),
    Route(RouteArgs),
    Record(RecordArgs),
    Ingest(IngestArgs),
    Query {
        #[command(subcommand)]
        command: Box<QueryCommand>,
    },
}

#[derive(Debug, Args)]
pub struct TopologyArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct RouteArgs {
    #[arg(long)]
    user_id: String,
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    entity_type: EntityTypeArg,
    #[arg(long)]
    entity_id: String,
    #[arg(long)]
    action: ActionArg,
    #[arg(long, default_value = "{}")]
    metadata: String,
    #[arg(long)]
    created_at: Option<String>,
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[arg(long)]
    file: PathBuf,
    /// Exit non-zero when any line fails to decode or record.
    #[arg(long)]
    strict: bool,
}

#[derive(Debug, Subcommand)]
pub enum QueryCommand {
    User(QueryUserArgs),
    Entity(QueryEntityArgs),
    All(QueryAllArgs),
}

#[derive(Debug, Args)]
pub struct QueryUserArgs {
    #[arg(long)]
    user_id: String,
    #[command(flatten)]
    filter: FilterArgs,
}

#[derive(Debug, Args)]
pub struct QueryEntityArgs {
    #[arg(long)]
    entity_type: EntityTypeArg,
    #[arg(long)]
    entity_id: String,
    #[command(flatten)]
    filter: FilterArgs,
}

#[derive(Debug, Args)]
pub struct QueryAllArgs {
    #[command(flatten)]
    filter: FilterArgs,
}

#[derive(Debug, Args)]
pub struct FilterArgs {
    /// RFC3339 timestamp or Unix seconds.
    #[arg(long)]
    from: Option<String>,
    /// RFC3339 timestamp or Unix seconds.
    #[arg(long)]
    to: Option<String>,
    /// Page size; 0 returns every matching row.
    #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
    limit: usize,
    #[arg(long, default_value_t = 0)]
    offset: usize,
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EntityTypeArg {
    User,
    Team,
    Task,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ActionArg {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Serialize)]
pub struct ActivityPageJson {
    pub contract_version: String,
    pub total: u64,
    pub limit: Option<usize>,
    pub offset: usize,
    pub activities: Vec<Activity>,
}

#[derive(Debug, Serialize)]
pub struct RouteJson {
    pub contract_version: String,
    pub user_id: String,
    pub bucket: usize,
    pub shard: usize,
}

#[derive(Debug, Serialize)]
pub struct IngestFailure {
    pub line: usize,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct IngestReport {
    pub contract_version: String,
    pub recorded: usize,
    pub failed: usize,
    pub failures: Vec<IngestFailure>,
}

/// Installs the stderr `tracing` subscriber. Later calls are ignored.
pub fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when the config cannot be loaded, a shard cannot be
/// opened, or the requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = ShardingConfig::load(&cli.config)
        .with_context(|| format!("failed to load sharding config {}", cli.config.display()))?;

    match cli.command {
        Command::Route(args) => run_route(&config, &args),
        command => {
            let store = open_sharded_store(&config).context("failed to open activity shards")?;
            let result = run_with_store(command, &store);
            store.close();
            result
        }
    }
}

/// Executes a command against an already opened store.
///
/// # Errors
/// Returns an error when argument validation or the store operation fails.
pub fn run_with_store(command: Command, store: &ShardedActivityStore) -> Result<()> {
    match command {
        Command::Init => {
            let report = store.topology(&OpContext::background())?;
            info!(shards = report.shard_count, "initialized activity shards");
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Topology(args) => {
            let report = store.topology(&OpContext::background())?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_topology(&report);
            }
            Ok(())
        }
        Command::Route(args) => {
            let route = route_json(store.router(), &args.user_id);
            println!("{}", serde_json::to_string_pretty(&route)?);
            Ok(())
        }
        Command::Record(args) => run_record(args, store),
        Command::Ingest(args) => run_ingest(&args, store),
        Command::Query { command } => run_query(*command, store),
    }
}

fn run_route(config: &ShardingConfig, args: &RouteArgs) -> Result<()> {
    let router = BucketRouter::new(config.bucket_map()?);
    let route = route_json(&router, &args.user_id);
    println!("{}", serde_json::to_string_pretty(&route)?);
    Ok(())
}

fn route_json(router: &BucketRouter, user_id: &str) -> RouteJson {
    RouteJson {
        contract_version: SHARD_ROUTE_CONTRACT.to_string(),
        user_id: user_id.to_string(),
        bucket: router.bucket_for(user_id),
        shard: router.shard_for(user_id),
    }
}

fn run_record(args: RecordArgs, store: &ShardedActivityStore) -> Result<()> {
    let ctx = OpContext::background();
    let entity_type = map_entity_type(args.entity_type);
    let action = map_action(args.action);

    let activity = match args.created_at.as_deref() {
        Some(raw) => {
            let activity = Activity {
                id: Ulid::new().to_string(),
                user_id: args.user_id,
                entity_type,
                entity_id: args.entity_id,
                action,
                metadata: args.metadata,
                created_at: parse_timestamp(raw)?,
            };
            store.insert(&ctx, &activity)?;
            activity
        }
        None => Recorder::new(store).record_activity(
            &ctx,
            &args.user_id,
            entity_type,
            &args.entity_id,
            action,
            &args.metadata,
        )?,
    };

    println!("{}", serde_json::to_string_pretty(&activity)?);
    Ok(())
}

fn run_ingest(args: &IngestArgs, store: &ShardedActivityStore) -> Result<()> {
    let file = File::open(&args.file)
        .with_context(|| format!("failed to open event feed {}", args.file.display()))?;
    let recorder = Recorder::new(store);
    let ctx = OpContext::background();

    let mut report = IngestReport {
        contract_version: INGEST_REPORT_CONTRACT.to_string(),
        recorded: 0,
        failed: 0,
        failures: Vec::new(),
    };

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line_number = index + 1;
        let line = line.with_context(|| {
            format!("failed to read line {line_number} of {}", args.file.display())
        })?;
        if line.trim().is_empty() {
            continue;
        }

        let outcome = serde_json::from_str::<DomainEvent>(&line)
            .map_err(|err| anyhow!("invalid event: {err}"))
            .and_then(|event| recorder.record(&ctx, &event).map_err(anyhow::Error::from));

        match outcome {
            Ok(_) => report.recorded += 1,
            Err(err) => {
                warn!(line = line_number, error = %err, "failed to ingest event");
                report.failed += 1;
                report.failures.push(IngestFailure {
                    line: line_number,
                    error: err.to_string(),
                });
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    if args.strict && report.failed > 0 {
        return Err(anyhow!(
            "{} of {} events failed to ingest",
            report.failed,
            report.failed + report.recorded
        ));
    }
    Ok(())
}

fn run_query(command: QueryCommand, store: &ShardedActivityStore) -> Result<()> {
    let service = ActivityQueryService::new(store);
    let (filter, page) = match command {
        QueryCommand::User(args) => {
            let (ctx, query) = parse_filter(&args.filter)?;
            let page = service.user_activities(&ctx, &args.user_id, &query)?;
            (query, page)
        }
        QueryCommand::Entity(args) => {
            let (ctx, query) = parse_filter(&args.filter)?;
            let page = service.activities(
                &ctx,
                Some(map_entity_type(args.entity_type)),
                Some(&args.entity_id),
                &query,
            )?;
            (query, page)
        }
        QueryCommand::All(args) => {
            let (ctx, query) = parse_filter(&args.filter)?;
            let page = service.activities(&ctx, None, None, &query)?;
            (query, page)
        }
    };

    let payload = ActivityPageJson {
        contract_version: ACTIVITY_PAGE_CONTRACT.to_string(),
        total: page.total,
        limit: filter.limit,
        offset: filter.offset,
        activities: page.activities,
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn parse_filter(args: &FilterArgs) -> Result<(OpContext, ActivityQuery)> {
    let query = ActivityQuery {
        from: args.from.as_deref().map(parse_timestamp).transpose()?,
        to: args.to.as_deref().map(parse_timestamp).transpose()?,
        limit: Some(args.limit),
        offset: args.offset,
    };
    let ctx = match args.timeout_ms {
        Some(timeout_ms) => OpContext::with_timeout(Duration::from_millis(timeout_ms)),
        None => OpContext::background(),
    };
    Ok((ctx, query))
}

/// Accepts RFC3339 or whole Unix seconds.
fn parse_timestamp(raw: &str) -> Result<OffsetDateTime> {
    let trimmed = raw.trim();
    if let Ok(seconds) = trimmed.parse::<i64>() {
        return OffsetDateTime::from_unix_timestamp(seconds)
            .map_err(|err| anyhow!("invalid unix timestamp {trimmed}: {err}"));
    }
    parse_rfc3339_utc(trimmed).with_context(|| format!("invalid timestamp {trimmed}"))
}

fn map_entity_type(value: EntityTypeArg) -> EntityType {
    match value {
        EntityTypeArg::User => EntityType::User,
        EntityTypeArg::Team => EntityType::Team,
        EntityTypeArg::Task => EntityType::Task,
    }
}

fn map_action(value: ActionArg) -> Action {
    match value {
        ActionArg::Created => Action::Created,
        ActionArg::Updated => Action::Updated,
        ActionArg::Deleted => Action::Deleted,
    }
}

fn print_topology(report: &TopologyReport) {
    println!(
        "contract={} shards={} buckets={} entity_pagination={:?} total_rows={}",
        report.contract_version,
        report.shard_count,
        report.bucket_count,
        report.entity_pagination,
        report.total_rows
    );
    println!("{:<6} {:<20} {:>10}  buckets", "index", "name", "rows");
    println!("{}", "-".repeat(60));
    for shard in &report.shards {
        let buckets = shard
            .buckets
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:<6} {:<20} {:>10}  {}",
            shard.index, shard.name, shard.row_count, buckets
        );
    }
}
