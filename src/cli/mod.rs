//! Command-line interface for scanpipe.
//!
//! Provides commands for ingesting calls, driving and inspecting record
//! state, reclaiming stuck work, partition and retention upkeep, the
//! geocode cache, and running the maintenance scheduler.

use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::adapters::NominatimGeocoder;
use crate::config;
use crate::core::{
    BiasContext, CacheLookup, CachedGeocoder, GeocodeCache, LocationExtractor,
    MaintenanceScheduler, Monitor, PartitionManager, Reclaimer, RecordStore, RetentionEngine,
    SchedulerSettings, StateMachine, DEFAULT_CONTEXT_WINDOW,
};
use crate::domain::{NewRecord, PeriodKind, RetentionPolicy, Status};
use crate::store::schema::partitioned_table;
use crate::store::{Database, PARTITIONED_TABLES};

/// scanpipe - Partitioned call store and processing pipeline for scanner audio
#[derive(Parser, Debug)]
#[command(name = "scanpipe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Database file (overrides the config file)
    #[arg(long, global = true, env = "SCANPIPE_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the database, seed retention policies and current partitions
    Init,

    /// Ingest feed calls from a JSON file (reads stdin if not provided)
    Ingest {
        /// JSON file holding one call object or an array of calls
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Playlist the calls came from
        #[arg(short, long)]
        playlist: Option<String>,
    },

    /// Move a record to a new status
    Advance {
        call_uid: String,

        /// Target status (queued, downloaded, transcribed, indexed, error)
        status: Status,

        /// Error message (for the error status)
        #[arg(short, long)]
        error: Option<String>,

        /// Only apply if the record is currently in this status
        #[arg(long)]
        expected: Option<Status>,
    },

    /// Show a record's processing state
    State {
        call_uid: String,

        /// Include the transition history
        #[arg(long)]
        history: bool,
    },

    /// List stalled and exhausted records
    Stuck {
        /// In-flight records idle this long count as stuck
        #[arg(long)]
        hours: Option<u32>,

        #[arg(long)]
        json: bool,
    },

    /// Give exhausted records one more attempt after a cooldown
    Resurrect {
        /// Only records failed at least this many days ago
        #[arg(long)]
        days: Option<u32>,
    },

    /// Requeue failed records whose backoff has elapsed
    Requeue,

    /// Release downloads that have been claimed for too long
    Recover {
        #[arg(long)]
        minutes: Option<u32>,
    },

    /// Apply all enabled retention policies
    Cleanup {
        #[arg(long)]
        json: bool,
    },

    /// List retention policies
    Policies,

    /// Create or change one retention policy
    Policy {
        table: String,

        #[arg(long)]
        days: Option<u32>,

        /// Timestamp column the policy applies to
        #[arg(long)]
        column: Option<String>,

        #[arg(long, conflicts_with = "disable")]
        enable: bool,

        #[arg(long)]
        disable: bool,
    },

    /// Manage table partitions
    Partitions {
        #[command(subcommand)]
        command: PartitionCommands,
    },

    /// Geocode cache operations
    Geocode {
        #[command(subcommand)]
        command: GeocodeCommands,
    },

    /// Show pipeline statistics
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Run the maintenance scheduler until Ctrl-C
    Run,

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum PartitionCommands {
    /// Ensure the partition(s) covering an instant or a range exist
    Ensure {
        table: String,

        /// RFC 3339 instant (defaults to now)
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        /// End of an inclusive range starting at --at
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },

    /// Create current and look-ahead partitions for every table
    Maintain,

    /// List a table's partitions
    List { table: String },
}

#[derive(Subcommand, Debug)]
pub enum GeocodeCommands {
    /// Look a query up in the cache only
    Lookup {
        query: String,

        #[arg(long)]
        city: Option<String>,

        #[arg(long)]
        state: Option<String>,
    },

    /// Resolve a query through the cache and Nominatim
    Resolve {
        query: String,

        #[arg(long)]
        city: Option<String>,

        #[arg(long)]
        state: Option<String>,
    },

    /// Find place mentions in transcript text (reads stdin if not provided)
    Extract {
        text: Option<String>,

        /// Also resolve each mention through the cache and Nominatim
        #[arg(long)]
        resolve: bool,

        #[arg(long)]
        city: Option<String>,

        #[arg(long)]
        state: Option<String>,

        /// Characters of context shown around each mention
        #[arg(long, default_value_t = DEFAULT_CONTEXT_WINDOW)]
        window: usize,
    },

    /// Cache entry and hit counts
    Stats,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::config()?;
        if let Commands::Config = self.command {
            return show_config(self.db);
        }
        let db = open_database(self.db)?;

        match self.command {
            Commands::Init => blocking(move || init(&db)).await,
            Commands::Ingest { input, playlist } => {
                let payload = read_input(input)?;
                let max_retries = cfg.pipeline.max_retries;
                blocking(move || ingest(&db, &payload, playlist.as_deref(), max_retries)).await
            }
            Commands::Advance {
                call_uid,
                status,
                error,
                expected,
            } => blocking(move || advance(&db, &call_uid, status, error.as_deref(), expected)).await,
            Commands::State { call_uid, history } => {
                blocking(move || show_state(&db, &call_uid, history)).await
            }
            Commands::Stuck { hours, json } => {
                let hours = hours.unwrap_or(cfg.reclaimer.stuck_after_hours);
                blocking(move || list_stuck(&db, hours, json)).await
            }
            Commands::Resurrect { days } => {
                let days = days.unwrap_or(cfg.reclaimer.resurrect_after_days);
                blocking(move || {
                    let applied = Reclaimer::new(db).resurrect(days)?;
                    println!("Resurrected {} record(s)", applied.len());
                    for t in applied {
                        println!("  {} (retry {})", t.call_uid, t.retry_count);
                    }
                    Ok(())
                })
                .await
            }
            Commands::Requeue => {
                let backoff = cfg.backoff;
                blocking(move || {
                    let applied = Reclaimer::new(db).requeue_due(&backoff)?;
                    println!("Requeued {} record(s)", applied.len());
                    Ok(())
                })
                .await
            }
            Commands::Recover { minutes } => {
                let timeout = match minutes {
                    Some(m) => chrono::Duration::minutes(i64::from(m)),
                    None => cfg.reclaimer.stalled_timeout(),
                };
                blocking(move || {
                    let released = Reclaimer::new(db).recover_stalled(timeout)?;
                    println!("Released {} stalled download(s)", released.len());
                    for uid in released {
                        println!("  {}", uid);
                    }
                    Ok(())
                })
                .await
            }
            Commands::Cleanup { json } => blocking(move || cleanup(&db, json)).await,
            Commands::Policies => blocking(move || list_policies(&db)).await,
            Commands::Policy {
                table,
                days,
                column,
                enable,
                disable,
            } => {
                let enabled = match (enable, disable) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                };
                blocking(move || set_policy(&db, &table, days, column, enabled)).await
            }
            Commands::Partitions { command } => blocking(move || partitions(&db, command)).await,
            Commands::Geocode { command } => geocode(db, command).await,
            Commands::Stats { json } => {
                let hours = cfg.reclaimer.stuck_after_hours;
                blocking(move || show_stats(&db, hours, json)).await
            }
            Commands::Run => {
                let scheduler = MaintenanceScheduler::new(db, SchedulerSettings::from(cfg));
                scheduler.run_until_ctrl_c().await
            }
            // Printed before the database is opened
            Commands::Config => Ok(()),
        }
    }
}

/// Run synchronous database work on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Command task panicked")?
}

fn open_database(override_path: Option<PathBuf>) -> Result<Database> {
    let cfg = config::config()?;
    let path = override_path.unwrap_or_else(|| cfg.database_path.clone());

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    Database::open_with_timeout(&path, cfg.database.busy_timeout())
        .with_context(|| format!("Failed to open database: {}", path.display()))
}

fn read_input(input: Option<PathBuf>) -> Result<String> {
    let content = if let Some(path) = input {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?
    } else {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    };

    if content.trim().is_empty() {
        anyhow::bail!("No input provided. Use --input <file> or pipe to stdin");
    }
    Ok(content)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init(db: &Database) -> Result<()> {
    let cfg = config::config()?;
    MaintenanceScheduler::new(db.clone(), SchedulerSettings::from(cfg)).prepare()?;

    println!("Database ready: {}", db.path().map(|p| p.display().to_string()).unwrap_or_default());
    let partitions = PartitionManager::new(db.clone());
    for table in PARTITIONED_TABLES {
        println!("  {}: {} partition(s)", table.name, partitions.list_partitions(table.name)?.len());
    }
    Ok(())
}

fn ingest(db: &Database, payload: &str, playlist: Option<&str>, max_retries: u32) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(payload).context("Input is not valid JSON")?;
    let calls = match value {
        serde_json::Value::Array(calls) => calls,
        single => vec![single],
    };

    let store = RecordStore::with_max_retries(db.clone(), max_retries);
    let (mut inserted, mut duplicates, mut rejected) = (0usize, 0usize, 0usize);

    for call in &calls {
        let record = match NewRecord::from_feed_call(playlist, call) {
            Ok(record) => record,
            Err(e) => {
                eprintln!("Skipping call: {}", e);
                rejected += 1;
                continue;
            }
        };
        if store.insert_record(&record)?.is_new() {
            inserted += 1;
        } else {
            duplicates += 1;
        }
    }

    println!(
        "Ingested {} call(s): {} new, {} duplicate, {} rejected",
        calls.len(),
        inserted,
        duplicates,
        rejected
    );
    Ok(())
}

fn advance(
    db: &Database,
    call_uid: &str,
    to: Status,
    error: Option<&str>,
    expected: Option<Status>,
) -> Result<()> {
    let machine = StateMachine::new(db.clone());
    let applied = match expected {
        Some(expected) => machine.advance_from(call_uid, expected, to, error)?,
        None => machine.advance(call_uid, to, error)?,
    };

    println!(
        "{}: {} -> {} (retry {})",
        applied.call_uid, applied.transition.from, applied.transition.to, applied.retry_count
    );
    Ok(())
}

fn show_state(db: &Database, call_uid: &str, history: bool) -> Result<()> {
    let machine = StateMachine::new(db.clone());
    let state = machine
        .get(call_uid)?
        .with_context(|| format!("No processing state for record {}", call_uid))?;

    println!("Record:  {}", state.call_uid);
    println!("Status:  {}", state.status);
    println!("Retries: {}/{}", state.retry_count, state.max_retries);
    if let Some(error) = &state.last_error {
        println!("Error:   {}", error);
    }
    println!("Created: {}", state.created_at);
    println!("Updated: {}", state.updated_at);

    if let Some(record) = RecordStore::new(db.clone()).get_record(call_uid)? {
        println!("Stage:   {}", record.processing_stage);
        println!("URL:     {}", record.url);
    }

    if history {
        println!("\nTransitions:");
        for t in machine.history(call_uid)? {
            let error = t.error.map(|e| format!(" ({})", e)).unwrap_or_default();
            println!("  {} {} -> {} retry {}{}", t.at, t.from, t.to, t.retry_count, error);
        }
    }
    Ok(())
}

fn list_stuck(db: &Database, hours: u32, json: bool) -> Result<()> {
    let stuck = Reclaimer::new(db.clone()).find_stuck(hours)?;
    if json {
        return print_json(&stuck);
    }

    if stuck.is_empty() {
        println!("No stuck records");
        return Ok(());
    }

    println!("{:<32} {:<12} {:<10} {:>8} {:>8}", "RECORD", "STATUS", "REASON", "RETRIES", "AGE (h)");
    println!("{}", "-".repeat(74));
    for item in stuck {
        println!(
            "{:<32} {:<12} {:<10} {:>8} {:>8}",
            item.state.call_uid,
            item.state.status,
            format!("{:?}", item.reason).to_lowercase(),
            format!("{}/{}", item.state.retry_count, item.state.max_retries),
            item.age().num_hours()
        );
    }
    Ok(())
}

fn cleanup(db: &Database, json: bool) -> Result<()> {
    let report = RetentionEngine::new(db.clone()).cleanup()?;
    if json {
        return print_json(&report);
    }

    for outcome in &report.outcomes {
        match &outcome.error {
            None => println!(
                "{:<20} {:>8} row(s) deleted, {} partition(s) dropped ({} ms)",
                outcome.table_name,
                outcome.rows_deleted,
                outcome.partitions_dropped.len(),
                outcome.duration_ms
            ),
            Some(error) => println!("{:<20} FAILED: {}", outcome.table_name, error),
        }
    }
    println!("Total rows deleted: {}", report.total_rows_deleted());

    if report.failures().next().is_some() {
        anyhow::bail!("One or more retention policies failed");
    }
    Ok(())
}

fn list_policies(db: &Database) -> Result<()> {
    let policies = RetentionEngine::new(db.clone()).policies()?;
    if policies.is_empty() {
        println!("No retention policies (run `scanpipe init`)");
        return Ok(());
    }

    println!("{:<20} {:>6} {:<14} {:<8} {}", "TABLE", "DAYS", "COLUMN", "ENABLED", "LAST CLEANUP");
    println!("{}", "-".repeat(80));
    for p in policies {
        println!(
            "{:<20} {:>6} {:<14} {:<8} {}",
            p.table_name,
            p.retention_days,
            p.partition_column,
            p.enabled,
            p.last_cleanup_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string())
        );
    }
    Ok(())
}

fn set_policy(
    db: &Database,
    table: &str,
    days: Option<u32>,
    column: Option<String>,
    enabled: Option<bool>,
) -> Result<()> {
    let engine = RetentionEngine::new(db.clone());

    let mut policy = match engine.policy(table)? {
        Some(existing) => existing,
        None => {
            let days = days.context("--days is required for a new policy")?;
            let column = column.as_deref().context("--column is required for a new policy")?;
            RetentionPolicy::new(table, days, column)
        }
    };
    if let Some(days) = days {
        policy.retention_days = days;
    }
    if let Some(column) = column {
        policy.partition_column = column;
    }
    if let Some(enabled) = enabled {
        policy.enabled = enabled;
    }

    engine.upsert_policy(&policy)?;
    println!(
        "{}: keep {} day(s) on {} ({})",
        policy.table_name,
        policy.retention_days,
        policy.partition_column,
        if policy.enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

fn partitions(db: &Database, command: PartitionCommands) -> Result<()> {
    let manager = PartitionManager::new(db.clone());

    match command {
        PartitionCommands::Ensure { table, at, until } => {
            let catalog_entry = partitioned_table(&table)
                .with_context(|| format!("Table {} is not partitioned", table))?;
            let kind: PeriodKind = catalog_entry.period;
            let start = at.unwrap_or_else(Utc::now);

            let ensured = match until {
                Some(end) => manager.ensure_partitions_for_range(&table, start, end, kind)?,
                None => vec![manager.ensure_partition(&table, start, kind)?],
            };
            for p in ensured {
                println!("{:<28} {:?}", p.name, p.outcome);
            }
        }
        PartitionCommands::Maintain => {
            for report in manager.maintain_partitions()? {
                println!(
                    "{:<20} {} created, {} already present",
                    report.table,
                    report.created.len(),
                    report.already_existed
                );
            }
        }
        PartitionCommands::List { table } => {
            let list = manager.list_partitions(&table)?;
            if list.is_empty() {
                println!("No partitions for {}", table);
                return Ok(());
            }
            println!("{:<28} {:<8} {:<26} {}", "PARTITION", "PERIOD", "START", "END");
            println!("{}", "-".repeat(90));
            for p in list {
                println!(
                    "{:<28} {:<8} {:<26} {}",
                    p.name,
                    p.period,
                    p.bounds.start.to_rfc3339(),
                    p.bounds.end.to_rfc3339()
                );
            }
        }
    }
    Ok(())
}

async fn geocode(db: Database, command: GeocodeCommands) -> Result<()> {
    let cfg = config::config()?;
    let cache = GeocodeCache::with_ttl(db, cfg.geocode.ttl());

    match command {
        GeocodeCommands::Lookup { query, city, state } => {
            let bias = BiasContext::new(city.as_deref(), state.as_deref());
            let lookup = blocking(move || Ok(cache.lookup(&query, &bias)?)).await?;
            match lookup {
                CacheLookup::Hit(entry) => print_json(&entry)?,
                CacheLookup::Miss { key } => println!("Miss ({})", key),
            }
        }
        GeocodeCommands::Resolve { query, city, state } => {
            let bias = BiasContext::new(city.as_deref(), state.as_deref());
            let geocoder = NominatimGeocoder::new(cfg.geocode.nominatim())?;
            let resolved = CachedGeocoder::new(cache, geocoder)
                .resolve(&query, &bias)
                .await?;
            print_json(&resolved)?;
        }
        GeocodeCommands::Extract {
            text,
            resolve,
            city,
            state,
            window,
        } => {
            let text = match text {
                Some(text) => text,
                None => read_input(None)?,
            };
            let extractor =
                LocationExtractor::new().context("Failed to build location patterns")?;

            if resolve {
                let bias = BiasContext::new(city.as_deref(), state.as_deref());
                let geocoder = CachedGeocoder::new(
                    cache,
                    NominatimGeocoder::new(cfg.geocode.nominatim())?,
                );
                print_json(&extractor.geocode(&text, &bias, &geocoder).await)?;
            } else {
                let mentions = extractor.extract_with_context(&text, window);
                if mentions.is_empty() {
                    println!("No locations found");
                }
                for mention in mentions {
                    println!(
                        "{:<12} {:.2}  {}",
                        mention.location.kind.as_str(),
                        mention.location.confidence,
                        mention.location.raw_text
                    );
                    if !mention.context.is_empty() {
                        println!("             {}", mention.context);
                    }
                }
            }
        }
        GeocodeCommands::Stats => {
            let stats = blocking(move || Ok(cache.stats()?)).await?;
            print_json(&stats)?;
        }
    }
    Ok(())
}

fn show_stats(db: &Database, stuck_after_hours: u32, json: bool) -> Result<()> {
    let stats = Monitor::new(db.clone(), stuck_after_hours).collect()?;
    if json {
        return print_json(&stats);
    }

    println!("Records by status:");
    for (status, count) in &stats.status_counts {
        println!("  {:<12} {:>8}", status, count);
    }

    if let Some(item) = &stats.oldest_stuck {
        println!(
            "\nOldest stuck: {} ({}, {} h)",
            item.state.call_uid,
            item.state.status,
            item.age().num_hours()
        );
    }

    println!("\nPartitions:");
    for p in &stats.partitions {
        println!(
            "  {:<18} {:>3} partition(s), now {}, look-ahead {}",
            p.table,
            p.partition_count,
            if p.covers_now { "ok" } else { "MISSING" },
            if p.lookahead_ok { "ok" } else { "MISSING" }
        );
    }

    if !stats.error_patterns.is_empty() {
        println!("\nTop errors:");
        for pattern in &stats.error_patterns {
            println!("  {:>5}  {}", pattern.count, pattern.prefix);
        }
    }

    let cache = &stats.geocode_cache;
    println!(
        "\nGeocode cache: {} live, {} expired, {} hits",
        cache.live_entries, cache.expired_entries, cache.total_hits
    );
    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config(db_override: Option<PathBuf>) -> Result<()> {
    let cfg = config::config()?;

    println!("scanpipe configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!(
        "  Database: {}",
        db_override.unwrap_or_else(|| cfg.database_path.clone()).display()
    );
    println!();
    println!("Pipeline:");
    println!("  Max retries:      {}", cfg.pipeline.max_retries);
    println!("  Batch size:       {}", cfg.pipeline.batch_size);
    println!("  Backoff:          {}s doubling, cap {}s", cfg.backoff.base_seconds, cfg.backoff.cap_seconds);
    println!();
    println!("Reclaimer:");
    println!("  Stuck after:      {}h", cfg.reclaimer.stuck_after_hours);
    println!("  Resurrect after:  {}d", cfg.reclaimer.resurrect_after_days);
    println!("  Stalled download: {}m", cfg.reclaimer.stalled_download_minutes);
    println!("  Auto resurrect:   {}", cfg.reclaimer.auto_resurrect);
    println!();
    println!("Schedule (seconds):");
    println!("  Partitions: {}", cfg.schedule.partitions_secs);
    println!("  Reclaimer:  {}", cfg.schedule.reclaimer_secs);
    println!("  Retention:  {}", cfg.schedule.retention_secs);
    println!("  Stats:      {}", cfg.schedule.stats_secs);
    println!();
    println!("Retention defaults:");
    for (table, entry) in &cfg.retention {
        println!(
            "  {:<18} {:>4}d on {}{}",
            table,
            entry.days,
            entry.column,
            if entry.enabled { "" } else { " (disabled)" }
        );
    }
    println!();
    println!("Geocode:");
    println!("  TTL:        {}d", cfg.geocode.ttl_days);
    println!("  Nominatim:  {}", cfg.geocode.nominatim_url);
    println!("  Rate limit: {}/s", cfg.geocode.rate_limit_per_second);

    Ok(())
}
