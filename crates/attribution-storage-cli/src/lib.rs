//! Administration surface for an attribution storage directory.
//!
//! [`run_cli`] executes a parsed [`Cli`]; every command prints pretty JSON on
//! stdout. The binary `ars` is a thin wrapper over it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use attribution_storage_core::timestamps::{
    format_rfc3339, max_time, min_time, now_utc, parse_rfc3339_utc,
};
use attribution_storage_core::{
    AggregatableDedupKey, AggregatableTriggerData, AggregationKey, AttributionStorage,
    AttributionTrigger, ConfigurableStorageDelegate, DataKey, DefaultStorageDelegate,
    DelegateConfig, EventReportWindows, EventTriggerData, FilterData, FilterPair, FilterValues,
    ReportId, SchemefulSite, SourceId, SourceRegistration, SourceType, StorableSource,
    StorageConfig, StorageDelegate, StorageKey, SuitableOrigin, SystemClock, TriggerVerification,
};
use attribution_storage_sqlite::{AttributionStorageSql, DbStatus};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{debug, LevelFilter};
use serde_json::json;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "ars")]
#[command(about = "Attribution reporting storage administration CLI")]
pub struct Cli {
    /// Directory holding the attribution database.
    #[arg(long, default_value = "./attribution_storage")]
    dir: PathBuf,

    /// JSON file with a storage config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON file with delegate policy values.
    #[arg(long)]
    delegate_config: Option<PathBuf>,

    /// Use the deterministic delegate: no noise, no delays, fixed report ids.
    #[arg(long)]
    deterministic: bool,

    #[arg(long, value_enum)]
    log_level: Option<LogLevelArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Source {
        #[command(subcommand)]
        command: SourceCommand,
    },
    /// Registers a trigger and attributes it to the best matching source.
    Trigger(Box<TriggerArgs>),
    Report {
        #[command(subcommand)]
        command: ReportCommand,
    },
    /// Deletes data registered or triggered within a time range.
    Clear(ClearArgs),
    Keys {
        #[command(subcommand)]
        command: KeysCommand,
    },
    Stats,
}

#[derive(Debug, Subcommand)]
pub enum SourceCommand {
    Store(Box<SourceStoreArgs>),
    List,
    Deactivate(SourceIdArgs),
}

#[derive(Debug, Args)]
pub struct SourceStoreArgs {
    #[arg(long)]
    source_origin: SuitableOrigin,
    #[arg(long)]
    reporting_origin: SuitableOrigin,
    #[arg(long = "destination", required = true)]
    destinations: Vec<SchemefulSite>,
    #[arg(long, value_enum, default_value_t = SourceTypeArg::Navigation)]
    source_type: SourceTypeArg,
    #[arg(long, default_value_t = 0)]
    source_event_id: u64,
    #[arg(long, default_value_t = 2_592_000)]
    expiry_secs: i64,
    /// Start of the first event report window, in seconds after registration.
    #[arg(long, default_value_t = 0)]
    event_report_window_start_secs: i64,
    /// End of an event report window, in seconds after registration.
    #[arg(long = "event-report-window-end-secs")]
    event_report_window_end_secs: Vec<i64>,
    #[arg(long)]
    aggregatable_report_window_secs: Option<i64>,
    #[arg(long)]
    max_event_level_reports: Option<u32>,
    #[arg(long, default_value_t = 0)]
    priority: i64,
    #[arg(long)]
    debug_key: Option<u64>,
    /// Filter data as a JSON object of string lists.
    #[arg(long, default_value = "{}")]
    filter_data: String,
    /// Aggregation key as `ID=HEX`.
    #[arg(long = "aggregation-key", value_parser = parse_aggregation_key)]
    aggregation_keys: Vec<(String, AggregationKey)>,
    #[arg(long)]
    debug_reporting: bool,
}

#[derive(Debug, Args)]
pub struct SourceIdArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
pub struct TriggerArgs {
    #[arg(long)]
    reporting_origin: SuitableOrigin,
    #[arg(long)]
    destination_origin: SuitableOrigin,
    /// Event-level trigger data; omit for an aggregatable-only trigger.
    #[arg(long)]
    trigger_data: Option<u64>,
    #[arg(long, default_value_t = 0)]
    priority: i64,
    #[arg(long)]
    dedup_key: Option<u64>,
    #[arg(long)]
    debug_key: Option<u64>,
    /// Positive top-level filters as a JSON object of string lists.
    #[arg(long)]
    filters: Option<String>,
    /// Negative top-level filters as a JSON object of string lists.
    #[arg(long)]
    not_filters: Option<String>,
    /// Aggregatable value as `ID=VALUE`.
    #[arg(long = "aggregatable-value", value_parser = parse_aggregatable_value)]
    aggregatable_values: Vec<(String, u32)>,
    /// Key piece OR-ed into every source key that has a value.
    #[arg(long, value_parser = parse_key_hex)]
    key_piece: Option<AggregationKey>,
    #[arg(long)]
    aggregatable_dedup_key: Option<u64>,
    #[arg(long)]
    aggregation_coordinator_origin: Option<SuitableOrigin>,
    /// Verification as `TOKEN=UUID`.
    #[arg(long = "verification", value_parser = parse_verification)]
    verifications: Vec<TriggerVerification>,
}

#[derive(Debug, Subcommand)]
pub enum ReportCommand {
    List(ReportListArgs),
    Delete(ReportIdArgs),
    NextTime(NextTimeArgs),
}

#[derive(Debug, Args)]
pub struct ReportListArgs {
    /// Latest report time to include (RFC3339); defaults to every report.
    #[arg(long)]
    max_report_time: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ReportIdArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
pub struct NextTimeArgs {
    /// Defaults to now.
    #[arg(long)]
    after: Option<String>,
}

#[derive(Debug, Args)]
pub struct ClearArgs {
    #[arg(long)]
    begin: Option<String>,
    #[arg(long)]
    end: Option<String>,
    /// Restrict deletion to these reporting origins.
    #[arg(long = "origin")]
    origins: Vec<SuitableOrigin>,
    #[arg(long)]
    keep_rate_limits: bool,
}

#[derive(Debug, Subcommand)]
pub enum KeysCommand {
    List,
    Delete(KeyDeleteArgs),
}

#[derive(Debug, Args)]
pub struct KeyDeleteArgs {
    #[arg(long)]
    reporting_origin: SuitableOrigin,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SourceTypeArg {
    Navigation,
    Event,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Initialises logging and executes the parsed command graph.
///
/// # Errors
/// Returns an error when config files cannot be loaded, arguments are invalid
/// or the storage directory cannot be used.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_logging(cli.log_level);
    let mut storage = open_storage(&cli)?;
    run_command(cli.command, &mut storage)
}

fn init_logging(level: Option<LogLevelArg>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if let Some(level) = level {
        builder.filter_level(match level {
            LogLevelArg::Error => LevelFilter::Error,
            LogLevelArg::Warn => LevelFilter::Warn,
            LogLevelArg::Info => LevelFilter::Info,
            LogLevelArg::Debug => LevelFilter::Debug,
            LogLevelArg::Trace => LevelFilter::Trace,
        });
    }
    // A logger installed by an embedding host wins.
    let _ = builder.try_init();
}

fn open_storage(cli: &Cli) -> Result<AttributionStorageSql> {
    let config = match &cli.config {
        Some(path) => StorageConfig::from_json(&read_json(path)?)
            .with_context(|| format!("invalid storage config in {}", path.display()))?,
        None => StorageConfig::default(),
    };
    let delegate_config = match &cli.delegate_config {
        Some(path) => DelegateConfig::from_json(&read_json(path)?)
            .with_context(|| format!("invalid delegate config in {}", path.display()))?,
        None => DelegateConfig::default(),
    };

    let delegate: Arc<dyn StorageDelegate> = if cli.deterministic {
        Arc::new(ConfigurableStorageDelegate::from_config(&delegate_config))
    } else {
        Arc::new(DefaultStorageDelegate::new(delegate_config))
    };
    debug!(
        "event=storage_opening dir={} deterministic={}",
        cli.dir.display(),
        cli.deterministic
    );
    AttributionStorageSql::new(&cli.dir, config, delegate, Arc::new(SystemClock))
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed parsing {}", path.display()))
}

/// Executes a parsed command against an existing storage handle.
///
/// # Errors
/// Returns an error when arguments are invalid or output cannot be encoded.
pub fn run_command(command: Command, storage: &mut AttributionStorageSql) -> Result<()> {
    match command {
        Command::Source { command } => run_source(command, storage),
        Command::Trigger(args) => {
            let trigger = build_trigger(*args)?;
            let result = storage.maybe_create_and_store_report(&trigger);
            print_json(&result)
        }
        Command::Report { command } => run_report(command, storage),
        Command::Clear(args) => {
            let begin = parse_optional_time(args.begin.as_deref(), min_time())?;
            let end = parse_optional_time(args.end.as_deref(), max_time())?;
            if begin > end {
                return Err(anyhow!("--begin must not be after --end"));
            }
            let origins = args.origins;
            let matches_origin = |key: &StorageKey| origins.contains(key.origin());
            let filter: Option<&dyn Fn(&StorageKey) -> bool> = if origins.is_empty() {
                None
            } else {
                Some(&matches_origin)
            };
            storage.clear_data(begin, end, filter, !args.keep_rate_limits);
            print_json(&storage.stats().last_clear)
        }
        Command::Keys { command } => match command {
            KeysCommand::List => {
                let keys: Vec<String> = storage
                    .get_all_data_keys()
                    .into_iter()
                    .map(|key| key.reporting_origin.to_string())
                    .collect();
                print_json(&keys)
            }
            KeysCommand::Delete(args) => {
                storage.delete_by_data_key(&DataKey::new(args.reporting_origin));
                print_json(&storage.stats().last_clear)
            }
        },
        Command::Stats => {
            let active_sources = storage.get_active_sources().len();
            let data_keys = storage.get_all_data_keys().len();
            let payload = json!({
                "path": storage.path().display().to_string(),
                "db_status": storage.db_status().map(db_status_name),
                "init_status": storage.stats().init_status.map(|status| status.as_str()),
                "active_sources": active_sources,
                "data_keys": data_keys,
            });
            print_json(&payload)
        }
    }
}

fn run_source(command: SourceCommand, storage: &mut AttributionStorageSql) -> Result<()> {
    match command {
        SourceCommand::Store(args) => {
            let source = build_source(*args)?;
            let result = storage.store_source(&source);
            print_json(&result)
        }
        SourceCommand::List => print_json(&storage.get_active_sources()),
        SourceCommand::Deactivate(args) => {
            let deactivated = storage.deactivate_source(SourceId(args.id));
            print_json(&json!({ "source_id": args.id, "deactivated": deactivated }))
        }
    }
}

fn run_report(command: ReportCommand, storage: &mut AttributionStorageSql) -> Result<()> {
    match command {
        ReportCommand::List(args) => {
            let max_report_time = parse_optional_time(args.max_report_time.as_deref(), max_time())?;
            print_json(&storage.get_attribution_reports(max_report_time, args.limit))
        }
        ReportCommand::Delete(args) => {
            let deleted = storage.delete_report(ReportId(args.id));
            print_json(&json!({ "report_id": args.id, "deleted": deleted }))
        }
        ReportCommand::NextTime(args) => {
            let after = parse_optional_time(args.after.as_deref(), now_utc())?;
            let next = storage
                .get_next_report_time(after)
                .map(format_rfc3339)
                .transpose()?;
            print_json(&json!({ "next_report_time": next }))
        }
    }
}

fn build_source(args: SourceStoreArgs) -> Result<StorableSource> {
    let mut destinations = args.destinations.into_iter();
    let first = destinations
        .next()
        .ok_or_else(|| anyhow!("at least one --destination is required"))?;
    let mut registration = SourceRegistration::new(first);
    registration.destinations.extend(destinations);
    registration.source_event_id = args.source_event_id;
    registration.expiry = Duration::seconds(args.expiry_secs);
    if !args.event_report_window_end_secs.is_empty() {
        registration.event_report_windows = Some(EventReportWindows {
            start_time: Duration::seconds(args.event_report_window_start_secs),
            end_times: args
                .event_report_window_end_secs
                .iter()
                .map(|secs| Duration::seconds(*secs))
                .collect(),
        });
    }
    registration.aggregatable_report_window =
        args.aggregatable_report_window_secs.map(Duration::seconds);
    registration.max_event_level_reports = args.max_event_level_reports;
    registration.priority = args.priority;
    registration.debug_key = args.debug_key;
    registration.filter_data = FilterData::new(parse_filter_values(&args.filter_data)?)?;
    registration.aggregation_keys = args.aggregation_keys.into_iter().collect();
    registration.debug_reporting = args.debug_reporting;

    Ok(StorableSource {
        source_origin: args.source_origin,
        reporting_origin: args.reporting_origin,
        source_type: match args.source_type {
            SourceTypeArg::Navigation => SourceType::Navigation,
            SourceTypeArg::Event => SourceType::Event,
        },
        registration,
        is_within_fenced_frame: false,
    })
}

fn build_trigger(args: TriggerArgs) -> Result<AttributionTrigger> {
    let mut trigger = AttributionTrigger::new(args.reporting_origin, args.destination_origin);
    let registration = &mut trigger.registration;

    registration.filters = FilterPair {
        positive: args
            .filters
            .as_deref()
            .map(parse_filter_values)
            .transpose()?
            .unwrap_or_default(),
        negative: args
            .not_filters
            .as_deref()
            .map(parse_filter_values)
            .transpose()?
            .unwrap_or_default(),
    };
    registration.debug_key = args.debug_key;
    if let Some(data) = args.trigger_data {
        let mut event_trigger = EventTriggerData::new(data);
        event_trigger.priority = args.priority;
        event_trigger.dedup_key = args.dedup_key;
        registration.event_triggers.push(event_trigger);
    }

    registration.aggregatable_values = args.aggregatable_values.into_iter().collect();
    if let Some(key_piece) = args.key_piece {
        registration
            .aggregatable_trigger_data
            .push(AggregatableTriggerData {
                key_piece,
                source_keys: registration.aggregatable_values.keys().cloned().collect(),
                filters: FilterPair::default(),
            });
    }
    if args.aggregatable_dedup_key.is_some() {
        registration.aggregatable_dedup_keys.push(AggregatableDedupKey {
            dedup_key: args.aggregatable_dedup_key,
            filters: FilterPair::default(),
        });
    }
    registration.aggregation_coordinator_origin = args.aggregation_coordinator_origin;
    trigger.verifications = args.verifications;
    Ok(trigger)
}

fn parse_filter_values(raw: &str) -> Result<FilterValues> {
    serde_json::from_str(raw).with_context(|| format!("invalid filter JSON: {raw}"))
}

fn parse_optional_time(raw: Option<&str>, default: OffsetDateTime) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => Ok(parse_rfc3339_utc(value)?),
        None => Ok(default),
    }
}

fn split_pair(raw: &str) -> Result<(&str, &str), String> {
    raw.split_once('=')
        .filter(|(left, right)| !left.is_empty() && !right.is_empty())
        .ok_or_else(|| format!("expected NAME=VALUE, got {raw:?}"))
}

fn parse_key_hex(raw: &str) -> Result<AggregationKey, String> {
    let digits = raw.trim_start_matches("0x").trim_start_matches("0X");
    u128::from_str_radix(digits, 16)
        .map(AggregationKey::from_u128)
        .map_err(|err| format!("invalid 128-bit hex key {raw:?}: {err}"))
}

fn parse_aggregation_key(raw: &str) -> Result<(String, AggregationKey), String> {
    let (id, key) = split_pair(raw)?;
    Ok((id.to_string(), parse_key_hex(key)?))
}

fn parse_aggregatable_value(raw: &str) -> Result<(String, u32), String> {
    let (id, value) = split_pair(raw)?;
    let value = value
        .parse::<u32>()
        .map_err(|err| format!("invalid aggregatable value {value:?}: {err}"))?;
    Ok((id.to_string(), value))
}

fn parse_verification(raw: &str) -> Result<TriggerVerification, String> {
    let (token, id) = split_pair(raw)?;
    let aggregatable_report_id =
        Uuid::parse_str(id).map_err(|err| format!("invalid report id {id:?}: {err}"))?;
    Ok(TriggerVerification {
        token: token.to_string(),
        aggregatable_report_id,
    })
}

fn db_status_name(status: DbStatus) -> &'static str {
    match status {
        DbStatus::DeferringCreation => "deferring_creation",
        DbStatus::Open => "open",
        DbStatus::ClosedDueToCatastrophicError => "closed_due_to_catastrophic_error",
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn aggregation_key_accepts_prefixed_hex() {
        let (id, key) = must(parse_aggregation_key("campaign=0x159"));
        assert_eq!(id, "campaign");
        assert_eq!(key, AggregationKey::new(0, 0x159));
    }

    #[test]
    fn pairs_without_value_are_rejected() {
        assert!(parse_aggregatable_value("key=").is_err());
        assert!(parse_aggregatable_value("=3").is_err());
        assert!(parse_verification("token=not-a-uuid").is_err());
    }

    #[test]
    fn aggregatable_only_trigger_has_no_event_configuration() {
        let cli = must(Cli::try_parse_from([
            "ars",
            "trigger",
            "--reporting-origin",
            "https://report.test",
            "--destination-origin",
            "https://conversion.test",
            "--aggregatable-value",
            "key=5",
            "--key-piece",
            "0x400",
        ]));
        let Command::Trigger(args) = cli.command else {
            panic!("expected trigger command");
        };
        let trigger = must(build_trigger(*args));
        assert!(trigger.registration.event_triggers.is_empty());
        assert!(trigger.registration.is_aggregatable());
        assert_eq!(
            trigger.registration.aggregatable_trigger_data[0]
                .source_keys
                .iter()
                .collect::<Vec<_>>(),
            vec!["key"]
        );
    }

    #[test]
    fn source_store_builds_all_destinations() {
        let cli = must(Cli::try_parse_from([
            "ars",
            "source",
            "store",
            "--source-origin",
            "https://impression.test",
            "--reporting-origin",
            "https://report.test",
            "--destination",
            "https://a.test",
            "--destination",
            "https://b.test",
            "--filter-data",
            r#"{"campaign":["12"]}"#,
        ]));
        let Command::Source {
            command: SourceCommand::Store(args),
        } = cli.command
        else {
            panic!("expected source store command");
        };
        let source = must(build_source(*args));
        assert_eq!(source.registration.destinations.len(), 2);
        assert!(!source.registration.filter_data.is_empty());
        assert!(source.validate().is_ok());
    }
}
