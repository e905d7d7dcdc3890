//! Command surface for the WAL measurement harness.
//!
//! Every command runs against one explicitly opened session; there is no
//! process-global connection. `probe list` is the only command that works
//! without a reachable database.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use ulid::Ulid;
use walscope_core::{
    build_movement_chart, build_record_type_chart, experiment_name, format_rfc3339, now_utc,
    ExperimentResult, IndexTiming, IndexVariant, SchemaPlacement, WalDelta, WalProbe,
    SCHEMA_DEFAULT_ROW_COUNT,
};
use walscope_store_postgres::{
    ExtensionSupport, MeasureOptions, PostgresWalStore, SchemaScenarioReport,
};

const DEFAULT_ROW_COUNTS: [i64; 5] = [1_000, 2_000, 3_000, 5_000, 10_000];
const MOVEMENT_EXPORT_FILE: &str = "index_type_movement.json";
const RECORD_TYPES_EXPORT_FILE: &str = "wal_record_types.json";

#[derive(Debug, Parser)]
#[command(name = "walscope")]
#[command(about = "WAL movement measurement harness for Postgres")]
pub struct Cli {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Install the required extensions and create the result tables.
    Setup,
    /// Drop the result and probe tables.
    Teardown,
    /// Measure one ad hoc SQL batch.
    Measure(MeasureArgs),
    Probe {
        #[command(subcommand)]
        command: Box<ProbeCommand>,
    },
    Experiment {
        #[command(subcommand)]
        command: Box<ExperimentCommand>,
    },
    Export {
        #[command(subcommand)]
        command: Box<ExportCommand>,
    },
    /// List persisted experiment results.
    Results(ResultsArgs),
}

#[derive(Debug, Args)]
pub struct MeasureArgs {
    #[arg(long)]
    sql: String,
    #[arg(long)]
    flush: bool,
    #[arg(long)]
    rollback: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ProbeCommand {
    /// Run one named probe from the fixed catalog.
    Run(ProbeRunArgs),
    /// Show the probe catalog.
    List,
}

#[derive(Debug, Args)]
pub struct ProbeRunArgs {
    #[arg(long)]
    name: ProbeArg,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ExperimentCommand {
    /// Run a single index experiment and persist its result.
    Run(ExperimentRunArgs),
    /// Run the full index experiment matrix across row counts.
    Suite(SuiteArgs),
    /// Compare inline vs. separate embedding-table placement.
    Schema(SchemaArgs),
}

#[derive(Debug, Args)]
pub struct ExperimentRunArgs {
    #[arg(long)]
    variant: VariantArg,
    #[arg(long, default_value = "after-insert")]
    timing: TimingArg,
    #[arg(long, default_value_t = 1_000)]
    row_count: i64,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct SuiteArgs {
    #[arg(long = "row-count")]
    row_counts: Vec<i64>,
    /// Drop and recreate the result tables before running.
    #[arg(long)]
    reset: bool,
    /// Write both chart exports into this directory afterwards.
    #[arg(long)]
    export_dir: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct SchemaArgs {
    #[arg(long, default_value_t = SCHEMA_DEFAULT_ROW_COUNT)]
    row_count: i64,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ExportCommand {
    /// Total WAL movement by experiment name and row count.
    Movement(ExportArgs),
    /// Per-record-type byte totals grouped by experiment name.
    RecordTypes(ExportArgs),
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(long)]
    output: PathBuf,
}

#[derive(Debug, Args)]
pub struct ResultsArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ProbeArg {
    CreateTable,
    CreateTableTx,
    XactId,
    XactIdIfAssigned,
    AbortedCreate,
}

impl ProbeArg {
    fn probe(self) -> WalProbe {
        match self {
            Self::CreateTable => WalProbe::CreateTable,
            Self::CreateTableTx => WalProbe::CreateTableTx,
            Self::XactId => WalProbe::XactId,
            Self::XactIdIfAssigned => WalProbe::XactIdIfAssigned,
            Self::AbortedCreate => WalProbe::AbortedCreate,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum VariantArg {
    NoIndex,
    BtreeInt,
    HashInt,
    BtreeText,
    HashText,
    PgvectorHnsw,
    LanternHnsw,
}

impl VariantArg {
    fn variant(self) -> IndexVariant {
        match self {
            Self::NoIndex => IndexVariant::NoIndex,
            Self::BtreeInt => IndexVariant::BtreeInt,
            Self::HashInt => IndexVariant::HashInt,
            Self::BtreeText => IndexVariant::BtreeText,
            Self::HashText => IndexVariant::HashText,
            Self::PgvectorHnsw => IndexVariant::PgvectorHnsw,
            Self::LanternHnsw => IndexVariant::LanternHnsw,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TimingArg {
    BeforeInsert,
    AfterInsert,
}

impl TimingArg {
    fn timing(self) -> IndexTiming {
        match self {
            Self::BeforeInsert => IndexTiming::BeforeInsert,
            Self::AfterInsert => IndexTiming::AfterInsert,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MeasureReport {
    pub total_time_ms: i64,
    pub delta: WalDelta,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub probe: WalProbe,
    pub summary: &'static str,
    pub total_time_ms: i64,
    pub delta: WalDelta,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteExperimentSummary {
    pub name: String,
    pub num_rows: i64,
    pub total_wal_movement: i64,
    pub total_time_ms: i64,
    pub breakdown_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub run_id: String,
    pub started_at: String,
    pub row_counts: Vec<i64>,
    pub skipped: Vec<String>,
    pub experiments: Vec<SuiteExperimentSummary>,
}

/// Executes the parsed top-level command graph.
///
/// # Errors
/// Returns an error when the database is unreachable or the requested
/// command fails; workload errors propagate unmodified.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        // The catalog is static; listing it must not require a server.
        Command::Probe { command } => match *command {
            ProbeCommand::List => {
                print_probe_catalog();
                Ok(())
            }
            ProbeCommand::Run(args) => {
                let mut store = PostgresWalStore::connect(&cli.database_url)?;
                run_probe(&mut store, args)
            }
        },
        command => {
            let mut store = PostgresWalStore::connect(&cli.database_url)?;
            run_command(command, &mut store)
        }
    }
}

/// Executes a command against an existing session.
///
/// # Errors
/// Returns an error when the command fails.
pub fn run_command(command: Command, store: &mut PostgresWalStore) -> Result<()> {
    match command {
        Command::Setup => {
            let support = store.install_extensions()?;
            store.migrate()?;
            print_support(support);
            Ok(())
        }
        Command::Teardown => {
            store.teardown()?;
            println!("dropped result and probe tables");
            Ok(())
        }
        Command::Measure(args) => {
            let options = MeasureOptions {
                flush: args.flush,
                rollback: args.rollback,
            };
            let started = Instant::now();
            let delta = store.measure_statement(&args.sql, options)?;
            let report = MeasureReport {
                total_time_ms: elapsed_ms(started),
                delta,
            };

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_title(&args.sql);
                print_delta(&report.delta, report.total_time_ms);
            }
            Ok(())
        }
        Command::Probe { command } => match *command {
            ProbeCommand::List => {
                print_probe_catalog();
                Ok(())
            }
            ProbeCommand::Run(args) => run_probe(store, args),
        },
        Command::Experiment { command } => match *command {
            ExperimentCommand::Run(args) => run_experiment(store, &args),
            ExperimentCommand::Suite(args) => run_suite(store, args),
            ExperimentCommand::Schema(args) => run_schema(store, &args),
        },
        Command::Export { command } => match *command {
            ExportCommand::Movement(args) => {
                export_movement(store, &args.output)?;
                println!("wrote {}", args.output.display());
                Ok(())
            }
            ExportCommand::RecordTypes(args) => {
                export_record_types(store, &args.output)?;
                println!("wrote {}", args.output.display());
                Ok(())
            }
        },
        Command::Results(args) => {
            let results = store.list_experiment_results()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_results(&results);
            }
            Ok(())
        }
    }
}

fn run_probe(store: &mut PostgresWalStore, args: ProbeRunArgs) -> Result<()> {
    let probe = args.name.probe();
    let options = MeasureOptions {
        flush: probe.flush(),
        rollback: probe.rollback(),
    };

    let started = Instant::now();
    let delta = store.measure_statement(probe.sql(), options)?;
    let total_time_ms = elapsed_ms(started);
    if let Some(cleanup) = probe.cleanup_sql() {
        store.run_statement(cleanup)?;
    }

    let report = ProbeReport {
        probe,
        summary: probe.summary(),
        total_time_ms,
        delta,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_title(probe.summary());
        print_delta(&report.delta, report.total_time_ms);
    }
    Ok(())
}

fn run_experiment(store: &mut PostgresWalStore, args: &ExperimentRunArgs) -> Result<()> {
    let variant = args.variant.variant();
    let timing = args.timing.timing();

    let support = store.extension_support()?;
    if !support.supports(variant) {
        return Err(anyhow!(
            "variant {} needs the {} extension, which this server does not provide",
            variant.as_str(),
            variant.required_extension().unwrap_or("?"),
        ));
    }

    store.migrate()?;
    let run = store.run_index_experiment(variant, timing, args.row_count)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_title(&format!(
            "Experiment {} [{} rows]",
            run.result.name, run.result.num_rows
        ));
        print_delta(&run.delta, run.result.total_time_ms);
    }
    Ok(())
}

fn run_suite(store: &mut PostgresWalStore, args: SuiteArgs) -> Result<()> {
    let row_counts = if args.row_counts.is_empty() {
        DEFAULT_ROW_COUNTS.to_vec()
    } else {
        args.row_counts
    };

    let support = store.extension_support()?;
    if args.reset {
        store.reset_results()?;
    } else {
        store.migrate()?;
    }

    let mut skipped = Vec::new();
    for variant in IndexVariant::ALL {
        if !support.supports(variant) {
            skipped.push(variant.as_str().to_string());
        }
    }

    let mut experiments = Vec::new();
    let report_started_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

    for &row_count in &row_counts {
        run_suite_experiment(
            store,
            IndexVariant::NoIndex,
            IndexTiming::AfterInsert,
            row_count,
            args.json,
            &mut experiments,
        )?;

        for timing in [IndexTiming::AfterInsert, IndexTiming::BeforeInsert] {
            for variant in IndexVariant::ALL {
                if variant == IndexVariant::NoIndex || !support.supports(variant) {
                    continue;
                }
                run_suite_experiment(store, variant, timing, row_count, args.json, &mut experiments)?;
            }
        }
    }

    let report = SuiteReport {
        run_id: Ulid::new().to_string(),
        started_at: report_started_at,
        row_counts,
        skipped,
        experiments,
    };

    if let Some(dir) = &args.export_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create export directory {}", dir.display()))?;
        export_movement(store, &dir.join(MOVEMENT_EXPORT_FILE))?;
        export_record_types(store, &dir.join(RECORD_TYPES_EXPORT_FILE))?;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_suite_report(&report);
    }
    Ok(())
}

fn run_suite_experiment(
    store: &mut PostgresWalStore,
    variant: IndexVariant,
    timing: IndexTiming,
    row_count: i64,
    quiet: bool,
    experiments: &mut Vec<SuiteExperimentSummary>,
) -> Result<()> {
    if !quiet {
        print_title(&format!(
            "Experiment {} [{row_count} rows]",
            experiment_name(variant, timing)
        ));
    }

    let run = store.run_index_experiment(variant, timing, row_count)?;
    if !quiet {
        println!(
            "  {} bytes moved in {} ms ({} record types)",
            run.result.total_wal_movement,
            run.result.total_time_ms,
            run.delta.breakdown.len()
        );
    }

    experiments.push(SuiteExperimentSummary {
        name: run.result.name,
        num_rows: run.result.num_rows,
        total_wal_movement: run.result.total_wal_movement,
        total_time_ms: run.result.total_time_ms,
        breakdown_rows: run.delta.breakdown.len(),
    });
    Ok(())
}

fn run_schema(store: &mut PostgresWalStore, args: &SchemaArgs) -> Result<()> {
    let support = store.extension_support()?;
    if !support.vector {
        return Err(anyhow!(
            "the schema-placement suite needs the vector extension for its HNSW indexes"
        ));
    }

    let mut reports: Vec<SchemaScenarioReport> = Vec::new();
    for placement in SchemaPlacement::ALL {
        if !args.json {
            print_title(placement.title());
        }
        let report = store.run_schema_scenario(placement, args.row_count)?;
        if !args.json {
            println!(
                "  {} bytes moved in {} ms, {} embedding rows upserted",
                report.delta.total_bytes_moved, report.total_time_ms, report.rows_upserted
            );
            print_hot_stats(&report);
        }
        reports.push(report);
    }
    store.run_statement(SchemaPlacement::drop_sql())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }
    Ok(())
}

fn export_movement(store: &mut PostgresWalStore, output: &Path) -> Result<()> {
    let rows = store.movement_rows()?;
    let chart = build_movement_chart(&rows);
    let serialized = serde_json::to_string_pretty(&chart)?;
    std::fs::write(output, serialized)
        .with_context(|| format!("failed writing movement chart to {}", output.display()))
}

fn export_record_types(store: &mut PostgresWalStore, output: &Path) -> Result<()> {
    let rows = store.record_type_rows()?;
    let chart = build_record_type_chart(&rows).map_err(|err| anyhow!(err.to_string()))?;
    let serialized = serde_json::to_string_pretty(&chart)?;
    std::fs::write(output, serialized)
        .with_context(|| format!("failed writing record type chart to {}", output.display()))
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

fn print_title(text: &str) {
    println!("\n== {text}");
}

fn print_support(support: ExtensionSupport) {
    println!("pg_walinspect: installed");
    println!(
        "vector:        {}",
        if support.vector {
            "installed"
        } else {
            "not available (pgvector experiments will be skipped)"
        }
    );
    println!(
        "lantern:       {}",
        if support.lantern {
            "installed"
        } else {
            "not available (lantern experiments will be skipped)"
        }
    );
    println!("result tables ready");
}

fn print_delta(delta: &WalDelta, total_time_ms: i64) {
    println!(
        "  moved {} bytes [{} -> {}] in {} ms",
        delta.total_bytes_moved, delta.start_position, delta.end_position, total_time_ms
    );
    if delta.breakdown.is_empty() {
        println!("  (no records attributed in the window)");
        return;
    }

    println!(
        "  {:<14} {:<22} {:>8} {:>12} {:>10} {:>10}",
        "manager", "record", "count", "record_len", "main_len", "fpi_len"
    );
    for row in &delta.breakdown {
        println!(
            "  {:<14} {:<22} {:>8} {:>12} {:>10} {:>10}",
            row.resource_manager,
            row.record_type,
            row.count,
            row.total_record_length,
            row.total_main_data_length,
            row.total_fpi_length
        );
    }
}

fn print_probe_catalog() {
    println!("{:<22} {:<8} {:<9} summary", "name", "flush", "rollback");
    for probe in WalProbe::ALL {
        println!(
            "{:<22} {:<8} {:<9} {}",
            probe.as_str(),
            probe.flush(),
            probe.rollback(),
            probe.summary()
        );
    }
}

fn print_suite_report(report: &SuiteReport) {
    print_title(&format!("Suite {}", report.run_id));
    if !report.skipped.is_empty() {
        println!("  skipped variants: {}", report.skipped.join(", "));
    }
    println!(
        "  {:<44} {:>8} {:>14} {:>9}",
        "experiment", "rows", "wal_bytes", "time_ms"
    );
    for experiment in &report.experiments {
        println!(
            "  {:<44} {:>8} {:>14} {:>9}",
            experiment.name,
            experiment.num_rows,
            experiment.total_wal_movement,
            experiment.total_time_ms
        );
    }
}

fn print_hot_stats(report: &SchemaScenarioReport) {
    println!(
        "  {:<14} {:>8} {:>8} {:>9} {:>9} {:>11}",
        "table", "seq", "idx", "inserts", "updates", "hot_updates"
    );
    for row in &report.hot_stats {
        println!(
            "  {:<14} {:>8} {:>8} {:>9} {:>9} {:>11}",
            row.table_name,
            row.sequential_scans.unwrap_or(0),
            row.index_scans.unwrap_or(0),
            row.inserts.unwrap_or(0),
            row.updates.unwrap_or(0),
            row.hot_updates.unwrap_or(0)
        );
    }
}

fn print_results(results: &[ExperimentResult]) {
    println!(
        "{:<6} {:<44} {:>8} {:>14} {:>9}",
        "id", "name", "rows", "wal_bytes", "time_ms"
    );
    for result in results {
        println!(
            "{:<6} {:<44} {:>8} {:>14} {:>9}",
            result.id, result.name, result.num_rows, result.total_wal_movement, result.total_time_ms
        );
    }
}
