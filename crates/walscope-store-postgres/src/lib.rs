#![allow(clippy::missing_errors_doc)]

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use postgres::{Client, NoTls};
use serde::Serialize;
use walscope_core::{
    check_attribution, create_probe_table_sql, experiment_name, format_rfc3339, insert_papers_sql,
    now_utc, populate_probe_sql, ExperimentResult, IndexTiming, IndexVariant, MovementRow,
    RecordTypeRow, SchemaPlacement, WalBreakdownRow, WalDelta, WalLsn, WalSnapshot,
    RANDOM_STRING_FN_SQL, SCHEMA_TEXT_SIZE, VECTOR_DIM,
};

const SCHEMA_RESULTS_V1: &str = "
CREATE TABLE IF NOT EXISTS experiment_results (
  id BIGSERIAL PRIMARY KEY,
  name TEXT NOT NULL,
  num_rows BIGINT NOT NULL CHECK (num_rows >= 0),
  total_wal_movement BIGINT NOT NULL CHECK (total_wal_movement >= 0),
  total_time_ms BIGINT NOT NULL CHECK (total_time_ms >= 0),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS wal_records (
  id BIGSERIAL PRIMARY KEY,
  experiment_result_id BIGINT NOT NULL REFERENCES experiment_results(id),
  resource_manager TEXT NOT NULL,
  record_type TEXT NOT NULL,
  count BIGINT NOT NULL CHECK (count >= 0),
  total_record_length BIGINT NOT NULL CHECK (total_record_length >= 0),
  total_main_data_length BIGINT NOT NULL CHECK (total_main_data_length >= 0),
  total_fpi_length BIGINT NOT NULL CHECK (total_fpi_length >= 0)
);

CREATE INDEX IF NOT EXISTS idx_wal_records_result
  ON wal_records(experiment_result_id);
";

const BREAKDOWN_SQL: &str = "
SELECT resource_manager,
       record_type,
       count(*)::bigint AS count,
       sum(record_length)::bigint AS total_record_length,
       sum(main_data_length)::bigint AS total_main_data_length,
       sum(fpi_length)::bigint AS total_fpi_length
FROM pg_get_wal_records_info($1::pg_lsn, $2::pg_lsn)
GROUP BY resource_manager, record_type
ORDER BY total_record_length DESC, resource_manager ASC, record_type ASC
";

/// How a measurement window is framed.
///
/// `flush` issues a `CHECKPOINT` before the opening snapshot so buffered log
/// data does not pollute the window; it is never the default because the
/// flush has its own cost. `rollback` wraps the workload in a transaction
/// that is always rolled back, for measuring abort cost.
#[derive(Debug, Clone, Copy, Default, Serialize, Eq, PartialEq)]
pub struct MeasureOptions {
    pub flush: bool,
    pub rollback: bool,
}

impl MeasureOptions {
    #[must_use]
    pub fn flushed() -> Self {
        Self {
            flush: true,
            rollback: false,
        }
    }

    #[must_use]
    pub fn flushed_rollback() -> Self {
        Self {
            flush: true,
            rollback: true,
        }
    }
}

/// Which optional server extensions are usable on the connected database.
/// `pg_walinspect` is mandatory; the vector extensions only gate their own
/// index variants.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
pub struct ExtensionSupport {
    pub walinspect: bool,
    pub vector: bool,
    pub lantern: bool,
}

impl ExtensionSupport {
    #[must_use]
    pub fn supports(self, variant: IndexVariant) -> bool {
        match variant.required_extension() {
            Some("vector") => self.vector,
            Some("lantern") => self.lantern,
            _ => true,
        }
    }
}

/// One row of `pg_stat_user_tables`, read after a schema-placement scenario
/// to show how many updates stayed heap-only.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HotStatsRow {
    pub table_name: String,
    pub sequential_scans: Option<i64>,
    pub index_scans: Option<i64>,
    pub inserts: Option<i64>,
    pub updates: Option<i64>,
    pub hot_updates: Option<i64>,
}

/// One persisted index experiment together with its measured delta.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentRun {
    pub result: ExperimentResult,
    pub delta: WalDelta,
}

/// Outcome of one schema-placement scenario.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaScenarioReport {
    pub placement: SchemaPlacement,
    pub row_count: i64,
    pub rows_upserted: i64,
    pub total_time_ms: i64,
    pub delta: WalDelta,
    pub hot_stats: Vec<HotStatsRow>,
}

/// Synchronous Postgres session owning everything the harness does against
/// the database: extension setup, result schema, WAL snapshots, workload
/// execution, and result persistence. One connection, one statement at a
/// time; callers thread the store through an experiment batch instead of
/// sharing process-global state.
pub struct PostgresWalStore {
    client: Client,
}

impl PostgresWalStore {
    pub fn connect(database_url: &str) -> Result<Self> {
        let client = Client::connect(database_url, NoTls)
            .with_context(|| format!("failed to connect to postgres at {database_url}"))?;
        Ok(Self { client })
    }

    pub fn extension_support(&mut self) -> Result<ExtensionSupport> {
        Ok(ExtensionSupport {
            walinspect: self.extension_available("pg_walinspect")?,
            vector: self.extension_available("vector")?,
            lantern: self.extension_available("lantern")?,
        })
    }

    /// Installs `pg_walinspect` (required) and whichever vector extensions
    /// the server ships. Returns what ended up usable.
    pub fn install_extensions(&mut self) -> Result<ExtensionSupport> {
        let support = self.extension_support()?;
        if !support.walinspect {
            return Err(anyhow!(
                "pg_walinspect is not available on this server; the harness cannot measure without it"
            ));
        }

        self.client
            .batch_execute("CREATE EXTENSION IF NOT EXISTS pg_walinspect")
            .context("failed to install pg_walinspect")?;
        if support.vector {
            self.client
                .batch_execute("CREATE EXTENSION IF NOT EXISTS vector")
                .context("failed to install pgvector")?;
        }
        if support.lantern {
            self.client
                .batch_execute("CREATE EXTENSION IF NOT EXISTS lantern")
                .context("failed to install lantern")?;
        }

        Ok(support)
    }

    pub fn migrate(&mut self) -> Result<()> {
        self.client
            .batch_execute(SCHEMA_RESULTS_V1)
            .context("failed to apply result schema")
    }

    /// Drops and recreates the result tables wholesale, the only "deletion"
    /// path the result store has.
    pub fn reset_results(&mut self) -> Result<()> {
        self.client
            .batch_execute("DROP TABLE IF EXISTS wal_records, experiment_results CASCADE")
            .context("failed to drop result tables")?;
        self.migrate()
    }

    pub fn drop_probe_tables(&mut self) -> Result<()> {
        self.client
            .batch_execute(
                "DROP TABLE IF EXISTS wal_probe, wal_probe_ct, wal_probe_cttx CASCADE;
                 DROP TABLE IF EXISTS embeddings1, embeddings2, papers CASCADE",
            )
            .context("failed to drop probe tables")
    }

    pub fn teardown(&mut self) -> Result<()> {
        self.drop_probe_tables()?;
        self.client
            .batch_execute("DROP TABLE IF EXISTS wal_records, experiment_results CASCADE")
            .context("failed to drop result tables")
    }

    pub fn current_position(&mut self) -> Result<WalLsn> {
        let row = self
            .client
            .query_one("SELECT pg_current_wal_insert_lsn()::text", &[])
            .context("failed to read current wal position")?;
        let raw: String = row.try_get(0)?;
        WalLsn::parse(&raw).map_err(|err| anyhow!("unparseable wal position {raw:?}: {err}"))
    }

    pub fn checkpoint(&mut self) -> Result<()> {
        self.client
            .batch_execute("CHECKPOINT")
            .context("failed to issue checkpoint")
    }

    /// Aggregated record breakdown over `[start, end)`. An empty range short
    /// circuits without touching the introspection function.
    pub fn breakdown_between(
        &mut self,
        start: WalLsn,
        end: WalLsn,
    ) -> Result<Vec<WalBreakdownRow>> {
        if start == end {
            return Ok(Vec::new());
        }

        let rows = self
            .client
            .query(BREAKDOWN_SQL, &[&start.to_string(), &end.to_string()])
            .with_context(|| format!("failed to inspect wal records in [{start}, {end})"))?;

        rows.iter().map(parse_breakdown_row).collect()
    }

    /// Takes a snapshot: the current insert position, plus the aggregated
    /// breakdown since `previous` when one is given.
    pub fn snapshot(&mut self, previous: Option<WalLsn>) -> Result<WalSnapshot> {
        let position = self.current_position()?;
        let breakdown = match previous {
            Some(start) => self.breakdown_between(start, position)?,
            None => Vec::new(),
        };
        Ok(WalSnapshot {
            position,
            breakdown,
        })
    }

    /// Executes a SQL batch outside any measurement window. Failures
    /// propagate unmodified.
    pub fn run_statement(&mut self, sql: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .with_context(|| format!("workload statement failed: {sql}"))
    }

    /// Runs `work` between two WAL snapshots and returns the diff. With
    /// `rollback` set the workload executes inside a transaction that is
    /// rolled back whether or not it succeeds; workload errors propagate to
    /// the caller either way. Timing is the caller's business.
    pub fn measure<F>(&mut self, options: MeasureOptions, work: F) -> Result<WalDelta>
    where
        F: FnOnce(&mut Client) -> Result<()>,
    {
        if options.flush {
            self.checkpoint()?;
        }

        let before = self.snapshot(None)?;

        if options.rollback {
            self.client
                .batch_execute("BEGIN")
                .context("failed to open rollback transaction")?;
        }
        let outcome = work(&mut self.client);
        if options.rollback {
            let rolled_back = self.client.batch_execute("ROLLBACK");
            if outcome.is_ok() {
                rolled_back.context("failed to roll back measurement transaction")?;
            }
        }
        outcome?;

        let after = self.snapshot(Some(before.position))?;
        WalDelta::between(&before, &after).map_err(|err| anyhow!(err))
    }

    pub fn measure_statement(&mut self, sql: &str, options: MeasureOptions) -> Result<WalDelta> {
        let owned = sql.to_string();
        self.measure(options, move |client| {
            client
                .batch_execute(&owned)
                .with_context(|| format!("workload statement failed: {owned}"))
        })
    }

    /// Runs one index experiment: inside a flushed, always-rolled-back
    /// transaction, create the probe table, create the index before or after
    /// populating `row_count` rows, and persist the measurement.
    pub fn run_index_experiment(
        &mut self,
        variant: IndexVariant,
        timing: IndexTiming,
        row_count: i64,
    ) -> Result<ExperimentRun> {
        let index_sql = variant.create_index_sql();
        let populate = populate_probe_sql();
        let table_sql = create_probe_table_sql();

        let started = Instant::now();
        let delta = self.measure(MeasureOptions::flushed_rollback(), move |client| {
            client
                .batch_execute(&table_sql)
                .context("failed to create probe table")?;
            if timing == IndexTiming::BeforeInsert {
                client
                    .batch_execute(&index_sql)
                    .with_context(|| format!("index statement failed: {index_sql}"))?;
            }
            client
                .execute(populate.as_str(), &[&row_count, &VECTOR_DIM])
                .context("failed to populate probe table")?;
            if timing == IndexTiming::AfterInsert {
                client
                    .batch_execute(&index_sql)
                    .with_context(|| format!("index statement failed: {index_sql}"))?;
            }
            Ok(())
        })?;
        let total_time_ms = elapsed_ms(started);

        let name = experiment_name(variant, timing);
        let total_wal_movement = i64::try_from(delta.total_bytes_moved).unwrap_or(i64::MAX);
        let result = self.record_experiment(&name, row_count, total_time_ms, total_wal_movement)?;
        self.attach_wal_records(result.id, &delta.breakdown)?;

        Ok(ExperimentRun { result, delta })
    }

    /// Runs one schema-placement scenario and reads the HOT-update stats the
    /// scenario produced. The transaction commits; cleanup is the next
    /// scenario's (or teardown's) drop.
    pub fn run_schema_scenario(
        &mut self,
        placement: SchemaPlacement,
        row_count: i64,
    ) -> Result<SchemaScenarioReport> {
        self.run_statement(SchemaPlacement::drop_sql())?;
        self.run_statement(RANDOM_STRING_FN_SQL)?;

        let setup = placement.setup_sql();
        let upserts = placement.upsert_sql();
        let mut rows_upserted: u64 = 0;

        let started = Instant::now();
        let delta = self.measure(MeasureOptions::flushed(), |client| {
            let mut tx = client.transaction().context("failed to open transaction")?;
            for sql in &setup {
                tx.batch_execute(sql)
                    .with_context(|| format!("schema statement failed: {sql}"))?;
            }
            tx.execute(insert_papers_sql(), &[&row_count, &SCHEMA_TEXT_SIZE])
                .context("failed to insert text rows")?;
            for sql in &upserts {
                rows_upserted += tx
                    .execute(sql.as_str(), &[&VECTOR_DIM])
                    .with_context(|| format!("embedding upsert failed: {sql}"))?;
            }
            tx.commit().context("failed to commit scenario transaction")
        })?;
        let total_time_ms = elapsed_ms(started);

        let hot_stats = self.hot_stats()?;

        Ok(SchemaScenarioReport {
            placement,
            row_count,
            rows_upserted: i64::try_from(rows_upserted).unwrap_or(i64::MAX),
            total_time_ms,
            delta,
            hot_stats,
        })
    }

    pub fn record_experiment(
        &mut self,
        name: &str,
        num_rows: i64,
        total_time_ms: i64,
        total_wal_movement: i64,
    ) -> Result<ExperimentResult> {
        let created_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let row = self
            .client
            .query_one(
                "INSERT INTO experiment_results(name, num_rows, total_wal_movement, total_time_ms, created_at)
                 VALUES ($1, $2, $3, $4, $5)
                 RETURNING id",
                &[
                    &name,
                    &num_rows,
                    &total_wal_movement,
                    &total_time_ms,
                    &created_at,
                ],
            )
            .context("failed to record experiment result")?;

        Ok(ExperimentResult {
            id: row.try_get(0)?,
            name: name.to_string(),
            num_rows,
            total_wal_movement,
            total_time_ms,
            created_at,
        })
    }

    pub fn attach_wal_records(
        &mut self,
        experiment_result_id: i64,
        breakdown: &[WalBreakdownRow],
    ) -> Result<()> {
        let mut tx = self
            .client
            .transaction()
            .context("failed to start attach transaction")?;

        for row in breakdown {
            tx.execute(
                "INSERT INTO wal_records(
                    experiment_result_id, resource_manager, record_type,
                    count, total_record_length, total_main_data_length, total_fpi_length
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &experiment_result_id,
                    &row.resource_manager,
                    &row.record_type,
                    &row.count,
                    &row.total_record_length,
                    &row.total_main_data_length,
                    &row.total_fpi_length,
                ],
            )
            .context("failed to attach wal record row")?;
        }

        tx.commit().context("failed to commit attached wal records")
    }

    pub fn list_experiment_results(&mut self) -> Result<Vec<ExperimentResult>> {
        let rows = self
            .client
            .query(
                "SELECT id, name, num_rows, total_wal_movement, total_time_ms, created_at
                 FROM experiment_results
                 ORDER BY id ASC",
                &[],
            )
            .context("failed to list experiment results")?;

        rows.iter()
            .map(|row| {
                Ok(ExperimentResult {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    num_rows: row.try_get("num_rows")?,
                    total_wal_movement: row.try_get("total_wal_movement")?,
                    total_time_ms: row.try_get("total_time_ms")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    pub fn wal_records_for(&mut self, experiment_result_id: i64) -> Result<Vec<WalBreakdownRow>> {
        let rows = self
            .client
            .query(
                "SELECT resource_manager, record_type, count,
                        total_record_length, total_main_data_length, total_fpi_length
                 FROM wal_records
                 WHERE experiment_result_id = $1
                 ORDER BY id ASC",
                &[&experiment_result_id],
            )
            .context("failed to read wal records")?;

        rows.iter().map(parse_breakdown_row).collect()
    }

    /// Verifies the attribution invariant for one persisted result.
    pub fn check_result_attribution(&mut self, experiment_result_id: i64) -> Result<()> {
        let row = self
            .client
            .query_one(
                "SELECT total_wal_movement FROM experiment_results WHERE id = $1",
                &[&experiment_result_id],
            )
            .context("failed to read experiment result")?;
        let total: i64 = row.try_get(0)?;
        let breakdown = self.wal_records_for(experiment_result_id)?;
        check_attribution(total, &breakdown).map_err(|err| anyhow!(err))
    }

    pub fn movement_rows(&mut self) -> Result<Vec<MovementRow>> {
        let rows = self
            .client
            .query(
                "SELECT name, num_rows, total_wal_movement
                 FROM experiment_results
                 ORDER BY id ASC",
                &[],
            )
            .context("failed to read movement rows")?;

        rows.iter()
            .map(|row| {
                Ok(MovementRow {
                    name: row.try_get("name")?,
                    num_rows: row.try_get("num_rows")?,
                    total_wal_movement: row.try_get("total_wal_movement")?,
                })
            })
            .collect()
    }

    pub fn record_type_rows(&mut self) -> Result<Vec<RecordTypeRow>> {
        let rows = self
            .client
            .query(
                "SELECT r.name, w.resource_manager, w.record_type, r.num_rows, w.total_record_length
                 FROM wal_records w
                 JOIN experiment_results r ON r.id = w.experiment_result_id
                 ORDER BY r.id ASC, w.id ASC",
                &[],
            )
            .context("failed to read record type rows")?;

        rows.iter()
            .map(|row| {
                Ok(RecordTypeRow {
                    name: row.try_get("name")?,
                    resource_manager: row.try_get("resource_manager")?,
                    record_type: row.try_get("record_type")?,
                    num_rows: row.try_get("num_rows")?,
                    total_record_length: row.try_get("total_record_length")?,
                })
            })
            .collect()
    }

    pub fn hot_stats(&mut self) -> Result<Vec<HotStatsRow>> {
        let rows = self
            .client
            .query(
                "SELECT relname AS table_name,
                        seq_scan AS sequential_scans,
                        idx_scan AS index_scans,
                        n_tup_ins AS inserts,
                        n_tup_upd AS updates,
                        n_tup_hot_upd AS hot_updates
                 FROM pg_stat_user_tables
                 ORDER BY n_tup_hot_upd DESC NULLS LAST, relname ASC",
                &[],
            )
            .context("failed to read pg_stat_user_tables")?;

        rows.iter()
            .map(|row| {
                Ok(HotStatsRow {
                    table_name: row.try_get("table_name")?,
                    sequential_scans: row.try_get("sequential_scans")?,
                    index_scans: row.try_get("index_scans")?,
                    inserts: row.try_get("inserts")?,
                    updates: row.try_get("updates")?,
                    hot_updates: row.try_get("hot_updates")?,
                })
            })
            .collect()
    }

    fn extension_available(&mut self, name: &str) -> Result<bool> {
        let row = self
            .client
            .query_opt(
                "SELECT 1 FROM pg_available_extensions WHERE name = $1",
                &[&name],
            )
            .with_context(|| format!("failed to query pg_available_extensions for {name}"))?;
        Ok(row.is_some())
    }
}

fn parse_breakdown_row(row: &postgres::Row) -> Result<WalBreakdownRow> {
    Ok(WalBreakdownRow {
        resource_manager: row.try_get("resource_manager")?,
        record_type: row.try_get("record_type")?,
        count: row.try_get("count")?,
        total_record_length: row.try_get("total_record_length")?,
        total_main_data_length: row.try_get("total_main_data_length")?,
        total_fpi_length: row.try_get("total_fpi_length")?,
    })
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}
