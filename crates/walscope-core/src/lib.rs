use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

/// Column width of the probe vectors, matching the embedding width used by
/// the index experiments.
pub const VECTOR_DIM: i64 = 1536;

/// Fixed table every index experiment runs against.
pub const PROBE_TABLE: &str = "wal_probe";

/// Length of the random text values the schema-placement suite inserts.
pub const SCHEMA_TEXT_SIZE: i32 = 150;

/// Default row volume for the schema-placement suite.
pub const SCHEMA_DEFAULT_ROW_COUNT: i64 = 10_000;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum WalError {
    #[error("invalid wal position: {0}")]
    InvalidPosition(String),
    #[error("validation error: {0}")]
    Validation(String),
}

/// A WAL position (log sequence number) in Postgres's `X/Y` hex rendering.
///
/// The two halves combine into a single byte offset, so subtracting two
/// positions yields the number of WAL bytes written between them.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct WalLsn(pub u64);

impl WalLsn {
    /// Parses the `X/Y` form reported by `pg_current_wal_insert_lsn()`.
    ///
    /// # Errors
    /// Returns [`WalError::InvalidPosition`] when the input is not two
    /// slash-separated hex fields.
    pub fn parse(raw: &str) -> Result<Self, WalError> {
        let mut parts = raw.split('/');
        let (Some(hi_raw), Some(lo_raw), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(WalError::InvalidPosition(format!(
                "expected <hi>/<lo>, got {raw:?}"
            )));
        };

        let hi = u64::from_str_radix(hi_raw, 16)
            .map_err(|err| WalError::InvalidPosition(format!("bad high half {hi_raw:?}: {err}")))?;
        let lo = u64::from_str_radix(lo_raw, 16)
            .map_err(|err| WalError::InvalidPosition(format!("bad low half {lo_raw:?}: {err}")))?;

        if hi > u64::from(u32::MAX) || lo > u64::from(u32::MAX) {
            return Err(WalError::InvalidPosition(format!(
                "halves must fit in 32 bits: {raw}"
            )));
        }

        Ok(Self((hi << 32) | lo))
    }

    /// Bytes written between `earlier` and `self`.
    ///
    /// # Errors
    /// Returns [`WalError::Validation`] when `earlier` is past `self`; WAL
    /// positions only move forward, so a reversed pair means the caller
    /// swapped its snapshots.
    pub fn bytes_since(self, earlier: Self) -> Result<u64, WalError> {
        self.0.checked_sub(earlier.0).ok_or_else(|| {
            WalError::Validation(format!(
                "wal position moved backwards: {earlier} is past {self}"
            ))
        })
    }
}

impl Display for WalLsn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl Serialize for WalLsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WalLsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(D::Error::custom)
    }
}

/// One aggregated (resource manager, record type) line of a WAL breakdown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalBreakdownRow {
    pub resource_manager: String,
    pub record_type: String,
    pub count: i64,
    pub total_record_length: i64,
    pub total_main_data_length: i64,
    pub total_fpi_length: i64,
}

/// WAL state at one instant: the current insert position plus the aggregated
/// record breakdown over `[previous snapshot, this position)`. A snapshot
/// taken with no previous position carries an empty breakdown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalSnapshot {
    pub position: WalLsn,
    pub breakdown: Vec<WalBreakdownRow>,
}

impl WalSnapshot {
    #[must_use]
    pub fn at(position: WalLsn) -> Self {
        Self {
            position,
            breakdown: Vec::new(),
        }
    }
}

/// The measured difference between two snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalDelta {
    pub start_position: WalLsn,
    pub end_position: WalLsn,
    pub total_bytes_moved: u64,
    pub breakdown: Vec<WalBreakdownRow>,
}

impl WalDelta {
    /// Diffs two snapshots: total bytes from the position distance, breakdown
    /// from merging both snapshots' contributions. In practice the "after"
    /// breakdown already covers the delta range and merging reduces to
    /// pass-through.
    ///
    /// # Errors
    /// Returns [`WalError::Validation`] when `after` precedes `before`.
    pub fn between(before: &WalSnapshot, after: &WalSnapshot) -> Result<Self, WalError> {
        let total_bytes_moved = after.position.bytes_since(before.position)?;
        Ok(Self {
            start_position: before.position,
            end_position: after.position,
            total_bytes_moved,
            breakdown: merge_breakdowns(&before.breakdown, &after.breakdown),
        })
    }
}

/// Sums two breakdowns by (resource manager, record type), ordering the
/// result by descending record length, then key.
#[must_use]
pub fn merge_breakdowns(lhs: &[WalBreakdownRow], rhs: &[WalBreakdownRow]) -> Vec<WalBreakdownRow> {
    let mut merged: BTreeMap<(String, String), WalBreakdownRow> = BTreeMap::new();
    for row in lhs.iter().chain(rhs) {
        let key = (row.resource_manager.clone(), row.record_type.clone());
        match merged.get_mut(&key) {
            Some(existing) => {
                existing.count += row.count;
                existing.total_record_length += row.total_record_length;
                existing.total_main_data_length += row.total_main_data_length;
                existing.total_fpi_length += row.total_fpi_length;
            }
            None => {
                merged.insert(key, row.clone());
            }
        }
    }

    let mut rows: Vec<WalBreakdownRow> = merged.into_values().collect();
    rows.sort_by(|a, b| {
        b.total_record_length
            .cmp(&a.total_record_length)
            .then_with(|| a.resource_manager.cmp(&b.resource_manager))
            .then_with(|| a.record_type.cmp(&b.record_type))
    });
    rows
}

/// Bytes of the delta attributed to specific record types.
#[must_use]
pub fn attributed_record_bytes(breakdown: &[WalBreakdownRow]) -> i64 {
    breakdown.iter().map(|row| row.total_record_length).sum()
}

/// Checks the attribution invariant: the per-record-type byte totals cannot
/// exceed the measured position distance. Administrative WAL bytes are not
/// attributed, so strictly-less is the common case.
///
/// # Errors
/// Returns [`WalError::Validation`] when the breakdown claims more bytes
/// than the measurement moved.
pub fn check_attribution(
    total_wal_movement: i64,
    breakdown: &[WalBreakdownRow],
) -> Result<(), WalError> {
    let attributed = attributed_record_bytes(breakdown);
    if i128::from(attributed) > i128::from(total_wal_movement) {
        return Err(WalError::Validation(format!(
            "breakdown attributes {attributed} bytes but only {total_wal_movement} moved"
        )));
    }
    Ok(())
}

/// One persisted experiment run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExperimentResult {
    pub id: i64,
    pub name: String,
    pub num_rows: i64,
    pub total_wal_movement: i64,
    pub total_time_ms: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IndexVariant {
    NoIndex,
    BtreeInt,
    HashInt,
    BtreeText,
    HashText,
    PgvectorHnsw,
    LanternHnsw,
}

impl IndexVariant {
    pub const ALL: [Self; 7] = [
        Self::NoIndex,
        Self::BtreeInt,
        Self::HashInt,
        Self::BtreeText,
        Self::HashText,
        Self::PgvectorHnsw,
        Self::LanternHnsw,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoIndex => "no-index",
            Self::BtreeInt => "btree-int",
            Self::HashInt => "hash-int",
            Self::BtreeText => "btree-text",
            Self::HashText => "hash-text",
            Self::PgvectorHnsw => "pgvector-hnsw",
            Self::LanternHnsw => "lantern-hnsw",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "no-index" => Some(Self::NoIndex),
            "btree-int" => Some(Self::BtreeInt),
            "hash-int" => Some(Self::HashInt),
            "btree-text" => Some(Self::BtreeText),
            "hash-text" => Some(Self::HashText),
            "pgvector-hnsw" => Some(Self::PgvectorHnsw),
            "lantern-hnsw" => Some(Self::LanternHnsw),
            _ => None,
        }
    }

    /// Human label used inside derived experiment names.
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::NoIndex => "no",
            Self::BtreeInt => "btree",
            Self::HashInt => "hash",
            Self::BtreeText => "btree ON TEXT",
            Self::HashText => "hash ON TEXT",
            Self::PgvectorHnsw => "pgvector",
            Self::LanternHnsw => "lantern",
        }
    }

    /// The fixed statement measured for this variant. `NoIndex` measures the
    /// insert cost alone, so its "index" statement is a no-op select.
    #[must_use]
    pub fn create_index_sql(self) -> String {
        match self {
            Self::NoIndex => "SELECT 1".to_string(),
            Self::BtreeInt => format!("CREATE INDEX {PROBE_TABLE}_i ON {PROBE_TABLE}(i)"),
            Self::HashInt => {
                format!("CREATE INDEX {PROBE_TABLE}_i_hash ON {PROBE_TABLE} USING hash(i)")
            }
            Self::BtreeText => format!("CREATE INDEX {PROBE_TABLE}_t ON {PROBE_TABLE}(t)"),
            Self::HashText => {
                format!("CREATE INDEX {PROBE_TABLE}_t_hash ON {PROBE_TABLE} USING hash(t)")
            }
            Self::PgvectorHnsw => format!(
                "CREATE INDEX {PROBE_TABLE}_v ON {PROBE_TABLE} \
                 USING hnsw((v::vector({VECTOR_DIM})) vector_cosine_ops) \
                 WITH (m = 16, ef_construction = 100)"
            ),
            Self::LanternHnsw => format!(
                "CREATE INDEX {PROBE_TABLE}_v_lantern ON {PROBE_TABLE} \
                 USING lantern_hnsw(v dist_cos_ops) \
                 WITH (dim = {VECTOR_DIM}, m = 16, ef_construction = 100)"
            ),
        }
    }

    /// Server extension the variant's index method lives in, if any.
    #[must_use]
    pub fn required_extension(self) -> Option<&'static str> {
        match self {
            Self::PgvectorHnsw => Some("vector"),
            Self::LanternHnsw => Some("lantern"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IndexTiming {
    BeforeInsert,
    AfterInsert,
}

impl IndexTiming {
    pub const ALL: [Self; 2] = [Self::BeforeInsert, Self::AfterInsert];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeInsert => "before-insert",
            Self::AfterInsert => "after-insert",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "before-insert" => Some(Self::BeforeInsert),
            "after-insert" => Some(Self::AfterInsert),
            _ => None,
        }
    }

    #[must_use]
    pub fn phrase(self) -> &'static str {
        match self {
            Self::BeforeInsert => "before insert",
            Self::AfterInsert => "after insert",
        }
    }
}

/// Derived experiment name, stable across runs so results group correctly.
#[must_use]
pub fn experiment_name(variant: IndexVariant, timing: IndexTiming) -> String {
    match variant {
        IndexVariant::NoIndex => "NO INDEX".to_string(),
        other => format!("create {} index {}", other.display_name(), timing.phrase()),
    }
}

/// DDL for the probe table the index experiments populate.
#[must_use]
pub fn create_probe_table_sql() -> String {
    format!("CREATE TABLE {PROBE_TABLE}(i bigint, t text, v real[{VECTOR_DIM}])")
}

/// Parameterized population statement: `$1` is the row count, `$2` the
/// vector width. Rows carry a random bigint, a random md5 text, and a random
/// `real[]` vector assembled with `array_agg`.
#[must_use]
pub fn populate_probe_sql() -> String {
    format!(
        "INSERT INTO {PROBE_TABLE}(i, t, v) \
         SELECT (random() * 1000 * 1000)::bigint, md5(random()::text), array_agg(random()::real) \
         FROM generate_series(1, $1::bigint) a \
         CROSS JOIN generate_series(1, $2::bigint) \
         GROUP BY a"
    )
}

/// The closed set of one-shot WAL probes: small fixed statements that
/// demonstrate where WAL bytes come from even without bulk data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WalProbe {
    CreateTable,
    CreateTableTx,
    XactId,
    XactIdIfAssigned,
    AbortedCreate,
}

impl WalProbe {
    pub const ALL: [Self; 5] = [
        Self::CreateTable,
        Self::CreateTableTx,
        Self::XactId,
        Self::XactIdIfAssigned,
        Self::AbortedCreate,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateTable => "create-table",
            Self::CreateTableTx => "create-table-tx",
            Self::XactId => "xact-id",
            Self::XactIdIfAssigned => "xact-id-if-assigned",
            Self::AbortedCreate => "aborted-create",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create-table" => Some(Self::CreateTable),
            "create-table-tx" => Some(Self::CreateTableTx),
            "xact-id" => Some(Self::XactId),
            "xact-id-if-assigned" => Some(Self::XactIdIfAssigned),
            "aborted-create" => Some(Self::AbortedCreate),
            _ => None,
        }
    }

    #[must_use]
    pub fn sql(self) -> &'static str {
        match self {
            Self::CreateTable | Self::AbortedCreate => "CREATE TABLE wal_probe_ct(i bigint)",
            Self::CreateTableTx => "BEGIN; CREATE TABLE wal_probe_cttx(i bigint); COMMIT",
            Self::XactId => "SELECT pg_current_xact_id()",
            Self::XactIdIfAssigned => "SELECT pg_current_xact_id_if_assigned()",
        }
    }

    /// Statement run unmeasured after the probe to undo its side effects.
    #[must_use]
    pub fn cleanup_sql(self) -> Option<&'static str> {
        match self {
            Self::CreateTable => Some("DROP TABLE IF EXISTS wal_probe_ct"),
            Self::CreateTableTx => Some("DROP TABLE IF EXISTS wal_probe_cttx"),
            _ => None,
        }
    }

    #[must_use]
    pub fn flush(self) -> bool {
        !matches!(self, Self::CreateTableTx | Self::XactIdIfAssigned)
    }

    #[must_use]
    pub fn rollback(self) -> bool {
        matches!(self, Self::AbortedCreate)
    }

    #[must_use]
    pub fn summary(self) -> &'static str {
        match self {
            Self::CreateTable => "CREATE TABLE outside any transaction",
            Self::CreateTableTx => "CREATE TABLE inside an explicit transaction",
            Self::XactId => "pg_current_xact_id allocates a transaction id",
            Self::XactIdIfAssigned => "pg_current_xact_id_if_assigned allocates nothing",
            Self::AbortedCreate => "aborted transactions still generate WAL",
        }
    }
}

/// Where a table keeps its embedding vectors: alongside the row data, or in
/// side tables joined by primary key. The schema-placement suite measures the
/// WAL cost of re-embedding under each strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SchemaPlacement {
    Inline,
    Separate,
}

impl SchemaPlacement {
    pub const ALL: [Self; 2] = [Self::Inline, Self::Separate];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Separate => "separate",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inline" => Some(Self::Inline),
            "separate" => Some(Self::Separate),
            _ => None,
        }
    }

    #[must_use]
    pub fn title(self) -> &'static str {
        match self {
            Self::Inline => "vector columns part of the main table",
            Self::Separate => "vector columns in separate tables",
        }
    }

    /// DDL run inside the measured transaction: tables first, then the HNSW
    /// indexes, so index maintenance during the upserts is part of the cost.
    #[must_use]
    pub fn setup_sql(self) -> Vec<String> {
        match self {
            Self::Inline => vec![
                format!(
                    "CREATE TABLE papers(id bigserial PRIMARY KEY, t1 text, t2 text, \
                     v1 real[{VECTOR_DIM}], v2 real[{VECTOR_DIM}])"
                ),
                hnsw_index_sql("papers_v1", "papers", "v1"),
                hnsw_index_sql("papers_v2", "papers", "v2"),
            ],
            Self::Separate => vec![
                "CREATE TABLE papers(id bigserial PRIMARY KEY, t1 text, t2 text)".to_string(),
                format!(
                    "CREATE TABLE embeddings1(papers_id bigint PRIMARY KEY \
                     REFERENCES papers(id), v real[{VECTOR_DIM}])"
                ),
                format!(
                    "CREATE TABLE embeddings2(papers_id bigint PRIMARY KEY \
                     REFERENCES papers(id), v real[{VECTOR_DIM}])"
                ),
                hnsw_index_sql("embeddings1_v", "embeddings1", "v"),
                hnsw_index_sql("embeddings2_v", "embeddings2", "v"),
            ],
        }
    }

    /// Upsert statements standing in for asynchronous embedding generation:
    /// one per vector column (inline) or side table (separate). `$1` is the
    /// vector width; the target rows come from `papers`.
    #[must_use]
    pub fn upsert_sql(self) -> Vec<String> {
        match self {
            Self::Inline => vec![inline_upsert_sql("v1"), inline_upsert_sql("v2")],
            Self::Separate => vec![
                separate_upsert_sql("embeddings1"),
                separate_upsert_sql("embeddings2"),
            ],
        }
    }

    #[must_use]
    pub fn drop_sql() -> &'static str {
        "DROP TABLE IF EXISTS embeddings1, embeddings2, papers CASCADE"
    }
}

fn hnsw_index_sql(index_name: &str, table: &str, column: &str) -> String {
    format!(
        "CREATE INDEX {index_name} ON {table} \
         USING hnsw(({column}::vector({VECTOR_DIM})) vector_cosine_ops) \
         WITH (m = 16, ef_construction = 100)"
    )
}

fn inline_upsert_sql(column: &str) -> String {
    format!(
        "INSERT INTO papers(id, {column}) \
         SELECT p.id, array_agg(random()::real ORDER BY gs) \
         FROM papers p CROSS JOIN LATERAL generate_series(1, $1::bigint) AS gs(gs) \
         GROUP BY p.id \
         ON CONFLICT (id) DO UPDATE SET {column} = EXCLUDED.{column}"
    )
}

fn separate_upsert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table}(papers_id, v) \
         SELECT p.id, array_agg(random()::real ORDER BY gs) \
         FROM papers p CROSS JOIN LATERAL generate_series(1, $1::bigint) AS gs(gs) \
         GROUP BY p.id \
         ON CONFLICT (papers_id) DO UPDATE SET v = EXCLUDED.v"
    )
}

/// Text-row population for the schema-placement suite: `$1` is the row
/// count, `$2` the random-string length.
#[must_use]
pub fn insert_papers_sql() -> &'static str {
    "INSERT INTO papers(t1) \
     SELECT get_random_string($2::int) FROM generate_series(1, $1::bigint)"
}

/// Server-side random text helper the schema-placement suite installs.
pub const RANDOM_STRING_FN_SQL: &str = r"
CREATE OR REPLACE FUNCTION get_random_string(
    IN string_length INTEGER,
    IN possible_chars TEXT
    DEFAULT '0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz'
) RETURNS text
LANGUAGE plpgsql
AS $$
DECLARE
    output TEXT = '';
    i INT4;
    pos INT4;
BEGIN
    FOR i IN 1..string_length LOOP
        pos := 1 + CAST( random() * ( LENGTH(possible_chars) - 1) AS INT4 );
        output := output || substr(possible_chars, pos, 1);
    END LOOP;
    RETURN output;
END;
$$;
";

/// Flat movement row as read back from the result store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MovementRow {
    pub name: String,
    pub num_rows: i64,
    pub total_wal_movement: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MovementDataset {
    pub label: String,
    pub data: Vec<i64>,
}

/// Chart-tool shape: `labels` are the row counts, one dataset per
/// experiment name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MovementChart {
    pub labels: Vec<i64>,
    pub datasets: Vec<MovementDataset>,
}

/// Groups flat movement rows into the chart shape. Dataset order follows
/// first appearance of each experiment name; within a dataset the points are
/// ordered by row count. Labels come from the first dataset.
#[must_use]
pub fn build_movement_chart(rows: &[MovementRow]) -> MovementChart {
    let mut order: Vec<String> = Vec::new();
    let mut grouped: BTreeMap<String, Vec<(i64, i64)>> = BTreeMap::new();
    for row in rows {
        if !grouped.contains_key(&row.name) {
            order.push(row.name.clone());
        }
        grouped
            .entry(row.name.clone())
            .or_default()
            .push((row.num_rows, row.total_wal_movement));
    }

    let mut datasets = Vec::with_capacity(order.len());
    for name in &order {
        let Some(mut points) = grouped.remove(name) else {
            continue;
        };
        points.sort_by_key(|(num_rows, _)| *num_rows);
        datasets.push(MovementDataset {
            label: name.clone(),
            data: points.into_iter().map(|(_, movement)| movement).collect(),
        });
    }

    let mut labels: Vec<i64> = rows
        .iter()
        .filter(|row| Some(&row.name) == order.first())
        .map(|row| row.num_rows)
        .collect();
    labels.sort_unstable();

    MovementChart { labels, datasets }
}

/// Flat record-type row as read back from the result store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordTypeRow {
    pub name: String,
    pub resource_manager: String,
    pub record_type: String,
    pub num_rows: i64,
    pub total_record_length: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordTypeSeries {
    pub label: String,
    pub data: Vec<i64>,
}

/// Groups flat record-type rows into the second chart shape: an object keyed
/// by experiment name, each value a list of `{label, data}` series where the
/// label is `<resource_manager>_<record_type>` and the data points are
/// ordered by row count.
///
/// # Errors
/// Returns [`WalError::Validation`] when the series cannot be serialized.
pub fn build_record_type_chart(rows: &[RecordTypeRow]) -> Result<Value, WalError> {
    let mut name_order: Vec<String> = Vec::new();
    let mut by_name: BTreeMap<String, Vec<&RecordTypeRow>> = BTreeMap::new();
    for row in rows {
        if !by_name.contains_key(&row.name) {
            name_order.push(row.name.clone());
        }
        by_name.entry(row.name.clone()).or_default().push(row);
    }

    let mut chart = serde_json::Map::new();
    for name in name_order {
        let Some(group) = by_name.remove(&name) else {
            continue;
        };

        let mut label_order: Vec<String> = Vec::new();
        let mut by_label: BTreeMap<String, Vec<(i64, i64)>> = BTreeMap::new();
        for row in group {
            let label = format!("{}_{}", row.resource_manager, row.record_type);
            if !by_label.contains_key(&label) {
                label_order.push(label.clone());
            }
            by_label
                .entry(label)
                .or_default()
                .push((row.num_rows, row.total_record_length));
        }

        let mut series = Vec::with_capacity(label_order.len());
        for label in label_order {
            let Some(mut points) = by_label.remove(&label) else {
                continue;
            };
            points.sort_by_key(|(num_rows, _)| *num_rows);
            series.push(RecordTypeSeries {
                label,
                data: points.into_iter().map(|(_, length)| length).collect(),
            });
        }

        let value = serde_json::to_value(series)
            .map_err(|err| WalError::Validation(format!("failed to shape series: {err}")))?;
        chart.insert(name, value);
    }

    Ok(Value::Object(chart))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`WalError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, WalError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| WalError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(WalError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`WalError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, WalError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| WalError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn row(rm: &str, rt: &str, count: i64, record: i64, main: i64, fpi: i64) -> WalBreakdownRow {
        WalBreakdownRow {
            resource_manager: rm.to_string(),
            record_type: rt.to_string(),
            count,
            total_record_length: record,
            total_main_data_length: main,
            total_fpi_length: fpi,
        }
    }

    #[test]
    fn lsn_parses_and_renders_the_postgres_form() {
        let lsn = must_ok(WalLsn::parse("16/B374D848"));
        assert_eq!(lsn.0, (0x16_u64 << 32) | 0xB374_D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
    }

    #[test]
    fn lsn_parse_rejects_malformed_input() {
        for raw in ["", "16", "16/B374D848/0", "xyz/0", "0/xyz", "1FFFFFFFF/0"] {
            assert!(
                WalLsn::parse(raw).is_err(),
                "expected parse failure for {raw:?}"
            );
        }
    }

    #[test]
    fn bytes_since_is_the_position_distance() {
        let before = must_ok(WalLsn::parse("0/1000"));
        let after = must_ok(WalLsn::parse("0/1400"));
        assert_eq!(must_ok(after.bytes_since(before)), 0x400);
    }

    #[test]
    fn bytes_since_rejects_backwards_pairs() {
        let before = must_ok(WalLsn::parse("1/0"));
        let after = must_ok(WalLsn::parse("0/FFFF"));
        assert!(after.bytes_since(before).is_err());
    }

    #[test]
    fn lsn_serializes_as_its_text_form() {
        let lsn = must_ok(WalLsn::parse("A/1F"));
        let json = must_ok(serde_json::to_string(&lsn));
        assert_eq!(json, "\"A/1F\"");
        let back: WalLsn = must_ok(serde_json::from_str(&json));
        assert_eq!(back, lsn);
    }

    #[test]
    fn delta_between_passes_after_breakdown_through() {
        let before = WalSnapshot::at(must_ok(WalLsn::parse("0/100")));
        let after = WalSnapshot {
            position: must_ok(WalLsn::parse("0/400")),
            breakdown: vec![row("Heap", "INSERT", 2, 441, 6, 0)],
        };

        let delta = must_ok(WalDelta::between(&before, &after));
        assert_eq!(delta.total_bytes_moved, 0x300);
        assert_eq!(delta.breakdown, after.breakdown);
    }

    #[test]
    fn delta_between_merges_overlapping_categories() {
        let before = WalSnapshot {
            position: must_ok(WalLsn::parse("0/100")),
            breakdown: vec![
                row("Heap", "INSERT", 1, 100, 10, 0),
                row("Standby", "LOCK", 1, 42, 16, 0),
            ],
        };
        let after = WalSnapshot {
            position: must_ok(WalLsn::parse("0/200")),
            breakdown: vec![row("Heap", "INSERT", 2, 200, 20, 0)],
        };

        let delta = must_ok(WalDelta::between(&before, &after));
        assert_eq!(delta.breakdown.len(), 2);
        assert_eq!(delta.breakdown[0].resource_manager, "Heap");
        assert_eq!(delta.breakdown[0].count, 3);
        assert_eq!(delta.breakdown[0].total_record_length, 300);
        assert_eq!(delta.breakdown[1].resource_manager, "Standby");
    }

    #[test]
    fn delta_between_rejects_swapped_snapshots() {
        let before = WalSnapshot::at(must_ok(WalLsn::parse("0/400")));
        let after = WalSnapshot::at(must_ok(WalLsn::parse("0/100")));
        assert!(WalDelta::between(&before, &after).is_err());
    }

    #[test]
    fn attribution_accepts_partial_coverage() {
        let breakdown = vec![row("Storage", "CREATE", 1, 42, 16, 0)];
        assert!(check_attribution(100, &breakdown).is_ok());
        assert_eq!(attributed_record_bytes(&breakdown), 42);
    }

    #[test]
    fn attribution_rejects_overclaiming_breakdowns() {
        let breakdown = vec![row("Heap", "INSERT", 1, 500, 6, 0)];
        assert!(check_attribution(100, &breakdown).is_err());
    }

    #[test]
    fn experiment_names_are_stable() {
        assert_eq!(
            experiment_name(IndexVariant::NoIndex, IndexTiming::AfterInsert),
            "NO INDEX"
        );
        assert_eq!(
            experiment_name(IndexVariant::BtreeInt, IndexTiming::BeforeInsert),
            "create btree index before insert"
        );
        assert_eq!(
            experiment_name(IndexVariant::LanternHnsw, IndexTiming::AfterInsert),
            "create lantern index after insert"
        );
    }

    #[test]
    fn variant_round_trips_through_its_text_form() {
        for variant in IndexVariant::ALL {
            assert_eq!(IndexVariant::parse(variant.as_str()), Some(variant));
        }
        assert_eq!(IndexVariant::parse("gin"), None);
        for timing in IndexTiming::ALL {
            assert_eq!(IndexTiming::parse(timing.as_str()), Some(timing));
        }
        for probe in WalProbe::ALL {
            assert_eq!(WalProbe::parse(probe.as_str()), Some(probe));
        }
    }

    #[test]
    fn index_sql_targets_the_probe_table() {
        assert_eq!(IndexVariant::NoIndex.create_index_sql(), "SELECT 1");
        for variant in IndexVariant::ALL {
            if variant == IndexVariant::NoIndex {
                continue;
            }
            let sql = variant.create_index_sql();
            assert!(sql.starts_with("CREATE INDEX"), "sql={sql}");
            assert!(sql.contains(PROBE_TABLE), "sql={sql}");
        }

        let hnsw = IndexVariant::PgvectorHnsw.create_index_sql();
        assert!(hnsw.contains("USING hnsw"));
        assert!(hnsw.contains("vector(1536)"));
        assert!(hnsw.contains("ef_construction = 100"));

        let lantern = IndexVariant::LanternHnsw.create_index_sql();
        assert!(lantern.contains("USING lantern_hnsw"));
        assert!(lantern.contains("dim = 1536"));
    }

    #[test]
    fn only_vector_variants_need_extensions() {
        assert_eq!(
            IndexVariant::PgvectorHnsw.required_extension(),
            Some("vector")
        );
        assert_eq!(
            IndexVariant::LanternHnsw.required_extension(),
            Some("lantern")
        );
        assert_eq!(IndexVariant::BtreeInt.required_extension(), None);
    }

    #[test]
    fn probe_catalog_flags_match_their_scenarios() {
        assert!(WalProbe::CreateTable.flush());
        assert!(!WalProbe::CreateTable.rollback());
        assert!(WalProbe::AbortedCreate.rollback());
        assert!(!WalProbe::XactIdIfAssigned.flush());
        assert_eq!(
            WalProbe::CreateTable.cleanup_sql(),
            Some("DROP TABLE IF EXISTS wal_probe_ct")
        );
        assert_eq!(WalProbe::AbortedCreate.cleanup_sql(), None);
    }

    #[test]
    fn populate_sql_is_parameterized() {
        let sql = populate_probe_sql();
        assert!(sql.contains("$1::bigint"));
        assert!(sql.contains("$2::bigint"));
        assert!(sql.contains(PROBE_TABLE));
        assert!(!sql.contains("1536"), "row/dim must be parameters: {sql}");
    }

    #[test]
    fn schema_placements_build_their_fixed_statements() {
        let inline = SchemaPlacement::Inline.setup_sql();
        assert_eq!(inline.len(), 3);
        assert!(inline[0].contains("v1 real[1536]"));
        assert!(inline[1].contains("USING hnsw"));

        let separate = SchemaPlacement::Separate.setup_sql();
        assert_eq!(separate.len(), 5);
        assert!(separate[1].contains("REFERENCES papers(id)"));
        assert!(separate[4].contains("embeddings2_v"));

        for placement in SchemaPlacement::ALL {
            assert_eq!(SchemaPlacement::parse(placement.as_str()), Some(placement));
            for sql in placement.upsert_sql() {
                assert!(sql.contains("$1::bigint"), "sql={sql}");
                assert!(!sql.contains("$2"), "upserts take only the width: {sql}");
                assert!(sql.contains("ON CONFLICT"), "sql={sql}");
            }
        }

        assert!(SchemaPlacement::drop_sql().contains("CASCADE"));
        assert!(insert_papers_sql().contains("get_random_string($2::int)"));
        assert!(RANDOM_STRING_FN_SQL.contains("get_random_string"));
    }

    #[test]
    fn movement_chart_groups_by_name_in_first_appearance_order() {
        let rows = vec![
            MovementRow {
                name: "NO INDEX".to_string(),
                num_rows: 1000,
                total_wal_movement: 10,
            },
            MovementRow {
                name: "create btree index after insert".to_string(),
                num_rows: 1000,
                total_wal_movement: 20,
            },
            MovementRow {
                name: "NO INDEX".to_string(),
                num_rows: 2000,
                total_wal_movement: 30,
            },
            MovementRow {
                name: "create btree index after insert".to_string(),
                num_rows: 2000,
                total_wal_movement: 40,
            },
        ];

        let chart = build_movement_chart(&rows);
        assert_eq!(chart.labels, vec![1000, 2000]);
        assert_eq!(chart.datasets.len(), 2);
        assert_eq!(chart.datasets[0].label, "NO INDEX");
        assert_eq!(chart.datasets[0].data, vec![10, 30]);
        assert_eq!(chart.datasets[1].label, "create btree index after insert");
        assert_eq!(chart.datasets[1].data, vec![20, 40]);
    }

    #[test]
    fn movement_chart_of_nothing_is_empty() {
        let chart = build_movement_chart(&[]);
        assert!(chart.labels.is_empty());
        assert!(chart.datasets.is_empty());
    }

    #[test]
    fn record_type_chart_is_keyed_by_experiment_name() {
        let rows = vec![
            RecordTypeRow {
                name: "NO INDEX".to_string(),
                resource_manager: "Heap2".to_string(),
                record_type: "MULTI_INSERT".to_string(),
                num_rows: 2000,
                total_record_length: 700,
            },
            RecordTypeRow {
                name: "NO INDEX".to_string(),
                resource_manager: "Heap2".to_string(),
                record_type: "MULTI_INSERT".to_string(),
                num_rows: 1000,
                total_record_length: 350,
            },
            RecordTypeRow {
                name: "NO INDEX".to_string(),
                resource_manager: "Storage".to_string(),
                record_type: "CREATE".to_string(),
                num_rows: 1000,
                total_record_length: 42,
            },
        ];

        let chart = must_ok(build_record_type_chart(&rows));
        let series = chart
            .get("NO INDEX")
            .and_then(Value::as_array)
            .unwrap_or_else(|| panic!("missing NO INDEX group: {chart}"));
        assert_eq!(series.len(), 2);
        assert_eq!(
            series[0].get("label").and_then(Value::as_str),
            Some("Heap2_MULTI_INSERT")
        );
        let data: Vec<i64> = series[0]
            .get("data")
            .and_then(Value::as_array)
            .map(|values| values.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();
        assert_eq!(data, vec![350, 700]);
        assert_eq!(
            series[1].get("label").and_then(Value::as_str),
            Some("Storage_CREATE")
        );
    }

    #[test]
    fn rfc3339_helpers_round_trip() {
        let now = now_utc();
        let rendered = must_ok(format_rfc3339(now));
        let parsed = must_ok(parse_rfc3339_utc(&rendered));
        assert_eq!(parsed.unix_timestamp(), now.unix_timestamp());
        assert!(parse_rfc3339_utc("2026-08-04T12:00:00+02:00").is_err());
    }

    proptest! {
        #[test]
        fn lsn_text_form_round_trips(hi in 0_u64..=u64::from(u32::MAX), lo in 0_u64..=u64::from(u32::MAX)) {
            let lsn = WalLsn((hi << 32) | lo);
            let parsed = WalLsn::parse(&lsn.to_string());
            prop_assert_eq!(parsed, Ok(lsn));
        }

        #[test]
        fn merge_totals_are_order_independent(a in 0_i64..1_000_000, b in 0_i64..1_000_000) {
            let lhs = [super::WalBreakdownRow {
                resource_manager: "Heap".to_string(),
                record_type: "INSERT".to_string(),
                count: 1,
                total_record_length: a,
                total_main_data_length: 0,
                total_fpi_length: 0,
            }];
            let rhs = [super::WalBreakdownRow {
                resource_manager: "Heap".to_string(),
                record_type: "INSERT".to_string(),
                count: 1,
                total_record_length: b,
                total_main_data_length: 0,
                total_fpi_length: 0,
            }];
            let one = merge_breakdowns(&lhs, &rhs);
            let two = merge_breakdowns(&rhs, &lhs);
            prop_assert_eq!(one, two);
        }
    }
}
