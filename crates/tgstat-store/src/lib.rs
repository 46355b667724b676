//! Tabular store capability and the merge-reconciler that folds freshly
//! collected records into persisted tables by composite key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use tgstat_core::MERGE_TIMESTAMP_FORMAT;

pub const CRATE_NAME: &str = "tgstat-store";

/// A named table is a header plus string rows; every merge rewrites the
/// whole table (tables here are small by design).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(header: Vec<String>) -> Self {
        Self {
            header,
            rows: Vec::new(),
        }
    }

    pub fn from_header(header: &[&str]) -> Self {
        Self::new(header.iter().map(|s| s.to_string()).collect())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|col| col == name)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("table '{table}' has no column '{column}'")]
    MissingColumn { table: String, column: String },
}

/// What the persistence collaborator must provide: read a named table, or
/// overwrite it wholesale. Tables are auto-created on first write.
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn read_table(&self, name: &str) -> Result<Option<Table>>;
    async fn write_table(&self, name: &str, table: &Table) -> Result<()>;
}

/// File-backed [`TableStore`]: one JSON document per table under a root
/// directory, written atomically via temp-file + rename so a reader never
/// observes a half-written table.
#[derive(Debug, Clone)]
pub struct JsonTableStore {
    root: PathBuf,
}

impl JsonTableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }
}

#[async_trait]
impl TableStore for JsonTableStore {
    async fn read_table(&self, name: &str) -> Result<Option<Table>> {
        let path = self.table_path(name);
        match fs::read(&path).await {
            Ok(bytes) => {
                let table = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing table file {}", path.display()))?;
                Ok(Some(table))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("reading table file {}", path.display()))
            }
        }
    }

    async fn write_table(&self, name: &str, table: &Table) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating store root {}", self.root.display()))?;

        let path = self.table_path(name);
        let temp_path = self.root.join(format!(".{name}.json.tmp"));
        let bytes = serde_json::to_vec(table).context("serializing table")?;

        fs::write(&temp_path, &bytes)
            .await
            .with_context(|| format!("writing temp table file {}", temp_path.display()))?;
        fs::rename(&temp_path, &path)
            .await
            .with_context(|| format!("renaming {} -> {}", temp_path.display(), path.display()))?;
        debug!(table = name, rows = table.rows.len(), "table written");
        Ok(())
    }
}

/// How new rows reconcile against what is already persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Insert-or-replace by composite key, keeping the row with the latest
    /// timestamp; new rows win ties.
    KeyedUpsert,
    /// Ignore the existing table; keep only the newest new row per key.
    /// For "current state" datasets where stale rows must not accumulate.
    LatestSnapshotReplace,
}

/// Per-dataset merge configuration.
#[derive(Debug, Clone, Copy)]
pub struct DatasetSpec {
    pub name: &'static str,
    pub key_columns: &'static [&'static str],
    pub timestamp_column: &'static str,
    /// Columns normalized to `YYYY-MM-DD HH:MM:SS` before comparison/write.
    pub datetime_columns: &'static [&'static str],
    pub policy: MergePolicy,
}

/// Current channel state, one row per channel.
pub const CHANNELS_DAILY: DatasetSpec = DatasetSpec {
    name: "channels_daily",
    key_columns: &["channel_id"],
    timestamp_column: "processed_at",
    datetime_columns: &["processed_at"],
    policy: MergePolicy::LatestSnapshotReplace,
};

/// Per-word index over channel messages.
pub const CHANNEL_WORDS: DatasetSpec = DatasetSpec {
    name: "channel_words",
    key_columns: &["channel_id", "message_id", "word"],
    timestamp_column: "processed_at",
    datetime_columns: &["date", "processed_at"],
    policy: MergePolicy::KeyedUpsert,
};

/// Topic activity bucketed by hour. Bucket rows REPLACE on key collision:
/// a newer run re-aggregates overlapping hours from scratch, so adding
/// counts instead of replacing them would double-count the overlap window.
pub const TOPIC_HOURLY: DatasetSpec = DatasetSpec {
    name: "topic_hourly",
    key_columns: &["chat_id", "topic_id", "hour"],
    timestamp_column: "processed_at",
    datetime_columns: &["processed_at"],
    policy: MergePolicy::KeyedUpsert,
};

/// Bring a timestamp value into the single wire format so key/timestamp
/// comparisons are plain string comparisons. Unparseable values pass
/// through unchanged.
pub fn normalize_datetime(value: &str) -> String {
    if NaiveDateTime::parse_from_str(value, MERGE_TIMESTAMP_FORMAT).is_ok() {
        return value.to_string();
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return parsed.naive_local().format(MERGE_TIMESTAMP_FORMAT).to_string();
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return parsed.format(MERGE_TIMESTAMP_FORMAT).to_string();
    }
    value.to_string()
}

/// Reconciles collected records into persisted tables. Store I/O failures
/// propagate; a failed merge never leaves a partially written table behind
/// (writes are atomic at the store level).
pub struct MergeReconciler<S: TableStore> {
    store: S,
}

impl<S: TableStore> MergeReconciler<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Merge `new` into the dataset's persisted table under its policy.
    /// An empty `new` is a no-op, not an error.
    pub async fn merge(&self, spec: &DatasetSpec, new: Table) -> Result<()> {
        if new.is_empty() {
            warn!(dataset = spec.name, "no rows to merge, skipping write");
            return Ok(());
        }
        info!(dataset = spec.name, incoming = new.rows.len(), "starting merge");

        let mut new = new;
        normalize_table_datetimes(spec, &mut new);

        let combined = match spec.policy {
            MergePolicy::LatestSnapshotReplace => new,
            MergePolicy::KeyedUpsert => {
                let existing = self.store.read_table(spec.name).await?;
                match existing {
                    Some(mut existing) if existing.header == new.header => {
                        normalize_table_datetimes(spec, &mut existing);
                        existing.rows.extend(new.rows);
                        existing
                    }
                    Some(existing) if !existing.is_empty() => {
                        warn!(
                            dataset = spec.name,
                            "existing header differs from incoming, replacing table"
                        );
                        new
                    }
                    _ => new,
                }
            }
        };

        let merged = dedupe_latest_by_key(spec, combined)?;
        info!(dataset = spec.name, rows = merged.rows.len(), "merge complete");
        self.store.write_table(spec.name, &merged).await
    }

    /// Numeric maximum of `column` over rows matching every `(column, value)`
    /// filter pair. `None` when the table is absent, the filtered set is
    /// empty, or nothing in the column parses as an id.
    pub async fn last_known_max(
        &self,
        spec: &DatasetSpec,
        filters: &[(&str, &str)],
        column: &str,
    ) -> Result<Option<i64>> {
        let Some(table) = self.store.read_table(spec.name).await? else {
            return Ok(None);
        };
        let Some(value_idx) = table.column_index(column) else {
            warn!(dataset = spec.name, column, "column missing, treating as no history");
            return Ok(None);
        };
        let mut filter_indices = Vec::with_capacity(filters.len());
        for (name, value) in filters {
            let Some(idx) = table.column_index(name) else {
                warn!(dataset = spec.name, column = name, "filter column missing");
                return Ok(None);
            };
            filter_indices.push((idx, *value));
        }

        let max = table
            .rows
            .iter()
            .filter(|row| {
                filter_indices
                    .iter()
                    .all(|(idx, value)| row.get(*idx).map(String::as_str) == Some(*value))
            })
            .filter_map(|row| row.get(value_idx)?.parse::<i64>().ok())
            .max();
        Ok(max)
    }
}

fn normalize_table_datetimes(spec: &DatasetSpec, table: &mut Table) {
    let indices: Vec<usize> = spec
        .datetime_columns
        .iter()
        .filter_map(|col| table.column_index(col))
        .collect();
    for row in &mut table.rows {
        for &idx in &indices {
            if let Some(cell) = row.get_mut(idx) {
                *cell = normalize_datetime(cell);
            }
        }
    }
}

/// Keep at most one row per key-tuple: the one with the latest timestamp,
/// later rows winning ties. First-seen key order is preserved.
fn dedupe_latest_by_key(spec: &DatasetSpec, table: Table) -> Result<Table> {
    let key_indices: Vec<usize> = spec
        .key_columns
        .iter()
        .map(|col| {
            table.column_index(col).ok_or_else(|| TableError::MissingColumn {
                table: spec.name.to_string(),
                column: col.to_string(),
            })
        })
        .collect::<Result<_, _>>()?;
    let ts_idx = table
        .column_index(spec.timestamp_column)
        .ok_or_else(|| TableError::MissingColumn {
            table: spec.name.to_string(),
            column: spec.timestamp_column.to_string(),
        })?;

    let mut positions: HashMap<Vec<String>, usize> = HashMap::new();
    let mut kept: Vec<Vec<String>> = Vec::new();
    for row in table.rows {
        let key: Vec<String> = key_indices
            .iter()
            .map(|&idx| row.get(idx).cloned().unwrap_or_default())
            .collect();
        match positions.get(&key) {
            Some(&pos) => {
                let current_ts = kept[pos].get(ts_idx).cloned().unwrap_or_default();
                let candidate_ts = row.get(ts_idx).cloned().unwrap_or_default();
                // Normalized timestamps compare lexicographically; >= lets
                // the later (newer-run) row win ties.
                if candidate_ts >= current_ts {
                    kept[pos] = row;
                }
            }
            None => {
                positions.insert(key, kept.len());
                kept.push(row);
            }
        }
    }

    Ok(Table {
        header: table.header,
        rows: kept,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn words_table(rows: Vec<Vec<&str>>) -> Table {
        Table {
            header: vec![
                "channel_id".into(),
                "message_id".into(),
                "word".into(),
                "date".into(),
                "processed_at".into(),
            ],
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(String::from).collect())
                .collect(),
        }
    }

    fn channels_table(rows: Vec<Vec<&str>>) -> Table {
        Table {
            header: vec![
                "channel_id".into(),
                "channel_name".into(),
                "member_count".into(),
                "message_count".into(),
                "last_message_id".into(),
                "processed_at".into(),
            ],
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(String::from).collect())
                .collect(),
        }
    }

    fn topics_table(rows: Vec<Vec<&str>>) -> Table {
        Table {
            header: vec![
                "chat_id".into(),
                "topic_id".into(),
                "hour".into(),
                "chat_name".into(),
                "topic_name".into(),
                "message_count".into(),
                "first_message_id".into(),
                "last_message_id".into(),
                "processed_at".into(),
            ],
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(String::from).collect())
                .collect(),
        }
    }

    #[test]
    fn datetime_normalization_accepts_common_shapes() {
        assert_eq!(
            normalize_datetime("2026-03-01T10:15:00"),
            "2026-03-01 10:15:00"
        );
        assert_eq!(
            normalize_datetime("2026-03-01T10:15:00+03:00"),
            "2026-03-01 10:15:00"
        );
        assert_eq!(
            normalize_datetime("2026-03-01 10:15:00"),
            "2026-03-01 10:15:00"
        );
        assert_eq!(normalize_datetime("not a date"), "not a date");
    }

    #[tokio::test]
    async fn json_store_round_trips_and_reports_absent_tables() {
        let dir = tempdir().unwrap();
        let store = JsonTableStore::new(dir.path());

        assert!(store.read_table("missing").await.unwrap().is_none());

        let table = words_table(vec![vec![
            "t.me/**an",
            "500",
            "release",
            "2026-03-01 10:15:00",
            "2026-03-01 12:00:00",
        ]]);
        store.write_table("channel_words", &table).await.unwrap();
        let read = store.read_table("channel_words").await.unwrap().unwrap();
        assert_eq!(read, table);
    }

    #[tokio::test]
    async fn empty_new_records_is_a_no_op() {
        let dir = tempdir().unwrap();
        let reconciler = MergeReconciler::new(JsonTableStore::new(dir.path()));

        reconciler
            .merge(&CHANNEL_WORDS, words_table(vec![]))
            .await
            .unwrap();
        assert!(reconciler
            .store()
            .read_table("channel_words")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn merge_is_idempotent() {
        let dir = tempdir().unwrap();
        let reconciler = MergeReconciler::new(JsonTableStore::new(dir.path()));
        let rows = vec![
            vec!["t.me/**an", "500", "release", "2026-03-01 10:15:00", "2026-03-01 12:00:00"],
            vec!["t.me/**an", "501", "notes", "2026-03-01 10:20:00", "2026-03-01 12:00:00"],
        ];

        reconciler
            .merge(&CHANNEL_WORDS, words_table(rows.clone()))
            .await
            .unwrap();
        let once = reconciler
            .store()
            .read_table("channel_words")
            .await
            .unwrap()
            .unwrap();

        reconciler
            .merge(&CHANNEL_WORDS, words_table(rows))
            .await
            .unwrap();
        let twice = reconciler
            .store()
            .read_table("channel_words")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.rows.len(), 2);
    }

    #[tokio::test]
    async fn keyed_upsert_keeps_latest_timestamp_per_key() {
        let dir = tempdir().unwrap();
        let reconciler = MergeReconciler::new(JsonTableStore::new(dir.path()));

        reconciler
            .merge(
                &CHANNEL_WORDS,
                words_table(vec![vec![
                    "t.me/**an",
                    "500",
                    "release",
                    "2026-03-01 10:15:00",
                    "2026-03-01 12:00:00",
                ]]),
            )
            .await
            .unwrap();

        // Same key, newer processed_at, different date value.
        reconciler
            .merge(
                &CHANNEL_WORDS,
                words_table(vec![vec![
                    "t.me/**an",
                    "500",
                    "release",
                    "2026-03-01 10:16:00",
                    "2026-03-01 18:00:00",
                ]]),
            )
            .await
            .unwrap();

        let table = reconciler
            .store()
            .read_table("channel_words")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0][3], "2026-03-01 10:16:00");
        assert_eq!(table.rows[0][4], "2026-03-01 18:00:00");
    }

    #[tokio::test]
    async fn latest_snapshot_replace_drops_stale_rows() {
        let dir = tempdir().unwrap();
        let reconciler = MergeReconciler::new(JsonTableStore::new(dir.path()));

        // Pre-existing row for a channel that is absent from the new run.
        reconciler
            .merge(
                &CHANNELS_DAILY,
                channels_table(vec![vec![
                    "t.me/***old",
                    "Old",
                    "10",
                    "5",
                    "100",
                    "2026-02-01 12:00:00",
                ]]),
            )
            .await
            .unwrap();

        // New run: two rows for one channel at t1 < t2.
        reconciler
            .merge(
                &CHANNELS_DAILY,
                channels_table(vec![
                    vec!["t.me/**an", "Chan", "11", "7", "510", "2026-03-01 12:00:00"],
                    vec!["t.me/**an", "Chan", "12", "8", "520", "2026-03-01 18:00:00"],
                ]),
            )
            .await
            .unwrap();

        let table = reconciler
            .store()
            .read_table("channels_daily")
            .await
            .unwrap()
            .unwrap();
        // Current-state dataset: only the newest row of the new run survives.
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0][0], "t.me/**an");
        assert_eq!(table.rows[0][2], "12");
        assert_eq!(table.rows[0][4], "520");
    }

    #[tokio::test]
    async fn bucket_rows_replace_not_accumulate_on_key_collision() {
        let dir = tempdir().unwrap();
        let reconciler = MergeReconciler::new(JsonTableStore::new(dir.path()));
        let hour = "2026-03-01T10:00:00";

        reconciler
            .merge(
                &TOPIC_HOURLY,
                topics_table(vec![vec![
                    "t.me/+**cd", "7", hour, "Forum", "general", "2", "500", "510",
                    "2026-03-01 12:00:00",
                ]]),
            )
            .await
            .unwrap();

        // Overlap re-fetch saw one more message in the same hour.
        reconciler
            .merge(
                &TOPIC_HOURLY,
                topics_table(vec![vec![
                    "t.me/+**cd", "7", hour, "Forum", "general", "3", "500", "512",
                    "2026-03-01 18:00:00",
                ]]),
            )
            .await
            .unwrap();

        let table = reconciler
            .store()
            .read_table("topic_hourly")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(table.rows.len(), 1);
        // Second run's count, not the sum.
        assert_eq!(table.rows[0][5], "3");
        assert_eq!(table.rows[0][7], "512");
    }

    #[tokio::test]
    async fn last_known_max_filters_by_entity() {
        let dir = tempdir().unwrap();
        let reconciler = MergeReconciler::new(JsonTableStore::new(dir.path()));

        assert_eq!(
            reconciler
                .last_known_max(&TOPIC_HOURLY, &[("chat_id", "t.me/+**cd")], "last_message_id")
                .await
                .unwrap(),
            None
        );

        reconciler
            .merge(
                &TOPIC_HOURLY,
                topics_table(vec![
                    vec!["t.me/+**cd", "7", "2026-03-01T10:00:00", "Forum", "general", "2",
                         "500", "510", "2026-03-01 12:00:00"],
                    vec!["t.me/+**cd", "7", "2026-03-01T11:00:00", "Forum", "general", "4",
                         "511", "530", "2026-03-01 12:00:00"],
                    vec!["t.me/+**cd", "9", "2026-03-01T11:00:00", "Forum", "offtopic", "1",
                         "900", "900", "2026-03-01 12:00:00"],
                ]),
            )
            .await
            .unwrap();

        let max = reconciler
            .last_known_max(
                &TOPIC_HOURLY,
                &[("chat_id", "t.me/+**cd"), ("topic_id", "7")],
                "last_message_id",
            )
            .await
            .unwrap();
        assert_eq!(max, Some(530));

        let other = reconciler
            .last_known_max(
                &TOPIC_HOURLY,
                &[("chat_id", "t.me/+**cd"), ("topic_id", "9")],
                "last_message_id",
            )
            .await
            .unwrap();
        assert_eq!(other, Some(900));
    }
}
