//! Relational adapter: one table per metric kind keyed by the encoded
//! identity, every update a single IMMEDIATE transaction.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use promshare_common::error::{PromshareError, Result};
use promshare_common::time::{Clock, SystemClock};
use promshare_common::types::{CollectedSample, GaugeOp, Identity, MetricDescriptor, MetricKind};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::warn;

use crate::key::{decode_sample_key, encode_sample_key, metric_key};
use crate::record::{AggregateRecord, Mutation, decode_descriptor, encode_descriptor};
use crate::traits::Adapter;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS promshare_metadata (
    metric_key TEXT PRIMARY KEY,
    descriptor BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS promshare_counters (
    sample_key TEXT PRIMARY KEY,
    metric_key TEXT NOT NULL,
    value REAL NOT NULL
);
CREATE TABLE IF NOT EXISTS promshare_gauges (
    sample_key TEXT PRIMARY KEY,
    metric_key TEXT NOT NULL,
    record BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS promshare_histograms (
    sample_key TEXT PRIMARY KEY,
    metric_key TEXT NOT NULL,
    record BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS promshare_summaries (
    sample_key TEXT PRIMARY KEY,
    metric_key TEXT NOT NULL,
    record BLOB NOT NULL
);
"#;

const ALL_TABLES: [&str; 5] = [
    "promshare_metadata",
    "promshare_counters",
    "promshare_gauges",
    "promshare_histograms",
    "promshare_summaries",
];

pub struct SqliteAdapter {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
}

impl SqliteAdapter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(unavailable)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(unavailable)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(unavailable)?;
        conn.execute_batch(SCHEMA).map_err(unavailable)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| {
                PromshareError::InternalError("sqlite connection lock poisoned".to_string())
            })?;
            op(&mut guard)
        })
        .await
        .map_err(|err| PromshareError::InternalError(format!("sqlite task failed: {err}")))?
    }

    async fn mutate(
        &self,
        descriptor: &MetricDescriptor,
        identity: &Identity,
        mutation: Mutation,
    ) -> Result<()> {
        let descriptor = descriptor.clone();
        let sample_key = encode_sample_key(identity);
        self.run(move |conn| apply_mutation(conn, &descriptor, &sample_key, mutation))
            .await
    }
}

fn apply_mutation(
    conn: &mut Connection,
    descriptor: &MetricDescriptor,
    sample_key: &str,
    mutation: Mutation,
) -> Result<()> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(unavailable)?;

    let metric = metric_key(&descriptor.namespace, &descriptor.name);
    tx.execute(
        "INSERT OR IGNORE INTO promshare_metadata (metric_key, descriptor) VALUES (?1, ?2)",
        params![metric, encode_descriptor(&metric, descriptor)?],
    )
    .map_err(unavailable)?;

    match mutation {
        Mutation::Counter(delta) => {
            tx.execute(
                "INSERT INTO promshare_counters (sample_key, metric_key, value) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(sample_key) DO UPDATE SET value = value + excluded.value",
                params![sample_key, metric, delta],
            )
            .map_err(unavailable)?;
        }
        Mutation::Gauge(..) | Mutation::Histogram(_) | Mutation::Summary { .. } => {
            let table = record_table(descriptor.kind());
            let current: Option<Vec<u8>> = tx
                .query_row(
                    &format!("SELECT record FROM {table} WHERE sample_key = ?1"),
                    params![sample_key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(unavailable)?;

            let mut record = match current {
                Some(raw) => AggregateRecord::decode(sample_key, &raw)?,
                None => AggregateRecord::zero(descriptor),
            };
            record
                .apply(descriptor, mutation)
                .map_err(|reason| PromshareError::CorruptRecord {
                    key: sample_key.to_string(),
                    reason,
                })?;

            tx.execute(
                &format!(
                    "INSERT INTO {table} (sample_key, metric_key, record) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(sample_key) DO UPDATE SET record = excluded.record"
                ),
                params![sample_key, metric, record.encode(sample_key)?],
            )
            .map_err(unavailable)?;
        }
    }

    tx.commit().map_err(unavailable)
}

/// Tables holding encoded records. Gauges live here rather than in a REAL
/// column because SQLite stores NaN as NULL.
fn record_table(kind: MetricKind) -> &'static str {
    match kind {
        MetricKind::Gauge => "promshare_gauges",
        MetricKind::Summary => "promshare_summaries",
        MetricKind::Counter | MetricKind::Histogram => "promshare_histograms",
    }
}

struct StoredRow {
    sample_key: String,
    metric_key: String,
    record: Result<AggregateRecord>,
}

fn load_rows(conn: &Connection) -> Result<Vec<StoredRow>> {
    let mut rows = Vec::new();

    let mut stmt = conn
        .prepare("SELECT sample_key, metric_key, value FROM promshare_counters")
        .map_err(unavailable)?;
    let mapped = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })
        .map_err(unavailable)?;
    for row in mapped {
        let (sample_key, metric_key, value) = row.map_err(unavailable)?;
        rows.push(StoredRow {
            sample_key,
            metric_key,
            record: Ok(AggregateRecord::Counter { value }),
        });
    }

    for table in [
        "promshare_gauges",
        "promshare_histograms",
        "promshare_summaries",
    ] {
        let mut stmt = conn
            .prepare(&format!("SELECT sample_key, metric_key, record FROM {table}"))
            .map_err(unavailable)?;
        let mapped = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })
            .map_err(unavailable)?;
        for row in mapped {
            let (sample_key, metric_key, raw) = row.map_err(unavailable)?;
            let record = AggregateRecord::decode(&sample_key, &raw);
            rows.push(StoredRow {
                sample_key,
                metric_key,
                record,
            });
        }
    }

    Ok(rows)
}

fn load_descriptors(conn: &Connection) -> Result<HashMap<String, Arc<MetricDescriptor>>> {
    let mut stmt = conn
        .prepare("SELECT metric_key, descriptor FROM promshare_metadata")
        .map_err(unavailable)?;
    let mapped = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })
        .map_err(unavailable)?;

    let mut descriptors = HashMap::new();
    for row in mapped {
        let (key, raw) = row.map_err(unavailable)?;
        match decode_descriptor(&key, &raw) {
            Ok(descriptor) => {
                descriptors.insert(key, Arc::new(descriptor));
            }
            Err(err) => warn!(key = %key, error = %err, "skipping metric with unreadable metadata"),
        }
    }
    Ok(descriptors)
}

fn collect_samples(conn: &mut Connection, now: DateTime<Utc>) -> Result<Vec<CollectedSample>> {
    // One read transaction so each row is read from a single snapshot.
    let tx = conn.transaction().map_err(unavailable)?;
    let descriptors = load_descriptors(&tx)?;
    let rows = load_rows(&tx)?;
    tx.commit().map_err(unavailable)?;

    let mut samples = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(descriptor) = descriptors.get(&row.metric_key) else {
            continue;
        };
        match materialize(&row, descriptor, now) {
            Ok(sample) => samples.push(sample),
            Err(err) => warn!(key = %row.sample_key, error = %err, "skipping unreadable aggregate"),
        }
    }
    Ok(samples)
}

fn materialize(
    row: &StoredRow,
    descriptor: &Arc<MetricDescriptor>,
    now: DateTime<Utc>,
) -> Result<CollectedSample> {
    let corrupt = |reason: String| PromshareError::CorruptRecord {
        key: row.sample_key.clone(),
        reason,
    };
    let identity = decode_sample_key(&row.sample_key)?;
    if identity.label_values.len() != descriptor.label_names.len() {
        return Err(corrupt(format!(
            "key carries {} label values, metric declares {}",
            identity.label_values.len(),
            descriptor.label_names.len()
        )));
    }
    let record = match &row.record {
        Ok(record) => record,
        Err(err) => return Err(corrupt(err.to_string())),
    };
    let value = record.to_value(descriptor, now).map_err(corrupt)?;
    Ok(CollectedSample {
        descriptor: Arc::clone(descriptor),
        identity,
        value,
    })
}

fn unavailable(err: rusqlite::Error) -> PromshareError {
    PromshareError::StorageUnavailable(format!("sqlite: {err}"))
}

#[async_trait]
impl Adapter for SqliteAdapter {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn update_counter(
        &self,
        descriptor: &MetricDescriptor,
        identity: &Identity,
        delta: f64,
    ) -> Result<()> {
        self.mutate(descriptor, identity, Mutation::Counter(delta))
            .await
    }

    async fn update_gauge(
        &self,
        descriptor: &MetricDescriptor,
        identity: &Identity,
        op: GaugeOp,
        value: f64,
    ) -> Result<()> {
        self.mutate(descriptor, identity, Mutation::Gauge(op, value))
            .await
    }

    async fn update_histogram(
        &self,
        descriptor: &MetricDescriptor,
        identity: &Identity,
        observed: f64,
    ) -> Result<()> {
        self.mutate(descriptor, identity, Mutation::Histogram(observed))
            .await
    }

    async fn update_summary(
        &self,
        descriptor: &MetricDescriptor,
        identity: &Identity,
        observed: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.mutate(
            descriptor,
            identity,
            Mutation::Summary {
                value: observed,
                at: now,
            },
        )
        .await
    }

    async fn collect(&self) -> Result<Vec<CollectedSample>> {
        let now = self.now();
        self.run(move |conn| collect_samples(conn, now)).await
    }

    async fn wipe_storage(&self) -> Result<()> {
        self.run(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(unavailable)?;
            for table in ALL_TABLES {
                tx.execute(&format!("DELETE FROM {table}"), [])
                    .map_err(unavailable)?;
            }
            tx.commit().map_err(unavailable)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone};
    use promshare_common::time::ManualClock;
    use promshare_common::types::AggregateValue;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_connections_aggregate_into_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.db");
        let descriptor = Arc::new(
            MetricDescriptor::counter("", "http_requests_total", "Requests", &["method"]).unwrap(),
        );
        let identity = Arc::new(descriptor.identity(&["GET"]).unwrap());

        let mut workers = Vec::new();
        for _ in 0..2 {
            let adapter = SqliteAdapter::open(&path).unwrap();
            let descriptor = descriptor.clone();
            let identity = identity.clone();
            workers.push(tokio::spawn(async move {
                for _ in 0..200 {
                    adapter
                        .update_counter(&descriptor, &identity, 1.0)
                        .await
                        .unwrap();
                }
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        let samples = SqliteAdapter::open(&path).unwrap().collect().await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, AggregateValue::Counter(400.0));
        assert_eq!(samples[0].identity.label_values, vec!["GET"]);
    }

    #[tokio::test]
    async fn gauge_ops_and_histogram_round_trip() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        let gauge = MetricDescriptor::gauge("app", "workers", "Workers", &[]).unwrap();
        let gauge_id = gauge.identity(&[]).unwrap();
        adapter
            .update_gauge(&gauge, &gauge_id, GaugeOp::Decrement, 2.0)
            .await
            .unwrap();
        adapter
            .update_gauge(&gauge, &gauge_id, GaugeOp::Set, 10.0)
            .await
            .unwrap();
        adapter
            .update_gauge(&gauge, &gauge_id, GaugeOp::Increment, 1.5)
            .await
            .unwrap();

        let histogram =
            MetricDescriptor::histogram("app", "latency", "Latency", &[], &[1.0, 2.0, 3.5, 4.0])
                .unwrap();
        let histogram_id = histogram.identity(&[]).unwrap();
        for observed in [3.1, 1.1] {
            adapter
                .update_histogram(&histogram, &histogram_id, observed)
                .await
                .unwrap();
        }

        let samples = adapter.collect().await.unwrap();
        let value = |name: &str| {
            samples
                .iter()
                .find(|sample| sample.identity.name == name)
                .map(|sample| sample.value.clone())
                .unwrap()
        };
        assert_eq!(value("workers"), AggregateValue::Gauge(11.5));
        assert_eq!(
            value("latency"),
            AggregateValue::Histogram {
                buckets: vec![(1.0, 0), (2.0, 1), (3.5, 2), (4.0, 2), (f64::INFINITY, 2)],
                sum: 4.2,
                count: 2,
            }
        );
    }

    #[tokio::test]
    async fn gauge_can_hold_nan() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        let gauge = MetricDescriptor::gauge("app", "headroom", "Headroom", &[]).unwrap();
        let identity = gauge.identity(&[]).unwrap();
        adapter
            .update_gauge(&gauge, &identity, GaugeOp::Increment, f64::INFINITY)
            .await
            .unwrap();
        adapter
            .update_gauge(&gauge, &identity, GaugeOp::Decrement, f64::INFINITY)
            .await
            .unwrap();

        let samples = adapter.collect().await.unwrap();
        let AggregateValue::Gauge(value) = samples[0].value else {
            panic!("expected gauge value");
        };
        assert!(value.is_nan());

        adapter
            .update_gauge(&gauge, &identity, GaugeOp::Set, 3.0)
            .await
            .unwrap();
        let samples = adapter.collect().await.unwrap();
        assert_eq!(samples[0].value, AggregateValue::Gauge(3.0));
    }

    #[tokio::test]
    async fn summary_expires_with_clock() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let adapter = SqliteAdapter::open_in_memory()
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        let descriptor =
            MetricDescriptor::summary("", "payload_bytes", "Payload", &[], &[0.5], 60).unwrap();
        let identity = descriptor.identity(&[]).unwrap();

        adapter
            .update_summary(&descriptor, &identity, 8.0, adapter.now())
            .await
            .unwrap();
        let samples = adapter.collect().await.unwrap();
        assert_eq!(
            samples[0].value,
            AggregateValue::Summary {
                quantiles: vec![(0.5, 8.0)],
                sum: 8.0,
                count: 1,
            }
        );

        clock.advance(ChronoDuration::seconds(61));
        let samples = adapter.collect().await.unwrap();
        let AggregateValue::Summary { sum, count, .. } = samples[0].value else {
            panic!("expected summary value");
        };
        assert_eq!((sum, count), (0.0, 0));
    }

    #[tokio::test]
    async fn corrupt_row_is_skipped_and_wipe_empties_tables() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        let descriptor =
            MetricDescriptor::histogram("", "latency", "Latency", &["route"], &[1.0]).unwrap();
        for route in ["/a", "/b"] {
            adapter
                .update_histogram(&descriptor, &descriptor.identity(&[route]).unwrap(), 0.5)
                .await
                .unwrap();
        }

        let broken = encode_sample_key(&descriptor.identity(&["/b"]).unwrap());
        adapter
            .run(move |conn| {
                conn.execute(
                    "UPDATE promshare_histograms SET record = ?1 WHERE sample_key = ?2",
                    params![b"garbage".to_vec(), broken],
                )
                .map_err(unavailable)?;
                Ok(())
            })
            .await
            .unwrap();

        let samples = adapter.collect().await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].identity.label_values, vec!["/a"]);

        adapter.wipe_storage().await.unwrap();
        assert!(adapter.collect().await.unwrap().is_empty());
    }
}
