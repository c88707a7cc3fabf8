//! Optimistic read-modify-write over a [`CasStore`].
//!
//! The stored bytes double as the version token: an update decodes the
//! current record, applies its mutation in memory and swaps the result in
//! only if the stored bytes are still the ones it read. No lock is ever held
//! in the store, so a crashed writer cannot stall anybody else.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use promshare_common::error::{PromshareError, Result};
use promshare_common::time::{Clock, SystemClock};
use promshare_common::types::{CollectedSample, GaugeOp, Identity, MetricDescriptor};
use rand::Rng;
use tracing::{debug, warn};

use crate::cas::store::CasStore;
use crate::config::CasConfig;
use crate::key::{
    INDEX_KEY, decode_index, decode_sample_key, encode_index, encode_sample_key, metadata_key,
};
use crate::record::{AggregateRecord, Mutation, decode_descriptor, encode_descriptor};
use crate::traits::Adapter;

pub struct CasAdapter {
    store: Arc<dyn CasStore>,
    config: CasConfig,
    clock: Arc<dyn Clock>,
}

impl CasAdapter {
    pub fn new(store: Arc<dyn CasStore>, config: CasConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn attempts(&self) -> u32 {
        self.config.max_retries.saturating_add(1)
    }

    async fn mutate(
        &self,
        descriptor: &MetricDescriptor,
        identity: &Identity,
        mutation: Mutation,
    ) -> Result<()> {
        let key = encode_sample_key(identity);
        let attempts = self.attempts();
        let mut current = self.load_or_create(descriptor, &key).await?;

        for attempt in 1..=attempts {
            let mut record = AggregateRecord::decode(&key, &current)?;
            record
                .apply(descriptor, mutation)
                .map_err(|reason| PromshareError::CorruptRecord {
                    key: key.clone(),
                    reason,
                })?;
            let next = Bytes::from(record.encode(&key)?);

            if self.store.compare_and_swap(&key, &current, next).await? {
                // Metadata may have been flushed or wiped since the record was created.
                return self.publish_descriptor(descriptor).await;
            }
            if attempt == attempts {
                break;
            }

            debug!(key = %key, attempt, "aggregate changed during update, retrying");
            self.backoff().await;
            current = self.load_or_create(descriptor, &key).await?;
        }

        warn!(key = %key, attempts, "aggregate update retries exhausted");
        Err(PromshareError::AggregationContention { key, attempts })
    }

    /// Returns the raw record for `key`, creating the zero record when absent.
    /// The key is indexed before the record exists so that a record can never
    /// be stored without being enumerable.
    async fn load_or_create(&self, descriptor: &MetricDescriptor, key: &str) -> Result<Bytes> {
        let attempts = self.attempts();
        for _ in 0..attempts {
            if let Some(raw) = self.store.get(key).await? {
                return Ok(raw);
            }

            self.index_insert(key).await?;
            self.publish_descriptor(descriptor).await?;

            let zero = Bytes::from(AggregateRecord::zero(descriptor).encode(key)?);
            if self.store.add(key, zero.clone()).await? {
                // A wipe between the insert above and the add drops the key
                // from the index; insert again so the record stays listed.
                self.index_insert(key).await?;
                debug!(key = %key, "created aggregate record");
                return Ok(zero);
            }
            // Lost the creation race; the winner's record is there now.
        }

        Err(PromshareError::AggregationContention {
            key: key.to_string(),
            attempts,
        })
    }

    async fn index_insert(&self, key: &str) -> Result<()> {
        let attempts = self.attempts();
        for attempt in 1..=attempts {
            let stored = match self.store.get(INDEX_KEY).await? {
                None => {
                    let keys = BTreeSet::from([key.to_string()]);
                    self.store
                        .add(INDEX_KEY, Bytes::from(encode_index(&keys)?))
                        .await?
                }
                Some(raw) => {
                    let mut keys = decode_index(&raw).unwrap_or_else(|err| {
                        warn!(error = %err, "replacing unreadable index");
                        BTreeSet::new()
                    });
                    if !keys.insert(key.to_string()) {
                        return Ok(());
                    }
                    self.store
                        .compare_and_swap(INDEX_KEY, &raw, Bytes::from(encode_index(&keys)?))
                        .await?
                }
            };
            if stored {
                return Ok(());
            }

            debug!(key = %key, attempt, "index changed during insert, retrying");
            self.backoff().await;
        }

        warn!(key = %key, attempts, "index insert retries exhausted");
        Err(PromshareError::AggregationContention {
            key: INDEX_KEY.to_string(),
            attempts,
        })
    }

    /// Swaps the index for an empty one and returns the keys it listed. Keys
    /// indexed after the swap survive, so a concurrent creator never loses
    /// its entry.
    async fn take_index(&self) -> Result<BTreeSet<String>> {
        let empty = Bytes::from(encode_index(&BTreeSet::new())?);
        let attempts = self.attempts();
        for attempt in 1..=attempts {
            let Some(raw) = self.store.get(INDEX_KEY).await? else {
                return Ok(BTreeSet::new());
            };
            let keys = decode_index(&raw).unwrap_or_else(|err| {
                warn!(error = %err, "wiping unreadable index");
                BTreeSet::new()
            });
            if self
                .store
                .compare_and_swap(INDEX_KEY, &raw, empty.clone())
                .await?
            {
                return Ok(keys);
            }

            debug!(attempt, "index changed during wipe, retrying");
            self.backoff().await;
        }

        warn!(attempts, "index swap retries exhausted");
        Err(PromshareError::AggregationContention {
            key: INDEX_KEY.to_string(),
            attempts,
        })
    }

    /// First writer wins; later descriptors for the same metric are ignored.
    async fn publish_descriptor(&self, descriptor: &MetricDescriptor) -> Result<()> {
        let key = metadata_key(&descriptor.namespace, &descriptor.name);
        if self.store.get(&key).await?.is_none() {
            let raw = encode_descriptor(&key, descriptor)?;
            self.store.add(&key, Bytes::from(raw)).await?;
        }
        Ok(())
    }

    async fn load_descriptor(&self, key: &str) -> Result<Option<Arc<MetricDescriptor>>> {
        let Some(raw) = self.store.get(key).await? else {
            debug!(key = %key, "indexed metric has no metadata, skipping");
            return Ok(None);
        };
        match decode_descriptor(key, &raw) {
            Ok(descriptor) => Ok(Some(Arc::new(descriptor))),
            Err(err) => {
                warn!(key = %key, error = %err, "skipping metric with unreadable metadata");
                Ok(None)
            }
        }
    }

    async fn backoff(&self) {
        let delay = {
            let min = self.config.min_backoff;
            let max = self.config.max_backoff.max(min);
            if max.is_zero() {
                return;
            }
            let micros = rand::thread_rng().gen_range(min.as_micros()..=max.as_micros());
            Duration::from_micros(u64::try_from(micros).unwrap_or(u64::MAX))
        };
        tokio::time::sleep(delay).await;
    }
}

fn decode_sample(
    key: &str,
    raw: &[u8],
    descriptor: &Arc<MetricDescriptor>,
    identity: Identity,
    now: DateTime<Utc>,
) -> Result<CollectedSample> {
    let corrupt = |reason: String| PromshareError::CorruptRecord {
        key: key.to_string(),
        reason,
    };
    if identity.label_values.len() != descriptor.label_names.len() {
        return Err(corrupt(format!(
            "key carries {} label values, metric declares {}",
            identity.label_values.len(),
            descriptor.label_names.len()
        )));
    }
    let value = AggregateRecord::decode(key, raw)?
        .to_value(descriptor, now)
        .map_err(corrupt)?;
    Ok(CollectedSample {
        descriptor: Arc::clone(descriptor),
        identity,
        value,
    })
}

#[async_trait]
impl Adapter for CasAdapter {
    fn backend_name(&self) -> &'static str {
        "shared"
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
        let Some(raw) = self.store.get(INDEX_KEY).await? else {
            return Ok(Vec::new());
        };
        let keys = match decode_index(&raw) {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "index is unreadable, nothing to collect");
                return Ok(Vec::new());
            }
        };
        let now = self.now();

        let mut descriptors: HashMap<String, Option<Arc<MetricDescriptor>>> = HashMap::new();
        let mut samples = Vec::with_capacity(keys.len());
        for key in keys {
            let identity = match decode_sample_key(&key) {
                Ok(identity) => identity,
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping malformed index entry");
                    continue;
                }
            };

            let meta_key = metadata_key(&identity.namespace, &identity.name);
            let descriptor = match descriptors.get(&meta_key) {
                Some(cached) => cached.clone(),
                None => {
                    let loaded = self.load_descriptor(&meta_key).await?;
                    descriptors.insert(meta_key, loaded.clone());
                    loaded
                }
            };
            let Some(descriptor) = descriptor else {
                continue;
            };

            // Indexed but flushed from the store: treat as absent.
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };

            match decode_sample(&key, &raw, &descriptor, identity, now) {
                Ok(sample) => samples.push(sample),
                Err(err) => warn!(key = %key, error = %err, "skipping unreadable aggregate"),
            }
        }

        Ok(samples)
    }

    async fn wipe_storage(&self) -> Result<()> {
        let keys = self.take_index().await?;

        let mut metadata = BTreeSet::new();
        for key in &keys {
            if let Ok(identity) = decode_sample_key(key) {
                metadata.insert(metadata_key(&identity.namespace, &identity.name));
            }
            self.store.delete(key).await?;
        }
        for key in &metadata {
            self.store.delete(key).await?;
        }

        debug!(samples = keys.len(), "wiped shared storage");
        Ok(())
    }
}
