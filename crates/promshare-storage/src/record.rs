use chrono::{DateTime, Utc};
use promshare_common::error::{PromshareError, Result};
use promshare_common::types::{AggregateValue, GaugeOp, KindConfig, MetricDescriptor};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub value: f64,
    pub at_millis: i64,
}

/// Durable aggregate for one identity, as stored by every backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggregateRecord {
    Counter {
        value: f64,
    },
    Gauge {
        value: f64,
    },
    /// `buckets[i]` is cumulative; the final slot is the `+Inf` bucket.
    Histogram {
        buckets: Vec<u64>,
        sum: f64,
        count: u64,
    },
    Summary {
        observations: Vec<Observation>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mutation {
    Counter(f64),
    Gauge(GaugeOp, f64),
    Histogram(f64),
    Summary { value: f64, at: DateTime<Utc> },
}

impl AggregateRecord {
    pub fn zero(descriptor: &MetricDescriptor) -> Self {
        match &descriptor.config {
            KindConfig::Counter => Self::Counter { value: 0.0 },
            KindConfig::Gauge => Self::Gauge { value: 0.0 },
            KindConfig::Histogram(config) => Self::Histogram {
                buckets: vec![0; config.buckets.len() + 1],
                sum: 0.0,
                count: 0,
            },
            KindConfig::Summary(_) => Self::Summary {
                observations: Vec::new(),
            },
        }
    }

    /// Applies one mutation in place. The error string explains why the
    /// stored record cannot accept it (written by an incompatible descriptor).
    pub fn apply(
        &mut self,
        descriptor: &MetricDescriptor,
        mutation: Mutation,
    ) -> std::result::Result<(), String> {
        match (self, mutation) {
            (Self::Counter { value }, Mutation::Counter(delta)) => {
                *value += delta;
                Ok(())
            }
            (Self::Gauge { value }, Mutation::Gauge(op, operand)) => {
                match op {
                    GaugeOp::Set => *value = operand,
                    GaugeOp::Increment => *value += operand,
                    GaugeOp::Decrement => *value -= operand,
                }
                Ok(())
            }
            (
                Self::Histogram {
                    buckets,
                    sum,
                    count,
                },
                Mutation::Histogram(observed),
            ) => {
                let bounds = descriptor.buckets();
                if buckets.len() != bounds.len() + 1 {
                    return Err(format!(
                        "histogram record has {} buckets, descriptor declares {}",
                        buckets.len(),
                        bounds.len() + 1
                    ));
                }
                for (slot, bound) in buckets.iter_mut().zip(bounds) {
                    if observed <= *bound {
                        *slot += 1;
                    }
                }
                if let Some(inf) = buckets.last_mut() {
                    *inf += 1;
                }
                *sum += observed;
                *count += 1;
                Ok(())
            }
            (Self::Summary { observations }, Mutation::Summary { value, at }) => {
                let max_age_millis = max_age_millis(descriptor)?;
                observations.push(Observation {
                    value,
                    at_millis: at.timestamp_millis(),
                });
                let horizon = at.timestamp_millis() - max_age_millis;
                observations.retain(|observation| observation.at_millis >= horizon);
                Ok(())
            }
            (record, mutation) => Err(format!(
                "record {} cannot accept {mutation:?}",
                record.kind_name()
            )),
        }
    }

    /// Materializes the exposition value as of `now`.
    pub fn to_value(
        &self,
        descriptor: &MetricDescriptor,
        now: DateTime<Utc>,
    ) -> std::result::Result<AggregateValue, String> {
        match (self, &descriptor.config) {
            (Self::Counter { value }, KindConfig::Counter) => Ok(AggregateValue::Counter(*value)),
            (Self::Gauge { value }, KindConfig::Gauge) => Ok(AggregateValue::Gauge(*value)),
            (
                Self::Histogram {
                    buckets,
                    sum,
                    count,
                },
                KindConfig::Histogram(config),
            ) => {
                if buckets.len() != config.buckets.len() + 1 {
                    return Err(format!(
                        "histogram record has {} buckets, descriptor declares {}",
                        buckets.len(),
                        config.buckets.len() + 1
                    ));
                }
                let buckets = config
                    .buckets
                    .iter()
                    .copied()
                    .chain(std::iter::once(f64::INFINITY))
                    .zip(buckets.iter().copied())
                    .collect();
                Ok(AggregateValue::Histogram {
                    buckets,
                    sum: *sum,
                    count: *count,
                })
            }
            (Self::Summary { observations }, KindConfig::Summary(config)) => {
                let horizon = now.timestamp_millis() - max_age_millis(descriptor)?;
                let mut live = observations
                    .iter()
                    .filter(|observation| observation.at_millis >= horizon)
                    .map(|observation| observation.value)
                    .collect::<Vec<_>>();
                live.sort_by(|left, right| left.total_cmp(right));

                let quantiles = config
                    .quantiles
                    .iter()
                    .map(|q| (*q, quantile(&live, *q)))
                    .collect();
                Ok(AggregateValue::Summary {
                    quantiles,
                    sum: live.iter().sum(),
                    count: live.len() as u64,
                })
            }
            (record, _) => Err(format!(
                "record {} does not match {} descriptor",
                record.kind_name(),
                descriptor.kind().as_prometheus_type()
            )),
        }
    }

    pub fn encode(&self, key: &str) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|err| PromshareError::CorruptRecord {
            key: key.to_string(),
            reason: format!("failed to encode aggregate: {err}"),
        })
    }

    pub fn decode(key: &str, raw: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(raw).map_err(|err| PromshareError::CorruptRecord {
            key: key.to_string(),
            reason: format!("failed to decode aggregate: {err}"),
        })
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::Counter { .. } => "counter",
            Self::Gauge { .. } => "gauge",
            Self::Histogram { .. } => "histogram",
            Self::Summary { .. } => "summary",
        }
    }
}

pub fn encode_descriptor(key: &str, descriptor: &MetricDescriptor) -> Result<Vec<u8>> {
    rmp_serde::to_vec(descriptor).map_err(|err| PromshareError::CorruptRecord {
        key: key.to_string(),
        reason: format!("failed to encode descriptor: {err}"),
    })
}

pub fn decode_descriptor(key: &str, raw: &[u8]) -> Result<MetricDescriptor> {
    rmp_serde::from_slice(raw).map_err(|err| PromshareError::CorruptRecord {
        key: key.to_string(),
        reason: format!("failed to decode descriptor: {err}"),
    })
}

/// Nearest-rank quantile over an ascending slice; NaN when empty.
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let rank = sorted.len() as f64 * q;
    let floor = rank.floor();
    let index = if rank == floor {
        (floor as usize).max(1) - 1
    } else {
        floor as usize
    };
    sorted[index.min(sorted.len() - 1)]
}

fn max_age_millis(descriptor: &MetricDescriptor) -> std::result::Result<i64, String> {
    descriptor
        .summary_config()
        .map(|config| {
            i64::try_from(config.max_age_seconds.saturating_mul(1000)).unwrap_or(i64::MAX)
        })
        .ok_or_else(|| "summary record without summary descriptor".to_string())
}
