use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{PromshareError, Result};

pub const DEFAULT_BUCKETS: [f64; 13] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];
pub const DEFAULT_QUANTILES: [f64; 5] = [0.01, 0.05, 0.5, 0.95, 0.99];
pub const DEFAULT_MAX_AGE_SECONDS: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

impl MetricKind {
    pub fn as_prometheus_type(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::Summary => "summary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramConfig {
    pub buckets: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryConfig {
    pub quantiles: Vec<f64>,
    pub max_age_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KindConfig {
    Counter,
    Gauge,
    Histogram(HistogramConfig),
    Summary(SummaryConfig),
}

/// Static description of a metric. Never mutated after registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    pub namespace: String,
    pub name: String,
    pub help: String,
    pub label_names: Vec<String>,
    pub config: KindConfig,
}

impl MetricDescriptor {
    pub fn counter(namespace: &str, name: &str, help: &str, label_names: &[&str]) -> Result<Self> {
        Self::build(namespace, name, help, label_names, KindConfig::Counter)
    }

    pub fn gauge(namespace: &str, name: &str, help: &str, label_names: &[&str]) -> Result<Self> {
        Self::build(namespace, name, help, label_names, KindConfig::Gauge)
    }

    /// An empty `buckets` slice selects [`DEFAULT_BUCKETS`].
    pub fn histogram(
        namespace: &str,
        name: &str,
        help: &str,
        label_names: &[&str],
        buckets: &[f64],
    ) -> Result<Self> {
        let buckets = if buckets.is_empty() {
            DEFAULT_BUCKETS.to_vec()
        } else {
            buckets.to_vec()
        };
        validate_buckets(&buckets)?;
        Self::build(
            namespace,
            name,
            help,
            label_names,
            KindConfig::Histogram(HistogramConfig { buckets }),
        )
    }

    /// An empty `quantiles` slice selects [`DEFAULT_QUANTILES`].
    pub fn summary(
        namespace: &str,
        name: &str,
        help: &str,
        label_names: &[&str],
        quantiles: &[f64],
        max_age_seconds: u64,
    ) -> Result<Self> {
        let quantiles = if quantiles.is_empty() {
            DEFAULT_QUANTILES.to_vec()
        } else {
            quantiles.to_vec()
        };
        validate_quantiles(&quantiles)?;
        if max_age_seconds == 0 {
            return Err(PromshareError::InvalidArgument(
                "summary max age must be greater than zero".to_string(),
            ));
        }
        Self::build(
            namespace,
            name,
            help,
            label_names,
            KindConfig::Summary(SummaryConfig {
                quantiles,
                max_age_seconds,
            }),
        )
    }

    fn build(
        namespace: &str,
        name: &str,
        help: &str,
        label_names: &[&str],
        config: KindConfig,
    ) -> Result<Self> {
        let descriptor = Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            help: help.to_string(),
            label_names: label_names.iter().map(|label| (*label).to_string()).collect(),
            config,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn validate(&self) -> Result<()> {
        let full_name = self.full_name();
        if !is_valid_metric_name(&full_name) {
            return Err(PromshareError::InvalidArgument(format!(
                "invalid metric name: {full_name:?}"
            )));
        }

        for (index, label) in self.label_names.iter().enumerate() {
            if !is_valid_label_name(label) {
                return Err(PromshareError::InvalidArgument(format!(
                    "invalid label name {label:?} on {full_name}"
                )));
            }
            if self.label_names[..index].contains(label) {
                return Err(PromshareError::InvalidArgument(format!(
                    "duplicate label name {label:?} on {full_name}"
                )));
            }
        }

        let reserved = match self.kind() {
            MetricKind::Histogram => Some("le"),
            MetricKind::Summary => Some("quantile"),
            MetricKind::Counter | MetricKind::Gauge => None,
        };
        if let Some(reserved) = reserved
            && self.label_names.iter().any(|label| label == reserved)
        {
            return Err(PromshareError::InvalidArgument(format!(
                "{} {full_name} cannot use reserved label {reserved:?}",
                self.kind().as_prometheus_type()
            )));
        }

        Ok(())
    }

    pub fn kind(&self) -> MetricKind {
        match self.config {
            KindConfig::Counter => MetricKind::Counter,
            KindConfig::Gauge => MetricKind::Gauge,
            KindConfig::Histogram(_) => MetricKind::Histogram,
            KindConfig::Summary(_) => MetricKind::Summary,
        }
    }

    /// Name used in the exposition output: `namespace_name`, or `name` alone.
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}_{}", self.namespace, self.name)
        }
    }

    pub fn buckets(&self) -> &[f64] {
        match &self.config {
            KindConfig::Histogram(config) => &config.buckets,
            _ => &[],
        }
    }

    pub fn summary_config(&self) -> Option<&SummaryConfig> {
        match &self.config {
            KindConfig::Summary(config) => Some(config),
            _ => None,
        }
    }

    pub fn check_labels(&self, label_values: &[&str]) -> Result<()> {
        if label_values.len() != self.label_names.len() {
            return Err(PromshareError::LabelMismatch {
                metric: self.full_name(),
                expected: self.label_names.len(),
                actual: label_values.len(),
            });
        }
        Ok(())
    }

    pub fn identity(&self, label_values: &[&str]) -> Result<Identity> {
        self.check_labels(label_values)?;
        Ok(Identity {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            label_values: label_values.iter().map(|value| (*value).to_string()).collect(),
        })
    }
}

/// One aggregation target: a metric plus one concrete set of label values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub namespace: String,
    pub name: String,
    pub label_values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GaugeOp {
    Set,
    Increment,
    Decrement,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregateValue {
    Counter(f64),
    Gauge(f64),
    /// `buckets` holds cumulative counts, the last entry bound at `+Inf`.
    Histogram {
        buckets: Vec<(f64, u64)>,
        sum: f64,
        count: u64,
    },
    /// Quantile values are NaN when the live window is empty.
    Summary {
        quantiles: Vec<(f64, f64)>,
        sum: f64,
        count: u64,
    },
}

#[derive(Debug, Clone)]
pub struct CollectedSample {
    pub descriptor: Arc<MetricDescriptor>,
    pub identity: Identity,
    pub value: AggregateValue,
}

pub fn exponential_buckets(start: f64, factor: f64, count: usize) -> Result<Vec<f64>> {
    if !(start > 0.0) || !start.is_finite() {
        return Err(PromshareError::InvalidArgument(
            "exponential buckets need a positive start".to_string(),
        ));
    }
    if !(factor > 1.0) || !factor.is_finite() {
        return Err(PromshareError::InvalidArgument(
            "exponential buckets need a growth factor above 1".to_string(),
        ));
    }
    if count == 0 {
        return Err(PromshareError::InvalidArgument(
            "exponential buckets need at least one bucket".to_string(),
        ));
    }

    let mut buckets = Vec::with_capacity(count);
    let mut bound = start;
    for _ in 0..count {
        buckets.push(bound);
        bound *= factor;
    }
    Ok(buckets)
}

pub fn linear_buckets(start: f64, width: f64, count: usize) -> Result<Vec<f64>> {
    if !(width > 0.0) || !width.is_finite() || !start.is_finite() {
        return Err(PromshareError::InvalidArgument(
            "linear buckets need a finite start and a positive width".to_string(),
        ));
    }
    if count == 0 {
        return Err(PromshareError::InvalidArgument(
            "linear buckets need at least one bucket".to_string(),
        ));
    }
    Ok((0..count).map(|index| start + width * index as f64).collect())
}

fn validate_buckets(buckets: &[f64]) -> Result<()> {
    if buckets.iter().any(|bound| !bound.is_finite()) {
        return Err(PromshareError::InvalidArgument(
            "histogram buckets must be finite".to_string(),
        ));
    }
    if buckets.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(PromshareError::InvalidArgument(
            "histogram buckets must be in strictly increasing order".to_string(),
        ));
    }
    Ok(())
}

fn validate_quantiles(quantiles: &[f64]) -> Result<()> {
    if quantiles.iter().any(|q| !(0.0..=1.0).contains(q)) {
        return Err(PromshareError::InvalidArgument(
            "summary quantiles must be between 0 and 1".to_string(),
        ));
    }
    if quantiles.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(PromshareError::InvalidArgument(
            "summary quantiles must be in strictly increasing order".to_string(),
        ));
    }
    Ok(())
}

fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_' || first == ':')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    !name.starts_with("__")
        && chars
            .next()
            .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
