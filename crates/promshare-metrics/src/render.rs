//! Prometheus text exposition format, version 0.0.4.

use promshare_common::types::{AggregateValue, CollectedSample};

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Renders a collected snapshot. Metric groups are ordered by name and
/// samples inside a group by label values, so equal snapshots render to
/// identical bytes.
pub fn render(samples: &[CollectedSample]) -> String {
    let mut ordered = samples.iter().collect::<Vec<_>>();
    ordered.sort_by_cached_key(|sample| {
        (
            sample.descriptor.full_name(),
            sample.identity.label_values.clone(),
        )
    });

    let mut output = String::new();
    let mut current_group: Option<String> = None;

    for sample in ordered {
        let descriptor = &sample.descriptor;
        let name = descriptor.full_name();

        if current_group.as_deref() != Some(name.as_str()) {
            output.push_str("# HELP ");
            output.push_str(&name);
            output.push(' ');
            output.push_str(&escape_help(&descriptor.help));
            output.push('\n');

            output.push_str("# TYPE ");
            output.push_str(&name);
            output.push(' ');
            output.push_str(descriptor.kind().as_prometheus_type());
            output.push('\n');

            current_group = Some(name.clone());
        }

        let labels = descriptor
            .label_names
            .iter()
            .map(String::as_str)
            .zip(sample.identity.label_values.iter().map(String::as_str))
            .collect::<Vec<_>>();

        match &sample.value {
            AggregateValue::Counter(value) | AggregateValue::Gauge(value) => {
                render_sample_line(&mut output, &name, &labels, None, &format_value(*value));
            }
            AggregateValue::Histogram {
                buckets,
                sum,
                count,
            } => {
                let bucket_name = format!("{name}_bucket");
                for (bound, bucket_count) in buckets {
                    render_sample_line(
                        &mut output,
                        &bucket_name,
                        &labels,
                        Some(("le", &format_value(*bound))),
                        &bucket_count.to_string(),
                    );
                }
                render_totals(&mut output, &name, &labels, *sum, *count);
            }
            AggregateValue::Summary {
                quantiles,
                sum,
                count,
            } => {
                for (quantile, value) in quantiles {
                    render_sample_line(
                        &mut output,
                        &name,
                        &labels,
                        Some(("quantile", &format_value(*quantile))),
                        &format_value(*value),
                    );
                }
                render_totals(&mut output, &name, &labels, *sum, *count);
            }
        }
    }

    output
}

fn render_totals(output: &mut String, name: &str, labels: &[(&str, &str)], sum: f64, count: u64) {
    render_sample_line(output, &format!("{name}_sum"), labels, None, &format_value(sum));
    render_sample_line(output, &format!("{name}_count"), labels, None, &count.to_string());
}

fn render_sample_line(
    output: &mut String,
    name: &str,
    labels: &[(&str, &str)],
    extra: Option<(&str, &str)>,
    value: &str,
) {
    output.push_str(name);

    if !labels.is_empty() || extra.is_some() {
        output.push('{');
        for (index, (key, label_value)) in labels.iter().copied().chain(extra).enumerate() {
            if index > 0 {
                output.push(',');
            }
            output.push_str(key);
            output.push_str("=\"");
            output.push_str(&escape_label_value(label_value));
            output.push('"');
        }
        output.push('}');
    }

    output.push(' ');
    output.push_str(value);
    output.push('\n');
}

/// Shortest decimal that parses back to the same `f64`.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

fn escape_help(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use promshare_common::types::{Identity, MetricDescriptor};

    use super::*;

    fn sample(
        descriptor: &Arc<MetricDescriptor>,
        labels: &[&str],
        value: AggregateValue,
    ) -> CollectedSample {
        CollectedSample {
            descriptor: Arc::clone(descriptor),
            identity: Identity {
                namespace: descriptor.namespace.clone(),
                name: descriptor.name.clone(),
                label_values: labels.iter().map(|value| value.to_string()).collect(),
            },
            value,
        }
    }

    #[test]
    fn labelless_gauge_renders_without_braces() {
        let gauge = Arc::new(
            MetricDescriptor::gauge("test", "some_gauge", "this is for testing", &[]).unwrap(),
        );
        let output = render(&[sample(&gauge, &[], AggregateValue::Gauge(123.0))]);
        assert_eq!(
            output,
            "# HELP test_some_gauge this is for testing\n\
             # TYPE test_some_gauge gauge\n\
             test_some_gauge 123\n"
        );
    }

    #[test]
    fn histogram_emits_buckets_sum_and_count() {
        let histogram = Arc::new(
            MetricDescriptor::histogram(
                "app",
                "latency_seconds",
                "Request latency",
                &["route"],
                &[1.0, 2.0, 3.5, 4.0],
            )
            .unwrap(),
        );
        let value = AggregateValue::Histogram {
            buckets: vec![(1.0, 0), (2.0, 1), (3.5, 2), (4.0, 2), (f64::INFINITY, 2)],
            sum: 4.2,
            count: 2,
        };
        let output = render(&[sample(&histogram, &["/"], value)]);
        assert_eq!(
            output,
            "# HELP app_latency_seconds Request latency\n\
             # TYPE app_latency_seconds histogram\n\
             app_latency_seconds_bucket{route=\"/\",le=\"1\"} 0\n\
             app_latency_seconds_bucket{route=\"/\",le=\"2\"} 1\n\
             app_latency_seconds_bucket{route=\"/\",le=\"3.5\"} 2\n\
             app_latency_seconds_bucket{route=\"/\",le=\"4\"} 2\n\
             app_latency_seconds_bucket{route=\"/\",le=\"+Inf\"} 2\n\
             app_latency_seconds_sum{route=\"/\"} 4.2\n\
             app_latency_seconds_count{route=\"/\"} 2\n"
        );
    }

    #[test]
    fn summary_emits_quantiles_and_nan_for_empty_window() {
        let summary = Arc::new(
            MetricDescriptor::summary("", "payload_bytes", "Payload size", &[], &[0.5, 0.99], 600)
                .unwrap(),
        );
        let value = AggregateValue::Summary {
            quantiles: vec![(0.5, f64::NAN), (0.99, f64::NAN)],
            sum: 0.0,
            count: 0,
        };
        let output = render(&[sample(&summary, &[], value)]);
        assert_eq!(
            output,
            "# HELP payload_bytes Payload size\n\
             # TYPE payload_bytes summary\n\
             payload_bytes{quantile=\"0.5\"} NaN\n\
             payload_bytes{quantile=\"0.99\"} NaN\n\
             payload_bytes_sum 0\n\
             payload_bytes_count 0\n"
        );
    }

    #[test]
    fn label_values_and_help_are_escaped() {
        let counter = Arc::new(
            MetricDescriptor::counter("", "events_total", "Events\nwith \\ slashes", &["path"])
                .unwrap(),
        );
        let output = render(&[sample(
            &counter,
            &["C:\\dir \"quoted\"\nnext"],
            AggregateValue::Counter(1.5),
        )]);
        assert_eq!(
            output,
            "# HELP events_total Events\\nwith \\\\ slashes\n\
             # TYPE events_total counter\n\
             events_total{path=\"C:\\\\dir \\\"quoted\\\"\\nnext\"} 1.5\n"
        );
    }

    #[test]
    fn groups_stay_contiguous_and_output_is_stable() {
        let requests = Arc::new(
            MetricDescriptor::counter("", "requests_total", "Requests", &["method"]).unwrap(),
        );
        let workers =
            Arc::new(MetricDescriptor::gauge("", "active_workers", "Workers", &[]).unwrap());
        let snapshot = vec![
            sample(&requests, &["POST"], AggregateValue::Counter(2.0)),
            sample(&workers, &[], AggregateValue::Gauge(-3.25)),
            sample(&requests, &["GET"], AggregateValue::Counter(7.0)),
        ];

        let output = render(&snapshot);
        assert_eq!(
            output,
            "# HELP active_workers Workers\n\
             # TYPE active_workers gauge\n\
             active_workers -3.25\n\
             # HELP requests_total Requests\n\
             # TYPE requests_total counter\n\
             requests_total{method=\"GET\"} 7\n\
             requests_total{method=\"POST\"} 2\n"
        );
        assert_eq!(render(&snapshot), output);
    }

    #[test]
    fn values_use_shortest_round_trip_form() {
        assert_eq!(format_value(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_value(1e-7), "0.0000001");
        assert_eq!(format_value(2.0), "2");
        assert_eq!(format_value(f64::INFINITY), "+Inf");
        assert_eq!(format_value(f64::NEG_INFINITY), "-Inf");
        assert_eq!(format_value(f64::NAN), "NaN");
        assert_eq!(format_value(0.1 + 0.2).parse::<f64>().unwrap(), 0.1 + 0.2);
    }

    #[test]
    fn empty_snapshot_renders_nothing() {
        assert_eq!(render(&[]), "");
    }
}
