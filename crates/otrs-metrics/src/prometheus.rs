//! Prometheus text exposition format.
//!
//! Renders samples into the text format (version 0.0.4) for scraping by a
//! Prometheus server or compatible agent. Each metric family gets one
//! `# HELP` (when known) and one `# TYPE` line, followed by its samples.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::UNIX_EPOCH;

use thiserror::Error;
use tracing::error;

use otrs_core::{MetricKind, Sample};

/// Content type of the rendered body.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Help text for the metric families this exporter produces.
const HELP: &[(&str, &str)] = &[
    ("exporter_build_info", "Exporter build information."),
    ("exporter_start_time_seconds", "Exporter start time since the Unix epoch."),
    ("exporter_render_errors_total", "Samples dropped or scrapes failed during rendering."),
    ("exporter_collector_errors_total", "Failed collection cycles per collector."),
    ("exporter_collector_degraded", "1 if the collector failed too many consecutive cycles."),
    ("exporter_collector_stale", "1 if the collector's last success is missing or too old."),
    ("exporter_collector_duration_seconds", "Duration of the last collection cycle."),
    (
        "exporter_collector_last_success_timestamp_seconds",
        "Time of the last successful collection cycle.",
    ),
    ("exporter_log_rotations_total", "Mail log rotations or truncations detected."),
    ("exporter_log_cursor_bytes", "Current read offset into the mail log."),
    ("mail_fetch_success_total", "Successful mail fetch lines seen in the mail log."),
    ("mail_fetch_failure_total", "Failed mail fetch lines seen in the mail log."),
    ("otrs_service_health", "Service health: 2 ok, 1 degraded, 0 down."),
    ("otrs_service_up", "1 if the service unit is active."),
    ("otrs_queue_open_tickets", "Open tickets per queue."),
    ("otrs_queue_open_ticket_age_seconds", "Average age of open tickets per queue."),
    ("otrs_queue_tickets_created", "Tickets created per queue in the last interval."),
    ("otrs_queue_tickets_closed", "Tickets closed per queue in the last interval."),
];

/// Errors that indicate a broken sample invariant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("invalid metric name {0:?}")]
    InvalidMetricName(String),

    #[error("invalid label name {label:?} on metric {metric}")]
    InvalidLabelName { metric: String, label: String },

    #[error("metric {0} rendered as both gauge and counter")]
    ConflictingKind(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    /// Append each sample's timestamp in milliseconds.
    pub timestamps: bool,
}

/// A rendered body plus the samples that had to be dropped from it.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub body: String,
    pub skipped: Vec<RenderError>,
}

struct Family<'a> {
    kind: MetricKind,
    samples: Vec<&'a Sample>,
}

/// Render samples into Prometheus text format.
///
/// Samples with an invalid metric or label name are skipped and reported in
/// [`Rendered::skipped`]. A family announced with two different kinds cannot
/// be rendered at all and fails the whole call.
pub fn render<'a, I>(samples: I, options: RenderOptions) -> Result<Rendered, RenderError>
where
    I: IntoIterator<Item = &'a Sample>,
{
    let mut families: BTreeMap<&str, Family<'a>> = BTreeMap::new();
    let mut skipped = Vec::new();

    for sample in samples {
        if let Err(e) = check_sample(sample) {
            error!(error = %e, "dropping malformed sample");
            skipped.push(e);
            continue;
        }
        let family = families.entry(sample.name()).or_insert_with(|| Family {
            kind: sample.kind(),
            samples: Vec::new(),
        });
        if family.kind != sample.kind() {
            return Err(RenderError::ConflictingKind(sample.name().to_string()));
        }
        family.samples.push(sample);
    }

    let mut body = String::new();
    for (name, family) in &families {
        if let Some(help) = help_for(name) {
            let _ = writeln!(body, "# HELP {name} {help}");
        }
        let _ = writeln!(body, "# TYPE {name} {}", family.kind);
        for sample in &family.samples {
            write_sample(&mut body, sample, options);
        }
    }

    Ok(Rendered { body, skipped })
}

fn help_for(name: &str) -> Option<&'static str> {
    HELP.iter().find(|(n, _)| *n == name).map(|(_, h)| *h)
}

fn write_sample(out: &mut String, sample: &Sample, options: RenderOptions) {
    out.push_str(sample.name());
    if !sample.labels().is_empty() {
        out.push('{');
        for (i, (key, value)) in sample.labels().iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(key);
            out.push_str("=\"");
            escape_label_value(out, value);
            out.push('"');
        }
        out.push('}');
    }
    out.push(' ');
    out.push_str(&format_value(sample.value()));
    if options.timestamps {
        let millis = sample
            .timestamp()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let _ = write!(out, " {millis}");
    }
    out.push('\n');
}

fn escape_label_value(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
}

fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        format!("{v}")
    }
}

fn check_sample(sample: &Sample) -> Result<(), RenderError> {
    if !is_valid_metric_name(sample.name()) {
        return Err(RenderError::InvalidMetricName(sample.name().to_string()));
    }
    for label in sample.labels().keys() {
        if !is_valid_label_name(label) {
            return Err(RenderError::InvalidLabelName {
                metric: sample.name().to_string(),
                label: label.clone(),
            });
        }
    }
    Ok(())
}

/// `[a-zA-Z_:][a-zA-Z0-9_:]*`
fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// `[a-zA-Z_][a-zA-Z0-9_]*`, with the `__` prefix reserved.
fn is_valid_label_name(name: &str) -> bool {
    if name.starts_with("__") {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
