use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { start_step: u64, max_steps: u64 },
    Status {
        step: u64,
        total_steps: u64,
        loss: f64,
        learning_rate: f64,
        sec_per_batch: f64,
        examples_per_sec: f64,
    },
    Metrics { step: u64, values: Vec<(String, f64)> },
    SummaryWritten { step: u64 },
    EvaluationStarted { step: u64 },
    Evaluated { step: u64, scalars: Vec<(String, f64)>, images: Vec<String> },
    Checkpointed { step: u64, path: PathBuf },
    Interrupted { step: u64 },
    Finished { last_step: u64 },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Renders progress through `tracing`, so it reaches the console and `output.log`.
#[derive(Debug, Clone)]
pub struct TracingProgressSink {
    step_str: String,
}

impl TracingProgressSink {
    pub fn new(step_str: impl Into<String>) -> Self {
        Self { step_str: step_str.into() }
    }
}

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Started { start_step, max_steps } => {
                info!("Start training at step {start_step} of {max_steps}");
            }
            ProgressEvent::Status { .. } => info!("{}", format_status(&self.step_str, event)),
            ProgressEvent::Metrics { values, .. } => {
                if !values.is_empty() {
                    info!("{}", format_metrics(values));
                }
            }
            ProgressEvent::SummaryWritten { .. } => {}
            ProgressEvent::EvaluationStarted { .. } => info!("Running evaluation."),
            ProgressEvent::Evaluated { scalars, .. } => {
                for (name, value) in scalars {
                    info!("    {name}: {value:.4}");
                }
            }
            ProgressEvent::Checkpointed { step, path } => {
                info!(step, "Saved checkpoint {}", path.display());
            }
            ProgressEvent::Interrupted { step } => info!("Training interrupted before step {step}"),
            ProgressEvent::Finished { last_step } => info!("Training finished at step {last_step}"),
        }
    }
}

/// `"    loss: 0.12, mae: 0.30"`.
#[must_use]
pub fn format_metrics(values: &[(String, f64)]) -> String {
    let parts: Vec<String> = values.iter().map(|(name, v)| format!("{name}: {v:.2}")).collect();
    format!("    {}", parts.join(", "))
}

/// Fill a status template from a [`ProgressEvent::Status`].
///
/// Placeholders are `{name}`, `{name:.N}` and `{name:.Ne}`; unknown names are kept
/// verbatim. Other events render the template unchanged.
#[must_use]
pub fn format_status(template: &str, event: &ProgressEvent) -> String {
    let ProgressEvent::Status { step, total_steps, loss, learning_rate, sec_per_batch, examples_per_sec } =
        *event
    else {
        return template.to_string();
    };

    #[allow(clippy::cast_precision_loss)]
    let lookup = |name: &str| -> Option<f64> {
        match name {
            "step" => Some(step as f64),
            "total_steps" => Some(total_steps as f64),
            "loss_value" => Some(loss),
            "lr_value" => Some(learning_rate),
            "sec_per_batch" => Some(sec_per_batch),
            "examples_per_sec" => Some(examples_per_sec),
            _ => None,
        }
    };

    let mut out = String::with_capacity(template.len() + 32);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let Some(close) = rest[open..].find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let field = &rest[open + 1..open + close];
        match render_field(field, &lookup) {
            Some(rendered) => out.push_str(&rendered),
            None => out.push_str(&rest[open..=open + close]),
        }
        rest = &rest[open + close + 1..];
    }
    out.push_str(rest);
    out
}

fn render_field(field: &str, lookup: &impl Fn(&str) -> Option<f64>) -> Option<String> {
    let (name, spec) = field.split_once(':').map_or((field, None), |(n, s)| (n, Some(s)));
    let value = lookup(name)?;
    let Some(spec) = spec else {
        return Some(if value.fract() == 0.0 && value.abs() < 1e15 {
            format!("{value:.0}")
        } else {
            format!("{value}")
        });
    };

    let precision = spec.strip_prefix('.')?;
    if let Some(digits) = precision.strip_suffix('e') {
        let digits: usize = digits.parse().ok()?;
        Some(format_exp(value, digits))
    } else {
        let digits: usize = precision.parse().ok()?;
        Some(format!("{value:.digits$}"))
    }
}

/// Exponent notation with a signed two-digit exponent, `1.00e-03`.
fn format_exp(value: f64, digits: usize) -> String {
    let raw = format!("{value:.digits$e}");
    let Some((mantissa, exponent)) = raw.split_once('e') else {
        return raw;
    };
    let (sign, magnitude) = exponent.strip_prefix('-').map_or(("+", exponent), |m| ("-", m));
    format!("{mantissa}e{sign}{magnitude:0>2}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::DEFAULT_STEP_STR;

    fn status() -> ProgressEvent {
        ProgressEvent::Status {
            step: 5,
            total_steps: 10,
            loss: 0.126,
            learning_rate: 0.001,
            sec_per_batch: 0.0123,
            examples_per_sec: 650.4,
        }
    }

    #[test]
    fn test_default_status_line() {
        assert_eq!(
            format_status(DEFAULT_STEP_STR, &status()),
            "Step 5/10: loss = 0.13; lr = 1.00e-03; 0.012 sec (per Batch); 650.4 imgs/sec"
        );
    }

    #[test]
    fn test_unknown_placeholder_kept() {
        assert_eq!(format_status("{step} {nope} {", &status()), "5 {nope} {");
    }

    #[test]
    fn test_metric_line() {
        let values = vec![("mae".to_string(), 0.304), ("rmse".to_string(), 1.0)];
        assert_eq!(format_metrics(&values), "    mae: 0.30, rmse: 1.00");
    }

    #[test]
    fn test_exponent_formatting() {
        assert_eq!(format_exp(12345.0, 1), "1.2e+04");
        assert_eq!(format_exp(0.05, 2), "5.00e-02");
    }
}
