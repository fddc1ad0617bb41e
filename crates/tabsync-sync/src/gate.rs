//! Validation Gate: fail-closed row-count and match-count checks run before any write.

use serde::Serialize;
use tabsync_core::MergedDataset;
use tracing::{error, info};

use crate::config::{GateConfig, Threshold};
use crate::error::ValidationThresholdError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCheck {
    pub field: String,
    pub threshold: Threshold,
    pub required_rows: usize,
    pub matched_rows: usize,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub total_rows: usize,
    pub min_total_rows: usize,
    pub checks: Vec<MatchCheck>,
    pub passed: bool,
    pub reasons: Vec<String>,
}

pub struct ValidationGate {
    config: GateConfig,
}

impl ValidationGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(&self, merged: &MergedDataset) -> ValidationReport {
        let total_rows = merged.total_rows();
        let mut reasons = Vec::new();
        if total_rows < self.config.min_total_rows {
            reasons.push(format!(
                "total rows {total_rows} below minimum {}",
                self.config.min_total_rows
            ));
        }

        let checks = self
            .config
            .matched
            .iter()
            .map(|threshold| {
                let required_rows = threshold.minimum.required_rows(total_rows);
                let matched_rows = merged.populated(&threshold.field);
                let passed = matched_rows >= required_rows;
                if !passed {
                    reasons.push(format!(
                        "matched `{}` rows {matched_rows} below minimum {required_rows}",
                        threshold.field
                    ));
                }
                MatchCheck {
                    field: threshold.field.clone(),
                    threshold: threshold.minimum,
                    required_rows,
                    matched_rows,
                    passed,
                }
            })
            .collect();

        ValidationReport {
            total_rows,
            min_total_rows: self.config.min_total_rows,
            checks,
            passed: reasons.is_empty(),
            reasons,
        }
    }

    /// Evaluate and log; a failed report becomes an error so the caller halts before writing.
    pub fn check(&self, merged: &MergedDataset) -> Result<ValidationReport, ValidationThresholdError> {
        let report = self.evaluate(merged);
        if report.passed {
            info!(total_rows = report.total_rows, checks = report.checks.len(), "validation gate passed");
            Ok(report)
        } else {
            for reason in &report.reasons {
                error!(%reason, "validation gate failed");
            }
            Err(ValidationThresholdError { report })
        }
    }
}
