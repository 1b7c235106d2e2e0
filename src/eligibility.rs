// ✅ Eligibility Validator - Stage 1 of the waterfall
//
// Cheap checks run first: completeness, then policy. Both outcomes are
// recorded on the record (status + reason), never raised, and either one
// stops the record before the registry-wide duplicate scan in Stage 2.

use crate::model::{Application, SystemFlag};

/// Titles eligible for issuance (matched case-insensitively on the
/// normalized title).
pub const ELIGIBLE_TITLES: &[&str] = &["PASTOR", "BISHOP", "EVANGELIST", "BIBLE SCHOOL OVERSEER"];

/// Minimum congregation size for eligibility.
pub const MIN_CONGREGATION_SIZE: i64 = 15;

/// Affirmative answers to "Have you received before?".
const AFFIRMATIVE: &[&str] = &["YES", "Y", "TRUE", "1"];

// ============================================================================
// STAGE 1 OUTCOME
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Stage1Outcome {
    /// Complete and policy-eligible; proceeds to Stage 2
    Eligible,

    /// Required field missing or malformed; record needs correction
    Incomplete { missing: Vec<String> },

    /// Complete but fails eligibility policy; terminal
    Ineligible { reason: String },
}

// ============================================================================
// ELIGIBILITY VALIDATOR
// ============================================================================

pub struct EligibilityValidator {
    pub min_congregation_size: i64,
    pub eligible_titles: Vec<String>,
}

impl EligibilityValidator {
    pub fn new() -> Self {
        EligibilityValidator {
            min_congregation_size: MIN_CONGREGATION_SIZE,
            eligible_titles: ELIGIBLE_TITLES.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Run the ordered Stage 1 checks against a normalized application.
    pub fn check(&self, app: &Application) -> Stage1Outcome {
        // 1. Completeness
        let mut missing = Vec::new();
        if app.title.is_empty() {
            missing.push("Missing Title".to_string());
        }
        if app.requested_language.is_empty() {
            missing.push("Missing Requested Language".to_string());
        }
        let size = match parse_congregation_size(&app.congregation_size_raw) {
            Some(n) => n,
            None => {
                missing.push("Missing/Invalid Congregation Size".to_string());
                0
            }
        };
        if !missing.is_empty() {
            return Stage1Outcome::Incomplete { missing };
        }

        // 2. Policy
        if size < self.min_congregation_size {
            return Stage1Outcome::Ineligible {
                reason: format!("Congregation size < {}", self.min_congregation_size),
            };
        }
        let title = app.title.to_uppercase();
        if !self.eligible_titles.iter().any(|t| *t == title) {
            return Stage1Outcome::Ineligible {
                reason: "Title not eligible".to_string(),
            };
        }

        Stage1Outcome::Eligible
    }

    /// Advisory flags that mark a record for review without changing its
    /// stage outcome.
    pub fn advisory_flags(&self, app: &Application) -> Vec<SystemFlag> {
        let mut flags = Vec::new();
        let answer = app.received_before.trim().to_uppercase();
        if AFFIRMATIVE.contains(&answer.as_str()) {
            flags.push(SystemFlag::SelfReportedPriorReceipt);
        }
        flags
    }
}

impl Default for EligibilityValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Congregation Size must parse as a non-negative integer. Tolerates a
/// trailing ".0" from spreadsheet numeric coercion.
fn parse_congregation_size(raw: &str) -> Option<i64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let s = s.strip_suffix(".0").unwrap_or(s);
    match s.parse::<i64>() {
        Ok(n) if n >= 0 => Some(n),
        _ => None,
    }
}

// ============================================================================
// TESTS
// ============================================================================
