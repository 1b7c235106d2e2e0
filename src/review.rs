// 📤 Review Export / Decision Import - the admin review interface
//
// HELD applications go out as a grouped CSV: each flagged application is a
// PRIMARY row followed immediately by one MATCH row per candidate, so a
// reviewer sees the comparison without flipping between sheets. Admins fill
// the AdminDecision column on PRIMARY rows and the same file comes back in.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;

use crate::detection::{DuplicateDetector, InFlightIndex};
use crate::model::{ApplicationStatus, SystemFlag};
use crate::stage::{DecisionError, StageController};
use crate::store::Registry;

// ============================================================================
// REVIEW ROWS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowRole {
    #[serde(rename = "PRIMARY")]
    Primary,
    #[serde(rename = "MATCH")]
    Match,
}

/// One row of the grouped review CSV. PRIMARY rows carry the application;
/// MATCH rows carry a registry candidate. The trailing decision columns are
/// left blank for the admin to fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRow {
    #[serde(rename = "GroupID")]
    pub group_id: String,

    #[serde(rename = "RowRole")]
    pub row_role: RowRole,

    #[serde(rename = "ApplicationID")]
    pub application_id: Option<i64>,

    #[serde(rename = "PersonID")]
    pub person_id: Option<i64>,

    #[serde(rename = "Score")]
    pub score: Option<u8>,

    #[serde(rename = "Reason")]
    pub reason: String,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Phone")]
    pub phone: String,

    #[serde(rename = "NationalID")]
    pub national_id: String,

    #[serde(rename = "Country")]
    pub country: String,

    #[serde(rename = "Church")]
    pub church: String,

    #[serde(rename = "PriorIssuance")]
    pub prior_issuance: String,

    #[serde(rename = "AdminDecision")]
    #[serde(default)]
    pub admin_decision: String,

    #[serde(rename = "AdminOverrideReason")]
    #[serde(default)]
    pub admin_override_reason: String,
}

fn flag_reason(flag: SystemFlag) -> &'static str {
    match flag {
        SystemFlag::PhoneDup => "Phone duplicate",
        SystemFlag::IdDup => "National ID duplicate",
        SystemFlag::PriorIssuance => "Prior issuance on file",
        SystemFlag::NameSimHigh => "Name similarity (high)",
        SystemFlag::NameSimMedium => "Name similarity (medium)",
        SystemFlag::SelfReportedPriorReceipt => "Self-reported prior receipt",
        SystemFlag::AdminOverride => "Admin override",
    }
}

fn reasons(flags: &[SystemFlag]) -> String {
    flags
        .iter()
        .map(|f| flag_reason(*f))
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Build the grouped review rows for every HELD application. Candidates
/// are recomputed against the current registry so the export always shows
/// what a reviewer would see today, not what Stage 2 saw at scan time.
pub fn build_review_rows(
    registry: &Registry,
    detector: &DuplicateDetector,
) -> Result<Vec<ReviewRow>> {
    let held = registry.applications_with_status(ApplicationStatus::Held)?;
    let snapshot = registry.snapshot()?;
    let in_flight = InFlightIndex::new();

    let mut rows = Vec::new();
    for app in &held {
        let verdict = detector.check(app, &snapshot, &in_flight);
        let group_id = format!("G{}", app.application_id);

        rows.push(ReviewRow {
            group_id: group_id.clone(),
            row_role: RowRole::Primary,
            application_id: Some(app.application_id),
            person_id: None,
            score: None,
            reason: reasons(&app.system_flags),
            name: app.full_name_normalized.clone(),
            phone: app.phone_normalized.clone().unwrap_or_default(),
            national_id: app.national_id_normalized.clone().unwrap_or_default(),
            country: app.country.clone(),
            church: app.church_name.clone(),
            prior_issuance: verdict.prior_issuance_latest.clone().unwrap_or_default(),
            admin_decision: String::new(),
            admin_override_reason: String::new(),
        });

        for candidate in &verdict.candidates {
            rows.push(ReviewRow {
                group_id: group_id.clone(),
                row_role: RowRole::Match,
                application_id: None,
                person_id: Some(candidate.person_id),
                score: Some(candidate.score),
                reason: String::new(),
                name: candidate.full_name_normalized.clone(),
                phone: candidate.phone_normalized.clone().unwrap_or_default(),
                national_id: candidate
                    .national_id_normalized
                    .clone()
                    .unwrap_or_default(),
                country: candidate.country.clone(),
                church: candidate.church_name.clone(),
                prior_issuance: snapshot
                    .latest_issuance
                    .get(&candidate.person_id)
                    .cloned()
                    .unwrap_or_default(),
                admin_decision: String::new(),
                admin_override_reason: String::new(),
            });
        }
    }
    Ok(rows)
}

pub fn export_review_csv(path: &Path, rows: &[ReviewRow]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create review CSV {:?}", path))?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

// ============================================================================
// DECISION IMPORT
// ============================================================================

/// One decision extracted from a filled-in review CSV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRecord {
    pub application_id: i64,
    pub decision: String,
    pub override_reason: String,
}

/// The columns the importer cares about; everything else in the review
/// CSV is ignored, so admins can re-import the export verbatim.
#[derive(Debug, Deserialize)]
struct RawDecisionRow {
    #[serde(rename = "ApplicationID")]
    #[serde(default)]
    application_id: Option<i64>,

    #[serde(rename = "AdminDecision")]
    #[serde(default)]
    admin_decision: String,

    #[serde(rename = "AdminOverrideReason")]
    #[serde(default)]
    admin_override_reason: String,
}

/// Parse decisions from a review CSV. MATCH rows (no ApplicationID) and
/// PRIMARY rows the admin left undecided are skipped, not errors.
pub fn read_decisions<R: Read>(reader: R) -> Result<Vec<DecisionRecord>> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut decisions = Vec::new();
    for result in rdr.deserialize() {
        let row: RawDecisionRow = result.context("Failed to deserialize decision row")?;
        let application_id = match row.application_id {
            Some(id) => id,
            None => continue,
        };
        let decision = row.admin_decision.trim();
        if decision.is_empty() {
            continue;
        }
        decisions.push(DecisionRecord {
            application_id,
            decision: decision.to_string(),
            override_reason: row.admin_override_reason.trim().to_string(),
        });
    }
    Ok(decisions)
}

pub fn load_decisions(path: &Path) -> Result<Vec<DecisionRecord>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open decision CSV {:?}", path))?;
    read_decisions(file)
}

// ============================================================================
// DECISION APPLICATION
// ============================================================================

/// Per-record outcome of one decision import. A failed row never stops
/// the rest of the import.
#[derive(Debug, Default)]
pub struct DecisionReport {
    pub applied: Vec<(i64, ApplicationStatus)>,
    pub errors: Vec<(i64, DecisionError)>,
}

pub fn apply_decisions(
    controller: &StageController,
    registry: &Registry,
    decisions: &[DecisionRecord],
) -> DecisionReport {
    let mut report = DecisionReport::default();
    for record in decisions {
        match controller.apply_decision(
            registry,
            record.application_id,
            &record.decision,
            &record.override_reason,
        ) {
            Ok(status) => report.applied.push((record.application_id, status)),
            Err(e) => report.errors.push((record.application_id, e)),
        }
    }
    report
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::RawApplicant;
    use crate::store::insert_person_from_application;

    fn raw(name: &str, phone: &str) -> RawApplicant {
        RawApplicant {
            name: name.to_string(),
            phone: phone.to_string(),
            national_id: "".to_string(),
            country: "Kenya".to_string(),
            church_name: "Grace Chapel".to_string(),
            title: "Pastor".to_string(),
            congregation_size: "40".to_string(),
            requested_language: "English".to_string(),
            received_before: "No".to_string(),
            received_before_reason: "".to_string(),
        }
    }

    fn registry_with_held() -> Registry {
        let registry = Registry::open_in_memory().unwrap();
        let existing = raw("Stevie Adams", "0712 000 001").into_application("seed.csv");
        insert_person_from_application(registry.conn(), &existing).unwrap();
        let app = raw("Steve Adams", "0712 000 001").into_application("test.csv");
        registry.insert_applications(&[app]).unwrap();
        StageController::new().process_pending(&registry).unwrap();
        registry
    }

    #[test]
    fn test_grouped_rows_put_primary_before_matches() {
        let registry = registry_with_held();
        let rows = build_review_rows(&registry, &DuplicateDetector::new()).unwrap();

        assert!(rows.len() >= 2);
        assert_eq!(rows[0].row_role, RowRole::Primary);
        assert!(rows[0].application_id.is_some());
        assert!(rows[0].person_id.is_none());
        assert!(rows[0].reason.contains("Phone duplicate"));

        assert_eq!(rows[1].row_role, RowRole::Match);
        assert!(rows[1].application_id.is_none());
        assert_eq!(rows[1].person_id, Some(1));
        assert!(rows[1].score.is_some());
        assert_eq!(rows[1].group_id, rows[0].group_id);
    }

    #[test]
    fn test_no_held_records_means_empty_export() {
        let registry = Registry::open_in_memory().unwrap();
        let app = raw("Steve Adams", "0712 000 001").into_application("test.csv");
        registry.insert_applications(&[app]).unwrap();
        StageController::new().process_pending(&registry).unwrap();

        let rows = build_review_rows(&registry, &DuplicateDetector::new()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_read_decisions_skips_match_and_undecided_rows() {
        let data = "GroupID,RowRole,ApplicationID,PersonID,Score,Reason,Name,Phone,NationalID,Country,Church,PriorIssuance,AdminDecision,AdminOverrideReason\n\
                    G1,PRIMARY,1,,,Phone duplicate,STEVE ADAMS,+254712000001,,KENYA,Grace Chapel,,REJECT,\n\
                    G1,MATCH,,7,92,,STEVIE ADAMS,+254712000001,,KENYA,Grace Chapel,,,\n\
                    G2,PRIMARY,2,,,Name similarity (high),MARY KAMAU,,,KENYA,Grace Chapel,,,\n\
                    G3,PRIMARY,3,,,Phone duplicate,JANE NJERI,,,KENYA,Grace Chapel,,APPROVE_OVERRIDE,verified twins\n";
        let decisions = read_decisions(data.as_bytes()).unwrap();
        assert_eq!(
            decisions,
            vec![
                DecisionRecord {
                    application_id: 1,
                    decision: "REJECT".to_string(),
                    override_reason: "".to_string(),
                },
                DecisionRecord {
                    application_id: 3,
                    decision: "APPROVE_OVERRIDE".to_string(),
                    override_reason: "verified twins".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_apply_decisions_recovers_per_record() {
        let registry = registry_with_held();
        let held = registry
            .applications_with_status(ApplicationStatus::Held)
            .unwrap()
            .remove(0);
        let controller = StageController::new();

        let decisions = vec![
            DecisionRecord {
                application_id: 999,
                decision: "REJECT".to_string(),
                override_reason: "".to_string(),
            },
            DecisionRecord {
                application_id: held.application_id,
                decision: "REJECT".to_string(),
                override_reason: "".to_string(),
            },
        ];
        let report = apply_decisions(&controller, &registry, &decisions);
        assert_eq!(report.applied, vec![(held.application_id, ApplicationStatus::Rejected)]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, 999);
    }
}
