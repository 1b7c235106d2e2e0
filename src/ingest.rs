// 📂 Ingestion - the input record contract
//
// Column headers must match the upload template exactly; the ingestion
// collaborator owns spreadsheet mechanics, we own this CSV contract.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::model::{Application, ApplicationStatus};
use crate::normalize;

// ============================================================================
// RAW APPLICANT ROW
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawApplicant {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Phone")]
    #[serde(default)]
    pub phone: String,

    #[serde(rename = "National ID")]
    #[serde(default)]
    pub national_id: String,

    #[serde(rename = "Country")]
    #[serde(default)]
    pub country: String,

    #[serde(rename = "Church Name")]
    #[serde(default)]
    pub church_name: String,

    #[serde(rename = "Title")]
    #[serde(default)]
    pub title: String,

    #[serde(rename = "Congregation Size")]
    #[serde(default)]
    pub congregation_size: String,

    #[serde(rename = "Requested Language")]
    #[serde(default)]
    pub requested_language: String,

    #[serde(rename = "Have you received before?")]
    #[serde(default)]
    pub received_before: String,

    #[serde(rename = "If yes, reason")]
    #[serde(default)]
    pub received_before_reason: String,
}

impl RawApplicant {
    /// Normalize into an Application in its initial PENDING state.
    pub fn into_application(self, source_file: &str) -> Application {
        let country = normalize::norm_country(&self.country);
        let full_name_normalized = normalize::norm_name(&self.name);
        let (first_name, middle_name, last_name) = normalize::split_name(&full_name_normalized);
        let name_key = normalize::name_key(&full_name_normalized);
        let phone_normalized = normalize::norm_phone(&self.phone, &self.country);
        let national_id_normalized = normalize::norm_id(&self.national_id);

        Application {
            application_id: 0,
            submitted_at: Utc::now(),
            source_file: source_file.to_string(),
            full_name_original: normalize::norm_text(&self.name),
            phone_original: normalize::norm_text(&self.phone),
            national_id_original: normalize::norm_text(&self.national_id),
            country,
            church_name: normalize::norm_text(&self.church_name),
            title: normalize::norm_title(&self.title),
            congregation_size_raw: normalize::norm_text(&self.congregation_size),
            requested_language: normalize::norm_language(&self.requested_language),
            received_before: normalize::norm_text(&self.received_before),
            received_before_reason: normalize::norm_text(&self.received_before_reason),
            first_name,
            middle_name,
            last_name,
            full_name_normalized,
            name_key,
            phone_normalized,
            national_id_normalized,
            is_disqualified: false,
            disqualify_reason: String::new(),
            needs_review: false,
            system_flags: Vec::new(),
            status: ApplicationStatus::Pending,
            matched_person_id: None,
            candidates: Vec::new(),
            admin_notes: String::new(),
            override_reason: String::new(),
            batch_id: None,
        }
    }
}

// ============================================================================
// CSV LOADING
// ============================================================================

/// Load an applicant CSV. Fails on a missing required header or an
/// unreadable row; normalization never fails.
pub fn load_csv(csv_path: &Path) -> Result<Vec<Application>> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open applicant CSV {:?}", csv_path))?;

    let source_file = csv_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| csv_path.display().to_string());

    let mut applications = Vec::new();
    for result in rdr.deserialize() {
        let raw: RawApplicant = result.context("Failed to deserialize applicant row")?;
        applications.push(raw.into_application(&source_file));
    }
    Ok(applications)
}

// ============================================================================
// TESTS
// ============================================================================
