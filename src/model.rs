// 📋 Data Model - Person registry, applications, issuances, batches
//
// Persons are canonical registry entities, created only by the commit
// engine and never deleted. Applications are one row per ingested record,
// mutated by the pipeline stages and retained for audit. Issuances are
// immutable grants owned by a Person. Batches group one atomic commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// SYSTEM FLAGS
// ============================================================================

/// Machine-readable review signals attached to an application.
/// Flags are signals, not errors: a flagged record routes to human review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemFlag {
    /// Normalized phone collides with a person or an earlier application
    PhoneDup,

    /// Normalized national ID collides with a person or an earlier application
    IdDup,

    /// Exact-identity match already has issuance history
    PriorIssuance,

    /// Name similarity score >= HIGH tier threshold
    NameSimHigh,

    /// Name similarity score in the MEDIUM tier, gate conditions met
    NameSimMedium,

    /// Applicant answered yes to "Have you received before?"
    SelfReportedPriorReceipt,

    /// Committed despite unresolved signals, on admin authority
    AdminOverride,
}

impl SystemFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemFlag::PhoneDup => "PHONE_DUP",
            SystemFlag::IdDup => "ID_DUP",
            SystemFlag::PriorIssuance => "PRIOR_ISSUANCE",
            SystemFlag::NameSimHigh => "NAME_SIM_HIGH",
            SystemFlag::NameSimMedium => "NAME_SIM_MEDIUM",
            SystemFlag::SelfReportedPriorReceipt => "SELF_REPORTED_PRIOR_RECEIPT",
            SystemFlag::AdminOverride => "ADMIN_OVERRIDE",
        }
    }

    pub fn parse(s: &str) -> Option<SystemFlag> {
        match s {
            "PHONE_DUP" => Some(SystemFlag::PhoneDup),
            "ID_DUP" => Some(SystemFlag::IdDup),
            "PRIOR_ISSUANCE" => Some(SystemFlag::PriorIssuance),
            "NAME_SIM_HIGH" => Some(SystemFlag::NameSimHigh),
            "NAME_SIM_MEDIUM" => Some(SystemFlag::NameSimMedium),
            "SELF_REPORTED_PRIOR_RECEIPT" => Some(SystemFlag::SelfReportedPriorReceipt),
            "ADMIN_OVERRIDE" => Some(SystemFlag::AdminOverride),
            _ => None,
        }
    }
}

/// Join a flag set for storage ("PHONE_DUP;NAME_SIM_HIGH").
pub fn flags_to_string(flags: &[SystemFlag]) -> String {
    flags
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(";")
}

/// Parse a stored flag string; unknown tokens are dropped.
pub fn flags_from_string(s: &str) -> Vec<SystemFlag> {
    s.split(';')
        .filter_map(|t| SystemFlag::parse(t.trim()))
        .collect()
}

// ============================================================================
// APPLICATION STATUS
// ============================================================================

/// Closed status set for the stage state machine. Legal transitions are
/// enforced by a single table in `stage::transition_allowed`; nothing else
/// moves a record between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplicationStatus {
    /// Initial state at ingestion
    Pending,

    /// Stage 1 completeness failure - correct and re-submit
    NeedsFollowUp,

    /// Stage 1 policy failure - terminal
    AutoRejected,

    /// Stage 2 produced at least one flag - awaiting admin decision
    Held,

    /// Stage 2 clean - eligible for direct batch commit
    ApprovedReady,

    /// Admin approved and re-check passed
    Approved,

    /// Admin override with justification - committed despite flags
    ApprovedException,

    /// Admin rejected - terminal
    Rejected,

    /// Admin escalated for follow-up - terminal for commit purposes
    FollowUp,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Pending => "PENDING",
            ApplicationStatus::NeedsFollowUp => "NEEDS_FOLLOW_UP",
            ApplicationStatus::AutoRejected => "AUTO_REJECTED",
            ApplicationStatus::Held => "HELD",
            ApplicationStatus::ApprovedReady => "APPROVED_READY",
            ApplicationStatus::Approved => "APPROVED",
            ApplicationStatus::ApprovedException => "APPROVED_EXCEPTION",
            ApplicationStatus::Rejected => "REJECTED",
            ApplicationStatus::FollowUp => "FOLLOW_UP",
        }
    }

    pub fn parse(s: &str) -> Option<ApplicationStatus> {
        match s {
            "PENDING" => Some(ApplicationStatus::Pending),
            "NEEDS_FOLLOW_UP" => Some(ApplicationStatus::NeedsFollowUp),
            "AUTO_REJECTED" => Some(ApplicationStatus::AutoRejected),
            "HELD" => Some(ApplicationStatus::Held),
            "APPROVED_READY" => Some(ApplicationStatus::ApprovedReady),
            "APPROVED" => Some(ApplicationStatus::Approved),
            "APPROVED_EXCEPTION" => Some(ApplicationStatus::ApprovedException),
            "REJECTED" => Some(ApplicationStatus::Rejected),
            "FOLLOW_UP" => Some(ApplicationStatus::FollowUp),
            _ => None,
        }
    }

    /// Statuses the commit engine will pick up.
    pub fn is_committable(&self) -> bool {
        matches!(
            self,
            ApplicationStatus::ApprovedReady
                | ApplicationStatus::Approved
                | ApplicationStatus::ApprovedException
        )
    }
}

// ============================================================================
// PERSON
// ============================================================================

/// Canonical registry entity. Normalized phone and national ID are each
/// globally unique (enforced by the store; None never collides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    pub person_id: i64,
    pub first_name: String,
    pub middle_name: String,
    pub last_name: String,
    pub full_name_original: String,
    pub full_name_normalized: String,
    pub name_key: String,
    pub phone_original: String,
    pub phone_normalized: Option<String>,
    pub national_id_original: String,
    pub national_id_normalized: Option<String>,
    pub country: String,
    pub church_name: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// SIMILARITY CANDIDATES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimilarityTier {
    /// Always a candidate duplicate, regardless of other fields
    High,

    /// Candidate only when country, last name, and middle name corroborate
    Medium,
}

/// A registry person whose name score met a flagging threshold. All
/// candidates at/above threshold are retained for admin review, not just
/// the top match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub person_id: i64,
    pub score: u8,
    pub tier: SimilarityTier,
    pub full_name_normalized: String,
    pub country: String,
    pub phone_normalized: Option<String>,
    pub national_id_normalized: Option<String>,
    pub church_name: String,
}

// ============================================================================
// APPLICATION
// ============================================================================

/// One ingested record. Raw fields are kept verbatim for audit; normalized
/// fields drive every comparison. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub application_id: i64,
    pub submitted_at: DateTime<Utc>,
    pub source_file: String,

    // Raw input fields
    pub full_name_original: String,
    pub phone_original: String,
    pub national_id_original: String,
    pub country: String,
    pub church_name: String,
    pub title: String,
    pub congregation_size_raw: String,
    pub requested_language: String,
    pub received_before: String,
    pub received_before_reason: String,

    // Normalized fields
    pub first_name: String,
    pub middle_name: String,
    pub last_name: String,
    pub full_name_normalized: String,
    pub name_key: String,
    pub phone_normalized: Option<String>,
    pub national_id_normalized: Option<String>,

    // Stage 1 verdict
    pub is_disqualified: bool,
    pub disqualify_reason: String,

    // Review routing
    pub needs_review: bool,
    pub system_flags: Vec<SystemFlag>,
    pub status: ApplicationStatus,
    pub matched_person_id: Option<i64>,
    /// Candidate matches as of the Stage 2 scan, kept for audit
    pub candidates: Vec<Candidate>,
    pub admin_notes: String,
    pub override_reason: String,

    /// Set exactly once, by the commit that persisted this record
    pub batch_id: Option<String>,
}

impl Application {
    /// Deduplication hash over the raw identity fields plus source file,
    /// so re-ingesting the same upload never duplicates rows.
    /// NOTE: deduplication, not identity - identity is application_id.
    pub fn compute_idempotency_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}",
            self.full_name_original, self.phone_original, self.national_id_original,
            self.source_file
        ));
        format!("{:x}", hasher.finalize())
    }

    pub fn add_flag(&mut self, flag: SystemFlag) {
        if !self.system_flags.contains(&flag) {
            self.system_flags.push(flag);
        }
    }

    pub fn has_flag(&self, flag: SystemFlag) -> bool {
        self.system_flags.contains(&flag)
    }
}

// ============================================================================
// ISSUANCE
// ============================================================================

/// A historical grant of the resource to a Person. Immutable once created;
/// exclusively owned by its Person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issuance {
    pub issuance_id: i64,
    pub person_id: i64,
    pub issued_at: String,
    pub book_name: String,
    pub language: String,
    pub issued_by: String,
    pub notes: String,
    pub is_exception: bool,
    pub exception_type: String,
    pub exception_reason: String,
    pub batch_id: String,
}

// ============================================================================
// BATCH
// ============================================================================

/// One atomic unit of commit. Created exactly once per successful commit
/// engine run; immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    pub source_label: String,
    pub source_files: String,
    pub notes: String,
}

impl Batch {
    /// New batch with a short unique identifier (first segment of a UUIDv4).
    pub fn new(source_label: &str, source_files: &str, notes: &str) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Batch {
            batch_id: id[..8].to_string(),
            created_at: Utc::now(),
            source_label: source_label.to_string(),
            source_files: source_files.to_string(),
            notes: notes.to_string(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
