// 🚦 Stage Controller - the status state machine and waterfall routing
//
// One transition table governs every status change; nothing else moves a
// record. Stage 1/2 outcomes are recorded on the record (never raised).
// Stage 3 decision errors are per-record: one bad row never blocks the
// rest of an import.

use std::fmt;

use crate::detection::{DetectionVerdict, DuplicateDetector, InFlightIndex};
use crate::eligibility::{EligibilityValidator, Stage1Outcome};
use crate::model::{Application, ApplicationStatus, SystemFlag};
use crate::store::Registry;

// ============================================================================
// TRANSITION TABLE
// ============================================================================

/// The complete set of legal status transitions. Anything not listed here
/// is rejected explicitly, never coerced.
pub fn transition_allowed(from: ApplicationStatus, to: ApplicationStatus) -> bool {
    use ApplicationStatus::*;
    matches!(
        (from, to),
        // Stage 1 outcomes
        (Pending, NeedsFollowUp)
            | (Pending, AutoRejected)
            // Stage 2 outcomes
            | (Pending, Held)
            | (Pending, ApprovedReady)
            // Stage 3 admin decisions
            | (Held, Approved)
            | (Held, ApprovedException)
            | (Held, Rejected)
            | (Held, FollowUp)
            // Commit engine, at the moment of batch commit
            | (ApprovedReady, Approved)
    )
}

/// Move a record to `to`, enforcing the transition table. On error the
/// record is left untouched.
pub fn apply_transition(
    app: &mut Application,
    to: ApplicationStatus,
) -> Result<(), IllegalTransition> {
    if !transition_allowed(app.status, to) {
        return Err(IllegalTransition {
            from: app.status,
            to,
        });
    }
    app.status = to;
    Ok(())
}

// ============================================================================
// ADMIN DECISION
// ============================================================================

/// External decision attached to a HELD record by the review collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminDecision {
    Approve,
    ApproveOverride,
    Reject,
    FollowUp,
}

impl AdminDecision {
    pub fn parse(s: &str) -> Result<AdminDecision, DecisionError> {
        match s.trim().to_uppercase().as_str() {
            "APPROVE" => Ok(AdminDecision::Approve),
            "APPROVE_OVERRIDE" => Ok(AdminDecision::ApproveOverride),
            "REJECT" => Ok(AdminDecision::Reject),
            "FOLLOW_UP" => Ok(AdminDecision::FollowUp),
            other => Err(DecisionError::UnknownDecision(other.to_string())),
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Minimum justification length for APPROVE_OVERRIDE.
pub const MIN_OVERRIDE_REASON_LEN: usize = 5;

/// Stage 3 error: the record stays HELD and the error surfaces to the admin.
#[derive(Debug)]
pub enum DecisionError {
    /// The decision string is not a recognized AdminDecision
    UnknownDecision(String),

    /// No application with this id exists
    UnknownApplication(i64),

    /// The record is not awaiting a decision
    NotHeld {
        application_id: i64,
        status: ApplicationStatus,
    },

    /// APPROVE_OVERRIDE without a sufficient justification
    OverrideReasonTooShort { len: usize },

    /// APPROVE failed the Stage 2 re-check against the current registry
    RecheckFailed { flags: Vec<SystemFlag> },

    /// Underlying store failure
    Store(String),
}

impl fmt::Display for DecisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionError::UnknownDecision(s) => {
                write!(f, "Unrecognized AdminDecision '{}'", s)
            }
            DecisionError::UnknownApplication(id) => {
                write!(f, "No application with id {}", id)
            }
            DecisionError::NotHeld {
                application_id,
                status,
            } => write!(
                f,
                "Application {} is {} and not awaiting a decision",
                application_id,
                status.as_str()
            ),
            DecisionError::OverrideReasonTooShort { len } => write!(
                f,
                "Override reason must be at least {} characters (got {})",
                MIN_OVERRIDE_REASON_LEN, len
            ),
            DecisionError::RecheckFailed { flags } => write!(
                f,
                "Re-check still flags: {}",
                crate::model::flags_to_string(flags)
            ),
            DecisionError::Store(msg) => write!(f, "Store error: {}", msg),
        }
    }
}

impl std::error::Error for DecisionError {}

impl From<anyhow::Error> for DecisionError {
    fn from(e: anyhow::Error) -> Self {
        DecisionError::Store(e.to_string())
    }
}

/// Internal pipeline error: a stage tried an illegal transition.
#[derive(Debug)]
pub struct IllegalTransition {
    pub from: ApplicationStatus,
    pub to: ApplicationStatus,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Illegal status transition {} -> {}",
            self.from.as_str(),
            self.to.as_str()
        )
    }
}

impl std::error::Error for IllegalTransition {}

// ============================================================================
// PIPELINE SUMMARY
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub needs_follow_up: usize,
    pub auto_rejected: usize,
    pub held: usize,
    pub approved_ready: usize,
}

impl PipelineSummary {
    pub fn total(&self) -> usize {
        self.needs_follow_up + self.auto_rejected + self.held + self.approved_ready
    }
}

// ============================================================================
// STAGE CONTROLLER
// ============================================================================

pub struct StageController {
    pub validator: EligibilityValidator,
    pub detector: DuplicateDetector,
}

impl StageController {
    pub fn new() -> Self {
        StageController {
            validator: EligibilityValidator::new(),
            detector: DuplicateDetector::new(),
        }
    }

    /// Stage 1: completeness + policy, recorded on the record.
    /// Returns the outcome so the caller knows whether Stage 2 runs.
    pub fn run_stage1(&self, app: &mut Application) -> Result<Stage1Outcome, IllegalTransition> {
        for flag in self.validator.advisory_flags(app) {
            app.add_flag(flag);
            app.needs_review = true;
        }

        let outcome = self.validator.check(app);
        match &outcome {
            Stage1Outcome::Eligible => {}
            Stage1Outcome::Incomplete { missing } => {
                app.admin_notes = missing.join(" | ");
                apply_transition(app, ApplicationStatus::NeedsFollowUp)?;
            }
            Stage1Outcome::Ineligible { reason } => {
                app.is_disqualified = true;
                app.disqualify_reason = reason.clone();
                apply_transition(app, ApplicationStatus::AutoRejected)?;
            }
        }
        Ok(outcome)
    }

    /// Stage 2: duplicate scan, recorded on the record.
    pub fn run_stage2(
        &self,
        app: &mut Application,
        snapshot: &crate::store::RegistrySnapshot,
        in_flight: &InFlightIndex,
    ) -> Result<DetectionVerdict, IllegalTransition> {
        let verdict = self.detector.check(app, snapshot, in_flight);

        app.matched_person_id = verdict.matched_person_id;
        app.candidates = verdict.candidates.clone();
        for flag in &verdict.flags {
            app.add_flag(*flag);
        }
        if verdict.is_clean() {
            apply_transition(app, ApplicationStatus::ApprovedReady)?;
        } else {
            app.needs_review = true;
            apply_transition(app, ApplicationStatus::Held)?;
        }
        Ok(verdict)
    }

    /// Run the waterfall over every PENDING application and persist the
    /// outcomes. Stage 2 sees the full registry plus earlier records of
    /// this same pass.
    pub fn process_pending(&self, registry: &Registry) -> anyhow::Result<PipelineSummary> {
        let snapshot = registry.snapshot()?;
        let mut summary = PipelineSummary::default();

        // Uncommitted survivors of earlier passes still occupy their
        // identity keys; seed the index so a later upload collides with
        // them here instead of at commit.
        let mut in_flight = InFlightIndex::new();
        for earlier in registry.uncommitted_applications()? {
            in_flight.insert(&earlier);
        }

        for mut app in registry.applications_with_status(ApplicationStatus::Pending)? {
            let outcome = self.run_stage1(&mut app)?;
            match outcome {
                Stage1Outcome::Incomplete { .. } => summary.needs_follow_up += 1,
                Stage1Outcome::Ineligible { .. } => summary.auto_rejected += 1,
                Stage1Outcome::Eligible => {
                    self.run_stage2(&mut app, &snapshot, &in_flight)?;
                    match app.status {
                        ApplicationStatus::Held => summary.held += 1,
                        _ => summary.approved_ready += 1,
                    }
                    in_flight.insert(&app);
                }
            }
            registry.update_application(&app)?;
        }
        Ok(summary)
    }

    /// Stage 3: apply one admin decision to a HELD record.
    ///
    /// APPROVE re-runs Stage 2 against the current registry; any remaining
    /// flag rejects the decision and the record stays HELD. APPROVE_OVERRIDE
    /// bypasses the re-check but requires a justification of at least
    /// MIN_OVERRIDE_REASON_LEN characters. Errors never change the record.
    pub fn apply_decision(
        &self,
        registry: &Registry,
        application_id: i64,
        decision_raw: &str,
        override_reason: &str,
    ) -> Result<ApplicationStatus, DecisionError> {
        let mut app = registry
            .application(application_id)?
            .ok_or(DecisionError::UnknownApplication(application_id))?;

        if app.status != ApplicationStatus::Held {
            return Err(DecisionError::NotHeld {
                application_id,
                status: app.status,
            });
        }

        let decision = AdminDecision::parse(decision_raw)?;
        match decision {
            AdminDecision::Reject => {
                apply_transition(&mut app, ApplicationStatus::Rejected)
                    .map_err(|e| DecisionError::Store(e.to_string()))?;
            }
            AdminDecision::FollowUp => {
                apply_transition(&mut app, ApplicationStatus::FollowUp)
                    .map_err(|e| DecisionError::Store(e.to_string()))?;
            }
            AdminDecision::ApproveOverride => {
                let reason = override_reason.trim();
                if reason.chars().count() < MIN_OVERRIDE_REASON_LEN {
                    return Err(DecisionError::OverrideReasonTooShort {
                        len: reason.chars().count(),
                    });
                }
                app.override_reason = reason.to_string();
                apply_transition(&mut app, ApplicationStatus::ApprovedException)
                    .map_err(|e| DecisionError::Store(e.to_string()))?;
            }
            AdminDecision::Approve => {
                // Re-validate against the registry as it is NOW; the view
                // that produced the original flags may be stale. Other
                // uncommitted records still count as occupants of their
                // identity keys - but never the record itself.
                let snapshot = registry.snapshot()?;
                let mut in_flight = InFlightIndex::new();
                for other in registry.uncommitted_applications()? {
                    if other.application_id != app.application_id {
                        in_flight.insert(&other);
                    }
                }
                let verdict = self.detector.check(&app, &snapshot, &in_flight);
                if !verdict.is_clean() {
                    return Err(DecisionError::RecheckFailed {
                        flags: verdict.flags,
                    });
                }
                // Stale detection flags no longer hold; advisory flags stay.
                app.system_flags.retain(|f| {
                    !matches!(
                        f,
                        SystemFlag::PhoneDup
                            | SystemFlag::IdDup
                            | SystemFlag::PriorIssuance
                            | SystemFlag::NameSimHigh
                            | SystemFlag::NameSimMedium
                    )
                });
                app.matched_person_id = verdict.matched_person_id;
                app.candidates.clear();
                apply_transition(&mut app, ApplicationStatus::Approved)
                    .map_err(|e| DecisionError::Store(e.to_string()))?;
            }
        }

        registry.update_application(&app)?;
        Ok(app.status)
    }
}

impl Default for StageController {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::RawApplicant;
    use crate::store::insert_person_from_application;

    fn raw(name: &str, phone: &str, title: &str, size: &str) -> RawApplicant {
        RawApplicant {
            name: name.to_string(),
            phone: phone.to_string(),
            national_id: "".to_string(),
            country: "Kenya".to_string(),
            church_name: "Grace Chapel".to_string(),
            title: title.to_string(),
            congregation_size: size.to_string(),
            requested_language: "English".to_string(),
            received_before: "No".to_string(),
            received_before_reason: "".to_string(),
        }
    }

    fn ingest(registry: &Registry, rows: &[RawApplicant]) {
        let apps: Vec<_> = rows
            .iter()
            .cloned()
            .map(|r| r.into_application("test.csv"))
            .collect();
        registry.insert_applications(&apps).unwrap();
    }

    #[test]
    fn test_transition_table_rejects_everything_not_listed() {
        use ApplicationStatus::*;
        assert!(transition_allowed(Pending, Held));
        assert!(transition_allowed(Held, ApprovedException));
        // A few representative illegal moves
        assert!(!transition_allowed(Pending, Approved));
        assert!(!transition_allowed(AutoRejected, ApprovedReady));
        assert!(!transition_allowed(ApprovedReady, Held));
        assert!(!transition_allowed(Held, ApprovedReady));
        assert!(!transition_allowed(Approved, Rejected));
    }

    #[test]
    fn test_small_congregation_is_auto_rejected_regardless_of_other_fields() {
        let registry = Registry::open_in_memory().unwrap();
        ingest(&registry, &[raw("Steve Adams", "0712 000 001", "Bishop", "14")]);
        let controller = StageController::new();
        let summary = controller.process_pending(&registry).unwrap();
        assert_eq!(summary.auto_rejected, 1);

        let app = &registry.applications().unwrap()[0];
        assert_eq!(app.status, ApplicationStatus::AutoRejected);
        assert!(app.is_disqualified);
        assert!(app.disqualify_reason.contains("Congregation size"));
    }

    #[test]
    fn test_ineligible_title_is_auto_rejected() {
        let registry = Registry::open_in_memory().unwrap();
        ingest(&registry, &[raw("Steve Adams", "0712 000 001", "Deacon", "100")]);
        let controller = StageController::new();
        controller.process_pending(&registry).unwrap();
        assert_eq!(
            registry.applications().unwrap()[0].status,
            ApplicationStatus::AutoRejected
        );
    }

    #[test]
    fn test_incomplete_record_needs_follow_up_and_skips_stage2() {
        let registry = Registry::open_in_memory().unwrap();
        // Phone collides with an existing person, but Stage 1 stops first.
        let existing = raw("Mary Kamau", "0712 000 001", "Pastor", "40")
            .into_application("seed.csv");
        insert_person_from_application(registry.conn(), &existing).unwrap();

        ingest(&registry, &[raw("Steve Adams", "0712 000 001", "", "40")]);
        let controller = StageController::new();
        let summary = controller.process_pending(&registry).unwrap();
        assert_eq!(summary.needs_follow_up, 1);

        let app = &registry.applications().unwrap()[0];
        assert_eq!(app.status, ApplicationStatus::NeedsFollowUp);
        assert!(!app.has_flag(SystemFlag::PhoneDup));
        assert!(app.admin_notes.contains("Missing Title"));
    }

    #[test]
    fn test_clean_record_is_approved_ready() {
        let registry = Registry::open_in_memory().unwrap();
        ingest(&registry, &[raw("Steve Adams", "0712 000 001", "Pastor", "40")]);
        let controller = StageController::new();
        let summary = controller.process_pending(&registry).unwrap();
        assert_eq!(summary.approved_ready, 1);
        assert_eq!(
            registry.applications().unwrap()[0].status,
            ApplicationStatus::ApprovedReady
        );
    }

    #[test]
    fn test_flagged_record_is_held() {
        let registry = Registry::open_in_memory().unwrap();
        let existing = raw("Stevie Adams", "0712 000 001", "Pastor", "40")
            .into_application("seed.csv");
        insert_person_from_application(registry.conn(), &existing).unwrap();

        ingest(&registry, &[raw("Steve Adams", "0712 000 001", "Pastor", "40")]);
        let controller = StageController::new();
        let summary = controller.process_pending(&registry).unwrap();
        assert_eq!(summary.held, 1);

        let app = &registry.applications().unwrap()[0];
        assert_eq!(app.status, ApplicationStatus::Held);
        assert!(app.has_flag(SystemFlag::PhoneDup));
        assert!(app.needs_review);
        assert!(app.matched_person_id.is_some());
        // Scan-time candidates persist on the row for audit.
        assert!(!app.candidates.is_empty());
    }

    #[test]
    fn test_apply_transition_leaves_record_untouched_on_illegal_move() {
        let mut app = raw("Steve Adams", "0712 000 001", "Pastor", "40")
            .into_application("test.csv");
        apply_transition(&mut app, ApplicationStatus::Held).unwrap();

        let err = apply_transition(&mut app, ApplicationStatus::ApprovedReady).unwrap_err();
        assert_eq!(err.from, ApplicationStatus::Held);
        assert_eq!(err.to, ApplicationStatus::ApprovedReady);
        assert_eq!(app.status, ApplicationStatus::Held);
    }

    #[test]
    fn test_cross_pass_phone_duplicate_holds_the_second_upload() {
        // Same phone arrives in two separate uploads with a waterfall run
        // between them. The first record is APPROVED_READY but uncommitted;
        // the second must collide with it, not sail through to a doomed
        // commit.
        let registry = Registry::open_in_memory().unwrap();
        let controller = StageController::new();

        ingest(&registry, &[raw("Steve Adams", "0712 000 001", "Pastor", "40")]);
        controller.process_pending(&registry).unwrap();

        ingest(&registry, &[raw("Mary Kamau", "0712 000 001", "Bishop", "60")]);
        let summary = controller.process_pending(&registry).unwrap();
        assert_eq!(summary.held, 1);

        let apps = registry.applications().unwrap();
        assert_eq!(apps[0].status, ApplicationStatus::ApprovedReady);
        assert_eq!(apps[1].status, ApplicationStatus::Held);
        assert!(apps[1].has_flag(SystemFlag::PhoneDup));
    }

    #[test]
    fn test_in_flight_duplicate_holds_the_later_record() {
        let registry = Registry::open_in_memory().unwrap();
        ingest(
            &registry,
            &[
                raw("Steve Adams", "0712 000 001", "Pastor", "40"),
                raw("Mary Kamau", "0712 000 001", "Bishop", "60"),
            ],
        );
        let controller = StageController::new();
        let summary = controller.process_pending(&registry).unwrap();
        assert_eq!(summary.approved_ready, 1);
        assert_eq!(summary.held, 1);

        let apps = registry.applications().unwrap();
        assert_eq!(apps[0].status, ApplicationStatus::ApprovedReady);
        assert_eq!(apps[1].status, ApplicationStatus::Held);
        assert!(apps[1].has_flag(SystemFlag::PhoneDup));
    }

    fn held_application(registry: &Registry) -> Application {
        // Seed a person that collides by phone, then run the waterfall.
        let existing = raw("Stevie Adams", "0712 000 001", "Pastor", "40")
            .into_application("seed.csv");
        insert_person_from_application(registry.conn(), &existing).unwrap();
        ingest(registry, &[raw("Steve Adams", "0712 000 001", "Pastor", "40")]);
        StageController::new().process_pending(registry).unwrap();
        let app = registry.applications().unwrap().remove(0);
        assert_eq!(app.status, ApplicationStatus::Held);
        app
    }

    #[test]
    fn test_unknown_decision_leaves_record_held() {
        let registry = Registry::open_in_memory().unwrap();
        let app = held_application(&registry);
        let controller = StageController::new();

        let err = controller
            .apply_decision(&registry, app.application_id, "MAYBE", "")
            .unwrap_err();
        assert!(matches!(err, DecisionError::UnknownDecision(_)));
        assert_eq!(
            registry.application(app.application_id).unwrap().unwrap().status,
            ApplicationStatus::Held
        );
    }

    #[test]
    fn test_override_reason_too_short_is_rejected() {
        let registry = Registry::open_in_memory().unwrap();
        let app = held_application(&registry);
        let controller = StageController::new();

        let err = controller
            .apply_decision(&registry, app.application_id, "APPROVE_OVERRIDE", "dup?")
            .unwrap_err();
        assert!(matches!(
            err,
            DecisionError::OverrideReasonTooShort { len: 4 }
        ));
        assert_eq!(
            registry.application(app.application_id).unwrap().unwrap().status,
            ApplicationStatus::Held
        );
    }

    #[test]
    fn test_override_with_sufficient_reason_approves_as_exception() {
        let registry = Registry::open_in_memory().unwrap();
        let app = held_application(&registry);
        let controller = StageController::new();

        let status = controller
            .apply_decision(&registry, app.application_id, "APPROVE_OVERRIDE", "twins")
            .unwrap();
        assert_eq!(status, ApplicationStatus::ApprovedException);

        let reloaded = registry.application(app.application_id).unwrap().unwrap();
        assert_eq!(reloaded.status, ApplicationStatus::ApprovedException);
        assert_eq!(reloaded.override_reason, "twins");
    }

    #[test]
    fn test_approve_fails_recheck_while_collision_remains() {
        let registry = Registry::open_in_memory().unwrap();
        let app = held_application(&registry);
        let controller = StageController::new();

        let err = controller
            .apply_decision(&registry, app.application_id, "APPROVE", "")
            .unwrap_err();
        match err {
            DecisionError::RecheckFailed { flags } => {
                assert!(flags.contains(&SystemFlag::PhoneDup))
            }
            other => panic!("expected RecheckFailed, got {other}"),
        }
        assert_eq!(
            registry.application(app.application_id).unwrap().unwrap().status,
            ApplicationStatus::Held
        );
    }

    #[test]
    fn test_approve_recheck_counts_uncommitted_applications() {
        // An uncommitted APPROVED_READY record holds the phone; APPROVE on
        // a HELD record with the same phone must fail the re-check even
        // though no person row exists yet.
        let registry = Registry::open_in_memory().unwrap();
        let controller = StageController::new();

        ingest(&registry, &[raw("Steve Adams", "0712 000 001", "Pastor", "40")]);
        controller.process_pending(&registry).unwrap();
        ingest(&registry, &[raw("Mary Kamau", "0712 000 001", "Bishop", "60")]);
        controller.process_pending(&registry).unwrap();

        let held = registry
            .applications_with_status(ApplicationStatus::Held)
            .unwrap()
            .remove(0);
        let err = controller
            .apply_decision(&registry, held.application_id, "APPROVE", "")
            .unwrap_err();
        match err {
            DecisionError::RecheckFailed { flags } => {
                assert!(flags.contains(&SystemFlag::PhoneDup))
            }
            other => panic!("expected RecheckFailed, got {other}"),
        }
    }

    #[test]
    fn test_approve_passes_recheck_after_collision_is_gone() {
        let registry = Registry::open_in_memory().unwrap();
        let app = held_application(&registry);
        let controller = StageController::new();

        // The colliding registry row goes away between review and decision.
        registry
            .conn()
            .execute("UPDATE applications SET matched_person_id = NULL", [])
            .unwrap();
        registry
            .conn()
            .execute("DELETE FROM persons", [])
            .unwrap();

        let status = controller
            .apply_decision(&registry, app.application_id, "APPROVE", "")
            .unwrap();
        assert_eq!(status, ApplicationStatus::Approved);

        let reloaded = registry.application(app.application_id).unwrap().unwrap();
        assert!(!reloaded.has_flag(SystemFlag::PhoneDup));
    }

    #[test]
    fn test_decision_on_non_held_record_is_an_input_error() {
        let registry = Registry::open_in_memory().unwrap();
        ingest(&registry, &[raw("Steve Adams", "0712 000 001", "Pastor", "40")]);
        let controller = StageController::new();
        controller.process_pending(&registry).unwrap();
        let app = registry.applications().unwrap().remove(0);
        assert_eq!(app.status, ApplicationStatus::ApprovedReady);

        let err = controller
            .apply_decision(&registry, app.application_id, "REJECT", "")
            .unwrap_err();
        assert!(matches!(err, DecisionError::NotHeld { .. }));
    }
}
