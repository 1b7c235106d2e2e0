// Waterfall Registry - Core Library
// Ingest → normalize → staged validation → atomic commit into the
// canonical person registry.

pub mod normalize;
pub mod model;
pub mod store;
pub mod ingest;
pub mod eligibility;
pub mod detection;
pub mod stage;
pub mod commit;
pub mod review;

// Re-export commonly used types
pub use model::{
    flags_from_string, flags_to_string, Application, ApplicationStatus, Batch, Candidate,
    Issuance, Person, SimilarityTier, SystemFlag,
};
pub use store::{Registry, RegistrySnapshot};
pub use ingest::{load_csv, RawApplicant};
pub use eligibility::{EligibilityValidator, Stage1Outcome};
pub use detection::{name_similarity, DetectionVerdict, DuplicateDetector, InFlightIndex};
pub use stage::{
    apply_transition, transition_allowed, AdminDecision, DecisionError, PipelineSummary,
    StageController,
};
pub use commit::{CommitEngine, CommitError, CommitReceipt};
pub use review::{
    apply_decisions, build_review_rows, export_review_csv, load_decisions, DecisionRecord,
    DecisionReport, ReviewRow, RowRole,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
