use anyhow::{bail, Result};
use std::env;
use std::path::{Path, PathBuf};

use waterfall_registry::{
    apply_decisions, build_review_rows, export_review_csv, load_csv, load_decisions,
    ApplicationStatus, CommitEngine, CommitError, DuplicateDetector, Registry, StageController,
};

fn registry_path() -> PathBuf {
    env::var("REGISTRY_DB")
        .unwrap_or_else(|_| "registry.db".to_string())
        .into()
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("init") => run_init(),
        Some("ingest") => {
            if args.len() < 3 {
                bail!("Usage: waterfall-registry ingest <applicants.csv>...");
            }
            run_ingest(&args[2..])
        }
        Some("check") => run_check(),
        Some("export-review") => {
            let out = args.get(2).map(String::as_str).unwrap_or("review.csv");
            run_export_review(Path::new(out))
        }
        Some("decide") => {
            let csv = args.get(2).map(String::as_str);
            match csv {
                Some(csv) => run_decide(Path::new(csv)),
                None => bail!("Usage: waterfall-registry decide <decisions.csv>"),
            }
        }
        Some("commit") => {
            let label = args.get(2).map(String::as_str).unwrap_or("manual");
            let issued_by = args.get(3).map(String::as_str).unwrap_or("admin");
            run_commit(label, issued_by)
        }
        Some("status") => run_status(),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("Waterfall Registry v{}", waterfall_registry::VERSION);
    println!();
    println!("Usage: waterfall-registry <command>");
    println!();
    println!("  init                        Create the registry database");
    println!("  ingest <applicants.csv>...  Load applicant records");
    println!("  check                       Run the waterfall over pending records");
    println!("  export-review [out.csv]     Export HELD records for admin review");
    println!("  decide <decisions.csv>      Import filled-in review decisions");
    println!("  commit [label] [issued-by]  Commit approved records atomically");
    println!("  status                      Show pipeline counts");
    println!();
    println!("Database path comes from REGISTRY_DB (default: registry.db)");
}

fn run_init() -> Result<()> {
    let path = registry_path();
    Registry::open(&path)?;
    println!("✓ Registry initialized at {:?} (WAL mode)", path);
    Ok(())
}

fn run_ingest(csv_paths: &[String]) -> Result<()> {
    let registry = Registry::open(registry_path())?;
    let mut total_inserted = 0;
    let mut total_skipped = 0;

    for csv_path in csv_paths {
        let csv_path = Path::new(csv_path);
        println!("📂 Loading {:?}...", csv_path);
        let applications = load_csv(csv_path)?;
        println!("✓ Parsed {} applicant rows", applications.len());

        let (inserted, skipped) = registry.insert_applications(&applications)?;
        total_inserted += inserted;
        total_skipped += skipped;
    }

    println!("💾 Inserted {} applications", total_inserted);
    if total_skipped > 0 {
        println!("✓ Skipped {} rows already ingested", total_skipped);
    }
    Ok(())
}

fn run_check() -> Result<()> {
    let registry = Registry::open(registry_path())?;
    let controller = StageController::new();

    println!("🚦 Running waterfall over pending applications...");
    let summary = controller.process_pending(&registry)?;
    println!("✓ Processed {} applications", summary.total());
    println!("  APPROVED_READY:  {}", summary.approved_ready);
    println!("  HELD:            {}", summary.held);
    println!("  NEEDS_FOLLOW_UP: {}", summary.needs_follow_up);
    println!("  AUTO_REJECTED:   {}", summary.auto_rejected);
    Ok(())
}

fn run_export_review(out_path: &Path) -> Result<()> {
    let registry = Registry::open(registry_path())?;
    let rows = build_review_rows(&registry, &DuplicateDetector::new())?;
    if rows.is_empty() {
        println!("✓ No HELD applications; nothing to review");
        return Ok(());
    }
    export_review_csv(out_path, &rows)?;
    let groups = rows
        .iter()
        .filter(|r| r.row_role == waterfall_registry::RowRole::Primary)
        .count();
    println!("📤 Exported {} review groups ({} rows) to {:?}", groups, rows.len(), out_path);
    Ok(())
}

fn run_decide(csv_path: &Path) -> Result<()> {
    let registry = Registry::open(registry_path())?;
    let controller = StageController::new();

    let decisions = load_decisions(csv_path)?;
    println!("📥 Loaded {} decisions from {:?}", decisions.len(), csv_path);

    let report = apply_decisions(&controller, &registry, &decisions);
    for (id, status) in &report.applied {
        println!("✓ Application {} → {}", id, status.as_str());
    }
    for (id, err) in &report.errors {
        println!("❌ Application {}: {}", id, err);
    }
    println!(
        "Applied {} decisions, {} errors",
        report.applied.len(),
        report.errors.len()
    );
    Ok(())
}

fn run_commit(label: &str, issued_by: &str) -> Result<()> {
    let mut registry = Registry::open(registry_path())?;
    let engine = CommitEngine::new();

    println!("📦 Committing approved applications...");
    match engine.commit_batch(&mut registry, label, issued_by) {
        Ok(receipt) => {
            println!("✓ Batch {} committed", receipt.batch_id);
            println!("  Applications: {}", receipt.committed);
            println!("  Persons created: {}", receipt.persons_created);
            println!("  Persons matched: {}", receipt.persons_matched);
            Ok(())
        }
        Err(CommitError::NothingToCommit) => {
            println!("✓ No applications ready to commit");
            Ok(())
        }
        Err(e) => {
            println!("❌ {}", e);
            Err(e.into())
        }
    }
}

fn run_status() -> Result<()> {
    let registry = Registry::open(registry_path())?;

    println!("📊 Registry status");
    println!("  Persons:  {}", registry.persons()?.len());
    println!("  Batches:  {}", registry.batches()?.len());
    println!("  Applications:");
    for status in [
        ApplicationStatus::Pending,
        ApplicationStatus::NeedsFollowUp,
        ApplicationStatus::AutoRejected,
        ApplicationStatus::Held,
        ApplicationStatus::ApprovedReady,
        ApplicationStatus::Approved,
        ApplicationStatus::ApprovedException,
        ApplicationStatus::Rejected,
        ApplicationStatus::FollowUp,
    ] {
        let count = registry.applications_with_status(status)?.len();
        if count > 0 {
            println!("    {:<18} {}", status.as_str(), count);
        }
    }
    Ok(())
}
