// 🔍 Duplicate Detector - Stage 2 of the waterfall
//
// Scans the ENTIRE historical registry (plus every application that holds
// an identity key but is not yet committed), never just the current batch. Exact phone/ID collisions
// and prior issuance always route to review; fuzzy name matches are tiered
// and the MEDIUM tier is gated on corroborating fields. The detector only
// produces a verdict - it never mutates the registry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::{Application, Candidate, SimilarityTier, SystemFlag};
use crate::normalize::split_name;
use crate::store::RegistrySnapshot;

// ============================================================================
// SIMILARITY SCORING
// ============================================================================

/// Token-set similarity between two normalized names, 0-100.
///
/// Both names are split into token sets; the shared tokens and each side's
/// remainder are recombined and compared with normalized Levenshtein, taking
/// the best pairing. Identical names score 100; minor spelling variants
/// ("STEVE" vs "STEVIE") stay above the MEDIUM threshold; unrelated names
/// fall well below it.
pub fn name_similarity(a: &str, b: &str) -> u8 {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    if a == b {
        return 100;
    }

    let tokens_a: Vec<&str> = a.split(' ').filter(|t| !t.is_empty()).collect();
    let tokens_b: Vec<&str> = b.split(' ').filter(|t| !t.is_empty()).collect();

    let mut shared: Vec<&str> = tokens_a
        .iter()
        .filter(|t| tokens_b.contains(t))
        .copied()
        .collect();
    shared.sort_unstable();
    shared.dedup();

    let mut rest_a: Vec<&str> = tokens_a
        .iter()
        .filter(|t| !shared.contains(t))
        .copied()
        .collect();
    rest_a.sort_unstable();
    let mut rest_b: Vec<&str> = tokens_b
        .iter()
        .filter(|t| !shared.contains(t))
        .copied()
        .collect();
    rest_b.sort_unstable();

    let base = shared.join(" ");
    let combined_a = join_nonempty(&base, &rest_a.join(" "));
    let combined_b = join_nonempty(&base, &rest_b.join(" "));

    let ratio = [
        strsim::normalized_levenshtein(&base, &combined_a),
        strsim::normalized_levenshtein(&base, &combined_b),
        strsim::normalized_levenshtein(&combined_a, &combined_b),
    ]
    .into_iter()
    .fold(0.0_f64, f64::max);

    (ratio * 100.0).round() as u8
}

fn join_nonempty(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_string(),
        (_, true) => a.to_string(),
        _ => format!("{} {}", a, b),
    }
}

/// Flexible middle-name agreement for the MEDIUM gate: full equality, a
/// single-initial prefix on either side, or either middle name absent.
pub fn middle_match_flexible(m1: &str, m2: &str) -> bool {
    let m1 = m1.trim();
    let m2 = m2.trim();
    if m1.is_empty() || m2.is_empty() {
        return true;
    }
    if m1 == m2 {
        return true;
    }
    (m1.chars().count() == 1 && m2.starts_with(m1))
        || (m2.chars().count() == 1 && m1.starts_with(m2))
}

// ============================================================================
// DETECTION VERDICT
// ============================================================================

/// Stage 2 result: CLEAN (no flags) or FLAGGED (flag set + candidate list).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionVerdict {
    pub flags: Vec<SystemFlag>,
    /// Ordered by descending score, ascending person_id on ties
    pub candidates: Vec<Candidate>,
    /// Exact-identity match, when one exists in the registry
    pub matched_person_id: Option<i64>,
    /// Latest issued_at of the matched person, when any
    pub prior_issuance_latest: Option<String>,
}

impl DetectionVerdict {
    pub fn is_clean(&self) -> bool {
        self.flags.is_empty()
    }
}

// ============================================================================
// IN-FLIGHT INDEX
// ============================================================================

/// Exact-key index over applications that occupy an identity key without
/// being committed yet: earlier records of the same pass plus HELD/approved
/// survivors of previous passes. Two uploads colliding with each other
/// (not yet with any person) still flag the later one.
#[derive(Debug, Default)]
pub struct InFlightIndex {
    phones: HashMap<String, i64>,
    national_ids: HashMap<String, i64>,
}

impl InFlightIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an application after it has been checked.
    pub fn insert(&mut self, app: &Application) {
        if let Some(phone) = &app.phone_normalized {
            self.phones
                .entry(phone.clone())
                .or_insert(app.application_id);
        }
        if let Some(nid) = &app.national_id_normalized {
            self.national_ids
                .entry(nid.clone())
                .or_insert(app.application_id);
        }
    }

    fn has_phone(&self, phone: &str) -> bool {
        self.phones.contains_key(phone)
    }

    fn has_national_id(&self, nid: &str) -> bool {
        self.national_ids.contains_key(nid)
    }
}

// ============================================================================
// DUPLICATE DETECTOR
// ============================================================================

pub struct DuplicateDetector {
    /// Score at/above which a candidate always flags (default: 92)
    pub high_threshold: u8,

    /// Score at/above which a candidate flags when gated fields match
    /// (default: 88)
    pub medium_threshold: u8,
}

impl DuplicateDetector {
    pub fn new() -> Self {
        DuplicateDetector {
            high_threshold: 92,
            medium_threshold: 88,
        }
    }

    pub fn with_thresholds(high: u8, medium: u8) -> Self {
        DuplicateDetector {
            high_threshold: high,
            medium_threshold: medium,
        }
    }

    /// Run all Stage 2 checks for one eligible application.
    pub fn check(
        &self,
        app: &Application,
        snapshot: &RegistrySnapshot,
        in_flight: &InFlightIndex,
    ) -> DetectionVerdict {
        let mut verdict = DetectionVerdict::default();

        // 1. Exact duplicates. A None normalized value never collides.
        if let Some(phone) = &app.phone_normalized {
            let person = snapshot
                .persons
                .iter()
                .find(|p| p.phone_normalized.as_deref() == Some(phone.as_str()));
            if person.is_some() || in_flight.has_phone(phone) {
                verdict.flags.push(SystemFlag::PhoneDup);
            }
            if let Some(p) = person {
                verdict.matched_person_id = Some(p.person_id);
            }
        }
        if let Some(nid) = &app.national_id_normalized {
            let person = snapshot
                .persons
                .iter()
                .find(|p| p.national_id_normalized.as_deref() == Some(nid.as_str()));
            if person.is_some() || in_flight.has_national_id(nid) {
                verdict.flags.push(SystemFlag::IdDup);
            }
            if let Some(p) = person {
                verdict.matched_person_id = verdict.matched_person_id.or(Some(p.person_id));
            }
        }

        // 2. Prior issuance on the exact-identity match.
        if let Some(pid) = verdict.matched_person_id {
            if let Some(latest) = snapshot.latest_issuance.get(&pid) {
                verdict.flags.push(SystemFlag::PriorIssuance);
                verdict.prior_issuance_latest = Some(latest.clone());
            }
        }

        // 3. Name similarity against every registry name.
        let (_, app_middle, app_last) = split_name(&app.full_name_normalized);
        for person in &snapshot.persons {
            if person.full_name_normalized.is_empty() || app.full_name_normalized.is_empty() {
                continue;
            }
            let score = name_similarity(&app.full_name_normalized, &person.full_name_normalized);
            if score >= self.high_threshold {
                verdict.candidates.push(self.candidate(person, score, SimilarityTier::High));
            } else if score >= self.medium_threshold {
                let country_matches = app.country == person.country;
                let (_, cand_middle, cand_last) =
                    split_name(&person.full_name_normalized);
                let last_matches = !app_last.is_empty() && app_last == cand_last;
                if country_matches
                    && last_matches
                    && middle_match_flexible(&app_middle, &cand_middle)
                {
                    verdict
                        .candidates
                        .push(self.candidate(person, score, SimilarityTier::Medium));
                }
            }
        }

        // All candidates retained, best first; ties break on person_id.
        verdict
            .candidates
            .sort_by(|a, b| b.score.cmp(&a.score).then(a.person_id.cmp(&b.person_id)));

        if verdict
            .candidates
            .iter()
            .any(|c| c.tier == SimilarityTier::High)
        {
            verdict.flags.push(SystemFlag::NameSimHigh);
        }
        if verdict
            .candidates
            .iter()
            .any(|c| c.tier == SimilarityTier::Medium)
        {
            verdict.flags.push(SystemFlag::NameSimMedium);
        }

        verdict
    }

    fn candidate(
        &self,
        person: &crate::model::Person,
        score: u8,
        tier: SimilarityTier,
    ) -> Candidate {
        Candidate {
            person_id: person.person_id,
            score,
            tier,
            full_name_normalized: person.full_name_normalized.clone(),
            country: person.country.clone(),
            phone_normalized: person.phone_normalized.clone(),
            national_id_normalized: person.national_id_normalized.clone(),
            church_name: person.church_name.clone(),
        }
    }
}

impl Default for DuplicateDetector {
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
    use crate::model::Person;
    use chrono::Utc;

    fn application(name: &str, phone: &str, country: &str) -> Application {
        RawApplicant {
            name: name.to_string(),
            phone: phone.to_string(),
            national_id: "".to_string(),
            country: country.to_string(),
            church_name: "Grace Chapel".to_string(),
            title: "Pastor".to_string(),
            congregation_size: "20".to_string(),
            requested_language: "English".to_string(),
            received_before: "No".to_string(),
            received_before_reason: "".to_string(),
        }
        .into_application("test.csv")
    }

    fn person(person_id: i64, name: &str, phone: &str, country: &str) -> Person {
        let normalized = crate::normalize::norm_name(name);
        let (first, middle, last) = split_name(&normalized);
        Person {
            person_id,
            first_name: first,
            middle_name: middle,
            last_name: last,
            full_name_original: name.to_string(),
            full_name_normalized: normalized.clone(),
            name_key: crate::normalize::name_key(&normalized),
            phone_original: phone.to_string(),
            phone_normalized: crate::normalize::norm_phone(phone, country),
            national_id_original: String::new(),
            national_id_normalized: None,
            country: crate::normalize::norm_country(country),
            church_name: "Grace Chapel".to_string(),
            created_at: Utc::now(),
        }
    }

    fn snapshot_with(persons: Vec<Person>) -> RegistrySnapshot {
        RegistrySnapshot {
            persons,
            latest_issuance: HashMap::new(),
        }
    }

    #[test]
    fn test_identical_names_score_100() {
        assert_eq!(name_similarity("STEVE ADAMS", "STEVE ADAMS"), 100);
    }

    #[test]
    fn test_spelling_variant_scores_in_flagging_band() {
        let score = name_similarity("STEVE ADAMS", "STEVIE ADAMS");
        assert!((88..=100).contains(&score), "score was {score}");
    }

    #[test]
    fn test_unrelated_names_score_low() {
        let score = name_similarity("STEVE ADAMS", "MARY WANJIKU KAMAU");
        assert!(score < 88, "score was {score}");
    }

    #[test]
    fn test_token_order_does_not_matter() {
        assert_eq!(name_similarity("ADAMS STEVE", "STEVE ADAMS"), 100);
    }

    #[test]
    fn test_middle_match_flexible() {
        assert!(middle_match_flexible("MARK", "MARK"));
        assert!(middle_match_flexible("M", "MARK"));
        assert!(middle_match_flexible("MARK", "M"));
        assert!(middle_match_flexible("", "MARK"));
        assert!(middle_match_flexible("MARK", ""));
        assert!(!middle_match_flexible("MARK", "PETER"));
        assert!(!middle_match_flexible("P", "MARK"));
    }

    #[test]
    fn test_phone_dup_against_registry() {
        // Exact PHONE_DUP wins regardless of name score.
        let detector = DuplicateDetector::new();
        let existing = person(1, "Stevie Adams", "5550100", "Kenya");
        let snapshot = snapshot_with(vec![existing]);
        let app = application("Steve Adams", "555-0100", "Kenya");

        let verdict = detector.check(&app, &snapshot, &InFlightIndex::new());
        assert!(verdict.flags.contains(&SystemFlag::PhoneDup));
        assert_eq!(verdict.matched_person_id, Some(1));
        assert!(!verdict.is_clean());
    }

    #[test]
    fn test_phone_dup_flags_later_in_flight_record() {
        let detector = DuplicateDetector::new();
        let snapshot = snapshot_with(vec![]);
        let mut in_flight = InFlightIndex::new();

        let first = application("Steve Adams", "0712 000 111", "Kenya");
        let verdict1 = detector.check(&first, &snapshot, &in_flight);
        assert!(verdict1.is_clean());
        in_flight.insert(&first);

        let second = application("Mary Kamau", "0712 000 111", "Kenya");
        let verdict2 = detector.check(&second, &snapshot, &in_flight);
        assert!(verdict2.flags.contains(&SystemFlag::PhoneDup));
    }

    #[test]
    fn test_null_phone_never_collides() {
        let detector = DuplicateDetector::new();
        let mut no_phone = person(1, "Mary Kamau", "", "Kenya");
        no_phone.phone_normalized = None;
        let snapshot = snapshot_with(vec![no_phone]);
        let mut in_flight = InFlightIndex::new();

        let first = application("Jane Njeri", "", "Kenya");
        assert_eq!(first.phone_normalized, None);
        let verdict = detector.check(&first, &snapshot, &in_flight);
        assert!(!verdict.flags.contains(&SystemFlag::PhoneDup));

        in_flight.insert(&first);
        let second = application("Ann Mwende", "", "Kenya");
        let verdict = detector.check(&second, &snapshot, &in_flight);
        assert!(!verdict.flags.contains(&SystemFlag::PhoneDup));
    }

    #[test]
    fn test_prior_issuance_flagged_on_exact_match() {
        let detector = DuplicateDetector::new();
        let existing = person(7, "Steve Adams", "0712 345 678", "Kenya");
        let mut snapshot = snapshot_with(vec![existing]);
        snapshot
            .latest_issuance
            .insert(7, "2024-06-01".to_string());

        let app = application("Steve Adams", "0712 345 678", "Kenya");
        let verdict = detector.check(&app, &snapshot, &InFlightIndex::new());
        assert!(verdict.flags.contains(&SystemFlag::PriorIssuance));
        assert_eq!(verdict.prior_issuance_latest.as_deref(), Some("2024-06-01"));
    }

    #[test]
    fn test_high_tier_flags_regardless_of_country() {
        let detector = DuplicateDetector::new();
        // Different country and phone; name is identical → HIGH.
        let existing = person(3, "Steve Adams", "0788 111 222", "Tanzania");
        let snapshot = snapshot_with(vec![existing]);
        let app = application("Steve Adams", "0712 345 678", "Kenya");

        let verdict = detector.check(&app, &snapshot, &InFlightIndex::new());
        assert!(verdict.flags.contains(&SystemFlag::NameSimHigh));
        assert_eq!(verdict.candidates.len(), 1);
        assert_eq!(verdict.candidates[0].score, 100);
        assert_eq!(verdict.candidates[0].tier, SimilarityTier::High);
    }

    #[test]
    fn test_medium_tier_requires_gate() {
        // Force the Steve/Stevie pair into the MEDIUM band by raising the
        // HIGH threshold, then exercise the gate conditions.
        let detector = DuplicateDetector::with_thresholds(99, 88);

        // Gate passes: same country, same last name, middles both absent.
        let same_country = person(1, "Stevie Adams", "0788 111 222", "Kenya");
        let snapshot = snapshot_with(vec![same_country]);
        let app = application("Steve Adams", "0712 345 678", "Kenya");
        let verdict = detector.check(&app, &snapshot, &InFlightIndex::new());
        assert!(verdict.flags.contains(&SystemFlag::NameSimMedium));
        assert_eq!(verdict.candidates[0].tier, SimilarityTier::Medium);

        // Gate fails on country.
        let other_country = person(2, "Stevie Adams", "0788 111 222", "Tanzania");
        let snapshot = snapshot_with(vec![other_country]);
        let verdict = detector.check(&app, &snapshot, &InFlightIndex::new());
        assert!(verdict.is_clean());

        // Gate fails on middle name.
        let other_middle = person(3, "Stevie Peter Adams", "0788 111 222", "Kenya");
        let mid_app = application("Steve Mark Adams", "0712 345 678", "Kenya");
        let score = name_similarity("STEVE MARK ADAMS", "STEVIE PETER ADAMS");
        if (88..99).contains(&score) {
            let snapshot = snapshot_with(vec![other_middle]);
            let verdict = detector.check(&mid_app, &snapshot, &InFlightIndex::new());
            assert!(verdict.is_clean());
        }
    }

    #[test]
    fn test_all_candidates_retained_ordered_by_score() {
        let detector = DuplicateDetector::new();
        let snapshot = snapshot_with(vec![
            person(1, "Steve Adams", "0788 111 222", "Kenya"),
            person(2, "Steve Adams", "0788 333 444", "Tanzania"),
            person(3, "Stevie Adams", "0788 555 666", "Kenya"),
        ]);
        let app = application("Steve Adams", "0712 345 678", "Kenya");

        let verdict = detector.check(&app, &snapshot, &InFlightIndex::new());
        let scores: Vec<u8> = verdict.candidates.iter().map(|c| c.score).collect();
        let mut sorted = scores.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(scores, sorted);
        // Equal-score candidates tie-break on ascending person_id.
        assert_eq!(verdict.candidates[0].person_id, 1);
        assert_eq!(verdict.candidates[1].person_id, 2);
        assert!(verdict.candidates.len() >= 2);
    }

    #[test]
    fn test_clean_record_produces_no_flags() {
        let detector = DuplicateDetector::new();
        let snapshot = snapshot_with(vec![person(1, "Mary Wanjiku Kamau", "0788 111 222", "Kenya")]);
        let app = application("Steve Adams", "0712 345 678", "Kenya");
        let verdict = detector.check(&app, &snapshot, &InFlightIndex::new());
        assert!(verdict.is_clean());
        assert!(verdict.candidates.is_empty());
    }
}
