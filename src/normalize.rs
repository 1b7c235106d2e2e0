// 🔤 Normalizer - Canonical forms for identity fields
// Pure functions: deterministic, idempotent, no side effects.
// Normalized values are what every later stage compares; raw values are
// kept on the record for audit.

// ============================================================================
// COUNTRY CODE MAP
// ============================================================================

/// Countries whose local phone formats we canonicalize to E.164-style.
const COUNTRY_CODES: &[(&str, &str)] = &[
    ("KENYA", "+254"),
    ("KE", "+254"),
    ("TANZANIA", "+255"),
    ("TZ", "+255"),
    ("UNITED REPUBLIC OF TANZANIA", "+255"),
];

fn country_code(country: &str) -> Option<&'static str> {
    let c = norm_country(country);
    COUNTRY_CODES
        .iter()
        .find(|(name, _)| *name == c)
        .map(|(_, code)| *code)
}

// ============================================================================
// TEXT NORMALIZATION
// ============================================================================

/// Trim and collapse internal whitespace.
pub fn norm_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Uppercase country name with collapsed whitespace.
pub fn norm_country(raw: &str) -> String {
    norm_text(raw).to_uppercase()
}

/// Uppercase title, dots stripped ("Rev. Pastor" → "REV PASTOR").
pub fn norm_title(raw: &str) -> String {
    norm_text(&raw.replace('.', "")).to_uppercase()
}

/// Uppercase requested language.
pub fn norm_language(raw: &str) -> String {
    norm_text(raw).to_uppercase()
}

// ============================================================================
// IDENTITY FIELDS
// ============================================================================

/// Normalize a national ID: uppercase, whitespace and hyphens stripped.
/// Empty input → None (a missing ID never participates in uniqueness).
pub fn norm_id(raw: &str) -> Option<String> {
    let s: String = raw
        .trim()
        .to_uppercase()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Normalize a phone number into one canonical digit string.
///
/// Keeps a leading `+`, strips everything else non-digit, then applies the
/// country-code map: `254...`/`255...` gain a `+`, a leading `0` is replaced
/// by the country's code when the country is known. Empty → None.
pub fn norm_phone(raw: &str, country: &str) -> Option<String> {
    let mut digits = String::new();
    for (i, c) in raw.trim().chars().enumerate() {
        if c.is_ascii_digit() || (c == '+' && i == 0) {
            digits.push(c);
        }
    }
    if digits.is_empty() {
        return None;
    }

    if digits.starts_with('+') && digits.len() >= 10 {
        return Some(digits);
    }
    if let Some(rest) = digits.strip_prefix("254") {
        return Some(format!("+254{}", rest));
    }
    if let Some(rest) = digits.strip_prefix("255") {
        return Some(format!("+255{}", rest));
    }
    if let Some(rest) = digits.strip_prefix('0') {
        if let Some(code) = country_code(country) {
            return Some(format!("{}{}", code, rest));
        }
    }
    Some(digits)
}

// ============================================================================
// NAMES
// ============================================================================

/// Fold common Latin diacritics to their ASCII base letter.
fn fold_diacritic(c: char) -> char {
    match c {
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => 'A',
        'È' | 'É' | 'Ê' | 'Ë' => 'E',
        'Ì' | 'Í' | 'Î' | 'Ï' => 'I',
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' => 'O',
        'Ù' | 'Ú' | 'Û' | 'Ü' => 'U',
        'Ç' => 'C',
        'Ñ' => 'N',
        'Ý' => 'Y',
        _ => c,
    }
}

/// Normalize a full name: uppercase, diacritics folded, punctuation replaced
/// with spaces, whitespace collapsed. Idempotent.
pub fn norm_name(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    let mut out = String::with_capacity(upper.len());
    for c in upper.chars() {
        let c = fold_diacritic(c);
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else {
            out.push(' ');
        }
    }
    norm_text(&out)
}

/// Split a normalized full name into (first, middle, last).
///
/// First token = first name, last token = last name, interior tokens join
/// into the middle name. One token → first only; two → first + last.
pub fn split_name(normalized: &str) -> (String, String, String) {
    let parts: Vec<&str> = normalized.split(' ').filter(|p| !p.is_empty()).collect();
    match parts.len() {
        0 => (String::new(), String::new(), String::new()),
        1 => (parts[0].to_string(), String::new(), String::new()),
        2 => (parts[0].to_string(), String::new(), parts[1].to_string()),
        n => (
            parts[0].to_string(),
            parts[1..n - 1].join(" "),
            parts[n - 1].to_string(),
        ),
    }
}

/// Fast exact-lookup key: normalized last name + first name.
pub fn name_key(normalized: &str) -> String {
    let (first, _, last) = split_name(normalized);
    format!("{}|{}", last, first)
}

// ============================================================================
// TESTS
// ============================================================================
