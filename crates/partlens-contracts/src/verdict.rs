use crate::catalog::{self, NONE_SENTINEL};

pub const VALID_TAG: &str = "<VALID>";
pub const INVALID_TAG: &str = "<INVALID>";
pub const NOT_VISIBLE_TAG: &str = "<NOT_VISIBLE>";
/// Correction reply meaning the proposed number already matches the label.
pub const SAME_SENTINEL: &str = "SAME";

/// Glyph pairs the extractor routinely swaps when reading printed labels.
/// Listed in the correction instruction so the model re-checks exactly
/// these positions.
pub const CONFUSABLE_GLYPHS: &[(char, char)] = &[
    ('0', 'O'),
    ('1', 'I'),
    ('8', '9'),
    ('B', '8'),
    ('S', '5'),
];

/// Outcome of one validation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Confirmed,
    Rejected,
    NotVisible,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Confirmed => "confirmed",
            Verdict::Rejected => "rejected",
            Verdict::NotVisible => "not_visible",
        }
    }
}

/// Classifies an oracle reply by tag, case-insensitively.
///
/// `<NOT_VISIBLE>` wins over `<INVALID>`; anything else, including a bare
/// explanation without tags, counts as confirmation. The oracle is asked
/// to flag problems explicitly, so silence means assent.
pub fn parse_verdict(raw: &str) -> Verdict {
    let upper = raw.to_ascii_uppercase();
    if upper.contains(NOT_VISIBLE_TAG) {
        Verdict::NotVisible
    } else if upper.contains(INVALID_TAG) {
        Verdict::Rejected
    } else {
        Verdict::Confirmed
    }
}

/// Outcome of one correction call against a confirmed candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrectionOutcome {
    /// The candidate already matches the printed number.
    Unchanged,
    /// The model read a different number; the canonical replacement.
    Corrected(String),
}

/// Parses a correction reply relative to the current canonical candidate.
///
/// `SAME`, `NONE`, a missing delimited span, or a span that canonicalizes
/// to the current candidate all mean no change. Only a genuinely different
/// canonical reading produces a correction.
pub fn parse_correction(raw: &str, current: &str) -> CorrectionOutcome {
    let Some(payload) = catalog::extract_delimited(raw).map(str::trim) else {
        return CorrectionOutcome::Unchanged;
    };
    if payload.is_empty()
        || payload.eq_ignore_ascii_case(SAME_SENTINEL)
        || payload.eq_ignore_ascii_case(NONE_SENTINEL)
    {
        return CorrectionOutcome::Unchanged;
    }
    let canonical = catalog::canonicalize(payload);
    if canonical == current {
        CorrectionOutcome::Unchanged
    } else {
        CorrectionOutcome::Corrected(canonical)
    }
}
