/// Opening delimiter the model is told to wrap its answer in.
pub const ANSWER_START: &str = "<START>";
/// Closing delimiter.
pub const ANSWER_END: &str = "<END>";
/// Sentinel reply meaning "no catalog number found in this photo".
pub const NONE_SENTINEL: &str = "NONE";

/// Returns the payload between the last `<START>` and the first `<END>`
/// after it. Model replies often quote the delimiters while reasoning, so
/// only the final delimited span counts. Both markers must be present.
pub fn extract_delimited(raw: &str) -> Option<&str> {
    let start = raw.rfind(ANSWER_START)?;
    let tail = &raw[start + ANSWER_START.len()..];
    let end = tail.find(ANSWER_END)?;
    Some(&tail[..end])
}

/// Parses a raw extraction reply into a canonical candidate.
///
/// Missing delimiters, an empty payload, or the `NONE` sentinel (any case)
/// all collapse to `None`; everything upstream of the delimiters is
/// untrusted prose and never an error.
pub fn parse_candidate(raw: &str) -> Option<String> {
    let payload = extract_delimited(raw)?.trim();
    if payload.is_empty() || payload.eq_ignore_ascii_case(NONE_SENTINEL) {
        return None;
    }
    Some(canonicalize(payload))
}

/// Collapses a raw candidate into the canonical spaced form.
///
/// Whitespace and hyphens are stripped, letters uppercased, and the
/// remaining payload sliced positionally into three three-character groups
/// plus one trailing group for whatever is left (suffix letters or the
/// tail of a long third segment). Re-running the function on its own
/// output strips the inserted spaces and re-slices the same payload, so it
/// is idempotent.
pub fn canonicalize(raw: &str) -> String {
    let compact: Vec<char> = raw
        .chars()
        .filter(|ch| !ch.is_whitespace() && *ch != '-')
        .map(|ch| ch.to_ascii_uppercase())
        .collect();

    let mut groups: Vec<String> = Vec::new();
    let mut cursor = 0;
    for _ in 0..3 {
        if cursor >= compact.len() {
            break;
        }
        let end = (cursor + 3).min(compact.len());
        groups.push(compact[cursor..end].iter().collect());
        cursor = end;
    }
    if cursor < compact.len() {
        groups.push(compact[cursor..].iter().collect());
    }
    groups.join(" ")
}

#[cfg(test)]
mod tests {
    use super::{canonicalize, extract_delimited, parse_candidate};

    #[test]
    fn parse_candidate_formats_inline_answer() {
        let parsed = parse_candidate("blah <START> 5K0937087AC <END> blah");
        assert_eq!(parsed.as_deref(), Some("5K0 937 087 AC"));
    }

    #[test]
    fn extract_uses_last_start_and_first_end() {
        let raw = "<START> draft <END> ignored <START> 1K0937087 <END> trailing <END>";
        assert_eq!(extract_delimited(raw), Some(" 1K0937087 "));
    }

    #[test]
    fn extract_requires_both_delimiters() {
        assert_eq!(extract_delimited("no markers at all"), None);
        assert_eq!(extract_delimited("<START> 5K0 937 087"), None);
        assert_eq!(extract_delimited("5K0 937 087 <END>"), None);
        // <END> before the last <START> does not count.
        assert_eq!(extract_delimited("<END> text <START> 5K0"), None);
    }

    #[test]
    fn parse_candidate_folds_none_sentinel() {
        assert_eq!(parse_candidate("<START> NONE <END>"), None);
        assert_eq!(parse_candidate("<START>none<END>"), None);
        assert_eq!(parse_candidate("<START>   <END>"), None);
        assert_eq!(parse_candidate("the label is blurry, sorry"), None);
    }

    #[test]
    fn canonicalize_nine_character_payload() {
        assert_eq!(canonicalize("1K0937087"), "1K0 937 087");
        assert_eq!(canonicalize("1k0 937-087"), "1K0 937 087");
    }

    #[test]
    fn canonicalize_trailing_group_holds_suffix() {
        assert_eq!(canonicalize("5K0937087AC"), "5K0 937 087 AC");
        assert_eq!(canonicalize("5Q0407721B"), "5Q0 407 721 B");
        assert_eq!(canonicalize("04L131113K1012"), "04L 131 113 K1012");
    }

    #[test]
    fn canonicalize_is_idempotent() {
        for raw in [
            "5K0937087AC",
            "1K0 937 087",
            "06A-906-461-L",
            "short",
            "AB",
            "5k0937087ac",
        ] {
            let once = canonicalize(raw);
            assert_eq!(canonicalize(&once), once, "failed for {raw:?}");
        }
    }

    #[test]
    fn canonicalize_short_payload_keeps_single_group() {
        assert_eq!(canonicalize("AB"), "AB");
        assert_eq!(canonicalize("a-b "), "AB");
        assert_eq!(canonicalize(""), "");
    }
}
