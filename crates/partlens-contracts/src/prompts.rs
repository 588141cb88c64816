use crate::catalog::{ANSWER_END, ANSWER_START, NONE_SENTINEL};
use crate::session::RejectionMemory;
use crate::verdict::{
    CONFUSABLE_GLYPHS, INVALID_TAG, NOT_VISIBLE_TAG, SAME_SENTINEL, VALID_TAG,
};

const NUMBER_SHAPE: &str = "\
A VAG catalog number is printed as three groups of three characters, \
sometimes followed by a short fourth group: the first group mixes digits \
and letters (for example 5K0 or 06A), the second group is three digits, \
the third group is three or four digits, and an optional one or two letter \
index like AC may follow. Ignore separate version codes such as V02 and \
any barcode digits; only the catalog number itself counts.";

const LABEL_HINTS: &str = "\
The number is usually printed on a white or silver sticker, often directly \
above or below a barcode. It can be small, at an angle, or partly worn.";

const RETRY_HINTS: &str = "\
Search the whole photo again before answering: check the area above each \
barcode, text printed upside down or sideways, and small labels near the \
edges of the part. Do not repeat an answer that was already wrong.";

fn answer_format_line() -> String {
    format!(
        "Reply with the catalog number between {ANSWER_START} and {ANSWER_END}, \
for example {ANSWER_START} 5K0 937 087 {ANSWER_END}. If you cannot find it, \
reply with {ANSWER_START} {NONE_SENTINEL} {ANSWER_END}."
    )
}

fn rejected_lines(memory: &RejectionMemory) -> String {
    memory
        .entries()
        .map(|(candidate, count)| {
            if count > 1 {
                format!("- {candidate} (rejected {count} times)")
            } else {
                format!("- {candidate}")
            }
        })
        .collect::<Vec<String>>()
        .join("\n")
}

fn confusable_lines() -> String {
    CONFUSABLE_GLYPHS
        .iter()
        .map(|(left, right)| format!("{left} and {right}"))
        .collect::<Vec<String>>()
        .join(", ")
}

/// First-round extraction instruction.
pub fn extraction_instruction() -> String {
    format!(
        "The photo shows a car part from a Volkswagen Group vehicle, \
photographed for an auction listing. Find the manufacturer catalog number \
printed on the part or its label.\n\n{NUMBER_SHAPE}\n\n{LABEL_HINTS}\n\n{}",
        answer_format_line()
    )
}

/// Replacement instruction after a failed round. Lists every candidate the
/// session has already rejected so the model stops proposing them.
pub fn retry_instruction(memory: &RejectionMemory) -> String {
    let mut text = String::from(
        "Your previous answer was not the correct catalog number for this \
part.\n",
    );
    if !memory.is_empty() {
        text.push_str("\nThese readings were already checked and are wrong:\n");
        text.push_str(&rejected_lines(memory));
        text.push('\n');
    }
    text.push('\n');
    text.push_str(RETRY_HINTS);
    text.push_str("\n\n");
    text.push_str(&answer_format_line());
    text
}

/// Oracle instruction for one candidate. The oracle sees only the photo,
/// the claim, and what was already rejected, never the extraction
/// conversation.
pub fn validation_instruction(candidate: &str, memory: &RejectionMemory) -> String {
    let mut text = format!(
        "A previous analysis of this photo claims the manufacturer catalog \
number printed on the part is: {candidate}\n\nCheck the photo character by \
character and decide whether that exact number is really printed \
there.\n\n{NUMBER_SHAPE}\n"
    );
    if !memory.is_empty() {
        text.push_str(
            "\nThese readings were already rejected for this photo; do not \
confirm any of them:\n",
        );
        text.push_str(&rejected_lines(memory));
        text.push('\n');
    }
    text.push_str(&format!(
        "\nReply with {VALID_TAG} if the number matches the label exactly, \
{INVALID_TAG} if it does not, or {NOT_VISIBLE_TAG} if no catalog number is \
readable in this photo. Add one short line explaining your decision."
    ));
    text
}

/// Second-look instruction after a candidate is confirmed. Targets the
/// glyph swaps the extractor actually makes.
pub fn correction_instruction(candidate: &str) -> String {
    format!(
        "The catalog number in this photo was read as: {candidate}\n\n\
Characters that look alike are often swapped when reading printed labels, \
especially {}. Read the printed number one more time, character by \
character, comparing it position by position with the reading above.\n\n\
If the printed number differs, reply with the exact printed number between \
{ANSWER_START} and {ANSWER_END}. If the reading above is already exact, \
reply with {ANSWER_START} {SAME_SENTINEL} {ANSWER_END}.",
        confusable_lines()
    )
}

#[cfg(test)]
mod tests {
    use crate::catalog::{ANSWER_END, ANSWER_START};
    use crate::session::RejectionMemory;

    use super::{
        correction_instruction, extraction_instruction, retry_instruction,
        validation_instruction,
    };

    #[test]
    fn extraction_instruction_names_answer_format() {
        let text = extraction_instruction();
        assert!(text.contains(ANSWER_START));
        assert!(text.contains(ANSWER_END));
        assert!(text.contains("NONE"));
        assert!(text.contains("three groups"));
    }

    #[test]
    fn retry_instruction_lists_rejected_candidates_with_counts() {
        let mut memory = RejectionMemory::new();
        memory.record("5K0 937 087 AC");
        memory.record("1K0 937 087");
        memory.record("5K0 937 087 AC");

        let text = retry_instruction(&memory);
        assert!(text.contains("- 5K0 937 087 AC (rejected 2 times)"));
        assert!(text.contains("- 1K0 937 087"));
        assert!(text.contains("above each"));
        assert!(text.contains(ANSWER_START));
    }

    #[test]
    fn retry_instruction_without_memory_skips_rejected_section() {
        let text = retry_instruction(&RejectionMemory::new());
        assert!(!text.contains("already checked"));
        assert!(text.contains(ANSWER_START));
    }

    #[test]
    fn validation_instruction_embeds_candidate_and_memory() {
        let mut memory = RejectionMemory::new();
        memory.record("8E0 837 019");

        let text = validation_instruction("5K0 937 087 AC", &memory);
        assert!(text.contains("5K0 937 087 AC"));
        assert!(text.contains("- 8E0 837 019"));
        assert!(text.contains("<VALID>"));
        assert!(text.contains("<INVALID>"));
        assert!(text.contains("<NOT_VISIBLE>"));
    }

    #[test]
    fn correction_instruction_names_confusable_glyphs() {
        let text = correction_instruction("5K0 937 087 AC");
        assert!(text.contains("5K0 937 087 AC"));
        assert!(text.contains("0 and O"));
        assert!(text.contains("S and 5"));
        assert!(text.contains("SAME"));
    }
}
