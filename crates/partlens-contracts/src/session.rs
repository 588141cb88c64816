use indexmap::IndexMap;
use serde_json::{json, Value};

/// Per-photograph multiset of rejected candidates.
///
/// Keys stay in first-rejection order so retry instructions list candidates
/// deterministically. One instance lives exactly as long as one photograph
/// session; nothing here survives into the next photo.
#[derive(Debug, Clone, Default)]
pub struct RejectionMemory {
    counts: IndexMap<String, u32>,
}

impl RejectionMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one more rejection and returns the updated count.
    pub fn record(&mut self, candidate: &str) -> u32 {
        let count = self.counts.entry(candidate.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn count(&self, candidate: &str) -> u32 {
        self.counts.get(candidate).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }

    /// Candidates with their rejection counts, in first-rejection order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, u32)> {
        self.counts.iter().map(|(key, count)| (key.as_str(), *count))
    }
}

/// Speaker of one conversation turn, named the way the inference API
/// names its roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

/// Ordered text-only context for one photograph session.
///
/// Each extraction round appends the instruction/reply pair so later rounds
/// see what was already tried. Validation and correction calls never touch
/// this; they run single-turn.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_exchange(&mut self, instruction: &str, reply: &str) {
        self.turns.push(Turn {
            role: Role::User,
            text: instruction.to_string(),
        });
        self.turns.push(Turn {
            role: Role::Model,
            text: reply.to_string(),
        });
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Prior turns rendered as `contents` entries for a generate call. The
    /// caller appends the current user turn (image plus instruction) last.
    pub fn history_values(&self) -> Vec<Value> {
        self.turns
            .iter()
            .map(|turn| {
                json!({
                    "role": turn.role.as_str(),
                    "parts": [{ "text": turn.text }],
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Conversation, RejectionMemory};

    #[test]
    fn memory_counts_repeat_rejections() {
        let mut memory = RejectionMemory::new();
        assert!(memory.is_empty());
        assert_eq!(memory.record("5K0 937 087 AC"), 1);
        assert_eq!(memory.record("1K0 937 087"), 1);
        assert_eq!(memory.record("5K0 937 087 AC"), 2);
        assert_eq!(memory.count("5K0 937 087 AC"), 2);
        assert_eq!(memory.count("unseen"), 0);
        assert_eq!(memory.len(), 2);
    }

    #[test]
    fn memory_preserves_first_rejection_order() {
        let mut memory = RejectionMemory::new();
        memory.record("B");
        memory.record("A");
        memory.record("B");
        let listed: Vec<(&str, u32)> = memory.entries().collect();
        assert_eq!(listed, vec![("B", 2), ("A", 1)]);
    }

    #[test]
    fn memory_clear_forgets_everything() {
        let mut memory = RejectionMemory::new();
        memory.record("A");
        memory.clear();
        assert!(memory.is_empty());
        assert_eq!(memory.count("A"), 0);
    }

    #[test]
    fn conversation_accumulates_exchange_pairs() {
        let mut conversation = Conversation::new();
        assert!(conversation.is_empty());
        conversation.push_exchange("find the number", "<START>NONE<END>");
        conversation.push_exchange("look again", "<START>5K0937087AC<END>");
        assert_eq!(conversation.len(), 4);

        let history = conversation.history_values();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0]["role"], json!("user"));
        assert_eq!(history[0]["parts"][0]["text"], json!("find the number"));
        assert_eq!(history[1]["role"], json!("model"));
        assert_eq!(history[3]["parts"][0]["text"], json!("<START>5K0937087AC<END>"));
    }

    #[test]
    fn conversation_clear_resets_history() {
        let mut conversation = Conversation::new();
        conversation.push_exchange("a", "b");
        conversation.clear();
        assert!(conversation.history_values().is_empty());
    }
}
