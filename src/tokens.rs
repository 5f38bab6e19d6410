/// Pluggable token accounting shared by the context builder, the smart
/// collector, and the splitter, so every budget in the system agrees on what
/// a token is.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Default counter: `max(1, ceil(chars / chars_per_token))`.
///
/// The ~4-chars-per-token heuristic tracks real tokenizers closely enough for
/// budgeting; an exact provider-specific counter can be injected instead.
#[derive(Debug, Clone)]
pub struct HeuristicCounter {
    pub chars_per_token: usize,
}

impl HeuristicCounter {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for HeuristicCounter {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl TokenCounter for HeuristicCounter {
    fn count(&self, text: &str) -> usize {
        let chars = text.chars().count();
        chars.div_ceil(self.chars_per_token).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_hundred_chars_is_fifty_tokens() {
        let counter = HeuristicCounter::default();
        let text = "x".repeat(200);
        assert_eq!(counter.count(&text), 50);
    }

    #[test]
    fn count_never_drops_below_one() {
        let counter = HeuristicCounter::default();
        assert_eq!(counter.count(""), 1);
        assert_eq!(counter.count("a"), 1);
    }

    #[test]
    fn counts_runes_not_bytes() {
        let counter = HeuristicCounter::default();
        // Four 3-byte runes: one token, not three.
        assert_eq!(counter.count("日本語字"), 1);
    }
}
