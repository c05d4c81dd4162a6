/// Amount as entered by the user.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AmountInput {
    /// Sats.
    Native(u64),
    /// Fiat, in the price converter's currency.
    Fiat(f64),
}

/// Cut `comment` to at most `max_chars` characters. Empty results and a
/// recipient that takes no comments (`0`) yield `None`.
pub fn truncate_comment(comment: &str, max_chars: usize) -> Option<String> {
    let trimmed = comment.trim();
    if trimmed.is_empty() || max_chars == 0 {
        return None;
    }
    Some(trimmed.chars().take(max_chars).collect())
}
