//! Wiki page classification for the audit.
//!
//! A page is a manual or a use-case document depending on words in its title
//! and slug. The rules live in one table so they can be tested and changed
//! without touching the aggregation.

use crate::models::AuditEventType;

/// Kind of documentation page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocKind {
    Manual,
    UseCase,
}

enum Matcher {
    /// Substring of the normalised text.
    Contains(&'static str),
    /// Whole word of the normalised text.
    Word(&'static str),
    /// `cu` immediately followed by a digit.
    CuNumber,
}

impl Matcher {
    fn matches(&self, text: &str, words: &[&str]) -> bool {
        match self {
            Self::Contains(needle) => text.contains(needle),
            Self::Word(word) => words.contains(word),
            Self::CuNumber => text
                .match_indices("cu")
                .any(|(idx, _)| text[idx + 2..].starts_with(|c: char| c.is_ascii_digit())),
        }
    }
}

/// Checked top to bottom; the first match wins.
const RULES: &[(DocKind, Matcher)] = &[
    (DocKind::Manual, Matcher::Contains("manual")),
    (DocKind::Manual, Matcher::Contains("guia")),
    (DocKind::Manual, Matcher::Contains("guía")),
    (DocKind::UseCase, Matcher::Word("caso")),
    (DocKind::UseCase, Matcher::Word("casos")),
    (DocKind::UseCase, Matcher::Word("cu")),
    (DocKind::UseCase, Matcher::Contains("use case")),
    (DocKind::UseCase, Matcher::Contains(".cu")),
    (DocKind::UseCase, Matcher::CuNumber),
];

/// Lowercase `title slug` with `_`, `-` and `/` turned into spaces.
fn normalise(title: &str, slug: &str) -> String {
    format!("{} {}", title, slug)
        .to_lowercase()
        .replace(['_', '-', '/'], " ")
}

/// Classify a wiki page, or `None` when it is neither a manual nor a use case.
pub fn classify_page(title: &str, slug: &str) -> Option<DocKind> {
    let text = normalise(title, slug);
    let words: Vec<&str> = text.split_whitespace().collect();
    RULES
        .iter()
        .find(|(_, matcher)| matcher.matches(&text, &words))
        .map(|(kind, _)| *kind)
}

/// Audit event type for a wiki action on a page of the given kind.
///
/// Only `created` and `updated` count; deletions and other actions yield `None`.
pub fn wiki_event_type(kind: DocKind, action_name: &str) -> Option<AuditEventType> {
    let action = action_name.trim().to_ascii_lowercase();
    let event_type = match (kind, action.as_str()) {
        (DocKind::Manual, "created") => AuditEventType::ManualCreated,
        (DocKind::Manual, "updated") => AuditEventType::ManualUpdated,
        (DocKind::UseCase, "created") => AuditEventType::DocCreated,
        (DocKind::UseCase, "updated") => AuditEventType::DocUpdated,
        _ => return None,
    };
    Some(event_type)
}
