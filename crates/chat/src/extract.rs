use crate::message::{Part, PartState};

/// One way of pulling the final assistant text out of a finished turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtractionRule {
    /// The provider's reported full text.
    FullText,
    /// The first closed text part.
    DoneTextPart,
    /// The first text part in any state.
    FirstTextPart,
}

/// Rules tried in order; the first non-empty result wins.
pub const EXTRACTION_ORDER: [ExtractionRule; 3] = [
    ExtractionRule::FullText,
    ExtractionRule::DoneTextPart,
    ExtractionRule::FirstTextPart,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedContent {
    pub rule: ExtractionRule,
    pub content: String,
}

impl ExtractionRule {
    pub fn apply(self, full_text: Option<&str>, parts: &[Part]) -> Option<String> {
        let found = match self {
            Self::FullText => full_text.filter(|text| has_content(text)),
            Self::DoneTextPart => parts.iter().find_map(|part| match part {
                Part::Text {
                    text,
                    state: PartState::Done,
                } if has_content(text) => Some(text.as_str()),
                _ => None,
            }),
            Self::FirstTextPart => parts
                .iter()
                .filter_map(Part::as_text)
                .find(|text| has_content(text)),
        };
        found.map(str::to_owned)
    }
}

/// Picks the persisted content for a finished turn, or `None` when every rule comes up empty.
pub fn extract_final_content(full_text: Option<&str>, parts: &[Part]) -> Option<ExtractedContent> {
    EXTRACTION_ORDER.into_iter().find_map(|rule| {
        rule.apply(full_text, parts)
            .map(|content| ExtractedContent { rule, content })
    })
}

fn has_content(text: &str) -> bool {
    !text.trim().is_empty()
}
