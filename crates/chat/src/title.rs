use murmur_storage::DEFAULT_CONVERSATION_TITLE;

/// Longest title kept before truncation, in characters.
pub const CONVERSATION_TITLE_LENGTH: usize = 50;

/// Derives a conversation title from its first user message.
pub fn generate_conversation_title(content: &str) -> String {
    let cleaned = content
        .trim()
        .chars()
        .map(|ch| if ch == '\n' || ch == '\r' { ' ' } else { ch })
        .collect::<String>();

    if cleaned.is_empty() {
        return DEFAULT_CONVERSATION_TITLE.to_string();
    }

    if cleaned.chars().count() > CONVERSATION_TITLE_LENGTH {
        let mut title = cleaned
            .chars()
            .take(CONVERSATION_TITLE_LENGTH)
            .collect::<String>();
        title.push_str("...");
        return title;
    }

    cleaned
}
