use std::io::{self, Write};

use murmur_chat::{
    ConversationRecord, DisplayProjector, Message, MessageStatus, Part, RenderUnit, Role,
};

/// Incrementally prints a streaming message, writing only the newly appended text.
#[derive(Debug, Default)]
pub struct StreamPrinter {
    projector: DisplayProjector,
    printed: Vec<usize>,
}

impl StreamPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, parts: &[Part], out: &mut impl Write) -> io::Result<()> {
        let units = self.projector.project(parts);
        for (index, unit) in units.into_iter().enumerate() {
            if index == self.printed.len() {
                if index > 0 {
                    writeln!(out)?;
                }
                out.write_all(unit_prefix(unit).as_bytes())?;
                self.printed.push(0);
            }

            let body = unit.body();
            let Some(printed) = self.printed.get_mut(index) else {
                continue;
            };
            if let Some(rest) = body.get(*printed..)
                && !rest.is_empty()
            {
                out.write_all(rest.as_bytes())?;
                *printed = body.len();
            }
        }
        out.flush()
    }
}

fn unit_prefix(unit: &RenderUnit) -> &'static str {
    match unit {
        RenderUnit::Reasoning { .. } => "(thinking) ",
        RenderUnit::Markdown { .. } | RenderUnit::Attachment { .. } | RenderUnit::Citation { .. } => {
            ""
        }
    }
}

pub fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "assistant",
    }
}

/// Trailing note for messages that did not end up saved.
pub fn status_note(status: &MessageStatus) -> Option<String> {
    match status {
        MessageStatus::Cancelled => Some("[stopped]".to_string()),
        MessageStatus::Failed(reason) => Some(format!("[failed: {reason}]")),
        MessageStatus::Unsaved(reason) => Some(format!("[not saved: {reason}]")),
        MessageStatus::Pending | MessageStatus::Streaming(_) | MessageStatus::Done => None,
    }
}

pub fn write_message(message: &Message, out: &mut impl Write) -> io::Result<()> {
    write!(out, "{}> ", role_label(message.role))?;
    StreamPrinter::new().update(&message.parts, out)?;
    if let Some(note) = status_note(&message.status) {
        write!(out, " {note}")?;
    }
    writeln!(out)
}

/// Coarse age of a timestamp, e.g. `5m ago`.
pub fn format_age(then_unix_millis: u64, now_unix_millis: u64) -> String {
    let seconds = now_unix_millis.saturating_sub(then_unix_millis) / 1000;
    match seconds {
        0..60 => "just now".to_string(),
        60..3600 => format!("{}m ago", seconds / 60),
        3600..86_400 => format!("{}h ago", seconds / 3600),
        _ => format!("{}d ago", seconds / 86_400),
    }
}

pub fn write_conversation_list(
    conversations: &[ConversationRecord],
    now_unix_millis: u64,
    out: &mut impl Write,
) -> io::Result<()> {
    if conversations.is_empty() {
        return writeln!(out, "no conversations yet");
    }
    for (index, conversation) in conversations.iter().enumerate() {
        writeln!(
            out,
            "{:>3}. {}  ({})",
            index + 1,
            conversation.title,
            format_age(conversation.updated_at_unix_millis, now_unix_millis)
        )?;
    }
    Ok(())
}
