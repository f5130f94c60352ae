use crate::message::{Part, PartState};

/// Display-ready form of one part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderUnit {
    Markdown {
        text: String,
        streaming: bool,
    },
    Reasoning {
        text: String,
        streaming: bool,
    },
    Attachment {
        media_type: String,
        url: String,
        label: String,
    },
    Citation {
        title: String,
        url: Option<String>,
    },
}

impl RenderUnit {
    /// Plain-text body, growing monotonically while the unit streams.
    pub fn body(&self) -> String {
        match self {
            Self::Markdown { text, .. } | Self::Reasoning { text, .. } => text.clone(),
            Self::Attachment {
                media_type,
                url,
                label,
            } => format!("[{label}] ({media_type}) {url}"),
            Self::Citation {
                title,
                url: Some(url),
            } => format!("[source] {title} <{url}>"),
            Self::Citation { title, url: None } => format!("[source] {title}"),
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Self::Markdown {
                streaming: true,
                ..
            } | Self::Reasoning {
                streaming: true,
                ..
            }
        )
    }
}

/// Maps a part to its display unit.
pub fn render_part(part: &Part) -> RenderUnit {
    match part {
        Part::Text { text, state } => RenderUnit::Markdown {
            text: text.clone(),
            streaming: *state == PartState::Streaming,
        },
        Part::Reasoning { text, state } => RenderUnit::Reasoning {
            text: text.clone(),
            streaming: *state == PartState::Streaming,
        },
        Part::File {
            media_type,
            url,
            filename,
        } => RenderUnit::Attachment {
            media_type: media_type.clone(),
            url: url.clone(),
            label: filename.clone().unwrap_or_else(|| "file".to_string()),
        },
        Part::SourceUrl { url, title, .. } => RenderUnit::Citation {
            title: title.clone().unwrap_or_else(|| url.clone()),
            url: Some(url.clone()),
        },
        Part::SourceDocument {
            title, filename, ..
        } => RenderUnit::Citation {
            title: filename
                .as_ref()
                .map(|filename| format!("{title} ({filename})"))
                .unwrap_or_else(|| title.clone()),
            url: None,
        },
    }
}

#[derive(Debug, Clone)]
struct CachedUnit {
    part: Part,
    unit: RenderUnit,
}

/// Projects a message's parts into render units, re-rendering only parts
/// that changed since the previous projection.
#[derive(Debug, Default)]
pub struct DisplayProjector {
    cache: Vec<CachedUnit>,
    render_count: usize,
}

impl DisplayProjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project(&mut self, parts: &[Part]) -> Vec<&RenderUnit> {
        self.cache.truncate(parts.len());

        for (index, part) in parts.iter().enumerate() {
            if self
                .cache
                .get(index)
                .is_some_and(|cached| cached.part == *part)
            {
                continue;
            }

            let entry = CachedUnit {
                part: part.clone(),
                unit: render_part(part),
            };
            self.render_count += 1;
            match self.cache.get_mut(index) {
                Some(slot) => *slot = entry,
                None => self.cache.push(entry),
            }
        }

        self.cache
            .iter()
            .map(|cached| &cached.unit)
            .collect()
    }

    /// Number of parts rendered since construction.
    pub fn render_count(&self) -> usize {
        self.render_count
    }

    pub fn reset(&mut self) {
        self.cache.clear();
    }
}
