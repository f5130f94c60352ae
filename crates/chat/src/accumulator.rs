use murmur_llm::StreamEvent;

use crate::message::{Part, PartKind, PartState};

/// Lifecycle of a [`MessageAccumulator`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AccumulatorState {
    #[default]
    Open,
    Finished,
    Failed(String),
    /// Stopped by a cancel or timeout; later events are dropped.
    Frozen,
}

/// What one `apply` call did to the accumulated parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Text was appended to the open part.
    Appended,
    /// A new part was pushed.
    Opened,
    Finished,
    Failed(String),
    Ignored,
}

/// Folds provider stream events into an ordered, append-only list of parts.
///
/// At most one part is open at a time and it is always the last one. Consecutive
/// deltas of the same kind extend the open part; a kind change closes it first.
#[derive(Debug, Clone, Default)]
pub struct MessageAccumulator {
    parts: Vec<Part>,
    open_part: Option<usize>,
    full_text: Option<String>,
    state: AccumulatorState,
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: StreamEvent) -> ApplyOutcome {
        if self.state != AccumulatorState::Open {
            return ApplyOutcome::Ignored;
        }

        match event {
            StreamEvent::TextDelta(delta) => self.push_delta(PartKind::Text, delta),
            StreamEvent::ReasoningDelta(delta) => self.push_delta(PartKind::Reasoning, delta),
            StreamEvent::File(file) => self.push_closed(file.into()),
            StreamEvent::Source(source) => self.push_closed(source.into()),
            StreamEvent::Done(summary) => {
                self.close_open_part();
                self.full_text = summary.full_text;
                self.state = AccumulatorState::Finished;
                ApplyOutcome::Finished
            }
            StreamEvent::Error(message) => {
                self.close_open_part();
                self.state = AccumulatorState::Failed(message.clone());
                ApplyOutcome::Failed(message)
            }
        }
    }

    /// Stops accepting events. Returns false when the stream already ended.
    pub fn freeze(&mut self) -> bool {
        if self.state != AccumulatorState::Open {
            return false;
        }
        self.close_open_part();
        self.state = AccumulatorState::Frozen;
        true
    }

    /// Copy of the current parts; later events never alter a returned snapshot.
    pub fn snapshot(&self) -> Vec<Part> {
        self.parts.clone()
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Provider-reported full text, available once `Done` has been applied.
    pub fn full_text(&self) -> Option<&str> {
        self.full_text.as_deref()
    }

    pub fn state(&self) -> &AccumulatorState {
        &self.state
    }

    fn push_delta(&mut self, kind: PartKind, delta: String) -> ApplyOutcome {
        if delta.is_empty() {
            return ApplyOutcome::Ignored;
        }

        if let Some(index) = self.open_part
            && let Some(part) = self.parts.get_mut(index)
            && part.kind() == kind
        {
            part.push_text(&delta);
            return ApplyOutcome::Appended;
        }

        self.close_open_part();
        let part = match kind {
            PartKind::Reasoning => Part::reasoning(delta, PartState::Streaming),
            _ => Part::text(delta, PartState::Streaming),
        };
        self.parts.push(part);
        self.open_part = Some(self.parts.len() - 1);
        ApplyOutcome::Opened
    }

    fn push_closed(&mut self, part: Part) -> ApplyOutcome {
        self.close_open_part();
        self.parts.push(part);
        ApplyOutcome::Opened
    }

    fn close_open_part(&mut self) {
        if let Some(index) = self.open_part.take()
            && let Some(part) = self.parts.get_mut(index)
        {
            part.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use murmur_llm::{FileRef, FinishSummary, SourceRef};

    use super::*;

    fn text(delta: &str) -> StreamEvent {
        StreamEvent::TextDelta(delta.to_string())
    }

    fn reasoning(delta: &str) -> StreamEvent {
        StreamEvent::ReasoningDelta(delta.to_string())
    }

    #[test]
    fn consecutive_text_deltas_extend_one_part() {
        let mut accumulator = MessageAccumulator::new();

        assert_eq!(accumulator.apply(text("He")), ApplyOutcome::Opened);
        assert_eq!(accumulator.apply(text("llo")), ApplyOutcome::Appended);

        assert_eq!(
            accumulator.parts(),
            &[Part::text("Hello", PartState::Streaming)]
        );
    }

    #[test]
    fn kind_change_closes_previous_part() {
        let mut accumulator = MessageAccumulator::new();
        accumulator.apply(reasoning("let me think"));
        accumulator.apply(text("Answer"));
        accumulator.apply(reasoning("more"));

        assert_eq!(
            accumulator.parts(),
            &[
                Part::reasoning("let me think", PartState::Done),
                Part::text("Answer", PartState::Done),
                Part::reasoning("more", PartState::Streaming),
            ]
        );
    }

    #[test]
    fn at_most_one_part_is_streaming_and_it_is_last() {
        let mut accumulator = MessageAccumulator::new();
        let events = [
            text("a"),
            reasoning("b"),
            StreamEvent::File(FileRef {
                media_type: "image/png".to_string(),
                url: "https://example.com/a.png".to_string(),
                filename: None,
            }),
            text("c"),
            text("d"),
            StreamEvent::Source(SourceRef::Url {
                source_id: "s1".to_string(),
                url: "https://example.com".to_string(),
                title: Some("Example".to_string()),
            }),
            reasoning("e"),
        ];

        for event in events {
            accumulator.apply(event);
            let parts = accumulator.parts();
            let streaming = parts.iter().filter(|part| !part.is_done()).count();
            assert!(streaming <= 1);
            if streaming == 1 {
                assert!(!parts.last().expect("a part").is_done());
            }
        }
    }

    #[test]
    fn empty_delta_is_ignored() {
        let mut accumulator = MessageAccumulator::new();
        assert_eq!(accumulator.apply(text("")), ApplyOutcome::Ignored);
        assert!(accumulator.parts().is_empty());
    }

    #[test]
    fn done_closes_open_part_and_records_full_text() {
        let mut accumulator = MessageAccumulator::new();
        accumulator.apply(text("Hello"));

        let outcome = accumulator.apply(StreamEvent::Done(FinishSummary {
            full_text: Some("Hello".to_string()),
        }));

        assert_eq!(outcome, ApplyOutcome::Finished);
        assert_eq!(accumulator.full_text(), Some("Hello"));
        assert_eq!(accumulator.parts(), &[Part::text("Hello", PartState::Done)]);
        assert_eq!(accumulator.apply(text("late")), ApplyOutcome::Ignored);
    }

    #[test]
    fn error_event_fails_the_accumulator() {
        let mut accumulator = MessageAccumulator::new();
        accumulator.apply(text("partial"));

        let outcome = accumulator.apply(StreamEvent::Error("boom".to_string()));

        assert_eq!(outcome, ApplyOutcome::Failed("boom".to_string()));
        assert_eq!(
            accumulator.state(),
            &AccumulatorState::Failed("boom".to_string())
        );
        assert!(!accumulator.freeze());
    }

    #[test]
    fn snapshot_is_not_mutated_by_later_events() {
        let mut accumulator = MessageAccumulator::new();
        accumulator.apply(text("He"));
        let before = accumulator.snapshot();

        accumulator.apply(text("llo"));
        accumulator.apply(reasoning("hmm"));

        assert_eq!(before, vec![Part::text("He", PartState::Streaming)]);
        assert_eq!(accumulator.parts().len(), 2);
    }

    #[test]
    fn snapshots_are_independent_copies() {
        let mut accumulator = MessageAccumulator::new();
        accumulator.apply(reasoning("plan"));
        accumulator.apply(text("He"));

        let mut first = accumulator.snapshot();
        let second = accumulator.snapshot();
        assert_eq!(first, second);

        first[1].push_text("llo");
        first[1].close();
        first.push(Part::text("extra", PartState::Done));

        let expected = vec![
            Part::reasoning("plan", PartState::Done),
            Part::text("He", PartState::Streaming),
        ];
        assert_eq!(second, expected);
        assert_eq!(accumulator.parts(), expected.as_slice());
        assert_eq!(accumulator.apply(text("y")), ApplyOutcome::Appended);
        assert_eq!(
            accumulator.parts()[1],
            Part::text("Hey", PartState::Streaming)
        );
    }

    #[test]
    fn frozen_accumulator_drops_events() {
        let mut accumulator = MessageAccumulator::new();
        accumulator.apply(text("He"));

        assert!(accumulator.freeze());
        assert_eq!(accumulator.apply(text("llo")), ApplyOutcome::Ignored);
        assert_eq!(accumulator.parts(), &[Part::text("He", PartState::Done)]);
    }
}
