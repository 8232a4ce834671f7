use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::media::MediaSlots;
use crate::message::{ChatMessage, MessageId};
use crate::tags::{TagExtractor, TagKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Unprocessed,
    NeedsFirstGeneration,
    RestoreOnly,
    Processed,
    Skip,
}

impl ProcessingState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingState::Unprocessed => "unprocessed",
            ProcessingState::NeedsFirstGeneration => "needs_first_generation",
            ProcessingState::RestoreOnly => "restore_only",
            ProcessingState::Processed => "processed",
            ProcessingState::Skip => "skip",
        }
    }

    /// True for the states that start a processing pass.
    pub fn is_actionable(self) -> bool {
        matches!(
            self,
            ProcessingState::NeedsFirstGeneration | ProcessingState::RestoreOnly
        )
    }
}

/// Messages already handled in the active chat session.
///
/// Cleared on chat switch; a single entry is dropped when that message's
/// content is regenerated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingContext {
    processed: BTreeSet<MessageId>,
}

impl ProcessingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_processed(&self, id: MessageId) -> bool {
        self.processed.contains(&id)
    }

    pub fn mark_processed(&mut self, id: MessageId) {
        self.processed.insert(id);
    }

    pub fn on_chat_switch(&mut self) {
        self.processed.clear();
    }

    /// Returns whether an entry was dropped.
    pub fn on_content_changed(&mut self, id: MessageId) -> bool {
        self.processed.remove(&id)
    }

    pub fn state(&self, id: MessageId) -> ProcessingState {
        if self.is_processed(id) {
            ProcessingState::Processed
        } else {
            ProcessingState::Unprocessed
        }
    }

    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }
}

/// Picks the pass to run for `message` on a render-completed signal.
pub fn decide(
    message: &ChatMessage,
    context: &ProcessingContext,
    extractor: &TagExtractor,
) -> ProcessingState {
    if message.is_user || message.is_system || message.text.trim().is_empty() {
        return ProcessingState::Skip;
    }
    if context.is_processed(message.id) {
        return ProcessingState::Skip;
    }

    let slots = MediaSlots::from_message(message);
    let has_image_tag = extractor.has_open_tag(&message.text, TagKind::Image);
    let has_voice_tag = extractor.has_open_tag(&message.text, TagKind::VoiceNote);

    if has_image_tag || (has_voice_tag && !slots.has_kind(TagKind::VoiceNote)) {
        ProcessingState::NeedsFirstGeneration
    } else if !slots.is_empty() {
        ProcessingState::RestoreOnly
    } else {
        ProcessingState::Skip
    }
}

#[cfg(test)]
mod tests {
    use super::{decide, ProcessingContext, ProcessingState};
    use crate::media::{ImageRecord, MediaRecord, MediaSlots};
    use crate::message::{ChatMessage, MessageId};
    use crate::tags::{SlotKey, TagExtractor, TagMarkers};

    fn with_slots(mut message: ChatMessage, slots: &MediaSlots) -> ChatMessage {
        slots.write_to(&mut message);
        message
    }

    fn image_slot() -> anyhow::Result<MediaSlots> {
        let mut slots = MediaSlots::new();
        slots.upsert(
            SlotKey::image(0),
            MediaRecord::Image(ImageRecord::new("https://img/0.png", "cat")),
        )?;
        Ok(slots)
    }

    #[test]
    fn plain_message_without_media_is_skipped() -> anyhow::Result<()> {
        let extractor = TagExtractor::new(TagMarkers::default())?;
        let context = ProcessingContext::new();
        let message = ChatMessage::assistant(1, "just words");
        assert_eq!(decide(&message, &context, &extractor), ProcessingState::Skip);
        Ok(())
    }

    #[test]
    fn human_system_and_empty_messages_are_skipped() -> anyhow::Result<()> {
        let extractor = TagExtractor::new(TagMarkers::default())?;
        let context = ProcessingContext::new();
        let user = ChatMessage::user(1, "[IMG]cat[/IMG]");
        let mut system = ChatMessage::assistant(2, "[IMG]cat[/IMG]");
        system.is_system = true;
        let empty = ChatMessage::assistant(3, "  ");
        for message in [user, system, empty] {
            assert_eq!(decide(&message, &context, &extractor), ProcessingState::Skip);
        }
        Ok(())
    }

    #[test]
    fn image_tag_without_slots_needs_generation() -> anyhow::Result<()> {
        let extractor = TagExtractor::new(TagMarkers::default())?;
        let message = ChatMessage::assistant(1, "hi [IMG]a red bicycle[/IMG] bye");
        assert_eq!(
            decide(&message, &ProcessingContext::new(), &extractor),
            ProcessingState::NeedsFirstGeneration
        );
        Ok(())
    }

    #[test]
    fn voice_tag_without_voice_record_needs_generation() -> anyhow::Result<()> {
        let extractor = TagExtractor::new(TagMarkers::default())?;
        let message = with_slots(
            ChatMessage::assistant(1, "[VOICE]hello there[/VOICE]"),
            &image_slot()?,
        );
        assert_eq!(
            decide(&message, &ProcessingContext::new(), &extractor),
            ProcessingState::NeedsFirstGeneration
        );
        Ok(())
    }

    #[test]
    fn voice_tag_with_voice_record_restores() -> anyhow::Result<()> {
        let extractor = TagExtractor::new(TagMarkers::default())?;
        let mut slots = MediaSlots::new();
        slots.set_voice_text(SlotKey::voice(0), "hello there")?;
        let message = with_slots(ChatMessage::assistant(1, "[VOICE]hello there[/VOICE]"), &slots);
        assert_eq!(
            decide(&message, &ProcessingContext::new(), &extractor),
            ProcessingState::RestoreOnly
        );
        Ok(())
    }

    #[test]
    fn records_without_tags_restore() -> anyhow::Result<()> {
        let extractor = TagExtractor::new(TagMarkers::default())?;
        let message = with_slots(ChatMessage::assistant(1, "hi  bye"), &image_slot()?);
        assert_eq!(
            decide(&message, &ProcessingContext::new(), &extractor),
            ProcessingState::RestoreOnly
        );
        Ok(())
    }

    #[test]
    fn processed_messages_skip_until_invalidated() -> anyhow::Result<()> {
        let extractor = TagExtractor::new(TagMarkers::default())?;
        let mut context = ProcessingContext::new();
        let message = ChatMessage::assistant(7, "[IMG]cat[/IMG]");
        context.mark_processed(MessageId(7));
        context.mark_processed(MessageId(8));
        assert_eq!(context.state(MessageId(7)), ProcessingState::Processed);
        assert_eq!(decide(&message, &context, &extractor), ProcessingState::Skip);

        assert!(context.on_content_changed(MessageId(7)));
        assert!(!context.on_content_changed(MessageId(7)));
        assert_eq!(context.state(MessageId(7)), ProcessingState::Unprocessed);
        assert!(context.is_processed(MessageId(8)));
        assert_eq!(
            decide(&message, &context, &extractor),
            ProcessingState::NeedsFirstGeneration
        );

        context.on_chat_switch();
        assert!(context.is_empty());
        Ok(())
    }
}
