use serde_json::json;
use tagcast_contracts::error::MediaError;
use tagcast_contracts::events::{payload, EventWriter};
use tagcast_contracts::media::{rewrite_voice_text, MediaRecord, MediaSlots};
use tagcast_contracts::message::{ChatLog, ChatMessage, MessageId};
use tagcast_contracts::tags::{SlotKey, TagExtractor};

use crate::persistence::ChatPersistence;

/// Owns the active chat and funnels every media mutation through
/// persistence.
///
/// A failed save is logged as `persist_failed` and remembered; the
/// in-memory change is kept either way.
pub struct MediaStateStore {
    chat: ChatLog,
    persistence: Box<dyn ChatPersistence>,
    events: EventWriter,
    last_persist_error: Option<String>,
}

impl MediaStateStore {
    pub fn new(chat: ChatLog, persistence: Box<dyn ChatPersistence>, events: EventWriter) -> Self {
        Self {
            chat,
            persistence,
            events,
            last_persist_error: None,
        }
    }

    pub fn chat(&self) -> &ChatLog {
        &self.chat
    }

    /// Swaps in another chat without saving either of them.
    pub fn replace_chat(&mut self, chat: ChatLog) -> ChatLog {
        std::mem::replace(&mut self.chat, chat)
    }

    pub fn last_persist_error(&self) -> Option<&str> {
        self.last_persist_error.as_deref()
    }

    pub fn message(&self, id: MessageId) -> Result<&ChatMessage, MediaError> {
        self.chat.message(id).ok_or(MediaError::UnknownMessage(id))
    }

    /// Normalized slots of `id`; legacy records come back upgraded.
    pub fn slots(&self, id: MessageId) -> Result<MediaSlots, MediaError> {
        Ok(MediaSlots::from_message(self.message(id)?))
    }

    pub fn get(&self, id: MessageId, key: SlotKey) -> Result<Option<MediaRecord>, MediaError> {
        Ok(self.slots(id)?.get(key).cloned())
    }

    pub fn upsert(
        &mut self,
        id: MessageId,
        key: SlotKey,
        record: MediaRecord,
    ) -> Result<(), MediaError> {
        self.mutate_slots(id, |slots| slots.upsert(key, record))
    }

    pub fn append_variant(
        &mut self,
        id: MessageId,
        key: SlotKey,
        url: &str,
    ) -> Result<usize, MediaError> {
        self.mutate_slots(id, |slots| slots.append_variant(key, url))
    }

    pub fn set_active_index(
        &mut self,
        id: MessageId,
        key: SlotKey,
        index: usize,
    ) -> Result<bool, MediaError> {
        self.mutate_slots(id, |slots| slots.set_active_index(key, index))
    }

    pub fn mark_saved(
        &mut self,
        id: MessageId,
        key: SlotKey,
        index: usize,
    ) -> Result<bool, MediaError> {
        self.mutate_slots(id, |slots| slots.mark_saved(key, index))
    }

    pub fn set_prompt(&mut self, id: MessageId, key: SlotKey, prompt: &str) -> Result<(), MediaError> {
        self.mutate_slots(id, |slots| slots.set_prompt(key, prompt))
    }

    pub fn rewrite_voice_text(
        &mut self,
        id: MessageId,
        extractor: &TagExtractor,
        slot_index: usize,
        text: &str,
    ) -> Result<(), MediaError> {
        self.mutate(id, |message| {
            rewrite_voice_text(message, extractor, slot_index, text)
        })
    }

    pub fn set_text(&mut self, id: MessageId, text: &str) -> Result<(), MediaError> {
        self.mutate(id, |message| {
            message.text = text.to_string();
            Ok(())
        })
    }

    /// Replaces the text and drops every media slot, as a regenerated
    /// message starts over.
    pub fn reset_content(&mut self, id: MessageId, text: &str) -> Result<(), MediaError> {
        self.mutate(id, |message| {
            message.text = text.to_string();
            MediaSlots::new().write_to(message);
            Ok(())
        })
    }

    /// Saves the chat; returns false after logging when the save failed.
    pub fn persist(&mut self) -> bool {
        match self.persistence.save(&self.chat) {
            Ok(()) => {
                self.last_persist_error = None;
                true
            }
            Err(err) => {
                let reason = format!("{err:#}");
                self.events.record(
                    "persist_failed",
                    payload([
                        ("chat_id", json!(self.chat.chat_id)),
                        ("error", json!(reason)),
                    ]),
                );
                self.last_persist_error = Some(reason);
                false
            }
        }
    }

    fn mutate<T, F>(&mut self, id: MessageId, change: F) -> Result<T, MediaError>
    where
        F: FnOnce(&mut ChatMessage) -> Result<T, MediaError>,
    {
        let message = self
            .chat
            .message_mut(id)
            .ok_or(MediaError::UnknownMessage(id))?;
        let out = change(message)?;
        self.persist();
        Ok(out)
    }

    fn mutate_slots<T, F>(&mut self, id: MessageId, change: F) -> Result<T, MediaError>
    where
        F: FnOnce(&mut MediaSlots) -> Result<T, MediaError>,
    {
        self.mutate(id, |message| {
            let mut slots = MediaSlots::from_message(message);
            let out = change(&mut slots)?;
            slots.write_to(message);
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use anyhow::bail;
    use tagcast_contracts::error::MediaError;
    use tagcast_contracts::events::{read_events, EventWriter};
    use tagcast_contracts::media::{ImageRecord, MediaRecord};
    use tagcast_contracts::message::{ChatLog, ChatMessage, MessageId};
    use tagcast_contracts::tags::{SlotKey, TagExtractor, TagMarkers};

    use super::MediaStateStore;
    use crate::persistence::ChatPersistence;

    #[derive(Clone, Default)]
    struct Recorder {
        saves: Arc<Mutex<Vec<ChatLog>>>,
        fail: bool,
    }

    impl ChatPersistence for Recorder {
        fn save(&self, chat: &ChatLog) -> anyhow::Result<()> {
            if self.fail {
                bail!("disk full");
            }
            if let Ok(mut saves) = self.saves.lock() {
                saves.push(chat.clone());
            }
            Ok(())
        }
    }

    fn store(recorder: &Recorder, events: EventWriter) -> MediaStateStore {
        let mut chat = ChatLog::new("Mira");
        chat.messages.push(ChatMessage::assistant(
            1,
            "[VOICE]one[/VOICE] and [VOICE]two[/VOICE]",
        ));
        MediaStateStore::new(chat, Box::new(recorder.clone()), events)
    }

    #[test]
    fn every_mutation_is_persisted() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let recorder = Recorder::default();
        let mut store = store(&recorder, EventWriter::new(temp.path().join("events.jsonl"), "s"));
        let id = MessageId(1);
        let key = SlotKey::image(0);

        store.upsert(id, key, MediaRecord::Image(ImageRecord::new("u0", "cat")))?;
        assert_eq!(store.append_variant(id, key, "u1")?, 1);
        assert!(store.set_active_index(id, key, 0)?);
        assert!(store.mark_saved(id, key, 0)?);
        assert!(!store.mark_saved(id, key, 0)?);
        store.rewrite_voice_text(id, &TagExtractor::new(TagMarkers::default())?, 1, "deux")?;

        let saves = recorder.saves.lock().map(|saves| saves.len()).unwrap_or(0);
        assert_eq!(saves, 6);
        Ok(())
    }

    #[test]
    fn persist_failure_keeps_memory_and_logs() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let recorder = Recorder {
            fail: true,
            ..Recorder::default()
        };
        let mut store = store(&recorder, EventWriter::new(&events_path, "s"));
        let key = SlotKey::image(0);

        store.upsert(MessageId(1), key, MediaRecord::Image(ImageRecord::new("u0", "cat")))?;
        assert!(store.get(MessageId(1), key)?.is_some());
        assert!(store.last_persist_error().is_some_and(|err| err.contains("disk full")));

        let events = read_events(&events_path)?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "persist_failed");
        Ok(())
    }

    #[test]
    fn failed_mutations_do_not_persist() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let recorder = Recorder::default();
        let mut store = store(&recorder, EventWriter::new(temp.path().join("events.jsonl"), "s"));
        assert_eq!(
            store.append_variant(MessageId(1), SlotKey::image(0), "u"),
            Err(MediaError::UnknownSlot(SlotKey::image(0)))
        );
        assert_eq!(
            store.set_text(MessageId(9), "x"),
            Err(MediaError::UnknownMessage(MessageId(9)))
        );
        assert_eq!(recorder.saves.lock().map(|saves| saves.len()).unwrap_or(0), 0);
        Ok(())
    }

    #[test]
    fn voice_rewrite_changes_text_and_record_together() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let recorder = Recorder::default();
        let mut store = store(&recorder, EventWriter::new(temp.path().join("events.jsonl"), "s"));
        let extractor = TagExtractor::new(TagMarkers::default())?;
        store.rewrite_voice_text(MessageId(1), &extractor, 1, "deux")?;

        assert_eq!(
            store.message(MessageId(1))?.text,
            "[VOICE]one[/VOICE] and [VOICE]deux[/VOICE]"
        );
        let record = store.get(MessageId(1), SlotKey::voice(1))?;
        assert_eq!(
            record.and_then(|record| record.as_voice().map(|voice| voice.text.clone())),
            Some("deux".to_string())
        );
        Ok(())
    }
}
