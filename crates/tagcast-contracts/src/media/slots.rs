use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::record::{normalize, ImageRecord, MediaRecord, VoiceRecord};
use crate::error::MediaError;
use crate::message::{ChatMessage, MEDIA_EXTRA_KEY};
use crate::tags::{SlotKey, TagKind};

/// Resolved media of one message, keyed by slot.
///
/// Every record that enters through `load`/`upsert` is normalized, so the
/// legacy image shape never survives past the first read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaSlots {
    records: BTreeMap<SlotKey, MediaRecord>,
}

impl MediaSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the slots stored in a message's extension data, returning how
    /// many legacy records were upgraded along the way.
    pub fn load(extra: &Map<String, Value>) -> (Self, usize) {
        let mut slots = Self::new();
        let mut migrated = 0;
        let Some(stored) = extra.get(MEDIA_EXTRA_KEY).and_then(Value::as_object) else {
            return (slots, migrated);
        };
        for (raw_key, raw_record) in stored {
            let Ok(key) = raw_key.parse::<SlotKey>() else {
                continue;
            };
            let Some(record) = MediaRecord::from_value(raw_record) else {
                continue;
            };
            if record.kind() != key.kind {
                continue;
            }
            if record.is_legacy() {
                migrated += 1;
            }
            slots.records.insert(key, normalize(record));
        }
        (slots, migrated)
    }

    pub fn from_message(message: &ChatMessage) -> Self {
        Self::load(&message.extra).0
    }

    pub fn write_to(&self, message: &mut ChatMessage) {
        if self.records.is_empty() {
            message.extra.remove(MEDIA_EXTRA_KEY);
            return;
        }
        let mut stored = Map::new();
        for (key, record) in &self.records {
            stored.insert(key.to_string(), record.to_value());
        }
        message
            .extra
            .insert(MEDIA_EXTRA_KEY.to_string(), Value::Object(stored));
    }

    pub fn get(&self, key: SlotKey) -> Option<&MediaRecord> {
        self.records.get(&key)
    }

    pub fn image(&self, key: SlotKey) -> Option<&ImageRecord> {
        self.get(key).and_then(MediaRecord::as_image)
    }

    pub fn voice(&self, key: SlotKey) -> Option<&VoiceRecord> {
        self.get(key).and_then(MediaRecord::as_voice)
    }

    pub fn upsert(&mut self, key: SlotKey, record: MediaRecord) -> Result<(), MediaError> {
        if record.kind() != key.kind {
            return Err(MediaError::SlotKindMismatch(key));
        }
        self.records.insert(key, normalize(record));
        Ok(())
    }

    pub fn remove(&mut self, key: SlotKey) -> Option<MediaRecord> {
        self.records.remove(&key)
    }

    pub fn append_variant(&mut self, key: SlotKey, url: &str) -> Result<usize, MediaError> {
        Ok(self.image_mut(key)?.append_variant(url))
    }

    pub fn set_active_index(&mut self, key: SlotKey, index: usize) -> Result<bool, MediaError> {
        Ok(self.image_mut(key)?.set_active_index(index))
    }

    pub fn mark_saved(&mut self, key: SlotKey, index: usize) -> Result<bool, MediaError> {
        Ok(self.image_mut(key)?.mark_saved(index))
    }

    pub fn set_prompt(&mut self, key: SlotKey, prompt: &str) -> Result<(), MediaError> {
        self.image_mut(key)?.prompt = prompt.to_string();
        Ok(())
    }

    pub fn set_voice_text(&mut self, key: SlotKey, text: &str) -> Result<(), MediaError> {
        self.upsert(
            key,
            MediaRecord::VoiceNote(VoiceRecord {
                text: text.to_string(),
            }),
        )
    }

    pub fn has_kind(&self, kind: TagKind) -> bool {
        self.records.keys().any(|key| key.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotKey, &MediaRecord)> {
        self.records.iter().map(|(key, record)| (*key, record))
    }

    fn image_mut(&mut self, key: SlotKey) -> Result<&mut ImageRecord, MediaError> {
        if key.kind != TagKind::Image {
            return Err(MediaError::SlotKindMismatch(key));
        }
        self.records
            .get_mut(&key)
            .ok_or(MediaError::UnknownSlot(key))?
            .as_image_mut()
            .ok_or(MediaError::SlotKindMismatch(key))
    }
}
