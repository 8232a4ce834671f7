use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tags::TagKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub variants: Vec<String>,
    #[serde(default)]
    pub active_index: usize,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub saved_flags: BTreeSet<usize>,
}

impl ImageRecord {
    pub fn new(url: &str, prompt: &str) -> Self {
        Self {
            variants: vec![url.to_string()],
            active_index: 0,
            prompt: prompt.to_string(),
            saved_flags: BTreeSet::new(),
        }
    }

    pub fn active_url(&self) -> Option<&str> {
        self.variants.get(self.active_index).map(String::as_str)
    }

    pub fn is_last(&self) -> bool {
        self.active_index + 1 >= self.variants.len()
    }

    /// Appends a variant, makes it active and leaves it unsaved.
    pub fn append_variant(&mut self, url: &str) -> usize {
        self.variants.push(url.to_string());
        self.active_index = self.variants.len() - 1;
        self.saved_flags.remove(&self.active_index);
        self.active_index
    }

    /// Returns false when `index` is out of range or already active.
    pub fn set_active_index(&mut self, index: usize) -> bool {
        if index >= self.variants.len() || index == self.active_index {
            return false;
        }
        self.active_index = index;
        true
    }

    /// Returns false when the flag was already set or `index` is out of range.
    pub fn mark_saved(&mut self, index: usize) -> bool {
        if index >= self.variants.len() {
            return false;
        }
        self.saved_flags.insert(index)
    }

    pub fn is_saved(&self, index: usize) -> bool {
        self.saved_flags.contains(&index)
    }

    /// Carousel position such as `2/3`.
    pub fn position_label(&self) -> String {
        format!("{}/{}", self.active_index + 1, self.variants.len())
    }

    fn clamp(mut self) -> Self {
        let len = self.variants.len();
        if self.active_index >= len {
            self.active_index = len.saturating_sub(1);
        }
        self.saved_flags.retain(|index| *index < len);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceRecord {
    pub text: String,
}

/// Single-URL image shape written before variants existed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyImageRecord {
    pub url: String,
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaRecord {
    Image(ImageRecord),
    VoiceNote(VoiceRecord),
    LegacyImage(LegacyImageRecord),
}

impl MediaRecord {
    pub fn kind(&self) -> TagKind {
        match self {
            MediaRecord::Image(_) | MediaRecord::LegacyImage(_) => TagKind::Image,
            MediaRecord::VoiceNote(_) => TagKind::VoiceNote,
        }
    }

    pub fn as_image(&self) -> Option<&ImageRecord> {
        match self {
            MediaRecord::Image(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_image_mut(&mut self) -> Option<&mut ImageRecord> {
        match self {
            MediaRecord::Image(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_voice(&self) -> Option<&VoiceRecord> {
        match self {
            MediaRecord::VoiceNote(record) => Some(record),
            _ => None,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, MediaRecord::LegacyImage(_))
    }

    /// Parses any stored shape, legacy included, without upgrading it.
    /// Image records with no variants are rejected.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        match obj.get("kind").and_then(Value::as_str) {
            Some("voice_note") => voice_from(value),
            Some("image") => image_from(value),
            Some(_) => None,
            None if obj.contains_key("variants") => image_from(value),
            None if obj.contains_key("url") => {
                serde_json::from_value::<LegacyImageRecord>(value.clone())
                    .ok()
                    .map(MediaRecord::LegacyImage)
            }
            None if obj.contains_key("text") => voice_from(value),
            None => None,
        }
    }

    /// Serializes in the current shape; legacy records are upgraded first.
    pub fn to_value(&self) -> Value {
        let (kind, body) = match normalize(self.clone()) {
            MediaRecord::Image(record) => ("image", serde_json::to_value(record)),
            MediaRecord::VoiceNote(record) => ("voice_note", serde_json::to_value(record)),
            MediaRecord::LegacyImage(record) => ("image", serde_json::to_value(record)),
        };
        let mut payload = body
            .ok()
            .and_then(|value| value.as_object().cloned())
            .unwrap_or_else(Map::new);
        payload.insert("kind".to_string(), Value::String(kind.to_string()));
        Value::Object(payload)
    }
}

/// Upgrades the legacy single-URL shape and clamps image invariants.
/// Applying it to its own output changes nothing.
pub fn normalize(record: MediaRecord) -> MediaRecord {
    match record {
        MediaRecord::LegacyImage(legacy) => {
            MediaRecord::Image(ImageRecord::new(&legacy.url, &legacy.prompt))
        }
        MediaRecord::Image(image) => MediaRecord::Image(image.clamp()),
        voice @ MediaRecord::VoiceNote(_) => voice,
    }
}

/// Alias kept for callers that think of the upgrade as a migration.
pub fn migrate_legacy(record: MediaRecord) -> MediaRecord {
    normalize(record)
}

fn image_from(value: &Value) -> Option<MediaRecord> {
    let record = serde_json::from_value::<ImageRecord>(value.clone()).ok()?;
    if record.variants.is_empty() {
        return None;
    }
    Some(MediaRecord::Image(record))
}

fn voice_from(value: &Value) -> Option<MediaRecord> {
    serde_json::from_value::<VoiceRecord>(value.clone())
        .ok()
        .map(MediaRecord::VoiceNote)
}
