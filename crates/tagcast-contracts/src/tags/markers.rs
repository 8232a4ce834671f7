use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    Image,
    VoiceNote,
}

impl TagKind {
    /// Order in which tag kinds are stripped from a rendered tree.
    pub const ALL: [TagKind; 2] = [TagKind::Image, TagKind::VoiceNote];

    pub fn as_str(self) -> &'static str {
        match self {
            TagKind::Image => "image",
            TagKind::VoiceNote => "voice_note",
        }
    }

    fn slot_prefix(self) -> &'static str {
        match self {
            TagKind::Image => "image",
            TagKind::VoiceNote => "voice",
        }
    }
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerPair {
    pub open: String,
    pub close: String,
}

impl MarkerPair {
    pub fn new(open: &str, close: &str) -> Self {
        Self {
            open: open.to_string(),
            close: close.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagMarkers {
    pub image: MarkerPair,
    pub voice_note: MarkerPair,
}

impl Default for TagMarkers {
    fn default() -> Self {
        Self {
            image: MarkerPair::new("[IMG]", "[/IMG]"),
            voice_note: MarkerPair::new("[VOICE]", "[/VOICE]"),
        }
    }
}

impl TagMarkers {
    pub fn get(&self, kind: TagKind) -> &MarkerPair {
        match kind {
            TagKind::Image => &self.image,
            TagKind::VoiceNote => &self.voice_note,
        }
    }
}

/// Positional identity of a tag within one message.
///
/// Image and voice-note slots number independently, so `image-0` and
/// `voice-0` never collide in persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub kind: TagKind,
    pub index: usize,
}

impl SlotKey {
    pub fn new(kind: TagKind, index: usize) -> Self {
        Self { kind, index }
    }

    pub fn image(index: usize) -> Self {
        Self::new(TagKind::Image, index)
    }

    pub fn voice(index: usize) -> Self {
        Self::new(TagKind::VoiceNote, index)
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind.slot_prefix(), self.index)
    }
}

impl FromStr for SlotKey {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (prefix, index) = raw
            .rsplit_once('-')
            .ok_or_else(|| format!("slot key '{raw}' is missing an index"))?;
        let kind = TagKind::ALL
            .into_iter()
            .find(|kind| kind.slot_prefix() == prefix)
            .ok_or_else(|| format!("slot key '{raw}' has an unknown kind"))?;
        let index = index
            .parse::<usize>()
            .map_err(|_| format!("slot key '{raw}' has a non-numeric index"))?;
        Ok(Self { kind, index })
    }
}

#[cfg(test)]
mod tests {
    use super::{SlotKey, TagKind};

    #[test]
    fn slot_keys_use_independent_numbering_per_kind() {
        assert_eq!(SlotKey::image(0).to_string(), "image-0");
        assert_eq!(SlotKey::voice(0).to_string(), "voice-0");
        assert_ne!(SlotKey::image(0), SlotKey::voice(0));
    }

    #[test]
    fn slot_key_parses_its_display_form() {
        assert_eq!("voice-12".parse::<SlotKey>(), Ok(SlotKey::voice(12)));
        assert_eq!(
            "image-3".parse::<SlotKey>().map(|key| key.kind),
            Ok(TagKind::Image)
        );
        assert!("audio-1".parse::<SlotKey>().is_err());
        assert!("image-x".parse::<SlotKey>().is_err());
    }
}
