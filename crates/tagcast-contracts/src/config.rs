use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::tags::{TagKind, TagMarkers};

pub const CONFIG_PATH_ENV: &str = "TAGCAST_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaceholderStyle {
    /// Class the author puts on a placeholder element.
    pub class: String,
    /// Substrings that identify an unmarked placeholder by its text.
    pub sentinels: Vec<String>,
    /// Case-insensitive phrases tried only after every other tier failed.
    pub loose_sentinels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaceholderConfig {
    pub image: PlaceholderStyle,
    pub voice_note: PlaceholderStyle,
    /// Prefix the host sanitizer prepends to author classes.
    pub sanitizer_prefix: String,
    pub index_attribute: String,
    /// Element names searched by the content fallbacks.
    pub containers: Vec<String>,
}

impl Default for PlaceholderConfig {
    fn default() -> Self {
        Self {
            image: PlaceholderStyle {
                class: "img-placeholder".to_string(),
                sentinels: vec!["🖼".to_string(), "📷".to_string()],
                loose_sentinels: Vec::new(),
            },
            voice_note: PlaceholderStyle {
                class: "voice-placeholder".to_string(),
                sentinels: vec!["🎤".to_string(), "🎙".to_string()],
                loose_sentinels: vec!["voice message".to_string(), "voice note".to_string()],
            },
            sanitizer_prefix: "custom-".to_string(),
            index_attribute: "data-index".to_string(),
            containers: ["div", "p", "span", "section", "blockquote", "li", "figure", "aside"]
                .iter()
                .map(|tag| (*tag).to_string())
                .collect(),
        }
    }
}

impl PlaceholderConfig {
    pub fn style(&self, kind: TagKind) -> &PlaceholderStyle {
        match kind {
            TagKind::Image => &self.image,
            TagKind::VoiceNote => &self.voice_note,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WidgetClasses {
    pub image: String,
    pub voice: String,
    pub loading: String,
    pub failed: String,
    /// Class marking a voice player; containers holding one are never
    /// treated as placeholders.
    pub phone: String,
}

impl Default for WidgetClasses {
    fn default() -> Self {
        Self {
            image: "tc-image-widget".to_string(),
            voice: "tc-voice-widget".to_string(),
            loading: "tc-image-loading".to_string(),
            failed: "tc-image-failed".to_string(),
            phone: "tc-phone-widget".to_string(),
        }
    }
}

impl WidgetClasses {
    pub fn finished(&self) -> [&str; 4] {
        [
            self.image.as_str(),
            self.voice.as_str(),
            self.failed.as_str(),
            self.phone.as_str(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub start_timeout_ms: u64,
    /// Upper bound on a single playback once it has started.
    pub end_timeout_ms: u64,
    pub voice_id: String,
    pub words_per_second: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: 8_000,
            end_timeout_ms: 600_000,
            voice_id: "default".to_string(),
            words_per_second: 2.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tags: TagMarkers,
    pub placeholders: PlaceholderConfig,
    pub widgets: WidgetClasses,
    pub playback: PlaybackConfig,
}

impl EngineConfig {
    /// Defaults, overlaid with the JSON file at `path` or, when `path` is
    /// `None`, the file named by `TAGCAST_CONFIG_PATH`. Keys missing from the
    /// file keep their defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path.map(Path::to_path_buf).or_else(config_override_path) else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

fn config_override_path() -> Option<PathBuf> {
    env::var(CONFIG_PATH_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;

    #[test]
    fn partial_json_keeps_nested_defaults() -> anyhow::Result<()> {
        let config = EngineConfig::from_json(
            r#"{"tags": {"image": {"open": "<pic>", "close": "</pic>"}},
                "playback": {"start_timeout_ms": 250}}"#,
        )?;
        assert_eq!(config.tags.image.open, "<pic>");
        assert_eq!(config.tags.voice_note.open, "[VOICE]");
        assert_eq!(config.playback.start_timeout_ms, 250);
        assert_eq!(config.playback.end_timeout_ms, 600_000);
        assert_eq!(config.playback.voice_id, "default");
        assert_eq!(config.placeholders.voice_note.class, "voice-placeholder");
        Ok(())
    }

    #[test]
    fn load_reads_explicit_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("tagcast.json");
        std::fs::write(&path, r#"{"placeholders": {"sanitizer_prefix": "user-"}}"#)?;
        let config = EngineConfig::load(Some(&path))?;
        assert_eq!(config.placeholders.sanitizer_prefix, "user-");
        assert_eq!(config.widgets.image, "tc-image-widget");
        Ok(())
    }
}
