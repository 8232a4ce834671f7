use std::fmt;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Key under which media slots live in a message's extension data.
pub const MEDIA_EXTRA_KEY: &str = "tagcast_media";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    #[serde(default)]
    pub is_user: bool,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn assistant(id: u64, text: &str) -> Self {
        Self {
            id: MessageId(id),
            is_user: false,
            is_system: false,
            text: text.to_string(),
            extra: Map::new(),
        }
    }

    pub fn user(id: u64, text: &str) -> Self {
        Self {
            is_user: true,
            ..Self::assistant(id, text)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatLog {
    pub chat_id: String,
    /// Character the chat is held with; gallery uploads are filed under it.
    #[serde(default)]
    pub character: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl ChatLog {
    pub fn new(character: &str) -> Self {
        Self {
            chat_id: Uuid::new_v4().to_string(),
            character: character.to_string(),
            messages: Vec::new(),
        }
    }

    pub fn message(&self, id: MessageId) -> Option<&ChatMessage> {
        self.messages.iter().find(|message| message.id == id)
    }

    pub fn message_mut(&mut self, id: MessageId) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|message| message.id == id)
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.messages.iter().map(|message| message.id).collect()
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading chat {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid chat {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ChatLog, ChatMessage, MessageId};

    #[test]
    fn chat_log_roundtrips_through_disk() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("chats").join("chat.json");
        let mut chat = ChatLog::new("Mira");
        let mut message = ChatMessage::assistant(4, "hello [IMG]cat[/IMG]");
        message.extra.insert("other_extension".to_string(), json!({"k": 1}));
        chat.messages.push(message);
        chat.save(&path)?;

        let loaded = ChatLog::load(&path)?;
        assert_eq!(loaded, chat);
        assert_eq!(
            loaded.message(MessageId(4)).map(|m| m.extra["other_extension"].clone()),
            Some(json!({"k": 1}))
        );
        Ok(())
    }

    #[test]
    fn missing_flags_default_to_assistant_message() -> anyhow::Result<()> {
        let chat: ChatLog = serde_json::from_value(json!({
            "chat_id": "c1",
            "messages": [{"id": 1, "text": "hi"}],
        }))?;
        let message = &chat.messages[0];
        assert!(!message.is_user && !message.is_system);
        assert!(message.extra.is_empty());
        Ok(())
    }
}
