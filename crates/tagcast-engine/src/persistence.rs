use std::path::{Path, PathBuf};

use anyhow::Result;
use tagcast_contracts::message::ChatLog;

/// Opaque "save the current chat" collaborator. Implementations must be
/// safe to call redundantly.
pub trait ChatPersistence: Send + Sync {
    fn save(&self, chat: &ChatLog) -> Result<()>;
}

/// Writes the whole chat as pretty JSON to one file.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChatPersistence for JsonFilePersistence {
    fn save(&self, chat: &ChatLog) -> Result<()> {
        chat.save(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use tagcast_contracts::message::{ChatLog, ChatMessage};

    use super::{ChatPersistence, JsonFilePersistence};

    #[test]
    fn saving_twice_keeps_one_consistent_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let persistence = JsonFilePersistence::new(temp.path().join("nested").join("chat.json"));
        let mut chat = ChatLog::new("Mira");
        chat.messages.push(ChatMessage::assistant(1, "hi"));
        persistence.save(&chat)?;
        persistence.save(&chat)?;
        assert_eq!(ChatLog::load(persistence.path())?, chat);
        Ok(())
    }
}
