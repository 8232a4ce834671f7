use thiserror::Error;

use crate::message::MessageId;
use crate::tags::SlotKey;

/// Recoverable failures surfaced by the media pipeline.
///
/// None of these abort a processing pass on their own; callers turn them into
/// per-slot outcomes or report them back to the interaction that caused them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("message {0} has no rendered content to process")]
    MissingRenderTarget(MessageId),
    #[error("message {0} is not part of the active chat")]
    UnknownMessage(MessageId),
    #[error("no media record stored for slot {0}")]
    UnknownSlot(SlotKey),
    #[error("slot {0} holds a record of a different kind")]
    SlotKindMismatch(SlotKey),
    #[error("no tag in the message text for slot {0}")]
    TagNotFound(SlotKey),
    #[error("replacement text for slot {0} is empty")]
    EmptyText(SlotKey),
    #[error("generation backend returned no result")]
    NoGenerationResult,
    #[error("speech request failed: {0}")]
    SpeechFailed(String),
    #[error("gallery upload failed: {0}")]
    UploadFailed(String),
    #[error("slot {0} is already playing")]
    PlaybackBusy(SlotKey),
    #[error("slot {0} has no widget binding for this interaction")]
    NotBound(SlotKey),
    #[error("invalid tree range: {0}")]
    InvalidRange(String),
}
