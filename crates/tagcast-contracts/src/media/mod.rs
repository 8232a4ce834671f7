mod edit;
mod record;
mod slots;
mod voice;

pub use edit::edit_diff;
pub use record::{
    migrate_legacy, normalize, ImageRecord, LegacyImageRecord, MediaRecord, VoiceRecord,
};
pub use slots::MediaSlots;
pub use voice::{estimate_duration_secs, format_duration, rewrite_voice_text};
