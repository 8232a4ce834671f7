use super::slots::MediaSlots;
use crate::error::MediaError;
use crate::message::ChatMessage;
use crate::tags::{SlotKey, TagExtractor, TagKind};

/// Replaces the text of voice slot `slot_index` in both the stored record and
/// the message's raw text.
///
/// Only the `slot_index`-th voice tag is rewritten; every other byte of the
/// raw text is kept. Nothing is mutated when the tag cannot be found.
pub fn rewrite_voice_text(
    message: &mut ChatMessage,
    extractor: &TagExtractor,
    slot_index: usize,
    text: &str,
) -> Result<(), MediaError> {
    let key = SlotKey::voice(slot_index);
    let text = text.trim();
    if text.is_empty() {
        return Err(MediaError::EmptyText(key));
    }
    let rewritten = extractor
        .rewrite_content(&message.text, TagKind::VoiceNote, slot_index, text)
        .ok_or(MediaError::TagNotFound(key))?;

    let mut slots = MediaSlots::from_message(message);
    slots.set_voice_text(key, text)?;
    message.text = rewritten;
    slots.write_to(message);
    Ok(())
}

/// Spoken length estimate in whole seconds, never below one.
pub fn estimate_duration_secs(text: &str, words_per_second: f64) -> u64 {
    let words = text.split_whitespace().count() as f64;
    let rate = if words_per_second.is_finite() && words_per_second > 0.0 {
        words_per_second
    } else {
        2.5
    };
    ((words / rate).ceil() as u64).max(1)
}

pub fn format_duration(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::{estimate_duration_secs, format_duration, rewrite_voice_text};
    use crate::error::MediaError;
    use crate::media::MediaSlots;
    use crate::message::ChatMessage;
    use crate::tags::{SlotKey, TagExtractor, TagMarkers};

    #[test]
    fn rewrite_updates_record_and_only_the_nth_tag() -> anyhow::Result<()> {
        let extractor = TagExtractor::new(TagMarkers::default())?;
        let mut message = ChatMessage::assistant(
            1,
            "a [VOICE]first[/VOICE] b [VOICE]second[/VOICE] c [VOICE]first[/VOICE]",
        );
        rewrite_voice_text(&mut message, &extractor, 2, "  brand new words ")?;

        assert_eq!(
            message.text,
            "a [VOICE]first[/VOICE] b [VOICE]second[/VOICE] c [VOICE]brand new words[/VOICE]"
        );
        let slots = MediaSlots::from_message(&message);
        assert_eq!(
            slots.voice(SlotKey::voice(2)).map(|record| record.text.as_str()),
            Some("brand new words")
        );
        assert!(slots.voice(SlotKey::voice(0)).is_none());
        Ok(())
    }

    #[test]
    fn missing_tag_or_empty_text_leaves_message_untouched() -> anyhow::Result<()> {
        let extractor = TagExtractor::new(TagMarkers::default())?;
        let mut message = ChatMessage::assistant(1, "[VOICE]only[/VOICE]");
        let before = message.clone();
        assert_eq!(
            rewrite_voice_text(&mut message, &extractor, 1, "x"),
            Err(MediaError::TagNotFound(SlotKey::voice(1)))
        );
        assert_eq!(
            rewrite_voice_text(&mut message, &extractor, 0, "   "),
            Err(MediaError::EmptyText(SlotKey::voice(0)))
        );
        assert_eq!(message, before);
        Ok(())
    }

    #[test]
    fn duration_rounds_up_with_a_one_second_floor() {
        assert_eq!(estimate_duration_secs("", 2.5), 1);
        assert_eq!(estimate_duration_secs("one two three", 2.5), 2);
        assert_eq!(estimate_duration_secs("one two three four five", 2.5), 2);
        assert_eq!(estimate_duration_secs("one two", 0.0), 1);
        assert_eq!(format_duration(4), "0:04");
        assert_eq!(format_duration(75), "1:15");
    }
}
