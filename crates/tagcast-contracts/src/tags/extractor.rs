use std::ops::Range;

use regex::Regex;

use super::markers::{TagKind, TagMarkers};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMatch {
    pub kind: TagKind,
    pub slot_index: usize,
    pub content: String,
    /// Byte range of the whole tag, markers included.
    pub span: Range<usize>,
    /// Byte range between the markers, untrimmed.
    pub content_span: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub images: Vec<TagMatch>,
    pub voice_notes: Vec<TagMatch>,
    /// Message text with image tags removed. Voice-note tags stay in place so
    /// the edit flow can find and rewrite them later.
    pub stripped_text: String,
}

impl Extraction {
    pub fn matches(&self, kind: TagKind) -> &[TagMatch] {
        match kind {
            TagKind::Image => &self.images,
            TagKind::VoiceNote => &self.voice_notes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.voice_notes.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TagExtractor {
    markers: TagMarkers,
    image_pattern: Regex,
    voice_pattern: Regex,
}

impl TagExtractor {
    pub fn new(markers: TagMarkers) -> anyhow::Result<Self> {
        let image_pattern = pair_pattern(&markers.image.open, &markers.image.close)?;
        let voice_pattern = pair_pattern(&markers.voice_note.open, &markers.voice_note.close)?;
        Ok(Self {
            markers,
            image_pattern,
            voice_pattern,
        })
    }

    pub fn markers(&self) -> &TagMarkers {
        &self.markers
    }

    pub fn extract(&self, text: &str) -> Extraction {
        Extraction {
            images: self.matches(text, TagKind::Image),
            voice_notes: self.matches(text, TagKind::VoiceNote),
            stripped_text: self.image_pattern.replace_all(text, "").into_owned(),
        }
    }

    /// Non-empty tags of one kind, in document order.
    ///
    /// Tags whose content trims to nothing are dropped without consuming a
    /// slot index.
    pub fn matches(&self, text: &str, kind: TagKind) -> Vec<TagMatch> {
        let mut out = Vec::new();
        for captures in self.pattern(kind).captures_iter(text) {
            let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let content = inner.as_str().trim();
            if content.is_empty() {
                continue;
            }
            out.push(TagMatch {
                kind,
                slot_index: out.len(),
                content: content.to_string(),
                span: whole.range(),
                content_span: inner.range(),
            });
        }
        out
    }

    /// True when the open marker of `kind` appears anywhere, terminated or not.
    pub fn has_open_tag(&self, text: &str, kind: TagKind) -> bool {
        text.contains(self.markers.get(kind).open.as_str())
    }

    /// Replaces the content of the `slot_index`-th tag of `kind`, leaving every
    /// other byte of `text` untouched. Returns `None` when no such tag exists.
    pub fn rewrite_content(
        &self,
        text: &str,
        kind: TagKind,
        slot_index: usize,
        content: &str,
    ) -> Option<String> {
        let target = self
            .matches(text, kind)
            .into_iter()
            .find(|item| item.slot_index == slot_index)?;
        let mut rewritten = String::with_capacity(text.len() + content.len());
        rewritten.push_str(&text[..target.content_span.start]);
        rewritten.push_str(content);
        rewritten.push_str(&text[target.content_span.end..]);
        Some(rewritten)
    }

    fn pattern(&self, kind: TagKind) -> &Regex {
        match kind {
            TagKind::Image => &self.image_pattern,
            TagKind::VoiceNote => &self.voice_pattern,
        }
    }
}

fn pair_pattern(open: &str, close: &str) -> anyhow::Result<Regex> {
    if open.is_empty() || close.is_empty() {
        anyhow::bail!("tag markers must not be empty");
    }
    let pattern = format!("(?s){}(.*?){}", regex::escape(open), regex::escape(close));
    Ok(Regex::new(&pattern)?)
}
