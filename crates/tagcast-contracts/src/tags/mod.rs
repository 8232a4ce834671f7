mod extractor;
mod markers;

pub use extractor::{Extraction, TagExtractor, TagMatch};
pub use markers::{MarkerPair, SlotKey, TagKind, TagMarkers};
