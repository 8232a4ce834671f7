use super::resolver::{PlaceholderResolver, ResolveRequest};
use crate::tags::TagKind;
use crate::tree::{NodeId, RenderTree};

pub(crate) type Matcher = fn(&PlaceholderResolver<'_>, &RenderTree, ResolveRequest) -> Option<NodeId>;

#[derive(Clone, Copy)]
pub struct Tier {
    pub name: &'static str,
    /// Restricts the tier to one tag kind.
    pub only: Option<TagKind>,
    /// Matches on rendered text rather than on author markup.
    pub reads_content: bool,
    pub(crate) matcher: Matcher,
}

impl Tier {
    pub fn applies_to(&self, kind: TagKind) -> bool {
        self.only.map(|only| only == kind).unwrap_or(true)
    }
}

/// Placeholder matchers in the order they are attempted.
pub const TIERS: &[Tier] = &[
    Tier {
        name: "exact_marker",
        only: None,
        reads_content: false,
        matcher: exact_marker,
    },
    Tier {
        name: "any_marker",
        only: None,
        reads_content: false,
        matcher: any_marker,
    },
    Tier {
        name: "sanitized_class",
        only: None,
        reads_content: false,
        matcher: sanitized_class,
    },
    Tier {
        name: "content_sentinel",
        only: None,
        reads_content: true,
        matcher: content_sentinel,
    },
    Tier {
        name: "loose_phrase",
        only: Some(TagKind::VoiceNote),
        reads_content: true,
        matcher: loose_phrase,
    },
];

fn exact_marker(
    resolver: &PlaceholderResolver<'_>,
    tree: &RenderTree,
    request: ResolveRequest,
) -> Option<NodeId> {
    let class = resolver.placeholder_class(request.kind);
    let index_attr = resolver.index_attribute();
    resolver
        .eligible_elements(tree, |element| {
            element.has_class(class)
                && element
                    .attr(index_attr)
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    == Some(request.slot_index)
        })
        .into_iter()
        .next()
}

fn any_marker(
    resolver: &PlaceholderResolver<'_>,
    tree: &RenderTree,
    request: ResolveRequest,
) -> Option<NodeId> {
    let class = resolver.placeholder_class(request.kind);
    let candidates = resolver.eligible_elements(tree, |element| element.has_class(class));
    pick_clamped(&candidates, request.slot_index)
}

fn sanitized_class(
    resolver: &PlaceholderResolver<'_>,
    tree: &RenderTree,
    request: ResolveRequest,
) -> Option<NodeId> {
    let prefixed = resolver.sanitized_class(request.kind);
    let candidates =
        resolver.eligible_elements(tree, |element| element.has_class(prefixed.as_str()));
    pick_clamped(&candidates, request.slot_index)
}

fn content_sentinel(
    resolver: &PlaceholderResolver<'_>,
    tree: &RenderTree,
    request: ResolveRequest,
) -> Option<NodeId> {
    let sentinels = &resolver.style(request.kind).sentinels;
    let candidates = resolver.content_candidates(tree, |text| {
        sentinels
            .iter()
            .any(|sentinel| !sentinel.is_empty() && text.contains(sentinel.as_str()))
    });
    pick_clamped(&candidates, request.slot_index)
}

fn loose_phrase(
    resolver: &PlaceholderResolver<'_>,
    tree: &RenderTree,
    request: ResolveRequest,
) -> Option<NodeId> {
    let phrases: Vec<String> = resolver
        .style(request.kind)
        .loose_sentinels
        .iter()
        .map(|phrase| phrase.to_lowercase())
        .filter(|phrase| !phrase.is_empty())
        .collect();
    if phrases.is_empty() {
        return None;
    }
    let candidates = resolver.content_candidates(tree, |text| {
        let lowered = text.to_lowercase();
        phrases.iter().any(|phrase| lowered.contains(phrase.as_str()))
    });
    pick_clamped(&candidates, request.slot_index)
}

/// Out-of-range requests degrade to the last candidate.
fn pick_clamped(candidates: &[NodeId], index: usize) -> Option<NodeId> {
    let last = candidates.len().checked_sub(1)?;
    candidates.get(index.min(last)).copied()
}
