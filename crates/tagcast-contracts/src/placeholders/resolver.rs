use super::tiers::TIERS;
use crate::config::{PlaceholderConfig, PlaceholderStyle, WidgetClasses};
use crate::tags::TagKind;
use crate::tree::{Element, NodeId, RenderTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveRequest {
    pub kind: TagKind,
    pub slot_index: usize,
}

impl ResolveRequest {
    pub fn new(kind: TagKind, slot_index: usize) -> Self {
        Self { kind, slot_index }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub node: NodeId,
    /// Name of the tier that produced the match.
    pub tier: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct PlaceholderResolver<'a> {
    placeholders: &'a PlaceholderConfig,
    widgets: &'a WidgetClasses,
}

impl<'a> PlaceholderResolver<'a> {
    pub fn new(placeholders: &'a PlaceholderConfig, widgets: &'a WidgetClasses) -> Self {
        Self {
            placeholders,
            widgets,
        }
    }

    pub fn resolve(&self, tree: &RenderTree, request: ResolveRequest) -> Option<Resolution> {
        self.resolve_in(tree, request, true)
    }

    /// Marker tiers only. Safe on a tree that still holds tag text, where a
    /// sentinel inside the tag would otherwise match the author's paragraph.
    pub fn resolve_marked(
        &self,
        tree: &RenderTree,
        request: ResolveRequest,
    ) -> Option<Resolution> {
        self.resolve_in(tree, request, false)
    }

    fn resolve_in(
        &self,
        tree: &RenderTree,
        request: ResolveRequest,
        with_content: bool,
    ) -> Option<Resolution> {
        TIERS
            .iter()
            .filter(|tier| tier.applies_to(request.kind))
            .filter(|tier| with_content || !tier.reads_content)
            .find_map(|tier| {
                (tier.matcher)(self, tree, request).map(|node| Resolution {
                    node,
                    tier: tier.name,
                })
            })
    }

    pub(crate) fn style(&self, kind: TagKind) -> &PlaceholderStyle {
        self.placeholders.style(kind)
    }

    pub(crate) fn placeholder_class(&self, kind: TagKind) -> &str {
        self.style(kind).class.as_str()
    }

    pub(crate) fn sanitized_class(&self, kind: TagKind) -> String {
        format!(
            "{}{}",
            self.placeholders.sanitizer_prefix,
            self.placeholder_class(kind)
        )
    }

    pub(crate) fn index_attribute(&self) -> &str {
        self.placeholders.index_attribute.as_str()
    }

    /// Attached elements matching `predicate` that are neither a finished
    /// widget nor inside one, in document order.
    pub(crate) fn eligible_elements<F>(&self, tree: &RenderTree, predicate: F) -> Vec<NodeId>
    where
        F: Fn(&Element) -> bool,
    {
        tree.elements_where(|element| predicate(element) && !self.is_widget(element))
            .into_iter()
            .filter(|node| !tree.has_ancestor_where(*node, |element| self.is_widget(element)))
            .collect()
    }

    /// Innermost containers whose text satisfies `matches`, skipping any that
    /// already hold a voice player.
    pub(crate) fn content_candidates<F>(&self, tree: &RenderTree, matches: F) -> Vec<NodeId>
    where
        F: Fn(&str) -> bool,
    {
        let containers = &self.placeholders.containers;
        let phone = self.widgets.phone.as_str();
        let matching: Vec<NodeId> = self
            .eligible_elements(tree, |element| {
                containers.iter().any(|tag| tag.eq_ignore_ascii_case(&element.tag))
            })
            .into_iter()
            .filter(|node| {
                tree.find_descendant(*node, |element| element.has_class(phone))
                    .is_none()
            })
            .filter(|node| matches(tree.text_content(*node).as_str()))
            .collect();

        matching
            .iter()
            .copied()
            .filter(|candidate| {
                !matching
                    .iter()
                    .any(|other| other != candidate && tree.is_ancestor(*candidate, *other))
            })
            .collect()
    }

    fn is_widget(&self, element: &Element) -> bool {
        self.widgets
            .finished()
            .iter()
            .any(|class| !class.is_empty() && element.has_class(class))
    }
}

#[cfg(test)]
mod tests {
    use super::{PlaceholderResolver, ResolveRequest};
    use crate::config::{PlaceholderConfig, WidgetClasses};
    use crate::tags::TagKind;
    use crate::tree::RenderTree;

    fn resolve(html: &str, kind: TagKind, slot: usize) -> Option<(String, &'static str)> {
        let placeholders = PlaceholderConfig::default();
        let widgets = WidgetClasses::default();
        let tree = RenderTree::from_html(html);
        PlaceholderResolver::new(&placeholders, &widgets)
            .resolve(&tree, ResolveRequest::new(kind, slot))
            .map(|found| (tree.node_html(found.node), found.tier))
    }

    #[test]
    fn exact_marker_wins_over_position() {
        let html = r#"<div class="img-placeholder" data-index="1">b</div><div class="img-placeholder" data-index="0">a</div>"#;
        assert_eq!(
            resolve(html, TagKind::Image, 0),
            Some((
                r#"<div class="img-placeholder" data-index="0">a</div>"#.to_string(),
                "exact_marker"
            ))
        );
    }

    #[test]
    fn mislabelled_markers_fall_back_to_position_with_clamping() {
        let html = r#"<div class="img-placeholder" data-index="7">a</div><div class="img-placeholder">b</div>"#;
        let (node, tier) = resolve(html, TagKind::Image, 1).unwrap_or_default();
        assert_eq!(tier, "any_marker");
        assert!(node.contains(">b<"));
        let (node, _) = resolve(html, TagKind::Image, 9).unwrap_or_default();
        assert!(node.contains(">b<"));
    }

    #[test]
    fn sanitizer_prefixed_class_is_recognized() {
        let html = r#"<p>text</p><div class="custom-voice-placeholder">x</div>"#;
        let (_, tier) = resolve(html, TagKind::VoiceNote, 0).unwrap_or_default();
        assert_eq!(tier, "sanitized_class");
    }

    #[test]
    fn content_fallback_picks_by_position() {
        let html = "<p>intro</p><div>🖼 first</div><div>🖼 second</div>";
        let (node, tier) = resolve(html, TagKind::Image, 1).unwrap_or_default();
        assert_eq!(tier, "content_sentinel");
        assert_eq!(node, "<div>🖼 second</div>");
    }

    #[test]
    fn content_fallback_clamps_to_last_candidate() {
        let html = "<div>🖼 a</div><div>🖼 b</div><div>🖼 c</div>";
        let (node, _) = resolve(html, TagKind::Image, 5).unwrap_or_default();
        assert_eq!(node, "<div>🖼 c</div>");
    }

    #[test]
    fn content_fallback_prefers_innermost_match() {
        let html = "<div class=\"wrap\"><p>note</p><div>🎤 0:04</div></div>";
        let (node, _) = resolve(html, TagKind::VoiceNote, 0).unwrap_or_default();
        assert_eq!(node, "<div>🎤 0:04</div>");
    }

    #[test]
    fn content_fallback_skips_widgets_and_phone_holders() {
        let html = concat!(
            "<div class=\"tc-voice-widget\"><span>🎤 done</span></div>",
            "<div>🎤 <span class=\"tc-phone-widget\"></span></div>",
        );
        assert_eq!(resolve(html, TagKind::VoiceNote, 0), None);
    }

    #[test]
    fn loose_phrase_is_voice_only_and_case_insensitive() {
        let html = "<p>Here is a Voice Message for you</p>";
        let (_, tier) = resolve(html, TagKind::VoiceNote, 0).unwrap_or_default();
        assert_eq!(tier, "loose_phrase");
        assert_eq!(resolve("<p>a voice message</p>", TagKind::Image, 0), None);
    }

    #[test]
    fn marked_resolution_ignores_text_matches() {
        let placeholders = PlaceholderConfig::default();
        let widgets = WidgetClasses::default();
        let resolver = PlaceholderResolver::new(&placeholders, &widgets);
        let tree = RenderTree::from_html("<p>I left you a voice note</p>");
        let request = ResolveRequest::new(TagKind::VoiceNote, 0);
        assert!(resolver.resolve(&tree, request).is_some());
        assert!(resolver.resolve_marked(&tree, request).is_none());

        let tree = RenderTree::from_html(
            r#"<p>a voice note</p><div class="voice-placeholder" data-index="0"></div>"#,
        );
        let found = resolver.resolve_marked(&tree, request).map(|found| found.tier);
        assert_eq!(found, Some("exact_marker"));
    }

    #[test]
    fn nothing_found_returns_none() {
        assert_eq!(resolve("<p>plain text</p>", TagKind::Image, 0), None);
    }
}
