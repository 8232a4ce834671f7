use super::node::{NodeData, NodeId, PositionMarker, RenderTree};
use super::splice::{splice, Boundary};
use crate::tags::{MarkerPair, TagKind, TagMarkers};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TagSpan {
    start: Boundary,
    end: Boundary,
    has_content: bool,
}

/// Removes open/close tag spans from a rendered tree.
#[derive(Debug, Clone)]
pub struct TreeRangeStripper<'a> {
    markers: &'a TagMarkers,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StripReport {
    pub removed: usize,
    /// One marker per non-empty voice-note tag, in emission order.
    pub voice_markers: Vec<NodeId>,
}

impl<'a> TreeRangeStripper<'a> {
    pub fn new(markers: &'a TagMarkers) -> Self {
        Self { markers }
    }

    pub fn strip(&self, tree: &mut RenderTree) -> StripReport {
        let mut report = StripReport::default();
        for kind in TagKind::ALL {
            let pair = self.markers.get(kind);
            while let Some(span) = find_span(tree, pair) {
                let mut start = span.start;
                let mut end = span.end;
                if kind == TagKind::VoiceNote && span.has_content {
                    let ordinal = report.voice_markers.len();
                    let Some((marker, shifted_start, shifted_end)) =
                        insert_marker(tree, start, end, kind, ordinal)
                    else {
                        break;
                    };
                    report.voice_markers.push(marker);
                    start = shifted_start;
                    end = shifted_end;
                }
                if splice(tree, start, end).is_err() {
                    break;
                }
                report.removed += 1;
            }
        }
        report
    }
}

fn find_span(tree: &RenderTree, pair: &MarkerPair) -> Option<TagSpan> {
    let text_nodes = tree.text_nodes();
    let mut start: Option<Boundary> = None;
    let mut content = String::new();

    for node in text_nodes {
        let Some(text) = tree.text(node) else {
            continue;
        };
        let search_from = match start {
            Some(open) if open.node == node => open.offset + pair.open.len(),
            Some(_) => 0,
            None => {
                let Some(offset) = text.find(pair.open.as_str()) else {
                    continue;
                };
                start = Some(Boundary::new(node, offset));
                offset + pair.open.len()
            }
        };
        let tail = &text[search_from..];
        if let Some(close_at) = tail.find(pair.close.as_str()) {
            content.push_str(&tail[..close_at]);
            let start = start?;
            return Some(TagSpan {
                start,
                end: Boundary::new(node, search_from + close_at + pair.close.len()),
                has_content: !content.trim().is_empty(),
            });
        }
        content.push_str(tail);
    }
    None
}

/// Splits the start node so a position marker sits exactly where the tag
/// began, returning the marker and the range shifted past it.
fn insert_marker(
    tree: &mut RenderTree,
    start: Boundary,
    end: Boundary,
    kind: TagKind,
    ordinal: usize,
) -> Option<(NodeId, Boundary, Boundary)> {
    let text = tree.text(start.node)?.to_string();
    let (head, tail) = text.split_at(start.offset);
    tree.set_text(start.node, head);
    let marker = tree.insert_after(
        start.node,
        NodeData::PositionMarker(PositionMarker { kind, ordinal }),
    )?;
    let tail_node = tree.insert_after(marker, NodeData::Text(tail.to_string()))?;
    if head.is_empty() {
        tree.detach(start.node);
    }
    let shifted_end = if end.node == start.node {
        Boundary::new(tail_node, end.offset - start.offset)
    } else {
        end
    };
    Some((marker, Boundary::new(tail_node, 0), shifted_end))
}

#[cfg(test)]
mod tests {
    use super::TreeRangeStripper;
    use crate::tags::TagMarkers;
    use crate::tree::{NodeData, RenderTree};

    fn strip(html: &str) -> (RenderTree, super::StripReport) {
        let markers = TagMarkers::default();
        let mut tree = RenderTree::from_html(html);
        let report = TreeRangeStripper::new(&markers).strip(&mut tree);
        (tree, report)
    }

    #[test]
    fn removes_tag_crossing_three_sibling_elements() {
        let (tree, report) = strip(
            "<p>keep [IMG]a <em>red</em> <strong>big</strong><br><i>bi</i>cycle[/IMG] tail</p>",
        );
        assert_eq!(report.removed, 1);
        assert_eq!(tree.to_html(), "<p>keep  tail</p>");
    }

    #[test]
    fn outside_text_is_untouched_and_second_pass_is_noop() {
        let html = "<p>α [IMG]x<b>y</b>z[/IMG] β</p><p><em>γ</em> [VOICE]hi[/VOICE]δ</p>";
        let (mut tree, report) = strip(html);
        assert_eq!(report.removed, 2);
        let once = tree.to_html();
        assert_eq!(once, "<p>α  β</p><p><em>γ</em> δ</p>");

        let markers = TagMarkers::default();
        let again = TreeRangeStripper::new(&markers).strip(&mut tree);
        assert_eq!(again.removed, 0);
        assert!(again.voice_markers.is_empty());
        assert_eq!(tree.to_html(), once);
    }

    #[test]
    fn voice_tags_leave_markers_at_their_start() {
        let (tree, report) =
            strip("<p>one [VOICE]first[/VOICE] two</p><p>[VOICE]sec<em>ond</em>[/VOICE]</p>");
        assert_eq!(report.voice_markers.len(), 2);
        let first = report.voice_markers[0];
        assert!(tree.is_attached(first));
        let siblings = tree.children(tree.parent(first).expect("marker has a parent"));
        let at = siblings.iter().position(|id| *id == first).unwrap_or(0);
        assert_eq!(tree.text(siblings[at - 1]), Some("one "));
        assert_eq!(tree.text(siblings[at + 1]), Some(" two"));
        assert!(matches!(
            tree.data(report.voice_markers[1]),
            NodeData::PositionMarker(marker) if marker.ordinal == 1
        ));
    }

    #[test]
    fn empty_voice_tags_are_removed_without_a_marker() {
        let (tree, report) = strip("<p>[VOICE] [/VOICE]x[VOICE]y[/VOICE]</p>");
        assert_eq!(report.removed, 2);
        assert_eq!(report.voice_markers.len(), 1);
        assert_eq!(tree.text_content(tree.root()), "x");
    }

    #[test]
    fn unterminated_tag_is_left_alone() {
        let (tree, report) = strip("<p>[IMG]no close</p>");
        assert_eq!(report.removed, 0);
        assert_eq!(tree.to_html(), "<p>[IMG]no close</p>");
    }
}
