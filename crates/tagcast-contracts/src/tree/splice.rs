use std::collections::BTreeSet;

use super::node::{NodeId, RenderTree};
use crate::error::MediaError;

/// A position inside a text node, as a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    pub node: NodeId,
    pub offset: usize,
}

impl Boundary {
    pub fn new(node: NodeId, offset: usize) -> Self {
        Self { node, offset }
    }
}

/// Deletes everything between `start` and `end` in document order.
///
/// Both boundaries must sit in attached text nodes with `start` preceding
/// `end`. Nodes lying wholly inside the range are detached; elements that
/// merely contain one of the boundaries keep all of their content outside the
/// range. Boundary text nodes left empty are removed.
pub fn splice(tree: &mut RenderTree, start: Boundary, end: Boundary) -> Result<(), MediaError> {
    let start_text = boundary_text(tree, start)?;
    let end_text = boundary_text(tree, end)?;

    if start.node == end.node {
        if start.offset > end.offset {
            return Err(MediaError::InvalidRange(format!(
                "start offset {} is after end offset {}",
                start.offset, end.offset
            )));
        }
        let mut text = start_text;
        text.replace_range(start.offset..end.offset, "");
        tree.set_text(start.node, &text);
        drop_if_empty(tree, start.node);
        return Ok(());
    }

    let order = tree.document_order();
    let position = |node: NodeId| order.iter().position(|candidate| *candidate == node);
    let (Some(start_pos), Some(end_pos)) = (position(start.node), position(end.node)) else {
        return Err(MediaError::InvalidRange("boundary is detached".to_string()));
    };
    if start_pos > end_pos {
        return Err(MediaError::InvalidRange(
            "start boundary follows end boundary".to_string(),
        ));
    }

    let end_ancestors = tree.ancestors(end.node);
    let contained: BTreeSet<NodeId> = order[start_pos + 1..end_pos]
        .iter()
        .copied()
        .filter(|node| !end_ancestors.contains(node))
        .collect();
    let topmost: Vec<NodeId> = contained
        .iter()
        .copied()
        .filter(|node| {
            tree.parent(*node)
                .map(|parent| !contained.contains(&parent))
                .unwrap_or(true)
        })
        .collect();
    for node in topmost {
        tree.detach(node);
    }

    tree.set_text(start.node, &start_text[..start.offset]);
    tree.set_text(end.node, &end_text[end.offset..]);
    drop_if_empty(tree, start.node);
    drop_if_empty(tree, end.node);
    Ok(())
}

fn boundary_text(tree: &RenderTree, boundary: Boundary) -> Result<String, MediaError> {
    let text = tree
        .text(boundary.node)
        .ok_or_else(|| MediaError::InvalidRange(format!("{} is not a text node", boundary.node)))?;
    if boundary.offset > text.len() || !text.is_char_boundary(boundary.offset) {
        return Err(MediaError::InvalidRange(format!(
            "offset {} is not a character boundary in {}",
            boundary.offset, boundary.node
        )));
    }
    Ok(text.to_string())
}

fn drop_if_empty(tree: &mut RenderTree, node: NodeId) {
    if tree.text(node).map(str::is_empty).unwrap_or(false) {
        tree.detach(node);
    }
}
