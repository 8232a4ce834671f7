use scraper::{ElementRef, Html};

use super::node::{Element, NodeData, NodeId, RenderTree};

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

impl RenderTree {
    /// Parses an HTML fragment as the host renderer would hand it over.
    /// Comments and processing instructions are dropped.
    pub fn from_html(fragment: &str) -> Self {
        let document = Html::parse_fragment(fragment);
        let mut tree = RenderTree::new();
        let root = tree.root();
        import_children(&mut tree, root, document.root_element());
        tree
    }

    pub fn to_html(&self) -> String {
        let mut out = String::new();
        for child in self.children(self.root()) {
            self.write_node(*child, &mut out);
        }
        out
    }

    pub fn node_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_node(id, &mut out);
        out
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        match self.data(id) {
            NodeData::Root => {
                for child in self.children(id) {
                    self.write_node(*child, out);
                }
            }
            NodeData::Text(text) => out.push_str(&escape_text(text)),
            NodeData::PositionMarker(_) => {}
            NodeData::Element(element) => {
                out.push('<');
                out.push_str(&element.tag);
                for (name, value) in &element.attrs {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    out.push_str(&escape_attr(value));
                    out.push('"');
                }
                out.push('>');
                if VOID_ELEMENTS.contains(&element.tag.as_str()) {
                    return;
                }
                for child in self.children(id) {
                    self.write_node(*child, out);
                }
                out.push_str("</");
                out.push_str(&element.tag);
                out.push('>');
            }
        }
    }
}

fn import_children(tree: &mut RenderTree, parent: NodeId, source: ElementRef<'_>) {
    for child in source.children() {
        if let Some(child_element) = ElementRef::wrap(child) {
            let value = child_element.value();
            let mut element = Element::new(value.name());
            for (name, attr_value) in value.attrs() {
                element.attrs.push((name.to_string(), attr_value.to_string()));
            }
            let id = tree.append_element(parent, element);
            import_children(tree, id, child_element);
        } else if let Some(text) = child.value().as_text() {
            tree.append_text(parent, &text[..]);
        }
    }
}

fn escape_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(value: &str) -> String {
    escape_text(value).replace('"', "&quot;")
}
