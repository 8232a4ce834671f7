use tagcast_contracts::tree::RenderTree;

/// Turns a message's raw text into the tree the host would display.
pub trait MessageRenderer: Send + Sync {
    fn render(&self, text: &str) -> RenderTree;
}

/// Treats raw text as an HTML fragment with line breaks kept as `<br>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlRenderer;

impl MessageRenderer for HtmlRenderer {
    fn render(&self, text: &str) -> RenderTree {
        let html = text.replace("\r\n", "\n").replace('\n', "<br>");
        RenderTree::from_html(&html)
    }
}

#[cfg(test)]
mod tests {
    use super::{HtmlRenderer, MessageRenderer};

    #[test]
    fn newlines_become_line_breaks() {
        let tree = HtmlRenderer.render("one\r\ntwo\n<b>three</b>");
        assert_eq!(tree.to_html(), "one<br>two<br><b>three</b>");
    }

    #[test]
    fn tags_survive_rendering_as_text() {
        let tree = HtmlRenderer.render("hi [IMG]a <i>red</i> bicycle[/IMG] bye");
        assert_eq!(tree.text_content(tree.root()), "hi [IMG]a red bicycle[/IMG] bye");
    }
}
