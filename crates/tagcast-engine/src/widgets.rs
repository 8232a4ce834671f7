use tagcast_contracts::config::WidgetClasses;
use tagcast_contracts::media::{format_duration, ImageRecord};
use tagcast_contracts::tags::SlotKey;
use tagcast_contracts::tree::{Element, NodeData, NodeId, RenderTree};

pub const SLOT_ATTR: &str = "data-slot";
pub const ACTION_ATTR: &str = "data-action";
pub const STATE_ATTR: &str = "data-state";
pub const SAVED_ATTR: &str = "data-saved";

const COUNTER_CLASS: &str = "tc-counter";
const DURATION_CLASS: &str = "tc-duration";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Idle,
    Loading,
    Playing,
}

impl VoiceState {
    pub fn as_str(self) -> &'static str {
        match self {
            VoiceState::Idle => "idle",
            VoiceState::Loading => "loading",
            VoiceState::Playing => "playing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    Unsaved,
    Saving,
    Saved,
}

impl SaveState {
    pub fn as_str(self) -> &'static str {
        match self {
            SaveState::Unsaved => "false",
            SaveState::Saving => "saving",
            SaveState::Saved => "true",
        }
    }
}

/// Builds the widgets inserted in place of placeholders. Every builder
/// returns a detached subtree.
#[derive(Debug, Clone, Copy)]
pub struct WidgetFactory<'a> {
    classes: &'a WidgetClasses,
}

impl<'a> WidgetFactory<'a> {
    pub fn new(classes: &'a WidgetClasses) -> Self {
        Self { classes }
    }

    pub fn image(&self, tree: &mut RenderTree, key: SlotKey, record: &ImageRecord) -> NodeId {
        let root = tree.create(NodeData::Element(
            Element::new("div")
                .with_class(&self.classes.image)
                .with_attr(SLOT_ATTR, &key.to_string()),
        ));
        tree.append_element(
            root,
            Element::new("img")
                .with_attr("src", record.active_url().unwrap_or_default())
                .with_attr("alt", &record.prompt),
        );
        let carousel = tree.append_element(root, Element::new("div").with_class("tc-carousel"));
        button(tree, carousel, "prev", "‹");
        let counter = tree.append_element(carousel, Element::new("span").with_class(COUNTER_CLASS));
        tree.append_text(counter, &record.position_label());
        button(tree, carousel, "next", "›");
        button(tree, root, "edit", "✎");
        let save = button(tree, root, "save", "💾");
        set_attr(tree, save, SAVED_ATTR, save_state(record).as_str());
        root
    }

    pub fn loading(&self, tree: &mut RenderTree, key: SlotKey, prompt: &str) -> NodeId {
        let root = tree.create(NodeData::Element(
            Element::new("div")
                .with_class(&self.classes.loading)
                .with_attr(SLOT_ATTR, &key.to_string())
                .with_attr("title", prompt),
        ));
        tree.append_text(root, "Generating image…");
        root
    }

    pub fn failed(&self, tree: &mut RenderTree, key: SlotKey, prompt: &str) -> NodeId {
        let root = tree.create(NodeData::Element(
            Element::new("div")
                .with_class(&self.classes.failed)
                .with_attr(SLOT_ATTR, &key.to_string())
                .with_attr("title", prompt),
        ));
        tree.append_text(root, "Image generation failed");
        root
    }

    pub fn voice(&self, tree: &mut RenderTree, key: SlotKey, duration_secs: u64) -> NodeId {
        let root = tree.create(NodeData::Element(
            Element::new("div")
                .with_class(&self.classes.voice)
                .with_attr(SLOT_ATTR, &key.to_string())
                .with_attr(STATE_ATTR, VoiceState::Idle.as_str()),
        ));
        let phone = tree.append_element(root, Element::new("div").with_class(&self.classes.phone));
        button(tree, phone, "play", "▶");
        let duration = tree.append_element(phone, Element::new("span").with_class(DURATION_CLASS));
        tree.append_text(duration, &format_duration(duration_secs));
        button(tree, root, "edit", "✎");
        root
    }
}

/// Syncs source, position counter and save button with `record`.
pub fn update_image(tree: &mut RenderTree, widget: NodeId, record: &ImageRecord) {
    if let Some(img) = tree.find_descendant(widget, |element| element.tag == "img") {
        set_attr(tree, img, "src", record.active_url().unwrap_or_default());
        set_attr(tree, img, "alt", &record.prompt);
    }
    if let Some(counter) = tree.find_descendant(widget, |element| element.has_class(COUNTER_CLASS))
    {
        replace_text(tree, counter, &record.position_label());
    }
    set_save_state(tree, widget, save_state(record));
}

pub fn set_save_state(tree: &mut RenderTree, widget: NodeId, state: SaveState) {
    if let Some(save) = action_button(tree, widget, "save") {
        set_attr(tree, save, SAVED_ATTR, state.as_str());
    }
}

pub fn set_voice_state(tree: &mut RenderTree, widget: NodeId, state: VoiceState) {
    set_attr(tree, widget, STATE_ATTR, state.as_str());
}

pub fn set_duration(tree: &mut RenderTree, widget: NodeId, duration_secs: u64) {
    if let Some(duration) =
        tree.find_descendant(widget, |element| element.has_class(DURATION_CLASS))
    {
        replace_text(tree, duration, &format_duration(duration_secs));
    }
}

pub fn duration_label(tree: &RenderTree, widget: NodeId) -> Option<String> {
    tree.find_descendant(widget, |element| element.has_class(DURATION_CLASS))
        .map(|node| tree.text_content(node))
}

pub fn counter_label(tree: &RenderTree, widget: NodeId) -> Option<String> {
    tree.find_descendant(widget, |element| element.has_class(COUNTER_CLASS))
        .map(|node| tree.text_content(node))
}

/// The attached widget carrying `key`, whatever its current class.
pub fn find_widget(tree: &RenderTree, classes: &WidgetClasses, key: SlotKey) -> Option<NodeId> {
    let slot = key.to_string();
    let widget_classes = [
        classes.image.as_str(),
        classes.voice.as_str(),
        classes.loading.as_str(),
        classes.failed.as_str(),
    ];
    tree.elements_where(|element| {
        element.attr(SLOT_ATTR) == Some(slot.as_str())
            && widget_classes.iter().any(|class| element.has_class(class))
    })
    .into_iter()
    .next()
}

fn save_state(record: &ImageRecord) -> SaveState {
    if record.is_saved(record.active_index) {
        SaveState::Saved
    } else {
        SaveState::Unsaved
    }
}

fn button(tree: &mut RenderTree, parent: NodeId, action: &str, label: &str) -> NodeId {
    let node = tree.append_element(
        parent,
        Element::new("button").with_attr(ACTION_ATTR, action),
    );
    tree.append_text(node, label);
    node
}

fn action_button(tree: &RenderTree, widget: NodeId, action: &str) -> Option<NodeId> {
    tree.find_descendant(widget, |element| {
        element.tag == "button" && element.attr(ACTION_ATTR) == Some(action)
    })
}

fn set_attr(tree: &mut RenderTree, node: NodeId, name: &str, value: &str) {
    if let Some(element) = tree.element_mut(node) {
        element.set_attr(name, value);
    }
}

fn replace_text(tree: &mut RenderTree, node: NodeId, text: &str) {
    for child in tree.children(node).to_vec() {
        tree.detach(child);
    }
    tree.append_text(node, text);
}
