use std::collections::BTreeMap;

use tagcast_contracts::error::MediaError;
use tagcast_contracts::message::MessageId;
use tagcast_contracts::tags::{SlotKey, TagKind};
use tagcast_contracts::tree::NodeId;

use crate::widgets::VoiceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WidgetKey {
    pub message: MessageId,
    pub slot: SlotKey,
}

impl WidgetKey {
    pub fn new(message: MessageId, slot: SlotKey) -> Self {
        Self { message, slot }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Interaction {
    Navigate,
    Edit,
    Play,
    SaveToGallery,
}

impl Interaction {
    /// Interactions a finished widget of `kind` carries.
    pub fn for_kind(kind: TagKind) -> &'static [Interaction] {
        match kind {
            TagKind::Image => &[
                Interaction::Navigate,
                Interaction::Edit,
                Interaction::SaveToGallery,
            ],
            TagKind::VoiceNote => &[Interaction::Play, Interaction::Edit],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub widget: NodeId,
    pub interactions: Vec<Interaction>,
    /// Set while a playback is in progress.
    pub busy: bool,
    pub voice_state: VoiceState,
}

impl Binding {
    pub fn supports(&self, interaction: Interaction) -> bool {
        self.interactions.contains(&interaction)
    }
}

/// Interaction bindings of the widgets currently on screen.
///
/// One binding per widget key: attaching again replaces the previous one.
#[derive(Debug, Clone, Default)]
pub struct WidgetBinder {
    bindings: BTreeMap<WidgetKey, Binding>,
}

impl WidgetBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the binding that was replaced, if any.
    pub fn attach(
        &mut self,
        key: WidgetKey,
        widget: NodeId,
        interactions: &[Interaction],
    ) -> Option<Binding> {
        self.bindings.insert(
            key,
            Binding {
                widget,
                interactions: interactions.to_vec(),
                busy: false,
                voice_state: VoiceState::Idle,
            },
        )
    }

    pub fn get(&self, key: WidgetKey) -> Option<&Binding> {
        self.bindings.get(&key)
    }

    /// The binding for `key` when it carries `interaction`.
    pub fn require(&self, key: WidgetKey, interaction: Interaction) -> Result<&Binding, MediaError> {
        self.bindings
            .get(&key)
            .filter(|binding| binding.supports(interaction))
            .ok_or(MediaError::NotBound(key.slot))
    }

    pub fn begin_playback(&mut self, key: WidgetKey) -> Result<NodeId, MediaError> {
        let binding = self
            .bindings
            .get_mut(&key)
            .filter(|binding| binding.supports(Interaction::Play))
            .ok_or(MediaError::NotBound(key.slot))?;
        if binding.busy {
            return Err(MediaError::PlaybackBusy(key.slot));
        }
        binding.busy = true;
        binding.voice_state = VoiceState::Loading;
        Ok(binding.widget)
    }

    pub fn set_voice_state(&mut self, key: WidgetKey, state: VoiceState) {
        if let Some(binding) = self.bindings.get_mut(&key) {
            binding.voice_state = state;
        }
    }

    pub fn end_playback(&mut self, key: WidgetKey) {
        if let Some(binding) = self.bindings.get_mut(&key) {
            binding.busy = false;
            binding.voice_state = VoiceState::Idle;
        }
    }

    pub fn detach_message(&mut self, message: MessageId) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|key, _| key.message != message);
        before - self.bindings.len()
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = WidgetKey> + '_ {
        self.bindings.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use tagcast_contracts::error::MediaError;
    use tagcast_contracts::message::MessageId;
    use tagcast_contracts::tags::{SlotKey, TagKind};
    use tagcast_contracts::tree::{Element, NodeData, RenderTree};

    use super::{Interaction, WidgetBinder, WidgetKey};

    #[test]
    fn rebinding_replaces_instead_of_stacking() {
        let mut tree = RenderTree::new();
        let first = tree.create(NodeData::Element(Element::new("div")));
        let second = tree.create(NodeData::Element(Element::new("div")));
        let key = WidgetKey::new(MessageId(1), SlotKey::image(0));
        let mut binder = WidgetBinder::new();

        assert!(binder
            .attach(key, first, Interaction::for_kind(TagKind::Image))
            .is_none());
        let replaced = binder.attach(key, second, Interaction::for_kind(TagKind::Image));
        assert_eq!(replaced.map(|binding| binding.widget), Some(first));
        assert_eq!(binder.len(), 1);
        assert_eq!(binder.get(key).map(|binding| binding.widget), Some(second));
    }

    #[test]
    fn playback_is_guarded_by_the_busy_flag() {
        let mut tree = RenderTree::new();
        let widget = tree.create(NodeData::Element(Element::new("div")));
        let key = WidgetKey::new(MessageId(1), SlotKey::voice(0));
        let mut binder = WidgetBinder::new();
        binder.attach(key, widget, Interaction::for_kind(TagKind::VoiceNote));

        assert_eq!(binder.begin_playback(key), Ok(widget));
        assert_eq!(
            binder.begin_playback(key),
            Err(MediaError::PlaybackBusy(SlotKey::voice(0)))
        );
        binder.end_playback(key);
        assert_eq!(binder.begin_playback(key), Ok(widget));
    }

    #[test]
    fn missing_or_unsupported_bindings_are_reported() {
        let mut tree = RenderTree::new();
        let widget = tree.create(NodeData::Element(Element::new("div")));
        let image = WidgetKey::new(MessageId(1), SlotKey::image(0));
        let mut binder = WidgetBinder::new();
        binder.attach(image, widget, Interaction::for_kind(TagKind::Image));

        assert!(binder.require(image, Interaction::Navigate).is_ok());
        assert_eq!(
            binder.require(image, Interaction::Play).map(|binding| binding.widget),
            Err(MediaError::NotBound(SlotKey::image(0)))
        );
        assert_eq!(
            binder.begin_playback(WidgetKey::new(MessageId(2), SlotKey::voice(0))),
            Err(MediaError::NotBound(SlotKey::voice(0)))
        );
    }

    #[test]
    fn detaching_a_message_keeps_other_bindings() {
        let mut tree = RenderTree::new();
        let widget = tree.create(NodeData::Element(Element::new("div")));
        let mut binder = WidgetBinder::new();
        for message in [1, 1, 2] {
            let slot = SlotKey::image(binder.len());
            binder.attach(
                WidgetKey::new(MessageId(message), slot),
                widget,
                Interaction::for_kind(TagKind::Image),
            );
        }
        assert_eq!(binder.detach_message(MessageId(1)), 2);
        assert_eq!(binder.len(), 1);
        binder.clear();
        assert!(binder.is_empty());
    }
}
