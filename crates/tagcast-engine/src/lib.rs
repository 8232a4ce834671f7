pub mod backends;
pub mod binder;
pub mod persistence;
pub mod renderer;
pub mod store;
pub mod widgets;


use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::{json, Value};
use tagcast_contracts::config::EngineConfig;
use tagcast_contracts::error::MediaError;
use tagcast_contracts::events::{payload, EventWriter};
use tagcast_contracts::media::{
    edit_diff, estimate_duration_secs, ImageRecord, MediaRecord, MediaSlots, VoiceRecord,
};
use tagcast_contracts::message::{ChatLog, MessageId};
use tagcast_contracts::placeholders::{PlaceholderResolver, ResolveRequest};
use tagcast_contracts::processing::{decide, ProcessingContext, ProcessingState};
use tagcast_contracts::tags::{SlotKey, TagExtractor, TagKind, TagMatch};
use tagcast_contracts::tree::{Element, NodeId, RenderTree, TreeRangeStripper};
use uuid::Uuid;

use crate::backends::{Backends, GenerationRequest, PlaybackSignal};
use crate::binder::{Interaction, WidgetBinder, WidgetKey};
use crate::persistence::ChatPersistence;
use crate::renderer::{HtmlRenderer, MessageRenderer};
use crate::store::MediaStateStore;
use crate::widgets::{SaveState, VoiceState, WidgetFactory};

/// Where a slot's widget ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Placeholder resolved before the tags were stripped.
    Captured,
    /// Placeholder resolved by the named resolver tier.
    Tier(&'static str),
    PositionMarker,
    Appended,
}

impl Placement {
    pub fn as_str(self) -> &'static str {
        match self {
            Placement::Captured => "captured",
            Placement::Tier(name) => name,
            Placement::PositionMarker => "position_marker",
            Placement::Appended => "appended",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome {
    Generated,
    Restored,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotReport {
    pub slot: SlotKey,
    pub placement: Placement,
    pub outcome: SlotOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub message: MessageId,
    /// `Skip`, `NeedsFirstGeneration` or `RestoreOnly`.
    pub mode: ProcessingState,
    pub slots: Vec<SlotReport>,
}

impl PassReport {
    pub fn slot(&self, key: SlotKey) -> Option<&SlotReport> {
        self.slots.iter().find(|report| report.slot == key)
    }

    pub fn failed(&self) -> usize {
        self.slots
            .iter()
            .filter(|report| matches!(report.outcome, SlotOutcome::Failed { .. }))
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Prev,
    Next,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    /// No start signal arrived within the configured timeout.
    StartTimedOut,
    /// Playback started but never reported its end.
    EndTimedOut,
}

/// Editable copy of a slot's prompt or voice text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditDraft {
    pub message: MessageId,
    pub slot: SlotKey,
    pub original: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditAction {
    Save,
    /// Save, then generate a new variant or play the voice note.
    SaveAndRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    Saved,
    Regenerated { active_index: usize },
    Played(PlaybackOutcome),
}

enum StartWait {
    Started,
    EndedEarly,
    TimedOut,
}

struct SlotPlan {
    key: SlotKey,
    candidates: Vec<(Placement, NodeId)>,
}

/// Drives media processing for one chat: decides per message, strips tags
/// from the rendered tree, places widgets, talks to the backends and keeps
/// the persisted slots in step.
pub struct MediaEngine {
    config: EngineConfig,
    extractor: TagExtractor,
    store: MediaStateStore,
    context: ProcessingContext,
    binder: WidgetBinder,
    surface: BTreeMap<MessageId, RenderTree>,
    backends: Backends,
    renderer: Box<dyn MessageRenderer>,
    events: EventWriter,
    session_id: String,
}

impl MediaEngine {
    pub fn new(
        config: EngineConfig,
        chat: ChatLog,
        persistence: Box<dyn ChatPersistence>,
        backends: Backends,
        events_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let extractor = TagExtractor::new(config.tags.clone())?;
        let session_id = format!("session-{}", Uuid::new_v4());
        let events = EventWriter::new(events_path.into(), session_id.clone());
        events.record(
            "session_started",
            payload([
                ("chat_id", json!(chat.chat_id)),
                ("messages", json!(chat.messages.len())),
                ("backends", backends.describe()),
            ]),
        );

        Ok(Self {
            config,
            extractor,
            store: MediaStateStore::new(chat, persistence, events.clone()),
            context: ProcessingContext::new(),
            binder: WidgetBinder::new(),
            surface: BTreeMap::new(),
            backends,
            renderer: Box::new(HtmlRenderer),
            events,
            session_id,
        })
    }

    pub fn with_renderer(mut self, renderer: Box<dyn MessageRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn chat(&self) -> &ChatLog {
        self.store.chat()
    }

    pub fn slots(&self, id: MessageId) -> Result<MediaSlots, MediaError> {
        self.store.slots(id)
    }

    pub fn context(&self) -> &ProcessingContext {
        &self.context
    }

    pub fn binder(&self) -> &WidgetBinder {
        &self.binder
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    pub fn last_persist_error(&self) -> Option<&str> {
        self.store.last_persist_error()
    }

    pub fn rendered(&self, id: MessageId) -> Option<&RenderTree> {
        self.surface.get(&id)
    }

    pub fn rendered_html(&self, id: MessageId) -> Option<String> {
        self.surface.get(&id).map(RenderTree::to_html)
    }

    /// Takes the host's rendered tree for `id`. Bindings made against a
    /// previous tree of that message are dropped.
    pub fn mount(&mut self, id: MessageId, tree: RenderTree) {
        self.binder.detach_message(id);
        self.surface.insert(id, tree);
    }

    pub fn unmount(&mut self, id: MessageId) -> Option<RenderTree> {
        self.binder.detach_message(id);
        self.surface.remove(&id)
    }

    pub fn render_message(&mut self, id: MessageId) -> Result<(), MediaError> {
        let tree = self.renderer.render(&self.store.message(id)?.text);
        self.mount(id, tree);
        Ok(())
    }

    /// Forgets every processed message, binding and rendered tree, then
    /// makes `chat` the active one. Returns the previous chat.
    pub fn switch_chat(&mut self, chat: ChatLog) -> ChatLog {
        self.context.on_chat_switch();
        self.binder.clear();
        self.surface.clear();
        let previous = self.store.replace_chat(chat);
        self.events.record(
            "chat_switched",
            payload([
                ("from", json!(previous.chat_id)),
                ("to", json!(self.store.chat().chat_id)),
            ]),
        );
        previous
    }

    /// A regenerated message: new text, no media, eligible for processing
    /// again.
    pub fn on_content_changed(&mut self, id: MessageId, text: &str) -> Result<(), MediaError> {
        self.store.reset_content(id, text)?;
        self.context.on_content_changed(id);
        self.render_message(id)?;
        self.events
            .record("content_changed", payload([("message", json!(id.0))]));
        Ok(())
    }

    /// Manual recovery path: forgets `target` (or every message), renders
    /// it again from its text and runs a pass.
    pub fn reprocess(&mut self, target: Option<MessageId>) -> Result<Vec<PassReport>, MediaError> {
        let ids = match target {
            Some(id) => {
                self.store.message(id)?;
                self.context.on_content_changed(id);
                vec![id]
            }
            None => {
                self.context.on_chat_switch();
                self.store.chat().ids()
            }
        };
        self.events.record(
            "reprocess_requested",
            payload([("messages", json!(ids.iter().map(|id| id.0).collect::<Vec<u64>>()))]),
        );
        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            self.render_message(id)?;
            reports.push(self.on_render_completed(id)?);
        }
        Ok(reports)
    }

    /// Runs a pass over every message, rendering those the host has not
    /// mounted.
    pub fn process_all(&mut self) -> Result<Vec<PassReport>, MediaError> {
        let ids = self.store.chat().ids();
        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            if !self.surface.contains_key(&id) {
                self.render_message(id)?;
            }
            reports.push(self.on_render_completed(id)?);
        }
        Ok(reports)
    }

    /// Render-completed signal for `id`. Safe to call any number of times.
    pub fn on_render_completed(&mut self, id: MessageId) -> Result<PassReport, MediaError> {
        let message = self.store.message(id)?;
        let mode = decide(message, &self.context, &self.extractor);
        if !mode.is_actionable() {
            self.events.record(
                "message_skipped",
                payload([
                    ("message", json!(id.0)),
                    ("already_processed", json!(self.context.is_processed(id))),
                ]),
            );
            return Ok(PassReport {
                message: id,
                mode: ProcessingState::Skip,
                slots: Vec::new(),
            });
        }
        let text = message.text.clone();
        let slots = MediaSlots::from_message(message);

        let Some(mut tree) = self.surface.remove(&id) else {
            self.events.record(
                "processing_abandoned",
                payload([
                    ("message", json!(id.0)),
                    ("reason", json!("missing_render_target")),
                ]),
            );
            return Err(MediaError::MissingRenderTarget(id));
        };

        self.events.record(
            "processing_started",
            payload([("message", json!(id.0)), ("mode", json!(mode.as_str()))]),
        );
        let reports = self.run_pass(id, &text, slots, &mut tree);
        self.surface.insert(id, tree);
        self.context.mark_processed(id);

        let report = PassReport {
            message: id,
            mode,
            slots: reports,
        };
        self.events.record(
            "processing_finished",
            payload([
                ("message", json!(id.0)),
                ("mode", json!(mode.as_str())),
                ("slots", json!(report.slots.len())),
                ("failed", json!(report.failed())),
            ]),
        );
        Ok(report)
    }

    fn run_pass(
        &mut self,
        id: MessageId,
        text: &str,
        mut slots: MediaSlots,
        tree: &mut RenderTree,
    ) -> Vec<SlotReport> {
        let extraction = self.extractor.extract(text);
        let image_indices = slot_indices(&slots, TagKind::Image, extraction.matches(TagKind::Image));
        let voice_indices =
            slot_indices(&slots, TagKind::VoiceNote, extraction.matches(TagKind::VoiceNote));

        let (image_plans, voice_plans) = {
            let resolver =
                PlaceholderResolver::new(&self.config.placeholders, &self.config.widgets);
            let captured: Vec<Option<NodeId>> = voice_indices
                .iter()
                .map(|index| {
                    resolver
                        .resolve_marked(&*tree, ResolveRequest::new(TagKind::VoiceNote, *index))
                        .map(|found| found.node)
                })
                .collect();

            let stripped = TreeRangeStripper::new(&self.config.tags).strip(tree);

            let view: &RenderTree = tree;
            let plan = |kind: TagKind, index: usize| -> Vec<(Placement, NodeId)> {
                resolver
                    .resolve(view, ResolveRequest::new(kind, index))
                    .map(|found| (Placement::Tier(found.tier), found.node))
                    .into_iter()
                    .collect()
            };
            let image_plans: Vec<SlotPlan> = image_indices
                .iter()
                .map(|index| SlotPlan {
                    key: SlotKey::image(*index),
                    candidates: plan(TagKind::Image, *index),
                })
                .collect();
            let voice_plans: Vec<SlotPlan> = voice_indices
                .iter()
                .zip(captured)
                .map(|(index, captured)| {
                    let mut candidates = Vec::new();
                    if let Some(node) = captured {
                        candidates.push((Placement::Captured, node));
                    }
                    candidates.extend(plan(TagKind::VoiceNote, *index));
                    if let Some(marker) = stripped.voice_markers.get(*index) {
                        candidates.push((Placement::PositionMarker, *marker));
                    }
                    SlotPlan {
                        key: SlotKey::voice(*index),
                        candidates,
                    }
                })
                .collect();
            (image_plans, voice_plans)
        };

        let mut reports = Vec::new();
        for plan in image_plans {
            let prompt = extraction
                .images
                .iter()
                .find(|item| item.slot_index == plan.key.index)
                .map(|item| item.content.clone());
            if let Some(report) =
                self.place_image(id, tree, &plan, &mut slots, prompt.as_deref())
            {
                reports.push(report);
            }
        }
        for plan in voice_plans {
            let content = extraction
                .voice_notes
                .iter()
                .find(|item| item.slot_index == plan.key.index)
                .map(|item| item.content.clone());
            if let Some(report) = self.place_voice(id, tree, &plan, &mut slots, content.as_deref())
            {
                reports.push(report);
            }
        }

        let images_done = extraction
            .images
            .iter()
            .all(|item| slots.image(SlotKey::image(item.slot_index)).is_some());
        if images_done && extraction.stripped_text != text {
            if let Err(err) = self.store.set_text(id, &extraction.stripped_text) {
                self.events.record(
                    "text_update_failed",
                    payload([("message", json!(id.0)), ("error", json!(err.to_string()))]),
                );
            }
        }
        tree.remove_position_markers();
        reports
    }

    fn place_image(
        &mut self,
        id: MessageId,
        tree: &mut RenderTree,
        plan: &SlotPlan,
        slots: &mut MediaSlots,
        prompt: Option<&str>,
    ) -> Option<SlotReport> {
        let key = plan.key;
        let (placement, target) = self.choose_target(tree, &plan.candidates);

        if let Some(record) = slots.image(key).cloned() {
            let widget = WidgetFactory::new(&self.config.widgets).image(tree, key, &record);
            insert_widget(tree, target, widget);
            self.bind(id, key, widget);
            self.emit_slot("placeholder_resolved", id, key, json!({"tier": placement.as_str()}));
            self.emit_slot("slot_restored", id, key, json!({"variants": record.variants.len()}));
            return Some(SlotReport {
                slot: key,
                placement,
                outcome: SlotOutcome::Restored,
            });
        }

        let prompt = prompt?;
        self.emit_slot("placeholder_resolved", id, key, json!({"tier": placement.as_str()}));
        let loading = WidgetFactory::new(&self.config.widgets).loading(tree, key, prompt);
        insert_widget(tree, target, loading);

        let outcome = match self.generate_image(prompt) {
            Ok(url) => {
                let record = ImageRecord::new(&url, prompt);
                let stored = MediaRecord::Image(record.clone());
                match slots
                    .upsert(key, stored.clone())
                    .and_then(|()| self.store.upsert(id, key, stored))
                {
                    Ok(()) => {
                        let widget =
                            WidgetFactory::new(&self.config.widgets).image(tree, key, &record);
                        tree.replace(loading, widget);
                        self.bind(id, key, widget);
                        self.emit_slot("slot_generated", id, key, json!({"url": url}));
                        SlotOutcome::Generated
                    }
                    Err(err) => SlotOutcome::Failed {
                        reason: err.to_string(),
                    },
                }
            }
            Err(reason) => SlotOutcome::Failed { reason },
        };

        if let SlotOutcome::Failed { reason } = &outcome {
            let failed = WidgetFactory::new(&self.config.widgets).failed(tree, key, prompt);
            tree.replace(loading, failed);
            self.emit_slot("slot_failed", id, key, json!({"reason": reason}));
        }
        Some(SlotReport {
            slot: key,
            placement,
            outcome,
        })
    }

    fn place_voice(
        &mut self,
        id: MessageId,
        tree: &mut RenderTree,
        plan: &SlotPlan,
        slots: &mut MediaSlots,
        content: Option<&str>,
    ) -> Option<SlotReport> {
        let key = plan.key;
        let (record, outcome) = match slots.voice(key).cloned() {
            Some(record) => (record, SlotOutcome::Restored),
            None => {
                let record = VoiceRecord {
                    text: content?.to_string(),
                };
                let stored = MediaRecord::VoiceNote(record.clone());
                let saved = slots
                    .upsert(key, stored.clone())
                    .and_then(|()| self.store.upsert(id, key, stored));
                match saved {
                    Ok(()) => (record, SlotOutcome::Generated),
                    Err(err) => {
                        self.emit_slot("slot_failed", id, key, json!({"reason": err.to_string()}));
                        return Some(SlotReport {
                            slot: key,
                            placement: Placement::Appended,
                            outcome: SlotOutcome::Failed {
                                reason: err.to_string(),
                            },
                        });
                    }
                }
            }
        };

        let (placement, target) = self.choose_target(tree, &plan.candidates);
        let duration = estimate_duration_secs(&record.text, self.config.playback.words_per_second);
        let widget = WidgetFactory::new(&self.config.widgets).voice(tree, key, duration);
        insert_widget(tree, target, widget);
        self.bind(id, key, widget);
        self.emit_slot("placeholder_resolved", id, key, json!({"tier": placement.as_str()}));
        self.emit_slot(
            "voice_bound",
            id,
            key,
            json!({"duration_secs": duration, "restored": outcome == SlotOutcome::Restored}),
        );
        Some(SlotReport {
            slot: key,
            placement,
            outcome,
        })
    }

    /// First candidate still attached and neither inside nor wrapping a
    /// widget; `Appended` when none qualifies.
    fn choose_target(
        &self,
        tree: &RenderTree,
        candidates: &[(Placement, NodeId)],
    ) -> (Placement, Option<NodeId>) {
        let widgets = &self.config.widgets;
        let mut classes = widgets.finished().to_vec();
        classes.push(widgets.loading.as_str());
        let is_widget = |element: &Element| {
            classes
                .iter()
                .any(|class| !class.is_empty() && element.has_class(class))
        };
        candidates
            .iter()
            .find(|(_, node)| {
                tree.is_attached(*node)
                    && *node != tree.root()
                    && !tree.element(*node).map(&is_widget).unwrap_or(false)
                    && !tree.has_ancestor_where(*node, &is_widget)
                    && tree.find_descendant(*node, &is_widget).is_none()
            })
            .map(|(placement, node)| (*placement, Some(*node)))
            .unwrap_or((Placement::Appended, None))
    }

    fn bind(&mut self, id: MessageId, key: SlotKey, widget: NodeId) {
        self.binder.attach(
            WidgetKey::new(id, key),
            widget,
            Interaction::for_kind(key.kind),
        );
    }

    fn generate_image(&self, prompt: &str) -> std::result::Result<String, String> {
        match self.backends.images.generate(&GenerationRequest::quiet(prompt)) {
            Ok(Some(url)) => Ok(url),
            Ok(None) => Err(MediaError::NoGenerationResult.to_string()),
            Err(err) => Err(format!("{err:#}")),
        }
    }

    /// Carousel navigation. `Next` on the last variant generates and
    /// appends a new one; `Prev` on the first is a no-op.
    pub fn navigate(
        &mut self,
        id: MessageId,
        slot: SlotKey,
        direction: Direction,
    ) -> Result<usize, MediaError> {
        let widget = self
            .binder
            .require(WidgetKey::new(id, slot), Interaction::Navigate)?
            .widget;
        let record = self.image_record(id, slot)?;
        let active = match direction {
            Direction::Prev if record.active_index == 0 => return Ok(0),
            Direction::Prev => {
                self.store
                    .set_active_index(id, slot, record.active_index - 1)?;
                record.active_index - 1
            }
            Direction::Next if record.is_last() => {
                self.append_generated_variant(id, slot, &record.prompt)?
            }
            Direction::Next => {
                self.store
                    .set_active_index(id, slot, record.active_index + 1)?;
                record.active_index + 1
            }
        };
        self.refresh_image_widget(id, slot, widget)?;
        Ok(active)
    }

    /// Uploads the active variant once; `Ok(None)` when it was already
    /// saved.
    pub fn save_to_gallery(
        &mut self,
        id: MessageId,
        slot: SlotKey,
    ) -> Result<Option<String>, MediaError> {
        let widget = self
            .binder
            .require(WidgetKey::new(id, slot), Interaction::SaveToGallery)?
            .widget;
        let record = self.image_record(id, slot)?;
        let index = record.active_index;
        if record.is_saved(index) {
            return Ok(None);
        }
        let url = record
            .active_url()
            .ok_or(MediaError::UnknownSlot(slot))?
            .to_string();
        self.show_save_state(id, widget, SaveState::Saving);

        let character = self.store.chat().character.clone();
        let gallery = &self.backends.gallery;
        let uploaded = gallery
            .fetch_image(&url)
            .and_then(|bytes| gallery.upload(&bytes, &character));
        match uploaded {
            Ok(permanent) => {
                self.store.mark_saved(id, slot, index)?;
                self.show_save_state(id, widget, SaveState::Saved);
                self.emit_slot(
                    "gallery_saved",
                    id,
                    slot,
                    json!({"variant": index, "url": permanent}),
                );
                Ok(Some(permanent))
            }
            Err(err) => {
                let reason = format!("{err:#}");
                self.show_save_state(id, widget, SaveState::Unsaved);
                self.emit_slot(
                    "gallery_failed",
                    id,
                    slot,
                    json!({"variant": index, "reason": reason}),
                );
                Err(MediaError::UploadFailed(reason))
            }
        }
    }

    /// Speaks a voice note and follows the audio element until it ends.
    /// The widget shows `loading` until the start signal, `playing` until
    /// the end signal, then `idle`. Both waits are bounded, so the widget
    /// is never left busy.
    pub fn play(&mut self, id: MessageId, slot: SlotKey) -> Result<PlaybackOutcome, MediaError> {
        let key = WidgetKey::new(id, slot);
        self.binder.require(key, Interaction::Play)?;
        let text = self
            .store
            .slots(id)?
            .voice(slot)
            .map(|record| record.text.clone())
            .ok_or(MediaError::UnknownSlot(slot))?;
        let widget = self.binder.begin_playback(key)?;
        self.show_voice_state(key, widget, VoiceState::Loading, None);

        let signals = self.backends.audio.subscribe();
        if let Err(err) = self
            .backends
            .speech
            .speak(&self.config.playback.voice_id, &text)
        {
            self.finish_playback(key, widget, Some("speech_failed"));
            return Err(MediaError::SpeechFailed(format!("{err:#}")));
        }

        let timeout = Duration::from_millis(self.config.playback.start_timeout_ms);
        match wait_for_start(&signals, timeout) {
            StartWait::Started => {
                self.binder.set_voice_state(key, VoiceState::Playing);
                self.show_voice_state(key, widget, VoiceState::Playing, None);
                let end_timeout = Duration::from_millis(self.config.playback.end_timeout_ms);
                if wait_for_end(&signals, end_timeout) {
                    self.finish_playback(key, widget, None);
                    Ok(PlaybackOutcome::Completed)
                } else {
                    self.finish_playback(key, widget, Some("end_timeout"));
                    Ok(PlaybackOutcome::EndTimedOut)
                }
            }
            StartWait::EndedEarly => {
                self.finish_playback(key, widget, None);
                Ok(PlaybackOutcome::Completed)
            }
            StartWait::TimedOut => {
                self.finish_playback(key, widget, Some("start_timeout"));
                Ok(PlaybackOutcome::StartTimedOut)
            }
        }
    }

    pub fn open_edit(&self, id: MessageId, slot: SlotKey) -> Result<EditDraft, MediaError> {
        self.binder
            .require(WidgetKey::new(id, slot), Interaction::Edit)?;
        let original = self.current_text(id, slot)?;
        Ok(EditDraft {
            message: id,
            slot,
            text: original.clone(),
            original,
        })
    }

    pub fn submit_edit(
        &mut self,
        draft: &EditDraft,
        action: EditAction,
    ) -> Result<EditOutcome, MediaError> {
        let (id, slot) = (draft.message, draft.slot);
        let widget = self
            .binder
            .require(WidgetKey::new(id, slot), Interaction::Edit)?
            .widget;
        let text = draft.text.trim();
        if text.is_empty() {
            return Err(MediaError::EmptyText(slot));
        }
        let before = self.current_text(id, slot)?;

        match slot.kind {
            TagKind::Image => {
                self.store.set_prompt(id, slot, text)?;
                self.emit_edit(id, slot, &before, text);
                self.refresh_image_widget(id, slot, widget)?;
                match action {
                    EditAction::Save => Ok(EditOutcome::Saved),
                    EditAction::SaveAndRun => {
                        let active_index = self.append_generated_variant(id, slot, text)?;
                        self.refresh_image_widget(id, slot, widget)?;
                        Ok(EditOutcome::Regenerated { active_index })
                    }
                }
            }
            TagKind::VoiceNote => {
                self.rewrite_voice_text(id, slot.index, text)?;
                self.emit_edit(id, slot, &before, text);
                match action {
                    EditAction::Save => Ok(EditOutcome::Saved),
                    EditAction::SaveAndRun => Ok(EditOutcome::Played(self.play(id, slot)?)),
                }
            }
        }
    }

    /// Rewrites voice slot `slot_index` in the record and in the raw text,
    /// and refreshes the duration of its widget when one is on screen.
    pub fn rewrite_voice_text(
        &mut self,
        id: MessageId,
        slot_index: usize,
        text: &str,
    ) -> Result<(), MediaError> {
        let slot = SlotKey::voice(slot_index);
        self.store
            .rewrite_voice_text(id, &self.extractor, slot_index, text)?;
        if let Some(binding) = self.binder.get(WidgetKey::new(id, slot)) {
            let duration = estimate_duration_secs(text, self.config.playback.words_per_second);
            if let Some(tree) = self.surface.get_mut(&id) {
                widgets::set_duration(tree, binding.widget, duration);
            }
        }
        Ok(())
    }

    fn append_generated_variant(
        &mut self,
        id: MessageId,
        slot: SlotKey,
        prompt: &str,
    ) -> Result<usize, MediaError> {
        match self.generate_image(prompt) {
            Ok(url) => {
                let index = self.store.append_variant(id, slot, &url)?;
                self.emit_slot(
                    "variant_appended",
                    id,
                    slot,
                    json!({"variant": index, "url": url}),
                );
                Ok(index)
            }
            Err(reason) => {
                self.emit_slot("slot_failed", id, slot, json!({"reason": reason}));
                Err(MediaError::NoGenerationResult)
            }
        }
    }

    fn image_record(&self, id: MessageId, slot: SlotKey) -> Result<ImageRecord, MediaError> {
        if slot.kind != TagKind::Image {
            return Err(MediaError::SlotKindMismatch(slot));
        }
        self.store
            .slots(id)?
            .image(slot)
            .cloned()
            .ok_or(MediaError::UnknownSlot(slot))
    }

    fn current_text(&self, id: MessageId, slot: SlotKey) -> Result<String, MediaError> {
        match self.store.get(id, slot)? {
            Some(MediaRecord::Image(record)) => Ok(record.prompt),
            Some(MediaRecord::VoiceNote(record)) => Ok(record.text),
            Some(MediaRecord::LegacyImage(record)) => Ok(record.prompt),
            None => Err(MediaError::UnknownSlot(slot)),
        }
    }

    fn refresh_image_widget(
        &mut self,
        id: MessageId,
        slot: SlotKey,
        widget: NodeId,
    ) -> Result<(), MediaError> {
        let record = self.image_record(id, slot)?;
        if let Some(tree) = self.surface.get_mut(&id) {
            widgets::update_image(tree, widget, &record);
        }
        Ok(())
    }

    fn show_save_state(&mut self, id: MessageId, widget: NodeId, state: SaveState) {
        if let Some(tree) = self.surface.get_mut(&id) {
            widgets::set_save_state(tree, widget, state);
        }
    }

    fn show_voice_state(
        &mut self,
        key: WidgetKey,
        widget: NodeId,
        state: VoiceState,
        reason: Option<&str>,
    ) {
        if let Some(tree) = self.surface.get_mut(&key.message) {
            widgets::set_voice_state(tree, widget, state);
        }
        self.emit_slot(
            "playback_state",
            key.message,
            key.slot,
            json!({"state": state.as_str(), "reason": reason}),
        );
    }

    fn finish_playback(&mut self, key: WidgetKey, widget: NodeId, reason: Option<&str>) {
        self.binder.end_playback(key);
        self.show_voice_state(key, widget, VoiceState::Idle, reason);
    }

    fn emit_edit(&self, id: MessageId, slot: SlotKey, before: &str, after: &str) {
        self.emit_slot(
            "record_edited",
            id,
            slot,
            json!({"diff": edit_diff(&format!("{before}\n"), &format!("{after}\n"))}),
        );
    }

    fn emit_slot(&self, event_type: &str, id: MessageId, slot: SlotKey, extra: Value) {
        let mut body = payload([
            ("message", json!(id.0)),
            ("slot", json!(slot.to_string())),
        ]);
        if let Value::Object(extra) = extra {
            body.extend(extra);
        }
        self.events.record(event_type, body);
    }
}

/// Slot indices of `kind` named by either a tag or a stored record.
fn slot_indices(
    slots: &MediaSlots,
    kind: TagKind,
    matches: &[TagMatch],
) -> Vec<usize> {
    let mut indices: BTreeSet<usize> = matches.iter().map(|item| item.slot_index).collect();
    indices.extend(
        slots
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .map(|(key, _)| key.index),
    );
    indices.into_iter().collect()
}

fn insert_widget(tree: &mut RenderTree, target: Option<NodeId>, widget: NodeId) {
    match target {
        Some(node) if tree.replace(node, widget) => {}
        _ => {
            let root = tree.root();
            tree.append(root, widget);
        }
    }
}

fn wait_for_start(signals: &Receiver<PlaybackSignal>, timeout: Duration) -> StartWait {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match signals.recv_timeout(remaining) {
            Ok(PlaybackSignal::Started) => return StartWait::Started,
            Ok(PlaybackSignal::Ended) => return StartWait::EndedEarly,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                return StartWait::TimedOut
            }
        }
    }
}

/// False when `timeout` passes without an end signal. A dropped channel
/// counts as ended.
fn wait_for_end(signals: &Receiver<PlaybackSignal>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match signals.recv_timeout(remaining) {
            Ok(PlaybackSignal::Ended) | Err(RecvTimeoutError::Disconnected) => return true,
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => return false,
        }
    }
}
