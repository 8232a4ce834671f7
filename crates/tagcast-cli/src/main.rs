use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tagcast_contracts::config::EngineConfig;
use tagcast_contracts::message::{ChatLog, MessageId};
use tagcast_contracts::tags::SlotKey;
use tagcast_engine::backends::Backends;
use tagcast_engine::persistence::JsonFilePersistence;
use tagcast_engine::{
    Direction, EditAction, EditOutcome, MediaEngine, PassReport, PlaybackOutcome, SlotOutcome,
};

#[derive(Debug, Parser)]
#[command(name = "tagcast-rs", version, about = "Inline media tag engine for chat logs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a processing pass over every message.
    Process(CommonArgs),
    /// Forget processing state and run again.
    Reprocess(ReprocessArgs),
    /// Print the stored media slots of one message.
    Slots(MessageArgs),
    Next(SlotArgs),
    Prev(SlotArgs),
    Edit(EditArgs),
    /// Upload the active image variant to the gallery.
    Save(SlotArgs),
    Play(SlotArgs),
    /// Replace a message's text as if it had been regenerated.
    Swipe(SwipeArgs),
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// Chat log JSON; media changes are written back to it.
    #[arg(long)]
    chat: PathBuf,
    /// Directory for rendered HTML and events.jsonl.
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ReprocessArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    message: Option<u64>,
}

#[derive(Debug, Args)]
struct MessageArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    message: u64,
}

#[derive(Debug, Args)]
struct SlotArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    message: u64,
    /// Slot key such as `image-0` or `voice-1`.
    #[arg(long)]
    slot: SlotKey,
}

#[derive(Debug, Args)]
struct EditArgs {
    #[command(flatten)]
    target: SlotArgs,
    #[arg(long)]
    text: String,
    /// Regenerate the image or play the voice note after saving.
    #[arg(long)]
    run: bool,
}

#[derive(Debug, Args)]
struct SwipeArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long)]
    message: u64,
    #[arg(long)]
    text: String,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("tagcast-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Process(args) => run_process(args),
        Command::Reprocess(args) => run_reprocess(args),
        Command::Slots(args) => run_slots(args),
        Command::Next(args) => run_navigate(args, Direction::Next),
        Command::Prev(args) => run_navigate(args, Direction::Prev),
        Command::Edit(args) => run_edit(args),
        Command::Save(args) => run_save(args),
        Command::Play(args) => run_play(args),
        Command::Swipe(args) => run_swipe(args),
    }
}

fn open_engine(args: &CommonArgs) -> Result<MediaEngine> {
    let config = EngineConfig::load(args.config.as_deref())?;
    let chat = ChatLog::load(&args.chat)?;
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed creating {}", args.out.display()))?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    MediaEngine::new(
        config,
        chat,
        Box::new(JsonFilePersistence::new(&args.chat)),
        Backends::from_env(),
        events_path,
    )
}

/// Opens the engine and brings every message on screen, so widget
/// interactions have bindings to act on.
fn open_processed(args: &CommonArgs) -> Result<(MediaEngine, Vec<PassReport>)> {
    let mut engine = open_engine(args)?;
    let reports = engine.process_all()?;
    Ok((engine, reports))
}

fn run_process(args: CommonArgs) -> Result<i32> {
    let (engine, reports) = open_processed(&args)?;
    finish(&engine, &args.out, json!({ "passes": reports_json(&reports) }))
}

fn run_reprocess(args: ReprocessArgs) -> Result<i32> {
    let (mut engine, _) = open_processed(&args.common)?;
    let reports = engine.reprocess(args.message.map(MessageId))?;
    finish(
        &engine,
        &args.common.out,
        json!({ "passes": reports_json(&reports) }),
    )
}

fn run_slots(args: MessageArgs) -> Result<i32> {
    let engine = open_engine(&args.common)?;
    let slots = engine.slots(MessageId(args.message))?;
    let records: serde_json::Map<String, Value> = slots
        .iter()
        .map(|(key, record)| (key.to_string(), record.to_value()))
        .collect();
    print_json(&Value::Object(records))?;
    Ok(0)
}

fn run_navigate(args: SlotArgs, direction: Direction) -> Result<i32> {
    let (mut engine, _) = open_processed(&args.common)?;
    let active = engine.navigate(MessageId(args.message), args.slot, direction)?;
    finish(
        &engine,
        &args.common.out,
        json!({ "slot": args.slot.to_string(), "active_index": active }),
    )
}

fn run_edit(args: EditArgs) -> Result<i32> {
    let target = &args.target;
    let (mut engine, _) = open_processed(&target.common)?;
    let mut draft = engine.open_edit(MessageId(target.message), target.slot)?;
    draft.text = args.text.clone();
    let action = if args.run {
        EditAction::SaveAndRun
    } else {
        EditAction::Save
    };
    let outcome = match engine.submit_edit(&draft, action)? {
        EditOutcome::Saved => json!({ "outcome": "saved" }),
        EditOutcome::Regenerated { active_index } => {
            json!({ "outcome": "regenerated", "active_index": active_index })
        }
        EditOutcome::Played(playback) => {
            json!({ "outcome": "played", "playback": playback_label(playback) })
        }
    };
    finish(&engine, &target.common.out, outcome)
}

fn run_save(args: SlotArgs) -> Result<i32> {
    let (mut engine, _) = open_processed(&args.common)?;
    let saved = engine.save_to_gallery(MessageId(args.message), args.slot)?;
    finish(
        &engine,
        &args.common.out,
        json!({ "slot": args.slot.to_string(), "gallery_url": saved, "already_saved": saved.is_none() }),
    )
}

fn run_play(args: SlotArgs) -> Result<i32> {
    let (mut engine, _) = open_processed(&args.common)?;
    let outcome = engine.play(MessageId(args.message), args.slot)?;
    finish(
        &engine,
        &args.common.out,
        json!({ "slot": args.slot.to_string(), "playback": playback_label(outcome) }),
    )?;
    Ok(match outcome {
        PlaybackOutcome::Completed => 0,
        PlaybackOutcome::StartTimedOut | PlaybackOutcome::EndTimedOut => 2,
    })
}

fn run_swipe(args: SwipeArgs) -> Result<i32> {
    let (mut engine, _) = open_processed(&args.common)?;
    let id = MessageId(args.message);
    engine.on_content_changed(id, &args.text)?;
    let report = engine.on_render_completed(id)?;
    finish(
        &engine,
        &args.common.out,
        json!({ "passes": reports_json(std::slice::from_ref(&report)) }),
    )
}

fn playback_label(outcome: PlaybackOutcome) -> &'static str {
    match outcome {
        PlaybackOutcome::Completed => "completed",
        PlaybackOutcome::StartTimedOut => "start_timeout",
        PlaybackOutcome::EndTimedOut => "end_timeout",
    }
}

fn reports_json(reports: &[PassReport]) -> Value {
    Value::Array(
        reports
            .iter()
            .map(|report| {
                let slots: Vec<Value> = report
                    .slots
                    .iter()
                    .map(|slot| {
                        let (outcome, reason) = match &slot.outcome {
                            SlotOutcome::Generated => ("generated", None),
                            SlotOutcome::Restored => ("restored", None),
                            SlotOutcome::Failed { reason } => ("failed", Some(reason.as_str())),
                        };
                        json!({
                            "slot": slot.slot.to_string(),
                            "placement": slot.placement.as_str(),
                            "outcome": outcome,
                            "reason": reason,
                        })
                    })
                    .collect();
                json!({
                    "message": report.message.0,
                    "mode": report.mode.as_str(),
                    "slots": slots,
                })
            })
            .collect(),
    )
}

/// Writes one HTML file per rendered message and prints `summary`.
fn finish(engine: &MediaEngine, out: &Path, summary: Value) -> Result<i32> {
    let mut written = Vec::new();
    for id in engine.chat().ids() {
        let Some(html) = engine.rendered_html(id) else {
            continue;
        };
        let path = out.join(format!("message-{id}.html"));
        fs::write(&path, html).with_context(|| format!("failed writing {}", path.display()))?;
        written.push(path.display().to_string());
    }
    let mut summary = summary;
    if let Value::Object(fields) = &mut summary {
        fields.insert("session_id".to_string(), json!(engine.session_id()));
        fields.insert("html".to_string(), json!(written));
        if let Some(err) = engine.last_persist_error() {
            fields.insert("persist_error".to_string(), json!(err));
        }
    }
    print_json(&summary)?;
    Ok(0)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;
    use tagcast_contracts::message::{ChatLog, ChatMessage, MessageId};
    use tagcast_contracts::processing::ProcessingState;
    use tagcast_contracts::tags::SlotKey;
    use tagcast_engine::{PassReport, Placement, SlotOutcome, SlotReport};

    use super::{reports_json, run_process, CommonArgs};

    #[test]
    fn reports_carry_placement_and_failure_reason() {
        let report = PassReport {
            message: MessageId(3),
            mode: ProcessingState::NeedsFirstGeneration,
            slots: vec![SlotReport {
                slot: SlotKey::image(0),
                placement: Placement::Tier("any_marker"),
                outcome: SlotOutcome::Failed {
                    reason: "generation backend returned no result".to_string(),
                },
            }],
        };
        assert_eq!(
            reports_json(&[report]),
            json!([{
                "message": 3,
                "mode": "needs_first_generation",
                "slots": [{
                    "slot": "image-0",
                    "placement": "any_marker",
                    "outcome": "failed",
                    "reason": "generation backend returned no result",
                }],
            }])
        );
    }

    #[test]
    fn process_writes_html_and_persists_media() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let chat_path = temp.path().join("chat.json");
        let out = temp.path().join("out");
        let mut chat = ChatLog::new("Mira");
        chat.messages
            .push(ChatMessage::assistant(1, "look [VOICE]hello from the lake[/VOICE]"));
        chat.save(&chat_path)?;

        let code = run_process(CommonArgs {
            chat: chat_path.clone(),
            out: out.clone(),
            events: None,
            config: None,
        })?;
        assert_eq!(code, 0);

        let html = fs::read_to_string(out.join("message-1.html"))?;
        assert!(html.contains("tc-voice-widget"));
        assert!(!html.contains("[VOICE]"));
        let saved = ChatLog::load(&chat_path)?;
        let extra = saved
            .message(MessageId(1))
            .map(|message| message.extra.clone())
            .unwrap_or_default();
        assert!(!extra.is_empty());
        assert!(out.join("events.jsonl").exists());
        Ok(())
    }
}
