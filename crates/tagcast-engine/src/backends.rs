use std::collections::BTreeMap;
use std::env;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

pub const IMAGE_API_BASE_ENV: &str = "TAGCAST_IMAGE_API_BASE";
pub const SPEECH_API_BASE_ENV: &str = "TAGCAST_SPEECH_API_BASE";
pub const GALLERY_API_BASE_ENV: &str = "TAGCAST_GALLERY_API_BASE";
pub const API_TOKEN_ENV: &str = "TAGCAST_API_TOKEN";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Keep the generation command out of the visible chat log.
    pub suppress_echo: bool,
    /// Stop the backend from filing the result in the gallery by itself.
    pub skip_gallery_save: bool,
}

impl GenerationRequest {
    pub fn quiet(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            suppress_echo: true,
            skip_gallery_save: true,
        }
    }
}

pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;
    /// `Ok(None)` when the backend answered without an image.
    fn generate(&self, request: &GenerationRequest) -> Result<Option<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackSignal {
    Started,
    Ended,
}

pub trait SpeechBackend: Send + Sync {
    fn name(&self) -> &str;
    /// Returns once the request is queued; playback boundaries arrive
    /// through the `AudioElement`.
    fn speak(&self, voice_id: &str, text: &str) -> Result<()>;
}

pub trait AudioElement: Send + Sync {
    /// Signals emitted by the host player from this call on.
    fn subscribe(&self) -> Receiver<PlaybackSignal>;
}

pub trait GalleryUploader: Send + Sync {
    fn name(&self) -> &str;
    fn fetch_image(&self, url: &str) -> Result<Vec<u8>>;
    /// Stores `image` under `character` and returns its permanent URL.
    fn upload(&self, image: &[u8], character: &str) -> Result<String>;
}

/// Audio element fed by whoever drives the host player.
#[derive(Debug, Clone, Default)]
pub struct ChannelAudio {
    listeners: Arc<Mutex<Vec<Sender<PlaybackSignal>>>>,
}

impl ChannelAudio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `signal` to every live subscriber; dropped receivers are
    /// pruned.
    pub fn emit(&self, signal: PlaybackSignal) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|listener| listener.send(signal).is_ok());
        }
    }
}

impl AudioElement for ChannelAudio {
    fn subscribe(&self) -> Receiver<PlaybackSignal> {
        let (sender, receiver) = mpsc::channel();
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(sender);
        }
        receiver
    }
}

/// Deterministic image URLs: the same prompt yields a new URL per call.
#[derive(Debug, Default)]
pub struct DryrunImageGenerator {
    issued: Mutex<BTreeMap<String, u64>>,
}

impl DryrunImageGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ImageGenerator for DryrunImageGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<Option<String>> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Ok(None);
        }
        let mut issued = self
            .issued
            .lock()
            .map_err(|_| anyhow!("dryrun generator lock poisoned"))?;
        let counter = issued.entry(prompt.to_string()).or_insert(0);
        let variant = *counter;
        *counter += 1;
        Ok(Some(format!(
            "dryrun://image/{}.png",
            short_id(prompt.as_bytes(), variant)
        )))
    }
}

/// Speech that "plays" instantly: start and end are emitted before
/// `speak` returns.
#[derive(Debug, Clone)]
pub struct DryrunSpeech {
    audio: ChannelAudio,
}

impl DryrunSpeech {
    pub fn new(audio: ChannelAudio) -> Self {
        Self { audio }
    }
}

impl SpeechBackend for DryrunSpeech {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn speak(&self, _voice_id: &str, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            bail!("nothing to speak");
        }
        self.audio.emit(PlaybackSignal::Started);
        self.audio.emit(PlaybackSignal::Ended);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunGallery;

impl GalleryUploader for DryrunGallery {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        Ok(url.as_bytes().to_vec())
    }

    fn upload(&self, image: &[u8], character: &str) -> Result<String> {
        Ok(format!(
            "dryrun://gallery/{}/{}.png",
            gallery_folder(character),
            short_id(image, 0)
        ))
    }
}

pub struct HttpImageGenerator {
    api_base: String,
    token: Option<String>,
    http: HttpClient,
}

impl HttpImageGenerator {
    pub fn new(api_base: &str, token: Option<String>) -> Self {
        Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            token,
            http: HttpClient::new(),
        }
    }
}

impl ImageGenerator for HttpImageGenerator {
    fn name(&self) -> &str {
        "http"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<Option<String>> {
        let endpoint = format!("{}/generate", self.api_base);
        let mut call = self.http.post(&endpoint).json(&json!({
            "prompt": request.prompt,
            "quiet": request.suppress_echo,
            "skip_gallery_save": request.skip_gallery_save,
        }));
        if let Some(token) = &self.token {
            call = call.bearer_auth(token);
        }
        let response = call
            .send()
            .with_context(|| format!("image generation request failed ({endpoint})"))?;
        let payload = response_json_or_error("image generation", response)?;
        Ok(non_empty_str(&payload, "url"))
    }
}

/// Speech service client. When the service reports that it played the clip
/// before replying, the start/end pair is forwarded to `audio`; otherwise
/// the host player is expected to emit them.
pub struct HttpSpeechBackend {
    api_base: String,
    token: Option<String>,
    http: HttpClient,
    audio: ChannelAudio,
}

impl HttpSpeechBackend {
    pub fn new(api_base: &str, token: Option<String>, audio: ChannelAudio) -> Self {
        Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            token,
            http: HttpClient::new(),
            audio,
        }
    }
}

impl SpeechBackend for HttpSpeechBackend {
    fn name(&self) -> &str {
        "http"
    }

    fn speak(&self, voice_id: &str, text: &str) -> Result<()> {
        let endpoint = format!("{}/speak", self.api_base);
        let mut call = self.http.post(&endpoint).json(&json!({
            "voice_id": voice_id,
            "text": text,
        }));
        if let Some(token) = &self.token {
            call = call.bearer_auth(token);
        }
        let response = call
            .send()
            .with_context(|| format!("speech request failed ({endpoint})"))?;
        let payload = response_json_or_error("speech", response)?;
        if payload.get("played").and_then(Value::as_bool).unwrap_or(false) {
            self.audio.emit(PlaybackSignal::Started);
            self.audio.emit(PlaybackSignal::Ended);
        }
        Ok(())
    }
}

pub struct HttpGallery {
    api_base: String,
    token: Option<String>,
    http: HttpClient,
}

impl HttpGallery {
    pub fn new(api_base: &str, token: Option<String>) -> Self {
        Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            token,
            http: HttpClient::new(),
        }
    }
}

impl GalleryUploader for HttpGallery {
    fn name(&self) -> &str {
        "http"
    }

    fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading image ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!("image download failed ({code}): {}", truncate_text(&body, 512));
        }
        Ok(response
            .bytes()
            .context("failed reading image bytes")?
            .to_vec())
    }

    fn upload(&self, image: &[u8], character: &str) -> Result<String> {
        let endpoint = format!("{}/upload", self.api_base);
        let mut call = self.http.post(&endpoint).json(&json!({
            "character": character,
            "folder": gallery_folder(character),
            "image": BASE64.encode(image),
        }));
        if let Some(token) = &self.token {
            call = call.bearer_auth(token);
        }
        let response = call
            .send()
            .with_context(|| format!("gallery upload failed ({endpoint})"))?;
        let payload = response_json_or_error("gallery upload", response)?;
        non_empty_str(&payload, "url").ok_or_else(|| anyhow!("gallery upload returned no url"))
    }
}

/// The external collaborators one engine talks to.
pub struct Backends {
    pub images: Box<dyn ImageGenerator>,
    pub speech: Box<dyn SpeechBackend>,
    pub audio: Box<dyn AudioElement>,
    pub gallery: Box<dyn GalleryUploader>,
}

impl Backends {
    pub fn dryrun() -> Self {
        let audio = ChannelAudio::new();
        Self {
            images: Box::new(DryrunImageGenerator::new()),
            speech: Box::new(DryrunSpeech::new(audio.clone())),
            audio: Box::new(audio),
            gallery: Box::new(DryrunGallery),
        }
    }

    /// HTTP clients for every endpoint named in the environment, dryrun
    /// stand-ins for the rest.
    pub fn from_env() -> Self {
        let token = non_empty_env(API_TOKEN_ENV);
        let audio = ChannelAudio::new();
        let images: Box<dyn ImageGenerator> = match non_empty_env(IMAGE_API_BASE_ENV) {
            Some(base) => Box::new(HttpImageGenerator::new(&base, token.clone())),
            None => Box::new(DryrunImageGenerator::new()),
        };
        let speech: Box<dyn SpeechBackend> = match non_empty_env(SPEECH_API_BASE_ENV) {
            Some(base) => Box::new(HttpSpeechBackend::new(&base, token.clone(), audio.clone())),
            None => Box::new(DryrunSpeech::new(audio.clone())),
        };
        let gallery: Box<dyn GalleryUploader> = match non_empty_env(GALLERY_API_BASE_ENV) {
            Some(base) => Box::new(HttpGallery::new(&base, token)),
            None => Box::new(DryrunGallery),
        };
        Self {
            images,
            speech,
            audio: Box::new(audio),
            gallery,
        }
    }

    pub fn describe(&self) -> Value {
        json!({
            "images": self.images.name(),
            "speech": self.speech.name(),
            "gallery": self.gallery.name(),
        })
    }
}

fn response_json_or_error(service: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{service} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{service} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    serde_json::from_str(&body).with_context(|| format!("{service} returned invalid JSON payload"))
}

fn non_empty_str(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn short_id(bytes: &[u8], idx: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.update(idx.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..6])
}

/// Folder name for a character: lowercase ASCII alphanumerics joined by `-`.
fn gallery_folder(character: &str) -> String {
    let folder = character
        .split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<String>>()
        .join("-");
    if folder.is_empty() {
        "unsorted".to_string()
    } else {
        folder
    }
}

#[cfg(test)]
mod tests {
    use super::{
        gallery_folder, truncate_text, AudioElement, ChannelAudio, DryrunGallery,
        DryrunImageGenerator, DryrunSpeech, GalleryUploader, GenerationRequest, ImageGenerator,
        PlaybackSignal, SpeechBackend,
    };

    #[test]
    fn dryrun_generator_issues_a_fresh_url_per_variant() -> anyhow::Result<()> {
        let generator = DryrunImageGenerator::new();
        let first = generator.generate(&GenerationRequest::quiet("a red bicycle"))?;
        let second = generator.generate(&GenerationRequest::quiet("a red bicycle"))?;
        let other = DryrunImageGenerator::new().generate(&GenerationRequest::quiet("a red bicycle"))?;

        assert!(first.as_deref().is_some_and(|url| url.starts_with("dryrun://image/")));
        assert_ne!(first, second);
        assert_eq!(first, other);
        assert_eq!(generator.generate(&GenerationRequest::quiet("   "))?, None);
        Ok(())
    }

    #[test]
    fn quiet_requests_suppress_echo_and_gallery_save() {
        let request = GenerationRequest::quiet("fox");
        assert!(request.suppress_echo && request.skip_gallery_save);
    }

    #[test]
    fn channel_audio_fans_out_and_prunes_dropped_listeners() {
        let audio = ChannelAudio::new();
        let kept = audio.subscribe();
        drop(audio.subscribe());
        audio.emit(PlaybackSignal::Started);
        assert_eq!(kept.try_recv().ok(), Some(PlaybackSignal::Started));
        assert_eq!(audio.listeners.lock().map(|l| l.len()).unwrap_or(0), 1);
    }

    #[test]
    fn dryrun_speech_brackets_playback_with_signals() -> anyhow::Result<()> {
        let audio = ChannelAudio::new();
        let speech = DryrunSpeech::new(audio.clone());
        let signals = audio.subscribe();
        speech.speak("default", "hello there")?;
        let received: Vec<PlaybackSignal> = signals.try_iter().collect();
        assert_eq!(received, vec![PlaybackSignal::Started, PlaybackSignal::Ended]);
        assert!(speech.speak("default", " ").is_err());
        Ok(())
    }

    #[test]
    fn dryrun_gallery_files_uploads_per_character() -> anyhow::Result<()> {
        let gallery = DryrunGallery;
        let bytes = gallery.fetch_image("dryrun://image/abc.png")?;
        let url = gallery.upload(&bytes, "Mira the Bard")?;
        assert!(url.starts_with("dryrun://gallery/mira-the-bard/"));
        assert_eq!(url, gallery.upload(&bytes, "Mira the Bard")?);
        assert_eq!(gallery_folder("!!"), "unsorted");
        Ok(())
    }

    #[test]
    fn truncate_marks_cut_text() {
        assert_eq!(truncate_text("abcdef", 3), "abc…");
        assert_eq!(truncate_text("abc", 3), "abc");
    }
}
