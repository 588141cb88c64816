//! Extraction engine: drives bounded extract/validate/correct rounds
//! against a vision inference service until a photograph yields a
//! confirmed catalog number or the round budget runs out.

use std::fs;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use partlens_contracts::catalog::{self, NONE_SENTINEL};
use partlens_contracts::events::{AuditLog, EventPayload};
use partlens_contracts::export::{write_csv, write_report, ListingRecord, ResultLog, RunReport};
use partlens_contracts::manifest::ListingJob;
use partlens_contracts::prompts;
use partlens_contracts::session::{Conversation, RejectionMemory};
use partlens_contracts::verdict::{self, CorrectionOutcome, Verdict};
use rand::Rng;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use similar::{ChangeTag, TextDiff};
use thiserror::Error;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-1.5-pro";

pub const DEFAULT_ROUND_CAP: u32 = 4;
pub const DEFAULT_CONSECUTIVE_NONE_CAP: u32 = 3;
pub const DEFAULT_CANDIDATE_REJECTION_CAP: u32 = 2;
pub const DEFAULT_LISTING_PASSES: u32 = 2;

const REQUEST_TIMEOUT_SECS: u64 = 120;
const FETCH_TIMEOUT_SECS: u64 = 60;
const MAX_UPLOAD_DIMENSION: u32 = 2048;
const JPEG_QUALITY: u8 = 90;
const CSV_CHECKPOINT_EVERY: usize = 10;
const EVENT_TEXT_MAX_CHARS: usize = 400;

// Auction image CDNs refuse the default library agent.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/58.0.3029.110 Safari/537.36";

/// Failure surface of one inference call chain.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Rate limiting outlasted every retry; the caller should skip this
    /// listing and move on.
    #[error("inference retries exhausted after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

/// One generate call against the inference service. Seam for tests and
/// for the dry-run transport.
pub trait VisionTransport {
    fn generate(&self, credential: &str, model: &str, payload: &Value) -> Result<Value>;
}

/// Production transport: POST `models/{model}:generateContent` with the
/// credential passed as the `key` query parameter.
pub struct HttpTransport {
    api_base: String,
    http: HttpClient,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        Self::with_api_base(DEFAULT_API_BASE)
    }

    pub fn with_api_base(api_base: &str) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed building inference http client")?;
        Ok(Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }
}

impl VisionTransport for HttpTransport {
    fn generate(&self, credential: &str, model: &str, payload: &Value) -> Result<Value> {
        let endpoint = self.endpoint_for_model(model);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", credential)])
            .json(payload)
            .send()
            .with_context(|| format!("generateContent request failed ({endpoint})"))?;
        response_json_or_error("generateContent", response)
    }
}

/// Ordered API keys with a monotonic rotation cursor. The cursor only
/// moves forward; after N rotations over K keys the active index is
/// N mod K.
#[derive(Debug, Clone)]
pub struct CredentialPool {
    keys: Vec<String>,
    rotations: usize,
}

impl CredentialPool {
    pub fn new(keys: Vec<String>) -> Result<Self> {
        let keys: Vec<String> = keys
            .into_iter()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .collect();
        if keys.is_empty() {
            bail!("credential pool needs at least one API key");
        }
        Ok(Self { keys, rotations: 0 })
    }

    pub fn active(&self) -> &str {
        &self.keys[self.active_index()]
    }

    pub fn active_index(&self) -> usize {
        self.rotations % self.keys.len()
    }

    /// Advances to the next credential and returns the new active index.
    pub fn rotate(&mut self) -> usize {
        self.rotations += 1;
        self.active_index()
    }

    pub fn rotations(&self) -> usize {
        self.rotations
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Sleep/backoff knobs for the inference client.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Pre-request jitter range, seconds. Zero max disables the sleep.
    pub jitter_min_secs: f64,
    pub jitter_max_secs: f64,
    /// First backoff delay; doubles per consecutive quota error.
    pub backoff_base_secs: f64,
    /// Delays past this rotate the credential pool instead of sleeping.
    pub backoff_ceiling_secs: f64,
    /// Uniform noise added on top of each backoff delay.
    pub backoff_noise_secs: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            jitter_min_secs: 1.0,
            jitter_max_secs: 3.0,
            backoff_base_secs: 5.0,
            backoff_ceiling_secs: 300.0,
            backoff_noise_secs: 1.0,
            max_attempts: 20,
        }
    }
}

impl RetryPolicy {
    /// Policy without any sleeping, for tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            jitter_min_secs: 0.0,
            jitter_max_secs: 0.0,
            backoff_base_secs: 0.0,
            backoff_ceiling_secs: 300.0,
            backoff_noise_secs: 0.0,
            max_attempts: 20,
        }
    }
}

/// Sampling settings for one call, rendered into `generationConfig`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSettings {
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub max_output_tokens: u32,
}

impl GenerationSettings {
    /// Extraction runs hot so retry rounds explore different readings.
    pub fn extractor() -> Self {
        Self {
            temperature: 1.0,
            top_p: Some(1.0),
            top_k: Some(32),
            max_output_tokens: 4096,
        }
    }

    /// Validation and correction run cooler and shorter.
    pub fn oracle() -> Self {
        Self {
            temperature: 0.5,
            top_p: None,
            top_k: None,
            max_output_tokens: 1024,
        }
    }

    fn to_value(self) -> Value {
        let mut config = Map::new();
        config.insert("temperature".to_string(), json!(self.temperature));
        if let Some(top_p) = self.top_p {
            config.insert("topP".to_string(), json!(top_p));
        }
        if let Some(top_k) = self.top_k {
            config.insert("topK".to_string(), json!(top_k));
        }
        config.insert(
            "maxOutputTokens".to_string(),
            json!(self.max_output_tokens),
        );
        Value::Object(config)
    }
}

fn default_safety_settings() -> Vec<Value> {
    [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
    ]
    .into_iter()
    .map(|category| {
        json!({
            "category": category,
            "threshold": "BLOCK_MEDIUM_AND_ABOVE",
        })
    })
    .collect()
}

/// Cumulative token counters, observability only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub reply_tokens: u64,
}

impl TokenUsage {
    fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.reply_tokens += other.reply_tokens;
    }
}

/// Photo bytes prepared for upload, with a stable digest for audit
/// correlation.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub source: String,
    pub mime: String,
    pub bytes: Vec<u8>,
    pub digest: String,
}

impl ImagePayload {
    pub fn new(source: &str, mime: &str, bytes: Vec<u8>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hex::encode(hasher.finalize());
        Self {
            source: source.to_string(),
            mime: mime.to_string(),
            bytes,
            digest,
        }
    }

    fn inline_part(&self) -> Value {
        json!({
            "inlineData": {
                "mimeType": self.mime,
                "data": BASE64.encode(&self.bytes),
            }
        })
    }
}

/// Downscales oversized photos and re-encodes them as JPEG before upload.
/// Bytes that do not decode pass through untouched with a mime guessed
/// from the link.
pub fn prepare_photo(source: &str, bytes: Vec<u8>) -> ImagePayload {
    if let Ok(decoded) = image::load_from_memory(&bytes) {
        if decoded.width().max(decoded.height()) > MAX_UPLOAD_DIMENSION {
            let resized = decoded
                .resize(MAX_UPLOAD_DIMENSION, MAX_UPLOAD_DIMENSION, FilterType::Triangle)
                .to_rgb8();
            let mut encoded = Vec::new();
            let mut encoder = JpegEncoder::new_with_quality(&mut encoded, JPEG_QUALITY);
            if encoder
                .encode_image(&DynamicImage::ImageRgb8(resized))
                .is_ok()
            {
                return ImagePayload::new(source, "image/jpeg", encoded);
            }
        }
    }
    let mime = guess_image_mime(source);
    ImagePayload::new(source, mime, bytes)
}

fn guess_image_mime(source: &str) -> &'static str {
    let path = source.split(['?', '#']).next().unwrap_or(source);
    let ext = path
        .rsplit('.')
        .next()
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "heic" | "heif" => "image/heic",
        _ => "image/png",
    }
}

/// Resolves a photo link to prepared upload bytes. Seam for tests.
pub trait PhotoFetcher {
    fn fetch(&self, link: &str) -> Result<ImagePayload>;
}

/// Fetches `http(s)` links with a desktop browser agent and reads
/// anything else from local disk.
pub struct WebPhotoFetcher {
    http: HttpClient,
}

impl WebPhotoFetcher {
    pub fn new() -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .user_agent(BROWSER_USER_AGENT)
            .build()
            .context("failed building photo fetch client")?;
        Ok(Self { http })
    }
}

impl PhotoFetcher for WebPhotoFetcher {
    fn fetch(&self, link: &str) -> Result<ImagePayload> {
        if link.starts_with("http://") || link.starts_with("https://") {
            let response = self
                .http
                .get(link)
                .send()
                .with_context(|| format!("photo request failed ({link})"))?;
            let status = response.status();
            if !status.is_success() {
                bail!("photo request returned status {} ({link})", status.as_u16());
            }
            let bytes = response
                .bytes()
                .with_context(|| format!("photo body read failed ({link})"))?
                .to_vec();
            Ok(prepare_photo(link, bytes))
        } else {
            let bytes =
                fs::read(link).with_context(|| format!("failed reading photo {link}"))?;
            Ok(prepare_photo(link, bytes))
        }
    }
}

/// Blocking client for the vision service: per-call jitter, exponential
/// backoff on quota errors, credential rotation once backoff would
/// outlast the ceiling, and hard failure after the attempt budget.
pub struct VisionClient<T: VisionTransport> {
    transport: T,
    pool: CredentialPool,
    model: String,
    retry: RetryPolicy,
    audit: Option<AuditLog>,
    usage: TokenUsage,
}

impl<T: VisionTransport> VisionClient<T> {
    pub fn new(transport: T, pool: CredentialPool, model: impl Into<String>) -> Self {
        Self {
            transport,
            pool,
            model: model.into(),
            retry: RetryPolicy::default(),
            audit: None,
            usage: TokenUsage::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn set_audit(&mut self, audit: AuditLog) {
        self.audit = Some(audit);
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    /// Extraction call: replays the session conversation, appends the
    /// exchange on success so later rounds see earlier attempts.
    pub fn infer_with_history(
        &mut self,
        image: &ImagePayload,
        instruction: &str,
        conversation: &mut Conversation,
        settings: GenerationSettings,
    ) -> std::result::Result<String, InferenceError> {
        let mut contents = conversation.history_values();
        contents.push(user_turn(image, instruction));
        let reply = self.request_text(contents, settings)?;
        conversation.push_exchange(instruction, &reply);
        Ok(reply)
    }

    /// Single-turn call for validation and correction. The extraction
    /// conversation never reaches these calls.
    pub fn infer_once(
        &mut self,
        image: &ImagePayload,
        instruction: &str,
        settings: GenerationSettings,
    ) -> std::result::Result<String, InferenceError> {
        let contents = vec![user_turn(image, instruction)];
        self.request_text(contents, settings)
    }

    fn request_text(
        &mut self,
        contents: Vec<Value>,
        settings: GenerationSettings,
    ) -> std::result::Result<String, InferenceError> {
        let payload = json!({
            "contents": contents,
            "generationConfig": settings.to_value(),
            "safetySettings": default_safety_settings(),
        });

        let mut backoff_attempt: u32 = 0;
        let mut attempts: u32 = 0;
        loop {
            if attempts >= self.retry.max_attempts {
                return Err(InferenceError::ExhaustedRetries { attempts });
            }
            attempts += 1;
            self.jitter_sleep();

            match self
                .transport
                .generate(self.pool.active(), &self.model, &payload)
            {
                Ok(response) => {
                    self.usage.add(usage_from_response(&response));
                    return Ok(reply_text(&response));
                }
                Err(err) if is_quota_error(&err) => {
                    let delay = backoff_delay_secs(self.retry.backoff_base_secs, backoff_attempt)
                        + self.backoff_noise();
                    if delay > self.retry.backoff_ceiling_secs {
                        let index = self.pool.rotate();
                        backoff_attempt = 0;
                        self.emit(
                            "credential_rotated",
                            map_object(json!({
                                "active_index": index,
                                "rotations": self.pool.rotations(),
                                "attempt": attempts,
                            })),
                        );
                    } else {
                        backoff_attempt += 1;
                        self.emit(
                            "quota_backoff",
                            map_object(json!({
                                "delay_secs": delay,
                                "attempt": attempts,
                                "error": error_chain_text(&err, EVENT_TEXT_MAX_CHARS),
                            })),
                        );
                        thread::sleep(Duration::from_secs_f64(delay));
                    }
                }
                Err(err) => return Err(InferenceError::Fatal(err)),
            }
        }
    }

    fn jitter_sleep(&self) {
        let min = self.retry.jitter_min_secs.max(0.0);
        let max = self.retry.jitter_max_secs;
        if max <= 0.0 || max < min {
            return;
        }
        let delay = rand::thread_rng().gen_range(min..=max);
        if delay > 0.0 {
            thread::sleep(Duration::from_secs_f64(delay));
        }
    }

    fn backoff_noise(&self) -> f64 {
        let max = self.retry.backoff_noise_secs;
        if max <= 0.0 {
            return 0.0;
        }
        rand::thread_rng().gen_range(0.0..max)
    }

    fn emit(&self, event_type: &str, payload: EventPayload) {
        if let Some(audit) = &self.audit {
            // Audit trouble must never abort an inference in flight.
            let _ = audit.emit(event_type, payload);
        }
    }
}

fn user_turn(image: &ImagePayload, instruction: &str) -> Value {
    json!({
        "role": "user",
        "parts": [image.inline_part(), { "text": instruction }],
    })
}

fn backoff_delay_secs(base: f64, attempt: u32) -> f64 {
    base * 2f64.powi(attempt as i32)
}

fn is_quota_error(err: &anyhow::Error) -> bool {
    let text = format!("{err:#}").to_ascii_lowercase();
    ["quota", "resource_exhausted", "rate limit", "too many requests", "429"]
        .iter()
        .any(|needle| text.contains(needle))
}

/// Flattens the first candidate's text parts. Missing structure collapses
/// to an empty string, which downstream parses as no answer; a blocked or
/// empty reply burns a round instead of killing the listing.
fn reply_text(response: &Value) -> String {
    let Some(parts) = response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
    else {
        return String::new();
    };
    let mut text = String::new();
    for part in parts {
        if let Some(chunk) = part.get("text").and_then(Value::as_str) {
            text.push_str(chunk);
        }
    }
    text
}

fn usage_from_response(response: &Value) -> TokenUsage {
    let meta = response.get("usageMetadata");
    let prompt_tokens = meta
        .and_then(|value| value.get("promptTokenCount"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let reply_tokens = meta
        .and_then(|value| value.get("candidatesTokenCount"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    TokenUsage {
        prompt_tokens,
        reply_tokens,
    }
}

/// Caps for one photograph session and the per-listing pass loop.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Extraction calls allowed per photograph.
    pub round_cap: u32,
    /// Consecutive no-answer rounds before giving up early.
    pub consecutive_none_cap: u32,
    /// Rejections per candidate before it skips the oracle entirely.
    pub candidate_rejection_cap: u32,
    /// Full passes over a listing's photos before the listing resolves
    /// to no answer.
    pub listing_passes: u32,
    /// Replacement first-round instruction, usually from a prompt file.
    pub extraction_override: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            round_cap: DEFAULT_ROUND_CAP,
            consecutive_none_cap: DEFAULT_CONSECUTIVE_NONE_CAP,
            candidate_rejection_cap: DEFAULT_CANDIDATE_REJECTION_CAP,
            listing_passes: DEFAULT_LISTING_PASSES,
            extraction_override: None,
        }
    }
}

/// Terminal result of one photograph session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Accepted { candidate: String, rounds: u32 },
    Exhausted { rounds: u32 },
}

enum Adjudication {
    Accept(String),
    Reject(String),
}

/// Batch run parameters for [`PartFinder::run_batch`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub out_dir: std::path::PathBuf,
    pub run_id: String,
    pub ignore_errors: bool,
}

/// Orchestrates sessions over ranked listing photos.
pub struct PartFinder<T: VisionTransport> {
    client: VisionClient<T>,
    config: EngineConfig,
    audit: Option<AuditLog>,
}

impl<T: VisionTransport> PartFinder<T> {
    pub fn new(client: VisionClient<T>, config: EngineConfig) -> Self {
        Self {
            client,
            config,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.client.set_audit(audit.clone());
        self.audit = Some(audit);
        self
    }

    pub fn usage(&self) -> TokenUsage {
        self.client.usage()
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    /// Runs one bounded session against one photograph.
    ///
    /// Rejection memory and conversation context live on the stack of
    /// this call, so nothing can leak into the next photograph.
    pub fn identify_in_photo(
        &mut self,
        image: &ImagePayload,
    ) -> std::result::Result<SessionOutcome, InferenceError> {
        let mut memory = RejectionMemory::new();
        let mut conversation = Conversation::new();
        let mut instruction = self
            .config
            .extraction_override
            .clone()
            .unwrap_or_else(prompts::extraction_instruction);

        self.emit(
            "photo_session_started",
            map_object(json!({
                "photo": image.source,
                "digest": image.digest,
            })),
        );

        let mut rounds: u32 = 0;
        let mut consecutive_none: u32 = 0;
        loop {
            if rounds >= self.config.round_cap {
                self.emit_exhausted(image, rounds, "round_cap");
                return Ok(SessionOutcome::Exhausted { rounds });
            }
            rounds += 1;

            let reply = self.client.infer_with_history(
                image,
                &instruction,
                &mut conversation,
                GenerationSettings::extractor(),
            )?;
            let parsed = catalog::parse_candidate(&reply);
            self.emit(
                "extraction_reply",
                map_object(json!({
                    "photo": image.source,
                    "round": rounds,
                    "reply": truncate_text(&reply, EVENT_TEXT_MAX_CHARS),
                    "candidate": parsed.as_deref().unwrap_or(NONE_SENTINEL),
                })),
            );

            let Some(candidate) = parsed else {
                consecutive_none += 1;
                if consecutive_none >= self.config.consecutive_none_cap {
                    self.emit_exhausted(image, rounds, "consecutive_none");
                    return Ok(SessionOutcome::Exhausted { rounds });
                }
                instruction = prompts::retry_instruction(&memory);
                continue;
            };
            consecutive_none = 0;

            if memory.count(&candidate) >= self.config.candidate_rejection_cap {
                // Known-bad answer proposed yet again; spend no oracle
                // call confirming what memory already says.
                let rejections = memory.record(&candidate);
                self.emit(
                    "candidate_skipped",
                    map_object(json!({
                        "photo": image.source,
                        "candidate": candidate,
                        "rejections": rejections,
                    })),
                );
                instruction = prompts::retry_instruction(&memory);
                continue;
            }

            match self.adjudicate(&candidate, image, &memory)? {
                Adjudication::Accept(final_candidate) => {
                    self.emit(
                        "session_accepted",
                        map_object(json!({
                            "photo": image.source,
                            "candidate": final_candidate,
                            "rounds": rounds,
                        })),
                    );
                    return Ok(SessionOutcome::Accepted {
                        candidate: final_candidate,
                        rounds,
                    });
                }
                Adjudication::Reject(rejected) => {
                    memory.record(&rejected);
                    instruction = prompts::retry_instruction(&memory);
                }
            }
        }
    }

    /// Validation plus the confirmed-path correction round. A corrected
    /// reading goes back through the oracle before it can be accepted.
    fn adjudicate(
        &mut self,
        candidate: &str,
        image: &ImagePayload,
        memory: &RejectionMemory,
    ) -> std::result::Result<Adjudication, InferenceError> {
        let verdict_reply = self.client.infer_once(
            image,
            &prompts::validation_instruction(candidate, memory),
            GenerationSettings::oracle(),
        )?;
        let verdict = verdict::parse_verdict(&verdict_reply);
        self.emit(
            "validation_verdict",
            map_object(json!({
                "photo": image.source,
                "candidate": candidate,
                "verdict": verdict.as_str(),
                "reply": truncate_text(&verdict_reply, EVENT_TEXT_MAX_CHARS),
            })),
        );
        match verdict {
            Verdict::Rejected | Verdict::NotVisible => {
                Ok(Adjudication::Reject(candidate.to_string()))
            }
            Verdict::Confirmed => {
                let correction_reply = self.client.infer_once(
                    image,
                    &prompts::correction_instruction(candidate),
                    GenerationSettings::oracle(),
                )?;
                match verdict::parse_correction(&correction_reply, candidate) {
                    CorrectionOutcome::Unchanged => {
                        Ok(Adjudication::Accept(candidate.to_string()))
                    }
                    CorrectionOutcome::Corrected(corrected) => {
                        self.emit(
                            "correction_applied",
                            map_object(json!({
                                "photo": image.source,
                                "from": candidate,
                                "to": corrected,
                                "changes": correction_changes(candidate, &corrected),
                            })),
                        );
                        let recheck_reply = self.client.infer_once(
                            image,
                            &prompts::validation_instruction(&corrected, memory),
                            GenerationSettings::oracle(),
                        )?;
                        let recheck = verdict::parse_verdict(&recheck_reply);
                        self.emit(
                            "validation_verdict",
                            map_object(json!({
                                "photo": image.source,
                                "candidate": corrected,
                                "verdict": recheck.as_str(),
                                "reply": truncate_text(&recheck_reply, EVENT_TEXT_MAX_CHARS),
                            })),
                        );
                        match recheck {
                            Verdict::Confirmed => Ok(Adjudication::Accept(corrected)),
                            _ => Ok(Adjudication::Reject(corrected)),
                        }
                    }
                }
            }
        }
    }

    /// Walks a listing's photos in descending score order, stopping at the
    /// first accepted session. When a full pass yields nothing the walk
    /// repeats, up to the configured pass count.
    ///
    /// The record lists every non-accepted photo link as incorrect, tried
    /// or not; the export sheet treats them all as photos without the
    /// number.
    pub fn resolve_listing(
        &mut self,
        job: &ListingJob,
        fetcher: &dyn PhotoFetcher,
    ) -> std::result::Result<ListingRecord, InferenceError> {
        for pass in 1..=self.config.listing_passes.max(1) {
            for image_ref in &job.images {
                let payload = match fetcher.fetch(&image_ref.link) {
                    Ok(payload) => payload,
                    Err(err) => {
                        self.emit(
                            "photo_fetch_failed",
                            map_object(json!({
                                "url": job.url,
                                "photo": image_ref.link,
                                "pass": pass,
                                "error": error_chain_text(&err, EVENT_TEXT_MAX_CHARS),
                            })),
                        );
                        continue;
                    }
                };
                match self.identify_in_photo(&payload)? {
                    SessionOutcome::Accepted { candidate, .. } => {
                        let incorrect = job
                            .images
                            .iter()
                            .filter(|image| image.link != image_ref.link)
                            .map(|image| image.link.clone())
                            .collect();
                        return Ok(ListingRecord {
                            predicted_number: candidate,
                            url: job.url.clone(),
                            price: job.price.clone(),
                            correct_image_link: Some(image_ref.link.clone()),
                            incorrect_image_links: incorrect,
                        });
                    }
                    SessionOutcome::Exhausted { .. } => {}
                }
            }
        }
        Ok(ListingRecord {
            predicted_number: NONE_SENTINEL.to_string(),
            url: job.url.clone(),
            price: job.price.clone(),
            correct_image_link: None,
            incorrect_image_links: job
                .images
                .iter()
                .map(|image| image.link.clone())
                .collect(),
        })
    }

    /// Batch driver: one record per listing appended to `results.jsonl`
    /// the moment it is decided, a CSV checkpoint every few listings, and
    /// a summary at the end.
    pub fn run_batch(
        &mut self,
        jobs: &[ListingJob],
        fetcher: &dyn PhotoFetcher,
        options: &RunOptions,
    ) -> Result<RunReport> {
        let started_at = now_utc_iso();
        let results = ResultLog::new(options.out_dir.join("results.jsonl"));
        let csv_path = options.out_dir.join("results.csv");
        let mut records: Vec<ListingRecord> = Vec::new();
        let mut skipped: u64 = 0;

        self.emit(
            "run_started",
            map_object(json!({
                "listings": jobs.len(),
                "model": self.client.model(),
                "out_dir": options.out_dir.to_string_lossy(),
            })),
        );

        for (index, job) in jobs.iter().enumerate() {
            self.emit(
                "listing_started",
                map_object(json!({
                    "url": job.url,
                    "photos": job.images.len(),
                    "position": index + 1,
                    "total": jobs.len(),
                })),
            );
            match self.resolve_listing(job, fetcher) {
                Ok(record) => {
                    results.append(&record)?;
                    let event_type = if record.correct_image_link.is_some() {
                        "listing_resolved"
                    } else {
                        "listing_unresolved"
                    };
                    self.emit(
                        event_type,
                        map_object(json!({
                            "url": record.url,
                            "predicted_number": record.predicted_number,
                        })),
                    );
                    records.push(record);
                }
                Err(InferenceError::ExhaustedRetries { attempts }) => {
                    skipped += 1;
                    self.emit(
                        "listing_skipped",
                        map_object(json!({
                            "url": job.url,
                            "attempts": attempts,
                        })),
                    );
                }
                Err(InferenceError::Fatal(err)) => {
                    if options.ignore_errors {
                        skipped += 1;
                        self.emit(
                            "listing_failed",
                            map_object(json!({
                                "url": job.url,
                                "error": error_chain_text(&err, EVENT_TEXT_MAX_CHARS),
                            })),
                        );
                    } else {
                        return Err(err.context(format!("listing {} failed", job.url)));
                    }
                }
            }
            if (index + 1) % CSV_CHECKPOINT_EVERY == 0 {
                write_csv(&csv_path, &records)?;
            }
        }
        write_csv(&csv_path, &records)?;

        let usage = self.client.usage();
        let resolved = records
            .iter()
            .filter(|record| record.correct_image_link.is_some())
            .count() as u64;
        let report = RunReport {
            run_id: options.run_id.clone(),
            started_at,
            finished_at: now_utc_iso(),
            listings_total: jobs.len() as u64,
            listings_resolved: resolved,
            listings_unresolved: records.len() as u64 - resolved,
            listings_skipped: skipped,
            prompt_tokens: usage.prompt_tokens,
            reply_tokens: usage.reply_tokens,
        };
        let mut extra = Map::new();
        extra.insert(
            "model".to_string(),
            Value::String(self.client.model().to_string()),
        );
        extra.insert(
            "credential_rotations".to_string(),
            Value::Number((self.client.pool().rotations() as u64).into()),
        );
        write_report(&options.out_dir.join("summary.json"), &report, Some(&extra))?;
        self.emit(
            "run_finished",
            map_object(json!({
                "listings_resolved": report.listings_resolved,
                "listings_unresolved": report.listings_unresolved,
                "listings_skipped": report.listings_skipped,
            })),
        );
        Ok(report)
    }

    fn emit(&self, event_type: &str, payload: EventPayload) {
        if let Some(audit) = &self.audit {
            let _ = audit.emit(event_type, payload);
        }
    }

    fn emit_exhausted(&self, image: &ImagePayload, rounds: u32, reason: &str) {
        self.emit(
            "session_exhausted",
            map_object(json!({
                "photo": image.source,
                "rounds": rounds,
                "reason": reason,
            })),
        );
    }
}

/// Character-level summary of a correction, e.g. `-0 +O`.
fn correction_changes(before: &str, after: &str) -> String {
    let diff = TextDiff::from_chars(before, after);
    let mut parts: Vec<String> = Vec::new();
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Delete => parts.push(format!("-{}", change.value())),
            ChangeTag::Insert => parts.push(format!("+{}", change.value())),
            ChangeTag::Equal => {}
        }
    }
    parts.join(" ")
}

fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{label} response body read failed"))?;
    if !status.is_success() {
        bail!("{label} request failed ({code}): {}", truncate_text(&body, 512));
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{label} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
