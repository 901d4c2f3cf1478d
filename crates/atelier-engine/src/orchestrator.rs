//! Turns commands into records.
//!
//! Every successful remote call becomes exactly one stored record, and the
//! newest continuation ids become the active session. Commands that need an
//! image from the user park a [`PendingState`] per user; the next upload from
//! that user resolves it, and the user is back to idle whatever the outcome.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use atelier_contracts::events::{EventPayload, EventWriter};
use atelier_contracts::outpaint::OutpaintRatio;
use atelier_contracts::records::{
    BackgroundRemovalParams, EditParams, EditSource, GenerateParams, InpaintParams, OutpaintParams,
    OutputImage,
};
use atelier_contracts::{
    ContinuationInfo, ImageRecord, IndexError, InpaintMode, LineageStore, OperationKind,
    OperationParams, ServiceConfig, ValidationError,
};
use chrono::Utc;
use serde_json::{json, Value};

use crate::compositor::{self, Composite};
use crate::error::{EngineError, EngineResult};
use crate::mask;
use crate::request::{Attachment, CompletionRequest, EditImage, MessageContent};
use crate::stream::CompletionResult;
use crate::transport::ServiceTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceRequest {
    pub prompt: String,
    pub style: Option<String>,
    pub ratio: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InpaintRequest {
    pub prompt: String,
    pub mode: InpaintMode,
    pub invert: bool,
}

/// What a user's next upload will be used for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingState {
    AwaitingReferenceImage(ReferenceRequest),
    AwaitingBackgroundRemovalImage,
    AwaitingInpaintOriginal(InpaintRequest),
    AwaitingInpaintMaskImage {
        request: InpaintRequest,
        original: Vec<u8>,
    },
}

impl PendingState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AwaitingReferenceImage(_) => "awaiting_reference_image",
            Self::AwaitingBackgroundRemovalImage => "awaiting_background_removal_image",
            Self::AwaitingInpaintOriginal(_) => "awaiting_inpaint_original",
            Self::AwaitingInpaintMaskImage { .. } => "awaiting_inpaint_mask_image",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    /// The user had nothing pending.
    Ignored,
    /// The original was kept; the marked copy comes next.
    AwaitingMarkedImage,
    Completed(ImageRecord),
}

pub struct DerivationOrchestrator {
    transport: Box<dyn ServiceTransport>,
    store: Arc<LineageStore>,
    config: ServiceConfig,
    events: EventWriter,
    session: Mutex<Option<ContinuationInfo>>,
    pending: Mutex<HashMap<String, PendingState>>,
    busy: Mutex<HashSet<String>>,
}

/// Held for the duration of one user's command.
struct UserSlot<'a> {
    busy: &'a Mutex<HashSet<String>>,
    user: String,
}

impl Drop for UserSlot<'_> {
    fn drop(&mut self) {
        lock(self.busy).remove(&self.user);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn event_payload(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    }
}

impl DerivationOrchestrator {
    /// The active session starts from the newest stored record, so a restart
    /// keeps talking to the same remote conversation.
    pub fn new(
        transport: Box<dyn ServiceTransport>,
        store: Arc<LineageStore>,
        config: ServiceConfig,
        events: EventWriter,
    ) -> Self {
        let session = store
            .get_latest()
            .map(|record| record.continuation().clone())
            .filter(ContinuationInfo::is_complete);
        if let Some(session) = &session {
            tracing::info!(conversation_id = %session.conversation_id, "resuming conversation");
        }
        Self {
            transport,
            store,
            config,
            events,
            session: Mutex::new(session),
            pending: Mutex::new(HashMap::new()),
            busy: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<LineageStore> {
        &self.store
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn session(&self) -> Option<ContinuationInfo> {
        lock(&self.session).clone()
    }

    /// Forgets the active conversation; the next generation opens a new one.
    pub fn reset_session(&self) {
        *lock(&self.session) = None;
        self.events.emit_lossy("session_reset", EventPayload::new());
    }

    // ---- per-user state machine ----

    pub fn pending_state(&self, user: &str) -> Option<PendingState> {
        lock(&self.pending).get(user).cloned()
    }

    pub fn begin_reference(
        &self,
        user: &str,
        prompt: &str,
        style: Option<&str>,
        ratio: Option<&str>,
    ) -> EngineResult<()> {
        let _slot = self.acquire_slot(user)?;
        let (prompt, style, ratio) = self.validate_prompt_inputs(prompt, style, ratio)?;
        self.set_pending(
            user,
            PendingState::AwaitingReferenceImage(ReferenceRequest {
                prompt,
                style,
                ratio: Some(ratio),
            }),
        );
        Ok(())
    }

    pub fn begin_background_removal(&self, user: &str) -> EngineResult<()> {
        let _slot = self.acquire_slot(user)?;
        self.require_session()?;
        self.set_pending(user, PendingState::AwaitingBackgroundRemovalImage);
        Ok(())
    }

    pub fn begin_inpaint(
        &self,
        user: &str,
        prompt: &str,
        mode: InpaintMode,
        invert: bool,
    ) -> EngineResult<()> {
        let _slot = self.acquire_slot(user)?;
        let prompt = require_prompt(prompt)?;
        self.set_pending(
            user,
            PendingState::AwaitingInpaintOriginal(InpaintRequest {
                prompt,
                mode,
                invert,
            }),
        );
        Ok(())
    }

    /// Drops whatever the user was waiting on. Returns whether anything was.
    pub fn cancel(&self, user: &str) -> bool {
        let cancelled = lock(&self.pending).remove(user);
        if let Some(state) = &cancelled {
            self.emit_pending_change(user, Some(state.label()), None);
        }
        cancelled.is_some()
    }

    pub fn handle_upload(&self, user: &str, image: &[u8]) -> EngineResult<UploadOutcome> {
        let _slot = self.acquire_slot(user)?;
        let Some(state) = lock(&self.pending).remove(user) else {
            tracing::debug!(user, "upload with nothing pending");
            return Ok(UploadOutcome::Ignored);
        };
        self.emit_pending_change(user, Some(state.label()), None);

        let record = match state {
            PendingState::AwaitingReferenceImage(request) => self.submit_reference(
                image,
                &request.prompt,
                request.style.as_deref(),
                request.ratio.as_deref(),
            )?,
            PendingState::AwaitingBackgroundRemovalImage => {
                self.submit_background_removal(image)?
            }
            PendingState::AwaitingInpaintOriginal(request) => {
                self.set_pending(
                    user,
                    PendingState::AwaitingInpaintMaskImage {
                        request,
                        original: image.to_vec(),
                    },
                );
                return Ok(UploadOutcome::AwaitingMarkedImage);
            }
            PendingState::AwaitingInpaintMaskImage { request, original } => self.submit_inpaint(
                &original,
                image,
                &request.prompt,
                request.mode,
                request.invert,
            )?,
        };
        Ok(UploadOutcome::Completed(record))
    }

    fn acquire_slot(&self, user: &str) -> EngineResult<UserSlot<'_>> {
        if !lock(&self.busy).insert(user.to_string()) {
            return Err(EngineError::Busy(user.to_string()));
        }
        Ok(UserSlot {
            busy: &self.busy,
            user: user.to_string(),
        })
    }

    fn set_pending(&self, user: &str, state: PendingState) {
        let label = state.label();
        let previous = lock(&self.pending).insert(user.to_string(), state);
        self.emit_pending_change(user, previous.as_ref().map(PendingState::label), Some(label));
    }

    fn emit_pending_change(&self, user: &str, from: Option<&str>, to: Option<&str>) {
        tracing::debug!(
            user,
            from = from.unwrap_or("idle"),
            to = to.unwrap_or("idle"),
            "pending state"
        );
        self.events.emit_lossy(
            "pending_state_changed",
            event_payload(json!({
                "user": user,
                "from": from.unwrap_or("idle"),
                "to": to.unwrap_or("idle"),
            })),
        );
    }

    // ---- operations ----

    pub fn submit_generation(
        &self,
        prompt: &str,
        style: Option<&str>,
        ratio: Option<&str>,
    ) -> EngineResult<ImageRecord> {
        self.observe(OperationKind::Generate, || {
            let (prompt, style, ratio) = self.validate_prompt_inputs(prompt, style, ratio)?;
            let session = self.session();
            let text = self
                .config
                .decorate_prompt(&prompt, style.as_deref(), Some(&ratio));
            let request = CompletionRequest::new(&MessageContent::text(text), session.as_ref())
                .map_err(encode_error)?;
            let result = self.complete(&request)?;
            let continuation = derive_continuation(session.as_ref(), &result)?;
            let params = GenerateParams {
                continuation,
                output: first_output(&result)?,
                prompt,
                style,
                ratio: Some(ratio),
            };
            self.store_record(result.urls(), OperationParams::Generate(params), None)
        })
    }

    /// Generation guided by an uploaded image.
    pub fn submit_reference(
        &self,
        image: &[u8],
        prompt: &str,
        style: Option<&str>,
        ratio: Option<&str>,
    ) -> EngineResult<ImageRecord> {
        self.observe(OperationKind::Edit, || {
            let (prompt, style, ratio) = self.validate_prompt_inputs(prompt, style, ratio)?;
            let uploaded = self.transport.upload(image)?;
            let session = self.session();
            let text = self
                .config
                .decorate_prompt(&prompt, style.as_deref(), Some(&ratio));
            let request = CompletionRequest::new(&MessageContent::text(text), session.as_ref())
                .map_err(encode_error)?
                .with_attachment(Attachment::reference(&uploaded.image_key));
            let result = self.complete(&request)?;
            let params = EditParams {
                continuation: derive_continuation(session.as_ref(), &result)?,
                output: first_output(&result)?,
                prompt,
                style,
                ratio: Some(ratio),
                source: EditSource::Reference {
                    image_key: uploaded.image_key,
                },
            };
            self.store_record(result.urls(), OperationParams::Edit(params), None)
        })
    }

    pub fn submit_edit(
        &self,
        record_id: &str,
        index: usize,
        prompt: &str,
    ) -> EngineResult<ImageRecord> {
        self.observe(OperationKind::Edit, || {
            let prompt = require_prompt(prompt)?;
            let (source, url) = self.pick(record_id, index)?;
            let continuation = require_continuation(&source)?;
            let output = source.operation.output();
            let content = MessageContent::with_edit(
                prompt.clone(),
                EditImage::edit(&url, &output.description),
            );
            let request = CompletionRequest::new(&content, Some(&continuation))
                .map_err(encode_error)?
                .with_reply_id(continuation.reply_id.clone());
            let result = self.complete(&request)?;
            let params = EditParams {
                continuation: derive_continuation(Some(&continuation), &result)?,
                output: first_output(&result)?,
                prompt,
                style: None,
                ratio: None,
                source: EditSource::Record {
                    record_id: source.id.clone(),
                    index,
                },
            };
            self.store_record(result.urls(), OperationParams::Edit(params), Some(source.id))
        })
    }

    /// Extends the picked image toward `ratio`; unknown labels mean 4:3.
    pub fn submit_outpaint(
        &self,
        record_id: &str,
        index: usize,
        ratio: &str,
    ) -> EngineResult<ImageRecord> {
        self.observe(OperationKind::Outpaint, || {
            let (source, url) = self.pick(record_id, index)?;
            let continuation = require_continuation(&source)?;
            let target = OutpaintRatio::from_label_or_default(ratio);
            let output = source.operation.output();
            let (width, height) = output.dimensions_or_default();
            let padding = target.padding(width, height);
            let content = MessageContent::with_edit(
                self.config.prompts.outpaint_text.clone(),
                EditImage::outpaint(&url, &output.description, padding),
            );
            let request = CompletionRequest::new(&content, Some(&continuation))
                .map_err(encode_error)?
                .with_reply_id(continuation.reply_id.clone());
            let result = self.complete(&request)?;
            let params = OutpaintParams {
                continuation: derive_continuation(Some(&continuation), &result)?,
                output: first_output(&result)?,
                ratio: target.label().to_string(),
                source_index: index,
                padding,
            };
            self.store_record(result.urls(), OperationParams::Outpaint(params), Some(source.id))
        })
    }

    pub fn submit_inpaint(
        &self,
        original: &[u8],
        marked: &[u8],
        prompt: &str,
        mode: InpaintMode,
        invert: bool,
    ) -> EngineResult<ImageRecord> {
        self.observe(OperationKind::Inpaint, || {
            let prompt = require_prompt(prompt)?;
            let mask = mask::build_mask(mode, original, marked, invert)?;
            tracing::debug!(
                mode = mode.as_str(),
                invert,
                selected = mask.selected_pixels(),
                "mask built"
            );
            let mask_uri = mask.to_data_uri()?;
            let uploaded = self.transport.upload(original)?;
            let original_url = uploaded
                .main_url
                .clone()
                .ok_or_else(|| EngineError::protocol("upload response carried no image url"))?;
            let session = self.session();
            let content = MessageContent::with_edit(
                prompt.clone(),
                EditImage::inpaint(&uploaded.image_key, &original_url, &mask_uri),
            );
            let request =
                CompletionRequest::new(&content, session.as_ref()).map_err(encode_error)?;
            let result = self.complete(&request)?;
            let params = InpaintParams {
                continuation: derive_continuation(session.as_ref(), &result)?,
                output: first_output(&result)?,
                prompt,
                mode,
                invert,
                mask: mask_uri,
                original_key: uploaded.image_key,
                original_url,
            };
            self.store_record(result.urls(), OperationParams::Inpaint(params), None)
        })
    }

    /// The cut-out comes straight from the upload endpoint; no completion
    /// call is made, so the record has no reply id and cannot be regenerated.
    pub fn submit_background_removal(&self, image: &[u8]) -> EngineResult<ImageRecord> {
        self.observe(OperationKind::BackgroundRemoval, || {
            let session = self.require_session()?;
            let uploaded = self.transport.upload(image)?;
            let main_url = uploaded
                .main_url
                .ok_or_else(|| EngineError::protocol("upload response carried no image url"))?;
            let mask_url = uploaded.mask_url.ok_or_else(|| {
                EngineError::protocol("upload response carried no background mask")
            })?;
            let params = BackgroundRemovalParams {
                continuation: ContinuationInfo {
                    reply_id: None,
                    ..session
                },
                output: OutputImage::from_url(&main_url),
                image_key: uploaded.image_key,
                original_url: main_url.clone(),
                mask_url,
                mask: uploaded.mask,
                without_background: uploaded.without_background,
            };
            self.store_record(
                vec![main_url],
                OperationParams::BackgroundRemoval(params),
                None,
            )
        })
    }

    /// Asks again for the reply that produced `record_id`. The result is a
    /// sibling of the target: it shares the target's parent.
    pub fn regenerate(&self, record_id: &str) -> EngineResult<ImageRecord> {
        let kind = self
            .store
            .get(record_id)
            .map(|record| record.kind())
            .unwrap_or(OperationKind::Generate);
        self.observe(kind, || {
            let target = self.store.get(record_id).ok_or_else(|| ValidationError::Index {
                id: record_id.to_string(),
                source: IndexError::UnknownId,
            })?;
            let continuation = require_continuation(&target)?;
            let reply_id = continuation
                .reply_id
                .clone()
                .ok_or_else(|| ValidationError::MissingReplyId(target.id.clone()))?;
            let output = target.operation.output();
            let content = match &target.operation {
                OperationParams::Generate(params) => MessageContent::text(params.prompt.clone()),
                OperationParams::Edit(params) => MessageContent::with_edit(
                    params.prompt.clone(),
                    EditImage::edit(&output.image_url, &output.description),
                ),
                OperationParams::Outpaint(_) => MessageContent::with_edit(
                    self.config.prompts.outpaint_text.clone(),
                    EditImage::edit(&output.image_url, &output.description).local_image(false),
                ),
                OperationParams::Inpaint(params) => MessageContent::text(params.prompt.clone()),
                OperationParams::BackgroundRemoval(_) => {
                    let kind = target.kind().as_str().to_string();
                    return Err(ValidationError::NotRegenerable(kind).into());
                }
            };
            let request = CompletionRequest::new(&content, Some(&continuation))
                .map_err(encode_error)?
                .with_reply_id(Some(reply_id))
                .regenerating();
            let result = self.complete(&request)?;
            let mut urls = result.urls();
            if matches!(target.kind(), OperationKind::Edit | OperationKind::Outpaint) {
                urls.truncate(1);
            }
            let operation = target.operation.rebased(
                derive_continuation(Some(&continuation), &result)?,
                first_output(&result)?,
            );
            self.store_record(urls, operation, target.parent_id.clone())
        })
    }

    // ---- reads ----

    pub fn get_record(&self, record_id: &str) -> Option<ImageRecord> {
        self.store.get(record_id)
    }

    pub fn get_latest(&self) -> Option<ImageRecord> {
        self.store.get_latest()
    }

    /// URL of the `index`-th (1-based) image of a record.
    pub fn select_image(&self, record_id: &str, index: usize) -> EngineResult<String> {
        self.pick(record_id, index).map(|(_, url)| url)
    }

    /// One preview image for a record, built from whatever images download.
    pub fn render_deliverable(&self, record: &ImageRecord) -> EngineResult<Composite> {
        compositor::fetch_and_compose(self.transport.as_ref(), &record.urls)
    }

    // ---- internals ----

    fn observe<F>(&self, kind: OperationKind, op: F) -> EngineResult<ImageRecord>
    where
        F: FnOnce() -> EngineResult<ImageRecord>,
    {
        self.events.emit_lossy(
            "operation_started",
            event_payload(json!({
                "operation": kind.as_str(),
                "transport": self.transport.name(),
            })),
        );
        let result = op();
        match &result {
            Ok(record) => {
                *lock(&self.session) = Some(record.continuation().clone());
                tracing::info!(
                    operation = kind.as_str(),
                    record_id = %record.id,
                    parent_id = record.parent_id.as_deref().unwrap_or("-"),
                    images = record.urls.len(),
                    "record created"
                );
                self.events.emit_lossy(
                    "record_created",
                    event_payload(json!({
                        "operation": kind.as_str(),
                        "record_id": record.id,
                        "parent_id": record.parent_id,
                        "image_count": record.urls.len(),
                        "conversation_id": record.continuation().conversation_id,
                    })),
                );
            }
            Err(err) => {
                tracing::warn!(operation = kind.as_str(), error = %err, "operation failed");
                self.events.emit_lossy(
                    "operation_failed",
                    event_payload(json!({
                        "operation": kind.as_str(),
                        "error_kind": err.kind(),
                        "error": err.to_string(),
                    })),
                );
            }
        }
        result
    }

    fn complete(&self, request: &CompletionRequest) -> EngineResult<CompletionResult> {
        let result = self.transport.complete(request)?;
        if result.is_empty() {
            return Err(EngineError::protocol("service returned no images"));
        }
        Ok(result)
    }

    fn store_record(
        &self,
        urls: Vec<String>,
        operation: OperationParams,
        parent_id: Option<String>,
    ) -> EngineResult<ImageRecord> {
        let record = ImageRecord {
            id: self.store.mint_id(),
            urls,
            operation,
            parent_id,
            created_at: Utc::now(),
        };
        self.store.put(record.clone())?;
        Ok(record)
    }

    fn pick(&self, record_id: &str, index: usize) -> EngineResult<(ImageRecord, String)> {
        let invalid = |source: IndexError| ValidationError::Index {
            id: record_id.to_string(),
            source,
        };
        self.store.validate_index(record_id, index).map_err(invalid)?;
        let record = self
            .store
            .get(record_id)
            .ok_or_else(|| invalid(IndexError::UnknownId))?;
        let url = record
            .url(index)
            .map(str::to_string)
            .ok_or_else(|| {
                invalid(IndexError::OutOfRange {
                    count: record.urls.len(),
                })
            })?;
        Ok((record, url))
    }

    fn require_session(&self) -> EngineResult<ContinuationInfo> {
        self.session()
            .filter(ContinuationInfo::is_complete)
            .ok_or_else(|| ValidationError::NoActiveSession.into())
    }

    fn validate_prompt_inputs(
        &self,
        prompt: &str,
        style: Option<&str>,
        ratio: Option<&str>,
    ) -> EngineResult<(String, Option<String>, String)> {
        let prompt = require_prompt(prompt)?;
        let style = style.map(str::trim).filter(|style| !style.is_empty());
        if let Some(style) = style {
            if !self.config.supports_style(style) {
                return Err(ValidationError::UnsupportedStyle(style.to_string()).into());
            }
        }
        let ratio = ratio
            .map(str::trim)
            .filter(|ratio| !ratio.is_empty())
            .unwrap_or(&self.config.default_ratio);
        if !self.config.supports_ratio(ratio) {
            return Err(ValidationError::UnsupportedRatio(ratio.to_string()).into());
        }
        Ok((
            prompt,
            style.map(str::to_string),
            atelier_contracts::outpaint::normalize_ratio_label(ratio),
        ))
    }
}

fn require_prompt(prompt: &str) -> EngineResult<String> {
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(ValidationError::EmptyPrompt.into());
    }
    Ok(prompt.to_string())
}

fn require_continuation(record: &ImageRecord) -> EngineResult<ContinuationInfo> {
    let continuation = record.continuation();
    if !continuation.is_complete() {
        return Err(ValidationError::MissingContinuation(record.id.clone()).into());
    }
    Ok(continuation.clone())
}

/// Ids for the record a call just produced. A call that opened a new
/// conversation must have reported its ids.
fn derive_continuation(
    base: Option<&ContinuationInfo>,
    result: &CompletionResult,
) -> EngineResult<ContinuationInfo> {
    let next = match base {
        Some(base) => base.advance(
            result.conversation_id.as_deref(),
            result.section_id.as_deref(),
            result.reply_id.as_deref(),
        ),
        None => ContinuationInfo::new(
            result.conversation_id.clone().unwrap_or_default(),
            result.section_id.clone().unwrap_or_default(),
            result.reply_id.clone(),
        ),
    };
    if !next.is_complete() {
        return Err(EngineError::protocol(
            "service response carried no conversation or section id",
        ));
    }
    Ok(next)
}

fn first_output(result: &CompletionResult) -> EngineResult<OutputImage> {
    result
        .first_output()
        .ok_or_else(|| EngineError::protocol("service returned no images"))
}

fn encode_error(err: serde_json::Error) -> EngineError {
    EngineError::protocol(format!("failed to encode request: {err}"))
}
