//! Ties the lip-sync scheduler to whichever model renderer is active and
//! feeds both from the chat stream.

use std::{
    cell::{Cell, Ref, RefCell},
    path::Path,
    rc::Rc,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    assets::{AssetFetcher, LoadSequencer},
    config::{AppConfig, LipSyncConfigPatch, TargetHandoff},
    lipsync::{LipSyncController, TickStatus},
    model::{Emotion, ModelMetadata},
    render::{LoadOutcome, ModelProbe, ModelRenderer, RendererContext, RendererRegistry},
    timeline::Clock,
    CompanionError, Result,
};

/// A piece of an assistant reply as it streams in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageChunk {
    pub session_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
    /// Backend mouth tags (`A`, `E`, `I`, `O`, `U`, `N`, `closed`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phonemes: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageComplete {
    pub session_id: String,
    pub message_id: String,
    #[serde(default)]
    pub emotion: Option<Emotion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageError {
    pub session_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamEvent {
    Chunk(MessageChunk),
    Complete(MessageComplete),
    Error(MessageError),
}

impl StreamEvent {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn session_id(&self) -> &str {
        match self {
            StreamEvent::Chunk(chunk) => &chunk.session_id,
            StreamEvent::Complete(done) => &done.session_id,
            StreamEvent::Error(failure) => &failure.session_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    Opened(ModelMetadata),
    /// No registered renderer accepts the file.
    Unsupported,
    /// A later `open` or `close` won the race.
    Superseded,
}

/// Owns the scheduler and the active renderer. Methods take `&self` so that
/// a newer `open` can start while an older one is still loading.
pub struct ModelViewer {
    config: RefCell<AppConfig>,
    lip_sync: RefCell<LipSyncController>,
    registry: RendererRegistry,
    fetcher: Rc<dyn AssetFetcher>,
    sequencer: LoadSequencer,
    active: RefCell<Option<Box<dyn ModelRenderer>>>,
    session: RefCell<Option<String>>,
    clock: Rc<dyn Clock>,
    last_tick_ms: Cell<f64>,
}

impl std::fmt::Debug for ModelViewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelViewer")
            .field("registry", &self.registry)
            .field("lip_sync", &self.lip_sync)
            .field(
                "active",
                &self.active.borrow().as_ref().map(|renderer| renderer.model_type()),
            )
            .finish()
    }
}

impl ModelViewer {
    pub fn new(
        config: AppConfig,
        registry: RendererRegistry,
        fetcher: Rc<dyn AssetFetcher>,
        clock: Rc<dyn Clock>,
    ) -> Self {
        let lip_sync = LipSyncController::new(config.lip_sync.clone(), clock.clone())
            .with_handoff(config.viewer.target_handoff);
        let now = clock.now_ms();
        Self {
            config: RefCell::new(config),
            lip_sync: RefCell::new(lip_sync),
            registry,
            fetcher,
            sequencer: LoadSequencer::new(),
            active: RefCell::new(None),
            session: RefCell::new(None),
            clock,
            last_tick_ms: Cell::new(now),
        }
    }

    pub fn config(&self) -> AppConfig {
        self.config.borrow().clone()
    }

    pub fn lip_sync(&self) -> Ref<'_, LipSyncController> {
        self.lip_sync.borrow()
    }

    pub fn set_lip_sync_config(&self, patch: &LipSyncConfigPatch) {
        let mut lip_sync = self.lip_sync.borrow_mut();
        lip_sync.set_config(patch);
        self.config.borrow_mut().lip_sync = lip_sync.config().clone();
    }

    pub fn set_target_handoff(&self, handoff: TargetHandoff) {
        self.lip_sync.borrow_mut().set_handoff(handoff);
        self.config.borrow_mut().viewer.target_handoff = handoff;
    }

    pub fn has_model(&self) -> bool {
        self.active.borrow().is_some()
    }

    /// Runs `f` against the active renderer, if there is one.
    pub fn with_renderer<R>(&self, f: impl FnOnce(&mut dyn ModelRenderer) -> R) -> Option<R> {
        let mut active = self.active.borrow_mut();
        active.as_mut().map(|renderer| f(renderer.as_mut()))
    }

    /// Swaps in the model at `path`. The previous renderer is disposed before
    /// the new one starts loading; only the most recent call activates.
    pub async fn open(&self, path: &Path) -> Result<OpenOutcome> {
        let ticket = self.sequencer.issue();
        let timeout_ms = self.config.borrow().viewer.load_timeout_ms;
        let probe =
            match ModelProbe::inspect(path, self.fetcher.clone(), ticket.clone(), timeout_ms).await
            {
                Ok(probe) if ticket.is_current() => probe,
                Err(err) if !err.is_cancellation() => return Err(err),
                _ => return Ok(OpenOutcome::Superseded),
            };

        let Some(name) = self.registry.select(&probe).map(str::to_string) else {
            warn!(path = %path.display(), "no renderer accepts this file");
            return Ok(OpenOutcome::Unsupported);
        };
        let context = RendererContext {
            fetcher: self.fetcher.clone(),
            config: self.config.borrow().viewer.clone(),
        };
        let Some(mut renderer) = self.registry.create(&probe, &context) else {
            return Ok(OpenOutcome::Unsupported);
        };

        self.detach_active(false);
        info!(path = %path.display(), renderer = %name, "opening model");

        match renderer.load(path, ticket.clone()).await {
            Ok(LoadOutcome::Loaded(metadata)) if ticket.is_current() => {
                self.lip_sync
                    .borrow_mut()
                    .set_target(renderer.lip_sync_target());
                *self.active.borrow_mut() = Some(renderer);
                self.last_tick_ms.set(self.clock.now_ms());
                Ok(OpenOutcome::Opened(metadata))
            }
            Ok(_) => {
                debug!(path = %path.display(), "open superseded");
                renderer.dispose();
                Ok(OpenOutcome::Superseded)
            }
            Err(err) => {
                renderer.dispose();
                Err(err)
            }
        }
    }

    /// Unloads the active model and cancels any load in flight.
    pub fn close(&self) {
        self.sequencer.invalidate();
        self.detach_active(true);
        *self.session.borrow_mut() = None;
    }

    /// Disposes the active renderer. With `Seamless` handoff the scheduler
    /// keeps its queue and simply finds its target gone until the next one
    /// registers.
    fn detach_active(&self, force: bool) {
        if force || self.config.borrow().viewer.target_handoff == TargetHandoff::Reset {
            self.lip_sync.borrow_mut().set_target(None);
        }
        let previous = self.active.borrow_mut().take();
        if let Some(mut previous) = previous {
            previous.dispose();
        }
    }

    /// One frame: advances lip sync and the renderer's motions.
    pub fn tick(&self) -> TickStatus {
        let now = self.clock.now_ms();
        let delta = (now - self.last_tick_ms.replace(now)).max(0.0);
        let status = self.lip_sync.borrow_mut().tick();
        if let Some(renderer) = self.active.borrow_mut().as_mut() {
            renderer.update(delta);
        }
        status
    }

    pub fn handle_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::Chunk(chunk) => {
                let mut session = self.session.borrow_mut();
                if session.as_deref() != Some(chunk.session_id.as_str()) {
                    if session.is_some() {
                        debug!(session = %chunk.session_id, "new session interrupts reply");
                        self.lip_sync.borrow_mut().stop();
                    }
                    *session = Some(chunk.session_id.clone());
                }
                drop(session);
                self.lip_sync
                    .borrow_mut()
                    .process_chunk_with_phonemes(&chunk.content, chunk.phonemes.as_deref());
            }
            StreamEvent::Complete(done) => {
                self.lip_sync.borrow_mut().on_complete();
                if let Some(emotion) = done.emotion {
                    let shown = self.with_renderer(|renderer| renderer.set_from_emotion(emotion));
                    debug!(%emotion, expression = ?shown.flatten(), "reply complete");
                }
                *self.session.borrow_mut() = None;
            }
            StreamEvent::Error(failure) => {
                warn!(session = %failure.session_id, error = %failure.error, "reply failed");
                self.lip_sync.borrow_mut().stop();
                *self.session.borrow_mut() = None;
            }
        }
    }

    /// Parses and handles one event from the host's JSON stream.
    pub fn handle_json(&self, raw: &str) -> Result<()> {
        let event = StreamEvent::from_json(raw)
            .map_err(|err| CompanionError::msg(format!("bad stream event: {err}")))?;
        self.handle_event(event);
        Ok(())
    }
}
