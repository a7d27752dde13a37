//! Lip-sync frame scheduler.
//!
//! Text chunks are turned into [`LipFrame`]s and queued. The host drives
//! [`LipSyncController::tick`] once per display frame; each tick spends the
//! elapsed time on the queue and writes an eased weight into the registered
//! [`LipSyncTarget`]. When the queue runs dry the controller waits for
//! [`SPEECH_GRACE_MS`] before treating the gap as the end of speech.
//!
//! Nothing in here returns an error: lip sync is cosmetic and must never
//! interrupt the chat stream.

mod frames;

use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::{Rc, Weak},
};

pub use frames::{ease_in_out_quad, frames_from_phonemes, frames_from_text, SILENT_WEIGHT};

use crate::{
    config::{LipSyncConfig, LipSyncConfigPatch, TargetHandoff},
    timeline::Clock,
    Phoneme,
};

/// Gap after the last chunk that counts as the end of an utterance.
pub const SPEECH_GRACE_MS: f64 = 500.0;

/// Hold `phoneme` at `weight` for `duration_ms`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LipFrame {
    pub phoneme: Phoneme,
    pub weight: f32,
    pub duration_ms: f64,
}

impl LipFrame {
    pub fn new(phoneme: Phoneme, weight: f32, duration_ms: f64) -> Self {
        Self {
            phoneme,
            weight: weight.clamp(0.0, 1.0),
            duration_ms: duration_ms.max(f64::EPSILON),
        }
    }
}

/// Mouth control surface of whichever renderer is active.
pub trait LipSyncTarget {
    fn set_mouth_shape(&mut self, phoneme: Phoneme, weight: f32);
    fn reset_mouth(&mut self);
}

/// Strong handle kept by the renderer that owns the target.
pub type SharedTarget = Rc<RefCell<dyn LipSyncTarget>>;
/// Non-owning handle held by the controller.
pub type TargetRef = Weak<RefCell<dyn LipSyncTarget>>;

/// Whether the host should keep scheduling ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    Running,
    Idle,
}

#[derive(Debug, Clone, Copy)]
struct ActiveFrame {
    frame: LipFrame,
    remaining_ms: f64,
    start_weight: f32,
}

pub struct LipSyncController {
    config: LipSyncConfig,
    handoff: TargetHandoff,
    clock: Rc<dyn Clock>,
    target: Option<TargetRef>,
    queue: VecDeque<LipFrame>,
    current: Option<ActiveFrame>,
    playing: bool,
    last_tick_ms: f64,
    last_chunk_ms: f64,
    applied: Option<(Phoneme, f32)>,
}

impl LipSyncController {
    pub fn new(config: LipSyncConfig, clock: Rc<dyn Clock>) -> Self {
        Self {
            config,
            handoff: TargetHandoff::default(),
            clock,
            target: None,
            queue: VecDeque::new(),
            current: None,
            playing: false,
            last_tick_ms: 0.0,
            last_chunk_ms: 0.0,
            applied: None,
        }
    }

    pub fn with_handoff(mut self, handoff: TargetHandoff) -> Self {
        self.handoff = handoff;
        self
    }

    pub fn set_handoff(&mut self, handoff: TargetHandoff) {
        self.handoff = handoff;
    }

    pub fn config(&self) -> &LipSyncConfig {
        &self.config
    }

    pub fn set_config(&mut self, patch: &LipSyncConfigPatch) {
        let rejected = self.config.apply(patch);
        if !rejected.is_empty() {
            tracing::warn!(?rejected, "ignored invalid lip-sync settings");
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn queued_frames(&self) -> impl Iterator<Item = &LipFrame> {
        self.queue.iter()
    }

    pub fn has_target(&self) -> bool {
        self.live_target().is_some()
    }

    /// Registers the active output, or detaches it with `None`.
    pub fn set_target(&mut self, target: Option<TargetRef>) {
        match target {
            None => {
                let previous = self.target.take();
                self.halt();
                self.queue.clear();
                if let Some(previous) = previous.and_then(|weak| weak.upgrade()) {
                    previous.borrow_mut().reset_mouth();
                }
                tracing::debug!("lip-sync target detached");
            }
            Some(next) => {
                let previous = self.target.replace(next.clone());
                let Some(previous) = previous else {
                    return;
                };
                if Weak::ptr_eq(&previous, &next) {
                    return;
                }
                self.applied = None;
                if self.handoff == TargetHandoff::Reset {
                    if let Some(previous) = previous.upgrade() {
                        previous.borrow_mut().reset_mouth();
                    }
                }
                tracing::debug!(handoff = ?self.handoff, "lip-sync target replaced");
            }
        }
    }

    /// Queues heuristic frames for `text`.
    pub fn process_chunk(&mut self, text: &str) {
        if !self.accepts_input() {
            return;
        }
        let frames = frames_from_text(text, &self.config);
        self.enqueue(frames);
    }

    /// Queues frames from backend phoneme tags, or from the heuristic when no
    /// usable tags are present.
    pub fn process_chunk_with_phonemes(&mut self, text: &str, phonemes: Option<&[String]>) {
        if !self.accepts_input() {
            return;
        }
        let frames = match phonemes {
            Some(tags) if !tags.is_empty() => {
                let frames = frames_from_phonemes(text, tags, &self.config);
                if frames.is_empty() {
                    tracing::debug!("no usable phoneme tags, using heuristic");
                    frames_from_text(text, &self.config)
                } else {
                    frames
                }
            }
            _ => frames_from_text(text, &self.config),
        };
        self.enqueue(frames);
    }

    /// Closes the mouth at the end of an utterance.
    pub fn on_complete(&mut self) {
        if self.live_target().is_none() {
            return;
        }
        let duration = self.config.transition_duration_ms * 2.0;
        self.enqueue(vec![LipFrame::new(Phoneme::Closed, 0.0, duration)]);
    }

    /// Interrupts playback: drops the queue and closes the mouth.
    pub fn stop(&mut self) {
        self.halt();
        self.queue.clear();
        self.reset_target();
    }

    /// Advances playback by the time elapsed since the previous tick.
    pub fn tick(&mut self) -> TickStatus {
        if !self.playing {
            return TickStatus::Idle;
        }
        let Some(target) = self.live_target() else {
            self.halt();
            self.queue.clear();
            return TickStatus::Idle;
        };

        let now = self.clock.now_ms();
        let mut budget = (now - self.last_tick_ms).max(0.0);
        self.last_tick_ms = now;

        loop {
            let mut active = match self.current.take() {
                Some(active) => active,
                None => match self.queue.pop_front() {
                    Some(frame) => self.activate(frame),
                    None => break,
                },
            };

            if budget >= active.remaining_ms {
                budget -= active.remaining_ms;
                self.apply(&target, active.frame.phoneme, active.frame.weight);
                continue;
            }

            active.remaining_ms -= budget;
            let progress = 1.0 - active.remaining_ms / active.frame.duration_ms;
            let eased = ease_in_out_quad(progress) as f32;
            let weight = active.start_weight + (active.frame.weight - active.start_weight) * eased;
            self.apply(&target, active.frame.phoneme, weight);
            self.current = Some(active);
            return TickStatus::Running;
        }

        if now - self.last_chunk_ms > SPEECH_GRACE_MS {
            target.borrow_mut().reset_mouth();
            self.applied = None;
            self.halt();
            tracing::trace!("speech gap exceeded grace window, lip sync idle");
            return TickStatus::Idle;
        }
        TickStatus::Running
    }

    fn accepts_input(&self) -> bool {
        self.config.enabled && self.live_target().is_some()
    }

    fn live_target(&self) -> Option<Rc<RefCell<dyn LipSyncTarget>>> {
        self.target.as_ref().and_then(Weak::upgrade)
    }

    fn enqueue(&mut self, frames: Vec<LipFrame>) {
        if frames.is_empty() {
            return;
        }
        let now = self.clock.now_ms();
        self.last_chunk_ms = now;
        self.queue.extend(frames);
        if !self.playing {
            self.playing = true;
            self.last_tick_ms = now;
        }
    }

    fn activate(&self, frame: LipFrame) -> ActiveFrame {
        let start_weight = match self.applied {
            Some((phoneme, weight)) if phoneme == frame.phoneme => weight,
            _ => 0.0,
        };
        ActiveFrame {
            frame,
            remaining_ms: frame.duration_ms,
            start_weight,
        }
    }

    fn apply(&mut self, target: &Rc<RefCell<dyn LipSyncTarget>>, phoneme: Phoneme, weight: f32) {
        target.borrow_mut().set_mouth_shape(phoneme, weight);
        self.applied = Some((phoneme, weight));
    }

    fn halt(&mut self) {
        self.playing = false;
        self.current = None;
    }

    fn reset_target(&mut self) {
        self.applied = None;
        if let Some(target) = self.live_target() {
            target.borrow_mut().reset_mouth();
        }
    }
}

impl std::fmt::Debug for LipSyncController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LipSyncController")
            .field("config", &self.config)
            .field("handoff", &self.handoff)
            .field("queued", &self.queue.len())
            .field("playing", &self.playing)
            .field("has_target", &self.has_target())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::ManualClock;

    #[derive(Debug, Default)]
    struct RecordingTarget {
        shapes: Vec<(Phoneme, f32)>,
        resets: usize,
    }

    impl LipSyncTarget for RecordingTarget {
        fn set_mouth_shape(&mut self, phoneme: Phoneme, weight: f32) {
            self.shapes.push((phoneme, weight));
        }

        fn reset_mouth(&mut self) {
            self.resets += 1;
        }
    }

    fn controller() -> (LipSyncController, Rc<ManualClock>) {
        let clock = Rc::new(ManualClock::default());
        let controller = LipSyncController::new(LipSyncConfig::default(), clock.clone());
        (controller, clock)
    }

    fn target() -> (Rc<RefCell<RecordingTarget>>, TargetRef) {
        let target = Rc::new(RefCell::new(RecordingTarget::default()));
        let shared: SharedTarget = target.clone();
        let weak = Rc::downgrade(&shared);
        (target, weak)
    }

    #[test]
    fn no_target_makes_everything_a_noop() {
        let (mut lip, clock) = controller();
        lip.process_chunk("hello");
        lip.on_complete();
        clock.advance(100.0);
        assert_eq!(lip.tick(), TickStatus::Idle);
        assert!(!lip.is_playing());
        lip.stop();
        lip.set_target(None);
    }

    #[test]
    fn disabled_config_ignores_chunks() {
        let (mut lip, _clock) = controller();
        let (_target, weak) = target();
        lip.set_target(Some(weak));
        lip.set_config(&LipSyncConfigPatch {
            enabled: Some(false),
            ..Default::default()
        });

        lip.process_chunk("hello");
        lip.process_chunk_with_phonemes("hi", Some(&["A".to_string()]));
        assert_eq!(lip.queued_frames().count(), 0);
        assert!(!lip.is_playing());
    }

    #[test]
    fn backend_phonemes_scenario() {
        let (mut lip, _clock) = controller();
        let (_target, weak) = target();
        lip.set_target(Some(weak));

        lip.process_chunk_with_phonemes("你好", Some(&["A".to_string(), "N".to_string()]));
        let frames: Vec<LipFrame> = lip.queued_frames().copied().collect();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].phoneme, Phoneme::A);
        assert_eq!(frames[1].phoneme, Phoneme::N);
        assert_eq!(frames[0].duration_ms, 80.0);
        assert_eq!(frames[1].duration_ms, 80.0);
        assert!((frames[0].weight - 0.7).abs() < 1e-6);
        assert!((frames[1].weight - 0.1).abs() < 1e-6);
        assert!(lip.is_playing());
    }

    #[test]
    fn halts_after_grace_window() {
        let (mut lip, clock) = controller();
        let (target, weak) = target();
        lip.set_target(Some(weak));

        lip.process_chunk("a");
        clock.advance(80.0 + SPEECH_GRACE_MS + 1.0);

        assert_eq!(lip.tick(), TickStatus::Idle);
        assert!(!lip.is_playing());
        assert_eq!(target.borrow().resets, 1);
    }

    #[test]
    fn waits_for_more_chunks_inside_grace_window() {
        let (mut lip, clock) = controller();
        let (target, weak) = target();
        lip.set_target(Some(weak));

        lip.process_chunk("a");
        clock.advance(200.0);
        assert_eq!(lip.tick(), TickStatus::Running);
        assert!(lip.is_playing());
        assert_eq!(target.borrow().resets, 0);

        lip.process_chunk("o");
        clock.advance(40.0);
        assert_eq!(lip.tick(), TickStatus::Running);
        let (phoneme, _) = *target.borrow().shapes.last().unwrap();
        assert_eq!(phoneme, Phoneme::O);
    }

    #[test]
    fn weight_ramps_with_easing() {
        let (mut lip, clock) = controller();
        let (target, weak) = target();
        lip.set_target(Some(weak));

        lip.process_chunk_with_phonemes("a", Some(&["A".to_string()]));
        clock.advance(20.0);
        lip.tick();
        clock.advance(20.0);
        lip.tick();
        clock.advance(20.0);
        lip.tick();

        let weights: Vec<f32> = target.borrow().shapes.iter().map(|(_, w)| *w).collect();
        assert_eq!(weights.len(), 3);
        assert!(weights[0] < weights[1] && weights[1] < weights[2]);
        assert!((weights[1] - 0.35).abs() < 1e-4);
        assert!(weights[2] < 0.7);
    }

    #[test]
    fn completion_closes_the_mouth() {
        let (mut lip, clock) = controller();
        let (target, weak) = target();
        lip.set_target(Some(weak));

        lip.process_chunk("a");
        lip.on_complete();
        clock.advance(80.0 + 120.0);
        lip.tick();

        let (phoneme, weight) = *target.borrow().shapes.last().unwrap();
        assert_eq!(phoneme, Phoneme::Closed);
        assert_eq!(weight, 0.0);
    }

    #[test]
    fn stop_clears_queue_and_resets() {
        let (mut lip, _clock) = controller();
        let (target, weak) = target();
        lip.set_target(Some(weak));

        lip.process_chunk("hello world");
        lip.stop();

        assert_eq!(lip.queued_frames().count(), 0);
        assert!(!lip.is_playing());
        assert_eq!(target.borrow().resets, 1);
    }

    #[test]
    fn detaching_is_always_safe() {
        let (mut lip, _clock) = controller();
        lip.set_target(None);
        lip.set_target(None);

        let (target, weak) = target();
        lip.set_target(Some(weak));
        lip.process_chunk("hello");
        lip.set_target(None);

        assert_eq!(lip.queued_frames().count(), 0);
        assert!(!lip.is_playing());
        assert_eq!(target.borrow().resets, 1);
    }

    #[test]
    fn detached_target_never_hears_again() {
        let (mut lip, clock) = controller();
        let (first, first_ref) = target();
        let (second, second_ref) = target();

        lip.set_target(Some(first_ref));
        lip.process_chunk("ha");
        clock.advance(10.0);
        lip.tick();
        lip.set_target(None);
        let calls_before = first.borrow().shapes.len();

        lip.set_target(Some(second_ref));
        lip.process_chunk("ho");
        clock.advance(10.0);
        lip.tick();
        clock.advance(10.0);
        lip.tick();

        assert_eq!(first.borrow().shapes.len(), calls_before);
        assert_eq!(first.borrow().resets, 1);
        assert_eq!(second.borrow().shapes.len(), 2);
    }

    #[test]
    fn replacing_target_resets_previous_by_default() {
        let (mut lip, _clock) = controller();
        let (first, first_ref) = target();
        let (_second, second_ref) = target();

        lip.set_target(Some(first_ref));
        lip.set_target(Some(second_ref));

        assert_eq!(first.borrow().resets, 1);
    }

    #[test]
    fn seamless_handoff_leaves_previous_alone() {
        let (lip, _clock) = controller();
        let mut lip = lip.with_handoff(TargetHandoff::Seamless);
        let (first, first_ref) = target();
        let (second, second_ref) = target();

        lip.set_target(Some(first_ref));
        lip.process_chunk("aaa");
        lip.set_target(Some(second_ref));

        assert_eq!(first.borrow().resets, 0);
        assert_eq!(lip.queued_frames().count(), 1);
        assert_eq!(second.borrow().resets, 0);
    }

    #[test]
    fn dropped_target_stops_playback() {
        let (mut lip, clock) = controller();
        let (target, weak) = target();
        lip.set_target(Some(weak));
        lip.process_chunk("hello");
        drop(target);

        clock.advance(16.0);
        assert_eq!(lip.tick(), TickStatus::Idle);
        assert!(!lip.has_target());
    }

    #[test]
    fn long_stall_consumes_several_frames() {
        let (mut lip, clock) = controller();
        let (target, weak) = target();
        lip.set_target(Some(weak));

        lip.process_chunk_with_phonemes(
            "abc",
            Some(&["A".to_string(), "O".to_string(), "E".to_string()]),
        );
        clock.advance(200.0);
        lip.tick();

        let phonemes: Vec<Phoneme> = target.borrow().shapes.iter().map(|(p, _)| *p).collect();
        assert_eq!(phonemes, vec![Phoneme::A, Phoneme::O, Phoneme::E]);
    }
}
