use std::{cell::Cell, time::Instant};

use serde::{Deserialize, Serialize};

/// Millisecond time source shared by the lip-sync scheduler and the viewer.
pub trait Clock {
    fn now_ms(&self) -> f64;
}

/// Wall clock anchored at construction.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<f64>,
}

impl ManualClock {
    pub fn advance(&self, delta_ms: f64) {
        self.now.set((self.now.get() + delta_ms).max(0.0));
    }

    pub fn set(&self, now_ms: f64) {
        self.now.set(now_ms.max(0.0));
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        self.now.get()
    }
}

/// What a track animates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackProperty {
    Translation,
    Rotation,
    Scale,
    Morph,
    Parameter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub target: String,
    pub property: TrackProperty,
}

impl Track {
    pub fn new(target: impl Into<String>, property: TrackProperty) -> Self {
        Self {
            target: target.into(),
            property,
        }
    }
}

/// A named animation. Keyframe data stays with the engine; the core only needs
/// to know what is animated and for how long.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationClip {
    pub name: String,
    pub duration_ms: f64,
    pub looping: bool,
    pub tracks: Vec<Track>,
}

impl AnimationClip {
    pub fn new(name: impl Into<String>, duration_ms: f64) -> Self {
        Self {
            name: name.into(),
            duration_ms: duration_ms.max(0.0),
            looping: false,
            tracks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Fade {
    In { elapsed: f64, length: f64 },
    Out { elapsed: f64, length: f64, from: f32 },
    Steady,
}

/// A clip being played by the mixer.
#[derive(Debug, Clone)]
pub struct Action {
    pub clip: String,
    pub group: String,
    pub time_ms: f64,
    pub weight: f32,
    duration_ms: f64,
    looping: bool,
    fade: Fade,
}

impl Action {
    pub fn is_fading_out(&self) -> bool {
        matches!(self.fade, Fade::Out { .. })
    }
}

/// Notification produced by [`AnimationMixer::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedAction {
    pub group: String,
    pub clip: String,
}

/// Plays clips with cross-fades. Only one action is "current"; replaced actions
/// fade out and are dropped once their weight reaches zero.
#[derive(Debug, Default)]
pub struct AnimationMixer {
    actions: Vec<Action>,
}

impl AnimationMixer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// The action that is fading in or steady, if any.
    pub fn current(&self) -> Option<&Action> {
        self.actions.iter().find(|action| !action.is_fading_out())
    }

    pub fn play(&mut self, group: &str, clip: &AnimationClip, fade_ms: f64) {
        self.fade_out_all(fade_ms);
        let fade = if fade_ms > 0.0 {
            Fade::In {
                elapsed: 0.0,
                length: fade_ms,
            }
        } else {
            Fade::Steady
        };
        self.actions.push(Action {
            clip: clip.name.clone(),
            group: group.to_string(),
            time_ms: 0.0,
            weight: if fade_ms > 0.0 { 0.0 } else { 1.0 },
            duration_ms: clip.duration_ms,
            looping: clip.looping,
            fade,
        });
    }

    pub fn fade_out_all(&mut self, fade_ms: f64) {
        for action in &mut self.actions {
            if !action.is_fading_out() {
                action.fade = Fade::Out {
                    elapsed: 0.0,
                    length: fade_ms.max(0.0),
                    from: action.weight,
                };
            }
        }
        if fade_ms <= 0.0 {
            self.actions.clear();
        }
    }

    pub fn stop(&mut self) {
        self.actions.clear();
    }

    /// Drops every action playing `clip`.
    pub fn remove_clip(&mut self, clip: &str) {
        self.actions.retain(|action| action.clip != clip);
    }

    /// Advances time. Returns one-shot actions that reached their end.
    pub fn update(&mut self, delta_ms: f64) -> Vec<FinishedAction> {
        let delta_ms = delta_ms.max(0.0);
        let mut finished = Vec::new();

        for action in &mut self.actions {
            action.time_ms += delta_ms;
            action.fade = match action.fade {
                Fade::In { elapsed, length } => {
                    let elapsed = elapsed + delta_ms;
                    if elapsed >= length {
                        action.weight = 1.0;
                        Fade::Steady
                    } else {
                        action.weight = (elapsed / length) as f32;
                        Fade::In { elapsed, length }
                    }
                }
                Fade::Out {
                    elapsed,
                    length,
                    from,
                } => {
                    let elapsed = elapsed + delta_ms;
                    let ratio = if length > 0.0 {
                        (1.0 - elapsed / length).max(0.0)
                    } else {
                        0.0
                    };
                    action.weight = from * ratio as f32;
                    Fade::Out {
                        elapsed,
                        length,
                        from,
                    }
                }
                Fade::Steady => Fade::Steady,
            };

            if action.duration_ms > 0.0 && action.time_ms >= action.duration_ms {
                if action.looping {
                    action.time_ms %= action.duration_ms;
                } else if !action.is_fading_out() {
                    finished.push(FinishedAction {
                        group: action.group.clone(),
                        clip: action.clip.clone(),
                    });
                    action.weight = 0.0;
                    action.fade = Fade::Out {
                        elapsed: 0.0,
                        length: 0.0,
                        from: 0.0,
                    };
                }
            }
        }

        self.actions
            .retain(|action| !(action.is_fading_out() && action.weight <= 0.0));
        finished
    }
}
