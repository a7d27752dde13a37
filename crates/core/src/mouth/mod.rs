//! [`LipSyncTarget`] implementations for each way a model exposes its mouth.
//!
//! Every adapter keeps at most one mouth shape nonzero, zeroes it for
//! [`Phoneme::Closed`] or a phoneme the model has no shape for, and treats
//! `reset_mouth` as idempotent.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap, HashSet},
    rc::Rc,
};

use tracing::debug;

use crate::{
    formats::live2d::MOUTH_FORM, lipsync::LipSyncTarget, mapping::MouthCandidates,
    CompanionError, Phoneme, Result,
};

/// Named expression weights shared by a renderer and its mouth adapter.
#[derive(Debug, Clone, Default)]
pub struct ExpressionSet {
    weights: Vec<(String, f32)>,
    reserved: HashSet<String>,
}

pub type SharedExpressions = Rc<RefCell<ExpressionSet>>;

impl ExpressionSet {
    pub fn new(names: &[String]) -> Self {
        Self {
            weights: names.iter().map(|name| (name.clone(), 0.0)).collect(),
            reserved: HashSet::new(),
        }
    }

    pub fn shared(names: &[String]) -> SharedExpressions {
        Rc::new(RefCell::new(Self::new(names)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.weights.iter().map(|(name, _)| name.as_str())
    }

    /// Names that are not owned by the mouth.
    pub fn selectable(&self) -> Vec<String> {
        self.names()
            .filter(|name| !self.reserved.contains(*name))
            .map(str::to_string)
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.weights.iter().any(|(n, _)| n == name)
    }

    pub fn weight(&self, name: &str) -> Option<f32> {
        self.weights.iter().find(|(n, _)| n == name).map(|(_, w)| *w)
    }

    /// Marks `name` as a mouth shape, excluded from exclusive expression
    /// changes.
    pub fn reserve(&mut self, name: &str) {
        self.reserved.insert(name.to_string());
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        self.reserved.contains(name)
    }

    /// Writes one weight without touching the others.
    pub fn set(&mut self, name: &str, weight: f32) -> bool {
        match self.weights.iter_mut().find(|(n, _)| n == name) {
            Some((_, w)) => {
                *w = weight.clamp(0.0, 1.0);
                true
            }
            None => false,
        }
    }

    /// Sets `name` and zeroes every other non-mouth expression.
    pub fn set_exclusive(&mut self, name: &str, weight: f32) -> Result<()> {
        if !self.contains(name) {
            return Err(CompanionError::UnknownExpression(name.to_string()));
        }
        let reserved = &self.reserved;
        for (n, w) in &mut self.weights {
            if n == name {
                *w = weight.clamp(0.0, 1.0);
            } else if !reserved.contains(n.as_str()) {
                *w = 0.0;
            }
        }
        Ok(())
    }

    /// Zeroes every non-mouth expression.
    pub fn reset(&mut self) {
        let reserved = &self.reserved;
        for (n, w) in &mut self.weights {
            if !reserved.contains(n.as_str()) {
                *w = 0.0;
            }
        }
    }

    /// Nonzero weights, in declaration order.
    pub fn active(&self) -> Vec<(String, f32)> {
        self.weights
            .iter()
            .filter(|(_, w)| *w > 0.0)
            .cloned()
            .collect()
    }
}

/// Mouth driven through named expressions (VRM, glTF, FBX).
#[derive(Debug)]
pub struct ExpressionMouth {
    expressions: SharedExpressions,
    shapes: HashMap<Phoneme, String>,
    active: Option<String>,
}

impl ExpressionMouth {
    pub fn new(expressions: SharedExpressions, candidates: &MouthCandidates) -> Self {
        let shapes = {
            let mut set = expressions.borrow_mut();
            let names: Vec<String> = set.names().map(str::to_string).collect();
            let shapes = candidates.resolve(&names);
            for name in shapes.values() {
                set.reserve(name);
            }
            shapes
        };
        debug!(resolved = shapes.len(), "expression mouth ready");
        Self {
            expressions,
            shapes,
            active: None,
        }
    }

    pub fn shape_for(&self, phoneme: Phoneme) -> Option<&str> {
        self.shapes.get(&phoneme).map(String::as_str)
    }

    fn clear_active(&mut self) {
        if let Some(name) = self.active.take() {
            self.expressions.borrow_mut().set(&name, 0.0);
        }
    }
}

impl LipSyncTarget for ExpressionMouth {
    fn set_mouth_shape(&mut self, phoneme: Phoneme, weight: f32) {
        let Some(name) = self.shapes.get(&phoneme).cloned() else {
            self.clear_active();
            return;
        };
        if self.active.as_deref() != Some(name.as_str()) {
            self.clear_active();
        }
        self.expressions.borrow_mut().set(&name, weight);
        self.active = Some(name);
    }

    fn reset_mouth(&mut self) {
        self.clear_active();
    }
}

/// Morph dictionary plus the influence array an MMD mesh reads from.
#[derive(Debug, Clone, Default)]
pub struct MorphInfluences {
    names: Vec<String>,
    weights: Vec<f32>,
}

pub type SharedInfluences = Rc<RefCell<MorphInfluences>>;

impl MorphInfluences {
    pub fn new(names: Vec<String>) -> Self {
        let weights = vec![0.0; names.len()];
        Self { names, weights }
    }

    pub fn shared(names: Vec<String>) -> SharedInfluences {
        Rc::new(RefCell::new(Self::new(names)))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// First slot called `name`, then the first case-insensitive match.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name).or_else(|| {
            let lowered = name.to_lowercase();
            self.names.iter().position(|n| n.to_lowercase() == lowered)
        })
    }

    pub fn get(&self, index: usize) -> f32 {
        self.weights.get(index).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, index: usize, weight: f32) {
        if let Some(slot) = self.weights.get_mut(index) {
            *slot = weight.clamp(0.0, 1.0);
        }
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn nonzero(&self) -> usize {
        self.weights.iter().filter(|w| **w > 0.0).count()
    }
}

/// Mouth driven through index-addressed morph influences (MMD).
#[derive(Debug)]
pub struct MorphMouth {
    influences: SharedInfluences,
    slots: HashMap<Phoneme, usize>,
    active: Option<usize>,
}

impl MorphMouth {
    pub fn new(influences: SharedInfluences, candidates: &MouthCandidates) -> Self {
        let slots = {
            let dict = influences.borrow();
            candidates
                .resolve_exact(dict.names())
                .into_iter()
                .filter_map(|(phoneme, name)| Some((phoneme, dict.index_of(&name)?)))
                .collect::<HashMap<_, _>>()
        };
        debug!(resolved = slots.len(), "morph mouth ready");
        Self {
            influences,
            slots,
            active: None,
        }
    }

    pub fn slot_for(&self, phoneme: Phoneme) -> Option<usize> {
        self.slots.get(&phoneme).copied()
    }

    fn clear_active(&mut self) {
        if let Some(index) = self.active.take() {
            self.influences.borrow_mut().set(index, 0.0);
        }
    }
}

impl LipSyncTarget for MorphMouth {
    fn set_mouth_shape(&mut self, phoneme: Phoneme, weight: f32) {
        let Some(index) = self.slots.get(&phoneme).copied() else {
            self.clear_active();
            return;
        };
        if self.active != Some(index) {
            self.clear_active();
        }
        self.influences.borrow_mut().set(index, weight);
        self.active = Some(index);
    }

    fn reset_mouth(&mut self) {
        self.clear_active();
    }
}

/// Live2D parameter values keyed by parameter id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    values: BTreeMap<String, f32>,
}

pub type SharedParameters = Rc<RefCell<ParameterSet>>;

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedParameters {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn get(&self, id: &str) -> f32 {
        self.values.get(id).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, id: &str, value: f32) {
        self.values.insert(id.to_string(), value);
    }
}

/// `ParamMouthForm` value per vowel: wide for I/E, pursed for U/O.
fn mouth_form(phoneme: Phoneme) -> f32 {
    match phoneme {
        Phoneme::I => 1.0,
        Phoneme::E => 0.5,
        Phoneme::O => -0.5,
        Phoneme::U => -1.0,
        Phoneme::A | Phoneme::N | Phoneme::Closed => 0.0,
    }
}

/// Mouth driven through the model's lip-sync parameters (Live2D). The single
/// "shape" here is the pair of mouth-open and mouth-form values.
#[derive(Debug)]
pub struct ParameterMouth {
    parameters: SharedParameters,
    open_ids: Vec<String>,
}

impl ParameterMouth {
    pub fn new(parameters: SharedParameters, open_ids: Vec<String>) -> Self {
        Self {
            parameters,
            open_ids,
        }
    }

    pub fn open_ids(&self) -> &[String] {
        &self.open_ids
    }

    fn write(&mut self, open: f32, form: f32) {
        let mut params = self.parameters.borrow_mut();
        for id in &self.open_ids {
            params.set(id, open);
        }
        params.set(MOUTH_FORM, form);
    }
}

impl LipSyncTarget for ParameterMouth {
    fn set_mouth_shape(&mut self, phoneme: Phoneme, weight: f32) {
        if phoneme == Phoneme::Closed {
            self.write(0.0, 0.0);
            return;
        }
        let weight = weight.clamp(0.0, 1.0);
        self.write(weight, mouth_form(phoneme) * weight);
    }

    fn reset_mouth(&mut self) {
        self.write(0.0, 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|n| n.to_string()).collect()
    }

    fn vrm_expressions() -> SharedExpressions {
        ExpressionSet::shared(&names(&["aa", "ih", "ou", "ee", "oh", "happy", "sad"]))
    }

    #[test]
    fn one_expression_shape_at_a_time() {
        let expressions = vrm_expressions();
        let mut mouth = ExpressionMouth::new(expressions.clone(), &MouthCandidates::blend_shapes());

        mouth.set_mouth_shape(Phoneme::A, 0.7);
        mouth.set_mouth_shape(Phoneme::O, 0.5);
        assert_eq!(expressions.borrow().active(), vec![("oh".to_string(), 0.5)]);

        mouth.set_mouth_shape(Phoneme::O, 0.6);
        assert_eq!(expressions.borrow().weight("oh"), Some(0.6));
    }

    #[test]
    fn closed_and_unmapped_zero_the_mouth() {
        let expressions = vrm_expressions();
        let mut mouth = ExpressionMouth::new(expressions.clone(), &MouthCandidates::blend_shapes());

        mouth.set_mouth_shape(Phoneme::A, 0.7);
        mouth.set_mouth_shape(Phoneme::Closed, 0.1);
        assert!(expressions.borrow().active().is_empty());

        mouth.set_mouth_shape(Phoneme::E, 0.7);
        mouth.set_mouth_shape(Phoneme::N, 0.1);
        assert!(mouth.shape_for(Phoneme::N).is_none());
        assert!(expressions.borrow().active().is_empty());
    }

    #[test]
    fn reset_is_idempotent() {
        let expressions = vrm_expressions();
        let mut mouth = ExpressionMouth::new(expressions.clone(), &MouthCandidates::blend_shapes());
        mouth.set_mouth_shape(Phoneme::I, 0.7);
        mouth.reset_mouth();
        mouth.reset_mouth();
        assert!(expressions.borrow().active().is_empty());
    }

    #[test]
    fn exclusive_expressions_leave_the_mouth_alone() {
        let expressions = vrm_expressions();
        let mut mouth = ExpressionMouth::new(expressions.clone(), &MouthCandidates::blend_shapes());
        mouth.set_mouth_shape(Phoneme::A, 0.7);

        let mut set = expressions.borrow_mut();
        set.set_exclusive("happy", 1.0).unwrap();
        set.set_exclusive("sad", 0.8).unwrap();
        assert_eq!(set.weight("happy"), Some(0.0));
        assert_eq!(set.weight("sad"), Some(0.8));
        assert_eq!(set.weight("aa"), Some(0.7));
        assert_eq!(set.selectable(), vec!["happy", "sad"]);
        assert!(matches!(
            set.set_exclusive("wink", 1.0),
            Err(CompanionError::UnknownExpression(_))
        ));
    }

    #[test]
    fn morph_mouth_writes_influences() {
        let influences = MorphInfluences::shared(names(&["まばたき", "あ", "い", "お", "あ"]));
        let mut mouth = MorphMouth::new(influences.clone(), &MouthCandidates::mmd_morphs());

        assert_eq!(mouth.slot_for(Phoneme::A), Some(1));
        mouth.set_mouth_shape(Phoneme::A, 0.7);
        mouth.set_mouth_shape(Phoneme::I, 0.4);
        assert_eq!(influences.borrow().nonzero(), 1);
        assert_eq!(influences.borrow().get(2), 0.4);

        mouth.set_mouth_shape(Phoneme::U, 0.7);
        assert_eq!(influences.borrow().nonzero(), 0);
        mouth.reset_mouth();
        assert_eq!(influences.borrow().nonzero(), 0);
    }

    #[test]
    fn parameter_mouth_drives_open_and_form() {
        let params = ParameterSet::shared();
        let mut mouth = ParameterMouth::new(params.clone(), names(&["ParamMouthOpenY"]));

        mouth.set_mouth_shape(Phoneme::I, 0.5);
        assert_eq!(params.borrow().get("ParamMouthOpenY"), 0.5);
        assert_eq!(params.borrow().get(MOUTH_FORM), 0.5);

        mouth.set_mouth_shape(Phoneme::Closed, 0.1);
        assert_eq!(params.borrow().get("ParamMouthOpenY"), 0.0);
        mouth.reset_mouth();
        assert_eq!(params.borrow().get(MOUTH_FORM), 0.0);
    }
}
