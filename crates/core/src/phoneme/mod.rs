//! Mouth-shape classes and the sources that produce them from text.
//!
//! The heuristic in [`Phoneme::from_char`] is deliberately coarse: it only has
//! to produce stable, varied mouth movement. [`PinyinPhonemes`] is the richer
//! source a backend uses to attach phoneme tags to streamed chunks.

use std::{fmt, str::FromStr};

use pinyin::ToPinyin;
use serde::{Deserialize, Serialize};

use crate::CompanionError;

/// Viseme class driving the mouth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phoneme {
    A,
    E,
    I,
    O,
    U,
    /// Nasal, almost closed.
    N,
    /// Silence.
    #[serde(rename = "closed")]
    Closed,
}

const HASHED_VOWELS: [Phoneme; 5] = [Phoneme::A, Phoneme::E, Phoneme::I, Phoneme::O, Phoneme::U];

impl Phoneme {
    pub const ALL: [Phoneme; 7] = [
        Phoneme::A,
        Phoneme::E,
        Phoneme::I,
        Phoneme::O,
        Phoneme::U,
        Phoneme::N,
        Phoneme::Closed,
    ];

    /// Tag used on the wire. Matching is case-sensitive.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phoneme::A => "A",
            Phoneme::E => "E",
            Phoneme::I => "I",
            Phoneme::O => "O",
            Phoneme::U => "U",
            Phoneme::N => "N",
            Phoneme::Closed => "closed",
        }
    }

    /// Whether the phoneme opens the mouth.
    pub fn is_vocalic(&self) -> bool {
        !matches!(self, Phoneme::N | Phoneme::Closed)
    }

    /// Heuristic mapping used when no backend phonemes are available.
    pub fn from_char(c: char) -> Phoneme {
        if c.is_whitespace() || c.is_ascii_punctuation() || is_wide_punctuation(c) {
            return Phoneme::Closed;
        }

        match c.to_ascii_lowercase() {
            'a' => Phoneme::A,
            'e' => Phoneme::E,
            'i' | 'y' => Phoneme::I,
            'o' => Phoneme::O,
            'u' | 'w' => Phoneme::U,
            'm' | 'n' => Phoneme::N,
            _ => {
                let cp = c as u32;
                let hash = (cp.wrapping_mul(7).wrapping_add(cp >> 3)) % 5;
                HASHED_VOWELS[hash as usize]
            }
        }
    }
}

impl fmt::Display for Phoneme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phoneme {
    type Err = CompanionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phoneme::ALL
            .into_iter()
            .find(|phoneme| phoneme.as_str() == s)
            .ok_or_else(|| CompanionError::msg(format!("unknown phoneme tag `{s}`")))
    }
}

fn is_wide_punctuation(c: char) -> bool {
    matches!(
        c,
        '，' | '。'
            | '！'
            | '？'
            | '、'
            | '；'
            | '：'
            | '（'
            | '）'
            | '【'
            | '】'
            | '《'
            | '》'
            | '「'
            | '」'
            | '·'
            | '…'
            | '—'
            | '“'
            | '”'
            | '‘'
            | '’'
    )
}

/// Produces phoneme tags for a piece of text.
pub trait PhonemeSource {
    fn phonemes(&self, text: &str) -> Vec<Phoneme>;

    /// Tags in their wire form, ready to travel with a stream chunk.
    fn tags(&self, text: &str) -> Vec<String> {
        self.phonemes(text)
            .into_iter()
            .map(|phoneme| phoneme.as_str().to_string())
            .collect()
    }
}

/// Character heuristic wrapped as a source, without duplicate collapsing.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicPhonemes;

impl PhonemeSource for HeuristicPhonemes {
    fn phonemes(&self, text: &str) -> Vec<Phoneme> {
        text.chars().map(Phoneme::from_char).collect()
    }
}

/// Reads Han characters through their pinyin final; everything else falls back
/// to the character heuristic. Consecutive duplicates collapse into one tag.
#[derive(Debug, Clone, Copy, Default)]
pub struct PinyinPhonemes;

impl PinyinPhonemes {
    fn classify(c: char) -> Phoneme {
        if c.is_whitespace() || c.is_ascii_punctuation() || is_wide_punctuation(c) {
            return Phoneme::Closed;
        }

        match c.to_pinyin() {
            Some(pinyin) => final_to_phoneme(pinyin.plain()),
            None => Phoneme::from_char(c),
        }
    }
}

impl PhonemeSource for PinyinPhonemes {
    fn phonemes(&self, text: &str) -> Vec<Phoneme> {
        let mut out: Vec<Phoneme> = Vec::new();
        for c in text.chars() {
            let phoneme = Self::classify(c);
            if out.last() != Some(&phoneme) {
                out.push(phoneme);
            }
        }
        out
    }
}

/// More specific finals are checked first: `wu`/`u`/`ü` before `a`, and the
/// `ie`/`ue` finals are kept away from the E class.
fn final_to_phoneme(syllable: &str) -> Phoneme {
    let finals: String = syllable
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphabetic())
        .collect();

    if finals.starts_with("wu")
        || finals.starts_with('u')
        || finals.starts_with('ü')
        || finals.contains("ue")
        || finals.contains("üe")
    {
        return Phoneme::U;
    }
    if finals.contains('a') {
        return Phoneme::A;
    }
    if finals.starts_with('o') || finals.ends_with("ong") || finals.ends_with('o') {
        return Phoneme::O;
    }
    if finals.contains('e') && !finals.contains("ie") {
        return Phoneme::E;
    }
    if finals.contains('i') || finals.starts_with('y') {
        return Phoneme::I;
    }
    if finals.ends_with('u') {
        return Phoneme::U;
    }
    Phoneme::A
}
