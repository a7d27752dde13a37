use crate::{config::LipSyncConfig, Phoneme};

use super::LipFrame;

/// Weight for nasal and silent frames.
pub const SILENT_WEIGHT: f32 = 0.1;

/// Quadratic ease-in-out over `[0, 1]`.
pub fn ease_in_out_quad(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    if t < 0.5 {
        2.0 * t * t
    } else {
        1.0 - (-2.0 * t + 2.0).powi(2) / 2.0
    }
}

fn weight_for(phoneme: Phoneme, config: &LipSyncConfig) -> f32 {
    if phoneme.is_vocalic() {
        config.speaking_weight
    } else {
        SILENT_WEIGHT
    }
}

/// One frame per character, with runs of the same phoneme merged.
pub fn frames_from_text(text: &str, config: &LipSyncConfig) -> Vec<LipFrame> {
    let mut frames: Vec<LipFrame> = Vec::new();

    for c in text.chars() {
        let phoneme = Phoneme::from_char(c);
        match frames.last_mut() {
            Some(last) if last.phoneme == phoneme => {
                last.duration_ms += config.char_duration_ms;
            }
            _ => frames.push(LipFrame::new(
                phoneme,
                weight_for(phoneme, config),
                config.char_duration_ms,
            )),
        }
    }

    frames
}

/// One frame per recognised tag. Each frame lasts at least one character, and
/// together they stretch over the whole chunk when the tags are sparse.
pub fn frames_from_phonemes(text: &str, tags: &[String], config: &LipSyncConfig) -> Vec<LipFrame> {
    let phonemes: Vec<Phoneme> = tags
        .iter()
        .filter_map(|tag| match tag.parse::<Phoneme>() {
            Ok(phoneme) => Some(phoneme),
            Err(err) => {
                tracing::debug!(%err, "skipping phoneme tag");
                None
            }
        })
        .collect();

    if phonemes.is_empty() {
        return Vec::new();
    }

    let text_duration = text.chars().count() as f64 * config.char_duration_ms;
    let duration = config
        .char_duration_ms
        .max(text_duration / phonemes.len() as f64);

    phonemes
        .into_iter()
        .map(|phoneme| LipFrame::new(phoneme, weight_for(phoneme, config), duration))
        .collect()
}
