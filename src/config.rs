use std::num::NonZeroUsize;

use serde::Deserialize;

/// Plain-data training settings, loadable from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainerSettings {
    pub workers: NonZeroUsize,
    pub batch_size: NonZeroUsize,
    /// The run stops once the global epoch reaches this number.
    pub epochs: NonZeroUsize,
    pub learning_rate: f32,
    /// Per-epoch learning-rate decay factor, if any.
    #[serde(default)]
    pub lr_decay: Option<f32>,
    #[serde(default)]
    pub seed: u64,
    /// Layer widths from input to output.
    pub layers: Vec<usize>,
}

impl TrainerSettings {
    /// # Errors
    /// Returns a human-readable string describing the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.layers.len() < 2 {
            return Err("layers must name at least an input and an output width".to_string());
        }
        if self.layers.iter().any(|&w| w == 0) {
            return Err("layer widths must be positive".to_string());
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0. {
            return Err(format!("invalid learning_rate: {}", self.learning_rate));
        }
        if let Some(decay) = self.lr_decay {
            if !decay.is_finite() || decay <= 0. || decay > 1. {
                return Err(format!("lr_decay must be in (0, 1], got {decay}"));
            }
        }
        Ok(())
    }
}

/// Parses and validates [`TrainerSettings`] from a JSON string.
///
/// # Errors
/// Returns a human-readable string if the JSON cannot be parsed or a field
/// is out of range.
pub fn parse_settings(json: &str) -> Result<TrainerSettings, String> {
    let settings: TrainerSettings =
        serde_json::from_str(json).map_err(|e| format!("invalid JSON: {e}"))?;
    settings.validate()?;
    Ok(settings)
}

/// Loads [`TrainerSettings`] from a JSON file.
///
/// # Errors
/// Returns a human-readable string if the file cannot be read or parsed.
pub fn load_settings(path: &str) -> Result<TrainerSettings, String> {
    let content =
        std::fs::read_to_string(path).map_err(|e| format!("cannot read '{path}': {e}"))?;
    parse_settings(&content)
}
