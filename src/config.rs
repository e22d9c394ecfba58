//! Configuration for the encoder and the sequence model.
//!
//! Both structs serialize into a model config directory's `config.json` so
//! that generation always runs with the exact settings used at training time.

use serde::{Deserialize, Serialize};

/// Quarter-lengths per sixteenth note — the quantization grid.
pub const SIXTEENTH: f64 = 0.25;

/// Longest representable note/rest duration, in quarter-lengths.
pub const LONGEST_DURATION: f64 = 8.0;

/// Quarter-lengths per bar (4/4 assumed throughout).
pub const QUARTERS_PER_BAR: f64 = 4.0;

/// Settings for MIDI cleaning and token encoding.
///
/// These participate in cache fingerprints: any change invalidates cached
/// cleaned melodies and encodings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Quantize onsets and durations to the sixteenth grid.
    pub quantize: bool,

    /// Emit a bar-boundary token every [`QUARTERS_PER_BAR`] quarters.
    pub bar_tokens: bool,

    /// Number of tokens in a model context window.
    pub window_len: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            quantize: true,
            bar_tokens: true,
            window_len: 12,
        }
    }
}

/// Training hyperparameters for the LSTM next-token model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHyperparams {
    /// Token embedding dimension.
    pub embed_dim: usize,

    /// Hidden size of each LSTM layer.
    pub hidden_dim: usize,

    /// Training epochs (upper bound; early stopping may end sooner).
    pub epochs: usize,

    /// Mini-batch size.
    pub batch_size: usize,

    /// AdamW learning rate.
    pub learning_rate: f64,

    /// Epochs without loss improvement before training stops.
    /// 0 disables early stopping.
    pub patience: usize,
}

impl Default for ModelHyperparams {
    fn default() -> Self {
        Self {
            embed_dim: 64,
            hidden_dim: 256,
            epochs: 130,
            batch_size: 64,
            learning_rate: 1e-3,
            patience: 17,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_encoder_config() {
        let cfg = EncoderConfig::default();
        assert!(cfg.quantize);
        assert!(cfg.bar_tokens);
        assert_eq!(cfg.window_len, 12);
    }

    #[test]
    fn default_hyperparams() {
        let hp = ModelHyperparams::default();
        assert_eq!(hp.epochs, 130);
        assert_eq!(hp.patience, 17);
        assert!(hp.learning_rate > 0.0);
    }

    #[test]
    fn encoder_config_json_round_trip() {
        let cfg = EncoderConfig {
            quantize: false,
            bar_tokens: true,
            window_len: 24,
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EncoderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
