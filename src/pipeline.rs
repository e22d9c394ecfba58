//! Generation pipeline: a trained model directory on disk, loaded once and
//! then driven by [`GenerationRequest`]s.
//!
//! A model directory holds three files that only make sense together:
//! `config.json` (encoder settings and hyperparameters), `vocab.json`
//! (token ↔ id mapping) and `weights.safetensors`. The trainer publishes
//! them atomically; here they are validated against each other on load.

use std::path::Path;

use candle_core::Device;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::{EncoderConfig, ModelHyperparams, QUARTERS_PER_BAR};
use crate::encoding::{decode, encode, Token};
use crate::midi::{clean_melody, parse_tracks, select_melodic_track, trim_to_length, write_smf, CleanedMelody, NoteEvent};
use crate::model::MelodyModel;
use crate::sampler::{Constraint, GenerationRequest, KeyChoice, Sampler};
use crate::theory::{Key, Mode};
use crate::vocab::Vocabulary;
use crate::{Error, Result};

pub const MODEL_CONFIG_FILE: &str = "config.json";
pub const VOCAB_FILE: &str = "vocab.json";
pub const WEIGHTS_FILE: &str = "weights.safetensors";
pub const MODEL_FORMAT_VERSION: u32 = 1;

/// On-disk description of a trained model directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub version: u32,
    /// Name the model was trained under.
    pub identifier: String,
    pub encoder: EncoderConfig,
    pub hyperparams: ModelHyperparams,
    /// Mode the training corpus was restricted to, if any.
    pub partition: Option<Mode>,
}

/// One generated melody.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub tokens: Vec<Token>,
    /// Standard MIDI file bytes, ready to write out.
    pub midi_bytes: Vec<u8>,
    pub relaxed_steps: usize,
    pub retries: usize,
}

/// All outputs of one request, tagged with the seed that produced them.
/// Re-running with the same model, input and `seed` reproduces the batch.
///
/// Slots are independent: a numeric failure in one output is reported in
/// its slot while the rest of the batch still completes. Results are in
/// request order.
#[derive(Debug)]
pub struct GenerationBatch {
    pub seed: u64,
    pub outputs: Vec<Result<GenerationResult>>,
}

pub struct MelodyPipeline {
    config: ModelConfig,
    vocab: Vocabulary,
    model: MelodyModel,
}

impl MelodyPipeline {
    /// Load a trained model directory.
    pub fn load(model_dir: &Path) -> Result<MelodyPipeline> {
        let config_path = model_dir.join(MODEL_CONFIG_FILE);
        let raw = std::fs::read_to_string(&config_path).map_err(|e| {
            Error::Config(format!(
                "cannot read model config {}: {e}",
                config_path.display()
            ))
        })?;
        let config: ModelConfig = serde_json::from_str(&raw).map_err(|e| {
            Error::CorruptMapping(format!(
                "model config {} is not valid: {e}",
                config_path.display()
            ))
        })?;
        if config.version != MODEL_FORMAT_VERSION {
            return Err(Error::CorruptMapping(format!(
                "model config version {} is not supported",
                config.version
            )));
        }

        let vocab = Vocabulary::load(&model_dir.join(VOCAB_FILE))?;
        let mut model = MelodyModel::new(
            vocab.len(),
            config.encoder.window_len,
            &config.hyperparams,
            &Device::Cpu,
        )?;
        model.load_weights(&model_dir.join(WEIGHTS_FILE))?;
        tracing::info!(
            identifier = %config.identifier,
            vocab = vocab.len(),
            "loaded model"
        );

        Ok(MelodyPipeline {
            config,
            vocab,
            model,
        })
    }

    /// Assemble a pipeline from already-built parts. The trainer uses this
    /// to sanity-check a model before publishing it.
    pub fn from_parts(
        config: ModelConfig,
        vocab: Vocabulary,
        model: MelodyModel,
    ) -> MelodyPipeline {
        MelodyPipeline {
            config,
            vocab,
            model,
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Generate melodies continuing the given MIDI input.
    pub fn generate(
        &self,
        request: &GenerationRequest,
        input_midi: &[u8],
    ) -> Result<GenerationBatch> {
        request.validate()?;

        let tracks = parse_tracks(input_midi)?;
        let track = select_melodic_track(&tracks)?;
        let cleaned = clean_melody(&tracks[track], &self.config.encoder)?;

        let (shift, target_key) = seed_target(&cleaned, request.key);
        let seed_events = transpose_into_range(
            &cleaned.events,
            shift,
            request.octave_low,
            request.octave_high,
        );
        let mut seed_tokens = encode(&seed_events, &self.config.encoder)?;
        if seed_tokens.last() == Some(&Token::End) {
            seed_tokens.pop();
        }
        let seed_ids = self.vocab.encode_sequence(&seed_tokens);

        let constraint = Constraint {
            key: target_key,
            octave_low: request.octave_low,
            octave_high: request.octave_high,
        };
        let sampler = Sampler::new(&self.model, &self.vocab);
        let base_seed = request.seed.unwrap_or_else(rand::random);
        match target_key {
            Some(key) => tracing::info!(
                seed = base_seed,
                outputs = request.outputs,
                %key,
                shift,
                "generating"
            ),
            None => tracing::info!(
                seed = base_seed,
                outputs = request.outputs,
                shift,
                "generating in the input's key"
            ),
        }

        let budget = f64::from(request.bars) * QUARTERS_PER_BAR;
        let mut outputs = Vec::with_capacity(request.outputs as usize);
        for index in 0..request.outputs {
            let mut rng = ChaCha8Rng::seed_from_u64(base_seed.wrapping_add(u64::from(index)));
            let slot = sampler
                .sample(
                    &seed_ids,
                    &constraint,
                    request.bars,
                    request.temperature,
                    &mut rng,
                )
                .and_then(|outcome| {
                    warn_on_concentration(index, &outcome.tokens);
                    let events = trim_to_length(&decode(&outcome.tokens), budget);
                    let midi_bytes = write_smf(&events)?;
                    Ok(GenerationResult {
                        tokens: outcome.tokens,
                        midi_bytes,
                        relaxed_steps: outcome.relaxed_steps,
                        retries: outcome.retries,
                    })
                });
            if let Err(e) = &slot {
                tracing::warn!(output = index, error = %e, "output failed");
            }
            outputs.push(slot);
        }

        Ok(GenerationBatch {
            seed: base_seed,
            outputs,
        })
    }
}

/// Semitone shift to move the normalized (C-tonic) seed into the requested
/// key, and the key the samples must stay in. Keeping the input's own key
/// leaves the pitch classes unfiltered, so the key is `None` there.
fn seed_target(cleaned: &CleanedMelody, choice: KeyChoice) -> (i32, Option<Key>) {
    match choice {
        KeyChoice::SameAsInput => (-cleaned.applied_shift, None),
        KeyChoice::Pitch(tonic) => {
            let up = i32::from(tonic.semitone());
            let shift = if up >= 6 { up - 12 } else { up };
            (shift, Some(Key::new(tonic, cleaned.source_key.mode)))
        }
    }
}

/// Transpose seed events and fold any note outside the octave range back in
/// by whole octaves. The pitch class is untouched.
fn transpose_into_range(
    events: &[NoteEvent],
    shift: i32,
    octave_low: i8,
    octave_high: i8,
) -> Vec<NoteEvent> {
    events
        .iter()
        .map(|e| {
            let mut e = e.transposed(shift);
            while e.octave < octave_low {
                e = e.transposed(12);
            }
            while e.octave > octave_high {
                e = e.transposed(-12);
            }
            e
        })
        .collect()
}

/// A melody stuck on one pitch class is usually an undertrained model; say
/// so instead of failing.
fn warn_on_concentration(output: u32, tokens: &[Token]) {
    let mut counts = [0usize; 12];
    let mut total = 0usize;
    for token in tokens {
        if let Token::Note { pitch_class, .. } = token {
            counts[pitch_class.semitone() as usize] += 1;
            total += 1;
        }
    }
    if total < 10 {
        return;
    }
    let (semitone, &max) = counts
        .iter()
        .enumerate()
        .max_by_key(|(_, c)| **c)
        .unwrap_or((0, &0));
    if max as f64 > total as f64 * 0.9 {
        tracing::warn!(
            output,
            pitch_class = %crate::theory::PitchClass::from_semitone(semitone as u8),
            share = max as f64 / total as f64,
            "generated melody is dominated by a single pitch class"
        );
    }
}
