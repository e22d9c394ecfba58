//! Training orchestrator: corpus in, published model directory out.
//!
//! The published directory is the unit other code consumes — see
//! [`crate::pipeline::MelodyPipeline::load`]. Everything is written into a
//! staging directory next to the target and renamed into place, so a crash
//! mid-write never leaves a half-usable model behind.

use std::path::{Path, PathBuf};

use candle_core::Device;

use crate::cache::Cache;
use crate::config::{EncoderConfig, ModelHyperparams};
use crate::corpus::{load_corpus, CorpusOptions};
use crate::model::{build_windows, MelodyModel, TrainingSummary};
use crate::pipeline::{ModelConfig, MODEL_CONFIG_FILE, MODEL_FORMAT_VERSION, VOCAB_FILE, WEIGHTS_FILE};
use crate::{Error, Result};

/// Outcome of a training run.
#[derive(Debug)]
pub struct TrainReport {
    /// Published model directory, `models_dir/<identifier>`.
    pub model_dir: PathBuf,
    pub files_used: usize,
    pub vocab_len: usize,
    pub examples: usize,
    pub summary: TrainingSummary,
}

/// Train a model on the corpus and publish it under `models_dir/<identifier>`.
/// An existing model with the same identifier is replaced.
pub fn train(
    identifier: &str,
    models_dir: &Path,
    corpus_options: &CorpusOptions,
    encoder: &EncoderConfig,
    hyperparams: &ModelHyperparams,
    cache: &dyn Cache,
) -> Result<TrainReport> {
    if identifier.is_empty()
        || identifier
            .chars()
            .any(|c| !c.is_ascii_alphanumeric() && c != '-' && c != '_')
    {
        return Err(Error::InvalidParameter(format!(
            "model identifier '{identifier}' must be non-empty [A-Za-z0-9_-]"
        )));
    }

    let corpus = load_corpus(corpus_options, encoder, cache)?;
    if corpus.files.is_empty() {
        return Err(Error::EmptyCorpus(format!(
            "no usable MIDI files in {}",
            corpus_options.midi_dir.display()
        )));
    }

    let sequences: Vec<Vec<u32>> = corpus.files.iter().map(|f| f.ids.clone()).collect();
    let windows = build_windows(&sequences, encoder.window_len);
    if windows.windows.is_empty() {
        return Err(Error::EmptyCorpus(
            "corpus yields no training windows".into(),
        ));
    }

    let mut model = MelodyModel::new(
        corpus.vocabulary.len(),
        encoder.window_len,
        hyperparams,
        &Device::Cpu,
    )?;
    let summary = model.fit(&windows, hyperparams)?;

    let config = ModelConfig {
        version: MODEL_FORMAT_VERSION,
        identifier: identifier.to_string(),
        encoder: encoder.clone(),
        hyperparams: hyperparams.clone(),
        partition: corpus_options.partition,
    };
    let model_dir = publish(models_dir, identifier, &config, &corpus.vocabulary, &model)?;

    tracing::info!(
        model_dir = %model_dir.display(),
        files = corpus.files.len(),
        examples = windows.windows.len(),
        best_loss = summary.best_loss,
        "model published"
    );
    Ok(TrainReport {
        model_dir,
        files_used: corpus.files.len(),
        vocab_len: corpus.vocabulary.len(),
        examples: windows.windows.len(),
        summary,
    })
}

/// Write the model files into a staging directory and rename it into place.
fn publish(
    models_dir: &Path,
    identifier: &str,
    config: &ModelConfig,
    vocabulary: &crate::vocab::Vocabulary,
    model: &MelodyModel,
) -> Result<PathBuf> {
    std::fs::create_dir_all(models_dir)?;
    let target = models_dir.join(identifier);

    // Staged on the same filesystem so the final rename is atomic.
    let staging = tempfile::tempdir_in(models_dir)?;
    std::fs::write(
        staging.path().join(MODEL_CONFIG_FILE),
        serde_json::to_string_pretty(config)?,
    )?;
    vocabulary.save(&staging.path().join(VOCAB_FILE))?;
    model.save_weights(&staging.path().join(WEIGHTS_FILE))?;

    if target.exists() {
        std::fs::remove_dir_all(&target)?;
    }
    let staging = staging.keep();
    if let Err(e) = std::fs::rename(&staging, &target) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e.into());
    }
    Ok(target)
}
