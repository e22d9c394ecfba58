//! Generation manager — keeps a trained pipeline resident and queues
//! requests.
//!
//! The manager owns one [`MelodyPipeline`] and processes submissions
//! sequentially on a dedicated blocking thread; the pipeline itself never
//! crosses threads after loading. Handles are cheap to clone, so many tasks
//! can submit concurrently and each awaits its own reply.
//!
//! # Example
//!
//! ```no_run
//! use melodicnet::manager::{GenerationManager, ManagerConfig};
//! use melodicnet::sampler::GenerationRequest;
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = GenerationManager::start(ManagerConfig::new("models/default"))
//!         .await
//!         .unwrap();
//!     let input = std::fs::read("seed.mid").unwrap();
//!     let batch = manager
//!         .generate(GenerationRequest::default(), input)
//!         .await
//!         .unwrap();
//!     assert!(!batch.outputs.is_empty());
//! }
//! ```

use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};

use crate::pipeline::{GenerationBatch, MelodyPipeline};
use crate::sampler::GenerationRequest;
use crate::{Error, Result};

/// Configuration for the generation manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Published model directory to load.
    pub model_dir: PathBuf,

    /// Requests that may wait in the queue before submitters block.
    pub queue_depth: usize,
}

impl ManagerConfig {
    pub fn new(model_dir: impl Into<PathBuf>) -> ManagerConfig {
        ManagerConfig {
            model_dir: model_dir.into(),
            queue_depth: 64,
        }
    }
}

/// A submitted generation request.
struct PendingRequest {
    request: GenerationRequest,
    input_midi: Vec<u8>,
    reply: oneshot::Sender<Result<GenerationBatch>>,
}

/// Handle for submitting generation requests to a running manager.
#[derive(Clone, Debug)]
pub struct GenerationManager {
    tx: mpsc::Sender<PendingRequest>,
}

impl GenerationManager {
    /// Load the model and start the worker. Returns an error if the model
    /// directory cannot be loaded, so a bad deployment fails at startup
    /// rather than on the first request.
    pub async fn start(config: ManagerConfig) -> Result<GenerationManager> {
        // Loading reads weights synchronously, so keep it off the runtime.
        let model_dir = config.model_dir.clone();
        let pipeline = tokio::task::spawn_blocking(move || MelodyPipeline::load(&model_dir))
            .await
            .map_err(|join_error| {
                Error::Manager(format!("pipeline load task panicked: {join_error}"))
            })??;

        let (tx, rx) = mpsc::channel::<PendingRequest>(config.queue_depth.max(1));
        tokio::task::spawn_blocking(move || run_manager(pipeline, rx));

        Ok(GenerationManager { tx })
    }

    /// Submit a request and wait for the generated batch.
    pub async fn generate(
        &self,
        request: GenerationRequest,
        input_midi: Vec<u8>,
    ) -> Result<GenerationBatch> {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<GenerationBatch>>();
        self.tx
            .send(PendingRequest {
                request,
                input_midi,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Manager("manager has shut down".into()))?;

        reply_rx
            .await
            .map_err(|_| Error::Manager("manager dropped reply channel".into()))?
    }
}

/// The manager loop — runs in a dedicated blocking thread until every
/// handle is dropped.
fn run_manager(pipeline: MelodyPipeline, mut rx: mpsc::Receiver<PendingRequest>) {
    while let Some(pending) = rx.blocking_recv() {
        let result = pipeline.generate(&pending.request, &pending.input_midi);
        if let Err(e) = &result {
            tracing::warn!(error = %e, "generation failed");
        }
        // Ignore send errors — the caller may have given up waiting.
        let _ = pending.reply.send(result);
    }
    tracing::info!("generation manager shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::{EncoderConfig, ModelHyperparams};
    use crate::corpus::CorpusOptions;
    use crate::midi::{write_smf, NoteEvent};
    use crate::theory::PitchClass;
    use crate::trainer::train;

    fn arpeggio_midi() -> Vec<u8> {
        let events: Vec<NoteEvent> = [PitchClass::C, PitchClass::E, PitchClass::G, PitchClass::C]
            .iter()
            .enumerate()
            .map(|(i, pc)| NoteEvent {
                pitch_class: *pc,
                octave: if i == 3 { 5 } else { 4 },
                onset: i as f64,
                duration: 1.0,
            })
            .collect();
        write_smf(&events).unwrap()
    }

    fn train_tiny_model(models_dir: &std::path::Path) -> std::path::PathBuf {
        let midi_dir = tempfile::tempdir().unwrap();
        for file in 0..2 {
            std::fs::write(
                midi_dir.path().join(format!("seed_{file}.mid")),
                arpeggio_midi(),
            )
            .unwrap();
        }
        let hyperparams = ModelHyperparams {
            embed_dim: 8,
            hidden_dim: 16,
            epochs: 1,
            batch_size: 16,
            learning_rate: 1e-3,
            patience: 0,
        };
        train(
            "manager-test",
            models_dir,
            &CorpusOptions::new(midi_dir.path()),
            &EncoderConfig::default(),
            &hyperparams,
            &MemoryCache::new(),
        )
        .unwrap()
        .model_dir
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_fails_for_missing_model() {
        let err = GenerationManager::start(ManagerConfig::new("/nonexistent/model"))
            .await
            .unwrap_err();
        // Load errors keep their own kind so callers can tell a missing
        // deployment apart from a worker failure.
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn requests_round_trip_through_the_worker() {
        let models_dir = tempfile::tempdir().unwrap();
        let model_dir = train_tiny_model(models_dir.path());

        let manager = GenerationManager::start(ManagerConfig::new(model_dir))
            .await
            .unwrap();

        let request = GenerationRequest {
            seed: Some(3),
            bars: 1,
            outputs: 2,
            ..GenerationRequest::default()
        };
        let batch = manager
            .generate(request.clone(), arpeggio_midi())
            .await
            .unwrap();
        assert_eq!(batch.seed, 3);
        assert_eq!(batch.outputs.len(), 2);

        // A cloned handle feeds the same worker.
        let clone = manager.clone();
        let again = clone.generate(request, arpeggio_midi()).await.unwrap();
        assert_eq!(again.outputs.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_request_surfaces_to_the_caller() {
        let models_dir = tempfile::tempdir().unwrap();
        let model_dir = train_tiny_model(models_dir.path());
        let manager = GenerationManager::start(ManagerConfig::new(model_dir))
            .await
            .unwrap();

        let request = GenerationRequest {
            outputs: 0,
            ..GenerationRequest::default()
        };
        let err = manager
            .generate(request, arpeggio_midi())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }
}
