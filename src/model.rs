//! LSTM next-token model over the vocabulary.
//!
//! Embedding → two LSTM layers → linear head to vocabulary logits, trained
//! with next-token supervision: each example is a fixed-length window of ids
//! and the label is the id that follows it. Sequences shorter than the
//! window are left-padded with the pad id, and windows whose label is the
//! pad id never reach the loss.
//!
//! `predict_next` returns raw logits over the full vocabulary — temperature
//! scaling and constraint masking belong to the sampler, which owns the
//! randomness.

use candle_core::{DType, Device, Tensor};
use candle_nn::{
    embedding, linear, loss, lstm, AdamW, Embedding, LSTMConfig, Linear, Module, Optimizer,
    ParamsAdamW, VarBuilder, VarMap, LSTM, RNN,
};
use std::path::Path;

use crate::config::ModelHyperparams;
use crate::vocab::PAD_ID;
use crate::{Error, Result};

/// Fixed-length training windows plus their next-token labels.
#[derive(Debug, Default)]
pub struct WindowSet {
    pub windows: Vec<Vec<u32>>,
    pub labels: Vec<u32>,
}

/// Slice encoded sequences into (window, next-token) pairs.
///
/// A sequence of length `<= window_len` still yields one example, left-padded
/// with the pad id. Windows whose label would be the pad id are dropped.
pub fn build_windows(sequences: &[Vec<u32>], window_len: usize) -> WindowSet {
    let mut set = WindowSet::default();
    for ids in sequences {
        if ids.len() < 2 {
            continue;
        }
        for end in 1..ids.len() {
            let label = ids[end];
            if label == PAD_ID {
                continue;
            }
            let start = end.saturating_sub(window_len);
            let mut window = vec![PAD_ID; window_len - (end - start)];
            window.extend_from_slice(&ids[start..end]);
            set.windows.push(window);
            set.labels.push(label);
        }
    }
    set
}

/// What a training run did.
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub epochs_ran: usize,
    pub best_loss: f64,
}

/// The next-token model. Read-only after training: `predict_next` takes
/// `&self` so concurrent generation needs no locking.
pub struct MelodyModel {
    embedding: Embedding,
    lstm1: LSTM,
    lstm2: LSTM,
    head: Linear,
    varmap: VarMap,
    vocab_size: usize,
    window_len: usize,
    device: Device,
}

impl MelodyModel {
    /// Build a fresh (untrained) model.
    pub fn new(
        vocab_size: usize,
        window_len: usize,
        hyperparams: &ModelHyperparams,
        device: &Device,
    ) -> Result<MelodyModel> {
        if vocab_size < 4 {
            return Err(Error::CorruptMapping(format!(
                "vocabulary of {vocab_size} has no corpus tokens"
            )));
        }
        if window_len == 0 {
            return Err(Error::InvalidParameter("window length must be > 0".into()));
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let embedding = embedding(vocab_size, hyperparams.embed_dim, vb.pp("embed"))?;
        let lstm1 = lstm(
            hyperparams.embed_dim,
            hyperparams.hidden_dim,
            LSTMConfig::default(),
            vb.pp("lstm1"),
        )?;
        let lstm2 = lstm(
            hyperparams.hidden_dim,
            hyperparams.hidden_dim,
            LSTMConfig::default(),
            vb.pp("lstm2"),
        )?;
        let head = linear(hyperparams.hidden_dim, vocab_size, vb.pp("head"))?;

        Ok(MelodyModel {
            embedding,
            lstm1,
            lstm2,
            head,
            varmap,
            vocab_size,
            window_len,
            device: device.clone(),
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    /// Forward pass: ids `(B, T)` → logits `(B, vocab)` for the last step.
    fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let (_, t) = ids.dims2()?;
        let x = self.embedding.forward(ids)?;
        let states = self.lstm1.seq(&x)?;
        let x = self.lstm1.states_to_tensor(&states)?;
        let states = self.lstm2.seq(&x)?;
        let x = self.lstm2.states_to_tensor(&states)?;
        let last = x.narrow(1, t - 1, 1)?.squeeze(1)?;
        Ok(self.head.forward(&last)?)
    }

    /// Train on the window set. Runs up to `epochs`, stopping early after
    /// `patience` epochs without loss improvement and restoring the best
    /// weights seen (snapshotted to a temp file).
    pub fn fit(
        &mut self,
        windows: &WindowSet,
        hyperparams: &ModelHyperparams,
    ) -> Result<TrainingSummary> {
        if windows.windows.is_empty() {
            return Err(Error::EmptyCorpus("no training windows".into()));
        }

        let n = windows.windows.len();
        let batch_size = hyperparams.batch_size.max(1).min(n);
        tracing::info!(
            examples = n,
            batch_size,
            epochs = hyperparams.epochs,
            "fitting model"
        );

        let mut optimizer = AdamW::new(
            self.varmap.all_vars(),
            ParamsAdamW {
                lr: hyperparams.learning_rate,
                ..Default::default()
            },
        )?;

        let snapshot_dir = tempfile::tempdir()?;
        let snapshot_path = snapshot_dir.path().join("best.safetensors");
        let mut best_loss = f64::INFINITY;
        let mut stale_epochs = 0usize;
        let mut epochs_ran = 0usize;

        for epoch in 0..hyperparams.epochs {
            let mut epoch_loss = 0.0f64;
            let mut batches = 0usize;

            for start in (0..n).step_by(batch_size) {
                let end = (start + batch_size).min(n);
                let flat: Vec<u32> = windows.windows[start..end]
                    .iter()
                    .flat_map(|w| w.iter().copied())
                    .collect();
                let ids =
                    Tensor::from_vec(flat, (end - start, self.window_len), &self.device)?;
                let targets = Tensor::from_vec(
                    windows.labels[start..end].to_vec(),
                    end - start,
                    &self.device,
                )?;

                let logits = self.forward(&ids)?;
                let batch_loss = loss::cross_entropy(&logits, &targets)?;
                optimizer.backward_step(&batch_loss)?;

                epoch_loss += batch_loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
                batches += 1;
            }

            let epoch_loss = epoch_loss / batches as f64;
            epochs_ran = epoch + 1;
            tracing::info!(epoch = epoch + 1, loss = epoch_loss, "epoch complete");

            if epoch_loss < best_loss {
                best_loss = epoch_loss;
                stale_epochs = 0;
                self.varmap.save(&snapshot_path)?;
            } else {
                stale_epochs += 1;
                if hyperparams.patience > 0 && stale_epochs >= hyperparams.patience {
                    tracing::info!(
                        epoch = epoch + 1,
                        patience = hyperparams.patience,
                        "early stopping"
                    );
                    break;
                }
            }
        }

        if stale_epochs > 0 && snapshot_path.exists() {
            self.varmap.load(&snapshot_path)?;
            tracing::info!(best_loss, "restored best weights");
        }

        Ok(TrainingSummary {
            epochs_ran,
            best_loss,
        })
    }

    /// Raw logits over the vocabulary for the token following `context`.
    ///
    /// The context is right-truncated to the window length when longer, and
    /// left-padded with the pad id when shorter.
    pub fn predict_next(&self, context: &[u32]) -> Result<Vec<f32>> {
        let mut window = vec![PAD_ID; self.window_len.saturating_sub(context.len())];
        let keep = context.len().saturating_sub(self.window_len);
        window.extend_from_slice(&context[keep..]);

        let ids = Tensor::from_vec(window, (1, self.window_len), &self.device)?;
        let logits = self.forward(&ids)?.squeeze(0)?;
        Ok(logits.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }

    /// Persist weights as safetensors.
    pub fn save_weights(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    /// Load weights saved by [`MelodyModel::save_weights`] into this model.
    /// Shape mismatches (a vocabulary that doesn't pair with the weights)
    /// surface as `CorruptMapping`.
    pub fn load_weights(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(Error::Config(format!(
                "weights file {} does not exist",
                path.display()
            )));
        }
        self.varmap.load(path).map_err(|e| {
            Error::CorruptMapping(format!(
                "weights {} do not match the model/vocabulary: {e}",
                path.display()
            ))
        })
    }
}
