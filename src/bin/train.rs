//! MelodicNet training CLI.
//!
//! Builds a model from a directory of MIDI files and publishes it under
//! `--models-dir/<name>`. Cleaned melodies and encodings are cached on disk
//! so retraining with unchanged files skips the MIDI work.
//!
//! Prints a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"model_dir":"models/default","files":120,"vocab":310,"examples":20416,"epochs":96,"best_loss":1.42}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use melodicnet::{
    cache::FsCache,
    config::{EncoderConfig, ModelHyperparams},
    corpus::CorpusOptions,
    theory::Mode,
    trainer::train,
};

#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Train a MelodicNet model from a MIDI corpus",
    long_about = "Clean, encode and cache a directory of MIDI files, fit the\n\
                  next-token model, and publish the result atomically under\n\
                  --models-dir/<name>."
)]
struct Args {
    /// Directory of .mid/.midi files to train on.
    #[arg(long, short = 'i')]
    midi_dir: PathBuf,

    /// Name to publish the model under.
    #[arg(long, short = 'n', default_value = "default")]
    name: String,

    /// Directory holding published models.
    #[arg(long, default_value = "models")]
    models_dir: PathBuf,

    /// On-disk cache for cleaned melodies and encodings.
    #[arg(long, default_value = ".melodicnet-cache")]
    cache_dir: PathBuf,

    /// Only train on the first N files (after sorting).
    #[arg(long)]
    max_files: Option<usize>,

    /// Restrict the corpus to one mode ("major" or "minor").
    #[arg(long)]
    partition: Option<String>,

    /// File names to skip, repeatable.
    #[arg(long = "skip")]
    blacklist: Vec<String>,

    /// Re-clean every file even when a cached melody exists.
    #[arg(long)]
    refresh_cleaned: bool,

    /// Re-encode every file even when cached tokens exist.
    #[arg(long)]
    refresh_encodings: bool,

    /// Maximum training epochs.
    #[arg(long, default_value_t = ModelHyperparams::default().epochs)]
    epochs: usize,

    /// Mini-batch size.
    #[arg(long, default_value_t = ModelHyperparams::default().batch_size)]
    batch_size: usize,

    /// AdamW learning rate.
    #[arg(long, default_value_t = ModelHyperparams::default().learning_rate)]
    learning_rate: f64,

    /// Epochs without improvement before early stopping (0 disables).
    #[arg(long, default_value_t = ModelHyperparams::default().patience)]
    patience: usize,

    /// Context window length in tokens.
    #[arg(long, default_value_t = EncoderConfig::default().window_len)]
    window: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let partition = match &args.partition {
        Some(raw) => Some(
            Mode::from_str(raw)
                .map_err(|e| anyhow::anyhow!("invalid --partition: {e}"))?,
        ),
        None => None,
    };

    let mut corpus_options = CorpusOptions::new(&args.midi_dir);
    corpus_options.max_files = args.max_files;
    corpus_options.partition = partition;
    corpus_options.blacklist = args.blacklist.clone();
    corpus_options.refresh_cleaned = args.refresh_cleaned;
    corpus_options.refresh_encodings = args.refresh_encodings;

    let encoder = EncoderConfig {
        window_len: args.window,
        ..EncoderConfig::default()
    };
    let hyperparams = ModelHyperparams {
        epochs: args.epochs,
        batch_size: args.batch_size,
        learning_rate: args.learning_rate,
        patience: args.patience,
        ..ModelHyperparams::default()
    };

    let cache = FsCache::new(&args.cache_dir)
        .map_err(|e| anyhow::anyhow!("cannot open cache {}: {e}", args.cache_dir.display()))?;

    let report = train(
        &args.name,
        &args.models_dir,
        &corpus_options,
        &encoder,
        &hyperparams,
        &cache,
    )
    .map_err(|e| anyhow::anyhow!("training failed: {e}"))?;

    // Machine-readable summary for the caller.
    println!(
        r#"{{"model_dir":"{dir}","files":{files},"vocab":{vocab},"examples":{examples},"epochs":{epochs},"best_loss":{loss}}}"#,
        dir = report.model_dir.display(),
        files = report.files_used,
        vocab = report.vocab_len,
        examples = report.examples,
        epochs = report.summary.epochs_ran,
        loss = report.summary.best_loss,
    );

    Ok(())
}
