//! MelodicNet generation CLI.
//!
//! Continues a seed MIDI file with a trained model. Each output is written
//! as `output_<i>.mid` under --output-dir, next to a `manifest.json` that
//! records the seed and per-output sampling statistics.
//!
//! Prints a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"seed":42,"outputs":3,"output_dir":"out"}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use melodicnet::{
    pipeline::MelodyPipeline,
    sampler::{GenerationRequest, KeyChoice},
    theory::PitchClass,
};

#[derive(Parser, Debug)]
#[command(
    name = "generate",
    about = "Generate melodies continuing a seed MIDI file",
    long_about = "Load a published model directory and sample melodies that\n\
                  continue the melodic track of --input, constrained to the\n\
                  requested key and octave range."
)]
struct Args {
    /// Published model directory (as produced by the train binary).
    #[arg(long, short = 'm')]
    model_dir: PathBuf,

    /// Seed MIDI file to continue.
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Directory for generated MIDI files and the manifest.
    #[arg(long, short = 'o', default_value = "out")]
    output_dir: PathBuf,

    /// Number of melodies to generate.
    #[arg(long, short = 'n', default_value_t = 1)]
    outputs: u32,

    /// Sampling temperature (> 0; lower is more conservative).
    #[arg(long, short = 't', default_value_t = 0.9)]
    temperature: f64,

    /// Target key tonic, e.g. "D" or "F#". "input" keeps the seed's key.
    #[arg(long, short = 'k', default_value = "input")]
    key: String,

    /// Lowest octave notes may use.
    #[arg(long, default_value_t = 3)]
    octave_low: i8,

    /// Highest octave notes may use.
    #[arg(long, default_value_t = 7)]
    octave_high: i8,

    /// Length budget in 4/4 bars.
    #[arg(long, short = 'b', default_value_t = 32)]
    bars: u32,

    /// Random seed. Omit for a random seed each run.
    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Free-form mood label, recorded in the manifest but not used for
    /// sampling.
    #[arg(long)]
    mood: Option<String>,
}

#[derive(serde::Serialize)]
struct ManifestEntry {
    /// Written MIDI file, absent when this slot failed.
    file: Option<String>,
    error: Option<String>,
    tokens: usize,
    relaxed_steps: usize,
    retries: usize,
}

#[derive(serde::Serialize)]
struct Manifest {
    seed: u64,
    key: String,
    mood: Option<String>,
    /// Mode the model's training corpus was restricted to, if any.
    partition: Option<String>,
    outputs: Vec<ManifestEntry>,
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

    let key = if args.key.eq_ignore_ascii_case("input") {
        KeyChoice::SameAsInput
    } else {
        KeyChoice::Pitch(
            PitchClass::from_str(&args.key)
                .map_err(|e| anyhow::anyhow!("invalid --key: {e}"))?,
        )
    };

    let request = GenerationRequest {
        temperature: args.temperature,
        octave_low: args.octave_low,
        octave_high: args.octave_high,
        bars: args.bars,
        outputs: args.outputs,
        key,
        seed: args.seed,
        mood: args.mood.clone(),
    };
    request
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid request: {e}"))?;

    let input = std::fs::read(&args.input)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", args.input.display()))?;

    let pipeline = MelodyPipeline::load(&args.model_dir)
        .map_err(|e| anyhow::anyhow!("failed to load model: {e}"))?;
    if let Some(partition) = pipeline.config().partition {
        tracing::info!(%partition, "model was trained on a single-mode corpus");
    }

    let batch = pipeline
        .generate(&request, &input)
        .map_err(|e| anyhow::anyhow!("generation failed: {e}"))?;

    std::fs::create_dir_all(&args.output_dir)?;
    let mut entries = Vec::with_capacity(batch.outputs.len());
    let mut written = 0usize;
    for (index, slot) in batch.outputs.iter().enumerate() {
        match slot {
            Ok(output) => {
                let file = format!("output_{index}.mid");
                std::fs::write(args.output_dir.join(&file), &output.midi_bytes)?;
                written += 1;
                entries.push(ManifestEntry {
                    file: Some(file),
                    error: None,
                    tokens: output.tokens.len(),
                    relaxed_steps: output.relaxed_steps,
                    retries: output.retries,
                });
            }
            Err(e) => entries.push(ManifestEntry {
                file: None,
                error: Some(e.to_string()),
                tokens: 0,
                relaxed_steps: 0,
                retries: 0,
            }),
        }
    }

    let manifest = Manifest {
        seed: batch.seed,
        key: args.key.clone(),
        mood: args.mood,
        partition: pipeline.config().partition.map(|m| m.to_string()),
        outputs: entries,
    };
    std::fs::write(
        args.output_dir.join("manifest.json"),
        serde_json::to_string_pretty(&manifest)?,
    )?;

    println!(
        r#"{{"seed":{seed},"outputs":{count},"written":{written},"output_dir":"{dir}"}}"#,
        seed = batch.seed,
        count = batch.outputs.len(),
        dir = args.output_dir.display(),
    );

    Ok(())
}
