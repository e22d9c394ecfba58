//! Constrained autoregressive sampling.
//!
//! The sampler walks the model one token at a time: temperature-scaled
//! softmax over the logits, constraint mask (key membership, octave range,
//! never pad/unk), then a multinomial draw by CDF walk. When the mask
//! removes all probability mass the step falls back to the unmasked argmax
//! and is counted as relaxed. Sampling terminates on the end token or when
//! the bar budget is spent; an end token before one full bar triggers a
//! bounded number of retries.

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::config::QUARTERS_PER_BAR;
use crate::encoding::Token;
use crate::model::MelodyModel;
use crate::theory::Key;
use crate::vocab::{Vocabulary, END_ID, PAD_ID, UNK_ID};
use crate::{Error, Result};

/// Accept a melody this short only after all retries are spent.
const MIN_QUARTERS: f64 = QUARTERS_PER_BAR;
/// Retries allowed when the model ends a melody before one full bar.
const MAX_RETRIES: usize = 3;

/// Which key the output should land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyChoice {
    /// Transpose the seed toward this tonic and constrain to its scale.
    Pitch(crate::theory::PitchClass),
    /// Stay in the key the input melody was in.
    SameAsInput,
}

/// A generation request. Fields are public; call [`validate`] before use.
///
/// `mood` is accepted for interface compatibility and carried through
/// untouched; it does not influence sampling.
///
/// [`validate`]: GenerationRequest::validate
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub temperature: f64,
    pub octave_low: i8,
    pub octave_high: i8,
    pub bars: u32,
    pub outputs: u32,
    pub key: KeyChoice,
    pub seed: Option<u64>,
    pub mood: Option<String>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        GenerationRequest {
            temperature: 0.9,
            octave_low: 3,
            octave_high: 7,
            bars: 32,
            outputs: 1,
            key: KeyChoice::SameAsInput,
            seed: None,
            mood: None,
        }
    }
}

impl GenerationRequest {
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature > 0.0) || !self.temperature.is_finite() {
            return Err(Error::InvalidParameter(format!(
                "temperature must be a positive finite number, got {}",
                self.temperature
            )));
        }
        if self.octave_low >= self.octave_high {
            return Err(Error::InvalidParameter(format!(
                "octave range must satisfy low < high, got {}..{}",
                self.octave_low, self.octave_high
            )));
        }
        if self.octave_low < crate::encoding::MIN_OCTAVE
            || self.octave_high > crate::encoding::MAX_OCTAVE
        {
            return Err(Error::InvalidParameter(format!(
                "octave range {}..{} leaves the representable range {}..{}",
                self.octave_low,
                self.octave_high,
                crate::encoding::MIN_OCTAVE,
                crate::encoding::MAX_OCTAVE
            )));
        }
        if self.bars == 0 {
            return Err(Error::InvalidParameter("bars must be >= 1".into()));
        }
        if self.outputs == 0 {
            return Err(Error::InvalidParameter("outputs must be >= 1".into()));
        }
        Ok(())
    }
}

/// Musical constraints applied to every sampled token. `key` is `None` when
/// the output stays in the input's own key, in which case only the octave
/// range filters pitched tokens.
#[derive(Debug, Clone, Copy)]
pub struct Constraint {
    pub key: Option<Key>,
    pub octave_low: i8,
    pub octave_high: i8,
}

impl Constraint {
    fn allows(&self, token: &Token) -> bool {
        match token {
            Token::Note {
                pitch_class, octave, ..
            } => {
                self.key.map_or(true, |key| key.contains(*pitch_class))
                    && *octave >= self.octave_low
                    && *octave <= self.octave_high
            }
            Token::Rest { .. } | Token::Bar | Token::End => true,
        }
    }
}

/// Seam for the sampler so tests can supply fixed distributions.
pub trait NextToken {
    fn next_logits(&self, context: &[u32]) -> Result<Vec<f32>>;
}

impl NextToken for MelodyModel {
    fn next_logits(&self, context: &[u32]) -> Result<Vec<f32>> {
        self.predict_next(context)
    }
}

/// One sampled melody with its bookkeeping.
#[derive(Debug, Clone)]
pub struct SampleOutcome {
    /// Generated tokens, not including the seed context. Ends with
    /// [`Token::End`] when the model terminated the melody itself.
    pub tokens: Vec<Token>,
    /// Steps where the constraint mask had to be relaxed to argmax.
    pub relaxed_steps: usize,
    /// Restarts taken because the melody ended before one bar.
    pub retries: usize,
}

/// Sampling proceeds as an explicit state machine so the retry/termination
/// policy is testable on its own: `Seeding` installs the context, `Sampling`
/// draws from the masked distribution, `ConstrainedFallback` resolves a step
/// where the mask removed all mass, and `Terminated` records whether the
/// model ended the melody itself or ran out of budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Seeding,
    Sampling,
    ConstrainedFallback,
    Terminated { natural: bool },
}

pub struct Sampler<'a, M: NextToken> {
    model: &'a M,
    vocab: &'a Vocabulary,
}

impl<'a, M: NextToken> Sampler<'a, M> {
    pub fn new(model: &'a M, vocab: &'a Vocabulary) -> Self {
        Sampler { model, vocab }
    }

    /// Sample one melody continuing `seed_ids`, retrying a bounded number of
    /// times if the model stops before a full bar.
    pub fn sample(
        &self,
        seed_ids: &[u32],
        constraint: &Constraint,
        bars: u32,
        temperature: f64,
        rng: &mut ChaCha8Rng,
    ) -> Result<SampleOutcome> {
        let budget = f64::from(bars) * QUARTERS_PER_BAR;
        let mut retries = 0;
        loop {
            let (tokens, relaxed_steps, quarters, natural) =
                self.sample_once(seed_ids, constraint, budget, temperature, rng)?;
            if natural && quarters < MIN_QUARTERS && retries < MAX_RETRIES {
                retries += 1;
                tracing::debug!(quarters, retries, "melody ended early, retrying");
                continue;
            }
            return Ok(SampleOutcome {
                tokens,
                relaxed_steps,
                retries,
            });
        }
    }

    fn sample_once(
        &self,
        seed_ids: &[u32],
        constraint: &Constraint,
        budget: f64,
        temperature: f64,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Vec<Token>, usize, f64, bool)> {
        let mut context = Vec::new();
        let mut tokens = Vec::new();
        let mut relaxed_steps = 0;
        let mut quarters = 0.0;
        let mut state = State::Seeding;

        // Hard cap on steps so a model stuck on bar tokens cannot spin.
        let max_steps = (budget / crate::config::SIXTEENTH) as usize * 2 + 64;
        let mut steps = 0usize;

        loop {
            state = match state {
                State::Seeding => {
                    context.extend_from_slice(seed_ids);
                    State::Sampling
                }
                State::Sampling => {
                    if steps >= max_steps {
                        State::Terminated { natural: false }
                    } else {
                        steps += 1;
                        let logits = self.model.next_logits(&context)?;
                        if logits.len() != self.vocab.len() {
                            return Err(Error::CorruptMapping(format!(
                                "model emits {} logits but vocabulary holds {} tokens",
                                logits.len(),
                                self.vocab.len()
                            )));
                        }
                        let probs = softmax_with_temperature(&logits, temperature);
                        match self.draw(&probs, constraint, rng)? {
                            Draw::Sampled(id) => {
                                self.accept(id, &mut context, &mut tokens, &mut quarters)?
                            }
                            Draw::Exhausted => State::ConstrainedFallback,
                        }
                    }
                }
                State::ConstrainedFallback => {
                    // Re-derive the unmasked distribution and take its best
                    // token; recorded, never an error.
                    let logits = self.model.next_logits(&context)?;
                    let probs = softmax_with_temperature(&logits, temperature);
                    let id = argmax_fallback(&probs)?;
                    relaxed_steps += 1;
                    self.accept(id, &mut context, &mut tokens, &mut quarters)?
                }
                State::Terminated { natural } => {
                    return Ok((tokens, relaxed_steps, quarters, natural));
                }
            };
            if !matches!(state, State::Terminated { .. }) && quarters >= budget {
                state = State::Terminated { natural: false };
            }
        }
    }

    /// Record a drawn id: push the token, advance the timeline, and pick the
    /// next state.
    fn accept(
        &self,
        id: u32,
        context: &mut Vec<u32>,
        tokens: &mut Vec<Token>,
        quarters: &mut f64,
    ) -> Result<State> {
        context.push(id);
        if id == END_ID {
            tokens.push(Token::End);
            return Ok(State::Terminated { natural: true });
        }
        let token = self
            .vocab
            .token_of(id)
            .ok_or_else(|| Error::CorruptMapping(format!("sampled id {id} has no token")))?;
        *quarters += token.advance();
        tokens.push(token);
        Ok(State::Sampling)
    }

    /// One constrained multinomial draw, or `Exhausted` when the mask left
    /// no probability mass.
    fn draw(
        &self,
        probs: &[f32],
        constraint: &Constraint,
        rng: &mut ChaCha8Rng,
    ) -> Result<Draw> {
        let admissible = |id: u32| -> bool {
            if id == PAD_ID || id == UNK_ID {
                return false;
            }
            if id == END_ID {
                return true;
            }
            self.vocab
                .token_of(id)
                .map(|t| constraint.allows(&t))
                .unwrap_or(false)
        };

        let masked_total: f32 = probs
            .iter()
            .enumerate()
            .filter(|(id, _)| admissible(*id as u32))
            .map(|(_, p)| *p)
            .sum();
        if masked_total <= f32::EPSILON {
            return Ok(Draw::Exhausted);
        }

        let draw = rng.gen_range(0.0..masked_total);
        let mut cumulative = 0.0f32;
        for (id, p) in probs.iter().enumerate() {
            if !admissible(id as u32) {
                continue;
            }
            cumulative += p;
            if draw < cumulative {
                return Ok(Draw::Sampled(id as u32));
            }
        }
        // Float accumulation can land just past the total.
        let last = probs
            .iter()
            .enumerate()
            .rev()
            .find(|(id, _)| admissible(*id as u32))
            .map(|(id, _)| id as u32)
            .ok_or_else(|| Error::CorruptMapping("empty probability vector".into()))?;
        Ok(Draw::Sampled(last))
    }
}

/// Outcome of one masked draw.
enum Draw {
    Sampled(u32),
    Exhausted,
}

/// Best unmasked token, pad/unk still excluded.
fn argmax_fallback(probs: &[f32]) -> Result<u32> {
    probs
        .iter()
        .enumerate()
        .filter(|(id, _)| *id as u32 != PAD_ID && *id as u32 != UNK_ID)
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(id, _)| id as u32)
        .ok_or_else(|| Error::CorruptMapping("empty probability vector".into()))
}

/// Softmax of `logits / temperature`, computed against the max for stability.
fn softmax_with_temperature(logits: &[f32], temperature: f64) -> Vec<f32> {
    let t = temperature as f32;
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| ((l - max) / t).exp()).collect();
    let total: f32 = exps.iter().sum();
    if total <= 0.0 {
        return vec![1.0 / logits.len() as f32; logits.len()];
    }
    exps.iter().map(|e| e / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Sixteenths;
    use crate::theory::{Mode, PitchClass};
    use rand::SeedableRng;

    /// Fixed-distribution model for exercising the sampler alone.
    struct StubModel {
        logits: Vec<f32>,
    }

    impl NextToken for StubModel {
        fn next_logits(&self, _context: &[u32]) -> Result<Vec<f32>> {
            Ok(self.logits.clone())
        }
    }

    fn note(pitch_class: PitchClass, octave: i8, sixteenths: u8) -> Token {
        Token::Note {
            pitch_class,
            octave,
            duration: Sixteenths::new(sixteenths).unwrap(),
        }
    }

    fn c_major_constraint() -> Constraint {
        Constraint {
            key: Some(Key {
                tonic: PitchClass::C,
                mode: Mode::Major,
            }),
            octave_low: 3,
            octave_high: 7,
        }
    }

    fn vocab_with(tokens: &[Token]) -> Vocabulary {
        let mut vocab = Vocabulary::new();
        for t in tokens {
            vocab.intern(*t);
        }
        vocab
    }

    #[test]
    fn request_validation_rejects_bad_parameters() {
        let ok = GenerationRequest::default();
        ok.validate().unwrap();

        let mut bad = GenerationRequest::default();
        bad.temperature = 0.0;
        assert!(bad.validate().is_err());

        let mut bad = GenerationRequest::default();
        bad.octave_low = 5;
        bad.octave_high = 5;
        assert!(bad.validate().is_err());

        let mut bad = GenerationRequest::default();
        bad.bars = 0;
        assert!(bad.validate().is_err());

        let mut bad = GenerationRequest::default();
        bad.outputs = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn in_key_tokens_are_sampled_without_relaxation() {
        // Whole-note C: four steps fill a one-bar budget exactly.
        let vocab = vocab_with(&[note(PitchClass::C, 4, 16)]);
        let mut logits = vec![-30.0f32; vocab.len()];
        logits[3] = 10.0;
        let model = StubModel { logits };
        let sampler = Sampler::new(&model, &vocab);
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        let outcome = sampler
            .sample(&[3], &c_major_constraint(), 1, 0.9, &mut rng)
            .unwrap();
        assert_eq!(outcome.relaxed_steps, 0);
        assert_eq!(outcome.tokens.len(), 1);
        assert_eq!(outcome.tokens[0], note(PitchClass::C, 4, 16));
    }

    #[test]
    fn no_key_constraint_admits_every_pitch_class() {
        // Without a key the only pitched filter is the octave range, so a
        // vocabulary made entirely of chromatic notes samples cleanly.
        let fsharp = note(PitchClass::Fs, 4, 16);
        let vocab = vocab_with(&[fsharp.clone()]);
        let mut logits = vec![-30.0f32; vocab.len()];
        logits[3] = 10.0;
        let model = StubModel { logits };
        let sampler = Sampler::new(&model, &vocab);
        let constraint = Constraint {
            key: None,
            octave_low: 3,
            octave_high: 7,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        let outcome = sampler
            .sample(&[3], &constraint, 1, 0.9, &mut rng)
            .unwrap();
        assert_eq!(outcome.relaxed_steps, 0);
        assert_eq!(outcome.tokens[0], fsharp);
    }

    #[test]
    fn exhausted_mask_falls_back_to_argmax() {
        // Only out-of-key/out-of-range notes carry mass; END is suppressed so
        // the admissible set still contains END but with ~zero probability,
        // forcing quick termination after relaxed picks of F#.
        let fsharp = note(PitchClass::Fs, 8, 4);
        let vocab = vocab_with(&[fsharp.clone()]);
        let mut logits = vec![-60.0f32; vocab.len()];
        logits[3] = 20.0;
        let model = StubModel { logits };
        let sampler = Sampler::new(&model, &vocab);
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        let outcome = sampler
            .sample(&[3], &c_major_constraint(), 1, 0.9, &mut rng)
            .unwrap();
        assert!(outcome.relaxed_steps > 0);
        assert!(outcome.tokens.contains(&fsharp));
    }

    #[test]
    fn pad_and_unk_are_never_sampled() {
        // All mass on pad/unk; fallback must still avoid them.
        let vocab = vocab_with(&[note(PitchClass::E, 4, 16)]);
        let mut logits = vec![-60.0f32; vocab.len()];
        logits[PAD_ID as usize] = 20.0;
        logits[UNK_ID as usize] = 19.0;
        logits[3] = 5.0;
        let model = StubModel { logits };
        let sampler = Sampler::new(&model, &vocab);
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let outcome = sampler
            .sample(&[3], &c_major_constraint(), 1, 0.9, &mut rng)
            .unwrap();
        assert!(outcome
            .tokens
            .iter()
            .all(|t| *t == note(PitchClass::E, 4, 16) || *t == Token::End));
    }

    #[test]
    fn early_end_is_retried_then_accepted() {
        // The model always emits END immediately; after the retry budget the
        // short melody is accepted as-is.
        let vocab = vocab_with(&[note(PitchClass::C, 4, 4)]);
        let mut logits = vec![-60.0f32; vocab.len()];
        logits[END_ID as usize] = 20.0;
        let model = StubModel { logits };
        let sampler = Sampler::new(&model, &vocab);
        let mut rng = ChaCha8Rng::seed_from_u64(9);

        let outcome = sampler
            .sample(&[3], &c_major_constraint(), 4, 0.9, &mut rng)
            .unwrap();
        assert_eq!(outcome.retries, MAX_RETRIES);
        assert_eq!(outcome.tokens.last(), Some(&Token::End));
    }

    #[test]
    fn identical_seeds_give_identical_outcomes() {
        let vocab = vocab_with(&[
            note(PitchClass::C, 4, 4),
            note(PitchClass::E, 4, 4),
            note(PitchClass::G, 4, 4),
            Token::Rest {
                duration: Sixteenths::new(4).unwrap(),
            },
        ]);
        let logits = vec![1.0f32; vocab.len()];
        let model = StubModel { logits };
        let sampler = Sampler::new(&model, &vocab);

        let mut rng_a = ChaCha8Rng::seed_from_u64(42);
        let mut rng_b = ChaCha8Rng::seed_from_u64(42);
        let a = sampler
            .sample(&[3], &c_major_constraint(), 2, 0.9, &mut rng_a)
            .unwrap();
        let b = sampler
            .sample(&[3], &c_major_constraint(), 2, 0.9, &mut rng_b)
            .unwrap();
        assert_eq!(a.tokens, b.tokens);
        assert_eq!(a.relaxed_steps, b.relaxed_steps);
    }

    #[test]
    fn budget_terminates_without_end_token() {
        let vocab = vocab_with(&[note(PitchClass::G, 5, 8)]);
        let mut logits = vec![-60.0f32; vocab.len()];
        logits[3] = 20.0;
        let model = StubModel { logits };
        let sampler = Sampler::new(&model, &vocab);
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        let outcome = sampler
            .sample(&[3], &c_major_constraint(), 2, 0.9, &mut rng)
            .unwrap();
        // 8 sixteenths = 2 quarters per token, 2 bars = 8 quarters → 4 tokens.
        assert_eq!(outcome.tokens.len(), 4);
        assert_ne!(outcome.tokens.last(), Some(&Token::End));
    }
}
