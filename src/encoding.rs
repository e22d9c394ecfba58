//! Symbolic token model and the note-event ↔ token codec.
//!
//! A melody becomes a flat sequence of tokens:
//!
//! - `Note` — pitch class + octave + bucketed duration
//! - `Rest` — bucketed silent gap
//! - `Bar`  — bar-boundary marker (structural, ignored on decode)
//! - `End`  — end of sequence
//!
//! Durations live on the sixteenth-note grid: a bucket is a count of
//! sixteenths, 1..=32 (up to [`LONGEST_DURATION`] quarters). The same bucket
//! boundaries drive encode and decode, so the codec round-trips pitch class,
//! octave, and duration bucket exactly. Tempo, instrument, and dynamics are
//! not modeled.
//!
//! Tokens have a compact string form (`N:F#4:6`, `R:2`, `BAR`, `END`) used
//! by the persisted vocabulary file.

use std::fmt;
use std::str::FromStr;

use crate::config::{EncoderConfig, LONGEST_DURATION, QUARTERS_PER_BAR, SIXTEENTH};
use crate::midi::NoteEvent;
use crate::theory::PitchClass;
use crate::{Error, Result};

/// Lowest octave a pitched token may carry (MIDI key 0 is C-1).
pub const MIN_OCTAVE: i8 = -1;
/// Highest octave a pitched token may carry.
pub const MAX_OCTAVE: i8 = 9;

/// A duration expressed in sixteenth notes, 1..=32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sixteenths(u8);

impl Sixteenths {
    pub const MAX: Sixteenths = Sixteenths((LONGEST_DURATION / SIXTEENTH) as u8);

    pub fn new(count: u8) -> Result<Sixteenths> {
        if count == 0 || count > Self::MAX.0 {
            return Err(Error::MalformedInput(format!(
                "duration bucket {count} outside 1..={}",
                Self::MAX.0
            )));
        }
        Ok(Sixteenths(count))
    }

    /// Bucket a quarter-length duration. Rejects non-positive, over-long, or
    /// off-grid values instead of clamping.
    pub fn from_quarters(quarters: f64) -> Result<Sixteenths> {
        if quarters <= 0.0 {
            return Err(Error::MalformedInput(format!(
                "non-positive duration {quarters}"
            )));
        }
        let count = quarters / SIXTEENTH;
        if (count - count.round()).abs() > 1e-6 {
            return Err(Error::MalformedInput(format!(
                "duration {quarters} is off the sixteenth grid"
            )));
        }
        Self::new(count.round() as u8)
    }

    pub fn quarters(self) -> f64 {
        self.0 as f64 * SIXTEENTH
    }

    pub fn count(self) -> u8 {
        self.0
    }
}

/// One symbolic token. Immutable value; ordering and hashing let tokens key
/// the vocabulary maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Token {
    Note {
        pitch_class: PitchClass,
        octave: i8,
        duration: Sixteenths,
    },
    Rest {
        duration: Sixteenths,
    },
    Bar,
    End,
}

impl Token {
    /// Quarter-lengths this token advances the timeline by.
    pub fn advance(&self) -> f64 {
        match self {
            Token::Note { duration, .. } | Token::Rest { duration } => duration.quarters(),
            Token::Bar | Token::End => 0.0,
        }
    }

    /// Transpose a pitched token by semitones; other tokens pass through.
    /// Errors if the result leaves the representable octave range.
    pub fn transposed(&self, semitones: i32) -> Result<Token> {
        match self {
            Token::Note {
                pitch_class,
                octave,
                duration,
            } => {
                let abs =
                    (*octave as i32 + 1) * 12 + pitch_class.semitone() as i32 + semitones;
                let octave = (abs.div_euclid(12) - 1) as i8;
                if !(MIN_OCTAVE..=MAX_OCTAVE).contains(&octave) {
                    return Err(Error::MalformedInput(format!(
                        "transposition by {semitones} leaves the octave range"
                    )));
                }
                Ok(Token::Note {
                    pitch_class: PitchClass::from_semitone(abs.rem_euclid(12) as u8),
                    octave,
                    duration: *duration,
                })
            }
            other => Ok(*other),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Note {
                pitch_class,
                octave,
                duration,
            } => write!(f, "N:{pitch_class}{octave}:{}", duration.count()),
            Token::Rest { duration } => write!(f, "R:{}", duration.count()),
            Token::Bar => write!(f, "BAR"),
            Token::End => write!(f, "END"),
        }
    }
}

impl FromStr for Token {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::CorruptMapping(format!("unrecognized token '{s}'"));
        match s {
            "BAR" => return Ok(Token::Bar),
            "END" => return Ok(Token::End),
            _ => {}
        }
        let mut parts = s.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("R"), Some(count), None, None) => {
                let count: u8 = count.parse().map_err(|_| bad())?;
                Ok(Token::Rest {
                    duration: Sixteenths::new(count)
                        .map_err(|_| bad())?,
                })
            }
            (Some("N"), Some(pitch), Some(count), None) => {
                // pitch is e.g. "C#4" or "A-1": pitch class then octave.
                let split = pitch
                    .char_indices()
                    .find(|(i, c)| {
                        (*c == '-' || c.is_ascii_digit()) && *i > 0
                    })
                    .map(|(i, _)| i)
                    .ok_or_else(bad)?;
                let pitch_class: PitchClass = pitch[..split].parse().map_err(|_| bad())?;
                let octave: i8 = pitch[split..].parse().map_err(|_| bad())?;
                if !(MIN_OCTAVE..=MAX_OCTAVE).contains(&octave) {
                    return Err(bad());
                }
                let count: u8 = count.parse().map_err(|_| bad())?;
                Ok(Token::Note {
                    pitch_class,
                    octave,
                    duration: Sixteenths::new(count).map_err(|_| bad())?,
                })
            }
            _ => Err(bad()),
        }
    }
}

/// Encode cleaned note events as tokens.
///
/// Events must be sorted, non-overlapping, and on the sixteenth grid (the
/// cleaner's output contract); anything else is `MalformedInput`. Gaps
/// between notes become `Rest` tokens, chunked at [`Sixteenths::MAX`]. Bar
/// markers are interleaved whenever the timeline crosses a bar boundary, and
/// the sequence always closes with `End`.
pub fn encode(events: &[NoteEvent], config: &EncoderConfig) -> Result<Vec<Token>> {
    let mut tokens = Vec::with_capacity(events.len() * 2 + 1);
    let mut cursor = 0.0f64;
    let mut next_bar = QUARTERS_PER_BAR;

    let emit_bars = |cursor: f64, tokens: &mut Vec<Token>, next_bar: &mut f64| {
        if config.bar_tokens {
            while *next_bar <= cursor + 1e-9 {
                tokens.push(Token::Bar);
                *next_bar += QUARTERS_PER_BAR;
            }
        }
    };

    for event in events {
        if !(MIN_OCTAVE..=MAX_OCTAVE).contains(&event.octave) {
            return Err(Error::MalformedInput(format!(
                "octave {} outside {MIN_OCTAVE}..={MAX_OCTAVE}",
                event.octave
            )));
        }
        if event.onset < cursor - 1e-9 {
            return Err(Error::MalformedInput(format!(
                "overlapping note at onset {}",
                event.onset
            )));
        }

        // Fill the gap to this onset with rests.
        let gap_quarters = (event.onset - cursor).max(0.0);
        let gap_exact = gap_quarters / SIXTEENTH;
        if (gap_exact - gap_exact.round()).abs() > 1e-6 {
            return Err(Error::MalformedInput(format!(
                "gap of {gap_quarters} quarters is off the sixteenth grid"
            )));
        }
        let mut gap = gap_exact.round() as u32;
        while gap > 0 {
            emit_bars(cursor, &mut tokens, &mut next_bar);
            let chunk = gap.min(Sixteenths::MAX.count() as u32);
            tokens.push(Token::Rest {
                duration: Sixteenths::new(chunk as u8)?,
            });
            cursor += chunk as f64 * SIXTEENTH;
            gap -= chunk;
        }

        emit_bars(cursor, &mut tokens, &mut next_bar);
        tokens.push(Token::Note {
            pitch_class: event.pitch_class,
            octave: event.octave,
            duration: Sixteenths::from_quarters(event.duration)?,
        });
        cursor = event.onset + event.duration;
    }

    emit_bars(cursor, &mut tokens, &mut next_bar);
    tokens.push(Token::End);
    Ok(tokens)
}

/// Decode tokens back into note events. `Bar` markers are skipped, `End`
/// stops decoding, and the timeline is rebuilt from the duration buckets.
pub fn decode(tokens: &[Token]) -> Vec<NoteEvent> {
    let mut events = Vec::new();
    let mut cursor = 0.0f64;
    for token in tokens {
        match token {
            Token::Note {
                pitch_class,
                octave,
                duration,
            } => {
                events.push(NoteEvent {
                    pitch_class: *pitch_class,
                    octave: *octave,
                    onset: cursor,
                    duration: duration.quarters(),
                });
                cursor += duration.quarters();
            }
            Token::Rest { duration } => cursor += duration.quarters(),
            Token::Bar => {}
            Token::End => break,
        }
    }
    events
}
