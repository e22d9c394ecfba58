//! Pitch classes, keys, and key detection.
//!
//! Pitch is always handled as (pitch class, octave), never as a bare MIDI
//! number, so octave constraints downstream never re-derive the octave.
//! Key detection uses Krumhansl–Schmuckler profile correlation over a
//! duration-weighted pitch-class histogram — deterministic, with ties broken
//! toward the lower tonic and toward major.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Semitones per octave.
pub const PITCHES_PER_OCTAVE: u8 = 12;

/// The twelve pitch classes, sharps only (flats normalize on parse).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum PitchClass {
    C = 0,
    Cs = 1,
    D = 2,
    Ds = 3,
    E = 4,
    F = 5,
    Fs = 6,
    G = 7,
    Gs = 8,
    A = 9,
    As = 10,
    B = 11,
}

impl PitchClass {
    pub const ALL: [PitchClass; 12] = [
        PitchClass::C,
        PitchClass::Cs,
        PitchClass::D,
        PitchClass::Ds,
        PitchClass::E,
        PitchClass::F,
        PitchClass::Fs,
        PitchClass::G,
        PitchClass::Gs,
        PitchClass::A,
        PitchClass::As,
        PitchClass::B,
    ];

    /// Pitch class from a semitone index (wraps mod 12).
    pub fn from_semitone(semitone: u8) -> PitchClass {
        Self::ALL[(semitone % PITCHES_PER_OCTAVE) as usize]
    }

    /// Semitone index within the octave, 0..=11.
    pub fn semitone(self) -> u8 {
        self as u8
    }

    /// Transpose by a (possibly negative) number of semitones, wrapping.
    pub fn transposed(self, semitones: i32) -> PitchClass {
        let s = (self as u8 as i32 + semitones).rem_euclid(12);
        Self::ALL[s as usize]
    }
}

impl fmt::Display for PitchClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 12] = [
            "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
        ];
        write!(f, "{}", NAMES[*self as u8 as usize])
    }
}

impl FromStr for PitchClass {
    type Err = Error;

    /// Accepts sharp and flat spellings ("C#", "Db", "D-").
    fn from_str(s: &str) -> Result<Self> {
        let pc = match s {
            "C" => PitchClass::C,
            "C#" | "Db" | "D-" => PitchClass::Cs,
            "D" => PitchClass::D,
            "D#" | "Eb" | "E-" => PitchClass::Ds,
            "E" => PitchClass::E,
            "F" => PitchClass::F,
            "F#" | "Gb" | "G-" => PitchClass::Fs,
            "G" => PitchClass::G,
            "G#" | "Ab" | "A-" => PitchClass::Gs,
            "A" => PitchClass::A,
            "A#" | "Bb" | "B-" => PitchClass::As,
            "B" => PitchClass::B,
            other => {
                return Err(Error::InvalidParameter(format!(
                    "unknown pitch class '{other}'"
                )))
            }
        };
        Ok(pc)
    }
}

/// Major/minor partition of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Major,
    Minor,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Major => write!(f, "major"),
            Mode::Minor => write!(f, "minor"),
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "major" => Ok(Mode::Major),
            "minor" => Ok(Mode::Minor),
            other => Err(Error::InvalidParameter(format!(
                "unknown partition '{other}' (expected 'major' or 'minor')"
            ))),
        }
    }
}

/// A key: tonic pitch class plus mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub tonic: PitchClass,
    pub mode: Mode,
}

/// Major scale degrees as semitone offsets from the tonic.
const MAJOR_DEGREES: [u8; 7] = [0, 2, 4, 5, 7, 9, 11];
/// Natural minor scale degrees.
const MINOR_DEGREES: [u8; 7] = [0, 2, 3, 5, 7, 8, 10];

impl Key {
    pub fn new(tonic: PitchClass, mode: Mode) -> Key {
        Key { tonic, mode }
    }

    /// True if the pitch class belongs to this key's scale.
    pub fn contains(&self, pc: PitchClass) -> bool {
        let rel = (pc.semitone() + 12 - self.tonic.semitone()) % 12;
        let degrees = match self.mode {
            Mode::Major => &MAJOR_DEGREES,
            Mode::Minor => &MINOR_DEGREES,
        };
        degrees.contains(&rel)
    }

    /// Semitone shift that moves this key's tonic to C, preferring the
    /// smaller move (tonic above F# shifts up, otherwise down).
    pub fn normalizing_shift(&self) -> i32 {
        let tonic = self.tonic.semitone() as i32;
        if tonic >= 6 {
            12 - tonic
        } else {
            -tonic
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.tonic, self.mode)
    }
}

// Krumhansl–Schmuckler key profiles (probe-tone ratings).
const MAJOR_PROFILE: [f64; 12] = [
    6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88,
];
const MINOR_PROFILE: [f64; 12] = [
    6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17,
];

/// Detect the key of a duration-weighted pitch-class histogram.
///
/// Correlates the histogram against all 24 rotated profiles and returns the
/// best match. An all-zero histogram defaults to C major (the original
/// backend's behavior when key analysis fails).
pub fn detect_key(histogram: &[f64; 12]) -> Key {
    let total: f64 = histogram.iter().sum();
    if total <= 0.0 {
        return Key::new(PitchClass::C, Mode::Major);
    }

    let mut best = Key::new(PitchClass::C, Mode::Major);
    let mut best_score = f64::NEG_INFINITY;

    // Iteration order fixes the tie-break: lower tonic first, major before
    // minor, and only strictly better scores replace the incumbent.
    for tonic in PitchClass::ALL {
        for (mode, profile) in [(Mode::Major, &MAJOR_PROFILE), (Mode::Minor, &MINOR_PROFILE)] {
            let score = correlation(histogram, profile, tonic.semitone());
            if score > best_score {
                best_score = score;
                best = Key::new(tonic, mode);
            }
        }
    }
    best
}

/// Pearson correlation between the histogram and the profile rotated so its
/// first entry lands on `tonic`.
fn correlation(histogram: &[f64; 12], profile: &[f64; 12], tonic: u8) -> f64 {
    let n = 12.0;
    let mean_h: f64 = histogram.iter().sum::<f64>() / n;
    let mean_p: f64 = profile.iter().sum::<f64>() / n;

    let mut num = 0.0;
    let mut den_h = 0.0;
    let mut den_p = 0.0;
    for pc in 0..12usize {
        let h = histogram[pc] - mean_h;
        let p = profile[(pc + 12 - tonic as usize) % 12] - mean_p;
        num += h * p;
        den_h += h * h;
        den_p += p * p;
    }
    if den_h == 0.0 || den_p == 0.0 {
        return f64::NEG_INFINITY;
    }
    num / (den_h * den_p).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pitch_class_round_trips_through_semitone() {
        for pc in PitchClass::ALL {
            assert_eq!(PitchClass::from_semitone(pc.semitone()), pc);
        }
    }

    #[test]
    fn flats_parse_to_sharp_equivalents() {
        assert_eq!("Db".parse::<PitchClass>().unwrap(), PitchClass::Cs);
        assert_eq!("E-".parse::<PitchClass>().unwrap(), PitchClass::Ds);
        assert_eq!("Bb".parse::<PitchClass>().unwrap(), PitchClass::As);
        assert!("H".parse::<PitchClass>().is_err());
    }

    #[test]
    fn transpose_wraps_both_directions() {
        assert_eq!(PitchClass::B.transposed(1), PitchClass::C);
        assert_eq!(PitchClass::C.transposed(-1), PitchClass::B);
        assert_eq!(PitchClass::E.transposed(12), PitchClass::E);
    }

    #[test]
    fn c_major_scale_membership() {
        let key = Key::new(PitchClass::C, Mode::Major);
        for pc in [
            PitchClass::C,
            PitchClass::D,
            PitchClass::E,
            PitchClass::F,
            PitchClass::G,
            PitchClass::A,
            PitchClass::B,
        ] {
            assert!(key.contains(pc), "{pc} should be in C major");
        }
        assert!(!key.contains(PitchClass::Cs));
        assert!(!key.contains(PitchClass::Fs));
    }

    #[test]
    fn a_minor_contains_natural_minor_degrees() {
        let key = Key::new(PitchClass::A, Mode::Minor);
        assert!(key.contains(PitchClass::A));
        assert!(key.contains(PitchClass::C));
        assert!(key.contains(PitchClass::E));
        assert!(!key.contains(PitchClass::Cs));
    }

    #[test]
    fn normalizing_shift_prefers_smaller_move() {
        // D (2) shifts down 2; A (9) shifts up 3.
        assert_eq!(Key::new(PitchClass::D, Mode::Major).normalizing_shift(), -2);
        assert_eq!(Key::new(PitchClass::A, Mode::Minor).normalizing_shift(), 3);
        assert_eq!(Key::new(PitchClass::C, Mode::Major).normalizing_shift(), 0);
    }

    #[test]
    fn detects_c_major_from_scale_histogram() {
        let mut hist = [0.0; 12];
        for deg in [0, 2, 4, 5, 7, 9, 11] {
            hist[deg] = 1.0;
        }
        hist[0] = 3.0; // emphasize the tonic
        hist[7] = 2.0; // and the dominant
        let key = detect_key(&hist);
        assert_eq!(key, Key::new(PitchClass::C, Mode::Major));
    }

    #[test]
    fn detects_a_minor_from_weighted_histogram() {
        let mut hist = [0.0; 12];
        for deg in [9, 11, 0, 2, 4, 5, 7] {
            hist[deg] = 1.0;
        }
        hist[9] = 3.0; // A
        hist[4] = 2.0; // E
        hist[0] = 1.5; // C
        let key = detect_key(&hist);
        assert_eq!(key.tonic, PitchClass::A);
        assert_eq!(key.mode, Mode::Minor);
    }

    #[test]
    fn empty_histogram_defaults_to_c_major() {
        assert_eq!(
            detect_key(&[0.0; 12]),
            Key::new(PitchClass::C, Mode::Major)
        );
    }
}
