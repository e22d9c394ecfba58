//! MIDI reading, cleaning, and writing.
//!
//! Timing is carried in quarter-lengths (ticks / ticks-per-quarter), so tempo
//! never enters the symbolic layer. Cleaning reduces a multi-track file to a
//! single monophonic melody on the sixteenth grid with its key normalized to
//! a C tonic:
//!
//! 1. pick the most melodic track (note count scaled down by how chordal it is)
//! 2. quantize onsets/durations to sixteenths
//! 3. keep the top note of simultaneous onsets, clamp overlaps away
//! 4. detect the key and transpose the tonic to C, remembering the shift
//!
//! Uses the `midly` crate for SMF parsing and writing.

use midly::{
    num::{u15, u24, u28, u4, u7},
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, Track, TrackEvent, TrackEventKind,
};
use serde::{Deserialize, Serialize};

use crate::config::{EncoderConfig, LONGEST_DURATION, SIXTEENTH};
use crate::theory::{detect_key, Key, PitchClass, PITCHES_PER_OCTAVE};
use crate::{Error, Result};

/// Ticks per quarter note in written output.
const TICKS_PER_QUARTER: u16 = 480;

/// Tempo meta event for written output (120 BPM).
const TEMPO_MICROS: u32 = 500_000;

/// One pitched note event. Pitch is (class, octave), octave per the MIDI
/// convention where C4 = key 60 (octaves -1..=9).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    pub pitch_class: PitchClass,
    pub octave: i8,
    /// Onset in quarter-lengths from the start of the track.
    pub onset: f64,
    /// Duration in quarter-lengths.
    pub duration: f64,
}

impl NoteEvent {
    /// Build from a MIDI key number.
    pub fn from_key(key: u8, onset: f64, duration: f64) -> Result<NoteEvent> {
        if key > 127 {
            return Err(Error::MalformedInput(format!("midi key {key} out of range")));
        }
        if duration < 0.0 || onset < 0.0 {
            return Err(Error::MalformedInput(format!(
                "negative timing: onset {onset}, duration {duration}"
            )));
        }
        Ok(NoteEvent {
            pitch_class: PitchClass::from_semitone(key % PITCHES_PER_OCTAVE),
            octave: (key / PITCHES_PER_OCTAVE) as i8 - 1,
            onset,
            duration,
        })
    }

    /// MIDI key number, or an error if the octave puts it outside 0..=127.
    pub fn midi_key(&self) -> Result<u8> {
        let key = (self.octave as i32 + 1) * PITCHES_PER_OCTAVE as i32
            + self.pitch_class.semitone() as i32;
        if !(0..=127).contains(&key) {
            return Err(Error::MalformedInput(format!(
                "note {}{} outside the MIDI key range",
                self.pitch_class, self.octave
            )));
        }
        Ok(key as u8)
    }

    /// Transpose by semitones, carrying octave over pitch-class wraps.
    pub fn transposed(&self, semitones: i32) -> NoteEvent {
        let abs = (self.octave as i32 + 1) * 12 + self.pitch_class.semitone() as i32 + semitones;
        NoteEvent {
            pitch_class: PitchClass::from_semitone(abs.rem_euclid(12) as u8),
            octave: (abs.div_euclid(12) - 1) as i8,
            ..*self
        }
    }
}

/// A cleaned, key-normalized melody ready for encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedMelody {
    /// Monophonic, quantized, sorted by onset, transposed to a C tonic.
    pub events: Vec<NoteEvent>,
    /// Key detected before normalization.
    pub source_key: Key,
    /// Semitone shift that was applied to reach the C tonic.
    pub applied_shift: i32,
}

impl CleanedMelody {
    /// Total length in quarter-lengths (end of the last note).
    pub fn length_quarters(&self) -> f64 {
        self.events
            .iter()
            .map(|e| e.onset + e.duration)
            .fold(0.0, f64::max)
    }
}

/// Parse SMF bytes into per-track note events.
///
/// Note-on/note-off pairs are matched per key number; a note-on with zero
/// velocity counts as note-off. Notes still sounding at end-of-track are
/// closed there.
pub fn parse_tracks(bytes: &[u8]) -> Result<Vec<Vec<NoteEvent>>> {
    let smf = Smf::parse(bytes)?;

    let ticks_per_quarter = match smf.header.timing {
        Timing::Metrical(tpq) => tpq.as_int() as f64,
        Timing::Timecode(..) => {
            return Err(Error::MalformedInput(
                "SMPTE-timed MIDI is not supported".into(),
            ))
        }
    };

    let mut tracks = Vec::new();
    for track in &smf.tracks {
        let mut tick: u64 = 0;
        // key number -> onset tick of the currently sounding note
        let mut open: [Option<u64>; 128] = [None; 128];
        let mut events = Vec::new();

        for event in track {
            tick += u64::from(event.delta.as_int());
            if let TrackEventKind::Midi { message, .. } = event.kind {
                match message {
                    MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                        open[key.as_int() as usize] = Some(tick);
                    }
                    MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                        if let Some(onset_tick) = open[key.as_int() as usize].take() {
                            events.push(NoteEvent::from_key(
                                key.as_int(),
                                onset_tick as f64 / ticks_per_quarter,
                                (tick - onset_tick) as f64 / ticks_per_quarter,
                            )?);
                        }
                    }
                    _ => {}
                }
            }
        }
        // Close anything left sounding at the end of the track.
        for (key, onset_tick) in open.iter().enumerate() {
            if let Some(onset_tick) = onset_tick {
                events.push(NoteEvent::from_key(
                    key as u8,
                    *onset_tick as f64 / ticks_per_quarter,
                    (tick - onset_tick) as f64 / ticks_per_quarter,
                )?);
            }
        }

        events.sort_by(|a, b| a.onset.total_cmp(&b.onset));
        tracks.push(events);
    }

    Ok(tracks)
}

/// Pick the most melodic track: highest `note_count * (1 - chord_fraction)`,
/// where `chord_fraction` is the share of notes whose onset is shared with
/// another note in the same track. Ties break to the lowest track index.
pub fn select_melodic_track(tracks: &[Vec<NoteEvent>]) -> Result<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, events) in tracks.iter().enumerate() {
        if events.is_empty() {
            continue;
        }
        let chordal = events
            .iter()
            .enumerate()
            .filter(|(i, e)| {
                events
                    .iter()
                    .enumerate()
                    .any(|(j, other)| *i != j && (other.onset - e.onset).abs() < 1e-9)
            })
            .count();
        let chord_fraction = chordal as f64 / events.len() as f64;
        let score = events.len() as f64 * (1.0 - chord_fraction);
        // strictly-greater keeps the earliest track on ties
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((index, score));
        }
    }
    best.map(|(index, _)| index).ok_or_else(|| {
        Error::MalformedInput("no track contains any usable note".into())
    })
}

/// Snap a quarter-length value to the sixteenth grid.
fn quantized(value: f64) -> f64 {
    (value / SIXTEENTH).round() * SIXTEENTH
}

/// Clean one track into a monophonic quantized melody, then normalize its
/// key to a C tonic.
pub fn clean_melody(events: &[NoteEvent], config: &EncoderConfig) -> Result<CleanedMelody> {
    if events.is_empty() {
        return Err(Error::MalformedInput("empty melodic track".into()));
    }

    let mut notes: Vec<NoteEvent> = events
        .iter()
        .map(|e| {
            let mut e = *e;
            if config.quantize {
                e.onset = quantized(e.onset);
                e.duration = quantized(e.duration).max(SIXTEENTH);
            }
            e.duration = e.duration.min(LONGEST_DURATION);
            e
        })
        .collect();

    // Top note of each onset wins; stable order for equal pitches.
    notes.sort_by(|a, b| {
        a.onset
            .total_cmp(&b.onset)
            .then(b.midi_key().unwrap_or(0).cmp(&a.midi_key().unwrap_or(0)))
    });
    notes.dedup_by(|next, kept| (next.onset - kept.onset).abs() < 1e-9);

    // Clamp durations so consecutive notes never overlap.
    for i in 0..notes.len().saturating_sub(1) {
        let gap = notes[i + 1].onset - notes[i].onset;
        if notes[i].duration > gap {
            notes[i].duration = gap;
        }
    }
    notes.retain(|e| e.duration >= SIXTEENTH - 1e-9);
    if notes.is_empty() {
        return Err(Error::MalformedInput(
            "no notes survive quantization".into(),
        ));
    }

    let source_key = detect_key(&pitch_histogram(&notes));
    let applied_shift = source_key.normalizing_shift();
    let events = notes
        .iter()
        .map(|e| e.transposed(applied_shift))
        .collect();

    Ok(CleanedMelody {
        events,
        source_key,
        applied_shift,
    })
}

/// Duration-weighted pitch-class histogram.
pub fn pitch_histogram(events: &[NoteEvent]) -> [f64; 12] {
    let mut histogram = [0.0; 12];
    for e in events {
        histogram[e.pitch_class.semitone() as usize] += e.duration;
    }
    histogram
}

/// Clamp notes to a total length in quarter-lengths: notes starting past the
/// limit are dropped, notes crossing it are shortened.
pub fn trim_to_length(events: &[NoteEvent], quarters: f64) -> Vec<NoteEvent> {
    events
        .iter()
        .filter(|e| e.onset < quarters)
        .map(|e| {
            let mut e = *e;
            if e.onset + e.duration > quarters {
                e.duration = quarters - e.onset;
            }
            e
        })
        .collect()
}

/// Render events to SMF bytes: format-0, one track, fixed 120 BPM tempo.
pub fn write_smf(events: &[NoteEvent]) -> Result<Vec<u8>> {
    let mut smf = Smf::new(Header::new(
        Format::SingleTrack,
        Timing::Metrical(u15::new(TICKS_PER_QUARTER)),
    ));

    let mut track: Track<'static> = Vec::new();
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(TEMPO_MICROS))),
    });

    // (tick, on?, key) — offs sort before ons at the same tick so repeated
    // pitches re-attack instead of merging.
    let mut moments: Vec<(u32, bool, u8)> = Vec::with_capacity(events.len() * 2);
    for e in events {
        let key = e.midi_key()?;
        let on_tick = (e.onset * TICKS_PER_QUARTER as f64).round() as u32;
        let off_tick = ((e.onset + e.duration) * TICKS_PER_QUARTER as f64).round() as u32;
        moments.push((on_tick, true, key));
        moments.push((off_tick, false, key));
    }
    moments.sort_by_key(|&(tick, on, key)| (tick, on, key));

    let mut last_tick = 0u32;
    for (tick, on, key) in moments {
        let message = if on {
            MidiMessage::NoteOn {
                key: u7::new(key),
                vel: u7::new(80),
            }
        } else {
            MidiMessage::NoteOff {
                key: u7::new(key),
                vel: u7::new(0),
            }
        };
        track.push(TrackEvent {
            delta: u28::new(tick - last_tick),
            kind: TrackEventKind::Midi {
                channel: u4::new(0),
                message,
            },
        });
        last_tick = tick;
    }

    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
    smf.tracks.push(track);

    let mut buf = Vec::new();
    smf.write(&mut buf)
        .map_err(|e| Error::MalformedInput(format!("midi write: {e}")))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::theory::Mode;

    fn note(key: u8, onset: f64, duration: f64) -> NoteEvent {
        NoteEvent::from_key(key, onset, duration).unwrap()
    }

    #[test]
    fn key_number_round_trip() {
        for key in [0u8, 59, 60, 61, 127] {
            let e = note(key, 0.0, 1.0);
            assert_eq!(e.midi_key().unwrap(), key);
        }
        // C4 = 60
        let c4 = note(60, 0.0, 1.0);
        assert_eq!(c4.pitch_class, PitchClass::C);
        assert_eq!(c4.octave, 4);
    }

    #[test]
    fn from_key_rejects_negative_duration() {
        assert!(matches!(
            NoteEvent::from_key(60, 0.0, -1.0),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn transpose_carries_octave() {
        let b3 = note(59, 0.0, 1.0);
        let up = b3.transposed(1);
        assert_eq!(up.pitch_class, PitchClass::C);
        assert_eq!(up.octave, 4);
        let down = up.transposed(-1);
        assert_eq!(down, b3);
    }

    #[test]
    fn melodic_track_prefers_dense_monophonic_line() {
        let melody: Vec<NoteEvent> = (0..16).map(|i| note(60 + i, i as f64 * 0.5, 0.5)).collect();
        // Chordal accompaniment: many notes but all stacked.
        let chords: Vec<NoteEvent> = (0..8)
            .flat_map(|i| {
                let t = i as f64;
                [note(48, t, 1.0), note(52, t, 1.0), note(55, t, 1.0)]
            })
            .collect();
        let tracks = vec![vec![], chords, melody];
        assert_eq!(select_melodic_track(&tracks).unwrap(), 2);
    }

    #[test]
    fn melodic_track_ties_break_low_index() {
        let a: Vec<NoteEvent> = (0..4).map(|i| note(60, i as f64, 1.0)).collect();
        let b = a.clone();
        assert_eq!(select_melodic_track(&[a, b].to_vec()).unwrap(), 0);
    }

    #[test]
    fn clean_quantizes_and_removes_overlap() {
        let raw = vec![
            note(60, 0.01, 0.98),  // ~C4 quarter
            note(64, 0.52, 2.0),   // overlaps previous and next
            note(67, 1.0, 0.26),
        ];
        let cleaned = clean_melody(&raw, &EncoderConfig::default()).unwrap();
        for pair in cleaned.events.windows(2) {
            assert!(
                pair[0].onset + pair[0].duration <= pair[1].onset + 1e-9,
                "overlap after cleaning: {pair:?}"
            );
        }
        for e in &cleaned.events {
            assert!(((e.onset / SIXTEENTH).round() * SIXTEENTH - e.onset).abs() < 1e-9);
        }
    }

    #[test]
    fn clean_keeps_top_note_of_chord() {
        let raw = vec![note(60, 0.0, 1.0), note(64, 0.0, 1.0), note(67, 0.0, 1.0)];
        let cleaned = clean_melody(&raw, &EncoderConfig::default()).unwrap();
        assert_eq!(cleaned.events.len(), 1);
        // G major chord detects as G-rooted, so compare in source pitch space.
        let restored = cleaned.events[0].transposed(-cleaned.applied_shift);
        assert_eq!(restored.pitch_class, PitchClass::G);
    }

    #[test]
    fn clean_normalizes_tonic_to_c() {
        // D major scale run → detected D major → shifted down to C.
        let raw: Vec<NoteEvent> = [62u8, 64, 66, 67, 69, 71, 73, 74]
            .iter()
            .enumerate()
            .map(|(i, &k)| note(k, i as f64 * 0.5, 0.5))
            .collect();
        let cleaned = clean_melody(&raw, &EncoderConfig::default()).unwrap();
        assert_eq!(cleaned.source_key.tonic, PitchClass::D);
        assert_eq!(cleaned.source_key.mode, Mode::Major);
        assert_eq!(cleaned.applied_shift, -2);
        assert_eq!(cleaned.events[0].pitch_class, PitchClass::C);
    }

    #[test]
    fn smf_round_trip_preserves_notes() {
        let events = vec![
            note(60, 0.0, 0.5),
            note(62, 0.5, 0.5),
            note(64, 1.0, 1.0),
            note(62, 2.5, 0.25), // gap before this one
        ];
        let bytes = write_smf(&events).unwrap();
        let tracks = parse_tracks(&bytes).unwrap();
        assert_eq!(tracks.len(), 1);
        let parsed = &tracks[0];
        assert_eq!(parsed.len(), events.len());
        for (a, b) in parsed.iter().zip(&events) {
            assert_eq!(a.pitch_class, b.pitch_class);
            assert_eq!(a.octave, b.octave);
            assert!((a.onset - b.onset).abs() < 1e-6);
            assert!((a.duration - b.duration).abs() < 1e-6);
        }
    }

    #[test]
    fn trim_clamps_and_drops() {
        let events = vec![note(60, 0.0, 2.0), note(62, 3.5, 2.0), note(64, 5.0, 1.0)];
        let trimmed = trim_to_length(&events, 4.0);
        assert_eq!(trimmed.len(), 2);
        assert!((trimmed[1].duration - 0.5).abs() < 1e-9);
    }
}
