//! Corpus pipeline: enumerate, clean, filter, encode.
//!
//! Turns a directory of MIDI files into id sequences plus the accumulated
//! vocabulary. Every step is deterministic: files enumerate in lexicographic
//! path order (so a file cap always selects the same subset), cleaning and
//! encoding are pure given their config, and vocabulary ids follow the fixed
//! traversal order. Per-file failures are logged and skipped — one broken
//! file never aborts a training run.
//!
//! Cleaned melodies and token sequences are cached through an explicit
//! [`Cache`] handle, keyed by a (path, size, config) fingerprint. Refresh
//! flags bypass the lookup but still write, which is the only invalidation
//! path.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::{fingerprint_key, Cache};
use crate::config::EncoderConfig;
use crate::encoding::{self, Token};
use crate::midi::{self, CleanedMelody};
use crate::theory::Mode;
use crate::vocab::Vocabulary;
use crate::{Error, Result};

/// Options controlling corpus loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusOptions {
    /// Directory scanned (non-recursively) for `.mid` / `.midi` files.
    pub midi_dir: PathBuf,

    /// Cap on the number of files used, applied after sorting.
    pub max_files: Option<usize>,

    /// Keep only melodies whose detected key matches this mode.
    pub partition: Option<Mode>,

    /// Recompute cleaned melodies even when cached.
    pub refresh_cleaned: bool,

    /// Recompute token sequences even when cached.
    pub refresh_encodings: bool,

    /// File names known to cause trouble; skipped outright.
    pub blacklist: Vec<String>,
}

impl CorpusOptions {
    pub fn new(midi_dir: impl Into<PathBuf>) -> CorpusOptions {
        CorpusOptions {
            midi_dir: midi_dir.into(),
            max_files: None,
            partition: None,
            refresh_cleaned: false,
            refresh_encodings: false,
            blacklist: Vec::new(),
        }
    }
}

/// One encoded corpus entry.
#[derive(Debug, Clone)]
pub struct EncodedFile {
    /// Source file name (not the full path).
    pub source: String,
    /// Token ids, ending with the end-of-sequence id.
    pub ids: Vec<u32>,
}

/// The loaded corpus: encoded sequences plus the vocabulary they built.
#[derive(Debug)]
pub struct Corpus {
    pub files: Vec<EncodedFile>,
    pub vocabulary: Vocabulary,
}

/// Enumerate candidate MIDI files: lexicographic by path, blacklist removed,
/// then capped.
pub fn enumerate_midi_files(options: &CorpusOptions) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(&options.midi_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("mid") | Some("midi")
            )
        })
        .collect();
    paths.sort();

    paths.retain(|path| {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if options.blacklist.iter().any(|b| b == name) {
            tracing::warn!(file = name, "skipping blacklisted file");
            false
        } else {
            true
        }
    });

    if let Some(cap) = options.max_files {
        paths.truncate(cap);
    }
    Ok(paths)
}

/// Load and encode the corpus. See the module docs for the step breakdown.
pub fn load_corpus(
    options: &CorpusOptions,
    config: &EncoderConfig,
    cache: &dyn Cache,
) -> Result<Corpus> {
    let paths = enumerate_midi_files(options)?;
    tracing::info!(
        candidates = paths.len(),
        dir = %options.midi_dir.display(),
        "loading corpus"
    );

    let mut files = Vec::new();
    let mut vocabulary = Vocabulary::new();
    let mut skipped = 0usize;

    for path in &paths {
        let source = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let cleaned = match cleaned_melody(path, config, cache, options.refresh_cleaned) {
            Ok(cleaned) => cleaned,
            Err(e) => {
                tracing::warn!(file = %source, error = %e, "skipping unusable file");
                skipped += 1;
                continue;
            }
        };

        if let Some(partition) = options.partition {
            if cleaned.source_key.mode != partition {
                tracing::debug!(
                    file = %source,
                    key = %cleaned.source_key,
                    "filtered out by partition"
                );
                continue;
            }
        }

        let tokens = match encoded_tokens(path, &cleaned, config, cache, options.refresh_encodings)
        {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!(file = %source, error = %e, "skipping unencodable file");
                skipped += 1;
                continue;
            }
        };

        let ids = vocabulary.intern_sequence(&tokens);
        files.push(EncodedFile { source, ids });
    }

    tracing::info!(
        used = files.len(),
        skipped,
        vocab = vocabulary.len(),
        "corpus loaded"
    );
    Ok(Corpus { files, vocabulary })
}

/// Fingerprint a source file by path and size, plus the encoder config.
fn file_fingerprint(path: &Path, config: &EncoderConfig) -> Result<String> {
    let len = fs::metadata(path)?.len();
    let config_json = serde_json::to_string(config)?;
    Ok(format!("{}|{len}|{config_json}", path.display()))
}

/// Clean one file, going through the cache.
fn cleaned_melody(
    path: &Path,
    config: &EncoderConfig,
    cache: &dyn Cache,
    refresh: bool,
) -> Result<CleanedMelody> {
    let key = fingerprint_key("cleaned", &file_fingerprint(path, config)?);

    if !refresh {
        if let Some(bytes) = cache.get(&key)? {
            if let Ok(cleaned) = serde_json::from_slice::<CleanedMelody>(&bytes) {
                tracing::debug!(file = %path.display(), "cleaned melody from cache");
                return Ok(cleaned);
            }
            // Unreadable entry: fall through and rebuild over it.
            tracing::warn!(file = %path.display(), "discarding unreadable cache entry");
        }
    }

    let bytes = fs::read(path)?;
    let tracks = midi::parse_tracks(&bytes)?;
    let track = midi::select_melodic_track(&tracks)?;
    let cleaned = midi::clean_melody(&tracks[track], config)?;

    cache.put(&key, &serde_json::to_vec(&cleaned)?)?;
    Ok(cleaned)
}

/// Encode one cleaned melody, going through the cache. Cached values are the
/// token strings — vocabulary-independent, so the same entry serves any
/// training run with this config.
fn encoded_tokens(
    path: &Path,
    cleaned: &CleanedMelody,
    config: &EncoderConfig,
    cache: &dyn Cache,
    refresh: bool,
) -> Result<Vec<Token>> {
    let key = fingerprint_key("encoded", &file_fingerprint(path, config)?);

    if !refresh {
        if let Some(bytes) = cache.get(&key)? {
            if let Ok(strings) = serde_json::from_slice::<Vec<String>>(&bytes) {
                let tokens: Result<Vec<Token>> = strings.iter().map(|s| s.parse()).collect();
                match tokens {
                    Ok(tokens) => {
                        tracing::debug!(file = %path.display(), "encoding from cache");
                        return Ok(tokens);
                    }
                    Err(Error::CorruptMapping(_)) => {
                        tracing::warn!(file = %path.display(), "discarding unreadable cache entry");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    let tokens = encoding::encode(&cleaned.events, config)?;
    let strings: Vec<String> = tokens.iter().map(Token::to_string).collect();
    cache.put(&key, &serde_json::to_vec(&strings)?)?;
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::midi::{write_smf, NoteEvent};

    /// Write a little scale melody as a MIDI file.
    fn write_melody(dir: &Path, name: &str, keys: &[u8]) {
        let events: Vec<NoteEvent> = keys
            .iter()
            .enumerate()
            .map(|(i, &k)| NoteEvent::from_key(k, i as f64 * 0.5, 0.5).unwrap())
            .collect();
        fs::write(dir.join(name), write_smf(&events).unwrap()).unwrap();
    }

    const C_MAJOR: [u8; 8] = [60, 62, 64, 65, 67, 69, 71, 72];
    const C_MINOR: [u8; 8] = [60, 62, 63, 65, 67, 68, 70, 72];

    #[test]
    fn enumeration_is_sorted_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["c.mid", "a.mid", "b.mid", "ignored.txt"] {
            write_melody(dir.path(), name, &C_MAJOR);
        }

        let mut options = CorpusOptions::new(dir.path());
        options.max_files = Some(2);
        let paths = enumerate_midi_files(&options).unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.mid", "b.mid"]);
    }

    #[test]
    fn blacklisted_files_are_dropped_before_cap() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.mid", "b.mid", "c.mid"] {
            write_melody(dir.path(), name, &C_MAJOR);
        }
        let mut options = CorpusOptions::new(dir.path());
        options.blacklist = vec!["a.mid".to_string()];
        options.max_files = Some(2);
        let paths = enumerate_midi_files(&options).unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["b.mid", "c.mid"]);
    }

    #[test]
    fn load_corpus_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        write_melody(dir.path(), "one.mid", &C_MAJOR);
        write_melody(dir.path(), "two.mid", &[64, 66, 68, 69, 71, 73, 75, 76]);

        let options = CorpusOptions::new(dir.path());
        let config = EncoderConfig::default();

        let first = load_corpus(&options, &config, &MemoryCache::new()).unwrap();
        let second = load_corpus(&options, &config, &MemoryCache::new()).unwrap();

        assert_eq!(first.files.len(), 2);
        assert_eq!(first.vocabulary.len(), second.vocabulary.len());
        for (a, b) in first.files.iter().zip(&second.files) {
            assert_eq!(a.source, b.source);
            assert_eq!(a.ids, b.ids);
        }
        assert_eq!(first.vocabulary.tokens(), second.vocabulary.tokens());
    }

    #[test]
    fn bad_file_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_melody(dir.path(), "good.mid", &C_MAJOR);
        fs::write(dir.path().join("broken.mid"), b"definitely not midi").unwrap();

        let corpus = load_corpus(
            &CorpusOptions::new(dir.path()),
            &EncoderConfig::default(),
            &MemoryCache::new(),
        )
        .unwrap();
        assert_eq!(corpus.files.len(), 1);
        assert_eq!(corpus.files[0].source, "good.mid");
    }

    #[test]
    fn partition_filter_keeps_matching_mode() {
        let dir = tempfile::tempdir().unwrap();
        write_melody(dir.path(), "major.mid", &C_MAJOR);
        write_melody(dir.path(), "minor.mid", &C_MINOR);

        let mut options = CorpusOptions::new(dir.path());
        options.partition = Some(Mode::Minor);
        let corpus = load_corpus(&options, &EncoderConfig::default(), &MemoryCache::new()).unwrap();
        assert_eq!(corpus.files.len(), 1);
        assert_eq!(corpus.files[0].source, "minor.mid");
    }

    #[test]
    fn cache_round_trip_matches_fresh_compute() {
        let dir = tempfile::tempdir().unwrap();
        write_melody(dir.path(), "one.mid", &C_MAJOR);

        let options = CorpusOptions::new(dir.path());
        let config = EncoderConfig::default();
        let cache = MemoryCache::new();

        let fresh = load_corpus(&options, &config, &cache).unwrap();
        // Second run hits the cache for cleaning and encoding.
        let cached = load_corpus(&options, &config, &cache).unwrap();
        assert_eq!(fresh.files[0].ids, cached.files[0].ids);

        // Refresh flags still produce identical output.
        let mut refreshed = options.clone();
        refreshed.refresh_cleaned = true;
        refreshed.refresh_encodings = true;
        let rebuilt = load_corpus(&refreshed, &config, &cache).unwrap();
        assert_eq!(fresh.files[0].ids, rebuilt.files[0].ids);
    }

    #[test]
    fn sequences_end_with_end_id() {
        let dir = tempfile::tempdir().unwrap();
        write_melody(dir.path(), "one.mid", &C_MAJOR);
        let corpus = load_corpus(
            &CorpusOptions::new(dir.path()),
            &EncoderConfig::default(),
            &MemoryCache::new(),
        )
        .unwrap();
        assert_eq!(*corpus.files[0].ids.last().unwrap(), crate::vocab::END_ID);
    }
}
