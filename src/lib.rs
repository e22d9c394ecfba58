//! Melody generation from MIDI corpora in pure Rust.
//!
//! A candle-based next-token LSTM over a symbolic melody vocabulary:
//! melodies are cleaned to a monophonic, quantized form, normalized to a
//! C tonic, and encoded as note/rest/bar tokens; a sampler then continues
//! a seed melody under key and octave constraints.
//!
//! ## Architecture
//!
//! ```text
//! MIDI files → track selection → cleaning/normalization
//!                        ↓
//!              token encoding (note, rest, bar, end)
//!                        ↓
//!              vocabulary (ids, pad/unk/end reserved)
//!                        ↓
//!              embedding → 2×LSTM → logits
//!                        ↓
//!              constrained sampler → MIDI out
//! ```
//!
//! ## Modules
//!
//! - [`theory`] — pitch classes, keys, key detection
//! - [`midi`] — SMF parsing/writing, track selection, melody cleaning
//! - [`encoding`] — token alphabet and the event ↔ token codec
//! - [`vocab`] — token ↔ id mapping with reserved ids
//! - [`corpus`] — cached corpus enumeration and encoding
//! - [`model`] — the LSTM next-token model
//! - [`sampler`] — constrained autoregressive sampling
//! - [`pipeline`] — end-to-end generation from a model directory
//! - [`trainer`] — training and atomic model publishing
//! - [`manager`] — resident pipeline with a request queue

pub mod cache;
pub mod config;
pub mod corpus;
pub mod encoding;
pub mod manager;
pub mod midi;
pub mod model;
pub mod pipeline;
pub mod sampler;
pub mod theory;
pub mod trainer;
pub mod vocab;

mod error;

pub use error::{Error, Result};
