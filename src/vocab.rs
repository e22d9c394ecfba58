//! Token ↔ id vocabulary, persisted next to the trained weights.
//!
//! Ids 0..=2 are reserved (pad, unknown, end) no matter what the corpus
//! contains; corpus tokens take ids from 3 up in strict first-seen order, so
//! the mapping is invariant to anything but the traversal order the corpus
//! pipeline already fixes. The mapping is frozen after training and must load
//! bit-identically for generation — any inconsistency is a fatal
//! `CorruptMapping`, never a silent repair.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::encoding::Token;
use crate::{Error, Result};

/// Reserved padding id.
pub const PAD_ID: u32 = 0;
/// Reserved unknown-token id.
pub const UNK_ID: u32 = 1;
/// Reserved end-of-sequence id.
pub const END_ID: u32 = 2;
/// First id available to corpus tokens.
const FIRST_CORPUS_ID: u32 = 3;

/// Serialized form: a format version plus corpus tokens in id order.
#[derive(Serialize, Deserialize)]
struct VocabFile {
    version: u32,
    tokens: Vec<String>,
}

const VOCAB_FORMAT_VERSION: u32 = 1;

/// Bidirectional token ↔ id mapping.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    token_to_id: HashMap<Token, u32>,
    id_to_token: Vec<Token>, // index = id - FIRST_CORPUS_ID
}

impl Vocabulary {
    pub fn new() -> Vocabulary {
        Vocabulary::default()
    }

    /// Total id space including the reserved ids.
    pub fn len(&self) -> usize {
        FIRST_CORPUS_ID as usize + self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    /// Id for a token, assigning the next id on first sight. `End` always
    /// maps to the reserved end id.
    pub fn intern(&mut self, token: Token) -> u32 {
        if token == Token::End {
            return END_ID;
        }
        if let Some(&id) = self.token_to_id.get(&token) {
            return id;
        }
        let id = FIRST_CORPUS_ID + self.id_to_token.len() as u32;
        self.token_to_id.insert(token, id);
        self.id_to_token.push(token);
        id
    }

    /// Id for a token without extending the vocabulary; unknown tokens map
    /// to the reserved unknown id.
    pub fn id_of(&self, token: Token) -> u32 {
        if token == Token::End {
            return END_ID;
        }
        self.token_to_id.get(&token).copied().unwrap_or(UNK_ID)
    }

    /// Token for an id; reserved pad/unknown ids carry no token.
    pub fn token_of(&self, id: u32) -> Option<Token> {
        match id {
            PAD_ID | UNK_ID => None,
            END_ID => Some(Token::End),
            id => self
                .id_to_token
                .get((id - FIRST_CORPUS_ID) as usize)
                .copied(),
        }
    }

    /// Corpus tokens in id order.
    pub fn tokens(&self) -> &[Token] {
        &self.id_to_token
    }

    /// Intern every token of a sequence, in order.
    pub fn intern_sequence(&mut self, tokens: &[Token]) -> Vec<u32> {
        tokens.iter().map(|t| self.intern(*t)).collect()
    }

    /// Map a sequence without extending the vocabulary.
    pub fn encode_sequence(&self, tokens: &[Token]) -> Vec<u32> {
        tokens.iter().map(|t| self.id_of(*t)).collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = VocabFile {
            version: VOCAB_FORMAT_VERSION,
            tokens: self.id_to_token.iter().map(Token::to_string).collect(),
        };
        fs::write(path, serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }

    /// Load a persisted mapping. Any structural problem — unreadable file,
    /// wrong version, unparsable or duplicate tokens — is `CorruptMapping`.
    pub fn load(path: &Path) -> Result<Vocabulary> {
        let bytes = fs::read(path).map_err(|e| {
            Error::CorruptMapping(format!("cannot read vocabulary {}: {e}", path.display()))
        })?;
        let file: VocabFile = serde_json::from_slice(&bytes).map_err(|e| {
            Error::CorruptMapping(format!("vocabulary {} is not valid: {e}", path.display()))
        })?;
        if file.version != VOCAB_FORMAT_VERSION {
            return Err(Error::CorruptMapping(format!(
                "vocabulary format version {} (expected {VOCAB_FORMAT_VERSION})",
                file.version
            )));
        }

        let mut vocab = Vocabulary::new();
        for s in &file.tokens {
            let token: Token = s.parse()?;
            if token == Token::End || vocab.token_to_id.contains_key(&token) {
                return Err(Error::CorruptMapping(format!(
                    "duplicate or reserved token '{s}' in {}",
                    path.display()
                )));
            }
            vocab.intern(token);
        }
        Ok(vocab)
    }
}
