use std::sync::atomic::{AtomicBool, Ordering};

use crate::tokenizer::Tokenizer;
use crate::TokenId;

const BOS: TokenId = 256;
const EOS: TokenId = 257;

/// Byte-level vocabulary: ids 0..=255 are single bytes, 256 is the
/// beginning-of-sequence marker and 257 ends generation.
pub struct ByteVocab {
    add_bos: bool,
    last_parse_special: AtomicBool,
}

impl Default for ByteVocab {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteVocab {
    pub fn new() -> Self {
        Self {
            add_bos: true,
            last_parse_special: AtomicBool::new(false),
        }
    }

    /// Never prepend the beginning-of-sequence marker.
    pub fn without_bos(mut self) -> Self {
        self.add_bos = false;
        self
    }

    pub fn bos(&self) -> TokenId {
        BOS
    }

    pub fn eos(&self) -> TokenId {
        EOS
    }

    /// Token ids for `text`, the way `tokenize` would produce them.
    pub fn encode(&self, text: &str, add_leading: bool) -> Vec<TokenId> {
        let mut ids = Vec::with_capacity(text.len() + 1);
        if add_leading && self.add_bos {
            ids.push(BOS);
        }
        ids.extend(text.bytes().map(TokenId::from));
        ids
    }

    /// `parse_special` flag of the most recent `tokenize` call.
    pub fn last_parse_special(&self) -> bool {
        self.last_parse_special.load(Ordering::SeqCst)
    }
}

impl Tokenizer for ByteVocab {
    fn tokenize(
        &self,
        text: &str,
        add_leading: bool,
        parse_special: bool,
    ) -> anyhow::Result<Vec<TokenId>> {
        self.last_parse_special
            .store(parse_special, Ordering::SeqCst);
        Ok(self.encode(text, add_leading))
    }

    fn token_to_piece(&self, token: TokenId) -> anyhow::Result<Vec<u8>> {
        match token {
            0..=255 => Ok(vec![token as u8]),
            BOS | EOS => Ok(Vec::new()),
            _ => anyhow::bail!("token {token} is outside the byte vocabulary"),
        }
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOS
    }
}
