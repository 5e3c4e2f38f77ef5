use std::path::Path;

use ahash::AHashMap;
use tokenizers::decoders::DecoderWrapper;
use tracing::debug;

use crate::TokenId;

/// Token names treated as end-of-generation when present in the vocabulary.
const EOG_CANDIDATES: &[&str] = &[
    "</s>",
    "<|endoftext|>",
    "<|im_end|>",
    "<|eot_id|>",
    "<|end_of_text|>",
    "<end_of_turn>",
];

/// Text ↔ token id mapping consumed by a generation session.
pub trait Tokenizer: Send + Sync {
    /// Tokenize `text`. `add_leading` prepends the beginning-of-sequence
    /// marker; `parse_special` lets special-token text map to its id.
    fn tokenize(
        &self,
        text: &str,
        add_leading: bool,
        parse_special: bool,
    ) -> anyhow::Result<Vec<TokenId>>;

    /// Raw bytes of a single token. May be a fragment of a codepoint.
    fn token_to_piece(&self, token: TokenId) -> anyhow::Result<Vec<u8>>;

    fn is_end_of_generation(&self, token: TokenId) -> bool;
}

/// [`Tokenizer`] backed by a Hugging Face `tokenizer.json`.
pub struct TokenizerWrapper {
    inner: tokenizers::Tokenizer,
    /// Same model with special-token parsing turned off.
    literal: tokenizers::Tokenizer,
    eog: Vec<TokenId>,
    byte_decoder: Option<AHashMap<char, u8>>,
}

impl TokenizerWrapper {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("tokenizer load: {e}"))?;
        Ok(Self::from_tokenizer(inner))
    }

    pub fn from_tokenizer(inner: tokenizers::Tokenizer) -> Self {
        let mut literal = inner.clone();
        literal.set_encode_special_tokens(true);

        let byte_decoder = matches!(inner.get_decoder(), Some(DecoderWrapper::ByteLevel(_)))
            .then(byte_level_decoder);
        let eog: Vec<TokenId> = EOG_CANDIDATES
            .iter()
            .filter_map(|name| inner.token_to_id(name))
            .collect();
        debug!(?eog, byte_level = byte_decoder.is_some(), "loaded tokenizer");

        Self {
            inner,
            literal,
            eog,
            byte_decoder,
        }
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn for_testing(vocab_size: usize) -> Self {
        use tokenizers::models::wordlevel::WordLevel;
        use tokenizers::pre_tokenizers::whitespace::Whitespace;

        let mut vocab = AHashMap::new();
        for i in 0..vocab_size {
            vocab.insert(format!("t{i}"), i as u32);
        }
        vocab.insert("</s>".to_string(), vocab_size as u32);
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("t0".into())
            .build()
            .expect("build test tokenizer model");
        let mut tokenizer = tokenizers::Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        Self::from_tokenizer(tokenizer)
    }

    /// Mark additional vocabulary entries as end-of-generation.
    pub fn with_eog_tokens<S: AsRef<str>>(mut self, names: &[S]) -> anyhow::Result<Self> {
        for name in names {
            let name = name.as_ref();
            let id = self
                .inner
                .token_to_id(name)
                .ok_or_else(|| anyhow::anyhow!("unknown end-of-generation token {name:?}"))?;
            if !self.eog.contains(&id) {
                self.eog.push(id);
            }
        }
        Ok(self)
    }

    pub fn eog_tokens(&self) -> &[TokenId] {
        &self.eog
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl Tokenizer for TokenizerWrapper {
    fn tokenize(
        &self,
        text: &str,
        add_leading: bool,
        parse_special: bool,
    ) -> anyhow::Result<Vec<TokenId>> {
        let tokenizer = if parse_special {
            &self.inner
        } else {
            &self.literal
        };
        let encoding = tokenizer
            .encode(text, add_leading)
            .map_err(|e| anyhow::anyhow!("encode: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn token_to_piece(&self, token: TokenId) -> anyhow::Result<Vec<u8>> {
        let piece = self
            .inner
            .id_to_token(token)
            .ok_or_else(|| anyhow::anyhow!("unknown token id {token}"))?;

        if let Some(byte) = parse_byte_fallback(&piece) {
            return Ok(vec![byte]);
        }
        match &self.byte_decoder {
            Some(table) => {
                let mut bytes = Vec::with_capacity(piece.len());
                for c in piece.chars() {
                    match table.get(&c) {
                        Some(&b) => bytes.push(b),
                        None => {
                            let mut buf = [0u8; 4];
                            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                        }
                    }
                }
                Ok(bytes)
            }
            None => Ok(piece.replace('▁', " ").into_bytes()),
        }
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.eog.contains(&token)
    }
}

/// SentencePiece byte-fallback pieces look like `<0x0A>`.
fn parse_byte_fallback(piece: &str) -> Option<u8> {
    let hex = piece.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}

/// Inverse of the GPT-2 byte-to-unicode table used by byte-level BPE.
fn byte_level_decoder() -> AHashMap<char, u8> {
    let mut bytes: Vec<u32> = (u32::from(b'!')..=u32::from(b'~'))
        .chain(0xA1..=0xAC)
        .chain(0xAE..=0xFF)
        .collect();
    let mut chars = bytes.clone();
    let mut shifted = 0;
    for b in 0..=255u32 {
        if !bytes.contains(&b) {
            bytes.push(b);
            chars.push(256 + shifted);
            shifted += 1;
        }
    }
    bytes
        .into_iter()
        .zip(chars)
        .filter_map(|(b, c)| char::from_u32(c).map(|c| (c, b as u8)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_words() {
        let tok = TokenizerWrapper::for_testing(16);
        let ids = tok.tokenize("t1 t2 t3", false, false).unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn piece_is_token_text() {
        let tok = TokenizerWrapper::for_testing(16);
        assert_eq!(tok.token_to_piece(5).unwrap(), b"t5".to_vec());
        assert!(tok.token_to_piece(999).is_err());
    }

    #[test]
    fn end_of_sequence_is_detected() {
        let tok = TokenizerWrapper::for_testing(16);
        assert_eq!(tok.eog_tokens(), &[16]);
        assert!(tok.is_end_of_generation(16));
        assert!(!tok.is_end_of_generation(3));
    }

    #[test]
    fn extra_eog_tokens_by_name() {
        let tok = TokenizerWrapper::for_testing(16)
            .with_eog_tokens(&["t15"])
            .unwrap();
        assert!(tok.is_end_of_generation(15));
        assert!(TokenizerWrapper::for_testing(16)
            .with_eog_tokens(&["<nope>"])
            .is_err());
    }

    #[test]
    fn byte_fallback_pieces() {
        assert_eq!(parse_byte_fallback("<0x0A>"), Some(b'\n'));
        assert_eq!(parse_byte_fallback("<0xE2>"), Some(0xE2));
        assert_eq!(parse_byte_fallback("<0x1>"), None);
        assert_eq!(parse_byte_fallback("hello"), None);
    }

    #[test]
    fn byte_level_table_is_a_bijection() {
        let table = byte_level_decoder();
        assert_eq!(table.len(), 256);
        assert_eq!(table[&'Ġ'], b' ');
        assert_eq!(table[&'Ċ'], b'\n');
        assert_eq!(table[&'a'], b'a');
    }
}
