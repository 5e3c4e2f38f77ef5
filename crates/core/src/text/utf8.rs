use tracing::{trace, warn};

use crate::config::MalformedUtf8Policy;

/// Buffers per-token byte fragments until they form complete UTF-8 text.
///
/// Emission is all-or-nothing: a push yields text only once every pending
/// byte belongs to a complete codepoint, so a multi-byte character split
/// across tokens is never emitted in halves.
#[derive(Debug, Clone)]
pub struct Utf8Reassembler {
    pending: Vec<u8>,
    policy: MalformedUtf8Policy,
}

impl Default for Utf8Reassembler {
    fn default() -> Self {
        Self::new(MalformedUtf8Policy::default())
    }
}

impl Utf8Reassembler {
    pub fn new(policy: MalformedUtf8Policy) -> Self {
        Self {
            pending: Vec::with_capacity(8),
            policy,
        }
    }

    /// Append `fragment` and return the buffered text if it is now complete.
    pub fn push(&mut self, fragment: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(fragment);
        if self.pending.is_empty() {
            return None;
        }

        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_owned();
                self.pending.clear();
                Some(text)
            }
            // Truncated tail: more continuation bytes are on their way.
            Err(e) if e.error_len().is_none() => {
                trace!(pending = self.pending.len(), "awaiting continuation bytes");
                None
            }
            Err(_) => match self.policy {
                MalformedUtf8Policy::Replace => self.replace_malformed(),
                MalformedUtf8Policy::Retain => {
                    warn!(
                        pending = self.pending.len(),
                        "malformed UTF-8 retained in reassembly buffer"
                    );
                    None
                }
            },
        }
    }

    /// Emit everything up to a trailing incomplete sequence, with U+FFFD in
    /// place of each malformed sequence.
    fn replace_malformed(&mut self) -> Option<String> {
        let mut text = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        let mut replaced = 0usize;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            replaced += 1;
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let tail = rest.to_vec();
        self.pending = tail;
        warn!(replaced, "replaced malformed UTF-8 sequences");
        Some(text)
    }

    /// Bytes still waiting for completion.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
