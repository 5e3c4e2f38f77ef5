use serde::{Deserialize, Serialize};

/// What a session does when the engine rejects the decode of a generated token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeFailurePolicy {
    /// Log the failure, drop the cache mirror, keep streaming.
    #[default]
    Continue,
    /// Surface the failure and stop the session.
    Abort,
}

/// How the UTF-8 reassembler treats bytes that can never become valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedUtf8Policy {
    /// Substitute U+FFFD for malformed sequences and keep emitting.
    #[default]
    Replace,
    /// Keep buffering until the bytes happen to form valid text.
    Retain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Reuse the engine's key-value cache across prompts sharing a prefix.
    pub kv_cache_reuse: bool,
    pub decode_failure: DecodeFailurePolicy,
    pub malformed_utf8: MalformedUtf8Policy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            kv_cache_reuse: true,
            decode_failure: DecodeFailurePolicy::Continue,
            malformed_utf8: MalformedUtf8Policy::Replace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SessionConfig::default();
        assert!(config.kv_cache_reuse);
        assert_eq!(config.decode_failure, DecodeFailurePolicy::Continue);
        assert_eq!(config.malformed_utf8, MalformedUtf8Policy::Replace);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"decode_failure": "abort"}"#).expect("parse");
        assert!(config.kv_cache_reuse);
        assert_eq!(config.decode_failure, DecodeFailurePolicy::Abort);
        assert_eq!(config.malformed_utf8, MalformedUtf8Policy::Replace);
    }

    #[test]
    fn serializes_snake_case() {
        let config = SessionConfig {
            kv_cache_reuse: false,
            decode_failure: DecodeFailurePolicy::Abort,
            malformed_utf8: MalformedUtf8Policy::Retain,
        };
        let json = serde_json::to_string(&config).expect("serialize");
        assert_eq!(
            json,
            r#"{"kv_cache_reuse":false,"decode_failure":"abort","malformed_utf8":"retain"}"#
        );
    }
}
