//! Runtime limits shared by proxies, targets and the stream bridge.

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_LARGE_MESSAGE_LOG_BYTES: usize = 100_000;
pub const DEFAULT_MAX_DECODE_DEPTH: usize = 100;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingConfig {
    /// Encode refuses, and decode rejects, messages larger than this.
    pub max_message_bytes: usize,
    /// Messages at or above this size are logged at info level.
    pub large_message_log_bytes: usize,
    /// Nesting limit for indirect objects while decoding.
    pub max_decode_depth: usize,
    /// Frame limit for [`crate::transport::bridge_stream`].
    pub max_frame_bytes: usize,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            large_message_log_bytes: DEFAULT_LARGE_MESSAGE_LOG_BYTES,
            max_decode_depth: DEFAULT_MAX_DECODE_DEPTH,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl BindingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes;
        self
    }

    pub fn with_large_message_log_bytes(mut self, bytes: usize) -> Self {
        self.large_message_log_bytes = bytes;
        self
    }

    pub fn with_max_decode_depth(mut self, depth: usize) -> Self {
        self.max_decode_depth = depth;
        self
    }

    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }
}
