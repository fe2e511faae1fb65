//! Hard size caps (normative defaults).

use serde::{Deserialize, Serialize};

/// Size limits enforced at the wire and queue boundaries.
///
/// Values are intentionally explicit about their units to avoid confusion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_frame_bytes: usize,
    pub max_payload_bytes: usize,

    pub max_cbor_depth: usize,
    pub max_cbor_map_entries: usize,
    pub max_cbor_array_entries: usize,
    pub max_cbor_text_string_len: usize,

    pub max_subscriber_queue: usize,
    pub max_notify_queue: usize,

    pub oplog_list_batch: usize,
    pub oplog_trim_batch: usize,
    pub completed_ops_cap: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 4 * 1024 * 1024,
            max_payload_bytes: 1024 * 1024,

            max_cbor_depth: 32,
            max_cbor_map_entries: 10_000,
            max_cbor_array_entries: 10_000,
            max_cbor_text_string_len: 1024 * 1024,

            max_subscriber_queue: 256,
            max_notify_queue: 64,

            oplog_list_batch: 128,
            oplog_trim_batch: 256,
            completed_ops_cap: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Limits;

    #[test]
    fn limits_defaults_are_normative() {
        let limits = Limits::default();
        assert_eq!(limits.max_frame_bytes, 4 * 1024 * 1024);
        assert_eq!(limits.max_payload_bytes, 1024 * 1024);
        assert_eq!(limits.max_cbor_depth, 32);
        assert_eq!(limits.max_cbor_map_entries, 10_000);
        assert_eq!(limits.max_cbor_array_entries, 10_000);
        assert_eq!(limits.max_cbor_text_string_len, 1024 * 1024);
        assert_eq!(limits.max_subscriber_queue, 256);
        assert_eq!(limits.max_notify_queue, 64);
        assert_eq!(limits.oplog_list_batch, 128);
        assert_eq!(limits.oplog_trim_batch, 256);
        assert_eq!(limits.completed_ops_cap, 1024);
    }
}
