//! Streamed completion fragments.

use serde::{Deserialize, Serialize};

/// One incremental unit of a streamed completion.
///
/// Fragments of one stream carry non-decreasing `sequence_index` values and
/// exactly one of them, the last, has `is_final` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFragment {
    pub sequence_index: u64,
    pub delta_text: String,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl StreamFragment {
    pub fn delta(sequence_index: u64, delta_text: impl Into<String>) -> Self {
        Self {
            sequence_index,
            delta_text: delta_text.into(),
            is_final: false,
            finish_reason: None,
        }
    }

    /// Terminal fragment. May still carry trailing text.
    pub fn last(sequence_index: u64, delta_text: impl Into<String>, finish_reason: Option<String>) -> Self {
        Self {
            sequence_index,
            delta_text: delta_text.into(),
            is_final: true,
            finish_reason,
        }
    }
}
