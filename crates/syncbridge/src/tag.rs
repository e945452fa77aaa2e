//! Change tags.
//!
//! Every record written into a partition document carries the tag of the
//! local mutation that produced it under [`CHANGE_TAG_FIELD`]. Engines compare
//! tags to recognise their own writes coming back and to avoid applying the
//! same replicated change twice.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reserved record field holding the [`ChangeTag`].
pub const CHANGE_TAG_FIELD: &str = "__change";

/// Opaque identifier for one local mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeTag(String);

impl ChangeTag {
    /// Mint a fresh tag (UUID v4).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The tag as a string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read the tag stored on a record, if any.
    #[must_use]
    pub fn from_record(record: &Value) -> Option<Self> {
        record
            .get(CHANGE_TAG_FIELD)
            .and_then(Value::as_str)
            .map(|s| Self(s.to_string()))
    }
}

impl From<String> for ChangeTag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ChangeTag {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ChangeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
