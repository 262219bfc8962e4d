//! Tree metadata.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error for tree-type tags that no sequencing mode supports.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("unsupported tree type tag: {tag}")]
pub struct TreeTypeError {
    /// The unrecognized wire tag.
    pub tag: i32,
}

/// Sequencing mode of a log tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeType {
    /// Entries are queued unordered and assigned indices on dequeue.
    Log,
    /// Entries arrive with indices already assigned at queue time.
    PreorderedLog,
}

impl TreeType {
    /// Parses a wire tag (fail-closed: unknown tags are rejected).
    ///
    /// # Errors
    ///
    /// Returns [`TreeTypeError`] for any tag other than the two supported
    /// modes.
    pub const fn from_wire_tag(tag: i32) -> Result<Self, TreeTypeError> {
        match tag {
            1 => Ok(Self::Log),
            2 => Ok(Self::PreorderedLog),
            _ => Err(TreeTypeError { tag }),
        }
    }

    /// Returns the canonical wire tag.
    #[must_use]
    pub const fn wire_tag(self) -> i32 {
        match self {
            Self::Log => 1,
            Self::PreorderedLog => 2,
        }
    }
}

impl std::fmt::Display for TreeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Log => write!(f, "log"),
            Self::PreorderedLog => write!(f, "preordered_log"),
        }
    }
}

/// Metadata record identifying a log tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDef {
    /// Storage-assigned tree identifier.
    pub tree_id: i64,
    /// Sequencing mode.
    pub tree_type: TreeType,
    /// Human-readable name, for logs and operator tooling.
    #[serde(default)]
    pub display_name: String,
}

impl TreeDef {
    /// Creates a tree definition.
    #[must_use]
    pub fn new(tree_id: i64, tree_type: TreeType) -> Self {
        Self {
            tree_id,
            tree_type,
            display_name: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tags_round_trip() {
        for tree_type in [TreeType::Log, TreeType::PreorderedLog] {
            assert_eq!(
                TreeType::from_wire_tag(tree_type.wire_tag()),
                Ok(tree_type)
            );
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        assert_eq!(TreeType::from_wire_tag(0), Err(TreeTypeError { tag: 0 }));
        assert_eq!(TreeType::from_wire_tag(3), Err(TreeTypeError { tag: 3 }));
    }
}
