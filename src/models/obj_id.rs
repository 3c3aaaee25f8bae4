//! Identifier of a stored object.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Folder name reserved for the root object. Contains `=`, which never
/// appears in a regular (lower-cased) object id folder.
pub const ROOT_FOLDER_NAME: &str = "=root=";

/// An object identifier.
///
/// Every store has exactly one root object, addressed by `ObjId::Root`. All
/// other objects carry an opaque string id. On disk the id is `null` for the
/// root and a string otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum ObjId {
    Root,
    Id(String),
}

impl ObjId {
    pub fn new(id: impl Into<String>) -> Self {
        ObjId::Id(id.into())
    }

    pub fn is_root(&self) -> bool {
        matches!(self, ObjId::Root)
    }

    /// Name of the per-object folder: the lower-cased id, or the reserved
    /// root name.
    pub fn folder_name(&self) -> String {
        match self {
            ObjId::Root => ROOT_FOLDER_NAME.to_string(),
            ObjId::Id(id) => id.to_lowercase(),
        }
    }
}

impl From<Option<String>> for ObjId {
    fn from(value: Option<String>) -> Self {
        match value {
            None => ObjId::Root,
            Some(id) => ObjId::Id(id),
        }
    }
}

impl From<ObjId> for Option<String> {
    fn from(value: ObjId) -> Self {
        match value {
            ObjId::Root => None,
            ObjId::Id(id) => Some(id),
        }
    }
}

impl From<&str> for ObjId {
    fn from(value: &str) -> Self {
        ObjId::Id(value.to_string())
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjId::Root => write!(f, "<root>"),
            ObjId::Id(id) => write!(f, "{}", id),
        }
    }
}
