//! Per-object status record, persisted as the `status` file of an object
//! folder.

use super::obj_id::ObjId;
use super::version_graph::VersionGraph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What the object's current version is, locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjState {
    /// Nothing current is known locally; only archived versions may be.
    NoCurrent,
    Current(u64),
    /// Object was removed. Archived versions may still be retained.
    Archived,
}

/// Status of one object: which versions are live and how diffs depend on
/// their bases.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StatusRecord", into = "StatusRecord")]
pub struct ObjStatusInfo {
    pub obj_id: ObjId,
    pub state: ObjState,
    pub archived_versions: Vec<u64>,
    base_to_diff: BTreeMap<u64, Vec<u64>>,
    diff_to_base: BTreeMap<u64, u64>,
}

/// The on-disk JSON layout.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusRecord {
    obj_id: ObjId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    is_archived: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_version: Option<u64>,
    #[serde(default)]
    archived_versions: Vec<u64>,
    #[serde(default)]
    base_to_diff: BTreeMap<u64, Vec<u64>>,
    #[serde(default)]
    diff_to_base: BTreeMap<u64, u64>,
}

impl TryFrom<StatusRecord> for ObjStatusInfo {
    type Error = String;

    fn try_from(rec: StatusRecord) -> Result<Self, Self::Error> {
        let state = match (rec.is_archived.unwrap_or(false), rec.current_version) {
            (true, Some(v)) => {
                return Err(format!("archived object still has current version {}", v));
            }
            (true, None) => ObjState::Archived,
            (false, Some(v)) => ObjState::Current(v),
            (false, None) => ObjState::NoCurrent,
        };
        for (base, diffs) in &rec.base_to_diff {
            for diff in diffs {
                if rec.diff_to_base.get(diff) != Some(base) {
                    return Err(format!("baseToDiff edge {} -> {} has no inverse", base, diff));
                }
            }
        }
        for (diff, base) in &rec.diff_to_base {
            let listed = rec
                .base_to_diff
                .get(base)
                .is_some_and(|diffs| diffs.contains(diff));
            if !listed {
                return Err(format!("diffToBase edge {} -> {} has no inverse", diff, base));
            }
        }
        let mut archived_versions = rec.archived_versions;
        archived_versions.sort_unstable();
        archived_versions.dedup();
        Ok(Self {
            obj_id: rec.obj_id,
            state,
            archived_versions,
            base_to_diff: rec.base_to_diff,
            diff_to_base: rec.diff_to_base,
        })
    }
}

impl From<ObjStatusInfo> for StatusRecord {
    fn from(info: ObjStatusInfo) -> Self {
        let (is_archived, current_version) = match info.state {
            ObjState::NoCurrent => (None, None),
            ObjState::Current(v) => (None, Some(v)),
            ObjState::Archived => (Some(true), None),
        };
        Self {
            obj_id: info.obj_id,
            is_archived,
            current_version,
            archived_versions: info.archived_versions,
            base_to_diff: info.base_to_diff,
            diff_to_base: info.diff_to_base,
        }
    }
}

impl ObjStatusInfo {
    pub fn new(obj_id: ObjId) -> Self {
        Self {
            obj_id,
            state: ObjState::NoCurrent,
            archived_versions: Vec::new(),
            base_to_diff: BTreeMap::new(),
            diff_to_base: BTreeMap::new(),
        }
    }

    pub fn current_version(&self) -> Option<u64> {
        match self.state {
            ObjState::Current(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.state == ObjState::Archived
    }

    /// Make `version` current, returning the version it replaces.
    pub fn set_current(&mut self, version: u64) -> Option<u64> {
        let previous = self.current_version();
        self.state = ObjState::Current(version);
        previous
    }

    /// Mark the object removed, returning the version that was current.
    pub fn archive(&mut self) -> Option<u64> {
        let previous = self.current_version();
        self.state = ObjState::Archived;
        previous
    }

    pub fn add_archived(&mut self, version: u64) {
        if let Err(pos) = self.archived_versions.binary_search(&version) {
            self.archived_versions.insert(pos, version);
        }
    }

    /// Returns false when `version` was not archived.
    pub fn remove_archived(&mut self, version: u64) -> bool {
        match self.archived_versions.binary_search(&version) {
            Ok(pos) => {
                self.archived_versions.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Whether `version` is current, archived or on a diff edge. A version
    /// file the status does not know of is left over from a crash.
    pub fn knows_version(&self, version: u64) -> bool {
        self.current_version() == Some(version)
            || self.archived_versions.binary_search(&version).is_ok()
            || self.diff_to_base.contains_key(&version)
            || self.base_to_diff.contains_key(&version)
    }

    pub fn base_of(&self, diff: u64) -> Option<u64> {
        self.diff_to_base.get(&diff).copied()
    }

    pub fn diffs_on(&self, base: u64) -> &[u64] {
        self.base_to_diff.get(&base).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn add_diff_edge(&mut self, diff: u64, base: u64) {
        self.diff_to_base.insert(diff, base);
        let diffs = self.base_to_diff.entry(base).or_default();
        if !diffs.contains(&diff) {
            diffs.push(diff);
        }
    }

    /// Drop every edge touching `version`, in both directions.
    pub fn forget_version(&mut self, version: u64) {
        if let Some(base) = self.diff_to_base.remove(&version) {
            if let Some(diffs) = self.base_to_diff.get_mut(&base) {
                diffs.retain(|&d| d != version);
                if diffs.is_empty() {
                    self.base_to_diff.remove(&base);
                }
            }
        }
        if let Some(diffs) = self.base_to_diff.remove(&version) {
            for diff in diffs {
                self.diff_to_base.remove(&diff);
            }
        }
    }

    /// Versions that must stay on disk: those reachable from the current
    /// version, every archived version and `extra_roots` along diff edges.
    pub fn non_garbage_versions(&self, extra_roots: &[u64]) -> BTreeSet<u64> {
        let graph = VersionGraph::from_diff_edges(&self.diff_to_base);
        let roots = self
            .current_version()
            .into_iter()
            .chain(self.archived_versions.iter().copied())
            .chain(extra_roots.iter().copied());
        graph.reachable_from(roots)
    }

    /// Edge-map views, for inspection.
    pub fn diff_to_base(&self) -> &BTreeMap<u64, u64> {
        &self.diff_to_base
    }

    pub fn base_to_diff(&self) -> &BTreeMap<u64, Vec<u64>> {
        &self.base_to_diff
    }
}
