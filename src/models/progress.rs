//! Download progress of a partially cached object version.

use super::region::{Region, covers_whole, merge_regions};
use serde::{Deserialize, Serialize};

/// Which segment bytes of a version are on disk so far. Persisted next to
/// the version file while the download is incomplete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialSegs {
    pub segs_size: u64,
    pub segs: Vec<Region>,
}

impl PartialSegs {
    pub fn empty(segs_size: u64) -> Self {
        Self {
            segs_size,
            segs: Vec::new(),
        }
    }

    pub fn add(&mut self, region: Region) {
        let clipped = Region::new(region.start, region.end.min(self.segs_size));
        merge_regions(&mut self.segs, clipped);
    }

    pub fn is_complete(&self) -> bool {
        covers_whole(&self.segs, self.segs_size)
    }

    pub fn cached_bytes(&self) -> u64 {
        self.segs.iter().map(Region::len).sum()
    }
}

/// Caching state of a version that has a file on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CachingProgress {
    Partial(PartialSegs),
    Done { segs_size: u64 },
}

impl CachingProgress {
    pub fn is_done(&self) -> bool {
        matches!(self, CachingProgress::Done { .. })
    }

    pub fn segs_size(&self) -> u64 {
        match self {
            CachingProgress::Partial(p) => p.segs_size,
            CachingProgress::Done { segs_size } => *segs_size,
        }
    }

    /// Turn a partial record into `Done` once it covers everything.
    pub fn settle(partial: PartialSegs) -> Self {
        if partial.is_complete() {
            CachingProgress::Done {
                segs_size: partial.segs_size,
            }
        } else {
            CachingProgress::Partial(partial)
        }
    }
}
