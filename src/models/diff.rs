//! Diff description stored at the front of a diff version file.

use serde::{Deserialize, Serialize};

/// One piece of a diff version's segment stream.
///
/// On disk a section is the triple `[isNew, offset, length]` with `isNew`
/// encoded as `0` or `1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "(u8, u64, u64)", into = "(u8, u64, u64)")]
pub struct DiffSection {
    /// Bytes come from this diff's own new-bytes region rather than the base.
    pub is_new: bool,
    /// Offset into the base's segments, or into the new bytes.
    pub offset: u64,
    pub len: u64,
}

impl DiffSection {
    pub fn from_base(offset: u64, len: u64) -> Self {
        Self {
            is_new: false,
            offset,
            len,
        }
    }

    pub fn new_bytes(offset: u64, len: u64) -> Self {
        Self {
            is_new: true,
            offset,
            len,
        }
    }
}

impl TryFrom<(u8, u64, u64)> for DiffSection {
    type Error = String;

    fn try_from((flag, offset, len): (u8, u64, u64)) -> Result<Self, Self::Error> {
        let is_new = match flag {
            0 => false,
            1 => true,
            other => return Err(format!("section flag must be 0 or 1, got {}", other)),
        };
        Ok(Self { is_new, offset, len })
    }
}

impl From<DiffSection> for (u8, u64, u64) {
    fn from(section: DiffSection) -> Self {
        (u8::from(section.is_new), section.offset, section.len)
    }
}

/// How a diff version reconstructs its segments from a base version plus
/// locally stored new bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffInfo {
    pub base_version: u64,
    pub segs_size: u64,
    pub sections: Vec<DiffSection>,
}

impl DiffInfo {
    /// Check that sections add up to `segs_size` and that new-byte sections
    /// stay within `new_bytes_len`.
    pub fn validate(&self, new_bytes_len: u64) -> Result<(), String> {
        let mut total: u64 = 0;
        for (i, section) in self.sections.iter().enumerate() {
            total = total
                .checked_add(section.len)
                .ok_or_else(|| format!("section {} overflows total length", i))?;
            if section.is_new {
                let end = section.offset.checked_add(section.len);
                if end.is_none_or(|end| end > new_bytes_len) {
                    return Err(format!(
                        "section {} reads new bytes [{}, +{}) beyond {} stored bytes",
                        i, section.offset, section.len, new_bytes_len
                    ));
                }
            }
        }
        if total != self.segs_size {
            return Err(format!(
                "sections sum to {} bytes but segsSize is {}",
                total, self.segs_size
            ));
        }
        Ok(())
    }

    /// Largest base offset any section reads up to.
    pub fn base_bytes_needed(&self) -> u64 {
        self.sections
            .iter()
            .filter(|s| !s.is_new)
            .map(|s| s.offset + s.len)
            .max()
            .unwrap_or(0)
    }
}
