//! On-disk layout of one object version.
//!
//! ```text
//! all-bytes:  "all" | u40 segsOffset | header | segments
//! diff:       "dif" | u40 headerOffset | u40 segsOffset | DiffInfo JSON | header | new segments
//! ```
//!
//! A u40 is five bytes, most significant first. Files are written under a
//! temporary name and renamed into place, except for versions being
//! downloaded, which are created at full size and filled in place.

use super::obj_folders::TMP_PREFIX;
use crate::{
    errors::{StorageError, StorageResult},
    models::diff::DiffInfo,
};
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use uuid::Uuid;

pub const ALL_BYTES_MAGIC: &[u8; 3] = b"all";
pub const DIFF_MAGIC: &[u8; 3] = b"dif";
pub const U40_LEN: usize = 5;
pub const MAX_U40: u64 = (1 << 40) - 1;

const ALL_BYTES_PREFIX_LEN: u64 = 3 + U40_LEN as u64;
const DIFF_PREFIX_LEN: u64 = 3 + 2 * U40_LEN as u64;

pub fn encode_u40(value: u64) -> StorageResult<[u8; U40_LEN]> {
    if value > MAX_U40 {
        return Err(StorageError::ValueTooLarge(value));
    }
    Ok([
        (value >> 32) as u8,
        (value >> 24) as u8,
        (value >> 16) as u8,
        (value >> 8) as u8,
        value as u8,
    ])
}

pub fn decode_u40(bytes: &[u8; U40_LEN]) -> u64 {
    bytes
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn u40_at(buf: &[u8], pos: usize) -> u64 {
    let mut field = [0u8; U40_LEN];
    field.copy_from_slice(&buf[pos..pos + U40_LEN]);
    decode_u40(&field)
}

/// Bytes preceding the segments of an all-bytes file.
pub fn all_bytes_prefix(header: &[u8]) -> StorageResult<Vec<u8>> {
    let segs_offset = ALL_BYTES_PREFIX_LEN + header.len() as u64;
    let mut out = Vec::with_capacity(segs_offset as usize);
    out.extend_from_slice(ALL_BYTES_MAGIC);
    out.extend_from_slice(&encode_u40(segs_offset)?);
    out.extend_from_slice(header);
    Ok(out)
}

/// Bytes preceding the new segments of a diff file.
pub fn diff_prefix(diff: &DiffInfo, header: &[u8]) -> StorageResult<Vec<u8>> {
    let diff_json = serde_json::to_vec(diff)?;
    let header_offset = DIFF_PREFIX_LEN + diff_json.len() as u64;
    let segs_offset = header_offset + header.len() as u64;
    let mut out = Vec::with_capacity(segs_offset as usize);
    out.extend_from_slice(DIFF_MAGIC);
    out.extend_from_slice(&encode_u40(header_offset)?);
    out.extend_from_slice(&encode_u40(segs_offset)?);
    out.extend_from_slice(&diff_json);
    out.extend_from_slice(header);
    Ok(out)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Layout {
    AllBytes {
        segs_offset: u64,
    },
    Diff {
        diff: DiffInfo,
        header_offset: u64,
        segs_offset: u64,
    },
}

/// How many leading bytes [`parse_layout`] needs to see for a file whose
/// first [`DIFF_PREFIX_LEN`] bytes are `fixed`.
fn layout_bytes_needed(fixed: &[u8]) -> u64 {
    if fixed.len() >= DIFF_PREFIX_LEN as usize && &fixed[..3] == DIFF_MAGIC {
        u40_at(fixed, 3)
    } else {
        fixed.len() as u64
    }
}

/// Parse a file's layout from its leading bytes. `head` must hold at least
/// everything before the header (all of the diff JSON for diff files).
pub fn parse_layout(path: &Path, head: &[u8], file_len: u64) -> StorageResult<Layout> {
    if head.len() < 3 {
        return Err(StorageError::corrupt(path, "file is shorter than its magic"));
    }
    let magic = &head[..3];
    if magic == ALL_BYTES_MAGIC {
        if head.len() < ALL_BYTES_PREFIX_LEN as usize {
            return Err(StorageError::corrupt(path, "truncated segments offset"));
        }
        let segs_offset = u40_at(head, 3);
        if segs_offset < ALL_BYTES_PREFIX_LEN || segs_offset > file_len {
            return Err(StorageError::corrupt(
                path,
                format!("segments offset {} outside file of {} bytes", segs_offset, file_len),
            ));
        }
        Ok(Layout::AllBytes { segs_offset })
    } else if magic == DIFF_MAGIC {
        if head.len() < DIFF_PREFIX_LEN as usize {
            return Err(StorageError::corrupt(path, "truncated diff offsets"));
        }
        let header_offset = u40_at(head, 3);
        let segs_offset = u40_at(head, 3 + U40_LEN);
        if header_offset < DIFF_PREFIX_LEN
            || segs_offset < header_offset
            || segs_offset > file_len
        {
            return Err(StorageError::corrupt(
                path,
                format!(
                    "diff offsets {}/{} inconsistent with file of {} bytes",
                    header_offset, segs_offset, file_len
                ),
            ));
        }
        if (head.len() as u64) < header_offset {
            return Err(StorageError::corrupt(path, "truncated diff description"));
        }
        let diff: DiffInfo =
            serde_json::from_slice(&head[DIFF_PREFIX_LEN as usize..header_offset as usize])
                .map_err(|err| StorageError::corrupt(path, format!("diff json: {}", err)))?;
        diff.validate(file_len - segs_offset)
            .map_err(|reason| StorageError::corrupt(path, reason))?;
        Ok(Layout::Diff {
            diff,
            header_offset,
            segs_offset,
        })
    } else {
        Err(StorageError::corrupt(
            path,
            format!("unrecognized magic {:?}", String::from_utf8_lossy(magic)),
        ))
    }
}

/// An opened, parsed version file.
#[derive(Clone, Debug)]
pub struct VersionFile {
    path: PathBuf,
    layout: Layout,
    file_len: u64,
}

impl VersionFile {
    /// Open and parse the file. A missing file surfaces as an
    /// `io::ErrorKind::NotFound` error.
    pub async fn open(path: &Path) -> StorageResult<Self> {
        let mut file = File::open(path).await?;
        let file_len = file.metadata().await?.len();

        let mut fixed = vec![0u8; file_len.min(DIFF_PREFIX_LEN) as usize];
        file.read_exact(&mut fixed).await?;
        let needed = layout_bytes_needed(&fixed).min(file_len);
        let mut head = fixed;
        if needed > head.len() as u64 {
            let mut rest = vec![0u8; (needed - head.len() as u64) as usize];
            file.read_exact(&mut rest).await?;
            head.extend_from_slice(&rest);
        }

        let layout = parse_layout(path, &head, file_len)?;
        Ok(Self {
            path: path.to_path_buf(),
            layout,
            file_len,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn diff(&self) -> Option<&DiffInfo> {
        match &self.layout {
            Layout::Diff { diff, .. } => Some(diff),
            Layout::AllBytes { .. } => None,
        }
    }

    fn header_range(&self) -> (u64, u64) {
        match &self.layout {
            Layout::AllBytes { segs_offset } => (ALL_BYTES_PREFIX_LEN, *segs_offset),
            Layout::Diff {
                header_offset,
                segs_offset,
                ..
            } => (*header_offset, *segs_offset),
        }
    }

    pub fn segs_offset(&self) -> u64 {
        self.header_range().1
    }

    /// Segment bytes physically in this file (new bytes, for a diff).
    pub fn local_segs_len(&self) -> u64 {
        self.file_len - self.segs_offset()
    }

    /// Full segment size of the version, reconstructing through the base
    /// when this is a diff.
    pub fn segs_size(&self) -> u64 {
        match &self.layout {
            Layout::Diff { diff, .. } => diff.segs_size,
            Layout::AllBytes { .. } => self.local_segs_len(),
        }
    }

    pub async fn read_header(&self) -> StorageResult<Bytes> {
        let (start, end) = self.header_range();
        read_range(&self.path, start, end).await
    }

    /// Read `[start, end)` of the bytes stored after the segments offset.
    pub async fn read_local_segs(&self, start: u64, end: u64) -> StorageResult<Bytes> {
        let len = self.local_segs_len();
        if start > end || end > len {
            return Err(StorageError::corrupt(
                &self.path,
                format!("segment read [{}, {}) beyond {} stored bytes", start, end, len),
            ));
        }
        let base = self.segs_offset();
        read_range(&self.path, base + start, base + end).await
    }
}

async fn read_range(path: &Path, start: u64, end: u64) -> StorageResult<Bytes> {
    if start == end {
        return Ok(Bytes::new());
    }
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; (end - start) as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

fn tmp_path_beside(path: &Path) -> io::Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("version path missing parent directory"))?;
    Ok(parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4())))
}

/// Fsync the temp file and rename it over `path`, removing it on failure.
async fn commit_tmp(mut file: File, tmp: &Path, path: &Path) -> StorageResult<()> {
    let res = async {
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(tmp, path).await
    }
    .await;
    if let Err(err) = res {
        let _ = fs::remove_file(tmp).await;
        return Err(StorageError::Io(err));
    }
    Ok(())
}

/// Write a complete all-bytes version, streaming the segments. Returns the
/// number of segment bytes written.
pub async fn write_all_bytes_file<S>(path: &Path, header: &[u8], segs: S) -> StorageResult<u64>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let prefix = all_bytes_prefix(header)?;
    let tmp = tmp_path_beside(path)?;
    let mut file = File::create(&tmp).await?;

    let written = async {
        file.write_all(&prefix).await?;
        let mut written: u64 = 0;
        pin_mut!(segs);
        while let Some(chunk) = segs.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        Ok::<u64, io::Error>(written)
    }
    .await;
    let written = match written {
        Ok(n) => n,
        Err(err) => {
            let _ = fs::remove_file(&tmp).await;
            return Err(StorageError::Io(err));
        }
    };
    if let Err(err) = encode_u40(prefix.len() as u64 + written) {
        let _ = fs::remove_file(&tmp).await;
        return Err(err);
    }
    commit_tmp(file, &tmp, path).await?;
    Ok(written)
}

/// Write a complete diff version.
pub async fn write_diff_file(
    path: &Path,
    diff: &DiffInfo,
    header: &[u8],
    new_segs: &[u8],
) -> StorageResult<()> {
    let prefix = diff_prefix(diff, header)?;
    let tmp = tmp_path_beside(path)?;
    let mut file = File::create(&tmp).await?;
    let res = async {
        file.write_all(&prefix).await?;
        file.write_all(new_segs).await
    }
    .await;
    if let Err(err) = res {
        let _ = fs::remove_file(&tmp).await;
        return Err(StorageError::Io(err));
    }
    commit_tmp(file, &tmp, path).await
}

/// Create an all-bytes file sized for `segs_size` segment bytes, with only
/// the header filled in. Fails if the file exists. Returns the segments
/// offset.
pub async fn create_sized_file(path: &Path, header: &[u8], segs_size: u64) -> StorageResult<u64> {
    let prefix = all_bytes_prefix(header)?;
    let segs_offset = prefix.len() as u64;
    let total = segs_offset + segs_size;
    encode_u40(total)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    let res = async {
        file.write_all(&prefix).await?;
        file.set_len(total).await?;
        file.sync_all().await
    }
    .await;
    if let Err(err) = res {
        drop(file);
        let _ = fs::remove_file(path).await;
        return Err(StorageError::Io(err));
    }
    Ok(segs_offset)
}

/// Write downloaded segment bytes in place.
pub async fn write_segs_at(path: &Path, segs_offset: u64, offset: u64, bytes: &[u8]) -> StorageResult<()> {
    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(segs_offset + offset)).await?;
    file.write_all(bytes).await?;
    file.sync_data().await?;
    Ok(())
}
