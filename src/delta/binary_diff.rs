//! Generic binary diff
//!
//! Copy/insert patch over opaque byte buffers, used when two chunk
//! versions cannot be subtracted cell by cell. Source blocks are indexed
//! at fixed strides; the target is scanned byte by byte looking for a block
//! that matches, preferring the same offset in the source, and matches are
//! extended greedily.
//!
//! Patch format:
//! ```text
//! [target_len: u64] { [0x01][src_offset: u64][len: u32] | [0x02][len: u32][bytes] }*
//! ```

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Match granularity
const BLOCK: usize = 8;

const OP_COPY: u8 = 0x01;
const OP_INSERT: u8 = 0x02;

fn block_key(bytes: &[u8]) -> u64 {
    let mut key = [0u8; BLOCK];
    key.copy_from_slice(&bytes[..BLOCK]);
    u64::from_le_bytes(key)
}

struct PatchWriter {
    out: Vec<u8>,
}

impl PatchWriter {
    fn copy(&mut self, offset: usize, len: usize) {
        // Copies longer than u32::MAX are split
        let mut offset = offset;
        let mut left = len;
        while left > 0 {
            let n = left.min(u32::MAX as usize);
            self.out.push(OP_COPY);
            self.out.extend_from_slice(&(offset as u64).to_le_bytes());
            self.out.extend_from_slice(&(n as u32).to_le_bytes());
            offset += n;
            left -= n;
        }
    }

    fn insert(&mut self, bytes: &[u8]) {
        for piece in bytes.chunks(u32::MAX as usize) {
            self.out.push(OP_INSERT);
            self.out.extend_from_slice(&(piece.len() as u32).to_le_bytes());
            self.out.extend_from_slice(piece);
        }
    }
}

/// Patch that turns `old` into `new`
pub fn diff(old: &[u8], new: &[u8]) -> Vec<u8> {
    let mut index: HashMap<u64, usize> = HashMap::new();
    if old.len() >= BLOCK {
        for pos in (0..=old.len() - BLOCK).step_by(BLOCK) {
            index.entry(block_key(&old[pos..])).or_insert(pos);
        }
    }

    let mut writer = PatchWriter {
        out: Vec::with_capacity(16 + new.len() / 4),
    };
    writer.out.extend_from_slice(&(new.len() as u64).to_le_bytes());

    let mut literal_start = 0;
    let mut i = 0;
    while i + BLOCK <= new.len() {
        let window = &new[i..i + BLOCK];
        let same_offset = i + BLOCK <= old.len() && &old[i..i + BLOCK] == window;
        let source = if same_offset {
            Some(i)
        } else {
            index
                .get(&block_key(window))
                .copied()
                .filter(|&s| &old[s..s + BLOCK] == window)
        };

        match source {
            Some(s) => {
                let mut len = BLOCK;
                while s + len < old.len() && i + len < new.len() && old[s + len] == new[i + len] {
                    len += 1;
                }
                if literal_start < i {
                    writer.insert(&new[literal_start..i]);
                }
                writer.copy(s, len);
                i += len;
                literal_start = i;
            }
            None => i += 1,
        }
    }
    if literal_start < new.len() {
        writer.insert(&new[literal_start..]);
    }

    writer.out
}

fn take<'a>(patch: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(n)
        .filter(|&e| e <= patch.len())
        .ok_or_else(|| Error::InvalidDelta("binary patch truncated".into()))?;
    let bytes = &patch[*pos..end];
    *pos = end;
    Ok(bytes)
}

fn take_u32(patch: &[u8], pos: &mut usize) -> Result<usize> {
    let mut b = [0u8; 4];
    b.copy_from_slice(take(patch, pos, 4)?);
    Ok(u32::from_le_bytes(b) as usize)
}

fn take_u64(patch: &[u8], pos: &mut usize) -> Result<u64> {
    let mut b = [0u8; 8];
    b.copy_from_slice(take(patch, pos, 8)?);
    Ok(u64::from_le_bytes(b))
}

/// Rebuild the target of `patch` from `old`
pub fn patch(old: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0;
    let target_len = usize::try_from(take_u64(patch, &mut pos)?)
        .map_err(|_| Error::InvalidDelta("patch target length overflows".into()))?;
    // A patch cannot produce more than it copies plus what it carries
    let limit = old.len().saturating_mul(patch.len()).saturating_add(patch.len());
    if target_len > limit {
        return Err(Error::InvalidDelta(format!(
            "patch claims {} bytes from a {}-byte source",
            target_len,
            old.len()
        )));
    }
    let mut out = Vec::with_capacity(target_len.min(old.len().saturating_add(patch.len())));

    while pos < patch.len() {
        let op = take(patch, &mut pos, 1)?[0];
        match op {
            OP_COPY => {
                let offset = take_u64(patch, &mut pos)? as usize;
                let len = take_u32(patch, &mut pos)?;
                let src = offset
                    .checked_add(len)
                    .filter(|&e| e <= old.len())
                    .map(|e| &old[offset..e])
                    .ok_or_else(|| {
                        Error::InvalidDelta(format!(
                            "copy of {} bytes at {} outside a {}-byte source",
                            len,
                            offset,
                            old.len()
                        ))
                    })?;
                out.extend_from_slice(src);
            }
            OP_INSERT => {
                let len = take_u32(patch, &mut pos)?;
                out.extend_from_slice(take(patch, &mut pos, len)?);
            }
            other => {
                return Err(Error::InvalidDelta(format!("unknown patch op {:#04x}", other)));
            }
        }
        if out.len() > target_len {
            return Err(Error::InvalidDelta("patch overruns its target length".into()));
        }
    }

    if out.len() != target_len {
        return Err(Error::InvalidDelta(format!(
            "patch produced {} bytes, expected {}",
            out.len(),
            target_len
        )));
    }
    Ok(out)
}
