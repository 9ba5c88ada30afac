//! Splits a file into multipart upload parts.
//!
//! S3-compatible stores accept parts between 5 MiB and 5 GiB (the last part
//! may be smaller) and at most 10,000 parts per upload.

use crate::error::{Result, UploadError};

pub const MIB: u64 = 1024 * 1024;

/// Minimum part size accepted by the store (5 MiB).
pub const MIN_PART_SIZE: u64 = 5 * MIB;

/// Maximum part size accepted by the store (5 GiB).
pub const MAX_PART_SIZE: u64 = 5 * 1024 * MIB;

/// Maximum number of parts in a single multipart upload.
pub const MAX_PARTS: u64 = 10_000;

/// A contiguous byte range of the source file, uploaded as one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartDescriptor {
    /// 1-based part number.
    pub number: u32,
    pub offset: u64,
    pub length: u64,
}

impl PartDescriptor {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// The chunk size chosen for a file and the parts it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPlan {
    pub file_size: u64,
    pub chunk_size: u64,
    pub parts: Vec<PartDescriptor>,
}

impl PartPlan {
    /// Plan the parts of a `file_size` bytes file.
    ///
    /// Without a `chunk_size` the smallest doubling of `MIN_PART_SIZE` that
    /// keeps the part count within `MAX_PARTS` is used.
    pub fn new(file_size: u64, chunk_size: Option<u64>) -> Result<Self> {
        let chunk_size = match chunk_size {
            Some(size) => {
                check_chunk_size(size)?;
                size
            }
            None => auto_chunk_size(file_size)?,
        };

        let count = part_count(file_size, chunk_size);
        if count == 0 {
            return Err(UploadError::EmptyFile);
        }
        if count > MAX_PARTS {
            return Err(UploadError::Config(format!(
                "upload would require {count} parts; increase chunk size to keep parts <= {MAX_PARTS}"
            )));
        }

        let parts = (0..count)
            .map(|idx| {
                let offset = idx * chunk_size;
                PartDescriptor {
                    number: idx as u32 + 1,
                    offset,
                    length: chunk_size.min(file_size - offset),
                }
            })
            .collect();

        Ok(PartPlan {
            file_size,
            chunk_size,
            parts,
        })
    }

    pub fn part_count(&self) -> u32 {
        self.parts.len() as u32
    }
}

/// Validate a user-provided chunk size against the store limits.
pub fn check_chunk_size(size: u64) -> Result<()> {
    if size < MIN_PART_SIZE {
        return Err(UploadError::Config(format!(
            "chunk size must be at least {MIN_PART_SIZE} bytes (5 MiB), got {size}"
        )));
    }
    if size > MAX_PART_SIZE {
        return Err(UploadError::Config(format!(
            "chunk size must be at most {MAX_PART_SIZE} bytes (5 GiB), got {size}"
        )));
    }
    Ok(())
}

/// Smallest chunk size, doubling from `MIN_PART_SIZE`, that fits the file in
/// `MAX_PARTS` parts.
pub fn auto_chunk_size(file_size: u64) -> Result<u64> {
    let mut chunk = MIN_PART_SIZE;
    while part_count(file_size, chunk) > MAX_PARTS {
        if chunk >= MAX_PART_SIZE {
            return Err(UploadError::Config(format!(
                "file of {file_size} bytes does not fit in {MAX_PARTS} parts of {MAX_PART_SIZE} bytes"
            )));
        }
        chunk = (chunk * 2).min(MAX_PART_SIZE);
    }
    Ok(chunk)
}

fn part_count(file_size: u64, chunk_size: u64) -> u64 {
    file_size.div_ceil(chunk_size)
}
