//! # Chunk Manager Errors
//!
//! Every detectable fault in the heap, from bad arguments to outright
//! corruption of the tracking structures.
//!
//! ## 🎯 Purpose and Responsibility
//! - **Taxonomy, Not Recovery:** a `ChunkError` names what was
//!   detected. Detected corruption taints the heap; the checker keeps
//!   reporting, but nothing here attempts repair.
//! - **Stable Vocabulary:** the variants mirror the faults the fault
//!   handler logs, so grep on a `token()` finds both ends.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkError {
    /// Null pointer where a heap pointer was required
    IsNull,
    /// Pointer is not (or no longer) a tracked allocation
    NotFound,
    /// Page-aligned allocation whose user pointer is off a block boundary
    NotOnBlock,
    /// Size argument out of range or inconsistent with the slot
    BadSize,
    /// Request above LARGEST_ALLOCATION
    TooBig,
    /// Request would exceed the configured memory limit
    OverLimit,
    /// Raw heap could not supply more blocks
    OutOfMemory,
    /// Attribution file name unprintable or out of length bounds
    BadFile,
    /// Attribution line number out of bounds
    BadLine,
    /// Bytes below the user region no longer match the bottom fence
    UnderFence,
    /// Bytes above the user region no longer match the top fence
    OverFence,
    /// Freed chunk was written to while blanked
    FreeNonBlank,
    /// Slot fields are internally inconsistent
    SlotCorrupt,
    /// Address-ordered map lost its structure
    AddressList,
    /// Entry-block headers or admin slots lost their structure
    AdminList,
    /// Access of the requested width would run past the allocation
    WouldOverwrite,
}

impl ChunkError {
    /// Short stable token used in log lines.
    pub fn token(&self) -> &'static str {
        match self {
            ChunkError::IsNull => "is-null",
            ChunkError::NotFound => "not-found",
            ChunkError::NotOnBlock => "not-on-block",
            ChunkError::BadSize => "bad-size",
            ChunkError::TooBig => "too-big",
            ChunkError::OverLimit => "over-limit",
            ChunkError::OutOfMemory => "out-of-memory",
            ChunkError::BadFile => "bad-file",
            ChunkError::BadLine => "bad-line",
            ChunkError::UnderFence => "under-fence",
            ChunkError::OverFence => "over-fence",
            ChunkError::FreeNonBlank => "free-non-blank",
            ChunkError::SlotCorrupt => "slot-corrupt",
            ChunkError::AddressList => "address-list",
            ChunkError::AdminList => "admin-list",
            ChunkError::WouldOverwrite => "would-overwrite",
        }
    }
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ChunkError::IsNull => "pointer is null",
            ChunkError::NotFound => "pointer not found in the heap",
            ChunkError::NotOnBlock => "pointer not on a block boundary",
            ChunkError::BadSize => "invalid allocation size",
            ChunkError::TooBig => "allocation larger than the permitted maximum",
            ChunkError::OverLimit => "allocation would exceed the memory limit",
            ChunkError::OutOfMemory => "raw heap exhausted",
            ChunkError::BadFile => "corrupted attribution file name",
            ChunkError::BadLine => "corrupted attribution line number",
            ChunkError::UnderFence => "memory written under the allocation (fence-post)",
            ChunkError::OverFence => "memory written over the allocation (fence-post)",
            ChunkError::FreeNonBlank => "freed memory was overwritten",
            ChunkError::SlotCorrupt => "tracking slot corrupted",
            ChunkError::AddressList => "address list structure corrupted",
            ChunkError::AdminList => "slab administration structure corrupted",
            ChunkError::WouldOverwrite => "access would overwrite past the allocation",
        };
        f.write_str(msg)
    }
}

pub type ChunkResult<T> = Result<T, ChunkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique() {
        let all = [
            ChunkError::IsNull,
            ChunkError::NotFound,
            ChunkError::NotOnBlock,
            ChunkError::BadSize,
            ChunkError::TooBig,
            ChunkError::OverLimit,
            ChunkError::OutOfMemory,
            ChunkError::BadFile,
            ChunkError::BadLine,
            ChunkError::UnderFence,
            ChunkError::OverFence,
            ChunkError::FreeNonBlank,
            ChunkError::SlotCorrupt,
            ChunkError::AddressList,
            ChunkError::AdminList,
            ChunkError::WouldOverwrite,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.token(), b.token());
            }
        }
    }
}
