use std::io;

use thiserror::Error;

use crate::blockdev::BlockDeviceError;
use crate::handle::{HandleId, SlotKind};
use crate::mem::MemTag;

/// Errors returned by handle lifecycle operations
#[derive(Error, Debug)]
pub enum Error {
    /// An allocation for a handle substructure could not be satisfied
    #[error("Out of memory allocating {bytes} bytes for {tag}")]
    OutOfMemory {
        /// What was being allocated
        tag: MemTag,
        /// Requested size
        bytes: usize,
    },

    /// The handle's identity marker does not match a live filesystem handle
    #[error("Wrong magic number for filesystem handle: {found:#010x}")]
    MagicMismatch {
        /// Marker found on the handle
        found: u32,
    },

    /// No live handle with this identifier
    #[error("Unknown filesystem handle {0}")]
    UnknownHandle(HandleId),

    /// Two bitmaps could not be merged because their geometry differs
    #[error("Cannot merge {kind} bitmaps: source covers {src_start}..={src_end}, destination covers {dest_start}..={dest_end}")]
    BitmapMismatch {
        /// Bitmap kind
        kind: &'static str,
        /// First bit of the source
        src_start: u64,
        /// Last bit of the source
        src_end: u64,
        /// First bit of the destination
        dest_start: u64,
        /// Last bit of the destination
        dest_end: u64,
    },

    /// A bit outside the bitmap range was addressed
    #[error("Bit {bit} is outside the {kind} bitmap range {start}..={end}")]
    BitOutOfRange {
        /// Bitmap kind
        kind: &'static str,
        /// Offending bit
        bit: u64,
        /// First valid bit
        start: u64,
        /// Last valid bit
        end: u64,
    },

    /// The substructure is not owned by this handle; use the origin's copy
    #[error("{0} is deferred to the origin handle")]
    SlotDeferred(SlotKind),

    /// Duplicating the multi-mount protection descriptor failed
    #[error("Could not open the multi-mount protection device for direct I/O: {0}")]
    MmpOpenDirect(#[source] io::Error),

    /// The superblock failed a sanity check at open time
    #[error("Invalid superblock: {0}")]
    InvalidSuperblock(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error from the block device behind an I/O channel
    #[error("Block device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error came from an allocation failure
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. })
    }
}

/// Result type for handle lifecycle operations
pub type Result<T> = std::result::Result<T, Error>;
