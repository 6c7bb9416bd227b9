//! # leakward-heap
//!
//! Self-tracking private heap for leakward's own allocations.
//!
//! A leak detector needs memory of its own (tracking records, report
//! buffers) but must never mix that memory into the host heap it is
//! watching. This crate provides:
//!
//! - [`HeapRegion`]: a dedicated source of raw memory. [`MappedRegion`] builds
//!   it from anonymous mappings on unix; [`SystemRegion`] is the portable
//!   fallback.
//! - [`PrivateHeap`]: allocate/free with a provenance header (origin file and
//!   line, serial number, size) in front of every block, and a lock-protected
//!   intrusive registry of every live block.
//! - [`PrivateBox`]: typed values on a private heap, tagged with the caller's
//!   location.
//!
//! Exhaustion is reported as [`HeapError`]. Misuse (zero-size requests,
//! missing provenance) and corruption (broken links, refused releases) panic.

pub mod boxed;
pub mod config;
pub mod error;
pub mod header;
pub mod heap;
pub mod region;
mod registry;

pub use boxed::PrivateBox;
pub use config::HeapConfig;
pub use error::{HeapError, IntegrityError};
pub use header::{BLOCK_ALIGN, BlockInfo, HEADER_SIZE};
pub use heap::{HeapStats, PrivateHeap, TeardownSummary};
#[cfg(unix)]
pub use region::MappedRegion;
pub use region::{DefaultRegion, HeapRegion, RegionStats, SystemRegion};
pub use registry::{BlockIter, Blocks};
