//! Point-lookup cache for an LSM-tree storage engine.
//!
//! The crate provides a fixed-capacity, set-associative value cache with
//! CLOCK Nth-Chance eviction:
//! - Keys map to sets by the low bits of their hash; per-slot tags prune
//!   candidate ways without touching the (much larger) values.
//! - Per-slot reference counts and per-set clock hands are bit-packed into
//!   64-bit words so all eviction metadata stays resident in a handful of
//!   cache lines.
//! - Insertion can pin entries, so values the caller still holds are never
//!   evicted out from under it.
//!
//! The cache is single-threaded by design; the surrounding engine owns
//! synchronization, persistence, compaction, and iteration.

pub mod lsm;
pub mod stdx;
#[cfg(test)]
pub mod test_utils;
