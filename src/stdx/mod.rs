//! Small, self-contained data structures used across the crate.
//!
//! # Scope
//! `stdx` hosts narrow, allocation-light utilities that back the cache hot
//! paths. They are tuned for predictable memory use and fast paths rather
//! than general-purpose ergonomics.
//!
//! # Module map
//! - `bit_mask`: consuming iterator over the set bits of a small mask.

pub mod bit_mask;

pub use bit_mask::BitMaskIterator;
