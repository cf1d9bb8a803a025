//! LSM-tree storage primitives.
//!
//! Today this hosts the in-memory point-lookup cache; on-disk tables,
//! manifest, and compaction live with the surrounding engine.

pub mod set_associative_cache;
