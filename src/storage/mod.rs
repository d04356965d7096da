//! Storage layer implementation
//!
//! Keys and small values live in the LSM tree; large values live in the
//! value log and are referenced from the tree by pointer.

pub mod checksum;
pub mod codec;
pub mod hash;
pub mod lsm;
pub mod manifest;
pub mod vlog;

pub use checksum::{Checksum, ChecksumError};
pub use codec::{Entry, ValueData, ValuePtr};
pub use lsm::LsmTree;
pub use vlog::{ValueIndex, ValueLog};
