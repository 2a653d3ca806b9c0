//! Durable local storage helpers.
//!
//! Scripts, deployment configs and OAuth token payloads all live as small
//! files on the local filesystem.  Writes go through a temp file in the
//! target directory followed by a rename so readers never see a partially
//! written file.

pub mod local;

pub use local::{read_optional, remove_if_exists, write_atomic};
