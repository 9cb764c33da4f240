//! Storage Module - fragment index, capacity probe, and hashing
//!
//! Fragments live as regular files named by fragment id inside the
//! `p2p-node-remote` directory of each configured storage path.

mod hashing;
mod index;
pub mod probe;

pub use hashing::{hash_file, FragmentHash, IncrementalHasher};
pub use index::{remote_dir, FragmentIndex, REMOTE_DIR};
pub use probe::{apply_threshold, available_bytes, most_free_path, VolumeStats};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("fragment not found: {0}")]
    FragmentNotFound(String),

    #[error("storage paths {first} and {second} resolve to the same mount")]
    MountCollision { first: String, second: String },

    #[error("filesystem probe error: {0}")]
    Probe(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
