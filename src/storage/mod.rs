//! Storage module for on-disk state

pub mod persistence;

pub use persistence::{create_private_dir, write_atomic, JsonFile, StorageError};
