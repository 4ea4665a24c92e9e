//! Extended attributes.
//!
//! The backend has no place to store arbitrary attributes, so every xattr
//! operation fails with [`FsError::Unsupported`] (`ENOTSUP`). The entry is
//! still resolved first so that a stale inode reports `ENOENT` instead.

use crate::{
    entry::Entry,
    error::{FsError, FsResult},
};

fn unsupported(op: &str, entry: &Entry) -> FsError {
    FsError::Unsupported(format!("{op} on inode {}", entry.ino()))
}

pub fn get(entry: &Entry, _name: &str) -> FsResult<Vec<u8>> {
    Err(unsupported("getxattr", entry))
}

pub fn set(entry: &Entry, _name: &str, _value: &[u8]) -> FsResult<()> {
    Err(unsupported("setxattr", entry))
}

pub fn list(entry: &Entry) -> FsResult<Vec<String>> {
    Err(unsupported("listxattr", entry))
}

pub fn remove(entry: &Entry, _name: &str) -> FsResult<()> {
    Err(unsupported("removexattr", entry))
}
