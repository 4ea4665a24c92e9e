//! Integration tests for cloudfs-fuse
//!
//! Drives a mounted [`cloudfs_fuse::CloudFs`] over the in-memory backend and
//! checks namespace, content and concurrency behavior end to end.

mod common;

mod test_concurrency;
mod test_content;
mod test_namespace;
