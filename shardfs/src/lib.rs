//! `shardfs` is the core library of a sharded file store.
//!
//! A coordinator exposes a single namespace (`~S1/...`) to clients and routes every file by its
//! extension to one of four shards: `.c` files stay on the coordinator, `.pdf`, `.txt` and `.zip`
//! files are stored on dedicated storage nodes. This crate contains everything the processes
//! share:
//!
//! - [protocol]: the framed binary transfer protocol and text reply framing,
//! - [placement] and [path]: the extension-to-shard mapping and logical paths,
//! - [command]: the text commands of clients and of the coordinator,
//! - [storage] and [archive]: storing files below a shard root and archiving them,
//! - [client]: blocking clients for the coordinator and the storage nodes,
//! - [report]: per-file results and their rendering.
//!
//! The servers themselves live in the `shardfs-server` crate.

pub mod archive;
pub mod client;
pub mod command;
pub mod error;
pub mod path;
pub mod placement;
pub mod protocol;
pub mod report;
pub mod storage;

pub mod util {
    //! Collects traits, functions, etc. that are not directly related to the main concepts.

    pub mod close;
    pub(crate) mod encoding;
}
pub mod test_util {
    //! Utilities for testing `shardfs` code.
    //!
    //! These are not intended to be used in production code.

    pub mod fs;
}
