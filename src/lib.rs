//! An embedded, persistent blob store: a block device is carved into
//! variable-size blobs, each a sparse array of fixed-size clusters, with
//! snapshot/clone/thin-provisioning support built on copy-on-write
//! backing chains.
//!
//! Module map:
//! - [`bsdev`] — the `BsDev` contract and the reference device impls.
//! - [`request`] — the request engine: `Sequence`, `Batch`, per-channel
//!   queueing.
//! - [`bitmap`] — the bit-array allocator shared by clusters and pages.
//! - [`format`] — the on-disk byte layout: superblock, masks, metadata
//!   pages, descriptors.
//! - [`blob`] — the in-memory blob object and its state machine.
//! - [`metadata`] — loading and persisting a blob's metadata page chain.
//! - [`io`] — cluster-bounded read/write/unmap/write_zeroes and the
//!   allocate-on-write path.
//! - [`snapshot`] — snapshot, clone, inflate, and decouple-parent.
//! - [`blobstore`] — the `Blobstore` type tying all of the above
//!   together: format/load/unload, blob lifecycle, iteration.
//! - [`errno`] — the POSIX-shaped error surface every public operation
//!   returns.

#[macro_use]
extern crate quick_error;
#[macro_use]
extern crate slog;

pub mod bitmap;
pub mod blob;
pub mod blobstore;
pub mod bsdev;
pub mod errno;
pub mod format;
pub mod io;
pub mod metadata;
pub mod request;
pub mod snapshot;

pub use blob::{BlobOpts, BlobState, ClearMethod};
pub use blobstore::{BsOpts, Blobstore};
pub use bsdev::{BlobBsDev, BsDev, DevChannel, MemDisk, ZeroesDev};
pub use errno::{ErrorKind, Errno};
pub use format::BlobId;
pub use request::Channel;
