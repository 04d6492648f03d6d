//! The blob object: identity, dual mutable state, xattrs, flags, and the
//! Loading/Clean/Dirty/Syncing state machine (§3, §4.E).
//!
//! A blob never holds a reference back to its owning `Blobstore`. Per the
//! cyclic-ownership design note (§9), the blobstore is the sole owner of
//! every blob, keyed by `BlobId`; anything that would otherwise be a
//! back-pointer (a snapshot parent, a clone's backing device) is instead
//! stored as a `BlobId` and resolved through the blobstore's map, the
//! "stable handle" form the note recommends for languages without raw
//! pointers.

use crate::errno::{ErrorKind, Errno};
use crate::format::BlobId;

quick_error! {
    /// Errors intrinsic to the blob object itself, before any device I/O.
    #[derive(Debug)]
    pub enum Error {
        /// `invalid_flags` carried a bit this implementation does not know.
        UnknownInvalidFlags(bits: u64) {
            description("blob has unknown invalid_flags bits set")
            display("unknown invalid_flags bits: {:#x}", bits)
        }
        /// A single xattr or descriptor exceeds the metadata page's
        /// descriptor area and can never be serialized.
        ValueTooLarge {
            description("xattr value too large to fit in a metadata page")
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match *self {
            Error::UnknownInvalidFlags(_) => ErrorKind::InvalidState,
            Error::ValueTooLarge => ErrorKind::ResourceExhausted,
        }
    }
}

impl From<Error> for Errno {
    fn from(e: Error) -> Errno {
        Errno::from(e.kind())
    }
}

/// Known bit in `invalid_flags`: the blob is thin-provisioned.
pub const INVALID_FLAGS_THIN_PROVISIONING: u64 = 1 << 0;
/// All bits this implementation understands in `invalid_flags`. Any other
/// set bit fails the open with `UnknownInvalidFlags` (§4.E).
pub const INVALID_FLAGS_KNOWN_MASK: u64 = INVALID_FLAGS_THIN_PROVISIONING;

/// Known bit in `data_ro_flags`: the blob was explicitly marked read-only
/// (snapshots set this).
pub const DATA_RO_FLAGS_READ_ONLY: u64 = 1 << 0;
/// Known bit in `md_ro_flags`: metadata mutation is refused.
pub const MD_RO_FLAGS_READ_ONLY: u64 = 1 << 0;

/// How a blob's clusters should be zeroed on creation/resize, carried as
/// an internal xattr when not `Default` (§3 supplement from
/// `spdk_blob_opts.clear_method`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearMethod {
    Default,
    None,
    Unmap,
    WriteZeroes,
}

impl Default for ClearMethod {
    fn default() -> ClearMethod {
        ClearMethod::Default
    }
}

/// Internal xattr name `ClearMethod` is stashed under when non-default.
pub const CLEAR_METHOD_XATTR: &str = "blobstore.clear_method";

/// Options accepted by `create_blob` (§3 supplement from
/// `spdk_blob_opts`).
#[derive(Debug, Clone, Default)]
pub struct BlobOpts {
    pub thin_provision: bool,
    pub num_clusters: u64,
    pub xattrs: Vec<(String, Vec<u8>)>,
    pub clear_method: ClearMethod,
}

/// A blob's lifecycle state (§4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobState {
    Loading,
    Clean,
    Dirty,
    Syncing,
}

/// One of the two mutable views a blob carries: `active` (the
/// in-memory-only working copy) and `clean` (the last durably persisted
/// copy). On a successful persist, `active` is cloned into `clean`.
#[derive(Debug, Clone, Default)]
pub struct MutableData {
    pub num_clusters: u64,
    /// One entry per logical cluster; `0` means unallocated (falls
    /// through to `back_bs_dev`). Length is the cluster array's capacity,
    /// which may exceed `num_clusters` until the next persist shrinks it
    /// (§4.F step 7).
    pub clusters: Vec<u64>,
    /// Metadata-page chain, in chain order. `pages[0]` is always the
    /// blob's root page.
    pub pages: Vec<u32>,
}

impl MutableData {
    pub fn cluster_array_size(&self) -> u64 {
        self.clusters.len() as u64
    }
}

/// What a blob falls through to for a logical cluster with LBA `0`
/// (§3 `back_bs_dev`).
///
/// Represented as a plain enum over `BlobId` rather than a `BsDev` trait
/// object: the parent is always another blob this same blobstore owns,
/// so resolving it is a map lookup by id, not a virtual call through an
/// adapter (see the module doc comment and `bsdev::BlobBsDev` for the
/// adapter form exposed to external callers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    None,
    Zeroes,
    Parent(BlobId),
}

/// An in-memory blob (§3 "Blob").
pub struct Blob {
    pub id: BlobId,
    pub state: BlobState,
    pub open_ref: u32,
    pub active: MutableData,
    pub clean: MutableData,
    pub xattrs: Vec<(String, Vec<u8>)>,
    pub xattrs_internal: Vec<(String, Vec<u8>)>,
    pub invalid_flags: u64,
    pub data_ro_flags: u64,
    pub md_ro_flags: u64,
    pub parent_id: BlobId,
    pub back_bs_dev: Backing,
    pub frozen_refcnt: u32,
}

impl Blob {
    /// A brand-new blob for `create_blob` (§4.E step 3): one page, no
    /// clusters, `Dirty`.
    pub fn new(id: BlobId, root_page: u32) -> Blob {
        let data = MutableData { num_clusters: 0, clusters: Vec::new(), pages: vec![root_page] };
        Blob {
            id,
            state: BlobState::Dirty,
            open_ref: 0,
            active: data.clone(),
            clean: data,
            xattrs: Vec::new(),
            xattrs_internal: Vec::new(),
            invalid_flags: 0,
            data_ro_flags: 0,
            md_ro_flags: 0,
            parent_id: BlobId::INVALID,
            back_bs_dev: Backing::None,
            frozen_refcnt: 0,
        }
    }

    pub fn is_thin_provisioned(&self) -> bool {
        self.invalid_flags & INVALID_FLAGS_THIN_PROVISIONING != 0
    }

    pub fn set_thin_provisioned(&mut self, thin: bool) {
        if thin {
            self.invalid_flags |= INVALID_FLAGS_THIN_PROVISIONING;
        } else {
            self.invalid_flags &= !INVALID_FLAGS_THIN_PROVISIONING;
        }
    }

    /// Any set bit in `data_ro_flags` (known or not) makes the blob
    /// read-only for data (§4.E "unknown data_ro_flags bits opens with
    /// data_ro = true").
    pub fn data_ro(&self) -> bool {
        self.data_ro_flags != 0
    }

    /// Data-read-only implies metadata-read-only (§4.E).
    pub fn md_ro(&self) -> bool {
        self.md_ro_flags != 0 || self.data_ro()
    }

    pub fn is_clone(&self) -> bool {
        !self.parent_id.is_invalid()
    }

    /// Reject mutation while `Loading`/`Syncing` (§4.E "Rules").
    pub fn guard_mutable_state(&self) -> Result<(), Errno> {
        match self.state {
            BlobState::Loading | BlobState::Syncing => Err(Errno::EBUSY),
            BlobState::Clean | BlobState::Dirty => Ok(()),
        }
    }

    /// Validate `invalid_flags` at open time; any bit outside the known
    /// mask fails the open (§4.E).
    pub fn check_invalid_flags(invalid_flags: u64) -> Result<(), Error> {
        let unknown = invalid_flags & !INVALID_FLAGS_KNOWN_MASK;
        if unknown != 0 {
            Err(Error::UnknownInvalidFlags(unknown))
        } else {
            Ok(())
        }
    }

    /// Mark a descriptor-level mutation pending (§4.E "mutate"
    /// transition). A no-op if already `Dirty`.
    pub fn mark_dirty(&mut self) {
        if self.state == BlobState::Clean {
            self.state = BlobState::Dirty;
        }
    }

    /// `active ↦ clean`; state becomes `Clean` (§4.F step 5/8,
    /// `mark_clean`).
    pub fn mark_clean(&mut self) {
        self.clean = self.active.clone();
        self.state = BlobState::Clean;
    }

    pub fn get_xattr(&self, name: &str) -> Option<&[u8]> {
        self.xattrs.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_slice())
    }

    pub fn set_xattr(&mut self, name: &str, value: &[u8]) {
        if let Some(entry) = self.xattrs.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value.to_vec();
        } else {
            self.xattrs.push((name.to_string(), value.to_vec()));
        }
        self.mark_dirty();
    }

    pub fn remove_xattr(&mut self, name: &str) -> Result<(), Errno> {
        let idx = self.xattrs.iter().position(|(n, _)| n == name).ok_or(Errno::ENOENT)?;
        self.xattrs.remove(idx);
        self.mark_dirty();
        Ok(())
    }

    pub fn xattr_names(&self) -> Vec<String> {
        self.xattrs.iter().map(|(n, _)| n.clone()).collect()
    }

    fn get_internal_xattr(&self, name: &str) -> Option<&[u8]> {
        self.xattrs_internal.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_slice())
    }

    pub fn clear_method(&self) -> ClearMethod {
        match self.get_internal_xattr(CLEAR_METHOD_XATTR) {
            Some(&[0]) => ClearMethod::None,
            Some(&[1]) => ClearMethod::Unmap,
            Some(&[2]) => ClearMethod::WriteZeroes,
            _ => ClearMethod::Default,
        }
    }

    pub fn set_clear_method(&mut self, method: ClearMethod) {
        let code: u8 = match method {
            ClearMethod::Default => {
                self.xattrs_internal.retain(|(n, _)| n != CLEAR_METHOD_XATTR);
                return;
            }
            ClearMethod::None => 0,
            ClearMethod::Unmap => 1,
            ClearMethod::WriteZeroes => 2,
        };
        if let Some(entry) = self.xattrs_internal.iter_mut().find(|(n, _)| n == CLEAR_METHOD_XATTR) {
            entry.1 = vec![code];
        } else {
            self.xattrs_internal.push((CLEAR_METHOD_XATTR.to_string(), vec![code]));
        }
    }

    pub fn set_read_only(&mut self) {
        self.data_ro_flags |= DATA_RO_FLAGS_READ_ONLY;
        self.md_ro_flags |= MD_RO_FLAGS_READ_ONLY;
        self.mark_dirty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_blob_is_dirty_with_one_page_no_clusters() {
        let b = Blob::new(BlobId::from_page_idx(5), 5);
        assert_eq!(b.state, BlobState::Dirty);
        assert_eq!(b.active.pages, vec![5]);
        assert_eq!(b.active.num_clusters, 0);
    }

    #[test]
    fn mutation_refused_while_loading_or_syncing() {
        let mut b = Blob::new(BlobId::from_page_idx(0), 0);
        b.state = BlobState::Syncing;
        assert_eq!(b.guard_mutable_state(), Err(Errno::EBUSY));
        b.state = BlobState::Loading;
        assert_eq!(b.guard_mutable_state(), Err(Errno::EBUSY));
        b.state = BlobState::Dirty;
        assert_eq!(b.guard_mutable_state(), Ok(()));
    }

    #[test]
    fn unknown_invalid_flags_rejected() {
        assert!(Blob::check_invalid_flags(INVALID_FLAGS_THIN_PROVISIONING).is_ok());
        assert!(Blob::check_invalid_flags(1 << 40).is_err());
    }

    #[test]
    fn data_ro_implies_md_ro() {
        let mut b = Blob::new(BlobId::from_page_idx(0), 0);
        assert!(!b.data_ro());
        b.set_read_only();
        assert!(b.data_ro());
        assert!(b.md_ro());
    }

    #[test]
    fn xattr_set_get_remove() {
        let mut b = Blob::new(BlobId::from_page_idx(0), 0);
        b.set_xattr("name", b"value");
        assert_eq!(b.get_xattr("name"), Some(&b"value"[..]));
        assert_eq!(b.xattr_names(), vec!["name".to_string()]);
        b.remove_xattr("name").unwrap();
        assert_eq!(b.get_xattr("name"), None);
        assert_eq!(b.remove_xattr("name"), Err(Errno::ENOENT));
    }

    #[test]
    fn clear_method_round_trips_through_internal_xattr() {
        let mut b = Blob::new(BlobId::from_page_idx(0), 0);
        assert_eq!(b.clear_method(), ClearMethod::Default);
        b.set_clear_method(ClearMethod::Unmap);
        assert_eq!(b.clear_method(), ClearMethod::Unmap);
        b.set_clear_method(ClearMethod::Default);
        assert_eq!(b.clear_method(), ClearMethod::Default);
    }

    #[test]
    fn mark_clean_copies_active_into_clean() {
        let mut b = Blob::new(BlobId::from_page_idx(0), 0);
        b.active.num_clusters = 3;
        b.active.clusters = vec![0, 0, 0];
        b.mark_clean();
        assert_eq!(b.state, BlobState::Clean);
        assert_eq!(b.clean.num_clusters, 3);
    }
}
