//! The blobstore itself: formatting, loading/unloading, blob lifecycle,
//! iteration, and the super-blob (§4.G, §4.J, §4.K, §6).
//!
//! Every metadata-mutating method here assumes it is called from the
//! single designated metadata executor (§5) — there is no internal
//! locking, matching the spec's "single-threaded cooperative executor"
//! model. Data I/O methods (`io_*`) take a caller-supplied `Channel` so
//! several can be pinned to different executors, same as the real
//! per-channel affinity.

use std::collections::HashMap;

use crate::bitmap::Allocator;
use crate::blob::{Backing, Blob, BlobOpts, BlobState, ClearMethod};
use crate::bsdev::BsDev;
use crate::errno::{ErrorKind, Errno};
use crate::format::{self, BlobId, Layout, MaskPage, Superblock, PAGE_SIZE};
use crate::io;
use crate::metadata;
use crate::request::{Channel, Sequence};
use crate::snapshot;

quick_error! {
    /// Errors intrinsic to formatting a blobstore, before any device I/O.
    #[derive(Debug)]
    pub enum Error {
        /// The page size is not a multiple of the device's block length.
        PageSizeNotBlockMultiple {
            description("page size is not a multiple of the device's block length")
        }
        /// `cluster_size` must be a multiple of the page size, and larger
        /// than it.
        ClusterSizeInvalid {
            description("cluster size must be greater than the page size and a multiple of it")
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match *self {
            Error::PageSizeNotBlockMultiple | Error::ClusterSizeInvalid => ErrorKind::BadArgument,
        }
    }
}

impl From<Error> for Errno {
    fn from(e: Error) -> Errno {
        Errno::from(e.kind())
    }
}

/// Format/load-time options (§3 supplement from `spdk_bs_opts`).
#[derive(Debug, Clone)]
pub struct BsOpts {
    pub cluster_size: u32,
    pub num_md_pages: u32,
    pub max_md_ops: u32,
    pub max_channel_ops: u32,
    /// Caller-chosen type tag. All-zero means "don't care" on load.
    pub bstype: [u8; 16],
    pub clear_method: ClearMethod,
}

impl Default for BsOpts {
    fn default() -> BsOpts {
        BsOpts {
            cluster_size: format::DEFAULT_CLUSTER_SIZE,
            num_md_pages: format::DEFAULT_NUM_MD_PAGES,
            max_md_ops: format::DEFAULT_MAX_MD_OPS,
            max_channel_ops: format::DEFAULT_MAX_CHANNEL_OPS,
            bstype: [0u8; 16],
            clear_method: ClearMethod::Default,
        }
    }
}

struct LayoutMeta {
    used_page_mask_start: u32,
    used_page_mask_len: u32,
    used_cluster_mask_start: u32,
    used_cluster_mask_len: u32,
    used_blobid_mask_start: u32,
    used_blobid_mask_len: u32,
    md_len: u32,
    total_clusters: u64,
}

fn build_layout(dev: &dyn BsDev, opts: &BsOpts) -> Result<(Layout, LayoutMeta), Error> {
    let blocklen = dev.blocklen();
    if PAGE_SIZE as u32 % blocklen != 0 {
        return Err(Error::PageSizeNotBlockMultiple);
    }
    if opts.cluster_size <= PAGE_SIZE as u32 || opts.cluster_size % PAGE_SIZE as u32 != 0 {
        return Err(Error::ClusterSizeInvalid);
    }

    let lba_per_page = PAGE_SIZE as u64 / blocklen as u64;
    let total_pages = dev.blockcnt() / lba_per_page;
    let pages_per_cluster = opts.cluster_size as u64 / PAGE_SIZE as u64;
    let total_clusters = total_pages / pages_per_cluster;

    let md_len = opts.num_md_pages;
    let used_page_mask_start = 1u32;
    let used_page_mask_len = MaskPage::pages_for_bits(md_len as usize) as u32;
    let used_cluster_mask_start = used_page_mask_start + used_page_mask_len;
    let used_cluster_mask_len = MaskPage::pages_for_bits(total_clusters as usize) as u32;
    let used_blobid_mask_start = used_cluster_mask_start + used_cluster_mask_len;
    let used_blobid_mask_len = MaskPage::pages_for_bits(md_len as usize) as u32;
    let md_start = used_blobid_mask_start + used_blobid_mask_len;

    let layout = Layout { blocklen, cluster_size: opts.cluster_size, md_start };
    let meta = LayoutMeta {
        used_page_mask_start,
        used_page_mask_len,
        used_cluster_mask_start,
        used_cluster_mask_len,
        used_blobid_mask_start,
        used_blobid_mask_len,
        md_len,
        total_clusters,
    };
    Ok((layout, meta))
}

fn read_mask_pages(dev: &dyn BsDev, channel: &mut Channel, layout: &Layout, start_page: u32, len_pages: u32) -> Result<Vec<Vec<u8>>, Errno> {
    let mut pages = Vec::with_capacity(len_pages as usize);
    for i in 0..len_pages {
        let lba = layout.page_to_lba(start_page as u64 + i as u64);
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut seq = Sequence::new(channel);
        seq.read(dev, &mut buf, lba, layout.lba_per_page());
        let err = seq.finish();
        if !err.is_ok() {
            return Err(err);
        }
        pages.push(buf);
    }
    Ok(pages)
}

fn write_mask_pages(dev: &dyn BsDev, channel: &mut Channel, layout: &Layout, start_page: u32, len_pages: u32, bits: &crate::bitmap::BitArray) -> Result<(), Errno> {
    if len_pages == 0 {
        return Ok(());
    }
    let pages = MaskPage::encode(0, bits, len_pages as usize);
    for (i, page) in pages.iter().enumerate() {
        let lba = layout.page_to_lba(start_page as u64 + i as u64);
        let mut seq = Sequence::new(channel);
        seq.write(dev, page, lba, layout.lba_per_page());
        let err = seq.finish();
        if !err.is_ok() {
            return Err(err);
        }
    }
    Ok(())
}

/// The blobstore: all process-wide state over one block device (§3
/// "Blobstore").
pub struct Blobstore {
    dev: Box<dyn BsDev>,
    log: slog::Logger,
    opts: BsOpts,
    layout: Layout,
    total_clusters: u64,
    used_md_pages: Allocator,
    used_clusters: Allocator,
    blobs: HashMap<BlobId, Blob>,
    md_channel: Channel,
    super_blob: BlobId,
    io_unit_size: u32,
    md_thread_registered: bool,
    used_page_mask_start: u32,
    used_page_mask_len: u32,
    used_cluster_mask_start: u32,
    used_cluster_mask_len: u32,
    used_blobid_mask_start: u32,
    used_blobid_mask_len: u32,
}

impl Blobstore {
    /// Format a fresh blobstore onto `dev` (§4.G "init").
    pub fn init(dev: Box<dyn BsDev>, opts: BsOpts, log: slog::Logger) -> Result<Blobstore, Errno> {
        info!(log, "formatting blobstore"; "cluster_size" => opts.cluster_size, "num_md_pages" => opts.num_md_pages);
        let (layout, meta) = build_layout(&*dev, &opts).map_err(Errno::from)?;

        // Claim every cluster whose LBA range overlaps the metadata
        // region (masks + md page chain) before any blob can claim one:
        // cluster 0's LBA range starts at device LBA 0, the same place
        // the superblock lives, so this must happen up front (§4.G init
        // step 4).
        let mut used_clusters = Allocator::new();
        used_clusters.resize(meta.total_clusters as usize);
        let md_region_end_lba = layout.page_to_lba(layout.md_start as u64 + meta.md_len as u64);
        let last_md_cluster = layout.lba_to_cluster(md_region_end_lba.saturating_sub(1)) as usize;
        let last_md_cluster = last_md_cluster.min(meta.total_clusters.saturating_sub(1) as usize);
        for c in 0..=last_md_cluster {
            used_clusters.claim(c);
        }

        let mut used_md_pages = Allocator::new();
        used_md_pages.resize(meta.md_len as usize);

        let dev_channel = dev.create_channel();
        let _ = dev.unmap(dev_channel, 0, dev.blockcnt());
        let md_channel = Channel::new(dev_channel, opts.max_md_ops as usize);

        let mut bs = Blobstore {
            dev,
            log,
            total_clusters: meta.total_clusters,
            used_md_pages,
            used_clusters,
            blobs: HashMap::new(),
            md_channel,
            super_blob: BlobId::INVALID,
            io_unit_size: PAGE_SIZE as u32,
            md_thread_registered: false,
            used_page_mask_start: meta.used_page_mask_start,
            used_page_mask_len: meta.used_page_mask_len,
            used_cluster_mask_start: meta.used_cluster_mask_start,
            used_cluster_mask_len: meta.used_cluster_mask_len,
            used_blobid_mask_start: meta.used_blobid_mask_start,
            used_blobid_mask_len: meta.used_blobid_mask_len,
            layout,
            opts,
        };

        bs.write_superblock(false)?;
        Ok(bs)
    }

    /// Load a previously initialized blobstore (§4.G "load").
    pub fn load(dev: Box<dyn BsDev>, opts: BsOpts, log: slog::Logger) -> Result<Blobstore, Errno> {
        info!(log, "loading blobstore");
        let dev_channel = dev.create_channel();
        let mut md_channel = Channel::new(dev_channel, opts.max_md_ops as usize);
        let lba_per_page = PAGE_SIZE as u64 / dev.blocklen() as u64;

        let mut buf = vec![0u8; PAGE_SIZE];
        {
            let mut seq = Sequence::new(&mut md_channel);
            seq.read(&*dev, &mut buf, 0, lba_per_page);
            let err = seq.finish();
            if !err.is_ok() {
                return Err(err);
            }
        }
        let mut sb = Superblock::decode(&buf)?;

        let bstype_specified = opts.bstype != [0u8; 16];
        if bstype_specified && sb.bstype != opts.bstype {
            return Err(Errno::from(format::Error::BsTypeMismatch));
        }

        let current_size = dev.blockcnt() * dev.blocklen() as u64;
        if sb.size == 0 {
            sb.size = current_size;
        } else if current_size < sb.size {
            return Err(Errno::from(format::Error::DeviceShrank));
        }

        if !sb.clean {
            return Err(Errno::from(format::Error::UncleanShutdown));
        }

        let layout = Layout { blocklen: dev.blocklen(), cluster_size: sb.cluster_size, md_start: sb.md_start };
        let total_clusters = sb.size / dev.blocklen() as u64 / layout.lba_per_cluster();

        let mut used_md_pages = Allocator::new();
        used_md_pages.resize(sb.md_len as usize);
        if sb.used_page_mask_len > 0 {
            let pages = read_mask_pages(&*dev, &mut md_channel, &layout, sb.used_page_mask_start, sb.used_page_mask_len)?;
            let refs: Vec<&[u8]> = pages.iter().map(|p| p.as_slice()).collect();
            *used_md_pages.bits_mut() = MaskPage::decode(&refs, sb.md_len as usize);
        }
        used_md_pages.recompute_free_count();

        let mut used_clusters = Allocator::new();
        used_clusters.resize(total_clusters as usize);
        if sb.used_cluster_mask_len > 0 {
            let pages = read_mask_pages(&*dev, &mut md_channel, &layout, sb.used_cluster_mask_start, sb.used_cluster_mask_len)?;
            let refs: Vec<&[u8]> = pages.iter().map(|p| p.as_slice()).collect();
            *used_clusters.bits_mut() = MaskPage::decode(&refs, total_clusters as usize);
        }
        used_clusters.recompute_free_count();

        let io_unit_size = if sb.io_unit_size == 0 { PAGE_SIZE as u32 } else { sb.io_unit_size };

        let mut bs = Blobstore {
            dev,
            log,
            total_clusters,
            used_md_pages,
            used_clusters,
            blobs: HashMap::new(),
            md_channel,
            super_blob: sb.super_blob,
            io_unit_size,
            md_thread_registered: false,
            used_page_mask_start: sb.used_page_mask_start,
            used_page_mask_len: sb.used_page_mask_len,
            used_cluster_mask_start: sb.used_cluster_mask_start,
            used_cluster_mask_len: sb.used_cluster_mask_len,
            used_blobid_mask_start: sb.used_blobid_mask_start,
            used_blobid_mask_len: sb.used_blobid_mask_len,
            layout,
            opts,
        };

        // clean=0 in memory, persisted immediately (§4.G load step 8): a
        // crash between here and the next clean unload must not read back
        // as a clean shutdown.
        bs.write_superblock(false)?;

        // Validate every registered blob loads (§4.J: stricter than the
        // skip-on-error iteration done by `iter_first`/`iter_next` at
        // runtime — a corrupt blob found at mount time aborts the load).
        // Pages are only visited if they root a blob; a set bit that is
        // one of that blob's own continuation pages is skipped, since it
        // was already walked as part of its owner's chain.
        for idx in 0..bs.used_md_pages.capacity() {
            if !bs.used_md_pages.get(idx) {
                continue;
            }
            if !metadata::is_root_page(&*bs.dev, &mut bs.md_channel, &bs.layout, idx as u32)? {
                continue;
            }
            let id = BlobId::from_page_idx(idx as u32);
            let mut tmp = Blob::new(id, idx as u32);
            metadata::load_blob(&*bs.dev, &mut bs.md_channel, &bs.layout, &bs.used_clusters, &mut tmp)?;
        }

        Ok(bs)
    }

    fn write_superblock(&mut self, clean: bool) -> Result<(), Errno> {
        let sb = Superblock {
            version: format::VERSION,
            clean,
            super_blob: self.super_blob,
            cluster_size: self.layout.cluster_size,
            used_page_mask_start: self.used_page_mask_start,
            used_page_mask_len: self.used_page_mask_len,
            used_cluster_mask_start: self.used_cluster_mask_start,
            used_cluster_mask_len: self.used_cluster_mask_len,
            used_blobid_mask_start: self.used_blobid_mask_start,
            used_blobid_mask_len: self.used_blobid_mask_len,
            md_start: self.layout.md_start,
            md_len: self.used_md_pages.capacity() as u32,
            bstype: self.opts.bstype,
            size: self.dev.blockcnt() * self.dev.blocklen() as u64,
            io_unit_size: self.io_unit_size,
        };
        let buf = sb.encode();
        let mut seq = Sequence::new(&mut self.md_channel);
        seq.write(&*self.dev, &buf, 0, self.layout.lba_per_page());
        let err = seq.finish();
        if err.is_ok() {
            Ok(())
        } else {
            Err(err)
        }
    }

    /// Flush masks and the superblock with `clean = true`, then tear down
    /// channels (§4.G "unload"). Refused while any blob is still open.
    pub fn unload(mut self) -> Result<(), Errno> {
        if self.blobs.values().any(|b| b.open_ref > 0) {
            return Err(Errno::EBUSY);
        }
        info!(self.log, "unloading blobstore");
        write_mask_pages(&*self.dev, &mut self.md_channel, &self.layout, self.used_page_mask_start, self.used_page_mask_len, self.used_md_pages.bits())?;
        write_mask_pages(&*self.dev, &mut self.md_channel, &self.layout, self.used_cluster_mask_start, self.used_cluster_mask_len, self.used_clusters.bits())?;
        self.write_superblock(true)?;
        self.dev.destroy_channel(self.md_channel.dev_channel);
        Ok(())
    }

    /// Erase the superblock and tear down the device entirely (§4.G
    /// "destroy").
    pub fn destroy(mut self) -> Result<(), Errno> {
        info!(self.log, "destroying blobstore");
        let zero = [0u8; PAGE_SIZE];
        let mut seq = Sequence::new(&mut self.md_channel);
        seq.write(&*self.dev, &zero, 0, self.layout.lba_per_page());
        let err = seq.finish();
        self.dev.destroy_channel(self.md_channel.dev_channel);
        self.dev.destroy();
        if err.is_ok() {
            Ok(())
        } else {
            Err(err)
        }
    }

    // ---- Blob lifecycle (§4.E) ----------------------------------------

    fn resize_blob_on(&mut self, blob: &mut Blob, num_clusters: u64) -> Result<(), Errno> {
        if num_clusters > self.total_clusters {
            return Err(Errno::EINVAL);
        }
        if num_clusters == blob.active.num_clusters {
            return Ok(());
        }
        if num_clusters < blob.active.cluster_array_size() {
            blob.active.num_clusters = num_clusters;
            blob.mark_dirty();
            return Ok(());
        }
        if blob.is_thin_provisioned() {
            blob.active.clusters.resize(num_clusters as usize, 0);
            blob.active.num_clusters = num_clusters;
            blob.mark_dirty();
            return Ok(());
        }

        let additional = num_clusters - blob.active.num_clusters;
        let mut scratch = Vec::with_capacity(additional as usize);
        let mut cursor = 0;
        for _ in 0..additional {
            match self.used_clusters.find_first_clear(cursor) {
                Some(idx) => {
                    scratch.push(idx);
                    cursor = idx + 1;
                }
                None => return Err(Errno::ENOMEM),
            }
        }
        for idx in scratch {
            self.used_clusters.claim(idx);
            blob.active.clusters.push(self.layout.cluster_to_lba(idx as u64));
        }
        blob.active.num_clusters = num_clusters;
        blob.mark_dirty();
        Ok(())
    }

    /// Allocate a blob, persist its initial metadata, and return its id
    /// (§4.E "create_blob").
    pub fn create_blob(&mut self, opts: BlobOpts) -> Result<BlobId, Errno> {
        let page_idx = self.used_md_pages.find_first_clear(0).ok_or(Errno::ENOMEM)?;
        self.used_md_pages.claim(page_idx);
        let id = BlobId::from_page_idx(page_idx as u32);
        let mut blob = Blob::new(id, page_idx as u32);
        blob.set_thin_provisioned(opts.thin_provision);
        for (name, value) in &opts.xattrs {
            blob.set_xattr(name, value);
        }
        if opts.clear_method != ClearMethod::Default {
            blob.set_clear_method(opts.clear_method);
        }

        if opts.num_clusters > 0 {
            if let Err(e) = self.resize_blob_on(&mut blob, opts.num_clusters) {
                self.used_md_pages.release(page_idx);
                return Err(e);
            }
        }

        debug!(self.log, "creating blob"; "blob_id" => page_idx, "thin" => opts.thin_provision);
        match metadata::persist_blob(&*self.dev, &mut self.md_channel, &self.layout, &mut self.used_md_pages, &mut self.used_clusters, &mut blob) {
            Ok(()) => {
                self.blobs.insert(id, blob);
                Ok(id)
            }
            Err(e) => {
                self.used_md_pages.release(page_idx);
                Err(e)
            }
        }
    }

    /// Open (or re-open) a blob, loading its metadata the first time
    /// (§4.E "open_blob").
    pub fn open_blob(&mut self, id: BlobId) -> Result<(), Errno> {
        if let Some(blob) = self.blobs.get_mut(&id) {
            blob.open_ref += 1;
            return Ok(());
        }
        let page_idx = id.page_idx();
        if !self.used_md_pages.get(page_idx as usize) {
            return Err(Errno::ENOENT);
        }
        let mut blob = Blob::new(id, page_idx);
        metadata::load_blob(&*self.dev, &mut self.md_channel, &self.layout, &self.used_clusters, &mut blob)?;
        let backing = blob.back_bs_dev;
        blob.open_ref = 1;
        self.blobs.insert(id, blob);

        // A clone or snapshot's data reads fall through to its backing
        // blob (§4.A); that blob must be resident for the fallthrough to
        // find it, so opening a blob recursively opens its whole backing
        // chain, the way opening a clone also opens its snapshot.
        if let Backing::Parent(parent_id) = backing {
            if let Err(e) = self.open_blob(parent_id) {
                self.blobs.remove(&id);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drop one open reference; on the last one, sync if dirty and drop
    /// the in-memory blob (§4.E "close_blob").
    pub fn close_blob(&mut self, id: BlobId) -> Result<(), Errno> {
        let mut blob = self.blobs.remove(&id).ok_or(Errno::EBADF)?;
        if blob.open_ref == 0 {
            self.blobs.insert(id, blob);
            return Err(Errno::EBADF);
        }
        blob.open_ref -= 1;
        if blob.open_ref > 0 {
            self.blobs.insert(id, blob);
            return Ok(());
        }
        let backing = blob.back_bs_dev;
        let result = if blob.state == BlobState::Dirty {
            metadata::persist_blob(&*self.dev, &mut self.md_channel, &self.layout, &mut self.used_md_pages, &mut self.used_clusters, &mut blob)
        } else {
            Ok(())
        };
        // Undo the implicit open of the backing chain made in `open_blob`.
        if let Backing::Parent(parent_id) = backing {
            let _ = self.close_blob(parent_id);
        }
        result
    }

    /// Grow or shrink a blob's logical cluster count (§4.E "resize_blob").
    pub fn resize_blob(&mut self, id: BlobId, num_clusters: u64) -> Result<(), Errno> {
        {
            let blob = self.blobs.get(&id).ok_or(Errno::ENOENT)?;
            blob.guard_mutable_state()?;
        }
        let mut blob = self.blobs.remove(&id).unwrap();
        let result = self.resize_blob_on(&mut blob, num_clusters);
        self.blobs.insert(id, blob);
        result
    }

    /// Scan every registered blob for one whose `parent_id` is `id`,
    /// including blobs not currently open. Used by `delete_blob` to
    /// refuse deleting a snapshot any clone still references, even a
    /// clone nobody has opened this session (§4.I).
    fn any_blob_references(&mut self, id: BlobId) -> Result<bool, Errno> {
        for page_idx in 0..self.used_md_pages.capacity() {
            if !self.used_md_pages.get(page_idx) {
                continue;
            }
            let candidate_id = BlobId::from_page_idx(page_idx as u32);
            if candidate_id == id {
                continue;
            }
            if let Some(open) = self.blobs.get(&candidate_id) {
                if open.parent_id == id {
                    return Ok(true);
                }
                continue;
            }
            if !metadata::is_root_page(&*self.dev, &mut self.md_channel, &self.layout, page_idx as u32)? {
                continue;
            }
            let mut tmp = Blob::new(candidate_id, page_idx as u32);
            if metadata::load_blob(&*self.dev, &mut self.md_channel, &self.layout, &self.used_clusters, &mut tmp).is_ok() && tmp.parent_id == id {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Delete a blob: refused if open or if any clone still references it
    /// (§4.E "delete_blob", §4.I).
    pub fn delete_blob(&mut self, id: BlobId) -> Result<(), Errno> {
        if self.blobs.get(&id).map_or(false, |b| b.open_ref > 0) {
            return Err(Errno::EBUSY);
        }
        let page_idx = id.page_idx();
        if !self.used_md_pages.get(page_idx as usize) {
            return Err(Errno::ENOENT);
        }
        if self.any_blob_references(id)? {
            return Err(Errno::EBUSY);
        }

        let mut blob = match self.blobs.remove(&id) {
            Some(blob) => blob,
            None => {
                let mut blob = Blob::new(id, page_idx);
                metadata::load_blob(&*self.dev, &mut self.md_channel, &self.layout, &self.used_clusters, &mut blob)?;
                blob
            }
        };
        metadata::persist_delete_blob(&*self.dev, &mut self.md_channel, &self.layout, &mut self.used_md_pages, &mut self.used_clusters, &mut blob);
        Ok(())
    }

    /// Persist a blob's pending changes (§4.E "sync_blob").
    pub fn sync_blob(&mut self, id: BlobId) -> Result<(), Errno> {
        {
            let blob = self.blobs.get(&id).ok_or(Errno::ENOENT)?;
            if blob.state == BlobState::Clean {
                return Ok(());
            }
            blob.guard_mutable_state()?;
        }
        let mut blob = self.blobs.remove(&id).unwrap();
        let result = metadata::persist_blob(&*self.dev, &mut self.md_channel, &self.layout, &mut self.used_md_pages, &mut self.used_clusters, &mut blob);
        self.blobs.insert(id, blob);
        result
    }

    // ---- Iteration & super-blob (§4.J) ---------------------------------

    fn iter_from(&mut self, start_page: usize) -> Result<BlobId, Errno> {
        let mut page = start_page;
        loop {
            match self.used_md_pages.find_first_set(page) {
                Some(idx) => {
                    match metadata::is_root_page(&*self.dev, &mut self.md_channel, &self.layout, idx as u32) {
                        Ok(true) => {}
                        Ok(false) => {
                            page = idx + 1;
                            continue;
                        }
                        Err(e) => {
                            warn!(self.log, "skipping blob that failed to load during iteration"; "blob_id" => idx, "error" => e.0);
                            page = idx + 1;
                            continue;
                        }
                    }
                    let id = BlobId::from_page_idx(idx as u32);
                    let mut tmp = Blob::new(id, idx as u32);
                    match metadata::load_blob(&*self.dev, &mut self.md_channel, &self.layout, &self.used_clusters, &mut tmp) {
                        Ok(()) => return Ok(id),
                        Err(e) => {
                            warn!(self.log, "skipping blob that failed to load during iteration"; "blob_id" => idx, "error" => e.0);
                            page = idx + 1;
                        }
                    }
                }
                None => return Err(Errno::ENOENT),
            }
        }
    }

    /// First blob in iteration order, skipping (not aborting on) any that
    /// fail to load (§4.J).
    pub fn iter_first(&mut self) -> Result<BlobId, Errno> {
        self.iter_from(0)
    }

    /// Next blob after `current` in iteration order.
    pub fn iter_next(&mut self, current: BlobId) -> Result<BlobId, Errno> {
        self.iter_from(current.page_idx() as usize + 1)
    }

    /// Designate `id` as the blobstore's super-blob, persisted through
    /// the superblock on the next `unload` (§4.J).
    pub fn set_super(&mut self, id: BlobId) {
        self.super_blob = id;
    }

    pub fn get_super(&self) -> Result<BlobId, Errno> {
        if self.super_blob.is_invalid() {
            Err(Errno::ENOENT)
        } else {
            Ok(self.super_blob)
        }
    }

    // ---- Sizing & accounting -------------------------------------------

    pub fn get_cluster_size(&self) -> u32 {
        self.layout.cluster_size
    }

    pub fn get_page_size(&self) -> u32 {
        PAGE_SIZE as u32
    }

    pub fn get_io_unit_size(&self) -> u32 {
        self.io_unit_size
    }

    pub fn free_cluster_count(&self) -> u64 {
        self.used_clusters.free_count() as u64
    }

    pub fn total_data_cluster_count(&self) -> u64 {
        self.total_clusters
    }

    /// Number of logical pages in `id`, for adapters (`bsdev::BlobBsDev`)
    /// that expose a blob's data as a page-addressed device in its own
    /// right.
    pub fn blob_num_pages(&self, id: BlobId) -> Result<u64, Errno> {
        let blob = self.blobs.get(&id).ok_or(Errno::ENOENT)?;
        Ok(blob.active.num_clusters * self.layout.pages_per_cluster())
    }

    // ---- Executor & channel registration (§5) --------------------------

    pub fn register_md_thread(&mut self) -> Result<(), Errno> {
        if self.md_thread_registered {
            return Err(Errno::EBUSY);
        }
        self.md_thread_registered = true;
        Ok(())
    }

    pub fn unregister_md_thread(&mut self) -> Result<(), Errno> {
        if !self.md_thread_registered {
            return Err(Errno::EBADF);
        }
        self.md_thread_registered = false;
        Ok(())
    }

    pub fn alloc_io_channel(&self) -> Channel {
        Channel::new(self.dev.create_channel(), self.opts.max_channel_ops as usize)
    }

    pub fn free_io_channel(&self, channel: Channel) {
        self.dev.destroy_channel(channel.dev_channel);
    }

    pub fn io_flush_channel(&self, channel: &Channel) -> Result<(), Errno> {
        self.dev.flush(channel.dev_channel)
    }

    // ---- Data I/O (§4.H) ------------------------------------------------

    pub fn io_read(&self, channel: &mut Channel, id: BlobId, buf: &mut [u8], page_offset: u64, page_length: u64) -> Result<(), Errno> {
        let blob = self.blobs.get(&id).ok_or(Errno::EBADF)?;
        io::read(&*self.dev, channel, &self.layout, blob, &self.blobs, buf, page_offset, page_length)
    }

    pub fn io_write(&mut self, channel: &mut Channel, id: BlobId, buf: &[u8], page_offset: u64, page_length: u64) -> Result<(), Errno> {
        let mut blob = self.blobs.remove(&id).ok_or(Errno::EBADF)?;
        let result = io::write(&*self.dev, channel, &self.layout, &mut self.used_clusters, &mut blob, &self.blobs, buf, page_offset, page_length);
        self.blobs.insert(id, blob);
        result
    }

    pub fn io_readv(&self, channel: &mut Channel, id: BlobId, iovs: &mut [&mut [u8]], page_offset: u64, page_length: u64) -> Result<(), Errno> {
        let blob = self.blobs.get(&id).ok_or(Errno::EBADF)?;
        io::readv(&*self.dev, channel, &self.layout, blob, &self.blobs, iovs, page_offset, page_length)
    }

    pub fn io_writev(&mut self, channel: &mut Channel, id: BlobId, iovs: &[&[u8]], page_offset: u64, page_length: u64) -> Result<(), Errno> {
        let mut blob = self.blobs.remove(&id).ok_or(Errno::EBADF)?;
        let result = io::writev(&*self.dev, channel, &self.layout, &mut self.used_clusters, &mut blob, &self.blobs, iovs, page_offset, page_length);
        self.blobs.insert(id, blob);
        result
    }

    pub fn io_unmap(&self, channel: &mut Channel, id: BlobId, page_offset: u64, page_length: u64) -> Result<(), Errno> {
        let blob = self.blobs.get(&id).ok_or(Errno::EBADF)?;
        io::unmap(&*self.dev, channel, &self.layout, blob, page_offset, page_length)
    }

    pub fn io_write_zeroes(&self, channel: &mut Channel, id: BlobId, page_offset: u64, page_length: u64) -> Result<(), Errno> {
        let blob = self.blobs.get(&id).ok_or(Errno::EBADF)?;
        io::write_zeroes(&*self.dev, channel, &self.layout, blob, page_offset, page_length)
    }

    // ---- Blob attributes -------------------------------------------------

    pub fn set_xattr(&mut self, id: BlobId, name: &str, value: &[u8]) -> Result<(), Errno> {
        let blob = self.blobs.get_mut(&id).ok_or(Errno::ENOENT)?;
        blob.guard_mutable_state()?;
        if blob.md_ro() {
            return Err(Errno::EPERM);
        }
        blob.set_xattr(name, value);
        Ok(())
    }

    pub fn remove_xattr(&mut self, id: BlobId, name: &str) -> Result<(), Errno> {
        let blob = self.blobs.get_mut(&id).ok_or(Errno::ENOENT)?;
        blob.guard_mutable_state()?;
        if blob.md_ro() {
            return Err(Errno::EPERM);
        }
        blob.remove_xattr(name)
    }

    pub fn get_xattr_value(&self, id: BlobId, name: &str) -> Result<Vec<u8>, Errno> {
        let blob = self.blobs.get(&id).ok_or(Errno::ENOENT)?;
        blob.get_xattr(name).map(|v| v.to_vec()).ok_or(Errno::ENOENT)
    }

    pub fn get_xattr_names(&self, id: BlobId) -> Result<Vec<String>, Errno> {
        let blob = self.blobs.get(&id).ok_or(Errno::ENOENT)?;
        Ok(blob.xattr_names())
    }

    pub fn set_read_only(&mut self, id: BlobId) -> Result<(), Errno> {
        let blob = self.blobs.get_mut(&id).ok_or(Errno::ENOENT)?;
        blob.guard_mutable_state()?;
        blob.set_read_only();
        Ok(())
    }

    pub fn is_read_only(&self, id: BlobId) -> Result<bool, Errno> {
        Ok(self.blobs.get(&id).ok_or(Errno::ENOENT)?.data_ro())
    }

    pub fn is_snapshot(&self, id: BlobId) -> Result<bool, Errno> {
        Ok(snapshot::is_snapshot(self.blobs.get(&id).ok_or(Errno::ENOENT)?))
    }

    pub fn is_clone(&self, id: BlobId) -> Result<bool, Errno> {
        Ok(self.blobs.get(&id).ok_or(Errno::ENOENT)?.is_clone())
    }

    pub fn is_thin_provisioned(&self, id: BlobId) -> Result<bool, Errno> {
        Ok(self.blobs.get(&id).ok_or(Errno::ENOENT)?.is_thin_provisioned())
    }

    // ---- Snapshot / clone (§4.I) ----------------------------------------

    pub fn create_snapshot(&mut self, source_id: BlobId, xattrs: Vec<(String, Vec<u8>)>) -> Result<BlobId, Errno> {
        snapshot::create_snapshot(&*self.dev, &mut self.md_channel, &self.layout, &mut self.used_md_pages, &mut self.used_clusters, &mut self.blobs, source_id, xattrs)
    }

    pub fn create_clone(&mut self, snapshot_id: BlobId) -> Result<BlobId, Errno> {
        snapshot::create_clone(&*self.dev, &mut self.md_channel, &self.layout, &mut self.used_md_pages, &mut self.used_clusters, &mut self.blobs, snapshot_id)
    }

    pub fn inflate(&mut self, blob_id: BlobId) -> Result<(), Errno> {
        snapshot::inflate(&*self.dev, &mut self.md_channel, &self.layout, &mut self.used_md_pages, &mut self.used_clusters, &mut self.blobs, blob_id)
    }

    pub fn decouple_parent(&mut self, blob_id: BlobId) -> Result<(), Errno> {
        snapshot::decouple_parent(&*self.dev, &mut self.md_channel, &self.layout, &mut self.used_md_pages, &mut self.used_clusters, &mut self.blobs, blob_id)
    }

    pub fn get_parent_snapshot(&self, id: BlobId) -> BlobId {
        snapshot::get_parent_snapshot(&self.blobs, id)
    }

    pub fn get_clones(&self, id: BlobId) -> Vec<BlobId> {
        snapshot::get_clones(&self.blobs, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsdev::MemDisk;

    fn test_opts() -> BsOpts {
        BsOpts { cluster_size: 4 * PAGE_SIZE as u32, num_md_pages: 64, max_md_ops: 32, max_channel_ops: 512, bstype: [0; 16], clear_method: ClearMethod::Default }
    }

    fn test_log() -> slog::Logger {
        slog::Logger::root(slog::Discard, o!())
    }

    #[test]
    fn init_create_write_read_unload_load_read() {
        let backing = MemDisk::new(16384, 512);
        let mut bs = Blobstore::init(Box::new(backing.reopen()), test_opts(), test_log()).unwrap();

        let id = bs.create_blob(BlobOpts { thin_provision: false, num_clusters: 2, ..Default::default() }).unwrap();
        bs.open_blob(id).unwrap();

        let mut channel = bs.alloc_io_channel();
        let data = vec![0x42u8; PAGE_SIZE];
        bs.io_write(&mut channel, id, &data, 0, 1).unwrap();
        bs.sync_blob(id).unwrap();
        bs.close_blob(id).unwrap();
        bs.free_io_channel(channel);

        bs.unload().unwrap();

        let mut bs2 = Blobstore::load(Box::new(backing.reopen()), test_opts(), test_log()).unwrap();
        bs2.open_blob(id).unwrap();
        let mut channel2 = bs2.alloc_io_channel();
        let mut out = vec![0u8; PAGE_SIZE];
        bs2.io_read(&mut channel2, id, &mut out, 0, 1).unwrap();
        assert_eq!(out, data);
        bs2.close_blob(id).unwrap();
        bs2.free_io_channel(channel2);
        bs2.unload().unwrap();
    }

    #[test]
    fn dirty_shutdown_is_rejected_on_reload() {
        let backing = MemDisk::new(16384, 512);
        let bs = Blobstore::init(Box::new(backing.reopen()), test_opts(), test_log()).unwrap();
        // Dropped without calling `unload`: the on-disk superblock still
        // has `clean = false` from `init`, simulating a crash.
        drop(bs);

        let err = Blobstore::load(Box::new(backing.reopen()), test_opts(), test_log()).unwrap_err();
        assert_eq!(err, Errno::EILSEQ);
    }

    #[test]
    fn delete_blob_refused_while_snapshot_has_clone() {
        let backing = MemDisk::new(16384, 512);
        let mut bs = Blobstore::init(Box::new(backing.reopen()), test_opts(), test_log()).unwrap();

        let source = bs.create_blob(BlobOpts { thin_provision: true, num_clusters: 2, ..Default::default() }).unwrap();
        bs.open_blob(source).unwrap();
        let snap = bs.create_snapshot(source, Vec::new()).unwrap();
        let clone_id = bs.create_clone(snap).unwrap();
        bs.close_blob(source).unwrap();

        assert_eq!(bs.delete_blob(snap), Err(Errno::EBUSY));

        bs.delete_blob(clone_id).unwrap();
        bs.delete_blob(snap).unwrap();
    }

    #[test]
    fn open_clone_after_reload_reads_inherited_data_without_opening_snapshot() {
        let backing = MemDisk::new(16384, 512);
        let mut bs = Blobstore::init(Box::new(backing.reopen()), test_opts(), test_log()).unwrap();

        let source = bs.create_blob(BlobOpts { thin_provision: true, num_clusters: 2, ..Default::default() }).unwrap();
        bs.open_blob(source).unwrap();
        let mut channel = bs.alloc_io_channel();
        let data = vec![0x7au8; PAGE_SIZE];
        bs.io_write(&mut channel, source, &data, 0, 1).unwrap();
        bs.sync_blob(source).unwrap();
        let snap = bs.create_snapshot(source, Vec::new()).unwrap();
        let clone_id = bs.create_clone(snap).unwrap();
        bs.close_blob(source).unwrap();
        bs.free_io_channel(channel);
        bs.unload().unwrap();

        // Fresh load: nothing is resident until opened.
        let mut bs2 = Blobstore::load(Box::new(backing.reopen()), test_opts(), test_log()).unwrap();
        bs2.open_blob(clone_id).unwrap();
        let mut channel2 = bs2.alloc_io_channel();
        let mut out = vec![0u8; PAGE_SIZE];
        bs2.io_read(&mut channel2, clone_id, &mut out, 0, 1).unwrap();
        assert_eq!(out, data);
        bs2.close_blob(clone_id).unwrap();
        bs2.free_io_channel(channel2);
        bs2.unload().unwrap();
    }
}
