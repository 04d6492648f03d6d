//! Snapshot / clone / inflate / decouple-parent (§4.I).
//!
//! A snapshot is just another blob in the same blobstore, so the whole
//! copy-on-write chain lives in one `HashMap<BlobId, Blob>` — no separate
//! per-blob device object is needed to express "fall through to the
//! parent" (see `io.rs`'s module doc comment and `blob::Backing`).

use std::collections::HashMap;

use crate::bitmap::Allocator;
use crate::blob::{Backing, Blob, DATA_RO_FLAGS_READ_ONLY, INVALID_FLAGS_THIN_PROVISIONING, MD_RO_FLAGS_READ_ONLY};
use crate::bsdev::BsDev;
use crate::errno::Errno;
use crate::format::{BlobId, Layout};
use crate::io;
use crate::metadata;
use crate::request::{Channel, UserOp};

/// A blob counts as a snapshot once both its data and metadata are
/// read-only — the state `create_snapshot` leaves its result in. There is
/// no separate "is a snapshot" bit; read-only-ness is the marker (§4.I
/// "create_clone ... requires the source to be read-only").
pub fn is_snapshot(blob: &Blob) -> bool {
    blob.data_ro() && blob.md_ro()
}

fn drain_frozen_queue(dev: &dyn BsDev, channel: &mut Channel, layout: &Layout, used_clusters: &mut Allocator, blob: &mut Blob, blobs: &HashMap<BlobId, Blob>) -> Result<(), Errno> {
    // `drain_queued` needs `&mut Channel` for its own bookkeeping, while
    // replaying each op needs `&mut Channel` again (plus `blob`/`blobs`)
    // for the actual device I/O. Collect the queue out first so the two
    // borrows of `channel` never overlap.
    let mut queue = Vec::new();
    channel.drain_queued(|op| {
        queue.push(op);
        Ok(())
    })?;

    let mut first_err = Errno::OK;
    for op in queue {
        let result = match op {
            UserOp::Write { lba: page_offset, data, .. } => {
                let page_length = data.len() as u64 / crate::format::PAGE_SIZE as u64;
                io::write(dev, channel, layout, used_clusters, blob, blobs, &data, page_offset, page_length)
            }
            UserOp::Unmap { lba: page_offset, lba_count: page_length, .. } => io::unmap(dev, channel, layout, blob, page_offset, page_length),
            UserOp::WriteZeroes { lba: page_offset, lba_count: page_length, .. } => io::write_zeroes(dev, channel, layout, blob, page_offset, page_length),
        };
        if let Err(e) = result {
            if first_err.is_ok() {
                first_err = e;
            }
        }
    }
    if first_err.is_ok() {
        Ok(())
    } else {
        Err(first_err)
    }
}

/// Create a point-in-time, read-only snapshot of `source_id`, swapping
/// `source`'s extent list out from under it so future writes on `source`
/// allocate fresh clusters while reads on unwritten clusters fall
/// through to the new snapshot (§4.I).
pub fn create_snapshot(
    dev: &dyn BsDev,
    channel: &mut Channel,
    layout: &Layout,
    used_md_pages: &mut Allocator,
    used_clusters: &mut Allocator,
    blobs: &mut HashMap<BlobId, Blob>,
    source_id: BlobId,
    xattrs: Vec<(String, Vec<u8>)>,
) -> Result<BlobId, Errno> {
    {
        let source = blobs.get_mut(&source_id).ok_or(Errno::ENOENT)?;
        source.frozen_refcnt += 1;
    }

    {
        let mut source = blobs.remove(&source_id).ok_or(Errno::ENOENT)?;
        let sync_result = if source.state == crate::blob::BlobState::Dirty {
            metadata::persist_blob(dev, channel, layout, used_md_pages, used_clusters, &mut source)
        } else {
            Ok(())
        };
        blobs.insert(source_id, source);
        sync_result?;
    }

    let snap_page = used_md_pages.find_first_clear(0).ok_or(Errno::ENOMEM)?;
    used_md_pages.claim(snap_page);
    let snap_id = BlobId::from_page_idx(snap_page as u32);
    let mut snap = Blob::new(snap_id, snap_page as u32);

    let (source_clusters, source_xattrs, source_backing) = {
        let source = blobs.get(&source_id).expect("source present");
        (source.active.clusters.clone(), source.xattrs.clone(), match source.back_bs_dev {
            Backing::Parent(id) => Backing::Parent(id),
            Backing::Zeroes => Backing::Zeroes,
            Backing::None => Backing::None,
        })
    };

    snap.active.num_clusters = source_clusters.len() as u64;
    snap.active.clusters = source_clusters;
    snap.data_ro_flags |= DATA_RO_FLAGS_READ_ONLY;
    snap.md_ro_flags |= MD_RO_FLAGS_READ_ONLY;
    snap.xattrs = source_xattrs;
    for (name, value) in xattrs {
        snap.set_xattr(&name, &value);
    }
    snap.back_bs_dev = source_backing;

    {
        let source = blobs.get_mut(&source_id).expect("source present");
        let n = source.active.clusters.len();
        source.active.clusters = vec![0; n];
        source.invalid_flags |= INVALID_FLAGS_THIN_PROVISIONING;
        source.back_bs_dev = Backing::Parent(snap_id);
        source.parent_id = snap_id;
        source.mark_dirty();
    }

    metadata::persist_blob(dev, channel, layout, used_md_pages, used_clusters, &mut snap)?;
    blobs.insert(snap_id, snap);

    {
        let mut source = blobs.remove(&source_id).expect("source present");
        let persist_result = metadata::persist_blob(dev, channel, layout, used_md_pages, used_clusters, &mut source);
        source.frozen_refcnt -= 1;
        let drain_result = if source.frozen_refcnt == 0 { drain_frozen_queue(dev, channel, layout, used_clusters, &mut source, blobs) } else { Ok(()) };
        blobs.insert(source_id, source);
        persist_result?;
        drain_result?;
    }

    Ok(snap_id)
}

/// Create an empty thin blob referencing `snapshot_id` (§4.I
/// "create_clone").
pub fn create_clone(
    dev: &dyn BsDev,
    channel: &mut Channel,
    layout: &Layout,
    used_md_pages: &mut Allocator,
    used_clusters: &mut Allocator,
    blobs: &mut HashMap<BlobId, Blob>,
    snapshot_id: BlobId,
) -> Result<BlobId, Errno> {
    let snapshot = blobs.get(&snapshot_id).ok_or(Errno::ENOENT)?;
    if !is_snapshot(snapshot) {
        return Err(Errno::EPERM);
    }
    let num_clusters = snapshot.active.num_clusters;

    let page = used_md_pages.find_first_clear(0).ok_or(Errno::ENOMEM)?;
    used_md_pages.claim(page);
    let clone_id = BlobId::from_page_idx(page as u32);
    let mut clone = Blob::new(clone_id, page as u32);
    clone.set_thin_provisioned(true);
    clone.active.num_clusters = num_clusters;
    clone.active.clusters = vec![0; num_clusters as usize];
    clone.parent_id = snapshot_id;
    clone.back_bs_dev = Backing::Parent(snapshot_id);

    metadata::persist_blob(dev, channel, layout, used_md_pages, used_clusters, &mut clone)?;
    blobs.insert(clone_id, clone);
    Ok(clone_id)
}

/// Materialize every unallocated cluster of `blob_id` from its backing
/// chain, then detach it entirely (§4.I "inflate").
pub fn inflate(
    dev: &dyn BsDev,
    channel: &mut Channel,
    layout: &Layout,
    used_md_pages: &mut Allocator,
    used_clusters: &mut Allocator,
    blobs: &mut HashMap<BlobId, Blob>,
    blob_id: BlobId,
) -> Result<(), Errno> {
    materialize(dev, channel, layout, used_clusters, blobs, blob_id, MaterializeScope::FullChain)?;

    let mut blob = blobs.remove(&blob_id).expect("blob present");
    blob.parent_id = BlobId::INVALID;
    blob.back_bs_dev = Backing::Zeroes;
    blob.invalid_flags &= !INVALID_FLAGS_THIN_PROVISIONING;
    blob.mark_dirty();
    let result = metadata::persist_blob(dev, channel, layout, used_md_pages, used_clusters, &mut blob);
    blobs.insert(blob_id, blob);
    result
}

/// Like `inflate`, but materializes only the clusters the immediate
/// parent itself owns; clusters unallocated all the way up the chain
/// remain thin, and the backing device becomes the grandparent (or
/// zeroes) afterward (§4.I "decouple_parent").
pub fn decouple_parent(
    dev: &dyn BsDev,
    channel: &mut Channel,
    layout: &Layout,
    used_md_pages: &mut Allocator,
    used_clusters: &mut Allocator,
    blobs: &mut HashMap<BlobId, Blob>,
    blob_id: BlobId,
) -> Result<(), Errno> {
    materialize(dev, channel, layout, used_clusters, blobs, blob_id, MaterializeScope::ImmediateParentOnly)?;

    let grandparent = {
        let blob = blobs.get(&blob_id).expect("blob present");
        match blob.parent_id.is_invalid() {
            true => Backing::Zeroes,
            false => {
                let parent = blobs.get(&blob.parent_id).expect("parent present");
                match parent.parent_id.is_invalid() {
                    true => Backing::Zeroes,
                    false => Backing::Parent(parent.parent_id),
                }
            }
        }
    };
    let new_parent_id = match grandparent {
        Backing::Parent(id) => id,
        _ => BlobId::INVALID,
    };

    let mut blob = blobs.remove(&blob_id).expect("blob present");
    blob.parent_id = new_parent_id;
    blob.back_bs_dev = grandparent;
    blob.mark_dirty();
    let result = metadata::persist_blob(dev, channel, layout, used_md_pages, used_clusters, &mut blob);
    blobs.insert(blob_id, blob);
    result
}

enum MaterializeScope {
    FullChain,
    ImmediateParentOnly,
}

fn materialize(
    dev: &dyn BsDev,
    channel: &mut Channel,
    layout: &Layout,
    used_clusters: &mut Allocator,
    blobs: &mut HashMap<BlobId, Blob>,
    blob_id: BlobId,
    scope: MaterializeScope,
) -> Result<(), Errno> {
    let unallocated: Vec<u64> = {
        let blob = blobs.get(&blob_id).ok_or(Errno::ENOENT)?;
        let n = blob.active.num_clusters;
        (0..n).filter(|&c| blob.active.clusters[c as usize] == 0).collect()
    };

    for cluster in unallocated {
        let owned_by_parent = match scope {
            MaterializeScope::FullChain => true,
            MaterializeScope::ImmediateParentOnly => {
                let blob = blobs.get(&blob_id).expect("blob present");
                match blob.back_bs_dev {
                    Backing::Parent(parent_id) => {
                        let parent = blobs.get(&parent_id).expect("parent present");
                        parent.active.clusters[cluster as usize] != 0
                    }
                    _ => false,
                }
            }
        };
        if !owned_by_parent {
            continue;
        }

        let cluster_pages = layout.pages_per_cluster();
        let page_offset = cluster * cluster_pages;
        let mut tmp = vec![0u8; (cluster_pages * crate::format::PAGE_SIZE as u64) as usize];

        {
            let blob = blobs.remove(&blob_id).expect("blob present");
            let read_result = io::read(dev, channel, layout, &blob, blobs, &mut tmp, page_offset, cluster_pages);
            blobs.insert(blob_id, blob);
            read_result?;
        }

        let idx = used_clusters.find_first_clear(0).ok_or(Errno::ENOMEM)?;
        used_clusters.claim(idx);
        let new_lba = layout.cluster_to_lba(idx as u64);
        let mut seq = crate::request::Sequence::new(channel);
        seq.write(dev, &tmp, new_lba, layout.lba_per_cluster());
        let err = seq.finish();
        if !err.is_ok() {
            used_clusters.release(idx);
            return Err(err);
        }

        let blob = blobs.get_mut(&blob_id).expect("blob present");
        blob.active.clusters[cluster as usize] = new_lba;
        blob.mark_dirty();
    }

    Ok(())
}

/// `parent_id` or `Invalid` if the blob has none (§4.I "Relationships").
pub fn get_parent_snapshot(blobs: &HashMap<BlobId, Blob>, blob_id: BlobId) -> BlobId {
    blobs.get(&blob_id).map(|b| b.parent_id).unwrap_or(BlobId::INVALID)
}

/// Every open blob whose `parent_id == snapshot_id` (§4.I "Relationships").
pub fn get_clones(blobs: &HashMap<BlobId, Blob>, snapshot_id: BlobId) -> Vec<BlobId> {
    blobs.values().filter(|b| b.parent_id == snapshot_id).map(|b| b.id).collect()
}

/// Refuse deleting a snapshot that any open clone still references (§4.I
/// "Delete of a snapshot is refused while any clone still references
/// it.").
pub fn guard_delete_snapshot(blobs: &HashMap<BlobId, Blob>, blob_id: BlobId) -> Result<(), Errno> {
    if get_clones(blobs, blob_id).is_empty() {
        Ok(())
    } else {
        Err(Errno::EBUSY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsdev::MemDisk;
    use crate::format::PAGE_SIZE;

    fn test_layout() -> Layout {
        Layout { blocklen: 512, cluster_size: 4 * PAGE_SIZE as u32, md_start: 8 }
    }

    fn new_blob(used_md_pages: &mut Allocator, num_clusters: u64, used_clusters: &mut Allocator, layout: &Layout) -> Blob {
        let page = used_md_pages.find_first_clear(0).unwrap();
        used_md_pages.claim(page);
        let mut blob = Blob::new(BlobId::from_page_idx(page as u32), page as u32);
        blob.active.num_clusters = num_clusters;
        blob.active.clusters = (0..num_clusters)
            .map(|_| {
                let idx = used_clusters.find_first_clear(0).unwrap();
                used_clusters.claim(idx);
                layout.cluster_to_lba(idx as u64)
            })
            .collect();
        blob
    }

    fn read_cluster(dev: &dyn BsDev, channel: &mut Channel, layout: &Layout, blob: &Blob, blobs: &HashMap<BlobId, Blob>, cluster: u64) -> Vec<u8> {
        let ppc = layout.pages_per_cluster();
        let mut buf = vec![0u8; (ppc * PAGE_SIZE as u64) as usize];
        io::read(dev, channel, layout, blob, blobs, &mut buf, cluster * ppc, ppc).unwrap();
        buf
    }

    /// Claim the low clusters that physically overlap the metadata
    /// region's LBA range, matching what `Blobstore::init` does before
    /// any blob ever claims a cluster (§4.G init step 4) — without it,
    /// cluster and metadata-page writes in these tests would alias the
    /// same LBAs.
    fn reserve_metadata_region(used_clusters: &mut Allocator) {
        for i in 0..16 {
            used_clusters.claim(i);
        }
    }

    #[test]
    fn snapshot_preserves_data_and_clone_reads_through() {
        let layout = test_layout();
        let dev = MemDisk::new(16384, layout.blocklen);
        let dev_channel = dev.create_channel();
        let mut channel = Channel::new(dev_channel, 512);
        let mut used_md_pages = Allocator::new();
        used_md_pages.resize(4096);
        let mut used_clusters = Allocator::new();
        used_clusters.resize(4096);
        reserve_metadata_region(&mut used_clusters);

        let mut blobs = HashMap::new();
        let mut source = new_blob(&mut used_md_pages, 5, &mut used_clusters, &layout);
        metadata::persist_blob(&dev, &mut channel, &layout, &mut used_md_pages, &mut used_clusters, &mut source).unwrap();
        let source_id = source.id;
        blobs.insert(source_id, source);

        let ppc = layout.pages_per_cluster();
        let p = vec![0xAAu8; (ppc * PAGE_SIZE as u64) as usize];
        {
            let mut source = blobs.remove(&source_id).unwrap();
            for cluster in 0..4u64 {
                io::write(&dev, &mut channel, &layout, &mut used_clusters, &mut source, &blobs, &p, cluster * ppc, ppc).unwrap();
            }
            blobs.insert(source_id, source);
        }

        let snap_id = create_snapshot(&dev, &mut channel, &layout, &mut used_md_pages, &mut used_clusters, &mut blobs, source_id, Vec::new()).unwrap();

        let q = vec![0x55u8; (ppc * PAGE_SIZE as u64) as usize];
        {
            let mut source = blobs.remove(&source_id).unwrap();
            io::write(&dev, &mut channel, &layout, &mut used_clusters, &mut source, &blobs, &q, ppc, ppc).unwrap();
            blobs.insert(source_id, source);
        }

        let zero = vec![0u8; (ppc * PAGE_SIZE as u64) as usize];
        assert_eq!(read_cluster(&dev, &mut channel, &layout, blobs.get(&source_id).unwrap(), &blobs, 0), p);
        assert_eq!(read_cluster(&dev, &mut channel, &layout, blobs.get(&source_id).unwrap(), &blobs, 1), q);
        assert_eq!(read_cluster(&dev, &mut channel, &layout, blobs.get(&source_id).unwrap(), &blobs, 2), p);
        assert_eq!(read_cluster(&dev, &mut channel, &layout, blobs.get(&source_id).unwrap(), &blobs, 3), p);
        assert_eq!(read_cluster(&dev, &mut channel, &layout, blobs.get(&source_id).unwrap(), &blobs, 4), zero);

        assert_eq!(read_cluster(&dev, &mut channel, &layout, blobs.get(&snap_id).unwrap(), &blobs, 0), p);
        assert_eq!(read_cluster(&dev, &mut channel, &layout, blobs.get(&snap_id).unwrap(), &blobs, 1), p);
        assert_eq!(read_cluster(&dev, &mut channel, &layout, blobs.get(&snap_id).unwrap(), &blobs, 4), zero);

        let clone_id = create_clone(&dev, &mut channel, &layout, &mut used_md_pages, &mut used_clusters, &mut blobs, snap_id).unwrap();
        assert_eq!(read_cluster(&dev, &mut channel, &layout, blobs.get(&clone_id).unwrap(), &blobs, 1), p);

        assert_eq!(get_parent_snapshot(&blobs, source_id), snap_id);
        assert_eq!(get_parent_snapshot(&blobs, clone_id), snap_id);
        assert!(get_clones(&blobs, snap_id).contains(&source_id));
        assert!(get_clones(&blobs, snap_id).contains(&clone_id));
        assert!(guard_delete_snapshot(&blobs, snap_id).is_err());
    }

    #[test]
    fn inflate_materializes_chain_and_detaches() {
        let layout = test_layout();
        let dev = MemDisk::new(16384, layout.blocklen);
        let dev_channel = dev.create_channel();
        let mut channel = Channel::new(dev_channel, 512);
        let mut used_md_pages = Allocator::new();
        used_md_pages.resize(4096);
        let mut used_clusters = Allocator::new();
        used_clusters.resize(4096);
        reserve_metadata_region(&mut used_clusters);

        let mut blobs = HashMap::new();
        let mut source = new_blob(&mut used_md_pages, 4, &mut used_clusters, &layout);
        let ppc = layout.pages_per_cluster();
        let p = vec![0x77u8; (ppc * PAGE_SIZE as u64) as usize];
        for cluster in 0..4u64 {
            io::write(&dev, &mut channel, &layout, &mut used_clusters, &mut source, &HashMap::new(), &p, cluster * ppc, ppc).unwrap();
        }
        metadata::persist_blob(&dev, &mut channel, &layout, &mut used_md_pages, &mut used_clusters, &mut source).unwrap();
        let source_id = source.id;
        blobs.insert(source_id, source);

        let snap_id = create_snapshot(&dev, &mut channel, &layout, &mut used_md_pages, &mut used_clusters, &mut blobs, source_id, Vec::new()).unwrap();
        let clone_id = create_clone(&dev, &mut channel, &layout, &mut used_md_pages, &mut used_clusters, &mut blobs, snap_id).unwrap();

        {
            let mut clone = blobs.remove(&clone_id).unwrap();
            io::write(&dev, &mut channel, &layout, &mut used_clusters, &mut clone, &blobs, &vec![0x11u8; (ppc * PAGE_SIZE as u64) as usize], 1 * ppc, ppc).unwrap();
            metadata::persist_blob(&dev, &mut channel, &layout, &mut used_md_pages, &mut used_clusters, &mut clone).unwrap();
            blobs.insert(clone_id, clone);
        }

        let free_before = used_clusters.free_count();
        inflate(&dev, &mut channel, &layout, &mut used_md_pages, &mut used_clusters, &mut blobs, clone_id).unwrap();
        let free_after = used_clusters.free_count();
        assert_eq!(free_before - free_after, 3);

        assert!(blobs.get(&clone_id).unwrap().parent_id.is_invalid());
        assert_eq!(blobs.get(&clone_id).unwrap().back_bs_dev, Backing::Zeroes);

        assert_eq!(read_cluster(&dev, &mut channel, &layout, blobs.get(&clone_id).unwrap(), &blobs, 0), p);
        assert_eq!(read_cluster(&dev, &mut channel, &layout, blobs.get(&clone_id).unwrap(), &blobs, 1), vec![0x11u8; (ppc * PAGE_SIZE as u64) as usize]);
    }
}
