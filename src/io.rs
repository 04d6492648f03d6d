//! Data I/O path (§4.H): logical-offset translation, cluster-boundary
//! splitting, allocate-on-write for thin-provisioned blobs, and the
//! frozen-I/O gate.
//!
//! A blob's `back_bs_dev` is resolved by looking up another entry in the
//! same blobstore's blob table rather than through a `BsDev` trait
//! object — every blob in a chain lives on the same physical device, so
//! "read from the parent" is a recursive call into this same module, not
//! a virtual dispatch through an adapter. `bsdev::BlobBsDev` exists for
//! external callers who want a blob shaped like a `BsDev`; internally the
//! fallthrough never needs it (see `blob.rs`'s module doc comment).

use std::collections::HashMap;

use crate::bitmap::Allocator;
use crate::blob::{Backing, Blob};
use crate::bsdev::BsDev;
use crate::errno::Errno;
use crate::format::{BlobId, Layout, PAGE_SIZE};
use crate::request::{Batch, Channel, Sequence, UserOp};

fn total_pages(layout: &Layout, blob: &Blob) -> u64 {
    blob.active.num_clusters * layout.pages_per_cluster()
}

fn validate_bounds(layout: &Layout, blob: &Blob, page_offset: u64, page_length: u64) -> Result<(), Errno> {
    match page_offset.checked_add(page_length) {
        Some(end) if end <= total_pages(layout, blob) => Ok(()),
        _ => Err(Errno::EINVAL),
    }
}

/// Pages remaining in `blob`'s extent before the next cluster boundary,
/// starting at logical page `page_offset`.
fn pages_to_cluster_boundary(layout: &Layout, page_offset: u64) -> u64 {
    let ppc = layout.pages_per_cluster();
    ppc - (page_offset % ppc)
}

fn zero_fill(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        *b = 0;
    }
}

/// Read exactly `page_len` pages, not crossing a cluster boundary, into
/// `buf`. Falls through to the parent chain (or zero) when the owning
/// cluster is unallocated (§4.H "Offset translation").
fn read_chunk(
    dev: &dyn BsDev,
    channel: &mut Channel,
    layout: &Layout,
    blob: &Blob,
    blobs: &HashMap<BlobId, Blob>,
    buf: &mut [u8],
    page_offset: u64,
    page_len: u64,
) -> Result<(), Errno> {
    let cluster = page_offset / layout.pages_per_cluster();
    let page_in_cluster = page_offset % layout.pages_per_cluster();
    let cluster_lba = blob.active.clusters[cluster as usize];

    if cluster_lba != 0 {
        let lba = cluster_lba + layout.page_to_lba(page_in_cluster);
        let mut seq = Sequence::new(channel);
        seq.read(dev, buf, lba, page_len * layout.lba_per_page());
        let err = seq.finish();
        return if err.is_ok() { Ok(()) } else { Err(err) };
    }

    match blob.back_bs_dev {
        Backing::None | Backing::Zeroes => {
            zero_fill(buf);
            Ok(())
        }
        Backing::Parent(parent_id) => {
            let parent = blobs.get(&parent_id).ok_or(Errno::EIO)?;
            read_chunk(dev, channel, layout, parent, blobs, buf, page_offset, page_len)
        }
    }
}

/// Read `page_length` pages starting at `page_offset` into `buf`
/// (§4.H "read"). Allowed even when the blob is data-read-only.
pub fn read(
    dev: &dyn BsDev,
    channel: &mut Channel,
    layout: &Layout,
    blob: &Blob,
    blobs: &HashMap<BlobId, Blob>,
    buf: &mut [u8],
    page_offset: u64,
    page_length: u64,
) -> Result<(), Errno> {
    validate_bounds(layout, blob, page_offset, page_length)?;

    let mut done = 0u64;
    while done < page_length {
        let boundary = pages_to_cluster_boundary(layout, page_offset + done);
        let chunk = boundary.min(page_length - done);
        let start = (done * PAGE_SIZE as u64) as usize;
        let end = ((done + chunk) * PAGE_SIZE as u64) as usize;
        read_chunk(dev, channel, layout, blob, blobs, &mut buf[start..end], page_offset + done, chunk)?;
        done += chunk;
    }
    Ok(())
}

/// Allocate a physical cluster for `cluster_idx`, copying existing parent
/// data into it first when the blob has a parent and the incoming write
/// does not cover the whole cluster (§4.H "write" step 4, Open Question 1:
/// allocation is a pre-flight step, never interleaved with I/O that could
/// still fail for lack of space).
fn allocate_cluster_for_write(
    dev: &dyn BsDev,
    channel: &mut Channel,
    layout: &Layout,
    used_clusters: &mut Allocator,
    blob: &mut Blob,
    blobs: &HashMap<BlobId, Blob>,
    cluster: u64,
    covers_whole_cluster: bool,
) -> Result<u64, Errno> {
    let idx = used_clusters.find_first_clear(0).ok_or(Errno::ENOMEM)?;
    used_clusters.claim(idx);
    let new_lba = layout.cluster_to_lba(idx as u64);

    if !covers_whole_cluster {
        let cluster_pages = layout.pages_per_cluster();
        let cluster_page_offset = cluster * cluster_pages;
        match blob.back_bs_dev {
            Backing::None | Backing::Zeroes => {
                if let Err(e) = dev.write_zeroes(channel.dev_channel, new_lba, layout.lba_per_cluster()) {
                    used_clusters.release(idx);
                    return Err(e);
                }
            }
            Backing::Parent(parent_id) => {
                let mut tmp = vec![0u8; (cluster_pages * PAGE_SIZE as u64) as usize];
                let parent = match blobs.get(&parent_id) {
                    Some(p) => p,
                    None => {
                        used_clusters.release(idx);
                        return Err(Errno::EIO);
                    }
                };
                if let Err(e) = read_chunk(dev, channel, layout, parent, blobs, &mut tmp, cluster_page_offset, cluster_pages) {
                    used_clusters.release(idx);
                    return Err(e);
                }
                let mut seq = Sequence::new(channel);
                seq.write(dev, &tmp, new_lba, layout.lba_per_cluster());
                let err = seq.finish();
                if !err.is_ok() {
                    used_clusters.release(idx);
                    return Err(err);
                }
            }
        }
    }

    blob.active.clusters[cluster as usize] = new_lba;
    blob.mark_dirty();
    Ok(new_lba)
}

/// Write `page_length` pages of `buf` starting at `page_offset`
/// (§4.H "write").
pub fn write(
    dev: &dyn BsDev,
    channel: &mut Channel,
    layout: &Layout,
    used_clusters: &mut Allocator,
    blob: &mut Blob,
    blobs: &HashMap<BlobId, Blob>,
    buf: &[u8],
    page_offset: u64,
    page_length: u64,
) -> Result<(), Errno> {
    validate_bounds(layout, blob, page_offset, page_length)?;
    if blob.data_ro() {
        return Err(Errno::EPERM);
    }
    if blob.frozen_refcnt > 0 {
        channel.enqueue(UserOp::Write { blob: blob.id, lba: page_offset, data: buf.to_vec() });
        return Ok(());
    }

    let mut batch = Batch::new(channel);
    let mut done = 0u64;
    let mut pending_err = Errno::OK;
    while done < page_length {
        let offset = page_offset + done;
        let cluster = offset / layout.pages_per_cluster();
        let boundary = pages_to_cluster_boundary(layout, offset);
        let chunk = boundary.min(page_length - done);

        let mut lba = blob.active.clusters[cluster as usize];
        if lba == 0 {
            if !blob.is_thin_provisioned() {
                pending_err = Errno::EIO;
                break;
            }
            let covers_whole = chunk == layout.pages_per_cluster();
            match allocate_cluster_for_write(dev, batch.channel_mut(), layout, used_clusters, blob, blobs, cluster, covers_whole) {
                Ok(new_lba) => lba = new_lba,
                Err(e) => {
                    pending_err = e;
                    break;
                }
            }
        }

        let page_in_cluster = offset % layout.pages_per_cluster();
        let chunk_lba = lba + layout.page_to_lba(page_in_cluster);
        let start = (done * PAGE_SIZE as u64) as usize;
        let end = ((done + chunk) * PAGE_SIZE as u64) as usize;
        batch.write(dev, &buf[start..end], chunk_lba, chunk * layout.lba_per_page());
        done += chunk;
    }

    let batch_err = batch.close();
    if !pending_err.is_ok() {
        Err(pending_err)
    } else if !batch_err.is_ok() {
        Err(batch_err)
    } else {
        Ok(())
    }
}

/// Unmap `page_length` pages starting at `page_offset`. A no-op over any
/// currently-unallocated (thin) cluster.
pub fn unmap(dev: &dyn BsDev, channel: &mut Channel, layout: &Layout, blob: &Blob, page_offset: u64, page_length: u64) -> Result<(), Errno> {
    validate_bounds(layout, blob, page_offset, page_length)?;
    run_per_cluster(dev, channel, layout, blob, page_offset, page_length, |dev, channel, lba, lba_count| dev.unmap(channel.dev_channel, lba, lba_count))
}

/// Write zeroes over `page_length` pages starting at `page_offset`. A
/// no-op over any currently-unallocated (thin) cluster (§9 Open
/// Question 2).
pub fn write_zeroes(dev: &dyn BsDev, channel: &mut Channel, layout: &Layout, blob: &Blob, page_offset: u64, page_length: u64) -> Result<(), Errno> {
    validate_bounds(layout, blob, page_offset, page_length)?;
    if blob.data_ro() {
        return Err(Errno::EPERM);
    }
    run_per_cluster(dev, channel, layout, blob, page_offset, page_length, |dev, channel, lba, lba_count| dev.write_zeroes(channel.dev_channel, lba, lba_count))
}

fn run_per_cluster(
    dev: &dyn BsDev,
    channel: &mut Channel,
    layout: &Layout,
    blob: &Blob,
    page_offset: u64,
    page_length: u64,
    mut op: impl FnMut(&dyn BsDev, &mut Channel, u64, u64) -> Result<(), Errno>,
) -> Result<(), Errno> {
    let mut done = 0u64;
    let mut first_err = Errno::OK;
    while done < page_length {
        let offset = page_offset + done;
        let cluster = offset / layout.pages_per_cluster();
        let boundary = pages_to_cluster_boundary(layout, offset);
        let chunk = boundary.min(page_length - done);

        let cluster_lba = blob.active.clusters[cluster as usize];
        if cluster_lba != 0 {
            let page_in_cluster = offset % layout.pages_per_cluster();
            let lba = cluster_lba + layout.page_to_lba(page_in_cluster);
            if let Err(e) = op(dev, channel, lba, chunk * layout.lba_per_page()) {
                if first_err.is_ok() {
                    first_err = e;
                }
            }
        }
        done += chunk;
    }
    if first_err.is_ok() {
        Ok(())
    } else {
        Err(first_err)
    }
}

/// Vectored read: if the whole request fits before the next cluster
/// boundary, issue one vectored op; otherwise split at both cluster and
/// iovec boundaries, reading each piece directly into its owning iovec's
/// sub-slice (§4.H "readv/writev", §9 "sub-iovec view").
pub fn readv(
    dev: &dyn BsDev,
    channel: &mut Channel,
    layout: &Layout,
    blob: &Blob,
    blobs: &HashMap<BlobId, Blob>,
    iovs: &mut [&mut [u8]],
    page_offset: u64,
    page_length: u64,
) -> Result<(), Errno> {
    validate_bounds(layout, blob, page_offset, page_length)?;

    let mut page_done = 0u64;
    let mut iov_idx = 0usize;
    let mut iov_byte_pos = 0usize;
    while page_done < page_length {
        let offset = page_offset + page_done;
        let cluster_boundary = pages_to_cluster_boundary(layout, offset);
        let iov_pages_left = (iovs[iov_idx].len() - iov_byte_pos) as u64 / PAGE_SIZE as u64;
        let chunk = cluster_boundary.min(iov_pages_left).min(page_length - page_done);
        assert!(chunk > 0, "iovec lengths must be page-aligned and cover page_length");

        let chunk_bytes = (chunk * PAGE_SIZE as u64) as usize;
        let slice = &mut iovs[iov_idx][iov_byte_pos..iov_byte_pos + chunk_bytes];
        read_chunk(dev, channel, layout, blob, blobs, slice, offset, chunk)?;

        iov_byte_pos += chunk_bytes;
        if iov_byte_pos == iovs[iov_idx].len() {
            iov_idx += 1;
            iov_byte_pos = 0;
        }
        page_done += chunk;
    }
    Ok(())
}

/// Vectored write, mirroring `readv`'s splitting (§4.H).
pub fn writev(
    dev: &dyn BsDev,
    channel: &mut Channel,
    layout: &Layout,
    used_clusters: &mut Allocator,
    blob: &mut Blob,
    blobs: &HashMap<BlobId, Blob>,
    iovs: &[&[u8]],
    page_offset: u64,
    page_length: u64,
) -> Result<(), Errno> {
    validate_bounds(layout, blob, page_offset, page_length)?;
    if blob.data_ro() {
        return Err(Errno::EPERM);
    }
    if blob.frozen_refcnt > 0 {
        let mut flat = Vec::new();
        for iov in iovs {
            flat.extend_from_slice(iov);
        }
        channel.enqueue(UserOp::Write { blob: blob.id, lba: page_offset, data: flat });
        return Ok(());
    }

    let mut page_done = 0u64;
    let mut iov_idx = 0usize;
    let mut iov_byte_pos = 0usize;
    while page_done < page_length {
        let offset = page_offset + page_done;
        let cluster = offset / layout.pages_per_cluster();
        let cluster_boundary = pages_to_cluster_boundary(layout, offset);
        let iov_pages_left = (iovs[iov_idx].len() - iov_byte_pos) as u64 / PAGE_SIZE as u64;
        let chunk = cluster_boundary.min(iov_pages_left).min(page_length - page_done);
        assert!(chunk > 0, "iovec lengths must be page-aligned and cover page_length");

        let mut lba = blob.active.clusters[cluster as usize];
        if lba == 0 {
            if !blob.is_thin_provisioned() {
                return Err(Errno::EIO);
            }
            let covers_whole = chunk == layout.pages_per_cluster();
            lba = allocate_cluster_for_write(dev, channel, layout, used_clusters, blob, blobs, cluster, covers_whole)?;
        }
        let page_in_cluster = offset % layout.pages_per_cluster();
        let chunk_lba = lba + layout.page_to_lba(page_in_cluster);

        let chunk_bytes = (chunk * PAGE_SIZE as u64) as usize;
        let slice = &iovs[iov_idx][iov_byte_pos..iov_byte_pos + chunk_bytes];
        let mut seq = Sequence::new(channel);
        seq.write(dev, slice, chunk_lba, chunk * layout.lba_per_page());
        let err = seq.finish();
        if !err.is_ok() {
            return Err(err);
        }

        iov_byte_pos += chunk_bytes;
        if iov_byte_pos == iovs[iov_idx].len() {
            iov_idx += 1;
            iov_byte_pos = 0;
        }
        page_done += chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::Allocator;
    use crate::blob::Blob;
    use crate::bsdev::MemDisk;

    fn test_layout() -> Layout {
        Layout { blocklen: 512, cluster_size: 4096 * 4, md_start: 0 }
    }

    fn allocate_blob(layout: &Layout, used_clusters: &mut Allocator, num_clusters: u64, thin: bool) -> Blob {
        let mut blob = Blob::new(BlobId::from_page_idx(0), 0);
        blob.set_thin_provisioned(thin);
        blob.active.num_clusters = num_clusters;
        blob.active.clusters = vec![0; num_clusters as usize];
        if !thin {
            for c in blob.active.clusters.iter_mut() {
                let idx = used_clusters.find_first_clear(0).unwrap();
                used_clusters.claim(idx);
                *c = layout.cluster_to_lba(idx as u64);
            }
        }
        blob
    }

    #[test]
    fn write_then_read_round_trips() {
        let layout = test_layout();
        let dev = MemDisk::new(4096, layout.blocklen);
        let dev_channel = dev.create_channel();
        let mut channel = Channel::new(dev_channel, 512);
        let mut used_clusters = Allocator::new();
        used_clusters.resize(64);
        let mut blob = allocate_blob(&layout, &mut used_clusters, 2, false);
        let blobs = HashMap::new();

        let data = vec![0xE5u8; 3 * PAGE_SIZE];
        write(&dev, &mut channel, &layout, &mut used_clusters, &mut blob, &blobs, &data, 1, 3).unwrap();

        let mut out = vec![0u8; 3 * PAGE_SIZE];
        read(&dev, &mut channel, &layout, &blob, &blobs, &mut out, 1, 3).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn thin_blob_reads_zero_before_any_write() {
        let layout = test_layout();
        let dev = MemDisk::new(4096, layout.blocklen);
        let dev_channel = dev.create_channel();
        let mut channel = Channel::new(dev_channel, 512);
        let mut used_clusters = Allocator::new();
        used_clusters.resize(64);
        let blob = allocate_blob(&layout, &mut used_clusters, 2, true);
        let blobs = HashMap::new();

        let mut out = vec![0xAAu8; 2 * PAGE_SIZE];
        read(&dev, &mut channel, &layout, &blob, &blobs, &mut out, 0, 2).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn thin_blob_write_allocates_exactly_one_cluster() {
        let layout = test_layout();
        let dev = MemDisk::new(4096, layout.blocklen);
        let dev_channel = dev.create_channel();
        let mut channel = Channel::new(dev_channel, 512);
        let mut used_clusters = Allocator::new();
        used_clusters.resize(64);
        let mut blob = allocate_blob(&layout, &mut used_clusters, 2, true);
        let blobs = HashMap::new();
        let before = used_clusters.free_count();

        let data = vec![0x11u8; PAGE_SIZE];
        write(&dev, &mut channel, &layout, &mut used_clusters, &mut blob, &blobs, &data, 0, 1).unwrap();
        assert_eq!(used_clusters.free_count(), before - 1);
    }

    #[test]
    fn frozen_blob_queues_writes() {
        let layout = test_layout();
        let dev = MemDisk::new(4096, layout.blocklen);
        let dev_channel = dev.create_channel();
        let mut channel = Channel::new(dev_channel, 512);
        let mut used_clusters = Allocator::new();
        used_clusters.resize(64);
        let mut blob = allocate_blob(&layout, &mut used_clusters, 1, false);
        blob.frozen_refcnt = 1;
        let blobs = HashMap::new();

        let data = vec![0x22u8; PAGE_SIZE];
        write(&dev, &mut channel, &layout, &mut used_clusters, &mut blob, &blobs, &data, 0, 1).unwrap();
        assert_eq!(channel.queued_len(), 1);
    }
}
