//! Metadata I/O: `load_blob` and `persist_blob` (§4.F).
//!
//! The persist ordering guarantee — children pages durable before the
//! root, cluster unmap only after the metadata confirming the shrink is
//! durable — is the one invariant this module exists to protect. Every
//! early return below leaves the blob `Dirty` rather than `Clean` so a
//! caller cannot mistake a half-applied persist for a durable one.

use crate::bitmap::Allocator;
use crate::blob::{Backing, Blob, BlobState};
use crate::bsdev::BsDev;
use crate::errno::Errno;
use crate::format::{self, Descriptor, Layout, MdPage, INVALID_PAGE};
use crate::request::{Batch, Channel, Sequence};

fn read_page(
    dev: &dyn BsDev,
    channel: &mut Channel,
    lba: u64,
    lba_count: u64,
    buf: &mut [u8],
) -> Result<(), Errno> {
    let mut seq = Sequence::new(channel);
    seq.read(dev, buf, lba, lba_count);
    let err = seq.finish();
    if err.is_ok() {
        Ok(())
    } else {
        Err(err)
    }
}

/// True if metadata page `page_idx` is a blob's root page rather than one
/// of its own continuation pages.
///
/// `used_md_pages` has one bit per page regardless of whether that page
/// roots a blob or only continues one (`persist_blob` claims a blob's
/// tail pages from the same mask its root comes from, §4.F step 2). A
/// page only roots the blob it names: its header's `id` points back at
/// its own page index and its `sequence_num` is `0`. Any other set bit is
/// a continuation page, already reachable by following some other root's
/// chain, and must not be mounted as an independent blob.
pub fn is_root_page(dev: &dyn BsDev, channel: &mut Channel, layout: &Layout, page_idx: u32) -> Result<bool, Errno> {
    let lba = layout.md_page_to_lba(page_idx);
    let mut buf = vec![0u8; format::PAGE_SIZE];
    read_page(dev, channel, lba, layout.lba_per_page(), &mut buf)?;
    let header = MdPage::decode_header(&buf)?;
    Ok(header.sequence_num == 0 && header.id.page_idx() == page_idx)
}

/// Load a blob's root page and follow its `next` chain, applying every
/// descriptor onto `blob` (§4.F "Load").
pub fn load_blob(dev: &dyn BsDev, channel: &mut Channel, layout: &Layout, used_clusters: &Allocator, blob: &mut Blob) -> Result<(), Errno> {
    blob.state = BlobState::Loading;

    let root_page = blob.active.pages[0];
    let mut chain_pages = Vec::new();
    let mut descriptors = Vec::new();
    let mut next = root_page;
    let mut expected_seq = 0u32;

    loop {
        let lba = layout.md_page_to_lba(next);
        let mut buf = vec![0u8; format::PAGE_SIZE];
        read_page(dev, channel, lba, layout.lba_per_page(), &mut buf)?;

        let header = MdPage::decode_header(&buf)?;
        if header.sequence_num != expected_seq {
            return Err(Errno::from(format::Error::SequenceMismatch { expected: expected_seq, found: header.sequence_num }));
        }

        chain_pages.push(next);
        let parsed = MdPage::parse_descriptors(&buf);
        descriptors.extend(parsed.descriptors);

        if parsed.truncated || header.next == INVALID_PAGE {
            break;
        }
        next = header.next;
        expected_seq += 1;
    }

    let mut invalid_flags = 0u64;
    let mut data_ro_flags = 0u64;
    let mut md_ro_flags = 0u64;
    let mut parent_id = crate::format::BlobId::INVALID;
    let mut xattrs = Vec::new();
    let mut xattrs_internal = Vec::new();
    let mut clusters = Vec::new();

    for d in &descriptors {
        match *d {
            Descriptor::Extent { cluster_idx, length_in_clusters } => {
                if cluster_idx == 0 {
                    for _ in 0..length_in_clusters {
                        clusters.push(0);
                    }
                } else {
                    for j in 0..length_in_clusters {
                        let c = (cluster_idx + j) as usize;
                        assert!(used_clusters.get(c), "extent references unclaimed cluster {}", c);
                        clusters.push(layout.cluster_to_lba(c as u64));
                    }
                }
            }
            Descriptor::XattrPublic { ref name, ref value } => xattrs.push((name.clone(), value.clone())),
            Descriptor::XattrInternal { ref name, ref value } => xattrs_internal.push((name.clone(), value.clone())),
            Descriptor::Flags { invalid_flags: iflags, data_ro_flags: dflags, md_ro_flags: mflags } => {
                invalid_flags = iflags;
                data_ro_flags = dflags;
                md_ro_flags = mflags;
            }
            Descriptor::SnapshotRef { parent_id: id } => parent_id = id,
        }
    }

    crate::blob::Blob::check_invalid_flags(invalid_flags)?;

    blob.invalid_flags = invalid_flags;
    blob.data_ro_flags = data_ro_flags;
    blob.md_ro_flags = md_ro_flags;
    blob.parent_id = parent_id;
    blob.back_bs_dev = if parent_id.is_invalid() { Backing::None } else { Backing::Parent(parent_id) };
    blob.xattrs = xattrs;
    blob.xattrs_internal = xattrs_internal;
    blob.active.num_clusters = clusters.len() as u64;
    blob.active.clusters = clusters;
    blob.active.pages = chain_pages;

    blob.mark_clean();
    Ok(())
}

/// Run-length encode an active cluster array into extent descriptors
/// (§4.F step 2). A run of unallocated clusters (LBA `0`) becomes a
/// `cluster_idx: 0` descriptor; any other run of LBAs spaced exactly
/// `lba_per_cluster` apart becomes one `(cluster_idx, length)` pair
/// (§8 "Extent RLE").
fn build_extent_descriptors(layout: &Layout, clusters: &[u64]) -> Vec<Descriptor> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < clusters.len() {
        let start = i;
        if clusters[i] == 0 {
            while i < clusters.len() && clusters[i] == 0 {
                i += 1;
            }
            out.push(Descriptor::Extent { cluster_idx: 0, length_in_clusters: (i - start) as u32 });
        } else {
            let start_cluster = layout.lba_to_cluster(clusters[i]) as u32;
            let mut expected = clusters[i];
            while i < clusters.len() && clusters[i] == expected {
                expected += layout.lba_per_cluster();
                i += 1;
            }
            out.push(Descriptor::Extent { cluster_idx: start_cluster, length_in_clusters: (i - start) as u32 });
        }
    }
    out
}

fn serialize_blob(blob: &Blob, layout: &Layout) -> Result<Vec<Vec<u8>>, Errno> {
    let mut descriptors = Vec::new();
    if blob.invalid_flags != 0 || blob.data_ro_flags != 0 || blob.md_ro_flags != 0 {
        descriptors.push(Descriptor::Flags {
            invalid_flags: blob.invalid_flags,
            data_ro_flags: blob.data_ro_flags,
            md_ro_flags: blob.md_ro_flags,
        });
    }
    if !blob.parent_id.is_invalid() {
        descriptors.push(Descriptor::SnapshotRef { parent_id: blob.parent_id });
    }
    for (name, value) in &blob.xattrs {
        descriptors.push(Descriptor::XattrPublic { name: name.clone(), value: value.clone() });
    }
    for (name, value) in &blob.xattrs_internal {
        descriptors.push(Descriptor::XattrInternal { name: name.clone(), value: value.clone() });
    }
    let used = &blob.active.clusters[..blob.active.num_clusters as usize];
    descriptors.extend(build_extent_descriptors(layout, used));

    MdPage::serialize_descriptors(&descriptors).map_err(Errno::from)
}

/// Persist `active` into a fresh page chain (§4.F "Persist").
///
/// On any failure the blob is left `Dirty` with `active` untouched and
/// `clean` still the last durable version (§7 "Propagation policy").
pub fn persist_blob(
    dev: &dyn BsDev,
    channel: &mut Channel,
    layout: &Layout,
    used_md_pages: &mut Allocator,
    used_clusters: &mut Allocator,
    blob: &mut Blob,
) -> Result<(), Errno> {
    blob.state = BlobState::Syncing;

    let page_bufs = match serialize_blob(blob, layout) {
        Ok(p) => p,
        Err(e) => {
            blob.state = BlobState::Dirty;
            return Err(e);
        }
    };
    let n = page_bufs.len();

    let root_page = blob.active.pages[0];
    let mut new_pages = vec![root_page];
    if n > 1 {
        let needed = n - 1;
        let mut scratch = Vec::with_capacity(needed);
        let mut cursor = 0;
        for _ in 0..needed {
            match used_md_pages.find_first_clear(cursor) {
                Some(idx) => {
                    scratch.push(idx);
                    cursor = idx + 1;
                }
                None => {
                    blob.state = BlobState::Dirty;
                    return Err(Errno::ENOMEM);
                }
            }
        }
        for idx in scratch {
            used_md_pages.claim(idx);
            new_pages.push(idx as u32);
        }
    }

    let mut encoded = Vec::with_capacity(n);
    for i in 0..n {
        let next = if i + 1 < n { new_pages[i + 1] } else { INVALID_PAGE };
        encoded.push(MdPage::encode_page(blob.id, i as u32, &page_bufs[i], next));
    }

    // Children first, then the root (§4.F step 5): only once the root is
    // durable does a reader see the new chain.
    if n > 1 {
        let mut batch = Batch::new(channel);
        for i in 1..n {
            let lba = layout.md_page_to_lba(new_pages[i]);
            batch.write(dev, &encoded[i], lba, layout.lba_per_page());
        }
        let err = batch.close();
        if !err.is_ok() {
            blob.state = BlobState::Dirty;
            return Err(err);
        }
    }
    {
        let lba = layout.md_page_to_lba(new_pages[0]);
        let mut seq = Sequence::new(channel);
        seq.write(dev, &encoded[0], lba, layout.lba_per_page());
        let err = seq.finish();
        if !err.is_ok() {
            blob.state = BlobState::Dirty;
            return Err(err);
        }
    }

    persist_unmap_pages(dev, channel, layout, used_md_pages, &blob.clean.pages, &new_pages);
    persist_unmap_clusters(dev, channel, layout, used_clusters, blob);

    blob.active.pages = new_pages;
    blob.mark_clean();
    Ok(())
}

/// Release and unmap every page in the old chain (beyond the shared root)
/// that is not part of the new chain (§4.F step 6).
fn persist_unmap_pages(dev: &dyn BsDev, channel: &mut Channel, layout: &Layout, used_md_pages: &mut Allocator, old_pages: &[u32], new_pages: &[u32]) {
    for &old_page in old_pages.iter().skip(1) {
        if new_pages.contains(&old_page) {
            continue;
        }
        if used_md_pages.get(old_page as usize) {
            used_md_pages.release(old_page as usize);
        }
        let lba = layout.md_page_to_lba(old_page);
        let _ = dev.unmap(channel.dev_channel, lba, layout.lba_per_page());
    }
}

/// Release the bits and unmap the LBAs of every cluster beyond
/// `active.num_clusters`, coalescing adjacent runs, then shrink the
/// cluster array to exactly `num_clusters` (§4.F step 7).
fn persist_unmap_clusters(dev: &dyn BsDev, channel: &mut Channel, layout: &Layout, used_clusters: &mut Allocator, blob: &mut Blob) {
    let keep = blob.active.num_clusters as usize;
    if keep >= blob.active.clusters.len() {
        blob.active.clusters.truncate(keep);
        return;
    }

    let mut run_start: Option<u64> = None;
    let mut run_len = 0u64;
    for &lba in &blob.active.clusters[keep..] {
        if lba == 0 {
            continue;
        }
        used_clusters.release(layout.lba_to_cluster(lba) as usize);
        match run_start {
            Some(s) if s + run_len * layout.lba_per_cluster() == lba => run_len += 1,
            _ => {
                if let Some(s) = run_start {
                    let _ = dev.unmap(channel.dev_channel, s, run_len * layout.lba_per_cluster());
                }
                run_start = Some(lba);
                run_len = 1;
            }
        }
    }
    if let Some(s) = run_start {
        let _ = dev.unmap(channel.dev_channel, s, run_len * layout.lba_per_cluster());
    }

    blob.active.clusters.truncate(keep);
}

/// Persist a `delete_blob` (§4.E "delete_blob", §4.F step 6 "If
/// `active.num_pages == 0`"): release every page in the chain including
/// the root, and every allocated cluster.
pub fn persist_delete_blob(dev: &dyn BsDev, channel: &mut Channel, layout: &Layout, used_md_pages: &mut Allocator, used_clusters: &mut Allocator, blob: &mut Blob) {
    for &page in &blob.clean.pages {
        if used_md_pages.get(page as usize) {
            used_md_pages.release(page as usize);
        }
        let lba = layout.md_page_to_lba(page);
        let _ = dev.unmap(channel.dev_channel, lba, layout.lba_per_page());
    }
    blob.active.num_clusters = 0;
    persist_unmap_clusters(dev, channel, layout, used_clusters, blob);
    blob.active.pages.clear();
    blob.clean = blob.active.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::Allocator;
    use crate::blob::Blob;
    use crate::bsdev::MemDisk;
    use crate::format::BlobId;

    fn test_layout() -> Layout {
        Layout { blocklen: 512, cluster_size: 1024 * 1024, md_start: 8 }
    }

    #[test]
    fn persist_then_load_round_trip() {
        let layout = test_layout();
        let dev = MemDisk::new(8 + 4096, layout.blocklen);
        let dev_channel = dev.create_channel();
        let mut channel = Channel::new(dev_channel, 32);

        let mut used_md_pages = Allocator::new();
        used_md_pages.resize(4096);
        let mut used_clusters = Allocator::new();
        used_clusters.resize(4096);

        let root = used_md_pages.find_first_clear(0).unwrap();
        used_md_pages.claim(root);
        let mut blob = Blob::new(BlobId::from_page_idx(root as u32), root as u32);
        blob.set_xattr("name", b"value");

        persist_blob(&dev, &mut channel, &layout, &mut used_md_pages, &mut used_clusters, &mut blob).unwrap();
        assert_eq!(blob.state, crate::blob::BlobState::Clean);

        let mut reloaded = Blob::new(blob.id, root as u32);
        load_blob(&dev, &mut channel, &layout, &used_clusters, &mut reloaded).unwrap();
        assert_eq!(reloaded.get_xattr("name"), Some(&b"value"[..]));
    }

    #[test]
    fn persist_allocates_extra_pages_for_large_xattr_set() {
        let layout = test_layout();
        let dev = MemDisk::new(8 + 4096, layout.blocklen);
        let dev_channel = dev.create_channel();
        let mut channel = Channel::new(dev_channel, 32);
        let mut used_md_pages = Allocator::new();
        used_md_pages.resize(4096);
        let mut used_clusters = Allocator::new();
        used_clusters.resize(4096);

        let root = used_md_pages.find_first_clear(0).unwrap();
        used_md_pages.claim(root);
        let mut blob = Blob::new(BlobId::from_page_idx(root as u32), root as u32);
        for i in 0..200 {
            blob.set_xattr(&format!("key-{}", i), &[0xAB; 64]);
        }

        persist_blob(&dev, &mut channel, &layout, &mut used_md_pages, &mut used_clusters, &mut blob).unwrap();
        assert!(blob.active.pages.len() > 1);

        let mut reloaded = Blob::new(blob.id, root as u32);
        load_blob(&dev, &mut channel, &layout, &used_clusters, &mut reloaded).unwrap();
        assert_eq!(reloaded.xattr_names().len(), 200);
    }
}
