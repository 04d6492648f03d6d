//! End-to-end scenarios driven entirely through the public `Blobstore`
//! API, against an in-memory `BsDev` (`blobstore::MemDisk`).

use slog::o;

use blobstore::{BlobOpts, Blobstore, BsOpts, ClearMethod, MemDisk};

fn test_opts() -> BsOpts {
    BsOpts {
        cluster_size: 4 * 4096,
        num_md_pages: 64,
        max_md_ops: 32,
        max_channel_ops: 512,
        bstype: [0; 16],
        clear_method: ClearMethod::Default,
    }
}

fn test_log() -> slog::Logger {
    slog::Logger::root(slog::Discard, o!())
}

#[test]
fn thin_blob_zero_before_write_then_iovec_round_trip() {
    let dev = Box::new(MemDisk::new(16384, 512));
    let mut bs = Blobstore::init(dev, test_opts(), test_log()).unwrap();

    let id = bs
        .create_blob(BlobOpts { thin_provision: true, num_clusters: 3, ..Default::default() })
        .unwrap();
    bs.open_blob(id).unwrap();
    let mut channel = bs.alloc_io_channel();

    // Pages [4, 12) span the boundary between cluster 1 and cluster 2
    // (4 pages per cluster): nothing has been written yet.
    let mut zeros = vec![0xAAu8; 8 * 4096];
    bs.io_read(&mut channel, id, &mut zeros, 4, 8).unwrap();
    assert!(zeros.iter().all(|&b| b == 0));

    let mut pattern = vec![0u8; 8 * 4096];
    for (i, chunk) in pattern.chunks_mut(4096).enumerate() {
        for b in chunk.iter_mut() {
            *b = 0xE5u8.wrapping_add(i as u8);
        }
    }
    let iov_a: Vec<&[u8]> = vec![&pattern[0..4096], &pattern[4096..5 * 4096], &pattern[5 * 4096..8 * 4096]];
    bs.io_writev(&mut channel, id, &iov_a, 4, 8).unwrap();

    let mut out = vec![0u8; 4 * 4096];
    let mut out2 = vec![0u8; 4 * 4096];
    {
        let mut iov_b: Vec<&mut [u8]> = vec![&mut out, &mut out2];
        bs.io_readv(&mut channel, id, &mut iov_b, 4, 8).unwrap();
    }
    let mut combined = out;
    combined.extend_from_slice(&out2);
    assert_eq!(combined, pattern);

    bs.close_blob(id).unwrap();
    bs.free_io_channel(channel);
    bs.unload().unwrap();
}

#[test]
fn snapshot_then_clone_then_inflate_frees_inherited_clusters() {
    let dev = Box::new(MemDisk::new(32768, 512));
    let mut bs = Blobstore::init(dev, test_opts(), test_log()).unwrap();

    let source = bs
        .create_blob(BlobOpts { thin_provision: false, num_clusters: 4, ..Default::default() })
        .unwrap();
    bs.open_blob(source).unwrap();
    let mut channel = bs.alloc_io_channel();
    let pattern = vec![0x77u8; 4 * 4096];
    for cluster in 0..4u64 {
        bs.io_write(&mut channel, source, &pattern, cluster * 4, 4).unwrap();
    }

    let snapshot = bs.create_snapshot(source, Vec::new()).unwrap();
    let clone = bs.create_clone(snapshot).unwrap();

    bs.open_blob(clone).unwrap();
    let local = vec![0x11u8; 4 * 4096];
    bs.io_write(&mut channel, clone, &local, 4, 4).unwrap();

    let before = bs.free_cluster_count();
    bs.inflate(clone).unwrap();
    let after = bs.free_cluster_count();
    assert_eq!(before - after, 3);

    assert!(!bs.is_clone(clone).unwrap());
    assert!(bs.get_parent_snapshot(clone).is_invalid());

    bs.close_blob(source).unwrap();
    bs.delete_blob(snapshot).unwrap();

    let mut reread = vec![0u8; 4096];
    bs.io_read(&mut channel, clone, &mut reread, 0, 1).unwrap();
    assert_eq!(reread, vec![0x77u8; 4096]);
    let mut reread_local = vec![0u8; 4096];
    bs.io_read(&mut channel, clone, &mut reread_local, 4, 1).unwrap();
    assert_eq!(reread_local, vec![0x11u8; 4096]);

    bs.close_blob(clone).unwrap();
    bs.free_io_channel(channel);
    bs.unload().unwrap();
}

#[test]
fn enomem_retry_path_recovers_and_drains() {
    let backing = MemDisk::new(16384, 512);
    let mut bs = Blobstore::init(Box::new(backing.reopen()), test_opts(), test_log()).unwrap();

    let id = bs
        .create_blob(BlobOpts { thin_provision: false, num_clusters: 2, ..Default::default() })
        .unwrap();
    bs.open_blob(id).unwrap();
    let mut channel = bs.alloc_io_channel();

    // Inject the failures only now, after formatting and blob creation
    // have already completed, so they land on this write and not on the
    // superblock/metadata writes `init`/`create_blob` issued.
    backing.fail_next(2);
    let data = vec![0x5Au8; 8 * 4096];
    bs.io_write(&mut channel, id, &data, 0, 8).unwrap();
    assert_eq!(channel.queued_len(), 0);
    assert!(channel.enomem_retries > 0);

    let mut out = vec![0u8; 8 * 4096];
    bs.io_read(&mut channel, id, &mut out, 0, 8).unwrap();
    assert_eq!(out, data);

    bs.close_blob(id).unwrap();
    bs.free_io_channel(channel);
    bs.unload().unwrap();
}
