//! The `BsDev` contract (§4.A) and the two reference device
//! implementations the blobstore itself provides.
//!
//! The real design models `BsDev` as a callback-completed async
//! interface dispatched through a message/thread/io-channel scheduler.
//! That scheduler is explicitly an external collaborator the core does
//! not provide (§1, §2 row K). Lacking it, `BsDev` here is a synchronous,
//! `Result`-returning trait — the same collapse `tfs::disk::Disk` already
//! makes for its own (synchronous) backing store. Multi-step composition
//! across several `BsDev` calls (the actual job of the request engine,
//! §4.B) still lives one layer up, in `request.rs`; this trait only
//! describes a single physical operation.

use std::cell::RefCell;
use std::rc::Rc;

use crate::blobstore::Blobstore;
use crate::errno::Errno;
use crate::format::BlobId;
use crate::request::Channel;

/// Per-channel handle into a `BsDev`. Channels are created on exactly one
/// executor and used only there (§5 "Channel affinity"); since this
/// crate's devices execute synchronously there is nothing to isolate,
/// but the handle is kept so call sites read the way the spec describes
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevChannel(pub u64);

/// A thin block device: the sole contract the blobstore core has with
/// the storage underneath it.
pub trait BsDev {
    /// Total number of addressable blocks.
    fn blockcnt(&self) -> u64;
    /// Block size in bytes. Must be a 512-byte multiple (§3).
    fn blocklen(&self) -> u32;

    fn create_channel(&self) -> DevChannel;
    fn destroy_channel(&self, channel: DevChannel);
    /// Destroy this device. Callers must not use it afterward.
    fn destroy(&self);

    /// Hint: is this LBA range known to already read as zero? Lets the
    /// blobstore skip reads it can answer without touching the device.
    fn is_zeroes(&self, _lba: u64, _lba_count: u64) -> bool {
        false
    }

    fn read(&self, channel: DevChannel, buf: &mut [u8], lba: u64, lba_count: u64) -> Result<(), Errno>;
    fn write(&self, channel: DevChannel, buf: &[u8], lba: u64, lba_count: u64) -> Result<(), Errno>;
    fn readv(&self, channel: DevChannel, iovs: &mut [&mut [u8]], lba: u64, lba_count: u64) -> Result<(), Errno>;
    fn writev(&self, channel: DevChannel, iovs: &[&[u8]], lba: u64, lba_count: u64) -> Result<(), Errno>;
    fn unmap(&self, channel: DevChannel, lba: u64, lba_count: u64) -> Result<(), Errno>;
    fn write_zeroes(&self, channel: DevChannel, lba: u64, lba_count: u64) -> Result<(), Errno>;
    fn flush(&self, channel: DevChannel) -> Result<(), Errno>;
}

/// An infinite-length device that reads as all zeroes.
///
/// Used as the backing device of a thin-provisioned blob with no
/// snapshot parent (§4.A). There is only ever one in a process; nothing
/// about it is per-blobstore state.
pub struct ZeroesDev;

impl BsDev for ZeroesDev {
    fn blockcnt(&self) -> u64 {
        u64::max_value()
    }

    fn blocklen(&self) -> u32 {
        512
    }

    fn create_channel(&self) -> DevChannel {
        DevChannel(0)
    }

    fn destroy_channel(&self, _channel: DevChannel) {}

    fn destroy(&self) {
        // Singleton; nothing to tear down.
    }

    fn is_zeroes(&self, _lba: u64, _lba_count: u64) -> bool {
        true
    }

    fn read(&self, _channel: DevChannel, buf: &mut [u8], _lba: u64, _lba_count: u64) -> Result<(), Errno> {
        for b in buf.iter_mut() {
            *b = 0;
        }
        Ok(())
    }

    fn write(&self, _channel: DevChannel, _buf: &[u8], _lba: u64, _lba_count: u64) -> Result<(), Errno> {
        Err(Errno::EPERM)
    }

    fn readv(&self, _channel: DevChannel, iovs: &mut [&mut [u8]], _lba: u64, _lba_count: u64) -> Result<(), Errno> {
        for iov in iovs.iter_mut() {
            for b in iov.iter_mut() {
                *b = 0;
            }
        }
        Ok(())
    }

    fn writev(&self, _channel: DevChannel, _iovs: &[&[u8]], _lba: u64, _lba_count: u64) -> Result<(), Errno> {
        Err(Errno::EPERM)
    }

    fn unmap(&self, _channel: DevChannel, _lba: u64, _lba_count: u64) -> Result<(), Errno> {
        Err(Errno::EPERM)
    }

    fn write_zeroes(&self, _channel: DevChannel, _lba: u64, _lba_count: u64) -> Result<(), Errno> {
        Err(Errno::EPERM)
    }

    fn flush(&self, _channel: DevChannel) -> Result<(), Errno> {
        Ok(())
    }
}

/// An in-memory `BsDev`, used by this crate's own test suite and by
/// anything embedding the blobstore without real storage underneath.
///
/// Supports injected `-ENOMEM` failures on the first `fail_countdown`
/// submissions, to exercise the request engine's retry path (§4.H,
/// §8 scenario 5) deterministically.
pub struct MemDisk {
    blocklen: u32,
    storage: std::rc::Rc<std::cell::RefCell<Vec<u8>>>,
    fail_countdown: std::rc::Rc<std::cell::Cell<u32>>,
}

impl MemDisk {
    pub fn new(block_count: u64, blocklen: u32) -> MemDisk {
        MemDisk {
            blocklen,
            storage: std::rc::Rc::new(std::cell::RefCell::new(vec![0u8; block_count as usize * blocklen as usize])),
            fail_countdown: std::rc::Rc::new(std::cell::Cell::new(0)),
        }
    }

    /// A second handle onto the same backing storage and the same
    /// injected-failure countdown, as if the process restarted and
    /// reopened the same block device (used by tests that exercise
    /// unload-then-load, and to inject failures after a device handle
    /// has already been moved into a `Blobstore`).
    pub fn reopen(&self) -> MemDisk {
        MemDisk { blocklen: self.blocklen, storage: self.storage.clone(), fail_countdown: self.fail_countdown.clone() }
    }

    /// Make the next `n` submissions return `-ENOMEM` before succeeding.
    pub fn fail_next(&self, n: u32) {
        self.fail_countdown.set(n);
    }

    fn maybe_fail(&self) -> Result<(), Errno> {
        let n = self.fail_countdown.get();
        if n > 0 {
            self.fail_countdown.set(n - 1);
            return Err(Errno::ENOMEM);
        }
        Ok(())
    }

    fn range(&self, lba: u64, lba_count: u64) -> (usize, usize) {
        let start = lba as usize * self.blocklen as usize;
        let end = start + lba_count as usize * self.blocklen as usize;
        (start, end)
    }

    fn check_bounds(&self, lba: u64, lba_count: u64) -> Result<(), Errno> {
        match lba.checked_add(lba_count) {
            Some(end) if end <= self.blockcnt() => Ok(()),
            _ => Err(Errno::EINVAL),
        }
    }
}

impl BsDev for MemDisk {
    fn blockcnt(&self) -> u64 {
        self.storage.borrow().len() as u64 / self.blocklen as u64
    }

    fn blocklen(&self) -> u32 {
        self.blocklen
    }

    fn create_channel(&self) -> DevChannel {
        DevChannel(0)
    }

    fn destroy_channel(&self, _channel: DevChannel) {}

    fn destroy(&self) {
        self.storage.borrow_mut().clear();
    }

    fn read(&self, _channel: DevChannel, buf: &mut [u8], lba: u64, lba_count: u64) -> Result<(), Errno> {
        self.check_bounds(lba, lba_count)?;
        self.maybe_fail()?;
        let (start, end) = self.range(lba, lba_count);
        let storage = self.storage.borrow();
        buf[..end - start].copy_from_slice(&storage[start..end]);
        Ok(())
    }

    fn write(&self, _channel: DevChannel, buf: &[u8], lba: u64, lba_count: u64) -> Result<(), Errno> {
        self.check_bounds(lba, lba_count)?;
        self.maybe_fail()?;
        let (start, end) = self.range(lba, lba_count);
        self.storage.borrow_mut()[start..end].copy_from_slice(&buf[..end - start]);
        Ok(())
    }

    fn readv(&self, channel: DevChannel, iovs: &mut [&mut [u8]], lba: u64, lba_count: u64) -> Result<(), Errno> {
        self.check_bounds(lba, lba_count)?;
        self.maybe_fail()?;
        let (start, _) = self.range(lba, lba_count);
        let storage = self.storage.borrow();
        let mut pos = start;
        for iov in iovs.iter_mut() {
            iov.copy_from_slice(&storage[pos..pos + iov.len()]);
            pos += iov.len();
        }
        let _ = channel;
        Ok(())
    }

    fn writev(&self, channel: DevChannel, iovs: &[&[u8]], lba: u64, lba_count: u64) -> Result<(), Errno> {
        self.check_bounds(lba, lba_count)?;
        self.maybe_fail()?;
        let (start, _) = self.range(lba, lba_count);
        let mut storage = self.storage.borrow_mut();
        let mut pos = start;
        for iov in iovs.iter() {
            storage[pos..pos + iov.len()].copy_from_slice(iov);
            pos += iov.len();
        }
        let _ = channel;
        Ok(())
    }

    fn unmap(&self, _channel: DevChannel, lba: u64, lba_count: u64) -> Result<(), Errno> {
        self.check_bounds(lba, lba_count)?;
        self.maybe_fail()?;
        let (start, end) = self.range(lba, lba_count);
        for b in self.storage.borrow_mut()[start..end].iter_mut() {
            *b = 0;
        }
        Ok(())
    }

    fn write_zeroes(&self, _channel: DevChannel, lba: u64, lba_count: u64) -> Result<(), Errno> {
        self.check_bounds(lba, lba_count)?;
        self.maybe_fail()?;
        let (start, end) = self.range(lba, lba_count);
        for b in self.storage.borrow_mut()[start..end].iter_mut() {
            *b = 0;
        }
        Ok(())
    }

    fn flush(&self, _channel: DevChannel) -> Result<(), Errno> {
        Ok(())
    }
}

/// Exposes one blob's data as a read-only `BsDev`, its own "block" being
/// one logical page of the blob, for embedders that want to layer
/// another structure (a filesystem, a log) directly on a blob instead of
/// a raw LBA device (§4.A design note, §9).
///
/// Every mutating method returns `-EPERM`. `read`/`readv` forward into
/// the blob's own cluster-bounded read path (`io::read`/`io::readv`)
/// through the owning `Blobstore`, so a snapshot chain underneath the
/// blob is still followed transparently.
pub struct BlobBsDev {
    store: Rc<RefCell<Blobstore>>,
    blob_id: BlobId,
    channel: RefCell<Channel>,
}

impl BlobBsDev {
    pub fn new(store: Rc<RefCell<Blobstore>>, blob_id: BlobId, channel: Channel) -> BlobBsDev {
        BlobBsDev { store, blob_id, channel: RefCell::new(channel) }
    }
}

impl BsDev for BlobBsDev {
    fn blockcnt(&self) -> u64 {
        self.store.borrow().blob_num_pages(self.blob_id).unwrap_or(0)
    }

    fn blocklen(&self) -> u32 {
        self.store.borrow().get_page_size()
    }

    fn create_channel(&self) -> DevChannel {
        DevChannel(0)
    }

    fn destroy_channel(&self, _channel: DevChannel) {}

    fn destroy(&self) {}

    fn read(&self, _channel: DevChannel, buf: &mut [u8], lba: u64, lba_count: u64) -> Result<(), Errno> {
        let store = self.store.borrow();
        let mut channel = self.channel.borrow_mut();
        store.io_read(&mut channel, self.blob_id, buf, lba, lba_count)
    }

    fn write(&self, _channel: DevChannel, _buf: &[u8], _lba: u64, _lba_count: u64) -> Result<(), Errno> {
        Err(Errno::EPERM)
    }

    fn readv(&self, _channel: DevChannel, iovs: &mut [&mut [u8]], lba: u64, lba_count: u64) -> Result<(), Errno> {
        let store = self.store.borrow();
        let mut channel = self.channel.borrow_mut();
        store.io_readv(&mut channel, self.blob_id, iovs, lba, lba_count)
    }

    fn writev(&self, _channel: DevChannel, _iovs: &[&[u8]], _lba: u64, _lba_count: u64) -> Result<(), Errno> {
        Err(Errno::EPERM)
    }

    fn unmap(&self, _channel: DevChannel, _lba: u64, _lba_count: u64) -> Result<(), Errno> {
        Err(Errno::EPERM)
    }

    fn write_zeroes(&self, _channel: DevChannel, _lba: u64, _lba_count: u64) -> Result<(), Errno> {
        Err(Errno::EPERM)
    }

    fn flush(&self, _channel: DevChannel) -> Result<(), Errno> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroes_dev_read_is_zero() {
        let dev = ZeroesDev;
        let mut buf = [0xAAu8; 512];
        dev.read(DevChannel(0), &mut buf, 0, 1).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn zeroes_dev_write_is_eperm() {
        let dev = ZeroesDev;
        assert_eq!(dev.write(DevChannel(0), &[0; 512], 0, 1), Err(Errno::EPERM));
    }

    #[test]
    fn mem_disk_round_trip() {
        let dev = MemDisk::new(16, 512);
        let ch = dev.create_channel();
        let data = vec![0xE5u8; 512];
        dev.write(ch, &data, 3, 1).unwrap();
        let mut out = vec![0u8; 512];
        dev.read(ch, &mut out, 3, 1).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn mem_disk_fail_then_succeed() {
        let dev = MemDisk::new(16, 512);
        dev.fail_next(2);
        let ch = dev.create_channel();
        let data = vec![1u8; 512];
        assert_eq!(dev.write(ch, &data, 0, 1), Err(Errno::ENOMEM));
        assert_eq!(dev.write(ch, &data, 0, 1), Err(Errno::ENOMEM));
        assert_eq!(dev.write(ch, &data, 0, 1), Ok(()));
    }
}
