//! The request engine (§4.B): sequences, batches, deferred user ops, and
//! the per-executor channel they run against.
//!
//! Real blobstore request objects are allocated from a fixed-size pool
//! per channel and driven by completion callbacks dispatched off the
//! scheduler. With `BsDev` collapsed to a synchronous trait (see
//! `bsdev.rs`), a sequence or batch here just folds its steps over a
//! `&mut dyn BsDev` and keeps the first error it sees — the same
//! end-to-end outcome, without a callback-driven state machine to get
//! out of sync with its own bookkeeping.

use std::collections::VecDeque;

use crate::bsdev::{BsDev, DevChannel};
use crate::errno::Errno;
use crate::format::BlobId;

/// Ceiling on outstanding metadata operations per channel (§3). Bounds
/// how many sequence/batch steps may be in flight from one channel at
/// once; this crate enforces it as an assertion rather than a queue,
/// since nothing here actually launches concurrent I/O.
pub const MAX_MD_OPS: usize = 32;
/// Ceiling on outstanding data operations per channel (§3).
pub const MAX_CHANNEL_OPS: usize = 512;

/// A per-executor channel into a device (§5, "channel affinity").
///
/// Channels are not `Send`: the spec pins each one to the executor that
/// created it, so this type deliberately carries no synchronization.
pub struct Channel {
    pub dev_channel: DevChannel,
    in_flight: usize,
    limit: usize,
    /// Operations deferred while their blob was frozen (§4.F), FIFO.
    queued_io: VecDeque<UserOp>,
    /// Count of ENOMEM retries absorbed since the channel was created,
    /// for diagnostics and for the test in `bsdev.rs`/`tests/`.
    pub enomem_retries: usize,
}

impl Channel {
    pub fn new(dev_channel: DevChannel, limit: usize) -> Channel {
        Channel { dev_channel, in_flight: 0, limit, queued_io: VecDeque::new(), enomem_retries: 0 }
    }

    pub fn queued_len(&self) -> usize {
        self.queued_io.len()
    }

    /// Defer a user operation until `drain_queued` is called (used while
    /// the owning blob is frozen).
    pub fn enqueue(&mut self, op: UserOp) {
        self.queued_io.push_back(op);
    }

    /// Run every queued operation in FIFO order through `run`, in the
    /// order they were deferred. Called once a blob's freeze count drops
    /// back to zero (§4.F).
    pub fn drain_queued(&mut self, mut run: impl FnMut(UserOp) -> Result<(), Errno>) -> Result<(), Errno> {
        let mut first_err = Errno::OK;
        while let Some(op) = self.queued_io.pop_front() {
            if let Err(e) = run(op) {
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

    fn begin(&mut self) {
        assert!(self.in_flight < self.limit, "channel op limit ({}) exceeded", self.limit);
        self.in_flight += 1;
    }

    fn end(&mut self) {
        self.in_flight -= 1;
    }

    /// Run `op`, immediately retrying on `-ENOMEM` until it succeeds or
    /// fails with something else.
    ///
    /// The real engine parks the request on the device's wait queue and
    /// is re-driven when a slot frees, without blocking the executor. A
    /// synchronous `BsDev` has no "later" to wait for — a freed slot and
    /// an immediate retry are the same event here — so this loop is that
    /// behavior's degenerate, single-threaded case rather than a
    /// different one.
    fn run_with_retry(&mut self, mut op: impl FnMut() -> Result<(), Errno>) -> Result<(), Errno> {
        self.begin();
        let result = loop {
            match op() {
                Err(Errno::ENOMEM) => self.enomem_retries += 1,
                other => break other,
            }
        };
        self.end();
        result
    }
}

/// A deferred data operation, queued on a `Channel` while its blob is
/// frozen and replayed once the freeze lifts.
///
/// `lba`/`lba_count` here are named after the wire-level fields they
/// eventually turn into, but the data path (`io.rs`) enqueues these in
/// logical page units — the blob may still be mid-resize while frozen,
/// so physical LBAs aren't assignable yet.
pub enum UserOp {
    Write { blob: BlobId, lba: u64, data: Vec<u8> },
    Unmap { blob: BlobId, lba: u64, lba_count: u64 },
    WriteZeroes { blob: BlobId, lba: u64, lba_count: u64 },
}

/// An ordered chain of device operations sharing one outcome (§4.B).
///
/// Stops submitting further steps as soon as one fails — matching the
/// metadata persist/load state machines (§4.G), which abandon the rest
/// of a page chain the moment a read or write comes back bad.
pub struct Sequence<'a> {
    channel: &'a mut Channel,
    error: Errno,
}

impl<'a> Sequence<'a> {
    pub fn new(channel: &'a mut Channel) -> Sequence<'a> {
        Sequence { channel, error: Errno::OK }
    }

    fn step(&mut self, dev: &dyn BsDev, op: impl FnMut() -> Result<(), Errno>) -> &mut Self {
        if self.error.is_ok() {
            let _ = dev;
            if let Err(e) = self.channel.run_with_retry(op) {
                self.error = e;
            }
        }
        self
    }

    pub fn read(&mut self, dev: &dyn BsDev, buf: &mut [u8], lba: u64, lba_count: u64) -> &mut Self {
        let ch = self.channel.dev_channel;
        self.step(dev, || dev.read(ch, buf, lba, lba_count));
        self
    }

    pub fn write(&mut self, dev: &dyn BsDev, buf: &[u8], lba: u64, lba_count: u64) -> &mut Self {
        let ch = self.channel.dev_channel;
        self.step(dev, || dev.write(ch, buf, lba, lba_count));
        self
    }

    pub fn unmap(&mut self, dev: &dyn BsDev, lba: u64, lba_count: u64) -> &mut Self {
        let ch = self.channel.dev_channel;
        self.step(dev, || dev.unmap(ch, lba, lba_count));
        self
    }

    /// The sequence's outcome: the first error encountered, or `OK`.
    pub fn finish(self) -> Errno {
        self.error
    }
}

/// An unordered group of device operations sharing one outcome (§4.B).
///
/// Unlike `Sequence`, every member runs regardless of earlier failures —
/// each is independent — and the result is the first error seen among
/// them, in submission order, matching batch semantics for cluster-split
/// readv/writev (§4.I).
pub struct Batch<'a> {
    channel: &'a mut Channel,
    error: Errno,
}

impl<'a> Batch<'a> {
    pub fn new(channel: &'a mut Channel) -> Batch<'a> {
        Batch { channel, error: Errno::OK }
    }

    /// Access the underlying channel, e.g. to run an out-of-band step
    /// (such as a cluster allocation's parent copy) between batch members.
    pub fn channel_mut(&mut self) -> &mut Channel {
        self.channel
    }

    fn member(&mut self, mut op: impl FnMut() -> Result<(), Errno>) {
        if let Err(e) = self.channel.run_with_retry(&mut op) {
            if self.error.is_ok() {
                self.error = e;
            }
        }
    }

    pub fn write(&mut self, dev: &dyn BsDev, buf: &[u8], lba: u64, lba_count: u64) -> &mut Self {
        let ch = self.channel.dev_channel;
        self.member(|| dev.write(ch, buf, lba, lba_count));
        self
    }

    pub fn read(&mut self, dev: &dyn BsDev, buf: &mut [u8], lba: u64, lba_count: u64) -> &mut Self {
        let ch = self.channel.dev_channel;
        self.member(|| dev.read(ch, buf, lba, lba_count));
        self
    }

    pub fn close(self) -> Errno {
        self.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsdev::MemDisk;

    #[test]
    fn sequence_stops_after_first_error() {
        let dev = MemDisk::new(4, 512);
        let dev_channel = dev.create_channel();
        let mut channel = Channel::new(dev_channel, MAX_MD_OPS);

        // The first step runs off the end of the device and fails; the
        // second must then be skipped, leaving block 0 untouched.
        let buf = vec![7u8; 512];
        let mut seq = Sequence::new(&mut channel);
        seq.write(&dev, &buf, 4, 1);
        seq.write(&dev, &buf, 0, 1);
        let err = seq.finish();
        assert_eq!(err, Errno::EINVAL);

        let dev_channel2 = dev.create_channel();
        let mut out = vec![1u8; 512];
        dev.read(dev_channel2, &mut out, 0, 1).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn run_with_retry_drains_enomem() {
        let dev = MemDisk::new(4, 512);
        let dev_channel = dev.create_channel();
        let mut channel = Channel::new(dev_channel, MAX_MD_OPS);
        dev.fail_next(3);
        let buf = vec![1u8; 512];
        let mut seq = Sequence::new(&mut channel);
        seq.write(&dev, &buf, 0, 1);
        assert!(seq.finish().is_ok());
        assert_eq!(channel.enomem_retries, 3);
    }

    #[test]
    fn queued_ops_drain_in_fifo_order() {
        let dev = MemDisk::new(4, 512);
        let dev_channel = dev.create_channel();
        let mut channel = Channel::new(dev_channel, MAX_MD_OPS);
        let id = BlobId::from_page_idx(0);
        channel.enqueue(UserOp::Write { blob: id, lba: 0, data: vec![1u8; 512] });
        channel.enqueue(UserOp::Write { blob: id, lba: 1, data: vec![2u8; 512] });
        assert_eq!(channel.queued_len(), 2);

        let mut order = Vec::new();
        channel
            .drain_queued(|op| {
                if let UserOp::Write { lba, .. } = op {
                    order.push(lba);
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(order, vec![0, 1]);
        assert_eq!(channel.queued_len(), 0);
    }
}
