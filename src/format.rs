//! On-disk byte layout (§3, §4.D, §4.K).
//!
//! Every type in this module is a pure codec: it knows how to turn itself
//! into or out of a page-sized byte buffer, nothing more. All multi-byte
//! integers are little-endian, read and written with `byteorder` the way
//! `tfs::io::header` does it. Checksums are CRC32C, computed over the
//! page with the checksum field itself zeroed.

use byteorder::{ByteOrder, LittleEndian};

use crate::errno::ErrorKind;

/// The page size: both the metadata-page size and the data I/O
/// granularity (§3).
pub const PAGE_SIZE: usize = 4096;
/// Sentinel `next` value terminating a metadata-page chain.
pub const INVALID_PAGE: u32 = u32::max_value();
/// Current on-disk format version.
pub const VERSION: u32 = 1;
/// Superblock magic.
pub const SIGNATURE: &[u8; 8] = b"SPDKBLOB";
/// Default cluster size (§3, carried from the original's
/// `SPDK_BLOB_OPTS_CLUSTER_SZ`).
pub const DEFAULT_CLUSTER_SIZE: u32 = 1024 * 1024;
/// Default metadata-operation budget per channel on the metadata target.
pub const DEFAULT_MAX_MD_OPS: u32 = 32;
/// Default metadata-operation budget per channel on the data target.
pub const DEFAULT_MAX_CHANNEL_OPS: u32 = 512;
/// Default metadata-page region size for a freshly formatted blobstore.
pub const DEFAULT_NUM_MD_PAGES: u32 = 1024;

quick_error! {
    /// A wire-format decoding error.
    #[derive(Debug)]
    pub enum Error {
        /// The superblock signature didn't match.
        UnknownFormat {
            description("unknown superblock signature")
        }
        /// The on-disk version is newer than this implementation supports.
        IncompatibleVersion(found: u32) {
            description("incompatible superblock version")
            display("superblock version {} is newer than supported version {}", found, VERSION)
        }
        /// A CRC didn't match the stored value.
        ChecksumMismatch {
            expected: u32,
            found: u32,
        } {
            description("checksum mismatch")
            display("checksum mismatch: stored {:08x}, computed {:08x}", expected, found)
        }
        /// `bstype` didn't match what the caller asked to load.
        BsTypeMismatch {
            description("bstype mismatch")
        }
        /// The device shrank since the blobstore was last unloaded.
        DeviceShrank {
            description("device shrank since last unload")
        }
        /// Superblock was not cleanly unloaded.
        UncleanShutdown {
            description("blobstore was not cleanly unloaded")
        }
        /// A descriptor's length field doesn't fit the remaining page.
        DescriptorTooLarge {
            description("descriptor does not fit within a single metadata page")
        }
        /// A metadata page's `sequence_num` didn't match its position in
        /// the chain.
        SequenceMismatch {
            expected: u32,
            found: u32,
        } {
            description("metadata page sequence number mismatch")
            display("expected sequence {}, found {}", expected, found)
        }
    }
}

impl Error {
    /// Map a decoding error to its §7 error kind.
    pub fn kind(&self) -> ErrorKind {
        match *self {
            Error::UnknownFormat
            | Error::IncompatibleVersion(_)
            | Error::ChecksumMismatch { .. }
            | Error::DeviceShrank
            | Error::UncleanShutdown
            | Error::SequenceMismatch { .. } => ErrorKind::InvalidState,
            Error::BsTypeMismatch => ErrorKind::InvalidState,
            Error::DescriptorTooLarge => ErrorKind::ResourceExhausted,
        }
    }
}

impl From<Error> for crate::errno::Errno {
    fn from(e: Error) -> crate::errno::Errno {
        crate::errno::Errno::from(e.kind())
    }
}

/// Compute the CRC32C of `buf`.
pub fn crc32c(buf: &[u8]) -> u32 {
    crc32c::crc32c(buf)
}

/// A blob identifier.
///
/// The low 32 bits are the blob's root metadata page index; the high 32
/// bits are a fixed, non-zero sentinel so that `id == page_idx` can never
/// accidentally hold (§3 "Entities / Blob").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobId(pub u64);

/// High-bits sentinel distinguishing a `BlobId` from a bare page index.
const BLOBID_SENTINEL: u64 = 1u64 << 32;

impl BlobId {
    /// The reserved "no blob" id.
    pub const INVALID: BlobId = BlobId(u64::max_value());

    /// Construct the id for the blob whose root page is `page_idx`.
    pub fn from_page_idx(page_idx: u32) -> BlobId {
        BlobId(BLOBID_SENTINEL | page_idx as u64)
    }

    /// The root metadata page index this id designates.
    pub fn page_idx(self) -> u32 {
        self.0 as u32
    }

    pub fn is_invalid(self) -> bool {
        self == BlobId::INVALID
    }
}

/// The blobstore superblock (page 0 of the device).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub version: u32,
    pub clean: bool,
    pub super_blob: BlobId,
    pub cluster_size: u32,
    pub used_page_mask_start: u32,
    pub used_page_mask_len: u32,
    pub used_cluster_mask_start: u32,
    pub used_cluster_mask_len: u32,
    pub used_blobid_mask_start: u32,
    pub used_blobid_mask_len: u32,
    pub md_start: u32,
    pub md_len: u32,
    pub bstype: [u8; 16],
    pub size: u64,
    pub io_unit_size: u32,
}

impl Superblock {
    /// Decode a superblock from a page-sized buffer, verifying signature
    /// and CRC (§4.K: mismatching CRC fails with `InvalidState`/`EILSEQ`
    /// one level up).
    pub fn decode(buf: &[u8]) -> Result<Superblock, Error> {
        assert_eq!(buf.len(), PAGE_SIZE);

        if &buf[0..8] != SIGNATURE {
            return Err(Error::UnknownFormat);
        }

        let found_crc = LittleEndian::read_u32(&buf[4092..4096]);
        let mut zeroed = [0u8; PAGE_SIZE];
        zeroed.copy_from_slice(buf);
        zeroed[4092..4096].copy_from_slice(&[0; 4]);
        let expected_crc = crc32c(&zeroed);
        if expected_crc != found_crc {
            return Err(Error::ChecksumMismatch { expected: expected_crc, found: found_crc });
        }

        let version = LittleEndian::read_u32(&buf[8..12]);
        if version > VERSION {
            return Err(Error::IncompatibleVersion(version));
        }

        let clean = LittleEndian::read_u32(&buf[16..20]) != 0;
        let super_blob = BlobId(LittleEndian::read_u64(&buf[20..28]));
        let cluster_size = LittleEndian::read_u32(&buf[28..32]);
        let used_page_mask_start = LittleEndian::read_u32(&buf[32..36]);
        let used_page_mask_len = LittleEndian::read_u32(&buf[36..40]);
        let used_cluster_mask_start = LittleEndian::read_u32(&buf[40..44]);
        let used_cluster_mask_len = LittleEndian::read_u32(&buf[44..48]);
        let used_blobid_mask_start = LittleEndian::read_u32(&buf[48..52]);
        let used_blobid_mask_len = LittleEndian::read_u32(&buf[52..56]);
        let md_start = LittleEndian::read_u32(&buf[56..60]);
        let md_len = LittleEndian::read_u32(&buf[60..64]);
        let mut bstype = [0u8; 16];
        bstype.copy_from_slice(&buf[64..80]);
        let size = LittleEndian::read_u64(&buf[80..88]);
        let io_unit_size = LittleEndian::read_u32(&buf[88..92]);

        Ok(Superblock {
            version,
            clean,
            super_blob,
            cluster_size,
            used_page_mask_start,
            used_page_mask_len,
            used_cluster_mask_start,
            used_cluster_mask_len,
            used_blobid_mask_start,
            used_blobid_mask_len,
            md_start,
            md_len,
            bstype,
            size,
            io_unit_size,
        })
    }

    /// Encode the superblock to a page-sized buffer, computing the CRC
    /// over the page with the CRC field zeroed.
    pub fn encode(&self) -> [u8; PAGE_SIZE] {
        let mut buf = [0u8; PAGE_SIZE];
        buf[0..8].copy_from_slice(SIGNATURE);
        LittleEndian::write_u32(&mut buf[8..12], self.version);
        LittleEndian::write_u32(&mut buf[12..16], PAGE_SIZE as u32);
        LittleEndian::write_u32(&mut buf[16..20], self.clean as u32);
        LittleEndian::write_u64(&mut buf[20..28], self.super_blob.0);
        LittleEndian::write_u32(&mut buf[28..32], self.cluster_size);
        LittleEndian::write_u32(&mut buf[32..36], self.used_page_mask_start);
        LittleEndian::write_u32(&mut buf[36..40], self.used_page_mask_len);
        LittleEndian::write_u32(&mut buf[40..44], self.used_cluster_mask_start);
        LittleEndian::write_u32(&mut buf[44..48], self.used_cluster_mask_len);
        LittleEndian::write_u32(&mut buf[48..52], self.used_blobid_mask_start);
        LittleEndian::write_u32(&mut buf[52..56], self.used_blobid_mask_len);
        LittleEndian::write_u32(&mut buf[56..60], self.md_start);
        LittleEndian::write_u32(&mut buf[60..64], self.md_len);
        buf[64..80].copy_from_slice(&self.bstype);
        LittleEndian::write_u64(&mut buf[80..88], self.size);
        LittleEndian::write_u32(&mut buf[88..92], self.io_unit_size);

        let crc = crc32c(&buf);
        LittleEndian::write_u32(&mut buf[4092..4096], crc);
        buf
    }

    /// Compatibility mode (§4.D): version 2+ images predating the
    /// used-blobid mask store zero/zero for its start/len.
    pub fn has_blobid_mask(&self) -> bool {
        self.used_blobid_mask_len != 0
    }
}

/// Pure arithmetic over the device's sizing parameters (§3 "Conversion
/// functions are pure arithmetic on these sizes; no knowledge of a
/// particular blob is involved").
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub blocklen: u32,
    pub cluster_size: u32,
    /// First metadata page's page index (not LBA).
    pub md_start: u32,
}

impl Layout {
    pub fn lba_per_page(&self) -> u64 {
        PAGE_SIZE as u64 / self.blocklen as u64
    }

    pub fn pages_per_cluster(&self) -> u64 {
        self.cluster_size as u64 / PAGE_SIZE as u64
    }

    pub fn lba_per_cluster(&self) -> u64 {
        self.cluster_size as u64 / self.blocklen as u64
    }

    /// LBA of page `page_idx`, counted from the start of the device.
    pub fn page_to_lba(&self, page_idx: u64) -> u64 {
        page_idx * self.lba_per_page()
    }

    /// LBA of metadata page `md_page_idx` (relative to `md_start`).
    pub fn md_page_to_lba(&self, md_page_idx: u32) -> u64 {
        self.page_to_lba(self.md_start as u64 + md_page_idx as u64)
    }

    /// LBA of the first block of cluster `cluster_idx`.
    pub fn cluster_to_lba(&self, cluster_idx: u64) -> u64 {
        cluster_idx * self.lba_per_cluster()
    }

    /// Which cluster LBA `lba` falls within.
    pub fn lba_to_cluster(&self, lba: u64) -> u64 {
        lba / self.lba_per_cluster()
    }
}

/// A mask page: the on-disk encoding of a used-pages/used-clusters/
/// used-blobids bitmap (§3 "Mask page").
pub struct MaskPage;

impl MaskPage {
    const HEADER_LEN: usize = 5;

    /// Number of mask pages needed to hold `bits` bits.
    pub fn pages_for_bits(bits: usize) -> usize {
        let bytes_needed = Self::HEADER_LEN + (bits + 7) / 8;
        (bytes_needed + PAGE_SIZE - 1) / PAGE_SIZE
    }

    /// Encode `bits` worth of a bitmap into `num_pages` page buffers.
    pub fn encode(mask_type: u8, bits: &crate::bitmap::BitArray, num_pages: usize) -> Vec<[u8; PAGE_SIZE]> {
        let mut pages = vec![[0u8; PAGE_SIZE]; num_pages.max(1)];
        pages[0][0] = mask_type;
        LittleEndian::write_u32(&mut pages[0][1..5], bits.capacity() as u32);

        let mut byte_pos = Self::HEADER_LEN;
        let mut page_idx = 0;
        let mut cur_byte = 0u8;
        let mut cur_bit = 0u8;
        for i in 0..bits.capacity() {
            if bits.get(i) {
                cur_byte |= 1 << cur_bit;
            }
            cur_bit += 1;
            if cur_bit == 8 {
                if byte_pos == PAGE_SIZE {
                    page_idx += 1;
                    byte_pos = 0;
                }
                pages[page_idx][byte_pos] = cur_byte;
                byte_pos += 1;
                cur_byte = 0;
                cur_bit = 0;
            }
        }
        if cur_bit != 0 {
            if byte_pos == PAGE_SIZE {
                page_idx += 1;
                byte_pos = 0;
            }
            pages[page_idx][byte_pos] = cur_byte;
        }
        pages
    }

    /// Decode a bitmap of `bits` bits from the given mask pages.
    pub fn decode(pages: &[&[u8]], bits: usize) -> crate::bitmap::BitArray {
        let mut arr = crate::bitmap::BitArray::new();
        arr.resize(bits);

        let mut byte_pos = Self::HEADER_LEN;
        let mut page_idx = 0;
        for i in 0..bits {
            if byte_pos == PAGE_SIZE {
                page_idx += 1;
                byte_pos = 0;
            }
            let byte = pages[page_idx][byte_pos];
            if byte & (1 << (i % 8)) != 0 {
                arr.set(i);
            }
            if i % 8 == 7 {
                byte_pos += 1;
            }
        }
        arr
    }
}

/// One TLV descriptor within a metadata page's descriptor area (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Extent { cluster_idx: u32, length_in_clusters: u32 },
    XattrPublic { name: String, value: Vec<u8> },
    XattrInternal { name: String, value: Vec<u8> },
    Flags { invalid_flags: u64, data_ro_flags: u64, md_ro_flags: u64 },
    SnapshotRef { parent_id: BlobId },
}

const DESCRIPTOR_PADDING: u8 = 0;
const DESCRIPTOR_EXTENT: u8 = 1;
const DESCRIPTOR_XATTR_PUBLIC: u8 = 2;
const DESCRIPTOR_XATTR_INTERNAL: u8 = 3;
const DESCRIPTOR_FLAGS: u8 = 4;
const DESCRIPTOR_SNAPSHOT_REF: u8 = 5;

impl Descriptor {
    /// Encoded byte length, including the 5-byte `{type, length}` header.
    pub fn encoded_len(&self) -> usize {
        5 + match *self {
            Descriptor::Extent { .. } => 8,
            Descriptor::XattrPublic { ref name, ref value } | Descriptor::XattrInternal { ref name, ref value } => {
                4 + name.len() + value.len()
            }
            Descriptor::Flags { .. } => 24,
            Descriptor::SnapshotRef { .. } => 8,
        }
    }

    fn write(&self, buf: &mut Vec<u8>) {
        match *self {
            Descriptor::Extent { cluster_idx, length_in_clusters } => {
                buf.push(DESCRIPTOR_EXTENT);
                let mut tmp = [0u8; 4];
                LittleEndian::write_u32(&mut tmp, 8);
                buf.extend_from_slice(&tmp);
                LittleEndian::write_u32(&mut tmp, cluster_idx);
                buf.extend_from_slice(&tmp);
                LittleEndian::write_u32(&mut tmp, length_in_clusters);
                buf.extend_from_slice(&tmp);
            }
            Descriptor::XattrPublic { ref name, ref value } | Descriptor::XattrInternal { ref name, ref value } => {
                let ty = if let Descriptor::XattrPublic { .. } = *self {
                    DESCRIPTOR_XATTR_PUBLIC
                } else {
                    DESCRIPTOR_XATTR_INTERNAL
                };
                buf.push(ty);
                let mut tmp4 = [0u8; 4];
                LittleEndian::write_u32(&mut tmp4, (4 + name.len() + value.len()) as u32);
                buf.extend_from_slice(&tmp4);
                let mut tmp2 = [0u8; 2];
                LittleEndian::write_u16(&mut tmp2, name.len() as u16);
                buf.extend_from_slice(&tmp2);
                LittleEndian::write_u16(&mut tmp2, value.len() as u16);
                buf.extend_from_slice(&tmp2);
                buf.extend_from_slice(name.as_bytes());
                buf.extend_from_slice(value);
            }
            Descriptor::Flags { invalid_flags, data_ro_flags, md_ro_flags } => {
                buf.push(DESCRIPTOR_FLAGS);
                let mut tmp4 = [0u8; 4];
                LittleEndian::write_u32(&mut tmp4, 24);
                buf.extend_from_slice(&tmp4);
                let mut tmp8 = [0u8; 8];
                LittleEndian::write_u64(&mut tmp8, invalid_flags);
                buf.extend_from_slice(&tmp8);
                LittleEndian::write_u64(&mut tmp8, data_ro_flags);
                buf.extend_from_slice(&tmp8);
                LittleEndian::write_u64(&mut tmp8, md_ro_flags);
                buf.extend_from_slice(&tmp8);
            }
            Descriptor::SnapshotRef { parent_id } => {
                buf.push(DESCRIPTOR_SNAPSHOT_REF);
                let mut tmp4 = [0u8; 4];
                LittleEndian::write_u32(&mut tmp4, 8);
                buf.extend_from_slice(&tmp4);
                let mut tmp8 = [0u8; 8];
                LittleEndian::write_u64(&mut tmp8, parent_id.0);
                buf.extend_from_slice(&tmp8);
            }
        }
    }
}

/// The result of parsing one metadata page's descriptor area (§4.F).
#[derive(Debug, Default)]
pub struct ParsedDescriptors {
    pub descriptors: Vec<Descriptor>,
    /// True if an unknown, non-padding descriptor type terminated parsing
    /// early; the remainder of the page (and of the chain) is untrusted.
    pub truncated: bool,
}

/// A metadata page (§3 "Md page").
pub struct MdPage {
    pub id: BlobId,
    pub sequence_num: u32,
    pub next: u32,
}

impl MdPage {
    const DESCRIPTORS_LEN: usize = 4072;

    /// Parse the descriptor area of an already-loaded page buffer.
    pub fn parse_descriptors(buf: &[u8]) -> ParsedDescriptors {
        let mut out = ParsedDescriptors::default();
        let area = &buf[16..16 + Self::DESCRIPTORS_LEN];
        let mut pos = 0;
        while pos + 5 <= area.len() {
            let ty = area[pos];
            let len = LittleEndian::read_u32(&area[pos + 1..pos + 5]) as usize;
            if ty == DESCRIPTOR_PADDING && len == 0 {
                break;
            }
            if pos + 5 + len > area.len() {
                out.truncated = true;
                break;
            }
            let payload = &area[pos + 5..pos + 5 + len];
            let descriptor = match ty {
                DESCRIPTOR_EXTENT => {
                    let mut extents = Vec::new();
                    let mut p = 0;
                    while p + 8 <= payload.len() {
                        extents.push(Descriptor::Extent {
                            cluster_idx: LittleEndian::read_u32(&payload[p..p + 4]),
                            length_in_clusters: LittleEndian::read_u32(&payload[p + 4..p + 8]),
                        });
                        p += 8;
                    }
                    out.descriptors.extend(extents);
                    pos += 5 + len;
                    continue;
                }
                DESCRIPTOR_XATTR_PUBLIC | DESCRIPTOR_XATTR_INTERNAL => {
                    if payload.len() < 4 {
                        out.truncated = true;
                        break;
                    }
                    let name_len = LittleEndian::read_u16(&payload[0..2]) as usize;
                    let value_len = LittleEndian::read_u16(&payload[2..4]) as usize;
                    if 4 + name_len + value_len > payload.len() {
                        out.truncated = true;
                        break;
                    }
                    let name = String::from_utf8_lossy(&payload[4..4 + name_len]).into_owned();
                    let value = payload[4 + name_len..4 + name_len + value_len].to_vec();
                    if ty == DESCRIPTOR_XATTR_PUBLIC {
                        Descriptor::XattrPublic { name, value }
                    } else {
                        Descriptor::XattrInternal { name, value }
                    }
                }
                DESCRIPTOR_FLAGS => {
                    if payload.len() < 24 {
                        out.truncated = true;
                        break;
                    }
                    Descriptor::Flags {
                        invalid_flags: LittleEndian::read_u64(&payload[0..8]),
                        data_ro_flags: LittleEndian::read_u64(&payload[8..16]),
                        md_ro_flags: LittleEndian::read_u64(&payload[16..24]),
                    }
                }
                DESCRIPTOR_SNAPSHOT_REF => {
                    if payload.len() < 8 {
                        out.truncated = true;
                        break;
                    }
                    Descriptor::SnapshotRef { parent_id: BlobId(LittleEndian::read_u64(&payload[0..8])) }
                }
                _ => {
                    // Unknown descriptor type: stop parsing; the remainder
                    // of the chain is considered untrusted (§4.F step 3).
                    out.truncated = true;
                    break;
                }
            };
            out.descriptors.push(descriptor);
            pos += 5 + len;
        }
        out
    }

    /// Serialize descriptors into as many page buffers as needed,
    /// returning `(page buffer, id, sequence_num, next)` tuples assembled
    /// by the caller once page indices are known. Returns
    /// `Err(DescriptorTooLarge)` if a single descriptor cannot fit on an
    /// empty page.
    pub fn serialize_descriptors(descriptors: &[Descriptor]) -> Result<Vec<Vec<u8>>, Error> {
        let mut pages: Vec<Vec<u8>> = vec![Vec::new()];
        for d in descriptors {
            let needed = d.encoded_len();
            if needed > Self::DESCRIPTORS_LEN {
                return Err(Error::DescriptorTooLarge);
            }
            if pages.last().unwrap().len() + needed > Self::DESCRIPTORS_LEN {
                pages.push(Vec::new());
            }
            d.write(pages.last_mut().unwrap());
        }
        Ok(pages)
    }

    /// Encode one page of the chain given its already-serialized
    /// descriptor bytes and position in the chain.
    pub fn encode_page(id: BlobId, sequence_num: u32, descriptor_bytes: &[u8], next: u32) -> [u8; PAGE_SIZE] {
        assert!(descriptor_bytes.len() <= Self::DESCRIPTORS_LEN);
        let mut buf = [0u8; PAGE_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], id.0);
        LittleEndian::write_u32(&mut buf[8..12], sequence_num);
        buf[16..16 + descriptor_bytes.len()].copy_from_slice(descriptor_bytes);
        LittleEndian::write_u32(&mut buf[4088..4092], next);
        let crc = crc32c(&buf);
        LittleEndian::write_u32(&mut buf[4092..4096], crc);
        buf
    }

    /// Decode the page header (id, sequence, next) and verify its CRC.
    pub fn decode_header(buf: &[u8]) -> Result<MdPage, Error> {
        assert_eq!(buf.len(), PAGE_SIZE);
        let found_crc = LittleEndian::read_u32(&buf[4092..4096]);
        let mut zeroed = buf.to_vec();
        zeroed[4092..4096].copy_from_slice(&[0; 4]);
        let expected = crc32c(&zeroed);
        if expected != found_crc {
            return Err(Error::ChecksumMismatch { expected, found: found_crc });
        }
        Ok(MdPage {
            id: BlobId(LittleEndian::read_u64(&buf[0..8])),
            sequence_num: LittleEndian::read_u32(&buf[8..12]),
            next: LittleEndian::read_u32(&buf[4088..4092]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_round_trip() {
        let sb = Superblock {
            version: VERSION,
            clean: true,
            super_blob: BlobId::INVALID,
            cluster_size: DEFAULT_CLUSTER_SIZE,
            used_page_mask_start: 1,
            used_page_mask_len: 1,
            used_cluster_mask_start: 2,
            used_cluster_mask_len: 1,
            used_blobid_mask_start: 3,
            used_blobid_mask_len: 1,
            md_start: 4,
            md_len: 100,
            bstype: [0; 16],
            size: 64 * 1024 * 1024,
            io_unit_size: 4096,
        };
        let buf = sb.encode();
        let decoded = Superblock::decode(&buf).unwrap();
        assert_eq!(sb, decoded);
    }

    #[test]
    fn superblock_bad_signature() {
        let mut buf = [0u8; PAGE_SIZE];
        buf[0] = b'X';
        assert!(matches!(Superblock::decode(&buf), Err(Error::UnknownFormat)));
    }

    #[test]
    fn superblock_checksum_mismatch() {
        let sb = Superblock {
            version: VERSION,
            clean: true,
            super_blob: BlobId::INVALID,
            cluster_size: DEFAULT_CLUSTER_SIZE,
            used_page_mask_start: 0,
            used_page_mask_len: 0,
            used_cluster_mask_start: 0,
            used_cluster_mask_len: 0,
            used_blobid_mask_start: 0,
            used_blobid_mask_len: 0,
            md_start: 0,
            md_len: 0,
            bstype: [0; 16],
            size: 0,
            io_unit_size: 4096,
        };
        let mut buf = sb.encode();
        buf[50] ^= 0xFF;
        assert!(matches!(Superblock::decode(&buf), Err(Error::ChecksumMismatch { .. })));
    }

    #[test]
    fn descriptor_extent_round_trip() {
        let descriptors = vec![
            Descriptor::Extent { cluster_idx: 0, length_in_clusters: 5 },
            Descriptor::XattrPublic { name: "foo".into(), value: b"bar".to_vec() },
        ];
        let pages = MdPage::serialize_descriptors(&descriptors).unwrap();
        assert_eq!(pages.len(), 1);
        let page = MdPage::encode_page(BlobId::from_page_idx(3), 0, &pages[0], INVALID_PAGE);
        let parsed = MdPage::parse_descriptors(&page);
        assert!(!parsed.truncated);
        assert_eq!(parsed.descriptors, descriptors);
        let header = MdPage::decode_header(&page).unwrap();
        assert_eq!(header.id, BlobId::from_page_idx(3));
        assert_eq!(header.next, INVALID_PAGE);
    }

    #[test]
    fn blob_id_sentinel() {
        let id = BlobId::from_page_idx(42);
        assert_eq!(id.page_idx(), 42);
        assert_ne!(id.0, 42);
        assert!(!id.is_invalid());
        assert!(BlobId::INVALID.is_invalid());
    }

    #[test]
    fn mask_page_round_trip() {
        let mut bits = crate::bitmap::BitArray::new();
        bits.resize(4000);
        bits.set(0);
        bits.set(17);
        bits.set(3999);
        let npages = MaskPage::pages_for_bits(4000);
        let encoded = MaskPage::encode(0, &bits, npages);
        let refs: Vec<&[u8]> = encoded.iter().map(|p| &p[..]).collect();
        let decoded = MaskPage::decode(&refs, 4000);
        assert!(decoded.get(0));
        assert!(decoded.get(17));
        assert!(decoded.get(3999));
        assert!(!decoded.get(1));
    }
}
