//! Single-file blob store.
//!
//! A bundle file is a superblock, a fixed-capacity descriptor table and a
//! data area. Blobs are keyed by the SHA-256 of their bytes and tagged
//! with a kind; the root index has its own kind so exactly one
//! descriptor per file can be distinguished from ordinary blobs. All
//! integers are little-endian.
//!
//! Reads are positioned (`pread`) over a shared file handle, so blob
//! readers stream without holding any lock. Mutations rewrite the
//! descriptor table in place; compaction slides retained blobs down and
//! truncates the file.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use oci_spec::image::Digest;
use sha2::{Digest as _, Sha256};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{digest, Error, Result};

const MAGIC: [u8; 8] = *b"OCIBNDL\0";
const VERSION: u32 = 1;
const FLAG_USED: u32 = 1;

/// Content-addressed OCI blob (layer, config or manifest bytes).
pub(crate) const KIND_OCI_BLOB: u32 = 1;
/// The persistent root index; exactly one per file.
pub(crate) const KIND_ROOT_INDEX: u32 = 2;

#[derive(Clone, Copy, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
struct SuperBlock {
    magic: [u8; 8],
    version: U32,
    capacity: U32,
    created: U64,
    reserved: [u8; 8],
}

#[derive(Clone, Copy, Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
struct RawSlot {
    kind: U32,
    flags: U32,
    offset: U64,
    size: U64,
    sha256: [u8; 32],
}

const SUPERBLOCK_SIZE: u64 = std::mem::size_of::<SuperBlock>() as u64;
const SLOT_SIZE: u64 = std::mem::size_of::<RawSlot>() as u64;

impl RawSlot {
    fn used(&self) -> bool {
        self.flags.get() & FLAG_USED != 0
    }
}

/// A used descriptor-table entry.
#[derive(Clone, Debug)]
pub(crate) struct BlobDescriptor {
    pub(crate) slot: usize,
    pub(crate) kind: u32,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) sha256: [u8; 32],
}

impl BlobDescriptor {
    pub(crate) fn digest(&self) -> Digest {
        digest::from_raw_sha256(&self.sha256)
    }
}

/// Options for creating a bundle file.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CreateOpts {
    pub(crate) descriptor_capacity: u64,
    pub(crate) deterministic: bool,
}

/// Options for [`BlobFile::delete_objects`].
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DeleteOpts {
    /// Overwrite freed data regions with zeros.
    pub(crate) zero: bool,
    /// Slide retained blobs down and truncate the file.
    pub(crate) compact: bool,
}

/// A single file holding a descriptor table and blob data.
#[derive(Debug)]
pub(crate) struct BlobFile {
    file: Arc<File>,
    slots: Vec<RawSlot>,
}

impl BlobFile {
    /// Create a new file at `path` with a fixed descriptor capacity.
    pub(crate) fn create_at(path: impl AsRef<Path>, opts: CreateOpts) -> Result<BlobFile> {
        let capacity = u32::try_from(opts.descriptor_capacity)
            .map_err(|_| Error::InvalidBundle("descriptor capacity too large".into()))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let created = if opts.deterministic {
            0
        } else {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        };

        let superblock = SuperBlock {
            magic: MAGIC,
            version: U32::new(VERSION),
            capacity: U32::new(capacity),
            created: U64::new(created),
            reserved: [0; 8],
        };
        file.write_all_at(superblock.as_bytes(), 0)?;

        let slots = vec![RawSlot::default(); capacity as usize];
        let store = BlobFile {
            file: Arc::new(file),
            slots,
        };
        store.flush_table()?;
        Ok(store)
    }

    /// Open an existing bundle file.
    pub(crate) fn load(path: impl AsRef<Path>) -> Result<BlobFile> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut header = [0u8; SUPERBLOCK_SIZE as usize];
        file.read_exact_at(&mut header, 0)
            .map_err(|_| Error::InvalidBundle("file too short for superblock".into()))?;
        let superblock = SuperBlock::read_from_bytes(&header)
            .map_err(|_| Error::InvalidBundle("malformed superblock".into()))?;

        if superblock.magic != MAGIC {
            return Err(Error::InvalidBundle("bad magic".into()));
        }
        if superblock.version.get() != VERSION {
            return Err(Error::InvalidBundle(format!(
                "unsupported version {}",
                superblock.version.get()
            )));
        }

        let capacity = superblock.capacity.get() as usize;
        let mut table = vec![0u8; capacity * SLOT_SIZE as usize];
        file.read_exact_at(&mut table, SUPERBLOCK_SIZE)
            .map_err(|_| Error::InvalidBundle("file too short for descriptor table".into()))?;

        let mut slots = Vec::with_capacity(capacity);
        for chunk in table.chunks_exact(SLOT_SIZE as usize) {
            let slot = RawSlot::read_from_bytes(chunk)
                .map_err(|_| Error::InvalidBundle("malformed descriptor".into()))?;
            slots.push(slot);
        }

        Ok(BlobFile {
            file: Arc::new(file),
            slots,
        })
    }

    fn table_end(&self) -> u64 {
        SUPERBLOCK_SIZE + self.slots.len() as u64 * SLOT_SIZE
    }

    fn data_end(&self) -> u64 {
        self.slots
            .iter()
            .filter(|s| s.used())
            .map(|s| s.offset.get() + s.size.get())
            .max()
            .unwrap_or_else(|| self.table_end())
    }

    fn flush_table(&self) -> Result<()> {
        self.file
            .write_all_at(self.slots.as_slice().as_bytes(), SUPERBLOCK_SIZE)?;
        Ok(())
    }

    fn descriptor_at(&self, index: usize) -> BlobDescriptor {
        let slot = &self.slots[index];
        BlobDescriptor {
            slot: index,
            kind: slot.kind.get(),
            offset: slot.offset.get(),
            size: slot.size.get(),
            sha256: slot.sha256,
        }
    }

    /// Append a typed blob, hashing it while it is written. Errors with
    /// [`Error::DescriptorTableFull`] when every slot is in use.
    pub(crate) fn add_object(&mut self, kind: u32, mut data: impl Read) -> Result<BlobDescriptor> {
        let slot_index = self
            .slots
            .iter()
            .position(|s| !s.used())
            .ok_or(Error::DescriptorTableFull)?;

        let offset = self.data_end();
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = data.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.file.write_all_at(&buf[..n], offset + size)?;
            hasher.update(&buf[..n]);
            size += n as u64;
        }

        self.slots[slot_index] = RawSlot {
            kind: U32::new(kind),
            flags: U32::new(FLAG_USED),
            offset: U64::new(offset),
            size: U64::new(size),
            sha256: hasher.finalize().into(),
        };
        self.flush_table()?;
        Ok(self.descriptor_at(slot_index))
    }

    /// All used descriptors of the given kind, in slot order.
    pub(crate) fn descriptors(&self, kind: u32) -> Vec<BlobDescriptor> {
        (0..self.slots.len())
            .filter(|&i| self.slots[i].used() && self.slots[i].kind.get() == kind)
            .map(|i| self.descriptor_at(i))
            .collect()
    }

    /// The first used descriptor of the given kind with the given hash.
    pub(crate) fn descriptor(&self, kind: u32, sha256: &[u8; 32]) -> Option<BlobDescriptor> {
        (0..self.slots.len())
            .find(|&i| {
                let slot = &self.slots[i];
                slot.used() && slot.kind.get() == kind && slot.sha256 == *sha256
            })
            .map(|i| self.descriptor_at(i))
    }

    /// Delete every used descriptor selected by `predicate`; returns the
    /// number deleted.
    pub(crate) fn delete_objects(
        &mut self,
        predicate: impl Fn(&BlobDescriptor) -> bool,
        opts: DeleteOpts,
    ) -> Result<usize> {
        let mut deleted = 0;
        for i in 0..self.slots.len() {
            if !self.slots[i].used() {
                continue;
            }
            let desc = self.descriptor_at(i);
            if !predicate(&desc) {
                continue;
            }
            if opts.zero {
                self.zero_region(desc.offset, desc.size)?;
            }
            self.slots[i] = RawSlot::default();
            deleted += 1;
        }

        if opts.compact {
            self.compact()?;
        }
        self.flush_table()?;
        Ok(deleted)
    }

    fn zero_region(&self, offset: u64, size: u64) -> Result<()> {
        let zeros = [0u8; 64 * 1024];
        let mut done = 0u64;
        while done < size {
            let chunk = (size - done).min(zeros.len() as u64) as usize;
            self.file.write_all_at(&zeros[..chunk], offset + done)?;
            done += chunk as u64;
        }
        Ok(())
    }

    /// Slide every retained blob down so the data area is contiguous,
    /// then truncate the file.
    fn compact(&mut self) -> Result<()> {
        let mut order: Vec<usize> = (0..self.slots.len())
            .filter(|&i| self.slots[i].used())
            .collect();
        order.sort_by_key(|&i| self.slots[i].offset.get());

        let mut cursor = self.table_end();
        for i in order {
            let offset = self.slots[i].offset.get();
            let size = self.slots[i].size.get();
            if offset != cursor {
                self.move_region(offset, cursor, size)?;
                self.slots[i].offset = U64::new(cursor);
            }
            cursor += size;
        }
        self.file.set_len(cursor)?;
        Ok(())
    }

    fn move_region(&self, from: u64, to: u64, size: u64) -> Result<()> {
        // Destination is always below the source, so an ascending
        // chunked copy never reads clobbered bytes.
        let mut buf = [0u8; 64 * 1024];
        let mut done = 0u64;
        while done < size {
            let chunk = (size - done).min(buf.len() as u64) as usize;
            self.file.read_exact_at(&mut buf[..chunk], from + done)?;
            self.file.write_all_at(&buf[..chunk], to + done)?;
            done += chunk as u64;
        }
        Ok(())
    }

    /// Offset of the blob's data within the file.
    pub(crate) fn offset(&self, desc: &BlobDescriptor) -> u64 {
        desc.offset
    }

    /// The blob's bytes.
    pub(crate) fn data(&self, desc: &BlobDescriptor) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; desc.size as usize];
        self.file.read_exact_at(&mut buf, desc.offset)?;
        Ok(buf)
    }

    /// A positioned reader over the blob's bytes. The reader holds its
    /// own handle reference and needs no lock while streaming.
    pub(crate) fn reader(&self, desc: &BlobDescriptor) -> BlobReader {
        BlobReader {
            file: Arc::clone(&self.file),
            offset: desc.offset,
            remaining: desc.size,
        }
    }
}

/// Positioned reader over one blob.
#[derive(Debug)]
pub(crate) struct BlobReader {
    file: Arc<File>,
    offset: u64,
    remaining: u64,
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.remaining) as usize;
        let n = self.file.read_at(&mut buf[..want], self.offset)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "blob truncated",
            ));
        }
        self.offset += n as u64;
        self.remaining -= n as u64;
        Ok(n)
    }
}
