//! Bounded memory reads
//!
//! Handlers never dereference a kernel object directly. Every field is
//! copied out through a [`MemoryReader`] and every copy may fail: the target
//! can be unmapped, reallocated, or racing with a concurrent writer. Callers
//! read all the fields they need before touching any table, so a failure
//! leaves no partial state behind.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ReadError;

/// Opaque reference to a kernel object (socket, file, dentry, sk_buff).
///
/// Handles are only ever offset and passed back to a reader. They are never
/// dereferenced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub u64);

impl Handle {
    pub const NULL: Handle = Handle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address of a field `offset` bytes into the object
    pub fn field(self, offset: u64) -> u64 {
        self.0.wrapping_add(offset)
    }
}

impl From<u64> for Handle {
    fn from(addr: u64) -> Self {
        Handle(addr)
    }
}

/// Fallible "copy N bytes from this address" capability.
///
/// Implementations must fill all of `dst` or return an error; a partially
/// written buffer is never observed by callers.
pub trait MemoryReader: Send + Sync {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), ReadError>;
}

impl<R: MemoryReader + ?Sized> MemoryReader for std::sync::Arc<R> {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), ReadError> {
        (**self).read(addr, dst)
    }
}

/// Typed helpers over [`MemoryReader`]. Integers are native endian, as laid
/// out in kernel memory; network-order fields are read with [`read_array`].
///
/// [`read_array`]: ReadExt::read_array
pub trait ReadExt: MemoryReader {
    fn read_array<const N: usize>(&self, addr: u64) -> Result<[u8; N], ReadError> {
        let mut buf = [0u8; N];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    fn read_u8(&self, addr: u64) -> Result<u8, ReadError> {
        Ok(self.read_array::<1>(addr)?[0])
    }

    fn read_u16(&self, addr: u64) -> Result<u16, ReadError> {
        Ok(u16::from_ne_bytes(self.read_array(addr)?))
    }

    /// A 16-bit field stored in network byte order (ports)
    fn read_be_u16(&self, addr: u64) -> Result<u16, ReadError> {
        Ok(u16::from_be_bytes(self.read_array(addr)?))
    }

    fn read_u32(&self, addr: u64) -> Result<u32, ReadError> {
        Ok(u32::from_ne_bytes(self.read_array(addr)?))
    }

    fn read_u64(&self, addr: u64) -> Result<u64, ReadError> {
        Ok(u64::from_ne_bytes(self.read_array(addr)?))
    }

    fn read_handle(&self, addr: u64) -> Result<Handle, ReadError> {
        self.read_u64(addr).map(Handle)
    }
}

impl<R: MemoryReader + ?Sized> ReadExt for R {}

/// An in-process memory image standing in for kernel memory.
///
/// Memory is a set of non-overlapping regions. A read succeeds only when the
/// whole range lies inside one region, so reads that straddle a gap or run
/// off the end of an object fail the way a faulting kernel read would.
#[derive(Debug, Default)]
pub struct SimulatedMemory {
    regions: RwLock<BTreeMap<u64, Vec<u8>>>,
    reads: AtomicU64,
    log: Option<Mutex<Vec<u64>>>,
}

impl SimulatedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory that records the address of every read, in order
    pub fn with_read_log() -> Self {
        Self {
            log: Some(Mutex::new(Vec::new())),
            ..Self::default()
        }
    }

    /// Map `bytes` at `base`, replacing any region previously mapped there.
    pub fn map(&self, base: u64, bytes: Vec<u8>) {
        self.regions.write().insert(base, bytes);
    }

    pub fn map_zeroed(&self, base: u64, len: usize) {
        self.map(base, vec![0u8; len]);
    }

    pub fn unmap(&self, base: u64) -> Option<Vec<u8>> {
        self.regions.write().remove(&base)
    }

    /// Overwrite bytes inside an existing region
    pub fn write(&self, addr: u64, bytes: &[u8]) -> Result<(), ReadError> {
        let mut regions = self.regions.write();
        let (base, region) = regions
            .range_mut(..=addr)
            .next_back()
            .ok_or(ReadError::new(addr, bytes.len()))?;
        let range = span(*base, region.len(), addr, bytes.len())?;
        region[range].copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u16(&self, addr: u64, value: u16) -> Result<(), ReadError> {
        self.write(addr, &value.to_ne_bytes())
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), ReadError> {
        self.write(addr, &value.to_ne_bytes())
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), ReadError> {
        self.write(addr, &value.to_ne_bytes())
    }

    /// Total reads attempted, successful or not
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Addresses of every read so far. Empty unless created with
    /// [`SimulatedMemory::with_read_log`].
    pub fn read_log(&self) -> Vec<u64> {
        self.log.as_ref().map(|l| l.lock().clone()).unwrap_or_default()
    }

    pub fn reset_reads(&self) {
        self.reads.store(0, Ordering::Relaxed);
        if let Some(log) = &self.log {
            log.lock().clear();
        }
    }
}

impl MemoryReader for SimulatedMemory {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), ReadError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if let Some(log) = &self.log {
            log.lock().push(addr);
        }

        let regions = self.regions.read();
        let (base, region) = regions
            .range(..=addr)
            .next_back()
            .ok_or(ReadError::new(addr, dst.len()))?;
        let range = span(*base, region.len(), addr, dst.len())?;
        dst.copy_from_slice(&region[range]);
        Ok(())
    }
}

/// Index range of `[addr, addr + len)` inside a region, if it fits entirely
fn span(base: u64, region_len: usize, addr: u64, len: usize) -> Result<std::ops::Range<usize>, ReadError> {
    let err = ReadError::new(addr, len);
    let start = usize::try_from(addr - base).map_err(|_| err)?;
    let end = start.checked_add(len).ok_or(err)?;
    if end > region_len {
        return Err(err);
    }
    Ok(start..end)
}
