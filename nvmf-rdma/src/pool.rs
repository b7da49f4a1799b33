//! Registered-buffer memory pool
//!
//! RDMA needs every send/receive buffer registered with the protection
//! domain. Registration pins memory and is expensive, so the pool registers
//! whole regions lazily and slices them into fixed-size elements:
//! - at most `regions` regions per pool, never more
//! - a region is carved only when the free queue is empty
//! - elements are handed out FIFO and return on `release()` or drop
//!
//! Regions are freed by `teardown()`, never by element release counts.
//! An element still outstanding at teardown keeps its region mapped until
//! it goes away, but it is not requeued into the reset pool.

use crate::config::PoolConfig;
use crate::error::{NvmfError, Result};
use crate::transport::{MemoryRegion, MemoryRegistrar};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::ptr::{self, NonNull};
use std::sync::Arc;

/// Byte order applied to multi-byte element accessors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    LittleEndian,
    BigEndian,
}

fn check_range(range: &Range<usize>, capacity: usize) -> Result<()> {
    if range.start > range.end {
        return Err(NvmfError::invalid_argument(format!(
            "inverted range {:?}",
            range
        )));
    }
    check_bounds(range.start, range.end - range.start, capacity)
}

fn check_bounds(index: usize, len: usize, capacity: usize) -> Result<()> {
    match index.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(NvmfError::OutOfBounds {
            index,
            len,
            capacity,
        }),
    }
}

macro_rules! read_accessors {
    ($($name:ident => $ty:ty),* $(,)?) => {
        $(
            fn $name(&self, index: usize) -> Result<$ty> {
                let bytes = self.bytes()?;
                check_bounds(index, std::mem::size_of::<$ty>(), bytes.len())?;
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[index..index + std::mem::size_of::<$ty>()]);
                Ok(match self.order() {
                    ByteOrder::LittleEndian => <$ty>::from_le_bytes(raw),
                    ByteOrder::BigEndian => <$ty>::from_be_bytes(raw),
                })
            }
        )*
    };
}

macro_rules! write_accessors {
    ($($name:ident => $ty:ty),* $(,)?) => {
        $(
            fn $name(&mut self, index: usize, value: $ty) -> Result<()> {
                let order = self.order();
                let bytes = self.bytes_mut()?;
                check_bounds(index, std::mem::size_of::<$ty>(), bytes.len())?;
                let raw = match order {
                    ByteOrder::LittleEndian => value.to_le_bytes(),
                    ByteOrder::BigEndian => value.to_be_bytes(),
                };
                bytes[index..index + raw.len()].copy_from_slice(&raw);
                Ok(())
            }
        )*
    };
}

/// Absolute, bounds-checked reads in the buffer's byte order
pub trait ByteAccess {
    fn bytes(&self) -> Result<&[u8]>;

    fn order(&self) -> ByteOrder;

    fn get_u8(&self, index: usize) -> Result<u8> {
        let bytes = self.bytes()?;
        check_bounds(index, 1, bytes.len())?;
        Ok(bytes[index])
    }

    read_accessors!(get_u16 => u16, get_u32 => u32, get_u64 => u64);
}

/// Absolute, bounds-checked writes in the buffer's byte order
pub trait ByteAccessMut: ByteAccess {
    fn bytes_mut(&mut self) -> Result<&mut [u8]>;

    fn put_u8(&mut self, index: usize, value: u8) -> Result<()> {
        let bytes = self.bytes_mut()?;
        check_bounds(index, 1, bytes.len())?;
        bytes[index] = value;
        Ok(())
    }

    write_accessors!(put_u16 => u16, put_u32 => u32, put_u64 => u64);
}

/// Buffer the peer can address directly
pub trait KeyedBuffer {
    /// Address of the first byte to transfer
    fn data_address(&self) -> u64;

    /// Number of bytes to transfer
    fn data_length(&self) -> usize;

    fn local_key(&self) -> u32;

    fn remote_key(&self) -> u32;
}

/// Anonymous private mapping backing one region
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the mapping is plain process memory; access is partitioned
// between elements, each of which owns a disjoint range.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn new(len: usize) -> Result<Self> {
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| NvmfError::invalid_argument("mmap returned null"))?;
        Ok(Self { ptr, len })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// Registered region; dropping it deregisters, then unmaps
struct Region {
    registration: Box<dyn MemoryRegion>,
    mapping: Mapping,
    index: usize,
}

impl Region {
    fn base(&self) -> *mut u8 {
        self.mapping.ptr.as_ptr()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        debug!(
            "Releasing region {}: addr={:?}, len={}",
            self.index,
            self.base(),
            self.mapping.len
        );
    }
}

struct FreeSlot {
    region: Arc<Region>,
    offset: usize,
}

struct PoolState {
    free: VecDeque<FreeSlot>,
    /// Allocation order; teardown pops from the back
    regions: Vec<Arc<Region>>,
    free_regions: usize,
    /// Bumped by teardown so stale elements are not requeued
    epoch: u64,
}

struct PoolShared {
    registrar: Arc<dyn MemoryRegistrar>,
    element_size: usize,
    elements_per_region: usize,
    max_regions: usize,
    order: ByteOrder,
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn allocate_region(&self, state: &mut PoolState) -> Result<()> {
        if !state.free.is_empty() {
            return Ok(());
        }
        if state.free_regions == 0 {
            return Err(NvmfError::OutOfMemory {
                regions: self.max_regions,
            });
        }

        let len = self.element_size * self.elements_per_region;
        let mapping = Mapping::new(len)?;
        let registration = self.registrar.register_memory(mapping.ptr.as_ptr(), len)?;
        let region = Arc::new(Region {
            registration,
            mapping,
            index: state.regions.len(),
        });

        info!(
            "Allocated region {}: {} elements of {} bytes, lkey=0x{:x}, rkey=0x{:x}",
            region.index,
            self.elements_per_region,
            self.element_size,
            region.registration.lkey(),
            region.registration.rkey()
        );

        for i in 0..self.elements_per_region {
            state.free.push_back(FreeSlot {
                region: Arc::clone(&region),
                offset: i * self.element_size,
            });
        }
        state.regions.push(region);
        state.free_regions -= 1;
        Ok(())
    }

    fn reclaim(&self, slot: FreeSlot, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            debug!("Dropping element released after pool teardown");
            return;
        }
        state.free.push_back(slot);
    }
}

/// Pool of fixed-size elements carved from registered regions
///
/// Cloning yields another handle to the same pool. Safe to share between
/// threads.
#[derive(Clone)]
pub struct MemoryPool {
    shared: Arc<PoolShared>,
}

impl MemoryPool {
    /// Create an empty pool; no memory is registered until first use
    pub fn new(
        registrar: Arc<dyn MemoryRegistrar>,
        element_size: usize,
        config: &PoolConfig,
    ) -> Result<Self> {
        config.validate()?;
        if element_size < 1 {
            return Err(NvmfError::invalid_argument("Zero element size"));
        }
        if element_size.checked_mul(config.elements_per_region).is_none() {
            return Err(NvmfError::invalid_argument(format!(
                "Region size overflow: {} x {}",
                element_size, config.elements_per_region
            )));
        }

        Ok(Self {
            shared: Arc::new(PoolShared {
                registrar,
                element_size,
                elements_per_region: config.elements_per_region,
                max_regions: config.regions,
                order: config.byte_order,
                state: Mutex::new(PoolState {
                    free: VecDeque::with_capacity(config.elements_per_region),
                    regions: Vec::with_capacity(config.regions),
                    free_regions: config.regions,
                    epoch: 0,
                }),
            }),
        })
    }

    /// Take a free element, registering one more region if none is left
    pub fn allocate(&self) -> Result<PoolElement> {
        let mut state = self.shared.state.lock();
        let slot = loop {
            if let Some(slot) = state.free.pop_front() {
                break slot;
            }
            self.shared.allocate_region(&mut state)?;
        };
        let epoch = state.epoch;
        drop(state);

        Ok(PoolElement {
            region: slot.region,
            offset: slot.offset,
            capacity: self.shared.element_size,
            position: 0,
            limit: self.shared.element_size,
            order: self.shared.order,
            valid: true,
            epoch,
            pool: Arc::clone(&self.shared),
        })
    }

    /// Release all regions, most recently allocated first, and reset the
    /// region budget so the pool can be used again
    pub fn teardown(&self) {
        let mut state = self.shared.state.lock();
        state.free.clear();
        let released = state.regions.len();
        while let Some(region) = state.regions.pop() {
            drop(region);
        }
        state.free_regions = self.shared.max_regions;
        state.epoch += 1;
        info!(
            "Pool of {}-byte elements torn down ({} regions released)",
            self.shared.element_size, released
        );
    }

    pub fn element_size(&self) -> usize {
        self.shared.element_size
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.shared.order
    }

    /// Number of regions currently registered
    pub fn allocated_regions(&self) -> usize {
        self.shared.state.lock().regions.len()
    }

    /// Number of elements ready to be handed out without a new region
    pub fn free_elements(&self) -> usize {
        self.shared.state.lock().free.len()
    }
}

/// Root element handed out by a [`MemoryPool`]
///
/// Owns its slice of the region exclusively until released. Dropping a
/// valid element releases it.
pub struct PoolElement {
    region: Arc<Region>,
    offset: usize,
    capacity: usize,
    position: usize,
    limit: usize,
    order: ByteOrder,
    valid: bool,
    epoch: u64,
    pool: Arc<PoolShared>,
}

impl PoolElement {
    /// Address of the first byte of the element
    pub fn address(&self) -> u64 {
        self.region.base() as u64 + self.offset as u64
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) -> Result<()> {
        if position > self.limit {
            return Err(NvmfError::invalid_argument(format!(
                "position {} beyond limit {}",
                position, self.limit
            )));
        }
        self.position = position;
        Ok(())
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) -> Result<()> {
        if limit > self.capacity {
            return Err(NvmfError::invalid_argument(format!(
                "limit {} beyond capacity {}",
                limit, self.capacity
            )));
        }
        self.limit = limit;
        self.position = self.position.min(limit);
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.capacity;
    }

    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    pub fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Borrowed view of `range`; carries the element's keys but cannot be
    /// released
    pub fn slice(&self, range: Range<usize>) -> Result<BufferSlice<'_>> {
        let bytes = self.bytes()?;
        check_range(&range, bytes.len())?;
        Ok(BufferSlice {
            bytes: &bytes[range.clone()],
            address: self.address() + range.start as u64,
            lkey: self.local_key(),
            rkey: self.remote_key(),
            order: self.order,
        })
    }

    /// Mutable borrowed view of `range`
    pub fn slice_mut(&mut self, range: Range<usize>) -> Result<BufferSliceMut<'_>> {
        let address = self.address() + range.start as u64;
        let (lkey, rkey, order) = (self.local_key(), self.remote_key(), self.order);
        let bytes = self.bytes_mut()?;
        check_range(&range, bytes.len())?;
        Ok(BufferSliceMut {
            bytes: &mut bytes[range],
            address,
            lkey,
            rkey,
            order,
        })
    }

    /// Return the element to its pool
    ///
    /// The pool requeues a fresh element over the same memory; this handle
    /// stays invalid for good.
    pub fn release(&mut self) -> Result<()> {
        if !self.valid {
            return Err(NvmfError::DoubleRelease);
        }
        self.valid = false;
        self.pool.reclaim(
            FreeSlot {
                region: Arc::clone(&self.region),
                offset: self.offset,
            },
            self.epoch,
        );
        Ok(())
    }
}

impl ByteAccess for PoolElement {
    fn bytes(&self) -> Result<&[u8]> {
        if !self.valid {
            return Err(NvmfError::ReleasedBuffer);
        }
        // Safety: offset..offset+capacity lies inside the region mapping,
        // which the Arc keeps alive, and no other element shares it.
        Ok(unsafe {
            std::slice::from_raw_parts(self.region.base().add(self.offset), self.capacity)
        })
    }

    fn order(&self) -> ByteOrder {
        self.order
    }
}

impl ByteAccessMut for PoolElement {
    fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        if !self.valid {
            return Err(NvmfError::ReleasedBuffer);
        }
        // Safety: see `bytes`; `&mut self` makes the access exclusive.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(self.region.base().add(self.offset), self.capacity)
        })
    }
}

impl KeyedBuffer for PoolElement {
    fn data_address(&self) -> u64 {
        self.address() + self.position as u64
    }

    fn data_length(&self) -> usize {
        self.remaining()
    }

    fn local_key(&self) -> u32 {
        self.region.registration.lkey()
    }

    fn remote_key(&self) -> u32 {
        self.region.registration.rkey()
    }
}

impl Drop for PoolElement {
    fn drop(&mut self) {
        if self.valid {
            let _ = self.release();
        }
    }
}

impl std::fmt::Debug for PoolElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolElement")
            .field("address", &format_args!("0x{:x}", self.address()))
            .field("capacity", &self.capacity)
            .field("position", &self.position)
            .field("limit", &self.limit)
            .field("order", &self.order)
            .field("valid", &self.valid)
            .finish()
    }
}

/// Read-only view into part of a pool element
#[derive(Debug)]
pub struct BufferSlice<'a> {
    bytes: &'a [u8],
    address: u64,
    lkey: u32,
    rkey: u32,
    order: ByteOrder,
}

impl BufferSlice<'_> {
    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl ByteAccess for BufferSlice<'_> {
    fn bytes(&self) -> Result<&[u8]> {
        Ok(self.bytes)
    }

    fn order(&self) -> ByteOrder {
        self.order
    }
}

impl KeyedBuffer for BufferSlice<'_> {
    fn data_address(&self) -> u64 {
        self.address
    }

    fn data_length(&self) -> usize {
        self.bytes.len()
    }

    fn local_key(&self) -> u32 {
        self.lkey
    }

    fn remote_key(&self) -> u32 {
        self.rkey
    }
}

/// Writable view into part of a pool element
#[derive(Debug)]
pub struct BufferSliceMut<'a> {
    bytes: &'a mut [u8],
    address: u64,
    lkey: u32,
    rkey: u32,
    order: ByteOrder,
}

impl BufferSliceMut<'_> {
    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl ByteAccess for BufferSliceMut<'_> {
    fn bytes(&self) -> Result<&[u8]> {
        Ok(self.bytes)
    }

    fn order(&self) -> ByteOrder {
        self.order
    }
}

impl ByteAccessMut for BufferSliceMut<'_> {
    fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        Ok(&mut *self.bytes)
    }
}

impl KeyedBuffer for BufferSliceMut<'_> {
    fn data_address(&self) -> u64 {
        self.address
    }

    fn data_length(&self) -> usize {
        self.bytes.len()
    }

    fn local_key(&self) -> u32 {
        self.lkey
    }

    fn remote_key(&self) -> u32 {
        self.rkey
    }
}

/// Caller-owned memory registered on its own, outside any pool
pub struct RegisteredBuffer {
    registration: Option<Box<dyn MemoryRegion>>,
    data: Vec<u8>,
    position: usize,
    limit: usize,
    order: ByteOrder,
}

impl RegisteredBuffer {
    /// Register `data`; the vector is never resized while registered
    pub fn register(registrar: &dyn MemoryRegistrar, mut data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(NvmfError::invalid_argument("Cannot register empty buffer"));
        }
        let registration = registrar.register_memory(data.as_mut_ptr(), data.len())?;
        let limit = data.len();
        Ok(Self {
            registration: Some(registration),
            data,
            position: 0,
            limit,
            order: ByteOrder::LittleEndian,
        })
    }

    pub fn address(&self) -> u64 {
        self.data.as_ptr() as u64
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Restrict the transferred window to `range`
    pub fn set_window(&mut self, range: Range<usize>) -> Result<()> {
        if range.start > range.end || range.end > self.data.len() {
            return Err(NvmfError::invalid_argument(format!(
                "window {:?} outside buffer of {} bytes",
                range,
                self.data.len()
            )));
        }
        self.position = range.start;
        self.limit = range.end;
        Ok(())
    }

    pub fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    pub fn is_valid(&self) -> bool {
        self.registration.is_some()
    }

    /// Deregister the memory
    pub fn release(&mut self) -> Result<()> {
        match self.registration.take() {
            Some(registration) => {
                debug!("Deregistering buffer at {:?}", registration.addr());
                Ok(())
            }
            None => Err(NvmfError::DoubleRelease),
        }
    }

    /// Deregister (if still registered) and hand the memory back
    pub fn into_inner(mut self) -> Vec<u8> {
        self.registration = None;
        std::mem::take(&mut self.data)
    }
}

impl ByteAccess for RegisteredBuffer {
    fn bytes(&self) -> Result<&[u8]> {
        if !self.is_valid() {
            return Err(NvmfError::ReleasedBuffer);
        }
        Ok(self.data.as_slice())
    }

    fn order(&self) -> ByteOrder {
        self.order
    }
}

impl ByteAccessMut for RegisteredBuffer {
    fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        if !self.is_valid() {
            return Err(NvmfError::ReleasedBuffer);
        }
        Ok(self.data.as_mut_slice())
    }
}

impl KeyedBuffer for RegisteredBuffer {
    fn data_address(&self) -> u64 {
        self.address() + self.position as u64
    }

    fn data_length(&self) -> usize {
        self.limit - self.position
    }

    fn local_key(&self) -> u32 {
        self.registration.as_ref().map_or(0, |r| r.lkey())
    }

    fn remote_key(&self) -> u32 {
        self.registration.as_ref().map_or(0, |r| r.rkey())
    }
}

/// One pool per (protection domain, element size), created on first use
pub struct PoolRegistry {
    config: PoolConfig,
    pools: RwLock<HashMap<(u64, usize), MemoryPool>>,
}

impl PoolRegistry {
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            pools: RwLock::new(HashMap::new()),
        })
    }

    pub fn get_pool(
        &self,
        registrar: &Arc<dyn MemoryRegistrar>,
        element_size: usize,
    ) -> Result<MemoryPool> {
        let key = (registrar.domain_id(), element_size);
        if let Some(pool) = self.pools.read().get(&key) {
            return Ok(pool.clone());
        }

        let mut pools = self.pools.write();
        if let Some(pool) = pools.get(&key) {
            return Ok(pool.clone());
        }
        debug!(
            "Creating pool for domain {} with {}-byte elements",
            key.0, element_size
        );
        let pool = MemoryPool::new(Arc::clone(registrar), element_size, &self.config)?;
        pools.insert(key, pool.clone());
        Ok(pool)
    }

    /// Tear down every pool
    pub fn teardown(&self) {
        for pool in self.pools.read().values() {
            pool.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackRegistrar;
    use std::collections::HashSet;

    fn registrar() -> Arc<dyn MemoryRegistrar> {
        Arc::new(LoopbackRegistrar::new())
    }

    fn pool(element_size: usize, elements_per_region: usize, regions: usize) -> MemoryPool {
        let config = PoolConfig {
            elements_per_region,
            regions,
            byte_order: ByteOrder::LittleEndian,
        };
        MemoryPool::new(registrar(), element_size, &config).unwrap()
    }

    #[test]
    fn test_argument_check() {
        let config = PoolConfig::default();
        assert!(MemoryPool::new(registrar(), 0, &config).is_err());

        for (per_region, regions) in [(0, 1), (1, 0)] {
            let config = PoolConfig {
                elements_per_region: per_region,
                regions,
                ..PoolConfig::default()
            };
            assert!(matches!(
                MemoryPool::new(registrar(), 512, &config),
                Err(NvmfError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_lazy_region_allocation() {
        let pool = pool(64, 4, 2);
        assert_eq!(pool.allocated_regions(), 0);

        let _a = pool.allocate().unwrap();
        assert_eq!(pool.allocated_regions(), 1);
        assert_eq!(pool.free_elements(), 3);
    }

    #[test]
    fn test_element() {
        let pool = pool(512, 1, 1);
        let element = pool.allocate().unwrap();
        assert_eq!(element.capacity(), 512);
        assert_eq!(element.remaining(), 512);
        assert_eq!(element.position(), 0);
        assert!(element.is_valid());
        assert_ne!(element.remote_key(), 0);
        assert!(matches!(
            pool.allocate(),
            Err(NvmfError::OutOfMemory { regions: 1 })
        ));
    }

    #[test]
    fn test_exhaust_release_reallocate() {
        let pool = pool(512, 2, 1);
        let mut a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a.address(), b.address());
        assert!(matches!(pool.allocate(), Err(NvmfError::OutOfMemory { .. })));

        let address = a.address();
        a.release().unwrap();
        let c = pool.allocate().unwrap();
        assert_eq!(c.address(), address);
        assert!(c.is_valid());
    }

    #[test]
    fn test_elements_never_overlap() {
        let pool = pool(96, 8, 3);
        let elements: Vec<_> = (0..24).map(|_| pool.allocate().unwrap()).collect();

        let mut ranges: Vec<(u64, u64)> = elements
            .iter()
            .map(|e| (e.address(), e.address() + e.capacity() as u64))
            .collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlap: {:?}", pair);
        }

        let keys: HashSet<u32> = elements.iter().map(|e| e.remote_key()).collect();
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn test_double_release() {
        let pool = pool(128, 2, 1);
        let mut element = pool.allocate().unwrap();
        element.release().unwrap();
        assert!(!element.is_valid());
        assert!(matches!(element.release(), Err(NvmfError::DoubleRelease)));
        assert!(matches!(element.get_u8(0), Err(NvmfError::ReleasedBuffer)));
        // released exactly once
        assert_eq!(pool.free_elements(), 2);
    }

    #[test]
    fn test_drop_returns_element() {
        let pool = pool(128, 1, 1);
        {
            let _element = pool.allocate().unwrap();
            assert_eq!(pool.free_elements(), 0);
        }
        assert_eq!(pool.free_elements(), 1);
        assert!(pool.allocate().is_ok());
    }

    #[test]
    fn test_released_element_gets_pool_byte_order() {
        let pool = pool(16, 1, 1);
        let mut element = pool.allocate().unwrap();
        element.set_order(ByteOrder::BigEndian);
        element.put_u16(0, 0x1234).unwrap();
        assert_eq!(element.get_u8(0).unwrap(), 0x12);
        element.set_position(4).unwrap();
        element.release().unwrap();

        let element = pool.allocate().unwrap();
        assert_eq!(element.order(), ByteOrder::LittleEndian);
        assert_eq!(element.position(), 0);
        assert_eq!(element.limit(), 16);
        assert_eq!(element.get_u16(0).unwrap(), 0x3412);
    }

    #[test]
    fn test_accessor_widths() {
        let pool = pool(16, 1, 1);
        let mut element = pool.allocate().unwrap();
        element.put_u64(0, 0x0102_0304_0506_0708).unwrap();
        element.put_u32(8, 0xa0b0_c0d0).unwrap();
        element.put_u16(12, 0xbeef).unwrap();
        assert_eq!(element.get_u64(0).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(element.get_u32(8).unwrap(), 0xa0b0_c0d0);
        assert_eq!(element.get_u16(12).unwrap(), 0xbeef);
        assert_eq!(element.get_u16(0).unwrap(), 0x0708);

        element.set_order(ByteOrder::BigEndian);
        assert_eq!(element.get_u32(8).unwrap(), 0xd0c0_b0a0);
        element.put_u32(8, 0xa0b0_c0d0).unwrap();
        assert_eq!(element.get_u8(8).unwrap(), 0xa0);
        assert_eq!(element.get_u32(8).unwrap(), 0xa0b0_c0d0);
        element.release().unwrap();
    }

    #[test]
    fn test_accessor_bounds() {
        let pool = pool(8, 1, 1);
        let mut element = pool.allocate().unwrap();
        element.put_u64(0, u64::MAX).unwrap();
        assert!(matches!(
            element.put_u32(6, 1),
            Err(NvmfError::OutOfBounds {
                index: 6,
                len: 4,
                capacity: 8
            })
        ));
        assert!(element.get_u8(8).is_err());
        assert!(element.get_u16(usize::MAX).is_err());
    }

    #[test]
    fn test_position_limit_flip() {
        let pool = pool(32, 1, 1);
        let mut element = pool.allocate().unwrap();
        element.set_position(10).unwrap();
        assert_eq!(element.remaining(), 22);
        assert_eq!(element.data_address(), element.address() + 10);

        element.flip();
        assert_eq!(element.limit(), 10);
        assert_eq!(element.position(), 0);
        assert!(element.set_position(11).is_err());
        assert!(element.set_limit(33).is_err());

        element.clear();
        assert_eq!(element.remaining(), 32);
    }

    #[test]
    fn test_slice_shares_keys_and_memory() {
        let pool = pool(64, 1, 1);
        let mut element = pool.allocate().unwrap();
        {
            let mut slice = element.slice_mut(16..32).unwrap();
            assert_eq!(slice.len(), 16);
            slice.put_u32(0, 0xdead_beef).unwrap();
        }
        assert_eq!(element.get_u32(16).unwrap(), 0xdead_beef);

        let slice = element.slice(16..32).unwrap();
        assert_eq!(slice.address(), element.address() + 16);
        assert_eq!(slice.remote_key(), element.remote_key());
        assert_eq!(slice.local_key(), element.local_key());
        assert!(element.slice(60..70).is_err());
    }

    #[test]
    fn test_teardown_and_reuse() {
        let pool = pool(64, 2, 1);
        let mut outstanding = pool.allocate().unwrap();
        let _second = pool.allocate().unwrap();
        assert!(pool.allocate().is_err());

        pool.teardown();
        assert_eq!(pool.allocated_regions(), 0);

        // stale elements still point at live memory but are not requeued
        outstanding.put_u8(0, 7).unwrap();
        outstanding.release().unwrap();
        assert_eq!(pool.free_elements(), 0);

        let fresh = pool.allocate().unwrap();
        assert!(fresh.is_valid());
        assert_eq!(pool.allocated_regions(), 1);
    }

    #[test]
    fn test_concurrent_allocation() {
        let pool = pool(32, 16, 4);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    (0..16)
                        .map(|_| pool.allocate().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let elements: Vec<PoolElement> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let addresses: HashSet<u64> = elements.iter().map(|e| e.address()).collect();
        assert_eq!(addresses.len(), 64);
        assert_eq!(pool.allocated_regions(), 4);

        drop(elements);
        assert_eq!(pool.free_elements(), 64);
    }

    #[test]
    fn test_registered_buffer() {
        let registrar = LoopbackRegistrar::new();
        let mut buffer = RegisteredBuffer::register(&registrar, vec![0u8; 4096]).unwrap();
        buffer.set_window(5..678).unwrap();
        assert_eq!(buffer.position(), 5);
        assert_eq!(buffer.limit(), 678);
        assert_eq!(buffer.data_length(), 673);
        assert_eq!(buffer.data_address(), buffer.address() + 5);
        assert_ne!(buffer.remote_key(), 0);

        buffer.release().unwrap();
        assert!(!buffer.is_valid());
        assert!(matches!(buffer.release(), Err(NvmfError::DoubleRelease)));
        assert_eq!(buffer.into_inner().len(), 4096);

        assert!(RegisteredBuffer::register(&registrar, Vec::new()).is_err());
    }

    #[test]
    fn test_registry_shares_pools() {
        let registry = PoolRegistry::new(PoolConfig::default()).unwrap();
        let registrar = registrar();
        let a = registry.get_pool(&registrar, 16).unwrap();
        let b = registry.get_pool(&registrar, 16).unwrap();
        let c = registry.get_pool(&registrar, 64).unwrap();

        let _element = a.allocate().unwrap();
        assert_eq!(b.allocated_regions(), 1);
        assert_eq!(c.allocated_regions(), 0);

        let other: Arc<dyn MemoryRegistrar> = Arc::new(LoopbackRegistrar::new());
        let d = registry.get_pool(&other, 16).unwrap();
        assert_eq!(d.allocated_regions(), 0);
    }
}
