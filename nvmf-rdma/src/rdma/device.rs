//! RDMA device management
//!
//! Opens one of the devices RDMA-CM already knows about and allocates the
//! protection domain every queue pair and memory region on it shares.

use super::ffi::*;
use crate::error::NvmfError;
use crate::transport::{MemoryRegion, MemoryRegistrar};
use anyhow::{anyhow, Result};
use log::{debug, info};
use std::ffi::CStr;
use std::sync::Arc;

/// Protection domain plus the device list its context came from
///
/// Shared with every memory region so deregistration always happens
/// before the domain is deallocated.
struct ProtectionDomain {
    devices: *mut *mut ibv_context,
    pd: *mut ibv_pd,
}

unsafe impl Send for ProtectionDomain {}
unsafe impl Sync for ProtectionDomain {}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        unsafe {
            if !self.pd.is_null() {
                ibv_dealloc_pd(self.pd);
            }
            // contexts are owned by RDMA-CM
            rdma_free_devices(self.devices);
        }
    }
}

/// RDMA device handle with protection domain
///
/// The verbs context comes from `rdma_get_devices` so that connection
/// identifiers resolved through RDMA-CM land on the same context and the
/// protection domain can be used for their queue pairs.
pub struct RdmaDevice {
    domain: Arc<ProtectionDomain>,
    context: *mut ibv_context,
    device_name: String,
}

unsafe impl Send for RdmaDevice {}
unsafe impl Sync for RdmaDevice {}

impl RdmaDevice {
    /// Open RDMA device by name
    ///
    /// # Arguments
    /// * `device_name` - Name of RDMA device (e.g., "mlx5_0", "rxe0")
    pub fn open(device_name: &str) -> Result<Arc<Self>> {
        info!("Opening RDMA device: {}", device_name);

        let mut num_devices = 0i32;
        let devices = unsafe { rdma_get_devices(&mut num_devices) };
        if devices.is_null() || num_devices == 0 {
            if !devices.is_null() {
                unsafe { rdma_free_devices(devices) };
            }
            return Err(anyhow!("No RDMA devices found"));
        }

        let mut context: *mut ibv_context = std::ptr::null_mut();
        for i in 0..num_devices as usize {
            let candidate = unsafe { *devices.add(i) };
            let name = unsafe {
                CStr::from_ptr(ibv_get_device_name((*candidate).device))
                    .to_string_lossy()
                    .into_owned()
            };
            debug!("Found RDMA device: {}", name);
            if name == device_name {
                context = candidate;
                break;
            }
        }

        if context.is_null() {
            unsafe { rdma_free_devices(devices) };
            return Err(anyhow!("Device {} not found", device_name));
        }

        let pd = unsafe { ibv_alloc_pd(context) };
        if pd.is_null() {
            unsafe { rdma_free_devices(devices) };
            return Err(anyhow!(
                "Failed to allocate protection domain on {}: {}",
                device_name,
                std::io::Error::last_os_error()
            ));
        }

        info!("Allocated protection domain on {}", device_name);

        Ok(Arc::new(Self {
            domain: Arc::new(ProtectionDomain { devices, pd }),
            context,
            device_name: device_name.to_string(),
        }))
    }

    /// Query device attributes
    pub fn query_attributes(&self) -> Result<DeviceAttributes> {
        let mut attr: ibv_device_attr = unsafe { std::mem::zeroed() };
        let ret = unsafe { ibv_query_device(self.context, &mut attr) };
        super::check_ret(ret)
            .map_err(|e| anyhow!("Failed to query {} attributes: {}", self.device_name, e))?;

        Ok(DeviceAttributes {
            max_qp: attr.max_qp,
            max_qp_wr: attr.max_qp_wr,
            max_cqe: attr.max_cqe,
            max_qp_rd_atom: attr.max_qp_rd_atom,
            max_mr_size: attr.max_mr_size,
        })
    }

    pub(crate) fn context(&self) -> *mut ibv_context {
        self.context
    }

    pub(crate) fn pd(&self) -> *mut ibv_pd {
        self.domain.pd
    }

    pub fn name(&self) -> &str {
        &self.device_name
    }
}

impl MemoryRegistrar for RdmaDevice {
    fn register_memory(
        &self,
        addr: *mut u8,
        length: usize,
    ) -> crate::Result<Box<dyn MemoryRegion>> {
        debug!("Registering memory: addr={:?}, len={}", addr, length);

        let access_flags =
            IBV_ACCESS_LOCAL_WRITE | IBV_ACCESS_REMOTE_READ | IBV_ACCESS_REMOTE_WRITE;
        let mr = unsafe {
            ibv_reg_mr(
                self.domain.pd,
                addr as *mut std::os::raw::c_void,
                length,
                access_flags as i32,
            )
        };
        if mr.is_null() {
            return Err(NvmfError::Io(std::io::Error::last_os_error()));
        }

        let lkey = unsafe { (*mr).lkey };
        let rkey = unsafe { (*mr).rkey };
        debug!("Registered MR: lkey=0x{:x}, rkey=0x{:x}", lkey, rkey);

        Ok(Box::new(RdmaMemoryRegion {
            mr,
            _domain: Arc::clone(&self.domain),
            addr,
            length,
            lkey,
            rkey,
        }))
    }

    fn domain_id(&self) -> u64 {
        self.domain.pd as u64
    }
}

impl Drop for RdmaDevice {
    fn drop(&mut self) {
        debug!(
            "Closing RDMA device: {} ({} regions still registered)",
            self.device_name,
            Arc::strong_count(&self.domain) - 1
        );
    }
}

/// RDMA memory region, deregistered on drop
pub struct RdmaMemoryRegion {
    mr: *mut ibv_mr,
    _domain: Arc<ProtectionDomain>,
    addr: *mut u8,
    length: usize,
    lkey: u32,
    rkey: u32,
}

unsafe impl Send for RdmaMemoryRegion {}
unsafe impl Sync for RdmaMemoryRegion {}

impl MemoryRegion for RdmaMemoryRegion {
    fn lkey(&self) -> u32 {
        self.lkey
    }

    fn rkey(&self) -> u32 {
        self.rkey
    }

    fn addr(&self) -> *mut u8 {
        self.addr
    }

    fn length(&self) -> usize {
        self.length
    }
}

impl Drop for RdmaMemoryRegion {
    fn drop(&mut self) {
        if !self.mr.is_null() {
            unsafe { ibv_dereg_mr(self.mr) };
        }
    }
}

/// Device attributes
#[derive(Debug, Clone)]
pub struct DeviceAttributes {
    pub max_qp: i32,
    pub max_qp_wr: i32,
    pub max_cqe: i32,
    pub max_qp_rd_atom: i32,
    pub max_mr_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Requires RDMA hardware
    fn test_device_open() {
        if let Ok(dev) = RdmaDevice::open("mlx5_0") {
            assert_eq!(dev.name(), "mlx5_0");
            assert_ne!(dev.domain_id(), 0);
        }
    }

    #[test]
    #[ignore] // Requires RDMA hardware
    fn test_query_attributes() {
        if let Ok(device) = RdmaDevice::open("mlx5_0") {
            let attr = device.query_attributes().unwrap();
            assert!(attr.max_qp > 0);
            assert!(attr.max_qp_wr > 0);
        }
    }

    #[test]
    #[ignore] // Requires RDMA hardware
    fn test_memory_registration() {
        if let Ok(device) = RdmaDevice::open("mlx5_0") {
            let mut buffer = vec![0u8; 4096];
            let mr = device
                .register_memory(buffer.as_mut_ptr(), buffer.len())
                .unwrap();
            assert_eq!(mr.length(), 4096);
            assert_ne!(mr.lkey(), 0);
            assert_ne!(mr.rkey(), 0);
        }
    }
}
