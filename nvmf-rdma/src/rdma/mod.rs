//! RDMA subsystem
//!
//! ibverbs + RDMA-CM backend for the queue transport

pub mod connection;
pub mod device;

pub use connection::RdmaConnection;
pub use device::{DeviceAttributes, RdmaDevice, RdmaMemoryRegion};

pub(crate) mod ffi {
    #![allow(non_upper_case_globals)]
    #![allow(non_camel_case_types)]
    #![allow(non_snake_case)]
    #![allow(dead_code)]
    #![allow(clippy::all)]
    include!(concat!(env!("OUT_DIR"), "/rdma_bindings.rs"));
}

/// Map a verbs return code (0 or errno, sometimes -1 with errno set)
pub(crate) fn check_ret(ret: i32) -> std::io::Result<()> {
    match ret {
        0 => Ok(()),
        r if r > 0 => Err(std::io::Error::from_raw_os_error(r)),
        _ => Err(std::io::Error::last_os_error()),
    }
}
