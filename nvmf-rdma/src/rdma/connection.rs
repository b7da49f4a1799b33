//! RDMA-CM connection backing one queue pair
//!
//! Lifecycle:
//! - `resolve`: address and route resolution, one CQ of depth 2N shared by
//!   sends and receives, an RC QP with N send and N receive slots
//! - `establish`: `rdma_connect` with the NVMe-oF private data, then wait
//!   for `ESTABLISHED` within the connect timeout
//! - `disconnect` / drop: `rdma_disconnect`, then tear everything down

use super::check_ret;
use super::device::RdmaDevice;
use super::ffi::*;
use crate::config::QueuePairConfig;
use crate::error::NvmfError;
use crate::transport::{
    MemoryRegistrar, QueueTransport, ReceiveRequest, SendRequest, WcOpcode, WcStatus,
    WorkCompletion,
};
use crate::wire::private_data::{ConnectAccept, PRIVATE_DATA_SIZE};
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{SockaddrLike, SockaddrStorage};
use std::ffi::CStr;
use std::net::SocketAddr;
use std::os::fd::BorrowedFd;
use std::ptr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Responder resources requested from the controller, capped by the device
const MAX_RD_ATOMIC: i32 = 16;
const RETRY_COUNT: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Resolved,
    Established,
    Disconnected,
}

/// RDMA connection with RC queue pair
pub struct RdmaConnection {
    device: Arc<RdmaDevice>,
    channel: *mut rdma_event_channel,
    id: *mut rdma_cm_id,
    cq: *mut ibv_cq,
    /// Owned by `id`, destroyed with `rdma_destroy_qp`
    qp: *mut ibv_qp,
    peer: SocketAddr,
    max_inline: usize,
    responder_resources: u8,
    connect_timeout: Duration,
    state: ConnectionState,
    wcs: Vec<ibv_wc>,
}

unsafe impl Send for RdmaConnection {}

impl RdmaConnection {
    /// Resolve `peer` and create the completion queue and queue pair
    ///
    /// The connection is not established yet; the queue pair engine posts
    /// its receives first and then calls `establish`.
    pub fn resolve(
        device: Arc<RdmaDevice>,
        peer: SocketAddr,
        config: &QueuePairConfig,
    ) -> Result<Self> {
        config.validate()?;
        let depth = config.submission_queue_size as u32;
        let attributes = device.query_attributes()?;
        if depth as i32 > attributes.max_qp_wr || 2 * depth as i32 > attributes.max_cqe {
            return Err(anyhow!(
                "Queue depth {} exceeds {} limits (max_qp_wr={}, max_cqe={})",
                depth,
                device.name(),
                attributes.max_qp_wr,
                attributes.max_cqe
            ));
        }

        info!("Resolving {} on {}, depth={}", peer, device.name(), depth);

        let channel = unsafe { rdma_create_event_channel() };
        if channel.is_null() {
            return Err(std::io::Error::last_os_error()).context("rdma_create_event_channel");
        }

        // From here on Drop cleans up whatever has been created
        let mut conn = Self {
            device,
            channel,
            id: ptr::null_mut(),
            cq: ptr::null_mut(),
            qp: ptr::null_mut(),
            peer,
            max_inline: 0,
            responder_resources: attributes.max_qp_rd_atom.clamp(0, MAX_RD_ATOMIC) as u8,
            connect_timeout: config.connect_timeout,
            state: ConnectionState::Resolved,
            wcs: Vec::with_capacity(crate::poller::POLL_BATCH_SIZE),
        };

        check_ret(unsafe {
            rdma_create_id(conn.channel, &mut conn.id, ptr::null_mut(), RDMA_PS_TCP)
        })
        .context("rdma_create_id")?;

        let deadline = Instant::now() + conn.connect_timeout;
        let timeout_ms = conn.connect_timeout.as_millis().min(i32::MAX as u128) as i32;

        let address = SockaddrStorage::from(peer);
        check_ret(unsafe {
            rdma_resolve_addr(
                conn.id,
                ptr::null_mut(),
                address.as_ptr() as *mut sockaddr,
                timeout_ms,
            )
        })
        .context("rdma_resolve_addr")?;
        conn.wait_event(RDMA_CM_EVENT_ADDR_RESOLVED, deadline)
            .context("address resolution")?;

        let verbs = unsafe { (*conn.id).verbs };
        if verbs != conn.device.context() {
            return Err(anyhow!(
                "{} is not reachable through {}",
                peer,
                conn.device.name()
            ));
        }

        check_ret(unsafe { rdma_resolve_route(conn.id, timeout_ms) })
            .context("rdma_resolve_route")?;
        conn.wait_event(RDMA_CM_EVENT_ROUTE_RESOLVED, deadline)
            .context("route resolution")?;

        conn.cq = unsafe {
            ibv_create_cq(
                conn.device.context(),
                2 * depth as i32,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        };
        if conn.cq.is_null() {
            return Err(std::io::Error::last_os_error()).context("ibv_create_cq");
        }

        let mut qp_init_attr: ibv_qp_init_attr = unsafe { std::mem::zeroed() };
        qp_init_attr.send_cq = conn.cq;
        qp_init_attr.recv_cq = conn.cq;
        qp_init_attr.qp_type = IBV_QPT_RC;
        qp_init_attr.cap.max_send_wr = depth;
        qp_init_attr.cap.max_recv_wr = depth;
        qp_init_attr.cap.max_send_sge = 1;
        qp_init_attr.cap.max_recv_sge = 1;
        qp_init_attr.cap.max_inline_data = config.max_inline_size;

        check_ret(unsafe { rdma_create_qp(conn.id, conn.device.pd(), &mut qp_init_attr) })
            .context("rdma_create_qp")?;
        conn.qp = unsafe { (*conn.id).qp };
        conn.max_inline = qp_init_attr.cap.max_inline_data as usize;

        debug!(
            "Created QP: qpn={}, cq depth={}, max inline={}",
            unsafe { (*conn.qp).qp_num },
            2 * depth,
            conn.max_inline
        );
        Ok(conn)
    }

    /// Wait for the next CM event and check it is `expected`
    ///
    /// Returns the private data carried by the event, if any.
    fn wait_event(&self, expected: rdma_cm_event_type, deadline: Instant) -> crate::Result<Vec<u8>> {
        let fd = unsafe { BorrowedFd::borrow_raw((*self.channel).fd) };
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(NvmfError::Timeout(self.connect_timeout));
            }
            let timeout = PollTimeout::from(remaining.as_millis().min(u16::MAX as u128) as u16);
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            match nix::poll::poll(&mut fds, timeout) {
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) => break,
                Err(e) => return Err(std::io::Error::from(e).into()),
            }
        }

        let mut event: *mut rdma_cm_event = ptr::null_mut();
        check_ret(unsafe { rdma_get_cm_event(self.channel, &mut event) })?;
        let (kind, status, private_data) = unsafe {
            let conn = (*event).param.conn;
            let private_data = if conn.private_data.is_null() {
                Vec::new()
            } else {
                std::slice::from_raw_parts(
                    conn.private_data as *const u8,
                    conn.private_data_len as usize,
                )
                .to_vec()
            };
            ((*event).event, (*event).status, private_data)
        };
        unsafe { rdma_ack_cm_event(event) };

        if kind != expected {
            let name = unsafe { CStr::from_ptr(rdma_event_str(kind)) }.to_string_lossy();
            warn!(
                "Unexpected CM event from {}: {} (status {})",
                self.peer, name, status
            );
            let kind = if kind == RDMA_CM_EVENT_REJECTED {
                std::io::ErrorKind::ConnectionRefused
            } else {
                std::io::ErrorKind::Other
            };
            return Err(std::io::Error::new(
                kind,
                format!("{} (status {})", name, status),
            )
            .into());
        }
        Ok(private_data)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn ops(&self) -> crate::Result<&ibv_context_ops> {
        if self.state != ConnectionState::Established {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("connection to {} not established", self.peer),
            )
            .into());
        }
        Ok(unsafe { &(*(*self.qp).context).ops })
    }
}

fn missing_op(name: &str) -> NvmfError {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("verbs provider has no {}", name),
    )
    .into()
}

impl QueueTransport for RdmaConnection {
    fn post_send(&mut self, request: SendRequest) -> crate::Result<()> {
        let post = self.ops()?.post_send.ok_or_else(|| missing_op("post_send"))?;

        let mut sge = ibv_sge {
            addr: request.sge.addr,
            length: request.sge.length,
            lkey: request.sge.lkey,
        };
        let mut wr: ibv_send_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = request.wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = IBV_WR_SEND;
        wr.send_flags = IBV_SEND_SIGNALED;
        if request.inline {
            wr.send_flags |= IBV_SEND_INLINE;
        }

        let mut bad_wr: *mut ibv_send_wr = ptr::null_mut();
        check_ret(unsafe { post(self.qp, &mut wr, &mut bad_wr) })?;
        Ok(())
    }

    fn post_receive(&mut self, request: ReceiveRequest) -> crate::Result<()> {
        // receives are posted before the connection is established
        let post = unsafe { (*(*self.qp).context).ops.post_recv }
            .ok_or_else(|| missing_op("post_recv"))?;
        if self.state == ConnectionState::Disconnected {
            return Err(std::io::Error::from(std::io::ErrorKind::NotConnected).into());
        }

        let mut sge = ibv_sge {
            addr: request.sge.addr,
            length: request.sge.length,
            lkey: request.sge.lkey,
        };
        let mut wr: ibv_recv_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = request.wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;

        let mut bad_wr: *mut ibv_recv_wr = ptr::null_mut();
        check_ret(unsafe { post(self.qp, &mut wr, &mut bad_wr) })?;
        Ok(())
    }

    fn poll_completions(
        &mut self,
        out: &mut Vec<WorkCompletion>,
        batch: usize,
    ) -> crate::Result<usize> {
        let poll = self.ops()?.poll_cq.ok_or_else(|| missing_op("poll_cq"))?;

        self.wcs.clear();
        self.wcs.resize_with(batch, || unsafe { std::mem::zeroed() });
        let n = unsafe { poll(self.cq, batch as i32, self.wcs.as_mut_ptr()) };
        if n < 0 {
            return Err(std::io::Error::from_raw_os_error(-n).into());
        }

        for wc in &self.wcs[..n as usize] {
            let status = WcStatus::try_from(wc.status).unwrap_or_else(|e| {
                warn!("{}; treating as general error", e);
                WcStatus::GeneralErr
            });
            let opcode = if status == WcStatus::Success {
                WcOpcode::try_from(wc.opcode).ok()
            } else {
                None
            };
            out.push(WorkCompletion {
                wr_id: wc.wr_id,
                status,
                opcode,
                byte_len: wc.byte_len,
            });
        }
        Ok(n as usize)
    }

    fn establish(&mut self, private_data: &[u8]) -> crate::Result<()> {
        if self.state != ConnectionState::Resolved {
            return Err(NvmfError::invalid_argument(format!(
                "connection to {} already used",
                self.peer
            )));
        }
        let private_data_len = u8::try_from(private_data.len()).map_err(|_| {
            NvmfError::invalid_argument(format!(
                "private data of {} bytes too long",
                private_data.len()
            ))
        })?;

        let mut param: rdma_conn_param = unsafe { std::mem::zeroed() };
        param.private_data = private_data.as_ptr() as *const std::os::raw::c_void;
        param.private_data_len = private_data_len;
        param.responder_resources = self.responder_resources;
        param.initiator_depth = self.responder_resources;
        param.retry_count = RETRY_COUNT;
        param.rnr_retry_count = RETRY_COUNT;

        check_ret(unsafe { rdma_connect(self.id, &mut param) })?;
        let deadline = Instant::now() + self.connect_timeout;
        let accept = self.wait_event(RDMA_CM_EVENT_ESTABLISHED, deadline)?;
        self.state = ConnectionState::Established;

        if accept.len() >= PRIVATE_DATA_SIZE {
            let accept = ConnectAccept::decode(&accept)?;
            info!(
                "Connected to {}: controller receive queue size {}",
                self.peer, accept.receive_queue_size
            );
        } else {
            info!("Connected to {}", self.peer);
        }
        Ok(())
    }

    fn disconnect(&mut self) -> crate::Result<()> {
        if self.state != ConnectionState::Established {
            self.state = ConnectionState::Disconnected;
            return Ok(());
        }
        self.state = ConnectionState::Disconnected;
        check_ret(unsafe { rdma_disconnect(self.id) })?;
        info!("Disconnected from {}", self.peer);
        Ok(())
    }

    fn max_inline_data(&self) -> usize {
        self.max_inline
    }

    fn registrar(&self) -> Arc<dyn MemoryRegistrar> {
        Arc::clone(&self.device) as Arc<dyn MemoryRegistrar>
    }
}

impl Drop for RdmaConnection {
    fn drop(&mut self) {
        if self.state == ConnectionState::Established {
            if let Err(e) = self.disconnect() {
                warn!("Disconnect from {} failed: {}", self.peer, e);
            }
        }
        unsafe {
            if !self.qp.is_null() {
                rdma_destroy_qp(self.id);
            }
            if !self.cq.is_null() {
                ibv_destroy_cq(self.cq);
            }
            if !self.id.is_null() {
                rdma_destroy_id(self.id);
            }
            if !self.channel.is_null() {
                rdma_destroy_event_channel(self.channel);
            }
        }
    }
}
