use crate::completion_queue::CompletionQueue;
use crate::error::{last_provider_error, Result, RpmaError};
use crate::event_channel::CmEventChannel;
use crate::protection_domain::ProtectionDomain;
use rdma_sys::{
    ibv_qp, ibv_qp_cap, ibv_qp_init_attr, ibv_qp_type, ibv_srq, rdma_accept, rdma_bind_addr,
    rdma_cm_id, rdma_conn_param, rdma_connect, rdma_create_id, rdma_create_qp, rdma_destroy_id,
    rdma_destroy_qp, rdma_disconnect, rdma_listen, rdma_migrate_id, rdma_port_space, rdma_reject,
    rdma_resolve_addr, rdma_resolve_route,
};
use std::ptr::NonNull;
use tracing::error;

/// Maximum number of outstanding work requests on the send queue
const MAX_SEND_WR: u32 = 10;
/// Maximum number of outstanding work requests on the receive queue
const MAX_RECV_WR: u32 = 10;
/// Maximum number of scatter/gather elements per send work request
const MAX_SEND_SGE: u32 = 1;
/// Maximum number of scatter/gather elements per receive work request
const MAX_RECV_SGE: u32 = 1;

/// Communication identifier wrapper for `rdma_cm_id`.
///
/// Owns the queue pair once one has been created on it; the queue pair is
/// destroyed ahead of the identifier in both the explicit and the drop
/// teardown path.
#[derive(Debug)]
pub(crate) struct CmId {
    /// The inner `rdma_cm_id` pointer
    inner_id: NonNull<rdma_cm_id>,
    /// Whether a queue pair has been created on this identifier
    has_qp: bool,
}

impl CmId {
    /// Get the inner `rdma_cm_id` pointer
    pub(crate) fn as_ptr(&self) -> *mut rdma_cm_id {
        self.inner_id.as_ptr()
    }

    /// Create a new identifier in the TCP RDMA port space, reporting its
    /// events to `channel`
    pub(crate) fn create(channel: &CmEventChannel) -> Result<Self> {
        let mut id = std::ptr::null_mut::<rdma_cm_id>();
        // SAFETY: ffi
        let ret = unsafe {
            rdma_create_id(
                channel.as_ptr(),
                &mut id,
                std::ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            )
        };
        if ret != 0_i32 {
            return Err(last_provider_error("rdma_create_id"));
        }
        NonNull::new(id)
            .map(|inner_id| Self {
                inner_id,
                has_qp: false,
            })
            .ok_or(RpmaError::Unknown)
    }

    /// Take ownership of an identifier delivered by a listener's
    /// `CONNECT_REQUEST` event
    pub(crate) fn from_raw(inner_id: NonNull<rdma_cm_id>) -> Self {
        Self {
            inner_id,
            has_qp: false,
        }
    }

    /// The verbs context of the device this identifier is bound to
    pub(crate) fn verbs(&self) -> *mut rdma_sys::ibv_context {
        // SAFETY: guaranteed valid by construction
        unsafe { self.inner_id.as_ref() }.verbs
    }

    /// The queue pair created on this identifier, NULL before
    /// [`CmId::create_qp`]
    pub(crate) fn qp(&self) -> *mut ibv_qp {
        // SAFETY: guaranteed valid by construction
        unsafe { self.inner_id.as_ref() }.qp
    }

    /// Resolve the destination address, answered by an `ADDR_RESOLVED` or
    /// `ADDR_ERROR` event on the identifier's channel
    pub(crate) fn resolve_addr(
        &self,
        dst_addr: *mut libc::sockaddr,
        timeout_ms: libc::c_int,
    ) -> Result<()> {
        // SAFETY: ffi
        if unsafe {
            rdma_resolve_addr(self.as_ptr(), std::ptr::null_mut(), dst_addr, timeout_ms)
        } != 0_i32
        {
            return Err(last_provider_error("rdma_resolve_addr"));
        }
        Ok(())
    }

    /// Resolve the route to the resolved address, answered by a
    /// `ROUTE_RESOLVED` or `ROUTE_ERROR` event
    pub(crate) fn resolve_route(&self, timeout_ms: libc::c_int) -> Result<()> {
        // SAFETY: ffi
        if unsafe { rdma_resolve_route(self.as_ptr(), timeout_ms) } != 0_i32 {
            return Err(last_provider_error("rdma_resolve_route"));
        }
        Ok(())
    }

    /// Bind the identifier to a local address ahead of listening
    pub(crate) fn bind_addr(&self, addr: *mut libc::sockaddr) -> Result<()> {
        // SAFETY: ffi
        if unsafe { rdma_bind_addr(self.as_ptr(), addr) } != 0_i32 {
            return Err(last_provider_error("rdma_bind_addr"));
        }
        Ok(())
    }

    /// Start listening for incoming connection requests
    pub(crate) fn listen(&self, backlog: libc::c_int) -> Result<()> {
        // SAFETY: ffi
        if unsafe { rdma_listen(self.as_ptr(), backlog) } != 0_i32 {
            return Err(last_provider_error("rdma_listen"));
        }
        Ok(())
    }

    /// Create a reliable-connected queue pair on this identifier, within
    /// `pd` and with both work queues bound to `cq`
    pub(crate) fn create_qp(&mut self, pd: &ProtectionDomain, cq: &CompletionQueue) -> Result<()> {
        let mut init_attr = ibv_qp_init_attr {
            qp_context: std::ptr::null_mut::<libc::c_void>(),
            send_cq: cq.as_ptr(),
            recv_cq: cq.as_ptr(),
            srq: std::ptr::null_mut::<ibv_srq>(),
            cap: ibv_qp_cap {
                max_send_wr: MAX_SEND_WR,
                max_recv_wr: MAX_RECV_WR,
                max_send_sge: MAX_SEND_SGE,
                max_recv_sge: MAX_RECV_SGE,
                max_inline_data: 0,
            },
            qp_type: ibv_qp_type::IBV_QPT_RC,
            sq_sig_all: 0_i32,
        };
        // SAFETY: ffi
        if unsafe { rdma_create_qp(self.as_ptr(), pd.as_ptr(), &mut init_attr) } != 0_i32 {
            return Err(last_provider_error("rdma_create_qp"));
        }
        self.has_qp = true;
        Ok(())
    }

    /// Post the active-side connect with the given handshake parameters
    pub(crate) fn connect(&self, param: &mut rdma_conn_param) -> Result<()> {
        // SAFETY: ffi
        if unsafe { rdma_connect(self.as_ptr(), param) } != 0_i32 {
            return Err(last_provider_error("rdma_connect"));
        }
        Ok(())
    }

    /// Post the passive-side accept with the given handshake parameters
    pub(crate) fn accept(&self, param: &mut rdma_conn_param) -> Result<()> {
        // SAFETY: ffi
        if unsafe { rdma_accept(self.as_ptr(), param) } != 0_i32 {
            return Err(last_provider_error("rdma_accept"));
        }
        Ok(())
    }

    /// Reject an incoming connection request
    pub(crate) fn reject(&self) -> Result<()> {
        // SAFETY: ffi
        if unsafe { rdma_reject(self.as_ptr(), std::ptr::null(), 0_u8) } != 0_i32 {
            return Err(last_provider_error("rdma_reject"));
        }
        Ok(())
    }

    /// Post a disconnect, flushing outstanding work requests
    pub(crate) fn disconnect(&self) -> Result<()> {
        // SAFETY: ffi
        if unsafe { rdma_disconnect(self.as_ptr()) } != 0_i32 {
            return Err(last_provider_error("rdma_disconnect"));
        }
        Ok(())
    }

    /// Move this identifier onto another event channel
    pub(crate) fn migrate(&self, channel: &CmEventChannel) -> Result<()> {
        // SAFETY: ffi
        if unsafe { rdma_migrate_id(self.as_ptr(), channel.as_ptr()) } != 0_i32 {
            return Err(last_provider_error("rdma_migrate_id"));
        }
        Ok(())
    }

    /// Destroy the queue pair ahead of the identifier
    pub(crate) fn destroy_qp(&mut self) {
        if self.has_qp {
            // SAFETY: ffi
            unsafe { rdma_destroy_qp(self.as_ptr()) };
            self.has_qp = false;
        }
    }

    /// Destroy the queue pair and the identifier, surfacing the provider
    /// error of `rdma_destroy_id`
    pub(crate) fn destroy(self) -> Result<()> {
        let mut this = std::mem::ManuallyDrop::new(self);
        this.destroy_qp();
        // SAFETY: ffi
        if unsafe { rdma_destroy_id(this.as_ptr()) } != 0_i32 {
            return Err(last_provider_error("rdma_destroy_id"));
        }
        Ok(())
    }
}

unsafe impl Send for CmId {}

unsafe impl Sync for CmId {}

impl Drop for CmId {
    fn drop(&mut self) {
        self.destroy_qp();
        // SAFETY: ffi
        if unsafe { rdma_destroy_id(self.as_ptr()) } != 0_i32 {
            error!("rdma_destroy_id failed on drop");
        }
    }
}
