use crate::error::{last_provider_error, Result};
use rdma_sys::{
    ibv_ack_cq_events, ibv_comp_channel, ibv_cq, ibv_create_comp_channel,
    ibv_destroy_comp_channel, ibv_get_cq_event,
};
use std::ptr::NonNull;
use tracing::error;

/// Completion event channel wrapper for `ibv_comp_channel`
#[derive(Debug)]
pub(crate) struct CompChannel {
    /// The inner `ibv_comp_channel` pointer
    inner_cc: NonNull<ibv_comp_channel>,
}

impl CompChannel {
    /// Get the inner `ibv_comp_channel` pointer
    pub(crate) fn as_ptr(&self) -> *mut ibv_comp_channel {
        self.inner_cc.as_ptr()
    }

    /// Create a new `CompChannel` on the device context
    pub(crate) fn create(ctx: *mut rdma_sys::ibv_context) -> Result<Self> {
        // SAFETY: ffi
        let inner_cc = NonNull::new(unsafe { ibv_create_comp_channel(ctx) })
            .ok_or_else(|| last_provider_error("ibv_create_comp_channel"))?;
        Ok(Self { inner_cc })
    }

    /// Block until the next completion event arrives for `cq` and
    /// acknowledge it
    pub(crate) fn wait(&self, cq: *mut ibv_cq) -> Result<()> {
        let mut ev_cq = std::ptr::null_mut::<ibv_cq>();
        let mut ev_ctx = std::ptr::null_mut::<libc::c_void>();
        // SAFETY: ffi, blocks until a completion event is generated
        if unsafe { ibv_get_cq_event(self.as_ptr(), &mut ev_cq, &mut ev_ctx) } != 0_i32 {
            return Err(last_provider_error("ibv_get_cq_event"));
        }
        debug_assert_eq!(ev_cq, cq, "completion event for a foreign CQ");
        // SAFETY: ffi
        unsafe { ibv_ack_cq_events(ev_cq, 1) };
        Ok(())
    }
}

unsafe impl Send for CompChannel {}

unsafe impl Sync for CompChannel {}

impl Drop for CompChannel {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_destroy_comp_channel(self.as_ptr()) };
        if errno != 0_i32 {
            error!("ibv_destroy_comp_channel failed on drop: {}", errno);
        }
    }
}
