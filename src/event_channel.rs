use crate::error::{last_provider_error, Result, RpmaError};
use rdma_sys::{
    rdma_ack_cm_event, rdma_cm_event, rdma_cm_id, rdma_create_event_channel,
    rdma_destroy_event_channel, rdma_event_channel, rdma_get_cm_event,
};
use std::ptr::NonNull;
use tracing::error;

/// Connection-manager event channel wrapper for `rdma_event_channel`
#[derive(Debug)]
pub(crate) struct CmEventChannel {
    /// The inner `rdma_event_channel` pointer
    inner_ec: NonNull<rdma_event_channel>,
}

impl CmEventChannel {
    /// Get the inner `rdma_event_channel` pointer
    pub(crate) fn as_ptr(&self) -> *mut rdma_event_channel {
        self.inner_ec.as_ptr()
    }

    /// Create a new `CmEventChannel`
    pub(crate) fn create() -> Result<Self> {
        // SAFETY: ffi
        let inner_ec = NonNull::new(unsafe { rdma_create_event_channel() })
            .ok_or_else(|| last_provider_error("rdma_create_event_channel"))?;
        Ok(Self { inner_ec })
    }

    /// Block until the next connection-manager event arrives on this
    /// channel. The returned event acknowledges itself when dropped.
    pub(crate) fn next_event(&self) -> Result<CmEvent> {
        let mut event = std::ptr::null_mut::<rdma_cm_event>();
        // SAFETY: ffi, blocks until an event is reported
        if unsafe { rdma_get_cm_event(self.as_ptr(), &mut event) } != 0_i32 {
            return Err(last_provider_error("rdma_get_cm_event"));
        }
        NonNull::new(event)
            .map(|inner| CmEvent { inner })
            .ok_or(RpmaError::Unknown)
    }
}

unsafe impl Send for CmEventChannel {}

unsafe impl Sync for CmEventChannel {}

impl Drop for CmEventChannel {
    fn drop(&mut self) {
        // SAFETY: ffi
        unsafe { rdma_destroy_event_channel(self.as_ptr()) };
    }
}

/// A single connection-manager event, acknowledged back to the provider on
/// drop. Everything needed from the event must be copied out before then.
#[derive(Debug)]
pub(crate) struct CmEvent {
    /// The inner `rdma_cm_event` pointer
    inner: NonNull<rdma_cm_event>,
}

impl CmEvent {
    /// The reported event type, one of `rdma_cm_event_type`
    pub(crate) fn kind(&self) -> u32 {
        // SAFETY: guaranteed valid until acknowledged
        unsafe { self.inner.as_ref() }.event
    }

    /// The status the provider attached to the event, zero when the event
    /// reports success
    pub(crate) fn status(&self) -> i32 {
        // SAFETY: guaranteed valid until acknowledged
        unsafe { self.inner.as_ref() }.status
    }

    /// The communication identifier the event refers to. For
    /// `CONNECT_REQUEST` events this is a new identifier owned by the
    /// application once the event is acknowledged.
    pub(crate) fn cm_id(&self) -> *mut rdma_cm_id {
        // SAFETY: guaranteed valid until acknowledged
        unsafe { self.inner.as_ref() }.id
    }

    /// Copy the private data carried by a connect/accept handshake event,
    /// empty when the event carries none
    pub(crate) fn private_data(&self) -> Vec<u8> {
        // SAFETY: the conn member of the param union is valid for
        // connection events of the TCP port space
        let conn = unsafe { self.inner.as_ref().param.conn };
        if conn.private_data.is_null() || conn.private_data_len == 0 {
            return Vec::new();
        }
        // SAFETY: the provider guarantees `private_data_len` readable bytes
        unsafe {
            std::slice::from_raw_parts(
                conn.private_data.cast::<u8>(),
                usize::from(conn.private_data_len),
            )
        }
        .to_vec()
    }
}

unsafe impl Send for CmEvent {}

impl Drop for CmEvent {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { rdma_ack_cm_event(self.inner.as_ptr()) };
        if errno != 0_i32 {
            error!("rdma_ack_cm_event failed: {}", errno);
        }
    }
}
