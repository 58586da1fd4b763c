use crate::comp_channel::CompChannel;
use crate::error::{last_provider_error, provider_error, Result, RpmaError};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use rdma_sys::{
    ibv_cq, ibv_create_cq, ibv_destroy_cq, ibv_poll_cq, ibv_req_notify_cq, ibv_wc,
    ibv_wc_status,
};
use std::mem;
use std::ptr::NonNull;
use thiserror::Error;
use tracing::error;

/// Depth of the completion queue armed for every connection
pub(crate) const DEFAULT_CQ_DEPTH: i32 = 16_i32;

/// Kind of a completed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// One-sided remote read
    Read,
}

/// A delivered work completion: the caller token given at post time, the
/// operation kind and the provider status, verbatim
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// The opaque token the operation was posted with
    pub op_context: u64,
    /// Kind of the completed operation
    pub op: Op,
    /// Raw `ibv_wc_status` of the completion
    pub op_status: u32,
}

impl Completion {
    /// Whether the operation completed successfully
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.op_status == ibv_wc_status::IBV_WC_SUCCESS
    }

    /// Map the raw status into a typed result
    #[inline]
    pub fn result(&self) -> std::result::Result<(), WcError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(WcError::from_u32(self.op_status).unwrap_or(WcError::UnexpectedErr))
        }
    }
}

/// Completion queue with its dedicated completion event channel.
///
/// One instance per connection; created ahead of the queue pair by the
/// connection request and transferred into the connection on connect.
#[derive(Debug)]
pub(crate) struct CompletionQueue {
    /// Completion event channel
    channel: CompChannel,
    /// Real completion queue
    inner_cq: NonNull<ibv_cq>,
}

impl CompletionQueue {
    /// Get the internal cq pointer
    pub(crate) const fn as_ptr(&self) -> *mut ibv_cq {
        self.inner_cq.as_ptr()
    }

    /// Create a completion queue of `depth` entries on the device context,
    /// bound to a freshly created completion channel
    pub(crate) fn create(ctx: *mut rdma_sys::ibv_context, depth: i32) -> Result<Self> {
        let channel = CompChannel::create(ctx)?;
        // SAFETY: ffi
        let inner_cq = NonNull::new(unsafe {
            ibv_create_cq(ctx, depth, std::ptr::null_mut(), channel.as_ptr(), 0_i32)
        })
        .ok_or_else(|| last_provider_error("ibv_create_cq"))?;
        let cq = Self { channel, inner_cq };
        cq.req_notify(false)?;
        Ok(cq)
    }

    /// Request notification on the next completion event
    pub(crate) fn req_notify(&self, solicited_only: bool) -> Result<()> {
        // SAFETY: ffi
        let errno = unsafe {
            ibv_req_notify_cq(self.as_ptr(), if solicited_only { 1_i32 } else { 0_i32 })
        };
        if errno != 0_i32 {
            return Err(provider_error("ibv_req_notify_cq", errno));
        }
        Ok(())
    }

    /// Poll a single work completion, `None` when the queue is empty
    pub(crate) fn poll_single(&self) -> Result<Option<Completion>> {
        // SAFETY: POD FFI type
        let mut wc = unsafe { mem::zeroed::<ibv_wc>() };
        // SAFETY: ffi
        let polled = unsafe { ibv_poll_cq(self.as_ptr(), 1_i32, &mut wc) };
        if polled < 0_i32 {
            return Err(last_provider_error("ibv_poll_cq"));
        }
        if polled == 0_i32 {
            return Ok(None);
        }
        Ok(Some(Completion {
            op_context: wc.wr_id,
            // reads are the only operation kind a connection posts, which
            // also covers flush completions whose opcode is undefined
            op: Op::Read,
            op_status: wc.status,
        }))
    }

    /// Block until the completion channel signals, then acknowledge the
    /// event and re-arm the notification
    pub(crate) fn wait_and_rearm(&self) -> Result<()> {
        self.channel.wait(self.as_ptr())?;
        self.req_notify(false)
    }

    /// Destroy the queue, surfacing the provider error of
    /// `ibv_destroy_cq` while still releasing the channel
    pub(crate) fn destroy(self) -> Result<()> {
        let this = mem::ManuallyDrop::new(self);
        // SAFETY: ffi
        let errno = unsafe { ibv_destroy_cq(this.as_ptr()) };
        // SAFETY: moved out exactly once, `Drop` is skipped
        let channel = unsafe { std::ptr::read(&this.channel) };
        drop(channel);
        if errno != 0_i32 {
            return Err(provider_error("ibv_destroy_cq", errno));
        }
        Ok(())
    }
}

unsafe impl Send for CompletionQueue {}

unsafe impl Sync for CompletionQueue {}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_destroy_cq(self.as_ptr()) };
        if errno != 0_i32 {
            error!("ibv_destroy_cq failed on drop: {}", errno);
        }
    }
}

/// Typed view of a failed work completion status
#[allow(missing_docs)]
#[derive(Error, Debug, FromPrimitive, Copy, Clone, PartialEq, Eq)]
pub enum WcError {
    #[error("Local Length Error: a scatter/gather entry does not fit the message")]
    LocLenErr = 1,
    #[error("Local QP Operation Error: internal QP consistency error")]
    LocQpOpErr = 2,
    #[error("Local EE Context Operation Error")]
    LocEecOpErr = 3,
    #[error("Local Protection Error: scatter/gather list references an invalid memory region")]
    LocProtErr = 4,
    #[error("Work Request Flushed Error: the QP transitioned into the Error state while the work request was outstanding")]
    WrFlushErr = 5,
    #[error("Memory Window Binding Error")]
    MwBindErr = 6,
    #[error("Bad Response Error: unexpected transport layer opcode from the responder")]
    BadRespErr = 7,
    #[error("Local Access Error: protection error on a local data buffer")]
    LocAccessErr = 8,
    #[error("Remote Invalid Request Error: the responder detected an invalid message")]
    RemInvReqErr = 9,
    #[error("Remote Access Error: protection error on the remote data buffer")]
    RemAccessErr = 10,
    #[error("Remote Operation Error: the responder could not complete the operation")]
    RemOpErr = 11,
    #[error("Transport Retry Counter Exceeded: the remote side did not acknowledge")]
    RetryExc = 12,
    #[error("RNR Retry Counter Exceeded: the remote receive queue stayed empty")]
    RnrRetryExc = 13,
    #[error("Local RDD Violation Error")]
    LocRddViolErr = 14,
    #[error("Remote Invalid RD Request")]
    RemInvRdReq = 15,
    #[error("Remote Aborted Error: the responder aborted the operation")]
    RemAbortErr = 16,
    #[error("Invalid EE Context Number")]
    InvEecn = 17,
    #[error("Invalid EE Context State Error")]
    InvEecState = 18,
    #[error("Fatal Error")]
    Fatal = 19,
    #[error("Response Timeout Error")]
    RespTimeout = 20,
    #[error("General Error")]
    GeneralErr = 21,
    #[error("Unexpected Error")]
    UnexpectedErr = 100,
}

impl From<WcError> for RpmaError {
    #[inline]
    fn from(err: WcError) -> Self {
        Self::Provider { errno: err as i32 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wc_status_mapping() {
        assert_eq!(WcError::from_u32(5), Some(WcError::WrFlushErr));
        assert_eq!(WcError::from_u32(12), Some(WcError::RetryExc));
        assert_eq!(WcError::from_u32(77), None);
    }

    #[test]
    fn completion_result() {
        let ok = Completion {
            op_context: 42,
            op: Op::Read,
            op_status: ibv_wc_status::IBV_WC_SUCCESS,
        };
        assert!(ok.is_success());
        assert!(ok.result().is_ok());

        let flushed = Completion {
            op_context: 42,
            op: Op::Read,
            op_status: ibv_wc_status::IBV_WC_WR_FLUSH_ERR,
        };
        assert!(!flushed.is_success());
        assert_eq!(flushed.result().unwrap_err(), WcError::WrFlushErr);
    }
}
