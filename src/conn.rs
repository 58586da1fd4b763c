use crate::cm_id::CmId;
use crate::completion_queue::{Completion, CompletionQueue};
use crate::error::{provider_error, Result};
use crate::event_channel::CmEventChannel;
use crate::memory_region::{check_read_range, local::LocalMr, remote::RemoteMr};
use crate::protection_domain::ProtectionDomain;
use crate::work_request::ReadWr;
use crate::ReadFlag;
use enumflags2::BitFlags;
use parking_lot::Mutex;
use rdma_sys::{ibv_post_send, ibv_send_wr, rdma_cm_event_type};
use std::sync::Arc;
use tracing::debug;

/// Lifecycle event of a connection as seen by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    /// The connection has been established
    Established,
    /// The connection has been closed in an orderly fashion
    Closed,
    /// The connection has been lost on an abnormal path
    Lost,
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    /// Both sides completed the handshake
    Established,
    /// The local side posted the disconnect, the handshake has not finished
    CloseInitiatedLocal,
    /// The remote side posted the disconnect
    CloseInitiatedRemote,
    /// The disconnect handshake finished
    Closed,
    /// The connection broke on an abnormal path
    Lost,
}

/// Effect a connection-manager event has on the state machine
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Transition {
    /// State after the event is applied
    pub(crate) next: ConnState,
    /// Event to hand to the application, `None` to swallow and keep reading
    pub(crate) deliver: Option<ConnEvent>,
    /// Whether a local disconnect must be posted to finish a remotely
    /// initiated close
    pub(crate) complete_close: bool,
}

impl Transition {
    /// An event that changes nothing and is not delivered
    const fn swallow(state: ConnState) -> Self {
        Self {
            next: state,
            deliver: None,
            complete_close: false,
        }
    }
}

/// Apply one connection-manager event to the state machine.
///
/// Duplicate and unknown events dissolve into [`Transition::swallow`]; a
/// `DISCONNECTED` event yields `Closed` exactly once regardless of which
/// side initiated the close.
pub(crate) fn transition(state: ConnState, event_kind: u32) -> Transition {
    match event_kind {
        rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => {
            if state == ConnState::Established {
                Transition::swallow(state)
            } else {
                Transition {
                    next: ConnState::Established,
                    deliver: Some(ConnEvent::Established),
                    complete_close: false,
                }
            }
        }
        rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED => match state {
            ConnState::Established => Transition {
                next: ConnState::CloseInitiatedRemote,
                deliver: Some(ConnEvent::Closed),
                complete_close: true,
            },
            ConnState::CloseInitiatedLocal | ConnState::CloseInitiatedRemote => Transition {
                next: ConnState::Closed,
                deliver: Some(ConnEvent::Closed),
                complete_close: false,
            },
            ConnState::Closed | ConnState::Lost => Transition::swallow(state),
        },
        rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR
        | rdma_cm_event_type::RDMA_CM_EVENT_DEVICE_REMOVAL => match state {
            ConnState::Closed | ConnState::Lost => Transition::swallow(state),
            _ => Transition {
                next: ConnState::Lost,
                deliver: Some(ConnEvent::Lost),
                complete_close: false,
            },
        },
        _ => Transition::swallow(state),
    }
}

/// A live reliable connection: a queue pair with its dedicated completion
/// queue and connection-manager event channel.
///
/// Created by [`crate::ConnReq::connect`]; must be disconnected and drained
/// before [`Conn::delete`].
#[derive(Debug)]
pub struct Conn {
    /// Communication identifier owning the queue pair
    id: CmId,
    /// Dedicated completion queue, transferred from the request
    cq: CompletionQueue,
    /// Event channel shared with the originating request
    evch: CmEventChannel,
    /// Back-reference keeping the peer alive
    pd: Arc<ProtectionDomain>,
    /// Private data the remote side attached to the handshake
    private_data: Vec<u8>,
    /// Current lifecycle state
    state: Mutex<ConnState>,
    /// Serializes work-request posting around the queue pair
    post_lock: Mutex<()>,
    /// Makes `next_event` single-consumer
    event_lock: Mutex<()>,
    /// Makes `next_completion` single-consumer
    compl_lock: Mutex<()>,
}

impl Conn {
    /// Assemble an established connection out of the request's parts
    pub(crate) fn new(
        pd: Arc<ProtectionDomain>,
        id: CmId,
        cq: CompletionQueue,
        evch: CmEventChannel,
        private_data: Vec<u8>,
    ) -> Self {
        Self {
            id,
            cq,
            evch,
            pd,
            private_data,
            state: Mutex::new(ConnState::Established),
            post_lock: Mutex::new(()),
            event_lock: Mutex::new(()),
            compl_lock: Mutex::new(()),
        }
    }

    /// Block until the next lifecycle event for this connection and advance
    /// the state machine. Unknown and duplicate events are swallowed.
    ///
    /// Destroying the event channel from underneath a blocked call makes it
    /// return `Provider` with the channel-closed errno and marks the
    /// connection lost.
    pub fn next_event(&self) -> Result<ConnEvent> {
        let _consumer = self.event_lock.lock();
        loop {
            let event = match self.evch.next_event() {
                Ok(event) => event,
                Err(err) => {
                    *self.state.lock() = ConnState::Lost;
                    return Err(err);
                }
            };
            let kind = event.kind();
            drop(event);

            let mut state = self.state.lock();
            let step = transition(*state, kind);
            *state = step.next;
            if step.complete_close {
                // finish the handshake of a remotely initiated close; the
                // provider flushes outstanding work requests either way
                if let Err(err) = self.id.disconnect() {
                    debug!("disconnect while completing remote close: {}", err);
                }
                *state = ConnState::Closed;
            }
            drop(state);

            match step.deliver {
                Some(conn_event) => {
                    debug!("CM event {} delivered as {:?}", kind, conn_event);
                    return Ok(conn_event);
                }
                None => debug!("CM event {} swallowed", kind),
            }
        }
    }

    /// The private data blob the remote side attached to the handshake,
    /// empty when it attached none. Owned by the connection and valid until
    /// its destruction.
    #[inline]
    #[must_use]
    pub fn private_data(&self) -> &[u8] {
        &self.private_data
    }

    /// Initiate an orderly close. Idempotent in effect: once the state has
    /// left `Established` the call is a no-op returning success.
    pub fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            ConnState::Established => {
                self.id.disconnect()?;
                *state = ConnState::CloseInitiatedLocal;
                Ok(())
            }
            ConnState::CloseInitiatedLocal
            | ConnState::CloseInitiatedRemote
            | ConnState::Closed
            | ConnState::Lost => Ok(()),
        }
    }

    /// Post a one-sided read of `len` bytes from `src` + `src_offset` into
    /// `dst` + `dst_offset`.
    ///
    /// `dst` must permit [`crate::MrUsage::ReadDst`] and `src` must permit
    /// [`crate::MrUsage::ReadSrc`]; offsets and length must stay within
    /// both regions. `op_context` is stored verbatim in the work-request id
    /// and comes back in the matching [`Completion`]. With
    /// [`ReadFlag::WaitForCompletion`] the request is posted solicited so a
    /// completion is generated even where the transport could elide it.
    #[allow(clippy::too_many_arguments)] // mirrors the wire-level operation
    pub fn post_read(
        &self,
        op_context: u64,
        dst: &LocalMr<'_>,
        dst_offset: usize,
        src: &RemoteMr,
        src_offset: usize,
        len: usize,
        flags: BitFlags<ReadFlag>,
    ) -> Result<()> {
        check_read_range(
            dst.length(),
            dst.usage(),
            dst_offset,
            src.length(),
            src.usage(),
            src_offset,
            len,
        )?;
        let mut read_wr = ReadWr::new(op_context, dst, dst_offset, src, src_offset, len, flags);
        let mut bad_wr = std::ptr::null_mut::<ibv_send_wr>();

        let _post = self.post_lock.lock();
        self.cq.req_notify(false)?;
        debug!(
            "post read len {} dst {:x}+{} rkey {:x} wrid {}",
            len,
            dst.addr(),
            dst_offset,
            src.rkey(),
            op_context,
        );
        // SAFETY: ffi, the request and its scatter/gather entry live across
        // the call
        let errno = unsafe { ibv_post_send(self.id.qp(), read_wr.as_mut_ptr(), &mut bad_wr) };
        if errno != 0_i32 {
            return Err(provider_error("ibv_post_send", errno));
        }
        Ok(())
    }

    /// Obtain the next operation completion.
    ///
    /// Polls once; when the queue is empty, blocks on the completion
    /// channel, re-arms the notification and polls again. After the
    /// connection has left `Established`, remaining flush completions are
    /// drained and then `Provider` with the channel-closed errno is
    /// returned instead of blocking forever.
    pub fn next_completion(&self) -> Result<Completion> {
        let _consumer = self.compl_lock.lock();
        loop {
            if let Some(completion) = self.cq.poll_single()? {
                return Ok(completion);
            }
            let state = *self.state.lock();
            if matches!(state, ConnState::Closed | ConnState::Lost) {
                return Err(provider_error("completion channel closed", libc::EBADF));
            }
            self.cq.wait_and_rearm()?;
        }
    }

    /// Destroy the queue pair, the completion queue, the identifier and the
    /// event channel, in that order.
    ///
    /// The connection is consumed on failure as well, preventing a second
    /// teardown of partially destroyed provider objects; the first provider
    /// error encountered is returned.
    pub fn delete(self) -> Result<()> {
        let Self {
            mut id,
            cq,
            evch,
            pd,
            private_data: _,
            state: _,
            post_lock: _,
            event_lock: _,
            compl_lock: _,
        } = self;
        let mut ret = Ok(());
        id.destroy_qp();
        if let Err(err) = cq.destroy() {
            ret = Err(err);
        }
        if let Err(err) = id.destroy() {
            if ret.is_ok() {
                ret = Err(err);
            }
        }
        drop(evch);
        drop(pd);
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn established_is_swallowed_when_duplicate() {
        let step = transition(
            ConnState::Established,
            rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED,
        );
        assert_eq!(step, Transition::swallow(ConnState::Established));
    }

    #[test]
    fn remote_disconnect_closes_once() {
        let step = transition(
            ConnState::Established,
            rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED,
        );
        assert_eq!(step.next, ConnState::CloseInitiatedRemote);
        assert_eq!(step.deliver, Some(ConnEvent::Closed));
        assert!(step.complete_close);

        // a second DISCONNECTED after the close finished is swallowed
        let dup = transition(
            ConnState::Closed,
            rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED,
        );
        assert_eq!(dup, Transition::swallow(ConnState::Closed));
    }

    #[test]
    fn local_disconnect_completion() {
        let step = transition(
            ConnState::CloseInitiatedLocal,
            rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED,
        );
        assert_eq!(step.next, ConnState::Closed);
        assert_eq!(step.deliver, Some(ConnEvent::Closed));
        assert!(!step.complete_close);
    }

    #[test]
    fn abnormal_events_lose_the_connection() {
        for kind in [
            rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR,
            rdma_cm_event_type::RDMA_CM_EVENT_DEVICE_REMOVAL,
        ] {
            let step = transition(ConnState::Established, kind);
            assert_eq!(step.next, ConnState::Lost);
            assert_eq!(step.deliver, Some(ConnEvent::Lost));
        }
        // but not after the connection already ended
        let step = transition(
            ConnState::Lost,
            rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR,
        );
        assert_eq!(step, Transition::swallow(ConnState::Lost));
    }

    #[test]
    fn unrelated_events_are_swallowed() {
        let step = transition(
            ConnState::Established,
            rdma_cm_event_type::RDMA_CM_EVENT_TIMEWAIT_EXIT,
        );
        assert_eq!(step, Transition::swallow(ConnState::Established));
    }
}
