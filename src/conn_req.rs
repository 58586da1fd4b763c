use crate::cm_id::CmId;
use crate::completion_queue::{CompletionQueue, DEFAULT_CQ_DEPTH};
use crate::conn::Conn;
use crate::conn_cfg::ConnCfg;
use crate::context::AddrInfo;
use crate::error::{record_provider_failure, Result, RpmaError};
use crate::event_channel::{CmEvent, CmEventChannel};
use crate::peer::Peer;
use crate::protection_domain::ProtectionDomain;
use clippy_utilities::Cast;
use rdma_sys::rdma_cm_event_type;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::debug;

/// Timeout of the address and route resolution steps
const CM_TIMEOUT_MS: libc::c_int = 500;

/// Ceiling of the private data blob carried by the handshake
pub const PRIVATE_DATA_MAX: usize = 255;

/// Which side of the handshake the request represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Locally initiated connection attempt
    Outgoing,
    /// Offer accepted from a listening endpoint
    Incoming,
}

/// A half-open connection: the queue pair and completion queue exist, the
/// handshake has not run yet.
///
/// Terminated by [`ConnReq::connect`], which promotes it into a [`Conn`],
/// or by [`ConnReq::delete`], which rejects (incoming) and destroys it.
/// Both consume the request; its resources transfer into the connection on
/// successful connect and are released on every other path.
#[derive(Debug)]
pub struct ConnReq {
    /// Unpromoted communication identifier
    id: CmId,
    /// Pre-created completion queue for the future connection
    cq: CompletionQueue,
    /// Event channel the identifier reports to
    evch: CmEventChannel,
    /// Back-reference keeping the peer alive
    pd: Arc<ProtectionDomain>,
    /// Which side of the handshake this request represents
    direction: Direction,
    /// Private data cached from the remote connect request (incoming only)
    private_data: Vec<u8>,
}

impl ConnReq {
    /// Create an outgoing connection request towards `addr`:`service`.
    ///
    /// Blocks while the connection manager resolves the address and the
    /// route (bounded by an internal timeout), then creates the completion
    /// queue and the queue pair within the peer's protection domain. On any
    /// provider failure the partially acquired resources are released.
    pub fn new(peer: &Peer, addr: &str, service: &str) -> Result<Self> {
        let addr_info = AddrInfo::resolve(addr, Some(service))?;
        let evch = CmEventChannel::create()?;
        let mut id = CmId::create(&evch)?;

        id.resolve_addr(addr_info.ai_addr(), CM_TIMEOUT_MS)?;
        expect_cm_event(&evch, rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED)?;
        id.resolve_route(CM_TIMEOUT_MS)?;
        expect_cm_event(&evch, rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED)?;
        debug!("resolved {}:{}", addr, service);

        let cq = CompletionQueue::create(id.verbs(), DEFAULT_CQ_DEPTH)?;
        id.create_qp(peer.pd(), &cq)?;
        Ok(Self {
            id,
            cq,
            evch,
            pd: Arc::<ProtectionDomain>::clone(peer.pd()),
            direction: Direction::Outgoing,
            private_data: Vec::new(),
        })
    }

    /// Wrap the identifier delivered by a listener's `CONNECT_REQUEST`
    /// event and create the queue pair and completion queue against the
    /// peer. The identifier is migrated onto its own event channel so the
    /// future connection owns its event stream.
    pub(crate) fn from_incoming(pd: &Arc<ProtectionDomain>, event: &CmEvent) -> Result<Self> {
        let raw_id = NonNull::new(event.cm_id()).ok_or(RpmaError::Unknown)?;
        let mut id = CmId::from_raw(raw_id);
        let private_data = event.private_data();

        let evch = CmEventChannel::create()?;
        id.migrate(&evch)?;
        let cq = CompletionQueue::create(id.verbs(), DEFAULT_CQ_DEPTH)?;
        id.create_qp(pd, &cq)?;
        Ok(Self {
            id,
            cq,
            evch,
            pd: Arc::<ProtectionDomain>::clone(pd),
            direction: Direction::Incoming,
            private_data,
        })
    }

    /// Arm the handshake — connect for an outgoing request, accept for an
    /// incoming one — carrying `private_data` (at most
    /// [`PRIVATE_DATA_MAX`] bytes), then block until the connection manager
    /// reports `ESTABLISHED`.
    ///
    /// On success the request's identifier, queue pair and completion queue
    /// transfer into the returned connection. On every failure the request
    /// is destroyed; it is never left half-connected.
    pub fn connect(self, cfg: Option<&ConnCfg>, private_data: &[u8]) -> Result<Conn> {
        if private_data.len() > PRIVATE_DATA_MAX {
            return Err(RpmaError::Invalid("private data exceeds 255 bytes"));
        }
        let Self {
            id,
            cq,
            evch,
            pd,
            direction,
            private_data: cached,
        } = self;

        let cfg = cfg.copied().unwrap_or_default();
        let mut param = cfg.to_conn_param(private_data);
        let armed = match direction {
            Direction::Outgoing => id.connect(&mut param),
            Direction::Incoming => id.accept(&mut param),
        };
        if let Err(err) = armed {
            destroy_parts(id, cq, evch);
            return Err(err);
        }

        let event = match evch.next_event() {
            Ok(event) => event,
            Err(err) => {
                destroy_parts(id, cq, evch);
                return Err(err);
            }
        };
        if event.kind() != rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED {
            let err = cm_event_error("connect", &event);
            drop(event);
            destroy_parts(id, cq, evch);
            return Err(err);
        }
        // the accepting side got the remote blob with the connect request,
        // the initiating side gets it with ESTABLISHED
        let remote_data = match direction {
            Direction::Outgoing => event.private_data(),
            Direction::Incoming => cached,
        };
        drop(event);
        debug!("connection established, {} bytes private data", remote_data.len());
        Ok(Conn::new(pd, id, cq, evch, remote_data))
    }

    /// Reject (incoming) and destroy the request without connecting
    pub fn delete(self) -> Result<()> {
        let mut ret = Ok(());
        if self.direction == Direction::Incoming {
            if let Err(err) = self.id.reject() {
                ret = Err(err);
            }
        }
        let Self {
            mut id, cq, evch, ..
        } = self;
        id.destroy_qp();
        if let Err(err) = cq.destroy() {
            if ret.is_ok() {
                ret = Err(err);
            }
        }
        if let Err(err) = id.destroy() {
            if ret.is_ok() {
                ret = Err(err);
            }
        }
        drop(evch);
        ret
    }
}

/// Release the request's provider objects in dependency order
fn destroy_parts(mut id: CmId, cq: CompletionQueue, evch: CmEventChannel) {
    id.destroy_qp();
    drop(cq);
    drop(id);
    drop(evch);
}

/// Read one event off `evch` and require it to be `expected`
fn expect_cm_event(evch: &CmEventChannel, expected: u32) -> Result<()> {
    let event = evch.next_event()?;
    if event.kind() == expected {
        Ok(())
    } else {
        Err(cm_event_error("resolution", &event))
    }
}

/// Surface an unexpected connection-manager event as a provider failure,
/// capturing the event code in the provider-error field
fn cm_event_error(op: &str, event: &CmEvent) -> RpmaError {
    record_provider_failure(
        event.kind().cast(),
        format!(
            "{}: unexpected CM event {} (status {})",
            op,
            event.kind(),
            event.status()
        ),
    )
}
