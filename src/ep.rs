use crate::cm_id::CmId;
use crate::conn_req::ConnReq;
use crate::context::AddrInfo;
use crate::error::Result;
use crate::event_channel::CmEventChannel;
use crate::peer::Peer;
use crate::protection_domain::ProtectionDomain;
use rdma_sys::rdma_cm_event_type;
use std::sync::Arc;
use tracing::debug;

/// Listen backlog of incoming connection requests
const LISTEN_BACKLOG: libc::c_int = 10;

/// A passive listener producing incoming connection requests
#[derive(Debug)]
pub struct Endpoint {
    /// Listening communication identifier
    id: CmId,
    /// Event channel carrying the listener's connect requests
    evch: CmEventChannel,
    /// Back-reference keeping the peer alive
    pd: Arc<ProtectionDomain>,
}

impl Endpoint {
    /// Bind a listening identifier to `addr`:`service` and start accepting
    pub fn listen(peer: &Peer, addr: &str, service: &str) -> Result<Self> {
        let addr_info = AddrInfo::resolve(addr, Some(service))?;
        let evch = CmEventChannel::create()?;
        let id = CmId::create(&evch)?;
        id.bind_addr(addr_info.ai_addr())?;
        id.listen(LISTEN_BACKLOG)?;
        debug!("listening on {}:{}", addr, service);
        Ok(Self {
            id,
            evch,
            pd: Arc::<ProtectionDomain>::clone(peer.pd()),
        })
    }

    /// Block until the next incoming connection request arrives and wrap it.
    ///
    /// Takes `&mut self`: the endpoint is a single-consumer source of
    /// requests. Events other than `CONNECT_REQUEST` observed on the
    /// listener are consumed and discarded.
    pub fn next_conn_req(&mut self) -> Result<ConnReq> {
        loop {
            let event = self.evch.next_event()?;
            if event.kind() == rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST {
                return ConnReq::from_incoming(&self.pd, &event);
            }
            debug!("discarding CM event {} on listening endpoint", event.kind());
        }
    }

    /// Stop listening and destroy the identifier and the event channel.
    ///
    /// Requests already handed out by [`Endpoint::next_conn_req`] are
    /// unaffected; they run on their own identifiers and channels.
    pub fn shutdown(self) -> Result<()> {
        let Self { id, evch, pd } = self;
        let ret = id.destroy();
        drop(evch);
        drop(pd);
        ret
    }
}
