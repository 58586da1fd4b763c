use derive_builder::Builder;
use getset::CopyGetters;
use rdma_sys::rdma_conn_param;
use std::mem;

/// Default number of incoming RDMA reads the local side can serve at a time
const DEFAULT_RESPONDER_RESOURCES: u8 = 1;
/// Default number of outstanding RDMA reads the local side may initiate
const DEFAULT_INITIATOR_DEPTH: u8 = 1;
/// Default number of transport-level retransmissions before giving up
const DEFAULT_RETRY_COUNT: u8 = 7;
/// Default number of receiver-not-ready retries, 7 retries indefinitely
const DEFAULT_RNR_RETRY_COUNT: u8 = 7;

/// Knobs of the connect/accept handshake.
///
/// A default-built configuration matches what the connection manager
/// negotiates for a plain reliable connection.
#[derive(Debug, Clone, Copy, CopyGetters, Builder)]
#[builder(derive(Debug))]
#[getset(get_copy = "pub")]
pub struct ConnCfg {
    /// The number of incoming RDMA reads and atomics the local side accepts
    /// outstanding at a time
    #[builder(default = "DEFAULT_RESPONDER_RESOURCES")]
    responder_resources: u8,
    /// The number of outstanding RDMA reads and atomics the local side may
    /// have towards the remote side
    #[builder(default = "DEFAULT_INITIATOR_DEPTH")]
    initiator_depth: u8,
    /// How many times the transport retries an unacknowledged packet
    #[builder(default = "DEFAULT_RETRY_COUNT")]
    retry_count: u8,
    /// How many times the transport retries after a receiver-not-ready NAK
    #[builder(default = "DEFAULT_RNR_RETRY_COUNT")]
    rnr_retry_count: u8,
}

impl Default for ConnCfg {
    #[inline]
    fn default() -> Self {
        Self {
            responder_resources: DEFAULT_RESPONDER_RESOURCES,
            initiator_depth: DEFAULT_INITIATOR_DEPTH,
            retry_count: DEFAULT_RETRY_COUNT,
            rnr_retry_count: DEFAULT_RNR_RETRY_COUNT,
        }
    }
}

impl ConnCfg {
    /// Build the handshake parameter block, attaching the private data blob
    /// which must outlive the connect/accept call
    pub(crate) fn to_conn_param(self, private_data: &[u8]) -> rdma_conn_param {
        // SAFETY: POD FFI type
        let mut param = unsafe { mem::zeroed::<rdma_conn_param>() };
        if !private_data.is_empty() {
            param.private_data = private_data.as_ptr().cast();
            #[allow(clippy::cast_possible_truncation)] // length checked against 255
            {
                param.private_data_len = private_data.len() as u8;
            }
        }
        param.responder_resources = self.responder_resources;
        param.initiator_depth = self.initiator_depth;
        param.retry_count = self.retry_count;
        param.rnr_retry_count = self.rnr_retry_count;
        param
    }
}
