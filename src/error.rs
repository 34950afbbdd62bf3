//! Error types for the PCP client.

use std::io;

use crate::protocol::{DecodeError, EncodeError, ResultCode};

/// Top-level error returned by client operations.
///
/// Each variant represents a semantically distinct failure that callers can
/// match on to decide whether to retry or abort. Only
/// [`Error::UnsupportedVersion`] is fatal to the client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The routing table has no default gateway.
    #[error("gateway not found")]
    GatewayNotFound,

    /// No local interface address is on the gateway's network.
    #[error("no internal address on the gateway network")]
    NoInternalAddress,

    /// The system RNG failed while generating the client nonce.
    #[error("nonce generation failed")]
    NonceGeneration,

    /// Map and peer operations need a non-zero internal port.
    #[error("internal port must be specified")]
    PortNotSpecified,

    /// Peer operations need a remote address.
    #[error("no remote address specified")]
    NoAddress,

    /// The encoded request exceeds the 1100 octet size limit.
    #[error("packet exceeds the 1100 octet size limit")]
    PacketTooLarge,

    /// The gateway speaks a PCP version this client does not.
    #[error("unsupported protocol version")]
    UnsupportedVersion,

    /// A request arrived where a response was expected.
    #[error("packet is not a response")]
    WrongPacketType,

    /// The datagram does not parse as a PCP response.
    #[error("malformed response")]
    Malformed,

    /// A datagram arrived from an address other than the gateway's.
    #[error("sender and gateway addresses do not match")]
    AddressMismatch,

    /// Refresh or delete of a port with no known mapping.
    #[error("mapping not found")]
    MappingNotFound,

    /// Socket creation or binding failed.
    #[error("socket creation/bind failed")]
    Socket(#[source] io::Error),

    /// Sending on the transport failed.
    #[error("network send failed")]
    NetworkSend(#[source] io::Error),

    /// Receiving on the transport failed.
    #[error("network receive failed")]
    NetworkRecv(#[source] io::Error),

    /// The gateway did not answer within the configured deadline.
    #[error("timed out waiting for the gateway")]
    NetworkTimeout,

    /// The client was closed while the operation was in flight.
    #[error("client closed")]
    Closed,

    /// The server answered with a non-success result code, retained
    /// verbatim.
    #[error("server answered: {0}")]
    Result(ResultCode),
}

impl From<EncodeError> for Error {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::PortNotSpecified => Self::PortNotSpecified,
            EncodeError::NoAddress => Self::NoAddress,
            EncodeError::PacketTooLarge => Self::PacketTooLarge,
        }
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::UnsupportedVersion => Self::UnsupportedVersion,
            DecodeError::WrongPacketType => Self::WrongPacketType,
            DecodeError::Malformed => Self::Malformed,
        }
    }
}
