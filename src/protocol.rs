//! Wire format of the Port Control Protocol.
//!
//! Requests and responses share a 24 octet common header, followed by
//! opcode-specific data and options. See
//! [RFC 6887 Common Request and Response Header Format](https://datatracker.ietf.org/doc/html/rfc6887#section-7)

use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};

mod opcode_data;
mod options;
mod request;
mod response;

pub use opcode_data::{MapData, OpcodeData, PeerData};
pub use options::{OptionCode, PcpOption};
pub use request::Request;
pub use response::Response;

/// Port the gateway's PCP server listens on, per
/// [RFC 6887 IANA Considerations](https://datatracker.ietf.org/doc/html/rfc6887#section-19).
pub const SERVER_PORT: u16 = 5351;

/// Max size of a PCP packet as indicated in
/// [RFC 6887 Common Request and Response Header Format](https://datatracker.ietf.org/doc/html/rfc6887#section-7)
pub const MAX_PACKET_SIZE: usize = 1100;

/// Mapping lifetime requested when the caller expresses no preference.
pub const DEFAULT_LIFETIME_SECONDS: u32 = 3600;

/// All messages are padded to a multiple of 4 octets.
pub(crate) fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// PCP version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Version {
    /// PCP Version according to [RFC 6887 Version Negotiation](https://datatracker.ietf.org/doc/html/rfc6887#section-9)
    Pcp = 2,
}

/// Opcode as defined in [RFC 6887 IANA Considerations](https://datatracker.ietf.org/doc/html/rfc6887#section-19)
///
/// The opcode occupies the low 7 bits of the second header octet; the high
/// bit distinguishes requests from responses.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive, derive_more::Display,
)]
#[repr(u8)]
pub enum Opcode {
    /// Announce Opcode.
    ///
    /// Used by the server to announce restarts (indicating loss of state)
    /// and changes to external addresses, and by clients to probe for a
    /// server. See [RFC 6887 ANNOUNCE Opcode](https://datatracker.ietf.org/doc/html/rfc6887#section-14.1)
    #[display("announce")]
    Announce = 0,
    /// Map Opcode.
    ///
    /// Creates an endpoint-independent mapping: inbound traffic to the
    /// external port is forwarded to the client regardless of sender.
    /// See [RFC 6887 MAP Opcode](https://datatracker.ietf.org/doc/html/rfc6887#section-11)
    #[display("map")]
    Map = 1,
    /// Peer Opcode.
    ///
    /// Creates or refreshes an outbound mapping restricted to a single
    /// remote peer. See [RFC 6887 PEER Opcode](https://datatracker.ietf.org/doc/html/rfc6887#section-12)
    #[display("peer")]
    Peer = 2,
    /// An opcode this client does not implement. Kept verbatim so responses
    /// can still be header-parsed.
    #[num_enum(catch_all)]
    #[display("opcode {_0}")]
    Other(u8),
}

/// Transport protocol of a mapping, by IANA protocol number.
// NOTE: technically any IANA protocol is legal on the wire; only these are
// ever generated.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive, derive_more::Display,
)]
#[repr(u8)]
pub enum Protocol {
    /// Wildcard: the mapping applies to all transport protocols.
    #[display("all")]
    All = 0,
    #[display("tcp")]
    Tcp = 6,
    #[display("udp")]
    Udp = 17,
    /// Any other IANA protocol number, retained verbatim.
    #[num_enum(catch_all)]
    #[display("protocol {_0}")]
    Other(u8),
}

/// Result code of a response, per
/// [RFC 6887 Result Codes](https://datatracker.ietf.org/doc/html/rfc6887#section-7.4).
///
/// Codes the client does not recognize are retained as [`ResultCode::Other`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive, derive_more::Display,
)]
#[repr(u8)]
pub enum ResultCode {
    #[display("success")]
    Success = 0,
    /// The version number in the request is not supported by the server.
    /// Fatal for this client.
    #[display("unsupported version")]
    UnsupportedVersion = 1,
    /// The requested operation is disabled or denied by server policy.
    #[display("not authorized")]
    NotAuthorized = 2,
    /// The request could not be successfully parsed.
    #[display("malformed request")]
    MalformedRequest = 3,
    #[display("unsupported opcode")]
    UnsupportedOpcode = 4,
    /// Unsupported option in the mandatory-to-process range.
    #[display("unsupported option")]
    UnsupportedOption = 5,
    #[display("malformed option")]
    MalformedOption = 6,
    /// The server or the device it controls is experiencing a network
    /// failure. Short lifetime error.
    #[display("network failure")]
    NetworkFailure = 7,
    /// The server lacks resources to complete the request. Short lifetime
    /// error.
    #[display("no resources")]
    NoResources = 8,
    /// Unsupported transport protocol. Long lifetime error.
    #[display("unsupported protocol")]
    UnsupportedProtocol = 9,
    /// The mapping would exceed the subscriber's port quota.
    #[display("user exceeded quota")]
    UserExceededQuota = 10,
    /// The suggested external port and/or address cannot be provided.
    #[display("cannot provide external address")]
    CannotProvideExternal = 11,
    /// The request's source address does not match its client address field.
    #[display("address mismatch")]
    AddressMismatch = 12,
    /// The server could not create the requested filters.
    #[display("excessive remote peers")]
    ExcessiveRemotePeers = 13,
    /// A result code this client does not recognize, retained verbatim.
    #[num_enum(catch_all)]
    #[display("result code {_0}")]
    Other(u8),
}

impl ResultCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Success)
    }
}

/// Errors encoding a [`Request`].
#[derive(Debug, derive_more::Display, thiserror::Error, PartialEq, Eq)]
pub enum EncodeError {
    /// Map and peer requests need a non-zero internal port.
    #[display("internal port must be specified")]
    PortNotSpecified,
    /// Peer requests need a remote address.
    #[display("no remote address specified")]
    NoAddress,
    /// The padded message would exceed [`MAX_PACKET_SIZE`].
    #[display("packet exceeds the {MAX_PACKET_SIZE} octet size limit")]
    PacketTooLarge,
}

/// Errors decoding a [`Response`] from a server.
#[derive(Debug, derive_more::Display, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The version byte is not PCP version 2. The server is incompatible.
    #[display("unsupported version received")]
    UnsupportedVersion,
    /// The response indicator bit is clear: this is a request, not a
    /// response.
    #[display("packet is not a response")]
    WrongPacketType,
    /// Too short, or opcode data or options run past the end of the buffer.
    #[display("response is malformed")]
    Malformed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_wire_values_are_retained() {
        assert_eq!(ResultCode::from(13), ResultCode::ExcessiveRemotePeers);
        assert_eq!(ResultCode::from(99), ResultCode::Other(99));
        assert_eq!(u8::from(ResultCode::Other(99)), 99);

        assert_eq!(Protocol::from(17), Protocol::Udp);
        assert_eq!(Protocol::from(132), Protocol::Other(132));

        assert_eq!(Opcode::from(2), Opcode::Peer);
        assert_eq!(u8::from(Opcode::from(55)), 55);
    }

    #[test]
    fn version_is_strict() {
        assert!(Version::try_from(2).is_ok());
        assert!(Version::try_from(1).is_err());
    }

    #[test]
    fn message_padding() {
        assert_eq!(padding(24), 0);
        assert_eq!(padding(25), 3);
        assert_eq!(padding(27), 1);
        assert_eq!(padding(28), 0);
    }
}
