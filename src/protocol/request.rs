use std::net::Ipv6Addr;

use super::{
    opcode_data::OpcodeData, options::PcpOption, padding, EncodeError, Version, MAX_PACKET_SIZE,
};

/// A PCP request.
///
/// See [RFC 6887 Request Header](https://datatracker.ietf.org/doc/html/rfc6887#section-7.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// [`Version`] to use in this request.
    pub version: Version,
    /// Requested lifetime in seconds.
    pub lifetime_seconds: u32,
    /// IP address of the client.
    ///
    /// If the IP is an IPv4 address, it is represented as an IPv4-mapped
    /// IPv6 address.
    pub client_addr: Ipv6Addr,
    /// Data associated to the opcode of this request.
    pub opcode_data: OpcodeData,
    /// Options trailing the opcode data.
    pub options: Vec<PcpOption>,
}

impl Request {
    /// Size of the common request header, in bytes.
    pub const HEADER_SIZE: usize = // parts:
        1 + // version
        1 + // opcode
        2 + // reserved
        4 + // lifetime
        16; // client ip

    /// Encode this [`Request`], padded to a multiple of 4 octets.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let Request {
            version,
            lifetime_seconds,
            client_addr,
            opcode_data,
            options,
        } = self;
        let mut buf = Vec::with_capacity(Self::HEADER_SIZE + opcode_data.encoded_size());
        // buf[0]
        buf.push((*version).into());
        // buf[1], high bit clear: this is a request
        buf.push(opcode_data.opcode().into());
        // buf[2..4] reserved
        buf.push(0);
        buf.push(0);
        // buf[4..8]
        buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
        // buf[8..24], zero-filled when the address is unspecified
        buf.extend_from_slice(&client_addr.octets());
        // buf[24..]
        opcode_data.encode_into(&mut buf)?;
        for option in options {
            option.encode_into(&mut buf);
        }
        buf.extend(std::iter::repeat(0).take(padding(buf.len())));

        if buf.len() > MAX_PACKET_SIZE {
            return Err(EncodeError::PacketTooLarge);
        }
        Ok(buf)
    }

    /// Create an announce request.
    pub fn announce(client_addr: Ipv6Addr) -> Request {
        Request {
            version: Version::Pcp,
            // the announce opcode requires a lifetime of 0
            lifetime_seconds: 0,
            client_addr,
            // announce requests and responses have no opcode-specific payload
            opcode_data: OpcodeData::Announce,
            options: Vec::new(),
        }
    }

    /// Create a map request.
    pub fn map(
        data: super::MapData,
        client_addr: Ipv6Addr,
        lifetime_seconds: u32,
    ) -> Request {
        Request {
            version: Version::Pcp,
            lifetime_seconds,
            client_addr,
            opcode_data: OpcodeData::Map(data),
            options: Vec::new(),
        }
    }

    /// Create a peer request.
    pub fn peer(
        data: super::PeerData,
        client_addr: Ipv6Addr,
        lifetime_seconds: u32,
    ) -> Request {
        Request {
            version: Version::Pcp,
            lifetime_seconds,
            client_addr,
            opcode_data: OpcodeData::Peer(data),
            options: Vec::new(),
        }
    }

    #[cfg(test)]
    #[track_caller]
    pub(crate) fn decode(buf: &[u8]) -> Self {
        use super::Opcode;

        let version: Version = buf[0].try_into().unwrap();
        let opcode = Opcode::from(buf[1]);
        assert!(!matches!(opcode, Opcode::Other(_)), "unknown request opcode");
        // buf[2..4] reserved
        let lifetime_bytes: [u8; 4] = buf[4..8].try_into().unwrap();
        let lifetime_seconds = u32::from_be_bytes(lifetime_bytes);

        let client_addr_bytes: [u8; 16] = buf[8..24].try_into().unwrap();
        let client_addr: Ipv6Addr = client_addr_bytes.into();

        let data_len = OpcodeData::implied_size(opcode).unwrap();
        let opcode_data = OpcodeData::decode(opcode, &buf[Self::HEADER_SIZE..Self::HEADER_SIZE + data_len])
            .unwrap()
            .unwrap();
        let options = PcpOption::decode_all(&buf[Self::HEADER_SIZE + data_len..]).unwrap();
        Self {
            version,
            lifetime_seconds,
            client_addr,
            opcode_data,
            options,
        }
    }
}
