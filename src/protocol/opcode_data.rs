//! Encoding and decoding of the data associated with an [`Opcode`].

use std::net::Ipv6Addr;

use super::{EncodeError, Opcode, Protocol};

/// Data associated to an [`Opcode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpcodeData {
    /// Data for an [`Opcode::Announce`] request or response: none.
    Announce,
    /// Data for an [`Opcode::Map`] request or response.
    Map(MapData),
    /// Data for an [`Opcode::Peer`] request or response.
    Peer(PeerData),
}

/// [`OpcodeData`] associated to an [`Opcode::Map`].
///
/// See [RFC 6887 MAP Operation Packet Formats](https://datatracker.ietf.org/doc/html/rfc6887#section-11.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapData {
    /// Nonce of the request. Lets the server authenticate later refreshes
    /// and deletes of the same mapping.
    pub nonce: [u8; 12],
    /// Transport protocol for which the mapping is requested.
    pub protocol: Protocol,
    /// Internal (client side) port of the mapping. Must not be zero.
    pub internal_port: u16,
    /// External port. A suggestion in requests, authoritative in responses.
    pub external_port: u16,
    /// External address. A suggestion in requests, authoritative in
    /// responses. IPv4 addresses are v4-mapped.
    pub external_addr: Ipv6Addr,
}

/// [`OpcodeData`] associated to an [`Opcode::Peer`]: a [`MapData`] narrowed
/// to a single remote endpoint.
///
/// See [RFC 6887 PEER Operation Packet Formats](https://datatracker.ietf.org/doc/html/rfc6887#section-12.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerData {
    pub map: MapData,
    /// Port of the remote peer.
    pub remote_port: u16,
    /// Address of the remote peer. Must be set when sending.
    pub remote_addr: Ipv6Addr,
}

/// Generic error returned when decoding [`OpcodeData`] fails.
#[derive(Debug)]
pub struct InvalidOpcodeData;

impl MapData {
    /// Size of the opcode-specific data of an [`Opcode::Map`] message.
    pub const ENCODED_SIZE: usize = // parts
        12 + // nonce
        1 + // protocol
        3 + // reserved
        2 + // internal port
        2 + // external port
        16; // external address

    /// Encode this [`MapData`].
    pub fn encode(&self) -> Result<[u8; Self::ENCODED_SIZE], EncodeError> {
        let MapData {
            nonce,
            protocol,
            internal_port,
            external_port,
            external_addr,
        } = self;
        if *internal_port == 0 {
            return Err(EncodeError::PortNotSpecified);
        }
        let mut buf = [0; Self::ENCODED_SIZE];
        buf[0..12].copy_from_slice(nonce);
        buf[12] = (*protocol).into();
        // buf[13..16] reserved
        buf[16..18].copy_from_slice(&internal_port.to_be_bytes());
        buf[18..20].copy_from_slice(&external_port.to_be_bytes());
        buf[20..].copy_from_slice(&external_addr.octets());

        Ok(buf)
    }

    /// Decode a [`MapData`].
    pub fn decode(buf: &[u8]) -> Result<Self, InvalidOpcodeData> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(InvalidOpcodeData);
        }

        let nonce = buf[..12].try_into().expect("slice has the right size");

        let protocol = buf[12].into();

        // buf[13..16] reserved

        let internal_port_bytes = buf[16..18].try_into().expect("slice has the right size");
        let internal_port = u16::from_be_bytes(internal_port_bytes);

        let external_port_bytes = buf[18..20].try_into().expect("slice has the right size");
        let external_port = u16::from_be_bytes(external_port_bytes);

        let external_addr_bytes: [u8; 16] =
            buf[20..Self::ENCODED_SIZE].try_into().expect("slice has the right size");
        let external_addr = Ipv6Addr::from(external_addr_bytes);

        Ok(MapData {
            nonce,
            protocol,
            internal_port,
            external_port,
            external_addr,
        })
    }

    #[cfg(test)]
    pub(crate) fn random<R: rand::Rng>(rng: &mut R) -> MapData {
        let octets: [u8; 16] = rng.gen();
        MapData {
            nonce: rng.gen(),
            protocol: Protocol::Udp,
            internal_port: rng.gen_range(1..=u16::MAX),
            external_port: rng.gen(),
            external_addr: octets.into(),
        }
    }
}

impl PeerData {
    /// Size of the opcode-specific data of an [`Opcode::Peer`] message.
    pub const ENCODED_SIZE: usize = // parts
        MapData::ENCODED_SIZE + // map layout
        2 + // remote port
        2 + // reserved
        16; // remote address

    /// Encode this [`PeerData`].
    pub fn encode(&self) -> Result<[u8; Self::ENCODED_SIZE], EncodeError> {
        let PeerData {
            map,
            remote_port,
            remote_addr,
        } = self;
        if remote_addr.is_unspecified() {
            return Err(EncodeError::NoAddress);
        }
        let mut buf = [0; Self::ENCODED_SIZE];
        buf[..MapData::ENCODED_SIZE].copy_from_slice(&map.encode()?);
        buf[36..38].copy_from_slice(&remote_port.to_be_bytes());
        // buf[38..40] reserved
        buf[40..].copy_from_slice(&remote_addr.octets());

        Ok(buf)
    }

    /// Decode a [`PeerData`].
    pub fn decode(buf: &[u8]) -> Result<Self, InvalidOpcodeData> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(InvalidOpcodeData);
        }

        let map = MapData::decode(&buf[..MapData::ENCODED_SIZE])?;

        let remote_port_bytes = buf[36..38].try_into().expect("slice has the right size");
        let remote_port = u16::from_be_bytes(remote_port_bytes);

        // buf[38..40] reserved

        let remote_addr_bytes: [u8; 16] =
            buf[40..Self::ENCODED_SIZE].try_into().expect("slice has the right size");
        let remote_addr = Ipv6Addr::from(remote_addr_bytes);

        Ok(PeerData {
            map,
            remote_port,
            remote_addr,
        })
    }

    #[cfg(test)]
    pub(crate) fn random<R: rand::Rng>(rng: &mut R) -> PeerData {
        let octets: [u8; 16] = rng.gen();
        PeerData {
            map: MapData::random(rng),
            remote_port: rng.gen(),
            remote_addr: octets.into(),
        }
    }
}

impl OpcodeData {
    /// Get the associated [`Opcode`].
    pub fn opcode(&self) -> Opcode {
        match self {
            OpcodeData::Announce => Opcode::Announce,
            OpcodeData::Map(_) => Opcode::Map,
            OpcodeData::Peer(_) => Opcode::Peer,
        }
    }

    /// Encode this [`OpcodeData`] into the buffer.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        match self {
            OpcodeData::Announce => {}
            OpcodeData::Map(map_data) => buf.extend_from_slice(&map_data.encode()?),
            OpcodeData::Peer(peer_data) => buf.extend_from_slice(&peer_data.encode()?),
        }
        Ok(())
    }

    /// Exact size this [`OpcodeData`] will occupy when encoded.
    pub const fn encoded_size(&self) -> usize {
        match self {
            OpcodeData::Announce => 0,
            OpcodeData::Map(_) => MapData::ENCODED_SIZE,
            OpcodeData::Peer(_) => PeerData::ENCODED_SIZE,
        }
    }

    /// Size of the [`OpcodeData`] implied by an [`Opcode`], or `None` for
    /// opcodes this client does not know the layout of.
    pub(super) const fn implied_size(opcode: Opcode) -> Option<usize> {
        match opcode {
            Opcode::Announce => Some(0),
            Opcode::Map => Some(MapData::ENCODED_SIZE),
            Opcode::Peer => Some(PeerData::ENCODED_SIZE),
            Opcode::Other(_) => None,
        }
    }

    /// Decode the [`OpcodeData`] expected for a given [`Opcode`].
    ///
    /// Unknown opcodes carry no decodable data and yield `None`.
    pub fn decode(opcode: Opcode, buf: &[u8]) -> Result<Option<Self>, InvalidOpcodeData> {
        match opcode {
            Opcode::Announce => Ok(Some(OpcodeData::Announce)),
            Opcode::Map => MapData::decode(buf).map(|data| Some(OpcodeData::Map(data))),
            Opcode::Peer => PeerData::decode(buf).map(|data| Some(OpcodeData::Peer(data))),
            Opcode::Other(_) => Ok(None),
        }
    }
}
