use super::{
    opcode_data::OpcodeData, options::PcpOption, DecodeError, Opcode, ResultCode, Version,
    MAX_PACKET_SIZE,
};

/// A PCP response or notification.
///
/// See [RFC 6887 Response Header](https://datatracker.ietf.org/doc/html/rfc6887#section-7.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Opcode this response answers. Retained even when unrecognized.
    pub opcode: Opcode,
    /// Result code of the operation. Non-success codes are retained
    /// verbatim; they never fail decoding.
    pub result_code: ResultCode,
    /// Lifetime in seconds that can be assumed by this response.
    ///
    /// For map and peer responses this is how long the mapping will last.
    pub lifetime_seconds: u32,
    /// Epoch time of the server, used to detect loss of server state.
    pub epoch_time: u32,
    /// Opcode-specific data. `None` when the opcode is unknown: the header
    /// is still parsed, the rest of the packet is opaque.
    pub data: Option<OpcodeData>,
    /// Options trailing the opcode data. Empty when the opcode is unknown,
    /// since the start of the options cannot be located.
    pub options: Vec<PcpOption>,
}

impl Response {
    /// Minimum size of an encoded [`Response`]: the common header.
    pub const HEADER_SIZE: usize = // parts
        1 + // version
        1 + // opcode ORd with [`Response::RESPONSE_INDICATOR`]
        1 + // reserved
        1 + // result code
        4 + // lifetime
        4 + // epoch time
        12; // reserved

    /// Indicator ORd into the opcode octet to mark a response packet.
    pub const RESPONSE_INDICATOR: u8 = 1u8 << 7;

    /// Decode a response.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < Self::HEADER_SIZE || buf.len() > MAX_PACKET_SIZE {
            return Err(DecodeError::Malformed);
        }

        let _version: Version = buf[0]
            .try_into()
            .map_err(|_| DecodeError::UnsupportedVersion)?;

        let opcode = buf[1];
        if opcode & Self::RESPONSE_INDICATOR != Self::RESPONSE_INDICATOR {
            return Err(DecodeError::WrongPacketType);
        }
        let opcode = Opcode::from(opcode & !Self::RESPONSE_INDICATOR);

        // buf[2] reserved

        let result_code = ResultCode::from(buf[3]);

        let lifetime_bytes = buf[4..8].try_into().expect("slice has the right len");
        let lifetime_seconds = u32::from_be_bytes(lifetime_bytes);

        let epoch_bytes = buf[8..12].try_into().expect("slice has the right len");
        let epoch_time = u32::from_be_bytes(epoch_bytes);

        // buf[12..24] reserved

        let (data, options) = match OpcodeData::implied_size(opcode) {
            Some(data_len) => {
                let data_end = Self::HEADER_SIZE + data_len;
                if data_end > buf.len() {
                    return Err(DecodeError::Malformed);
                }
                let data = OpcodeData::decode(opcode, &buf[Self::HEADER_SIZE..data_end])
                    .map_err(|_| DecodeError::Malformed)?;
                let options = PcpOption::decode_all(&buf[data_end..])?;
                (data, options)
            }
            // unknown opcode: header only, the rest of the packet is opaque
            None => (None, Vec::new()),
        };

        Ok(Response {
            opcode,
            result_code,
            lifetime_seconds,
            epoch_time,
            data,
            options,
        })
    }

    #[cfg(test)]
    pub(crate) fn encode(&self) -> Vec<u8> {
        use super::padding;

        let Response {
            opcode,
            result_code,
            lifetime_seconds,
            epoch_time,
            data,
            options,
        } = self;
        let mut buf = Vec::with_capacity(Self::HEADER_SIZE);
        // version
        buf.push(Version::Pcp.into());
        // response indicator and opcode
        buf.push(Self::RESPONSE_INDICATOR | u8::from(*opcode));
        // reserved
        buf.push(0);
        // result code
        buf.push((*result_code).into());
        // lifetime
        buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
        // epoch
        buf.extend_from_slice(&epoch_time.to_be_bytes());
        // reserved
        buf.extend_from_slice(&[0; 12]);
        if let Some(data) = data {
            data.encode_into(&mut buf).expect("valid opcode data");
        }
        for option in options {
            option.encode_into(&mut buf);
        }
        buf.extend(std::iter::repeat(0).take(padding(buf.len())));
        buf
    }
}
