//! Encoding and decoding of PCP options.
//!
//! Options trail the opcode-specific data of a message. Each one is a TLV
//! padded to a multiple of 4 octets. See
//! [RFC 6887 Options](https://datatracker.ietf.org/doc/html/rfc6887#section-7.3)

use num_enum::{FromPrimitive, IntoPrimitive};

use super::{padding, DecodeError};

/// Option code, per [RFC 6887 IANA Considerations](https://datatracker.ietf.org/doc/html/rfc6887#section-19).
///
/// Codes 5 and above belong to the authentication extensions; they are
/// parsed but never generated by this client.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive, derive_more::Display,
)]
#[repr(u8)]
pub enum OptionCode {
    /// Reserved. Has no function and is dropped when received.
    #[display("reserved")]
    Reserved = 0,
    #[display("third party")]
    ThirdParty = 1,
    #[display("prefer failure")]
    PreferFailure = 2,
    #[display("filter")]
    Filter = 3,
    #[display("nonce")]
    Nonce = 4,
    #[display("authentication tag")]
    AuthenticationTag = 5,
    #[display("pa authentication tag")]
    PaAuthenticationTag = 6,
    #[display("eap payload")]
    EapPayload = 7,
    #[display("prf")]
    Prf = 8,
    #[display("mac algorithm")]
    MacAlgorithm = 9,
    #[display("session lifetime")]
    SessionLifetime = 10,
    #[display("received pak")]
    ReceivedPak = 11,
    #[display("id indicator")]
    IdIndicator = 12,
    #[display("third party id")]
    ThirdPartyId = 13,
    /// An option code this client does not recognize, retained verbatim.
    #[num_enum(catch_all)]
    #[display("option {_0}")]
    Other(u8),
}

/// A single PCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcpOption {
    pub code: OptionCode,
    pub data: Vec<u8>,
}

impl PcpOption {
    /// Size of the option header: code, reserved octet and the data length.
    pub const HEADER_SIZE: usize = 4;

    /// Size of this option on the wire, including padding.
    pub fn encoded_size(&self) -> usize {
        Self::HEADER_SIZE + self.data.len() + padding(self.data.len())
    }

    /// Encode this option into the buffer, padded to a multiple of 4.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.code.into());
        // reserved
        buf.push(0);
        buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf.extend(std::iter::repeat(0).take(padding(self.data.len())));
    }

    /// Decode every option in `buf`, which must start at an option boundary.
    ///
    /// Reserved options are dropped. A declared length running past the end
    /// of the buffer is malformed; absent padding on the final option is
    /// tolerated.
    pub(super) fn decode_all(buf: &[u8]) -> Result<Vec<PcpOption>, DecodeError> {
        let mut options = Vec::new();
        let mut offset = 0;
        while offset < buf.len() {
            if buf.len() - offset < Self::HEADER_SIZE {
                return Err(DecodeError::Malformed);
            }
            let code = OptionCode::from(buf[offset]);
            // one reserved octet at offset + 1
            let len_bytes = buf[offset + 2..offset + 4]
                .try_into()
                .expect("slice has the right size");
            let len = u16::from_be_bytes(len_bytes) as usize;

            let data_start = offset + Self::HEADER_SIZE;
            let Some(data_end) = data_start.checked_add(len) else {
                return Err(DecodeError::Malformed);
            };
            if data_end > buf.len() {
                return Err(DecodeError::Malformed);
            }

            if code != OptionCode::Reserved {
                options.push(PcpOption {
                    code,
                    data: buf[data_start..data_end].to_vec(),
                });
            }

            offset = data_end + padding(len);
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_option_advances_by_its_header() {
        // two back to back zero-length options
        let buf = [1, 0, 0, 0, 3, 0, 0, 0];
        let options = PcpOption::decode_all(&buf).unwrap();
        assert_eq!(
            options,
            vec![
                PcpOption {
                    code: OptionCode::ThirdParty,
                    data: vec![]
                },
                PcpOption {
                    code: OptionCode::Filter,
                    data: vec![]
                },
            ]
        );
    }

    #[test]
    fn reserved_options_are_dropped() {
        let buf = [0, 0, 0, 0, 2, 0, 0, 0];
        let options = PcpOption::decode_all(&buf).unwrap();
        assert_eq!(
            options,
            vec![PcpOption {
                code: OptionCode::PreferFailure,
                data: vec![]
            }]
        );
    }

    #[test]
    fn option_data_is_padded() {
        let option = PcpOption {
            code: OptionCode::Filter,
            data: vec![0xAB; 5],
        };
        let mut buf = Vec::new();
        option.encode_into(&mut buf);
        assert_eq!(buf.len(), 12);
        assert_eq!(buf.len(), option.encoded_size());
        assert_eq!(&buf[..4], &[3, 0, 0, 5]);
        assert_eq!(&buf[9..], &[0, 0, 0]);

        // skipping the padding lands on the next option boundary
        let decoded = PcpOption::decode_all(&buf).unwrap();
        assert_eq!(decoded, vec![option]);
    }

    #[test]
    fn truncated_option_data_is_malformed() {
        // declares 8 octets of data but carries 2
        let buf = [1, 0, 0, 8, 0xAA, 0xBB];
        assert_eq!(PcpOption::decode_all(&buf), Err(DecodeError::Malformed));
    }

    #[test]
    fn higher_option_codes_are_parsed() {
        let buf = [200, 0, 0, 0];
        let options = PcpOption::decode_all(&buf).unwrap();
        assert_eq!(options[0].code, OptionCode::Other(200));
    }
}
