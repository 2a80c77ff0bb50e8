//! Fragment codec
//!
//! Fragment header format (5 bytes, big-endian):
//!
//! ```text
//! [flags: 1][seq: 2][total: 2][payload: up to MTU-5]
//! ```
//!
//! `flags` bit0 marks the first fragment of a packet, bit1 the last; a
//! single-fragment packet carries both. Middle fragments carry 0x00.

use thiserror::Error;

/// Header size in bytes: flags(1) + seq(2) + total(2)
pub const FRAGMENT_HEADER_SIZE: usize = 5;

/// Smallest ATT MTU a link can negotiate
pub const MIN_MTU: u16 = 23;

/// A packet may span at most this many fragments (16-bit sequence space)
pub const MAX_FRAGMENTS: usize = u16::MAX as usize;

/// First fragment of a packet
pub const FLAG_START: u8 = 0x01;
/// Last fragment of a packet
pub const FLAG_END: u8 = 0x02;

/// Errors for fragmentation and reassembly
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FragmentError {
    #[error("MTU {0} too small (min {MIN_MTU})")]
    MtuTooSmall(u16),

    #[error("Packet of {len} bytes needs {needed} fragments (max {MAX_FRAGMENTS})")]
    PacketTooLarge { len: usize, needed: usize },

    #[error("Inconsistent fragment: {0}")]
    FragmentInconsistent(String),

    #[error("Final fragment received with {received}/{total} slots filled")]
    ReassemblyGap { received: usize, total: usize },

    #[error("Reassembly buffer exceeded {limit} bytes")]
    ReassemblyOverflow { limit: usize },
}

/// One decoded on-wire fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub flags: u8,
    pub seq: u16,
    pub total: u16,
    pub payload: Vec<u8>,
}

impl Fragment {
    /// Whether this is the first fragment of a packet
    pub fn is_start(&self) -> bool {
        self.flags & FLAG_START != 0
    }

    /// Whether this is the last fragment of a packet
    pub fn is_end(&self) -> bool {
        self.flags & FLAG_END != 0
    }

    /// Serialize header + payload to wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(FRAGMENT_HEADER_SIZE + self.payload.len());
        bytes.push(self.flags);
        bytes.extend_from_slice(&self.seq.to_be_bytes());
        bytes.extend_from_slice(&self.total.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse wire bytes into a fragment, validating the header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FragmentError> {
        if bytes.len() < FRAGMENT_HEADER_SIZE {
            return Err(FragmentError::FragmentInconsistent(format!(
                "fragment too short: {} bytes (min {})",
                bytes.len(),
                FRAGMENT_HEADER_SIZE
            )));
        }

        let flags = bytes[0];
        if flags & !(FLAG_START | FLAG_END) != 0 {
            return Err(FragmentError::FragmentInconsistent(format!(
                "undefined flag bits 0x{:02x}",
                flags
            )));
        }

        let seq = u16::from_be_bytes([bytes[1], bytes[2]]);
        let total = u16::from_be_bytes([bytes[3], bytes[4]]);

        if total == 0 {
            return Err(FragmentError::FragmentInconsistent(
                "total fragment count is zero".to_string(),
            ));
        }
        if seq >= total {
            return Err(FragmentError::FragmentInconsistent(format!(
                "seq {} >= total {}",
                seq, total
            )));
        }

        Ok(Self {
            flags,
            seq,
            total,
            payload: bytes[FRAGMENT_HEADER_SIZE..].to_vec(),
        })
    }
}

/// Splits upper-stack packets into MTU-sized fragments.
///
/// One fragmenter exists per active peer, carrying the MTU negotiated for
/// that link.
#[derive(Debug, Clone)]
pub struct Fragmenter {
    mtu: u16,
    payload_size: usize,
}

impl Fragmenter {
    /// Create a fragmenter for a negotiated MTU
    pub fn new(mtu: u16) -> Result<Self, FragmentError> {
        if mtu < MIN_MTU {
            return Err(FragmentError::MtuTooSmall(mtu));
        }
        Ok(Self {
            mtu,
            payload_size: mtu as usize - FRAGMENT_HEADER_SIZE,
        })
    }

    /// The MTU this fragmenter was built for
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Payload bytes carried per fragment
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Split a packet into fragments.
    ///
    /// A zero-length packet yields exactly one fragment with both START and
    /// END set and an empty payload.
    pub fn fragment(&self, packet: &[u8]) -> Result<Vec<Fragment>, FragmentError> {
        if packet.is_empty() {
            return Ok(vec![Fragment {
                flags: FLAG_START | FLAG_END,
                seq: 0,
                total: 1,
                payload: Vec::new(),
            }]);
        }

        let total = (packet.len() + self.payload_size - 1) / self.payload_size;
        if total > MAX_FRAGMENTS {
            return Err(FragmentError::PacketTooLarge {
                len: packet.len(),
                needed: total,
            });
        }

        let fragments = packet
            .chunks(self.payload_size)
            .enumerate()
            .map(|(i, chunk)| {
                let mut flags = 0u8;
                if i == 0 {
                    flags |= FLAG_START;
                }
                if i == total - 1 {
                    flags |= FLAG_END;
                }
                Fragment {
                    flags,
                    seq: i as u16,
                    total: total as u16,
                    payload: chunk.to_vec(),
                }
            })
            .collect();

        Ok(fragments)
    }

    /// Split a packet and serialize each fragment to wire bytes
    pub fn fragment_to_wire(&self, packet: &[u8]) -> Result<Vec<Vec<u8>>, FragmentError> {
        Ok(self
            .fragment(packet)?
            .into_iter()
            .map(|f| f.to_bytes())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragmenter_rejects_small_mtu() {
        assert_eq!(Fragmenter::new(22).unwrap_err(), FragmentError::MtuTooSmall(22));
        assert!(Fragmenter::new(23).is_ok());
    }

    #[test]
    fn test_payload_size_is_mtu_minus_header() {
        let fragmenter = Fragmenter::new(23).expect("Valid MTU");
        assert_eq!(fragmenter.payload_size(), 18);

        let fragmenter = Fragmenter::new(185).expect("Valid MTU");
        assert_eq!(fragmenter.payload_size(), 180);
    }

    #[test]
    fn test_single_fragment_packet() {
        let fragmenter = Fragmenter::new(23).expect("Valid MTU");
        let fragments = fragmenter.fragment(&[0x41; 18]).expect("Fragmentation");

        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].flags, FLAG_START | FLAG_END);
        assert_eq!(fragments[0].seq, 0);
        assert_eq!(fragments[0].total, 1);
        assert_eq!(fragments[0].payload.len(), 18);
    }

    #[test]
    fn test_empty_packet_single_fragment() {
        let fragmenter = Fragmenter::new(23).expect("Valid MTU");
        let fragments = fragmenter.fragment(&[]).expect("Fragmentation");

        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].is_start());
        assert!(fragments[0].is_end());
        assert!(fragments[0].payload.is_empty());
    }

    #[test]
    fn test_233_bytes_at_mtu_23() {
        let fragmenter = Fragmenter::new(23).expect("Valid MTU");
        let packet = vec![0x41u8; 233];
        let fragments = fragmenter.fragment(&packet).expect("Fragmentation");

        assert_eq!(fragments.len(), 13);
        for (i, fragment) in fragments.iter().enumerate() {
            assert_eq!(fragment.seq, i as u16);
            assert_eq!(fragment.total, 13);
            let expected_len = if i == 12 { 17 } else { 18 };
            assert_eq!(fragment.payload.len(), expected_len);
        }
        assert!(fragments[0].is_start());
        assert!(!fragments[0].is_end());
        assert!(!fragments[6].is_start());
        assert!(!fragments[6].is_end());
        assert!(fragments[12].is_end());
        assert!(!fragments[12].is_start());
    }

    #[test]
    fn test_exact_multiple_of_payload_size() {
        let fragmenter = Fragmenter::new(23).expect("Valid MTU");
        let packet = vec![0xAAu8; 36]; // exactly 2 * 18
        let fragments = fragmenter.fragment(&packet).expect("Fragmentation");

        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[1].payload.len(), 18);
        assert!(fragments[1].is_end());
    }

    #[test]
    fn test_packet_too_large() {
        let fragmenter = Fragmenter::new(23).expect("Valid MTU");
        // 65536 fragments needed at 18 bytes per fragment
        let packet = vec![0u8; 18 * 65536];
        let result = fragmenter.fragment(&packet);

        assert!(matches!(
            result,
            Err(FragmentError::PacketTooLarge { needed: 65536, .. })
        ));
    }

    #[test]
    fn test_fragment_wire_roundtrip() {
        let fragment = Fragment {
            flags: FLAG_START,
            seq: 0,
            total: 3,
            payload: vec![0xDE, 0xAD],
        };
        let bytes = fragment.to_bytes();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(&bytes[1..5], &[0x00, 0x00, 0x00, 0x03]);

        let recovered = Fragment::from_bytes(&bytes).expect("Should parse");
        assert_eq!(recovered, fragment);
    }

    #[test]
    fn test_parse_literal_single_fragment() {
        // flags=START|END, seq=0, total=1, payload=DEADBEEF
        let wire = [0x03, 0x00, 0x00, 0x00, 0x01, 0xDE, 0xAD, 0xBE, 0xEF];
        let fragment = Fragment::from_bytes(&wire).expect("Should parse");

        assert!(fragment.is_start());
        assert!(fragment.is_end());
        assert_eq!(fragment.seq, 0);
        assert_eq!(fragment.total, 1);
        assert_eq!(fragment.payload, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_parse_rejects_short_fragment() {
        let result = Fragment::from_bytes(&[0x01, 0x00, 0x00]);
        assert!(matches!(result, Err(FragmentError::FragmentInconsistent(_))));
    }

    #[test]
    fn test_parse_rejects_undefined_flags() {
        let wire = [0x07, 0x00, 0x00, 0x00, 0x01];
        let result = Fragment::from_bytes(&wire);
        assert!(matches!(result, Err(FragmentError::FragmentInconsistent(_))));
    }

    #[test]
    fn test_parse_rejects_zero_total() {
        let wire = [0x01, 0x00, 0x00, 0x00, 0x00];
        let result = Fragment::from_bytes(&wire);
        assert!(matches!(result, Err(FragmentError::FragmentInconsistent(_))));
    }

    #[test]
    fn test_parse_rejects_seq_beyond_total() {
        let wire = [0x00, 0x00, 0x05, 0x00, 0x05];
        let result = Fragment::from_bytes(&wire);
        assert!(matches!(result, Err(FragmentError::FragmentInconsistent(_))));
    }

    #[test]
    fn test_empty_payload_fragment_parses() {
        let wire = [0x03, 0x00, 0x00, 0x00, 0x01];
        let fragment = Fragment::from_bytes(&wire).expect("Should parse");
        assert!(fragment.payload.is_empty());
    }
}
