//! Datagram parsing and ack encoding for the netdump wire protocol.
//!
//! Every datagram starts with a fixed 20-byte header in network byte order:
//! `type:u32, sequence:u32, length:u32, offset:u64`, followed by `length`
//! payload bytes. Header fields are extracted explicitly; the length check
//! runs before any declared field is acted on.

use thiserror::Error;

/// UDP port the herald listener binds to.
pub const NETDUMP_PORT: u16 = 20023;

/// Fixed wire header size in bytes.
pub const HEADER_LEN: usize = 20;

/// Largest payload a single datagram may carry; sized to fit a standard MTU.
pub const MAX_PAYLOAD: usize = 1456;

/// Largest well-formed datagram.
pub const MAX_DATAGRAM: usize = HEADER_LEN + MAX_PAYLOAD;

/// Serialized size of the kernel dump header carried in a KDH payload.
pub const KDH_LEN: usize = 488;

const TYPE_HERALD: u32 = 1;
const TYPE_KDH: u32 = 2;
const TYPE_VMCORE: u32 = 3;
const TYPE_FINISHED: u32 = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("runt datagram: {0} bytes")]
    Runt(usize),

    #[error("length mismatch: header declares {declared} payload bytes, received {actual}")]
    LengthMismatch { declared: u32, actual: usize },

    #[error("declared payload length {0} exceeds maximum")]
    Oversize(u32),

    #[error("unknown datagram type {0}")]
    UnknownType(u32),

    #[error("kernel dump header too short: {0} bytes")]
    ShortKdh(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Herald,
    Kdh,
    VmCore,
    Finished,
}

impl MsgType {
    fn from_wire(value: u32) -> Option<Self> {
        match value {
            TYPE_HERALD => Some(MsgType::Herald),
            TYPE_KDH => Some(MsgType::Kdh),
            TYPE_VMCORE => Some(MsgType::VmCore),
            TYPE_FINISHED => Some(MsgType::Finished),
            _ => None,
        }
    }
}

/// A parsed datagram borrowing its payload from the receive buffer.
#[derive(Debug)]
pub struct Datagram<'a> {
    pub kind: MsgType,
    pub sequence: u32,
    pub offset: u64,
    pub payload: &'a [u8],
}

/// Parse and validate one received datagram.
pub fn parse(bytes: &[u8]) -> Result<Datagram<'_>, WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::Runt(bytes.len()));
    }
    let kind_raw = be32(bytes, 0);
    let sequence = be32(bytes, 4);
    let length = be32(bytes, 8);
    let offset = be64(bytes, 12);

    if length as usize > MAX_PAYLOAD {
        return Err(WireError::Oversize(length));
    }
    let actual = bytes.len() - HEADER_LEN;
    if actual != length as usize {
        return Err(WireError::LengthMismatch { declared: length, actual });
    }
    let kind = MsgType::from_wire(kind_raw).ok_or(WireError::UnknownType(kind_raw))?;

    Ok(Datagram { kind, sequence, offset, payload: &bytes[HEADER_LEN..] })
}

/// Encode the four-byte acknowledgement frame for `sequence`.
pub fn encode_ack(sequence: u32) -> [u8; 4] {
    sequence.to_be_bytes()
}

/// Metadata block describing the dumping kernel, carried in the first KDH
/// payload. Integers are big-endian; string fields are fixed-width and
/// NUL-padded.
#[derive(Debug, Clone)]
pub struct KernelDumpHeader {
    pub architecture: String,
    pub architecture_version: u32,
    pub dump_length: u64,
    pub dump_time: u64,
    pub block_size: u32,
    pub hostname: String,
    pub version_string: String,
    pub panic_string: String,
    /// XOR parity over the whole header; advisory only.
    pub parity_ok: bool,
}

impl KernelDumpHeader {
    pub fn parse(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < KDH_LEN {
            return Err(WireError::ShortKdh(payload.len()));
        }
        let header = &payload[..KDH_LEN];
        Ok(KernelDumpHeader {
            architecture: string_field(&header[0..12]),
            architecture_version: be32(header, 12),
            dump_length: be64(header, 16),
            dump_time: be64(header, 24),
            block_size: be32(header, 32),
            hostname: string_field(&header[36..100]),
            version_string: string_field(&header[100..292]),
            panic_string: string_field(&header[292..484]),
            parity_ok: parity(header) == 0,
        })
    }
}

/// Truncate a fixed-width field at its first NUL; a field with no NUL ends
/// at its declared width.
fn string_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn parity(header: &[u8]) -> u32 {
    header.chunks_exact(4).fold(0u32, |acc, word| acc ^ be32(word, 0))
}

fn be32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn be64(bytes: &[u8], at: usize) -> u64 {
    u64::from_be_bytes([
        bytes[at],
        bytes[at + 1],
        bytes[at + 2],
        bytes[at + 3],
        bytes[at + 4],
        bytes[at + 5],
        bytes[at + 6],
        bytes[at + 7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(kind: u32, sequence: u32, offset: u64, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(&kind.to_be_bytes());
        bytes.extend_from_slice(&sequence.to_be_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&offset.to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    fn kdh_bytes(arch: &str, hostname: &str, panic: &str, dump_length: u64) -> Vec<u8> {
        let mut bytes = vec![0u8; KDH_LEN];
        bytes[0..arch.len()].copy_from_slice(arch.as_bytes());
        bytes[12..16].copy_from_slice(&2u32.to_be_bytes());
        bytes[16..24].copy_from_slice(&dump_length.to_be_bytes());
        bytes[24..32].copy_from_slice(&1_700_000_000u64.to_be_bytes());
        bytes[32..36].copy_from_slice(&512u32.to_be_bytes());
        bytes[36..36 + hostname.len()].copy_from_slice(hostname.as_bytes());
        bytes[100..106].copy_from_slice(b"TestOS");
        bytes[292..292 + panic.len()].copy_from_slice(panic.as_bytes());
        let parity = parity(&bytes);
        bytes[484..488].copy_from_slice(&parity.to_be_bytes());
        bytes
    }

    #[test]
    fn parses_vmcore_datagram() {
        let payload = vec![0xAA; 64];
        let bytes = datagram(TYPE_VMCORE, 7, 4096, &payload);
        let parsed = parse(&bytes).expect("well-formed datagram");
        assert_eq!(parsed.kind, MsgType::VmCore);
        assert_eq!(parsed.sequence, 7);
        assert_eq!(parsed.offset, 4096);
        assert_eq!(parsed.payload, &payload[..]);
    }

    #[test]
    fn parses_empty_payload_types() {
        for (raw, kind) in [(TYPE_HERALD, MsgType::Herald), (TYPE_FINISHED, MsgType::Finished)] {
            let bytes = datagram(raw, 1, 0, &[]);
            let parsed = parse(&bytes).expect("well-formed datagram");
            assert_eq!(parsed.kind, kind);
            assert!(parsed.payload.is_empty());
        }
    }

    #[test]
    fn rejects_runt() {
        let bytes = datagram(TYPE_HERALD, 1, 0, &[]);
        assert!(matches!(parse(&bytes[..HEADER_LEN - 1]), Err(WireError::Runt(n)) if n == HEADER_LEN - 1));
        assert!(matches!(parse(&[]), Err(WireError::Runt(0))));
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut bytes = datagram(TYPE_VMCORE, 1, 0, &[0u8; 16]);
        bytes[8..12].copy_from_slice(&32u32.to_be_bytes());
        assert!(matches!(
            parse(&bytes),
            Err(WireError::LengthMismatch { declared: 32, actual: 16 })
        ));
    }

    #[test]
    fn rejects_oversize_declared_length() {
        let mut bytes = datagram(TYPE_VMCORE, 1, 0, &[0u8; 8]);
        bytes[8..12].copy_from_slice(&(MAX_PAYLOAD as u32 + 1).to_be_bytes());
        assert!(matches!(parse(&bytes), Err(WireError::Oversize(_))));
    }

    #[test]
    fn rejects_unknown_type() {
        let bytes = datagram(99, 1, 0, &[]);
        assert!(matches!(parse(&bytes), Err(WireError::UnknownType(99))));
    }

    #[test]
    fn max_payload_accepted() {
        let payload = vec![0x55; MAX_PAYLOAD];
        let bytes = datagram(TYPE_VMCORE, 3, 0, &payload);
        let parsed = parse(&bytes).expect("full datagram");
        assert_eq!(parsed.payload.len(), MAX_PAYLOAD);
        assert_eq!(parsed.offset, 0);
    }

    #[test]
    fn ack_is_big_endian_sequence() {
        assert_eq!(encode_ack(0x0102_0304), [1, 2, 3, 4]);
    }

    #[test]
    fn parses_kernel_dump_header() {
        let bytes = kdh_bytes("amd64", "nodeA", "test panic", 4096);
        let kdh = KernelDumpHeader::parse(&bytes).expect("well-formed KDH");
        assert_eq!(kdh.architecture, "amd64");
        assert_eq!(kdh.architecture_version, 2);
        assert_eq!(kdh.dump_length, 4096);
        assert_eq!(kdh.block_size, 512);
        assert_eq!(kdh.hostname, "nodeA");
        assert_eq!(kdh.version_string, "TestOS");
        assert_eq!(kdh.panic_string, "test panic");
        assert!(kdh.parity_ok);
    }

    #[test]
    fn unterminated_string_stops_at_field_width() {
        let mut bytes = kdh_bytes("amd64", "nodeA", "p", 0);
        for b in bytes[0..12].iter_mut() {
            *b = b'x';
        }
        let kdh = KernelDumpHeader::parse(&bytes).expect("parseable KDH");
        assert_eq!(kdh.architecture.len(), 12);
        assert_eq!(kdh.architecture, "xxxxxxxxxxxx");
    }

    #[test]
    fn parity_mismatch_is_reported_not_fatal() {
        let mut bytes = kdh_bytes("amd64", "nodeA", "p", 0);
        bytes[484] ^= 0xFF;
        let kdh = KernelDumpHeader::parse(&bytes).expect("parseable KDH");
        assert!(!kdh.parity_ok);
        assert_eq!(kdh.hostname, "nodeA");
    }

    #[test]
    fn short_kdh_rejected() {
        let bytes = kdh_bytes("amd64", "nodeA", "p", 0);
        assert!(matches!(
            KernelDumpHeader::parse(&bytes[..KDH_LEN - 1]),
            Err(WireError::ShortKdh(_))
        ));
    }

    #[test]
    fn trailing_bytes_after_kdh_ignored() {
        let mut bytes = kdh_bytes("arm64", "h", "p", 0);
        bytes.extend_from_slice(&[0xFF; 8]);
        let kdh = KernelDumpHeader::parse(&bytes).expect("parseable KDH");
        assert_eq!(kdh.architecture, "arm64");
        assert!(kdh.parity_ok);
    }
}
