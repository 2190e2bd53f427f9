/// Wire framing shared by both directions of the control pipe: a 1-byte
/// opcode followed by a little-endian `u32` payload length, followed by
/// that many payload bytes.
pub const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub opcode: u8,
    pub payload_size: u32,
}

/// Peek at the header of the frame at the start of `buf`, if a full header
/// is present. Does not require the full payload to have arrived yet.
pub fn peek_header(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let opcode = buf[0];
    let payload_size = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
    Some(FrameHeader {
        opcode,
        payload_size,
    })
}

/// Whether `buf` holds a complete frame (header + full payload) for the
/// header at its start.
pub fn has_complete_frame(buf: &[u8], header: &FrameHeader) -> bool {
    buf.len() >= HEADER_LEN + header.payload_size as usize
}

/// Encode a reply/command frame: `opcode || len(payload) as LE u32 || payload`.
pub fn encode_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(opcode);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_header_requires_full_header() {
        assert!(peek_header(&[0u8; 4]).is_none());
        let header = peek_header(&[2, 5, 0, 0, 0]).unwrap();
        assert_eq!(header.opcode, 2);
        assert_eq!(header.payload_size, 5);
    }

    #[test]
    fn has_complete_frame_respects_payload_size() {
        let header = FrameHeader {
            opcode: 0,
            payload_size: 3,
        };
        assert!(!has_complete_frame(&[0; 6], &header));
        assert!(has_complete_frame(&[0; 8], &header));
    }

    #[test]
    fn encode_frame_round_trips_through_peek_header() {
        let payload = vec![1, 2, 3, 4];
        let frame = encode_frame(7, &payload);
        let header = peek_header(&frame).unwrap();
        assert_eq!(header.opcode, 7);
        assert_eq!(header.payload_size as usize, payload.len());
        assert!(has_complete_frame(&frame, &header));
        assert_eq!(&frame[HEADER_LEN..], &payload[..]);
    }

    #[test]
    fn byte_by_byte_feeding_yields_same_header_as_whole() {
        let frame = encode_frame(1, &[9, 9, 9]);
        let mut buf = Vec::new();
        let mut header = None;
        for &b in &frame {
            buf.push(b);
            header = peek_header(&buf);
        }
        let header = header.unwrap();
        assert!(has_complete_frame(&buf, &header));
    }
}
