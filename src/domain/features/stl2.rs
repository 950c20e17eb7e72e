//! STL2 framing used by the extended configuration characteristic.
//!
//! Each packet is one write/notification of `packet_size` bytes at most:
//!
//! ```text
//! 0x20 [u16 BE len][data]        start and end
//! 0x00 [u16 BE len][data]        start, packet_size - 3 data bytes
//! 0x40 [data]                    middle, packet_size - 1 data bytes
//! 0x80 [data]                    end, remainder
//! ```

pub const START_PACKET: u8 = 0x00;
pub const START_END_PACKET: u8 = 0x20;
pub const MIDDLE_PACKET: u8 = 0x40;
pub const END_PACKET: u8 = 0x80;

/// Packet size the boards use when nothing else was negotiated.
pub const DEFAULT_PACKET_SIZE: usize = 20;

/// Frames `data` into consecutive packets of at most `packet_size` bytes.
pub fn encapsulate(data: &[u8], packet_size: usize) -> Vec<u8> {
    let packet_size = packet_size.max(4);
    let len = (data.len().min(u16::MAX as usize) as u16).to_be_bytes();
    let data = &data[..data.len().min(u16::MAX as usize)];
    let mut out = Vec::with_capacity(data.len() + data.len() / (packet_size - 1) + 3);

    if data.len() <= packet_size - 3 {
        out.push(START_END_PACKET);
        out.extend_from_slice(&len);
        out.extend_from_slice(data);
        return out;
    }

    out.push(START_PACKET);
    out.extend_from_slice(&len);
    out.extend_from_slice(&data[..packet_size - 3]);
    let mut rest = &data[packet_size - 3..];

    while rest.len() > packet_size - 1 {
        out.push(MIDDLE_PACKET);
        out.extend_from_slice(&rest[..packet_size - 1]);
        rest = &rest[packet_size - 1..];
    }
    out.push(END_PACKET);
    out.extend_from_slice(rest);
    out
}

/// Collects framed notifications until a full message is available.
#[derive(Debug, Default)]
pub struct Stl2Reassembler {
    message: Option<Vec<u8>>,
    expected: usize,
    packets: usize,
}

impl Stl2Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of packets seen for the message in progress (or the last one).
    pub fn packets(&self) -> usize {
        self.packets
    }

    /// Feeds one packet; returns the message once its last packet arrives.
    pub fn push(&mut self, packet: &[u8]) -> Option<Vec<u8>> {
        let (&header, body) = packet.split_first()?;
        match header {
            START_END_PACKET => {
                self.packets = 1;
                self.message = None;
                let (expected, data) = split_length(body)?;
                Some(data[..data.len().min(expected)].to_vec())
            }
            START_PACKET => {
                let (expected, data) = split_length(body)?;
                self.packets = 1;
                self.expected = expected;
                self.message = Some(data.to_vec());
                None
            }
            MIDDLE_PACKET => {
                self.message.as_mut()?.extend_from_slice(body);
                self.packets += 1;
                None
            }
            END_PACKET => {
                let mut message = self.message.take()?;
                message.extend_from_slice(body);
                self.packets += 1;
                if message.len() > self.expected {
                    message.truncate(self.expected);
                }
                Some(message)
            }
            _ => None,
        }
    }
}

fn split_length(body: &[u8]) -> Option<(usize, &[u8])> {
    if body.len() < 2 {
        return None;
    }
    let expected = u16::from_be_bytes([body[0], body[1]]) as usize;
    Some((expected, &body[2..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_message_is_single_packet() {
        let framed = encapsulate(b"abc", 20);
        assert_eq!(framed, vec![0x20, 0x00, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn test_long_message_layout() {
        let data: Vec<u8> = (0..40).collect();
        let framed = encapsulate(&data, 20);
        // start: 1 + 2 + 17, middle: 1 + 19, end: 1 + 4
        assert_eq!(framed.len(), 20 + 20 + 5);
        assert_eq!(framed[0], START_PACKET);
        assert_eq!(&framed[1..3], &[0x00, 40]);
        assert_eq!(framed[20], MIDDLE_PACKET);
        assert_eq!(framed[40], END_PACKET);
    }

    #[test]
    fn test_reassemble_packets() {
        let data: Vec<u8> = (0..40).collect();
        let framed = encapsulate(&data, 20);
        let mut reassembler = Stl2Reassembler::new();
        let mut result = None;
        for packet in framed.chunks(20) {
            result = reassembler.push(packet);
        }
        assert_eq!(result, Some(data));
        assert_eq!(reassembler.packets(), 3);
    }

    #[test]
    fn test_end_without_start_is_ignored() {
        let mut reassembler = Stl2Reassembler::new();
        assert_eq!(reassembler.push(&[END_PACKET, 1, 2]), None);
        assert_eq!(reassembler.push(&[MIDDLE_PACKET, 1, 2]), None);
        assert_eq!(reassembler.push(&[]), None);
    }
}
