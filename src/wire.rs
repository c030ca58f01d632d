//! Frame codec for the probe protocol.
//!
//! Two frame shapes travel on the wire, told apart by length alone. The
//! client sends 180-byte requests; the server answers with 18-byte
//! reflections carrying the client's public endpoint as the server saw it.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4};

/// Length of a client request frame.
pub const REQUEST_LEN: usize = 180;

/// Length of a server reflection frame.
pub const REFLECTION_LEN: usize = 18;

/// Request bit asking the server to reply from a different source IP.
pub const VARY_IP: u8 = 0b01;

/// Request bit asking the server to reply from a different source port.
pub const VARY_PORT: u8 = 0b10;

/// Builds a request frame. Byte 0 carries the vary flags; the rest of the
/// frame is padding.
pub fn request(flags: u8) -> [u8; REQUEST_LEN] {
    let mut frame = [0u8; REQUEST_LEN];
    frame[0] = flags;
    frame
}

/// Extracts the vary flags from a request frame, as (vary_ip, vary_port).
/// Frames of any other length are not requests and yield `None`.
pub fn request_flags(frame: &[u8]) -> Option<(bool, bool)> {
    if frame.len() != REQUEST_LEN {
        return None;
    }
    Some((frame[0] & VARY_IP != 0, frame[0] & VARY_PORT != 0))
}

/// Encodes a reflection frame: the observed client address in 16-byte
/// IPv6-mapped form, followed by the observed port, big-endian.
pub fn reflection(observed: SocketAddrV4) -> [u8; REFLECTION_LEN] {
    let mut frame = [0u8; REFLECTION_LEN];
    frame[..16].copy_from_slice(&observed.ip().to_ipv6_mapped().octets());
    frame[16..].copy_from_slice(&observed.port().to_be_bytes());
    frame
}

/// Decodes a reflection frame back into the observed endpoint. Frames of
/// the wrong length, or whose address is not a 4-in-6 mapped IPv4, are
/// ignored.
pub fn decode_reflection(frame: &[u8]) -> Option<SocketAddrV4> {
    if frame.len() != REFLECTION_LEN {
        return None;
    }
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&frame[..16]);
    let ip: Ipv4Addr = Ipv6Addr::from(octets).to_ipv4_mapped()?;
    let port = u16::from_be_bytes([frame[16], frame[17]]);
    Some(SocketAddrV4::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reflection_round_trip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 61234);
        let frame = reflection(addr);
        assert_eq!(frame.len(), REFLECTION_LEN);
        assert_eq!(decode_reflection(&frame), Some(addr));
    }

    #[test]
    fn reflection_decodes_mapped_v4() {
        // ::ffff:198.51.100.9, port 443
        let mut frame = [0u8; REFLECTION_LEN];
        frame[10] = 0xff;
        frame[11] = 0xff;
        frame[12..16].copy_from_slice(&[198, 51, 100, 9]);
        frame[16..].copy_from_slice(&443u16.to_be_bytes());
        assert_eq!(
            decode_reflection(&frame),
            Some(SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 9), 443))
        );
    }

    #[test]
    fn reflection_rejects_bad_length_and_plain_v6() {
        assert_eq!(decode_reflection(&[0u8; 17]), None);
        assert_eq!(decode_reflection(&[0u8; 19]), None);
        assert_eq!(decode_reflection(&[]), None);

        // A genuine IPv6 address is not a reflection we can use.
        let v6: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let mut frame = [0u8; REFLECTION_LEN];
        frame[..16].copy_from_slice(&v6.octets());
        assert_eq!(decode_reflection(&frame), None);
    }

    #[test]
    fn request_carries_flags() {
        assert_eq!(request_flags(&request(0)), Some((false, false)));
        assert_eq!(request_flags(&request(VARY_IP)), Some((true, false)));
        assert_eq!(request_flags(&request(VARY_PORT)), Some((false, true)));
        assert_eq!(request_flags(&request(VARY_IP | VARY_PORT)), Some((true, true)));
        assert_eq!(request_flags(&[0u8; 20]), None);
    }
}
