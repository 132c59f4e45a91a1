//! Minimal packet decode for the hunt matcher
//!
//! The full protocol decoder is an external collaborator; packet search
//! only needs the transport fingerprint (addresses and ports, to classify
//! direction) and the application payload slice. Ethernet and raw-IP link
//! layers cover capture deployments; anything else falls back to matching
//! the whole record.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Link-layer types from the pcap global header
pub const LINKTYPE_ETHERNET: u32 = 1;
pub const LINKTYPE_RAW: u32 = 101;

/// Transport fingerprint + payload location inside a packet record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Offset of the application payload within the record data
    pub payload_start: usize,
}

impl DecodedPacket {
    /// The application payload slice of `data`.
    pub fn payload<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.payload_start.min(data.len())..]
    }
}

/// Decode a record's transport headers. Returns None when the packet is
/// not IPv4/IPv6 TCP/UDP (the caller then matches the raw record bytes).
pub fn decode(link_type: u32, data: &[u8]) -> Option<DecodedPacket> {
    let (ip_start, ethertype) = match link_type {
        LINKTYPE_ETHERNET => {
            if data.len() < 14 {
                return None;
            }
            let ethertype = u16::from_be_bytes([data[12], data[13]]);
            (14, ethertype)
        }
        LINKTYPE_RAW => {
            let version = data.first()? >> 4;
            (0, if version == 6 { 0x86dd } else { 0x0800 })
        }
        _ => return None,
    };

    match ethertype {
        0x0800 => decode_ipv4(data, ip_start),
        0x86dd => decode_ipv6(data, ip_start),
        _ => None,
    }
}

fn decode_ipv4(data: &[u8], start: usize) -> Option<DecodedPacket> {
    let ip = data.get(start..)?;
    if ip.len() < 20 || ip[0] >> 4 != 4 {
        return None;
    }
    let ihl = ((ip[0] & 0x0f) as usize) * 4;
    if ihl < 20 || ip.len() < ihl {
        return None;
    }
    let proto = ip[9];
    let src = IpAddr::V4(Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]));
    let dst = IpAddr::V4(Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]));
    decode_transport(data, start + ihl, proto, src, dst)
}

fn decode_ipv6(data: &[u8], start: usize) -> Option<DecodedPacket> {
    let ip = data.get(start..)?;
    if ip.len() < 40 || ip[0] >> 4 != 6 {
        return None;
    }
    let proto = ip[6];
    let mut src_octets = [0u8; 16];
    src_octets.copy_from_slice(&ip[8..24]);
    let mut dst_octets = [0u8; 16];
    dst_octets.copy_from_slice(&ip[24..40]);
    let src = IpAddr::V6(Ipv6Addr::from(src_octets));
    let dst = IpAddr::V6(Ipv6Addr::from(dst_octets));
    // Extension headers are rare on captured flows; treat them as opaque
    decode_transport(data, start + 40, proto, src, dst)
}

fn decode_transport(
    data: &[u8],
    start: usize,
    proto: u8,
    src: IpAddr,
    dst: IpAddr,
) -> Option<DecodedPacket> {
    let transport = data.get(start..)?;
    match proto {
        // TCP: data offset field sizes the header
        6 => {
            if transport.len() < 20 {
                return None;
            }
            let header_len = ((transport[12] >> 4) as usize) * 4;
            if header_len < 20 || transport.len() < header_len {
                return None;
            }
            Some(DecodedPacket {
                src,
                dst,
                src_port: u16::from_be_bytes([transport[0], transport[1]]),
                dst_port: u16::from_be_bytes([transport[2], transport[3]]),
                payload_start: start + header_len,
            })
        }
        // UDP: fixed 8-byte header
        17 => {
            if transport.len() < 8 {
                return None;
            }
            Some(DecodedPacket {
                src,
                dst,
                src_port: u16::from_be_bytes([transport[0], transport[1]]),
                dst_port: u16::from_be_bytes([transport[2], transport[3]]),
                payload_start: start + 8,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    /// Build an Ethernet/IPv4/TCP packet with the given payload.
    pub fn tcp_packet(
        src: [u8; 4],
        sport: u16,
        dst: [u8; 4],
        dport: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut pkt = Vec::new();
        // Ethernet: dst mac, src mac, ethertype IPv4
        pkt.extend_from_slice(&[0u8; 12]);
        pkt.extend_from_slice(&0x0800u16.to_be_bytes());
        // IPv4 header, 20 bytes, no options
        let total_len = (20 + 20 + payload.len()) as u16;
        pkt.push(0x45);
        pkt.push(0);
        pkt.extend_from_slice(&total_len.to_be_bytes());
        pkt.extend_from_slice(&[0, 0, 0x40, 0]); // id, flags
        pkt.push(64); // ttl
        pkt.push(6); // tcp
        pkt.extend_from_slice(&[0, 0]); // checksum
        pkt.extend_from_slice(&src);
        pkt.extend_from_slice(&dst);
        // TCP header, 20 bytes
        pkt.extend_from_slice(&sport.to_be_bytes());
        pkt.extend_from_slice(&dport.to_be_bytes());
        pkt.extend_from_slice(&[0u8; 8]); // seq, ack
        pkt.push(0x50); // data offset 5
        pkt.push(0x18); // flags PSH|ACK
        pkt.extend_from_slice(&[0u8; 6]); // window, checksum, urg
        pkt.extend_from_slice(payload);
        pkt
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::tcp_packet;
    use super::*;

    #[test]
    fn test_decode_ethernet_ipv4_tcp() {
        let pkt = tcp_packet([10, 0, 0, 1], 49152, [10, 0, 0, 2], 80, b"GET / HTTP/1.1");
        let decoded = decode(LINKTYPE_ETHERNET, &pkt).unwrap();
        assert_eq!(decoded.src, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(decoded.dst, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(decoded.src_port, 49152);
        assert_eq!(decoded.dst_port, 80);
        assert_eq!(decoded.payload(&pkt), b"GET / HTTP/1.1");
    }

    #[test]
    fn test_decode_rejects_short_and_foreign_frames() {
        assert!(decode(LINKTYPE_ETHERNET, b"short").is_none());
        // ARP ethertype
        let mut arp = vec![0u8; 14];
        arp[12] = 0x08;
        arp[13] = 0x06;
        assert!(decode(LINKTYPE_ETHERNET, &arp).is_none());
        // Unknown link type
        assert!(decode(12345, &[0u8; 64]).is_none());
    }

    #[test]
    fn test_decode_raw_ipv4() {
        let full = tcp_packet([1, 1, 1, 1], 1234, [2, 2, 2, 2], 443, b"payload");
        let raw_ip = full[14..].to_vec();
        let decoded = decode(LINKTYPE_RAW, &raw_ip).unwrap();
        assert_eq!(decoded.dst_port, 443);
        assert_eq!(decoded.payload(&raw_ip), b"payload");
    }
}
