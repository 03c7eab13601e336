use std::io::{Result, Error, ErrorKind};
use std::net::{ToSocketAddrs, IpAddr};

/// Resolve a hostname or dotted-quad string to an IPv4 address.
pub fn resolve_dest(dest: &str) -> Result<IpAddr> {
    match format!("{}:0", dest).to_socket_addrs() {
        Ok(mut addrs) => {
            if let Some(addr) = addrs.find(|a| a.ip().is_ipv4()) {
                Ok(addr.ip())
            } else {
                Err(Error::new(ErrorKind::NotConnected, "no IPv4 address found"))
            }
        }

        Err(e) => Err(e)
    }
}

/// Internet checksum (one's complement 16-bit sum-and-fold) over an
/// arbitrary byte span. Words are treated as big endian; an odd trailing
/// byte is added as a zero-padded word. Total over any input length;
/// empty input yields 0xFFFF.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = data.chunks(2)
        .map(|word| match *word {
            [b] => b as u32,
            [wh, wl] => u16::from_be_bytes([wh, wl]) as u32,
            _ => unreachable!(),
        })
        .fold(0, u32::wrapping_add);

    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xFFFF);
    }

    !sum as u16 // The checksum field should be the ones complement of the sum
}

/// Compute the checksum of an ICMP message and store it big-endian in the
/// checksum field (bytes 2..4). The field is zeroed first, so calling this
/// on a buffer carrying a stale checksum is fine.
pub fn write_checksum(data: &mut [u8]) {
    data[2] = 0;
    data[3] = 0;
    let sum = checksum(data);
    data[2..4].copy_from_slice(&sum.to_be_bytes());
}
