use std::fmt::{Debug, Display, Formatter};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use rand::RngCore;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PeerAddrType {
    Public = 0,
    Random = 1,
}

/// A radio device address. The bytes are stored in over-the-air order, i.e. least significant
///  byte first, and formatted most significant byte first.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerAddr {
    pub addr_type: PeerAddrType,
    pub bytes: [u8; 6],
}

impl PeerAddr {
    pub fn new(addr_type: PeerAddrType, bytes: [u8; 6]) -> PeerAddr {
        PeerAddr { addr_type, bytes }
    }

    /// a fresh static random address: the two most significant bits are set
    pub fn random_static() -> PeerAddr {
        let mut bytes = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[5] |= 0xc0;
        PeerAddr::new(PeerAddrType::Random, bytes)
    }
}

impl Display for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let b = &self.bytes;
        let kind = match self.addr_type {
            PeerAddrType::Public => "public",
            PeerAddrType::Random => "random",
        };
        write!(f, "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X} ({})", b[5], b[4], b[3], b[2], b[1], b[0], kind)
    }
}

impl Debug for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::public(PeerAddrType::Public, [0x06, 0x05, 0x04, 0x03, 0x02, 0x01], "01:02:03:04:05:06 (public)")]
    #[case::random(PeerAddrType::Random, [0xff, 0x00, 0xab, 0x10, 0x20, 0xc3], "C3:20:10:AB:00:FF (random)")]
    fn test_display(#[case] addr_type: PeerAddrType, #[case] bytes: [u8; 6], #[case] expected: &str) {
        assert_eq!(PeerAddr::new(addr_type, bytes).to_string(), expected);
    }

    #[test]
    fn test_random_static() {
        for _ in 0..16 {
            let addr = PeerAddr::random_static();
            assert_eq!(addr.addr_type, PeerAddrType::Random);
            assert_eq!(addr.bytes[5] & 0xc0, 0xc0);
        }
    }

    #[rstest]
    #[case(0, Some(PeerAddrType::Public))]
    #[case(1, Some(PeerAddrType::Random))]
    #[case(2, None)]
    fn test_addr_type_from_raw(#[case] raw: u8, #[case] expected: Option<PeerAddrType>) {
        assert_eq!(PeerAddrType::try_from(raw).ok(), expected);
    }
}
