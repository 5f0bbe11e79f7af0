use anyhow::bail;
use bytes::{Buf, BufMut};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl TransportVersion {
    pub const CURRENT: TransportVersion = TransportVersion { major: 1, minor: 0, patch: 0 };
}

/// The payload of RESET and RESET-ACK packets.
///
/// ```ascii
/// 0: major version (u8)
/// 1: minor version (u8)
/// 2: patch version (u8)
/// 3: reserved (3 bytes), must be 0
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResetConfiguration {
    pub version: TransportVersion,
}

impl ResetConfiguration {
    pub const SERIALIZED_LEN: usize = 6;

    pub fn new(version: TransportVersion) -> ResetConfiguration {
        ResetConfiguration { version }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.version.major);
        buf.put_u8(self.version.minor);
        buf.put_u8(self.version.patch);
        buf.put_bytes(0, 3);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(Self::SERIALIZED_LEN);
        self.ser(&mut result);
        result
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ResetConfiguration> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("buffer underflow: reset configuration requires {} bytes, {} available", Self::SERIALIZED_LEN, buf.remaining());
        }

        let version = TransportVersion {
            major: buf.get_u8(),
            minor: buf.get_u8(),
            patch: buf.get_u8(),
        };
        for _ in 0..3 {
            if buf.get_u8() != 0 {
                bail!("reserved bytes of reset configuration must be 0");
            }
        }
        Ok(ResetConfiguration { version })
    }

    /// The peer's version is not enforced: a mismatch is only logged.
    pub fn check_peer(payload: &[u8], own_version: TransportVersion) {
        let mut buf = payload;
        match ResetConfiguration::deser(&mut buf) {
            Ok(peer) if peer.version.major != own_version.major => {
                warn!("peer transport version {:?} differs from own version {:?}", peer.version, own_version);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("invalid reset configuration from peer: {}", e);
            }
        }
    }
}
