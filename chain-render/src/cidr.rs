
use std::net::IpAddr;

use chain_render_common::IpVersion;
use ipnet::IpNet;

use crate::Result;

/// Family of an address-like value.
pub(crate) trait IpFamily {
    fn ip_version(&self) -> IpVersion;

    fn is_version(&self, ip_version: IpVersion) -> bool {
        self.ip_version() == ip_version
    }
}

impl IpFamily for IpNet {
    fn ip_version(&self) -> IpVersion {
        match self {
            IpNet::V4(_) => IpVersion::V4,
            IpNet::V6(_) => IpVersion::V6,
        }
    }
}

impl IpFamily for IpAddr {
    fn ip_version(&self) -> IpVersion {
        match self {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }
}

/// Parses either a CIDR or a bare address, which becomes a full-length prefix.
///
/// Host bits of a CIDR are cleared, so `10.0.0.1/8` becomes `10.0.0.0/8`.
pub(crate) fn parse_cidr_or_ip(s: &str) -> Result<IpNet> {
    match s.parse::<IpAddr>() {
        Ok(addr) => Ok(IpNet::from(addr)),
        Err(_) => Ok(s.parse::<IpNet>()?.trunc()),
    }
}
