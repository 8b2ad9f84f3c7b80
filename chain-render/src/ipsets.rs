use chain_render_common::IpVersion;

/// Longest IP set name the kernel accepts.
pub const MAX_IP_SET_NAME_LENGTH: usize = 31;

/// Turns IP set IDs into the names the dataplane created them under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSetNamer {
    prefix: String,
}

impl IpSetNamer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// `<prefix><4|6>0<id>`, cut to [MAX_IP_SET_NAME_LENGTH].
    pub fn name_for(&self, id: &str, ip_version: IpVersion) -> String {
        let mut name = format!("{}{}0{}", self.prefix, ip_version, id);
        name.truncate(MAX_IP_SET_NAME_LENGTH);
        name
    }
}
