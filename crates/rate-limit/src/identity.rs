//! Caller identity.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
};

/// User id of callers without a valid API key.
pub const UNAUTHENTICATED: i64 = -1;

/// Who is making a request. Resolved once per request and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Owner of the API key, or [`UNAUTHENTICATED`].
    pub user_id: i64,
    /// The presented key if valid, otherwise the pseudo-key `ip:<ip>`.
    pub api_key: String,
    /// Normalized client address.
    pub ip: IpAddr,
    /// Whether the presented key maps to a user.
    pub is_valid_key: bool,
}

impl Identity {
    /// An authenticated caller.
    pub fn authenticated(user_id: i64, api_key: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            user_id,
            api_key: api_key.into(),
            ip: normalize_ip(ip),
            is_valid_key: true,
        }
    }

    /// A caller counted by address. Unknown keys are not recorded.
    pub fn anonymous(ip: IpAddr) -> Self {
        let ip = normalize_ip(ip);

        Self {
            user_id: UNAUTHENTICATED,
            api_key: pseudo_key(ip),
            ip,
            is_valid_key: false,
        }
    }

    /// The namespace counters of this caller live in.
    pub fn subject(&self) -> Subject {
        if self.is_valid_key {
            Subject::User(self.user_id)
        } else {
            Subject::Ip(self.ip)
        }
    }
}

/// Counter namespace. Users and addresses never share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    /// Authenticated user.
    User(i64),
    /// Unauthenticated address.
    Ip(IpAddr),
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::User(id) => write!(f, "u:{id}"),
            Subject::Ip(ip) => write!(f, "ip:{ip}"),
        }
    }
}

/// Pseudo API key used in usage statistics for unauthenticated callers.
pub fn pseudo_key(ip: IpAddr) -> String {
    format!("ip:{ip}")
}

/// Maps loopback IPv6 and IPv4-mapped IPv6 addresses to their IPv4 form.
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) if v6.is_loopback() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        IpAddr::V4(_) => ip,
    }
}

/// Parses the value of a client address header. In a comma-separated chain the last
/// entry is the one added by the closest proxy and wins.
pub fn parse_forwarded(value: &str) -> Option<IpAddr> {
    let last = value.rsplit(',').map(str::trim).find(|part| !part.is_empty())?;

    last.parse::<IpAddr>().ok().map(normalize_ip)
}
