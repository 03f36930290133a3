//! Admission policy: decide whether a client's source host may open a
//! connection at all, before any protocol bytes are read.
//!
//! Frozen at startup and never mutated, so it needs no lock — matching the
//! design notes' explicit carve-out for read-only-after-startup data.

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::Deserialize;

/// The two accepted shapes of the allow-list configuration file.
#[derive(Debug, Clone)]
pub enum AdmissionPolicy {
    ExactHosts(HashSet<String>),
    Cidr { ipv4: Vec<IpNet>, ipv6: Vec<IpNet> },
}

impl AdmissionPolicy {
    pub fn allows(&self, addr: IpAddr) -> bool {
        match self {
            AdmissionPolicy::ExactHosts(hosts) => hosts.contains(&addr.to_string()),
            AdmissionPolicy::Cidr { ipv4, ipv6 } => match addr {
                IpAddr::V4(_) => ipv4.iter().any(|net| net.contains(&addr)),
                IpAddr::V6(_) => ipv6.iter().any(|net| net.contains(&addr)),
            },
        }
    }

    pub fn from_config(cfg: &AllowListConfig) -> Self {
        match cfg {
            AllowListConfig::ExactHosts { allowed_ips } => {
                AdmissionPolicy::ExactHosts(allowed_ips.iter().cloned().collect())
            }
            AllowListConfig::Cidr { acl, .. } => AdmissionPolicy::Cidr {
                ipv4: acl.ipv4.iter().filter_map(|s| s.parse().ok()).collect(),
                ipv6: acl.ipv6.iter().filter_map(|s| s.parse().ok()).collect(),
            },
        }
    }
}

/// Raw TOML shape, deserialized before being frozen into an `AdmissionPolicy`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum AllowListConfig {
    ExactHosts {
        allowed_ips: Vec<String>,
    },
    Cidr {
        #[serde(default)]
        port: Option<u16>,
        acl: CidrLists,
    },
}

#[derive(Debug, Deserialize, Default)]
pub struct CidrLists {
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub ipv6: Vec<String>,
}
