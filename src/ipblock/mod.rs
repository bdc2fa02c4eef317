//! Hierarchical IP block rules: validation, subdivision and address
//! allocation over an in-memory snapshot of a tenant's blocks.
//!
//! Nothing in here touches storage. The store loads a [`BlockTree`] and the
//! relevant addresses, runs these checks, and persists on success.

mod address;
mod block;
mod error;
mod tree;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

pub use address::{
    assign_to_halves, prepare_address, suggest_next_address, AddressContext, AddressDraft,
    AddressRecord,
};
pub use block::{plan_subdivision, validate_block};
pub use error::ValidationError;
pub use tree::{BlockNode, BlockTree};

pub type TenantId = i64;
pub type BlockId = i64;
pub type AddressId = i64;
pub type DeviceId = i64;
pub type PortId = i64;

/// IP version a block is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    #[serde(rename = "IPv4")]
    V4,
    #[serde(rename = "IPv6")]
    V6,
}

impl AddressFamily {
    pub fn of(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => AddressFamily::V4,
            IpNet::V6(_) => AddressFamily::V6,
        }
    }

    pub fn max_prefix_len(self) -> u8 {
        match self {
            AddressFamily::V4 => 32,
            AddressFamily::V6 => 128,
        }
    }

    /// Longest prefix at which the network and broadcast addresses are
    /// not assignable.
    pub fn reserved_edge_threshold(self) -> u8 {
        match self {
            AddressFamily::V4 => 30,
            AddressFamily::V6 => 126,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AddressFamily::V4 => "IPv4",
            AddressFamily::V6 => "IPv6",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ipv4" | "v4" | "4" => Ok(AddressFamily::V4),
            "ipv6" | "v6" | "6" => Ok(AddressFamily::V6),
            other => Err(format!("unknown address family: {}", other)),
        }
    }
}

/// A persisted CIDR block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub id: BlockId,
    pub tenant_id: TenantId,
    pub family: AddressFamily,
    pub network: IpNet,
    pub description: Option<String>,
    pub parent_id: Option<BlockId>,
    pub device_id: Option<DeviceId>,
    pub created_at: DateTime<Utc>,
}

impl BlockRecord {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// A block as submitted for creation or update. `id` is set on update so
/// the block is not compared against itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDraft {
    #[serde(default)]
    pub id: Option<BlockId>,
    pub tenant_id: TenantId,
    pub family: AddressFamily,
    pub cidr: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parent_id: Option<BlockId>,
    #[serde(default)]
    pub device_id: Option<DeviceId>,
}

/// Parse a CIDR string, rejecting host bits.
pub fn parse_cidr(cidr: &str) -> Result<IpNet, ValidationError> {
    let net: IpNet = cidr
        .trim()
        .parse()
        .map_err(|_| ValidationError::InvalidCidr(cidr.to_string()))?;
    if net.trunc() != net {
        return Err(ValidationError::InvalidCidr(cidr.to_string()));
    }
    Ok(net)
}

/// Two CIDR networks overlap exactly when one contains the other.
pub fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(b) || b.contains(a)
}

/// `child` lies inside `parent` and is not the same network.
pub fn is_strict_subnet(child: &IpNet, parent: &IpNet) -> bool {
    child.prefix_len() > parent.prefix_len() && parent.contains(child)
}

/// Whether the network and broadcast addresses of `net` are off limits.
pub fn reserves_edges(net: &IpNet) -> bool {
    net.prefix_len() <= AddressFamily::of(net).reserved_edge_threshold()
}

/// Whether `addr` has the same IP version as `net`.
pub(crate) fn same_family(net: &IpNet, addr: &IpAddr) -> bool {
    matches!(
        (net, addr),
        (IpNet::V4(_), IpAddr::V4(_)) | (IpNet::V6(_), IpAddr::V6(_))
    )
}

#[cfg(test)]
pub(crate) mod testutil {
    use chrono::Utc;

    use super::*;

    pub fn block(id: BlockId, tenant: TenantId, cidr: &str, parent: Option<BlockId>) -> BlockRecord {
        let network: IpNet = cidr.parse().unwrap();
        BlockRecord {
            id,
            tenant_id: tenant,
            family: AddressFamily::of(&network),
            network,
            description: None,
            parent_id: parent,
            device_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn draft(tenant: TenantId, cidr: &str, parent: Option<BlockId>) -> BlockDraft {
        let family = if cidr.contains(':') {
            AddressFamily::V6
        } else {
            AddressFamily::V4
        };
        BlockDraft {
            id: None,
            tenant_id: tenant,
            family,
            cidr: cidr.to_string(),
            description: None,
            parent_id: parent,
            device_id: None,
        }
    }
}
