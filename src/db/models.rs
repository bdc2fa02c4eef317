//! Database model definitions.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ipblock::{AddressRecord, DeviceId, PortId, TenantId};
use crate::scope::AccessScope;

pub type TokenId = i64;

/// A company owning devices and blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A network device (router, switch, server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub tenant_id: TenantId,
    pub name: String,
    pub mgmt_ip: Option<IpAddr>,
    pub created_at: DateTime<Utc>,
}

/// A port on a device, optionally cabled to a peer port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    pub device_id: DeviceId,
    pub name: String,
    pub peer_port_id: Option<PortId>,
}

/// An API token (for REST API authentication).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub token_hash: String,
    pub name: Option<String>,
    pub tenant_id: Option<TenantId>,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

impl Token {
    /// Check if the token is valid (not revoked and not expired).
    pub fn is_valid(&self) -> bool {
        if self.revoked {
            return false;
        }
        if let Some(expires_at) = self.expires_at {
            if expires_at < Utc::now() {
                return false;
            }
        }
        self.is_admin || self.tenant_id.is_some()
    }

    /// The visibility this token grants.
    pub fn scope(&self) -> Option<AccessScope> {
        if self.is_admin {
            Some(AccessScope::Unrestricted)
        } else {
            self.tenant_id.map(AccessScope::Tenant)
        }
    }
}

/// Several addresses registered in one block at once.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkAddressRequest {
    pub device_id: Option<DeviceId>,
    pub port_id: Option<PortId>,
    #[serde(default)]
    pub purpose: String,
    /// Explicit addresses to register.
    #[serde(default)]
    pub ips: Vec<IpAddr>,
    /// Further addresses to take from the allocator.
    #[serde(default)]
    pub count: usize,
}

/// Outcome of a bulk registration. Failed items are skipped, not retried.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkReport {
    pub created: Vec<AddressRecord>,
    pub failed: usize,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn token(tenant_id: Option<TenantId>, is_admin: bool) -> Token {
        Token {
            id: 1,
            token_hash: String::new(),
            name: None,
            tenant_id,
            is_admin,
            created_at: Utc::now(),
            expires_at: None,
            revoked: false,
        }
    }

    #[test]
    fn test_token_scope() {
        assert_eq!(token(None, true).scope(), Some(AccessScope::Unrestricted));
        assert_eq!(token(Some(4), false).scope(), Some(AccessScope::Tenant(4)));
        assert_eq!(token(None, false).scope(), None);
        assert!(!token(None, false).is_valid());
    }

    #[test]
    fn test_token_expiry_and_revocation() {
        let mut t = token(Some(1), false);
        assert!(t.is_valid());
        t.expires_at = Some(Utc::now() - Duration::minutes(1));
        assert!(!t.is_valid());
        t.expires_at = None;
        t.revoked = true;
        assert!(!t.is_valid());
    }
}
