//! Tenant visibility passed into every block and address operation.

use crate::ipblock::TenantId;

/// Which tenants a caller may see and modify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessScope {
    /// Administrator access across all tenants.
    Unrestricted,
    /// Access limited to a single tenant.
    Tenant(TenantId),
}

impl AccessScope {
    pub fn permits(&self, tenant: TenantId) -> bool {
        match self {
            AccessScope::Unrestricted => true,
            AccessScope::Tenant(t) => *t == tenant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permits() {
        assert!(AccessScope::Unrestricted.permits(7));
        assert!(AccessScope::Tenant(7).permits(7));
        assert!(!AccessScope::Tenant(7).permits(8));
    }
}
