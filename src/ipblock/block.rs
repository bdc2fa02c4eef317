//! Block validation and subdivision.

use ipnet::IpNet;
use tracing::debug;

use crate::scope::AccessScope;

use super::{
    is_strict_subnet, overlaps, parse_cidr, AddressFamily, BlockDraft, BlockRecord, BlockTree,
    ValidationError,
};

/// Check a candidate block against the current snapshot and return its
/// parsed network.
pub fn validate_block(
    draft: &BlockDraft,
    tree: &BlockTree,
    scope: &AccessScope,
) -> Result<IpNet, ValidationError> {
    if !scope.permits(draft.tenant_id) {
        return Err(ValidationError::OutOfScope(draft.tenant_id));
    }

    let network = parse_cidr(&draft.cidr)?;
    if AddressFamily::of(&network) != draft.family {
        return Err(ValidationError::TypeMismatch {
            cidr: network,
            declared: draft.family,
        });
    }

    match draft.parent_id {
        Some(parent_id) => {
            let parent = tree
                .get_scoped(parent_id, scope)
                .ok_or(ValidationError::ParentNotFound(parent_id))?;

            if !is_strict_subnet(&network, &parent.network) {
                return Err(ValidationError::NotSubnetOfParent {
                    cidr: network,
                    parent: parent.network,
                });
            }

            if let Some(sibling) = tree
                .children(parent_id)
                .into_iter()
                .filter(|s| draft.id != Some(s.id))
                .find(|s| overlaps(&s.network, &network))
            {
                return Err(ValidationError::SiblingOverlap {
                    cidr: network,
                    conflict: sibling.network,
                });
            }

            if parent.tenant_id != draft.tenant_id {
                return Err(ValidationError::CrossTenantParent {
                    parent: parent.network,
                });
            }
        }
        None => {
            if let Some(root) = tree
                .roots(draft.tenant_id, draft.family)
                .filter(|r| draft.id != Some(r.id))
                .find(|r| overlaps(&r.network, &network))
            {
                return Err(ValidationError::RootOverlap {
                    cidr: network,
                    conflict: root.network,
                });
            }
        }
    }

    // An update must keep existing children inside the block.
    if let Some(id) = draft.id {
        if let Some(child) = tree
            .children(id)
            .into_iter()
            .find(|c| !is_strict_subnet(&c.network, &network))
        {
            return Err(ValidationError::NotSubnetOfParent {
                cidr: child.network,
                parent: network,
            });
        }
        // Sub-blocks share their parent's tenant.
        if tree
            .children(id)
            .into_iter()
            .any(|c| c.tenant_id != draft.tenant_id)
        {
            return Err(ValidationError::CrossTenantParent { parent: network });
        }
    }

    Ok(network)
}

/// Compute the two halves of a leaf block, each validated against the
/// snapshot. The caller persists both or neither.
pub fn plan_subdivision(
    block: &BlockRecord,
    tree: &BlockTree,
    scope: &AccessScope,
) -> Result<[BlockDraft; 2], ValidationError> {
    if !scope.permits(block.tenant_id) {
        return Err(ValidationError::BlockNotFound(block.id));
    }
    if !tree.is_leaf(block.id) {
        return Err(ValidationError::AlreadySubdivided(block.network));
    }

    let prefix = block.network.prefix_len();
    if prefix >= block.family.max_prefix_len() {
        return Err(ValidationError::MaximumPrefixReached(block.network));
    }

    let mut halves = block
        .network
        .subnets(prefix + 1)
        .map_err(|_| ValidationError::MaximumPrefixReached(block.network))?;
    let (lower, upper) = match (halves.next(), halves.next()) {
        (Some(lower), Some(upper)) => (lower, upper),
        _ => return Err(ValidationError::MaximumPrefixReached(block.network)),
    };

    let drafts = [lower, upper].map(|half| BlockDraft {
        id: None,
        tenant_id: block.tenant_id,
        family: block.family,
        cidr: half.to_string(),
        description: None,
        parent_id: Some(block.id),
        device_id: None,
    });
    for draft in &drafts {
        validate_block(draft, tree, scope)?;
    }

    debug!(block = %block.network, lower = %lower, upper = %upper, "Planned subdivision");
    Ok(drafts)
}
