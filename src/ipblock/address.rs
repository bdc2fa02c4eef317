//! Address records: next-address suggestion and per-record validation.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use ipnet::{IpAddrRange, IpNet, Ipv4AddrRange, Ipv6AddrRange};
use serde::{Deserialize, Serialize};

use crate::scope::AccessScope;

use super::{
    reserves_edges, same_family, AddressId, BlockId, BlockRecord, BlockTree, DeviceId, PortId,
    ValidationError,
};

/// An address registered in a leaf block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub id: AddressId,
    pub block_id: BlockId,
    pub ip: IpAddr,
    pub device_id: DeviceId,
    pub port_id: PortId,
    pub purpose: String,
    pub next_hop: Option<IpAddr>,
    pub is_gateway: bool,
    pub created_at: DateTime<Utc>,
}

/// An address as submitted. A missing `ip` is filled in by the allocator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressDraft {
    #[serde(default)]
    pub id: Option<AddressId>,
    #[serde(default)]
    pub block_id: Option<BlockId>,
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub device_id: Option<DeviceId>,
    #[serde(default)]
    pub port_id: Option<PortId>,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub next_hop: Option<IpAddr>,
    #[serde(default)]
    pub is_gateway: bool,
}

/// What the address rules need to know about the surrounding records.
pub struct AddressContext<'a> {
    pub tree: &'a BlockTree,
    /// Addresses already registered in the target block. Records from
    /// other blocks are ignored.
    pub existing: &'a [AddressRecord],
    /// Device owning the draft's port, if the port exists.
    pub port_device: Option<DeviceId>,
    pub scope: AccessScope,
}

impl AddressContext<'_> {
    fn resolve_block(&self, draft: &AddressDraft) -> Result<&BlockRecord, ValidationError> {
        let id = draft.block_id.ok_or(ValidationError::MissingBlock)?;
        self.tree
            .get_scoped(id, &self.scope)
            .ok_or(ValidationError::BlockNotFound(id))
    }

    fn in_block<'b>(&'b self, block: &'b BlockRecord) -> impl Iterator<Item = &'b AddressRecord> + 'b {
        self.existing.iter().filter(move |a| a.block_id == block.id)
    }
}

/// Whether `addr` is the network or broadcast address of a block small
/// enough to reserve them.
pub fn is_reserved(net: &IpNet, addr: &IpAddr) -> bool {
    reserves_edges(net) && (*addr == net.network() || *addr == net.broadcast())
}

/// Assignable addresses of `net` in ascending order.
pub fn usable_hosts(net: &IpNet) -> IpAddrRange {
    let trim = u8::from(reserves_edges(net));
    match net {
        IpNet::V4(n) => {
            let start = u32::from(n.network()) + u32::from(trim);
            let end = u32::from(n.broadcast()) - u32::from(trim);
            IpAddrRange::V4(Ipv4AddrRange::new(Ipv4Addr::from(start), Ipv4Addr::from(end)))
        }
        IpNet::V6(n) => {
            let start = u128::from(n.network()) + u128::from(trim);
            let end = u128::from(n.broadcast()) - u128::from(trim);
            IpAddrRange::V6(Ipv6AddrRange::new(Ipv6Addr::from(start), Ipv6Addr::from(end)))
        }
    }
}

/// First usable address of a leaf block not in `taken`. `None` when the
/// block is full.
pub fn suggest_next_address(
    block: &BlockRecord,
    tree: &BlockTree,
    taken: &HashSet<IpAddr>,
) -> Result<Option<IpAddr>, ValidationError> {
    if !tree.is_leaf(block.id) {
        return Err(ValidationError::BlockIsSubdivided {
            block: block.network,
            child: None,
        });
    }
    Ok(usable_hosts(&block.network).find(|addr| !taken.contains(addr)))
}

/// Check an address record before it is stored.
pub fn validate_address(draft: &AddressDraft, ctx: &AddressContext<'_>) -> Result<(), ValidationError> {
    let block = ctx.resolve_block(draft)?;
    let device = draft.device_id.ok_or(ValidationError::MissingDevice)?;
    if draft.port_id.is_none() {
        return Err(ValidationError::MissingPort);
    }
    let port_device = ctx.port_device.ok_or(ValidationError::MissingPort)?;
    if port_device != device {
        return Err(ValidationError::PortDeviceMismatch);
    }

    if !ctx.tree.is_leaf(block.id) {
        let child = draft
            .ip
            .and_then(|ip| ctx.tree.deepest_containing(block.id, ip))
            .map(|c| c.network);
        return Err(ValidationError::BlockIsSubdivided {
            block: block.network,
            child,
        });
    }

    if let Some(addr) = draft.ip {
        if !same_family(&block.network, &addr) || !block.network.contains(&addr) {
            return Err(ValidationError::AddressOutsideBlock {
                addr,
                block: block.network,
            });
        }
        if ctx
            .in_block(block)
            .any(|a| a.ip == addr && Some(a.id) != draft.id)
        {
            return Err(ValidationError::DuplicateAddress {
                addr,
                block: block.network,
            });
        }
        if is_reserved(&block.network, &addr) {
            return Err(ValidationError::ReservedAddress {
                addr,
                block: block.network,
            });
        }
    }

    if draft.is_gateway {
        if let Some(existing) = ctx
            .in_block(block)
            .find(|a| a.is_gateway && Some(a.id) != draft.id)
        {
            return Err(ValidationError::DuplicateGateway {
                block: block.network,
                existing: existing.ip,
            });
        }
        if draft.next_hop.is_none() {
            return Err(ValidationError::MissingNextHop);
        }
    }

    Ok(())
}

/// Save-path preparation: allocate an address when none was given, then
/// validate. Returns the draft with `ip` set.
pub fn prepare_address(
    mut draft: AddressDraft,
    ctx: &AddressContext<'_>,
) -> Result<AddressDraft, ValidationError> {
    if draft.ip.is_none() {
        let block = ctx.resolve_block(&draft)?;
        let taken: HashSet<IpAddr> = ctx.in_block(block).map(|a| a.ip).collect();
        let ip = suggest_next_address(block, ctx.tree, &taken)?
            .ok_or(ValidationError::BlockExhausted(block.network))?;
        draft.ip = Some(ip);
    }
    validate_address(&draft, ctx)?;
    Ok(draft)
}

/// Pair every address of a block being split with the index of the half
/// that contains it. Fails when an address would land on a reserved edge
/// of its half.
pub fn assign_to_halves(
    block: &IpNet,
    halves: &[IpNet; 2],
    addresses: &[AddressRecord],
) -> Result<Vec<(AddressId, usize)>, ValidationError> {
    addresses
        .iter()
        .map(|a| {
            let half = halves
                .iter()
                .position(|h| h.contains(&a.ip))
                .ok_or(ValidationError::AddressOutsideBlock {
                    addr: a.ip,
                    block: *block,
                })?;
            if is_reserved(&halves[half], &a.ip) {
                return Err(ValidationError::ReservedAddress {
                    addr: a.ip,
                    block: halves[half],
                });
            }
            Ok((a.id, half))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipblock::testutil::block;

    fn record(id: AddressId, block_id: BlockId, ip: &str, gateway: bool) -> AddressRecord {
        AddressRecord {
            id,
            block_id,
            ip: ip.parse().unwrap(),
            device_id: 1,
            port_id: 10,
            purpose: String::new(),
            next_hop: None,
            is_gateway: gateway,
            created_at: Utc::now(),
        }
    }

    fn draft_in(block_id: BlockId, ip: Option<&str>) -> AddressDraft {
        AddressDraft {
            block_id: Some(block_id),
            ip: ip.map(|s| s.parse().unwrap()),
            device_id: Some(1),
            port_id: Some(10),
            purpose: "uplink".to_string(),
            ..Default::default()
        }
    }

    fn ctx<'a>(tree: &'a BlockTree, existing: &'a [AddressRecord]) -> AddressContext<'a> {
        AddressContext {
            tree,
            existing,
            port_device: Some(1),
            scope: AccessScope::Unrestricted,
        }
    }

    #[test]
    fn test_usable_hosts() {
        let hosts: Vec<IpAddr> = usable_hosts(&"10.0.0.0/30".parse().unwrap()).collect();
        assert_eq!(
            hosts,
            vec!["10.0.0.1".parse::<IpAddr>().unwrap(), "10.0.0.2".parse().unwrap()]
        );
        assert_eq!(usable_hosts(&"10.0.0.0/31".parse().unwrap()).count(), 2);
        assert_eq!(usable_hosts(&"10.0.0.7/32".parse().unwrap()).count(), 1);
        assert_eq!(usable_hosts(&"2001:db8::/126".parse().unwrap()).count(), 2);
        assert_eq!(usable_hosts(&"2001:db8::/127".parse().unwrap()).count(), 2);
    }

    #[test]
    fn test_point_to_point_allocation_sequence() {
        let tree = BlockTree::from_records([block(1, 1, "10.0.0.0/30", None)]);
        let b = tree.get(1).unwrap();
        let mut taken = HashSet::new();

        let first = suggest_next_address(b, &tree, &taken).unwrap();
        assert_eq!(first, Some("10.0.0.1".parse().unwrap()));
        // Same snapshot, same answer.
        assert_eq!(suggest_next_address(b, &tree, &taken).unwrap(), first);

        taken.insert(first.unwrap());
        let second = suggest_next_address(b, &tree, &taken).unwrap();
        assert_eq!(second, Some("10.0.0.2".parse().unwrap()));

        taken.insert(second.unwrap());
        assert_eq!(suggest_next_address(b, &tree, &taken).unwrap(), None);
    }

    #[test]
    fn test_allocation_never_returns_edges() {
        let tree = BlockTree::from_records([block(1, 1, "192.168.10.0/29", None)]);
        let b = tree.get(1).unwrap();
        let mut taken = HashSet::new();
        while let Some(addr) = suggest_next_address(b, &tree, &taken).unwrap() {
            assert!(!is_reserved(&b.network, &addr));
            taken.insert(addr);
        }
        assert_eq!(taken.len(), 6);
    }

    #[test]
    fn test_allocation_fills_gaps() {
        let tree = BlockTree::from_records([block(1, 1, "10.1.0.0/24", None)]);
        let b = tree.get(1).unwrap();
        let taken: HashSet<IpAddr> = ["10.1.0.1", "10.1.0.3"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(
            suggest_next_address(b, &tree, &taken).unwrap(),
            Some("10.1.0.2".parse().unwrap())
        );
    }

    #[test]
    fn test_allocation_refuses_subdivided_block() {
        let tree = BlockTree::from_records([
            block(1, 1, "10.0.0.0/24", None),
            block(2, 1, "10.0.0.0/25", Some(1)),
        ]);
        assert!(matches!(
            suggest_next_address(tree.get(1).unwrap(), &tree, &HashSet::new()),
            Err(ValidationError::BlockIsSubdivided { child: None, .. })
        ));
    }

    #[test]
    fn test_reference_checks_in_order() {
        let tree = BlockTree::from_records([block(1, 1, "10.0.0.0/24", None)]);
        let c = ctx(&tree, &[]);

        let mut d = draft_in(1, Some("10.0.0.5"));
        d.block_id = None;
        assert_eq!(validate_address(&d, &c), Err(ValidationError::MissingBlock));

        let mut d = draft_in(1, Some("10.0.0.5"));
        d.device_id = None;
        d.port_id = None;
        assert_eq!(validate_address(&d, &c), Err(ValidationError::MissingDevice));

        let mut d = draft_in(1, Some("10.0.0.5"));
        d.port_id = None;
        assert_eq!(validate_address(&d, &c), Err(ValidationError::MissingPort));

        let mut d = draft_in(1, Some("10.0.0.5"));
        d.device_id = Some(2);
        assert_eq!(validate_address(&d, &c), Err(ValidationError::PortDeviceMismatch));

        assert_eq!(
            validate_address(&draft_in(7, None), &c),
            Err(ValidationError::BlockNotFound(7))
        );
    }

    #[test]
    fn test_subdivided_block_names_child() {
        let tree = BlockTree::from_records([
            block(1, 1, "10.0.0.0/24", None),
            block(2, 1, "10.0.0.0/25", Some(1)),
            block(3, 1, "10.0.0.128/25", Some(1)),
        ]);
        let c = ctx(&tree, &[]);
        let err = validate_address(&draft_in(1, Some("10.0.0.200")), &c).unwrap_err();
        assert_eq!(
            err,
            ValidationError::BlockIsSubdivided {
                block: "10.0.0.0/24".parse().unwrap(),
                child: Some("10.0.0.128/25".parse().unwrap()),
            }
        );
        assert!(err.to_string().contains("10.0.0.128/25"));
    }

    #[test]
    fn test_address_membership_and_duplicates() {
        let tree = BlockTree::from_records([block(1, 1, "10.0.0.0/30", None)]);
        let existing = [record(1, 1, "10.0.0.1", false), record(2, 9, "10.0.0.2", false)];
        let c = ctx(&tree, &existing);

        assert!(matches!(
            validate_address(&draft_in(1, Some("10.0.1.1")), &c),
            Err(ValidationError::AddressOutsideBlock { .. })
        ));
        assert!(matches!(
            validate_address(&draft_in(1, Some("2001:db8::1")), &c),
            Err(ValidationError::AddressOutsideBlock { .. })
        ));
        assert!(matches!(
            validate_address(&draft_in(1, Some("10.0.0.1")), &c),
            Err(ValidationError::DuplicateAddress { .. })
        ));
        assert!(matches!(
            validate_address(&draft_in(1, Some("10.0.0.3")), &c),
            Err(ValidationError::ReservedAddress { .. })
        ));
        // The record from block 9 does not count against block 1.
        assert!(validate_address(&draft_in(1, Some("10.0.0.2")), &c).is_ok());

        // Re-validating a stored record does not clash with itself.
        let mut update = draft_in(1, Some("10.0.0.1"));
        update.id = Some(1);
        assert!(validate_address(&update, &c).is_ok());
    }

    #[test]
    fn test_single_gateway_per_block() {
        let tree = BlockTree::from_records([block(1, 1, "10.0.0.0/29", None)]);
        let existing = [record(1, 1, "10.0.0.1", true)];
        let c = ctx(&tree, &existing);

        let mut d = draft_in(1, Some("10.0.0.2"));
        d.is_gateway = true;
        d.next_hop = Some("10.0.0.6".parse().unwrap());
        assert_eq!(
            validate_address(&d, &c),
            Err(ValidationError::DuplicateGateway {
                block: "10.0.0.0/29".parse().unwrap(),
                existing: "10.0.0.1".parse().unwrap(),
            })
        );

        let c = ctx(&tree, &[]);
        d.next_hop = None;
        assert_eq!(validate_address(&d, &c), Err(ValidationError::MissingNextHop));
    }

    #[test]
    fn test_prepare_allocates_then_exhausts() {
        let tree = BlockTree::from_records([block(1, 1, "10.0.0.0/30", None)]);
        let mut existing = Vec::new();

        for (id, expected) in [(1, "10.0.0.1"), (2, "10.0.0.2")] {
            let c = ctx(&tree, &existing);
            let prepared = prepare_address(draft_in(1, None), &c).unwrap();
            assert_eq!(prepared.ip, Some(expected.parse().unwrap()));
            existing.push(record(id, 1, expected, false));
        }

        let c = ctx(&tree, &existing);
        assert_eq!(
            prepare_address(draft_in(1, None), &c),
            Err(ValidationError::BlockExhausted("10.0.0.0/30".parse().unwrap()))
        );
    }

    #[test]
    fn test_split_assigns_addresses_to_halves() {
        let net: IpNet = "10.0.0.0/24".parse().unwrap();
        let halves: [IpNet; 2] = ["10.0.0.0/25".parse().unwrap(), "10.0.0.128/25".parse().unwrap()];
        let addresses = [
            record(1, 1, "10.0.0.1", true),
            record(2, 1, "10.0.0.200", false),
        ];
        assert_eq!(
            assign_to_halves(&net, &halves, &addresses).unwrap(),
            vec![(1, 0), (2, 1)]
        );
        assert!(assign_to_halves(&net, &halves, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_split_refuses_new_edge_address() {
        let net: IpNet = "10.0.0.0/24".parse().unwrap();
        let halves: [IpNet; 2] = ["10.0.0.0/25".parse().unwrap(), "10.0.0.128/25".parse().unwrap()];
        assert_eq!(
            assign_to_halves(&net, &halves, &[record(1, 1, "10.0.0.127", false)]),
            Err(ValidationError::ReservedAddress {
                addr: "10.0.0.127".parse().unwrap(),
                block: halves[0],
            })
        );

        // Point-to-point halves keep every address.
        let p2p: IpNet = "10.0.0.0/30".parse().unwrap();
        let p2p_halves: [IpNet; 2] = ["10.0.0.0/31".parse().unwrap(), "10.0.0.2/31".parse().unwrap()];
        assert_eq!(
            assign_to_halves(&p2p, &p2p_halves, &[record(1, 1, "10.0.0.2", false)]).unwrap(),
            vec![(1, 1)]
        );
    }
}
