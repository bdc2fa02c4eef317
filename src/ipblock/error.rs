//! Validation failures raised by the block and address rules.

use std::net::IpAddr;

use ipnet::IpNet;
use thiserror::Error;

use super::{AddressFamily, BlockId, TenantId};

/// A per-record validation failure. None of these are fatal; the caller
/// corrects the input and resubmits.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid CIDR block: {0}")]
    InvalidCidr(String),

    #[error("Block {cidr} is not an {declared} network")]
    TypeMismatch { cidr: IpNet, declared: AddressFamily },

    #[error("Block {cidr} is not a subnet of parent block {parent}")]
    NotSubnetOfParent { cidr: IpNet, parent: IpNet },

    #[error("Block {cidr} overlaps with root block {conflict}")]
    RootOverlap { cidr: IpNet, conflict: IpNet },

    #[error("Block {cidr} overlaps with sibling block {conflict}")]
    SiblingOverlap { cidr: IpNet, conflict: IpNet },

    #[error("Parent block {parent} belongs to another tenant")]
    CrossTenantParent { parent: IpNet },

    #[error("Parent block {0} not found")]
    ParentNotFound(BlockId),

    #[error("Tenant {0} is outside the caller's scope")]
    OutOfScope(TenantId),

    #[error("Block {0} has already been subdivided")]
    AlreadySubdivided(IpNet),

    #[error("Block {0} is already at the maximum prefix length")]
    MaximumPrefixReached(IpNet),

    #[error("{}", subdivided_message(.block, .child))]
    BlockIsSubdivided { block: IpNet, child: Option<IpNet> },

    #[error("No address available in block {0}")]
    BlockExhausted(IpNet),

    #[error("Block {0} not found")]
    BlockNotFound(BlockId),

    #[error("A block is required")]
    MissingBlock,

    #[error("A device is required")]
    MissingDevice,

    #[error("A port is required")]
    MissingPort,

    #[error("The selected port does not belong to the selected device")]
    PortDeviceMismatch,

    #[error("Address {addr} is outside block {block}")]
    AddressOutsideBlock { addr: IpAddr, block: IpNet },

    #[error("Address {addr} is already registered in block {block}")]
    DuplicateAddress { addr: IpAddr, block: IpNet },

    #[error("Address {addr} is the network or broadcast address of block {block}")]
    ReservedAddress { addr: IpAddr, block: IpNet },

    #[error("Block {block} already has a gateway ({existing})")]
    DuplicateGateway { block: IpNet, existing: IpAddr },

    #[error("A gateway address requires a next hop")]
    MissingNextHop,
}

fn subdivided_message(block: &IpNet, child: &Option<IpNet>) -> String {
    match child {
        Some(child) => format!(
            "Block {} is subdivided; register the address in child block {}",
            block, child
        ),
        None => format!(
            "Block {} is subdivided; addresses must be registered in one of its child blocks",
            block
        ),
    }
}
