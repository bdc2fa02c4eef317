//! Persistent store for tenants, inventory, blocks and addresses.

pub mod ipam;
mod models;

pub use ipam::{Ipam, IpamError};
pub use models::{BulkAddressRequest, BulkReport};
