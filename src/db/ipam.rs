//! IP Address Management (IPAM) database operations.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::IpamConfig;
use crate::ipblock::{
    assign_to_halves, plan_subdivision, prepare_address, validate_block, AddressContext,
    AddressDraft, AddressId, AddressRecord, BlockDraft, BlockId, BlockNode, BlockRecord, BlockTree, DeviceId, PortId,
    TenantId, ValidationError,
};
use crate::scope::AccessScope;

use super::models::{BulkAddressRequest, BulkReport, Device, Port, Tenant, Token};

#[derive(Debug, Error)]
pub enum IpamError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid stored record: {0}")]
    InvalidRecord(String),

    #[error("A port cannot be connected to itself")]
    SelfConnection,

    #[error("Invalid request: {0}")]
    InvalidInput(String),
}

/// Hash a token using SHA-256.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a new random token.
pub fn generate_token() -> String {
    use base64::Engine;
    use rand::Rng;
    let bytes: [u8; 32] = rand::thread_rng().gen();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

const BLOCK_COLUMNS: &str =
    "id, tenant_id, family, cidr, description, parent_id, device_id, created_at";
const ADDRESS_COLUMNS: &str =
    "id, block_id, ip, device_id, port_id, purpose, next_hop, is_gateway, created_at";
const TOKEN_COLUMNS: &str =
    "id, token_hash, name, tenant_id, is_admin, created_at, expires_at, revoked";

/// IP Address Management database.
pub struct Ipam {
    pool: Pool<Sqlite>,
    config: IpamConfig,
}

impl Ipam {
    /// Open (creating if needed) the database at `db_path`.
    pub async fn new(db_path: &Path, config: IpamConfig) -> Result<Self, IpamError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                IpamError::Database(sqlx::Error::Configuration(
                    format!("Failed to create database directory {}: {}", parent.display(), e).into(),
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::with_pool(pool, config).await
    }

    /// A private in-memory database. One connection, kept alive for the
    /// lifetime of the pool.
    #[cfg(test)]
    pub async fn in_memory(config: IpamConfig) -> Result<Self, IpamError> {
        let options = "sqlite::memory:"
            .parse::<SqliteConnectOptions>()?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool, config).await
    }

    async fn with_pool(pool: Pool<Sqlite>, config: IpamConfig) -> Result<Self, IpamError> {
        let ipam = Self { pool, config };
        ipam.init_schema().await?;
        Ok(ipam)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<(), IpamError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token_hash TEXT UNIQUE NOT NULL,
                name TEXT,
                tenant_id INTEGER REFERENCES tenants(id) ON DELETE CASCADE,
                is_admin BOOLEAN DEFAULT FALSE,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                revoked BOOLEAN DEFAULT FALSE
            );

            CREATE INDEX IF NOT EXISTS idx_tokens_hash ON tokens(token_hash);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id INTEGER NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                mgmt_ip TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                peer_port_id INTEGER REFERENCES ports(id) ON DELETE SET NULL,
                UNIQUE (device_id, name)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blocks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id INTEGER NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                family TEXT NOT NULL,
                cidr TEXT NOT NULL,
                description TEXT,
                parent_id INTEGER REFERENCES blocks(id) ON DELETE CASCADE,
                device_id INTEGER REFERENCES devices(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_blocks_parent ON blocks(parent_id);
            CREATE INDEX IF NOT EXISTS idx_blocks_tenant ON blocks(tenant_id);

            CREATE TABLE IF NOT EXISTS addresses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                block_id INTEGER NOT NULL REFERENCES blocks(id) ON DELETE CASCADE,
                ip TEXT NOT NULL,
                device_id INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
                port_id INTEGER NOT NULL REFERENCES ports(id) ON DELETE CASCADE,
                purpose TEXT NOT NULL DEFAULT '',
                next_hop TEXT,
                is_gateway BOOLEAN DEFAULT FALSE,
                created_at TEXT NOT NULL,
                UNIQUE (block_id, ip)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                action TEXT NOT NULL,
                tenant_id INTEGER,
                subject TEXT,
                details TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // Tenants

    /// Create a tenant.
    pub async fn create_tenant(&self, name: &str) -> Result<Tenant, IpamError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(IpamError::InvalidInput("tenant name must not be empty".to_string()));
        }
        let now = Utc::now();

        let id = sqlx::query("INSERT INTO tenants (name, created_at) VALUES (?, ?)")
            .bind(name)
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?
            .last_insert_rowid();

        self.audit("create_tenant", Some(id), Some(name), "{}").await?;
        info!(tenant = %name, id, "Created tenant");

        Ok(Tenant {
            id,
            name: name.to_string(),
            created_at: now,
        })
    }

    /// List the tenants visible to `scope`.
    pub async fn list_tenants(&self, scope: &AccessScope) -> Result<Vec<Tenant>, IpamError> {
        let rows = sqlx::query("SELECT id, name, created_at FROM tenants ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut tenants = Vec::with_capacity(rows.len());
        for row in &rows {
            let tenant = Tenant {
                id: row.get("id"),
                name: row.get("name"),
                created_at: parse_time(row.get("created_at"))?,
            };
            if scope.permits(tenant.id) {
                tenants.push(tenant);
            }
        }
        Ok(tenants)
    }

    async fn require_tenant(&self, id: TenantId) -> Result<(), IpamError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM tenants WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        found
            .map(|_| ())
            .ok_or_else(|| IpamError::NotFound(format!("Tenant {}", id)))
    }

    // Token management

    /// Create a new API token. Non-admin tokens must name a tenant.
    pub async fn create_token(
        &self,
        name: Option<&str>,
        tenant_id: Option<TenantId>,
        is_admin: bool,
    ) -> Result<(String, Token), IpamError> {
        match tenant_id {
            Some(id) => self.require_tenant(id).await?,
            None if !is_admin => {
                return Err(IpamError::InvalidInput(
                    "a non-admin token must belong to a tenant".to_string(),
                ))
            }
            None => {}
        }

        let token = generate_token();
        let token_hash = hash_token(&token);
        let now = Utc::now();

        let id = sqlx::query(
            r#"
            INSERT INTO tokens (token_hash, name, tenant_id, is_admin, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&token_hash)
        .bind(name)
        .bind(tenant_id)
        .bind(is_admin)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.audit("create_token", tenant_id, name, &serde_json::json!({"is_admin": is_admin}).to_string())
            .await?;

        Ok((
            token,
            Token {
                id,
                token_hash,
                name: name.map(String::from),
                tenant_id,
                is_admin,
                created_at: now,
                expires_at: None,
                revoked: false,
            },
        ))
    }

    /// Get token by hash.
    pub async fn get_token(&self, token_hash: &str) -> Result<Option<Token>, IpamError> {
        let row = sqlx::query(&format!("SELECT {} FROM tokens WHERE token_hash = ?", TOKEN_COLUMNS))
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| self.row_to_token(&r)).transpose()
    }

    /// List all tokens.
    pub async fn list_tokens(&self) -> Result<Vec<Token>, IpamError> {
        let rows = sqlx::query(&format!("SELECT {} FROM tokens ORDER BY id", TOKEN_COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(|r| self.row_to_token(r)).collect()
    }

    /// Validate a plaintext token and return Token if valid.
    pub async fn validate_token(&self, token: &str) -> Result<Option<Token>, IpamError> {
        let token_hash = hash_token(token);
        let token_opt = self.get_token(&token_hash).await?;

        Ok(token_opt.filter(|t| t.is_valid()))
    }

    // Devices and ports

    /// Register a device for a tenant.
    pub async fn create_device(
        &self,
        scope: &AccessScope,
        tenant_id: TenantId,
        name: &str,
        mgmt_ip: Option<IpAddr>,
    ) -> Result<Device, IpamError> {
        if !scope.permits(tenant_id) {
            return Err(ValidationError::OutOfScope(tenant_id).into());
        }
        self.require_tenant(tenant_id).await?;
        let now = Utc::now();

        let id = sqlx::query(
            "INSERT INTO devices (tenant_id, name, mgmt_ip, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(tenant_id)
        .bind(name)
        .bind(mgmt_ip.map(|ip| ip.to_string()))
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.audit("create_device", Some(tenant_id), Some(name), "{}").await?;
        info!(device = %name, id, tenant_id, "Registered device");

        Ok(Device {
            id,
            tenant_id,
            name: name.to_string(),
            mgmt_ip,
            created_at: now,
        })
    }

    /// Get a device visible to `scope`.
    pub async fn get_device(&self, scope: &AccessScope, id: DeviceId) -> Result<Device, IpamError> {
        let row = sqlx::query("SELECT id, tenant_id, name, mgmt_ip, created_at FROM devices WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| self.row_to_device(&r))
            .transpose()?
            .filter(|d| scope.permits(d.tenant_id))
            .ok_or_else(|| IpamError::NotFound(format!("Device {}", id)))
    }

    /// List devices visible to `scope`.
    pub async fn list_devices(&self, scope: &AccessScope) -> Result<Vec<Device>, IpamError> {
        let rows = sqlx::query("SELECT id, tenant_id, name, mgmt_ip, created_at FROM devices ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let devices: Vec<Device> = rows
            .iter()
            .map(|r| self.row_to_device(r))
            .collect::<Result<_, _>>()?;
        Ok(devices
            .into_iter()
            .filter(|d| scope.permits(d.tenant_id))
            .collect())
    }

    /// Add a port to a device.
    pub async fn create_port(
        &self,
        scope: &AccessScope,
        device_id: DeviceId,
        name: &str,
    ) -> Result<Port, IpamError> {
        let device = self.get_device(scope, device_id).await?;

        let id = sqlx::query("INSERT INTO ports (device_id, name) VALUES (?, ?)")
            .bind(device.id)
            .bind(name)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();

        debug!(port = %name, device = %device.name, "Created port");

        Ok(Port {
            id,
            device_id: device.id,
            name: name.to_string(),
            peer_port_id: None,
        })
    }

    async fn find_port(&self, id: PortId) -> Result<Option<Port>, IpamError> {
        let row = sqlx::query("SELECT id, device_id, name, peer_port_id FROM ports WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| row_to_port(&r)))
    }

    /// Get a port whose device is visible to `scope`.
    pub async fn get_port(&self, scope: &AccessScope, id: PortId) -> Result<Port, IpamError> {
        let port = self
            .find_port(id)
            .await?
            .ok_or_else(|| IpamError::NotFound(format!("Port {}", id)))?;
        self.get_device(scope, port.device_id)
            .await
            .map_err(|_| IpamError::NotFound(format!("Port {}", id)))?;
        Ok(port)
    }

    /// List the ports of a device.
    pub async fn list_ports(&self, scope: &AccessScope, device_id: DeviceId) -> Result<Vec<Port>, IpamError> {
        self.get_device(scope, device_id).await?;

        let rows = sqlx::query("SELECT id, device_id, name, peer_port_id FROM ports WHERE device_id = ? ORDER BY id")
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(row_to_port).collect())
    }

    /// Cable two ports together. Previous peers of either side are released
    /// so the link stays symmetric.
    pub async fn connect_ports(
        &self,
        scope: &AccessScope,
        a: PortId,
        b: PortId,
    ) -> Result<(Port, Port), IpamError> {
        if a == b {
            return Err(IpamError::SelfConnection);
        }
        let port_a = self.get_port(scope, a).await?;
        let port_b = self.get_port(scope, b).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE ports SET peer_port_id = NULL WHERE peer_port_id IN (?, ?) OR id IN (?, ?)")
            .bind(a)
            .bind(b)
            .bind(a)
            .bind(b)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE ports SET peer_port_id = ? WHERE id = ?")
            .bind(b)
            .bind(a)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE ports SET peer_port_id = ? WHERE id = ?")
            .bind(a)
            .bind(b)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.audit("connect_ports", None, Some(format!("{}<->{}", a, b).as_str()), "{}").await?;
        info!(port_a = %port_a.name, port_b = %port_b.name, "Connected ports");

        Ok((
            Port {
                peer_port_id: Some(b),
                ..port_a
            },
            Port {
                peer_port_id: Some(a),
                ..port_b
            },
        ))
    }

    /// Remove a port's cable, clearing both ends.
    pub async fn disconnect_port(&self, scope: &AccessScope, id: PortId) -> Result<Port, IpamError> {
        let port = self.get_port(scope, id).await?;

        sqlx::query("UPDATE ports SET peer_port_id = NULL WHERE id = ? OR peer_port_id = ?")
            .bind(id)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if let Some(peer) = port.peer_port_id {
            self.audit("disconnect_port", None, Some(format!("{}<->{}", id, peer).as_str()), "{}").await?;
            info!(port = %port.name, peer, "Disconnected port");
        }

        Ok(Port {
            peer_port_id: None,
            ..port
        })
    }

    // Blocks

    /// Snapshot of every block.
    pub async fn load_tree(&self) -> Result<BlockTree, IpamError> {
        let rows = sqlx::query(&format!("SELECT {} FROM blocks ORDER BY id", BLOCK_COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        let records = rows
            .iter()
            .map(|r| self.row_to_block(r))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(BlockTree::from_records(records))
    }

    /// Validate and store a new block.
    pub async fn create_block(
        &self,
        scope: &AccessScope,
        mut draft: BlockDraft,
    ) -> Result<BlockRecord, IpamError> {
        draft.id = None;
        let tree = self.load_tree().await?;
        let network = validate_block(&draft, &tree, scope)?;
        if let Some(device_id) = draft.device_id {
            self.require_device_of(scope, device_id, draft.tenant_id).await?;
        }
        let now = Utc::now();

        let id = sqlx::query(
            r#"
            INSERT INTO blocks (tenant_id, family, cidr, description, parent_id, device_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(draft.tenant_id)
        .bind(draft.family.as_str())
        .bind(network.to_string())
        .bind(&draft.description)
        .bind(draft.parent_id)
        .bind(draft.device_id)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.audit("create_block", Some(draft.tenant_id), Some(network.to_string().as_str()), "{}")
            .await?;
        info!(block = %network, id, tenant_id = draft.tenant_id, "Created block");

        Ok(BlockRecord {
            id,
            tenant_id: draft.tenant_id,
            family: draft.family,
            network,
            description: draft.description,
            parent_id: draft.parent_id,
            device_id: draft.device_id,
            created_at: now,
        })
    }

    /// Validate and apply changes to an existing block.
    pub async fn update_block(
        &self,
        scope: &AccessScope,
        id: BlockId,
        mut draft: BlockDraft,
    ) -> Result<BlockRecord, IpamError> {
        let tree = self.load_tree().await?;
        let current = tree
            .get_scoped(id, scope)
            .ok_or(ValidationError::BlockNotFound(id))?
            .clone();
        draft.id = Some(id);
        let network = validate_block(&draft, &tree, scope)?;
        if let Some(device_id) = draft.device_id {
            self.require_device_of(scope, device_id, draft.tenant_id).await?;
        }

        let addresses = self.addresses_in_block(id).await?;
        if draft.tenant_id != current.tenant_id && !addresses.is_empty() {
            return Err(IpamError::InvalidInput(format!(
                "block {} still holds {} addresses and cannot move to another tenant",
                current.network,
                addresses.len()
            )));
        }
        if let Some(stray) = addresses.iter().find(|a| !network.contains(&a.ip)) {
            return Err(ValidationError::AddressOutsideBlock {
                addr: stray.ip,
                block: network,
            }
            .into());
        }

        sqlx::query(
            r#"
            UPDATE blocks SET tenant_id = ?, family = ?, cidr = ?, description = ?, parent_id = ?, device_id = ?
            WHERE id = ?
            "#,
        )
        .bind(draft.tenant_id)
        .bind(draft.family.as_str())
        .bind(network.to_string())
        .bind(&draft.description)
        .bind(draft.parent_id)
        .bind(draft.device_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.audit(
            "update_block",
            Some(draft.tenant_id),
            Some(network.to_string().as_str()),
            &serde_json::json!({"previous": current.network.to_string()}).to_string(),
        )
        .await?;
        info!(block = %network, id, "Updated block");

        Ok(BlockRecord {
            id,
            tenant_id: draft.tenant_id,
            family: draft.family,
            network,
            description: draft.description,
            parent_id: draft.parent_id,
            device_id: draft.device_id,
            created_at: current.created_at,
        })
    }

    /// Get a block visible to `scope`.
    pub async fn get_block(&self, scope: &AccessScope, id: BlockId) -> Result<BlockRecord, IpamError> {
        let row = sqlx::query(&format!("SELECT {} FROM blocks WHERE id = ?", BLOCK_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| self.row_to_block(&r))
            .transpose()?
            .filter(|b| scope.permits(b.tenant_id))
            .ok_or_else(|| ValidationError::BlockNotFound(id).into())
    }

    /// List all blocks visible to `scope`.
    pub async fn list_blocks(&self, scope: &AccessScope) -> Result<Vec<BlockRecord>, IpamError> {
        let tree = self.load_tree().await?;
        Ok(tree.visible(scope).cloned().collect())
    }

    /// Direct sub-blocks of a block.
    pub async fn list_children(&self, scope: &AccessScope, id: BlockId) -> Result<Vec<BlockRecord>, IpamError> {
        let tree = self.load_tree().await?;
        tree.get_scoped(id, scope)
            .ok_or(ValidationError::BlockNotFound(id))?;
        Ok(tree.children(id).into_iter().cloned().collect())
    }

    /// Split a leaf block into its two halves. Both children are stored in
    /// one transaction, and the block's addresses move to the half holding
    /// them.
    pub async fn subdivide_block(
        &self,
        scope: &AccessScope,
        id: BlockId,
    ) -> Result<(BlockRecord, BlockRecord), IpamError> {
        let tree = self.load_tree().await?;
        let block = tree
            .get_scoped(id, scope)
            .ok_or(ValidationError::BlockNotFound(id))?;
        let drafts = plan_subdivision(block, &tree, scope)?;
        let [lower_draft, upper_draft] = &drafts;
        let halves = [
            validate_block(lower_draft, &tree, scope)?,
            validate_block(upper_draft, &tree, scope)?,
        ];

        let addresses = self.addresses_in_block(id).await?;
        let moves = assign_to_halves(&block.network, &halves, &addresses)?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut children = Vec::with_capacity(2);
        for (draft, network) in drafts.iter().zip(halves) {
            let child_id = sqlx::query(
                r#"
                INSERT INTO blocks (tenant_id, family, cidr, description, parent_id, device_id, created_at)
                VALUES (?, ?, ?, NULL, ?, NULL, ?)
                "#,
            )
            .bind(draft.tenant_id)
            .bind(draft.family.as_str())
            .bind(network.to_string())
            .bind(id)
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            children.push(BlockRecord {
                id: child_id,
                tenant_id: draft.tenant_id,
                family: draft.family,
                network,
                description: None,
                parent_id: Some(id),
                device_id: None,
                created_at: now,
            });
        }

        // Addresses follow the half that contains them.
        for (address_id, half) in &moves {
            let child = children
                .get(*half)
                .ok_or_else(|| IpamError::InvalidRecord(format!("subdivision of block {}", id)))?;
            sqlx::query("UPDATE addresses SET block_id = ? WHERE id = ?")
                .bind(child.id)
                .bind(address_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        let upper = children.pop();
        let lower = children.pop();
        let (lower, upper) = lower
            .zip(upper)
            .ok_or_else(|| IpamError::InvalidRecord(format!("subdivision of block {}", id)))?;

        self.audit(
            "subdivide_block",
            Some(block.tenant_id),
            Some(block.network.to_string().as_str()),
            &serde_json::json!({
                "children": [lower.network.to_string(), upper.network.to_string()],
                "moved_addresses": moves.len(),
            })
            .to_string(),
        )
        .await?;
        info!(block = %block.network, lower = %lower.network, upper = %upper.network, "Subdivided block");

        Ok((lower, upper))
    }

    /// Delete a block together with its descendants and their addresses.
    pub async fn delete_block(&self, scope: &AccessScope, id: BlockId) -> Result<(), IpamError> {
        let block = self.get_block(scope, id).await?;

        sqlx::query("DELETE FROM blocks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.audit("delete_block", Some(block.tenant_id), Some(block.network.to_string().as_str()), "{}")
            .await?;
        info!(block = %block.network, id, "Deleted block");
        Ok(())
    }

    /// Nested view of a block, its descendants and their addresses.
    pub async fn block_hierarchy(&self, scope: &AccessScope, id: BlockId) -> Result<BlockNode, IpamError> {
        let tree = self.load_tree().await?;
        tree.get_scoped(id, scope)
            .ok_or(ValidationError::BlockNotFound(id))?;

        let mut by_block: HashMap<BlockId, Vec<AddressRecord>> = HashMap::new();
        for block_id in tree.subtree_ids(id) {
            by_block.insert(block_id, self.addresses_in_block(block_id).await?);
        }

        tree.hierarchy(id, &mut |block: &BlockRecord| by_block.remove(&block.id).unwrap_or_default())
            .ok_or_else(|| ValidationError::BlockNotFound(id).into())
    }

    // Addresses

    async fn addresses_in_block(&self, block_id: BlockId) -> Result<Vec<AddressRecord>, IpamError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM addresses WHERE block_id = ? ORDER BY id",
            ADDRESS_COLUMNS
        ))
        .bind(block_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|r| self.row_to_address(r)).collect()
    }

    /// Addresses registered in a block, in ascending address order.
    pub async fn list_addresses(
        &self,
        scope: &AccessScope,
        block_id: BlockId,
    ) -> Result<Vec<AddressRecord>, IpamError> {
        self.get_block(scope, block_id).await?;
        let mut addresses = self.addresses_in_block(block_id).await?;
        addresses.sort_by_key(|a| a.ip);
        Ok(addresses)
    }

    /// The address the allocator would hand out next.
    pub async fn suggest_next_address(
        &self,
        scope: &AccessScope,
        block_id: BlockId,
    ) -> Result<Option<IpAddr>, IpamError> {
        let tree = self.load_tree().await?;
        let block = tree
            .get_scoped(block_id, scope)
            .ok_or(ValidationError::BlockNotFound(block_id))?;
        let taken = self
            .addresses_in_block(block_id)
            .await?
            .into_iter()
            .map(|a| a.ip)
            .collect();

        Ok(crate::ipblock::suggest_next_address(block, &tree, &taken)?)
    }

    /// Validate and store an address, allocating one if `ip` is empty.
    pub async fn create_address(
        &self,
        scope: &AccessScope,
        mut draft: AddressDraft,
    ) -> Result<AddressRecord, IpamError> {
        draft.id = None;
        self.save_address(scope, draft).await
    }

    /// Validate and apply changes to an existing address.
    pub async fn update_address(
        &self,
        scope: &AccessScope,
        id: AddressId,
        mut draft: AddressDraft,
    ) -> Result<AddressRecord, IpamError> {
        let current = self.get_address(scope, id).await?;
        draft.id = Some(id);
        draft.block_id = Some(current.block_id);
        if draft.ip.is_none() {
            draft.ip = Some(current.ip);
        }
        self.save_address(scope, draft).await
    }

    async fn save_address(&self, scope: &AccessScope, draft: AddressDraft) -> Result<AddressRecord, IpamError> {
        let tree = self.load_tree().await?;
        let existing = match draft.block_id {
            Some(block_id) => self.addresses_in_block(block_id).await?,
            None => Vec::new(),
        };
        let port_device = match draft.port_id {
            Some(port_id) => self.find_port(port_id).await?.map(|p| p.device_id),
            None => None,
        };

        let ctx = AddressContext {
            tree: &tree,
            existing: &existing,
            port_device,
            scope: *scope,
        };
        let draft = prepare_address(draft, &ctx)?;

        let block_id = draft.block_id.ok_or(ValidationError::MissingBlock)?;
        let device_id = draft.device_id.ok_or(ValidationError::MissingDevice)?;
        let block = tree
            .get(block_id)
            .ok_or(ValidationError::BlockNotFound(block_id))?;
        self.require_device_of(scope, device_id, block.tenant_id).await?;

        let mut record = self.write_address(&draft, block, Utc::now()).await?;

        let action = if draft.id.is_some() { "update_address" } else { "create_address" };
        self.audit(
            action,
            Some(block.tenant_id),
            Some(record.ip.to_string().as_str()),
            &serde_json::json!({"block": block.network.to_string(), "gateway": record.is_gateway})
                .to_string(),
        )
        .await?;
        info!(address = %record.ip, block = %block.network, gateway = record.is_gateway, "Saved address");

        if let Some(previous) = existing.iter().find(|a| Some(a.id) == draft.id) {
            record.created_at = previous.created_at;
        }
        Ok(record)
    }

    /// Insert or update a validated address row.
    async fn write_address(
        &self,
        draft: &AddressDraft,
        block: &BlockRecord,
        now: DateTime<Utc>,
    ) -> Result<AddressRecord, IpamError> {
        let (Some(ip), Some(device_id), Some(port_id)) = (draft.ip, draft.device_id, draft.port_id)
        else {
            return Err(IpamError::InvalidInput("incomplete address record".to_string()));
        };

        let result = match draft.id {
            None => sqlx::query(
                r#"
                INSERT INTO addresses (block_id, ip, device_id, port_id, purpose, next_hop, is_gateway, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(block.id)
            .bind(ip.to_string())
            .bind(device_id)
            .bind(port_id)
            .bind(&draft.purpose)
            .bind(draft.next_hop.map(|h| h.to_string()))
            .bind(draft.is_gateway)
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await
            .map(|r| r.last_insert_rowid()),
            Some(id) => sqlx::query(
                r#"
                UPDATE addresses SET ip = ?, device_id = ?, port_id = ?, purpose = ?, next_hop = ?, is_gateway = ?
                WHERE id = ?
                "#,
            )
            .bind(ip.to_string())
            .bind(device_id)
            .bind(port_id)
            .bind(&draft.purpose)
            .bind(draft.next_hop.map(|h| h.to_string()))
            .bind(draft.is_gateway)
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| id),
        };

        // The (block, ip) constraint catches a concurrent writer that
        // picked the same address.
        let id = result.map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                IpamError::Validation(ValidationError::DuplicateAddress {
                    addr: ip,
                    block: block.network,
                })
            }
            other => IpamError::Database(other),
        })?;

        Ok(AddressRecord {
            id,
            block_id: block.id,
            ip,
            device_id,
            port_id,
            purpose: draft.purpose.clone(),
            next_hop: draft.next_hop,
            is_gateway: draft.is_gateway,
            created_at: now,
        })
    }

    /// Register several addresses in one block. Each item is validated on
    /// its own; failures are counted and skipped.
    pub async fn create_addresses_bulk(
        &self,
        scope: &AccessScope,
        block_id: BlockId,
        request: BulkAddressRequest,
    ) -> Result<BulkReport, IpamError> {
        let total = request.ips.len().checked_add(request.count);
        if total == Some(0) {
            return Err(IpamError::InvalidInput("no addresses requested".to_string()));
        }
        if !matches!(total, Some(n) if n <= self.config.bulk_limit) {
            return Err(IpamError::InvalidInput(format!(
                "at most {} addresses may be registered at once",
                self.config.bulk_limit
            )));
        }
        let block = self.get_block(scope, block_id).await?;

        let items = request
            .ips
            .iter()
            .copied()
            .map(Some)
            .chain(std::iter::repeat(None).take(request.count));

        let mut report = BulkReport::default();
        for ip in items {
            let draft = AddressDraft {
                id: None,
                block_id: Some(block_id),
                ip,
                device_id: request.device_id,
                port_id: request.port_id,
                purpose: request.purpose.clone(),
                next_hop: None,
                is_gateway: false,
            };
            match self.create_address(scope, draft).await {
                Ok(record) => report.created.push(record),
                Err(e) => {
                    let label = ip.map_or_else(|| "auto".to_string(), |ip| ip.to_string());
                    warn!(block = %block.network, address = %label, error = %e, "Skipping address");
                    report.failed += 1;
                    report.errors.push(format!("{}: {}", label, e));
                }
            }
        }

        info!(
            block = %block.network,
            created = report.created.len(),
            failed = report.failed,
            "Bulk address registration finished"
        );
        Ok(report)
    }

    /// Get an address whose block is visible to `scope`.
    pub async fn get_address(&self, scope: &AccessScope, id: AddressId) -> Result<AddressRecord, IpamError> {
        let row = sqlx::query(&format!("SELECT {} FROM addresses WHERE id = ?", ADDRESS_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let address = row
            .map(|r| self.row_to_address(&r))
            .transpose()?
            .ok_or_else(|| IpamError::NotFound(format!("Address {}", id)))?;
        self.get_block(scope, address.block_id)
            .await
            .map_err(|_| IpamError::NotFound(format!("Address {}", id)))?;
        Ok(address)
    }

    /// Release an address.
    pub async fn delete_address(&self, scope: &AccessScope, id: AddressId) -> Result<(), IpamError> {
        let address = self.get_address(scope, id).await?;

        sqlx::query("DELETE FROM addresses WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.audit("delete_address", None, Some(address.ip.to_string().as_str()), "{}").await?;
        info!(address = %address.ip, "Released address");
        Ok(())
    }

    // Audit logging

    async fn audit(
        &self,
        action: &str,
        tenant_id: Option<TenantId>,
        subject: Option<&str>,
        details: &str,
    ) -> Result<(), IpamError> {
        sqlx::query(
            "INSERT INTO audit_log (timestamp, action, tenant_id, subject, details) VALUES (datetime('now'), ?, ?, ?, ?)",
        )
        .bind(action)
        .bind(tenant_id)
        .bind(subject)
        .bind(details)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // Helper functions

    async fn require_device_of(
        &self,
        scope: &AccessScope,
        device_id: DeviceId,
        tenant_id: TenantId,
    ) -> Result<Device, IpamError> {
        let device = self.get_device(scope, device_id).await?;
        if device.tenant_id != tenant_id {
            return Err(IpamError::InvalidInput(format!(
                "device {} belongs to another tenant",
                device.name
            )));
        }
        Ok(device)
    }

    fn row_to_block(&self, row: &SqliteRow) -> Result<BlockRecord, IpamError> {
        let family: String = row.get("family");
        let cidr: String = row.get("cidr");

        Ok(BlockRecord {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            family: family.parse().map_err(IpamError::InvalidRecord)?,
            network: cidr
                .parse()
                .map_err(|_| IpamError::InvalidRecord(format!("block cidr {}", cidr)))?,
            description: row.get("description"),
            parent_id: row.get("parent_id"),
            device_id: row.get("device_id"),
            created_at: parse_time(row.get("created_at"))?,
        })
    }

    fn row_to_address(&self, row: &SqliteRow) -> Result<AddressRecord, IpamError> {
        let ip: String = row.get("ip");
        let next_hop: Option<String> = row.get("next_hop");

        Ok(AddressRecord {
            id: row.get("id"),
            block_id: row.get("block_id"),
            ip: parse_ip(&ip)?,
            device_id: row.get("device_id"),
            port_id: row.get("port_id"),
            purpose: row.get("purpose"),
            next_hop: next_hop.as_deref().map(parse_ip).transpose()?,
            is_gateway: row.get("is_gateway"),
            created_at: parse_time(row.get("created_at"))?,
        })
    }

    fn row_to_device(&self, row: &SqliteRow) -> Result<Device, IpamError> {
        let mgmt_ip: Option<String> = row.get("mgmt_ip");

        Ok(Device {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            name: row.get("name"),
            mgmt_ip: mgmt_ip.as_deref().map(parse_ip).transpose()?,
            created_at: parse_time(row.get("created_at"))?,
        })
    }

    fn row_to_token(&self, row: &SqliteRow) -> Result<Token, IpamError> {
        let expires_at: Option<String> = row.get("expires_at");

        Ok(Token {
            id: row.get("id"),
            token_hash: row.get("token_hash"),
            name: row.get("name"),
            tenant_id: row.get("tenant_id"),
            is_admin: row.get("is_admin"),
            created_at: parse_time(row.get("created_at"))?,
            expires_at: expires_at.as_deref().map(parse_time).transpose()?,
            revoked: row.get("revoked"),
        })
    }
}

fn row_to_port(row: &SqliteRow) -> Port {
    Port {
        id: row.get("id"),
        device_id: row.get("device_id"),
        name: row.get("name"),
        peer_port_id: row.get("peer_port_id"),
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, IpamError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| IpamError::InvalidRecord(format!("timestamp {}", value)))
}

fn parse_ip(value: &str) -> Result<IpAddr, IpamError> {
    value
        .parse()
        .map_err(|_| IpamError::InvalidRecord(format!("address {}", value)))
}
