//! ISP documentation IPAM
//!
//! Hierarchical IP block and address management for ISP networks: tenants
//! own CIDR blocks that are split in halves down to point-to-point links,
//! and addresses are handed out from leaf blocks to device ports.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod config;
mod db;
mod ipblock;
mod ping;
mod scope;

use config::{load_config, Config, DEFAULT_CONFIG_PATH};
use db::Ipam;
use ipblock::{AddressDraft, AddressFamily, BlockDraft, BlockId, BlockNode, DeviceId, PortId, TenantId};
use scope::AccessScope;

/// Local commands act as administrator.
const LOCAL: AccessScope = AccessScope::Unrestricted;

/// ISP documentation IPAM
#[derive(Parser)]
#[command(name = "ispdoc-ipam")]
#[command(about = "Hierarchical IP block and address management for ISP networks")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server
    Run {
        /// Override API listen host
        #[arg(long)]
        host: Option<String>,

        /// Override API listen port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate configuration and exit
    CheckConfig,

    /// Tenant management
    Tenant {
        #[command(subcommand)]
        action: TenantAction,
    },

    /// Token management commands
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Device inventory
    Device {
        #[command(subcommand)]
        action: DeviceAction,
    },

    /// Device ports and cabling
    Port {
        #[command(subcommand)]
        action: PortAction,
    },

    /// IP block management
    Block {
        #[command(subcommand)]
        action: BlockAction,
    },

    /// Address registration
    Address {
        #[command(subcommand)]
        action: AddressAction,
    },
}

#[derive(Subcommand)]
enum TenantAction {
    /// Create a tenant
    Create {
        /// Tenant name
        name: String,
    },

    /// List all tenants
    List,
}

#[derive(Subcommand)]
enum TokenAction {
    /// Create a new API token
    Create {
        /// Token name
        #[arg(short, long)]
        name: Option<String>,

        /// Tenant the token is limited to
        #[arg(short, long)]
        tenant: Option<TenantId>,

        /// Create admin token
        #[arg(short, long)]
        admin: bool,
    },

    /// List all tokens
    List,
}

#[derive(Subcommand)]
enum DeviceAction {
    /// Register a device
    Create {
        /// Owning tenant
        #[arg(short, long)]
        tenant: TenantId,

        /// Device name
        name: String,

        /// Management address
        #[arg(long)]
        mgmt_ip: Option<IpAddr>,
    },

    /// List devices
    List,
}

#[derive(Subcommand)]
enum PortAction {
    /// Add a port to a device
    Create {
        /// Device id
        #[arg(short, long)]
        device: DeviceId,

        /// Port name
        name: String,
    },

    /// List the ports of a device
    List {
        /// Device id
        device: DeviceId,
    },

    /// Cable two ports together
    Connect { a: PortId, b: PortId },

    /// Remove the cable from a port
    Disconnect { port: PortId },
}

#[derive(Subcommand)]
enum BlockAction {
    /// Create a block
    Create {
        /// Owning tenant
        #[arg(short, long)]
        tenant: TenantId,

        /// Network in CIDR notation
        cidr: String,

        /// Address family (IPv4 or IPv6); taken from the CIDR if omitted
        #[arg(long)]
        family: Option<AddressFamily>,

        /// Parent block id
        #[arg(short, long)]
        parent: Option<BlockId>,

        /// Description
        #[arg(long)]
        description: Option<String>,

        /// Device the block is attached to
        #[arg(long)]
        device: Option<DeviceId>,
    },

    /// List all blocks
    List,

    /// Split a leaf block in two halves
    Subdivide { id: BlockId },

    /// Show a block with its sub-blocks and addresses
    Tree { id: BlockId },

    /// Show the next free address of a block
    Next { id: BlockId },
}

#[derive(Subcommand)]
enum AddressAction {
    /// Register an address; the next free one is used if none is given
    Create {
        /// Block id
        #[arg(short, long)]
        block: BlockId,

        /// Address to register
        #[arg(long)]
        ip: Option<IpAddr>,

        /// Device id
        #[arg(short, long)]
        device: DeviceId,

        /// Port id
        #[arg(short, long)]
        port: PortId,

        /// Purpose of the address
        #[arg(long, default_value = "")]
        purpose: String,

        /// Mark as the block's gateway
        #[arg(long)]
        gateway: bool,

        /// Next hop (required for gateways)
        #[arg(long)]
        next_hop: Option<IpAddr>,
    },

    /// List the addresses of a block
    List {
        /// Block id
        block: BlockId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = load_config(Some(&cli.config)).context("Failed to load configuration")?;

    match cli.command {
        Some(Commands::CheckConfig) => cmd_check_config(&config),
        Some(Commands::Tenant { action }) => cmd_tenant(&config, action).await,
        Some(Commands::Token { action }) => cmd_token(&config, action).await,
        Some(Commands::Device { action }) => cmd_device(&config, action).await,
        Some(Commands::Port { action }) => cmd_port(&config, action).await,
        Some(Commands::Block { action }) => cmd_block(&config, action).await,
        Some(Commands::Address { action }) => cmd_address(&config, action).await,
        Some(Commands::Run { host, port }) => cmd_run(&config, host, port).await,
        None => cmd_run(&config, None, None).await,
    }
}

async fn open_ipam(config: &Config) -> Result<Ipam> {
    Ipam::new(&config.database.path, config.ipam.clone())
        .await
        .context("Failed to open IPAM database")
}

fn cmd_check_config(config: &Config) -> Result<()> {
    println!("Configuration is valid");

    println!("\nAPI:");
    println!("  Listen: {}:{}", config.api.listen_host, config.api.listen_port);

    println!("\nDatabase:");
    println!("  Path: {}", config.database.path.display());

    println!("\nIPAM:");
    println!("  Bulk limit: {}", config.ipam.bulk_limit);

    println!("\nPing:");
    println!("  Command: {}", config.ping.command);
    println!("  Count:   {}", config.ping.count);
    println!("  Timeout: {}s", config.ping.timeout_secs);

    Ok(())
}

async fn cmd_tenant(config: &Config, action: TenantAction) -> Result<()> {
    let ipam = open_ipam(config).await?;

    match action {
        TenantAction::Create { name } => {
            let tenant = ipam.create_tenant(&name).await.context("Failed to create tenant")?;
            println!("Tenant created: {} (id {})", tenant.name, tenant.id);
        }
        TenantAction::List => {
            let tenants = ipam.list_tenants(&LOCAL).await.context("Failed to list tenants")?;
            if tenants.is_empty() {
                println!("No tenants found");
            } else {
                println!("{:<5} {:<30} {}", "ID", "Name", "Created");
                println!("{}", "-".repeat(55));
                for t in &tenants {
                    println!("{:<5} {:<30} {}", t.id, t.name, t.created_at.format("%Y-%m-%d %H:%M"));
                }
            }
        }
    }

    Ok(())
}

async fn cmd_token(config: &Config, action: TokenAction) -> Result<()> {
    let ipam = open_ipam(config).await?;

    match action {
        TokenAction::Create { name, tenant, admin } => {
            let (token, token_obj) = ipam
                .create_token(name.as_deref(), tenant, admin)
                .await
                .context("Failed to create token")?;

            println!("Token created successfully!");
            println!("  ID:          {}", token_obj.id);
            println!("  Name:        {}", token_obj.name.as_deref().unwrap_or("(none)"));
            println!(
                "  Tenant:      {}",
                token_obj.tenant_id.map_or_else(|| "(all)".to_string(), |t| t.to_string())
            );
            println!("  Admin:       {}", token_obj.is_admin);
            println!();
            println!("  Token: {}", token);
            println!();
            println!("Save this token securely - it cannot be retrieved later!");
        }
        TokenAction::List => {
            let tokens = ipam.list_tokens().await.context("Failed to list tokens")?;
            if tokens.is_empty() {
                println!("No tokens found");
            } else {
                println!("{:<5} {:<20} {:<8} {:<6} {:<8}", "ID", "Name", "Tenant", "Admin", "Revoked");
                println!("{}", "-".repeat(51));
                for t in &tokens {
                    println!(
                        "{:<5} {:<20} {:<8} {:<6} {:<8}",
                        t.id,
                        t.name.as_deref().unwrap_or("(none)"),
                        t.tenant_id.map_or_else(|| "-".to_string(), |id| id.to_string()),
                        t.is_admin,
                        t.revoked,
                    );
                }
            }
        }
    }

    Ok(())
}

async fn cmd_device(config: &Config, action: DeviceAction) -> Result<()> {
    let ipam = open_ipam(config).await?;

    match action {
        DeviceAction::Create { tenant, name, mgmt_ip } => {
            let device = ipam
                .create_device(&LOCAL, tenant, &name, mgmt_ip)
                .await
                .context("Failed to create device")?;
            println!("Device created: {} (id {})", device.name, device.id);
        }
        DeviceAction::List => {
            let devices = ipam.list_devices(&LOCAL).await.context("Failed to list devices")?;
            if devices.is_empty() {
                println!("No devices found");
                return Ok(());
            }
            println!("{:<5} {:<8} {:<30} {}", "ID", "Tenant", "Name", "Management");
            println!("{}", "-".repeat(70));
            for d in &devices {
                println!(
                    "{:<5} {:<8} {:<30} {}",
                    d.id,
                    d.tenant_id,
                    d.name,
                    d.mgmt_ip.map_or_else(|| "-".to_string(), |ip| ip.to_string())
                );
            }
        }
    }

    Ok(())
}

async fn cmd_port(config: &Config, action: PortAction) -> Result<()> {
    let ipam = open_ipam(config).await?;

    match action {
        PortAction::Create { device, name } => {
            let port = ipam
                .create_port(&LOCAL, device, &name)
                .await
                .context("Failed to create port")?;
            println!("Port created: {} (id {})", port.name, port.id);
        }
        PortAction::List { device } => {
            let ports = ipam.list_ports(&LOCAL, device).await.context("Failed to list ports")?;
            println!("{:<5} {:<20} {}", "ID", "Name", "Peer");
            println!("{}", "-".repeat(35));
            for p in &ports {
                println!(
                    "{:<5} {:<20} {}",
                    p.id,
                    p.name,
                    p.peer_port_id.map_or_else(|| "-".to_string(), |id| id.to_string())
                );
            }
        }
        PortAction::Connect { a, b } => {
            let (a, b) = ipam
                .connect_ports(&LOCAL, a, b)
                .await
                .context("Failed to connect ports")?;
            println!("Connected {} <-> {}", a.name, b.name);
        }
        PortAction::Disconnect { port } => {
            let port = ipam
                .disconnect_port(&LOCAL, port)
                .await
                .context("Failed to disconnect port")?;
            println!("Disconnected {}", port.name);
        }
    }

    Ok(())
}

async fn cmd_block(config: &Config, action: BlockAction) -> Result<()> {
    let ipam = open_ipam(config).await?;

    match action {
        BlockAction::Create {
            tenant,
            cidr,
            family,
            parent,
            description,
            device,
        } => {
            let family = family.unwrap_or(if cidr.contains(':') {
                AddressFamily::V6
            } else {
                AddressFamily::V4
            });
            let draft = BlockDraft {
                id: None,
                tenant_id: tenant,
                family,
                cidr,
                description,
                parent_id: parent,
                device_id: device,
            };
            let block = ipam
                .create_block(&LOCAL, draft)
                .await
                .context("Failed to create block")?;
            println!("Block created: {} (id {})", block.network, block.id);
        }
        BlockAction::List => {
            let blocks = ipam.list_blocks(&LOCAL).await.context("Failed to list blocks")?;
            if blocks.is_empty() {
                println!("No blocks found");
                return Ok(());
            }
            println!("{:<5} {:<8} {:<6} {:<45} {:<8} {}", "ID", "Tenant", "Family", "Network", "Parent", "Description");
            println!("{}", "-".repeat(100));
            for b in &blocks {
                println!(
                    "{:<5} {:<8} {:<6} {:<45} {:<8} {}",
                    b.id,
                    b.tenant_id,
                    b.family,
                    b.network,
                    b.parent_id.map_or_else(|| "-".to_string(), |id| id.to_string()),
                    b.description.as_deref().unwrap_or("")
                );
            }
        }
        BlockAction::Subdivide { id } => {
            let (lower, upper) = ipam
                .subdivide_block(&LOCAL, id)
                .await
                .context("Failed to subdivide block")?;
            println!("Created {} (id {})", lower.network, lower.id);
            println!("Created {} (id {})", upper.network, upper.id);
        }
        BlockAction::Tree { id } => {
            let node = ipam
                .block_hierarchy(&LOCAL, id)
                .await
                .context("Failed to load block hierarchy")?;
            print_node(&node, 0);
        }
        BlockAction::Next { id } => {
            match ipam
                .suggest_next_address(&LOCAL, id)
                .await
                .context("Failed to find next address")?
            {
                Some(addr) => println!("{}", addr),
                None => println!("No address available"),
            }
        }
    }

    Ok(())
}

fn print_node(node: &BlockNode, depth: usize) {
    let indent = "  ".repeat(depth);
    println!(
        "{}{} (id {}){}",
        indent,
        node.block.network,
        node.block.id,
        node.block
            .description
            .as_deref()
            .map(|d| format!(" - {}", d))
            .unwrap_or_default()
    );
    for a in &node.addresses {
        let gateway = if a.is_gateway { " [gateway]" } else { "" };
        println!("{}  * {} {}{}", indent, a.ip, a.purpose, gateway);
    }
    for child in &node.children {
        print_node(child, depth + 1);
    }
}

async fn cmd_address(config: &Config, action: AddressAction) -> Result<()> {
    let ipam = open_ipam(config).await?;

    match action {
        AddressAction::Create {
            block,
            ip,
            device,
            port,
            purpose,
            gateway,
            next_hop,
        } => {
            let draft = AddressDraft {
                id: None,
                block_id: Some(block),
                ip,
                device_id: Some(device),
                port_id: Some(port),
                purpose,
                next_hop,
                is_gateway: gateway,
            };
            let address = ipam
                .create_address(&LOCAL, draft)
                .await
                .context("Failed to register address")?;
            println!("Address registered: {} (id {})", address.ip, address.id);
        }
        AddressAction::List { block } => {
            let addresses = ipam
                .list_addresses(&LOCAL, block)
                .await
                .context("Failed to list addresses")?;
            if addresses.is_empty() {
                println!("No addresses found");
                return Ok(());
            }
            println!("{:<5} {:<40} {:<7} {:<5} {:<8} {}", "ID", "Address", "Device", "Port", "Gateway", "Purpose");
            println!("{}", "-".repeat(90));
            for a in &addresses {
                println!(
                    "{:<5} {:<40} {:<7} {:<5} {:<8} {}",
                    a.id, a.ip, a.device_id, a.port_id, a.is_gateway, a.purpose
                );
            }
        }
    }

    Ok(())
}

async fn cmd_run(config: &Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    let ipam = open_ipam(config).await?;
    let ipam = Arc::new(Mutex::new(ipam));

    // Determine listen address
    let listen_host = host.unwrap_or_else(|| config.api.listen_host.clone());
    let listen_port = port.unwrap_or(config.api.listen_port);
    let listen_addr = format!("{}:{}", listen_host, listen_port);

    info!(listen_addr = %listen_addr, "Starting ispdoc-ipam");

    let app_state = api::AppState {
        config: config.clone(),
        ipam,
    };
    let app = api::create_router(app_state);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .context("Failed to bind to address")?;

    info!(listen_addr = %listen_addr, "API server listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
