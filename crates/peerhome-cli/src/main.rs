//! Peerhome CLI
//!
//! Thin wrapper around peerhome-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Create a local identity with one device
//! peerhome identity new --name Love
//!
//! # Mint an invite token for it
//! peerhome invite create --identity <hash>
//!
//! # Look inside a token
//! peerhome invite inspect <token>
//!
//! # Endpoint a respondent would listen on, and check it back
//! peerhome invite receiver-endpoint <token> <identity-hash>
//! peerhome invite check-endpoint <token> <endpoint>
//!
//! # Deterministic peer-group ids
//! peerhome group-id contact <hash-a> <hash-b>
//!
//! # Two identities through a whole handshake, in process
//! peerhome demo
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peerhome_core::group::{contact_pair_group_id, device_group_id, invite_group_id};
use peerhome_core::{
    endpoint, AccountDevices, Contacts, Device, DeviceCloud, HomeConfig, Identity, InviteToken,
    LinkupServer, MemoryMesh, MemoryStore, Module, ObjectHash, RedbStore, Replica, Store,
};

/// Peerhome - device clouds, contacts and invites over peer groups
#[derive(Parser)]
#[command(name = "peerhome")]
#[command(version = "0.1.0")]
#[command(about = "Peerhome - device clouds, contacts and invites over peer groups")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.peerhome/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Local identity management
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Invite token tools
    Invite {
        #[command(subcommand)]
        action: InviteAction,
    },

    /// Plain device endpoints
    Endpoint {
        #[command(subcommand)]
        action: EndpointAction,
    },

    /// Compute peer-group ids
    GroupId {
        #[command(subcommand)]
        action: GroupIdAction,
    },

    /// Run a two-party invite handshake in process
    Demo,
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Create an identity and a local device for it
    New {
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Linkup server the device listens on
        #[arg(short, long)]
        linkup: Option<String>,
    },
    /// Show a stored identity and its devices
    Show {
        /// Identity hash
        hash: String,
    },
}

#[derive(Subcommand)]
enum InviteAction {
    /// Mint an invite token for a stored identity
    Create {
        /// Identity hash
        #[arg(short, long)]
        identity: String,
        /// Linkup locator to advertise (default: the identity's own)
        #[arg(short, long)]
        linkup: Option<String>,
    },
    /// Show what a token contains
    Inspect {
        /// Encoded token (home-invite:...)
        token: String,
    },
    /// Encrypted endpoint a respondent listens on
    ReceiverEndpoint {
        token: String,
        /// Respondent identity hash
        identity: String,
    },
    /// Tell who is behind an endpoint, if the token can
    CheckEndpoint { token: String, endpoint: String },
    /// Plain reply endpoint for a respondent
    ReplyEndpoint {
        token: String,
        /// Respondent identity hash
        identity: String,
    },
}

#[derive(Subcommand)]
enum EndpointAction {
    /// Build a device endpoint
    Device { locator: String, device: String },
    /// Extract the device hash from an endpoint
    Decode { endpoint: String },
}

#[derive(Subcommand)]
enum GroupIdAction {
    /// Device group of an identity
    Devices { owner: String },
    /// Contact-pair group of two identities
    Contact { a: String, b: String },
    /// Invite group of a token (encoded token or token hash)
    Invite { token: String },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.peerhome/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peerhome")
        .join("data")
}

fn open_store(data_dir: &Path) -> Result<RedbStore> {
    let path = data_dir.join("peerhome.redb");
    RedbStore::new(&path).with_context(|| format!("opening store at {}", path.display()))
}

fn parse_token(s: &str) -> Result<InviteToken> {
    InviteToken::decode(s).map_err(|e| anyhow::anyhow!("Invalid invite token: {}", e))
}

/// The saved account record of `owner`, opened in a scratch replica
async fn load_account(
    store: &RedbStore,
    owner: &ObjectHash,
    config: &HomeConfig,
) -> Result<AccountDevices> {
    let account = AccountDevices::open(&Replica::new(), owner.clone(), config)?;
    if !account.load_from(store).await? {
        anyhow::bail!("Identity {} has no account record", owner);
    }
    Ok(account)
}

async fn load_identity(store: &RedbStore, hash: &ObjectHash) -> Result<Identity> {
    peerhome_core::storage::load_identity(store, hash)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Identity {} not found", hash))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => HomeConfig::load(path)?,
        None => HomeConfig::default(),
    };
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);

    match cli.command {
        Commands::Identity { action } => match action {
            IdentityAction::New { name, linkup } => {
                let server = linkup.map(LinkupServer::new).transpose()?;
                let store = open_store(&data_dir)?;
                let identity = Identity::generate(Some(name.as_str()));
                let device = Device::new(identity.hash());

                store.save(&identity.clone().into()).await?;
                store.save(&device.clone().into()).await?;

                let account = AccountDevices::open(&Replica::new(), identity.hash(), &config)?;
                account.add_device(device.clone())?;
                if let Some(server) = &server {
                    account.add_linkup_server(&identity.hash(), server.clone())?;
                }
                account.save_to(&store).await?;

                println!("Created identity:");
                println!("  Identity: {}", identity.hash());
                println!("  Device: {}", device.hash());
                if let Some(server) = server {
                    println!("  Linkup: {}", server.url);
                }
            }

            IdentityAction::Show { hash } => {
                let store = open_store(&data_dir)?;
                let hash = ObjectHash::new(hash);
                let identity = load_identity(&store, &hash).await?;

                println!("Identity: {}", hash);
                println!("  Name: {}", identity.info.as_deref().unwrap_or("(none)"));
                println!("  Public key: {}", hex_prefix(&identity.public_key));
                let account = load_account(&store, &hash, &config).await?;
                for device in account.devices().values() {
                    println!("  Device: {}", device.hash());
                }
                for server in account.linkup_servers().values() {
                    println!("  Linkup: {}", server.url);
                }
            }
        },

        Commands::Invite { action } => match action {
            InviteAction::Create { identity, linkup } => {
                let store = open_store(&data_dir)?;
                let hash = ObjectHash::new(identity);
                let identity = load_identity(&store, &hash).await?;
                let account = load_account(&store, &hash, &config).await?;
                let devices = account.devices().values();
                if devices.is_empty() {
                    anyhow::bail!("Identity {} has no devices", hash);
                }

                let linkup = linkup.unwrap_or_else(|| account.linkup_locator());
                let token = InviteToken::new(&identity, devices.iter(), linkup, config.secret_bits);
                println!("{}", token.encode()?);
            }

            InviteAction::Inspect { token } => {
                let token = parse_token(&token)?;
                println!("Invite token:");
                println!("  ID: {}", token.hash());
                println!("  Sender: {}", token.sender_identity_hash);
                if let Some(info) = &token.sender_info {
                    println!("  Sender info: {}", info);
                }
                println!("  Linkup: {}", token.sender_linkup);
                for device in &token.sender_devices {
                    println!("  Device: {}", device);
                }
                println!("  Sender slot: {}", token.sender_slot_id());
                println!("  Reply slot: {}", token.reply_slot_id());
                println!(
                    "  Group: {}",
                    invite_group_id(&config.group_prefix, &token.hash())
                );
            }

            InviteAction::ReceiverEndpoint { token, identity } => {
                let token = parse_token(&token)?;
                let peer = token.receiver_peer(&ObjectHash::new(identity))?;
                println!("{}", peer.endpoint);
            }

            InviteAction::CheckEndpoint { token, endpoint } => {
                let token = parse_token(&token)?;
                if let Some(peer) = token.parse_sender_endpoint(&endpoint) {
                    println!("Sender device of {}", token.sender_identity_hash);
                    println!("  Endpoint: {}", peer.endpoint);
                } else if let Some(identity) = token
                    .parse_receiver_endpoint(&endpoint)
                    .and_then(|peer| peer.identity_hash)
                {
                    println!("Identity: {}", identity);
                } else {
                    println!("not recognized");
                }
            }

            InviteAction::ReplyEndpoint { token, identity } => {
                let token = parse_token(&token)?;
                let peer = token.reply_peer(&ObjectHash::new(identity))?;
                println!("{}", peer.endpoint);
            }
        },

        Commands::Endpoint { action } => match action {
            EndpointAction::Device { locator, device } => {
                println!(
                    "{}",
                    endpoint::device_endpoint(&locator, &ObjectHash::new(device))
                );
            }
            EndpointAction::Decode { endpoint } => {
                let device = endpoint::device_hash_from_endpoint(&endpoint)?;
                println!("{}", device);
            }
        },

        Commands::GroupId { action } => {
            let prefix = &config.group_prefix;
            let id = match action {
                GroupIdAction::Devices { owner } => device_group_id(prefix, &ObjectHash::new(owner)),
                GroupIdAction::Contact { a, b } => {
                    contact_pair_group_id(prefix, &ObjectHash::new(a), &ObjectHash::new(b))
                }
                GroupIdAction::Invite { token } => {
                    let hash = if token.starts_with("home-invite:") {
                        parse_token(&token)?.hash()
                    } else {
                        ObjectHash::new(token)
                    };
                    invite_group_id(prefix, &hash)
                }
            };
            println!("{}", id);
        }

        Commands::Demo => run_demo(config).await?,
    }

    Ok(())
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

struct DemoParty {
    name: &'static str,
    owner: Identity,
    mesh: Arc<MemoryMesh>,
    contacts: Contacts,
}

async fn demo_party(
    name: &'static str,
    replica: &Arc<Replica>,
    config: &HomeConfig,
) -> Result<DemoParty> {
    let store = Arc::new(MemoryStore::new());
    let mesh = Arc::new(MemoryMesh::new());
    let owner = Identity::generate(Some(name));
    let device = Device::new(owner.hash());
    store.save(&owner.clone().into()).await?;
    store.save(&device.clone().into()).await?;

    let cloud = DeviceCloud::new(
        owner.hash(),
        device.hash(),
        config.clone(),
        store.clone(),
        mesh.clone(),
        replica.clone(),
    );
    cloud.init().await?;
    cloud.start().await?;

    let contacts = Contacts::init(&cloud, replica.clone(), store, mesh.clone()).await?;
    contacts.start().await?;

    Ok(DemoParty {
        name,
        owner,
        mesh,
        contacts,
    })
}

fn print_groups(party: &DemoParty) {
    println!("  {} ({}) is in:", party.name, party.owner.hash());
    for id in party.mesh.group_ids() {
        println!("    {}", id);
    }
}

async fn run_demo(config: HomeConfig) -> Result<()> {
    // One replica stands in for the converged shared state
    let replica = Arc::new(Replica::new());
    let love = demo_party("Love", &replica, &config).await?;
    let joy = demo_party("Joy", &replica, &config).await?;

    let invite = love.contacts.create_invite(joy.name).await?;
    love.contacts.settle().await;
    let token_hash = invite.hash();
    println!("{} created invite {}", love.name, token_hash);
    print_groups(&love);

    let token = InviteToken::decode(&invite.token.encode()?)?;
    joy.contacts.receive_token(token.clone());
    joy.contacts.accept_invite(token)?;
    joy.contacts.settle().await;
    println!("{} accepted the invite", joy.name);
    print_groups(&joy);

    let added = love.contacts.complete_invite(&token_hash).await?;
    love.contacts.settle().await;
    let accepted = joy.contacts.complete_acceptance(&token_hash).await?;
    joy.contacts.settle().await;

    match (added, accepted) {
        (Some(a), Some(b)) => {
            println!("{} added contact {}", love.name, a);
            println!("{} added contact {}", joy.name, b);
        }
        _ => anyhow::bail!("Handshake did not complete"),
    }
    tracing::info!(token = %token_hash, "demo handshake complete");

    println!("Groups after the handshake:");
    print_groups(&love);
    print_groups(&joy);

    joy.contacts.stop().await?;
    love.contacts.stop().await?;
    Ok(())
}
