//! Peerhome Core Library
//!
//! Device clouds, contacts and invite handshakes over dynamic peer groups.
//!
//! ## Overview
//!
//! Every identity owns a set of devices. Those devices form one peer group
//! and keep the identity's records in sync. Each contact gets a peer group
//! of its own that spans both identities' devices, and every pending invite
//! gets a short-lived group where the two parties find each other using
//! nothing more than the invite secret.
//!
//! ## Layers
//!
//! - **Endpoints**: encode who is behind a connection (`endpoint`, `crypto`)
//! - **Peer sources**: answer "who should I connect to" (`peers`)
//! - **Peer groups**: idempotent mesh membership plus sync targets (`group`)
//! - **Modules**: the device cloud and the contacts orchestrator, which
//!   create and discard groups as the replicated sets change
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use peerhome_core::{Contacts, DeviceCloud, HomeConfig, MemoryMesh, Module, Replica};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cloud = DeviceCloud::new(owner, device, HomeConfig::default(), store, mesh, replica);
//!     cloud.init().await?;
//!     let contacts = Contacts::init(&cloud, replica, store, mesh).await?;
//!
//!     cloud.start().await?;
//!     contacts.start().await?;
//!
//!     let invite = contacts.create_invite("a friend").await?;
//!     println!("{}", invite.token.encode()?);
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod config;
pub mod contacts;
pub mod crypto;
pub mod device_cloud;
pub mod endpoint;
pub mod error;
pub mod group;
pub mod invite;
pub mod mesh;
pub mod module;
pub mod peers;
pub mod replica;
pub mod storage;
pub mod types;

// Re-exports
pub use account::{AccountDevices, AccountRecord};
pub use config::HomeConfig;
pub use contacts::{AddressBook, Contacts, GroupKind, HomeEvent};
pub use device_cloud::DeviceCloud;
pub use error::{HomeError, HomeResult};
pub use group::{ObjectRef, PeerGroup, SyncTarget};
pub use invite::{Invite, InviteReply, InviteToken};
pub use mesh::{MemoryMesh, Mesh, PeerGroupInfo};
pub use module::{Module, ModuleSyncs};
pub use peers::{
    InviteReceiverSource, InviteSenderSource, JoinedPeerSource, MappedCollectionSource, PeerSource,
};
pub use replica::{Replica, ReplicatedRef, ReplicatedSet};
pub use storage::{MemoryStore, RedbStore, Store, StoredObject};
pub use types::*;
