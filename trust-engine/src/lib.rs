//! # trust-engine
//!
//! Per-account engine for 0k-Trust.
//!
//! This is the library applications embed to keep a device in its
//! account's trust circle and to obtain the per-view key sets they
//! encrypt items with.
//!
//! ## Features
//!
//! - **Serialized account queue**: one owner task per account runs the
//!   flag-driven state machine from trust-core
//! - **Transport Abstraction**: pluggable relay transport with local rate limiting
//! - **Durable state**: circle, key sets, flags and relay cursor survive restarts
//! - **Snapshots**: readers get immutable `Arc<AccountSnapshot>` values
//!
//! ## Example
//!
//! ```ignore
//! use zerok_trust_engine::{AccountEngine, EngineConfig, MemoryStore, MockTransport};
//!
//! let engine = AccountEngine::spawn(
//!     AccountId::new("alice"),
//!     EngineConfig::default(),
//!     LocalIdentity::generate()?,
//!     MachineList::unrestricted(),
//!     MockTransport::new(),
//!     Arc::new(MemoryStore::new()),
//! )
//! .await?;
//!
//! engine.join().await?;
//! let status = engine.settle().await?;
//! println!("{}", status.summary());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod account;
pub mod config;
pub mod error;
pub mod limits;
pub mod registry;
pub mod status;
pub mod store;
pub mod transport;

pub use account::machine::{EngineFlag, EngineOp, EnginePredicate, EngineState};
pub use account::{AccountEngine, PeerMessage};
pub use config::{
    AccountConfig, ConfigError, EngineConfig, FetchConfig, LimitsConfig, RetryConfig,
    StorageConfig,
};
pub use error::{EngineError, StoreError};
pub use limits::{RateLimitError, RateLimits};
pub use registry::AccountRegistry;
pub use status::{AccountSnapshot, AccountStatus};
pub use store::{MemoryStore, PersistedAccount, SqliteStore, StateStore};
pub use transport::{
    MockTransport, Pulled, RateLimitedTransport, RelayItem, Transport, TransportError,
};
