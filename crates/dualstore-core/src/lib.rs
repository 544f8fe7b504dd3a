//! dualstore-core: keep a spreadsheet store and a SQLite store of the same
//! records in agreement, and protect either one at rest.
//!
//! # Encryption
//! Each store file is sealed whole with XChaCha20-Poly1305 into a sibling
//! `<store>.enc` artifact. Keys live in their own small files and are created
//! on first use.
//!
//! # Modules
//! - `keystore`     : key files: create once, load thereafter
//! - `cipher_store` : encrypt / decrypt a store file, explicit discard
//! - `sources`      : read-only spreadsheet and SQLite readers
//! - `record_set`   : normalized rows and multiset difference
//! - `reconciler`   : direct and encrypted store comparison
//! - `temp_artifact`: scoped decrypted copies used by comparisons

pub mod cipher_store;
pub mod crypto;
pub mod error;
pub mod keystore;
pub mod paths;
pub mod reconciler;
pub mod record_set;
pub mod settings;
pub mod sources;
pub mod temp_artifact;

pub use cipher_store::{
    discard_artifact, discard_stores, CipherStore, DecryptMode, Decrypted, DiscardOutcome,
    StoreDiscard,
};
pub use error::{Result, SyncError};
pub use keystore::{ensure_key, load_key, EnsuredKey, Key};
pub use reconciler::{ReconReport, Reconciler, StoreRef};
pub use record_set::{Difference, Record, RecordSet};
pub use settings::{load_settings, SyncSettings};
pub use sources::{RawTable, RecordSource, RelationalStore, StoreKind, TabularSource};
