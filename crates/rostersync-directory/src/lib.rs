//! # Directory Store
//!
//! The narrow interface through which roster imports read and write a
//! directory-backed identity store.
//!
//! ## Overview
//!
//! - **Entries**: [`StoreEntity`] addressed by an [`EntryKey`]
//!   (`uid=<rdn>,ou=<container>`), carrying an [`AttributeSet`]
//! - **Operations**: get, search by [`Filter`], create, modify with an
//!   [`AttributeDelta`], delete and move between containers
//! - **Errors**: [`DirectoryError`] classified as transient or permanent
//! - **Resilience**: [`RetryExecutor`] with bounded exponential backoff
//! - **Backends**: [`InMemoryDirectory`] with JSON snapshots
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐     ┌──────────────────────┐
//! │    Import engine     │────▶│    RetryExecutor     │
//! └──────────────────────┘     └──────────┬───────────┘
//!                                         │
//!                              ┌──────────▼───────────┐
//!                              │  dyn DirectoryStore  │
//!                              └──────────┬───────────┘
//!                                         │
//!                              ┌──────────▼───────────┐
//!                              │  InMemoryDirectory   │
//!                              │   (+ JSON snapshot)  │
//!                              └──────────────────────┘
//! ```

pub mod entry;
pub mod error;
pub mod memory;
pub mod resilience;
pub mod traits;

pub use entry::{
    AttributeDelta, AttributeSet, AttributeValue, EntryKey, Filter, NewEntity, StoreEntity,
};
pub use error::{DirectoryError, DirectoryResult};
pub use memory::{InMemoryDirectory, Snapshot, OBJECT_CLASS_ATTRIBUTE, SCHOOL_OBJECT_CLASS};
pub use resilience::{RetryConfig, RetryExecutor};
pub use traits::DirectoryStore;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::entry::{
        AttributeDelta, AttributeSet, AttributeValue, EntryKey, Filter, NewEntity, StoreEntity,
    };
    pub use crate::error::{DirectoryError, DirectoryResult};
    pub use crate::resilience::{RetryConfig, RetryExecutor};
    pub use crate::traits::DirectoryStore;
}
