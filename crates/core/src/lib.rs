#![deny(missing_docs)]
//! Heart core: the default implementations of the heart modules.
//!
//! Objects live in spaces. Each object is a [smartblock::SmartBlock]
//! over an append-only change log ([source]), kept in an
//! [object_cache::ObjectCache] and indexed by [index::ObjectIndex].
//! Spaces replicate between the devices of one account through the
//! connection [pool].

use heart_api::{builder::Builder, config::Config};

/// Construct a production-ready default builder.
///
/// - `kv_store` - The default store is [factories::RedbKvStoreFactory].
/// - `transports` - The default transport is
///   [factories::CoreTransportTcpFactory].
pub fn default_builder() -> Builder {
    Builder {
        config: Config::default(),
        kv_store: factories::RedbKvStoreFactory::create(),
        transports: vec![factories::CoreTransportTcpFactory::create()],
    }
}

pub mod clients;
pub mod config_store;
pub mod events;
pub mod factories;
pub mod index;
pub mod lexid;
pub mod object_cache;
pub mod pool;
pub mod smartblock;
pub mod source;
pub mod space;
pub mod state;
pub mod wallet;
