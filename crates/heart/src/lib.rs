#![deny(missing_docs)]
//! Heart - a local-first object runtime.
//!
//! This is the top-level crate. It holds the production builder and the
//! [AccountService], which boots the whole runtime for one account. The
//! modules themselves live in [heart_core] and the transport crates.

use heart_api::{builder::Builder, config::Config};
use heart_core::factories;
use heart_transport_quic::QuicTransportFactory;

/// Construct a default production builder.
///
/// - `kv_store` - The default store is [factories::RedbKvStoreFactory].
/// - `transports` - Both [factories::CoreTransportTcpFactory] and
///   [QuicTransportFactory] listen; dialing picks by url scheme.
pub fn default_builder() -> Builder {
    Builder {
        config: Config::default(),
        kv_store: factories::RedbKvStoreFactory::create(),
        transports: vec![
            factories::CoreTransportTcpFactory::create(),
            QuicTransportFactory::create(),
        ],
    }
}

mod account;
pub use account::*;
