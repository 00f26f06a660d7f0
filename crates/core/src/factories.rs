//! Factories for generating instances of heart modules.

pub mod mem_kv_store;
pub use mem_kv_store::MemKvStoreFactory;

pub mod redb_kv_store;
pub use redb_kv_store::RedbKvStoreFactory;

pub mod core_transport_tcp;
pub use core_transport_tcp::CoreTransportTcpFactory;
