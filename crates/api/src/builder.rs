//! Builder-related types.

use crate::*;
use std::sync::Arc;

/// The general heart builder.
/// This contains both configuration and factory instances,
/// allowing construction of runtime module instances.
#[derive(Debug)]
pub struct Builder {
    /// The module configuration to be used when building modules.
    /// This can be loaded from disk or modified before freezing the builder.
    pub config: config::Config,

    /// The [kv::KvStoreFactory] used to open the per-account stores.
    pub kv_store: kv::DynKvStoreFactory,

    /// The [transport::TransportFactory] instances to listen and dial
    /// with. Dialing picks the transport whose scheme matches the url.
    pub transports: Vec<transport::DynTransportFactory>,
}

impl Builder {
    /// Construct a default config given the configured module factories.
    /// Note, this should be called before freezing the Builder instance
    /// in an Arc<>.
    pub fn with_default_config(mut self) -> HeartResult<Self> {
        self.set_default_config()?;
        Ok(self)
    }

    /// Construct a default config given the configured module factories.
    pub fn set_default_config(&mut self) -> HeartResult<()> {
        let Self {
            config,
            kv_store,
            transports,
        } = self;

        kv_store.default_config(config)?;
        for t in transports.iter() {
            t.default_config(config)?;
        }

        Ok(())
    }

    /// Ask every factory to validate the current config.
    pub fn validate_config(&self) -> HeartResult<()> {
        self.kv_store.validate_config(&self.config)?;
        for t in self.transports.iter() {
            t.validate_config(&self.config)?;
        }
        Ok(())
    }

    /// Freeze the builder so factories can share it.
    pub fn build(self) -> HeartResult<Arc<Self>> {
        self.validate_config()?;
        Ok(Arc::new(self))
    }
}
