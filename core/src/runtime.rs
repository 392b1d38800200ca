//! Relay Client Runtime
//!
//! Owns the process-wide relay client lifetime around a transport: init with
//! the app id on start, heartbeat plus pump every tick, shutdown on drop.

use crate::config::{RelayClientConfig, TransportConfig};
use crate::error::TransportError;
use crate::relay::RelayProvider;
use crate::transport::RelayTransport;

pub struct RelayHost<P: RelayProvider> {
    transport: RelayTransport<P>,
    config: RelayClientConfig,
}

impl<P: RelayProvider> RelayHost<P> {
    /// Initialize the relay client library and the transport
    pub fn start(
        mut provider: P,
        config: RelayClientConfig,
        transport_config: TransportConfig,
    ) -> Result<Self, TransportError> {
        provider.init_client(config.app_id)?;
        tracing::info!("Relay client initialized for app {}", config.app_id);

        let mut transport = RelayTransport::new(provider, transport_config);
        transport.initialize();
        Ok(RelayHost { transport, config })
    }

    pub fn app_id(&self) -> u32 {
        self.config.app_id
    }

    /// Run the library heartbeat, then translate pending callbacks
    pub fn tick(&mut self) {
        self.transport.provider_mut().run_callbacks();
        self.transport.pump();
    }

    pub fn transport(&self) -> &RelayTransport<P> {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut RelayTransport<P> {
        &mut self.transport
    }
}

impl<P: RelayProvider> Drop for RelayHost<P> {
    fn drop(&mut self) {
        self.transport.shutdown();
    }
}
