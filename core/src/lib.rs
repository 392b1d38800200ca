//! Relay Transport Core Library
//! Client/server game transport over a peer-to-peer relay provider

pub mod config;
pub mod error;
pub mod ffi;
pub mod relay;
pub mod runtime;
pub mod transport;

pub use config::{OversizedPolicy, RelayClientConfig, TransportConfig};
pub use error::{ProviderError, TransportError};
pub use relay::{LoopbackNetwork, LoopbackProvider, RelayProvider, RemoteIdentity};
pub use runtime::RelayHost;
pub use transport::{
    ClientId, NetworkDelivery, NetworkEvent, RelayTransport, SendOutcome, TransportEvent,
};

/// Initialize the core library (logging)
pub fn init() {
    // Hosts may call init from several entry points; "already set" is a no-op.
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    );

    tracing::info!("Relay Transport Core Initialized (logger ready)");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        init();
        init();
    }

    #[tokio::test]
    async fn test_async_init() {
        init();
        let network = LoopbackNetwork::new();
        let mut transport =
            RelayTransport::new(network.endpoint(RemoteIdentity(1)), TransportConfig::default());
        transport.initialize();
        assert_eq!(transport.poll_event().kind(), NetworkEvent::Nothing);
    }
}
