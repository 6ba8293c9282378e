//! SIP Endpoint Builder
//!

use std::net::SocketAddr;

use itertools::Itertools;

use crate::config::ServerConfig;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::service::SipService;
use crate::transaction::TransactionLayer;
use crate::transport::tcp::TcpStartup;
use crate::transport::udp::UdpStartup;
use crate::transport::{TransportLayer, TransportStartup};

/// Builder for creating a new SIP [`Endpoint`].
pub struct Builder {
    config: ServerConfig,
    services: Vec<Box<dyn SipService>>,
    transport_start: Vec<Box<dyn TransportStartup>>,
}

impl Builder {
    /// Creates a new default instance of `Builder` to construct an
    /// `Endpoint`.
    pub fn new() -> Self {
        Builder {
            config: ServerConfig::default(),
            services: vec![],
            transport_start: vec![],
        }
    }

    /// Sets the server configuration.
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a UDP transport on the specified address.
    pub fn with_udp(mut self, addr: SocketAddr) -> Self {
        self.transport_start.push(Box::new(UdpStartup::new(addr)));
        self
    }

    /// Add a TCP transport on the specified address.
    pub fn with_tcp(mut self, addr: SocketAddr) -> Self {
        self.transport_start.push(Box::new(TcpStartup::new(addr)));
        self
    }

    /// Adds a service to the endpoint.
    ///
    /// This function can be called multiple times to add additional
    /// services; they see messages in registration order. If a service
    /// with the same name already exists, the new service is not added.
    pub fn with_service(mut self, service: impl SipService) -> Self {
        if self.service_exists(service.name()) {
            return self;
        }
        self.services.push(Box::new(service));

        self
    }

    fn service_exists(&self, name: &str) -> bool {
        let exists = self.services.iter().any(|s| s.name() == name);
        if exists {
            tracing::warn!("Service with name '{}' already exists", name);
        }
        exists
    }

    /// Finalize the builder into an `Endpoint`, binding its transports.
    pub async fn build(self) -> Result<Endpoint> {
        tracing::trace!("Creating endpoint...");
        tracing::debug!(
            "Services registered ({})",
            self.services.iter().map(|s| s.name()).join(", ")
        );

        let transport = TransportLayer::new();
        let transaction = TransactionLayer::new(self.config.timers);

        let sender = transport.sender();
        for startup in &self.transport_start {
            startup.start(sender.clone()).await?;
        }

        Ok(Endpoint::from_parts(transport, transaction, self.config, self.services))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
