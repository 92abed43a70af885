//! Daemon - the controller service
//!
//! Binds the control, telemetry and API listeners, advertises the
//! controller, and keeps liveness and clock maintenance running until
//! ctrl-c.

use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;

use crate::api::ApiServer;
use crate::coordinator::Coordinator;
use crate::discovery::MdnsAdvertiser;
use crate::discovery::mdns::AdvertisedPorts;
use crate::telemetry::{self, TracingSink};
use crate::{Config, Error, Result};

/// The capture controller daemon
pub struct Daemon {
    config: Config,
    coordinator: Coordinator,
}

impl Daemon {
    pub async fn new(config: Config) -> Self {
        let coordinator = Coordinator::new(config.clone()).await;
        Self {
            config,
            coordinator,
        }
    }

    #[must_use]
    pub const fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Run until ctrl-c
    ///
    /// # Errors
    ///
    /// Returns error if a listener cannot be bound
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                let _ = shutdown_tx.send(true);
            }
        });
        self.run_until(shutdown_rx).await
    }

    /// Run until `shutdown` flips to true
    ///
    /// # Errors
    ///
    /// Returns error if a listener cannot be bound
    pub async fn run_until(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let config = &self.config;
        let control_addr = format!("{}:{}", config.bind, config.control_port);
        let telemetry_addr = format!("{}:{}", config.bind, config.telemetry_port);

        let control = TcpListener::bind(&control_addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind control channel on {control_addr}: {e}")))?;
        let udp = UdpSocket::bind(&telemetry_addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind telemetry channel on {telemetry_addr}: {e}")))?;

        let manager = self.coordinator.manager().clone();
        let hub = self.coordinator.hub().clone();
        hub.add_sink(Arc::new(TracingSink)).await;

        let liveness = manager.spawn_liveness(shutdown.clone());
        let maintenance = self.coordinator.spawn_maintenance(shutdown.clone()).await;
        let mirror = hub.mirror_responses(manager.subscribe_responses());

        let listener = {
            let manager = manager.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { manager.listen(control, shutdown).await })
        };
        let receiver = tokio::spawn(telemetry::run_receiver(udp, hub, manager, shutdown.clone()));
        let api = ApiServer::new(self.coordinator.clone(), config.bind.clone(), config.api_port)
            .spawn(shutdown.clone());

        let advertiser = if config.advertise {
            self.advertise().await
        } else {
            None
        };

        tracing::info!(
            control_port = config.control_port,
            telemetry_port = config.telemetry_port,
            api_port = config.api_port,
            "controller running"
        );

        let _ = shutdown.wait_for(|stop| *stop).await;

        if let Some(advertiser) = advertiser {
            advertiser.stop().await;
        }
        self.coordinator.shutdown().await;

        mirror.abort();
        let _ = tokio::join!(listener, liveness, maintenance);
        match receiver.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "telemetry receiver failed"),
            Err(e) => tracing::warn!(error = %e, "telemetry receiver panicked"),
            Ok(Ok(())) => {}
        }
        match api.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "API server failed"),
            Err(e) => tracing::warn!(error = %e, "API server panicked"),
            Ok(Ok(())) => {}
        }

        tracing::info!("controller stopped");
        Ok(())
    }

    /// Advertising is best-effort; the controller runs without it
    async fn advertise(&self) -> Option<MdnsAdvertiser> {
        let ports = AdvertisedPorts {
            control: self.config.control_port,
            telemetry: self.config.telemetry_port,
            api: self.config.api_port,
        };
        let advertiser = match MdnsAdvertiser::new() {
            Ok(advertiser) => advertiser,
            Err(e) => {
                tracing::warn!(error = %e, "mDNS unavailable, not advertising");
                return None;
            }
        };
        if let Err(e) = advertiser.start(ports).await {
            tracing::warn!(error = %e, "mDNS advertisement failed");
            return None;
        }
        Some(advertiser)
    }
}
