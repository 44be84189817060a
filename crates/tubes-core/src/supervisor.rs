use std::sync::Arc;

use crate::config::TubesConfig;
use crate::endpoint::SecureShellEndpoint;
use crate::error::Result;
use crate::service::ToggleableService;

/// Owns every endpoint built from one configuration
pub struct Supervisor {
    endpoints: Vec<Arc<SecureShellEndpoint>>,
}

impl Supervisor {
    pub fn new(config: &TubesConfig) -> Result<Self> {
        let endpoints = config
            .finalize()?
            .into_iter()
            .map(|spec| Arc::new(SecureShellEndpoint::new(spec)))
            .collect();
        Ok(Self { endpoints })
    }

    pub fn endpoints(&self) -> &[Arc<SecureShellEndpoint>] {
        &self.endpoints
    }

    pub fn endpoint(&self, name: &str) -> Option<Arc<SecureShellEndpoint>> {
        self.endpoints.iter().find(|e| e.name() == name).cloned()
    }

    pub fn service(&self, endpoint: &str, service: &str) -> Option<Arc<dyn ToggleableService>> {
        self.endpoint(endpoint)?.service(service)
    }

    /// Start every endpoint's enabled services. Failures are logged per
    /// endpoint; the count of endpoints that came up cleanly is returned.
    pub async fn activate(&self) -> usize {
        let mut healthy = 0;
        for endpoint in &self.endpoints {
            match endpoint.activate().await {
                Ok(()) => healthy += 1,
                Err(e) => {
                    tracing::error!(endpoint = %endpoint.name(), error = %e, "Endpoint partially activated");
                }
            }
        }
        tracing::info!(
            endpoints = self.endpoints.len(),
            healthy,
            "Activated endpoints"
        );
        healthy
    }

    /// Close everything, then bring up a fresh set from `config`.
    ///
    /// The old endpoints stay running if the new configuration is invalid.
    pub async fn restart(&mut self, config: &TubesConfig) -> Result<usize> {
        let next = Supervisor::new(config)?;
        self.shutdown().await;
        *self = next;
        Ok(self.activate().await)
    }

    pub async fn shutdown(&self) {
        for endpoint in &self.endpoints {
            endpoint.close().await;
        }
    }
}
