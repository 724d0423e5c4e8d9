//! Routing of delivered batches to downstream services.
//!
//! A batch key produced by [`PushArg::batch_key`] starts with the service
//! and method that should receive the batch. [`RoutingSink`] splits it back
//! apart and invokes the matching [`ServiceClient`] once per batch.
//!
//! [`PushArg::batch_key`]: crate::PushArg::batch_key

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use huddle_common::{AppError, ServiceConfig};
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use crate::dispatcher::{Sink, SinkOutcome};

/// A batch key that cannot be routed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("can't split service and method from key: {0}")]
pub struct RouteError(pub String);

/// Service and method encoded in a batch key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteKey<'a> {
    /// Name of the downstream service.
    pub service: &'a str,
    /// Method invoked on it.
    pub method: &'a str,
    /// Recipient and merge key, uninterpreted.
    pub rest: &'a str,
}

impl<'a> RouteKey<'a> {
    /// Split `key` on its first two commas.
    pub fn parse(key: &'a str) -> Result<Self, RouteError> {
        let mut parts = key.splitn(3, ',');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(service), Some(method), Some(rest)) => Ok(Self {
                service,
                method,
                rest,
            }),
            _ => Err(RouteError(key.to_string())),
        }
    }
}

/// Downstream invocation failure.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request could not be sent or the response not read.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("service returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        Self::ExternalService(err.to_string())
    }
}

/// A downstream service that accepts method calls.
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Invoke `method` with `args`.
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<(), ServiceError>;
}

/// Downstream services by name.
pub type Services = HashMap<String, Arc<dyn ServiceClient>>;

/// Calls a service by POSTing JSON to `{base_url}?method={method}`.
#[derive(Clone)]
pub struct HttpServiceClient {
    client: Client,
    base_url: String,
}

impl HttpServiceClient {
    /// Create a client for the service at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Reuse an existing HTTP client.
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Build one client per configured service, sharing a connection pool.
    pub fn from_config(services: &[ServiceConfig]) -> Result<Services, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(services
            .iter()
            .map(|config| {
                let service: Arc<dyn ServiceClient> =
                    Arc::new(Self::with_client(client.clone(), config.url.clone()));
                (config.name.clone(), service)
            })
            .collect())
    }
}

#[async_trait]
impl ServiceClient for HttpServiceClient {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<(), ServiceError> {
        let response = self
            .client
            .post(&self.base_url)
            .query(&[("method", method)])
            .json(&args)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ServiceError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Sink that forwards each batch to the service named in its key.
#[derive(Clone)]
pub struct RoutingSink {
    services: Arc<Services>,
}

impl RoutingSink {
    /// Create a sink over `services`.
    #[must_use]
    pub const fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Sink for RoutingSink {
    async fn deliver(
        &self,
        key: &str,
        entries: &[Bytes],
        _metadata: &HashMap<String, String>,
    ) -> SinkOutcome {
        // Unroutable batches can never succeed; retire them.
        let route = match RouteKey::parse(key) {
            Ok(route) => route,
            Err(e) => {
                error!(error = %e, "Dropping unroutable batch");
                return SinkOutcome::Delivered;
            }
        };
        let Some(service) = self.services.get(route.service) else {
            error!(key, service = route.service, "Dropping batch for unknown service");
            return SinkOutcome::Delivered;
        };

        let args: Vec<Value> = entries
            .iter()
            .filter_map(|entry| match serde_json::from_slice(entry) {
                Ok(value) => Some(value),
                Err(e) => {
                    error!(key, error = %e, "Can't decode batch entry");
                    None
                }
            })
            .collect();

        match service.call(route.method, args).await {
            Ok(()) => {
                debug!(
                    key,
                    service = route.service,
                    method = route.method,
                    count = entries.len(),
                    "Batch sent to service"
                );
                SinkOutcome::Delivered
            }
            Err(e) => {
                error!(
                    key,
                    service = route.service,
                    method = route.method,
                    error = %e,
                    "Call to service failed"
                );
                SinkOutcome::Retry { after: None }
            }
        }
    }
}
