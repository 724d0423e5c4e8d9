//! Instant queue: pushes are forwarded to their service right away.

use std::sync::Arc;

use huddle_common::{AppError, AppResult};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::push::PushArg;
use crate::routing::Services;

/// Fire-and-forget delivery without batching.
#[derive(Clone)]
pub struct InstantQueue {
    services: Arc<Services>,
}

impl InstantQueue {
    /// Create a queue over `services`.
    #[must_use]
    pub const fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Forward `arg` in the background and return the number of calls.
    ///
    /// One call is made per recipient, or a single `[data]` call without
    /// recipients. Failures are logged, not retried.
    pub fn push(&self, arg: PushArg) -> AppResult<usize> {
        self.spawn(arg).map(|(count, _)| count)
    }

    fn spawn(&self, arg: PushArg) -> AppResult<(usize, JoinHandle<()>)> {
        arg.validate()?;
        let Some(service) = self.services.get(&arg.service).cloned() else {
            return Err(AppError::NotFound(format!("can't find service {}", arg.service)));
        };

        let calls = if arg.tos.is_empty() {
            vec![arg.data.clone()]
        } else {
            arg.tos
                .iter()
                .map(|to| arg.addressed_to(to))
                .collect::<serde_json::Result<Vec<Value>>>()?
        };
        let count = calls.len();

        let handle = tokio::spawn(async move {
            for data in calls {
                if let Err(e) = service.call(&arg.method, vec![data]).await {
                    error!(
                        service = %arg.service,
                        method = %arg.method,
                        error = %e,
                        "Instant send failed"
                    );
                }
            }
            debug!(service = %arg.service, method = %arg.method, count, "Instant push sent");
        });

        Ok((count, handle))
    }
}
