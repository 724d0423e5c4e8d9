//! Push requests and their expansion into per-recipient batch entries.

#![allow(missing_docs)]

use huddle_common::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Batch key segment used when a push names no recipients.
pub const NO_RECIPIENT: &str = "-";

/// Addressee of a push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Recipient {
    pub identity_id: i64,
    pub user_id: i64,
    pub name: String,
    pub auth_data: String,
    pub timezone: String,
    pub token: String,
    pub language: String,
    pub provider: String,
    pub external_id: String,
    pub external_username: String,
}

impl Recipient {
    /// Identity used in batch keys: `external_id@provider`.
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}@{}", self.external_id, self.provider)
    }
}

/// A request to deliver `data` through `service.method`, once per recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushArg {
    pub service: String,
    pub method: String,
    /// Application coalescing token; pushes sharing it are merged.
    #[serde(default)]
    pub merge_key: String,
    /// Each recipient overwrites the `to` field of `data`.
    #[serde(default)]
    pub tos: Vec<Recipient>,
    #[serde(default)]
    pub data: Value,
}

impl PushArg {
    /// Reject requests that can never be routed.
    pub fn validate(&self) -> AppResult<()> {
        if self.service.is_empty() {
            return Err(AppError::Validation("service must not be empty".to_string()));
        }
        if self.method.is_empty() {
            return Err(AppError::Validation("method must not be empty".to_string()));
        }
        if self.service.contains(',') || self.method.contains(',') {
            return Err(AppError::Validation(
                "service and method must not contain ','".to_string(),
            ));
        }
        Ok(())
    }

    /// Batch key for one recipient: `service,method,recipient,merge_key`.
    #[must_use]
    pub fn batch_key(&self, recipient_id: &str) -> String {
        format!(
            "{},{},{},{}",
            self.service, self.method, recipient_id, self.merge_key
        )
    }

    /// `data` addressed to `to`. Non-object data is passed through.
    pub fn addressed_to(&self, to: &Recipient) -> serde_json::Result<Value> {
        let mut data = self.data.clone();
        if let Value::Object(fields) = &mut data {
            fields.insert("to".to_string(), serde_json::to_value(to)?);
        }
        Ok(data)
    }

    /// One `(batch key, entry)` per distinct recipient.
    ///
    /// A recipient listed twice keeps its last entry. Without recipients a
    /// single `[data]` entry is produced under [`NO_RECIPIENT`].
    pub fn expand(&self) -> serde_json::Result<Vec<(String, Value)>> {
        if self.tos.is_empty() {
            return Ok(vec![(
                self.batch_key(NO_RECIPIENT),
                Value::Array(vec![self.data.clone()]),
            )]);
        }

        let mut expanded: Vec<(String, Value)> = Vec::with_capacity(self.tos.len());
        for to in &self.tos {
            let key = self.batch_key(&to.id());
            let data = self.addressed_to(to)?;
            match expanded.iter_mut().find(|(existing, _)| *existing == key) {
                Some(slot) => slot.1 = data,
                None => expanded.push((key, data)),
            }
        }
        Ok(expanded)
    }
}
