//! AlertRouter: validates signed webhook payloads and maps them onto Controller operations.
//!
//! HMAC verification idiom grounded on the teacher's
//! `infrastructure/binance/execution.rs` request-signing code, reused here to verify
//! rather than produce a signature.

use std::collections::VecDeque;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::RwLock;

use crate::application::controller::Controller;
use crate::application::grid_worker::CommandResult;
use crate::domain::errors::CoreError;
use crate::domain::ports::Store;

type HmacSha256 = Hmac<Sha256>;

/// Timing-safe byte comparison; avoids leaking signature prefix length via early return.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookAlert {
    pub symbol: String,
    pub action: String,
    #[serde(default)]
    pub price: Option<rust_decimal::Decimal>,
    #[serde(default)]
    pub zone: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub symbol: String,
    pub action: String,
    pub mapped_operation: String,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("invalid webhook signature")]
    BadSignature,
    #[error("unrecognized action: {0}")]
    UnknownAction(String),
    #[error(transparent)]
    Core(#[from] CoreError),
}

pub struct AlertRouter {
    secret: String,
    history: RwLock<VecDeque<AlertRecord>>,
    history_capacity: usize,
    store: Arc<dyn Store>,
}

impl AlertRouter {
    pub fn new(secret: String, history_capacity: usize, store: Arc<dyn Store>) -> Self {
        Self { secret, history: RwLock::new(VecDeque::with_capacity(history_capacity)), history_capacity, store }
    }

    /// Constant-time verification of `X-Webhook-Signature` (lowercase hex HMAC-SHA256)
    /// over the exact raw body bytes.
    pub fn verify_signature(&self, raw_body: &[u8], signature_hex: &str) -> bool {
        let Ok(expected_bytes) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
            return false;
        };
        mac.update(raw_body);
        let computed = mac.finalize().into_bytes();
        constant_time_eq(computed.as_slice(), &expected_bytes)
    }

    fn map_action(action: &str) -> Result<&'static str, AlertError> {
        match action.to_ascii_lowercase().as_str() {
            "buy" | "long" => Ok("resume"),
            "sell" | "short" => Ok("pause"),
            "close" => Ok("stop"),
            other => Err(AlertError::UnknownAction(other.to_string())),
        }
    }

    pub async fn route(
        &self,
        controller: &Arc<Controller>,
        alert: WebhookAlert,
    ) -> Result<(String, CommandResult), AlertError> {
        if controller.is_killed().await {
            return Err(AlertError::Core(CoreError::KilledByRisk { reason: "kill switch active".into() }));
        }
        let operation = Self::map_action(&alert.action)?;
        let result = match operation {
            "resume" => controller.resume(&alert.symbol).await?,
            "pause" => controller.pause(&alert.symbol).await?,
            "stop" => controller.stop(&alert.symbol).await?,
            _ => unreachable!(),
        };

        self.store.record_alert(&alert.symbol, operation).await;

        let mut history = self.history.write().await;
        history.push_back(AlertRecord {
            symbol: alert.symbol,
            action: alert.action,
            mapped_operation: operation.to_string(),
            received_at: chrono::Utc::now(),
        });
        while history.len() > self.history_capacity {
            history.pop_front();
        }

        Ok((operation.to_string(), result))
    }

    pub async fn history(&self, symbol: Option<&str>, limit: usize) -> Vec<AlertRecord> {
        let history = self.history.read().await;
        history
            .iter()
            .rev()
            .filter(|r| symbol.is_none_or(|s| r.symbol == s))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Full, unsliced history. Used by stats computations that must not be truncated by a
    /// caller-supplied `limit` on the `history()` view above.
    pub async fn all_history(&self) -> Vec<AlertRecord> {
        self.history.read().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_valid_signature_rejects_tampered() {
        let router = AlertRouter::new("s3cr3t".into(), 10, Arc::new(crate::infrastructure::store::NullStore));
        let body = br#"{"symbol":"BTCUSDT","action":"buy"}"#;
        let sig = sign("s3cr3t", body);
        assert!(router.verify_signature(body, &sig));

        let tampered = br#"{"symbol":"BTCUSDT","action":"sell"}"#;
        assert!(!router.verify_signature(tampered, &sig));
    }

    #[test]
    fn maps_actions_to_operations() {
        assert_eq!(AlertRouter::map_action("buy").unwrap(), "resume");
        assert_eq!(AlertRouter::map_action("LONG").unwrap(), "resume");
        assert_eq!(AlertRouter::map_action("short").unwrap(), "pause");
        assert_eq!(AlertRouter::map_action("close").unwrap(), "stop");
        assert!(AlertRouter::map_action("nonsense").is_err());
    }
}
