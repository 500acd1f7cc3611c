//! Inbound gateway callback contract
//!
//! The gateway retries any callback that is not acknowledged with a 2xx, so
//! every outcome here, including bad signatures and unknown references,
//! still ends in an acknowledgement. `CallbackOutcome` records what actually
//! happened for logs and tests.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::gateway::SUCCESS_CODE;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the raw body
pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayCallback {
    /// Reference sent at initiation, i.e. the payment id
    pub invoice_id: String,
    pub transaction_id: Option<String>,
    pub result_code: Option<String>,
    pub result_desc: Option<String>,
    pub status: Option<String>,
}

impl GatewayCallback {
    pub fn is_success(&self) -> bool {
        self.result_code.as_deref() == Some(SUCCESS_CODE)
            || self
                .status
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case("success"))
    }

    pub fn payment_id(&self) -> Option<Uuid> {
        Uuid::parse_str(self.invoice_id.trim()).ok()
    }

    pub fn failure_reason(&self) -> String {
        self.result_desc
            .clone()
            .or_else(|| self.result_code.clone())
            .unwrap_or_else(|| "gateway reported failure".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    Settled,
    Failed,
    /// Payment already settled; nothing changed
    Duplicate,
    UnknownReference,
    InvalidSignature,
    Malformed,
    /// Processing failed internally; logged for reconciliation
    Error,
}

/// What the remote side gets back. Always acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallbackAck {
    pub acknowledged: bool,
    pub outcome: CallbackOutcome,
}

impl CallbackAck {
    pub fn new(outcome: CallbackOutcome) -> Self {
        Self {
            acknowledged: true,
            outcome,
        }
    }
}

pub fn sign(secret: &str, payload: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature against the raw body
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Ok(provided) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    let expected = mac.finalize().into_bytes();
    expected.as_slice().ct_eq(provided.as_slice()).into()
}
