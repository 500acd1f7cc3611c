//! Mobile-money gateway adapter
//!
//! Outbound calls to the gateway's REST API. Initiation is asynchronous on
//! the gateway side: a `responseCode` of `"0"` only means the push was
//! accepted, and the final result arrives later through the callback.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::config::{GatewayConfig, RetrySettings};

pub const SUCCESS_CODE: &str = "0";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Gateway transport error: {0}")]
    Transport(String),

    #[error("Gateway request timed out")]
    Timeout,

    #[error("Gateway configuration error: {0}")]
    Config(String),

    #[error("Gateway rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid gateway response: {0}")]
    InvalidResponse(String),

    #[error("Invalid phone number: {0}")]
    InvalidPhone(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transport(_) | GatewayError::Timeout)
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::Timeout
        } else if e.is_decode() {
            GatewayError::InvalidResponse(e.to_string())
        } else if e.is_builder() {
            GatewayError::Config(e.to_string())
        } else {
            GatewayError::Transport(e.to_string())
        }
    }
}

/// Normalize a phone number to the gateway's `<country><subscriber>` digits.
///
/// Spaces, dashes, parentheses and a leading `+` are dropped; a leading `0`
/// is replaced by `country_code`; bare 9-digit subscriber numbers get the
/// country code prepended.
pub fn format_phone(raw: &str, country_code: &str) -> Option<String> {
    let digits: String = raw
        .trim()
        .trim_start_matches('+')
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let formatted = if let Some(rest) = digits.strip_prefix('0') {
        format!("{}{}", country_code, rest)
    } else if digits.len() == 9 {
        format!("{}{}", country_code, digits)
    } else {
        digits
    };

    (10..=15).contains(&formatted.len()).then_some(formatted)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateRequest {
    pub phone: String,
    pub amount: i64,
    pub currency: String,
    pub description: String,
    /// Always the payment id; the callback echoes it back as `invoiceId`
    pub reference: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResult {
    pub success: bool,
    pub transaction_id: Option<String>,
    pub response_code: String,
    pub response_message: Option<String>,
}

/// Final state of a payment as the gateway sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayStatus {
    Settled { transaction_id: Option<String> },
    Failed { reason: String },
    Pending,
    /// The gateway has no record of the reference
    Unknown,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initiate(&self, request: &InitiateRequest) -> Result<GatewayResult, GatewayError>;

    async fn query_status(&self, reference: Uuid) -> Result<GatewayStatus, GatewayError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitiateBody<'a> {
    phone: &'a str,
    amount: i64,
    currency: &'a str,
    description: &'a str,
    reference: String,
    merchant_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitiateResponse {
    response_code: String,
    transaction_id: Option<String>,
    response_message: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: String,
    result_code: Option<String>,
    transaction_id: Option<String>,
    result_desc: Option<String>,
}

/// Run `op`, retrying transient failures with the configured backoff
pub async fn with_retry<T, F, Fut>(
    retry: &RetrySettings,
    operation: &'static str,
    mut op: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, GatewayError>>,
{
    let delays: Vec<Duration> = retry.delays().collect();
    let mut attempt = 0usize;

    RetryIf::start(
        delays.clone(),
        || op(),
        |e: &GatewayError| {
            let delay = delays.get(attempt).copied();
            attempt += 1;
            match delay {
                Some(delay) if e.is_retryable() => {
                    tracing::warn!(
                        operation = operation,
                        attempt = attempt,
                        max_retries = delays.len(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Gateway call failed, retrying"
                    );
                    true
                }
                _ => false,
            }
        },
    )
    .await
}

pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        if config.base_url.is_empty() {
            return Err(GatewayError::Config("GATEWAY_BASE_URL is empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn post_initiate(&self, body: &InitiateBody<'_>) -> Result<GatewayResult, GatewayError> {
        let response = self
            .client
            .post(format!("{}/payments/initiate", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(GatewayError::Transport(format!("gateway returned {}", status)));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: InitiateResponse = response.json().await?;
        Ok(GatewayResult {
            success: parsed.response_code == SUCCESS_CODE,
            transaction_id: parsed.transaction_id,
            response_code: parsed.response_code,
            response_message: parsed.response_message,
        })
    }

    async fn get_status(&self, reference: Uuid) -> Result<GatewayStatus, GatewayError> {
        let response = self
            .client
            .get(format!("{}/payments/{}/status", self.config.base_url, reference))
            .bearer_auth(&self.config.api_key)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(GatewayStatus::Unknown);
        }
        if status.is_server_error() {
            return Err(GatewayError::Transport(format!("gateway returned {}", status)));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: StatusResponse = response.json().await?;
        let succeeded = parsed.result_code.as_deref() == Some(SUCCESS_CODE)
            || parsed.status.eq_ignore_ascii_case("success");
        Ok(if succeeded {
            GatewayStatus::Settled {
                transaction_id: parsed.transaction_id,
            }
        } else if parsed.status.eq_ignore_ascii_case("pending")
            || parsed.status.eq_ignore_ascii_case("processing")
        {
            GatewayStatus::Pending
        } else {
            GatewayStatus::Failed {
                reason: parsed.result_desc.unwrap_or(parsed.status),
            }
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn initiate(&self, request: &InitiateRequest) -> Result<GatewayResult, GatewayError> {
        let phone = format_phone(&request.phone, &self.config.country_code)
            .ok_or_else(|| GatewayError::InvalidPhone(request.phone.clone()))?;
        let body = InitiateBody {
            phone: &phone,
            amount: request.amount,
            currency: &request.currency,
            description: &request.description,
            reference: request.reference.to_string(),
            merchant_id: &self.config.merchant_id,
        };

        tracing::info!(
            reference = %request.reference,
            amount = request.amount,
            "Initiating gateway payment"
        );
        with_retry(&self.config.retry, "initiate", || self.post_initiate(&body)).await
    }

    async fn query_status(&self, reference: Uuid) -> Result<GatewayStatus, GatewayError> {
        with_retry(&self.config.retry, "query_status", || self.get_status(reference)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BillingConfig;
    use mockito::Matcher;

    fn gateway_for(server: &mockito::ServerGuard) -> HttpGateway {
        let mut config = BillingConfig::for_gateway(&server.url()).gateway;
        config.retry.base_delay = Duration::from_millis(5);
        HttpGateway::new(config).unwrap()
    }

    fn request() -> InitiateRequest {
        InitiateRequest {
            phone: "0712 345 678".to_string(),
            amount: 25_000,
            currency: "TZS".to_string(),
            description: "Monthly plan".to_string(),
            reference: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_format_phone() {
        assert_eq!(format_phone("0712 345 678", "255").as_deref(), Some("255712345678"));
        assert_eq!(format_phone("+255 712-345-678", "255").as_deref(), Some("255712345678"));
        assert_eq!(format_phone("712345678", "255").as_deref(), Some("255712345678"));
        assert_eq!(format_phone("255712345678", "255").as_deref(), Some("255712345678"));
        assert_eq!(format_phone("07123", "255"), None);
        assert_eq!(format_phone("07123abc45", "255"), None);
        assert_eq!(format_phone("", "255"), None);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(GatewayError::Timeout.is_retryable());
        assert!(GatewayError::Transport("reset".into()).is_retryable());
        assert!(!GatewayError::Config("bad url".into()).is_retryable());
        assert!(!GatewayError::Rejected {
            status: 400,
            message: "bad".into()
        }
        .is_retryable());
    }

    #[tokio::test]
    async fn test_initiate_success() {
        let mut server = mockito::Server::new_async().await;
        let req = request();
        let mock = server
            .mock("POST", "/payments/initiate")
            .match_header("authorization", "Bearer test-key")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "phone": "255712345678",
                "amount": 25000,
                "reference": req.reference.to_string(),
                "merchantId": "test-merchant",
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"responseCode":"0","transactionId":"TX-1","responseMessage":"Accepted"}"#)
            .create_async()
            .await;

        let result = gateway_for(&server).initiate(&req).await.unwrap();
        assert!(result.success);
        assert_eq!(result.transaction_id.as_deref(), Some("TX-1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_initiate_declined_is_not_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/payments/initiate")
            .with_status(200)
            .with_body(r#"{"responseCode":"51","responseMessage":"Insufficient balance"}"#)
            .create_async()
            .await;

        let result = gateway_for(&server).initiate(&request()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.response_code, "51");
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_then_surface() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/payments/initiate")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let err = gateway_for(&server).initiate(&request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/payments/initiate")
            .with_status(401)
            .with_body("unauthorized")
            .expect(1)
            .create_async()
            .await;

        let err = gateway_for(&server).initiate(&request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { status: 401, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_invalid_phone_never_calls_out() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/payments/initiate")
            .expect(0)
            .create_async()
            .await;

        let mut req = request();
        req.phone = "12".to_string();
        let err = gateway_for(&server).initiate(&req).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidPhone(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_query_status() {
        let mut server = mockito::Server::new_async().await;
        let settled = Uuid::new_v4();
        let failed = Uuid::new_v4();
        let missing = Uuid::new_v4();
        server
            .mock("GET", format!("/payments/{}/status", settled).as_str())
            .with_status(200)
            .with_body(r#"{"status":"success","resultCode":"0","transactionId":"TX-9"}"#)
            .create_async()
            .await;
        server
            .mock("GET", format!("/payments/{}/status", failed).as_str())
            .with_status(200)
            .with_body(r#"{"status":"failed","resultCode":"14","resultDesc":"Cancelled by user"}"#)
            .create_async()
            .await;
        server
            .mock("GET", format!("/payments/{}/status", missing).as_str())
            .with_status(404)
            .create_async()
            .await;

        let gateway = gateway_for(&server);
        assert_eq!(
            gateway.query_status(settled).await.unwrap(),
            GatewayStatus::Settled {
                transaction_id: Some("TX-9".to_string())
            }
        );
        assert_eq!(
            gateway.query_status(failed).await.unwrap(),
            GatewayStatus::Failed {
                reason: "Cancelled by user".to_string()
            }
        );
        assert_eq!(
            gateway.query_status(missing).await.unwrap(),
            GatewayStatus::Unknown
        );
    }
}
