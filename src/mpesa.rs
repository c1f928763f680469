use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::MpesaConfig;

/// Outbound calls must settle quickly; reconciliation retries cover the rest.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Refresh the cached token this long before the provider expires it.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const RESULT_CODE_SUCCESS: &str = "0";
const RESULT_CODE_CANCELED: &str = "1032";
const RESULT_CODE_PROCESSING: &str = "2001";

/// Daraja signals an invalid bearer token with this error code instead of a
/// plain 401.
const ERROR_CODE_INVALID_TOKEN: &str = "404.001.04";

#[derive(Debug, Error)]
pub enum MpesaError {
    #[error("gateway request failed: {0}")]
    Transport(String),

    #[error("gateway authentication failed: {0}")]
    Auth(String),

    #[error("gateway rejected the request: {0}")]
    Rejected(String),

    #[error("gateway response missing field: {0}")]
    MalformedResponse(&'static str),
}

impl From<reqwest::Error> for MpesaError {
    fn from(e: reqwest::Error) -> Self {
        MpesaError::Transport(e.to_string())
    }
}

/// Normalized outcome of a charge, as seen by the reconciliation engine.
/// Raw provider codes never leave this module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderResult {
    Success {
        receipt: Option<String>,
        amount: Option<Decimal>,
        paid_at: Option<DateTime<Utc>>,
    },
    Pending,
    CanceledByUser,
    Failed { reason: String },
    TransientError { reason: String },
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// HTTP client for the Daraja API: client-credentials auth, STK push
/// initiation and status query. Holds no database or transaction locks
/// across any call.
pub struct MpesaClient {
    http: reqwest::Client,
    config: MpesaConfig,
    token: RwLock<Option<CachedToken>>,
}

impl MpesaClient {
    pub fn new(config: MpesaConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(HTTP_TIMEOUT)
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            http,
            config,
            token: RwLock::new(None),
        }
    }

    /// Fetch a bearer token, reusing the cached one until it nears expiry.
    pub async fn authenticate(&self, force_refresh: bool) -> Result<String, MpesaError> {
        if !force_refresh {
            let cached = self.token.read().await;
            if let Some(entry) = cached.as_ref() {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.token.clone());
                }
            }
        }

        let endpoint = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.config.base_url
        );
        let response = self
            .http
            .get(&endpoint)
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(%status, "Token generation failed: {}", body);
            return Err(MpesaError::Auth(format!(
                "token endpoint returned {status}"
            )));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: Option<Value>,
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|_| MpesaError::MalformedResponse("access_token"))?;

        let ttl = body
            .expires_in
            .as_ref()
            .and_then(value_as_u64)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(3600));

        let token = body.access_token;
        let mut cached = self.token.write().await;
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + ttl.saturating_sub(TOKEN_EXPIRY_MARGIN),
        });

        info!("Access token refreshed");
        Ok(token)
    }

    /// Send the STK push prompting the payer's phone. Returns the
    /// CheckoutRequestID the provider will reconcile under.
    pub async fn initiate(&self, amount: Decimal, phone: &str) -> Result<String, MpesaError> {
        let token = self.authenticate(false).await?;
        let phone = format_phone_number(phone);
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let password = derive_password(&self.config.short_code, &self.config.passkey, &timestamp);

        let payload = json!({
            "BusinessShortCode": self.config.short_code,
            "Password": password,
            "Timestamp": timestamp,
            "TransactionType": "CustomerPayBillOnline",
            "Amount": amount.trunc().to_string(),
            "PartyA": phone,
            "PartyB": self.config.short_code,
            "PhoneNumber": phone,
            "CallBackURL": self.config.callback_url,
            "AccountReference": self.config.account_reference,
            "TransactionDesc": self.config.transaction_desc,
        });

        info!(%phone, %amount, "Initiating STK push");

        let response = self
            .http
            .post(format!(
                "{}/mpesa/stkpush/v1/processrequest",
                self.config.base_url
            ))
            .bearer_auth(&token)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(%status, "STK push failed: {}", body);
            return Err(MpesaError::Rejected(format!(
                "push endpoint returned {status}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|_| MpesaError::MalformedResponse("push response body"))?;

        let response_code = body
            .get("ResponseCode")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if response_code != RESULT_CODE_SUCCESS {
            let desc = body
                .get("ResponseDescription")
                .and_then(Value::as_str)
                .unwrap_or("unknown gateway rejection");
            return Err(MpesaError::Rejected(desc.to_string()));
        }

        body.get("CheckoutRequestID")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(MpesaError::MalformedResponse("CheckoutRequestID"))
    }

    /// Query the outcome of an initiated charge. All failure modes are
    /// absorbed into the `ProviderResult` variants so callers can match
    /// exhaustively instead of probing raw codes.
    pub async fn query_status(&self, reference: &str) -> ProviderResult {
        match self.query_status_inner(reference, false).await {
            Ok(result) => result,
            Err(e) => {
                warn!(reference, error = %e, "Status query failed");
                ProviderResult::TransientError {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn query_status_inner(
        &self,
        reference: &str,
        force_refresh: bool,
    ) -> Result<ProviderResult, MpesaError> {
        let token = self.authenticate(force_refresh).await?;
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let password = derive_password(&self.config.short_code, &self.config.passkey, &timestamp);

        let payload = json!({
            "BusinessShortCode": self.config.short_code,
            "Password": password,
            "Timestamp": timestamp,
            "CheckoutRequestID": reference,
        });

        let response = self
            .http
            .post(format!(
                "{}/mpesa/stkpushquery/v1/query",
                self.config.base_url
            ))
            .bearer_auth(&token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|_| MpesaError::MalformedResponse("query response body"))?;

        if let Some(error_code) = body.get("errorCode").and_then(Value::as_str) {
            // Stale token: refresh once and retry, anything else is retryable
            // at the reconciliation layer.
            if error_code == ERROR_CODE_INVALID_TOKEN && !force_refresh {
                warn!(reference, "Stale access token, refreshing");
                return Box::pin(self.query_status_inner(reference, true)).await;
            }
            let message = body
                .get("errorMessage")
                .and_then(Value::as_str)
                .unwrap_or("gateway error");
            return Ok(ProviderResult::TransientError {
                reason: format!("{error_code}: {message}"),
            });
        }

        if !status.is_success() {
            return Ok(ProviderResult::TransientError {
                reason: format!("query endpoint returned {status}"),
            });
        }

        let code = body
            .get("ResultCode")
            .map(code_to_string)
            .ok_or(MpesaError::MalformedResponse("ResultCode"))?;
        let desc = body
            .get("ResultDesc")
            .and_then(Value::as_str)
            .unwrap_or_default();

        Ok(normalize_result(&code, desc))
    }
}

/// Map a provider result code onto the closed result type. The query
/// response carries no receipt metadata; a successful query settles with
/// whatever the payment already recorded.
pub fn normalize_result(code: &str, desc: &str) -> ProviderResult {
    match code {
        RESULT_CODE_SUCCESS => ProviderResult::Success {
            receipt: None,
            amount: None,
            paid_at: None,
        },
        RESULT_CODE_CANCELED => ProviderResult::CanceledByUser,
        RESULT_CODE_PROCESSING => ProviderResult::Pending,
        _ => ProviderResult::Failed {
            reason: if desc.is_empty() {
                format!("result code {code}")
            } else {
                desc.to_string()
            },
        },
    }
}

/// Normalize a payer phone number to the 254XXXXXXXXX wire format.
pub fn format_phone_number(phone: &str) -> String {
    let trimmed = phone.trim();
    let digits = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if let Some(rest) = digits.strip_prefix('0') {
        format!("254{rest}")
    } else if digits.starts_with("254") {
        digits.to_string()
    } else {
        format!("254{digits}")
    }
}

/// Daraja request password: base64(shortcode + passkey + timestamp).
pub fn derive_password(short_code: &str, passkey: &str, timestamp: &str) -> String {
    BASE64.encode(format!("{short_code}{passkey}{timestamp}"))
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// ResultCode arrives as a JSON number on the callback path and as a string
/// on the query path.
fn code_to_string(value: &Value) -> String {
    match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Webhook payload
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: Value,
    #[serde(rename = "ResultDesc", default)]
    pub result_desc: Option<String>,
    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Deserialize)]
pub struct MetadataItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: Option<Value>,
}

impl StkCallback {
    /// Translate the webhook payload into the same result type the status
    /// query produces; the reconciliation engine sees one shape either way.
    pub fn to_provider_result(&self) -> ProviderResult {
        let code = code_to_string(&self.result_code);
        let desc = self.result_desc.as_deref().unwrap_or_default();

        if code == RESULT_CODE_SUCCESS {
            ProviderResult::Success {
                receipt: self
                    .metadata_value("MpesaReceiptNumber")
                    .and_then(|v| v.as_str().map(str::to_string)),
                amount: self.metadata_value("Amount").and_then(value_as_decimal),
                paid_at: self
                    .metadata_value("TransactionDate")
                    .and_then(parse_transaction_date),
            }
        } else {
            normalize_result(&code, desc)
        }
    }

    fn metadata_value(&self, name: &str) -> Option<&Value> {
        self.callback_metadata
            .as_ref()?
            .items
            .iter()
            .find(|item| item.name == name)?
            .value
            .as_ref()
    }
}

fn value_as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(_) => value.to_string().parse().ok(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// TransactionDate arrives as YYYYMMDDHHMMSS in provider-local time; stored
/// as-is against UTC.
fn parse_transaction_date(value: &Value) -> Option<DateTime<Utc>> {
    let raw = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    NaiveDateTime::parse_from_str(&raw, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}
