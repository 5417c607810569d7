use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    string_or_number, GatewayError, MobileMoneyProvider, ProviderStatus, StkPushAccepted,
    StkPushRequest, ERROR_STILL_PROCESSING,
};

const TOKEN_PATH: &str = "/oauth/v1/generate?grant_type=client_credentials";
const STK_PUSH_PATH: &str = "/mpesa/stkpush/v1/processrequest";
const STK_QUERY_PATH: &str = "/mpesa/stkpushquery/v1/query";
const TRANSACTION_TYPE: &str = "CustomerPayBillOnline";
/// Refresh the access token this long before the provider says it expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct DarajaConfig {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    pub callback_url: String,
    /// Per-request timeout; kept well under the poll interval budget.
    pub timeout: Duration,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// HTTP client for the Safaricom Daraja STK push API.
pub struct DarajaClient {
    http: reqwest::Client,
    config: DarajaConfig,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushBody<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    transaction_type: &'static str,
    amount: u64,
    party_a: &'a str,
    party_b: &'a str,
    phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    call_back_url: &'a str,
    account_reference: &'a str,
    transaction_desc: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID", default)]
    checkout_request_id: Option<String>,
    #[serde(deserialize_with = "string_or_number")]
    response_code: String,
    #[serde(default)]
    response_description: Option<String>,
    #[serde(default)]
    customer_message: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkQueryBody<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkQueryResponse {
    #[serde(deserialize_with = "string_or_number")]
    result_code: String,
    #[serde(default)]
    result_desc: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiErrorBody {
    error_code: String,
    error_message: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(deserialize_with = "string_or_number")]
    expires_in: String,
}

impl DarajaClient {
    pub fn new(config: DarajaConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
        })
    }

    /// Returns `(password, timestamp)` for a request issued now.
    fn credentials(&self) -> (String, String) {
        // Daraja expects East Africa Time.
        let timestamp = (Utc::now() + chrono::Duration::hours(3))
            .format("%Y%m%d%H%M%S")
            .to_string();
        let password = STANDARD.encode(format!(
            "{}{}{}",
            self.config.shortcode, self.config.passkey, timestamp
        ));
        (password, timestamp)
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .get(format!("{}{}", self.config.base_url, TOKEN_PATH))
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GatewayError::Unavailable(format!(
                "token request failed with HTTP {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await?;
        let lifetime = token
            .expires_in
            .parse::<u64>()
            .map(Duration::from_secs)
            .unwrap_or(TOKEN_REFRESH_MARGIN);
        let refresh_at = Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN);

        debug!("Obtained provider access token");
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at,
        });
        Ok(token.access_token)
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, GatewayError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!("{}{}", self.config.base_url, path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;

        if status.is_success() {
            return serde_json::from_slice(&bytes).map_err(|e| GatewayError::Decode(e.to_string()));
        }

        if let Ok(error) = serde_json::from_slice::<ApiErrorBody>(&bytes) {
            return Err(GatewayError::Rejected {
                code: error.error_code,
                message: error.error_message,
            });
        }

        if status.is_server_error() {
            Err(GatewayError::Unavailable(format!("HTTP {status}")))
        } else {
            Err(GatewayError::Decode(format!(
                "HTTP {status}: {}",
                String::from_utf8_lossy(&bytes)
            )))
        }
    }
}

#[async_trait]
impl MobileMoneyProvider for DarajaClient {
    async fn stk_push(&self, request: &StkPushRequest) -> Result<StkPushAccepted, GatewayError> {
        let (password, timestamp) = self.credentials();
        let body = StkPushBody {
            business_short_code: &self.config.shortcode,
            password,
            timestamp,
            transaction_type: TRANSACTION_TYPE,
            amount: request.amount,
            party_a: request.phone.as_str(),
            party_b: &self.config.shortcode,
            phone_number: request.phone.as_str(),
            call_back_url: &self.config.callback_url,
            account_reference: &request.account_reference,
            transaction_desc: &request.description,
        };

        let response: StkPushResponse = self.post_json(STK_PUSH_PATH, &body).await?;

        if response.response_code != "0" {
            return Err(GatewayError::Rejected {
                code: response.response_code,
                message: response.response_description.unwrap_or_default(),
            });
        }

        let checkout_request_id = response.checkout_request_id.ok_or_else(|| {
            GatewayError::Decode("push accepted without a CheckoutRequestID".to_string())
        })?;

        Ok(StkPushAccepted {
            merchant_request_id: response.merchant_request_id,
            checkout_request_id,
            customer_message: response.customer_message,
        })
    }

    async fn stk_query(&self, checkout_request_id: &str) -> Result<ProviderStatus, GatewayError> {
        let (password, timestamp) = self.credentials();
        let body = StkQueryBody {
            business_short_code: &self.config.shortcode,
            password,
            timestamp,
            checkout_request_id,
        };

        match self.post_json::<_, StkQueryResponse>(STK_QUERY_PATH, &body).await {
            Ok(response) => Ok(ProviderStatus::from_result_code(
                &response.result_code,
                &response.result_desc,
            )),
            Err(GatewayError::Rejected { code, .. }) if code == ERROR_STILL_PROCESSING => {
                Ok(ProviderStatus::Pending)
            }
            Err(e) => {
                warn!(checkout_request_id, error = %e, "STK query failed");
                Err(e)
            }
        }
    }
}
