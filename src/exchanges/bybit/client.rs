//! HTTP client for the Bybit v5 API.

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client as HttpClient, Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ExchangeConfig;

/// Default receive window for signed requests in milliseconds.
const DEFAULT_RECEIVE_WINDOW: i64 = 5000;

const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";

/// Default rate limit (requests per minute).
const DEFAULT_RATE_LIMIT: i64 = 600;

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Bybit API error: a non-zero `retCode` or an HTTP error status.
#[derive(Debug, Error)]
#[error("bybit api error {code}: {message}")]
pub struct ApiError {
    pub code: i64,
    pub message: String,
    /// HTTP status when the error came from the transport layer.
    pub http_status: Option<u16>,
}

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("rate limit exceeded: {current}/{limit} per minute")]
    RateLimitExceeded { current: i64, limit: i64 },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid header: {0}")]
    Header(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Configuration for creating a new Client.
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub rate_limit: i64,
    pub receive_window: i64,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn from_exchange_config(cfg: &ExchangeConfig) -> Self {
        Self {
            base_url: if cfg.testnet { TESTNET_URL } else { MAINNET_URL }.to_string(),
            api_key: cfg.api_key.clone(),
            api_secret: cfg.api_secret.clone(),
            rate_limit: cfg.rate_limit.filter(|r| *r > 0).unwrap_or(DEFAULT_RATE_LIMIT),
            receive_window: cfg
                .recv_window
                .filter(|w| *w > 0)
                .unwrap_or(DEFAULT_RECEIVE_WINDOW),
            timeout: cfg.request_timeout(),
        }
    }
}

/// Every v5 response shares this envelope.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    ret_code: i64,
    ret_msg: String,
    result: Option<T>,
}

struct RateLimitState {
    window_start: Instant,
}

/// HTTP client for the Bybit v5 API.
/// Handles request signing, rate limiting, and envelope decoding.
pub struct Client {
    config: ClientConfig,
    http_client: HttpClient,
    request_count: AtomicI64,
    rate_limit_state: Mutex<RateLimitState>,
}

impl Client {
    /// Creates a new Bybit API client.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http_client = HttpClient::builder().timeout(config.timeout).build()?;

        Ok(Self {
            config,
            http_client,
            request_count: AtomicI64::new(0),
            rate_limit_state: Mutex::new(RateLimitState {
                window_start: Instant::now(),
            }),
        })
    }

    /// Creates an HMAC-SHA256 signature for Bybit v5.
    ///
    /// Signature payload: timestamp + api_key + recv_window + (query string | JSON body),
    /// hex encoded.
    pub(crate) fn sign(&self, timestamp: i64, payload: &str) -> String {
        let sign_payload = format!(
            "{}{}{}{}",
            timestamp, self.config.api_key, self.config.receive_window, payload
        );

        // HMAC accepts keys of any length
        let mut mac = match Hmac::<Sha256>::new_from_slice(self.config.api_secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(sign_payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Sends a signed GET request with the given query parameters.
    pub async fn get<T: DeserializeOwned>(&self, endpoint: &str, params: &[(&str, String)]) -> Result<T> {
        let query: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        self.request(Method::GET, endpoint, query).await
    }

    /// Sends a signed POST request with a JSON body.
    pub async fn post<T: DeserializeOwned>(&self, endpoint: &str, body: &serde_json::Value) -> Result<T> {
        let body = serde_json::to_string(body)?;
        self.request(Method::POST, endpoint, body).await
    }

    async fn request<T: DeserializeOwned>(&self, method: Method, endpoint: &str, payload: String) -> Result<T> {
        self.check_rate_limit()?;

        let timestamp = chrono::Utc::now().timestamp_millis();
        let signature = self.sign(timestamp, &payload);

        let mut request = if method == Method::GET {
            let url = if payload.is_empty() {
                format!("{}{}", self.config.base_url, endpoint)
            } else {
                format!("{}{}?{}", self.config.base_url, endpoint, payload)
            };
            self.http_client.request(method.clone(), &url)
        } else {
            let url = format!("{}{}", self.config.base_url, endpoint);
            self.http_client
                .request(method.clone(), &url)
                .header("Content-Type", "application/json")
                .body(payload)
        };

        request = request.headers(self.auth_headers(timestamp, &signature)?);

        debug!(method = %method, endpoint = %endpoint, "sending request");

        let response = request.send().await?;
        self.increment_request_count();

        let status = response.status();
        let body = response.bytes().await?;

        if status.is_client_error() || status.is_server_error() {
            return Err(self.parse_error_response(status, &body));
        }

        let envelope: Envelope<T> = serde_json::from_slice(&body)?;
        if envelope.ret_code != 0 {
            warn!(code = envelope.ret_code, message = %envelope.ret_msg, endpoint = %endpoint, "api error");
            return Err(ClientError::Api(ApiError {
                code: envelope.ret_code,
                message: envelope.ret_msg,
                http_status: None,
            }));
        }

        envelope.result.ok_or_else(|| {
            ClientError::Api(ApiError {
                code: 0,
                message: format!("{}: empty result", endpoint),
                http_status: None,
            })
        })
    }

    fn auth_headers(&self, timestamp: i64, signature: &str) -> Result<HeaderMap> {
        let value = |s: &str| HeaderValue::from_str(s).map_err(|e| ClientError::Header(e.to_string()));

        let mut headers = HeaderMap::new();
        headers.insert("X-BAPI-API-KEY", value(&self.config.api_key)?);
        headers.insert("X-BAPI-SIGN", value(signature)?);
        headers.insert("X-BAPI-TIMESTAMP", value(&timestamp.to_string())?);
        headers.insert(
            "X-BAPI-RECV-WINDOW",
            value(&self.config.receive_window.to_string())?,
        );
        Ok(headers)
    }

    /// Verifies we haven't exceeded the rate limit.
    fn check_rate_limit(&self) -> Result<()> {
        let mut state = self
            .rate_limit_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if state.window_start.elapsed() > RATE_LIMIT_WINDOW {
            self.request_count.store(0, Ordering::SeqCst);
            state.window_start = Instant::now();
        }

        let current = self.request_count.load(Ordering::SeqCst);
        if current >= self.config.rate_limit {
            return Err(ClientError::RateLimitExceeded {
                current,
                limit: self.config.rate_limit,
            });
        }

        Ok(())
    }

    fn increment_request_count(&self) {
        self.request_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Creates a ClientError from an HTTP error response.
    fn parse_error_response(&self, status: StatusCode, body: &[u8]) -> ClientError {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ErrorResponse {
            ret_code: Option<i64>,
            ret_msg: Option<String>,
        }

        let parsed = serde_json::from_slice::<ErrorResponse>(body).ok();
        let api_err = ApiError {
            code: parsed
                .as_ref()
                .and_then(|r| r.ret_code)
                .unwrap_or(status.as_u16() as i64),
            message: parsed
                .and_then(|r| r.ret_msg)
                .unwrap_or_else(|| String::from_utf8_lossy(body).to_string()),
            http_status: Some(status.as_u16()),
        };

        warn!(status = status.as_u16(), code = api_err.code, message = %api_err.message, "http error");

        ClientError::Api(api_err)
    }

    /// Returns the current request count in the window.
    pub fn request_count(&self) -> i64 {
        self.request_count.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(rate_limit: i64) -> Client {
        Client::new(ClientConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            api_key: "keyabc".to_string(),
            api_secret: "secretxyz".to_string(),
            rate_limit,
            receive_window: 5000,
            timeout: Duration::from_secs(1),
        })
        .unwrap()
    }

    #[test]
    fn test_sign_matches_reference_vector() {
        let sig = client(10).sign(1_700_000_000_000, "category=linear&symbol=BTCUSDT");
        assert_eq!(
            sig,
            "1b0ed4c167a2b06d2804d9f8f1e8c57399d384a6fd454d251112cb70df008ce9"
        );
    }

    #[test]
    fn test_rate_limit_rejects_when_window_full() {
        let c = client(2);
        assert!(c.check_rate_limit().is_ok());
        c.increment_request_count();
        c.increment_request_count();
        assert!(matches!(
            c.check_rate_limit(),
            Err(ClientError::RateLimitExceeded { current: 2, limit: 2 })
        ));
    }

    #[test]
    fn test_envelope_decoding() {
        let body = r#"{"retCode":110007,"retMsg":"ab not enough for new order","result":{},"time":1}"#;
        let env: Envelope<serde_json::Value> = serde_json::from_str(body).unwrap();
        assert_eq!(env.ret_code, 110007);
        assert_eq!(env.ret_msg, "ab not enough for new order");
    }

    #[test]
    fn test_testnet_url_selected() {
        let yaml = "name: bybit\ntestnet: true\n";
        let cfg: ExchangeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(ClientConfig::from_exchange_config(&cfg).base_url, TESTNET_URL);
    }
}
