//! Async JSON client for the application server.
//!
//! Every request carries the page's CSRF token and `Accept: application/json`.
//! Any non-2xx response becomes [`HttpError::Api`].

use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

const CSRF_HEADER: HeaderName = HeaderName::from_static("x-csrf-token");

#[derive(Debug, Error)]
pub enum HttpError {
    /// The HTTP response had a non-2xx status code.
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// An error from the underlying HTTP client.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid header value: {0}")]
    InvalidHeader(String),
}

impl HttpError {
    /// HTTP status of an API error, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, HttpError>;

/// Application-server client. Cheap to clone.
///
/// ```rust,no_run
/// use tabletop_common::http::ApiClient;
///
/// # async fn demo() -> tabletop_common::http::Result<()> {
/// let api = ApiClient::new("http://localhost:8000", "csrf-token")?;
/// let servers: serde_json::Value = api.get("/rooms/12/ice-servers").await?;
/// println!("{servers}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    /// Client without application headers, for third-party endpoints.
    direct: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, csrf_token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            CSRF_HEADER,
            HeaderValue::from_str(csrf_token).map_err(|e| HttpError::InvalidHeader(e.to_string()))?,
        );

        let client = Client::builder().default_headers(headers).build()?;
        // Resumable endpoints answer 308 without a Location header; never follow it.
        let direct = Client::builder().redirect(reqwest::redirect::Policy::none()).build()?;

        Ok(Self {
            client,
            direct,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Plain client for endpoints outside the application (no CSRF header).
    pub fn direct(&self) -> &Client {
        &self.direct
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_owned()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    /// Start a request against the application server with the default headers.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path))
    }

    // ── JSON helpers ──────────────────────────────────────────────────────────

    pub async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T> {
        let mut req = self.request(method, path);
        if let Some(b) = body {
            req = req.json(b);
        }
        decode(req.send().await?).await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_json(Method::GET, path, None).await
    }

    pub async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        self.send_json(Method::POST, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let resp = self.request(Method::DELETE, path).send().await?;
        ensure_success(resp).await.map(|_| ())
    }
}

/// Turn a non-2xx response into [`HttpError::Api`], passing successes through.
pub async fn ensure_success(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| {
            v.get("error")
                .or_else(|| v.get("message"))
                .and_then(|e| e.as_str())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| if text.is_empty() { status.to_string() } else { text });
    Err(HttpError::Api { status: status.as_u16(), message })
}

/// Check the status and decode a JSON body (`null` for 204).
pub async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let resp = ensure_success(resp).await?;
    if resp.status() == StatusCode::NO_CONTENT {
        return serde_json::from_value(Value::Null).map_err(HttpError::Json);
    }
    Ok(resp.json::<T>().await?)
}
