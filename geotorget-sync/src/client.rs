//! Remote Order Client: every network interaction with the order API.
//!
//! The engine only sees the [`RemoteOrderClient`] trait; [`HttpOrderClient`]
//! is the Geotorget implementation on top of `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};

use geotorget_core::{EngineConfig, Order, OrderFile, OrderId};

use crate::error::RemoteError;

/// Timeout for listing and subscription requests.
const LISTING_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Stream of body chunks for one file request.
pub type ByteStream = BoxStream<'static, Result<Bytes, RemoteError>>;

/// A file body positioned somewhere inside the remote file.
pub struct FileBody {
    /// Byte offset of the first chunk. Zero when the remote ignored the range.
    pub offset: u64,
    /// Full size of the remote file, when the remote told us.
    pub total: Option<u64>,
    pub stream: ByteStream,
}

impl std::fmt::Debug for FileBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBody")
            .field("offset", &self.offset)
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}

/// Network access to the remote order API. Holds no durable state.
#[async_trait]
pub trait RemoteOrderClient: Send + Sync {
    /// Current listing and release id of an order.
    async fn fetch_manifest(&self, order_id: &OrderId) -> Result<Order, RemoteError>;

    /// Body of `file`, starting at `range_start` when the remote supports it.
    async fn fetch_file(&self, file: &OrderFile, range_start: u64) -> Result<FileBody, RemoteError>;

    /// Orders the caller is entitled to check for updates, sorted and de-duplicated.
    async fn list_subscribed_orders(&self) -> Result<Vec<OrderId>, RemoteError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Geotorget download API client.
///
/// - `GET {base_url}/{order_id}/files` for listings
/// - `GET <href>` with an optional `Range` header for file bodies
/// - `GET {subscriptions_url}` or the configured list for subscriptions
#[derive(Debug, Clone)]
pub struct HttpOrderClient {
    client: Client,
    base_url: String,
    subscriptions: Vec<OrderId>,
    subscriptions_url: Option<String>,
    /// Wait for response headers on a file request.
    header_timeout: Duration,
}

impl HttpOrderClient {
    pub fn new(config: &EngineConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("geotorget/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Permanent {
                status: None,
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            subscriptions: config.subscriptions.clone(),
            subscriptions_url: config.subscriptions_url.clone(),
            header_timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
        })
    }

    /// `{base_url}/{order_id}/files`
    pub fn listing_url(&self, order_id: &OrderId) -> String {
        format!("{}/{order_id}/files", self.base_url)
    }

    async fn send_file_request(&self, url: &str, range_start: u64) -> Result<Response, RemoteError> {
        let mut request = self.client.get(url);
        if range_start > 0 {
            request = request.header(RANGE, format!("bytes={range_start}-"));
        }
        match tokio::time::timeout(self.header_timeout, request.send()).await {
            Ok(response) => response.map_err(transport_error),
            Err(_) => Err(RemoteError::Transient(format!(
                "GET {url}: no response within {}s",
                self.header_timeout.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl RemoteOrderClient for HttpOrderClient {
    async fn fetch_manifest(&self, order_id: &OrderId) -> Result<Order, RemoteError> {
        let url = self.listing_url(order_id);
        tracing::debug!(%order_id, %url, "fetching order listing");

        let response = self
            .client
            .get(&url)
            .timeout(LISTING_TIMEOUT)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound {
                what: format!("order {order_id}"),
            });
        }
        if !status.is_success() {
            return Err(classify_status(status, &url));
        }

        let listing: serde_json::Value = response.json().await.map_err(|e| {
            if e.is_decode() {
                RemoteError::InvalidListing(e.to_string())
            } else {
                transport_error(e)
            }
        })?;
        Order::from_listing(*order_id, listing).map_err(|e| RemoteError::InvalidListing(e.to_string()))
    }

    async fn fetch_file(&self, file: &OrderFile, range_start: u64) -> Result<FileBody, RemoteError> {
        let mut response = self.send_file_request(&file.remote_url, range_start).await?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE && range_start > 0 {
            tracing::debug!(file = %file.name, range_start, "range rejected, restarting from zero");
            response = self.send_file_request(&file.remote_url, 0).await?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, &file.remote_url));
        }

        let (offset, total) = if status == StatusCode::PARTIAL_CONTENT {
            let header = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range);
            match header {
                Some((start, total)) => {
                    let total = total.or_else(|| response.content_length().map(|len| start + len));
                    (start, total)
                }
                None => {
                    return Err(RemoteError::Transient(format!(
                        "partial response without usable Content-Range for {}",
                        file.remote_url
                    )))
                }
            }
        } else {
            (0, response.content_length())
        };

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(transport_error))
            .boxed();
        Ok(FileBody {
            offset,
            total,
            stream,
        })
    }

    async fn list_subscribed_orders(&self) -> Result<Vec<OrderId>, RemoteError> {
        let mut ids = match &self.subscriptions_url {
            None => self.subscriptions.clone(),
            Some(url) => {
                let response = self
                    .client
                    .get(url)
                    .timeout(LISTING_TIMEOUT)
                    .send()
                    .await
                    .map_err(transport_error)?;
                let status = response.status();
                if !status.is_success() {
                    return Err(classify_status(status, url));
                }
                let body: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| RemoteError::InvalidListing(e.to_string()))?;
                parse_subscriptions(&body)?
            }
        };
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a non-success status to the error taxonomy.
pub(crate) fn classify_status(status: StatusCode, url: &str) -> RemoteError {
    match status.as_u16() {
        401 | 403 => RemoteError::Unauthorized {
            status: status.as_u16(),
        },
        408 | 429 => RemoteError::Transient(format!("HTTP {status} from {url}")),
        s if s >= 500 => RemoteError::Transient(format!("HTTP {status} from {url}")),
        s => RemoteError::Permanent {
            status: Some(s),
            message: format!("GET {url}"),
        },
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_builder() {
        return RemoteError::Permanent {
            status: None,
            message: e.to_string(),
        };
    }
    RemoteError::Transient(e.to_string())
}

/// Parse `bytes <start>-<end>/<total|*>` into `(start, total)`.
fn parse_content_range(raw: &str) -> Option<(u64, Option<u64>)> {
    let rest = raw.trim().strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, total))
}

/// Accepts `["<uuid>", ...]` or `[{"id": "<uuid>"}, {"order_id": "<uuid>"}, ...]`.
fn parse_subscriptions(body: &serde_json::Value) -> Result<Vec<OrderId>, RemoteError> {
    let Some(items) = body.as_array() else {
        return Err(RemoteError::InvalidListing(
            "subscription list must be a JSON array".to_owned(),
        ));
    };

    items
        .iter()
        .map(|item| {
            let raw = item
                .as_str()
                .or_else(|| item.get("order_id").and_then(|v| v.as_str()))
                .or_else(|| item.get("id").and_then(|v| v.as_str()))
                .ok_or_else(|| {
                    RemoteError::InvalidListing(format!("unrecognised subscription entry {item}"))
                })?;
            raw.parse::<OrderId>()
                .map_err(|e| RemoteError::InvalidListing(e.to_string()))
        })
        .collect()
}
