#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};

use geotorget_core::{DownloadState, Order, OrderFile, OrderId};
use geotorget_sync::{FileBody, ProgressCallback, ProgressEvent, RemoteError, RemoteOrderClient};

pub const ORDER_ID: &str = "fe76535a-1b2c-4d3e-8f90-a1b2c3d4e5f6";
pub const RELEASE_A: &str = "2024-01-01T00:00:00Z";
pub const RELEASE_B: &str = "2024-06-01T00:00:00Z";

pub fn order_id() -> OrderId {
    ORDER_ID.parse().unwrap()
}

pub fn other_order_id(n: u8) -> OrderId {
    format!("{n:08x}-0000-4000-8000-000000000000").parse().unwrap()
}

pub fn file_url(order_id: &OrderId, name: &str) -> String {
    format!("https://files.test/{order_id}/{name}")
}

/// Listing JSON in the remote wire format, every file stamped with `release`.
pub fn listing(order_id: &OrderId, release: &str, files: &[(&str, &[u8])]) -> Value {
    Value::Array(
        files
            .iter()
            .map(|(name, content)| {
                json!({
                    "title": name,
                    "href": file_url(order_id, name),
                    "length": content.len(),
                    "displaySize": format!("{} B", content.len()),
                    "updated": release,
                })
            })
            .collect(),
    )
}

#[derive(Default)]
struct FileScript {
    content: Vec<u8>,
    failures: VecDeque<RemoteError>,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
    stall_after: Option<usize>,
    truncate_next: usize,
    hang_next: usize,
}

#[derive(Default)]
struct State {
    listings: HashMap<OrderId, Value>,
    listing_failures: HashMap<OrderId, VecDeque<RemoteError>>,
    files: HashMap<String, FileScript>,
    subscriptions: Vec<OrderId>,
    fetches: Vec<(String, u64)>,
    listing_fetches: usize,
}

/// In-memory remote with scripted failures, delays and a request log.
#[derive(Default)]
pub struct ScriptedClient {
    state: Mutex<State>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an order whose files all carry `release` as their stamp.
    pub fn with_order(self, order_id: OrderId, release: &str, files: &[(&str, &[u8])]) -> Self {
        self.publish(order_id, release, files);
        self
    }

    pub fn with_subscriptions(self, ids: &[OrderId]) -> Self {
        self.state.lock().unwrap().subscriptions = ids.to_vec();
        self
    }

    /// Replace (or add) the listing and file bodies of an order.
    pub fn publish(&self, order_id: OrderId, release: &str, files: &[(&str, &[u8])]) {
        let mut state = self.state.lock().unwrap();
        state
            .listings
            .insert(order_id, listing(&order_id, release, files));
        for (name, content) in files {
            let script = state.files.entry(file_url(&order_id, name)).or_default();
            script.content = content.to_vec();
            if script.chunk_size == 0 {
                script.chunk_size = 4;
            }
        }
    }

    /// Serve `listing` verbatim; bodies come from earlier `publish` calls or `set_body`.
    pub fn set_listing(&self, order_id: OrderId, listing: Value) {
        self.state.lock().unwrap().listings.insert(order_id, listing);
    }

    pub fn set_body(&self, order_id: &OrderId, name: &str, content: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let script = state.files.entry(file_url(order_id, name)).or_default();
        script.content = content.to_vec();
        if script.chunk_size == 0 {
            script.chunk_size = 4;
        }
    }

    pub fn fail_listing(&self, order_id: OrderId, errors: impl IntoIterator<Item = RemoteError>) {
        self.state
            .lock()
            .unwrap()
            .listing_failures
            .entry(order_id)
            .or_default()
            .extend(errors);
    }

    /// Queue errors returned by the next `fetch_file` calls for this file.
    pub fn fail_file(&self, order_id: &OrderId, name: &str, errors: impl IntoIterator<Item = RemoteError>) {
        self.with_script(order_id, name, |s| s.failures.extend(errors));
    }

    pub fn delay_chunks(&self, order_id: &OrderId, name: &str, delay: Duration) {
        self.with_script(order_id, name, |s| s.chunk_delay = Some(delay));
    }

    /// After `chunks` chunks the body never yields again.
    pub fn stall_after(&self, order_id: &OrderId, name: &str, chunks: usize) {
        self.with_script(order_id, name, |s| s.stall_after = Some(chunks));
    }

    /// The next response ends after half of the body.
    pub fn truncate_next(&self, order_id: &OrderId, name: &str) {
        self.with_script(order_id, name, |s| s.truncate_next += 1);
    }

    /// The next `n` requests for `name` never answer.
    pub fn hang_next(&self, order_id: &OrderId, name: &str, n: usize) {
        self.with_script(order_id, name, |s| s.hang_next += n);
    }

    pub fn fetches(&self) -> Vec<(String, u64)> {
        self.state.lock().unwrap().fetches.clone()
    }

    pub fn fetched_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.fetches().into_iter().map(|(n, _)| n).collect();
        names.sort();
        names
    }

    pub fn fetch_count(&self, name: &str) -> usize {
        self.fetches().iter().filter(|(n, _)| n == name).count()
    }

    pub fn listing_fetches(&self) -> usize {
        self.state.lock().unwrap().listing_fetches
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn with_script(&self, order_id: &OrderId, name: &str, f: impl FnOnce(&mut FileScript)) {
        let mut state = self.state.lock().unwrap();
        let script = state.files.entry(file_url(order_id, name)).or_default();
        if script.chunk_size == 0 {
            script.chunk_size = 4;
        }
        f(script);
    }
}

/// Decrements the in-flight counter when a body stream is dropped.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteOrderClient for ScriptedClient {
    async fn fetch_manifest(&self, order_id: &OrderId) -> Result<Order, RemoteError> {
        let listing = {
            let mut state = self.state.lock().unwrap();
            state.listing_fetches += 1;
            if let Some(err) = state
                .listing_failures
                .get_mut(order_id)
                .and_then(|q| q.pop_front())
            {
                return Err(err);
            }
            state.listings.get(order_id).cloned()
        };
        let listing = listing.ok_or_else(|| RemoteError::NotFound {
            what: format!("order {order_id}"),
        })?;
        Order::from_listing(*order_id, listing).map_err(|e| RemoteError::InvalidListing(e.to_string()))
    }

    async fn fetch_file(&self, file: &OrderFile, range_start: u64) -> Result<FileBody, RemoteError> {
        let (content, chunk_size, delay, stall_after, hang) = {
            let mut state = self.state.lock().unwrap();
            state.fetches.push((file.name.clone(), range_start));
            let Some(script) = state.files.get_mut(&file.remote_url) else {
                return Err(RemoteError::Permanent {
                    status: Some(404),
                    message: format!("GET {}", file.remote_url),
                });
            };
            if let Some(err) = script.failures.pop_front() {
                return Err(err);
            }
            let hang = script.hang_next > 0;
            script.hang_next = script.hang_next.saturating_sub(1);
            let mut content = script.content.clone();
            if script.truncate_next > 0 {
                script.truncate_next -= 1;
                content.truncate(content.len() / 2);
            }
            (content, script.chunk_size, script.chunk_delay, script.stall_after, hang)
        };
        if hang {
            futures::future::pending::<()>().await;
        }

        let total = {
            let state = self.state.lock().unwrap();
            state.files[&file.remote_url].content.len() as u64
        };
        let offset = if range_start > 0 && range_start < total {
            range_start
        } else {
            0
        };
        let body: Vec<u8> = content.get(offset as usize..).unwrap_or_default().to_vec();

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = Arc::new(InFlight(Arc::clone(&self.in_flight)));

        let chunks: Vec<Bytes> = body
            .chunks(chunk_size.max(1))
            .map(Bytes::copy_from_slice)
            .collect();
        let limit = stall_after.unwrap_or(usize::MAX);
        let stalls = stall_after.is_some();

        let chunked = stream::iter(chunks.into_iter().take(limit)).then(move |chunk| {
            let guard = Arc::clone(&guard);
            async move {
                let _guard = guard;
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok::<Bytes, RemoteError>(chunk)
            }
        });
        let stream = if stalls {
            chunked
                .chain(stream::pending::<Result<Bytes, RemoteError>>())
                .boxed()
        } else {
            chunked.boxed()
        };

        Ok(FileBody {
            offset,
            total: Some(total),
            stream,
        })
    }

    async fn list_subscribed_orders(&self) -> Result<Vec<OrderId>, RemoteError> {
        let mut ids = self.state.lock().unwrap().subscriptions.clone();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

/// Collects every progress event.
#[derive(Clone, Default)]
pub struct EventLog(pub Arc<Mutex<Vec<ProgressEvent>>>);

impl EventLog {
    pub fn callback(&self) -> ProgressCallback {
        let events = Arc::clone(&self.0);
        Arc::new(move |event: &ProgressEvent| events.lock().unwrap().push(event.clone()))
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.0.lock().unwrap().clone()
    }

    /// Highest number of files simultaneously between their first
    /// `downloading` event and a terminal event.
    pub fn max_concurrent_downloading(&self) -> usize {
        let mut active = std::collections::HashSet::new();
        let mut max = 0;
        for event in self.events() {
            match event.state {
                DownloadState::Downloading => {
                    active.insert(event.file_name.clone());
                }
                s if s.is_terminal() => {
                    active.remove(&event.file_name);
                }
                _ => {}
            }
            max = max.max(active.len());
        }
        max
    }

    /// File names in the order their first `downloading` event was seen.
    pub fn start_order(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for event in self.events() {
            if event.state == DownloadState::Downloading && !seen.contains(&event.file_name) {
                seen.push(event.file_name.clone());
            }
        }
        seen
    }
}

pub fn order_files(order_id: &OrderId, files: &[(&str, &[u8])]) -> Vec<OrderFile> {
    Order::from_listing(*order_id, listing(order_id, RELEASE_A, files))
        .unwrap()
        .files
}
