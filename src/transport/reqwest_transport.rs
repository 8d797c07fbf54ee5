//! Reqwest-backed [`Transport`].
//!
//! Clients are cached per proxy endpoint so connection pools survive across
//! attempts that reuse the same egress. The cache is capped, and an endpoint
//! is dropped from it as soon as it fails at connection level.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, redirect::Policy};
use tokio::sync::Mutex;

use super::{ResponseBody, Transport, TransportError, TransportRequest, TransportResponse};

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Whole-request timeout, connect and body included.
    pub timeout: Duration,
    pub max_redirects: usize,
    /// Proxy endpoints kept with a live client.
    pub max_clients: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_redirects: 5,
            max_clients: 64,
        }
    }
}

#[derive(Default)]
struct ClientPool {
    clients: HashMap<Option<String>, Client>,
    order: VecDeque<Option<String>>,
}

impl ClientPool {
    fn get(&mut self, key: &Option<String>) -> Option<Client> {
        let client = self.clients.get(key)?.clone();
        if let Some(pos) = self.order.iter().position(|k| k == key)
            && let Some(k) = self.order.remove(pos)
        {
            self.order.push_back(k);
        }
        Some(client)
    }

    fn insert(&mut self, key: Option<String>, client: Client, capacity: usize) {
        while self.clients.len() >= capacity.max(1) {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.clients.remove(&oldest);
        }
        self.order.push_back(key.clone());
        self.clients.insert(key, client);
    }

    fn remove(&mut self, key: &Option<String>) {
        if self.clients.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    fn len(&self) -> usize {
        self.clients.len()
    }

    fn contains(&self, key: &Option<String>) -> bool {
        self.clients.contains_key(key)
    }
}

/// HTTP executor on `reqwest`, one client per proxy endpoint.
pub struct ReqwestTransport {
    config: TransportConfig,
    pool: Mutex<ClientPool>,
}

impl ReqwestTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            pool: Mutex::new(ClientPool::default()),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    async fn client(&self, proxy: Option<&str>) -> Result<Client, TransportError> {
        let mut pool = self.pool.lock().await;
        let key = proxy.map(|p| p.to_string());
        if let Some(client) = pool.get(&key) {
            return Ok(client);
        }

        // Cookies come from the rotating identity, never from a client jar.
        let mut builder = Client::builder()
            .timeout(self.config.timeout)
            .redirect(Policy::limited(self.config.max_redirects));

        if let Some(endpoint) = proxy {
            let proxy = reqwest::Proxy::all(endpoint)
                .map_err(|err| TransportError::InvalidProxy(err.to_string()))?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }

        let client = builder
            .build()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        pool.insert(key, client.clone(), self.config.max_clients);
        Ok(client)
    }

    async fn forget(&self, proxy: &str) {
        self.pool.lock().await.remove(&Some(proxy.to_string()));
        log::debug!("dropped cached client for failing proxy endpoint");
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

fn map_error(err: reqwest::Error, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let client = self.client(request.proxy.as_deref()).await?;
        let timeout = self.config.timeout;

        let sent = client
            .get(request.url.clone())
            .headers(request.headers.clone())
            .send()
            .await
            .map_err(|err| map_error(err, timeout));
        let response = match sent {
            Ok(response) => response,
            Err(err) => {
                if err.is_connection_level()
                    && let Some(proxy) = request.proxy.as_deref()
                {
                    self.forget(proxy).await;
                }
                return Err(err);
            }
        };

        let status = response.status().as_u16();
        if status >= 500 {
            return Err(TransportError::Server { status });
        }

        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = if request.stream && response.status().is_success() {
            ResponseBody::Streaming(
                response
                    .bytes_stream()
                    .map(move |chunk| chunk.map_err(|err| map_error(err, timeout)))
                    .boxed(),
            )
        } else {
            ResponseBody::Buffered(response.bytes().await.map_err(|err| map_error(err, timeout))?)
        };

        Ok(TransportResponse {
            status,
            headers,
            body,
            url,
        })
    }
}
