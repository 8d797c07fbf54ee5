//! Outbound request orchestration.
//!
//! Wires the identity provider, proxy selector, health governor, pacer and
//! transport into a bounded worker pool. Callers submit a URL and receive the
//! response (or a classified error) once a worker has driven the request
//! through its attempts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, header};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use crate::config::DispatchSettings;
use crate::modules::cache::{DEFAULT_CACHE_TTL, ResponseCache};
use crate::modules::clock::{SharedClock, SystemClock};
use crate::modules::events::{
	AttemptEvent, AttemptStatus, CompletedEvent, DispatchEvent, EventDispatcher, EventHandler,
	FallbackEvent, LoggingHandler, MetricsHandler, RejectReason, RejectedEvent, RetryEvent,
	SubmittedEvent,
};
use crate::modules::governor::{GovernorConfig, GovernorError, HealthGovernor, HealthSnapshot};
use crate::modules::identity::{CookieSet, Identity, IdentityError, IdentityProvider};
use crate::modules::metrics::MetricsCollector;
use crate::modules::pacing::{Pacer, PacingConfig};
use crate::modules::proxy::{
	ProxyDescriptor, ProxyError, ProxyHealthReport, ProxyLease, ProxySelector, RotationStrategy,
};
use crate::modules::rng::SharedRng;
use crate::modules::spoofing::{Fingerprint, FingerprintCatalog, HeaderTemplate, looks_automated};
use crate::modules::store::{MemoryStore, PoolStore, StoreError};
use crate::transport::{
	BodyStream, ReqwestTransport, ResponseBody, Transport, TransportConfig, TransportError,
	TransportRequest, TransportResponse,
};

/// Result alias used across the orchestration layer.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// High-level error surfaced to callers of [`Dispatcher::submit`].
#[derive(Debug, Error)]
pub enum DispatchError {
	#[error("no active, unexpired identity available")]
	NoIdentityAvailable,
	#[error("no usable proxy available")]
	NoProxyAvailable,
	#[error("upstream blocked or rate limited the request (status {status})")]
	BlockedOrRateLimited { status: u16 },
	#[error("transport failure: {0}")]
	Transport(#[from] TransportError),
	#[error("cooldown active, retry in {remaining:?}")]
	CooldownActive { remaining: Duration },
	#[error("retries exhausted after {attempts} attempts: {last}")]
	RetriesExhausted {
		attempts: u32,
		last: Box<DispatchError>,
	},
	#[error("url parse error: {0}")]
	InvalidUrl(#[from] url::ParseError),
	#[error("header conversion failed: {0}")]
	InvalidHeader(String),
	#[error("response decoding failed: {0}")]
	Decode(String),
	#[error("pool store error: {0}")]
	Store(#[from] StoreError),
	#[error("invalid configuration: {0}")]
	Config(String),
	#[error("dispatcher is shut down")]
	Shutdown,
}

impl From<GovernorError> for DispatchError {
	fn from(err: GovernorError) -> Self {
		match err {
			GovernorError::CooldownActive { remaining } => DispatchError::CooldownActive { remaining },
		}
	}
}

impl From<IdentityError> for DispatchError {
	fn from(err: IdentityError) -> Self {
		match err {
			IdentityError::NoIdentityAvailable => DispatchError::NoIdentityAvailable,
			IdentityError::Store(err) => DispatchError::Store(err),
			IdentityError::Headers(err) => DispatchError::InvalidHeader(err.to_string()),
		}
	}
}

impl From<ProxyError> for DispatchError {
	fn from(err: ProxyError) -> Self {
		match err {
			ProxyError::NoProxyAvailable | ProxyError::InvalidDescriptor { .. } => {
				DispatchError::NoProxyAvailable
			}
			ProxyError::Store(err) => DispatchError::Store(err),
		}
	}
}

/// Expected shape of the response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
	/// Decode the body as JSON; a non-JSON body fails the request.
	Json,
	#[default]
	Text,
	Bytes,
	/// Hand a successful body back as a chunk stream via
	/// [`DispatchResponse::take_stream`].
	Stream,
}

/// Per-request options supplied at submission.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
	/// Headers layered over the identity's header set.
	pub headers: HeaderMap,
	pub mode: ResponseMode,
}

impl RequestOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn json() -> Self {
		Self::default().with_mode(ResponseMode::Json)
	}

	pub fn with_mode(mut self, mode: ResponseMode) -> Self {
		self.mode = mode;
		self
	}

	pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
		self.headers.insert(name, value);
		self
	}

	pub fn with_headers(mut self, headers: HeaderMap) -> Self {
		self.headers.extend(headers);
		self
	}
}

#[derive(Clone)]
enum Payload {
	Buffered(Bytes),
	Stream(Arc<StdMutex<Option<BodyStream>>>),
}

impl From<ResponseBody> for Payload {
	fn from(body: ResponseBody) -> Self {
		match body {
			ResponseBody::Buffered(bytes) => Payload::Buffered(bytes),
			ResponseBody::Streaming(stream) => Payload::Stream(Arc::new(StdMutex::new(Some(stream)))),
		}
	}
}

impl fmt::Debug for Payload {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Payload::Buffered(bytes) => write!(f, "Buffered({} bytes)", bytes.len()),
			Payload::Stream(_) => f.write_str("Stream"),
		}
	}
}

/// Successful response handed back to the caller.
#[derive(Debug, Clone)]
pub struct DispatchResponse {
	status: u16,
	headers: HeaderMap,
	body: Payload,
	url: Url,
	json: Option<Value>,
	proxy_id: Option<String>,
	session_id: String,
	fingerprint_id: String,
	attempts: u32,
}

impl DispatchResponse {
	pub fn status(&self) -> u16 {
		self.status
	}

	/// Final URL after redirects.
	pub fn url(&self) -> &Url {
		&self.url
	}

	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	/// Buffered body. Empty for streamed responses.
	pub fn bytes(&self) -> Bytes {
		match &self.body {
			Payload::Buffered(bytes) => bytes.clone(),
			Payload::Stream(_) => Bytes::new(),
		}
	}

	pub fn text(&self) -> DispatchResult<String> {
		String::from_utf8(self.bytes().to_vec()).map_err(|err| DispatchError::Decode(err.to_string()))
	}

	pub fn is_streamed(&self) -> bool {
		matches!(self.body, Payload::Stream(_))
	}

	/// Body chunks of a [`ResponseMode::Stream`] response. The stream is
	/// handed out once, clones included.
	pub fn take_stream(&self) -> Option<BodyStream> {
		match &self.body {
			Payload::Stream(slot) => slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take(),
			Payload::Buffered(_) => None,
		}
	}

	/// Decoded payload, present for [`ResponseMode::Json`] requests.
	pub fn json(&self) -> Option<&Value> {
		self.json.as_ref()
	}

	/// Proxy that served the response, `None` when it went direct.
	pub fn proxy_id(&self) -> Option<&str> {
		self.proxy_id.as_deref()
	}

	pub fn session_id(&self) -> &str {
		&self.session_id
	}

	pub fn fingerprint_id(&self) -> &str {
		&self.fingerprint_id
	}

	/// Attempts consumed, the successful one included.
	pub fn attempts(&self) -> u32 {
		self.attempts
	}
}

/// Dispatcher configuration used by the builder.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
	/// Number of workers draining the queue.
	pub concurrency: usize,
	pub max_attempts: u32,
	pub queue_capacity: usize,
	/// Fail with `NoProxyAvailable` instead of going direct.
	pub require_proxy: bool,
	pub rotation: RotationStrategy,
	pub pacing: PacingConfig,
	pub governor: GovernorConfig,
	pub transport: TransportConfig,
	pub cache_ttl: Duration,
	pub enable_metrics: bool,
	pub rng_seed: Option<u64>,
}

impl Default for DispatcherConfig {
	fn default() -> Self {
		Self {
			concurrency: 2,
			max_attempts: 3,
			queue_capacity: 1024,
			require_proxy: false,
			rotation: RotationStrategy::Random,
			pacing: PacingConfig::default(),
			governor: GovernorConfig::default(),
			transport: TransportConfig::default(),
			cache_ttl: DEFAULT_CACHE_TTL,
			enable_metrics: true,
			rng_seed: None,
		}
	}
}

/// Fluent builder for [`Dispatcher`].
pub struct DispatcherBuilder {
	config: DispatcherConfig,
	proxy_store: Option<Arc<dyn PoolStore<ProxyDescriptor>>>,
	session_store: Option<Arc<dyn PoolStore<CookieSet>>>,
	transport: Option<Arc<dyn Transport>>,
	clock: Option<SharedClock>,
	fingerprints: Option<Vec<Fingerprint>>,
	header_template: Option<HeaderTemplate>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl DispatcherBuilder {
	pub fn new() -> Self {
		Self {
			config: DispatcherConfig::default(),
			proxy_store: None,
			session_store: None,
			transport: None,
			clock: None,
			fingerprints: None,
			header_template: None,
			handlers: Vec::new(),
		}
	}

	pub fn with_config(mut self, config: DispatcherConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_concurrency(mut self, workers: usize) -> Self {
		self.config.concurrency = workers.max(1);
		self
	}

	pub fn with_max_attempts(mut self, attempts: u32) -> Self {
		self.config.max_attempts = attempts.max(1);
		self
	}

	pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
		self.config.queue_capacity = capacity.max(1);
		self
	}

	pub fn require_proxy(mut self) -> Self {
		self.config.require_proxy = true;
		self
	}

	pub fn with_rotation_strategy(mut self, strategy: RotationStrategy) -> Self {
		self.config.rotation = strategy;
		self
	}

	pub fn with_pacing(mut self, pacing: PacingConfig) -> Self {
		self.config.pacing = pacing;
		self
	}

	pub fn with_governor_config(mut self, governor: GovernorConfig) -> Self {
		self.config.governor = governor;
		self
	}

	pub fn with_transport_config(mut self, transport: TransportConfig) -> Self {
		self.config.transport = transport;
		self
	}

	pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
		self.config.cache_ttl = ttl;
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.config.enable_metrics = false;
		self
	}

	pub fn with_rng_seed(mut self, seed: u64) -> Self {
		self.config.rng_seed = Some(seed);
		self
	}

	pub fn with_proxy_store(mut self, store: Arc<dyn PoolStore<ProxyDescriptor>>) -> Self {
		self.proxy_store = Some(store);
		self
	}

	pub fn with_session_store(mut self, store: Arc<dyn PoolStore<CookieSet>>) -> Self {
		self.session_store = Some(store);
		self
	}

	pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
		self.transport = Some(transport);
		self
	}

	pub fn with_clock(mut self, clock: SharedClock) -> Self {
		self.clock = Some(clock);
		self
	}

	pub fn with_fingerprints(mut self, fingerprints: Vec<Fingerprint>) -> Self {
		self.fingerprints = Some(fingerprints);
		self
	}

	pub fn with_header_template(mut self, template: HeaderTemplate) -> Self {
		self.header_template = Some(template);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	/// Build and start the worker pool. Must be called inside a Tokio runtime.
	pub fn build(self) -> DispatchResult<Dispatcher> {
		Dispatcher::start(self)
	}
}

impl Default for DispatcherBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// A logical request waiting for a worker.
#[derive(Debug)]
pub struct QueuedRequest {
	pub id: u64,
	pub url: Url,
	pub options: RequestOptions,
	pub remaining_attempts: u32,
	pub created_at: DateTime<Utc>,
	reply: oneshot::Sender<DispatchResult<DispatchResponse>>,
}

/// Tagged result of one attempt.
#[derive(Debug)]
enum AttemptOutcome {
	Success {
		response: TransportResponse,
		json: Option<Value>,
	},
	Retryable {
		error: DispatchError,
		status: Option<u16>,
	},
	Fatal {
		error: DispatchError,
		status: Option<u16>,
	},
}

static BLOCK_SIGNATURE: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r"(?i)rate limit|too many requests|please wait a few minutes|blocked|suspicious activity")
		.expect("invalid block signature regex")
});

fn is_block_status(status: u16) -> bool {
	status == 403 || status == 429
}

fn classify(result: Result<TransportResponse, TransportError>, mode: ResponseMode) -> AttemptOutcome {
	let response = match result {
		Ok(response) => response,
		Err(err) => {
			let status = err.status();
			return AttemptOutcome::Retryable {
				error: DispatchError::Transport(err),
				status,
			};
		}
	};

	let status = response.status;
	let blocked = is_block_status(status)
		|| (!(200..300).contains(&status)
			&& response
				.body
				.as_bytes()
				.is_some_and(|body| BLOCK_SIGNATURE.is_match(&String::from_utf8_lossy(body))));
	if blocked {
		return AttemptOutcome::Retryable {
			error: DispatchError::BlockedOrRateLimited { status },
			status: Some(status),
		};
	}

	match mode {
		ResponseMode::Json => {
			let decoded = match response.body.as_bytes() {
				Some(body) => serde_json::from_slice::<Value>(body).map_err(|err| err.to_string()),
				None => Err("streamed body cannot be decoded as JSON".to_string()),
			};
			match decoded {
				Ok(json) => AttemptOutcome::Success {
					response,
					json: Some(json),
				},
				Err(err) => AttemptOutcome::Fatal {
					error: DispatchError::Decode(err),
					status: Some(status),
				},
			}
		}
		ResponseMode::Text | ResponseMode::Bytes | ResponseMode::Stream => AttemptOutcome::Success {
			response,
			json: None,
		},
	}
}

/// State shared by every worker.
struct DispatcherInner {
	config: DispatcherConfig,
	identities: IdentityProvider,
	proxies: ProxySelector,
	governor: HealthGovernor,
	pacer: Pacer,
	transport: Arc<dyn Transport>,
	events: Arc<EventDispatcher>,
	clock: SharedClock,
}

/// Main dispatch orchestrator.
pub struct Dispatcher {
	inner: Arc<DispatcherInner>,
	sender: StdMutex<Option<mpsc::Sender<QueuedRequest>>>,
	workers: Mutex<Vec<JoinHandle<()>>>,
	reset_task: JoinHandle<()>,
	cache: ResponseCache<DispatchResponse>,
	metrics: Option<MetricsCollector>,
	next_id: AtomicU64,
}

impl Dispatcher {
	/// Obtain a builder to customise the dispatcher instance.
	pub fn builder() -> DispatcherBuilder {
		DispatcherBuilder::new()
	}

	fn start(builder: DispatcherBuilder) -> DispatchResult<Self> {
		let DispatcherBuilder {
			config,
			proxy_store,
			session_store,
			transport,
			clock,
			fingerprints,
			header_template,
			handlers,
		} = builder;

		DispatchSettings::from(&config)
			.validate()
			.map_err(|err| DispatchError::Config(err.to_string()))?;

		let clock: SharedClock = clock.unwrap_or_else(|| Arc::new(SystemClock));
		let rng = config
			.rng_seed
			.map(SharedRng::from_seed)
			.unwrap_or_else(SharedRng::from_entropy);

		let catalog = match fingerprints {
			Some(presets) => FingerprintCatalog::new(presets, rng.clone())
				.map_err(|err| DispatchError::Config(err.to_string()))?,
			None => FingerprintCatalog::builtin(rng.clone()),
		};
		let session_store: Arc<dyn PoolStore<CookieSet>> = session_store.unwrap_or_else(|| {
			log::warn!("no session store configured; every request will lack an identity");
			Arc::new(MemoryStore::<CookieSet>::new())
		});
		let proxy_store: Arc<dyn PoolStore<ProxyDescriptor>> =
			proxy_store.unwrap_or_else(|| Arc::new(MemoryStore::<ProxyDescriptor>::new()));

		let identities = IdentityProvider::new(
			session_store,
			catalog,
			header_template.unwrap_or_default(),
			rng.clone(),
			clock.clone(),
		);
		let proxies = ProxySelector::new(proxy_store, config.rotation, rng.clone(), clock.clone());
		let governor = HealthGovernor::new(config.governor.clone(), clock.clone());
		let pacer = Pacer::new(config.pacing.clone(), rng);
		let transport: Arc<dyn Transport> = transport
			.unwrap_or_else(|| Arc::new(ReqwestTransport::new(config.transport.clone())));
		let cache = ResponseCache::new(config.cache_ttl, clock.clone());
		let metrics = config.enable_metrics.then(MetricsCollector::new);

		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		if let Some(ref collector) = metrics {
			events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
		}
		for handler in handlers {
			events.register_handler(handler);
		}

		let reset_task = governor.spawn_reset_task();
		let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
		let receiver = Arc::new(Mutex::new(receiver));
		let concurrency = config.concurrency.max(1);

		let inner = Arc::new(DispatcherInner {
			config,
			identities,
			proxies,
			governor,
			pacer,
			transport,
			events: Arc::new(events),
			clock,
		});

		let workers = (0..concurrency)
			.map(|worker| tokio::spawn(worker_loop(worker, inner.clone(), receiver.clone())))
			.collect();
		log::info!("dispatcher started with {concurrency} workers");

		Ok(Self {
			inner,
			sender: StdMutex::new(Some(sender)),
			workers: Mutex::new(workers),
			reset_task,
			cache,
			metrics,
			next_id: AtomicU64::new(1),
		})
	}

	/// Queue a GET for `url` and wait for its final outcome.
	pub async fn submit(&self, url: &str, options: RequestOptions) -> DispatchResult<DispatchResponse> {
		let url = Url::parse(url)?;
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);

		if let Err(err) = self.inner.governor.may_proceed() {
			let err = DispatchError::from(err);
			self.inner.reject(id, &url, RejectReason::Cooldown, &err);
			return Err(err);
		}

		let sender = self
			.sender
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
			.clone()
			.ok_or(DispatchError::Shutdown)?;

		let (reply, outcome) = oneshot::channel();
		let request = QueuedRequest {
			id,
			url: url.clone(),
			options,
			remaining_attempts: self.inner.config.max_attempts.max(1),
			created_at: self.inner.clock.now(),
			reply,
		};

		self.inner.events.dispatch(DispatchEvent::Submitted(SubmittedEvent {
			request_id: id,
			url,
			timestamp: request.created_at,
		}));

		sender.send(request).await.map_err(|_| DispatchError::Shutdown)?;
		outcome.await.map_err(|_| DispatchError::Shutdown)?
	}

	/// Serve `key` from the response cache, submitting on a miss and caching
	/// the successful response. Streamed requests bypass the cache.
	pub async fn fetch_cached(
		&self,
		key: &str,
		url: &str,
		options: RequestOptions,
	) -> DispatchResult<DispatchResponse> {
		if options.mode == ResponseMode::Stream {
			log::debug!("streamed request for {key} is not cached");
			return self.submit(url, options).await;
		}
		if let Some(hit) = self.cache.get(key) {
			log::debug!("cache hit for {key}");
			return Ok(hit);
		}
		let response = self.submit(url, options).await?;
		self.cache.set(key, response.clone());
		Ok(response)
	}

	pub fn cache(&self) -> &ResponseCache<DispatchResponse> {
		&self.cache
	}

	pub fn governor(&self) -> &HealthGovernor {
		&self.inner.governor
	}

	pub fn health(&self) -> HealthSnapshot {
		self.inner.governor.snapshot()
	}

	pub fn metrics(&self) -> Option<&MetricsCollector> {
		self.metrics.as_ref()
	}

	pub async fn proxy_health(&self) -> DispatchResult<ProxyHealthReport> {
		Ok(self.inner.proxies.health_report().await?)
	}

	/// Deactivate expired cookie sessions in the session store.
	pub async fn deactivate_expired_sessions(&self) -> DispatchResult<usize> {
		Ok(self.inner.identities.deactivate_expired().await?)
	}

	/// Stop accepting submissions, let workers drain the queue, and join them.
	pub async fn shutdown(&self) {
		let sender = self
			.sender
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
			.take();
		drop(sender);

		let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
		for worker in workers {
			if let Err(err) = worker.await {
				log::error!("dispatcher worker ended abnormally: {err}");
			}
		}
		self.reset_task.abort();
		log::info!("dispatcher shut down");
	}
}

impl Drop for Dispatcher {
	fn drop(&mut self) {
		self.reset_task.abort();
	}
}

async fn worker_loop(
	worker: usize,
	inner: Arc<DispatcherInner>,
	queue: Arc<Mutex<mpsc::Receiver<QueuedRequest>>>,
) {
	loop {
		let next = {
			let mut receiver = queue.lock().await;
			receiver.recv().await
		};
		let Some(mut request) = next else {
			break;
		};

		let result = inner.process(&mut request).await;
		if request.reply.send(result).is_err() {
			log::debug!("caller for #{} went away before completion", request.id);
		}

		inner.pacer.pause(inner.pacer.human_delay()).await;
	}
	log::debug!("dispatcher worker {worker} stopped");
}

impl DispatcherInner {
	async fn process(&self, request: &mut QueuedRequest) -> DispatchResult<DispatchResponse> {
		let max_attempts = request.remaining_attempts;
		let mut previous_session: Option<String> = None;
		let mut previous_proxy: Option<String> = None;
		let mut connection_failures = 0u32;
		let mut last_error: Option<DispatchError> = None;

		while request.remaining_attempts > 0 {
			request.remaining_attempts -= 1;
			let attempt = max_attempts - request.remaining_attempts;

			if let Err(err) = self.governor.may_proceed() {
				let err = DispatchError::from(err);
				self.reject(request.id, &request.url, RejectReason::Cooldown, &err);
				return Err(err);
			}

			if self.governor.should_throttle() {
				let delay = self.pacer.throttle_delay();
				log::info!("throughput threshold reached, pausing {delay:?}");
				self.pacer.pause(delay).await;
			}

			let identity = match self.identities.next_identity(previous_session.as_deref()).await {
				Ok(identity) => identity,
				Err(err) => return Err(self.fail(request, err.into())),
			};
			let lease = match self.proxies.next_proxy(previous_proxy.as_deref()).await {
				Ok(lease) => Some(lease),
				Err(ProxyError::NoProxyAvailable | ProxyError::InvalidDescriptor { .. })
					if !self.config.require_proxy =>
				{
					log::debug!("no proxy for #{}, going direct", request.id);
					None
				}
				Err(err) => return Err(self.fail(request, err.into())),
			};
			previous_session = Some(identity.session_id.clone());
			previous_proxy = lease.as_ref().map(|lease| lease.id().to_string());

			let headers = match compose_headers(&identity, &request.options) {
				Ok(headers) => headers,
				Err(err) => return Err(self.fail(request, err)),
			};

			self.pacer.pause(self.pacer.human_delay()).await;

			let (result, proxy_id, latency) = self
				.execute(request, attempt, &identity, lease.as_ref(), headers)
				.await;

			match classify(result, request.options.mode) {
				AttemptOutcome::Success { response, json } => {
					self.governor.record_success(response.status);
					if let Some(id) = proxy_id.as_deref() {
						self.proxies.report_success(id);
					}
					self.completed(request, attempt, Some(response.status), AttemptStatus::Success, latency);
					return Ok(DispatchResponse {
						status: response.status,
						headers: response.headers,
						body: Payload::from(response.body),
						url: response.url,
						json,
						proxy_id,
						session_id: identity.session_id,
						fingerprint_id: identity.fingerprint.id.clone(),
						attempts: attempt,
					});
				}
				AttemptOutcome::Retryable { error, status } => {
					self.governor.record_failure(status);
					if let Some(id) = proxy_id.as_deref() {
						self.proxies.report_failure(id);
					}
					let outcome = match error {
						DispatchError::BlockedOrRateLimited { .. } => AttemptStatus::Blocked,
						_ => AttemptStatus::Failed,
					};
					self.completed(request, attempt, status, outcome, latency);

					let backoff = match &error {
						DispatchError::Transport(err) if err.is_connection_level() => {
							connection_failures += 1;
							self.pacer.backoff_delay(connection_failures)
						}
						_ => Duration::ZERO,
					};
					if request.remaining_attempts > 0 {
						self.events.dispatch(DispatchEvent::Retry(RetryEvent {
							request_id: request.id,
							attempt: attempt + 1,
							reason: error.to_string(),
							scheduled_after: backoff,
							timestamp: self.clock.now(),
						}));
						self.pacer.pause(backoff).await;
					}
					last_error = Some(error);
				}
				AttemptOutcome::Fatal { error, status } => {
					self.governor.record_failure(status);
					self.completed(request, attempt, status, AttemptStatus::Failed, latency);
					return Err(self.fail(request, error));
				}
			}
		}

		let last = last_error.unwrap_or(DispatchError::Shutdown);
		let err = DispatchError::RetriesExhausted {
			attempts: max_attempts,
			last: Box::new(last),
		};
		self.reject(request.id, &request.url, RejectReason::RetriesExhausted, &err);
		Err(err)
	}

	/// One attempt, with a single direct retry when the proxy fails at
	/// connection level. Returns the proxy that produced the result.
	async fn execute(
		&self,
		request: &QueuedRequest,
		attempt: u32,
		identity: &Identity,
		lease: Option<&ProxyLease>,
		headers: HeaderMap,
	) -> (Result<TransportResponse, TransportError>, Option<String>, Duration) {
		let mut transport_request = TransportRequest::new(request.url.clone(), headers);
		if request.options.mode == ResponseMode::Stream {
			transport_request = transport_request.streaming();
		}
		if let Some(lease) = lease {
			transport_request = transport_request.with_proxy(lease.endpoint.clone());
		}

		self.events.dispatch(DispatchEvent::Attempt(AttemptEvent {
			request_id: request.id,
			attempt,
			url: request.url.clone(),
			proxy_id: lease.map(|lease| lease.id().to_string()),
			session_id: identity.session_id.clone(),
			fingerprint_id: identity.fingerprint.id.clone(),
			timestamp: self.clock.now(),
		}));

		let started = Instant::now();
		let result = self.transport.execute(&transport_request).await;

		match (result, lease) {
			(Err(err), Some(lease)) if err.is_connection_level() => {
				self.proxies.report_failure(lease.id());
				self.events.dispatch(DispatchEvent::Fallback(FallbackEvent {
					request_id: request.id,
					proxy_id: lease.id().to_string(),
					error: err.to_string(),
					timestamp: self.clock.now(),
				}));
				let direct = self.transport.execute(&transport_request.direct()).await;
				(direct, None, started.elapsed())
			}
			(result, lease) => (
				result,
				lease.map(|lease| lease.id().to_string()),
				started.elapsed(),
			),
		}
	}

	fn completed(
		&self,
		request: &QueuedRequest,
		attempt: u32,
		status: Option<u16>,
		outcome: AttemptStatus,
		latency: Duration,
	) {
		self.events.dispatch(DispatchEvent::Completed(CompletedEvent {
			request_id: request.id,
			attempt,
			url: request.url.clone(),
			status,
			outcome,
			latency,
			timestamp: self.clock.now(),
		}));
	}

	fn fail(&self, request: &QueuedRequest, err: DispatchError) -> DispatchError {
		self.reject(request.id, &request.url, RejectReason::Fatal, &err);
		err
	}

	fn reject(&self, request_id: u64, url: &Url, reason: RejectReason, err: &DispatchError) {
		self.events.dispatch(DispatchEvent::Rejected(RejectedEvent {
			request_id,
			url: url.clone(),
			reason,
			error: err.to_string(),
			timestamp: self.clock.now(),
		}));
	}
}

/// Identity headers, then response-mode defaults, then caller overrides.
fn compose_headers(identity: &Identity, options: &RequestOptions) -> DispatchResult<HeaderMap> {
	let mut headers = identity.headers.clone();
	if options.mode == ResponseMode::Json {
		headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
	}
	for (name, value) in &options.headers {
		headers.insert(name.clone(), value.clone());
	}

	if looks_automated(&headers) {
		log::warn!("automation signature in user agent override, restoring fingerprint value");
		let agent = HeaderValue::from_str(&identity.fingerprint.user_agent)
			.map_err(|_| DispatchError::InvalidHeader(header::USER_AGENT.to_string()))?;
		headers.insert(header::USER_AGENT, agent);
	}
	Ok(headers)
}
