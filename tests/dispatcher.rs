use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use http::HeaderMap;
use tokio::time::Instant;

use egress_dispatch::{
    CookieSet, DispatchError, Dispatcher, DispatcherBuilder, GovernorConfig, ManualClock,
    MemoryStore, PacingConfig, PoolStore, ProxyDescriptor, RedbStore, RequestOptions,
    ResponseBody, ResponseMode, Transport, TransportError, TransportRequest, TransportResponse,
};

#[derive(Debug, Clone)]
enum Reply {
    Status(u16, &'static str),
    Server(u16),
    Refused,
    /// Proxied calls fail at connection level, direct calls succeed.
    ProxyDown,
    Chunks(&'static [&'static str]),
}

#[derive(Debug, Clone)]
struct Call {
    url: String,
    proxy: Option<String>,
    cookie: Option<String>,
    stream: bool,
    at: Instant,
}

struct ScriptedTransport {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    fn new(fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn scripted(replies: Vec<Reply>, fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(replies.into()),
            fallback,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

fn ok(request: &TransportRequest, status: u16, body: &'static str) -> TransportResponse {
    TransportResponse {
        status,
        headers: HeaderMap::new(),
        body: Bytes::from_static(body.as_bytes()).into(),
        url: request.url.clone(),
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        self.calls.lock().unwrap().push(Call {
            url: request.url.to_string(),
            proxy: request.proxy.clone(),
            cookie: request
                .headers
                .get("cookie")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            stream: request.stream,
            at: Instant::now(),
        });
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match reply {
            Reply::Status(status, body) => Ok(ok(request, status, body)),
            Reply::Server(status) => Err(TransportError::Server { status }),
            Reply::Refused => Err(TransportError::Connect("connection refused".into())),
            Reply::ProxyDown if request.proxy.is_some() => {
                Err(TransportError::Connect("proxy handshake failed".into()))
            }
            Reply::ProxyDown => Ok(ok(request, 200, "direct")),
            Reply::Chunks(chunks) => {
                let body = if request.stream {
                    let chunks = chunks.iter().map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())));
                    ResponseBody::Streaming(futures_util::stream::iter(chunks).boxed())
                } else {
                    ResponseBody::Buffered(Bytes::from(chunks.concat()))
                };
                Ok(TransportResponse {
                    status: 200,
                    headers: HeaderMap::new(),
                    body,
                    url: request.url.clone(),
                })
            }
        }
    }
}

/// Holds every call for a second and records the peak number in flight.
#[derive(Default)]
struct GaugeTransport {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

#[async_trait]
impl Transport for GaugeTransport {
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ok(request, 200, "ok"))
    }
}

fn sessions(count: usize) -> MemoryStore<CookieSet> {
    let expires = Utc::now() + chrono::Duration::days(1);
    MemoryStore::with_records((0..count).map(|i| {
        CookieSet::new(format!("s{i}"), format!("user{i}"), expires)
            .with_cookie("sessionid", format!("cookie-{i}"))
    }))
}

fn proxies(count: usize) -> MemoryStore<ProxyDescriptor> {
    MemoryStore::with_records(
        (0..count).map(|i| ProxyDescriptor::new(format!("p{i}"), format!("10.0.0.{}", i + 1), 8080)),
    )
}

fn harness(transport: Arc<ScriptedTransport>, clock: &ManualClock) -> DispatcherBuilder {
    Dispatcher::builder()
        .with_transport(transport)
        .with_clock(Arc::new(clock.clone()))
        .with_pacing(PacingConfig::immediate())
        .with_concurrency(1)
        .with_rng_seed(7)
        .with_session_store(Arc::new(sessions(2)))
        .with_proxy_store(Arc::new(proxies(2)))
}

const URL: &str = "https://upstream.test/api/users/alice";

#[tokio::test(start_paused = true)]
async fn cooldown_rejects_without_touching_transport() {
    let transport = ScriptedTransport::new(Reply::Status(200, "{}"));
    let clock = ManualClock::default();
    let dispatcher = harness(transport.clone(), &clock).build().unwrap();

    for _ in 0..5 {
        dispatcher.governor().record_failure(Some(429));
    }

    for _ in 0..3 {
        let err = dispatcher.submit(URL, RequestOptions::new()).await.unwrap_err();
        assert!(matches!(err, DispatchError::CooldownActive { .. }), "{err:?}");
    }
    assert!(transport.calls().is_empty());
    let metrics = dispatcher.metrics().unwrap().snapshot();
    assert_eq!(metrics.global.cooldown_rejections, 3);

    clock.advance(Duration::from_secs(61));
    assert!(dispatcher.submit(URL, RequestOptions::new()).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn blocked_attempts_exhaust_retries_and_count_errors() {
    let transport = ScriptedTransport::new(Reply::Status(403, "Forbidden"));
    let clock = ManualClock::default();
    let dispatcher = harness(transport.clone(), &clock)
        .with_max_attempts(3)
        .build()
        .unwrap();

    let err = dispatcher.submit(URL, RequestOptions::new()).await.unwrap_err();
    match err {
        DispatchError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, DispatchError::BlockedOrRateLimited { status: 403 }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(transport.calls().len(), 3);
    assert_eq!(dispatcher.governor().error_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn each_retry_rotates_identity_and_proxy() {
    let transport = ScriptedTransport::scripted(
        vec![
            Reply::Status(429, "Too Many Requests"),
            Reply::Status(400, r#"{"message":"Please wait a few minutes before you try again."}"#),
        ],
        Reply::Status(200, r#"{"user":"alice"}"#),
    );
    let clock = ManualClock::default();
    let dispatcher = harness(transport.clone(), &clock).build().unwrap();

    let response = dispatcher.submit(URL, RequestOptions::json()).await.unwrap();
    assert_eq!(response.attempts(), 3);
    assert_eq!(response.json().unwrap()["user"], "alice");

    let calls = transport.calls();
    assert_eq!(calls.len(), 3);
    for pair in calls.windows(2) {
        assert_ne!(pair[0].proxy, pair[1].proxy);
        assert_ne!(pair[0].cookie, pair[1].cookie);
    }
}

#[tokio::test(start_paused = true)]
async fn thirty_first_request_waits_for_throttle() {
    let transport = ScriptedTransport::new(Reply::Status(200, "ok"));
    let clock = ManualClock::default();
    let pacing = PacingConfig {
        throttle_delay: Duration::from_secs(5),
        ..PacingConfig::immediate()
    };
    let dispatcher = harness(transport.clone(), &clock)
        .with_pacing(pacing)
        .build()
        .unwrap();

    for _ in 0..31 {
        dispatcher.submit(URL, RequestOptions::new()).await.unwrap();
    }

    let calls = transport.calls();
    assert_eq!(calls.len(), 31);
    for pair in calls[..30].windows(2) {
        assert!(pair[1].at - pair[0].at < Duration::from_secs(5));
    }
    assert!(calls[30].at - calls[29].at >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn dead_proxy_falls_back_to_direct_once() {
    let transport = ScriptedTransport::new(Reply::ProxyDown);
    let clock = ManualClock::default();
    let dispatcher = harness(transport.clone(), &clock).build().unwrap();

    let response = dispatcher.submit(URL, RequestOptions::new()).await.unwrap();
    assert_eq!(response.text().unwrap(), "direct");
    assert_eq!(response.proxy_id(), None);
    assert_eq!(response.attempts(), 1);

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].proxy.is_some());
    assert!(calls[1].proxy.is_none());
    assert_eq!(dispatcher.governor().error_count(), 0);

    let global = dispatcher.metrics().unwrap().snapshot().global;
    assert_eq!(global.direct_fallbacks, 1);
    assert_eq!(global.attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_fallback_counts_once_per_attempt() {
    let transport = ScriptedTransport::new(Reply::Refused);
    let clock = ManualClock::default();
    let dispatcher = harness(transport.clone(), &clock)
        .with_max_attempts(2)
        .build()
        .unwrap();

    let err = dispatcher.submit(URL, RequestOptions::new()).await.unwrap_err();
    assert!(matches!(err, DispatchError::RetriesExhausted { attempts: 2, .. }));
    // proxied + direct for each of the two attempts
    assert_eq!(transport.calls().len(), 4);
    assert_eq!(dispatcher.governor().error_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn connection_failures_back_off_exponentially() {
    let transport = ScriptedTransport::scripted(
        vec![Reply::Refused, Reply::Refused],
        Reply::Status(200, "ok"),
    );
    let clock = ManualClock::default();
    let pacing = PacingConfig {
        backoff_base: Duration::from_secs(1),
        backoff_cap: Duration::from_secs(30),
        ..PacingConfig::immediate()
    };
    let dispatcher = harness(transport.clone(), &clock)
        .with_proxy_store(Arc::new(proxies(0)))
        .with_pacing(pacing)
        .build()
        .unwrap();

    let response = dispatcher.submit(URL, RequestOptions::new()).await.unwrap();
    assert_eq!(response.attempts(), 3);

    let calls = transport.calls();
    assert!(calls[1].at - calls[0].at >= Duration::from_secs(1));
    assert!(calls[2].at - calls[1].at >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn server_errors_retry_without_fallback() {
    let transport = ScriptedTransport::scripted(vec![Reply::Server(503)], Reply::Status(200, "ok"));
    let clock = ManualClock::default();
    let dispatcher = harness(transport.clone(), &clock).build().unwrap();

    let response = dispatcher.submit(URL, RequestOptions::new()).await.unwrap();
    assert_eq!(response.attempts(), 2);
    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|call| call.proxy.is_some()));
    assert_eq!(dispatcher.governor().error_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn drains_in_submission_order() {
    let transport = ScriptedTransport::new(Reply::Status(200, "ok"));
    let clock = ManualClock::default();
    let dispatcher = Arc::new(harness(transport.clone(), &clock).build().unwrap());

    let handles: Vec<_> = (0..5)
        .map(|i| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .submit(&format!("https://upstream.test/item/{i}"), RequestOptions::new())
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let order: Vec<_> = transport.calls().into_iter().map(|call| call.url).collect();
    let expected: Vec<_> = (0..5).map(|i| format!("https://upstream.test/item/{i}")).collect();
    assert_eq!(order, expected);
}

#[tokio::test(start_paused = true)]
async fn missing_identity_is_surfaced_immediately() {
    let transport = ScriptedTransport::new(Reply::Status(200, "ok"));
    let clock = ManualClock::default();
    let dispatcher = harness(transport.clone(), &clock)
        .with_session_store(Arc::new(sessions(0)))
        .build()
        .unwrap();

    let err = dispatcher.submit(URL, RequestOptions::new()).await.unwrap_err();
    assert!(matches!(err, DispatchError::NoIdentityAvailable));
    assert!(transport.calls().is_empty());
    assert_eq!(dispatcher.governor().error_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn empty_pool_goes_direct_unless_proxy_required() {
    let transport = ScriptedTransport::new(Reply::Status(200, "ok"));
    let clock = ManualClock::default();
    let direct = harness(transport.clone(), &clock)
        .with_proxy_store(Arc::new(proxies(0)))
        .build()
        .unwrap();
    let response = direct.submit(URL, RequestOptions::new()).await.unwrap();
    assert_eq!(response.proxy_id(), None);

    let strict = harness(transport.clone(), &clock)
        .with_proxy_store(Arc::new(proxies(0)))
        .require_proxy()
        .build()
        .unwrap();
    let err = strict.submit(URL, RequestOptions::new()).await.unwrap_err();
    assert!(matches!(err, DispatchError::NoProxyAvailable));
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cached_fetch_skips_second_upstream_call() {
    let transport = ScriptedTransport::new(Reply::Status(200, r#"{"followers":10}"#));
    let clock = ManualClock::default();
    let dispatcher = harness(transport.clone(), &clock).build().unwrap();

    let first = dispatcher
        .fetch_cached("profile:alice", URL, RequestOptions::json())
        .await
        .unwrap();
    let second = dispatcher
        .fetch_cached("profile:alice", URL, RequestOptions::json())
        .await
        .unwrap();
    assert_eq!(first.json(), second.json());
    assert_eq!(transport.calls().len(), 1);

    clock.advance(Duration::from_secs(5 * 60 + 1));
    dispatcher
        .fetch_cached("profile:alice", URL, RequestOptions::json())
        .await
        .unwrap();
    assert_eq!(transport.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn submissions_after_shutdown_fail() {
    let transport = ScriptedTransport::new(Reply::Status(200, "ok"));
    let clock = ManualClock::default();
    let dispatcher = harness(transport, &clock).build().unwrap();

    dispatcher.submit(URL, RequestOptions::new()).await.unwrap();
    dispatcher.shutdown().await;
    let err = dispatcher.submit(URL, RequestOptions::new()).await.unwrap_err();
    assert!(matches!(err, DispatchError::Shutdown));
}

#[tokio::test]
async fn persistent_session_store_records_usage() {
    let dir = tempfile::tempdir().unwrap();
    let store: RedbStore<CookieSet> =
        RedbStore::open(dir.path().join("pools.redb"), "sessions").unwrap();
    store
        .upsert(
            CookieSet::new("s-redb", "alice", Utc::now() + chrono::Duration::hours(1))
                .with_cookie("sessionid", "persisted"),
        )
        .await
        .unwrap();

    let transport = ScriptedTransport::new(Reply::Status(200, "ok"));
    let dispatcher = Dispatcher::builder()
        .with_transport(transport.clone())
        .with_pacing(PacingConfig::immediate())
        .with_session_store(Arc::new(store.clone()))
        .build()
        .unwrap();

    let response = dispatcher.submit(URL, RequestOptions::new()).await.unwrap();
    assert_eq!(response.session_id(), "s-redb");
    assert_eq!(transport.calls()[0].cookie.as_deref(), Some("sessionid=persisted"));

    let stored = store.list_active().await.unwrap();
    assert!(stored[0].last_used_at.is_some());
    dispatcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn concurrency_caps_in_flight_requests() {
    let transport = Arc::new(GaugeTransport::default());
    let clock = ManualClock::default();
    let dispatcher = Arc::new(
        Dispatcher::builder()
            .with_transport(transport.clone())
            .with_clock(Arc::new(clock))
            .with_pacing(PacingConfig::immediate())
            .with_concurrency(3)
            .with_rng_seed(7)
            .with_session_store(Arc::new(sessions(2)))
            .with_proxy_store(Arc::new(proxies(2)))
            .build()
            .unwrap(),
    );

    let handles: Vec<_> = (0..9)
        .map(|i| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .submit(&format!("https://upstream.test/item/{i}"), RequestOptions::new())
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(transport.total.load(Ordering::SeqCst), 9);
    let peak = transport.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak {peak} exceeds worker count");
    assert!(peak >= 2, "workers never overlapped");
}

#[tokio::test(start_paused = true)]
async fn cooldown_opened_by_own_retries_stops_the_request() {
    let transport = ScriptedTransport::new(Reply::Status(403, "Forbidden"));
    let clock = ManualClock::default();
    let dispatcher = harness(transport.clone(), &clock)
        .with_max_attempts(3)
        .with_governor_config(GovernorConfig {
            max_errors: 2,
            ..GovernorConfig::default()
        })
        .build()
        .unwrap();

    let err = dispatcher.submit(URL, RequestOptions::new()).await.unwrap_err();
    assert!(matches!(err, DispatchError::CooldownActive { .. }), "{err:?}");
    assert_eq!(transport.calls().len(), 2);
    let metrics = dispatcher.metrics().unwrap().snapshot();
    assert_eq!(metrics.global.cooldown_rejections, 1);
}

#[tokio::test(start_paused = true)]
async fn stream_mode_hands_back_chunks() {
    let transport = ScriptedTransport::new(Reply::Chunks(&["frame-1", "frame-2", "frame-3"]));
    let clock = ManualClock::default();
    let dispatcher = harness(transport.clone(), &clock).build().unwrap();
    let options = RequestOptions::new().with_mode(ResponseMode::Stream);

    let response = dispatcher.submit(URL, options.clone()).await.unwrap();
    assert!(response.is_streamed());
    assert!(response.bytes().is_empty());

    let mut stream = response.take_stream().unwrap();
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk.unwrap());
    }
    assert_eq!(chunks, vec!["frame-1", "frame-2", "frame-3"]);
    assert!(response.take_stream().is_none());
    assert!(transport.calls()[0].stream);

    // streamed bodies are never cached
    dispatcher.fetch_cached("image", URL, options.clone()).await.unwrap();
    dispatcher.fetch_cached("image", URL, options).await.unwrap();
    assert_eq!(transport.calls().len(), 3);
    assert!(dispatcher.cache().is_empty());
}

#[tokio::test]
async fn builder_rejects_unbounded_governor_windows() {
    let transport = ScriptedTransport::new(Reply::Status(200, "ok"));
    let result = Dispatcher::builder()
        .with_transport(transport)
        .with_governor_config(GovernorConfig {
            cooldown: Duration::MAX,
            ..GovernorConfig::default()
        })
        .build();
    assert!(matches!(result, Err(DispatchError::Config(_))));
}
