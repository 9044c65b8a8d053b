//! HTTP transport core
//!
//! A long-lived client to one remote endpoint. Owns the socket pool and a
//! small worker-thread pool; each transaction runs as a task that walks
//! the state ladder in [`status::Status`], retrying with a shared
//! exponential backoff. Fatal HTTP statuses and connect failures drive a
//! network-error state machine with edge-triggered callbacks, and a
//! rolling window of recent status codes answers "is the backend healthy
//! right now".

pub mod auth;
pub mod backoff;
pub mod chunk;
pub mod compress;
pub mod pool;
pub mod request;
pub mod response;
pub mod status;

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use self::auth::{AssertionSigner, LuciContextAuth, OAuth2Config, TokenRefreshTask};
use self::pool::{ConnectionCloseState, SocketPool};

pub use self::request::HttpRequest;
pub use self::response::{Body, BodyState, FileDownloadBody, HttpResponse, ParsedBody};
pub use self::status::{Status, StatusState};

/// Window for the recent-status health metric.
const HEALTH_WINDOW: Duration = Duration::from_secs(3);

/// Errors surfaced through [`Status::err`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("http status {0}")]
    HttpStatus(u16),

    #[error("request throttled")]
    Throttled,

    #[error("client shut down")]
    Canceled,

    #[error("authentication failed: {0}")]
    Auth(String),
}

/// HTTP statuses that indicate the backend is unreachable or rejecting
/// us outright, not merely failing a request.
fn is_fatal_network_error_code(code: u16) -> bool {
    matches!(code, 302 | 401 | 403)
}

fn is_idempotent_method(method: &str) -> bool {
    matches!(method, "GET" | "HEAD" | "PUT" | "DELETE")
}

/// Edge-triggered observer of transport health. Methods are invoked under
/// the client lock, in series.
pub trait NetworkErrorMonitor: Send {
    /// The transport entered the error state.
    fn on_network_error_detected(&self);
    /// The transport left the error state.
    fn on_network_recovered(&self);
}

/// Converts level-triggered error/success observations into edges.
///
/// Entering the error state records when it started and extends
/// `error_until`; a success only counts as recovery once `error_until`
/// has passed, so one lucky response inside a margin does not flap the
/// state.
struct NetworkErrorStatus {
    margin: Duration,
    error_started_time: Option<DateTime<Utc>>,
    error_until: Option<DateTime<Utc>>,
}

impl NetworkErrorStatus {
    fn new(margin: Duration) -> Self {
        Self {
            margin,
            error_started_time: None,
            error_until: None,
        }
    }

    fn in_error(&self) -> bool {
        self.error_started_time.is_some()
    }

    fn error_started_time(&self) -> Option<DateTime<Utc>> {
        self.error_started_time
    }

    /// Record an error observation. Returns true on the healthy → error
    /// edge.
    fn on_error_detected(&mut self, now: DateTime<Utc>) -> bool {
        let margin =
            chrono::Duration::from_std(self.margin).unwrap_or_else(|_| chrono::Duration::zero());
        self.error_until = Some(now + margin);
        if self.error_started_time.is_some() {
            return false;
        }
        self.error_started_time = Some(now);
        true
    }

    /// Record a success observation. Returns true on the error → healthy
    /// edge; the state is held until `error_until` even across successes.
    fn on_recovered(&mut self, now: DateTime<Utc>) -> bool {
        if self.error_started_time.is_none() {
            return false;
        }
        if let Some(until) = self.error_until {
            if now < until {
                return false;
            }
        }
        self.error_started_time = None;
        self.error_until = None;
        true
    }
}

/// Client configuration. Field mapping from environment or flags is the
/// embedder's concern.
#[derive(Clone)]
pub struct Options {
    pub dest_host_name: String,
    pub dest_port: u16,
    pub proxy_host_name: String,
    pub proxy_port: u16,

    /// Query-string suffix appended to every request path.
    pub extra_params: String,
    /// Static `Authorization` header value. Overrides token sources.
    pub authorization: String,
    pub cookie: String,
    pub capture_response_header: bool,
    pub url_path_prefix: String,

    pub use_ssl: bool,
    pub ssl_extra_cert: Option<PathBuf>,
    /// Inline PEM data, concatenated with `ssl_extra_cert`.
    pub ssl_extra_cert_data: String,

    pub connect_timeout: Duration,
    pub socket_read_timeout: Duration,
    pub min_retry_backoff: Duration,
    pub max_retry_backoff: Duration,

    pub oauth2_config: OAuth2Config,
    pub gce_service_account: String,
    pub service_account_json_filename: String,
    pub luci_context_auth: LuciContextAuth,
    pub assertion_signer: Option<Arc<dyn AssertionSigner>>,

    pub fail_fast: bool,
    pub network_error_margin: Option<Duration>,
    pub network_error_threshold_percent: i32,

    pub allow_throttle: bool,
    pub reuse_connection: bool,

    pub num_worker_threads: usize,
    /// How long after `enabled_from` until 100% of traffic is admitted.
    pub ramp_up_window: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dest_host_name: String::new(),
            dest_port: 0,
            proxy_host_name: String::new(),
            proxy_port: 0,
            extra_params: String::new(),
            authorization: String::new(),
            cookie: String::new(),
            capture_response_header: false,
            url_path_prefix: String::new(),
            use_ssl: false,
            ssl_extra_cert: None,
            ssl_extra_cert_data: String::new(),
            connect_timeout: Duration::from_secs(30),
            socket_read_timeout: Duration::from_secs(1),
            min_retry_backoff: Duration::from_millis(500),
            max_retry_backoff: Duration::from_secs(5),
            oauth2_config: OAuth2Config::default(),
            gce_service_account: String::new(),
            service_account_json_filename: String::new(),
            luci_context_auth: LuciContextAuth::default(),
            assertion_signer: None,
            fail_fast: false,
            network_error_margin: None,
            network_error_threshold_percent: 30,
            allow_throttle: true,
            reuse_connection: true,
            num_worker_threads: 2,
            ramp_up_window: Duration::from_secs(60),
        }
    }
}

impl Options {
    /// Fill destination fields from a URL. Returns false if the URL does
    /// not parse or uses a scheme other than http/https.
    pub fn init_from_url(&mut self, input: &str) -> bool {
        let Ok(parsed) = url::Url::parse(input) else {
            return false;
        };
        match parsed.scheme() {
            "http" => self.use_ssl = false,
            "https" => self.use_ssl = true,
            _ => return false,
        }
        let Some(host) = parsed.host_str() else {
            return false;
        };
        self.dest_host_name = host.to_string();
        self.dest_port = parsed
            .port()
            .unwrap_or(if self.use_ssl { 443 } else { 80 });
        self.url_path_prefix = parsed.path().to_string();
        true
    }

    pub fn use_proxy(&self) -> bool {
        !self.proxy_host_name.is_empty()
    }

    /// Where the TCP connection actually goes.
    pub fn socket_host(&self) -> &str {
        if self.use_proxy() {
            &self.proxy_host_name
        } else {
            &self.dest_host_name
        }
    }

    pub fn socket_port(&self) -> u16 {
        if self.use_proxy() {
            self.proxy_port
        } else {
            self.dest_port
        }
    }

    /// The request-target for `path`: origin-form normally, absolute-form
    /// when talking through a proxy.
    pub fn request_url(&self, path: &str) -> String {
        let mut rel = format!("{}{}{}", self.url_path_prefix, path, self.extra_params);
        if !rel.starts_with('/') {
            rel.insert(0, '/');
        }
        if self.use_proxy() {
            let scheme = if self.use_ssl { "https" } else { "http" };
            format!("{}://{}{}", scheme, self.host(), rel)
        } else {
            rel
        }
    }

    /// `Host` header value; elides the scheme default port.
    pub fn host(&self) -> String {
        let default_port = if self.use_ssl { 443 } else { 80 };
        if self.dest_port == 0 || self.dest_port == default_port {
            self.dest_host_name.clone()
        } else {
            format!("{}:{}", self.dest_host_name, self.dest_port)
        }
    }

    pub fn clear_auth_config(&mut self) {
        self.authorization.clear();
        self.oauth2_config = OAuth2Config::default();
        self.gce_service_account.clear();
        self.service_account_json_filename.clear();
        self.luci_context_auth = LuciContextAuth::default();
        self.assertion_signer = None;
    }

    pub fn debug_string(&self) -> String {
        format!(
            "dest={}:{} proxy={} ssl={} prefix={:?} threshold={}% reuse={}",
            self.dest_host_name,
            self.dest_port,
            if self.use_proxy() {
                format!("{}:{}", self.proxy_host_name, self.proxy_port)
            } else {
                "none".to_string()
            },
            self.use_ssl,
            self.url_path_prefix,
            self.network_error_threshold_percent,
            self.reuse_connection,
        )
    }
}

/// Callback invoked on a worker thread once a transaction finishes.
pub type TransactionCallback = Box<dyn FnOnce() + Send + 'static>;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct WorkerPool {
    tx: Option<mpsc::Sender<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    fn new(num_threads: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("http-worker-{}", i))
                .spawn(move || loop {
                    let job = {
                        let guard = rx.lock().unwrap_or_else(PoisonError::into_inner);
                        guard.recv()
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
                .expect("spawn http worker");
            handles.push(handle);
        }
        Self {
            tx: Some(tx),
            handles,
        }
    }

    fn execute(&self, job: Job) -> bool {
        match &self.tx {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    fn join(&mut self) {
        self.tx = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

struct ClientState {
    shutting_down: bool,
    enabled_from: Option<DateTime<Utc>>,
    retry_backoff: Duration,

    recent_status: VecDeque<(DateTime<Utc>, u16)>,
    bad_status_count: usize,

    network_error: NetworkErrorStatus,
    monitor: Option<Box<dyn NetworkErrorMonitor>>,
    health_status: String,

    num_query: u64,
    num_active: i64,
    num_pending: i64,
    num_http_retry: u64,
    num_http_throttled: u64,
    num_http_connect_failed: u64,
    num_http_timeout: u64,
    num_http_error: u64,
    num_network_error: u64,
    num_network_recovered: u64,
    num_http_status_code: HashMap<u16, u64>,
}

impl ClientState {
    fn new(margin: Duration, initial_backoff: Duration) -> Self {
        Self {
            shutting_down: false,
            enabled_from: None,
            retry_backoff: initial_backoff,
            recent_status: VecDeque::new(),
            bad_status_count: 0,
            network_error: NetworkErrorStatus::new(margin),
            monitor: None,
            health_status: "ok".to_string(),
            num_query: 0,
            num_active: 0,
            num_pending: 0,
            num_http_retry: 0,
            num_http_throttled: 0,
            num_http_connect_failed: 0,
            num_http_timeout: 0,
            num_http_error: 0,
            num_network_error: 0,
            num_network_recovered: 0,
            num_http_status_code: HashMap::new(),
        }
    }

    fn purge_status_window(&mut self, now: DateTime<Utc>) {
        let window =
            chrono::Duration::from_std(HEALTH_WINDOW).unwrap_or_else(|_| chrono::Duration::zero());
        while let Some((at, code)) = self.recent_status.front() {
            if *at + window >= now {
                break;
            }
            if !(200..300).contains(code) {
                self.bad_status_count -= 1;
            }
            self.recent_status.pop_front();
        }
    }

    fn add_status_code(&mut self, code: u16) {
        let now = Utc::now();
        self.recent_status.push_back((now, code));
        if !(200..300).contains(&code) {
            self.bad_status_count += 1;
        }
        *self.num_http_status_code.entry(code).or_insert(0) += 1;
        self.purge_status_window(now);
    }

    fn update_backoff(&mut self, min: Duration, max: Duration, in_error: bool) {
        self.retry_backoff = backoff::next_backoff(min, max, self.retry_backoff, in_error);
    }

    fn on_network_error(&mut self) {
        if self.network_error.on_error_detected(Utc::now()) {
            self.num_network_error += 1;
            warn!("network error detected");
            if let Some(monitor) = &self.monitor {
                monitor.on_network_error_detected();
            }
        }
    }

    fn on_network_success(&mut self) {
        if self.network_error.on_recovered(Utc::now()) {
            self.num_network_recovered += 1;
            info!("network recovered");
            if let Some(monitor) = &self.monitor {
                monitor.on_network_recovered();
            }
        }
    }

    fn ramp_up(&self, window: Duration) -> i32 {
        if self.shutting_down {
            return 0;
        }
        let Some(from) = self.enabled_from else {
            return 100;
        };
        let now = Utc::now();
        if now < from {
            return 0;
        }
        if window.is_zero() {
            return 100;
        }
        let elapsed = (now - from).to_std().unwrap_or_default();
        ((elapsed.as_secs_f64() / window.as_secs_f64()) * 100.0).min(100.0) as i32
    }
}

struct Shared {
    options: Options,
    socket_pool: SocketPool,
    auth: Option<Arc<TokenRefreshTask>>,
    mu: Mutex<ClientState>,
    cond: Condvar,
    trace_counter: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.mu.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What one attempt decided.
enum Attempt {
    Success,
    /// Non-2xx that is neither fatal nor retriable here.
    Http(u16, String),
    Fatal(HttpError, String),
    Retriable(HttpError, String),
}

/// The HTTP client. See the module docs.
pub struct HttpClient {
    shared: Arc<Shared>,
    workers: WorkerPool,
}

impl HttpClient {
    pub fn new(options: Options) -> Result<Self, HttpError> {
        let tls_server_name = options.use_ssl.then(|| options.dest_host_name.clone());
        let socket_pool = SocketPool::new(
            options.socket_host(),
            options.socket_port(),
            options.connect_timeout,
            tls_server_name.as_deref(),
            options.ssl_extra_cert.as_ref(),
            &options.ssl_extra_cert_data,
        )
        .map_err(|e| HttpError::NetworkError(e.to_string()))?;

        let auth = TokenRefreshTask::from_options(&options).map(Arc::new);
        let margin = options.network_error_margin.unwrap_or(Duration::ZERO);
        let initial_backoff = options.min_retry_backoff;
        let num_workers = options.num_worker_threads.max(1);

        let shared = Arc::new(Shared {
            options,
            socket_pool,
            auth,
            mu: Mutex::new(ClientState::new(margin, initial_backoff)),
            cond: Condvar::new(),
            trace_counter: AtomicU64::new(1),
        });
        Ok(Self {
            shared,
            workers: WorkerPool::new(num_workers),
        })
    }

    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    /// Build a request with host, cookie, static authorization, and the
    /// configured path prefix applied at send time.
    pub fn init_request(&self, method: &str, path: &str) -> HttpRequest {
        let options = &self.shared.options;
        let mut req = HttpRequest::new(method, path);
        req.set_host(options.host());
        if !options.cookie.is_empty() {
            req.set_cookie(options.cookie.clone());
        }
        if !options.authorization.is_empty() {
            req.set_authorization(options.authorization.clone());
        }
        req
    }

    /// Start a transaction. The caller keeps its clones of `resp` and
    /// `status` but must not inspect them (beyond `finished`) until the
    /// transaction completes; `callback`, if any, runs on a worker after
    /// that.
    pub fn do_async(
        &self,
        req: HttpRequest,
        resp: Arc<Mutex<HttpResponse>>,
        status: Arc<Mutex<Status>>,
        callback: Option<TransactionCallback>,
    ) {
        {
            let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
            if s.trace_id.is_empty() {
                let n = self.shared.trace_counter.fetch_add(1, Ordering::Relaxed);
                s.trace_id = format!("t{:06x}", n);
            }
            s.finished = false;
        }
        self.shared.lock().num_pending += 1;

        let shared = self.shared.clone();
        let status_for_job = status.clone();
        let job: Job = Box::new(move || {
            transaction_main(&shared, req, &resp, &status_for_job);
            if let Some(callback) = callback {
                callback();
            }
        });
        if !self.workers.execute(job) {
            // Worker pool is gone; fail the transaction on this thread.
            let mut st = self.shared.lock();
            st.num_pending -= 1;
            drop(st);
            let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
            s.err = Some(HttpError::Canceled);
            s.err_message = "client is shutting down".to_string();
            s.enabled = false;
            s.finished = true;
            drop(s);
            self.shared.cond.notify_all();
        }
    }

    /// Synchronous transaction: [`HttpClient::do_async`] plus
    /// [`HttpClient::wait`].
    pub fn do_sync(
        &self,
        req: HttpRequest,
        resp: &Arc<Mutex<HttpResponse>>,
        status: &Arc<Mutex<Status>>,
    ) {
        self.do_async(req, resp.clone(), status.clone(), None);
        self.wait(status);
    }

    /// Block until the transaction behind `status` finishes.
    pub fn wait(&self, status: &Arc<Mutex<Status>>) {
        loop {
            if status
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .finished
            {
                return;
            }
            let guard = self.shared.lock();
            // Timed wait so a completion signaled between the check and
            // the wait cannot strand us.
            let _ = self
                .shared
                .cond
                .wait_timeout(guard, Duration::from_millis(100));
        }
    }

    /// Block until no transaction is active.
    pub fn wait_no_active(&self) {
        loop {
            let guard = self.shared.lock();
            if guard.num_active == 0 && guard.num_pending == 0 {
                return;
            }
            let _ = self
                .shared
                .cond
                .wait_timeout(guard, Duration::from_millis(100));
        }
    }

    /// Reject new work and fail in-flight transactions with
    /// [`HttpError::Canceled`] at their next suspension point.
    pub fn shutdown(&self) {
        {
            let mut st = self.shared.lock();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
        }
        info!("http client shutting down");
        self.shared.cond.notify_all();
    }

    pub fn shutting_down(&self) -> bool {
        self.shared.lock().shutting_down
    }

    /// Percentage of new transactions admitted, 0–100. Grows linearly
    /// across the ramp-up window after `enabled_from`.
    pub fn ramp_up(&self) -> i32 {
        self.shared.lock().ramp_up(self.shared.options.ramp_up_window)
    }

    /// Schedule (re-)enabling of the transport. `None` means fully
    /// enabled with no ramp-up.
    pub fn enable_from(&self, enabled_from: Option<DateTime<Utc>>) {
        self.shared.lock().enabled_from = enabled_from;
    }

    /// Overall health as last determined by ping classification.
    pub fn is_healthy(&self) -> bool {
        self.shared.lock().health_status == "ok"
    }

    pub fn health_status_message(&self) -> String {
        self.shared.lock().health_status.clone()
    }

    /// Whether the fraction of non-2xx responses in the last 3 seconds is
    /// below the configured threshold. Prefer this over
    /// [`HttpClient::is_healthy`]; momentary blips are ignored.
    pub fn is_healthy_recently(&self) -> bool {
        let mut st = self.shared.lock();
        st.purge_status_window(Utc::now());
        let total = st.recent_status.len();
        if total == 0 {
            return true;
        }
        let bad_percent = st.bad_status_count * 100 / total;
        bad_percent < self.shared.options.network_error_threshold_percent.max(0) as usize
    }

    /// Classify a ping result into the health status message. Returns the
    /// ping's HTTP status code.
    pub fn update_health_status_for_ping(
        &self,
        status: &Status,
        round_trip_time: Option<Duration>,
    ) -> u16 {
        let message = if status.err.is_some() || !(200..300).contains(&status.http_return_code) {
            format!(
                "error: ping failed code={} err={:?}",
                status.http_return_code, status.err
            )
        } else if round_trip_time.map(|rtt| rtt > Duration::from_secs(5)) == Some(true) {
            "ok: but slow".to_string()
        } else {
            "ok".to_string()
        };
        let mut st = self.shared.lock();
        st.health_status = message;
        status.http_return_code
    }

    /// When the current network-error episode started, if one is active.
    pub fn network_error_started_time(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().network_error.error_started_time()
    }

    pub fn set_monitor(&self, monitor: Box<dyn NetworkErrorMonitor>) {
        self.shared.lock().monitor = Some(monitor);
    }

    /// Shared-backoff step function; exposed for peers that schedule
    /// their own delays.
    pub fn get_next_backoff(options: &Options, prev: Duration, in_error: bool) -> Duration {
        backoff::next_backoff(
            options.min_retry_backoff,
            options.max_retry_backoff,
            prev,
            in_error,
        )
    }

    pub fn num_active(&self) -> i64 {
        self.shared.lock().num_active
    }

    pub fn debug_string(&self) -> String {
        let st = self.shared.lock();
        format!(
            "{}\nquery={} active={} pending={} retry={} throttled={} connect_failed={} \
             timeout={} error={} network_error={} network_recovered={} backoff={:?}\nstatus codes: {:?}",
            self.shared.options.debug_string(),
            st.num_query,
            st.num_active,
            st.num_pending,
            st.num_http_retry,
            st.num_http_throttled,
            st.num_http_connect_failed,
            st.num_http_timeout,
            st.num_http_error,
            st.num_network_error,
            st.num_network_recovered,
            st.retry_backoff,
            st.num_http_status_code,
        )
    }
}

impl Drop for HttpClient {
    fn drop(&mut self) {
        self.shutdown();
        self.workers.join();
    }
}

/// Sleep that wakes early on shutdown. Returns false if the client is
/// shutting down.
fn interruptible_sleep(shared: &Shared, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    let mut guard = shared.lock();
    loop {
        if guard.shutting_down {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        let (g, _) = shared
            .cond
            .wait_timeout(guard, deadline - now)
            .unwrap_or_else(PoisonError::into_inner);
        guard = g;
    }
}

fn finish(
    shared: &Shared,
    status: &Arc<Mutex<Status>>,
    err: Option<HttpError>,
    message: &str,
    active: bool,
) {
    {
        let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
        if s.err_message.is_empty() && !message.is_empty() {
            s.err_message = message.to_string();
        }
        s.err = err;
        s.finished = true;
    }
    {
        let mut st = shared.lock();
        if active {
            st.num_active -= 1;
        }
    }
    shared.cond.notify_all();
}

/// One transaction, start to finish. Runs on a worker thread.
fn transaction_main(
    shared: &Shared,
    mut req: HttpRequest,
    resp: &Arc<Mutex<HttpResponse>>,
    status: &Arc<Mutex<Status>>,
) {
    let queued_at = Instant::now();
    {
        let mut st = shared.lock();
        st.num_pending -= 1;
        if st.shutting_down {
            drop(st);
            let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
            s.enabled = false;
            drop(s);
            finish(
                shared,
                status,
                Some(HttpError::Canceled),
                "client is shutting down",
                false,
            );
            return;
        }
        st.num_query += 1;
        st.num_active += 1;
    }

    {
        let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
        s.state = StatusState::Pending;
        let path = req.path().to_string();
        drop(s);
        let mut r = resp.lock().unwrap_or_else(PoisonError::into_inner);
        r.set_request_path(path);
    }

    // Ramp-up admission.
    let ramp = {
        let st = shared.lock();
        st.ramp_up(shared.options.ramp_up_window)
    };
    let admitted = ramp >= 100 || rand::thread_rng().gen_range(0..100) < ramp;
    if !admitted {
        shared.lock().num_http_throttled += 1;
        {
            let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
            s.num_throttled += 1;
            s.enabled = false;
        }
        finish(
            shared,
            status,
            Some(HttpError::Throttled),
            "rejected by ramp up",
            true,
        );
        return;
    }

    // Throttle while the backend is in the error state: wait out the
    // shared backoff (or fail fast if configured).
    if shared.options.allow_throttle {
        let delay = {
            let st = shared.lock();
            st.network_error
                .in_error()
                .then(|| backoff::randomized_backoff(st.retry_backoff))
        };
        if let Some(delay) = delay {
            if shared.options.fail_fast {
                shared.lock().num_http_throttled += 1;
                {
                    let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
                    s.num_throttled += 1;
                }
                finish(
                    shared,
                    status,
                    Some(HttpError::Throttled),
                    "failing fast during network error",
                    true,
                );
                return;
            }
            debug!(delay_ms = delay.as_millis() as u64, "throttling request");
            shared.lock().num_http_throttled += 1;
            {
                let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
                s.num_throttled += 1;
                s.throttle_time += delay;
            }
            if !interruptible_sleep(shared, delay) {
                finish(
                    shared,
                    status,
                    Some(HttpError::Canceled),
                    "client is shutting down",
                    true,
                );
                return;
            }
        }
    }

    // Access token, unless a static authorization was configured.
    if shared.options.authorization.is_empty() {
        if let Some(auth) = &shared.auth {
            match auth.authorization() {
                Ok(authorization) => req.set_authorization(authorization),
                Err(e) => {
                    finish(
                        shared,
                        status,
                        Some(HttpError::Auth(e.to_string())),
                        "access token unavailable",
                        true,
                    );
                    return;
                }
            }
        }
    }

    {
        let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
        s.pending_time = queued_at.elapsed();
    }

    let request_target = shared.options.request_url(req.path());
    let mut last_retriable: Option<(HttpError, String)> = None;

    loop {
        if shared.lock().shutting_down {
            finish(
                shared,
                status,
                Some(HttpError::Canceled),
                "client is shutting down",
                true,
            );
            return;
        }

        // Each attempt consumes one entry of the timeout budget.
        let deadline = {
            let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
            s.timeouts.pop_front()
        };
        let Some(deadline) = deadline else {
            let (err, message) = last_retriable
                .unwrap_or((HttpError::Timeout, "timeout budget exhausted".to_string()));
            finish(shared, status, Some(err), &message, true);
            return;
        };

        match run_attempt(shared, &mut req, resp, status, &request_target, deadline) {
            Attempt::Success => {
                finish(shared, status, None, "", true);
                return;
            }
            Attempt::Http(code, message) => {
                shared.lock().num_http_error += 1;
                finish(
                    shared,
                    status,
                    Some(HttpError::HttpStatus(code)),
                    &message,
                    true,
                );
                return;
            }
            Attempt::Fatal(err, message) => {
                finish(shared, status, Some(err), &message, true);
                return;
            }
            Attempt::Retriable(err, message) => {
                let has_budget = {
                    let s = status.lock().unwrap_or_else(PoisonError::into_inner);
                    !s.timeouts.is_empty()
                };
                if !has_budget || !req.is_replayable() {
                    finish(shared, status, Some(err), &message, true);
                    return;
                }
                debug!(error = %err, "retrying http transaction");
                last_retriable = Some((err, message));
                {
                    let mut st = shared.lock();
                    st.num_http_retry += 1;
                }
                {
                    let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
                    s.num_retry += 1;
                }
                let delay = {
                    let st = shared.lock();
                    backoff::randomized_backoff(st.retry_backoff)
                };
                if !interruptible_sleep(shared, delay) {
                    finish(
                        shared,
                        status,
                        Some(HttpError::Canceled),
                        "client is shutting down",
                        true,
                    );
                    return;
                }
                resp.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .reset();
            }
        }
    }
}

/// One wire attempt: connect, send, receive, classify.
fn run_attempt(
    shared: &Shared,
    req: &mut HttpRequest,
    resp: &Arc<Mutex<HttpResponse>>,
    status: &Arc<Mutex<Status>>,
    request_target: &str,
    deadline: Duration,
) -> Attempt {
    let options = &shared.options;

    // Connect (or reuse a pooled descriptor).
    let mut descriptor = match shared.socket_pool.acquire() {
        Ok(descriptor) => descriptor,
        Err(e) => {
            {
                let mut st = shared.lock();
                st.num_http_connect_failed += 1;
                st.update_backoff(options.min_retry_backoff, options.max_retry_backoff, true);
                // No usable socket counts as a network error.
                st.on_network_error();
            }
            {
                let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
                s.num_connect_failed += 1;
            }
            return Attempt::Retriable(
                HttpError::NetworkError(e.to_string()),
                format!("connect failed: {}", e),
            );
        }
    };
    {
        let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
        s.connect_success = true;
        s.state = StatusState::SendingRequest;
    }

    // Send.
    let send_started = Instant::now();
    let header = req.build_header(request_target);
    let send_result: std::io::Result<u64> = (|| {
        descriptor.write_all(header.as_bytes())?;
        let body_bytes = req.write_body(&mut descriptor)?;
        descriptor.flush()?;
        Ok(header.len() as u64 + body_bytes)
    })();
    match send_result {
        Ok(wire_size) => {
            let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
            s.req_size = wire_size as usize;
            s.req_send_time += send_started.elapsed();
            s.state = StatusState::RequestSent;
        }
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
            shared
                .socket_pool
                .release(descriptor, ConnectionCloseState::ErrorClose);
            return Attempt::Fatal(
                HttpError::NetworkError(e.to_string()),
                "request body cannot be replayed".to_string(),
            );
        }
        Err(e) => {
            shared
                .socket_pool
                .release(descriptor, ConnectionCloseState::ErrorClose);
            shared.lock().update_backoff(
                options.min_retry_backoff,
                options.max_retry_backoff,
                true,
            );
            return Attempt::Retriable(
                HttpError::NetworkError(e.to_string()),
                format!("send failed: {}", e),
            );
        }
    }

    // Receive.
    {
        let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
        s.state = StatusState::ReceivingResponse;
    }
    let _ = descriptor.set_read_timeout(Some(options.socket_read_timeout));
    let recv_started = Instant::now();
    let mut received_any = false;
    loop {
        if shared.lock().shutting_down {
            shared
                .socket_pool
                .release(descriptor, ConnectionCloseState::ErrorClose);
            return Attempt::Fatal(HttpError::Canceled, "client is shutting down".to_string());
        }
        let mut r = resp.lock().unwrap_or_else(PoisonError::into_inner);
        let buf = r.next_buffer();
        match descriptor.read(buf) {
            Ok(0) => {
                r.recv(0);
                break;
            }
            Ok(n) => {
                received_any = true;
                if r.recv(n as isize) {
                    break;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                drop(r);
                // Until the first response byte the per-attempt deadline
                // governs; after that, each read must land within
                // socket_read_timeout.
                if received_any || recv_started.elapsed() > deadline {
                    shared.lock().num_http_timeout += 1;
                    shared
                        .socket_pool
                        .release(descriptor, ConnectionCloseState::ErrorClose);
                    return Attempt::Retriable(
                        HttpError::Timeout,
                        "timed out waiting for response".to_string(),
                    );
                }
            }
            Err(e) => {
                r.recv(-1);
                drop(r);
                shared
                    .socket_pool
                    .release(descriptor, ConnectionCloseState::ErrorClose);
                shared.lock().update_backoff(
                    options.min_retry_backoff,
                    options.max_retry_backoff,
                    true,
                );
                return Attempt::Retriable(
                    HttpError::NetworkError(e.to_string()),
                    format!("receive failed: {}", e),
                );
            }
        }
    }

    // Harvest the response outcome.
    let (ok, code, connection_close, resp_size, err_message, header_text) = {
        let r = resp.lock().unwrap_or_else(PoisonError::into_inner);
        (
            r.ok(),
            r.status_code(),
            r.has_connection_close(),
            r.total_recv_len(),
            r.err_message().to_string(),
            options.capture_response_header.then(|| r.header()),
        )
    };
    {
        let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
        s.resp_recv_time += recv_started.elapsed();
        s.resp_size = resp_size;
        s.raw_resp_size = resp_size;
        s.http_return_code = code;
        if let Some(header_text) = header_text {
            s.response_header = header_text;
        }
    }

    if !ok {
        shared
            .socket_pool
            .release(descriptor, ConnectionCloseState::ErrorClose);
        shared
            .lock()
            .update_backoff(options.min_retry_backoff, options.max_retry_backoff, true);
        return Attempt::Retriable(HttpError::NetworkError(err_message.clone()), err_message);
    }

    {
        let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
        s.state = StatusState::ResponseReceived;
    }
    let close_state = if connection_close || !options.reuse_connection {
        ConnectionCloseState::NormalClose
    } else {
        ConnectionCloseState::NoClose
    };
    shared.socket_pool.release(descriptor, close_state);

    // Classify the HTTP status.
    let mut st = shared.lock();
    st.add_status_code(code);
    if (200..300).contains(&code) {
        st.update_backoff(options.min_retry_backoff, options.max_retry_backoff, false);
        st.on_network_success();
        return Attempt::Success;
    }

    st.update_backoff(options.min_retry_backoff, options.max_retry_backoff, true);
    if is_fatal_network_error_code(code) {
        st.on_network_error();
        drop(st);
        if matches!(code, 401 | 403) {
            if let Some(auth) = &shared.auth {
                auth.invalidate();
            }
        }
        return Attempt::Fatal(
            HttpError::NetworkError(format!("fatal http status {}", code)),
            format!("fatal http status {}", code),
        );
    }
    drop(st);

    if (500..600).contains(&code) && is_idempotent_method(req.method()) {
        return Attempt::Retriable(
            HttpError::HttpStatus(code),
            format!("retriable server error {}", code),
        );
    }
    Attempt::Http(code, format!("http status {}", code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_from_url() {
        let mut options = Options::default();
        assert!(options.init_from_url("https://compile.example.com/api"));
        assert!(options.use_ssl);
        assert_eq!(options.dest_host_name, "compile.example.com");
        assert_eq!(options.dest_port, 443);
        assert_eq!(options.url_path_prefix, "/api");

        assert!(options.init_from_url("http://localhost:8088/"));
        assert!(!options.use_ssl);
        assert_eq!(options.dest_port, 8088);

        assert!(!options.init_from_url("ftp://example.com/"));
        assert!(!options.init_from_url("not a url"));
    }

    #[test]
    fn test_request_url_prefix_and_params() {
        let mut options = Options::default();
        options.dest_host_name = "c.example.com".to_string();
        options.dest_port = 80;
        options.url_path_prefix = "/cxx-compiler-service".to_string();
        options.extra_params = "?win".to_string();
        assert_eq!(
            options.request_url("/exec"),
            "/cxx-compiler-service/exec?win"
        );
    }

    #[test]
    fn test_request_url_via_proxy_is_absolute() {
        let mut options = Options::default();
        options.dest_host_name = "c.example.com".to_string();
        options.dest_port = 8080;
        options.proxy_host_name = "proxy.corp".to_string();
        options.proxy_port = 3128;
        assert_eq!(options.socket_host(), "proxy.corp");
        assert_eq!(options.socket_port(), 3128);
        assert_eq!(
            options.request_url("/exec"),
            "http://c.example.com:8080/exec"
        );
    }

    #[test]
    fn test_host_header_elides_default_port() {
        let mut options = Options::default();
        options.dest_host_name = "c.example.com".to_string();
        options.dest_port = 443;
        options.use_ssl = true;
        assert_eq!(options.host(), "c.example.com");

        options.dest_port = 8443;
        assert_eq!(options.host(), "c.example.com:8443");
    }

    #[test]
    fn test_clear_auth_config() {
        let mut options = Options::default();
        options.authorization = "Bearer x".to_string();
        options.gce_service_account = "default".to_string();
        options.clear_auth_config();
        assert!(options.authorization.is_empty());
        assert!(options.gce_service_account.is_empty());
    }

    #[test]
    fn test_network_error_edge_trigger() {
        let mut status = NetworkErrorStatus::new(Duration::ZERO);
        let t0 = Utc::now();

        // Healthy: success is not a recovery edge.
        assert!(!status.on_recovered(t0));

        // First error fires the edge; repeats do not.
        assert!(status.on_error_detected(t0));
        assert!(!status.on_error_detected(t0 + chrono::Duration::seconds(1)));
        assert!(status.in_error());
        assert_eq!(status.error_started_time(), Some(t0));

        // Success past error_until fires the recovery edge once.
        assert!(status.on_recovered(t0 + chrono::Duration::seconds(2)));
        assert!(!status.on_recovered(t0 + chrono::Duration::seconds(3)));
        assert!(!status.in_error());
    }

    #[test]
    fn test_network_error_margin_holds_state() {
        let mut status = NetworkErrorStatus::new(Duration::from_secs(30));
        let t0 = Utc::now();
        assert!(status.on_error_detected(t0));

        // Success inside the margin does not recover.
        assert!(!status.on_recovered(t0 + chrono::Duration::seconds(10)));
        assert!(status.in_error());

        // Another error extends the margin.
        assert!(!status.on_error_detected(t0 + chrono::Duration::seconds(20)));
        assert!(!status.on_recovered(t0 + chrono::Duration::seconds(40)));

        // Past the extended margin, recovery fires.
        assert!(status.on_recovered(t0 + chrono::Duration::seconds(51)));
    }

    #[test]
    fn test_ramp_up_schedule() {
        let window = Duration::from_secs(60);
        let mut state = ClientState::new(Duration::ZERO, Duration::from_millis(500));

        // No enabled_from: fully enabled.
        assert_eq!(state.ramp_up(window), 100);

        // Before the mark: disabled.
        state.enabled_from = Some(Utc::now() + chrono::Duration::seconds(30));
        assert_eq!(state.ramp_up(window), 0);

        // Mid-window: proportional.
        state.enabled_from = Some(Utc::now() - chrono::Duration::seconds(30));
        let ramp = state.ramp_up(window);
        assert!((45..=55).contains(&ramp), "mid-window ramp was {}", ramp);

        // Past the window: fully enabled.
        state.enabled_from = Some(Utc::now() - chrono::Duration::seconds(120));
        assert_eq!(state.ramp_up(window), 100);

        // Shutting down: disabled.
        state.shutting_down = true;
        assert_eq!(state.ramp_up(window), 0);
    }

    #[test]
    fn test_health_window_counts_bad_fraction() {
        let mut state = ClientState::new(Duration::ZERO, Duration::from_millis(500));
        for _ in 0..7 {
            state.add_status_code(200);
        }
        for _ in 0..3 {
            state.add_status_code(500);
        }
        assert_eq!(state.recent_status.len(), 10);
        assert_eq!(state.bad_status_count, 3);
    }

    #[test]
    fn test_fatal_code_classification() {
        assert!(is_fatal_network_error_code(302));
        assert!(is_fatal_network_error_code(401));
        assert!(is_fatal_network_error_code(403));
        assert!(!is_fatal_network_error_code(404));
        assert!(!is_fatal_network_error_code(500));
    }
}
