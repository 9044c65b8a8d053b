//! Per-transaction status record

use std::collections::VecDeque;
use std::time::Duration;

use super::HttpError;

/// Where a transaction is in its lifecycle. On failure the state is kept
/// as-is, so the caller can see in which phase the transaction died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusState {
    Init,
    Pending,
    SendingRequest,
    RequestSent,
    ReceivingResponse,
    ResponseReceived,
}

impl StatusState {
    pub fn name(&self) -> &'static str {
        match self {
            StatusState::Init => "INIT",
            StatusState::Pending => "PENDING",
            StatusState::SendingRequest => "SENDING_REQUEST",
            StatusState::RequestSent => "REQUEST_SENT",
            StatusState::ReceivingResponse => "RECEIVING_RESPONSE",
            StatusState::ResponseReceived => "RESPONSE_RECEIVED",
        }
    }
}

/// Status of one HTTP transaction.
///
/// The caller sets the timeout list before starting; everything else is
/// filled in by the client. Once handed to the client, the caller must not
/// touch any field other than `finished` until `finished` is true.
#[derive(Debug, Clone)]
pub struct Status {
    pub state: StatusState,

    /// If true (default), a timeout is reported like an HTTP error in
    /// health accounting.
    pub timeout_should_be_http_error: bool,

    /// Deadlines from connection-ready to first response byte. Each retry
    /// consumes one entry; an exhausted list ends the transaction.
    pub timeouts: VecDeque<Duration>,

    /// Whether connect() succeeded for this transaction.
    pub connect_success: bool,

    /// Whether the transaction has completed (successfully or not).
    pub finished: bool,

    /// Final error, if any.
    pub err: Option<HttpError>,
    pub err_message: String,

    /// False if the client refused the transaction (shutdown or ramp-up).
    pub enabled: bool,

    pub http_return_code: u16,
    pub response_header: String,

    /// Wire sizes (possibly compressed).
    pub req_size: usize,
    pub resp_size: usize,
    /// Serialized payload sizes (before compression).
    pub raw_req_size: usize,
    pub raw_resp_size: usize,

    pub throttle_time: Duration,
    pub pending_time: Duration,
    pub req_build_time: Duration,
    pub req_send_time: Duration,
    pub wait_time: Duration,
    pub resp_recv_time: Duration,
    pub resp_parse_time: Duration,

    pub num_retry: u32,
    pub num_throttled: u32,
    pub num_connect_failed: u32,

    pub trace_id: String,
    /// Parent request when this transaction is part of a multi-part RPC.
    pub master_trace_id: String,
}

/// Default per-attempt deadlines: three attempts with growing patience.
const DEFAULT_TIMEOUTS: [Duration; 3] = [
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(120),
];

impl Default for Status {
    fn default() -> Self {
        Self {
            state: StatusState::Init,
            timeout_should_be_http_error: true,
            timeouts: DEFAULT_TIMEOUTS.into_iter().collect(),
            connect_success: false,
            finished: false,
            err: None,
            err_message: String::new(),
            enabled: true,
            http_return_code: 0,
            response_header: String::new(),
            req_size: 0,
            resp_size: 0,
            raw_req_size: 0,
            raw_resp_size: 0,
            throttle_time: Duration::ZERO,
            pending_time: Duration::ZERO,
            req_build_time: Duration::ZERO,
            req_send_time: Duration::ZERO,
            wait_time: Duration::ZERO,
            resp_recv_time: Duration::ZERO,
            resp_parse_time: Duration::ZERO,
            num_retry: 0,
            num_throttled: 0,
            num_connect_failed: 0,
            trace_id: String::new(),
            master_trace_id: String::new(),
        }
    }
}

impl Status {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debug_string(&self) -> String {
        format!(
            "state={} code={} err={:?} retry={} throttled={} connect_failed={} \
             throttle={:?} pending={:?} send={:?} wait={:?} recv={:?}",
            self.state.name(),
            self.http_return_code,
            self.err,
            self.num_retry,
            self.num_throttled,
            self.num_connect_failed,
            self.throttle_time,
            self.pending_time,
            self.req_send_time,
            self.wait_time,
            self.resp_recv_time,
        )
    }
}
