//! Core data model: the closed return-code enumeration, the section enumeration,
//! and the `Request` value that flows between listener, queue, pool, and dispatcher.

use std::sync::mpsc::Sender;
use std::time::{Instant, SystemTime};

/// Closed set of per-module / per-section return codes.
///
/// `#[non_exhaustive]` because modules outside this crate (dynamically loaded
/// shared objects) are the ones that actually produce these values; new
/// variants are never expected, but the type is not a promise that a match
/// over it can skip a wildcard arm forever.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
    Ok,
    Handled,
    Reject,
    Fail,
    Noop,
    NotFound,
    Invalid,
    UserLock,
    Updated,
    Disallow,
}

/// A fixed processing stage. Order matches the table in §2 of the design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Authorize,
    Authenticate,
    Preacct,
    Accounting,
    Session,
    PreProxy,
    PostProxy,
    PostAuth,
    #[cfg(feature = "with_coa")]
    RecvCoa,
    #[cfg(feature = "with_coa")]
    SendCoa,
}

impl Component {
    /// Stable name used for `Request.component` and for log messages.
    pub fn name(self) -> &'static str {
        match self {
            Component::Authorize => "authorize",
            Component::Authenticate => "authenticate",
            Component::Preacct => "preacct",
            Component::Accounting => "accounting",
            Component::Session => "session",
            Component::PreProxy => "pre-proxy",
            Component::PostProxy => "post-proxy",
            Component::PostAuth => "post-auth",
            #[cfg(feature = "with_coa")]
            Component::RecvCoa => "recv-coa",
            #[cfg(feature = "with_coa")]
            Component::SendCoa => "send-coa",
        }
    }
}

/// Per-request lifecycle state as seen by the queue and the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Queued,
    Running,
    Done,
}

/// Cancellation flag written by the listener, read by the queue on pop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Processing,
    StopProcessing,
}

/// Protocol opcode. The wire codec is out of scope; only the discriminator the
/// dispatcher and admission control need to see is modeled here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketCode {
    AccessRequest,
    AccountingRequest,
    CoaRequest,
    DisconnectRequest,
    Other(u8),
}

impl PacketCode {
    pub fn is_accounting(self) -> bool {
        matches!(self, PacketCode::AccountingRequest)
    }
}

/// Outcome observed by whoever enqueued a request, once the core is done with it.
/// Used only by the demonstration CLI and by tests; the core itself never reads
/// `Request.response`, it only ever sends to it.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub rcode: Rcode,
}

/// A transient value owned by whoever submitted it via [`crate::pool::WorkerPool::enqueue`].
///
/// The core reads/writes exactly the fields named in the design's data model; the
/// `response` channel is an addition so the demonstration CLI and tests can observe
/// completion without the core itself depending on any particular listener shape.
pub struct Request {
    pub number: u64,
    pub priority: i32,
    pub timestamp: Instant,
    pub arrival_wall: SystemTime,
    pub rounds: u32,
    pub packet_code: PacketCode,
    pub server: String,
    pub component: Option<&'static str>,
    pub module: Option<String>,
    pub child_state: ChildState,
    pub master_state: MasterState,
    /// Scratch slot used by the priority heap; not meaningful outside it.
    pub heap_id: usize,
    pub response: Option<Sender<RequestOutcome>>,
}

impl Request {
    pub fn new(number: u64, server: impl Into<String>, packet_code: PacketCode) -> Self {
        Request {
            number,
            priority: 0,
            timestamp: Instant::now(),
            arrival_wall: SystemTime::now(),
            rounds: 0,
            packet_code,
            server: server.into(),
            component: None,
            module: None,
            child_state: ChildState::Queued,
            master_state: MasterState::Processing,
            heap_id: 0,
            response: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_response(mut self, response: Sender<RequestOutcome>) -> Self {
        self.response = Some(response);
        self
    }

    /// Mark the request finished and, if anyone is listening, tell them the rcode.
    /// Once this is called the core must not touch the request again.
    pub fn finish(&mut self, rcode: Rcode) {
        self.child_state = ChildState::Done;
        if let Some(tx) = self.response.take() {
            let _ = tx.send(RequestOutcome { rcode });
        }
    }
}
