use std::net::SocketAddr;
use thiserror::Error;

/// Possible errors
#[derive(Error, Debug)]
pub enum Error {
    /// The requested address could not be bound or listened on.
    #[error("cannot accept TCP connections on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    /// The address did not resolve to a socket address.
    #[error("invalid address `{0}`")]
    InvalidAddress(String),
    /// The listener stopped before a browser connected.
    #[error("listener on {0} closed before a session was established")]
    ListenerClosed(SocketAddr),
    /// The session was closed; no further queue activity is accepted.
    #[error("session closed")]
    SessionClosed,
    /// A callback-binding marker or callback source could not be parsed.
    #[error("invalid callback binding `{0}`")]
    InvalidBinding(String),
    /// A global listener name did not follow the `<prefix>-on<event>` convention.
    #[error("invalid global listener `{0}`")]
    InvalidListener(String),
    /// An `update` key is neither an element id, `id.attribute`, `js` nor `window.<path>`.
    #[error("invalid update name `{0}`")]
    InvalidName(String),
    /// The page is no longer held by its session.
    #[error("page {0} not found")]
    PageNotFound(u64),
    /// A wrapped IO error
    #[error("io error `{0}`")]
    Io(#[from] std::io::Error),
}

/// Terminal failures while reading or writing one HTTP message.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("malformed request line `{0}`")]
    RequestLine(String),
    #[error("unsupported method `{0}`")]
    Method(String),
    #[error("malformed header line")]
    Header,
    #[error("invalid content length `{0}`")]
    ContentLength(String),
    #[error("request headers exceed {0} bytes")]
    HeadersTooLarge(usize),
    #[error("request body of {0} bytes exceeds limit")]
    BodyTooLarge(usize),
    #[error("connection closed inside a request")]
    UnexpectedEof,
    #[error("io error `{0}`")]
    Io(#[from] std::io::Error),
}

/// Requests for an established session that are rejected without invoking
/// application code.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("illegal timer_tick call `{0}`")]
    IllegalTick(String),
    #[error("illegal wait_server_event call `{0}`")]
    IllegalWait(String),
    #[error("invalid call `{0}`")]
    InvalidCall(String),
    #[error("token {0} not found in page")]
    UnknownToken(String),
    #[error("cannot parse payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("session closed")]
    SessionClosed,
}

/// Why the task serving one connection stopped early.
#[derive(Error, Debug)]
pub(crate) enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("no session admission pending for `{0}`")]
    NotAdmitted(String),
    #[error("unknown session `{0}`")]
    UnknownSession(String),
    #[error("request path `{0}` is not valid UTF-8")]
    Path(String),
    #[error("session closed")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
