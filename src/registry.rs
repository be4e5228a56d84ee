//! Listening addresses, session admission and the sessions they created.
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bui_longpoll_types::SessionId;
use futures::StreamExt;
use http::StatusCode;
use parking_lot::{Mutex, RwLock};
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::bootstrap_document;
use crate::config::{Config, Favicon, SessionOptions};
use crate::dispatch::{dispatch, parse_call, Reply};
use crate::errors::{ConnectionError, Error, Result};
use crate::mutation::serialize_batch;
use crate::session::{PushOutcome, Session};
use crate::tokenizer::Tokenizer;
use crate::transport::{HttpConnection, Request};

struct Admission {
    options: SessionOptions,
    tx: oneshot::Sender<Session>,
}

#[derive(Default)]
struct Admissions {
    pending: VecDeque<Admission>,
    closed: bool,
}

/// One bound address and its pending admissions.
struct Listener {
    requested: SocketAddr,
    local_addr: SocketAddr,
    admissions: Mutex<Admissions>,
    favicon: Mutex<Favicon>,
}

impl Listener {
    /// Oldest admission whose requester is still waiting.
    fn take_admission(&self) -> Option<Admission> {
        let mut admissions = self.admissions.lock();
        while let Some(admission) = admissions.pending.pop_front() {
            if !admission.tx.is_closed() {
                return Some(admission);
            }
        }
        None
    }

    fn close_admissions(&self) {
        let mut admissions = self.admissions.lock();
        admissions.closed = true;
        // dropping the senders fails every `PendingSession`
        admissions.pending.clear();
    }
}

pub(crate) struct RegistryInner {
    config: Config,
    tokenizer: Arc<Tokenizer>,
    sessions: RwLock<HashMap<SessionId, Session>>,
    /// Connection that last served each session.
    serving: Mutex<HashMap<SessionId, (u64, CancellationToken)>>,
    listeners: Mutex<Vec<Arc<Listener>>>,
    triggers: Mutex<Vec<stream_cancel::Trigger>>,
    bind_lock: tokio::sync::Mutex<()>,
    next_connection: AtomicU64,
}

impl RegistryInner {
    pub(crate) fn forget_session(&self, id: &SessionId) {
        self.sessions.write().remove(id);
        if let Some((_, cancel)) = self.serving.lock().remove(id) {
            cancel.cancel();
        }
    }

    fn mark_serving(&self, id: &SessionId, connection: u64, cancel: &CancellationToken) {
        self.serving
            .lock()
            .insert(id.clone(), (connection, cancel.clone()));
    }

    fn release_connection(&self, connection: u64) {
        self.serving.lock().retain(|_, (c, _)| *c != connection);
    }
}

/// Handle to the sessions served by one application.
///
/// Cloning is cheap. Listeners stop when [`Registry::shutdown`] is called
/// or when the last handle and every connection are gone.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

/// A new-session admission waiting for a browser to connect.
#[derive(Debug)]
pub struct PendingSession {
    rx: oneshot::Receiver<Session>,
    local_addr: SocketAddr,
}

impl PendingSession {
    /// Address the browser should open.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait until a browser connects and the session is established.
    pub async fn established(self) -> Result<Session> {
        self.rx
            .await
            .map_err(|_| Error::ListenerClosed(self.local_addr))
    }
}

impl Registry {
    pub fn new(config: Config) -> Result<Self> {
        let tokenizer = Arc::new(Tokenizer::new(&config.binding_prefix)?);
        Ok(Registry {
            inner: Arc::new(RegistryInner {
                config,
                tokenizer,
                sessions: RwLock::new(HashMap::new()),
                serving: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                triggers: Mutex::new(Vec::new()),
                bind_lock: tokio::sync::Mutex::new(()),
                next_connection: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Start accepting connections on `addr` unless already listening
    /// there. Returns the bound address.
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr> {
        Ok(self.listener(addr).await?.local_addr)
    }

    async fn listener(&self, addr: &str) -> Result<Arc<Listener>> {
        let requested = tokio::net::lookup_host(addr)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| Error::InvalidAddress(addr.to_string()))?;

        let _guard = self.inner.bind_lock.lock().await;
        if requested.port() != 0 {
            let listeners = self.inner.listeners.lock();
            if let Some(existing) = listeners
                .iter()
                .find(|l| l.requested == requested || l.local_addr == requested)
            {
                return Ok(existing.clone());
            }
        }

        let tcp = TcpListener::bind(requested).await.map_err(|source| Error::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = tcp.local_addr()?;
        let listener = Arc::new(Listener {
            requested,
            local_addr,
            admissions: Mutex::new(Admissions::default()),
            favicon: Mutex::new(Favicon::default()),
        });

        let (trigger, valve) = stream_cancel::Valve::new();
        let incoming = Box::pin(valve.wrap(TcpListenerStream::new(tcp)));
        self.inner.triggers.lock().push(trigger);
        self.inner.listeners.lock().push(listener.clone());
        tokio::spawn(accept_loop(
            Arc::downgrade(&self.inner),
            listener.clone(),
            incoming,
        ));
        info!("listening on {}", local_addr);
        Ok(listener)
    }

    /// Allow one browser to open a session on `addr`, binding it first if
    /// needed. Bind failures are returned here.
    pub async fn request_session(
        &self,
        addr: &str,
        options: SessionOptions,
    ) -> Result<PendingSession> {
        let listener = self.listener(addr).await?;
        let (tx, rx) = oneshot::channel();
        {
            let mut admissions = listener.admissions.lock();
            if admissions.closed {
                return Err(Error::ListenerClosed(listener.local_addr));
            }
            if let Some(favicon) = &options.favicon {
                *listener.favicon.lock() = favicon.clone();
            }
            admissions.pending.push_back(Admission { options, tx });
        }
        debug!("session admission pending on {}", listener.local_addr);
        Ok(PendingSession {
            rx,
            local_addr: listener.local_addr,
        })
    }

    /// [`Registry::request_session`], then wait for the browser.
    pub async fn new_session(&self, addr: &str, options: SessionOptions) -> Result<Session> {
        self.request_session(addr, options).await?.established().await
    }

    pub fn session(&self, id: &SessionId) -> Option<Session> {
        self.inner.sessions.read().get(id).cloned()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every listener, fail pending admissions and close every session.
    pub fn shutdown(&self) {
        for trigger in self.inner.triggers.lock().drain(..) {
            trigger.cancel();
        }
        for listener in self.inner.listeners.lock().drain(..) {
            listener.close_admissions();
        }
        for session in self.sessions() {
            session.close();
        }
        info!("registry shut down");
    }
}

async fn accept_loop<S>(inner: Weak<RegistryInner>, listener: Arc<Listener>, mut incoming: S)
where
    S: futures::Stream<Item = std::io::Result<TcpStream>> + Unpin,
{
    while let Some(conn) = incoming.next().await {
        match conn {
            Ok(stream) => {
                let Some(inner) = inner.upgrade() else { break };
                tokio::spawn(serve_connection(inner, listener.clone(), stream));
            }
            Err(e) => warn!("accept on {} failed: {}", listener.local_addr, e),
        }
    }
    listener.close_admissions();
    debug!("accept loop on {} stopped", listener.local_addr);
}

async fn serve_connection(inner: Arc<RegistryInner>, listener: Arc<Listener>, stream: TcpStream) {
    let peer = stream.peer_addr().ok();
    let id = inner.next_connection.fetch_add(1, Ordering::Relaxed);
    let cancel = CancellationToken::new();
    let mut conn = HttpConnection::new(stream, &inner.config);
    let result = serve_requests(&inner, &listener, &mut conn, id, &cancel).await;
    if cancel.is_cancelled() {
        debug!("connection {} from {:?} ended by session close", id, peer);
    }
    if let Err(e) = result {
        info!("dropping connection from {:?}: {}", peer, e);
    }
    inner.release_connection(id);
}

/// Answer requests until the peer goes away. A cancelled connection stops
/// between requests, so an answer in progress is still written.
async fn serve_requests<S>(
    inner: &Arc<RegistryInner>,
    listener: &Listener,
    conn: &mut HttpConnection<S>,
    id: u64,
    cancel: &CancellationToken,
) -> std::result::Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while !cancel.is_cancelled() {
        let request = tokio::select! {
            r = conn.read_request() => r?,
            _ = cancel.cancelled() => break,
        };
        let Some(request) = request else { break };
        handle_request(inner, listener, conn, id, cancel, request).await?;
    }
    Ok(())
}

/// Split `/<session-id>/<call>` into its parts.
fn session_route(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix('/')?;
    let (sid, call) = rest.split_once('/').unwrap_or((rest, ""));
    SessionId::is_valid(sid).then_some((sid, call))
}

async fn handle_request<S>(
    inner: &Arc<RegistryInner>,
    listener: &Listener,
    conn: &mut HttpConnection<S>,
    id: u64,
    cancel: &CancellationToken,
    request: Request,
) -> std::result::Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (path, query) = request
        .path
        .split_once('?')
        .unwrap_or((request.path.as_str(), ""));
    let route = session_route(path);

    if path.ends_with("/favicon.ico") {
        let page = query
            .strip_prefix("page=")
            .and_then(|n| n.parse::<u64>().ok());
        let favicon = route
            .and_then(|(sid, _)| sid.parse::<SessionId>().ok())
            .and_then(|sid| inner.sessions.read().get(&sid).cloned())
            .and_then(|session| session.favicon(page))
            .unwrap_or_else(|| listener.favicon.lock().clone());
        conn.write_response(StatusCode::OK, &favicon.content_type, &favicon.bytes)
            .await?;
        return Ok(());
    }

    let Some((sid, call)) = route else {
        return admit(inner, listener, conn, id, cancel, path).await;
    };

    let session = sid
        .parse::<SessionId>()
        .ok()
        .and_then(|sid| inner.sessions.read().get(&sid).cloned())
        .ok_or_else(|| ConnectionError::UnknownSession(sid.to_string()))?;
    session.touch();
    inner.mark_serving(session.id(), id, cancel);

    let call = percent_decode_str(call)
        .decode_utf8()
        .map_err(|_| ConnectionError::Path(call.to_string()))?;
    let call = parse_call(&call)?;
    match dispatch(&session, call, &request.body).await? {
        Reply::Flush => conn.write_ok(&session.flush()).await?,
        Reply::Empty => conn.write_ok("").await?,
        Reply::Wait => match session.wait_for_push().await {
            PushOutcome::Deliver(batch) => {
                if let Err(e) = conn.write_ok(&serialize_batch(&batch)).await {
                    session.restore(batch);
                    return Err(e.into());
                }
            }
            PushOutcome::Superseded => conn.write_ok("").await?,
            PushOutcome::Closed => return Err(ConnectionError::SessionClosed),
        },
    }
    Ok(())
}

/// Turn a request without session id into a new session, if one is
/// expected on this listener.
async fn admit<S>(
    inner: &Arc<RegistryInner>,
    listener: &Listener,
    conn: &mut HttpConnection<S>,
    id: u64,
    cancel: &CancellationToken,
    path: &str,
) -> std::result::Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match listener.take_admission() {
        Some(admission) => establish(inner, admission, conn, id, cancel, path).await,
        None => {
            conn.write_not_found().await?;
            Err(ConnectionError::NotAdmitted(path.to_string()))
        }
    }
}

async fn establish<S>(
    inner: &Arc<RegistryInner>,
    admission: Admission,
    conn: &mut HttpConnection<S>,
    id: u64,
    cancel: &CancellationToken,
    path: &str,
) -> std::result::Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let path = percent_decode_str(path).decode_utf8_lossy().into_owned();
    let session = Session::new(
        SessionId::generate(),
        path,
        &admission.options,
        inner.tokenizer.clone(),
        &inner.config,
        Arc::downgrade(inner),
    );
    inner
        .sessions
        .write()
        .insert(session.id().clone(), session.clone());
    inner.mark_serving(session.id(), id, cancel);

    if let Err(session) = admission.tx.send(session.clone()) {
        // the requester went away in the meantime
        session.close();
        conn.write_not_found().await?;
        return Err(ConnectionError::NotAdmitted(session.path().to_string()));
    }
    info!("session {} started at {}", session.id(), session.path());
    let document = bootstrap_document(session.id(), &admission.options, &inner.config);
    conn.write_ok(&document).await?;
    Ok(())
}
