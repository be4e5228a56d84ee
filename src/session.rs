//! Server-side state of one browser client.
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bui_longpoll_types::{SessionId, Token};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::callback::{CallbackResult, CurrentHandler, Environment, EventHandler};
use crate::config::{Config, Favicon, PageOptions, SessionOptions};
use crate::errors::{Error, Result};
use crate::mutation::{serialize_batch, Mutation};
use crate::page::{Page, PageState};
use crate::registry::RegistryInner;
use crate::tokenizer::{CallSpec, TokenTarget, Tokenizer};
use bui_longpoll_types::CurrentValues;

/// `update` key whose value is run as script.
pub const RAW_KEY: &str = "js";

/// How a parked "wait for push" request ends.
#[derive(Debug)]
pub(crate) enum PushOutcome {
    /// The drained queue, to be sent as the response.
    Deliver(Vec<Mutation>),
    /// Another wait request took over the slot; respond with nothing.
    Superseded,
    /// The session was closed; drop the connection.
    Closed,
}

/// A token looked up on the active page, cloned out of the session lock.
pub(crate) enum Resolved {
    Event {
        page_id: u64,
        marker: Arc<()>,
        spec: CallSpec,
        handler: Option<Box<dyn EventHandler>>,
    },
    Current(Box<dyn CurrentHandler>),
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct ClientConfig {
    push: bool,
    poll_interval_ms: u32,
}

pub(crate) struct SessionShared {
    pub(crate) id: SessionId,
    pub(crate) path: String,
    pub(crate) tokenizer: Arc<Tokenizer>,
    pub(crate) root_element_id: String,
    favicon: Option<Favicon>,
    registry: Weak<RegistryInner>,
    state: Mutex<SessionState>,
}

/// Everything guarded by the session lock: pages and their token maps,
/// the outgoing queue and the long-poll slot.
pub(crate) struct SessionState {
    pages: Vec<PageState>,
    pub(crate) active: u64,
    next_page_id: u64,
    queue: Vec<Mutation>,
    held: Option<oneshot::Sender<PushOutcome>>,
    defaults: ClientConfig,
    client: ClientConfig,
    detached: bool,
    env: Environment,
    closed: bool,
    /// Last request received from the browser.
    last_contact: Instant,
}

impl SessionState {
    fn page(&self, id: u64) -> Result<&PageState> {
        self.pages
            .iter()
            .find(|p| p.id == id)
            .ok_or(Error::PageNotFound(id))
    }

    pub(crate) fn page_mut(&mut self, id: u64) -> Result<&mut PageState> {
        self.pages
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(Error::PageNotFound(id))
    }

    fn append(&mut self, mutations: Vec<Mutation>) {
        self.queue.extend(mutations);
        if self.queue.is_empty() {
            return;
        }
        if let Some(tx) = self.held.take() {
            let batch = mem::take(&mut self.queue);
            // the parked connection went away; keep the batch for the next flush
            if let Err(PushOutcome::Deliver(batch)) = tx.send(PushOutcome::Deliver(batch)) {
                self.queue = batch;
            }
        }
    }

    fn show(&self, id: u64, shared: &SessionShared) -> Result<Vec<Mutation>> {
        let page = self.page(id)?;
        let mut out = Vec::with_capacity(1 + page.listeners.len());
        out.push(Mutation::SetContent {
            id: shared.root_element_id.clone(),
            html: page.tokenized.clone(),
        });
        out.extend(page.listeners.iter().cloned());
        Ok(out)
    }

    fn activate(&mut self, id: u64, shared: &SessionShared) -> Result<Vec<Mutation>> {
        let mut out = Vec::new();
        let options = self.page(id)?.options.clone();
        if options.static_page {
            if !self.detached {
                out.push(Mutation::Detach);
            }
            self.detached = true;
        } else {
            let wanted = ClientConfig {
                push: options.push.unwrap_or(self.defaults.push),
                poll_interval_ms: options
                    .poll_interval_ms
                    .unwrap_or(self.defaults.poll_interval_ms),
            };
            let push = (wanted.push != self.client.push).then_some(wanted.push);
            let poll_interval_ms = (wanted.poll_interval_ms != self.client.poll_interval_ms)
                .then_some(wanted.poll_interval_ms);
            if push.is_some() || poll_interval_ms.is_some() {
                out.push(Mutation::Configure {
                    push,
                    poll_interval_ms,
                });
            }
            self.client = wanted;
        }
        if options.favicon.is_some() {
            out.push(Mutation::SetFavicon {
                href: format!("/{}/favicon.ico?page={}", shared.id, id),
            });
        }
        out.extend(self.show(id, shared)?);
        self.active = id;
        let active = self.active;
        self.pages.retain(|p| p.id == active || p.is_referenced());
        Ok(out)
    }
}

/// Handle to one browser client.
///
/// Cloning is cheap; all clones refer to the same session, including the
/// one a callback gets from [`Context::session`](crate::Context::session).
/// Every call queues its instructions as soon as it returns, so a parked
/// long-poll request sees them while the caller is still running. A
/// session starts with an empty placeholder page, shows the pages created
/// with [`Session::new_page`] and ends with [`Session::close`].
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        path: String,
        options: &SessionOptions,
        tokenizer: Arc<Tokenizer>,
        config: &Config,
        registry: Weak<RegistryInner>,
    ) -> Session {
        let client = ClientConfig {
            push: options.push,
            poll_interval_ms: options.poll_interval_ms,
        };
        let state = SessionState {
            pages: vec![PageState::placeholder()],
            active: 0,
            next_page_id: 1,
            queue: Vec::new(),
            held: None,
            defaults: client,
            client,
            detached: false,
            env: options.env.clone(),
            closed: false,
            last_contact: Instant::now(),
        };
        Session {
            shared: Arc::new(SessionShared {
                id,
                path,
                tokenizer,
                root_element_id: config.root_element_id.clone(),
                favicon: options.favicon.clone(),
                registry,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.shared.id
    }

    /// Path requested by the browser when the session started.
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Time since the browser was last heard from. Zero while a long-poll
    /// request is parked. A browser that went away without closing the
    /// session shows up as a growing idle time.
    pub fn idle_time(&self) -> Duration {
        let state = self.shared.state.lock();
        if state.held.is_some() {
            Duration::ZERO
        } else {
            state.last_contact.elapsed()
        }
    }

    pub(crate) fn touch(&self) {
        self.shared.state.lock().last_contact = Instant::now();
    }

    /// Build a page from `html`, bind `env` on top of the session
    /// environment, and show it in place of the current page.
    pub fn new_page(&self, html: &str, env: Environment, options: PageOptions) -> Result<Page> {
        let html = html.to_string();
        let (id, marker) = self.enqueue_with(move |state, shared| {
            let id = state.next_page_id;
            let mut page = PageState::new(id, &html, options, &shared.tokenizer)?;
            let mut merged = state.env.clone();
            merged.merge(env);
            page.bind(merged, &shared.tokenizer)?;
            let marker = page.marker.clone();
            state.next_page_id += 1;
            state.pages.push(page);
            let mutations = state.activate(id, shared)?;
            debug!("session {}: page {} active", shared.id, id);
            Ok((mutations, (id, marker)))
        })?;
        Ok(Page {
            session: self.clone(),
            id,
            _marker: marker,
        })
    }

    /// The page currently shown.
    pub fn current_page(&self) -> Page {
        let (id, marker) = {
            let state = self.shared.state.lock();
            let marker = state
                .page(state.active)
                .map(|p| p.marker.clone())
                .unwrap_or_default();
            (state.active, marker)
        };
        Page {
            session: self.clone(),
            id,
            _marker: marker,
        }
    }

    /// Change the content of the current page.
    ///
    /// Each entry becomes one client instruction, queued in iteration order:
    ///
    /// - `"js"`: run the value as script;
    /// - `"window.location"` or `"window.location.href"`: redirect;
    /// - `"window.<path>"`: assign to a browser-global property;
    /// - `"<id>.<attr>"`: set a property of the element (or an attribute,
    ///   when the name contains `-` or a space);
    /// - `"<id>"`: replace the inner HTML of the element. Markers in the new
    ///   content are tokenized against the current page.
    pub fn update<I, K, V>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let entries: Vec<(String, String)> = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.enqueue_with(move |state, shared| {
            let active = state.active;
            let page = state.page_mut(active)?;
            let mut out = Vec::with_capacity(entries.len());
            for (name, value) in entries {
                out.push(entry_mutation(name, value, page, &shared.tokenizer)?);
            }
            Ok((out, ()))
        })
    }

    /// Ask the browser for the current values of `names` (`"<id>"` for inner
    /// HTML, `"<id>.<attr>"` for a property). `handler` is called with the
    /// values once they arrive.
    pub fn current<I, S, F>(&self, names: I, handler: F) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&CurrentValues) -> CallbackResult + Clone + Send + Sync + 'static,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let handler: Box<dyn CurrentHandler> = Box::new(handler);
        self.enqueue_with(move |state, _shared| {
            let active = state.active;
            let token = state.page_mut(active)?.tokens.register_current(handler);
            Ok((vec![Mutation::RequestCurrent { token, names }], ()))
        })
    }

    /// Terminate the session.
    ///
    /// Releases a parked long-poll request, removes the session from its
    /// registry and ends the connection that last served it once its
    /// current request is answered. Instructions queued before `close`
    /// still go out with that answer. Calling `close` again does nothing.
    pub fn close(&self) {
        let held = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.held.take()
        };
        if let Some(tx) = held {
            let _ = tx.send(PushOutcome::Closed);
        }
        if let Some(registry) = self.shared.registry.upgrade() {
            registry.forget_session(&self.shared.id);
        }
        info!("session {} closed", self.shared.id);
    }

    /// Run `f` under the session lock and queue the mutations it returns.
    pub(crate) fn enqueue_with<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut SessionState, &SessionShared) -> Result<(Vec<Mutation>, R)>,
    {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(Error::SessionClosed);
        }
        let (mutations, r) = f(&mut state, &self.shared)?;
        state.append(mutations);
        Ok(r)
    }

    pub(crate) fn with_page<R>(&self, id: u64, f: impl FnOnce(&PageState) -> R) -> Result<R> {
        let state = self.shared.state.lock();
        state.page(id).map(f)
    }

    pub(crate) fn active_page_id(&self) -> u64 {
        self.shared.state.lock().active
    }

    pub(crate) fn page_handle(&self, id: u64, marker: Arc<()>) -> Page {
        Page {
            session: self.clone(),
            id,
            _marker: marker,
        }
    }

    /// Look `token` up on the active page.
    pub(crate) fn resolve(&self, token: &Token) -> Option<Resolved> {
        let state = self.shared.state.lock();
        let page = state.page(state.active).ok()?;
        match page.tokens.resolve(token)? {
            TokenTarget::Event(spec) => Some(Resolved::Event {
                page_id: page.id,
                marker: page.marker.clone(),
                spec: spec.clone(),
                handler: page.env.get_handler(&spec.name),
            }),
            TokenTarget::Current(handler) => Some(Resolved::Current(handler.clone())),
        }
    }

    /// A handler bound on the active page, with the page it was found on.
    pub(crate) fn active_handler(&self, name: &str) -> Option<(u64, Arc<()>, Box<dyn EventHandler>)> {
        let state = self.shared.state.lock();
        let page = state.page(state.active).ok()?;
        let handler = page.env.get_handler(name)?;
        Some((page.id, page.marker.clone(), handler))
    }

    /// Icon of `page` (default: the active page), falling back to the
    /// session icon.
    pub(crate) fn favicon(&self, page: Option<u64>) -> Option<Favicon> {
        let state = self.shared.state.lock();
        state
            .page(page.unwrap_or(state.active))
            .ok()
            .and_then(|p| p.options.favicon.clone())
            .or_else(|| self.shared.favicon.clone())
    }

    /// Drain the queue into one response body.
    pub(crate) fn flush(&self) -> String {
        let batch = mem::take(&mut self.shared.state.lock().queue);
        serialize_batch(&batch)
    }

    /// Put an undelivered batch back in front of the queue.
    pub(crate) fn restore(&self, batch: Vec<Mutation>) {
        let mut state = self.shared.state.lock();
        if state.closed || batch.is_empty() {
            return;
        }
        let later = mem::replace(&mut state.queue, batch);
        state.append(later);
    }

    /// Park until a mutation is queued, the session closes, or another wait
    /// request takes over. Returns at once if the queue is not empty.
    pub(crate) async fn wait_for_push(&self) -> PushOutcome {
        let rx = {
            let mut state = self.shared.state.lock();
            if !state.queue.is_empty() {
                return PushOutcome::Deliver(mem::take(&mut state.queue));
            }
            if state.closed {
                return PushOutcome::Closed;
            }
            let (tx, rx) = oneshot::channel();
            if let Some(previous) = state.held.replace(tx) {
                let _ = previous.send(PushOutcome::Superseded);
            }
            rx
        };
        rx.await.unwrap_or(PushOutcome::Closed)
    }

    /// Queue the active page again, as after a browser reload.
    pub(crate) fn resend_active_page(&self) -> Result<()> {
        self.enqueue_with(|state, shared| Ok((state.show(state.active, shared)?, ())))
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Session {}

impl Hash for Session {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("path", &self.shared.path)
            .finish()
    }
}

fn entry_mutation(
    name: String,
    value: String,
    page: &mut PageState,
    tokenizer: &Tokenizer,
) -> Result<Mutation> {
    if name == RAW_KEY {
        return Ok(Mutation::RunRaw(value));
    }
    if let Some(path) = name.strip_prefix("window.") {
        let path: Vec<String> = path.split('.').map(String::from).collect();
        if path.iter().any(|s| s.is_empty()) {
            return Err(Error::InvalidName(name));
        }
        let is_location = path[0] == "location" && (path.len() == 1 || (path.len() == 2 && path[1] == "href"));
        return Ok(if is_location {
            Mutation::Redirect(value)
        } else {
            Mutation::SetGlobal { path, value }
        });
    }
    if let Some((id, attr)) = name.split_once('.') {
        if id.is_empty() || attr.is_empty() {
            return Err(Error::InvalidName(name));
        }
        let (id, attr) = (id.to_string(), attr.to_string());
        return Ok(if attr.contains('-') || attr.contains(' ') {
            Mutation::SetAttribute {
                id,
                name: attr,
                value,
            }
        } else {
            Mutation::SetProperty {
                id,
                name: attr,
                value,
            }
        });
    }
    if name.is_empty() {
        return Err(Error::InvalidName(name));
    }
    let html = tokenizer.tokenize(&value, &mut page.tokens)?;
    Ok(Mutation::SetContent { id: name, html })
}
