//! One HTML snapshot of a session and its token bindings.
use std::sync::Arc;

use serde_json::Value;

use crate::callback::{Binding, Environment};
use crate::config::PageOptions;
use crate::errors::{Error, Result};
use crate::mutation::Mutation;
use crate::session::Session;
use crate::tokenizer::{TokenMap, Tokenizer};

/// Page state. Lives inside the session state and is only touched under
/// the session lock, so tokenization never races a queue flush.
pub(crate) struct PageState {
    pub(crate) id: u64,
    pub(crate) html: String,
    pub(crate) tokenized: String,
    pub(crate) tokens: TokenMap,
    pub(crate) env: Environment,
    pub(crate) options: PageOptions,
    /// Listener registrations, re-sent whenever the page is shown.
    pub(crate) listeners: Vec<Mutation>,
    /// Shared with every [`Page`] handle; the page is kept while any exists.
    pub(crate) marker: Arc<()>,
}

impl PageState {
    pub(crate) fn new(
        id: u64,
        html: &str,
        options: PageOptions,
        tokenizer: &Tokenizer,
    ) -> Result<Self> {
        let mut tokens = TokenMap::new();
        let tokenized = tokenizer.tokenize(html, &mut tokens)?;
        Ok(PageState {
            id,
            html: html.to_string(),
            tokenized,
            tokens,
            env: Environment::new(),
            options,
            listeners: Vec::new(),
            marker: Arc::new(()),
        })
    }

    /// The page shown before the application creates one.
    pub(crate) fn placeholder() -> Self {
        PageState {
            id: 0,
            html: String::new(),
            tokenized: String::new(),
            tokens: TokenMap::new(),
            env: Environment::new(),
            options: PageOptions::default(),
            listeners: Vec::new(),
            marker: Arc::new(()),
        }
    }

    /// Merge `env`; returns the listener registrations it declared.
    pub(crate) fn bind(&mut self, env: Environment, tokenizer: &Tokenizer) -> Result<Vec<Mutation>> {
        let mut registered = Vec::new();
        for (name, binding) in env {
            if tokenizer.is_listener_name(&name) {
                let source = match &binding {
                    Binding::Value(Value::String(source)) => source.clone(),
                    _ => return Err(Error::InvalidListener(name)),
                };
                let listener = tokenizer.global_listener(&name, &source, &mut self.tokens)?;
                self.listeners.push(listener.clone());
                registered.push(listener);
            }
            self.env.insert(name, binding);
        }
        Ok(registered)
    }

    pub(crate) fn is_referenced(&self) -> bool {
        Arc::strong_count(&self.marker) > 1
    }
}

/// Handle to one page of a [`Session`].
#[derive(Clone)]
pub struct Page {
    pub(crate) session: Session,
    pub(crate) id: u64,
    pub(crate) _marker: Arc<()>,
}

impl Page {
    /// Page number within its session. The placeholder page shown before
    /// the first [`Session::new_page`] is page 0.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The HTML sent to the browser, with markers replaced by dispatch calls.
    pub fn render(&self) -> Result<String> {
        self.session.with_page(self.id, |p| p.tokenized.clone())
    }

    /// The HTML as given by the application.
    pub fn html(&self) -> Result<String> {
        self.session.with_page(self.id, |p| p.html.clone())
    }

    pub fn is_active(&self) -> bool {
        self.session.active_page_id() == self.id
    }

    /// A plain value bound in this page's environment.
    pub fn value(&self, name: &str) -> Option<Value> {
        self.session
            .with_page(self.id, |p| p.env.get_value(name))
            .ok()
            .flatten()
    }

    /// Merge named handlers and values into this page's environment.
    ///
    /// Names following the `<prefix>-on<event>[(attrs)]` convention bound to
    /// a callback source string register a page-wide listener instead. The
    /// registration is queued now if the page is active, and each time the
    /// page is shown.
    pub fn bind_environment(&self, env: Environment) -> Result<()> {
        let id = self.id;
        self.session.enqueue_with(move |state, shared| {
            let active = state.active == id;
            let page = state.page_mut(id)?;
            let registered = page.bind(env, &shared.tokenizer)?;
            Ok((if active { registered } else { Vec::new() }, ()))
        })
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("session", &self.session.id())
            .field("id", &self.id)
            .finish()
    }
}
