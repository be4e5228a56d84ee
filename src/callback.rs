//! Callbacks bound by the application and the context they are invoked with.
use std::collections::BTreeMap;
use std::fmt;

use bui_longpoll_types::CurrentValues;
use dyn_clone::DynClone;
use serde_json::Value;

use crate::page::Page;
use crate::session::Session;

/// Error returned by a failing callback. It is logged, never propagated.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Result of a callback invocation.
pub type CallbackResult = Result<(), CallbackError>;

/// A callback invoked when the browser dispatches an event token.
pub trait EventHandler: DynClone + Send + Sync {
    fn handle(&self, ctx: &Context) -> CallbackResult;
}

dyn_clone::clone_trait_object!(EventHandler);

impl<F> EventHandler for F
where
    F: Fn(&Context) -> CallbackResult + Clone + Send + Sync + 'static,
{
    fn handle(&self, ctx: &Context) -> CallbackResult {
        (self)(ctx)
    }
}

/// A callback invoked with the values returned for a
/// [`Session::current`] request.
pub trait CurrentHandler: DynClone + Send + Sync {
    fn handle(&self, values: &CurrentValues) -> CallbackResult;
}

dyn_clone::clone_trait_object!(CurrentHandler);

impl<F> CurrentHandler for F
where
    F: Fn(&CurrentValues) -> CallbackResult + Clone + Send + Sync + 'static,
{
    fn handle(&self, values: &CurrentValues) -> CallbackResult {
        (self)(values)
    }
}

/// A named entry of an [`Environment`].
#[derive(Clone)]
pub enum Binding {
    /// A callable, referenced by name from callback-binding markers.
    Handler(Box<dyn EventHandler>),
    /// A plain value, readable with [`Context::value`]. String values bound
    /// under a `<prefix>-on<event>` name declare a global listener.
    Value(Value),
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Handler(_) => f.write_str("Handler(..)"),
            Binding::Value(v) => f.debug_tuple("Value").field(v).finish(),
        }
    }
}

/// Named callables and values used to resolve callback sources.
#[derive(Clone, Debug, Default)]
pub struct Environment {
    bindings: BTreeMap<String, Binding>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a callable under `name`.
    pub fn handler<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Context) -> CallbackResult + Clone + Send + Sync + 'static,
    {
        self.bindings
            .insert(name.into(), Binding::Handler(Box::new(f)));
        self
    }

    /// Bind a plain value under `name`.
    pub fn value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bindings
            .insert(name.into(), Binding::Value(value.into()));
        self
    }

    /// Declare a global listener, e.g.
    /// `listener("rust-onkeydown(key)", "key_down")`.
    pub fn listener(self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.value(name, Value::String(source.into()))
    }

    /// Merge `other` into `self`; bindings of `other` win.
    pub fn merge(&mut self, other: Environment) {
        self.bindings.extend(other.bindings);
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(name)
    }

    pub(crate) fn get_handler(&self, name: &str) -> Option<Box<dyn EventHandler>> {
        match self.bindings.get(name) {
            Some(Binding::Handler(h)) => Some(h.clone()),
            _ => None,
        }
    }

    pub(crate) fn get_value(&self, name: &str) -> Option<Value> {
        match self.bindings.get(name) {
            Some(Binding::Value(v)) => Some(v.clone()),
            _ => None,
        }
    }

    pub(crate) fn insert(&mut self, name: String, binding: Binding) {
        self.bindings.insert(name, binding);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Binding)> {
        self.bindings.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl IntoIterator for Environment {
    type Item = (String, Binding);
    type IntoIter = std::collections::btree_map::IntoIter<String, Binding>;
    fn into_iter(self) -> Self::IntoIter {
        self.bindings.into_iter()
    }
}

/// What an [`EventHandler`] sees when it is invoked.
pub struct Context {
    pub(crate) session: Session,
    pub(crate) page: Page,
    pub(crate) event: Value,
    pub(crate) args: Vec<Value>,
}

impl Context {
    /// The session the event was sent to.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The page that was active when the event arrived.
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// The serialized DOM event (`null` for ticks).
    pub fn event(&self) -> &Value {
        &self.event
    }

    /// Literal arguments from the callback source, e.g. `[3, -1]` for
    /// `add(3, -1)`, or the tick count for `timer_tick`.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// A plain value bound in the page environment.
    pub fn value(&self, name: &str) -> Option<Value> {
        self.page.value(name)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("session", &self.session.id())
            .field("page", &self.page.id())
            .field("event", &self.event)
            .field("args", &self.args)
            .finish()
    }
}
