//! Configuration of the server and of individual sessions and pages.
use bytes::Bytes;

use crate::callback::Environment;

/// Server-wide settings shared by every listener of a [`crate::Registry`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Prefix of callback-binding markers: `<prefix>-onclick="..."`.
    pub binding_prefix: String,
    /// `id` of the element whose content is replaced by each new page.
    pub root_element_id: String,
    /// Value of the `Server` response header.
    pub server_name: String,
    /// Largest accepted request head (request line and headers).
    pub max_header_bytes: usize,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            binding_prefix: "rust".into(),
            root_element_id: "rootdiv".into(),
            server_name: concat!("bui-longpoll/", env!("CARGO_PKG_VERSION")).into(),
            max_header_bytes: 16 * 1024,
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Icon served for `favicon.ico` requests.
#[derive(Clone, Debug, PartialEq)]
pub struct Favicon {
    pub bytes: Bytes,
    pub content_type: String,
}

impl Favicon {
    pub fn new(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Favicon {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }

    pub fn png(bytes: impl Into<Bytes>) -> Self {
        Favicon::new(bytes, "image/png")
    }
}

impl Default for Favicon {
    fn default() -> Self {
        Favicon::new(
            Bytes::from_static(include_bytes!("favicon.svg")),
            "image/svg+xml",
        )
    }
}

/// Options for a new session, given to [`crate::Registry::new_session`].
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Interval of browser-driven `timer_tick` calls. Zero disables them.
    pub poll_interval_ms: u32,
    /// Whether the browser keeps a "wait for push" request pending.
    pub push: bool,
    /// Replaces the icon served by the listener.
    pub favicon: Option<Favicon>,
    /// Bindings inherited by every page of the session.
    pub env: Environment,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            poll_interval_ms: 0,
            push: true,
            favicon: None,
            env: Environment::new(),
        }
    }
}

/// Per-page overrides, given to [`crate::Session::new_page`].
#[derive(Clone, Debug, Default)]
pub struct PageOptions {
    /// Turn push mode on or off while this page is shown.
    pub push: Option<bool>,
    /// Change the tick interval while this page is shown.
    pub poll_interval_ms: Option<u32>,
    /// A terminal page: disables push and ticks and detaches the browser
    /// from the session.
    pub static_page: bool,
    /// Icon to show while this page is active.
    pub favicon: Option<Favicon>,
}

impl PageOptions {
    /// Options for a terminal page.
    pub fn static_page() -> Self {
        PageOptions {
            static_page: true,
            ..Default::default()
        }
    }
}
