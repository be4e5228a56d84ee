//! This library, bui-longpoll, lets an application drive a browser user
//! interface entirely from the server. The application writes HTML in which
//! elements carry callback bindings such as `rust-onclick="add(1)"`, and
//! updates the page incrementally from Rust. The browser only runs a fixed
//! bootstrap script: it evaluates the instructions it receives and posts
//! events back.
//!
//! The operating principle is that the server runs a small HTTP/1.1
//! transport to which the browser connects. The first request of a browser
//! is answered with a document embedding the bootstrap script and a fresh
//! session id. From then on the browser keeps one "wait for push" request
//! pending (long polling), which the server answers as soon as something is
//! queued for that session. Events are POSTed with an opaque token that the
//! server resolves against the callbacks bound to the active page. Callback
//! source text is parsed, never evaluated.
//!
//! #### Features
//!
//!  - Sessions are only admitted on addresses where the application asked
//!    for one ([`Registry::request_session`]); other browsers get a 404.
//!  - Mutations are delivered in the order they were queued, and each flush
//!    drains the whole queue.
//!  - Each session call queues all of its instructions or none, as soon as
//!    it returns. A failing callback is logged and adds nothing more.
//!  - Pages can switch push mode and the tick interval, end the session
//!    (static pages) and set their own favicon.
//!
//! #### Security warning
//!
//! Due to its nature, the program listens and responds to client connections
//! from the network. If you expose your program to untrusted network
//! connections, ensure that code within any callback handlers you write is safe
//! when handling malicious input.
//!
//! ```no_run
//! use bui_longpoll::{Context, Environment, PageOptions, Registry, SessionOptions};
//!
//! # async fn run() -> Result<(), bui_longpoll::Error> {
//! let registry = Registry::new(Default::default())?;
//! let session = registry
//!     .new_session("127.0.0.1:3410", SessionOptions::default())
//!     .await?;
//! let env = Environment::new().handler("hello", |ctx: &Context| {
//!     ctx.session().update([("out", "hello world")])?;
//!     Ok(())
//! });
//! session.new_page(
//!     r#"<button rust-onclick="hello">Say hello</button><p id="out"></p>"#,
//!     env,
//!     PageOptions::default(),
//! )?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

mod errors;
pub use errors::{DispatchError, Error, Result, TransportError};

pub mod bootstrap;
pub mod callback;
pub mod config;
mod dispatch;
pub mod mutation;
mod page;
mod registry;
mod session;
pub mod tokenizer;
pub mod transport;

pub use bui_longpoll_types::{CurrentValues, SessionId, Token};
pub use callback::{Binding, CallbackError, CallbackResult, Context, Environment};
pub use config::{Config, Favicon, PageOptions, SessionOptions};
pub use dispatch::{TICK_KEYWORD, WAIT_KEYWORD};
pub use page::Page;
pub use registry::{PendingSession, Registry};
pub use session::{Session, RAW_KEY};
