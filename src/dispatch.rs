//! Resolves calls posted by the browser and invokes the bound callbacks.
use std::sync::Arc;

use bui_longpoll_types::{CurrentEnvelope, EventEnvelope, Token};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::callback::{CallbackResult, Context, CurrentHandler, EventHandler};
use crate::errors::DispatchError;
use crate::session::{Resolved, Session};

/// Keyword of the long-poll request: `wait_server_event(<n>)`.
pub const WAIT_KEYWORD: &str = "wait_server_event";

/// Keyword of the periodic tick: `timer_tick(ctx, <n>)`. The handler bound
/// under this name is invoked with `args = [n]`.
pub const TICK_KEYWORD: &str = "timer_tick";

/// A decoded call path segment.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Call {
    WaitForPush(u64),
    Tick(u64),
    Token(Token),
    Reload,
}

/// How the transport answers a dispatched call.
#[derive(Debug, PartialEq)]
pub(crate) enum Reply {
    /// Respond with the drained queue.
    Flush,
    /// Park until something is queued.
    Wait,
    /// Respond with an empty body.
    Empty,
}

/// Parse the percent-decoded call. The tick and wait grammars must match
/// exactly; there is no whitespace tolerance.
pub(crate) fn parse_call(raw: &str) -> Result<Call, DispatchError> {
    if raw.is_empty() {
        return Ok(Call::Reload);
    }
    if raw.starts_with(TICK_KEYWORD) {
        return raw
            .strip_prefix("timer_tick(ctx, ")
            .and_then(|r| r.strip_suffix(')'))
            .and_then(parse_count)
            .map(Call::Tick)
            .ok_or_else(|| DispatchError::IllegalTick(raw.to_string()));
    }
    if raw.starts_with(WAIT_KEYWORD) {
        return raw
            .strip_prefix("wait_server_event(")
            .and_then(|r| r.strip_suffix(')'))
            .and_then(parse_count)
            .map(Call::WaitForPush)
            .ok_or_else(|| DispatchError::IllegalWait(raw.to_string()));
    }
    raw.parse::<Token>()
        .map(Call::Token)
        .map_err(|_| DispatchError::InvalidCall(raw.to_string()))
}

fn parse_count(digits: &str) -> Option<u64> {
    if digits.is_empty() || digits.len() > 19 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn payload<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, DispatchError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(body)?)
}

/// Handle one call for an established session.
pub(crate) async fn dispatch(
    session: &Session,
    call: Call,
    body: &[u8],
) -> Result<Reply, DispatchError> {
    if session.is_closed() {
        return Err(DispatchError::SessionClosed);
    }
    match call {
        Call::WaitForPush(_) => Ok(Reply::Wait),
        Call::Reload => {
            let session = session.clone();
            tokio::spawn(async move {
                if let Err(e) = session.resend_active_page() {
                    warn!("cannot resend page of session {}: {}", session.id(), e);
                }
            });
            Ok(Reply::Empty)
        }
        Call::Tick(n) => {
            if let Some((page_id, marker, handler)) = session.active_handler(TICK_KEYWORD) {
                let args = vec![Value::from(n)];
                invoke_event(session, page_id, marker, handler, Value::Null, args, TICK_KEYWORD)
                    .await;
            }
            Ok(Reply::Flush)
        }
        Call::Token(token) => match session.resolve(&token) {
            None => Err(DispatchError::UnknownToken(token.to_string())),
            Some(Resolved::Event {
                page_id,
                marker,
                spec,
                handler,
            }) => {
                let envelope: EventEnvelope = payload(body)?;
                match handler {
                    Some(handler) => {
                        invoke_event(
                            session,
                            page_id,
                            marker,
                            handler,
                            envelope.event,
                            spec.args,
                            &spec.name,
                        )
                        .await
                    }
                    None => warn!(
                        "session {}: {} is bound to `{}`, which is not a handler",
                        session.id(),
                        token,
                        spec.name
                    ),
                }
                Ok(Reply::Flush)
            }
            Some(Resolved::Current(handler)) => {
                let envelope: CurrentEnvelope = payload(body)?;
                invoke_current(session, handler, envelope, token).await;
                Ok(Reply::Flush)
            }
        },
    }
}

async fn invoke_event(
    session: &Session,
    page_id: u64,
    marker: Arc<()>,
    handler: Box<dyn EventHandler>,
    event: Value,
    args: Vec<Value>,
    name: &str,
) {
    run_callback(session, name, move |session| {
        let ctx = Context {
            page: session.page_handle(page_id, marker),
            session,
            event,
            args,
        };
        handler.handle(&ctx)
    })
    .await
}

async fn invoke_current(
    session: &Session,
    handler: Box<dyn CurrentHandler>,
    envelope: CurrentEnvelope,
    token: Token,
) {
    let name = token.to_string();
    run_callback(session, &name, move |_| handler.handle(&envelope.current_dict)).await
}

/// Run `f` on the blocking pool, logging a failure or panic.
///
/// Each session call made by `f` is queued when it returns, whole or not at
/// all. A failing callback adds nothing beyond the calls it completed, which
/// the browser receives like any others so its page and the tokens resolved
/// here stay the same.
async fn run_callback<F>(session: &Session, name: &str, f: F)
where
    F: FnOnce(Session) -> CallbackResult + Send + 'static,
{
    let handle = session.clone();
    match tokio::task::spawn_blocking(move || f(handle)).await {
        Ok(Ok(())) => debug!("session {}: callback `{}` done", session.id(), name),
        Ok(Err(e)) => error!("session {}: callback `{}` failed: {}", session.id(), name, e),
        Err(e) => error!("session {}: callback `{}` aborted: {}", session.id(), name, e),
    }
}
