//! Client instructions queued by a session and evaluated by the browser.
//!
//! Every variant serializes to one JavaScript statement. Caller-controlled
//! strings are always emitted as JSON string literals and property names
//! use bracket notation, so content can never escape its literal. The only
//! exception is [`Mutation::RunRaw`], which exists to run script supplied by
//! the application itself.
use bui_longpoll_types::Token;

/// One queued client instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    /// Replace the inner HTML of element `id`.
    SetContent { id: String, html: String },
    /// Call `setAttribute(name, value)` on element `id`.
    SetAttribute {
        id: String,
        name: String,
        value: String,
    },
    /// Assign `value` to property `name` of element `id`.
    SetProperty {
        id: String,
        name: String,
        value: String,
    },
    /// Assign `value` to `window[path[0]][path[1]]...`.
    SetGlobal { path: Vec<String>, value: String },
    /// Run application-supplied script.
    RunRaw(String),
    /// Navigate the browser to another URL.
    Redirect(String),
    /// Register a page-wide listener that dispatches `token`.
    AddGlobalListener {
        event: String,
        token: Token,
        attrs: Option<Vec<String>>,
    },
    /// Ask the browser to send back the current values of `names`.
    RequestCurrent { token: Token, names: Vec<String> },
    /// Change push mode and/or tick interval of the client.
    Configure {
        push: Option<bool>,
        poll_interval_ms: Option<u32>,
    },
    /// Stop all client-initiated traffic and forget the session id.
    Detach,
    /// Point the page icon at `href`.
    SetFavicon { href: String },
}

impl Mutation {
    /// Serialize to the instruction syntax understood by the bootstrap script.
    pub fn to_js(&self) -> String {
        match self {
            Mutation::SetContent { id, html } => format!(
                "document.getElementById({}).innerHTML = {}",
                js_string(id),
                js_string(html)
            ),
            Mutation::SetAttribute { id, name, value } => format!(
                "document.getElementById({}).setAttribute({}, {})",
                js_string(id),
                js_string(name),
                js_string(value)
            ),
            Mutation::SetProperty { id, name, value } => format!(
                "document.getElementById({})[{}] = {}",
                js_string(id),
                js_string(name),
                js_string(value)
            ),
            Mutation::SetGlobal { path, value } => {
                let mut target = String::from("window");
                for segment in path {
                    target.push('[');
                    target.push_str(&js_string(segment));
                    target.push(']');
                }
                format!("{} = {}", target, js_string(value))
            }
            Mutation::RunRaw(script) => script.clone(),
            Mutation::Redirect(url) => format!("window.location.href = {}", js_string(url)),
            Mutation::AddGlobalListener {
                event,
                token,
                attrs,
            } => format!(
                "window.addEventListener({}, function (event) {{ sendEvent({}, event, undefined, {}); }})",
                js_string(event),
                js_string(&token.to_string()),
                js_attr_list(attrs.as_deref())
            ),
            Mutation::RequestCurrent { token, names } => {
                let entries: Vec<String> = names
                    .iter()
                    .map(|name| {
                        let (id, attr) = match name.split_once('.') {
                            Some((id, attr)) => (id, attr),
                            None => (name.as_str(), "innerHTML"),
                        };
                        format!(
                            "{}: document.getElementById({})[{}]",
                            js_string(name),
                            js_string(id),
                            js_string(attr)
                        )
                    })
                    .collect();
                format!(
                    "sendToServer({}, JSON.stringify({{\"current_dict\": {{{}}}}}), evalResponse)",
                    js_string(&token.to_string()),
                    entries.join(", ")
                )
            }
            Mutation::Configure {
                push,
                poll_interval_ms,
            } => format!(
                "configure({}, {})",
                push.map(|p| p.to_string()).unwrap_or_else(|| "null".into()),
                poll_interval_ms
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "null".into())
            ),
            Mutation::Detach => "detach()".into(),
            Mutation::SetFavicon { href } => format!("setFavicon({})", js_string(href)),
        }
    }
}

/// Serialize a flushed batch into one response body.
pub fn serialize_batch(batch: &[Mutation]) -> String {
    batch
        .iter()
        .map(Mutation::to_js)
        .collect::<Vec<_>>()
        .join(";\n")
}

/// Quote `s` as a JavaScript string literal.
pub fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string())
        .to_string()
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

/// `undefined` (send everything) or a JSON array of attribute names.
pub(crate) fn js_attr_list(attrs: Option<&[String]>) -> String {
    match attrs {
        None => "undefined".into(),
        Some(attrs) => {
            let quoted: Vec<String> = attrs.iter().map(|a| js_string(a)).collect();
            format!("[{}]", quoted.join(", "))
        }
    }
}
