//! The document sent to a browser opening a new session.
use bui_longpoll_types::SessionId;

use crate::config::{Config, SessionOptions};
use crate::mutation::js_string;

const CLIENT_SCRIPT: &str = include_str!("bootstrap.js");

/// Full HTML document embedding the client script, configured for
/// `session_id`.
pub fn bootstrap_document(session_id: &SessionId, options: &SessionOptions, config: &Config) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
         <link rel=\"icon\" href=\"/{sid}/favicon.ico\"></head><body>\n\
         <div id=\"{root}\"></div>\n\
         <script type=\"text/javascript\">\n\
         var pollIntervalMs = {poll}; // milliseconds, zero disables ticks\n\
         var pushMode = {push};\n\
         var sessionId = {sid_js};\n\
         {script}</script>\n</body></html>\n",
        sid = session_id,
        root = attribute_value(&config.root_element_id),
        poll = options.poll_interval_ms,
        push = options.push,
        sid_js = js_string(session_id.as_str()),
        script = CLIENT_SCRIPT,
    )
}

/// Escape `s` for use inside a double-quoted HTML attribute.
fn attribute_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}
