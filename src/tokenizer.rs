//! Rewrites callback-binding markers into dispatch calls.
//!
//! A marker looks like `<prefix>-onclick="add(1, -1)"`, optionally with a
//! restricted attribute list: `<prefix>-onkeyup(key, target)="typed"`. The
//! quoted part is the callback source: the name of a bound handler,
//! optionally followed by a parenthesized list of JSON literals. Source
//! text is never evaluated. It is parsed into a [`CallSpec`] and the browser
//! only ever sees an opaque [`Token`].
use std::collections::HashMap;
use std::str::FromStr;

use bui_longpoll_types::Token;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::callback::CurrentHandler;
use crate::errors::{Error, Result};
use crate::mutation::{js_attr_list, Mutation};

/// A parsed callback source.
#[derive(Clone, Debug, PartialEq)]
pub struct CallSpec {
    /// Name of the handler in the page environment.
    pub name: String,
    /// Literal arguments passed through [`crate::Context::args`].
    pub args: Vec<Value>,
}

impl FromStr for CallSpec {
    type Err = Error;
    fn from_str(source: &str) -> Result<Self> {
        let invalid = || Error::InvalidBinding(source.to_string());
        let s = source.trim();
        let name_len = s
            .char_indices()
            .find(|&(i, c)| !(c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit())))
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        if name_len == 0 {
            return Err(invalid());
        }
        let (name, rest) = s.split_at(name_len);
        let rest = rest.trim();
        let args = if rest.is_empty() {
            Vec::new()
        } else {
            let inner = rest
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .ok_or_else(invalid)?;
            serde_json::from_str::<Vec<Value>>(&format!("[{}]", inner)).map_err(|_| invalid())?
        };
        Ok(CallSpec {
            name: name.to_string(),
            args,
        })
    }
}

/// What a token resolves to.
#[derive(Clone)]
pub(crate) enum TokenTarget {
    Event(CallSpec),
    Current(Box<dyn CurrentHandler>),
}

/// Bidirectional token map of one page.
///
/// Identical source text always maps to the same event token; tokens of
/// each kind are allocated monotonically and never reused.
#[derive(Clone, Default)]
pub struct TokenMap {
    by_source: HashMap<String, Token>,
    targets: HashMap<Token, TokenTarget>,
    next_event: u32,
    next_current: u32,
}

impl TokenMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for callback `source`, allocating one on first use.
    pub fn event_token(&mut self, source: &str) -> Result<Token> {
        if let Some(token) = self.by_source.get(source) {
            return Ok(*token);
        }
        let spec: CallSpec = source.parse()?;
        let token = Token::Event(self.next_event);
        self.next_event += 1;
        self.by_source.insert(source.to_string(), token);
        self.targets.insert(token, TokenTarget::Event(spec));
        Ok(token)
    }

    pub(crate) fn register_current(&mut self, handler: Box<dyn CurrentHandler>) -> Token {
        let token = Token::Current(self.next_current);
        self.next_current += 1;
        self.targets.insert(token, TokenTarget::Current(handler));
        token
    }

    /// The parsed source behind an event token.
    pub fn call_spec(&self, token: &Token) -> Option<&CallSpec> {
        match self.targets.get(token) {
            Some(TokenTarget::Event(spec)) => Some(spec),
            _ => None,
        }
    }

    pub(crate) fn resolve(&self, token: &Token) -> Option<&TokenTarget> {
        self.targets.get(token)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Scans HTML for markers of one binding prefix.
#[derive(Debug)]
pub struct Tokenizer {
    prefix: String,
    marker: Regex,
    listener: Regex,
}

impl Tokenizer {
    pub fn new(prefix: &str) -> Result<Self> {
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::InvalidBinding(prefix.to_string()));
        }
        let p = regex::escape(prefix);
        let marker = Regex::new(&format!(
            r#" {}-(?P<event>on[a-zA-Z0-9]*)(\((?P<attrs>[a-zA-Z0-9, ]*)\))?=(?:"(?P<dq>[^"]*)"|'(?P<sq>[^']*)')"#,
            p
        ))
        .map_err(|_| Error::InvalidBinding(prefix.to_string()))?;
        let listener = Regex::new(&format!(
            r"^{}-on(?P<event>[a-zA-Z0-9]+)(\((?P<attrs>[a-zA-Z0-9, ]*)\))?$",
            p
        ))
        .map_err(|_| Error::InvalidBinding(prefix.to_string()))?;
        Ok(Tokenizer {
            prefix: prefix.to_string(),
            marker,
            listener,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Rewrite every marker in `html`, registering its source in `map`.
    pub fn tokenize(&self, html: &str, map: &mut TokenMap) -> Result<String> {
        let mut out = String::with_capacity(html.len());
        let mut last = 0;
        for caps in self.marker.captures_iter(html) {
            let Some(whole) = caps.get(0) else { continue };
            let source = caps
                .name("dq")
                .or_else(|| caps.name("sq"))
                .map(|m| m.as_str())
                .unwrap_or("");
            let token = map.event_token(source)?;
            let event = caps.name("event").map(|m| m.as_str()).unwrap_or("");
            out.push_str(&html[last..whole.start()]);
            out.push_str(&format!(
                " {}=\"sendEvent('{}', event, this, {})\"",
                event,
                token,
                html_attr_list(attr_list(&caps).as_deref())
            ));
            last = whole.end();
        }
        out.push_str(&html[last..]);
        Ok(out)
    }

    /// True if `name` follows the `<prefix>-on...` global listener convention.
    pub fn is_listener_name(&self, name: &str) -> bool {
        name.starts_with(&format!("{}-on", self.prefix))
    }

    /// Build the registration of a page-wide listener declared as
    /// `<prefix>-on<event>[(attrs)]` bound to callback `source`.
    pub fn global_listener(&self, name: &str, source: &str, map: &mut TokenMap) -> Result<Mutation> {
        let caps = self
            .listener
            .captures(name)
            .ok_or_else(|| Error::InvalidListener(name.to_string()))?;
        let event = caps
            .name("event")
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| Error::InvalidListener(name.to_string()))?;
        let token = map.event_token(source)?;
        Ok(Mutation::AddGlobalListener {
            event,
            token,
            attrs: attr_list(&caps),
        })
    }
}

fn attr_list(caps: &Captures<'_>) -> Option<Vec<String>> {
    caps.name("attrs").map(|m| {
        m.as_str()
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from)
            .collect()
    })
}

// Inside a double-quoted HTML attribute; names are alphanumeric.
fn html_attr_list(attrs: Option<&[String]>) -> String {
    match attrs {
        None => js_attr_list(None),
        Some(attrs) => {
            let quoted: Vec<String> = attrs.iter().map(|a| format!("'{}'", a)).collect();
            format!("[{}]", quoted.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> Tokenizer {
        Tokenizer::new("rust").unwrap()
    }

    #[test]
    fn rewrites_markers() {
        let mut map = TokenMap::new();
        let html = r#"<p id="g" rust-onclick="clicked">x</p>"#;
        let out = tokenizer().tokenize(html, &mut map).unwrap();
        assert_eq!(
            out,
            r#"<p id="g" onclick="sendEvent('T(0)', event, this, undefined)">x</p>"#
        );
        assert_eq!(
            map.call_spec(&Token::Event(0)).unwrap(),
            &CallSpec {
                name: "clicked".into(),
                args: vec![]
            }
        );
    }

    #[test]
    fn attribute_lists() {
        let mut map = TokenMap::new();
        let t = tokenizer();
        let out = t
            .tokenize(
                r#"<input rust-onkeyup(key, target)="typed"/><b rust-onclick()='add(1, "x")'>"#,
                &mut map,
            )
            .unwrap();
        assert_eq!(
            out,
            r#"<input onkeyup="sendEvent('T(0)', event, this, ['key', 'target'])"/><b onclick="sendEvent('T(1)', event, this, [])">"#
        );
        assert_eq!(
            map.call_spec(&Token::Event(1)).unwrap().args,
            vec![Value::from(1), Value::from("x")]
        );
    }

    #[test]
    fn dedups_identical_sources() {
        let mut map = TokenMap::new();
        let t = tokenizer();
        let sources = ["a", "b(1)", "a", "b(2)", "b(1)", "c"];
        let tokens: Vec<Token> = sources
            .iter()
            .map(|s| map.event_token(s).unwrap())
            .collect();
        assert_eq!(tokens[0], tokens[2]);
        assert_eq!(tokens[1], tokens[4]);
        let mut distinct = vec![tokens[0], tokens[1], tokens[3], tokens[5]];
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), 4);

        // tokenizing more content keeps earlier assignments
        let out = t.tokenize(r#"<a rust-onclick="c">"#, &mut map).unwrap();
        assert!(out.contains(&format!("'{}'", tokens[5])));
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn other_prefixes_untouched() {
        let mut map = TokenMap::new();
        let html = r#"<p python-onclick="x" rust-onclick="">"#;
        assert!(tokenizer().tokenize(html, &mut map).is_err());
        let html = r#"<p python-onclick="x">"#;
        assert_eq!(tokenizer().tokenize(html, &mut map).unwrap(), html);
    }

    #[test]
    fn rejects_bad_sources() {
        for bad in ["", "1abc", "f(", "f(x)", "f() g", "f(1,)", "a.b"] {
            assert!(bad.parse::<CallSpec>().is_err(), "{:?}", bad);
        }
        let spec: CallSpec = " go ( [1, 2], null ) ".parse().unwrap();
        assert_eq!(spec.name, "go");
        assert_eq!(spec.args.len(), 2);
    }

    #[test]
    fn global_listener() {
        let mut map = TokenMap::new();
        let t = tokenizer();
        assert!(t.is_listener_name("rust-onkeydown(key)"));
        let m = t
            .global_listener("rust-onkeydown(key)", "key_down", &mut map)
            .unwrap();
        assert_eq!(
            m,
            Mutation::AddGlobalListener {
                event: "keydown".into(),
                token: Token::Event(0),
                attrs: Some(vec!["key".into()]),
            }
        );
        assert!(t.global_listener("rust-on", "key_down", &mut map).is_err());
        assert!(t.global_listener("rust-onkey down", "x", &mut map).is_err());
    }
}
