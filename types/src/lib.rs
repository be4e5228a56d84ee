//! Wire types shared by the `bui-longpoll` server and anything that talks to it.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Prefix carried by every session identifier.
///
/// The transport uses it to tell a session path apart from an arbitrary
/// path requested by a browser opening a new session.
pub const SESSION_ID_PREFIX: &str = ".session-";

/// Identifier for each session (one per client browser page load).
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Create a new, time-derived session identifier.
    ///
    /// The random suffix keeps identifiers unique when two sessions start
    /// within the same microsecond and makes them hard to guess.
    #[cfg(feature = "uuid-v4")]
    pub fn generate() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        SessionId(format!(
            "{}{}.{:06}-{}",
            SESSION_ID_PREFIX,
            now.as_secs(),
            now.subsec_micros(),
            &suffix[..12]
        ))
    }

    /// Returns true if `s` looks like an identifier created by [`SessionId::generate`].
    pub fn is_valid(s: &str) -> bool {
        match s.strip_prefix(SESSION_ID_PREFIX) {
            Some(rest) => {
                !rest.is_empty()
                    && rest
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
            }
            None => false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionId {
    type Err = InvalidSessionId;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if SessionId::is_valid(s) {
            Ok(SessionId(s.to_string()))
        } else {
            Err(InvalidSessionId)
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The string did not carry a valid session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidSessionId;

impl fmt::Display for InvalidSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid session id")
    }
}

impl std::error::Error for InvalidSessionId {}

/// Opaque per-page identifier sent by the browser in place of a callback.
///
/// Serialized on the wire as `T(n)` for event callbacks and `C(n)` for
/// batched "read current values" requests.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum Token {
    Event(u32),
    Current(u32),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Event(n) => write!(f, "T({})", n),
            Token::Current(n) => write!(f, "C({})", n),
        }
    }
}

impl FromStr for Token {
    type Err = InvalidToken;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = s.get(..2).ok_or(InvalidToken)?;
        let rest = s.get(2..).ok_or(InvalidToken)?;
        let digits = rest.strip_suffix(')').ok_or(InvalidToken)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidToken);
        }
        let n: u32 = digits.parse().map_err(|_| InvalidToken)?;
        let token = match kind {
            "T(" => Token::Event(n),
            "C(" => Token::Current(n),
            _ => return Err(InvalidToken),
        };
        // reject non-canonical spellings such as `T(007)`
        if token.to_string() != s {
            return Err(InvalidToken);
        }
        Ok(token)
    }
}

/// The string is not a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidToken;

impl fmt::Display for InvalidToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid token")
    }
}

impl std::error::Error for InvalidToken {}

/// Body POSTed by the browser for an event callback.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EventEnvelope {
    /// Serialized DOM event, optionally with `target` and `elt` members.
    #[serde(default)]
    pub event: serde_json::Value,
}

/// Current values read from the browser, keyed by the requested name.
pub type CurrentValues = BTreeMap<String, serde_json::Value>;

/// Body POSTed by the browser in reply to a "read current values" request.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CurrentEnvelope {
    pub current_dict: CurrentValues,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_wire_format() {
        assert_eq!(Token::Event(12).to_string(), "T(12)");
        assert_eq!("C(0)".parse::<Token>(), Ok(Token::Current(0)));
        assert!("T(01)".parse::<Token>().is_err());
        assert!("T(1) ".parse::<Token>().is_err());
        assert!("X(1)".parse::<Token>().is_err());
        assert!("T()".parse::<Token>().is_err());
    }

    #[cfg(feature = "uuid-v4")]
    #[test]
    fn session_id_prefix() {
        let id = SessionId::generate();
        assert!(SessionId::is_valid(id.as_str()));
        assert!(!SessionId::is_valid("session-1"));
        assert!(!SessionId::is_valid(".session-"));
        assert!(!SessionId::is_valid(".session-1/2"));
        assert_ne!(SessionId::generate(), SessionId::generate());
    }
}
