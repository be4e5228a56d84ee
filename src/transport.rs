//! Minimal HTTP/1.1 over one kept-alive connection.
//!
//! Only what the bootstrap script sends is understood: `GET` and `POST`,
//! bodies delimited by `Content-Length`, and several requests pipelined on
//! the same stream.
use bytes::{Buf, Bytes, BytesMut};
use http::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::Config;
use crate::errors::TransportError;

/// Body of the 404 sent when no admission is pending.
pub const NOT_TAKING_SESSIONS: &str = "not taking new sessions right now";

const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

const READ_CHUNK: usize = 4096;

/// One parsed request.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    /// Raw request target, still percent-encoded.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Request {
    /// Value of the first header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A connection and the bytes read from it but not consumed yet.
pub struct HttpConnection<S> {
    stream: S,
    buf: BytesMut,
    server_name: String,
    max_header_bytes: usize,
    max_body_bytes: usize,
}

impl<S> HttpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, config: &Config) -> Self {
        HttpConnection {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK),
            server_name: config.server_name.clone(),
            max_header_bytes: config.max_header_bytes,
            max_body_bytes: config.max_body_bytes,
        }
    }

    /// Read more bytes into the buffer; returns false on EOF.
    async fn fill(&mut self) -> Result<bool, TransportError> {
        self.buf.reserve(READ_CHUNK);
        let n = self.stream.read_buf(&mut self.buf).await?;
        Ok(n > 0)
    }

    /// Read the next request. `Ok(None)` means the peer closed the
    /// connection between requests.
    pub async fn read_request(&mut self) -> Result<Option<Request>, TransportError> {
        let head_len = loop {
            // tolerate stray line breaks between pipelined requests
            while self.buf.starts_with(b"\r\n") || self.buf.starts_with(b"\n") {
                let n = if self.buf[0] == b'\r' { 2 } else { 1 };
                self.buf.advance(n);
            }
            if let Some(pos) = find_head_end(&self.buf) {
                break pos;
            }
            if self.buf.len() > self.max_header_bytes {
                return Err(TransportError::HeadersTooLarge(self.max_header_bytes));
            }
            if !self.fill().await? {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(TransportError::UnexpectedEof)
                };
            }
        };
        if head_len > self.max_header_bytes {
            return Err(TransportError::HeadersTooLarge(self.max_header_bytes));
        }

        let head = self.buf.split_to(head_len);
        let text = String::from_utf8_lossy(&head);
        let mut lines = text.split('\n').map(|l| l.trim_end_matches('\r'));

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let (method, path, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(m), Some(p), Some(v), None) if !m.is_empty() && p.starts_with('/') => (m, p, v),
            _ => return Err(TransportError::RequestLine(request_line.to_string())),
        };
        if !version.starts_with("HTTP/1.") {
            return Err(TransportError::RequestLine(request_line.to_string()));
        }
        let method = match method {
            "GET" => Method::GET,
            "POST" => Method::POST,
            other => return Err(TransportError::Method(other.to_string())),
        };

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line.split_once(':').ok_or(TransportError::Header)?;
            if name.is_empty() || name.contains(' ') {
                return Err(TransportError::Header);
            }
            headers.push((name.to_string(), value.trim().to_string()));
        }

        let mut request = Request {
            method,
            path: path.to_string(),
            headers,
            body: Bytes::new(),
        };

        let body_len = match request.header("content-length") {
            Some(v) => v
                .parse::<usize>()
                .map_err(|_| TransportError::ContentLength(v.to_string()))?,
            None => 0,
        };
        if body_len > self.max_body_bytes {
            return Err(TransportError::BodyTooLarge(body_len));
        }
        while self.buf.len() < body_len {
            if !self.fill().await? {
                return Err(TransportError::UnexpectedEof);
            }
        }
        // anything after the body stays buffered for the next request
        request.body = self.buf.split_to(body_len).freeze();
        trace!("{} {} ({} byte body)", request.method, request.path, body_len);
        Ok(Some(request))
    }

    pub async fn write_response(
        &mut self,
        status: StatusCode,
        content_type: &str,
        body: &[u8],
    ) -> Result<(), TransportError> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nServer: {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            self.server_name
        );
        if status == StatusCode::OK {
            head.push_str("Keep-Alive: timeout=30\r\nConnection: Keep-Alive\r\n");
        }
        head.push_str(&format!(
            "Content-Type: {}\r\nContent-Length: {}\r\n\r\n",
            content_type,
            body.len()
        ));
        self.stream.write_all(head.as_bytes()).await?;
        self.stream.write_all(body).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn write_ok(&mut self, body: &str) -> Result<(), TransportError> {
        self.write_response(StatusCode::OK, HTML_CONTENT_TYPE, body.as_bytes())
            .await
    }

    pub async fn write_not_found(&mut self) -> Result<(), TransportError> {
        self.write_response(
            StatusCode::NOT_FOUND,
            HTML_CONTENT_TYPE,
            NOT_TAKING_SESSIONS.as_bytes(),
        )
        .await
    }
}

/// Length of the request head including the terminating blank line.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
