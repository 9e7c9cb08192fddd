//! DNS over HTTPS (RFC 8484).
//!
//! The frontend terminates TLS itself and speaks just enough HTTP/1.1 for
//! the two RFC 8484 forms: `GET ?dns=<base64url>` and `POST` with an
//! `application/dns-message` body.  Decoded queries feed the same dispatch
//! path as UDP and TCP; replies come back as `application/dns-message`.

use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use camino::Utf8Path;

/// The RFC 8484 media type.
pub const DNS_MESSAGE: &str = "application/dns-message";

/// Upper bound on the request head (request line plus headers).
const MAX_HEAD: usize = 8 * 1024;

/// Upper bound on a POST body; a DNS query is far smaller.
const MAX_BODY: usize = 64 * 1024;

//----------- TLS setup --------------------------------------------------------

/// Load the PEM certificate chain and key and build the TLS acceptor.
pub fn tls_acceptor(cert: &Utf8Path, key: &Utf8Path) -> Result<TlsAcceptor, String> {
    let cert_file = std::fs::File::open(cert)
        .map_err(|err| format!("cannot open certificate '{cert}': {err}"))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|err| format!("cannot parse certificate '{cert}': {err}"))?;

    let key_file =
        std::fs::File::open(key).map_err(|err| format!("cannot open key '{key}': {err}"))?;
    let key: PrivateKeyDer = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .map_err(|err| format!("cannot parse key '{key}': {err}"))?
        .ok_or_else(|| format!("no private key found in '{key}'"))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| format!("TLS configuration rejected: {err}"))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

//----------- HttpRequest ------------------------------------------------------

/// The parts of an HTTP/1.1 request this frontend cares about.
#[derive(Clone, Debug, Default)]
pub struct HttpRequest {
    pub method: String,
    /// The path without the query string.
    pub path: String,
    /// The raw query string, if any.
    pub query: Option<String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Read one request from the stream.
pub async fn read_request<S>(reader: &mut BufReader<S>) -> Result<HttpRequest, DohError>
where
    S: AsyncReadExt + Unpin,
{
    let mut request = HttpRequest::default();
    let mut head = 0usize;

    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .map_err(|_| DohError::BadRequest("unreadable request line"))?;
    head += line.len();

    let mut parts = line.split_whitespace();
    request.method = parts
        .next()
        .ok_or(DohError::BadRequest("missing method"))?
        .to_string();
    let target = parts.next().ok_or(DohError::BadRequest("missing path"))?;
    match parts.next() {
        Some(version) if version.starts_with("HTTP/1.") => {}
        _ => return Err(DohError::BadRequest("not HTTP/1.x")),
    }
    match target.split_once('?') {
        Some((path, query)) => {
            request.path = path.to_string();
            request.query = Some(query.to_string());
        }
        None => request.path = target.to_string(),
    }

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .await
            .map_err(|_| DohError::BadRequest("unreadable header"))?;
        head += line.len();
        if head > MAX_HEAD {
            return Err(DohError::BadRequest("request head too large"));
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(DohError::BadRequest("malformed header"));
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value
                .parse()
                .map_err(|_| DohError::BadRequest("bad content-length"))?;
        } else if name.eq_ignore_ascii_case("content-type") {
            request.content_type = Some(value.to_ascii_lowercase());
        }
    }

    if content_length > MAX_BODY {
        return Err(DohError::BadRequest("body too large"));
    }
    if content_length > 0 {
        let mut body = vec![0u8; content_length];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|_| DohError::BadRequest("short body"))?;
        request.body = body;
    }
    Ok(request)
}

/// Extract the wire-format DNS query from a request against the configured
/// path.
pub fn extract_query(request: &HttpRequest, configured_path: &str) -> Result<Vec<u8>, DohError> {
    if request.path != configured_path {
        return Err(DohError::NotFound);
    }

    match request.method.as_str() {
        "GET" => {
            use base64::Engine;

            let query = request.query.as_deref().unwrap_or("");
            let dns = query
                .split('&')
                .find_map(|pair| pair.strip_prefix("dns="))
                .ok_or(DohError::BadRequest("missing dns parameter"))?;
            base64::engine::general_purpose::URL_SAFE_NO_PAD
                .decode(dns)
                .map_err(|_| DohError::BadRequest("dns parameter is not base64url"))
        }
        "POST" => {
            if request.content_type.as_deref() != Some(DNS_MESSAGE) {
                return Err(DohError::BadRequest("unexpected content type"));
            }
            if request.body.is_empty() {
                return Err(DohError::BadRequest("empty body"));
            }
            Ok(request.body.clone())
        }
        _ => Err(DohError::MethodNotAllowed),
    }
}

/// Write a response and flush.
pub async fn write_response<S>(
    stream: &mut S,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\ncontent-type: {content_type}\r\n\
         content-length: {}\r\nconnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

//----------- DohError ---------------------------------------------------------

/// A request this frontend refuses, mapped onto an HTTP status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DohError {
    BadRequest(&'static str),
    NotFound,
    MethodNotAllowed,
    Forbidden,
    Internal,
}

impl DohError {
    pub fn status(self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::Forbidden => 403,
            Self::Internal => 500,
        }
    }

    pub fn body(self) -> &'static str {
        match self {
            Self::BadRequest(reason) => reason,
            Self::NotFound => "no such resource",
            Self::MethodNotAllowed => "use GET or POST",
            Self::Forbidden => "access denied",
            Self::Internal => "internal error",
        }
    }
}

impl fmt::Display for DohError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.body(), self.status())
    }
}

impl std::error::Error for DohError {}
