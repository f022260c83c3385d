use crate::{Error, HttpRequest, Result};

const CRLF: u64 = 2;

/// Validated target URL plus the `Host` value the client adds when missing.
pub(crate) struct PreparedTarget {
    pub(crate) uri: hyper::Uri,
    pub(crate) host: Option<String>,
}

pub(crate) fn prepare_target(url: &str) -> Result<PreparedTarget> {
    let parsed = url::Url::parse(url).map_err(|_| Error::InvalidUrl(url.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Error::UnsupportedScheme(url.to_string()));
    }
    let uri: hyper::Uri = url
        .parse()
        .map_err(|_| Error::InvalidUrl(url.to_string()))?;

    let host = parsed.host_str().map(|host| match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    });
    Ok(PreparedTarget { uri, host })
}

pub(crate) fn has_header(headers: &[(String, String)], name: &str) -> bool {
    headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
}

/// Bytes the client puts on the wire for `req` as HTTP/1.1.
///
/// `Host` and `Content-Length` are counted when the client adds them implicitly.
pub fn request_wire_size(req: &HttpRequest) -> Result<u64> {
    let target = prepare_target(&req.url)?;
    Ok(request_size(req, &target))
}

pub(crate) fn request_size(req: &HttpRequest, target: &PreparedTarget) -> u64 {
    let path = target
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    // METHOD SP path SP HTTP/1.1 CRLF
    let request_line = req.method.as_str().len() + 1 + path.len() + 1 + "HTTP/1.1".len();
    let mut total = request_line as u64 + CRLF;

    total += req
        .headers
        .iter()
        .map(|(k, v)| header_size(k.as_bytes(), v.as_bytes()))
        .sum::<u64>();

    if !has_header(&req.headers, "host")
        && let Some(host) = &target.host
    {
        total += header_size(b"host", host.as_bytes());
    }
    if !req.body.is_empty() && !has_header(&req.headers, "content-length") {
        total += header_size(b"content-length", req.body.len().to_string().as_bytes());
    }

    total + CRLF + req.body.len() as u64
}

/// Status line + headers + blank line. The reason phrase is not counted.
pub(crate) fn response_head_size(
    version: http::Version,
    status: http::StatusCode,
    headers: &http::HeaderMap,
) -> u64 {
    let version = match version {
        http::Version::HTTP_10 => "HTTP/1.0",
        http::Version::HTTP_2 => "HTTP/2",
        http::Version::HTTP_3 => "HTTP/3",
        _ => "HTTP/1.1",
    };
    let status_line = (version.len() + 1 + status.as_str().len()) as u64 + CRLF;

    let headers: u64 = headers
        .iter()
        .map(|(name, value)| header_size(name.as_str().as_bytes(), value.as_bytes()))
        .sum();

    status_line + headers + CRLF
}

// name ": " value CRLF
fn header_size(name: &[u8], value: &[u8]) -> u64 {
    (name.len() + 2 + value.len()) as u64 + CRLF
}
