//! Wire vocabulary of the tunnel.
//!
//! | request                       | success response                          |
//! |-------------------------------|-------------------------------------------|
//! | `POST /http-tunnel/open`      | `201`, `Set-Cookie: tunnel-id=<id>`       |
//! | `POST /http-tunnel/send`      | `200`, empty body                         |
//! | `GET /http-tunnel/poll`       | `200` with data, or `204` as a ping       |
//! | `POST /http-tunnel/close`     | tunnel closed                             |
//!
//! "Tunnel closed" is `205 Reset Content` with `Connection: close`; a
//! rejection is `400` with a plain-text reason and `Connection: close`.
//! Every request carries the configured `User-Agent`, and every request
//! after `open` carries the tunnel id in a `Cookie` header.

use std::net::SocketAddr;

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};

use crate::{error::TunnelError, tunnel_id::TunnelId};

pub const OPEN_TUNNEL_PATH: &str = "/http-tunnel/open";
pub const SEND_DATA_PATH: &str = "/http-tunnel/send";
pub const RECEIVE_DATA_PATH: &str = "/http-tunnel/poll";
pub const CLOSE_TUNNEL_PATH: &str = "/http-tunnel/close";

pub const TUNNEL_ID_COOKIE: &str = "tunnel-id";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Largest body carried by a single send request or poll response.
pub const MAX_BODY_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    OpenTunnel,
    SendData,
    ReceiveData,
    CloseTunnel,
}

impl RequestKind {
    const ALL: [RequestKind; 4] = [
        RequestKind::OpenTunnel,
        RequestKind::SendData,
        RequestKind::ReceiveData,
        RequestKind::CloseTunnel,
    ];

    pub fn method(&self) -> Method {
        match self {
            Self::ReceiveData => Method::GET,
            _ => Method::POST,
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Self::OpenTunnel => OPEN_TUNNEL_PATH,
            Self::SendData => SEND_DATA_PATH,
            Self::ReceiveData => RECEIVE_DATA_PATH,
            Self::CloseTunnel => CLOSE_TUNNEL_PATH,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::OpenTunnel => "open",
            Self::SendData => "send",
            Self::ReceiveData => "poll",
            Self::CloseTunnel => "close",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    TunnelOpened(TunnelId),
    /// `200`; poll responses carry data, send acknowledgements are empty.
    Data(Bytes),
    Ping,
    TunnelClosed,
    ProxyAuthRequired,
    Rejected(String),
    Unexpected(StatusCode),
}

/// Where requests are addressed: straight at the tunnel server, or through
/// a forward proxy that needs absolute-form request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    host: String,
    absolute: bool,
}

impl RequestTarget {
    pub fn direct(server: SocketAddr) -> Self {
        Self {
            host: host_string(server),
            absolute: false,
        }
    }

    pub fn via_proxy(server: SocketAddr) -> Self {
        Self {
            host: host_string(server),
            absolute: true,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn uri(&self, path: &str) -> String {
        if self.absolute {
            format!("http://{}{}", self.host, path)
        } else {
            path.to_string()
        }
    }
}

/// `host:port`, with IPv6 hosts bracketed.
pub fn host_string(addr: SocketAddr) -> String {
    addr.to_string()
}

pub fn open_tunnel_request(
    target: &RequestTarget,
    user_agent: &str,
) -> Result<Request<Bytes>, TunnelError> {
    build_request(RequestKind::OpenTunnel, target, None, Bytes::new(), user_agent)
}

pub fn send_data_request(
    target: &RequestTarget,
    tunnel_id: &TunnelId,
    data: Bytes,
    user_agent: &str,
) -> Result<Request<Bytes>, TunnelError> {
    build_request(RequestKind::SendData, target, Some(tunnel_id), data, user_agent)
}

pub fn receive_data_request(
    target: &RequestTarget,
    tunnel_id: &TunnelId,
    user_agent: &str,
) -> Result<Request<Bytes>, TunnelError> {
    build_request(
        RequestKind::ReceiveData,
        target,
        Some(tunnel_id),
        Bytes::new(),
        user_agent,
    )
}

pub fn close_tunnel_request(
    target: &RequestTarget,
    tunnel_id: &TunnelId,
    user_agent: &str,
) -> Result<Request<Bytes>, TunnelError> {
    build_request(
        RequestKind::CloseTunnel,
        target,
        Some(tunnel_id),
        Bytes::new(),
        user_agent,
    )
}

fn build_request(
    kind: RequestKind,
    target: &RequestTarget,
    tunnel_id: Option<&TunnelId>,
    body: Bytes,
    user_agent: &str,
) -> Result<Request<Bytes>, TunnelError> {
    let mut builder = Request::builder()
        .method(kind.method())
        .uri(target.uri(kind.path()))
        .header(header::HOST, target.host())
        .header(header::USER_AGENT, user_agent);
    if let Some(tunnel_id) = tunnel_id {
        builder = builder.header(header::COOKIE, format!("{TUNNEL_ID_COOKIE}={tunnel_id}"));
    }
    if kind.method() == Method::POST {
        builder = builder.header(header::CONTENT_LENGTH, body.len());
    }
    if !body.is_empty() {
        builder = builder.header(header::CONTENT_TYPE, OCTET_STREAM);
    }
    Ok(builder.body(body)?)
}

/// Identifies a tunnel request; anything with the wrong method, path or
/// user agent is not one.
pub fn classify_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    user_agent: &str,
) -> Option<RequestKind> {
    let agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok());
    if agent != Some(user_agent) {
        return None;
    }
    RequestKind::ALL
        .into_iter()
        .find(|kind| kind.method() == method && kind.path() == uri.path())
}

/// Reads the tunnel id from the request's `Cookie` headers.
pub fn extract_tunnel_id(headers: &HeaderMap) -> Option<TunnelId> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| name.trim() == TUNNEL_ID_COOKIE)
        .map(|(_, value)| TunnelId::from(value.trim()))
        .filter(|id| !id.as_str().is_empty())
}

/// Reads the tunnel id from the `Set-Cookie` header of an open response.
pub fn extract_opened_tunnel_id(headers: &HeaderMap) -> Option<TunnelId> {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| name.trim() == TUNNEL_ID_COOKIE)
        .map(|(_, value)| TunnelId::from(value.trim()))
        .filter(|id| !id.as_str().is_empty())
}

pub fn tunnel_opened_response(tunnel_id: &TunnelId) -> Result<Response<Bytes>, TunnelError> {
    let cookie = HeaderValue::from_str(&format!("{TUNNEL_ID_COOKIE}={tunnel_id}"))
        .map_err(|err| TunnelError::protocol(format!("unusable tunnel id {tunnel_id}: {err}")))?;
    let mut response = status_response(StatusCode::CREATED, Bytes::new());
    response.headers_mut().insert(header::SET_COOKIE, cookie);
    Ok(response)
}

pub fn send_data_accepted_response() -> Response<Bytes> {
    status_response(StatusCode::OK, Bytes::new())
}

pub fn receive_data_response(data: Bytes) -> Response<Bytes> {
    let mut response = status_response(StatusCode::OK, data);
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));
    response
}

pub fn ping_response() -> Response<Bytes> {
    status_response(StatusCode::NO_CONTENT, Bytes::new())
}

pub fn tunnel_closed_response() -> Response<Bytes> {
    let mut response = status_response(StatusCode::RESET_CONTENT, Bytes::new());
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

pub fn rejection_response(reason: impl Into<String>) -> Response<Bytes> {
    let mut response = status_response(StatusCode::BAD_REQUEST, Bytes::from(reason.into()));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

fn status_response(status: StatusCode, body: Bytes) -> Response<Bytes> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

pub fn classify_response(response: Response<Bytes>) -> ResponseKind {
    let (parts, body) = response.into_parts();
    match parts.status {
        StatusCode::CREATED => extract_opened_tunnel_id(&parts.headers)
            .map(ResponseKind::TunnelOpened)
            .unwrap_or(ResponseKind::Unexpected(parts.status)),
        StatusCode::OK => ResponseKind::Data(body),
        StatusCode::NO_CONTENT => ResponseKind::Ping,
        StatusCode::RESET_CONTENT => ResponseKind::TunnelClosed,
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => ResponseKind::ProxyAuthRequired,
        StatusCode::BAD_REQUEST => {
            ResponseKind::Rejected(String::from_utf8_lossy(&body).into_owned())
        }
        other => ResponseKind::Unexpected(other),
    }
}

/// Splits `data` into chunks of at most `max` bytes without copying.
pub fn split_fragments(mut data: Bytes, max: usize) -> Vec<Bytes> {
    if data.len() <= max {
        return vec![data];
    }
    let mut fragments = Vec::with_capacity(data.len().div_ceil(max));
    while data.len() > max {
        fragments.push(data.split_to(max));
    }
    if !data.is_empty() {
        fragments.push(data);
    }
    fragments
}

/// Copies a request so it can be sent again on a fresh connection.
pub fn duplicate_request(request: &Request<Bytes>) -> Request<Bytes> {
    let mut copy = Request::new(request.body().clone());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    #[test]
    fn requests_carry_agent_host_and_cookie() {
        let id = TunnelId::from("abc_1");
        let request = send_data_request(
            &RequestTarget::direct(server()),
            &id,
            Bytes::from_static(b"hello"),
            "HttpTunnel",
        )
        .unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri(), SEND_DATA_PATH);
        assert_eq!(request.headers()[header::HOST], "127.0.0.1:8080");
        assert_eq!(request.headers()[header::CONTENT_TYPE], OCTET_STREAM);
        assert_eq!(request.headers()[header::CONTENT_LENGTH], "5");
        assert_eq!(extract_tunnel_id(request.headers()), Some(id));
        assert_eq!(
            classify_request(
                request.method(),
                request.uri(),
                request.headers(),
                "HttpTunnel"
            ),
            Some(RequestKind::SendData)
        );
        assert_eq!(
            classify_request(request.method(), request.uri(), request.headers(), "Other"),
            None
        );
    }

    #[test]
    fn proxied_requests_use_absolute_targets() {
        let id = TunnelId::from("abc_2");
        let request =
            receive_data_request(&RequestTarget::via_proxy(server()), &id, "HttpTunnel").unwrap();
        assert_eq!(request.method(), Method::GET);
        assert_eq!(
            request.uri().to_string(),
            "http://127.0.0.1:8080/http-tunnel/poll"
        );
        assert_eq!(
            classify_request(
                request.method(),
                request.uri(),
                request.headers(),
                "HttpTunnel"
            ),
            Some(RequestKind::ReceiveData)
        );
    }

    #[test]
    fn wrong_method_is_not_a_tunnel_request() {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static("HttpTunnel"));
        let uri: Uri = OPEN_TUNNEL_PATH.parse().unwrap();
        assert_eq!(classify_request(&Method::GET, &uri, &headers, "HttpTunnel"), None);
        assert_eq!(
            classify_request(&Method::POST, &uri, &headers, "HttpTunnel"),
            Some(RequestKind::OpenTunnel)
        );
    }

    #[test]
    fn finds_tunnel_cookie_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("session=1; tunnel-id=ff_7; theme=dark"),
        );
        assert_eq!(extract_tunnel_id(&headers), Some(TunnelId::from("ff_7")));

        headers.insert(header::COOKIE, HeaderValue::from_static("tunnel-id="));
        assert_eq!(extract_tunnel_id(&headers), None);
    }

    #[test]
    fn classifies_server_responses() {
        let id = TunnelId::from("ff_3");
        assert_eq!(
            classify_response(tunnel_opened_response(&id).unwrap()),
            ResponseKind::TunnelOpened(id)
        );
        assert_eq!(classify_response(ping_response()), ResponseKind::Ping);
        assert_eq!(
            classify_response(receive_data_response(Bytes::from_static(b"xyz"))),
            ResponseKind::Data(Bytes::from_static(b"xyz"))
        );
        let closed = tunnel_closed_response();
        assert_eq!(closed.headers()[header::CONNECTION], "close");
        assert_eq!(classify_response(closed), ResponseKind::TunnelClosed);
        let rejected = rejection_response("Send data requests must contain data");
        assert_eq!(rejected.headers()[header::CONNECTION], "close");
        assert_eq!(
            classify_response(rejected),
            ResponseKind::Rejected("Send data requests must contain data".into())
        );
    }

    #[test]
    fn splits_into_bounded_fragments() {
        let data = Bytes::from(vec![7u8; MAX_BODY_SIZE * 2 + 10]);
        let fragments = split_fragments(data, MAX_BODY_SIZE);
        let sizes: Vec<_> = fragments.iter().map(Bytes::len).collect();
        assert_eq!(sizes, vec![MAX_BODY_SIZE, MAX_BODY_SIZE, 10]);

        let exact = split_fragments(Bytes::from(vec![1u8; MAX_BODY_SIZE]), MAX_BODY_SIZE);
        assert_eq!(exact.len(), 1);
    }
}
