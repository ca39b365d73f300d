use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use super::{Event, EventSource, Page, RoomId, SessionInfo, SourceError, TransportKind};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Client for the subset of the Matrix client-server API (v3) used by backups.
pub struct MatrixClient {
    http: reqwest::Client,
    homeserver: Url,
    access_token: String,
}

#[derive(Deserialize)]
struct WhoamiResponse {
    user_id: String,
    device_id: Option<String>,
}

#[derive(Deserialize)]
struct JoinedRoomsResponse {
    joined_rooms: Vec<RoomId>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    chunk: Vec<Event>,
    #[serde(default)]
    start: String,
    end: Option<String>,
}

#[derive(Deserialize)]
struct CanonicalAliasContent {
    alias: Option<String>,
}

#[derive(Deserialize)]
struct RoomNameContent {
    name: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    errcode: Option<String>,
    error: Option<String>,
}

impl MatrixClient {
    pub fn new(homeserver: &str, access_token: &str) -> Result<Self, SourceError> {
        let homeserver = Url::parse(homeserver)
            .map_err(|e| SourceError::Other(format!("invalid homeserver URL {homeserver}: {e}")))?;
        if homeserver.cannot_be_a_base() {
            return Err(SourceError::Other(format!(
                "invalid homeserver URL: {homeserver}"
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("matrix-backup/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            homeserver,
            access_token: access_token.to_string(),
        })
    }

    /// Build `<homeserver>/_matrix/client/v3/<segments...>`, percent-encoding each segment.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.homeserver.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(["_matrix", "client", "v3"])
                .extend(segments);
        }
        url
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, SourceError> {
        log::trace!("GET {}", url.path());
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(error_from_body(status.as_u16(), &body));
        }

        let bytes = resp.bytes().await.map_err(from_reqwest)?;
        serde_json::from_slice(&bytes).map_err(|e| SourceError::InvalidResponse(e.to_string()))
    }

    async fn state_event<T: DeserializeOwned>(
        &self,
        room_id: &RoomId,
        event_type: &str,
    ) -> Result<T, SourceError> {
        let url = self.endpoint(&["rooms", room_id.as_str(), "state", event_type, ""]);
        self.get_json(url).await
    }
}

#[async_trait]
impl EventSource for MatrixClient {
    async fn verify_session(&self) -> Result<SessionInfo, SourceError> {
        let resp: WhoamiResponse = self.get_json(self.endpoint(&["account", "whoami"])).await?;
        Ok(SessionInfo {
            user_id: resp.user_id,
            device_id: resp.device_id,
        })
    }

    async fn list_rooms(&self) -> Result<Vec<RoomId>, SourceError> {
        let resp: JoinedRoomsResponse = self.get_json(self.endpoint(&["joined_rooms"])).await?;
        Ok(resp.joined_rooms)
    }

    async fn resolve_label(&self, room_id: &RoomId) -> Result<String, SourceError> {
        match self
            .state_event::<CanonicalAliasContent>(room_id, "m.room.canonical_alias")
            .await
        {
            Ok(CanonicalAliasContent { alias: Some(alias) }) if !alias.is_empty() => {
                log::debug!("{room_id}: using canonical alias {alias}");
                return Ok(alias);
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => log::warn!("{room_id}: failed to get canonical alias: {e}"),
        }

        match self
            .state_event::<RoomNameContent>(room_id, "m.room.name")
            .await
        {
            Ok(RoomNameContent { name: Some(name) }) if !name.is_empty() => {
                log::debug!("{room_id}: using room name {name}");
                return Ok(name);
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => log::warn!("{room_id}: failed to get room name: {e}"),
        }

        log::debug!("{room_id}: using room ID as name");
        Ok(room_id.to_string())
    }

    async fn fetch_page(
        &self,
        room_id: &RoomId,
        from: &str,
        limit: u32,
    ) -> Result<Page, SourceError> {
        let mut url = self.endpoint(&["rooms", room_id.as_str(), "messages"]);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("dir", "f")
                .append_pair("limit", &limit.to_string());
            if !from.is_empty() {
                query.append_pair("from", from);
            }
        }
        let resp: MessagesResponse = self.get_json(url).await?;
        Ok(Page {
            events: resp.chunk,
            start: resp.start,
            end: resp.end.filter(|t| !t.is_empty()),
        })
    }
}

/// Turn a non-2xx response into an error, keeping the Matrix `errcode` when present.
fn error_from_body(status: u16, body: &str) -> SourceError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let (errcode, message) = match parsed {
        Some(b) => (b.errcode, b.error.unwrap_or_default()),
        None => (None, body.chars().take(200).collect()),
    };
    SourceError::Http {
        status,
        errcode,
        message,
    }
}

fn from_reqwest(err: reqwest::Error) -> SourceError {
    let kind = transport_kind(&err);
    if kind == TransportKind::Other && err.is_decode() {
        return SourceError::InvalidResponse(err.to_string());
    }
    SourceError::Transport {
        kind,
        message: error_chain(&err),
    }
}

/// Map a reqwest failure onto the network-level categories worth retrying.
///
/// Only causes visible in the `io::Error` chain (or a resolver failure) count
/// as network trouble. TLS and protocol errors during connect stay `Other`.
fn transport_kind(err: &reqwest::Error) -> TransportKind {
    if err.is_timeout() {
        return TransportKind::Timeout;
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => return TransportKind::ConnectionRefused,
                io::ErrorKind::TimedOut => return TransportKind::Timeout,
                io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable => {
                    return TransportKind::Unreachable
                }
                io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe => return TransportKind::UnexpectedEof,
                _ => {}
            }
        }
        source = cause.source();
    }

    let text = error_chain(err).to_lowercase();
    if text.contains("dns error")
        || text.contains("failed to lookup address")
        || text.contains("no such host")
        || text.contains("name or service not known")
    {
        TransportKind::Dns
    } else if err.is_body() && !err.is_connect() {
        TransportKind::UnexpectedEof
    } else {
        TransportKind::Other
    }
}

fn error_chain(err: &dyn StdError) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::retry::{classify, Retryability};

    #[test]
    fn test_endpoint_encodes_room_id() {
        let client = MatrixClient::new("https://matrix.example.org", "tok").unwrap();
        let url = client.endpoint(&["rooms", "!abc:example.org", "messages"]);
        assert_eq!(
            url.as_str(),
            "https://matrix.example.org/_matrix/client/v3/rooms/!abc:example.org/messages"
        );

        let url = client.endpoint(&["rooms", "!a/b?c#d:x", "messages"]);
        assert_eq!(
            url.path(),
            "/_matrix/client/v3/rooms/!a%2Fb%3Fc%23d:x/messages"
        );
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let client = MatrixClient::new("https://example.org/matrix/", "tok").unwrap();
        let url = client.endpoint(&["account", "whoami"]);
        assert_eq!(
            url.as_str(),
            "https://example.org/matrix/_matrix/client/v3/account/whoami"
        );
    }

    #[test]
    fn test_state_endpoint_has_empty_state_key() {
        let client = MatrixClient::new("https://example.org", "tok").unwrap();
        let url = client.endpoint(&["rooms", "!r:x", "state", "m.room.name", ""]);
        assert_eq!(url.path(), "/_matrix/client/v3/rooms/!r:x/state/m.room.name/");
    }

    #[test]
    fn test_invalid_homeserver() {
        assert!(MatrixClient::new("not a url", "tok").is_err());
        assert!(MatrixClient::new("mailto:someone@example.org", "tok").is_err());
    }

    #[test]
    fn test_error_from_matrix_body() {
        let body = r#"{"errcode":"M_FORBIDDEN","error":"You are not invited"}"#;
        let err = error_from_body(403, body);
        match err {
            SourceError::Http {
                status,
                errcode,
                message,
            } => {
                assert_eq!(status, 403);
                assert_eq!(errcode.as_deref(), Some("M_FORBIDDEN"));
                assert_eq!(message, "You are not invited");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_from_plain_body() {
        let err = error_from_body(502, "Bad Gateway");
        assert!(matches!(err, SourceError::Http { status: 502, .. }));
        assert!(err.to_string().contains("Bad Gateway"));
    }

    #[test]
    fn test_messages_response_without_end() {
        let resp: MessagesResponse =
            serde_json::from_str(r#"{"chunk":[],"start":"s1"}"#).unwrap();
        assert!(resp.chunk.is_empty());
        assert_eq!(resp.start, "s1");
        assert!(resp.end.is_none());
    }

    /// Accept one connection, answer it with `reply` and keep it open briefly.
    async fn serve_once(reply: &'static [u8]) -> u16 {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(reply).await;
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_tls_handshake_failure_is_fatal() {
        let port = serve_once(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n").await;
        let client = MatrixClient::new(&format!("https://127.0.0.1:{port}"), "tok").unwrap();

        let err = client.verify_session().await.unwrap_err();
        assert!(
            matches!(
                err,
                SourceError::Transport {
                    kind: TransportKind::Other,
                    ..
                }
            ),
            "unexpected {err:?}"
        );
        assert_eq!(classify(&err), Retryability::Fatal);
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let client = MatrixClient::new(&format!("http://127.0.0.1:{port}"), "tok").unwrap();

        let err = client.verify_session().await.unwrap_err();
        assert!(
            matches!(
                err,
                SourceError::Transport {
                    kind: TransportKind::ConnectionRefused,
                    ..
                }
            ),
            "unexpected {err:?}"
        );
        assert_eq!(classify(&err), Retryability::Retryable);
    }

    #[tokio::test]
    async fn test_http_error_status_is_not_transport() {
        let port = serve_once(
            concat!(
                "HTTP/1.1 401 Unauthorized\r\n",
                "Content-Type: application/json\r\n",
                "Content-Length: 49\r\n",
                "Connection: close\r\n\r\n",
                r#"{"errcode":"M_UNKNOWN_TOKEN","error":"bad token"}"#,
            )
            .as_bytes(),
        )
        .await;
        let client = MatrixClient::new(&format!("http://127.0.0.1:{port}"), "tok").unwrap();

        let err = client.verify_session().await.unwrap_err();
        match &err {
            SourceError::Http {
                status, errcode, ..
            } => {
                assert_eq!(*status, 401);
                assert_eq!(errcode.as_deref(), Some("M_UNKNOWN_TOKEN"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(classify(&err), Retryability::Fatal);
    }
}
