use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use scidbtile::{ConnectionParameters, Error, Result};

use crate::transport::{Request, Response, Transport};

/// Oldest and newest shim major versions this client speaks
const MIN_MAJOR: u32 = 14;
const MAX_MAJOR: u32 = 19;

/// Release of the shim on the other end, as reported by `/version`, e.g. `v19.11.3`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ShimVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ShimVersion {
    /// Fail with `Error::ProtocolVersion` unless this client knows how to talk to this release.
    pub fn check(&self) -> Result<()> {
        if (MIN_MAJOR..=MAX_MAJOR).contains(&self.major) {
            Ok(())
        } else {
            Err(Error::ProtocolVersion(format!(
                "shim {self} is not supported, need v{MIN_MAJOR} through v{MAX_MAJOR}"
            )))
        }
    }

    /// Whether binary queries take the `atts_only` flag
    pub fn atts_only(&self) -> bool {
        (self.major, self.minor) >= (16, 9)
    }

    /// Whether credentials go with `/new_session`. Older shims authenticate with `/login`.
    pub fn session_auth(&self) -> bool {
        self.major >= 16
    }

    /// Whether `pinned`, a version like `19.11`, names this release
    fn matches(&self, pinned: &str) -> Result<bool> {
        let pinned: ShimVersion = pinned.parse()?;
        Ok(pinned.major == self.major && pinned.minor == self.minor)
    }
}

impl FromStr for ShimVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::ProtocolVersion(format!("cannot parse shim version {s:?}"));
        let text = s.trim();
        let text = text.strip_prefix('v').unwrap_or(text);
        // Development builds append a suffix, e.g. `19.11.3-5-g1a2b3c`
        let text = text.split(&['-', ' '][..]).next().unwrap_or(text);

        let mut parts = text.split('.');
        let mut next = |required: bool| -> Result<u32> {
            match parts.next() {
                Some(part) => part.parse().map_err(|_| bad()),
                None if required => Err(bad()),
                None => Ok(0),
            }
        };
        let major = next(true)?;
        let minor = next(true)?;
        let patch = next(false)?;

        Ok(Self {
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for ShimVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// What all sessions to one shim share: the transport, the negotiated version and credentials.
pub(crate) struct Connection {
    transport: Arc<dyn Transport>,
    version: ShimVersion,
    user: String,
    password: String,

    /// Token from `/login`, for shims that predate per-session credentials
    auth: Option<String>,
}

impl Connection {
    /// Ask the shim for its version and authenticate if the version calls for a separate login.
    pub(crate) async fn handshake(
        transport: Arc<dyn Transport>,
        parameters: &ConnectionParameters,
    ) -> Result<Self> {
        let response = transport.send(Request::new("/version")).await?;
        if !response.is_success() {
            return Err(Error::Connection {
                host: transport.host().to_string(),
                message: format!("/version answered {}: {}", response.status, response.text()),
            });
        }
        let version: ShimVersion = response.text().parse()?;
        version.check()?;
        if let Some(pinned) = &parameters.protocol_version {
            if !version.matches(pinned)? {
                return Err(Error::ProtocolVersion(format!(
                    "shim is {version}, expected {pinned}"
                )));
            }
        }
        info!(host = transport.host(), %version, "connected to shim");

        let mut connection = Self {
            transport,
            version,
            user: parameters.user.clone(),
            password: parameters.password.clone(),
            auth: None,
        };
        if !version.session_auth() {
            let request = Request::new("/login")
                .param("username", &connection.user)
                .param("password", &connection.password);
            let response = connection.send(request).await?;
            if !response.is_success() {
                return Err(connection.refused(&response));
            }
            connection.auth = Some(response.text());
        }

        Ok(connection)
    }

    pub(crate) fn version(&self) -> ShimVersion {
        self.version
    }

    /// Send a request, adding the login token if there is one. Rejected credentials are a
    /// connection error whatever the endpoint.
    async fn send(&self, mut request: Request) -> Result<Response> {
        if let Some(auth) = &self.auth {
            request = request.param("auth", auth);
        }
        let response = self.transport.send(request).await?;
        match response.status {
            401 | 403 => Err(self.refused(&response)),
            _ => Ok(response),
        }
    }

    fn refused(&self, response: &Response) -> Error {
        Error::Connection {
            host: self.transport.host().to_string(),
            message: format!("credentials refused ({}): {}", response.status, response.text()),
        }
    }

    /// Start a new session.
    pub(crate) async fn new_session(self: &Arc<Self>) -> Result<Session> {
        let mut request = Request::new("/new_session");
        if self.version.session_auth() {
            request = request
                .param("user", &self.user)
                .param("password", &self.password);
        }
        let response = self.send(request).await?;
        let text = response.text();
        let id = match text.parse::<u64>() {
            Ok(id) if response.is_success() && id > 0 => id,
            _ => {
                return Err(Error::Connection {
                    host: self.transport.host().to_string(),
                    message: format!("cannot start a session ({}): {text}", response.status),
                })
            }
        };
        debug!(session = id, "session opened");

        Ok(Session {
            connection: Arc::clone(self),
            id,
            state: State::Idle,
        })
    }

    /// Log out, for shims that needed a login. Sessions should be released first.
    pub(crate) async fn logout(&self) -> Result<()> {
        if self.auth.is_none() {
            return Ok(());
        }
        let response = self.send(Request::new("/logout")).await?;
        if !response.is_success() {
            return Err(Error::Transport(format!("cannot log out: {}", response.text())));
        }

        Ok(())
    }

    /// Stop whatever query is running in a session.
    async fn cancel(&self, id: u64) -> Result<()> {
        let response = self.send(Request::new("/cancel").param("id", id)).await?;
        if !response.is_success() {
            return Err(Error::Transport(format!(
                "cannot cancel query in session {id}: {}",
                response.text()
            )));
        }
        debug!(session = id, "query cancelled");

        Ok(())
    }

    async fn release(&self, id: u64) -> Result<()> {
        let request = Request::new("/release_session").param("id", id);
        let response = self.send(request).await?;
        if !response.is_success() {
            return Err(Error::Transport(format!(
                "cannot release session {id}: {}",
                response.text()
            )));
        }
        debug!(session = id, "session released");

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Idle,
    AwaitingResponse,
    Closed,
}

/// One session with the shim. The shim runs one query per session at a time, so every call takes
/// `&mut self` and the session refuses new calls after one was abandoned before its response
/// arrived.
///
pub(crate) struct Session {
    connection: Arc<Connection>,
    id: u64,
    state: State,
}

impl Session {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    async fn call(&mut self, request: Request) -> Result<Response> {
        match self.state {
            State::Idle => {}
            State::AwaitingResponse => {
                return Err(Error::Transport(format!(
                    "session {} was interrupted during a call",
                    self.id
                )))
            }
            State::Closed => {
                return Err(Error::Transport(format!("session {} is closed", self.id)))
            }
        }

        // If this future is dropped before the response arrives, the state stays put
        self.state = State::AwaitingResponse;
        let result = self.connection.send(request.param("id", self.id)).await;
        self.state = State::Idle;

        result
    }

    /// Run a query. With `save`, its output is kept in that format for `read_lines` or
    /// `read_bytes`.
    pub(crate) async fn execute(&mut self, query: &str, save: Option<&str>) -> Result<()> {
        debug!(session = self.id, query, "execute");
        let mut request = Request::new("/execute_query").param("query", query);
        if let Some(save) = save {
            request = request.param("save", save);
            if save.starts_with('(') && self.connection.version().atts_only() {
                request = request.param("atts_only", 1);
            }
        }
        let response = self.call(request).await?;
        if !response.is_success() {
            return Err(query_error(response.text(), query));
        }

        Ok(())
    }

    /// Run a query and return its output as CSV text.
    pub(crate) async fn query_text(&mut self, query: &str) -> Result<String> {
        self.execute(query, Some(crate::query::CSV)).await?;
        let response = self
            .call(Request::new("/read_lines").param("n", 0))
            .await?;
        if !response.is_success() {
            return Err(query_error(response.text(), query));
        }

        Ok(String::from_utf8_lossy(&response.body).into_owned())
    }

    /// Run a query and return its output in the binary `format`.
    pub(crate) async fn query_bytes(&mut self, query: &str, format: &str) -> Result<Bytes> {
        self.execute(query, Some(format)).await?;
        let response = self
            .call(Request::new("/read_bytes").param("n", 0))
            .await?;
        if !response.is_success() {
            return Err(query_error(response.text(), query));
        }

        Ok(response.body)
    }

    /// Upload a file to the shim. Returns its path on the server, for `input()`.
    pub(crate) async fn upload(&mut self, data: Bytes) -> Result<String> {
        let response = self.call(Request::new("/upload_file").upload(data)).await?;
        if !response.is_success() {
            return Err(Error::Transport(format!(
                "upload to session {} failed: {}",
                self.id,
                response.text()
            )));
        }

        Ok(response.text())
    }

    /// Release the session on the shim.
    pub(crate) async fn close(mut self) -> Result<()> {
        self.state = State::Closed;
        self.connection.release(self.id).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == State::Closed {
            return;
        }

        // Can't await here. Release in the background if there is a runtime to do it on.
        let connection = Arc::clone(&self.connection);
        let id = self.id;
        let interrupted = self.state == State::AwaitingResponse;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if interrupted {
                        if let Err(err) = connection.cancel(id).await {
                            debug!(session = id, %err, "cancel failed");
                        }
                    }
                    if let Err(err) = connection.release(id).await {
                        warn!(session = id, %err, "failed to release dropped session");
                    }
                });
            }
            Err(_) => warn!(session = id, "session dropped outside a runtime, not released"),
        }
    }
}

/// Classify a failed query. A missing array is a normal outcome, the rest is the remote's verdict.
fn query_error(message: String, query: &str) -> Error {
    if message.contains("SCIDB_LE_ARRAY_DOESNT_EXIST") {
        Error::NotFound(message)
    } else {
        Error::query(message, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::fake::FakeShim;

    fn parameters() -> ConnectionParameters {
        ConnectionParameters {
            user: String::from("alice"),
            password: String::from("secret"),
            ..Default::default()
        }
    }

    async fn connect(shim: &Arc<FakeShim>) -> Result<Arc<Connection>> {
        let transport: Arc<dyn Transport> = shim.clone();
        Ok(Arc::new(Connection::handshake(transport, &parameters()).await?))
    }

    #[test]
    fn test_parse_version() -> Result<()> {
        let version: ShimVersion = "v19.11.3".parse()?;
        assert_eq!(
            version,
            ShimVersion {
                major: 19,
                minor: 11,
                patch: 3
            }
        );
        assert!(version.check().is_ok());
        assert!(version.atts_only());
        assert!(version.session_auth());
        assert_eq!(version.to_string(), "v19.11.3");

        let version: ShimVersion = "16.9\n".parse()?;
        assert!(version.atts_only());
        let version: ShimVersion = "v16.8.1-3-gdeadbee".parse()?;
        assert_eq!(version.patch, 1);
        assert!(!version.atts_only());
        let version: ShimVersion = "v15.12".parse()?;
        assert!(!version.session_auth());

        assert!(matches!(
            "v13.3".parse::<ShimVersion>()?.check(),
            Err(Error::ProtocolVersion(_))
        ));
        assert!(matches!(
            "v20.1".parse::<ShimVersion>()?.check(),
            Err(Error::ProtocolVersion(_))
        ));
        assert!(matches!(
            "hello".parse::<ShimVersion>(),
            Err(Error::ProtocolVersion(_))
        ));
        assert!(matches!(
            "v19".parse::<ShimVersion>(),
            Err(Error::ProtocolVersion(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_handshake_with_session_credentials() -> Result<()> {
        let shim = FakeShim::new("v19.11.3");
        let connection = connect(&shim).await?;
        assert!(shim.requests("/login").is_empty());

        let session = connection.new_session().await?;
        assert!(session.id() > 0);
        let requests = shim.requests("/new_session");
        assert_eq!(requests[0].get("user"), Some("alice"));
        assert_eq!(requests[0].get("password"), Some("secret"));

        Ok(())
    }

    #[tokio::test]
    async fn test_handshake_with_login() -> Result<()> {
        let shim = FakeShim::new("v15.12");
        let connection = connect(&shim).await?;
        assert_eq!(shim.requests("/login").len(), 1);

        let mut session = connection.new_session().await?;
        session.execute("list('arrays')", None).await?;
        let requests = shim.requests("/execute_query");
        assert_eq!(requests[0].get("auth"), Some(FakeShim::TOKEN));
        assert_eq!(shim.requests("/new_session")[0].get("user"), None);

        session.close().await?;
        connection.logout().await?;
        assert_eq!(shim.requests("/logout").len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_bad_credentials() -> Result<()> {
        let shim = FakeShim::new("v19.11");
        shim.set_password("hunter2");
        let connection = connect(&shim).await?;
        assert!(matches!(
            connection.new_session().await,
            Err(Error::Connection { .. })
        ));

        let shim = FakeShim::new("v15.12");
        shim.set_password("hunter2");
        assert!(matches!(connect(&shim).await, Err(Error::Connection { .. })));

        Ok(())
    }

    #[tokio::test]
    async fn test_pinned_version() -> Result<()> {
        let shim = FakeShim::new("v19.11.3");
        let transport: Arc<dyn Transport> = shim.clone();
        let mut parameters = parameters();

        parameters.protocol_version = Some(String::from("19.11"));
        assert!(Connection::handshake(Arc::clone(&transport), &parameters).await.is_ok());

        parameters.protocol_version = Some(String::from("18.1"));
        assert!(matches!(
            Connection::handshake(transport, &parameters).await,
            Err(Error::ProtocolVersion(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_query_text_and_bytes() -> Result<()> {
        let shim = FakeShim::new("v19.11");
        shim.answer_text("project(list", "name\n'ndvi'\n");
        shim.answer_bytes("project(between", vec![1, 2, 3]);
        let connection = connect(&shim).await?;
        let mut session = connection.new_session().await?;

        let text = session.query_text("project(list('arrays'),name)").await?;
        assert_eq!(text, "name\n'ndvi'\n");

        let bytes = session.query_bytes("project(between(a,0,3),v)", "(int8)").await?;
        assert_eq!(&bytes[..], &[1, 2, 3]);

        let executed = shim.requests("/execute_query");
        assert_eq!(executed[0].get("save"), Some("csv:l"));
        assert_eq!(executed[0].get("atts_only"), None);
        assert_eq!(executed[1].get("save"), Some("(int8)"));
        assert_eq!(executed[1].get("atts_only"), Some("1"));
        let id = session.id().to_string();
        assert!(executed.iter().all(|r| r.get("id") == Some(id.as_str())));

        Ok(())
    }

    #[tokio::test]
    async fn test_query_errors() -> Result<()> {
        let shim = FakeShim::new("v19.11");
        shim.answer_error("scan(nope)", "UserException: SCIDB_LE_ARRAY_DOESNT_EXIST: nope");
        shim.answer_error("scna(a)", "UserQueryException: SCIDB_LE_LOGICAL_OP_DOESNT_EXIST");
        let connection = connect(&shim).await?;
        let mut session = connection.new_session().await?;

        assert!(matches!(
            session.execute("scan(nope)", None).await,
            Err(Error::NotFound(_))
        ));
        match session.execute("scna(a)", None).await {
            Err(Error::Query { message, query }) => {
                assert!(message.contains("SCIDB_LE_LOGICAL_OP_DOESNT_EXIST"));
                assert_eq!(query, "scna(a)");
            }
            other => panic!("expected a query error, got {other:?}"),
        }

        // A failed query leaves the session usable
        assert_eq!(session.state(), State::Idle);
        session.execute("list('arrays')", None).await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_abandoned_call_poisons_session() -> Result<()> {
        let shim = FakeShim::new("v19.11");
        shim.stall("scan(big)");
        let connection = connect(&shim).await?;
        let mut session = connection.new_session().await?;

        let call = session.execute("scan(big)", None);
        assert!(tokio::time::timeout(Duration::from_millis(20), call)
            .await
            .is_err());
        assert_eq!(session.state(), State::AwaitingResponse);
        assert!(matches!(
            session.execute("list('arrays')", None).await,
            Err(Error::Transport(_))
        ));

        // Dropping it cancels the stalled query before releasing the session
        let id = session.id();
        drop(session);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let cancelled = shim.requests("/cancel");
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].get("id"), Some(id.to_string().as_str()));
        assert_eq!(shim.released(), vec![id]);

        Ok(())
    }

    #[tokio::test]
    async fn test_close_and_drop_release_sessions() -> Result<()> {
        let shim = FakeShim::new("v19.11");
        let connection = connect(&shim).await?;

        let session = connection.new_session().await?;
        let id = session.id();
        session.close().await?;
        assert_eq!(shim.released(), vec![id]);

        let session = connection.new_session().await?;
        let id2 = session.id();
        drop(session);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(shim.released(), vec![id, id2]);
        assert_eq!(shim.open_sessions(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_upload() -> Result<()> {
        let shim = FakeShim::new("v19.11");
        let connection = connect(&shim).await?;
        let mut session = connection.new_session().await?;

        let path = session.upload(Bytes::from_static(b"\x01\x02")).await?;
        assert_eq!(path, "/tmp/upload_1");
        assert_eq!(shim.uploads(), vec![Bytes::from_static(b"\x01\x02")]);

        Ok(())
    }
}
