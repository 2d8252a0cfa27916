//! An in-process stand-in for a shim, for tests.
//!
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use scidbtile::Result;

use crate::transport::{Request, Response, Transport};

#[derive(Clone, Debug)]
enum Answer {
    Text(String),
    Bytes(Bytes),
    Error(String),
    Stall,
}

#[derive(Default)]
struct State {
    password: String,
    refuse_sessions: bool,
    next_session: u64,
    sessions: HashSet<u64>,
    released: Vec<u64>,
    output: HashMap<u64, Bytes>,
    answers: Vec<(String, Answer)>,
    requests: Vec<Request>,
    uploads: Vec<Bytes>,
}

/// Answers shim endpoints from canned responses, keyed by query prefix, and records every
/// request it sees.
pub(crate) struct FakeShim {
    version: String,
    state: Mutex<State>,
}

impl FakeShim {
    pub(crate) const TOKEN: &'static str = "t0k3n";

    pub(crate) fn new(version: &str) -> Arc<Self> {
        Arc::new(Self {
            version: version.to_string(),
            state: Mutex::new(State {
                password: String::from("secret"),
                ..Default::default()
            }),
        })
    }

    pub(crate) fn set_password(&self, password: &str) {
        self.state.lock().password = password.to_string();
    }

    /// Answer every `/new_session` with an error
    pub(crate) fn refuse_sessions(&self) {
        self.state.lock().refuse_sessions = true;
    }

    fn answer(&self, prefix: &str, answer: Answer) {
        self.state.lock().answers.push((prefix.to_string(), answer));
    }

    pub(crate) fn answer_text(&self, prefix: &str, text: &str) {
        self.answer(prefix, Answer::Text(text.to_string()));
    }

    pub(crate) fn answer_bytes(&self, prefix: &str, bytes: Vec<u8>) {
        self.answer(prefix, Answer::Bytes(Bytes::from(bytes)));
    }

    pub(crate) fn answer_error(&self, prefix: &str, message: &str) {
        self.answer(prefix, Answer::Error(message.to_string()));
    }

    /// Never answer queries starting with `prefix`
    pub(crate) fn stall(&self, prefix: &str) {
        self.answer(prefix, Answer::Stall);
    }

    pub(crate) fn requests(&self, endpoint: &str) -> Vec<Request> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|request| request.endpoint == endpoint)
            .cloned()
            .collect()
    }

    /// Text of every query executed, in order
    pub(crate) fn queries(&self) -> Vec<String> {
        self.requests("/execute_query")
            .iter()
            .filter_map(|request| request.get("query").map(String::from))
            .collect()
    }

    pub(crate) fn released(&self) -> Vec<u64> {
        self.state.lock().released.clone()
    }

    pub(crate) fn open_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub(crate) fn sessions_created(&self) -> u64 {
        self.state.lock().next_session
    }

    pub(crate) fn uploads(&self) -> Vec<Bytes> {
        self.state.lock().uploads.clone()
    }

    fn session(state: &State, request: &Request) -> Option<u64> {
        request
            .get("id")
            .and_then(|id| id.parse().ok())
            .filter(|id| state.sessions.contains(id))
    }

    fn respond(&self, request: &Request) -> Option<Response> {
        let mut state = self.state.lock();
        state.requests.push(request.clone());

        let response = match request.endpoint {
            "/version" => Response::ok(self.version.clone()),
            "/login" => {
                if request.get("password") == Some(state.password.as_str()) {
                    Response::ok(Self::TOKEN)
                } else {
                    status(401, "Unauthorized")
                }
            }
            "/new_session" => {
                let login = request.get("auth") == Some(Self::TOKEN);
                if !login && request.get("password") != Some(state.password.as_str()) {
                    return Some(status(401, "Unauthorized"));
                }
                if state.refuse_sessions {
                    return Some(status(503, "Out of sessions"));
                }
                state.next_session += 1;
                let id = state.next_session;
                state.sessions.insert(id);
                Response::ok(id.to_string())
            }
            "/release_session" => match Self::session(&state, request) {
                Some(id) => {
                    state.sessions.remove(&id);
                    state.released.push(id);
                    Response::ok("")
                }
                None => status(404, "Session not found"),
            },
            "/logout" => Response::ok(""),
            "/cancel" => match Self::session(&state, request) {
                Some(_) => Response::ok(""),
                None => status(404, "Session not found"),
            },
            "/execute_query" => {
                let id = match Self::session(&state, request) {
                    Some(id) => id,
                    None => return Some(status(404, "Session not found")),
                };
                let query = request.get("query").unwrap_or_default();
                let answer = state
                    .answers
                    .iter()
                    .rev()
                    .find(|(prefix, _)| query.starts_with(prefix.as_str()))
                    .map(|(_, answer)| answer.clone());
                let output = match answer {
                    None => Bytes::new(),
                    Some(Answer::Text(text)) => Bytes::from(text),
                    Some(Answer::Bytes(bytes)) => bytes,
                    Some(Answer::Error(message)) => return Some(status(406, &message)),
                    Some(Answer::Stall) => return None,
                };
                state.output.insert(id, output);
                Response::ok("1")
            }
            "/read_lines" | "/read_bytes" => match Self::session(&state, request) {
                Some(id) => match state.output.remove(&id) {
                    Some(output) => Response::ok(output),
                    None => status(410, "Output not found"),
                },
                None => status(404, "Session not found"),
            },
            "/upload_file" => {
                if Self::session(&state, request).is_none() {
                    return Some(status(404, "Session not found"));
                }
                state.uploads.push(request.upload.clone().unwrap_or_default());
                Response::ok(format!("/tmp/upload_{}", state.uploads.len()))
            }
            _ => status(404, "Not found"),
        };

        Some(response)
    }
}

fn status(status: u16, message: &str) -> Response {
    Response {
        status,
        body: Bytes::from(message.to_string()),
    }
}

#[async_trait]
impl Transport for FakeShim {
    async fn send(&self, request: Request) -> Result<Response> {
        match self.respond(&request) {
            Some(response) => Ok(response),
            None => futures::future::pending().await,
        }
    }

    fn host(&self) -> &str {
        "fake-shim"
    }
}
