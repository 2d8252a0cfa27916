use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::{
    multipart::{Form, Part},
    Client,
};
use tracing::debug;

use scidbtile::{ConnectionParameters, Error, Result};

/// One call to a shim endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub endpoint: &'static str,
    pub params: Vec<(&'static str, String)>,

    /// File contents to upload with the call
    pub upload: Option<Bytes>,
}

impl Request {
    pub fn new(endpoint: &'static str) -> Self {
        Self {
            endpoint,
            params: vec![],
            upload: None,
        }
    }

    pub fn param(mut self, key: &'static str, value: impl ToString) -> Self {
        self.params.push((key, value.to_string()));
        self
    }

    pub fn upload(mut self, data: Bytes) -> Self {
        self.upload = Some(data);
        self
    }

    /// Value of a query parameter
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Bytes,
}

impl Response {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).trim().to_string()
    }
}

/// Carries requests to a shim and brings back its responses.
///
/// Non-success statuses are returned as responses, not errors. Errors are for calls that never
/// got a response.
///
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response>;

    /// Where requests go, for error messages
    fn host(&self) -> &str;
}

/// `Transport` over HTTP(S).
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(parameters: &ConnectionParameters) -> Result<Self> {
        let base_url = parameters.base_url();
        let client = Client::builder()
            .timeout(Duration::from_secs(parameters.timeout_secs))
            .connect_timeout(Duration::from_secs(parameters.connect_timeout_secs))
            .pool_max_idle_per_host(parameters.max_sessions)
            .danger_accept_invalid_certs(!parameters.verify_certs)
            .build()
            .map_err(|err| Error::Connection {
                host: base_url.clone(),
                message: err.to_string(),
            })?;

        Ok(Self { client, base_url })
    }

    fn classify(&self, err: reqwest::Error) -> Error {
        if err.is_connect() {
            Error::Connection {
                host: self.base_url.clone(),
                message: err.to_string(),
            }
        } else {
            Error::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: Request) -> Result<Response> {
        let url = format!("{}{}", self.base_url, request.endpoint);
        debug!(endpoint = request.endpoint, "HTTP request");

        let builder = match request.upload {
            None => self.client.get(&url).query(&request.params),
            Some(data) => {
                let part = Part::bytes(data.to_vec()).file_name("upload");
                self.client
                    .post(&url)
                    .query(&request.params)
                    .multipart(Form::new().part("file", part))
            }
        };
        let response = builder.send().await.map_err(|err| self.classify(err))?;
        let status = response.status().as_u16();

        // Collect the body piecewise so a connection lost mid-stream shows up as such
        let mut body = Vec::new();
        let mut stream = Box::pin(response.bytes_stream());
        while let Some(piece) = stream.try_next().await.map_err(|err| self.classify(err))? {
            body.extend_from_slice(&piece);
        }

        Ok(Response {
            status,
            body: Bytes::from(body),
        })
    }

    fn host(&self) -> &str {
        &self.base_url
    }
}
