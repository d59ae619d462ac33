//! Byte-level transports carrying REST requests to a daemon.
//!
//! Local daemons are reached over their unix socket with `hyper` and
//! `hyperlocal`; remote daemons over HTTPS with a client certificate using
//! `reqwest`.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::UnixConnector;

use super::{DaemonError, DaemonFuture};

/// HTTP verbs used by the REST client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HttpMethod {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `DELETE`
    Delete,
}

impl HttpMethod {
    const fn as_hyper(self) -> hyper::Method {
        match self {
            Self::Get => hyper::Method::GET,
            Self::Post => hyper::Method::POST,
            Self::Put => hyper::Method::PUT,
            Self::Delete => hyper::Method::DELETE,
        }
    }

    const fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        };
        f.write_str(verb)
    }
}

/// A request ready to be written to the wire.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawRequest {
    /// Verb.
    pub method: HttpMethod,
    /// Absolute path including an optional query string.
    pub path_and_query: String,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Vec<u8>,
}

/// A reply read back from the wire.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RawResponse {
    /// HTTP status code.
    pub status: u16,
    /// Headers with lower-case names.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
}

impl RawResponse {
    /// Returns the first header value matching `name`, ignoring case.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Sends raw requests to one daemon endpoint.
pub trait Transport: Send + Sync {
    /// Human-readable endpoint used in diagnostics.
    fn endpoint(&self) -> &str;

    /// Performs one request/response exchange.
    fn send(&self, request: RawRequest) -> DaemonFuture<'_, RawResponse>;
}

/// Transport over the daemon's local unix socket.
pub struct UnixTransport {
    socket: Utf8PathBuf,
    endpoint: String,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl UnixTransport {
    /// Creates a transport for the socket at `socket`.
    #[must_use]
    pub fn new(socket: &Utf8Path) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(UnixConnector);
        Self {
            socket: socket.to_path_buf(),
            endpoint: format!("unix://{socket}"),
            client,
        }
    }

    fn transport_error(&self, message: impl fmt::Display) -> DaemonError {
        DaemonError::Transport {
            endpoint: self.endpoint.clone(),
            message: message.to_string(),
        }
    }
}

impl Transport for UnixTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn send(&self, request: RawRequest) -> DaemonFuture<'_, RawResponse> {
        Box::pin(async move {
            let uri = hyperlocal::Uri::new(self.socket.as_std_path(), &request.path_and_query);
            let mut builder = hyper::Request::builder()
                .method(request.method.as_hyper())
                .uri(uri);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let outgoing = builder
                .body(Full::new(Bytes::from(request.body)))
                .map_err(|err| self.transport_error(err))?;

            let response = self
                .client
                .request(outgoing)
                .await
                .map_err(|err| self.transport_error(err))?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|text| (name.as_str().to_owned(), text.to_owned()))
                })
                .collect();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|err| self.transport_error(err))?
                .to_bytes()
                .to_vec();

            Ok(RawResponse {
                status,
                headers,
                body,
            })
        })
    }
}

/// Transport over HTTPS with client-certificate authentication.
pub struct HttpsTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpsTransport {
    /// Builds a transport presenting `identity_pem` (client certificate
    /// followed by its key) and trusting `server_cert_pem` when given.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Transport`] when the PEM material is invalid or
    /// the TLS client cannot be built.
    pub fn new(
        base_url: &str,
        identity_pem: &[u8],
        server_cert_pem: Option<&[u8]>,
    ) -> Result<Self, DaemonError> {
        let tls_error = |err: reqwest::Error| DaemonError::Transport {
            endpoint: base_url.to_owned(),
            message: format!("invalid TLS material: {err}"),
        };
        let identity = reqwest::Identity::from_pem(identity_pem).map_err(tls_error)?;
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity);
        if let Some(pem) = server_cert_pem {
            let certificate = reqwest::Certificate::from_pem(pem).map_err(tls_error)?;
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(certificate);
        }
        let client = builder.build().map_err(tls_error)?;
        Ok(Self::from_client(base_url, client))
    }

    /// Wraps an already configured client; used for plain HTTP endpoints
    /// such as test servers.
    #[must_use]
    pub fn from_client(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client,
        }
    }

    fn transport_error(&self, err: &reqwest::Error) -> DaemonError {
        DaemonError::Transport {
            endpoint: self.base_url.clone(),
            message: err.to_string(),
        }
    }
}

impl Transport for HttpsTransport {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    fn send(&self, request: RawRequest) -> DaemonFuture<'_, RawResponse> {
        Box::pin(async move {
            let url = format!("{}{}", self.base_url, request.path_and_query);
            let mut builder = self.client.request(request.method.as_reqwest(), url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let response = builder
                .body(request.body)
                .send()
                .await
                .map_err(|err| self.transport_error(&err))?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|text| (name.as_str().to_owned(), text.to_owned()))
                })
                .collect();
            let body = response
                .bytes()
                .await
                .map_err(|err| self.transport_error(&err))?
                .to_vec();

            Ok(RawResponse {
                status,
                headers,
                body,
            })
        })
    }
}
