//! The boundary between operations and the network.
//!
//! # Design
//! Operations never perform I/O themselves. They hand a prepared `HttpRequest`
//! to a `Transport` and classify whatever comes back. Implementations must
//! report every HTTP status as `Ok(HttpResponse)`; `Err(TransportError)` is
//! reserved for exchanges that did not complete.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::http::{HttpRequest, HttpResponse};

/// Executes one prepared HTTP exchange.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[cfg(feature = "ureq")]
pub use self::blocking::UreqTransport;

#[cfg(feature = "ureq")]
mod blocking {
    use std::io::Read;
    use std::path::PathBuf;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tracing::debug;

    use super::Transport;
    use crate::config::SessionConfig;
    use crate::error::TransportError;
    use crate::http::{Delivery, HttpMethod, HttpRequest, HttpResponse};

    /// `Transport` backed by a blocking `ureq` agent.
    ///
    /// Each exchange runs on tokio's blocking pool, so the calling task only
    /// suspends. Redirects are followed by the agent; cookies are not stored.
    #[derive(Clone)]
    pub struct UreqTransport {
        agent: ureq::Agent,
        download_dir: PathBuf,
    }

    impl UreqTransport {
        pub fn new(session: &SessionConfig) -> Self {
            let agent = ureq::Agent::config_builder()
                .http_status_as_error(false)
                .timeout_recv_body(Some(session.request_timeout))
                .timeout_global(Some(session.resource_timeout))
                .build()
                .new_agent();
            Self {
                agent,
                download_dir: std::env::temp_dir(),
            }
        }

        /// Directory that file deliveries are written to. Defaults to the system temp dir.
        pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
            self.download_dir = dir.into();
            self
        }

        fn execute_blocking(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
            let mut response = match (request.method, request.body.as_deref()) {
                (HttpMethod::Get, _) => {
                    let mut builder = self.agent.get(&request.url);
                    for (name, value) in &request.headers {
                        builder = builder.header(name, value);
                    }
                    builder.call()
                }
                (HttpMethod::Delete, None) => {
                    let mut builder = self.agent.delete(&request.url);
                    for (name, value) in &request.headers {
                        builder = builder.header(name, value);
                    }
                    builder.call()
                }
                (HttpMethod::Delete, Some(body)) => {
                    let mut builder = self.agent.delete(&request.url).force_send_body();
                    for (name, value) in &request.headers {
                        builder = builder.header(name, value);
                    }
                    builder.send(body)
                }
                (HttpMethod::Post | HttpMethod::Put, body) => {
                    let mut builder = if request.method == HttpMethod::Post {
                        self.agent.post(&request.url)
                    } else {
                        self.agent.put(&request.url)
                    };
                    for (name, value) in &request.headers {
                        builder = builder.header(name, value);
                    }
                    match body {
                        Some(body) => builder.send(body),
                        None => builder.send_empty(),
                    }
                }
            }
            .map_err(|e| TransportError::new(e.to_string()))?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_string(), value.to_string()))
                })
                .collect();

            let mut body = Vec::new();
            response
                .body_mut()
                .as_reader()
                .read_to_end(&mut body)
                .map_err(|e| TransportError::with_status(status, e.to_string()))?;

            let mut url = None;
            if request.delivery == Delivery::File && (200..300).contains(&status) {
                let path = self.download_dir.join(format!("netops-{}", uuid::Uuid::new_v4()));
                std::fs::write(&path, &body)
                    .map_err(|e| TransportError::with_status(status, e.to_string()))?;
                url = url::Url::from_file_path(&path).ok().map(String::from);
                body.clear();
            }

            Ok(HttpResponse {
                status,
                headers,
                body: Bytes::from(body),
                url,
            })
        }
    }

    #[async_trait]
    impl Transport for UreqTransport {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            debug!(method = request.method.as_str(), url = %request.url, "dispatching request");
            let transport = self.clone();
            tokio::task::spawn_blocking(move || transport.execute_blocking(&request))
                .await
                .map_err(|e| TransportError::new(format!("transport worker failed: {e}")))?
        }
    }
}
