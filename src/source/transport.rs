//! HTTP transport seam.
//!
//! [`HttpSource`](super::HttpSource) only needs "open a URL and give me a
//! byte reader". The default implementation uses `ureq`; tests and embedders
//! can inject their own.

use std::fmt;
use std::io::Read;
use std::time::Duration;

use crate::Result;

/// Timeouts for one HTTP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub response: Duration,
    /// Longest wait for the next body bytes before the stream counts as stalled.
    pub read: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            response: Duration::from_secs(10),
            read: Duration::from_secs(5),
        }
    }
}

/// An open HTTP response.
pub struct HttpResponse {
    pub status: u16,
    /// Declared body length, if the server sent one.
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Opens HTTP GET requests.
///
/// Implementations map their failures onto the crate error type:
/// network problems to [`Error::NetworkUnavailable`](crate::Error::NetworkUnavailable),
/// expired timeouts to [`Error::Timeout`](crate::Error::Timeout) and
/// non-success statuses to [`Error::HttpStatus`](crate::Error::HttpStatus).
/// The body reader may block; [`HttpSource`](super::HttpSource) bounds each
/// read by [`HttpTimeouts::read`].
pub trait HttpTransport: Send {
    fn open(&mut self, url: &str, timeouts: &HttpTimeouts) -> Result<HttpResponse>;
}

impl<T: HttpTransport + ?Sized> HttpTransport for Box<T> {
    fn open(&mut self, url: &str, timeouts: &HttpTimeouts) -> Result<HttpResponse> {
        (**self).open(url, timeouts)
    }
}

#[cfg(feature = "http")]
pub use self::ureq_transport::UreqTransport;

#[cfg(feature = "http")]
mod ureq_transport {
    use std::{fmt, io};

    use super::{HttpResponse, HttpTimeouts, HttpTransport};
    use crate::{Error, Result};

    /// [`HttpTransport`] backed by a `ureq` agent.
    ///
    /// One agent is kept across reconnects and rebuilt only when the
    /// timeouts change. No body timeout is set on the agent: ureq's is a
    /// deadline for the whole body, which an endless camera stream would hit.
    #[derive(Default)]
    pub struct UreqTransport {
        agent: Option<(HttpTimeouts, ureq::Agent)>,
    }

    impl UreqTransport {
        pub fn new() -> Self {
            Self::default()
        }

        fn agent(&mut self, timeouts: &HttpTimeouts) -> &ureq::Agent {
            if matches!(&self.agent, Some((current, _)) if current != timeouts) {
                self.agent = None;
            }
            let (_, agent) = self.agent.get_or_insert_with(|| {
                let config = ureq::Agent::config_builder()
                    .timeout_connect(Some(timeouts.connect))
                    .timeout_recv_response(Some(timeouts.response))
                    .build();
                (*timeouts, ureq::Agent::new_with_config(config))
            });
            agent
        }
    }

    impl fmt::Debug for UreqTransport {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("UreqTransport")
                .field("timeouts", &self.agent.as_ref().map(|(t, _)| t))
                .finish()
        }
    }

    fn map_error(url: &str, err: ureq::Error) -> Error {
        match err {
            ureq::Error::StatusCode(status) => Error::HttpStatus(status),
            ureq::Error::Timeout(which) => Error::Timeout(format!("{url}: {which}")),
            ureq::Error::Io(e) if e.kind() == io::ErrorKind::TimedOut => {
                Error::Timeout(format!("{url}: {e}"))
            }
            other => Error::NetworkUnavailable(format!("{url}: {other}")),
        }
    }

    impl HttpTransport for UreqTransport {
        fn open(&mut self, url: &str, timeouts: &HttpTimeouts) -> Result<HttpResponse> {
            let response = self
                .agent(timeouts)
                .get(url)
                .call()
                .map_err(|e| map_error(url, e))?;

            let status = response.status().as_u16();
            if status != 200 {
                return Err(Error::HttpStatus(status));
            }

            let content_length = response.body().content_length();
            let body = response.into_body().into_reader();
            Ok(HttpResponse {
                status,
                content_length,
                body: Box::new(body),
            })
        }
    }
}
