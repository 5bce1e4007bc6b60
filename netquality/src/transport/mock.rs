//! Scripted transport for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{
    BoxFuture, ProbeResponse, ProbeTransport, ResourceTiming, ResourceTimingSource,
    TimingRecorder, TransportError,
};

/// One scripted reply.
#[derive(Debug, Clone)]
pub(crate) enum MockReply {
    /// Wait `delay` (virtual time under a paused runtime), then respond.
    Respond {
        delay: Duration,
        server_timing: Option<String>,
    },
    /// Fail immediately.
    Fail(TransportError),
}

impl MockReply {
    pub(crate) fn after(delay: Duration) -> Self {
        MockReply::Respond {
            delay,
            server_timing: None,
        }
    }

    /// Respond after `delay` with a `server-timing` header.
    pub(crate) fn with_server_timing(delay: Duration, value: &str) -> Self {
        MockReply::Respond {
            delay,
            server_timing: Some(value.to_string()),
        }
    }

    pub(crate) fn fail() -> Self {
        MockReply::Fail(TransportError::Request("connection reset".to_string()))
    }
}

/// Transport that replays a queue of replies, then a fallback reply.
///
/// The body size of a successful reply is taken from the `bytes=` query
/// parameter so responses look like the probe endpoint's.
#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    script: Mutex<VecDeque<MockReply>>,
    fallback: Option<MockReply>,
    requests: Mutex<Vec<String>>,
    recorder: Option<Arc<TimingRecorder>>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reply with `reply` once the script is exhausted.
    pub(crate) fn with_fallback(mut self, reply: MockReply) -> Self {
        self.fallback = Some(reply);
        self
    }

    /// Queue replies in order.
    pub(crate) fn with_script(self, replies: impl IntoIterator<Item = MockReply>) -> Self {
        self.script.lock().extend(replies);
        self
    }

    /// Record a timing entry per successful reply, like a real transport.
    pub(crate) fn with_recorder(mut self, recorder: Arc<TimingRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// URLs requested so far.
    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

pub(crate) fn requested_bytes(url: &str) -> u64 {
    url.split(['?', '&'])
        .find_map(|part| part.strip_prefix("bytes="))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

impl ProbeTransport for MockTransport {
    fn fetch(&self, url: &str) -> BoxFuture<'_, Result<ProbeResponse, TransportError>> {
        let url = url.to_string();
        self.requests.lock().push(url.clone());
        let reply = self.script.lock().pop_front().or_else(|| self.fallback.clone());
        let recorder = self.recorder.clone();

        Box::pin(async move {
            match reply {
                Some(MockReply::Respond {
                    delay,
                    server_timing,
                }) => {
                    tokio::time::sleep(delay).await;
                    if let Some(recorder) = recorder {
                        let total_ms = delay.as_millis() as f64;
                        recorder.record(
                            url.clone(),
                            ResourceTiming {
                                request_start: 0.0,
                                response_start: total_ms / 2.0,
                                response_end: total_ms,
                                transfer_size: None,
                            },
                        );
                    }
                    let mut response = ProbeResponse::new(url.clone(), requested_bytes(&url));
                    if let Some(value) = server_timing {
                        response = response.with_header("server-timing", value);
                    }
                    Ok(response)
                }
                Some(MockReply::Fail(err)) => Err(err),
                None => Err(TransportError::Request("no scripted reply".to_string())),
            }
        })
    }

    fn resource_timing(&self) -> Option<Arc<dyn ResourceTimingSource>> {
        self.recorder
            .clone()
            .map(|recorder| recorder as Arc<dyn ResourceTimingSource>)
    }
}
