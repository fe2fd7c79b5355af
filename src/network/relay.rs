use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header::CONNECTION, Url};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::RelayError;

pub const FLV_CONTENT_TYPE: &str = "video/x-flv";

/// Upstream side of a relay.
#[async_trait]
pub trait ChunkSource: Send {
    /// `Ok(None)` once the upstream body is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, RelayError>;
}

#[async_trait]
impl ChunkSource for reqwest::Response {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, RelayError> {
        Ok(self.chunk().await?)
    }
}

/// Downstream side of a relay, including the client-liveness probe.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Resolves once the downstream client is gone.
    async fn disconnected(&self);

    /// Returns `false` when the chunk could not be delivered.
    async fn forward(&mut self, chunk: Bytes) -> bool;
}

#[async_trait]
impl ChunkSink for mpsc::Sender<Bytes> {
    fn is_connected(&self) -> bool {
        !self.is_closed()
    }

    async fn disconnected(&self) {
        self.closed().await
    }

    async fn forward(&mut self, chunk: Bytes) -> bool {
        self.send(chunk).await.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Upstream body ended.
    Completed,
    /// Downstream client went away.
    Disconnected,
    /// Upstream failed mid-stream.
    UpstreamFailed,
}

/// Moves bytes from `source` to `sink` in pieces of at most `chunk_size`.
/// Liveness is checked before every piece; once the client is gone nothing
/// further is forwarded and no further chunk is pulled.
pub async fn pump<S, K>(source: &mut S, sink: &mut K, chunk_size: usize) -> RelayOutcome
where
    S: ChunkSource + ?Sized,
    K: ChunkSink + ?Sized,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = sink.disconnected() => return RelayOutcome::Disconnected,
            next = source.next_chunk() => next,
        };
        let mut chunk = match next {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return RelayOutcome::Completed,
            Err(e) => {
                debug!("Upstream ended with error: {}", e);
                return RelayOutcome::UpstreamFailed;
            }
        };
        while !chunk.is_empty() {
            let piece = chunk.split_to(chunk_size.min(chunk.len()));
            if !sink.is_connected() || !sink.forward(piece).await {
                return RelayOutcome::Disconnected;
            }
        }
    }
}

/// Proxies an upstream FLV feed to a downstream client.
#[derive(Clone)]
pub struct StreamRelay {
    client: reqwest::Client,
    chunk_size: usize,
    write_timeout: Duration,
}

impl StreamRelay {
    pub fn new(settings: &Settings) -> Result<Self, RelayError> {
        // No overall timeout: the feed is long-lived.
        let client = reqwest::Client::builder()
            .connect_timeout(settings.relay_connect_timeout())
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self {
            client,
            chunk_size: settings.relay_chunk_size,
            write_timeout: settings.relay_write_timeout(),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Sends the upstream request and checks its status. Nothing has been
    /// forwarded when this fails.
    pub async fn open(&self, target: &str) -> Result<reqwest::Response, RelayError> {
        let url = Url::parse(target).map_err(|e| RelayError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RelayError::InvalidUrl(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }

        let request = self.client.get(url).header(CONNECTION, "close").send();
        let response = tokio::time::timeout(self.write_timeout, request)
            .await
            .map_err(|_| RelayError::Timeout(self.write_timeout.as_secs()))??;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::UpstreamStatus(status.as_u16()));
        }
        Ok(response)
    }

    /// Starts pumping `upstream` on its own task. The returned receiver is the
    /// downstream body; dropping it is the disconnect signal.
    pub fn spawn_pump<S>(&self, mut upstream: S) -> mpsc::Receiver<Bytes>
    where
        S: ChunkSource + 'static,
    {
        // Capacity 1 keeps at most one chunk buffered.
        let (mut tx, rx) = mpsc::channel::<Bytes>(1);
        let chunk_size = self.chunk_size;
        let relay_id = Uuid::new_v4();
        tokio::spawn(async move {
            info!("Relay {} started", relay_id);
            let outcome = pump(&mut upstream, &mut tx, chunk_size).await;
            drop(upstream);
            match outcome {
                RelayOutcome::UpstreamFailed => warn!("Relay {} upstream failed", relay_id),
                outcome => info!("Relay {} finished: {:?}", relay_id, outcome),
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const CHUNK: usize = 8192;

    struct CountingSource {
        pulls: Arc<AtomicUsize>,
        remaining: Option<usize>,
        fail_after: Option<usize>,
    }

    impl CountingSource {
        fn endless(pulls: Arc<AtomicUsize>) -> Self {
            Self {
                pulls,
                remaining: None,
                fail_after: None,
            }
        }
    }

    #[async_trait]
    impl ChunkSource for CountingSource {
        async fn next_chunk(&mut self) -> Result<Option<Bytes>, RelayError> {
            let n = self.pulls.fetch_add(1, Ordering::SeqCst);
            if self.fail_after == Some(n) {
                return Err(RelayError::UpstreamStatus(500));
            }
            if let Some(remaining) = self.remaining.as_mut() {
                if *remaining == 0 {
                    return Ok(None);
                }
                *remaining -= 1;
            }
            Ok(Some(Bytes::from(vec![(n % 251) as u8; CHUNK])))
        }
    }

    /// Reports the client gone after `connected_for` forwarded chunks.
    struct RecordingSink {
        forwarded: Vec<Bytes>,
        connected_for: usize,
    }

    #[async_trait]
    impl ChunkSink for RecordingSink {
        fn is_connected(&self) -> bool {
            self.forwarded.len() < self.connected_for
        }

        async fn disconnected(&self) {
            std::future::pending::<()>().await
        }

        async fn forward(&mut self, chunk: Bytes) -> bool {
            self.forwarded.push(chunk);
            true
        }
    }

    struct ScriptedSource(VecDeque<Bytes>);

    #[async_trait]
    impl ChunkSource for ScriptedSource {
        async fn next_chunk(&mut self) -> Result<Option<Bytes>, RelayError> {
            Ok(self.0.pop_front())
        }
    }

    #[tokio::test]
    async fn test_disconnect_stops_within_one_chunk() {
        for n in [0, 1, 5] {
            let pulls = Arc::new(AtomicUsize::new(0));
            let mut source = CountingSource::endless(Arc::clone(&pulls));
            let mut sink = RecordingSink {
                forwarded: Vec::new(),
                connected_for: n,
            };

            let outcome = pump(&mut source, &mut sink, CHUNK).await;

            assert_eq!(outcome, RelayOutcome::Disconnected);
            assert_eq!(sink.forwarded.len(), n);
            assert!(pulls.load(Ordering::SeqCst) <= n + 1);
        }
    }

    #[tokio::test]
    async fn test_relay_is_byte_transparent_and_bounded() {
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 256) as u8).collect();
        let mut source = ScriptedSource(VecDeque::from(vec![
            Bytes::from(payload[..3].to_vec()),
            Bytes::new(),
            Bytes::from(payload[3..].to_vec()),
        ]));
        let mut sink = RecordingSink {
            forwarded: Vec::new(),
            connected_for: usize::MAX,
        };

        let outcome = pump(&mut source, &mut sink, CHUNK).await;

        assert_eq!(outcome, RelayOutcome::Completed);
        assert!(sink.forwarded.iter().all(|c| !c.is_empty() && c.len() <= CHUNK));
        assert_eq!(sink.forwarded.concat(), payload);
    }

    #[tokio::test]
    async fn test_upstream_error_ends_silently() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let mut source = CountingSource {
            pulls: Arc::clone(&pulls),
            remaining: None,
            fail_after: Some(2),
        };
        let mut sink = RecordingSink {
            forwarded: Vec::new(),
            connected_for: usize::MAX,
        };

        let outcome = pump(&mut source, &mut sink, CHUNK).await;

        assert_eq!(outcome, RelayOutcome::UpstreamFailed);
        assert_eq!(sink.forwarded.len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_receiver_stops_spawned_pump() {
        let relay = StreamRelay::new(&Settings::default()).unwrap();
        let pulls = Arc::new(AtomicUsize::new(0));
        let mut rx = relay.spawn_pump(CountingSource::endless(Arc::clone(&pulls)));

        for _ in 0..3 {
            assert_eq!(rx.recv().await.unwrap().len(), CHUNK);
        }
        drop(rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_drop = pulls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(pulls.load(Ordering::SeqCst), after_drop);
        assert!(after_drop <= 3 + 2);
    }

    #[tokio::test]
    async fn test_finite_upstream_completes() {
        let relay = StreamRelay::new(&Settings::default()).unwrap();
        let pulls = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            pulls,
            remaining: Some(4),
            fail_after: None,
        };
        let mut rx = relay.spawn_pump(source);

        let mut received = 0;
        while let Some(chunk) = rx.recv().await {
            received += chunk.len();
        }
        assert_eq!(received, 4 * CHUNK);
    }

    #[tokio::test]
    async fn test_open_rejects_bad_urls() {
        let relay = StreamRelay::new(&Settings::default()).unwrap();
        assert!(matches!(
            relay.open("not a url").await,
            Err(RelayError::InvalidUrl(_))
        ));
        assert!(matches!(
            relay.open("file:///etc/passwd").await,
            Err(RelayError::InvalidUrl(_))
        ));
    }
}
