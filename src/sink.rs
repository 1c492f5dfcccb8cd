// src/sink.rs
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use log::{info, warn};
use tokio::runtime::Handle;

use crate::error::{RpcError, SinkError};
use crate::platform::{Key, Platform};
use crate::rpc::RpcClient;
use crate::types::{CardIdentifier, Slot};

/// Where a derived card id ends up.
pub trait Sink: Send {
    fn name(&self) -> &'static str;

    fn dispatch(&mut self, card_id: &CardIdentifier) -> Result<(), SinkError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SinkKind {
    Rpc,
    File,
    Key,
}

/// Overwrites a file with the bare id on every read. Last write wins.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSink { path: path.into() }
    }
}

impl Sink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    fn dispatch(&mut self, card_id: &CardIdentifier) -> Result<(), SinkError> {
        fs::write(&self.path, card_id.as_str())?;
        Ok(())
    }
}

/// Taps a key so external automation knows a card was read. The id itself
/// is not transmitted.
pub struct KeySink {
    platform: Arc<dyn Platform>,
    key: Key,
}

impl KeySink {
    pub fn new(platform: Arc<dyn Platform>, key: Key) -> Self {
        KeySink { platform, key }
    }
}

impl Sink for KeySink {
    fn name(&self) -> &'static str {
        "key"
    }

    fn dispatch(&mut self, _card_id: &CardIdentifier) -> Result<(), SinkError> {
        self.platform.press_key(self.key)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

const MAX_BACKOFF: Duration = Duration::from_secs(5);

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(MAX_BACKOFF)
    }
}

/// Inserts the card into the remote game over RPC.
///
/// Runs on the blocking card thread and drives the async client through a
/// runtime handle. A lost connection is re-opened with backoff; once the
/// retries are spent the dispatch fails and the next card tries again.
pub struct RpcSink {
    runtime: Handle,
    uri: String,
    timeout: Option<Duration>,
    client: Option<Arc<RpcClient>>,
    slot: Slot,
    policy: RetryPolicy,
}

impl RpcSink {
    pub fn new(
        runtime: Handle,
        uri: impl Into<String>,
        client: RpcClient,
        timeout: Option<Duration>,
        slot: Slot,
        policy: RetryPolicy,
    ) -> Self {
        RpcSink {
            runtime,
            uri: uri.into(),
            timeout,
            client: Some(Arc::new(client)),
            slot,
            policy,
        }
    }

    fn client(&mut self) -> Result<Arc<RpcClient>, RpcError> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let client = Arc::new(
            self.runtime
                .block_on(RpcClient::connect(&self.uri, self.timeout))?,
        );
        info!("Reconnected to {}", self.uri);
        self.client = Some(client.clone());
        Ok(client)
    }
}

impl Sink for RpcSink {
    fn name(&self) -> &'static str {
        "rpc"
    }

    fn dispatch(&mut self, card_id: &CardIdentifier) -> Result<(), SinkError> {
        let mut attempt = 0;
        loop {
            let result = self.client().and_then(|client| {
                self.runtime
                    .block_on(client.card_insert(self.slot, card_id))
            });

            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < self.policy.retries => {
                    let delay = self.policy.delay(attempt);
                    warn!(
                        "RPC attempt {} failed: {}; retrying in {:?}",
                        attempt + 1,
                        err,
                        delay
                    );
                    self.client = None;
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_transient() {
                        self.client = None;
                    }
                    return Err(err.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::identifier::derive;
    use crate::platform::mock::MockPlatform;
    use crate::rpc::test_server::{Reply, spawn};
    use crate::types::IdFormat;

    fn card(uid: &[u8]) -> CardIdentifier {
        derive(uid, IdFormat::Plain)
    }

    fn temp_path(name: &str) -> PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("card-tap-{}-{}-{}", std::process::id(), n, name))
    }

    #[test]
    fn test_file_sink_truncates() {
        let path = temp_path("card.txt");
        let mut sink = FileSink::new(&path);

        sink.dispatch(&card(b"first")).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), card(b"first").as_str());

        fs::write(&path, "a much longer leftover line from someone else").unwrap();
        sink.dispatch(&card(b"second")).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), card(b"second").as_str());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_file_sink_reports_io_errors() {
        let path = temp_path("missing-dir").join("card.txt");
        let mut sink = FileSink::new(path);
        assert!(matches!(sink.dispatch(&card(b"x")), Err(SinkError::Io(_))));
    }

    #[test]
    fn test_key_sink_presses_configured_key() {
        let platform = Arc::new(MockPlatform::default());
        let mut sink = KeySink::new(platform.clone(), Key::Function(12));

        sink.dispatch(&card(b"a")).unwrap();
        sink.dispatch(&card(b"b")).unwrap();

        assert_eq!(*platform.keys.lock().unwrap(), vec![Key::Function(12); 2]);
    }

    #[test]
    fn test_key_sink_failure() {
        let platform = Arc::new(MockPlatform {
            should_fail: true,
            ..Default::default()
        });
        let mut sink = KeySink::new(platform, Key::Enter);
        assert!(matches!(
            sink.dispatch(&card(b"a")),
            Err(SinkError::Platform(_))
        ));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            retries: 10,
            backoff: Duration::from_millis(250),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(250));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(9), MAX_BACKOFF);
    }

    fn rpc_sink(
        rt: &tokio::runtime::Runtime,
        script: Vec<Vec<Reply>>,
    ) -> (RpcSink, UnboundedReceiver<serde_json::Value>) {
        let (uri, seen) = rt.block_on(spawn(script));
        let timeout = Some(Duration::from_secs(5));
        let client = rt.block_on(RpcClient::connect(&uri, timeout)).unwrap();
        let policy = RetryPolicy {
            retries: 2,
            backoff: Duration::from_millis(10),
        };
        let sink = RpcSink::new(rt.handle().clone(), uri, client, timeout, Slot::P1, policy);
        (sink, seen)
    }

    #[test]
    fn test_rpc_sink_reconnects_after_hangup() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (mut sink, mut seen) = rpc_sink(&rt, vec![vec![Reply::Hangup], vec![Reply::Ok]]);

        sink.dispatch(&card(b"a")).unwrap();

        // Same card sent once per connection
        let first = seen.try_recv().unwrap();
        let second = seen.try_recv().unwrap();
        assert_eq!(first["params"], second["params"]);
        assert_ne!(first["id"], second["id"]);
    }

    #[test]
    fn test_rpc_sink_does_not_retry_protocol_errors() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (mut sink, mut seen) = rpc_sink(&rt, vec![vec![Reply::Errors(&["bad params"])]]);

        let err = sink.dispatch(&card(b"a")).unwrap_err();
        assert!(
            matches!(err, SinkError::Rpc(RpcError::Protocol { .. })),
            "{err:?}"
        );
        assert!(seen.try_recv().is_ok());
        assert!(seen.try_recv().is_err());
    }

    #[test]
    fn test_rpc_sink_gives_up_when_server_is_gone() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (mut sink, _seen) = rpc_sink(&rt, vec![vec![Reply::Hangup]]);

        // The listener only served one connection, reconnects are refused
        let err = sink.dispatch(&card(b"a")).unwrap_err();
        assert!(
            matches!(
                err,
                SinkError::Rpc(RpcError::Connection { .. } | RpcError::Closed)
            ),
            "{err:?}"
        );
    }
}
