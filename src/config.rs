// src/config.rs
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::platform::Key;
use crate::sink::{RetryPolicy, SinkKind};
use crate::types::{IdFormat, Slot};

/// Tap smartcards to insert them into a game through the SpiceTools API.
///
/// Every option can also be set through the environment variable shown, or
/// through a `.env` file in the working directory or one of its parents.
#[derive(Parser, Debug, Clone)]
#[command(name = "spice-card-tap", version)]
pub struct Settings {
    /// URI of the SpiceTools API server
    #[arg(long, env = "SCT_SERVER_URI", default_value = "ws://localhost:1338/")]
    pub server_uri: String,

    /// Beep at the user on successful card read
    #[arg(long, env = "SCT_BEEP", default_value_t = true, action = ArgAction::Set)]
    pub beep: bool,

    /// What to do with a card id
    #[arg(long, env = "SCT_SINK", value_enum, default_value_t = SinkKind::Rpc)]
    pub sink: SinkKind,

    /// Card id shape
    #[arg(long, env = "SCT_ID_FORMAT", value_enum, default_value_t = IdFormat::Prefixed)]
    pub id_format: IdFormat,

    /// Player slot the card is inserted into (rpc sink)
    #[arg(long, env = "SCT_SLOT", value_enum, default_value_t = Slot::P1)]
    pub slot: Slot,

    /// File rewritten with each card id (file sink)
    #[arg(long, env = "SCT_OUTPUT_FILE", default_value = "card_id.txt")]
    pub output_file: PathBuf,

    /// Key pressed for each card, e.g. F12, Enter or A (key sink)
    #[arg(long, env = "SCT_KEY", default_value = "F12")]
    pub key: Key,

    /// Milliseconds to wait for an RPC response, 0 waits forever
    #[arg(long, env = "SCT_RPC_TIMEOUT_MS", default_value_t = 5000)]
    pub rpc_timeout_ms: u64,

    /// Reconnect attempts when the RPC connection is lost
    #[arg(long, env = "SCT_RPC_RETRIES", default_value_t = 3)]
    pub rpc_retries: u32,

    /// Initial delay between reconnect attempts, doubled each time
    #[arg(long, env = "SCT_RPC_BACKOFF_MS", default_value_t = 250)]
    pub rpc_backoff_ms: u64,
}

impl Settings {
    pub fn rpc_timeout(&self) -> Option<Duration> {
        match self.rpc_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.rpc_retries,
            backoff: Duration::from_millis(self.rpc_backoff_ms),
        }
    }
}

/// Copies `KEY=value` lines from a `.env` file into the environment. Variables
/// that are already set win over the file. With no `path` the file is searched
/// for from the working directory upwards; a missing file is not an error.
///
/// Runs before logging is set up so the file may carry `RUST_LOG` too.
pub fn load_env_file(path: Option<&Path>) -> Result<Option<PathBuf>, dotenvy::Error> {
    let loaded = match path {
        Some(path) => dotenvy::from_path(path).map(|()| path.to_path_buf()),
        None => dotenvy::dotenv(),
    };
    match loaded {
        Ok(path) => Ok(Some(path)),
        Err(err) if err.not_found() => Ok(None),
        Err(err) => Err(err),
    }
}
