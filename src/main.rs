mod apdu;
mod config;
mod error;
mod identifier;
mod nfc_service;
mod platform;
mod reader;
mod rpc;
mod sink;
mod transport;
mod types;
mod ws;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Parser;
use futures::{Stream, StreamExt};
use log::{info, warn};
use tokio::sync::oneshot;

use config::Settings;
use error::TransportError;
use nfc_service::CardMonitor;
use platform::Platform;
use reader::PcscTransport;
use rpc::RpcClient;
use sink::{FileSink, KeySink, RpcSink, Sink, SinkKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_file = config::load_env_file(None);
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match env_file {
        Ok(Some(path)) => info!("Loaded settings from {}", path.display()),
        Ok(None) => {}
        Err(err) => warn!("Ignoring .env file: {}", err),
    }
    let settings = Settings::parse();
    info!("Starting card tap service...");

    let platform: Arc<dyn Platform> = Arc::from(platform::native());

    // Unreachable server is fatal before the reader is touched
    let sink: Box<dyn Sink> = match settings.sink {
        SinkKind::Rpc => {
            let client = RpcClient::connect(&settings.server_uri, settings.rpc_timeout())
                .await
                .with_context(|| format!("cannot reach API server {}", settings.server_uri))?;
            info!("Connected to {}", settings.server_uri);
            Box::new(RpcSink::new(
                tokio::runtime::Handle::current(),
                settings.server_uri.clone(),
                client,
                settings.rpc_timeout(),
                settings.slot,
                settings.retry_policy(),
            ))
        }
        SinkKind::File => Box::new(FileSink::new(settings.output_file.clone())),
        SinkKind::Key => Box::new(KeySink::new(platform.clone(), settings.key)),
    };

    let shutdown = Arc::new(AtomicBool::new(false));

    // PC/SC calls block, so the card loop gets its own OS thread
    let (done_tx, mut done_rx) = oneshot::channel();
    let thread_shutdown = shutdown.clone();
    std::thread::spawn(move || {
        let result = PcscTransport::establish(thread_shutdown.clone()).and_then(|transport| {
            CardMonitor::new(
                transport,
                sink,
                platform,
                settings.id_format,
                settings.beep,
                thread_shutdown,
            )
            .run()
        });
        let _ = done_tx.send(result);
    });

    let interrupts = futures::stream::unfold((), |()| async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Some(((), ())),
            Err(err) => {
                warn!("Cannot listen for Ctrl-C: {}", err);
                None
            }
        }
    });
    let mut interrupts = std::pin::pin!(interrupts);

    match supervise(&mut done_rx, &shutdown, &mut interrupts).await {
        Exit::Finished(Ok(Ok(()))) => {
            info!("Stopped");
            Ok(())
        }
        Exit::Finished(Ok(Err(err))) => Err(err).context("card reader failed"),
        Exit::Finished(Err(_)) => anyhow::bail!("card thread panicked"),
        Exit::Forced => anyhow::bail!("interrupted twice, card thread abandoned"),
    }
}

type CardThreadResult = Result<(), TransportError>;

enum Exit {
    Finished(Result<CardThreadResult, oneshot::error::RecvError>),
    Forced,
}

/// Waits for the card thread. The first interrupt asks it to stop after the
/// current card; a second one gives up on it, e.g. when an RPC call without
/// a timeout never returns.
async fn supervise<S>(
    done: &mut oneshot::Receiver<CardThreadResult>,
    shutdown: &AtomicBool,
    interrupts: &mut S,
) -> Exit
where
    S: Stream<Item = ()> + Unpin,
{
    tokio::select! {
        result = &mut *done => return Exit::Finished(result),
        Some(()) = interrupts.next() => {
            info!("Interrupted, finishing current card (Ctrl-C again to quit now)...");
            shutdown.store(true, Ordering::Relaxed);
        }
    }

    tokio::select! {
        result = &mut *done => Exit::Finished(result),
        Some(()) = interrupts.next() => {
            warn!("Interrupted again, not waiting for the card reader");
            Exit::Forced
        }
    }
}
