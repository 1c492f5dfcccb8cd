// src/nfc_service.rs
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info, trace};

use crate::apdu::GET_UID;
use crate::error::TransportError;
use crate::identifier;
use crate::platform::Platform;
use crate::sink::Sink;
use crate::transport::CardTransport;
use crate::types::{CardIdentifier, IdFormat};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Idle,
    Connecting,
    Querying,
    Dispatching,
    Disconnecting,
}

/// Result of one card presentation.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Dispatched(CardIdentifier),
    DispatchFailed(CardIdentifier),
    NoCard,
    TransportFault,
    /// Status word other than 90 00
    NotSuccess(u8, u8),
}

pub struct CardMonitor<T: CardTransport> {
    transport: T,
    sink: Box<dyn Sink>,
    platform: Arc<dyn Platform>,
    format: IdFormat,
    beep: bool,
    shutdown: Arc<AtomicBool>,
    stage: Stage,
}

impl<T: CardTransport> CardMonitor<T> {
    pub fn new(
        transport: T,
        sink: Box<dyn Sink>,
        platform: Arc<dyn Platform>,
        format: IdFormat,
        beep: bool,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        CardMonitor {
            transport,
            sink,
            platform,
            format,
            beep,
            shutdown,
            stage: Stage::Idle,
        }
    }

    /// Handles cards until shutdown is requested.
    ///
    /// Only reader failures the transport could not recover from end the
    /// loop with an error. Everything that goes wrong with a single card is
    /// logged and the loop keeps going.
    pub fn run(&mut self) -> Result<(), TransportError> {
        info!("Waiting for cards (sink: {})", self.sink.name());
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("Card monitor stopping");
                return Ok(());
            }
            match self.poll_once() {
                Ok(_) => {}
                Err(TransportError::Cancelled) => {
                    info!("Card monitor stopping");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Waits for one new card and processes it. The card is disconnected on
    /// every path once it has been handed out by the transport.
    pub fn poll_once(&mut self) -> Result<Outcome, TransportError> {
        self.enter(Stage::Idle);
        let mut card = self.transport.wait_for_new_card()?;

        let outcome = self.process(&mut card);

        self.enter(Stage::Disconnecting);
        self.transport.disconnect(card);
        self.enter(Stage::Idle);
        Ok(outcome)
    }

    fn process(&mut self, card: &mut T::Card) -> Outcome {
        self.enter(Stage::Connecting);
        if let Err(err) = self.transport.connect(card) {
            error!("{}", err);
            return match err {
                TransportError::NoCard(_) => Outcome::NoCard,
                _ => Outcome::TransportFault,
            };
        }

        self.enter(Stage::Querying);
        let resp = match self.transport.transmit(card, &GET_UID) {
            Ok(resp) => resp,
            Err(err) => {
                error!("{}", err);
                return Outcome::TransportFault;
            }
        };
        if !resp.is_success() {
            debug!("No UID, status {:02X} {:02X}", resp.sw1, resp.sw2);
            return Outcome::NotSuccess(resp.sw1, resp.sw2);
        }

        self.enter(Stage::Dispatching);
        let card_id = identifier::derive(&resp.data, self.format);
        info!("Card found: {}", card_id);
        if self.beep {
            self.platform.beep();
        }

        match self.sink.dispatch(&card_id) {
            Ok(()) => Outcome::Dispatched(card_id),
            Err(err) => {
                error!("{} sink failed for {}: {}", self.sink.name(), card_id, err);
                Outcome::DispatchFailed(card_id)
            }
        }
    }

    fn enter(&mut self, stage: Stage) {
        trace!("{:?} -> {:?}", self.stage, stage);
        self.stage = stage;
    }
}
