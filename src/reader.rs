// src/reader.rs
use std::collections::VecDeque;
use std::ffi::CString;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, error, info, warn};
use pcsc::{
    Context, Disposition, PNP_NOTIFICATION, Protocols, ReaderState, Scope, ShareMode, State,
};

use crate::apdu;
use crate::error::TransportError;
use crate::transport::CardTransport;
use crate::types::ApduResponse;

// Status changes are polled in slices so shutdown is noticed
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// PC/SC backed transport watching every attached reader.
pub struct PcscTransport {
    ctx: Context,
    reader_states: Vec<ReaderState>,
    arrivals: VecDeque<CString>,
    shutdown: Arc<AtomicBool>,
}

/// One card presentation on a named reader.
pub struct PcscCard {
    reader: CString,
    handle: Option<pcsc::Card>,
}

impl PcscTransport {
    pub fn new(ctx: Context, shutdown: Arc<AtomicBool>) -> Self {
        let mut transport = PcscTransport {
            ctx,
            reader_states: Vec::new(),
            arrivals: VecDeque::new(),
            shutdown,
        };
        transport.reset();
        transport
    }

    pub fn establish(shutdown: Arc<AtomicBool>) -> Result<Self, TransportError> {
        let ctx = Context::establish(Scope::User)?;
        Ok(Self::new(ctx, shutdown))
    }

    /// Rebuilds the reader list and records what is already inserted, so
    /// cards lying on a reader at startup are not reported as new.
    fn reset(&mut self) {
        self.reader_states = vec![ReaderState::new(PNP_NOTIFICATION(), State::UNAWARE)];
        self.arrivals.clear();
        if let Err(err) = self.refresh_readers() {
            error!("Failed to list readers: {}", err);
        }

        match self
            .ctx
            .get_status_change(Duration::ZERO, &mut self.reader_states)
        {
            Ok(()) | Err(pcsc::Error::Timeout) => {}
            Err(err) => warn!("Initial reader scan failed: {}", err),
        }
        for rs in &mut self.reader_states {
            rs.sync_current_state();
        }
    }

    fn refresh_readers(&mut self) -> Result<(), pcsc::Error> {
        let names = match self.ctx.list_readers_owned() {
            Ok(names) => names,
            Err(pcsc::Error::NoReadersAvailable) => Vec::new(),
            Err(err) => return Err(err),
        };

        // Index 0 is the PnP pseudo reader and always stays
        self.reader_states.retain(|rs| {
            rs.name() == PNP_NOTIFICATION() || names.iter().any(|n| n.as_c_str() == rs.name())
        });
        for name in names {
            if !self
                .reader_states
                .iter()
                .any(|rs| rs.name() == name.as_c_str())
            {
                info!("Reader attached: {:?}", name);
                self.reader_states
                    .push(ReaderState::new(name, State::UNAWARE));
            }
        }

        if self.reader_states.len() == 1 {
            warn!("No card reader connected");
        }
        Ok(())
    }

    fn process_changes(&mut self) {
        let mut readers_changed = false;

        for rs in self.reader_states.iter_mut() {
            let event = rs.event_state();
            if !event.intersects(State::CHANGED) {
                continue;
            }

            if rs.name() == PNP_NOTIFICATION() {
                readers_changed = true;
            } else if is_arrival(rs.current_state(), event) {
                info!("Card inserted on {:?}", rs.name());
                self.arrivals.push_back(rs.name().to_owned());
            } else if is_removal(rs.current_state(), event) {
                debug!("Card removed from {:?}", rs.name());
            }

            rs.sync_current_state();
        }

        if readers_changed {
            info!("Hardware change detected");
            if let Err(err) = self.refresh_readers() {
                error!("Failed to list readers: {}", err);
            }
        }
    }
}

/// A card counts as new only when the reader goes from not present to present.
/// Our own connect flips the reader to `PRESENT | INUSE`, which is not an arrival.
fn is_arrival(current: State, event: State) -> bool {
    event.intersects(State::PRESENT) && !current.intersects(State::PRESENT)
}

fn is_removal(current: State, event: State) -> bool {
    event.intersects(State::EMPTY) && current.intersects(State::PRESENT)
}

impl CardTransport for PcscTransport {
    type Card = PcscCard;

    fn wait_for_new_card(&mut self) -> Result<PcscCard, TransportError> {
        loop {
            if let Some(reader) = self.arrivals.pop_front() {
                return Ok(PcscCard {
                    reader,
                    handle: None,
                });
            }
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(TransportError::Cancelled);
            }

            match self
                .ctx
                .get_status_change(POLL_INTERVAL, &mut self.reader_states)
            {
                Ok(()) => self.process_changes(),
                Err(pcsc::Error::Timeout) => {}
                Err(pcsc::Error::Cancelled) => return Err(TransportError::Cancelled),
                Err(
                    err @ (pcsc::Error::NoService
                    | pcsc::Error::ServiceStopped
                    | pcsc::Error::InvalidHandle),
                ) => {
                    error!("PCSC service lost: {}", err);
                    std::thread::sleep(ERROR_BACKOFF);
                    match Context::establish(Scope::User) {
                        Ok(ctx) => {
                            info!("PCSC context re-established");
                            self.ctx = ctx;
                            self.reset();
                        }
                        Err(err) => error!("Failed to re-establish context: {}", err),
                    }
                }
                Err(err) => {
                    error!("PCSC Error: {}", err);
                    std::thread::sleep(ERROR_BACKOFF);
                }
            }
        }
    }

    fn connect(&mut self, card: &mut PcscCard) -> Result<(), TransportError> {
        match self
            .ctx
            .connect(&card.reader, ShareMode::Shared, Protocols::ANY)
        {
            Ok(handle) => {
                card.handle = Some(handle);
                Ok(())
            }
            Err(
                pcsc::Error::NoSmartcard
                | pcsc::Error::RemovedCard
                | pcsc::Error::UnpoweredCard
                | pcsc::Error::UnresponsiveCard,
            ) => Err(TransportError::NoCard(
                card.reader.to_string_lossy().into_owned(),
            )),
            Err(err) => Err(TransportError::Reader(err)),
        }
    }

    fn transmit(
        &mut self,
        card: &mut PcscCard,
        command: &[u8],
    ) -> Result<ApduResponse, TransportError> {
        let handle = card
            .handle
            .as_ref()
            .ok_or_else(|| TransportError::Fault("card is not connected".into()))?;

        let mut recv_buffer = [0u8; pcsc::MAX_BUFFER_SIZE];
        let resp = handle
            .transmit(command, &mut recv_buffer)
            .map_err(|e| TransportError::Fault(e.to_string()))?;

        apdu::split_status(resp)
            .ok_or_else(|| TransportError::Fault(format!("short response: {:02X?}", resp)))
    }

    fn disconnect(&mut self, card: PcscCard) {
        if let Some(handle) = card.handle {
            if let Err((_, err)) = handle.disconnect(Disposition::LeaveCard) {
                warn!("Failed to disconnect from {:?}: {}", card.reader, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_placed_on_empty_reader_is_new() {
        assert!(is_arrival(State::EMPTY, State::CHANGED | State::PRESENT));
    }

    #[test]
    fn test_own_connect_does_not_retrigger() {
        assert!(!is_arrival(
            State::PRESENT,
            State::CHANGED | State::PRESENT | State::INUSE
        ));
        assert!(!is_arrival(
            State::PRESENT | State::INUSE,
            State::CHANGED | State::PRESENT
        ));
    }

    #[test]
    fn test_removal_is_not_an_arrival() {
        let current = State::PRESENT;
        let event = State::CHANGED | State::EMPTY;
        assert!(!is_arrival(current, event));
        assert!(is_removal(current, event));
    }

    #[test]
    fn test_hot_plugged_reader_with_card_is_new() {
        assert!(is_arrival(State::UNAWARE, State::CHANGED | State::PRESENT));
    }

    #[test]
    fn test_card_left_on_reader_after_sync_is_not_new() {
        // After priming, current mirrors the event state
        let primed = State::PRESENT;
        assert!(!is_arrival(primed, State::PRESENT));
        assert!(!is_removal(State::EMPTY, State::EMPTY));
    }
}
