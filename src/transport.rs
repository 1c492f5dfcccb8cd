// src/transport.rs
use crate::error::TransportError;
use crate::types::ApduResponse;

/// Blocking access to a card reader.
///
/// `Card` is whatever the implementation needs to remember about one
/// presentation. The monitor loop hands it back to `disconnect` exactly once,
/// whether or not `connect` succeeded.
pub trait CardTransport {
    type Card;

    /// Blocks until a card that was not already on the reader shows up.
    fn wait_for_new_card(&mut self) -> Result<Self::Card, TransportError>;

    fn connect(&mut self, card: &mut Self::Card) -> Result<(), TransportError>;

    fn transmit(
        &mut self,
        card: &mut Self::Card,
        command: &[u8],
    ) -> Result<ApduResponse, TransportError>;

    fn disconnect(&mut self, card: Self::Card);
}
