// src/apdu.rs
use crate::types::ApduResponse;

// PC/SC pseudo-APDU understood by contactless readers (ACR122U etc.)
// CMD: FF CA 00 00 00 -> UID of the card in the field
pub const GET_UID: [u8; 5] = [0xFF, 0xCA, 0x00, 0x00, 0x00];

/// Splits a raw reader response into payload and trailing status word.
/// Returns `None` when the reader sent fewer than two bytes.
pub fn split_status(resp: &[u8]) -> Option<ApduResponse> {
    if resp.len() < 2 {
        return None;
    }
    let (data, sw) = resp.split_at(resp.len() - 2);
    Some(ApduResponse {
        data: data.to_vec(),
        sw1: sw[0],
        sw2: sw[1],
    })
}
