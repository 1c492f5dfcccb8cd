// src/identifier.rs
use sha1::{Digest, Sha1};

use crate::types::{CardIdentifier, ID_LEN, ID_PREFIX, IdFormat};

/// Turns raw card UID bytes into the id every sink sees.
///
/// The UID is hashed with SHA-1 so the result has a fixed length no matter
/// how many bytes the card reports. Any input is valid, including an empty
/// slice.
pub fn derive(uid: &[u8], format: IdFormat) -> CardIdentifier {
    let digest = hex::encode(Sha1::digest(uid));

    let id = match format {
        IdFormat::Prefixed => {
            let mut id = String::with_capacity(ID_LEN);
            id.push_str(ID_PREFIX);
            id.push_str(&digest[..ID_LEN - ID_PREFIX.len()]);
            id
        }
        IdFormat::Plain => digest[..ID_LEN].to_string(),
    };

    CardIdentifier::new(id)
}
