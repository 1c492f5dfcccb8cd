// src/types.rs
use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize, Serializer};

// Vendor namespace used by e-amusement style card ids
pub const ID_PREFIX: &str = "e00401";
pub const ID_LEN: usize = 16;

/// Shape of the textual card id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum IdFormat {
    /// `e00401` followed by 10 digest characters
    Prefixed,
    /// First 16 digest characters
    Plain,
}

/// Canonical card id handed to sinks. Always 16 lowercase hex characters.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CardIdentifier(String);

impl CardIdentifier {
    pub(crate) fn new(value: String) -> Self {
        debug_assert_eq!(value.len(), ID_LEN);
        CardIdentifier(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CardIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reader response split into payload and status word.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApduResponse {
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}

impl ApduResponse {
    pub fn is_success(&self) -> bool {
        (self.sw1, self.sw2) == SW_SUCCESS
    }
}

pub const SW_SUCCESS: (u8, u8) = (0x90, 0x00);

/// Player slot on the remote game, sent as its integer index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Slot {
    P1,
    P2,
}

impl Slot {
    pub fn index(self) -> u8 {
        match self {
            Slot::P1 => 0,
            Slot::P2 => 1,
        }
    }
}

impl Serialize for Slot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.index())
    }
}

/// Outbound RPC frame.
#[derive(Serialize, Debug)]
pub struct RpcRequest<'a, P> {
    pub id: u64,
    pub module: &'a str,
    pub function: &'a str,
    pub params: P,
}

/// Inbound RPC frame. An empty `errors` list means success.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}
