//! Consensus primitives: hashes, wire encoding, base58, scripts, addresses.

pub mod address;
pub mod base58;
pub mod encode;
pub mod hash;
pub mod script;

pub use address::{Address, AddressError};
pub use base58::Base58Error;
pub use encode::{Decodable, Encodable, ProtocolError, VarInt, MAX_PAYLOAD_SIZE};
pub use hash::{Hash160, Sha256dHash};
pub use script::{Script, ScriptKind};
