//! BIP39 mnemonic-to-seed stretching.
//!
//! The sentence is treated as opaque UTF-8; wordlist checksum validation
//! is a UI concern and deliberately lives outside this crate.

use zeroize::Zeroizing;

use crate::crypto::pbkdf2_hmac_sha512;

/// PBKDF2 round count fixed by the standard.
const ROUNDS: u32 = 2048;

/// Expand a mnemonic sentence (and optional passphrase) into the 64-byte
/// wallet seed.
pub fn mnemonic_to_seed(mnemonic: &str, passphrase: &str) -> Zeroizing<[u8; 64]> {
    let salt = Zeroizing::new(format!("mnemonic{}", passphrase));
    let mut seed = Zeroizing::new([0u8; 64]);
    pbkdf2_hmac_sha512(mnemonic.as_bytes(), salt.as_bytes(), ROUNDS, &mut *seed);
    seed
}
