// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! VNC authentication: challenge generation and DES response verification.
//!
//! The session generates a 16-byte challenge through a pluggable
//! [`SecurityChallenge`] provider and hands the client's 16-byte response to
//! the embedder, which decides accept or reject. Embedders holding a
//! plaintext password can use [`verify_challenge_response`] for the standard
//! VNC check: the password (truncated or zero-padded to 8 bytes, each byte
//! bit-reversed) keys a DES encryption of the challenge, and the result must
//! match the response.

use des::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use des::Des;
use rand::RngCore;

/// Source of 16-byte authentication challenges.
///
/// The provider can be replaced only before security negotiation completes;
/// afterwards the session freezes it.
pub trait SecurityChallenge: Send + Sync {
    /// Produces the 16-byte challenge sent to the client.
    fn generate_challenge(&self) -> [u8; 16];
}

/// Default challenge provider backed by the thread-local CSPRNG.
#[derive(Debug, Default)]
pub struct RandomChallenge;

impl SecurityChallenge for RandomChallenge {
    fn generate_challenge(&self) -> [u8; 16] {
        let mut challenge = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut challenge);
        challenge
    }
}

/// Encrypts a challenge with a password the way VNC clients do.
///
/// VNC keys DES with the password's first 8 bytes, each byte mirrored
/// (least-significant bit first), and encrypts the challenge as two 8-byte
/// ECB blocks.
#[must_use]
pub fn encrypt_challenge(password: &str, challenge: &[u8; 16]) -> [u8; 16] {
    let mut key = [0u8; 8];
    for (slot, byte) in key.iter_mut().zip(password.bytes()) {
        *slot = byte.reverse_bits();
    }

    let cipher = Des::new(GenericArray::from_slice(&key));
    let mut response = *challenge;
    for block in response.chunks_exact_mut(8) {
        let mut data = GenericArray::clone_from_slice(block);
        cipher.encrypt_block(&mut data);
        block.copy_from_slice(&data);
    }
    response
}

/// Checks a client's response against the challenge for a known password.
#[must_use]
pub fn verify_challenge_response(
    password: &str,
    challenge: &[u8; 16],
    response: &[u8; 16],
) -> bool {
    encrypt_challenge(password, challenge) == *response
}
