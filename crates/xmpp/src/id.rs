//! Sequential, cyclical identifiers.
//!
//! Identifiers are 16 bytes laid out as:
//!
//! | bytes  | content                                                    |
//! |--------|------------------------------------------------------------|
//! | 0-3    | seconds since 2000-01-01T00:00:00Z (wraps 2136-02-07)      |
//! | 4-7    | counter started at a random value, bytes as `[2, 3, 0, 1]` |
//! | 8-9    | process discriminator                                      |
//! | 10-12  | machine discriminator                                      |
//! | 13-15  | random salt, fresh per identifier                          |
//!
//! Multi-byte fields use little-endian as the canonical order on every
//! platform. Identifiers are unique to a very high degree of probability but
//! are not guaranteed to be globally unique.

use std::{
    fmt,
    sync::{Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use sha1::{Digest, Sha1};
use uuid::Uuid;

/// Unix timestamp of the reference epoch, 2000-01-01T00:00:00Z.
pub const REFERENCE_EPOCH_UNIX: i64 = 946_684_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier([u8; 16]);

impl Identifier {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn seconds(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// The counter value, with the byte rotation undone.
    pub fn counter(&self) -> u32 {
        u32::from_le_bytes([self.0[6], self.0[7], self.0[4], self.0[5]])
    }

    pub fn to_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.0)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_uuid().simple(), f)
    }
}

pub type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Explicit inputs for a generator, used for reproducible output.
pub struct GeneratorParts {
    pub counter_seed: u32,
    pub process_id: [u8; 2],
    pub machine_id: [u8; 3],
    pub clock: Clock,
    pub salt_source: Box<dyn RngCore + Send>,
}

struct GeneratorState {
    counter: u32,
    salt_source: Box<dyn RngCore + Send>,
}

pub struct IdGenerator {
    process_id: [u8; 2],
    machine_id: [u8; 3],
    clock: Clock,
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    pub fn new() -> Self {
        let mut rng = StdRng::from_os_rng();
        let counter_seed = rng.next_u32();

        Self::from_parts(GeneratorParts {
            counter_seed,
            process_id: (std::process::id() as u16).to_le_bytes(),
            machine_id: machine_discriminator(),
            clock: Box::new(Utc::now),
            salt_source: Box::new(rng),
        })
    }

    pub fn from_parts(parts: GeneratorParts) -> Self {
        Self {
            process_id: parts.process_id,
            machine_id: parts.machine_id,
            clock: parts.clock,
            state: Mutex::new(GeneratorState {
                counter: parts.counter_seed,
                salt_source: parts.salt_source,
            }),
        }
    }

    pub fn next(&self) -> Identifier {
        let seconds = ((self.clock)().timestamp() - REFERENCE_EPOCH_UNIX) as u32;
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&seconds.to_le_bytes());

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let counter = state.counter.to_le_bytes();
            state.counter = state.counter.wrapping_add(1);

            bytes[4] = counter[2];
            bytes[5] = counter[3];
            bytes[6] = counter[0];
            bytes[7] = counter[1];

            state.salt_source.fill_bytes(&mut bytes[13..16]);
        }

        bytes[8..10].copy_from_slice(&self.process_id);
        bytes[10..13].copy_from_slice(&self.machine_id);

        Identifier(bytes)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// First three bytes of SHA-1 over the host name and the sorted environment.
fn machine_discriminator() -> [u8; 3] {
    let mut hasher = Sha1::new();

    if let Some(host) = std::env::var_os("HOSTNAME").or_else(|| std::env::var_os("COMPUTERNAME"))
    {
        hasher.update(host.to_string_lossy().as_bytes());
    }

    let mut vars: Vec<(String, String)> = std::env::vars_os()
        .map(|(key, value)| {
            (
                key.to_string_lossy().into_owned(),
                value.to_string_lossy().into_owned(),
            )
        })
        .collect();
    vars.sort();
    for (key, value) in vars {
        hasher.update(key.as_bytes());
        hasher.update(value.as_bytes());
    }

    let digest = hasher.finalize();
    [digest[0], digest[1], digest[2]]
}
