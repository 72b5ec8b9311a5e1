//! Time-ordered numeric job identifiers.
//!
//! A job id is 19 ASCII digits: a 13-digit millisecond Unix timestamp
//! followed by a 6-digit disambiguator.
//!
//! ```text
//! 1718000000000 042117
//! └─ ms epoch ─┘└ seq ┘
//! ```
//!
//! Within one millisecond the disambiguator is a counter; when the clock moves
//! to a new millisecond it is reseeded randomly so that two processes (or one
//! process before and after a restart) are unlikely to collide.

use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const JOB_ID_LENGTH: usize = 19;
const TIMESTAMP_DIGITS: usize = 13;
const SEQUENCE_MODULUS: u32 = 1_000_000;

/// 2000-01-01T00:00:00Z
const MIN_TIMESTAMP_MS: u64 = 946_684_800_000;
/// 2100-01-01T00:00:00Z
const MAX_TIMESTAMP_MS: u64 = 4_102_444_800_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobIdError {
    #[error("invalid job id format: {0}")]
    InvalidFormat(String),
}

/// A validated job identifier.
///
/// Every way of building one goes through [`JobId::parse`], deserialization
/// included.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Parse and validate an id received from outside the process.
    pub fn parse(s: &str) -> Result<Self, JobIdError> {
        let timestamp = extract_timestamp_ms(s)?;
        if !(MIN_TIMESTAMP_MS..MAX_TIMESTAMP_MS).contains(&timestamp) {
            return Err(JobIdError::InvalidFormat(format!(
                "embedded timestamp {timestamp} is outside 2000-01-01..2100-01-01"
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Millisecond timestamp embedded in the id.
    pub fn timestamp_ms(&self) -> u64 {
        extract_timestamp_ms(&self.0).unwrap_or_default()
    }

    /// Creation time embedded in the id.
    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp_ms() as i64)
            .single()
            .unwrap_or_default()
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for JobId {
    type Err = JobIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = JobIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

/// Whether `id` is a well-formed job id with a plausible timestamp.
pub fn is_valid(id: &str) -> bool {
    JobId::parse(id).is_ok()
}

/// Decode the creation time embedded in `id`.
pub fn extract_timestamp(id: &str) -> Result<DateTime<Utc>, JobIdError> {
    let ms = extract_timestamp_ms(id)?;
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .ok_or_else(|| JobIdError::InvalidFormat(format!("timestamp {ms} is not representable")))
}

fn extract_timestamp_ms(id: &str) -> Result<u64, JobIdError> {
    if id.len() != JOB_ID_LENGTH {
        return Err(JobIdError::InvalidFormat(format!(
            "expected {JOB_ID_LENGTH} digits, got {} characters",
            id.len()
        )));
    }
    if !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(JobIdError::InvalidFormat(
            "job id must contain only digits".to_string(),
        ));
    }
    id[..TIMESTAMP_DIGITS]
        .parse()
        .map_err(|_| JobIdError::InvalidFormat("unreadable timestamp".to_string()))
}

#[derive(Debug, Default)]
struct AllocatorState {
    last_timestamp: u64,
    sequence: u32,
}

type Clock = Box<dyn Fn() -> u64 + Send + Sync>;

/// Allocates unique, non-decreasing job ids.
///
/// All state sits behind one mutex; share the generator with `Arc`.
pub struct JobIdGenerator {
    state: Mutex<AllocatorState>,
    clock: Clock,
}

impl Default for JobIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JobIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobIdGenerator").finish_non_exhaustive()
    }
}

impl JobIdGenerator {
    pub fn new() -> Self {
        Self::with_clock(|| Utc::now().timestamp_millis().max(0) as u64)
    }

    /// Use a custom millisecond clock.
    pub fn with_clock(clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(AllocatorState::default()),
            clock: Box::new(clock),
        }
    }

    /// Allocate an id, spinning if this millisecond's sequence is used up.
    pub fn allocate(&self) -> JobId {
        loop {
            if let Some(id) = self.try_allocate() {
                return id;
            }
            std::hint::spin_loop();
        }
    }

    /// Allocate an id from async code. Yields to the runtime instead of
    /// spinning while this millisecond's sequence is used up.
    pub async fn allocate_async(&self) -> JobId {
        loop {
            if let Some(id) = self.try_allocate() {
                return id;
            }
            tokio::task::yield_now().await;
        }
    }

    /// `None` when the sequence wrapped within the current millisecond. The
    /// lock is never held while waiting for the clock.
    fn try_allocate(&self) -> Option<JobId> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        // A clock that stepped backwards is treated as still being in the
        // last millisecond so ids never go backwards.
        let now = (self.clock)().max(state.last_timestamp);

        if now == state.last_timestamp {
            let next = (state.sequence + 1) % SEQUENCE_MODULUS;
            if next == 0 {
                return None;
            }
            state.sequence = next;
        } else {
            state.last_timestamp = now;
            state.sequence = random_sequence();
        }

        Some(JobId(format!(
            "{:0ts$}{:06}",
            state.last_timestamp,
            state.sequence,
            ts = TIMESTAMP_DIGITS
        )))
    }
}

fn random_sequence() -> u32 {
    rand::thread_rng().gen_range(0..SEQUENCE_MODULUS)
}
