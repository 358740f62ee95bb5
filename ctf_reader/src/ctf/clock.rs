use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use super::error::{CtfError, Result};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// A trace clock. Raw timestamps are tick counts of this clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clock {
    pub name: String,
    pub uuid: Option<Uuid>,
    pub description: Option<String>,
    /// Ticks per second.
    pub frequency: u64,
    pub precision: u64,
    pub offset_seconds: i64,
    pub offset_cycles: u64,
}

impl Clock {
    pub fn new(name: impl Into<String>, frequency: u64) -> Result<Self> {
        let name = name.into();
        if frequency == 0 {
            return Err(CtfError::corrupt(format!(
                "clock '{name}' has a frequency of zero"
            )));
        }
        Ok(Self {
            name,
            uuid: None,
            description: None,
            frequency,
            precision: 0,
            offset_seconds: 0,
            offset_cycles: 0,
        })
    }

    pub fn with_offset(mut self, seconds: i64, cycles: u64) -> Self {
        self.offset_seconds = seconds;
        self.offset_cycles = cycles;
        self
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    /// Converts a tick count to nanoseconds, saturating at `i64::MAX`.
    pub fn ticks_to_ns(&self, ticks: u64) -> i64 {
        let ns = ticks as u128 * NANOS_PER_SECOND as u128 / self.frequency as u128;
        i64::try_from(ns).unwrap_or(i64::MAX)
    }

    /// Nanoseconds between the epoch and this clock's zero.
    pub fn offset_ns(&self) -> i64 {
        self.offset_seconds
            .saturating_mul(NANOS_PER_SECOND)
            .saturating_add(self.ticks_to_ns(self.offset_cycles))
    }
}

/// A raw clock reading together with its normalized nanosecond value.
///
/// Readings of different clocks are unordered: `partial_cmp` returns `None`
/// and `==` is false. Compare [`Timestamp::ns`] to order across clocks.
#[derive(Debug, Clone)]
pub struct Timestamp {
    raw: u64,
    clock: Arc<Clock>,
    ns: i64,
}

impl Timestamp {
    pub fn new(raw: u64, clock: Arc<Clock>) -> Self {
        let ns = clock.offset_ns().saturating_add(clock.ticks_to_ns(raw));
        Self { raw, clock, ns }
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }

    pub fn ns(&self) -> i64 {
        self.ns
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// Clocks with a UUID match on it alone; otherwise the whole
    /// declaration must match.
    fn same_clock(&self, other: &Self) -> bool {
        match (self.clock.uuid, other.clock.uuid) {
            (Some(a), Some(b)) => a == b,
            _ => Arc::ptr_eq(&self.clock, &other.clock) || self.clock == other.clock,
        }
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.same_clock(other) && self.raw == other.raw
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.same_clock(other) {
            Some(self.raw.cmp(&other.raw))
        } else {
            None
        }
    }
}

impl fmt::Display for Timestamp {
    /// Seconds since the epoch with nanosecond precision.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.ns < 0 { "-" } else { "" };
        let magnitude = self.ns.unsigned_abs();
        let per_second = NANOS_PER_SECOND as u64;
        write!(
            f,
            "{sign}{}.{:09}",
            magnitude / per_second,
            magnitude % per_second
        )
    }
}
