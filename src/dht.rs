//! ==============================================================================
//! dht.rs - single-wire humidity/temperature frame decoder
//! ==============================================================================
//!
//! purpose:
//!     recovers the 40-bit frame a DHT11/DHT22 clocks out on its data line
//!     and turns it into calibrated humidity/temperature.
//!
//! protocol:
//!
//!     host   ‾‾‾‾|_______ 20ms _______|‾30µs‾|  (release to input)
//!     sensor                                   |__80µs__|‾‾80µs‾‾|  bits...
//!
//!     each bit: ~50µs low, then high for ~26µs (0) or ~70µs (1).
//!     frame: humidity, humidity fraction, temperature, temperature
//!     fraction, checksum (low byte of the sum of the first four).
//!
//! timing:
//!     all waiting is done by polling the line against a monotonic clock.
//!     sleeping is not an option inside the window: the scheduler's sleep
//!     granularity is coarser than a bit. the sensor needs ~2s between
//!     attempts; `DhtReader` enforces that cool-down and the retry budget.
//!
//! relationships:
//!     - uses: hal.rs (DigitalLine, MonotonicClock, PriorityGuard)
//!     - used by: sampler.rs
//!
//! ==============================================================================

use crate::hal::{Direction, DigitalLine, Level, MonotonicClock, PriorityGuard};
use serde::Deserialize;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const FRAME_BITS: usize = 40;

/// why a read produced no value. every variant aborts the whole frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("no response: sensor never pulled the line low")]
    NoResponseLow,
    #[error("no response: sensor never released the line high")]
    NoResponseHigh,
    #[error("sensor never started the data stream")]
    NoDataStart,
    #[error("timed out waiting for the rising edge of bit {bit}")]
    BitTimeoutHigh { bit: u8 },
    #[error("timed out waiting for the falling edge of bit {bit}")]
    BitTimeoutLow { bit: u8 },
    #[error("checksum mismatch: computed 0x{computed:02x}, frame carries 0x{received:02x}")]
    ChecksumMismatch { computed: u8, received: u8 },
}

/// sensor family, decides how the data bytes are scaled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// whole units in bytes 0/2, tenths in bytes 1/3
    #[default]
    Dht11,
    /// 16-bit tenths, bit 15 of the temperature word is the sign
    Dht22,
}

impl Variant {
    pub fn humidity(self, frame: &[u8; 5]) -> f64 {
        match self {
            Variant::Dht11 => frame[0] as f64 + frame[1] as f64 / 10.0,
            Variant::Dht22 => u16::from_be_bytes([frame[0], frame[1]]) as f64 / 10.0,
        }
    }

    pub fn temperature(self, frame: &[u8; 5]) -> f64 {
        match self {
            Variant::Dht11 => {
                let magnitude = frame[2] as f64 + (frame[3] & 0x7F) as f64 / 10.0;
                if frame[3] & 0x80 != 0 {
                    -magnitude
                } else {
                    magnitude
                }
            }
            Variant::Dht22 => {
                let magnitude = u16::from_be_bytes([frame[2] & 0x7F, frame[3]]) as f64 / 10.0;
                if frame[2] & 0x80 != 0 {
                    -magnitude
                } else {
                    magnitude
                }
            }
        }
    }

    /// inverse of the scaling above, checksum included. used to drive the
    /// simulated sensor.
    pub fn encode(self, humidity: f64, temperature: f64) -> [u8; 5] {
        let mut frame = [0u8; 5];
        match self {
            Variant::Dht11 => {
                let tenths_h = (humidity * 10.0).round() as u32;
                frame[0] = (tenths_h / 10) as u8;
                frame[1] = (tenths_h % 10) as u8;
                let tenths_t = (temperature.abs() * 10.0).round() as u32;
                frame[2] = (tenths_t / 10) as u8;
                frame[3] = (tenths_t % 10) as u8;
                if temperature < 0.0 {
                    frame[3] |= 0x80;
                }
            }
            Variant::Dht22 => {
                let h = ((humidity * 10.0).round() as u16).to_be_bytes();
                let mut t = ((temperature.abs() * 10.0).round() as u16) & 0x7FFF;
                if temperature < 0.0 {
                    t |= 0x8000;
                }
                let t = t.to_be_bytes();
                frame[..4].copy_from_slice(&[h[0], h[1], t[0], t[1]]);
            }
        }
        frame[4] = checksum(&frame);
        frame
    }
}

/// low byte of the sum of the four data bytes
pub fn checksum(frame: &[u8; 5]) -> u8 {
    frame[..4].iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub humidity: f64,
    pub temperature: f64,
}

/// pulse widths and deadlines, in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub settle_us: u64,
    pub start_pulse_us: u64,
    pub release_us: u64,
    pub handshake_timeout_us: u64,
    pub bit_timeout_us: u64,
    /// a high pulse longer than this is a 1
    pub one_threshold_us: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            settle_us: 1_000,
            start_pulse_us: 20_000,
            release_us: 30,
            handshake_timeout_us: 200,
            bit_timeout_us: 100,
            one_threshold_us: 40,
        }
    }
}

/// poll `line` until it reads `level`.
///
/// returns the elapsed microseconds, or `None` once more than `timeout_us`
/// have passed.
pub fn wait_for_level<L, C>(line: &mut L, clock: &C, level: Level, timeout_us: u64) -> Option<u64>
where
    L: DigitalLine + ?Sized,
    C: MonotonicClock,
{
    let start = clock.micros();
    loop {
        if line.read() == level {
            return Some(clock.micros().saturating_sub(start));
        }
        if clock.micros().saturating_sub(start) > timeout_us {
            return None;
        }
        std::hint::spin_loop();
    }
}

fn spin_for<C: MonotonicClock>(clock: &C, micros: u64) {
    let start = clock.micros();
    while clock.micros().saturating_sub(start) < micros {
        std::hint::spin_loop();
    }
}

pub struct Dht<L, C> {
    line: L,
    clock: C,
    variant: Variant,
    timing: Timing,
    elevate_priority: bool,
}

impl<L: DigitalLine, C: MonotonicClock> Dht<L, C> {
    pub fn new(line: L, clock: C, variant: Variant) -> Self {
        Self {
            line,
            clock,
            variant,
            timing: Timing::default(),
            elevate_priority: true,
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_priority_elevation(mut self, enabled: bool) -> Self {
        self.elevate_priority = enabled;
        self
    }

    #[cfg(test)]
    pub fn line(&self) -> &L {
        &self.line
    }

    /// run one start/response/read cycle and validate the frame.
    ///
    /// the line is always left as an input when this returns.
    pub fn decode(&mut self) -> Result<Reading, DecodeError> {
        let priority = self.elevate_priority.then(PriorityGuard::elevate);
        let frame = self.read_frame();
        drop(priority);
        self.line.set_direction(Direction::Input);

        let frame = frame?;
        let computed = checksum(&frame);
        if computed != frame[4] {
            return Err(DecodeError::ChecksumMismatch { computed, received: frame[4] });
        }
        Ok(Reading {
            humidity: self.variant.humidity(&frame),
            temperature: self.variant.temperature(&frame),
        })
    }

    fn read_frame(&mut self) -> Result<[u8; 5], DecodeError> {
        let t = self.timing;
        let line = &mut self.line;
        let clock = &self.clock;

        // wake: idle high, long low start pulse, short high, then let go
        line.set_direction(Direction::Output);
        line.write(Level::High);
        spin_for(clock, t.settle_us);
        line.write(Level::Low);
        spin_for(clock, t.start_pulse_us);
        line.write(Level::High);
        spin_for(clock, t.release_us);
        line.set_direction(Direction::Input);

        // handshake
        wait_for_level(line, clock, Level::Low, t.handshake_timeout_us)
            .ok_or(DecodeError::NoResponseLow)?;
        wait_for_level(line, clock, Level::High, t.handshake_timeout_us)
            .ok_or(DecodeError::NoResponseHigh)?;
        wait_for_level(line, clock, Level::Low, t.handshake_timeout_us)
            .ok_or(DecodeError::NoDataStart)?;

        let mut frame = [0u8; 5];
        for bit in 0..FRAME_BITS {
            wait_for_level(line, clock, Level::High, t.bit_timeout_us)
                .ok_or(DecodeError::BitTimeoutHigh { bit: bit as u8 })?;
            let high_us = wait_for_level(line, clock, Level::Low, t.bit_timeout_us)
                .ok_or(DecodeError::BitTimeoutLow { bit: bit as u8 })?;
            let byte = &mut frame[bit / 8];
            *byte = (*byte << 1) | u8::from(high_us > t.one_threshold_us);
        }
        Ok(frame)
    }
}

// ==============================================================================
// retry / cool-down
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// minimum gap between two attempts on the same line
    pub cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, cooldown: Duration::from_millis(2_000) }
    }
}

/// owns a decoder and makes sure it is never hammered faster than the
/// sensor can answer
pub struct DhtReader<L, C> {
    dht: Dht<L, C>,
    retry: RetryPolicy,
    last_attempt: Option<Instant>,
}

impl<L: DigitalLine, C: MonotonicClock> DhtReader<L, C> {
    pub fn new(dht: Dht<L, C>, retry: RetryPolicy) -> Self {
        Self { dht, retry, last_attempt: None }
    }

    #[cfg(test)]
    pub fn decoder(&self) -> &Dht<L, C> {
        &self.dht
    }

    /// up to `retry.attempts` decodes, each at least `retry.cooldown` after
    /// the previous one. returns the last failure if all of them fail.
    pub async fn read(&mut self) -> Result<Reading, DecodeError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            if let Some(previous) = self.last_attempt {
                let since = previous.elapsed();
                if since < self.retry.cooldown {
                    tokio::time::sleep(self.retry.cooldown - since).await;
                }
            }
            self.last_attempt = Some(Instant::now());

            match self.dht.decode() {
                Ok(reading) => return Ok(reading),
                Err(e) if attempt < attempts => {
                    tracing::debug!(attempt, error = %e, "dht read failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
