//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     provides a unified interface for the pins and buses the sampler needs:
//!     a bidirectional digital line (dht data pin, water level input), an
//!     8-bit analog channel reader (ADS7830 over I2C) and a monotonic
//!     microsecond clock. abstracts away the difference between running on a
//!     real Raspberry Pi (using `rppal`) and a development machine (mocks).
//!
//! design philosophy:
//!     - "Compile Anywhere": The host should compile on Windows/Mac/Linux.
//!     - "Injectable Time": the decoder never reads the clock directly, so
//!       tests can replay a waveform against a stepping clock.
//!
//! relationships:
//!     - used by: dht.rs (line + clock), sampler.rs (adc + water input)
//!     - uses: rppal (on feature="hardware")
//!     - uses: libc (scheduler priority while a frame is clocked in)
//!
//! ==============================================================================

use anyhow::Result;
use std::collections::VecDeque;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// a single gpio line that can be turned around between input and output
pub trait DigitalLine {
    fn set_direction(&mut self, direction: Direction);
    fn write(&mut self, level: Level);
    fn read(&mut self) -> Level;
}

impl<T: DigitalLine + ?Sized> DigitalLine for Box<T> {
    fn set_direction(&mut self, direction: Direction) {
        (**self).set_direction(direction)
    }

    fn write(&mut self, level: Level) {
        (**self).write(level)
    }

    fn read(&mut self) -> Level {
        (**self).read()
    }
}

/// monotonic microsecond counter. the origin is arbitrary; only differences
/// are meaningful.
pub trait MonotonicClock {
    fn micros(&self) -> u64;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalogError {
    #[error("adc channel {0} out of range (0..=7)")]
    InvalidChannel(u8),
    #[error("i2c transfer failed: {0}")]
    #[cfg_attr(not(feature = "hardware"), allow(dead_code))]
    Bus(String),
}

/// 8-bit analog reader, one value per channel (0..=255)
pub trait AnalogReader {
    fn read_channel(&mut self, channel: u8) -> Result<u8, AnalogError>;
}

/// ADS7830 command byte for a single-ended conversion on `channel`.
///
/// layout: SD C2 C1 C0 PD1 PD0 x x, with the channel select bits
/// interleaved (odd channels set C2).
pub fn ads7830_command(channel: u8) -> Result<u8, AnalogError> {
    if channel > 7 {
        return Err(AnalogError::InvalidChannel(channel));
    }
    let select = (channel >> 1) | ((channel & 1) << 2);
    Ok(0x84 | (select << 4))
}

// ==============================================================================
// scheduling priority
// ==============================================================================
// the dht frame is clocked in by busy-waiting, so a preemption in the middle
// of a bit corrupts the read. we ask for SCHED_FIFO for the duration of the
// read and put the old policy back when the guard drops. without privileges
// the request simply fails and we carry on at normal priority.

#[cfg(target_os = "linux")]
pub struct PriorityGuard {
    saved: Option<(libc::c_int, libc::sched_param)>,
}

#[cfg(target_os = "linux")]
impl PriorityGuard {
    pub fn elevate() -> Self {
        // SAFETY: pid 0 targets the calling thread; every pointer refers to a
        // live stack value for the duration of the call.
        unsafe {
            let policy = libc::sched_getscheduler(0);
            let mut previous: libc::sched_param = std::mem::zeroed();
            if policy < 0 || libc::sched_getparam(0, &mut previous) != 0 {
                return Self { saved: None };
            }

            let mut realtime: libc::sched_param = std::mem::zeroed();
            realtime.sched_priority = libc::sched_get_priority_max(libc::SCHED_FIFO);
            if libc::sched_setscheduler(0, libc::SCHED_FIFO, &realtime) != 0 {
                tracing::trace!("realtime priority unavailable, reading at normal priority");
                return Self { saved: None };
            }
            Self { saved: Some((policy, previous)) }
        }
    }
}

#[cfg(target_os = "linux")]
impl Drop for PriorityGuard {
    fn drop(&mut self) {
        if let Some((policy, previous)) = self.saved.take() {
            // SAFETY: restores the policy captured in `elevate`.
            unsafe {
                libc::sched_setscheduler(0, policy, &previous);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub struct PriorityGuard;

#[cfg(not(target_os = "linux"))]
impl PriorityGuard {
    pub fn elevate() -> Self {
        PriorityGuard
    }
}

// ==============================================================================
// simulated single-wire sensor
// ==============================================================================
// replays a scripted level sequence every time the host releases the line.
// the mock hal uses it with the real clock; tests use it with a stepping
// clock so that only relative pulse widths matter.

/// typical dht pulse widths (µs)
pub const RELEASE_HIGH_US: u64 = 30;
pub const RESPONSE_LOW_US: u64 = 80;
pub const RESPONSE_HIGH_US: u64 = 80;
pub const BIT_LOW_US: u64 = 50;
pub const ZERO_HIGH_US: u64 = 26;
pub const ONE_HIGH_US: u64 = 70;

#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    segments: Vec<(Level, u64)>,
    idle: Level,
}

impl Waveform {
    /// `segments` start at the moment the host switches the line to input;
    /// once they run out the line sits at `idle`.
    pub fn new(segments: Vec<(Level, u64)>, idle: Level) -> Self {
        Self { segments, idle }
    }

    /// a complete, well-formed transmission of `frame`
    pub fn frame(frame: [u8; 5]) -> Self {
        let mut segments = Self::frame_segments(frame);
        segments.push((Level::Low, BIT_LOW_US));
        Self::new(segments, Level::High)
    }

    /// handshake followed by one (low, high) pair per bit, msb first. the
    /// closing low pulse after the last bit is not included.
    pub fn frame_segments(frame: [u8; 5]) -> Vec<(Level, u64)> {
        let mut segments = Self::handshake();
        for byte in frame {
            for shift in (0..8).rev() {
                let high = if (byte >> shift) & 1 == 1 { ONE_HIGH_US } else { ZERO_HIGH_US };
                segments.push((Level::Low, BIT_LOW_US));
                segments.push((Level::High, high));
            }
        }
        segments
    }

    /// release pulse plus the sensor's 80µs low / 80µs high response
    pub fn handshake() -> Vec<(Level, u64)> {
        vec![
            (Level::High, RELEASE_HIGH_US),
            (Level::Low, RESPONSE_LOW_US),
            (Level::High, RESPONSE_HIGH_US),
        ]
    }

    fn level_at(&self, elapsed: u64) -> Level {
        let mut end = 0;
        for &(level, width) in &self.segments {
            end += width;
            if elapsed < end {
                return level;
            }
        }
        self.idle
    }
}

pub struct WaveformLine<C> {
    clock: C,
    script: VecDeque<Waveform>,
    active: Option<(Waveform, u64)>,
    direction: Direction,
    driven: Level,
    releases: usize,
}

impl<C: MonotonicClock> WaveformLine<C> {
    /// each release consumes the next waveform; the last one repeats
    pub fn new(clock: C, script: Vec<Waveform>) -> Self {
        Self {
            clock,
            script: script.into(),
            active: None,
            direction: Direction::Input,
            driven: Level::High,
            releases: 0,
        }
    }

    /// how many times the host has handed the line back to the sensor
    #[cfg(test)]
    pub fn releases(&self) -> usize {
        self.releases
    }

    /// last level the host drove while the line was an output
    #[cfg(test)]
    pub fn driven(&self) -> Level {
        self.driven
    }

    #[cfg(test)]
    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl<C: MonotonicClock> DigitalLine for WaveformLine<C> {
    fn set_direction(&mut self, direction: Direction) {
        if direction == self.direction {
            return;
        }
        self.direction = direction;
        match direction {
            Direction::Output => self.active = None,
            Direction::Input => {
                let next = if self.script.len() > 1 {
                    self.script.pop_front()
                } else {
                    self.script.front().cloned()
                };
                self.active = next.map(|waveform| (waveform, self.clock.micros()));
                self.releases += 1;
            }
        }
    }

    fn write(&mut self, level: Level) {
        self.driven = level;
    }

    fn read(&mut self) -> Level {
        match (self.direction, &self.active) {
            (Direction::Output, _) => self.driven,
            (Direction::Input, Some((waveform, released_at))) => {
                let elapsed = self.clock.micros().saturating_sub(*released_at);
                waveform.level_at(elapsed)
            }
            // pull-up with nothing attached
            (Direction::Input, None) => Level::High,
        }
    }
}

/// an input that never changes
pub struct StaticLine(pub Level);

impl DigitalLine for StaticLine {
    fn set_direction(&mut self, _direction: Direction) {}
    fn write(&mut self, _level: Level) {}
    fn read(&mut self) -> Level {
        self.0
    }
}

// ==============================================================================================
// MOCK IMPLEMENTATION (For WSL / Non-Hardware Build)
// ==============================================================================================
#[cfg(not(feature = "hardware"))]
pub struct Hal {}

#[cfg(not(feature = "hardware"))]
impl Hal {
    pub fn new() -> Self {
        tracing::info!("Using MOCK HAL (No hardware access)");
        Self {}
    }

    /// a simulated sensor answering with a fixed 48% / 23°C frame
    pub fn open_dht_line(&self, pin: u8, variant: crate::dht::Variant) -> Result<Box<dyn DigitalLine>> {
        tracing::debug!("[MOCK DHT] line on pin {}", pin);
        let frame = variant.encode(48.0, 23.0);
        Ok(Box::new(WaveformLine::new(SystemClock::new(), vec![Waveform::frame(frame)])))
    }

    pub fn open_input(&self, pin: u8) -> Result<Box<dyn DigitalLine>> {
        tracing::debug!("[MOCK GPIO] input on pin {}", pin);
        Ok(Box::new(StaticLine(Level::High)))
    }

    pub fn open_adc(&self, bus: u8, address: u8) -> Result<Box<dyn AnalogReader>> {
        tracing::debug!("[MOCK I2C] bus {} addr 0x{:02X}", bus, address);
        Ok(Box::new(MockAdc { reads: 0 }))
    }
}

/// slowly drifting per-channel values so the deadband gets exercised
#[cfg(not(feature = "hardware"))]
struct MockAdc {
    reads: u32,
}

#[cfg(not(feature = "hardware"))]
impl AnalogReader for MockAdc {
    fn read_channel(&mut self, channel: u8) -> Result<u8, AnalogError> {
        ads7830_command(channel)?;
        self.reads = self.reads.wrapping_add(1);
        let drift = ((self.reads / 90) % 16) as u8;
        Ok(100u8.saturating_add(channel.saturating_mul(20)).saturating_add(drift))
    }
}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================================
#[cfg(feature = "hardware")]
pub struct Hal {}

#[cfg(feature = "hardware")]
impl Hal {
    pub fn new() -> Self {
        tracing::info!("Using REAL HARDWARE HAL (rppal)");
        Self {}
    }

    pub fn open_dht_line(&self, pin: u8, _variant: crate::dht::Variant) -> Result<Box<dyn DigitalLine>> {
        use rppal::gpio::{Gpio, Mode, PullUpDown};
        let mut io = Gpio::new()?.get(pin)?.into_io(Mode::Input);
        io.set_pullupdown(PullUpDown::PullUp);
        Ok(Box::new(PiLine { pin: io }))
    }

    pub fn open_input(&self, pin: u8) -> Result<Box<dyn DigitalLine>> {
        use rppal::gpio::{Gpio, Mode};
        let io = Gpio::new()?.get(pin)?.into_io(Mode::Input);
        Ok(Box::new(PiLine { pin: io }))
    }

    pub fn open_adc(&self, bus: u8, address: u8) -> Result<Box<dyn AnalogReader>> {
        let mut i2c = rppal::i2c::I2c::with_bus(bus)?;
        i2c.set_slave_address(address as u16)?;
        Ok(Box::new(Ads7830 { i2c }))
    }
}

#[cfg(feature = "hardware")]
struct PiLine {
    pin: rppal::gpio::IoPin,
}

#[cfg(feature = "hardware")]
impl DigitalLine for PiLine {
    fn set_direction(&mut self, direction: Direction) {
        use rppal::gpio::Mode;
        self.pin.set_mode(match direction {
            Direction::Input => Mode::Input,
            Direction::Output => Mode::Output,
        });
    }

    fn write(&mut self, level: Level) {
        match level {
            Level::High => self.pin.set_high(),
            Level::Low => self.pin.set_low(),
        }
    }

    fn read(&mut self) -> Level {
        if self.pin.is_high() {
            Level::High
        } else {
            Level::Low
        }
    }
}

#[cfg(feature = "hardware")]
struct Ads7830 {
    i2c: rppal::i2c::I2c,
}

#[cfg(feature = "hardware")]
impl AnalogReader for Ads7830 {
    fn read_channel(&mut self, channel: u8) -> Result<u8, AnalogError> {
        let command = ads7830_command(channel)?;
        let written = self
            .i2c
            .write(&[command])
            .map_err(|e| AnalogError::Bus(e.to_string()))?;
        if written != 1 {
            return Err(AnalogError::Bus("short write".to_string()));
        }

        let mut data = [0u8; 1];
        let read = self
            .i2c
            .read(&mut data)
            .map_err(|e| AnalogError::Bus(e.to_string()))?;
        if read != 1 {
            return Err(AnalogError::Bus("short read".to_string()));
        }
        Ok(data[0])
    }
}

// ==============================================================================
// test support
// ==============================================================================
#[cfg(test)]
pub mod testing {
    use super::MonotonicClock;
    use std::cell::Cell;
    use std::rc::Rc;

    /// advances one microsecond every time it is read
    #[derive(Clone, Default)]
    pub struct StepClock {
        now: Rc<Cell<u64>>,
    }

    impl StepClock {
        pub fn starting_at(micros: u64) -> Self {
            Self { now: Rc::new(Cell::new(micros)) }
        }
    }

    impl MonotonicClock for StepClock {
        fn micros(&self) -> u64 {
            let now = self.now.get();
            self.now.set(now + 1);
            now
        }
    }
}
