//! ==============================================================================
//! sampler.rs - one sampling tick
//! ==============================================================================
//!
//! purpose:
//!     reads every configured channel group once, then runs the samples
//!     through the filter and appends the accepted ones to the queue.
//!
//! degraded operation:
//!     a peripheral that could not be opened at startup is "unavailable":
//!     its groups produce a failed sample every tick and the others carry on.
//!     a disabled peripheral produces nothing at all.
//!
//! ==============================================================================

use crate::config::{SensorsConfig, WaterLevelConfig};
use crate::dht::{Dht, DhtReader};
use crate::domain::{ChannelGroup, NewReading, RawSample, Values};
use crate::filter::{FilterConfig, FilterState};
use crate::hal::{AnalogReader, DigitalLine, Hal, Level, MonotonicClock, SystemClock};
use crate::store::Store;

pub enum Peripheral<T> {
    Ready(T),
    Unavailable,
    Disabled,
}

impl<T> Peripheral<T> {
    fn from_open(label: &str, opened: anyhow::Result<T>) -> Self {
        match opened {
            Ok(device) => Peripheral::Ready(device),
            Err(e) => {
                tracing::warn!("[{}] unavailable: {:#}", label, e);
                Peripheral::Unavailable
            }
        }
    }
}

pub enum WaterProbe {
    /// high = water present
    Line(Box<dyn DigitalLine>),
    Adc(u8),
}

pub struct Sampler<L, C> {
    dht: Peripheral<DhtReader<L, C>>,
    adc: Peripheral<Box<dyn AnalogReader>>,
    soil_channel: u8,
    light_channel: u8,
    water: Peripheral<WaterProbe>,
}

impl Sampler<Box<dyn DigitalLine>, SystemClock> {
    /// open everything the config asks for
    pub fn open(hal: &Hal, sensors: &SensorsConfig) -> Self {
        let dht_config = &sensors.dht;
        let dht = if dht_config.enabled {
            Peripheral::from_open(
                "DHT",
                hal.open_dht_line(dht_config.gpio_pin, dht_config.variant).map(|line| {
                    let decoder = Dht::new(line, SystemClock::new(), dht_config.variant)
                        .with_timing(dht_config.timing())
                        .with_priority_elevation(dht_config.elevate_priority);
                    DhtReader::new(decoder, dht_config.retry())
                }),
            )
        } else {
            Peripheral::Disabled
        };

        let adc = if sensors.adc.enabled {
            Peripheral::from_open("ADC", hal.open_adc(sensors.adc.i2c_bus, sensors.adc.i2c_address))
        } else {
            Peripheral::Disabled
        };

        let water = match sensors.water_level {
            WaterLevelConfig::Gpio { pin } => {
                Peripheral::from_open("WATER", hal.open_input(pin).map(WaterProbe::Line))
            }
            WaterLevelConfig::Adc { channel } => Peripheral::Ready(WaterProbe::Adc(channel)),
            WaterLevelConfig::Disabled => Peripheral::Disabled,
        };

        Self::new(dht, adc, sensors.adc.soil_moisture_channel, sensors.adc.light_level_channel, water)
    }
}

impl<L: DigitalLine, C: MonotonicClock> Sampler<L, C> {
    pub fn new(
        dht: Peripheral<DhtReader<L, C>>,
        adc: Peripheral<Box<dyn AnalogReader>>,
        soil_channel: u8,
        light_channel: u8,
        water: Peripheral<WaterProbe>,
    ) -> Self {
        Self { dht, adc, soil_channel, light_channel, water }
    }

    /// read every enabled group once. failed reads come back as samples
    /// without values.
    pub async fn sample(&mut self, now: i64) -> Vec<RawSample> {
        let mut samples = Vec::with_capacity(ChannelGroup::ALL.len());

        match &mut self.dht {
            Peripheral::Ready(reader) => match reader.read().await {
                Ok(reading) => samples.push(RawSample::ok(
                    ChannelGroup::TemperatureHumidity,
                    Values::pair(reading.humidity, reading.temperature),
                    now,
                )),
                Err(e) => {
                    tracing::warn!("[DHT] read failed after retries: {}", e);
                    samples.push(RawSample::failed(ChannelGroup::TemperatureHumidity, now));
                }
            },
            Peripheral::Unavailable => samples.push(RawSample::failed(ChannelGroup::TemperatureHumidity, now)),
            Peripheral::Disabled => {}
        }

        let soil = read_analog(&mut self.adc, self.soil_channel);
        let light = read_analog(&mut self.adc, self.light_channel);
        for (group, value) in [(ChannelGroup::SoilMoisture, soil), (ChannelGroup::LightLevel, light)] {
            if let Some(value) = value {
                samples.push(RawSample { group, values: value.map(Values::single), captured_at: now });
            }
        }

        let water = match &mut self.water {
            Peripheral::Ready(WaterProbe::Line(line)) => Some(Some(match line.read() {
                Level::High => 1.0,
                Level::Low => 0.0,
            })),
            // an adc probe without a working adc is just as unavailable
            Peripheral::Ready(WaterProbe::Adc(channel)) => Some(read_analog(&mut self.adc, *channel).flatten()),
            Peripheral::Unavailable => Some(None),
            Peripheral::Disabled => None,
        };
        if let Some(value) = water {
            samples.push(RawSample { group: ChannelGroup::WaterLevel, values: value.map(Values::single), captured_at: now });
        }

        samples
    }
}

/// `None`: adc disabled, no sample. `Some(None)`: read failed.
fn read_analog(adc: &mut Peripheral<Box<dyn AnalogReader>>, channel: u8) -> Option<Option<f64>> {
    match adc {
        Peripheral::Ready(adc) => match adc.read_channel(channel) {
            Ok(raw) => Some(Some(f64::from(raw))),
            Err(e) => {
                tracing::warn!("[ADC] channel {} read failed: {}", channel, e);
                Some(None)
            }
        },
        Peripheral::Unavailable => Some(None),
        Peripheral::Disabled => None,
    }
}

// ==============================================================================
// filter + append
// ==============================================================================

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub appended: usize,
    /// inside the deadband and the heartbeat window
    pub unchanged: usize,
    pub failed_reads: usize,
    pub store_errors: usize,
}

/// run one tick's samples through the filter and into the store.
///
/// the filter only learns about a sample once its row is stored, so a
/// failed insert is retried on the next tick instead of being forgotten.
pub fn record(
    mut state: FilterState,
    samples: &[RawSample],
    store: &Store,
    config: &FilterConfig,
) -> (FilterState, TickReport) {
    let mut report = TickReport::default();

    for sample in samples {
        let Some(values) = sample.values else {
            report.failed_reads += 1;
            continue;
        };
        if !state.should_persist(sample.group, Some(&values), sample.captured_at, config) {
            report.unchanged += 1;
            continue;
        }

        let reading = NewReading { group: sample.group, values, timestamp: sample.captured_at };
        match store.append(&reading) {
            Ok(id) => {
                tracing::debug!(group = %sample.group, id, "reading stored");
                state.accept(sample.group, values, sample.captured_at);
                report.appended += 1;
            }
            Err(e) => {
                tracing::error!(group = %sample.group, error = %e, "failed to store reading");
                report.store_errors += 1;
            }
        }
    }

    (state, report)
}
