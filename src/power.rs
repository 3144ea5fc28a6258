//! Power sensing and loss-of-power classification.
//!
//! [`PowerMonitor`] keeps a sliding window of raw readings and compares the
//! windowed mean voltage against a threshold, so a single noisy sample never
//! triggers a migration. Sensor failures are absorbed here: the monitor
//! reports "no power loss" until readings come back.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::PowerConfig;
use crate::error::SensorError;

/// One voltage/current reading, already scaled to volts and amps.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerSample {
    pub voltage: f64,
    pub current: f64,
}

/// Source of raw power readings.
pub trait PowerSensor: Send {
    fn read(&mut self) -> Result<PowerSample, SensorError>;
}

/// Reads ADC channels exposed as integer files (Linux IIO / hwmon).
pub struct SysfsSensor {
    voltage_path: PathBuf,
    current_path: PathBuf,
    voltage_scale: f64,
    current_scale: f64,
}

impl SysfsSensor {
    pub fn from_config(config: &PowerConfig) -> Self {
        Self {
            voltage_path: config.voltage_path.clone(),
            current_path: config.current_path.clone(),
            voltage_scale: config.voltage_scale,
            current_scale: config.current_scale,
        }
    }
}

fn read_raw(path: &Path) -> Result<f64, SensorError> {
    let raw = std::fs::read_to_string(path).map_err(|source| SensorError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    raw.trim().parse::<f64>().map_err(|_| SensorError::Parse {
        path: path.to_path_buf(),
        raw: raw.trim().to_string(),
    })
}

impl PowerSensor for SysfsSensor {
    fn read(&mut self) -> Result<PowerSample, SensorError> {
        Ok(PowerSample {
            voltage: read_raw(&self.voltage_path)? * self.voltage_scale,
            current: read_raw(&self.current_path)? * self.current_scale,
        })
    }
}

pub struct PowerMonitor {
    /// `None` when sensing is administratively disabled.
    sensor: Option<Box<dyn PowerSensor>>,
    window: VecDeque<PowerSample>,
    capacity: usize,
    available: bool,
}

impl PowerMonitor {
    pub fn new(sensor: Box<dyn PowerSensor>, window_size: usize) -> Self {
        let capacity = window_size.max(1);
        Self {
            sensor: Some(sensor),
            window: VecDeque::with_capacity(capacity),
            capacity,
            available: true,
        }
    }

    /// A monitor that never reads hardware and never reports power loss.
    pub fn disabled() -> Self {
        Self {
            sensor: None,
            window: VecDeque::new(),
            capacity: 1,
            available: false,
        }
    }

    pub fn from_config(config: &PowerConfig) -> Self {
        if config.sensing_enabled {
            Self::new(Box::new(SysfsSensor::from_config(config)), config.window_size)
        } else {
            info!("power sensing disabled, node migrates on operator command only");
            Self::disabled()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sensor.is_some()
    }

    /// Take one reading and push it into the window.
    ///
    /// Returns zeros when sensing is disabled or the sensor failed.
    pub fn sample(&mut self) -> PowerSample {
        let Some(sensor) = self.sensor.as_mut() else {
            return PowerSample::default();
        };

        match sensor.read() {
            Ok(sample) => {
                if !self.available {
                    info!("power sensor readings resumed");
                    self.available = true;
                }
                if self.window.len() == self.capacity {
                    self.window.pop_front();
                }
                self.window.push_back(sample);
                sample
            }
            Err(e) => {
                if self.available {
                    warn!("power sensor unavailable, assuming no power loss: {e}");
                    self.available = false;
                }
                self.window.clear();
                PowerSample::default()
            }
        }
    }

    /// Mean of the current window, or `None` until the window is full.
    pub fn mean(&self) -> Option<PowerSample> {
        if self.window.len() < self.capacity {
            return None;
        }
        let n = self.window.len() as f64;
        let (voltage, current) = self
            .window
            .iter()
            .fold((0.0, 0.0), |(v, c), s| (v + s.voltage, c + s.current));
        Some(PowerSample {
            voltage: voltage / n,
            current: current / n,
        })
    }

    /// `true` when the windowed mean voltage is below `threshold_volts`.
    ///
    /// Always `false` while sensing is disabled, the sensor is failing, or
    /// the window has not filled yet.
    pub fn is_loss_of_power(&self, threshold_volts: f64) -> bool {
        if self.sensor.is_none() || !self.available {
            return false;
        }
        self.mean()
            .map(|mean| mean.voltage < threshold_volts)
            .unwrap_or(false)
    }
}
