//! Simulated vital-sign channels
//!
//! Each channel keeps `min <= current <= max` at all times: out-of-range
//! writes are clamped rather than rejected. The table keeps insertion order
//! so listings stay stable.

use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum VitalsError {
    #[error("Unknown vitals channel: {0}")]
    UnknownChannel(String),
    #[error("Invalid bounds: min {min} > max {max}")]
    InvalidBounds { min: f64, max: f64 },
    #[error("Value is not a finite number")]
    NotFinite,
}

/// One simulated vital-sign source
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    enabled: bool,
    min: f64,
    max: f64,
    current: f64,
    unit: String,
    display_name: String,
}

/// Published value of one channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub value: f64,
    pub unit: String,
    pub min: f64,
    pub max: f64,
}

impl Channel {
    pub fn new(
        display_name: impl Into<String>,
        unit: impl Into<String>,
        min: f64,
        max: f64,
        current: f64,
        enabled: bool,
    ) -> Result<Self, VitalsError> {
        if !(min.is_finite() && max.is_finite() && current.is_finite()) {
            return Err(VitalsError::NotFinite);
        }
        if min > max {
            return Err(VitalsError::InvalidBounds { min, max });
        }
        Ok(Self {
            enabled,
            min,
            max,
            current: current.clamp(min, max),
            unit: unit.into(),
            display_name: display_name.into(),
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Decimal places used when randomising
    pub fn precision(&self) -> u32 {
        match self.unit.as_str() {
            "°C" | "L/min" => 1,
            _ => 0,
        }
    }

    pub fn reading(&self) -> Reading {
        Reading {
            value: self.current,
            unit: self.unit.clone(),
            min: self.min,
            max: self.max,
        }
    }

    fn set_current(&mut self, value: f64) -> Result<f64, VitalsError> {
        if !value.is_finite() {
            return Err(VitalsError::NotFinite);
        }
        self.current = value.clamp(self.min, self.max);
        Ok(self.current)
    }

    fn set_bounds(&mut self, min: f64, max: f64) -> Result<(), VitalsError> {
        if !(min.is_finite() && max.is_finite()) {
            return Err(VitalsError::NotFinite);
        }
        if min > max {
            return Err(VitalsError::InvalidBounds { min, max });
        }
        self.min = min;
        self.max = max;
        self.current = self.current.clamp(min, max);
        Ok(())
    }

    fn randomize<R: Rng + ?Sized>(&mut self, rng: &mut R) -> f64 {
        let raw = if self.max > self.min {
            rng.gen_range(self.min..=self.max)
        } else {
            self.min
        };
        let scale = 10f64.powi(self.precision() as i32);
        // rounding can step just outside the bounds
        self.current = ((raw * scale).round() / scale).clamp(self.min, self.max);
        self.current
    }
}

/// Ordered set of channels, keyed by channel id
#[derive(Debug, Clone, PartialEq)]
pub struct VitalsTable {
    channels: Vec<(String, Channel)>,
}

impl Default for VitalsTable {
    fn default() -> Self {
        let defaults: [(&str, &str, &str, f64, f64, f64, bool); 9] = [
            ("temperature", "Temperature", "°C", 36.0, 38.5, 37.0, true),
            ("heartRate", "Heart Rate", "bpm", 60.0, 100.0, 72.0, true),
            ("bloodPressureSystolic", "BP Systolic", "mmHg", 90.0, 140.0, 120.0, true),
            ("bloodPressureDiastolic", "BP Diastolic", "mmHg", 60.0, 90.0, 80.0, true),
            ("respiratoryRate", "Respiratory Rate", "br/min", 12.0, 20.0, 16.0, true),
            ("spO2", "SpO2", "%", 95.0, 100.0, 98.0, true),
            ("etCO2", "EtCO2", "mmHg", 35.0, 45.0, 40.0, false),
            ("cardiacOutput", "Cardiac Output", "L/min", 4.0, 8.0, 5.5, false),
            ("glucose", "Glucose", "mg/dL", 70.0, 140.0, 100.0, false),
        ];

        let channels = defaults
            .into_iter()
            .map(|(id, name, unit, min, max, current, enabled)| {
                let channel = Channel {
                    enabled,
                    min,
                    max,
                    current,
                    unit: unit.to_string(),
                    display_name: name.to_string(),
                };
                (id.to_string(), channel)
            })
            .collect();

        Self { channels }
    }
}

impl VitalsTable {
    /// Empty table
    pub fn empty() -> Self {
        Self { channels: Vec::new() }
    }

    pub fn from_channels<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = (S, Channel)>,
        S: Into<String>,
    {
        let mut table = Self::empty();
        for (id, channel) in channels {
            table.insert(id, channel);
        }
        table
    }

    /// Insert or replace a channel; replacing keeps its position
    pub fn insert(&mut self, id: impl Into<String>, channel: Channel) {
        let id = id.into();
        match self.channels.iter_mut().find(|(existing, _)| *existing == id) {
            Some((_, slot)) => *slot = channel,
            None => self.channels.push((id, channel)),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Channel> {
        self.channels.iter().find(|(k, _)| k == id).map(|(_, c)| c)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Channel)> {
        self.channels.iter().map(|(k, c)| (k.as_str(), c))
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn channel_mut(&mut self, id: &str) -> Result<&mut Channel, VitalsError> {
        self.channels
            .iter_mut()
            .find(|(k, _)| k == id)
            .map(|(_, c)| c)
            .ok_or_else(|| VitalsError::UnknownChannel(id.to_string()))
    }

    /// Set the current value, returning it after clamping
    pub fn set_current(&mut self, id: &str, value: f64) -> Result<f64, VitalsError> {
        self.channel_mut(id)?.set_current(value)
    }

    pub fn set_bounds(&mut self, id: &str, min: f64, max: f64) -> Result<(), VitalsError> {
        self.channel_mut(id)?.set_bounds(min, max)
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<(), VitalsError> {
        self.channel_mut(id)?.enabled = enabled;
        Ok(())
    }

    /// Flip a channel on or off, returning the new state
    pub fn toggle(&mut self, id: &str) -> Result<bool, VitalsError> {
        let channel = self.channel_mut(id)?;
        channel.enabled = !channel.enabled;
        Ok(channel.enabled)
    }

    pub fn randomize_with<R: Rng + ?Sized>(&mut self, id: &str, rng: &mut R) -> Result<f64, VitalsError> {
        Ok(self.channel_mut(id)?.randomize(rng))
    }

    pub fn randomize(&mut self, id: &str) -> Result<f64, VitalsError> {
        self.randomize_with(id, &mut rand::thread_rng())
    }

    /// Randomise every enabled channel
    pub fn randomize_all(&mut self) {
        let mut rng = rand::thread_rng();
        for (_, channel) in self.channels.iter_mut().filter(|(_, c)| c.enabled) {
            channel.randomize(&mut rng);
        }
    }

    pub fn enabled_count(&self) -> usize {
        self.channels.iter().filter(|(_, c)| c.enabled).count()
    }

    /// Readings of enabled channels, as published in `VITALS`
    pub fn snapshot(&self) -> BTreeMap<String, Reading> {
        self.channels
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(id, c)| (id.clone(), c.reading()))
            .collect()
    }
}
