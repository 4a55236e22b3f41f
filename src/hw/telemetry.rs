//! Temperature source contract and sensor selection
//!
//! Sensor labels conventionally contain "CPU"/"GPU" substrings; absence of
//! a sensor is signaled by a zero reading, never an error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One labeled temperature reading
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SensorReading {
    pub label: String,
    pub celsius: f32,
}

/// Temperature provider consumed by the control loop
#[async_trait]
pub trait TemperatureSource: Send + Sync {
    async fn read_temperatures(&self) -> Result<Vec<SensorReading>>;
}

/// Pick the CPU and GPU temperatures out of a reading set by label
/// substring (case-insensitive). Missing sensors come back as 0.0.
pub fn select_cpu_gpu(readings: &[SensorReading]) -> (f32, f32) {
    let find = |needle: &str| {
        readings
            .iter()
            .find(|r| r.label.to_ascii_uppercase().contains(needle))
            .map(|r| r.celsius)
            .unwrap_or(0.0)
    };
    (find("CPU"), find("GPU"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(label: &str, celsius: f32) -> SensorReading {
        SensorReading { label: label.to_string(), celsius }
    }

    #[test]
    fn selects_by_label_substring() {
        let readings = vec![
            reading("cpu package", 61.5),
            reading("GPU Hotspot", 55.0),
            reading("ambient", 30.0),
        ];
        assert_eq!(select_cpu_gpu(&readings), (61.5, 55.0));
    }

    #[test]
    fn missing_sensor_reads_zero() {
        let readings = vec![reading("CPU", 70.0)];
        assert_eq!(select_cpu_gpu(&readings), (70.0, 0.0));
        assert_eq!(select_cpu_gpu(&[]), (0.0, 0.0));
    }
}
