//! Sensirion flow sensor read through the vendor software's CSV log.
//!
//! The sensor software appends one CSV line per sample. `start()` records
//! where the last line of the log begins. `stop()` reads everything from
//! there to the end of the file and integrates it:
//!
//! 1. The time and flow columns are parsed with the configured
//!    thousands and decimal separators.
//! 2. Time is made relative to the first sample.
//! 3. Flow (µl/min) is smoothed with a moving average of `kernel_size` samples.
//!    The window is centred the way a `same`-mode convolution centres it,
//!    and missing neighbours at the edges count as zero.
//! 4. Samples below `flow_min` are set to zero.
//! 5. The trapezoidal integral over minutes is converted to ml and rounded
//!    to three decimals.
//!
//! With fewer than two samples there is no reading (`None`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use fish_core::capabilities::FlowSensor;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument};

use crate::config::FlowSensorConfig;

/// Device type string.
pub const DEVICE_TYPE: &str = "SENSIRION CSV";

/// Parsing and smoothing settings.
#[derive(Debug, Clone)]
pub struct SensirionSettings {
    /// CSV log written by the sensor software.
    pub log_file: PathBuf,
    /// Moving-average window in samples.
    pub kernel_size: usize,
    /// Smoothed flow below this value counts as zero.
    pub flow_min: f64,
    /// Thousands separator.
    pub thousands_separator: String,
    /// Decimal separator.
    pub decimal_separator: String,
    /// Field delimiter.
    pub delimiter: u8,
    /// Time column (seconds).
    pub time_column: usize,
    /// Flow column (µl/min).
    pub flow_column: usize,
}

impl SensirionSettings {
    /// Settings from the `[flow_sensor]` section.
    pub fn from_config(config: &FlowSensorConfig) -> Result<Self> {
        let mut buf = [0u8; 4];
        let delimiter = config.delimiter.encode_utf8(&mut buf).as_bytes();
        if delimiter.len() != 1 {
            anyhow::bail!("flow_sensor delimiter must be a single byte character");
        }
        Ok(Self {
            log_file: config.log_file.clone(),
            kernel_size: config.kernel_size.max(1),
            flow_min: config.flow_min,
            thousands_separator: config.thousands_separator.clone(),
            decimal_separator: config.decimal_separator.clone(),
            delimiter: delimiter[0],
            time_column: config.time_column,
            flow_column: config.flow_column,
        })
    }
}

/// Flow sensor backed by a growing CSV log.
pub struct SensirionCsv {
    settings: SensirionSettings,
    window_start: Mutex<Option<usize>>,
}

impl SensirionCsv {
    /// Create the sensor; the log file must already exist.
    pub fn new(settings: SensirionSettings) -> Result<Self> {
        if !settings.log_file.is_file() {
            anyhow::bail!(
                "File for flow measurement not found {}",
                settings.log_file.display()
            );
        }
        info!(log_file = %settings.log_file.display(), "Assign SENSIRION CSV flow sensor");
        Ok(Self {
            settings,
            window_start: Mutex::new(None),
        })
    }

    async fn read_log(path: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read flow log {}", path.display()))
    }

    /// Parse the samples in `data` as `(time_s, flow_ul_min)` pairs.
    pub fn parse_samples(&self, data: &[u8]) -> Vec<(f64, f64)> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.settings.delimiter)
            .from_reader(data);

        let mut samples = Vec::new();
        for record in reader.records() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable flow log line");
                    continue;
                }
            };
            let time = record
                .get(self.settings.time_column)
                .and_then(|s| self.parse_number(s));
            let flow = record
                .get(self.settings.flow_column)
                .and_then(|s| self.parse_number(s));
            match (time, flow) {
                (Some(t), Some(f)) => samples.push((t, f)),
                _ => debug!(?record, "Skipping flow log line without numbers"),
            }
        }
        samples
    }

    fn parse_number(&self, raw: &str) -> Option<f64> {
        parse_locale_number(
            raw,
            &self.settings.thousands_separator,
            &self.settings.decimal_separator,
        )
    }
}

/// Offset of the first byte of the last line, ignoring one trailing newline.
fn last_line_start(data: &[u8]) -> usize {
    if data.len() < 2 {
        return 0;
    }
    data[..data.len() - 1]
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0)
}

/// Parse a number written with locale separators, e.g. `1,234.5` or `1.234,5`.
pub fn parse_locale_number(raw: &str, thousands: &str, decimal: &str) -> Option<f64> {
    let mut text = raw.trim().to_string();
    if !thousands.is_empty() {
        text = text.replace(thousands, "");
    }
    if decimal != "." {
        text = text.replace(decimal, ".");
    }
    text.parse().ok()
}

/// Moving average with the window placement of a `same`-mode convolution.
pub fn moving_average(values: &[f64], kernel_size: usize) -> Vec<f64> {
    let k = kernel_size.max(1);
    let n = values.len() as isize;
    let half = (k / 2) as isize;
    (0..n)
        .map(|i| {
            let lo = i - half;
            let sum: f64 = (lo..lo + k as isize)
                .filter(|m| (0..n).contains(m))
                .map(|m| values[m as usize])
                .sum();
            sum / k as f64
        })
        .collect()
}

/// Integrate `(time_s, flow_ul_min)` samples into a volume in ml.
pub fn integrate_volume(samples: &[(f64, f64)], kernel_size: usize, flow_min: f64) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let t0 = samples[0].0;
    let minutes: Vec<f64> = samples.iter().map(|(t, _)| (t - t0) / 60.0).collect();
    let flow: Vec<f64> = samples.iter().map(|(_, f)| *f).collect();

    let smoothed: Vec<f64> = moving_average(&flow, kernel_size)
        .into_iter()
        .map(|f| if f < flow_min { 0.0 } else { f })
        .collect();

    let microliters: f64 = minutes
        .windows(2)
        .zip(smoothed.windows(2))
        .map(|(t, f)| (t[1] - t[0]) * (f[0] + f[1]) / 2.0)
        .sum();

    let milliliters = microliters / 1000.0;
    Some((milliliters * 1000.0).round() / 1000.0)
}

#[async_trait]
impl FlowSensor for SensirionCsv {
    #[instrument(skip(self), err)]
    async fn start(&self) -> Result<()> {
        let data = Self::read_log(&self.settings.log_file).await?;
        *self.window_start.lock() = Some(last_line_start(&data));
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn stop(&self) -> Result<Option<f64>> {
        let Some(offset) = self.window_start.lock().take() else {
            error!("Flow measurement stopped without being started");
            return Ok(None);
        };
        let data = Self::read_log(&self.settings.log_file).await?;
        let window = data.get(offset..).unwrap_or_default();
        let samples = self.parse_samples(window);

        let volume = integrate_volume(
            &samples,
            self.settings.kernel_size,
            self.settings.flow_min,
        );
        if volume.is_none() {
            error!(
                samples = samples.len(),
                "No time-course of flow measurements can be read. Is logging active?"
            );
        }
        Ok(volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn settings(path: &Path, kernel_size: usize, flow_min: f64) -> SensirionSettings {
        SensirionSettings {
            log_file: path.to_path_buf(),
            kernel_size,
            flow_min,
            thousands_separator: ",".into(),
            decimal_separator: ".".into(),
            delimiter: b',',
            time_column: 1,
            flow_column: 2,
        }
    }

    #[test]
    fn locale_numbers() {
        assert_eq!(parse_locale_number("1,234.5", ",", "."), Some(1234.5));
        assert_eq!(parse_locale_number(" 1.234,5 ", ".", ","), Some(1234.5));
        assert_eq!(parse_locale_number("abc", ",", "."), None);
    }

    #[test]
    fn moving_average_matches_same_mode_convolution() {
        let values = [1.0, 2.0, 3.0, 4.0];
        let smoothed = moving_average(&values, 3);
        let expected = [1.0, 2.0, 3.0, 7.0 / 3.0];
        for (a, b) in smoothed.iter().zip(expected) {
            assert!((a - b).abs() < 1e-12);
        }
        // Even kernels lean towards earlier samples.
        assert_eq!(moving_average(&values, 2), vec![0.5, 1.5, 2.5, 3.5]);
        assert_eq!(moving_average(&values, 1), values.to_vec());
    }

    #[test]
    fn integrates_with_noise_floor() {
        let samples = [(0.0, 100.0), (30.0, 200.0), (60.0, 300.0), (90.0, 400.0)];
        // Smoothed: [100, 200, 300, 233.3]; 100 falls under the floor.
        assert_eq!(integrate_volume(&samples, 3, 150.0), Some(0.308));
    }

    #[test]
    fn constant_flow_for_one_minute() {
        let samples: Vec<(f64, f64)> = (0..=60).map(|s| (s as f64, 450.0)).collect();
        assert_eq!(integrate_volume(&samples, 1, 0.0), Some(0.45));
    }

    #[test]
    fn too_few_samples() {
        assert_eq!(integrate_volume(&[(0.0, 450.0)], 1, 0.0), None);
        assert_eq!(integrate_volume(&[], 1, 0.0), None);
    }

    #[test]
    fn last_line_offset() {
        assert_eq!(last_line_start(b"a\nbb\nccc\n"), 5);
        assert_eq!(last_line_start(b"a\nbb\nccc"), 5);
        assert_eq!(last_line_start(b"single\n"), 0);
        assert_eq!(last_line_start(b""), 0);
    }

    #[tokio::test]
    async fn measures_lines_appended_since_start() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Date,Time [s],Flow [ul/min]").unwrap();
        writeln!(file, "2024-01-01,\"1,000\",0").unwrap();
        file.flush().unwrap();

        let sensor = SensirionCsv::new(settings(file.path(), 1, 0.0)).unwrap();
        sensor.start().await.unwrap();

        // The last line before start() is part of the window.
        for s in 1..=60 {
            writeln!(file, "2024-01-01,\"{}\",450.0", 1000 + s).unwrap();
        }
        file.flush().unwrap();

        // First sample has zero flow, so the first second adds 0.00375 ml less.
        assert_eq!(sensor.stop().await.unwrap(), Some(0.446));
    }

    #[tokio::test]
    async fn stop_without_samples_returns_none() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Date,Time [s],Flow [ul/min]").unwrap();
        file.flush().unwrap();

        let sensor = SensirionCsv::new(settings(file.path(), 1, 0.0)).unwrap();
        sensor.start().await.unwrap();
        assert_eq!(sensor.stop().await.unwrap(), None);
    }

    #[test]
    fn missing_log_file_is_rejected() {
        let result = SensirionCsv::new(settings(Path::new("/nonexistent/flow.csv"), 1, 0.0));
        assert!(result.is_err());
    }
}
