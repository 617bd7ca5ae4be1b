//! Pumped-volume verification and the volume log.
//!
//! After every pump step with a flow sensor, the measured volume is compared
//! with `expected_flow * duration / 60`. A relative deviation above the
//! tolerance is not an error: the operator is asked to check the fluidics
//! and confirm before the round continues.
//!
//! Every measurement is appended to the volume log, pass or fail. The log is
//! written as `volume_log__YYYY-MM-DD_HH-MM.csv` next to the experiment
//! configuration. The file name is chosen on the first flush and the whole
//! file is rewritten on every flush.

use chrono::Local;
use fish_core::error::AppResult;
use fish_core::operator::OperatorPort;
use fish_hardware::config::FlowVerificationConfig;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Column header of the volume log.
pub const VOLUME_LOG_HEADER: [&str; 6] = [
    "Time",
    "round",
    "buffer",
    "duration",
    "vol_expected",
    "vol_measured",
];

/// Verification settings, adjustable at run time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowVerification {
    /// Compare measured volumes against the expected volume.
    pub verify: bool,
    /// Expected flow in ml/min.
    pub expected_flow: Option<f64>,
    /// Relative deviation that triggers an operator confirmation.
    pub tolerance: f64,
}

impl Default for FlowVerification {
    fn default() -> Self {
        FlowVerificationConfig::default().into()
    }
}

impl From<FlowVerificationConfig> for FlowVerification {
    fn from(config: FlowVerificationConfig) -> Self {
        Self {
            verify: config.verify,
            expected_flow: config.expected_flow,
            tolerance: config.tolerance,
        }
    }
}

/// One measured pump step.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeRecord {
    /// Wall clock time, `HH:MM:SS`.
    pub time: String,
    /// Round id.
    pub round: String,
    /// Buffer pumped.
    pub buffer: String,
    /// Pump duration in seconds.
    pub duration: f64,
    /// Expected volume in ml, if known.
    pub expected: Option<f64>,
    /// Measured volume in ml.
    pub measured: f64,
}

/// Result of checking one pump step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowCheck {
    /// No reading was available.
    NotMeasured,
    /// Recorded, verification disabled or no expected flow.
    Recorded,
    /// Within tolerance.
    Passed,
    /// Above tolerance; the operator confirmed.
    Escalated,
}

/// In-memory volume log, flushed to CSV.
#[derive(Debug, Clone)]
pub struct VolumeLog {
    rows: Vec<VolumeRecord>,
    dir: PathBuf,
    path: Option<PathBuf>,
}

impl VolumeLog {
    /// Empty log that will be written into `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            rows: Vec::new(),
            dir: dir.into(),
            path: None,
        }
    }

    /// Append a row.
    pub fn push(&mut self, record: VolumeRecord) {
        self.rows.push(record);
    }

    /// Rows in insertion order.
    pub fn rows(&self) -> &[VolumeRecord] {
        &self.rows
    }

    /// File the log is written to, once flushed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write all rows to the log file, replacing its content.
    pub fn flush(&mut self) -> AppResult<PathBuf> {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => {
                let name = Local::now()
                    .format("volume_log__%Y-%m-%d_%H-%M.csv")
                    .to_string();
                let path = self.dir.join(name);
                self.path = Some(path.clone());
                path
            }
        };

        let mut writer = csv::Writer::from_path(&path).map_err(csv_to_io)?;
        writer.write_record(VOLUME_LOG_HEADER).map_err(csv_to_io)?;
        for row in &self.rows {
            writer
                .write_record([
                    row.time.clone(),
                    row.round.clone(),
                    row.buffer.clone(),
                    row.duration.to_string(),
                    row.expected.map(|v| v.to_string()).unwrap_or_default(),
                    row.measured.to_string(),
                ])
                .map_err(csv_to_io)?;
        }
        writer.flush()?;
        info!(path = %path.display(), rows = self.rows.len(), "Volume log saved");
        Ok(path)
    }
}

fn csv_to_io(err: csv::Error) -> std::io::Error {
    std::io::Error::other(err)
}

/// Expected volume in ml for `duration_s` seconds at `flow` ml/min.
pub fn expected_volume(flow: f64, duration_s: f64) -> f64 {
    (flow * duration_s / 60.0 * 1000.0).round() / 1000.0
}

/// Checks pumped volumes and keeps the volume log.
#[derive(Debug, Clone)]
pub struct FlowVerifier {
    settings: FlowVerification,
    log: VolumeLog,
}

impl FlowVerifier {
    /// Verifier writing its log into `log_dir`.
    pub fn new(settings: FlowVerification, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            log: VolumeLog::new(log_dir),
        }
    }

    /// Current settings.
    pub fn settings(&self) -> FlowVerification {
        self.settings
    }

    /// Replace the settings.
    pub fn set_settings(&mut self, settings: FlowVerification) {
        info!(?settings, "Flow verification updated");
        self.settings = settings;
    }

    /// The volume log.
    pub fn log(&self) -> &VolumeLog {
        &self.log
    }

    /// Mutable access to the volume log, for flushing.
    pub fn log_mut(&mut self) -> &mut VolumeLog {
        &mut self.log
    }

    /// Record a measurement and escalate to the operator if it is off.
    pub async fn verify(
        &mut self,
        duration_s: f64,
        measured: Option<f64>,
        round: &str,
        buffer: &str,
        operator: &dyn OperatorPort,
    ) -> AppResult<FlowCheck> {
        let Some(measured) = measured else {
            error!(round, buffer, "No volume measured for pump step");
            return Ok(FlowCheck::NotMeasured);
        };

        let expected = self
            .settings
            .expected_flow
            .map(|flow| expected_volume(flow, duration_s));
        self.log.push(VolumeRecord {
            time: Local::now().format("%H:%M:%S").to_string(),
            round: round.to_string(),
            buffer: buffer.to_string(),
            duration: duration_s,
            expected,
            measured,
        });

        if !self.settings.verify {
            return Ok(FlowCheck::Recorded);
        }
        let Some(expected) = expected.filter(|v| *v > 0.0) else {
            warn!("Flow verification enabled without a positive expected flow");
            return Ok(FlowCheck::Recorded);
        };

        let deviation = (measured - expected).abs() / expected;
        info!(expected, measured, deviation, "Flow verification");
        if deviation <= self.settings.tolerance {
            return Ok(FlowCheck::Passed);
        }

        let message = format!(
            "Measured volume {} ml deviates {:.0}% from expected {} ml (tolerance {:.0}%). \
             Check the fluidics and confirm to continue.",
            measured,
            deviation * 100.0,
            expected,
            self.settings.tolerance * 100.0
        );
        warn!(round, buffer, "{}", message);
        operator.confirm(&message).await?;
        Ok(FlowCheck::Escalated)
    }
}
