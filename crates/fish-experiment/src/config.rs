//! Experiment configuration: buffers, well plate and step sequence.
//!
//! # Example
//!
//! ```yaml
//! buffers:
//!   wash1:  [1, 1, A1]        # valve id, plate id, plate position
//!   wash2:  [2, 1, A2]
//!   imaging: [3, 0, X10_Y20_Z-5]
//!
//! well_plate:
//!   rows: 8
//!   columns: 12
//!   well_spacing: 9
//!   bottom_left: {x: 10, y: 10}
//!   top_right: {x: 109, y: 73}
//!   z_base: -20
//!
//! valve_out_positions: [1, 2]
//!
//! sequence:
//!   - buffer: washii
//!   - pump: 30
//!   - - round: "1,2"          # conditional block
//!     - buffer: imaging
//!     - pause: 60
//!   - image: 1
//! ```
//!
//! The buffer table keeps its declaration order, because round order is
//! derived from it. That is why the file is read with `serde_yaml` directly:
//! figment's dictionaries are sorted by key.

use fish_core::error::FluidicsError;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Placeholder replaced by the round id in cycling buffer names.
pub const ROUND_PLACEHOLDER: &str = "ii";

// =============================================================================
// Errors
// =============================================================================

/// Experiment configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ExperimentConfigError {
    /// File could not be read.
    #[error("Cannot read experiment config {path}: {source}")]
    Read {
        /// Offending file.
        path: PathBuf,
        /// I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// File is not valid YAML or misses a required section.
    #[error("Invalid experiment config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A buffer entry is not a `[valve, plate, position]` triple.
    #[error("Buffer '{name}': {reason}")]
    Buffer {
        /// Buffer name.
        name: String,
        /// What is wrong.
        reason: String,
    },

    /// A sequence element cannot be read as a step.
    #[error("Sequence element {index}: {reason}")]
    Step {
        /// Position in the sequence, `3` or `3.1` for a conditional block.
        index: String,
        /// What is wrong.
        reason: String,
    },
}

impl From<ExperimentConfigError> for FluidicsError {
    fn from(err: ExperimentConfigError) -> Self {
        FluidicsError::Configuration(err.to_string())
    }
}

// =============================================================================
// Data model
// =============================================================================

/// Where a buffer is: inlet valve position and plate target.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferSpec {
    /// Inlet valve position; 0 means "no valve move".
    pub valve_id: u32,
    /// 0: absolute position string, 1: well on plate 1.
    pub plate_id: u32,
    /// `X.._Y.._Z..` string or well label; `None` means "no stage move".
    pub plate_pos: Option<String>,
}

/// A measured plate corner.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Corner {
    /// X coordinate in mm.
    pub x: f64,
    /// Y coordinate in mm.
    pub y: f64,
}

/// Well plate geometry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WellPlate {
    /// Number of rows.
    pub rows: u32,
    /// Number of columns.
    pub columns: u32,
    /// Distance between neighbouring wells in mm.
    pub well_spacing: f64,
    /// Measured position of the bottom-left well.
    pub bottom_left: Corner,
    /// Measured position of the top-right well.
    pub top_right: Corner,
    /// Z height used for every well.
    pub z_base: f64,
}

/// One protocol action.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Move to a buffer; may contain the round placeholder.
    Buffer(String),
    /// Run the pump for N seconds.
    Pump(f64),
    /// Sleep N seconds.
    Pause(f64),
    /// Move the outlet valve.
    ValveOut(u32),
    /// Pump once per outlet position, with one duration each.
    PumpValveOut(Vec<f64>),
    /// Move the stage to its zero reference.
    ZeroPlate,
    /// Block until the operator acknowledges.
    Wait,
    /// Acquire images after this round or not.
    Image(bool),
    /// Conditional block selector.
    Round(Vec<String>),
    /// Action not understood; rejected when executed.
    Unknown(String),
}

impl Step {
    /// Action keyword as written in the sequence.
    pub fn action(&self) -> &str {
        match self {
            Step::Buffer(_) => "buffer",
            Step::Pump(_) => "pump",
            Step::Pause(_) => "pause",
            Step::ValveOut(_) => "valve_out",
            Step::PumpValveOut(_) => "pump_valve_out",
            Step::ZeroPlate => "zero_plate",
            Step::Wait => "wait",
            Step::Image(_) => "image",
            Step::Round(_) => "round",
            Step::Unknown(action) => action,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Buffer(name) => write!(f, "buffer {}", name),
            Step::Pump(s) => write!(f, "pump {} s", s),
            Step::Pause(s) => write!(f, "pause {} s", s),
            Step::ValveOut(p) => write!(f, "valve_out {}", p),
            Step::PumpValveOut(d) => write!(f, "pump_valve_out {:?}", d),
            Step::Image(flag) => write!(f, "image {}", u8::from(*flag)),
            Step::Round(ids) => write!(f, "round {}", ids.join(",")),
            other => write!(f, "{}", other.action()),
        }
    }
}

/// Element of the sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    /// Step run in every round.
    Step(Step),
    /// List of steps; runs only for the rounds named by its leading `round` step.
    Conditional(Vec<Step>),
}

impl Entry {
    /// Round ids of a well-formed conditional block.
    pub fn selector(&self) -> Option<&[String]> {
        match self {
            Entry::Conditional(steps) => match steps.first() {
                Some(Step::Round(ids)) => Some(ids),
                _ => None,
            },
            Entry::Step(_) => None,
        }
    }
}

/// Parsed experiment configuration.
#[derive(Debug, Clone, Default)]
pub struct ExperimentConfig {
    /// Buffer table in declaration order.
    pub buffers: Vec<(String, BufferSpec)>,
    /// Protocol sequence.
    pub sequence: Vec<Entry>,
    /// Plate geometry, needed for well targets.
    pub well_plate: Option<WellPlate>,
    /// Outlet valve positions used by `pump_valve_out`.
    pub valve_out_positions: Vec<u32>,
    /// File the configuration was read from.
    pub source: Option<PathBuf>,
}

#[derive(Deserialize)]
struct RawExperiment {
    buffers: Mapping,
    sequence: Vec<Value>,
    #[serde(default)]
    well_plate: Option<WellPlate>,
    #[serde(default)]
    valve_out_positions: Vec<u32>,
}

impl ExperimentConfig {
    /// Parse YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self, ExperimentConfigError> {
        let raw: RawExperiment = serde_yaml::from_str(text)?;

        let buffers = raw
            .buffers
            .into_iter()
            .map(|(name, spec)| {
                let name = scalar_to_string(&name).ok_or_else(|| ExperimentConfigError::Buffer {
                    name: format!("{:?}", name),
                    reason: "buffer names must be strings".to_string(),
                })?;
                let spec = parse_buffer(&name, spec)?;
                Ok((name, spec))
            })
            .collect::<Result<Vec<_>, ExperimentConfigError>>()?;

        let sequence = raw
            .sequence
            .into_iter()
            .enumerate()
            .map(|(i, value)| parse_entry(i + 1, value))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            buffers,
            sequence,
            well_plate: raw.well_plate,
            valve_out_positions: raw.valve_out_positions,
            source: None,
        })
    }

    /// Buffer spec by exact name.
    pub fn buffer(&self, name: &str) -> Option<&BufferSpec> {
        self.buffers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, spec)| spec)
    }

    /// Declared buffer names in order.
    pub fn buffer_names(&self) -> impl Iterator<Item = &str> {
        self.buffers.iter().map(|(n, _)| n.as_str())
    }

    /// Plate-1 positions used by more than one buffer, in first-seen order.
    pub fn duplicate_plate_positions(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for (_, spec) in &self.buffers {
            if spec.plate_id != 1 {
                continue;
            }
            if let Some(pos) = &spec.plate_pos {
                if !seen.insert(pos.clone()) && !duplicates.contains(pos) {
                    duplicates.push(pos.clone());
                }
            }
        }
        duplicates
    }
}

/// Load an experiment configuration from a YAML file.
pub fn load_experiment_config(path: &Path) -> Result<ExperimentConfig, ExperimentConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ExperimentConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config = ExperimentConfig::from_yaml_str(&text)?;
    config.source = Some(path.to_path_buf());
    info!(
        path = %path.display(),
        buffers = config.buffers.len(),
        steps = config.sequence.len(),
        "Experiment config loaded"
    );
    Ok(config)
}

// =============================================================================
// Parsing helpers
// =============================================================================

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_buffer(name: &str, value: Value) -> Result<BufferSpec, ExperimentConfigError> {
    let err = |reason: &str| ExperimentConfigError::Buffer {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    let Value::Sequence(items) = value else {
        return Err(err("expected [valve id, plate id, plate position]"));
    };
    if items.len() != 3 {
        return Err(err("expected [valve id, plate id, plate position]"));
    }
    let id = |v: &Value, what: &str| {
        v.as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| err(&format!("{} must be a non-negative integer", what)))
    };
    Ok(BufferSpec {
        valve_id: id(&items[0], "valve id")?,
        plate_id: id(&items[1], "plate id")?,
        plate_pos: match &items[2] {
            Value::Null => None,
            other => Some(
                scalar_to_string(other).ok_or_else(|| err("plate position must be a string"))?,
            ),
        },
    })
}

fn parse_entry(index: usize, value: Value) -> Result<Entry, ExperimentConfigError> {
    match value {
        Value::Sequence(items) => items
            .into_iter()
            .enumerate()
            .map(|(j, item)| parse_step(&format!("{}.{}", index, j + 1), item))
            .collect::<Result<Vec<_>, _>>()
            .map(Entry::Conditional),
        other => parse_step(&index.to_string(), other).map(Entry::Step),
    }
}

fn parse_step(index: &str, value: Value) -> Result<Step, ExperimentConfigError> {
    let err = |reason: String| ExperimentConfigError::Step {
        index: index.to_string(),
        reason,
    };

    let (action, param) = match value {
        Value::Mapping(map) if map.len() == 1 => {
            let Some((key, param)) = map.into_iter().next() else {
                return Err(err("empty step".to_string()));
            };
            let action = scalar_to_string(&key).ok_or_else(|| err("action must be a string".into()))?;
            (action, param)
        }
        // A bare keyword such as `- wait` or `- zero_plate`.
        Value::String(action) => (action, Value::Null),
        _ => return Err(err("a step is a single `action: parameter` pair".to_string())),
    };

    let seconds = |param: &Value| {
        number(param)
            .filter(|s| *s >= 0.0)
            .ok_or_else(|| err(format!("{} needs a duration in seconds", action)))
    };

    let step = match action.as_str() {
        "buffer" => Step::Buffer(
            scalar_to_string(&param).ok_or_else(|| err("buffer needs a name".to_string()))?,
        ),
        "pump" => Step::Pump(seconds(&param)?),
        "pause" => Step::Pause(seconds(&param)?),
        "valve_out" => Step::ValveOut(
            param
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| err("valve_out needs a valve position".to_string()))?,
        ),
        "pump_valve_out" => {
            let Value::Sequence(items) = &param else {
                return Err(err("pump_valve_out needs a list of durations".to_string()));
            };
            Step::PumpValveOut(items.iter().map(&seconds).collect::<Result<_, _>>()?)
        }
        "zero_plate" => Step::ZeroPlate,
        "wait" => Step::Wait,
        "image" => Step::Image(match &param {
            Value::Bool(b) => *b,
            other => number(other) == Some(1.0),
        }),
        "round" => Step::Round(
            scalar_to_string(&param)
                .ok_or_else(|| err("round needs comma-separated round ids".to_string()))?
                .split(',')
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
        ),
        _ => Step::Unknown(action.clone()),
    };
    Ok(step)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
buffers:
  wash2: [2, 1, A2]
  wash1: [1, 1, A1]
  imaging: [3, 0, X10_Y20_Z-5]
  waste: [0, 0, null]
well_plate:
  rows: 8
  columns: 12
  well_spacing: 9
  bottom_left: {x: 10, y: 10}
  top_right: {x: 109, y: 73}
  z_base: -20
valve_out_positions: [1, 2]
sequence:
  - buffer: washii
  - pump: 30
  - - round: "1, 2"
    - buffer: imaging
    - pause: 60.5
  - pump_valve_out: [10, 20]
  - zero_plate: 1
  - wait
  - image: 1
  - shake: 3
"#;

    #[test]
    fn parses_all_sections_in_order() {
        let config = ExperimentConfig::from_yaml_str(EXAMPLE).unwrap();

        let names: Vec<&str> = config.buffer_names().collect();
        assert_eq!(names, vec!["wash2", "wash1", "imaging", "waste"]);
        assert_eq!(
            config.buffer("imaging"),
            Some(&BufferSpec {
                valve_id: 3,
                plate_id: 0,
                plate_pos: Some("X10_Y20_Z-5".into())
            })
        );
        assert_eq!(config.buffer("waste").unwrap().plate_pos, None);
        assert_eq!(config.valve_out_positions, vec![1, 2]);
        assert_eq!(config.well_plate.as_ref().unwrap().columns, 12);

        assert_eq!(
            config.sequence,
            vec![
                Entry::Step(Step::Buffer("washii".into())),
                Entry::Step(Step::Pump(30.0)),
                Entry::Conditional(vec![
                    Step::Round(vec!["1".into(), "2".into()]),
                    Step::Buffer("imaging".into()),
                    Step::Pause(60.5),
                ]),
                Entry::Step(Step::PumpValveOut(vec![10.0, 20.0])),
                Entry::Step(Step::ZeroPlate),
                Entry::Step(Step::Wait),
                Entry::Step(Step::Image(true)),
                Entry::Step(Step::Unknown("shake".into())),
            ]
        );
        assert_eq!(
            config.sequence[2].selector(),
            Some(&["1".to_string(), "2".to_string()][..])
        );
    }

    #[test]
    fn image_flag_other_than_one_disables_acquisition() {
        let config = ExperimentConfig::from_yaml_str(
            "buffers: {}\nsequence:\n  - image: 0\n  - image: 2\n",
        )
        .unwrap();
        assert_eq!(
            config.sequence,
            vec![
                Entry::Step(Step::Image(false)),
                Entry::Step(Step::Image(false))
            ]
        );
    }

    #[test]
    fn numeric_round_selector() {
        let config =
            ExperimentConfig::from_yaml_str("buffers: {}\nsequence:\n  - - round: 3\n    - pause: 1\n")
                .unwrap();
        assert_eq!(config.sequence[0].selector(), Some(&["3".to_string()][..]));
    }

    #[test]
    fn malformed_entries_are_rejected() {
        let bad_buffer = "buffers:\n  wash1: [1, 1]\nsequence: []\n";
        assert!(matches!(
            ExperimentConfig::from_yaml_str(bad_buffer),
            Err(ExperimentConfigError::Buffer { .. })
        ));

        let bad_pump = "buffers: {}\nsequence:\n  - pump: fast\n";
        let err = ExperimentConfig::from_yaml_str(bad_pump).unwrap_err();
        assert!(err.to_string().contains("Sequence element 1"));

        let nested = "buffers: {}\nsequence:\n  - - round: 1\n    - pump: -3\n";
        let err = ExperimentConfig::from_yaml_str(nested).unwrap_err();
        assert!(err.to_string().contains("1.2"));
    }

    #[test]
    fn duplicate_plate_one_positions() {
        let config = ExperimentConfig::from_yaml_str(
            r#"
buffers:
  a: [1, 1, A1]
  b: [2, 1, A1]
  c: [3, 0, A1]
  d: [4, 1, B2]
  e: [5, 1, A1]
sequence: []
"#,
        )
        .unwrap();
        assert_eq!(config.duplicate_plate_positions(), vec!["A1".to_string()]);
    }

    #[test]
    fn load_from_file_records_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.yaml");
        std::fs::write(&path, EXAMPLE).unwrap();
        let config = load_experiment_config(&path).unwrap();
        assert_eq!(config.source.as_deref(), Some(path.as_path()));

        let missing = load_experiment_config(&dir.path().join("nope.yaml"));
        assert!(matches!(missing, Err(ExperimentConfigError::Read { .. })));
    }
}
