//! YAML configuration loader.
//!
//! The document has three optional top-level sections. `Settings` is a plain
//! mapping of timing knobs. `Outputs` and `Birds` are sequences of mappings
//! in which the single key with a null value names the entry and the sibling
//! scalar keys are its properties:
//!
//! ```yaml
//! Settings:
//!   MinWait: 2000
//! Outputs:
//!   - Left Lamp:
//!     Type: GPIO
//!     Pin: 17
//! Birds:
//!   - Woody:
//!     Static: [Left Lamp]
//!     Back: []
//!     Forward: []
//! ```
//!
//! Unknown keys, unknown `Type` values and missing kind-specific fields are
//! hard errors; a failed load never yields a partial configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::{Mapping, Value};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{section} entry has no name")]
    MissingName { section: &'static str },
    #[error("output {name:?} has no type")]
    MissingType { name: String },
    #[error("output {name:?} has unknown type {given:?}")]
    UnknownType { name: String, given: String },
    #[error("unknown key {key:?} in {section} entry {name:?}")]
    UnknownKey {
        section: &'static str,
        name: String,
        key: String,
    },
    #[error("{type_name} output {name:?} is missing {key}")]
    MissingKey {
        type_name: &'static str,
        name: String,
        key: &'static str,
    },
    #[error("expected {expected} for {key:?} of {name:?}")]
    InvalidValue {
        name: String,
        key: String,
        expected: &'static str,
    },
}

/// Timing knobs for the peck schedule, in milliseconds and counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub min_wait: u32,
    pub max_wait: u32,
    pub min_pecks: u32,
    pub max_pecks: u32,
    pub peck_wait: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            min_wait: 1000,
            max_wait: 4000,
            min_pecks: 1,
            max_pecks: 3,
            peck_wait: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputKind {
    Memory,
    File { path: PathBuf },
    Gpio { pin: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    pub name: String,
    pub kind: OutputKind,
}

/// A bird is three ordered lists of output names: always-on statics and the
/// two peck positions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BirdSpec {
    pub name: String,
    pub statics: Vec<String>,
    pub backs: Vec<String>,
    pub forwards: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub settings: Settings,
    pub outputs: Vec<OutputSpec>,
    pub birds: Vec<BirdSpec>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawDocument {
    #[serde(rename = "Settings")]
    settings: Option<RawSettings>,
    #[serde(rename = "Outputs")]
    outputs: Option<Vec<Mapping>>,
    #[serde(rename = "Birds")]
    birds: Option<Vec<Mapping>>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawSettings {
    #[serde(rename = "MinWait")]
    min_wait: Option<u32>,
    #[serde(rename = "MaxWait")]
    max_wait: Option<u32>,
    #[serde(rename = "MinPecks")]
    min_pecks: Option<u32>,
    #[serde(rename = "MaxPecks")]
    max_pecks: Option<u32>,
    #[serde(rename = "PeckWait")]
    peck_wait: Option<u32>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_yaml::from_str(text)?;
        if value.is_null() {
            return Ok(Self::default());
        }
        let raw: RawDocument = serde_yaml::from_value(value)?;

        let mut config = Self::default();
        if let Some(settings) = raw.settings {
            let defaults = Settings::default();
            config.settings = Settings {
                min_wait: settings.min_wait.unwrap_or(defaults.min_wait),
                max_wait: settings.max_wait.unwrap_or(defaults.max_wait),
                min_pecks: settings.min_pecks.unwrap_or(defaults.min_pecks),
                max_pecks: settings.max_pecks.unwrap_or(defaults.max_pecks),
                peck_wait: settings.peck_wait.unwrap_or(defaults.peck_wait),
            };
        }
        for entry in raw.outputs.unwrap_or_default() {
            config.outputs.push(parse_output(&entry)?);
        }
        for entry in raw.birds.unwrap_or_default() {
            config.birds.push(parse_bird(&entry)?);
        }
        Ok(config)
    }
}

fn parse_output(entry: &Mapping) -> Result<OutputSpec, ConfigError> {
    let mut name: Option<String> = None;
    let mut type_name: Option<String> = None;
    let mut path: Option<PathBuf> = None;
    let mut pin: Option<u32> = None;

    for (key, value) in entry {
        let key = key.as_str().ok_or(ConfigError::MissingName {
            section: "Outputs",
        })?;
        match (key, value) {
            ("Type", value) => {
                type_name = Some(expect_string(value, &name, key)?);
            }
            ("Path", value) => {
                path = Some(PathBuf::from(expect_string(value, &name, key)?));
            }
            ("Pin", value) => {
                pin = Some(expect_u32(value, &name, key)?);
            }
            (other, Value::Null) if name.is_none() => {
                name = Some(other.to_string());
            }
            (other, _) => {
                return Err(ConfigError::UnknownKey {
                    section: "Outputs",
                    name: name.unwrap_or_default(),
                    key: other.to_string(),
                });
            }
        }
    }

    let name = name.ok_or(ConfigError::MissingName {
        section: "Outputs",
    })?;
    let type_name = type_name.ok_or_else(|| ConfigError::MissingType { name: name.clone() })?;

    let kind = match type_name.as_str() {
        "Memory" => OutputKind::Memory,
        "File" => OutputKind::File {
            path: path.ok_or_else(|| ConfigError::MissingKey {
                type_name: "File",
                name: name.clone(),
                key: "Path",
            })?,
        },
        "GPIO" => OutputKind::Gpio {
            pin: pin.ok_or_else(|| ConfigError::MissingKey {
                type_name: "GPIO",
                name: name.clone(),
                key: "Pin",
            })?,
        },
        other => {
            return Err(ConfigError::UnknownType {
                name,
                given: other.to_string(),
            });
        }
    };
    Ok(OutputSpec { name, kind })
}

fn parse_bird(entry: &Mapping) -> Result<BirdSpec, ConfigError> {
    let mut bird = BirdSpec::default();
    let mut name: Option<String> = None;

    for (key, value) in entry {
        let key = key.as_str().ok_or(ConfigError::MissingName { section: "Birds" })?;
        match (key, value) {
            ("Static", value) => bird.statics = expect_string_list(value, &name, key)?,
            ("Back", value) => bird.backs = expect_string_list(value, &name, key)?,
            ("Forward", value) => bird.forwards = expect_string_list(value, &name, key)?,
            (other, Value::Null) if name.is_none() => {
                name = Some(other.to_string());
            }
            (other, _) => {
                return Err(ConfigError::UnknownKey {
                    section: "Birds",
                    name: name.unwrap_or_default(),
                    key: other.to_string(),
                });
            }
        }
    }

    bird.name = name.ok_or(ConfigError::MissingName { section: "Birds" })?;
    Ok(bird)
}

fn expect_string(value: &Value, name: &Option<String>, key: &str) -> Result<String, ConfigError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ConfigError::InvalidValue {
            name: name.clone().unwrap_or_default(),
            key: key.to_string(),
            expected: "a string",
        })
}

fn expect_u32(value: &Value, name: &Option<String>, key: &str) -> Result<u32, ConfigError> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| ConfigError::InvalidValue {
            name: name.clone().unwrap_or_default(),
            key: key.to_string(),
            expected: "an unsigned integer",
        })
}

fn expect_string_list(
    value: &Value,
    name: &Option<String>,
    key: &str,
) -> Result<Vec<String>, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        name: name.clone().unwrap_or_default(),
        key: key.to_string(),
        expected: "a list of strings",
    };
    let sequence = value.as_sequence().ok_or_else(invalid)?;
    sequence
        .iter()
        .map(|item| item.as_str().map(str::to_string).ok_or_else(invalid))
        .collect()
}
