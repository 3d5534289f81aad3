//! Loader and decode task configuration

use crate::error::{DecodeError, LoaderError};
use meshpipe_codec::CodecConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Element type of a decoded attribute array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
}

impl AttributeType {
    /// Typed array name used in task configs
    pub fn name(self) -> &'static str {
        match self {
            AttributeType::Int8 => "Int8Array",
            AttributeType::Uint8 => "Uint8Array",
            AttributeType::Int16 => "Int16Array",
            AttributeType::Uint16 => "Uint16Array",
            AttributeType::Int32 => "Int32Array",
            AttributeType::Uint32 => "Uint32Array",
            AttributeType::Float32 => "Float32Array",
        }
    }
}

impl FromStr for AttributeType {
    type Err = DecodeError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "Int8Array" => Ok(AttributeType::Int8),
            "Uint8Array" => Ok(AttributeType::Uint8),
            "Int16Array" => Ok(AttributeType::Int16),
            "Uint16Array" => Ok(AttributeType::Uint16),
            "Int32Array" => Ok(AttributeType::Int32),
            "Uint32Array" => Ok(AttributeType::Uint32),
            "Float32Array" => Ok(AttributeType::Float32),
            other => Err(DecodeError::UnexpectedAttributeType(other.to_owned())),
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How an output attribute is located in the encoded geometry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeKey {
    /// Per-file unique attribute id
    Unique(u32),
    /// Codec semantic name such as `POSITION`
    Semantic(String),
}

impl From<&str> for AttributeKey {
    fn from(name: &str) -> Self {
        AttributeKey::Semantic(name.to_owned())
    }
}

impl From<u32> for AttributeKey {
    fn from(unique_id: u32) -> Self {
        AttributeKey::Unique(unique_id)
    }
}

/// Per-request decode settings
///
/// Maps are ordered so that the serialized fingerprint is stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    pub attribute_ids: BTreeMap<String, AttributeKey>,
    /// Output name -> typed array name (`"Float32Array"`, ...)
    pub attribute_types: BTreeMap<String, String>,
    pub use_unique_ids: bool,
}

impl TaskConfig {
    /// Serialized form used to detect conflicting decodes of one buffer
    pub fn fingerprint(&self) -> Result<String, LoaderError> {
        serde_json::to_string(self).map_err(|e| LoaderError::Config(e.to_string()))
    }
}

/// Loader configuration
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderConfig {
    /// Decoder install location, overrides `decoder_config.module_path`
    pub decoder_path: Option<PathBuf>,
    pub decoder_config: CodecConfig,
    pub attribute_ids: BTreeMap<String, AttributeKey>,
    pub attribute_types: BTreeMap<String, String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        let defaults = [
            ("position", "POSITION"),
            ("normal", "NORMAL"),
            ("color", "COLOR"),
            ("uv", "TEX_COORD"),
        ];

        Self {
            decoder_path: None,
            decoder_config: CodecConfig::default(),
            attribute_ids: defaults
                .iter()
                .map(|(name, semantic)| (name.to_string(), AttributeKey::from(*semantic)))
                .collect(),
            attribute_types: defaults
                .iter()
                .map(|(name, _)| (name.to_string(), AttributeType::Float32.name().to_owned()))
                .collect(),
        }
    }
}

impl LoaderConfig {
    /// Codec runtime options with the decoder path applied
    pub fn codec_config(&self) -> CodecConfig {
        CodecConfig {
            flavor: self.decoder_config.flavor,
            module_path: self
                .decoder_path
                .clone()
                .or_else(|| self.decoder_config.module_path.clone()),
        }
    }

    /// Task config for the default attribute maps
    pub fn default_task_config(&self) -> TaskConfig {
        TaskConfig {
            attribute_ids: self.attribute_ids.clone(),
            attribute_types: self.attribute_types.clone(),
            use_unique_ids: false,
        }
    }
}
