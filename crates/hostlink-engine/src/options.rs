//! Bridge configuration
//!
//! Defaults suit a module built against the standard `hostlink` import
//! namespace. Options can also be loaded from TOML:
//!
//! ```toml
//! import_module = "hostlink"
//! start_export = "__hostlink_start"
//! encode_strategy = "copy_through"
//! streaming = false
//! ```

use std::path::Path;

use serde::Deserialize;

/// How strings are written into module memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodeStrategy {
    /// Encode directly into module memory, doubling the allocation as needed
    #[default]
    EncodeInto,
    /// Encode to a temporary buffer, then allocate the exact length and copy
    CopyThrough,
}

/// Options for one bridge instance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeOptions {
    /// Namespace the bridge publishes its imports under
    pub import_module: String,
    /// Export invoked once after instantiation; skipped if the module lacks it
    pub start_export: String,
    /// String encode strategy
    pub encode_strategy: EncodeStrategy,
    /// Try streaming instantiation for locators before buffering
    pub streaming: bool,
    /// Content type the streaming path requires
    pub expected_content_type: String,
    /// Leased handle slots to reserve up front
    pub initial_table_capacity: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            import_module: "hostlink".to_string(),
            start_export: hostlink_sdk::START_EXPORT.to_string(),
            encode_strategy: EncodeStrategy::default(),
            streaming: true,
            expected_content_type: "application/wasm".to_string(),
            initial_table_capacity: 32,
        }
    }
}

/// Error loading options
#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    /// File could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path that was attempted
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// TOML did not match the options schema
    #[error("invalid bridge options: {0}")]
    Parse(#[from] toml::de::Error),
}

impl BridgeOptions {
    /// Parse options from a TOML document; missing keys take defaults
    pub fn from_toml_str(s: &str) -> Result<Self, OptionsError> {
        Ok(toml::from_str(s)?)
    }

    /// Load options from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OptionsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| OptionsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
