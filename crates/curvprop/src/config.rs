//! Extension settings loaded from JSON.
//!
//! ```json
//! {
//!   "extension": "batch_diag_ggn",
//!   "loss_hessian_strategy": "SAMPLING",
//!   "mc_samples": 8,
//!   "subsampling": [0, 3, 5],
//!   "fail_mode": "WARN",
//!   "seed": 42
//! }
//! ```
//!
//! Every field except `extension` is optional; `subsampling` is either the
//! string `"all"` or an array of batch indices.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BackpropError, ConfigError};
use crate::extensions::{Extension, ExtensionKind, FailMode, InputFactor, LossHessianStrategy};

/// Which batch rows an extension uses.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "SubsamplingRepr", into = "SubsamplingRepr")]
pub enum Subsampling {
    #[default]
    All,
    Indices(Vec<usize>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SubsamplingRepr {
    Keyword(String),
    Indices(Vec<usize>),
}

impl TryFrom<SubsamplingRepr> for Subsampling {
    type Error = String;

    fn try_from(repr: SubsamplingRepr) -> Result<Self, Self::Error> {
        match repr {
            SubsamplingRepr::Keyword(k) if k == "all" => Ok(Subsampling::All),
            SubsamplingRepr::Keyword(k) => Err(format!("expected \"all\" or an index array, got {k:?}")),
            SubsamplingRepr::Indices(indices) => Ok(Subsampling::Indices(indices)),
        }
    }
}

impl From<Subsampling> for SubsamplingRepr {
    fn from(s: Subsampling) -> Self {
        match s {
            Subsampling::All => SubsamplingRepr::Keyword("all".to_string()),
            Subsampling::Indices(indices) => SubsamplingRepr::Indices(indices),
        }
    }
}

fn default_strategy() -> LossHessianStrategy {
    LossHessianStrategy::Exact
}

fn default_mc_samples() -> usize {
    1
}

/// Serializable description of one [`Extension`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtensionSettings {
    pub extension: ExtensionKind,

    #[serde(default = "default_strategy")]
    pub loss_hessian_strategy: LossHessianStrategy,

    /// Draws per sample; only read under `SAMPLING`.
    #[serde(default = "default_mc_samples")]
    pub mc_samples: usize,

    #[serde(default)]
    pub subsampling: Subsampling,

    #[serde(default)]
    pub fail_mode: FailMode,

    /// Seed of the Monte-Carlo sampler; drawn from the OS when absent.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Kronecker extensions only.
    #[serde(default)]
    pub input_factor: Option<InputFactor>,
}

impl ExtensionSettings {
    /// Default settings for `extension`.
    pub fn new(extension: ExtensionKind) -> Self {
        Self {
            extension,
            loss_hessian_strategy: default_strategy(),
            mc_samples: default_mc_samples(),
            subsampling: Subsampling::All,
            fail_mode: FailMode::default(),
            seed: None,
            input_factor: None,
        }
    }

    /// Construct the configured extension.
    ///
    /// # Errors
    ///
    /// `InvalidLossHessianStrategy` or `InvalidConfiguration` for settings
    /// the extension does not accept.
    pub fn build(&self) -> Result<Extension, BackpropError> {
        let mut ext = Extension::new(self.extension, self.loss_hessian_strategy, self.mc_samples)?
            .with_fail_mode(self.fail_mode);
        if let Subsampling::Indices(indices) = &self.subsampling {
            ext = ext.with_subsampling(indices);
        }
        if let Some(seed) = self.seed {
            ext = ext.with_seed(seed);
        }
        if let Some(input_factor) = self.input_factor {
            ext = ext.with_input_factor(input_factor)?;
        }
        Ok(ext)
    }

    /// Parse and validate settings from a JSON string.
    ///
    /// # Example
    ///
    /// ```
    /// use curvprop::config::ExtensionSettings;
    ///
    /// let settings = ExtensionSettings::from_json_str(r#"{"extension": "diag_hessian"}"#).unwrap();
    /// assert_eq!(settings.build().unwrap().savefield(), "diag_h");
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: ExtensionSettings = serde_json::from_str(json)?;
        settings.build()?;
        Ok(settings)
    }

    /// Read and validate settings from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
