//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An
//! example configuration file can be found in the `configs/` directory located in the repository
//! root.

use std::{fmt, path::Path, path::PathBuf};

use config::{Config, ConfigError, Environment};
use fedfraud_core::{
    calibration::ThresholdMode,
    model::mlp::{DEFAULT_HIDDEN_UNITS, DEFAULT_L2},
    partition::DEFAULT_SHUFFLE_BUFFER,
    table::{DEFAULT_LABEL_COLUMN, DEFAULT_NON_FEATURE_COLUMNS},
};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub run: RunSettings,
    pub data: DataSettings,
    #[validate]
    pub training: TrainingSettings,
    #[serde(default)]
    #[validate]
    pub early_stopping: EarlyStoppingSettings,
    #[serde(default)]
    #[validate]
    pub evaluation: EvaluationSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("fedfraud")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Validate, Deserialize, Clone)]
/// The settings of a training run.
pub struct RunSettings {
    /// The name of the data holder. It tags the exported history files.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [run]
    /// holder = "bank_m"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFRAUD__RUN__HOLDER=bank_m
    /// ```
    #[validate(length(min = 1))]
    pub holder: String,

    /// The directory of the run. Checkpoints go to `<run_root>/ckpt`, exported artifacts to
    /// `<run_root>/export`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [run]
    /// run_root = "models_round2/saved_bank_m"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFRAUD__RUN__RUN_ROOT=models_round2/saved_bank_m
    /// ```
    pub run_root: PathBuf,

    /// The total number of rounds of the run, including rounds restored from a checkpoint.
    /// The value must be greater or equal to `1`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [run]
    /// rounds = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFRAUD__RUN__ROUNDS=10
    /// ```
    #[validate(range(min = 1))]
    pub rounds: u64,

    /// The number of simulated clients. It is capped at the number of rows.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [run]
    /// n_clients = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFRAUD__RUN__N_CLIENTS=3
    /// ```
    #[validate(range(min = 1))]
    pub n_clients: usize,

    /// The seed of the client partition, the weight initialization and the batch shuffling.
    pub seed: u64,

    /// The number of examples per client batch.
    #[validate(range(min = 1))]
    pub batch_size: usize,

    /// The number of rows held back to shuffle the client batches.
    #[serde(default = "default_shuffle_buffer")]
    #[validate(range(min = 1))]
    pub shuffle_buffer: usize,

    /// Whether to continue from the checkpoint under `run_root`. A resumed run fails if the
    /// checkpoint is missing or unreadable. A run that is not resumed overwrites any checkpoint.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [run]
    /// resume = true
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFRAUD__RUN__RESUME=true
    /// ```
    #[serde(default)]
    pub resume: bool,

    /// An optional weights archive of a previous global model to start a fresh run from. If the
    /// archive can't be used, the run starts from random weights.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [run]
    /// base_model = "models_global_round1/global_model.npz"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFRAUD__RUN__BASE_MODEL=models_global_round1/global_model.npz
    /// ```
    #[serde(default)]
    pub base_model: Option<PathBuf>,

    /// The number of threads training clients in parallel. Defaults to one per client.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub workers: Option<usize>,
}

fn default_shuffle_buffer() -> usize {
    DEFAULT_SHUFFLE_BUFFER
}

#[derive(Debug, Deserialize, Clone)]
/// The dataset settings.
pub struct DataSettings {
    /// The csv file with the raw rows of the holder.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [data]
    /// dataset = "data/bank_M_data_clean.csv"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFRAUD__DATA__DATASET=data/bank_M_data_clean.csv
    /// ```
    pub dataset: PathBuf,

    /// The json document of the global feature schema.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [data]
    /// schema = "models_global/feature_schema.json"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFRAUD__DATA__SCHEMA=models_global/feature_schema.json
    /// ```
    pub schema: PathBuf,

    /// The binary label column.
    #[serde(default = "default_label_column")]
    pub label_column: String,

    /// Identifier and time columns removed before harmonization.
    #[serde(default = "default_drop_columns")]
    pub drop_columns: Vec<String>,
}

fn default_label_column() -> String {
    DEFAULT_LABEL_COLUMN.to_string()
}

fn default_drop_columns() -> Vec<String> {
    DEFAULT_NON_FEATURE_COLUMNS
        .iter()
        .map(|column| column.to_string())
        .collect()
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_training"))]
/// The optimizer and network settings.
pub struct TrainingSettings {
    /// The learning rate of the client optimizer.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [training]
    /// lr_client = 0.0005
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFRAUD__TRAINING__LR_CLIENT=0.0005
    /// ```
    pub lr_client: f32,

    /// The learning rate of the server optimizer.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [training]
    /// lr_server = 0.001
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFRAUD__TRAINING__LR_SERVER=0.001
    /// ```
    pub lr_server: f32,

    /// The widths of the hidden layers.
    #[serde(default = "default_hidden_units")]
    pub hidden_units: Vec<usize>,

    /// The L2 penalty of the kernels.
    #[serde(default = "default_l2")]
    pub l2: f32,
}

fn default_hidden_units() -> Vec<usize> {
    DEFAULT_HIDDEN_UNITS.to_vec()
}

fn default_l2() -> f32 {
    DEFAULT_L2
}

impl TrainingSettings {
    /// Checks the learning rates and the layer layout.
    fn validate_training(&self) -> Result<(), ValidationError> {
        if !(self.lr_client > 0. && self.lr_client.is_finite())
            || !(self.lr_server > 0. && self.lr_server.is_finite())
        {
            return Err(ValidationError::new("learning rates must be positive"));
        }
        if self.hidden_units.iter().any(|&units| units == 0) {
            return Err(ValidationError::new("hidden layers must not be empty"));
        }
        if !(self.l2 >= 0. && self.l2.is_finite()) {
            return Err(ValidationError::new("invalid l2 penalty"));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_training(s: &TrainingSettings) -> Result<(), ValidationError> {
    s.validate_training()
}

#[derive(Debug, Validate, Deserialize, Clone, Copy, PartialEq)]
/// The early stopping settings.
///
/// A run stops after round `r` if `r > warmup_rounds` and the round accuracy changed by less than
/// `min_delta` compared to round `r - 1`.
pub struct EarlyStoppingSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// The number of rounds that never stop the run.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [early_stopping]
    /// warmup_rounds = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFRAUD__EARLY_STOPPING__WARMUP_ROUNDS=3
    /// ```
    #[serde(default = "default_warmup_rounds")]
    pub warmup_rounds: u64,

    /// The accuracy change below which the run counts as converged.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [early_stopping]
    /// min_delta = 0.0001
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFRAUD__EARLY_STOPPING__MIN_DELTA=0.0001
    /// ```
    #[serde(default = "default_min_delta")]
    #[validate(range(min = 0.0))]
    pub min_delta: f64,
}

fn default_true() -> bool {
    true
}

fn default_warmup_rounds() -> u64 {
    3
}

fn default_min_delta() -> f64 {
    1e-4
}

impl Default for EarlyStoppingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            warmup_rounds: default_warmup_rounds(),
            min_delta: default_min_delta(),
        }
    }
}

impl EarlyStoppingSettings {
    /// Checks whether the accuracy of `round` is close enough to the previous round's to stop.
    pub fn should_stop(&self, round: u64, accuracy: f64, previous_accuracy: f64) -> bool {
        self.enabled
            && round > self.warmup_rounds
            && (accuracy - previous_accuracy).abs() < self.min_delta
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// How the decision threshold of an evaluation is chosen.
pub enum ThresholdModeSetting {
    /// Calibrate on the evaluated cases.
    Auto,
    /// Use the configured threshold.
    Manual,
}

#[derive(Debug, Validate, Deserialize, Clone, PartialEq)]
/// The settings of the `fedfraud-evaluate` binary.
pub struct EvaluationSettings {
    /// The weights archive to evaluate. Defaults to the exported global model of the run.
    #[serde(default)]
    pub model: Option<PathBuf>,

    /// The case files, one per holder.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [evaluation]
    /// cases = ["cases/bank_a.json", "cases/bank_b.json"]
    /// ```
    #[serde(default)]
    pub cases: Vec<PathBuf>,

    /// Whether to calibrate the threshold (`auto`) or use `threshold` (`manual`).
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [evaluation]
    /// threshold_mode = "manual"
    /// threshold = 0.5
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFRAUD__EVALUATION__THRESHOLD_MODE=manual
    /// FEDFRAUD__EVALUATION__THRESHOLD=0.5
    /// ```
    #[serde(default = "default_threshold_mode")]
    pub threshold_mode: ThresholdModeSetting,

    #[serde(default = "default_threshold")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub threshold: f64,

    /// An optional path for the json report.
    #[serde(default)]
    pub report: Option<PathBuf>,
}

fn default_threshold_mode() -> ThresholdModeSetting {
    ThresholdModeSetting::Auto
}

fn default_threshold() -> f64 {
    0.5
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            model: None,
            cases: Vec::new(),
            threshold_mode: default_threshold_mode(),
            threshold: default_threshold(),
            report: None,
        }
    }
}

impl EvaluationSettings {
    pub fn threshold_mode(&self) -> ThresholdMode {
        match self.threshold_mode {
            ThresholdModeSetting::Auto => ThresholdMode::Auto,
            ThresholdModeSetting::Manual => ThresholdMode::Manual(self.threshold),
        }
    }
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDFRAUD__LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3.18/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3.18/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
