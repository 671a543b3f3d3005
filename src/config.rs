use clap::Parser;
use serde::Deserialize;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::graph::{parse_option_entry, OptionValue, ProcessingOptions, DEFAULT_OPSET};
use crate::tokenizer::TokenizerVariant;

pub const DEFAULT_TOKENIZER_DIR: &str = "tokenizer";
pub const DEFAULT_OUTPUT: &str = "tokenizer.onnx";
pub const DEFAULT_DECODER_OUTPUT: &str = "detokenizer.onnx";
pub const DEFAULT_SAMPLE_TEXT: &str = "A photo of a cat";

/// Which processing graph(s) get written to disk.
#[derive(clap::ValueEnum, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputTarget {
    #[default]
    Encode,
    Decode,
    Both,
}

impl OutputTarget {
    pub fn includes_encode(&self) -> bool {
        matches!(self, OutputTarget::Encode | OutputTarget::Both)
    }

    pub fn includes_decode(&self) -> bool {
        matches!(self, OutputTarget::Decode | OutputTarget::Both)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    NotFound(PathBuf),
    IoError(io::Error),
    JsonError(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NotFound(p) => write!(f, "Settings file not found at: {}", p.display()),
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::JsonError(e) => write!(f, "JSON error: {}", e),
            ConfigError::Invalid(s) => write!(f, "Invalid settings: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(e) => Some(e),
            ConfigError::JsonError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> ConfigError {
        ConfigError::IoError(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> ConfigError {
        ConfigError::JsonError(err)
    }
}

/// Export a pretrained tokenizer's preprocessing as an ONNX processing graph.
#[derive(Parser, Debug, Default)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Saved tokenizer directory [default: tokenizer]
    #[clap(long, value_parser)]
    pub tokenizer_dir: Option<PathBuf>,
    /// Tokenizer variant the directory holds [default: clip]
    #[clap(long, value_enum)]
    pub variant: Option<TokenizerVariant>,
    /// Encode graph output path [default: tokenizer.onnx]
    #[clap(long, value_parser)]
    pub output: Option<PathBuf>,
    /// Decode graph output path [default: detokenizer.onnx]
    #[clap(long, value_parser)]
    pub decoder_output: Option<PathBuf>,
    /// Which graph(s) to write [default: encode]
    #[clap(long, value_enum)]
    pub target: Option<OutputTarget>,
    /// Text run through the tokenizer before export [default: "A photo of a cat"]
    #[clap(long, value_parser)]
    pub sample_text: Option<String>,
    /// Attribute for the encode op, as KEY=VALUE (repeatable)
    #[clap(long = "pre-option", value_name = "KEY=VALUE", value_parser = parse_option_entry)]
    pub pre_options: Vec<(String, OptionValue)>,
    /// Attribute for the decode op, as KEY=VALUE (repeatable)
    #[clap(long = "post-option", value_name = "KEY=VALUE", value_parser = parse_option_entry)]
    pub post_options: Vec<(String, OptionValue)>,
    /// Opset version of the default ONNX domain [default: 17]
    #[clap(long, value_parser)]
    pub opset: Option<i64>,
    /// JSON settings file; flags given on the command line take precedence
    #[clap(long, value_parser)]
    pub config: Option<PathBuf>,
}

/// Settings file contents. Every field is optional.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct SettingsFile {
    pub tokenizer_dir: Option<PathBuf>,
    pub variant: Option<TokenizerVariant>,
    pub output: Option<PathBuf>,
    pub decoder_output: Option<PathBuf>,
    pub target: Option<OutputTarget>,
    pub sample_text: Option<String>,
    #[serde(default)]
    pub pre_options: ProcessingOptions,
    #[serde(default)]
    pub post_options: ProcessingOptions,
    pub opset: Option<i64>,
}

impl SettingsFile {
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path.to_path_buf()));
        }

        let mut file = File::open(config_path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let settings: SettingsFile = serde_json::from_str(&contents)?;
        Ok(settings)
    }
}

/// Fully resolved export settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSettings {
    pub tokenizer_dir: PathBuf,
    pub variant: TokenizerVariant,
    pub output: PathBuf,
    pub decoder_output: PathBuf,
    pub target: OutputTarget,
    pub sample_text: String,
    pub pre_options: ProcessingOptions,
    pub post_options: ProcessingOptions,
    pub opset: i64,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            tokenizer_dir: PathBuf::from(DEFAULT_TOKENIZER_DIR),
            variant: TokenizerVariant::Clip,
            output: PathBuf::from(DEFAULT_OUTPUT),
            decoder_output: PathBuf::from(DEFAULT_DECODER_OUTPUT),
            target: OutputTarget::Encode,
            sample_text: DEFAULT_SAMPLE_TEXT.to_string(),
            pre_options: ProcessingOptions::new(),
            post_options: ProcessingOptions::new(),
            opset: DEFAULT_OPSET,
        }
    }
}

impl ExportSettings {
    /// Command line over settings file over defaults.
    pub fn resolve(args: CliArgs) -> Result<Self, ConfigError> {
        let file = match &args.config {
            Some(path) => SettingsFile::load(path)?,
            None => SettingsFile::default(),
        };
        let defaults = ExportSettings::default();

        // Options merge key by key so a flag can override one entry of the file's map.
        let mut pre_options = file.pre_options;
        for (key, value) in args.pre_options {
            pre_options.insert(key, value);
        }
        let mut post_options = file.post_options;
        for (key, value) in args.post_options {
            post_options.insert(key, value);
        }

        let settings = Self {
            tokenizer_dir: args.tokenizer_dir.or(file.tokenizer_dir).unwrap_or(defaults.tokenizer_dir),
            variant: args.variant.or(file.variant).unwrap_or(defaults.variant),
            output: args.output.or(file.output).unwrap_or(defaults.output),
            decoder_output: args.decoder_output.or(file.decoder_output).unwrap_or(defaults.decoder_output),
            target: args.target.or(file.target).unwrap_or(defaults.target),
            sample_text: args.sample_text.or(file.sample_text).unwrap_or(defaults.sample_text),
            pre_options,
            post_options,
            opset: args.opset.or(file.opset).unwrap_or(defaults.opset),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.opset < 1 {
            return Err(ConfigError::Invalid(format!("opset must be positive, got {}", self.opset)));
        }
        if self.target == OutputTarget::Both && self.output == self.decoder_output {
            return Err(ConfigError::Invalid(format!(
                "encode and decode graphs would both be written to {}",
                self.output.display()
            )));
        }
        Ok(())
    }
}
