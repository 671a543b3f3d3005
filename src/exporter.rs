// src/exporter.rs

use clap::Parser;
use prost::Message;
use std::error::Error;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::config::{self, CliArgs, ExportSettings};
use crate::graph::{self, ProcessingModels};
use crate::onnx::ModelProto;
use crate::tokenizer::{self, ExportTokenizer};

// Wraps every failure the export can hit.
#[derive(Debug)]
pub enum ExportError {
    Config(config::ConfigError),
    Tokenizer(tokenizer::TokenizerError),
    Graph(graph::GraphError),
    Io(io::Error),
}

impl std::fmt::Display for ExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportError::Config(e) => write!(f, "Config error: {}", e),
            ExportError::Tokenizer(e) => write!(f, "Tokenizer error: {}", e),
            ExportError::Graph(e) => write!(f, "Graph error: {}", e),
            ExportError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl Error for ExportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ExportError::Config(e) => Some(e),
            ExportError::Tokenizer(e) => Some(e),
            ExportError::Graph(e) => Some(e),
            ExportError::Io(e) => Some(e),
        }
    }
}

impl From<config::ConfigError> for ExportError {
    fn from(err: config::ConfigError) -> Self { ExportError::Config(err) }
}
impl From<tokenizer::TokenizerError> for ExportError {
    fn from(err: tokenizer::TokenizerError) -> Self { ExportError::Tokenizer(err) }
}
impl From<graph::GraphError> for ExportError {
    fn from(err: graph::GraphError) -> Self { ExportError::Graph(err) }
}
impl From<io::Error> for ExportError {
    fn from(err: io::Error) -> Self { ExportError::Io(err) }
}

/// Step 1: load the tokenizer the settings point at.
pub fn load(settings: &ExportSettings) -> Result<ExportTokenizer, ExportError> {
    log::info!(
        "Loading {} tokenizer from: {}",
        settings.variant,
        settings.tokenizer_dir.display()
    );
    let tokenizer = ExportTokenizer::from_dir(&settings.tokenizer_dir, settings.variant)?;
    log::info!("Tokenizer loaded ({} tokens).", tokenizer.vocab_size());
    Ok(tokenizer)
}

/// Step 2: diagnostic encode. A failure is reported but never stops the export.
pub fn sample_encode(tokenizer: &ExportTokenizer, text: &str) -> Option<Vec<u32>> {
    match tokenizer.encode(text) {
        Ok(ids) => Some(ids),
        Err(e) => {
            log::warn!("Sample encode of {:?} failed: {}", text, e);
            None
        }
    }
}

/// Step 3: generate the encode and decode processing graphs.
pub fn export(tokenizer: &ExportTokenizer, settings: &ExportSettings) -> Result<ProcessingModels, ExportError> {
    log::info!(
        "Generating processing graphs (opset {}, {} pre-options, {} post-options)",
        settings.opset,
        settings.pre_options.len(),
        settings.post_options.len()
    );
    let models = graph::generate_processing_models(
        tokenizer,
        &settings.pre_options,
        &settings.post_options,
        settings.opset,
    )?;
    Ok(models)
}

/// Step 4: write `model` to `path`, replacing whatever is there.
///
/// The bytes go to a temporary file next to `path` which is renamed over it
/// once fully written, so a failed write never leaves a truncated graph.
/// A replaced file keeps its permissions; a new one gets the usual
/// `0o666` minus umask. Returns the number of bytes written.
pub fn persist(model: &ModelProto, path: &Path) -> Result<usize, ExportError> {
    let bytes = model.encode_to_vec();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut builder = tempfile::Builder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(fs::Permissions::from_mode(0o666));
    }
    let mut staged = builder.tempfile_in(dir)?;
    staged.write_all(&bytes)?;
    if let Ok(existing) = fs::metadata(path) {
        staged.as_file().set_permissions(existing.permissions())?;
    }
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|e| ExportError::Io(e.error))?;

    log::info!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(bytes.len())
}

/// Runs all four steps, writing the sample ids to `out` and a confirmation
/// line as soon as each file is in place. Returns the paths written.
pub fn run<W: Write>(settings: &ExportSettings, out: &mut W) -> Result<Vec<PathBuf>, ExportError> {
    let tokenizer = load(settings)?;

    if let Some(ids) = sample_encode(&tokenizer, &settings.sample_text) {
        writeln!(out, "{:?}", ids)?;
    }

    let models = export(&tokenizer, settings)?;

    let mut selected = Vec::new();
    if settings.target.includes_encode() {
        selected.push((&models.encode, &settings.output));
    }
    if settings.target.includes_decode() {
        selected.push((&models.decode, &settings.decoder_output));
    }

    let mut written = Vec::new();
    for (model, path) in selected {
        persist(model, path)?;
        writeln!(out, "Created '{}'.", path.display())?;
        written.push(path.clone());
    }
    Ok(written)
}

pub fn run_cli() -> Result<(), Box<dyn Error>> {
    let args = CliArgs::parse();
    let settings = ExportSettings::resolve(args).map_err(ExportError::from)?;
    log::debug!("Export settings: {:?}", settings);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    run(&settings, &mut out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputTarget;
    use crate::tokenizer::{TokenizerError, TokenizerVariant};
    use std::fs;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
    }

    fn settings_in(dir: &Path) -> ExportSettings {
        ExportSettings {
            tokenizer_dir: fixture("clip"),
            output: dir.join("tokenizer.onnx"),
            decoder_output: dir.join("detokenizer.onnx"),
            ..Default::default()
        }
    }

    #[test]
    fn test_run_writes_encode_graph_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        let mut out = Vec::new();

        let written = run(&settings, &mut out).expect("export should succeed");
        assert_eq!(written, vec![settings.output.clone()]);
        assert!(!settings.decoder_output.exists(), "decode graph is not written by default");

        let bytes = fs::read(&settings.output).unwrap();
        assert!(!bytes.is_empty());
        let model = ModelProto::decode(bytes.as_slice()).unwrap();
        assert_eq!(model.main_node().and_then(|n| n.op_type.as_deref()), Some("CLIPTokenizer"));

        let stdout = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = stdout.lines().collect();
        assert_eq!(lines[0], "[18, 7, 14, 15, 7, 17, 19]");
        assert_eq!(lines[1], format!("Created '{}'.", settings.output.display()));
    }

    #[test]
    fn test_rerun_overwrites_with_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        fs::write(&settings.output, b"stale contents").unwrap();

        run(&settings, &mut Vec::new()).unwrap();
        let first = fs::read(&settings.output).unwrap();
        assert_ne!(first, b"stale contents".to_vec());

        run(&settings, &mut Vec::new()).unwrap();
        let second = fs::read(&settings.output).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_config_fails_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ExportSettings {
            tokenizer_dir: dir.path().join("does_not_exist"),
            ..settings_in(dir.path())
        };
        let mut out = Vec::new();

        let result = run(&settings, &mut out);
        assert!(matches!(
            result,
            Err(ExportError::Tokenizer(TokenizerError::ConfigurationNotFound(_)))
        ));
        assert!(!settings.output.exists());
        assert!(out.is_empty(), "nothing should be printed on failure");
    }

    #[test]
    fn test_mismatched_variant_fails_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ExportSettings { variant: TokenizerVariant::Bert, ..settings_in(dir.path()) };

        let result = run(&settings, &mut Vec::new());
        assert!(matches!(result, Err(ExportError::Tokenizer(_))));
        assert!(!settings.output.exists());
    }

    #[test]
    fn test_both_targets_write_two_graphs() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ExportSettings { target: OutputTarget::Both, ..settings_in(dir.path()) };

        let written = run(&settings, &mut Vec::new()).unwrap();
        assert_eq!(written.len(), 2);
        let decode = ModelProto::decode(fs::read(&settings.decoder_output).unwrap().as_slice()).unwrap();
        assert_eq!(decode.main_node().and_then(|n| n.op_type.as_deref()), Some("BpeDecoder"));
    }

    #[test]
    fn test_decode_target_only() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ExportSettings { target: OutputTarget::Decode, ..settings_in(dir.path()) };

        let written = run(&settings, &mut Vec::new()).unwrap();
        assert_eq!(written, vec![settings.decoder_output.clone()]);
        assert!(!settings.output.exists());
    }

    #[test]
    fn test_persist_into_missing_directory_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let tokenizer = ExportTokenizer::from_dir(&fixture("clip"), TokenizerVariant::Clip).unwrap();
        let models = export(&tokenizer, &settings_in(dir.path())).unwrap();

        let target = dir.path().join("missing").join("tokenizer.onnx");
        assert!(matches!(persist(&models.encode, &target), Err(ExportError::Io(_))));
        assert!(!target.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0, "no stray temporary files");
    }

    #[test]
    fn test_written_file_is_reported_when_a_later_write_fails() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ExportSettings {
            target: OutputTarget::Both,
            decoder_output: dir.path().join("missing").join("detokenizer.onnx"),
            ..settings_in(dir.path())
        };
        let mut out = Vec::new();

        let result = run(&settings, &mut out);
        assert!(matches!(result, Err(ExportError::Io(_))));
        assert!(settings.output.exists());
        let stdout = String::from_utf8(out).unwrap();
        assert!(
            stdout.contains(&format!("Created '{}'.", settings.output.display())),
            "encode graph was written and must be reported: {}",
            stdout
        );
        assert!(!stdout.contains("detokenizer.onnx"));
    }

    #[cfg(unix)]
    #[test]
    fn test_overwrite_keeps_existing_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        fs::write(&settings.output, b"old").unwrap();
        fs::set_permissions(&settings.output, fs::Permissions::from_mode(0o640)).unwrap();

        run(&settings, &mut Vec::new()).unwrap();
        let mode = fs::metadata(&settings.output).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    #[cfg(unix)]
    #[test]
    fn test_new_output_gets_default_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        // A plain create gets 0o666 minus the process umask.
        let reference = dir.path().join("reference");
        fs::File::create(&reference).unwrap();
        let expected = fs::metadata(&reference).unwrap().permissions().mode() & 0o777;

        run(&settings, &mut Vec::new()).unwrap();
        let mode = fs::metadata(&settings.output).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, expected);
    }

    #[test]
    fn test_sample_encode_returns_ids() {
        let tokenizer = ExportTokenizer::from_dir(&fixture("gpt2"), TokenizerVariant::Gpt2).unwrap();
        assert_eq!(sample_encode(&tokenizer, "hello world"), Some(vec![11, 16]));
    }
}
