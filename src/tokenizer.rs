use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use tokenizers::decoders::byte_level::ByteLevel as ByteLevelDecoder;
use tokenizers::decoders::wordpiece::WordPiece as WordPieceDecoder;
use tokenizers::decoders::DecoderWrapper;
use tokenizers::models::bpe::BPE;
use tokenizers::models::wordpiece::WordPiece;
use tokenizers::models::ModelWrapper;
use tokenizers::normalizers::replace::ReplacePattern;
use tokenizers::normalizers::{BertNormalizer, Lowercase, NormalizerWrapper, Replace, Sequence as NormalizerSequence, NFC};
use tokenizers::pre_tokenizers::bert::BertPreTokenizer;
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::pre_tokenizers::sequence::Sequence as PreTokenizerSequence;
use tokenizers::pre_tokenizers::split::{Split, SplitPattern};
use tokenizers::pre_tokenizers::PreTokenizerWrapper;
use tokenizers::processors::bert::BertProcessing;
use tokenizers::processors::roberta::RobertaProcessing;
use tokenizers::processors::PostProcessorWrapper;
use tokenizers::{AddedToken, SplitDelimiterBehavior, Tokenizer, TokenizerBuilder};

const CLIP_WORD_PATTERN: &str = r"'s|'t|'re|'ve|'m|'ll|'d|[\p{L}]+|[\p{N}]|[^\s\p{L}\p{N}]+";
const CLIP_END_OF_WORD: &str = "</w>";
const WORDPIECE_PREFIX: &str = "##";

const SPECIAL_TOKENS_MAP_FILE: &str = "special_tokens_map.json";
const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

#[derive(Debug)]
pub enum TokenizerError {
    /// The directory, or a file the selected variant needs, does not exist.
    ConfigurationNotFound(PathBuf),
    InvalidConfiguration(String),
    IoError(io::Error),
    JsonError(serde_json::Error),
    EncodingError(String),
    DecodingError(String),
}

impl fmt::Display for TokenizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenizerError::ConfigurationNotFound(p) => {
                write!(f, "Tokenizer configuration not found: {}", p.display())
            }
            TokenizerError::InvalidConfiguration(s) => write!(f, "Invalid tokenizer configuration: {}", s),
            TokenizerError::IoError(e) => write!(f, "IO error: {}", e),
            TokenizerError::JsonError(e) => write!(f, "JSON error: {}", e),
            TokenizerError::EncodingError(s) => write!(f, "Encoding failed: {}", s),
            TokenizerError::DecodingError(s) => write!(f, "Decoding failed: {}", s),
        }
    }
}

impl std::error::Error for TokenizerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TokenizerError::IoError(e) => Some(e),
            TokenizerError::JsonError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TokenizerError {
    fn from(err: io::Error) -> TokenizerError {
        TokenizerError::IoError(err)
    }
}

impl From<serde_json::Error> for TokenizerError {
    fn from(err: serde_json::Error) -> TokenizerError {
        TokenizerError::JsonError(err)
    }
}

/// Which saved-tokenizer layout to read and which ONNX ops to export it as.
#[derive(clap::ValueEnum, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerVariant {
    Clip,
    Gpt2,
    Bert,
}

impl TokenizerVariant {
    pub fn required_files(&self) -> &'static [&'static str] {
        match self {
            TokenizerVariant::Clip | TokenizerVariant::Gpt2 => &["vocab.json", "merges.txt"],
            TokenizerVariant::Bert => &["vocab.txt"],
        }
    }

    /// Custom op that turns strings into ids.
    pub fn encode_op(&self) -> &'static str {
        match self {
            TokenizerVariant::Clip => "CLIPTokenizer",
            TokenizerVariant::Gpt2 => "GPT2Tokenizer",
            TokenizerVariant::Bert => "BertTokenizer",
        }
    }

    /// Custom op that turns ids back into a string.
    pub fn decode_op(&self) -> &'static str {
        match self {
            TokenizerVariant::Clip | TokenizerVariant::Gpt2 => "BpeDecoder",
            TokenizerVariant::Bert => "BertDecoder",
        }
    }

    /// `tokenizer_class` a saved tokenizer of this variant records, minus any `Fast` suffix.
    pub fn tokenizer_class(&self) -> &'static str {
        match self {
            TokenizerVariant::Clip => "CLIPTokenizer",
            TokenizerVariant::Gpt2 => "GPT2Tokenizer",
            TokenizerVariant::Bert => "BertTokenizer",
        }
    }

    pub fn is_bpe(&self) -> bool {
        !matches!(self, TokenizerVariant::Bert)
    }

    fn default_special_tokens(&self) -> SpecialTokens {
        let s = |v: &str| Some(v.to_string());
        match self {
            TokenizerVariant::Clip => SpecialTokens {
                bos_token: s("<|startoftext|>"),
                eos_token: s("<|endoftext|>"),
                unk_token: s("<|endoftext|>"),
                pad_token: s("<|endoftext|>"),
                ..Default::default()
            },
            TokenizerVariant::Gpt2 => SpecialTokens {
                bos_token: s("<|endoftext|>"),
                eos_token: s("<|endoftext|>"),
                unk_token: s("<|endoftext|>"),
                ..Default::default()
            },
            TokenizerVariant::Bert => SpecialTokens {
                unk_token: s("[UNK]"),
                sep_token: s("[SEP]"),
                pad_token: s("[PAD]"),
                cls_token: s("[CLS]"),
                mask_token: s("[MASK]"),
                ..Default::default()
            },
        }
    }
}

impl fmt::Display for TokenizerVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenizerVariant::Clip => "clip",
            TokenizerVariant::Gpt2 => "gpt2",
            TokenizerVariant::Bert => "bert",
        };
        f.write_str(name)
    }
}

// special_tokens_map.json stores either "<tok>" or {"content": "<tok>", ...}.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum TokenEntry {
    Plain(String),
    Detailed { content: String },
}

impl TokenEntry {
    fn into_content(self) -> String {
        match self {
            TokenEntry::Plain(s) => s,
            TokenEntry::Detailed { content } => content,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
struct SpecialTokensFile {
    bos_token: Option<TokenEntry>,
    eos_token: Option<TokenEntry>,
    unk_token: Option<TokenEntry>,
    sep_token: Option<TokenEntry>,
    pad_token: Option<TokenEntry>,
    cls_token: Option<TokenEntry>,
    mask_token: Option<TokenEntry>,
}

#[derive(Deserialize, Debug, Default)]
struct TokenizerConfigFile {
    #[serde(flatten)]
    special: SpecialTokensFile,
    tokenizer_class: Option<String>,
    do_lower_case: Option<bool>,
    strip_accents: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecialTokens {
    pub bos_token: Option<String>,
    pub eos_token: Option<String>,
    pub unk_token: Option<String>,
    pub sep_token: Option<String>,
    pub pad_token: Option<String>,
    pub cls_token: Option<String>,
    pub mask_token: Option<String>,
}

impl SpecialTokens {
    // Earlier sources win: the map file, then tokenizer_config.json, then defaults.
    fn layer(self, file: SpecialTokensFile) -> Self {
        let pick = |current: Option<String>, entry: Option<TokenEntry>| {
            current.or_else(|| entry.map(TokenEntry::into_content))
        };
        Self {
            bos_token: pick(self.bos_token, file.bos_token),
            eos_token: pick(self.eos_token, file.eos_token),
            unk_token: pick(self.unk_token, file.unk_token),
            sep_token: pick(self.sep_token, file.sep_token),
            pad_token: pick(self.pad_token, file.pad_token),
            cls_token: pick(self.cls_token, file.cls_token),
            mask_token: pick(self.mask_token, file.mask_token),
        }
    }

    fn or(self, fallback: SpecialTokens) -> Self {
        Self {
            bos_token: self.bos_token.or(fallback.bos_token),
            eos_token: self.eos_token.or(fallback.eos_token),
            unk_token: self.unk_token.or(fallback.unk_token),
            sep_token: self.sep_token.or(fallback.sep_token),
            pad_token: self.pad_token.or(fallback.pad_token),
            cls_token: self.cls_token.or(fallback.cls_token),
            mask_token: self.mask_token.or(fallback.mask_token),
        }
    }

    /// Distinct token strings, in field order.
    pub fn all(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for token in [
            &self.bos_token,
            &self.eos_token,
            &self.unk_token,
            &self.sep_token,
            &self.pad_token,
            &self.cls_token,
            &self.mask_token,
        ]
        .into_iter()
        .flatten()
        {
            if !seen.contains(&token.as_str()) {
                seen.push(token.as_str());
            }
        }
        seen
    }
}

/// Vocabulary and merge rules in the order an ONNX tokenizer op expects them.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelAssets {
    /// `(token, id)` sorted by id.
    pub vocab: Vec<(String, u32)>,
    /// `"left right"` merge rules sorted by rank. Empty for WordPiece.
    pub merges: Vec<String>,
}

// Merges are "a b" strings in older tokenizers releases and ["a", "b"] pairs in newer ones.
#[derive(Deserialize)]
#[serde(untagged)]
enum MergeEntry {
    Joined(String),
    Pair(String, String),
}

#[derive(Deserialize)]
struct SerializedModel {
    vocab: HashMap<String, u32>,
    #[serde(default)]
    merges: Vec<MergeEntry>,
}

/// A loaded tokenizer together with what the ONNX exporter needs to know about it.
#[derive(Debug)]
pub struct ExportTokenizer {
    tokenizer: Tokenizer,
    variant: TokenizerVariant,
    special_tokens: SpecialTokens,
    do_lower_case: bool,
    strip_accents: Option<bool>,
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TokenizerError> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

fn invalid(context: &str) -> impl Fn(Box<dyn std::error::Error + Send + Sync>) -> TokenizerError + '_ {
    move |e| TokenizerError::InvalidConfiguration(format!("{}: {}", context, e))
}

impl ExportTokenizer {
    /// Loads a saved tokenizer directory laid out for `variant`.
    pub fn from_dir(dir: &Path, variant: TokenizerVariant) -> Result<Self, TokenizerError> {
        if !dir.is_dir() {
            return Err(TokenizerError::ConfigurationNotFound(dir.to_path_buf()));
        }
        for name in variant.required_files() {
            let file = dir.join(name);
            if !file.is_file() {
                return Err(TokenizerError::ConfigurationNotFound(file));
            }
        }

        let map_path = dir.join(SPECIAL_TOKENS_MAP_FILE);
        let map_file: SpecialTokensFile = if map_path.is_file() {
            read_json(&map_path)?
        } else {
            SpecialTokensFile::default()
        };
        let config_path = dir.join(TOKENIZER_CONFIG_FILE);
        let config_file: TokenizerConfigFile = if config_path.is_file() {
            read_json(&config_path)?
        } else {
            TokenizerConfigFile::default()
        };
        if let Some(class) = &config_file.tokenizer_class {
            let class = class.strip_suffix("Fast").unwrap_or(class.as_str());
            if class != variant.tokenizer_class() {
                return Err(TokenizerError::InvalidConfiguration(format!(
                    "{} declares tokenizer_class '{}', which does not match variant {}",
                    config_path.display(),
                    class,
                    variant
                )));
            }
        }

        let do_lower_case = config_file.do_lower_case.unwrap_or(true);
        let strip_accents = config_file.strip_accents;
        let special_tokens = SpecialTokens::default()
            .layer(map_file)
            .layer(config_file.special)
            .or(variant.default_special_tokens());

        let tokenizer = match variant {
            TokenizerVariant::Clip => build_clip(dir, &special_tokens)?,
            TokenizerVariant::Gpt2 => build_gpt2(dir, &special_tokens)?,
            TokenizerVariant::Bert => build_bert(dir, &special_tokens, do_lower_case, strip_accents)?,
        };

        let mut loaded = Self { tokenizer, variant, special_tokens, do_lower_case, strip_accents };
        loaded.register_special_tokens()?;
        log::debug!(
            "Loaded {} tokenizer from {} ({} tokens)",
            variant,
            dir.display(),
            loaded.vocab_size()
        );
        Ok(loaded)
    }

    // Special tokens must already be in the vocabulary; they are only marked as special here.
    fn register_special_tokens(&mut self) -> Result<(), TokenizerError> {
        let mut added = Vec::new();
        for token in self.special_tokens.all() {
            if self.tokenizer.token_to_id(token).is_none() {
                return Err(TokenizerError::InvalidConfiguration(format!(
                    "special token '{}' is not in the vocabulary",
                    token
                )));
            }
            added.push(AddedToken::from(token.to_string(), true));
        }
        self.tokenizer.add_special_tokens(&added);
        Ok(())
    }

    pub fn variant(&self) -> TokenizerVariant {
        self.variant
    }

    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special_tokens
    }

    pub fn do_lower_case(&self) -> bool {
        self.do_lower_case
    }

    pub fn strip_accents(&self) -> Option<bool> {
        self.strip_accents
    }

    /// Encodes `text`, adding the variant's special tokens the same way a saved tokenizer does.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>, TokenizerError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| TokenizerError::EncodingError(format!("'{}': {}", text, e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, TokenizerError> {
        let text = self
            .tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| TokenizerError::DecodingError(format!("{:?}: {}", ids, e)))?;
        match self.variant {
            TokenizerVariant::Clip => Ok(text.replace(CLIP_END_OF_WORD, " ").trim_end().to_string()),
            _ => Ok(text),
        }
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    /// `(id, token)` for every special token, sorted by id.
    pub fn special_token_ids(&self) -> Vec<(u32, String)> {
        let mut ids: Vec<(u32, String)> = self
            .special_tokens
            .all()
            .into_iter()
            .filter_map(|t| self.token_to_id(t).map(|id| (id, t.to_string())))
            .collect();
        ids.sort();
        ids.dedup_by_key(|(id, _)| *id);
        ids
    }

    /// Vocabulary and merges read back from the model itself, so the export
    /// reflects exactly what was loaded.
    pub fn model_assets(&self) -> Result<ModelAssets, TokenizerError> {
        let value = serde_json::to_value(self.tokenizer.get_model())?;
        let model: SerializedModel = serde_json::from_value(value)?;

        let mut vocab: Vec<(String, u32)> = model.vocab.into_iter().collect();
        vocab.sort_by_key(|(_, id)| *id);
        let merges = model
            .merges
            .into_iter()
            .map(|m| match m {
                MergeEntry::Joined(s) => s,
                MergeEntry::Pair(a, b) => format!("{} {}", a, b),
            })
            .collect();
        Ok(ModelAssets { vocab, merges })
    }
}

fn file_str(dir: &Path, name: &str) -> Result<String, TokenizerError> {
    let path = dir.join(name);
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| TokenizerError::InvalidConfiguration(format!("non UTF-8 path: {:?}", path)))
}

type Builder = TokenizerBuilder<ModelWrapper, NormalizerWrapper, PreTokenizerWrapper, PostProcessorWrapper, DecoderWrapper>;

fn required_id(tokens: &HashMap<String, u32>, token: &Option<String>, role: &str) -> Result<(String, u32), TokenizerError> {
    let token = token
        .as_ref()
        .ok_or_else(|| TokenizerError::InvalidConfiguration(format!("no {} configured", role)))?;
    let id = tokens.get(token).ok_or_else(|| {
        TokenizerError::InvalidConfiguration(format!("{} '{}' is not in the vocabulary", role, token))
    })?;
    Ok((token.clone(), *id))
}

fn build_clip(dir: &Path, special: &SpecialTokens) -> Result<Tokenizer, TokenizerError> {
    let mut bpe = BPE::from_file(&file_str(dir, "vocab.json")?, &file_str(dir, "merges.txt")?)
        .continuing_subword_prefix(String::new())
        .end_of_word_suffix(CLIP_END_OF_WORD.to_string());
    if let Some(unk) = &special.unk_token {
        bpe = bpe.unk_token(unk.clone());
    }
    let bpe = bpe.build().map_err(invalid("BPE model"))?;
    let vocab = tokenizers::Model::get_vocab(&bpe);
    let bos = required_id(&vocab, &special.bos_token, "bos_token")?;
    let eos = required_id(&vocab, &special.eos_token, "eos_token")?;

    let normalizer = NormalizerSequence::new(vec![
        NFC.into(),
        Replace::new(ReplacePattern::Regex(r"\s+".to_string()), " ")
            .map_err(invalid("whitespace normalizer"))?
            .into(),
        Lowercase.into(),
    ]);
    let pre_tokenizer = PreTokenizerSequence::new(vec![
        Split::new(
            SplitPattern::Regex(CLIP_WORD_PATTERN.to_string()),
            SplitDelimiterBehavior::Removed,
            true,
        )
        .map_err(invalid("word splitter"))?
        .into(),
        ByteLevel::new(false, true, true).into(),
    ]);
    let post_processor = RobertaProcessing::new(eos, bos)
        .trim_offsets(false)
        .add_prefix_space(false);

    let tokenizer = Builder::new()
        .with_model(bpe.into())
        .with_normalizer(Some(normalizer.into()))
        .with_pre_tokenizer(Some(pre_tokenizer.into()))
        .with_post_processor(Some(post_processor.into()))
        .with_decoder(Some(ByteLevelDecoder::default().into()))
        .build()
        .map_err(invalid("CLIP tokenizer"))?;
    Ok(Tokenizer::from(tokenizer))
}

fn build_gpt2(dir: &Path, special: &SpecialTokens) -> Result<Tokenizer, TokenizerError> {
    let mut bpe = BPE::from_file(&file_str(dir, "vocab.json")?, &file_str(dir, "merges.txt")?);
    if let Some(unk) = &special.unk_token {
        bpe = bpe.unk_token(unk.clone());
    }
    let bpe = bpe.build().map_err(invalid("BPE model"))?;

    let tokenizer = Builder::new()
        .with_model(bpe.into())
        .with_normalizer(None)
        .with_pre_tokenizer(Some(ByteLevel::new(false, true, true).into()))
        .with_post_processor(None)
        .with_decoder(Some(ByteLevelDecoder::default().into()))
        .build()
        .map_err(invalid("GPT-2 tokenizer"))?;
    Ok(Tokenizer::from(tokenizer))
}

fn build_bert(
    dir: &Path,
    special: &SpecialTokens,
    do_lower_case: bool,
    strip_accents: Option<bool>,
) -> Result<Tokenizer, TokenizerError> {
    let mut wordpiece = WordPiece::from_file(&file_str(dir, "vocab.txt")?)
        .continuing_subword_prefix(WORDPIECE_PREFIX.to_string());
    if let Some(unk) = &special.unk_token {
        wordpiece = wordpiece.unk_token(unk.clone());
    }
    let wordpiece = wordpiece.build().map_err(invalid("WordPiece model"))?;
    let vocab = tokenizers::Model::get_vocab(&wordpiece);
    let sep = required_id(&vocab, &special.sep_token, "sep_token")?;
    let cls = required_id(&vocab, &special.cls_token, "cls_token")?;

    let tokenizer = Builder::new()
        .with_model(wordpiece.into())
        .with_normalizer(Some(BertNormalizer::new(true, true, strip_accents, do_lower_case).into()))
        .with_pre_tokenizer(Some(BertPreTokenizer.into()))
        .with_post_processor(Some(BertProcessing::new(sep, cls).into()))
        .with_decoder(Some(WordPieceDecoder::default().into()))
        .build()
        .map_err(invalid("BERT tokenizer"))?;
    Ok(Tokenizer::from(tokenizer))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
    }

    #[test]
    fn test_load_fails_for_nonexistent_dir() {
        let result = ExportTokenizer::from_dir(Path::new("no_such_tokenizer_dir"), TokenizerVariant::Clip);
        match result {
            Err(TokenizerError::ConfigurationNotFound(p)) => assert_eq!(p, PathBuf::from("no_such_tokenizer_dir")),
            other => panic!("Expected ConfigurationNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_mismatched_variant_is_a_load_failure() {
        // A CLIP directory has vocab.json/merges.txt but no vocab.txt.
        let result = ExportTokenizer::from_dir(&fixture("clip"), TokenizerVariant::Bert);
        match result {
            Err(TokenizerError::ConfigurationNotFound(p)) => assert!(p.ends_with("vocab.txt")),
            other => panic!("Expected ConfigurationNotFound for vocab.txt, got {:?}", other),
        }

        let result = ExportTokenizer::from_dir(&fixture("bert"), TokenizerVariant::Clip);
        assert!(matches!(result, Err(TokenizerError::ConfigurationNotFound(_))));
    }

    #[test]
    fn test_declared_tokenizer_class_must_match_variant() {
        // CLIP and GPT-2 share a file layout; tokenizer_config.json tells them apart.
        let result = ExportTokenizer::from_dir(&fixture("clip"), TokenizerVariant::Gpt2);
        match result {
            Err(TokenizerError::InvalidConfiguration(msg)) => {
                assert!(msg.contains("CLIPTokenizer"), "{}", msg);
                assert!(msg.contains("gpt2"), "{}", msg);
            }
            other => panic!("Expected InvalidConfiguration, got {:?}", other),
        }
    }

    #[test]
    fn test_fast_tokenizer_class_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["vocab.json", "merges.txt"] {
            std::fs::copy(fixture("gpt2").join(name), dir.path().join(name)).unwrap();
        }
        std::fs::write(
            dir.path().join(TOKENIZER_CONFIG_FILE),
            r#"{"tokenizer_class": "GPT2TokenizerFast"}"#,
        )
        .unwrap();

        let tokenizer = ExportTokenizer::from_dir(dir.path(), TokenizerVariant::Gpt2).unwrap();
        assert_eq!(tokenizer.encode("hello world").unwrap(), vec![11, 16]);
    }

    #[test]
    fn test_clip_sample_encode() {
        let tokenizer = ExportTokenizer::from_dir(&fixture("clip"), TokenizerVariant::Clip)
            .expect("Failed to load CLIP fixture");
        // <|startoftext|> a</w> photo</w> of</w> a</w> cat</w> <|endoftext|>
        let ids = tokenizer.encode("A photo of a cat").unwrap();
        assert_eq!(ids, vec![18, 7, 14, 15, 7, 17, 19]);

        let again = tokenizer.encode("A photo of a cat").unwrap();
        assert_eq!(ids, again, "Encoding must be deterministic");
    }

    #[test]
    fn test_clip_normalizes_case_and_whitespace() {
        let tokenizer = ExportTokenizer::from_dir(&fixture("clip"), TokenizerVariant::Clip).unwrap();
        let ids = tokenizer.encode("  A   PHOTO\tof a cat ").unwrap();
        assert_eq!(ids, vec![18, 7, 14, 15, 7, 17, 19]);
    }

    #[test]
    fn test_clip_decode() {
        let tokenizer = ExportTokenizer::from_dir(&fixture("clip"), TokenizerVariant::Clip).unwrap();
        let text = tokenizer.decode(&[18, 7, 14, 15, 7, 17, 19], true).unwrap();
        assert_eq!(text, "a photo of a cat");
    }

    #[test]
    fn test_clip_special_tokens_from_map_file() {
        let tokenizer = ExportTokenizer::from_dir(&fixture("clip"), TokenizerVariant::Clip).unwrap();
        let special = tokenizer.special_tokens();
        assert_eq!(special.bos_token.as_deref(), Some("<|startoftext|>"));
        assert_eq!(special.eos_token.as_deref(), Some("<|endoftext|>"));
        assert_eq!(special.pad_token.as_deref(), Some("<|endoftext|>"));
        assert_eq!(
            tokenizer.special_token_ids(),
            vec![(18, "<|startoftext|>".to_string()), (19, "<|endoftext|>".to_string())]
        );
    }

    #[test]
    fn test_clip_model_assets_are_ordered() {
        let tokenizer = ExportTokenizer::from_dir(&fixture("clip"), TokenizerVariant::Clip).unwrap();
        let assets = tokenizer.model_assets().unwrap();
        assert_eq!(assets.vocab.len(), 20);
        let ids: Vec<u32> = assets.vocab.iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, (0..20).collect::<Vec<u32>>());
        assert_eq!(assets.vocab[14], ("photo</w>".to_string(), 14));
        assert_eq!(assets.merges.first().map(String::as_str), Some("p h"));
        assert_eq!(assets.merges.last().map(String::as_str), Some("ca t</w>"));
        assert_eq!(assets.merges.len(), 7);
    }

    #[test]
    fn test_gpt2_encode_without_special_tokens() {
        let tokenizer = ExportTokenizer::from_dir(&fixture("gpt2"), TokenizerVariant::Gpt2)
            .expect("Failed to load GPT-2 fixture");
        assert_eq!(tokenizer.encode("hello world").unwrap(), vec![11, 16]);
        assert_eq!(tokenizer.decode(&[11, 16], true).unwrap(), "hello world");
    }

    #[test]
    fn test_bert_encode_and_config() {
        let tokenizer = ExportTokenizer::from_dir(&fixture("bert"), TokenizerVariant::Bert)
            .expect("Failed to load BERT fixture");
        assert!(tokenizer.do_lower_case());
        assert_eq!(tokenizer.strip_accents(), Some(false));
        // [CLS] hello world ##s [SEP]
        assert_eq!(tokenizer.encode("Hello worlds").unwrap(), vec![2, 5, 6, 7, 3]);
        assert_eq!(tokenizer.decode(&[2, 5, 6, 7, 3], true).unwrap(), "hello worlds");
        assert!(tokenizer.model_assets().unwrap().merges.is_empty());
    }

    #[test]
    fn test_special_token_missing_from_vocab_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["vocab.json", "merges.txt"] {
            std::fs::copy(fixture("gpt2").join(name), dir.path().join(name)).unwrap();
        }
        std::fs::write(
            dir.path().join(SPECIAL_TOKENS_MAP_FILE),
            r#"{"eos_token": {"content": "</s>", "lstrip": false}}"#,
        )
        .unwrap();

        let result = ExportTokenizer::from_dir(dir.path(), TokenizerVariant::Gpt2);
        match result {
            Err(TokenizerError::InvalidConfiguration(msg)) => assert!(msg.contains("</s>"), "{}", msg),
            other => panic!("Expected InvalidConfiguration, got {:?}", other),
        }
    }

    #[test]
    fn test_special_tokens_all_is_distinct() {
        let tokens = TokenizerVariant::Clip.default_special_tokens();
        assert_eq!(tokens.all(), vec!["<|startoftext|>", "<|endoftext|>"]);
    }
}
