// src/graph.rs
//
// Turns a loaded tokenizer into two single-operator ONNX models: an encode
// graph (strings -> ids) and a decode graph (ids -> string).

use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::onnx::tensor_proto::DataType;
use crate::onnx::{
    AttributeProto, Dim, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, StringStringEntryProto,
    ValueInfoProto, CONTRIB_DOMAIN,
};
use crate::tokenizer::{ExportTokenizer, ModelAssets, TokenizerError, TokenizerVariant};

pub const IR_VERSION: i64 = 8;
pub const DEFAULT_OPSET: i64 = 17;
pub const CONTRIB_OPSET: i64 = 1;

#[derive(Debug)]
pub enum GraphError {
    /// The tokenizer model lacks something the op needs (e.g. merge rules).
    MissingAsset(String),
    Tokenizer(TokenizerError),
    JsonError(serde_json::Error),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::MissingAsset(s) => write!(f, "Tokenizer asset missing for graph generation: {}", s),
            GraphError::Tokenizer(e) => write!(f, "Tokenizer error: {}", e),
            GraphError::JsonError(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for GraphError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GraphError::MissingAsset(_) => None,
            GraphError::Tokenizer(e) => Some(e),
            GraphError::JsonError(e) => Some(e),
        }
    }
}

impl From<TokenizerError> for GraphError {
    fn from(err: TokenizerError) -> GraphError {
        GraphError::Tokenizer(err)
    }
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> GraphError {
        GraphError::JsonError(err)
    }
}

/// Scalar value of a processing option; becomes an operator attribute.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f32),
    Text(String),
}

impl OptionValue {
    fn to_attribute(&self, name: &str) -> AttributeProto {
        match self {
            OptionValue::Bool(b) => AttributeProto::int(name, i64::from(*b)),
            OptionValue::Int(i) => AttributeProto::int(name, *i),
            OptionValue::Float(v) => AttributeProto::float(name, *v),
            OptionValue::Text(s) => AttributeProto::string(name, s),
        }
    }
}

impl FromStr for OptionValue {
    type Err = std::convert::Infallible;

    // A double-quoted value is always text, so `"42"` stays a string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(quoted) = s.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')) {
            return Ok(OptionValue::Text(quoted.to_string()));
        }
        if let Ok(b) = s.parse::<bool>() {
            return Ok(OptionValue::Bool(b));
        }
        if let Ok(i) = s.parse::<i64>() {
            return Ok(OptionValue::Int(i));
        }
        match s.parse::<f32>() {
            Ok(v) if v.is_finite() => Ok(OptionValue::Float(v)),
            _ => Ok(OptionValue::Text(s.to_string())),
        }
    }
}

/// Attribute overrides for a processing op, keyed by attribute name.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct ProcessingOptions(BTreeMap<String, OptionValue>);

impl ProcessingOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: OptionValue) {
        self.0.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.0.get(key)
    }

    /// Replaces same-named attributes in place and appends the rest in key order.
    fn apply(&self, attributes: &mut Vec<AttributeProto>) {
        for (name, value) in &self.0 {
            let attribute = value.to_attribute(name);
            match attributes.iter_mut().find(|a| a.name() == name) {
                Some(existing) => *existing = attribute,
                None => attributes.push(attribute),
            }
        }
    }
}

impl FromIterator<(String, OptionValue)> for ProcessingOptions {
    fn from_iter<I: IntoIterator<Item = (String, OptionValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Parses a `KEY=VALUE` option.
pub fn parse_option_entry(entry: &str) -> Result<(String, OptionValue), String> {
    let (key, value) = entry
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", entry))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty option name in '{}'", entry));
    }
    let value = match value.parse::<OptionValue>() {
        Ok(v) => v,
        Err(never) => match never {},
    };
    Ok((key.to_string(), value))
}

/// The encode graph and the matching decode graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingModels {
    pub encode: ModelProto,
    pub decode: ModelProto,
}

// Serializes `(token, id)` pairs as a JSON object keeping id order.
struct OrderedVocab<'a>(&'a [(String, u32)]);

impl Serialize for OrderedVocab<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(token, id)| (token, id)))
    }
}

/// GPT-2's reversible byte <-> printable character table, in table order.
pub fn bytes_to_unicode() -> Vec<(u8, char)> {
    let mut bytes: Vec<u32> = (u32::from(b'!')..=u32::from(b'~'))
        .chain(0xA1..=0xAC)
        .chain(0xAE..=0xFF)
        .collect();
    let mut chars = bytes.clone();
    let mut shifted = 0;
    for b in 0..=255u32 {
        if !bytes.contains(&b) {
            bytes.push(b);
            chars.push(256 + shifted);
            shifted += 1;
        }
    }
    bytes
        .into_iter()
        .zip(chars)
        .filter_map(|(b, c)| char::from_u32(c).map(|c| (b as u8, c)))
        .collect()
}

fn byte_decoder_table() -> String {
    bytes_to_unicode()
        .into_iter()
        .map(|(b, c)| format!("{}\t{}", u32::from(c), b))
        .collect::<Vec<_>>()
        .join("\n")
}

// One token per line; the line number is the token id, so ids must run 0..n.
fn joined_tokens(assets: &ModelAssets) -> Result<String, GraphError> {
    for (line, (token, id)) in assets.vocab.iter().enumerate() {
        if *id as usize != line {
            return Err(GraphError::MissingAsset(format!(
                "vocabulary ids are not contiguous: '{}' has id {}, expected {}",
                token, id, line
            )));
        }
    }
    Ok(assets
        .vocab
        .iter()
        .map(|(token, _)| token.as_str())
        .collect::<Vec<_>>()
        .join("\n"))
}

fn encode_attributes(tokenizer: &ExportTokenizer, assets: &ModelAssets) -> Result<Vec<AttributeProto>, GraphError> {
    if assets.vocab.is_empty() {
        return Err(GraphError::MissingAsset("vocabulary is empty".to_string()));
    }
    let mut attributes = Vec::new();
    if tokenizer.variant().is_bpe() {
        if assets.merges.is_empty() {
            return Err(GraphError::MissingAsset(format!(
                "{} needs BPE merge rules",
                tokenizer.variant().encode_op()
            )));
        }
        let vocab = serde_json::to_string(&OrderedVocab(&assets.vocab))?;
        attributes.push(AttributeProto::string("vocab", &vocab));
        attributes.push(AttributeProto::string("merges", &assets.merges.join("\n")));
    } else {
        attributes.push(AttributeProto::string("vocab_file", &joined_tokens(assets)?));
        attributes.push(AttributeProto::int("do_lower_case", i64::from(tokenizer.do_lower_case())));
        if let Some(strip) = tokenizer.strip_accents() {
            attributes.push(AttributeProto::int("strip_accents", i64::from(strip)));
        }
    }
    Ok(attributes)
}

fn decode_attributes(tokenizer: &ExportTokenizer, assets: &ModelAssets) -> Result<Vec<AttributeProto>, GraphError> {
    let special = tokenizer.special_tokens();
    let special_ids = tokenizer.special_token_ids();
    let mut attributes = Vec::new();

    match tokenizer.variant() {
        TokenizerVariant::Clip | TokenizerVariant::Gpt2 => {
            attributes.push(AttributeProto::string("id_vocab", &joined_tokens(assets)?));
            attributes.push(AttributeProto::string("byte_decoder", &byte_decoder_table()));
            let added = special_ids
                .iter()
                .map(|(id, token)| format!("{}\t{}", id, token))
                .collect::<Vec<_>>()
                .join("\n");
            attributes.push(AttributeProto::string("added_tokens", &added));
            let ids = special_ids
                .iter()
                .map(|(id, _)| id.to_string())
                .collect::<Vec<_>>()
                .join("\n");
            attributes.push(AttributeProto::string("all_special_ids", &ids));
            attributes.push(AttributeProto::int("skip_special_tokens", 0));
            for (name, token) in [
                ("bos_token", &special.bos_token),
                ("eos_token", &special.eos_token),
                ("unk_token", &special.unk_token),
            ] {
                if let Some(token) = token {
                    attributes.push(AttributeProto::string(name, token));
                }
            }
            if tokenizer.variant() == TokenizerVariant::Clip {
                attributes.push(AttributeProto::int("whitespace_token", 1));
            }
        }
        TokenizerVariant::Bert => {
            attributes.push(AttributeProto::string("vocab_file", &joined_tokens(assets)?));
            for (name, token) in [
                ("unk_token", &special.unk_token),
                ("sep_token", &special.sep_token),
                ("pad_token", &special.pad_token),
                ("cls_token", &special.cls_token),
                ("mask_token", &special.mask_token),
            ] {
                if let Some(token) = token {
                    attributes.push(AttributeProto::string(name, token));
                }
            }
            attributes.push(AttributeProto::string("suffix_indicator", "##"));
        }
    }
    Ok(attributes)
}

fn encode_io(variant: TokenizerVariant) -> (Vec<ValueInfoProto>, Vec<ValueInfoProto>) {
    let inputs = vec![ValueInfoProto::tensor("input_text", DataType::String, &[Dim::Symbolic("batch")])];
    let outputs = if variant.is_bpe() {
        let ids = [Dim::Symbolic("batch"), Dim::Symbolic("sequence")];
        vec![
            ValueInfoProto::tensor("input_ids", DataType::Int64, &ids),
            ValueInfoProto::tensor("attention_mask", DataType::Int64, &ids),
            ValueInfoProto::tensor(
                "offset_mapping",
                DataType::Int64,
                &[Dim::Symbolic("batch"), Dim::Symbolic("sequence"), Dim::Fixed(2)],
            ),
        ]
    } else {
        let ids = [Dim::Symbolic("sequence")];
        vec![
            ValueInfoProto::tensor("input_ids", DataType::Int64, &ids),
            ValueInfoProto::tensor("token_type_ids", DataType::Int64, &ids),
            ValueInfoProto::tensor("attention_mask", DataType::Int64, &ids),
        ]
    };
    (inputs, outputs)
}

fn decode_io() -> (Vec<ValueInfoProto>, Vec<ValueInfoProto>) {
    (
        vec![ValueInfoProto::tensor("ids", DataType::Int64, &[Dim::Symbolic("sequence")])],
        vec![ValueInfoProto::tensor("str", DataType::String, &[Dim::Fixed(1)])],
    )
}

fn single_op_model(
    variant: TokenizerVariant,
    op_type: &str,
    attribute: Vec<AttributeProto>,
    (input, output): (Vec<ValueInfoProto>, Vec<ValueInfoProto>),
    opset: i64,
) -> ModelProto {
    let node = NodeProto {
        input: input.iter().filter_map(|v| v.name.clone()).collect(),
        output: output.iter().filter_map(|v| v.name.clone()).collect(),
        name: Some(format!("{}_node", op_type)),
        op_type: Some(op_type.to_string()),
        domain: Some(CONTRIB_DOMAIN.to_string()),
        attribute,
        doc_string: None,
    };
    let graph = GraphProto {
        node: vec![node],
        name: Some(format!("{}_graph", op_type)),
        doc_string: None,
        input,
        output,
    };

    ModelProto {
        ir_version: Some(IR_VERSION),
        opset_import: vec![
            OperatorSetIdProto { domain: Some(String::new()), version: Some(opset) },
            OperatorSetIdProto { domain: Some(CONTRIB_DOMAIN.to_string()), version: Some(CONTRIB_OPSET) },
        ],
        producer_name: Some(env!("CARGO_PKG_NAME").to_string()),
        producer_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        domain: None,
        model_version: None,
        doc_string: None,
        graph: Some(graph),
        metadata_props: vec![StringStringEntryProto {
            key: Some("tokenizer_variant".to_string()),
            value: Some(variant.to_string()),
        }],
    }
}

/// Builds the encode and decode processing graphs for `tokenizer`.
///
/// `pre_options` are applied to the encode op's attributes and `post_options`
/// to the decode op's; a same-named option replaces the generated attribute.
pub fn generate_processing_models(
    tokenizer: &ExportTokenizer,
    pre_options: &ProcessingOptions,
    post_options: &ProcessingOptions,
    opset: i64,
) -> Result<ProcessingModels, GraphError> {
    let variant = tokenizer.variant();
    let assets = tokenizer.model_assets()?;
    log::debug!(
        "Generating {} graphs from {} vocabulary entries and {} merges",
        variant,
        assets.vocab.len(),
        assets.merges.len()
    );

    let mut encode_attrs = encode_attributes(tokenizer, &assets)?;
    pre_options.apply(&mut encode_attrs);
    let mut decode_attrs = decode_attributes(tokenizer, &assets)?;
    post_options.apply(&mut decode_attrs);

    Ok(ProcessingModels {
        encode: single_op_model(variant, variant.encode_op(), encode_attrs, encode_io(variant), opset),
        decode: single_op_model(variant, variant.decode_op(), decode_attrs, decode_io(), opset),
    })
}
