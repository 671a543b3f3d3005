// src/lib.rs
pub mod config;
pub mod exporter;
pub mod graph;
pub mod onnx;
pub mod tokenizer;
