//! Feature decomposition
//!
//! Turns a user-supplied feature into tasks plus a dependency-graphed
//! plan, via an LLM prompt whose user-controlled strings are sanitised
//! against prompt injection first.

mod decomposer;
mod sanitize;

pub use decomposer::{DecomposeRequest, DecomposedFeature, Decomposer};
pub use sanitize::sanitize_prompt_text;
