//! Error surface of the kernel.
//!
//! Conformance failure is *not* an error: it is the `INVALID` sentinel and a
//! problem list, and callers branch on it. `SpecError` covers the two raised
//! kinds — programmer errors at spec-building time and generation errors —
//! plus assertion failures, which carry the full explanation.

use crate::explain::{format_path, Explanation, PathSeg};
use crate::value::Keyword;

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    /// A spec was constructed from an unusable part.
    #[error("invalid spec form: {0}")]
    InvalidSpec(String),

    /// Registration requires a qualified name.
    #[error("cannot register spec under unqualified name `{0}`")]
    UnqualifiedName(Keyword),

    /// A qualified name did not resolve to a spec in the registry.
    #[error("unable to resolve spec name `{0}`")]
    Unresolved(Keyword),

    /// No generator could be constructed and no override was supplied.
    #[error("unable to construct generator at {} for {spec}", format_path(.path))]
    NoGen { path: Vec<PathSeg>, spec: String },

    /// `assert` with checking enabled saw a non-conforming value.
    #[error("spec assertion failed:\n{}", .explanation.render())]
    AssertionFailed { explanation: Box<Explanation> },
}
