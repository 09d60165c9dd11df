//! # Conformal Kernel
//!
//! A data-shape specification and validation engine. Callers describe the
//! expected structure of values with composable *specs* — scalars,
//! composite records, grammatical sequences, functions — then ask any spec
//! to decide conformance, destructure into a conformed representation,
//! explain failures with precise paths, or generate conforming values for
//! property-based testing.
//!
//! ## Architecture
//!
//! ```text
//! registry            <- process-wide name -> spec map, aliases, reset
//!     |
//! spec                <- shared contract: conform / unform / explain / gen
//!     |
//! pred  every  keys   <- scalar, collection, and map constraints
//!     |
//! regex               <- Brzozowski-derivative sequence grammars
//!     |
//! fspec               <- generative function checking
//!     |
//! gen + conformal-rand<- deterministic generator composition
//! ```
//!
//! Conformance failure is a sentinel value (`Value::invalid()`), never an
//! error; `SpecError` covers spec-building mistakes, unresolvable names,
//! and generation faults. Everything is deterministic given a seed.

pub mod config;
pub mod error;
pub mod every;
pub mod explain;
pub mod fspec;
pub mod gen;
pub mod keys;
pub mod pred;
pub mod regex;
pub mod registry;
pub mod spec;
pub mod value;

pub use conformal_rand::{Rand, SeededRand};

pub use error::SpecError;
pub use every::{coll_of, every, hash_of, map_of, EveryOpts, EverySpec, IntoKind};
pub use explain::{format_path, Explanation, PathSeg, Problem};
pub use fspec::{exercise_fspec, fspec, FSpec};
pub use gen::{exercise, gen_with, Gen, Overrides};
pub use keys::{and_keys, keys, merge, or_keys, KeyExpr, KeysSpec};
pub use pred::{Pred, PredFn};
pub use regex::{
    alt, cat, constrained, one_or_more, zero_or_more, zero_or_one, ReChild, RegexOp,
};
pub use registry::{builtin, def, get_spec, reset_registry};
pub use spec::{
    and, assert_valid, conform, conformer, explain_data, explain_out, explain_str, float_in,
    nilable, or, predicate, spec, tuple, unform, valid, with_gen, Spec, SpecKind, SpecRef,
};
pub use value::{kw, qkw, Keyword, NativeFn, Value, ValueKind};

/// Generator for a registered or inline spec, honoring overrides.
pub fn gen(spec: impl Into<SpecRef>, overrides: &Overrides) -> Result<Gen, SpecError> {
    gen_with(&spec.into(), overrides)
}
