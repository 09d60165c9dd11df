//! Predicate forms.
//!
//! A predicate is the leaf test a spec bottoms out in: a value-kind
//! membership, a value-set membership, a full-string textual pattern, or a
//! boolean callable. A callable that errors counts as failing; the message
//! is surfaced as the problem `reason`.

use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::error::SpecError;
use crate::value::{Value, ValueKind};

type BoolFn = Arc<dyn Fn(&Value) -> Result<bool, String> + Send + Sync>;

/// A named boolean callable over values.
#[derive(Clone)]
pub struct PredFn {
    label: String,
    f: BoolFn,
}

impl PredFn {
    pub fn new(
        label: impl Into<String>,
        f: impl Fn(&Value) -> Result<bool, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            f: Arc::new(f),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn check(&self, v: &Value) -> Result<bool, String> {
        (self.f)(v)
    }
}

impl fmt::Debug for PredFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

/// The four predicate forms.
#[derive(Debug, Clone)]
pub enum Pred {
    /// Type membership: the value's variant equals the kind.
    Kind(ValueKind),
    /// Value-set membership.
    OneOf(BTreeSet<Value>),
    /// Full-string match against a textual pattern (strings only).
    Pattern(Arc<Regex>),
    /// Boolean callable.
    Func(PredFn),
}

impl Pred {
    pub fn kind(k: ValueKind) -> Pred {
        Pred::Kind(k)
    }

    pub fn one_of(vals: impl IntoIterator<Item = Value>) -> Result<Pred, SpecError> {
        let set: BTreeSet<Value> = vals.into_iter().collect();
        if set.is_empty() {
            return Err(SpecError::InvalidSpec(
                "value-set predicate must be non-empty".to_string(),
            ));
        }
        Ok(Pred::OneOf(set))
    }

    /// Compile a textual pattern. Matching is anchored to the full string.
    pub fn pattern(src: &str) -> Result<Pred, SpecError> {
        let anchored = format!("\\A(?:{src})\\z");
        let re = Regex::new(&anchored)
            .map_err(|e| SpecError::InvalidSpec(format!("invalid pattern {src:?}: {e}")))?;
        Ok(Pred::Pattern(Arc::new(re)))
    }

    pub fn func(
        label: impl Into<String>,
        f: impl Fn(&Value) -> Result<bool, String> + Send + Sync + 'static,
    ) -> Pred {
        Pred::Func(PredFn::new(label, f))
    }

    /// Apply the predicate. `Err` carries a raised callable's message.
    pub fn check(&self, v: &Value) -> Result<bool, String> {
        match self {
            Pred::Kind(k) => Ok(v.kind() == *k),
            Pred::OneOf(set) => Ok(set.contains(v)),
            Pred::Pattern(re) => Ok(match v {
                Value::Str(s) => re.is_match(s),
                _ => false,
            }),
            Pred::Func(f) => f.check(v),
        }
    }

    /// Readable rendering used in problems and generator errors.
    pub fn describe(&self) -> String {
        match self {
            Pred::Kind(k) => k.label().to_string(),
            Pred::OneOf(set) => {
                let mut out = String::from("#{");
                for (i, v) in set.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&v.to_string());
                }
                out.push('}');
                out
            }
            Pred::Pattern(re) => {
                // Strip the anchoring added at construction.
                let src = re.as_str();
                let inner = src
                    .strip_prefix("\\A(?:")
                    .and_then(|s| s.strip_suffix(")\\z"))
                    .unwrap_or(src);
                format!("#\"{inner}\"")
            }
            Pred::Func(f) => f.label().to_string(),
        }
    }
}

impl From<ValueKind> for Pred {
    fn from(k: ValueKind) -> Self {
        Pred::Kind(k)
    }
}
