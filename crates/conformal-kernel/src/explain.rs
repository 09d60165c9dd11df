//! Failure explanation: problem records and their textual rendering.
//!
//! A problem names a position inside the spec tree (`path`), a position
//! inside the value (`in`), the chain of named specs traversed (`via`), the
//! offending value, and the predicate it failed. Ordering is stable:
//! problems appear in component order for products, declaration order for
//! keys, and input order for sequences.

use serde::ser::Serializer;
use serde::Serialize;
use std::fmt;

use crate::value::{Keyword, Value};

/// One step of a spec-tree or value path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathSeg {
    /// A keyword segment: a keys entry, an `or`/`alt`/`cat` tag.
    Key(Keyword),
    /// A positional segment: tuple slot, sequence index.
    Index(usize),
    /// A literal value segment: a map key or set element.
    Val(Value),
}

impl fmt::Display for PathSeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSeg::Key(k) => write!(f, "{k}"),
            PathSeg::Index(i) => write!(f, "{i}"),
            PathSeg::Val(v) => write!(f, "{v}"),
        }
    }
}

impl Serialize for PathSeg {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PathSeg::Key(k) => k.serialize(serializer),
            PathSeg::Index(i) => serializer.serialize_u64(*i as u64),
            PathSeg::Val(v) => v.serialize(serializer),
        }
    }
}

impl From<Keyword> for PathSeg {
    fn from(k: Keyword) -> Self {
        PathSeg::Key(k)
    }
}

impl From<usize> for PathSeg {
    fn from(i: usize) -> Self {
        PathSeg::Index(i)
    }
}

/// Render a path as `[a, b, c]`.
pub fn format_path(path: &[PathSeg]) -> String {
    let mut out = String::from("[");
    for (i, seg) in path.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&seg.to_string());
    }
    out.push(']');
    out
}

/// Extend a path by one segment.
pub(crate) fn path_conj(path: &[PathSeg], seg: impl Into<PathSeg>) -> Vec<PathSeg> {
    let mut out = path.to_vec();
    out.push(seg.into());
    out
}

/// Extend a via chain by a spec name.
pub(crate) fn via_conj(via: &[Keyword], name: Option<&Keyword>) -> Vec<Keyword> {
    let mut out = via.to_vec();
    if let Some(name) = name {
        out.push(name.clone());
    }
    out
}

/// A single conformance failure record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    /// Position inside the spec tree.
    pub path: Vec<PathSeg>,
    /// Rendering of the failed predicate.
    pub pred: String,
    /// The offending value.
    pub val: Value,
    /// Extra context: "Insufficient input", a raised predicate message, ...
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Chain of named specs traversed to reach the failure site.
    pub via: Vec<Keyword>,
    /// Position inside the value.
    #[serde(rename = "in")]
    pub in_: Vec<PathSeg>,
}

impl Problem {
    pub fn new(
        path: Vec<PathSeg>,
        pred: impl Into<String>,
        val: Value,
        via: Vec<Keyword>,
        in_: Vec<PathSeg>,
    ) -> Self {
        Self {
            path,
            pred: pred.into(),
            val,
            reason: None,
            via,
            in_,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Everything `explain_data` knows about a failed validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Explanation {
    pub problems: Vec<Problem>,
    /// Rendering of the top-level spec (its name when registered).
    pub spec: String,
    /// The original value.
    pub value: Value,
}

impl Explanation {
    /// Render the problem list, one line per problem:
    ///
    /// `[In: in ]val: v fails[ spec: s][ at: path] predicate: p[, reason]`
    pub fn render(&self) -> String {
        let mut out = String::new();
        for problem in &self.problems {
            if !problem.in_.is_empty() {
                out.push_str(&format!("In: {} ", format_path(&problem.in_)));
            }
            out.push_str(&format!("val: {} fails", problem.val));
            if let Some(last) = problem.via.last() {
                out.push_str(&format!(" spec: {last}"));
            }
            if !problem.path.is_empty() {
                out.push_str(&format!(" at: {}", format_path(&problem.path)));
            }
            out.push_str(&format!(" predicate: {}", problem.pred));
            if let Some(reason) = &problem.reason {
                out.push_str(&format!(", {reason}"));
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{kw, qkw};

    fn sample_problem() -> Problem {
        Problem::new(
            vec![PathSeg::Key(kw("unit"))],
            "keyword",
            Value::from("teaspoon"),
            vec![qkw("recipe", "ingredient")],
            vec![PathSeg::Index(1)],
        )
    }

    #[test]
    fn render_includes_all_sections() {
        let expl = Explanation {
            problems: vec![sample_problem()],
            spec: ":recipe/ingredient".to_string(),
            value: Value::vector([Value::from(2), Value::from("teaspoon")]),
        };
        assert_eq!(
            expl.render(),
            "In: [1] val: \"teaspoon\" fails spec: :recipe/ingredient at: [:unit] predicate: keyword\n"
        );
    }

    #[test]
    fn render_omits_empty_sections_and_appends_reason() {
        let expl = Explanation {
            problems: vec![Problem::new(
                vec![],
                "int",
                Value::Nil,
                vec![],
                vec![],
            )
            .with_reason("boom")],
            spec: "int".to_string(),
            value: Value::Nil,
        };
        assert_eq!(expl.render(), "val: nil fails predicate: int, boom\n");
    }

    #[test]
    fn serializes_with_in_rename() {
        let json = serde_json::to_value(sample_problem()).expect("serialize");
        assert_eq!(json["in"], serde_json::json!([1]));
        assert_eq!(json["path"], serde_json::json!([":unit"]));
        assert_eq!(json["via"], serde_json::json!([":recipe/ingredient"]));
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn format_path_rendering() {
        assert_eq!(format_path(&[]), "[]");
        assert_eq!(
            format_path(&[PathSeg::Key(kw("a")), PathSeg::Index(3)]),
            "[:a, 3]"
        );
    }
}
