//! Spec core: the closed spec sum, the spec-or-name reference, and the
//! shared contract (`conform` / `unform` / `explain` / `gen`).
//!
//! Every entry point funnels through [`SpecRef`]: registry names resolve
//! lazily at use sites, so named specs may reference each other (including
//! themselves). Conformance failure is the `INVALID` sentinel value, never
//! an `Err` — errors are reserved for spec-building and generation faults.

use std::sync::Arc;

use conformal_rand::Rand;

use crate::error::SpecError;
use crate::every::EverySpec;
use crate::explain::{path_conj, via_conj, Explanation, PathSeg, Problem};
use crate::fspec::FSpec;
use crate::gen::{gensub, kind_gen, Gen, Overrides, RMap};
use crate::keys::KeysSpec;
use crate::pred::Pred;
use crate::regex::RegexOp;
use crate::registry;
use crate::value::{kw, Keyword, Value, ValueKind};
use crate::{config, every, fspec, keys, regex};

type ConformFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// A spec, or the name of one.
///
/// Names are resolved against the registry at each use, which is what makes
/// registered recursion work.
#[derive(Clone)]
pub enum SpecRef {
    Spec(Arc<Spec>),
    Name(Keyword),
}

impl std::fmt::Debug for SpecRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

impl SpecRef {
    pub fn resolve(&self) -> Result<Arc<Spec>, SpecError> {
        match self {
            SpecRef::Spec(s) => Ok(s.clone()),
            SpecRef::Name(k) => registry::resolve(k),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SpecRef::Spec(s) => s.describe(),
            SpecRef::Name(k) => k.to_string(),
        }
    }
}

impl From<Spec> for SpecRef {
    fn from(s: Spec) -> Self {
        SpecRef::Spec(Arc::new(s))
    }
}

impl From<Arc<Spec>> for SpecRef {
    fn from(s: Arc<Spec>) -> Self {
        SpecRef::Spec(s)
    }
}

impl From<Keyword> for SpecRef {
    fn from(k: Keyword) -> Self {
        SpecRef::Name(k)
    }
}

impl From<&Keyword> for SpecRef {
    fn from(k: &Keyword) -> Self {
        SpecRef::Name(k.clone())
    }
}

impl From<Pred> for SpecRef {
    fn from(p: Pred) -> Self {
        SpecRef::from(predicate(p))
    }
}

impl From<ValueKind> for SpecRef {
    fn from(k: ValueKind) -> Self {
        SpecRef::from(Pred::Kind(k))
    }
}

impl From<RegexOp> for SpecRef {
    fn from(op: RegexOp) -> Self {
        // A bare regex: splices when embedded in an outer sequence.
        SpecRef::from(Spec::from_kind(SpecKind::Regex {
            op: Arc::new(op),
            bare: true,
        }))
    }
}

/// The spec variants of the engine.
#[derive(Clone)]
pub enum SpecKind {
    Pred(Pred),
    Conformer {
        f: ConformFn,
        unf: Option<ConformFn>,
    },
    And(Vec<SpecRef>),
    Or {
        tags: Vec<Keyword>,
        preds: Vec<SpecRef>,
    },
    Tuple(Vec<SpecRef>),
    Nilable(SpecRef),
    Every(EverySpec),
    Keys(KeysSpec),
    Merge(Vec<SpecRef>),
    Regex {
        op: Arc<RegexOp>,
        /// Bare regexes splice when embedded inside an outer regex; a
        /// `spec(...)`-wrapped one consumes exactly one element.
        bare: bool,
    },
    FSpec(FSpec),
}

/// A composable description of a value shape.
///
/// Specs are immutable; `def` and `with_gen` produce renamed/augmented
/// copies rather than mutating in place.
#[derive(Clone)]
pub struct Spec {
    name: Option<Keyword>,
    gen_attachment: Option<Gen>,
    kind: SpecKind,
}

impl std::fmt::Debug for Spec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

impl Spec {
    pub(crate) fn from_kind(kind: SpecKind) -> Spec {
        Spec {
            name: None,
            gen_attachment: None,
            kind,
        }
    }

    pub fn name(&self) -> Option<&Keyword> {
        self.name.as_ref()
    }

    pub(crate) fn kind(&self) -> &SpecKind {
        &self.kind
    }

    pub(crate) fn gen_attachment(&self) -> Option<&Gen> {
        self.gen_attachment.as_ref()
    }

    /// A copy carrying `name`; used by registration.
    pub(crate) fn named(&self, name: Keyword) -> Spec {
        let mut out = self.clone();
        out.name = Some(name);
        out
    }

    /// A copy whose generator is replaced by `gen`.
    pub fn with_gen(&self, gen: Gen) -> Spec {
        let mut out = self.clone();
        out.gen_attachment = Some(gen);
        out
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            SpecKind::Pred(p) => p.describe(),
            SpecKind::Conformer { .. } => "conformer".to_string(),
            SpecKind::And(ps) => {
                format!("(and {})", describe_all(ps))
            }
            SpecKind::Or { tags, preds } => {
                let body: Vec<String> = tags
                    .iter()
                    .zip(preds)
                    .map(|(t, p)| format!("{t} {}", p.describe()))
                    .collect();
                format!("(or {})", body.join(" "))
            }
            SpecKind::Tuple(ps) => format!("(tuple {})", describe_all(ps)),
            SpecKind::Nilable(p) => format!("(nilable {})", p.describe()),
            SpecKind::Every(e) => e.describe(),
            SpecKind::Keys(k) => k.describe(),
            SpecKind::Merge(ps) => format!("(merge {})", describe_all(ps)),
            SpecKind::Regex { op, .. } => regex::describe_op(op),
            SpecKind::FSpec(fs) => fs.describe(),
        }
    }

    pub(crate) fn conform_val(&self, v: &Value) -> Result<Value, SpecError> {
        match &self.kind {
            SpecKind::Pred(p) => Ok(match p.check(v) {
                Ok(true) => v.clone(),
                _ => Value::invalid(),
            }),
            SpecKind::Conformer { f, .. } => Ok(f(v)),
            SpecKind::And(ps) => {
                let mut cur = v.clone();
                for p in ps {
                    cur = conform_ref(p, &cur)?;
                    if cur.is_invalid() {
                        return Ok(Value::invalid());
                    }
                }
                Ok(cur)
            }
            SpecKind::Or { tags, preds } => {
                for (tag, p) in tags.iter().zip(preds) {
                    let r = conform_ref(p, v)?;
                    if !r.is_invalid() {
                        return Ok(Value::vector([Value::Keyword(tag.clone()), r]));
                    }
                }
                Ok(Value::invalid())
            }
            SpecKind::Tuple(ps) => {
                let Some(items) = v.as_vector() else {
                    return Ok(Value::invalid());
                };
                if items.len() != ps.len() {
                    return Ok(Value::invalid());
                }
                let mut out = Vec::with_capacity(items.len());
                for (p, item) in ps.iter().zip(items) {
                    let r = conform_ref(p, item)?;
                    if r.is_invalid() {
                        return Ok(Value::invalid());
                    }
                    out.push(r);
                }
                Ok(Value::Vector(out))
            }
            SpecKind::Nilable(p) => {
                if v.is_nil() {
                    return Ok(Value::Nil);
                }
                conform_ref(p, v)
            }
            SpecKind::Every(e) => every::conform(e, v),
            SpecKind::Keys(k) => keys::conform(k, v),
            SpecKind::Merge(ps) => keys::merge_conform(ps, v),
            SpecKind::Regex { op, .. } => match v {
                Value::Nil => regex::re_conform(op, &[]),
                Value::Vector(items) => regex::re_conform(op, items),
                _ => Ok(Value::invalid()),
            },
            SpecKind::FSpec(fs) => fspec::conform_fspec(fs, v),
        }
    }

    pub(crate) fn unform_val(&self, v: &Value) -> Result<Value, SpecError> {
        match &self.kind {
            SpecKind::Pred(_) => Ok(v.clone()),
            SpecKind::Conformer { unf, .. } => Ok(match unf {
                Some(g) => g(v),
                None => v.clone(),
            }),
            SpecKind::And(ps) => {
                let mut cur = v.clone();
                for p in ps.iter().rev() {
                    cur = unform_ref(p, &cur)?;
                }
                Ok(cur)
            }
            SpecKind::Or { tags, preds } => {
                let tagged = v.as_vector().filter(|items| items.len() == 2);
                let Some([tag, val]) = tagged.map(|items| [&items[0], &items[1]]) else {
                    return Err(SpecError::InvalidSpec(format!(
                        "or unform expects a [tag value] pair, got {v}"
                    )));
                };
                let Some(tag) = tag.as_keyword() else {
                    return Err(SpecError::InvalidSpec(format!(
                        "or unform expects a keyword tag, got {tag}"
                    )));
                };
                for (t, p) in tags.iter().zip(preds) {
                    if t == tag {
                        return unform_ref(p, val);
                    }
                }
                Err(SpecError::InvalidSpec(format!(
                    "or unform got unknown tag {tag}"
                )))
            }
            SpecKind::Tuple(ps) => {
                let Some(items) = v.as_vector() else {
                    return Ok(v.clone());
                };
                let mut out = Vec::with_capacity(items.len());
                for (p, item) in ps.iter().zip(items) {
                    out.push(unform_ref(p, item)?);
                }
                Ok(Value::Vector(out))
            }
            SpecKind::Nilable(p) => {
                if v.is_nil() {
                    return Ok(Value::Nil);
                }
                unform_ref(p, v)
            }
            SpecKind::Every(e) => every::unform(e, v),
            SpecKind::Keys(k) => keys::unform(k, v),
            SpecKind::Merge(ps) => keys::merge_unform(ps, v),
            SpecKind::Regex { op, .. } => Ok(Value::Vector(regex::re_unform(op, v)?)),
            SpecKind::FSpec(_) => Ok(v.clone()),
        }
    }

    pub(crate) fn explain_val(
        &self,
        path: &[PathSeg],
        via: &[Keyword],
        in_: &[PathSeg],
        v: &Value,
        out: &mut Vec<Problem>,
    ) -> Result<(), SpecError> {
        match &self.kind {
            SpecKind::Pred(p) => match p.check(v) {
                Ok(true) => Ok(()),
                Ok(false) => {
                    out.push(Problem::new(
                        path.to_vec(),
                        p.describe(),
                        v.clone(),
                        via.to_vec(),
                        in_.to_vec(),
                    ));
                    Ok(())
                }
                Err(reason) => {
                    out.push(
                        Problem::new(
                            path.to_vec(),
                            p.describe(),
                            v.clone(),
                            via.to_vec(),
                            in_.to_vec(),
                        )
                        .with_reason(reason),
                    );
                    Ok(())
                }
            },
            SpecKind::Conformer { f, .. } => {
                if f(v).is_invalid() {
                    out.push(Problem::new(
                        path.to_vec(),
                        "conformer",
                        v.clone(),
                        via.to_vec(),
                        in_.to_vec(),
                    ));
                }
                Ok(())
            }
            SpecKind::And(ps) => {
                let mut cur = v.clone();
                for p in ps {
                    let r = conform_ref(p, &cur)?;
                    if r.is_invalid() {
                        explain_ref(p, path, via, in_, &cur, out)?;
                        return Ok(());
                    }
                    cur = r;
                }
                Ok(())
            }
            SpecKind::Or { tags, preds } => {
                if !self.conform_val(v)?.is_invalid() {
                    return Ok(());
                }
                for (tag, p) in tags.iter().zip(preds) {
                    explain_ref(p, &path_conj(path, tag.clone()), via, in_, v, out)?;
                }
                Ok(())
            }
            SpecKind::Tuple(ps) => {
                let Some(items) = v.as_vector() else {
                    out.push(Problem::new(
                        path.to_vec(),
                        "vector",
                        v.clone(),
                        via.to_vec(),
                        in_.to_vec(),
                    ));
                    return Ok(());
                };
                if items.len() != ps.len() {
                    out.push(Problem::new(
                        path.to_vec(),
                        format!("(count = {})", ps.len()),
                        v.clone(),
                        via.to_vec(),
                        in_.to_vec(),
                    ));
                    return Ok(());
                }
                for (i, (p, item)) in ps.iter().zip(items).enumerate() {
                    if conform_ref(p, item)?.is_invalid() {
                        explain_ref(
                            p,
                            &path_conj(path, i),
                            via,
                            &path_conj(in_, i),
                            item,
                            out,
                        )?;
                    }
                }
                Ok(())
            }
            SpecKind::Nilable(p) => {
                if v.is_nil() || !conform_ref(p, v)?.is_invalid() {
                    return Ok(());
                }
                explain_ref(p, &path_conj(path, kw("pred")), via, in_, v, out)?;
                out.push(Problem::new(
                    path_conj(path, kw("nil")),
                    "nil",
                    v.clone(),
                    via.to_vec(),
                    in_.to_vec(),
                ));
                Ok(())
            }
            SpecKind::Every(e) => every::explain(e, path, via, in_, v, out),
            SpecKind::Keys(k) => keys::explain(k, path, via, in_, v, out),
            SpecKind::Merge(ps) => keys::merge_explain(ps, path, via, in_, v, out),
            SpecKind::Regex { op, .. } => match v {
                Value::Nil => regex::re_explain(path, via, in_, op, &[], out),
                Value::Vector(items) => regex::re_explain(path, via, in_, op, items, out),
                _ => {
                    out.push(Problem::new(
                        path.to_vec(),
                        "vector",
                        v.clone(),
                        via.to_vec(),
                        in_.to_vec(),
                    ));
                    Ok(())
                }
            },
            SpecKind::FSpec(fs) => fspec::explain_fspec(fs, path, via, in_, v, out),
        }
    }

    pub(crate) fn gen_val(
        &self,
        overrides: &Overrides,
        path: &[PathSeg],
        rmap: &RMap,
    ) -> Result<Gen, SpecError> {
        let no_gen = || SpecError::NoGen {
            path: path.to_vec(),
            spec: self.describe(),
        };
        match &self.kind {
            SpecKind::Pred(p) => match p {
                Pred::Kind(k) => kind_gen(*k).ok_or_else(no_gen),
                Pred::OneOf(set) => {
                    let choices: Vec<Value> = set.iter().cloned().collect();
                    Ok(Gen::new(move |rand| {
                        Ok(choices[rand.index(choices.len())].clone())
                    }))
                }
                Pred::Pattern(_) | Pred::Func(_) => Err(no_gen()),
            },
            SpecKind::Conformer { .. } => Err(no_gen()),
            SpecKind::And(ps) => {
                let first = ps.first().ok_or_else(no_gen)?;
                gensub(first, overrides, path, rmap)
            }
            SpecKind::Or { tags, preds } => {
                let mut gens = Vec::new();
                for (tag, p) in tags.iter().zip(preds) {
                    if let Ok(g) = gensub(p, overrides, &path_conj(path, tag.clone()), rmap) {
                        gens.push(g);
                    }
                }
                if gens.is_empty() {
                    return Err(no_gen());
                }
                Ok(Gen::one_of(gens))
            }
            SpecKind::Tuple(ps) => {
                let mut gens = Vec::with_capacity(ps.len());
                for (i, p) in ps.iter().enumerate() {
                    gens.push(gensub(p, overrides, &path_conj(path, i), rmap)?);
                }
                Ok(Gen::tuple_of(gens))
            }
            SpecKind::Nilable(p) => {
                let inner = gensub(p, overrides, &path_conj(path, kw("pred")), rmap)?;
                Ok(Gen::frequency(vec![
                    (1, Gen::constant(Value::Nil)),
                    (9, inner),
                ]))
            }
            SpecKind::Every(e) => every::gen(e, overrides, path, rmap),
            SpecKind::Keys(k) => keys::gen(k, overrides, path, rmap),
            SpecKind::Merge(ps) => keys::merge_gen(ps, overrides, path, rmap),
            SpecKind::Regex { op, .. } => regex::re_gen(op, overrides, path, rmap),
            SpecKind::FSpec(fs) => fspec::gen_fspec(fs, overrides, path, rmap),
        }
    }
}

fn describe_all(ps: &[SpecRef]) -> String {
    ps.iter()
        .map(|p| p.describe())
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Contract entry points over SpecRef.

pub(crate) fn conform_ref(sref: &SpecRef, v: &Value) -> Result<Value, SpecError> {
    sref.resolve()?.conform_val(v)
}

pub(crate) fn unform_ref(sref: &SpecRef, v: &Value) -> Result<Value, SpecError> {
    sref.resolve()?.unform_val(v)
}

/// Explain through a reference, extending `via` with the resolved spec's
/// registered name.
pub(crate) fn explain_ref(
    sref: &SpecRef,
    path: &[PathSeg],
    via: &[Keyword],
    in_: &[PathSeg],
    v: &Value,
    out: &mut Vec<Problem>,
) -> Result<(), SpecError> {
    let spec = sref.resolve()?;
    let via = via_conj(via, spec.name());
    spec.explain_val(path, &via, in_, v, out)
}

// ---------------------------------------------------------------------------
// Public API.

/// Conform `v` against `spec`: the conformed value, or the `INVALID`
/// sentinel. `Err` means the spec itself is broken (unresolved name).
pub fn conform(spec: impl Into<SpecRef>, v: &Value) -> Result<Value, SpecError> {
    conform_ref(&spec.into(), v)
}

/// Does `v` conform?
pub fn valid(spec: impl Into<SpecRef>, v: &Value) -> Result<bool, SpecError> {
    Ok(!conform(spec, v)?.is_invalid())
}

/// Invert a conformed value back to its input shape.
pub fn unform(spec: impl Into<SpecRef>, v: &Value) -> Result<Value, SpecError> {
    unform_ref(&spec.into(), v)
}

/// Structured explanation of why `v` does not conform; `None` when it does.
pub fn explain_data(
    spec: impl Into<SpecRef>,
    v: &Value,
) -> Result<Option<Explanation>, SpecError> {
    let sref = spec.into();
    if !conform_ref(&sref, v)?.is_invalid() {
        return Ok(None);
    }
    let mut problems = Vec::new();
    explain_ref(&sref, &[], &[], &[], v, &mut problems)?;
    if problems.is_empty() {
        // explain must report at least one problem whenever conform fails
        problems.push(Problem::new(
            vec![],
            sref.describe(),
            v.clone(),
            vec![],
            vec![],
        ));
    }
    Ok(Some(Explanation {
        problems,
        spec: sref.describe(),
        value: v.clone(),
    }))
}

/// Textual explanation; `"Success!\n"` when `v` conforms.
pub fn explain_str(spec: impl Into<SpecRef>, v: &Value) -> Result<String, SpecError> {
    match explain_data(spec, v)? {
        None => Ok("Success!\n".to_string()),
        Some(expl) => Ok(expl.render()),
    }
}

/// Print the explanation to stdout.
pub fn explain_out(spec: impl Into<SpecRef>, v: &Value) -> Result<(), SpecError> {
    print!("{}", explain_str(spec, v)?);
    Ok(())
}

/// With assertion checking on, raise on non-conforming values; otherwise
/// (and on success) pass `v` through unchanged.
pub fn assert_valid(spec: impl Into<SpecRef>, v: &Value) -> Result<Value, SpecError> {
    if !config::check_asserts() {
        return Ok(v.clone());
    }
    let sref = spec.into();
    match explain_data(&sref, v)? {
        None => Ok(v.clone()),
        Some(explanation) => Err(SpecError::AssertionFailed {
            explanation: Box::new(explanation),
        }),
    }
}

impl From<&SpecRef> for SpecRef {
    fn from(r: &SpecRef) -> Self {
        r.clone()
    }
}

// ---------------------------------------------------------------------------
// Constructors.

/// Spec from a bare predicate.
pub fn predicate(p: impl Into<Pred>) -> Spec {
    Spec::from_kind(SpecKind::Pred(p.into()))
}

/// Spec from a conforming function. `f` must return the `INVALID` sentinel
/// on failure. Without `finv` the unform direction is identity, and the
/// round-trip law does not hold for transforming `f`s.
pub fn conformer(
    f: impl Fn(&Value) -> Value + Send + Sync + 'static,
    finv: Option<Box<dyn Fn(&Value) -> Value + Send + Sync>>,
) -> Spec {
    Spec::from_kind(SpecKind::Conformer {
        f: Arc::new(f),
        unf: finv.map(|g| Arc::from(g) as ConformFn),
    })
}

/// Conjunction: conform left-to-right, threading the conformed value.
pub fn and(preds: Vec<SpecRef>) -> Spec {
    Spec::from_kind(SpecKind::And(preds))
}

/// Tagged disjunction: first branch to accept wins, conformed as
/// `[tag value]`.
pub fn or(branches: Vec<(Keyword, SpecRef)>) -> Spec {
    let (tags, preds) = branches.into_iter().unzip();
    Spec::from_kind(SpecKind::Or { tags, preds })
}

/// Fixed-arity positional product.
pub fn tuple(preds: Vec<SpecRef>) -> Spec {
    Spec::from_kind(SpecKind::Tuple(preds))
}

/// Accept nil or a `p`-conforming value.
pub fn nilable(p: impl Into<SpecRef>) -> Spec {
    Spec::from_kind(SpecKind::Nilable(p.into()))
}

/// Wrap `x` as a standalone spec. Wrapping a regex makes it consume exactly
/// one element (a nested sequence) when embedded in an outer regex.
pub fn spec(x: impl Into<SpecRef>) -> Spec {
    match x.into() {
        SpecRef::Spec(s) => match s.kind() {
            SpecKind::Regex { op, bare: true } => Spec::from_kind(SpecKind::Regex {
                op: op.clone(),
                bare: false,
            }),
            _ => s.as_ref().clone(),
        },
        SpecRef::Name(k) => Spec::from_kind(SpecKind::And(vec![SpecRef::Name(k)])),
    }
}

/// Floats in `min..=max`, with NaN/infinity admission flags.
pub fn float_in(min: f64, max: f64, infinite: bool, nan: bool) -> Spec {
    let label = format!("(float-in {min:?} {max:?})");
    let p = Pred::func(label, move |v| {
        let Some(x) = v.as_float() else {
            return Ok(false);
        };
        if x.is_nan() {
            return Ok(nan);
        }
        if x.is_infinite() && !infinite {
            return Ok(false);
        }
        Ok(x >= min && x <= max)
    });
    let lo = if min.is_finite() { min } else { -1.0e9 };
    let hi = if max.is_finite() { max } else { 1.0e9 };
    let mut pairs = vec![(
        16u32,
        Gen::new(move |rand| Ok(Value::Float(rand.range_f64(lo, hi)))),
    )];
    if nan {
        pairs.push((1, Gen::constant(Value::Float(f64::NAN))));
    }
    if infinite && max.is_infinite() {
        pairs.push((1, Gen::constant(Value::Float(f64::INFINITY))));
    }
    if infinite && min.is_infinite() {
        pairs.push((1, Gen::constant(Value::Float(f64::NEG_INFINITY))));
    }
    predicate(p).with_gen(Gen::frequency(pairs))
}

/// Attach a replacement generator to a spec.
pub fn with_gen(spec: Spec, gen: Gen) -> Spec {
    spec.with_gen(gen)
}
