//! Sequence-regex engine.
//!
//! Regex ops recognize grammars over specs by Brzozowski derivatives:
//! `deriv(r, x)` is the op accepting exactly the suffixes of sequences in
//! `L(r)` after consuming `x`; a sequence conforms when folding `deriv`
//! over it lands in a nil-accepting state, whose `preturn` is the conformed
//! result.
//!
//! A regex op is not itself a spec. Embedded in an outer regex, an inline
//! op (or a name that resolves to a bare registered regex) splices; a
//! `spec(...)`-wrapped regex consumes exactly one element. `Rep` and `Alt`
//! carry stable ids so generation can account recursion per node.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use conformal_rand::Rand;

use crate::config;
use crate::error::SpecError;
use crate::explain::{path_conj, via_conj, PathSeg, Problem};
use crate::gen::{gensub, rmap_enter, Gen, Overrides, RMap, RecKey};
use crate::pred::Pred;
use crate::spec::{conform_ref, explain_ref, Spec, SpecKind, SpecRef};
use crate::value::{Keyword, Value, ValueKind};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A child position inside a regex op: another op (spliced) or a spec
/// (consumes one element).
#[derive(Clone)]
pub enum ReChild {
    Op(Arc<RegexOp>),
    Spec(SpecRef),
}

impl std::fmt::Debug for ReChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", describe_child(self))
    }
}

impl From<RegexOp> for ReChild {
    fn from(op: RegexOp) -> Self {
        ReChild::Op(Arc::new(op))
    }
}

impl From<Arc<RegexOp>> for ReChild {
    fn from(op: Arc<RegexOp>) -> Self {
        ReChild::Op(op)
    }
}

impl From<Spec> for ReChild {
    fn from(s: Spec) -> Self {
        ReChild::Spec(SpecRef::from(s))
    }
}

impl From<Keyword> for ReChild {
    fn from(k: Keyword) -> Self {
        ReChild::Spec(SpecRef::Name(k))
    }
}

impl From<Pred> for ReChild {
    fn from(p: Pred) -> Self {
        ReChild::Spec(SpecRef::from(p))
    }
}

impl From<ValueKind> for ReChild {
    fn from(k: ValueKind) -> Self {
        ReChild::Spec(SpecRef::from(k))
    }
}

impl From<SpecRef> for ReChild {
    fn from(r: SpecRef) -> Self {
        ReChild::Spec(r)
    }
}

/// Regex op variants.
#[derive(Clone)]
pub enum RegexOp {
    /// Matches the empty sequence, producing `v`.
    Accept(Value),
    /// Concatenation. With `ks`, contributions build a map keyed per
    /// child; without, an ordered vector.
    Pcat {
        ps: Vec<ReChild>,
        ks: Option<Vec<Keyword>>,
        ret: Value,
        /// Built by `one_or_more`: unform treats the conformed vector as
        /// repetitions of the first child.
        rep_plus: bool,
    },
    /// First-match alternation, `[tag value]` when keyed.
    Alt {
        ps: Vec<ReChild>,
        ks: Option<Vec<Keyword>>,
        id: u64,
    },
    /// Kleene repetition: `p1` is the in-flight residual, `p2` the seed.
    Rep {
        p1: ReChild,
        p2: ReChild,
        ret: Value,
        splice: bool,
        id: u64,
    },
    /// Match `p1`, then constrain its result by the conjunction of `preds`.
    Amp { p1: ReChild, preds: Vec<SpecRef> },
}

impl std::fmt::Debug for RegexOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", describe_op(self))
    }
}

// ---------------------------------------------------------------------------
// Constructors.

/// Keyed concatenation.
pub fn cat(fields: Vec<(Keyword, ReChild)>) -> RegexOp {
    let (ks, ps) = fields.into_iter().unzip();
    RegexOp::Pcat {
        ps,
        ks: Some(ks),
        ret: Value::Map(Default::default()),
        rep_plus: false,
    }
}

/// Keyed first-match alternation.
pub fn alt(branches: Vec<(Keyword, ReChild)>) -> RegexOp {
    let (ks, ps) = branches.into_iter().unzip();
    RegexOp::Alt {
        ps,
        ks: Some(ks),
        id: next_id(),
    }
}

/// Zero or more `p`, conformed as a vector.
pub fn zero_or_more(p: impl Into<ReChild>) -> RegexOp {
    let p = p.into();
    RegexOp::Rep {
        p1: p.clone(),
        p2: p,
        ret: Value::Vector(vec![]),
        splice: false,
        id: next_id(),
    }
}

/// One or more `p`, conformed as a flat vector.
pub fn one_or_more(p: impl Into<ReChild>) -> RegexOp {
    let p = p.into();
    let rest = RegexOp::Rep {
        p1: p.clone(),
        p2: p.clone(),
        ret: Value::Vector(vec![]),
        splice: true,
        id: next_id(),
    };
    RegexOp::Pcat {
        ps: vec![p, ReChild::from(rest)],
        ks: None,
        ret: Value::Vector(vec![]),
        rep_plus: true,
    }
}

/// Zero or one `p`; the empty match conforms to nil.
pub fn zero_or_one(p: impl Into<ReChild>) -> RegexOp {
    RegexOp::Alt {
        ps: vec![p.into(), ReChild::from(RegexOp::Accept(Value::nil_ret()))],
        ks: None,
        id: next_id(),
    }
}

/// Match `r`, then require its conformed result to satisfy every pred.
pub fn constrained(r: impl Into<ReChild>, preds: Vec<SpecRef>) -> RegexOp {
    RegexOp::Amp {
        p1: r.into(),
        preds,
    }
}

// ---------------------------------------------------------------------------
// Child resolution. A name resolving to a bare registered regex splices.

enum Resolved {
    Op(Arc<RegexOp>, Option<Keyword>),
    Leaf(Arc<Spec>),
}

fn resolve(c: &ReChild) -> Result<Resolved, SpecError> {
    match c {
        ReChild::Op(op) => Ok(Resolved::Op(op.clone(), None)),
        ReChild::Spec(sref) => {
            let spec = sref.resolve()?;
            match spec.kind() {
                SpecKind::Regex { op, bare: true } => {
                    Ok(Resolved::Op(op.clone(), spec.name().cloned()))
                }
                _ => Ok(Resolved::Leaf(spec)),
            }
        }
    }
}

fn same_child(a: &ReChild, b: &ReChild) -> bool {
    match (a, b) {
        (ReChild::Op(x), ReChild::Op(y)) => Arc::ptr_eq(x, y),
        (ReChild::Spec(SpecRef::Spec(x)), ReChild::Spec(SpecRef::Spec(y))) => Arc::ptr_eq(x, y),
        (ReChild::Spec(SpecRef::Name(x)), ReChild::Spec(SpecRef::Name(y))) => x == y,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Result accumulation.

fn tag(k: Option<&Keyword>, v: Value) -> Value {
    match k {
        Some(k) => Value::map([(Value::Keyword(k.clone()), v)]),
        None => v,
    }
}

/// `conj`: map contributions merge into map accumulators, everything else
/// appends.
fn conj(r: Value, item: Value) -> Value {
    match (r, item) {
        (Value::Map(mut m), Value::Map(part)) => {
            m.extend(part);
            Value::Map(m)
        }
        (Value::Vector(mut v), item) => {
            v.push(item);
            Value::Vector(v)
        }
        (other, _) => other,
    }
}

/// `into`: splice a collection's elements into the accumulator.
fn into_ret(r: Value, coll: Value) -> Value {
    match (r, coll) {
        (Value::Vector(mut v), Value::Vector(items)) => {
            v.extend(items);
            Value::Vector(v)
        }
        (Value::Vector(mut v), Value::Map(part)) => {
            for (k, val) in part {
                v.push(Value::vector([k, val]));
            }
            Value::Vector(v)
        }
        (Value::Map(mut m), Value::Map(part)) => {
            m.extend(part);
            Value::Map(m)
        }
        (Value::Map(mut m), Value::Vector(items)) => {
            for pair in items {
                if let Some([k, val]) = pair.as_vector().map(|p| [&p[0], &p[1]]) {
                    m.insert(k.clone(), val.clone());
                }
            }
            Value::Map(m)
        }
        (other, _) => other,
    }
}

/// Thread a value through a pred conjunction; `INVALID` short-circuits.
fn and_preds(x: &Value, preds: &[SpecRef]) -> Result<Value, SpecError> {
    let mut cur = x.clone();
    for p in preds {
        cur = conform_ref(p, &cur)?;
        if cur.is_invalid() {
            return Ok(Value::invalid());
        }
    }
    Ok(cur)
}

/// Whether `p1`'s return carries nothing worth folding in.
fn noret(p1: &ReChild, pret: &Value) -> Result<bool, SpecError> {
    if pret.is_nil_ret() {
        return Ok(true);
    }
    if let Resolved::Op(op, _) = resolve(p1)? {
        if matches!(&*op, RegexOp::Rep { .. } | RegexOp::Pcat { .. }) && pret.is_empty_coll() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Fold `p`'s return (if it accepted nil) into accumulator `r` under `k`.
fn add_ret(p: &ReChild, r: Value, k: Option<&Keyword>) -> Result<Value, SpecError> {
    let op = match resolve(p)? {
        Resolved::Leaf(_) => return Ok(r),
        Resolved::Op(op, _) => op,
    };
    match &*op {
        RegexOp::Accept(_) | RegexOp::Alt { .. } | RegexOp::Amp { .. } => {
            let ret = op_preturn(&op)?;
            if ret.is_nil_ret() {
                Ok(r)
            } else {
                Ok(conj(r, tag(k, ret)))
            }
        }
        RegexOp::Rep { splice, .. } => {
            let ret = op_preturn(&op)?;
            if ret.is_empty_coll() {
                Ok(r)
            } else if *splice {
                Ok(into_ret(r, tag(k, ret)))
            } else {
                Ok(conj(r, tag(k, ret)))
            }
        }
        RegexOp::Pcat { .. } => {
            let ret = op_preturn(&op)?;
            if ret.is_empty_coll() {
                Ok(r)
            } else {
                Ok(conj(r, tag(k, ret)))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// accept_nil? / preturn.

fn child_accept_nil(c: &ReChild) -> Result<bool, SpecError> {
    match resolve(c)? {
        Resolved::Leaf(_) => Ok(false),
        Resolved::Op(op, _) => op_accept_nil(&op),
    }
}

pub(crate) fn op_accept_nil(op: &RegexOp) -> Result<bool, SpecError> {
    match op {
        RegexOp::Accept(_) => Ok(true),
        RegexOp::Pcat { ps, .. } => {
            for p in ps {
                if !child_accept_nil(p)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        RegexOp::Alt { ps, .. } => {
            for p in ps {
                if child_accept_nil(p)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        RegexOp::Rep { p1, p2, .. } => {
            if same_child(p1, p2) {
                return Ok(true);
            }
            child_accept_nil(p1)
        }
        RegexOp::Amp { p1, preds } => {
            if !child_accept_nil(p1)? {
                return Ok(false);
            }
            let pret = child_preturn(p1)?;
            if noret(p1, &pret)? {
                return Ok(true);
            }
            Ok(!and_preds(&pret, preds)?.is_invalid())
        }
    }
}

fn child_preturn(c: &ReChild) -> Result<Value, SpecError> {
    match resolve(c)? {
        Resolved::Leaf(_) => Ok(Value::nil_ret()),
        Resolved::Op(op, _) => op_preturn(&op),
    }
}

pub(crate) fn op_preturn(op: &RegexOp) -> Result<Value, SpecError> {
    match op {
        RegexOp::Accept(v) => Ok(v.clone()),
        RegexOp::Pcat { ps, ks, ret, .. } => {
            let k0 = ks.as_ref().and_then(|ks| ks.first());
            match ps.first() {
                Some(p0) => add_ret(p0, ret.clone(), k0),
                None => Ok(ret.clone()),
            }
        }
        RegexOp::Alt { ps, ks, .. } => {
            for (i, p) in ps.iter().enumerate() {
                if child_accept_nil(p)? {
                    let r = child_preturn(p)?;
                    let k = ks.as_ref().and_then(|ks| ks.get(i));
                    return Ok(match k {
                        Some(k) => Value::vector([Value::Keyword(k.clone()), r]),
                        None => r,
                    });
                }
            }
            Ok(Value::nil_ret())
        }
        RegexOp::Rep { p1, ret, .. } => add_ret(p1, ret.clone(), None),
        RegexOp::Amp { p1, preds } => {
            let pret = child_preturn(p1)?;
            if noret(p1, &pret)? {
                return Ok(Value::nil_ret());
            }
            and_preds(&pret, preds)
        }
    }
}

// ---------------------------------------------------------------------------
// Derivatives.

/// Concatenation smart constructor: fold leading accepts into the
/// accumulator; a fully folded chain is itself an accept.
fn pcat_star(
    ps: Vec<ReChild>,
    ks: Option<Vec<Keyword>>,
    ret: Value,
    rep_plus: bool,
) -> Option<RegexOp> {
    let mut ps: VecDeque<ReChild> = ps.into();
    let mut ks: Option<VecDeque<Keyword>> = ks.map(Into::into);
    let mut ret = ret;
    loop {
        let Some(first) = ps.front() else {
            return Some(RegexOp::Accept(ret));
        };
        let accepted = match first {
            ReChild::Op(op) => match &**op {
                RegexOp::Accept(v) => Some(v.clone()),
                _ => None,
            },
            _ => None,
        };
        let Some(v) = accepted else {
            break;
        };
        let k = ks.as_mut().and_then(|ks| ks.pop_front());
        ret = conj(ret, tag(k.as_ref(), v));
        ps.pop_front();
        if ps.is_empty() {
            return Some(RegexOp::Accept(ret));
        }
    }
    Some(RegexOp::Pcat {
        ps: ps.into(),
        ks: ks.map(Into::into),
        ret,
        rep_plus,
    })
}

/// Alternation smart constructor over surviving derivative branches.
fn alt_star(survivors: Vec<(RegexOp, Option<Keyword>)>, keyed: bool, id: u64) -> Option<RegexOp> {
    let mut survivors = survivors;
    match survivors.len() {
        0 => None,
        1 => {
            let (op, k) = survivors.pop().expect("one survivor");
            match k {
                None => Some(op),
                Some(k) => match op {
                    RegexOp::Accept(v) => Some(RegexOp::Accept(Value::vector([
                        Value::Keyword(k),
                        v,
                    ]))),
                    other => Some(RegexOp::Alt {
                        ps: vec![ReChild::from(other)],
                        ks: Some(vec![k]),
                        id,
                    }),
                },
            }
        }
        _ => {
            let (ops, ks): (Vec<RegexOp>, Vec<Option<Keyword>>) = survivors.into_iter().unzip();
            let ks = keyed.then(|| ks.into_iter().flatten().collect());
            Some(RegexOp::Alt {
                ps: ops.into_iter().map(ReChild::from).collect(),
                ks,
                id,
            })
        }
    }
}

fn alt2(a: Option<RegexOp>, b: Option<RegexOp>) -> Option<RegexOp> {
    match (a, b) {
        (Some(a), Some(b)) => Some(RegexOp::Alt {
            ps: vec![ReChild::from(a), ReChild::from(b)],
            ks: None,
            id: next_id(),
        }),
        (a, b) => a.or(b),
    }
}

/// Repetition smart constructor from a derived residual.
fn rep_star(
    p1: Option<RegexOp>,
    p2: ReChild,
    ret: Value,
    splice: bool,
    id: u64,
) -> Option<RegexOp> {
    let p1 = p1?;
    if let RegexOp::Accept(v) = p1 {
        return Some(RegexOp::Rep {
            p1: p2.clone(),
            p2,
            ret: conj(ret, v),
            splice,
            id,
        });
    }
    Some(RegexOp::Rep {
        p1: ReChild::from(p1),
        p2,
        ret,
        splice,
        id,
    })
}

fn deriv_child(c: &ReChild, x: &Value) -> Result<Option<RegexOp>, SpecError> {
    match resolve(c)? {
        Resolved::Op(op, _) => op_deriv(&op, x),
        Resolved::Leaf(spec) => {
            let r = spec.conform_val(x)?;
            Ok(if r.is_invalid() {
                None
            } else {
                Some(RegexOp::Accept(r))
            })
        }
    }
}

pub(crate) fn op_deriv(op: &RegexOp, x: &Value) -> Result<Option<RegexOp>, SpecError> {
    match op {
        RegexOp::Accept(_) => Ok(None),
        RegexOp::Pcat {
            ps,
            ks,
            ret,
            rep_plus,
        } => {
            let Some(p0) = ps.first() else {
                return Ok(None);
            };
            let k0 = ks.as_ref().and_then(|ks| ks.first());

            let branch1 = match deriv_child(p0, x)? {
                Some(d0) => {
                    let mut ps1: Vec<ReChild> = Vec::with_capacity(ps.len());
                    ps1.push(ReChild::from(d0));
                    ps1.extend(ps.iter().skip(1).cloned());
                    pcat_star(ps1, ks.clone(), ret.clone(), *rep_plus)
                }
                None => None,
            };

            let branch2 = if child_accept_nil(p0)? {
                let rest_ps: Vec<ReChild> = ps.iter().skip(1).cloned().collect();
                let rest_ks = ks.as_ref().map(|ks| ks.iter().skip(1).cloned().collect());
                let folded = add_ret(p0, ret.clone(), k0)?;
                match pcat_star(rest_ps, rest_ks, folded, *rep_plus) {
                    Some(rest) => op_deriv(&rest, x)?,
                    None => None,
                }
            } else {
                None
            };

            Ok(alt2(branch1, branch2))
        }
        RegexOp::Alt { ps, ks, id } => {
            let mut survivors = Vec::new();
            for (i, p) in ps.iter().enumerate() {
                if let Some(d) = deriv_child(p, x)? {
                    let k = ks.as_ref().and_then(|ks| ks.get(i)).cloned();
                    survivors.push((d, k));
                }
            }
            Ok(alt_star(survivors, ks.is_some(), *id))
        }
        RegexOp::Rep {
            p1,
            p2,
            ret,
            splice,
            id,
        } => {
            let branch1 = rep_star(deriv_child(p1, x)?, p2.clone(), ret.clone(), *splice, *id);
            let branch2 = if child_accept_nil(p1)? {
                let folded = add_ret(p1, ret.clone(), None)?;
                let restarted = RegexOp::Rep {
                    p1: p2.clone(),
                    p2: p2.clone(),
                    ret: folded,
                    splice: *splice,
                    id: *id,
                };
                op_deriv(&restarted, x)?
            } else {
                None
            };
            Ok(alt2(branch1, branch2))
        }
        RegexOp::Amp { p1, preds } => {
            let Some(d1) = deriv_child(p1, x)? else {
                return Ok(None);
            };
            if let RegexOp::Accept(v) = &d1 {
                let r = and_preds(v, preds)?;
                return Ok(if r.is_invalid() {
                    None
                } else {
                    Some(RegexOp::Accept(r))
                });
            }
            Ok(Some(RegexOp::Amp {
                p1: ReChild::from(d1),
                preds: preds.clone(),
            }))
        }
    }
}

// ---------------------------------------------------------------------------
// Conform / unform.

/// Fold derivatives over a finite sequence.
pub(crate) fn re_conform(op: &RegexOp, xs: &[Value]) -> Result<Value, SpecError> {
    let mut cur = op.clone();
    for x in xs {
        match op_deriv(&cur, x)? {
            Some(next) => cur = next,
            None => return Ok(Value::invalid()),
        }
    }
    if !op_accept_nil(&cur)? {
        return Ok(Value::invalid());
    }
    let ret = op_preturn(&cur)?;
    Ok(if ret.is_nil_ret() { Value::Nil } else { ret })
}

fn child_unform(c: &ReChild, v: &Value) -> Result<Vec<Value>, SpecError> {
    match resolve(c)? {
        Resolved::Op(op, _) => re_unform(&op, v),
        Resolved::Leaf(spec) => Ok(vec![spec.unform_val(v)?]),
    }
}

/// Rebuild the input sequence from a conformed result.
pub(crate) fn re_unform(op: &RegexOp, v: &Value) -> Result<Vec<Value>, SpecError> {
    match op {
        RegexOp::Accept(ret) => Ok(if ret.is_nil_ret() {
            vec![]
        } else {
            vec![ret.clone()]
        }),
        RegexOp::Pcat {
            ps,
            ks,
            rep_plus,
            ..
        } => {
            if *rep_plus {
                let Some(p0) = ps.first() else {
                    return Ok(vec![]);
                };
                let items = v.as_vector().unwrap_or(&[]).to_vec();
                let mut out = Vec::new();
                for item in &items {
                    out.extend(child_unform(p0, item)?);
                }
                return Ok(out);
            }
            match ks {
                Some(ks) => {
                    let Some(m) = v.as_map() else {
                        return Ok(vec![]);
                    };
                    let mut out = Vec::new();
                    for (k, p) in ks.iter().zip(ps) {
                        if let Some(val) = m.get(&Value::Keyword(k.clone())) {
                            out.extend(child_unform(p, val)?);
                        }
                    }
                    Ok(out)
                }
                None => {
                    let items = v.as_vector().unwrap_or(&[]);
                    let mut out = Vec::new();
                    for (p, item) in ps.iter().zip(items) {
                        out.extend(child_unform(p, item)?);
                    }
                    Ok(out)
                }
            }
        }
        RegexOp::Alt { ps, ks, .. } => match ks {
            Some(ks) => {
                let pair = v.as_vector().filter(|items| items.len() == 2);
                let Some([tag, val]) = pair.map(|items| [&items[0], &items[1]]) else {
                    return Ok(vec![]);
                };
                let Some(tag) = tag.as_keyword() else {
                    return Ok(vec![]);
                };
                for (k, p) in ks.iter().zip(ps) {
                    if k == tag {
                        return child_unform(p, val);
                    }
                }
                Ok(vec![])
            }
            None => {
                if v.is_nil() {
                    return Ok(vec![]);
                }
                for p in ps {
                    let is_accept = match resolve(p)? {
                        Resolved::Op(op, _) => matches!(&*op, RegexOp::Accept(_)),
                        Resolved::Leaf(_) => false,
                    };
                    if !is_accept {
                        return child_unform(p, v);
                    }
                }
                Ok(vec![])
            }
        },
        RegexOp::Rep { p2, .. } => {
            let items = v.as_vector().unwrap_or(&[]).to_vec();
            let mut out = Vec::new();
            for item in &items {
                out.extend(child_unform(p2, item)?);
            }
            Ok(out)
        }
        RegexOp::Amp { p1, .. } => child_unform(p1, v),
    }
}

// ---------------------------------------------------------------------------
// Explanation.

fn insufficient(
    path: &[PathSeg],
    pred: String,
    via: &[Keyword],
    in_: &[PathSeg],
    out: &mut Vec<Problem>,
) {
    out.push(
        Problem::new(path.to_vec(), pred, Value::Vector(vec![]), via.to_vec(), in_.to_vec())
            .with_reason("Insufficient input"),
    );
}

fn child_explain(
    c: &ReChild,
    path: &[PathSeg],
    via: &[Keyword],
    in_: &[PathSeg],
    input: &[Value],
    out: &mut Vec<Problem>,
) -> Result<(), SpecError> {
    match resolve(c)? {
        Resolved::Leaf(spec) => {
            if input.is_empty() {
                insufficient(path, spec.describe(), via, in_, out);
                return Ok(());
            }
            let via = via_conj(via, spec.name());
            spec.explain_val(path, &via, in_, &input[0], out)
        }
        Resolved::Op(op, name) => {
            let via = via_conj(via, name.as_ref());
            op_explain(&op, path, &via, in_, input, out)
        }
    }
}

fn op_explain(
    op: &RegexOp,
    path: &[PathSeg],
    via: &[Keyword],
    in_: &[PathSeg],
    input: &[Value],
    out: &mut Vec<Problem>,
) -> Result<(), SpecError> {
    match op {
        RegexOp::Accept(_) => Ok(()),
        RegexOp::Amp { p1, preds } => {
            if input.is_empty() {
                if child_accept_nil(p1)? {
                    let pret = child_preturn(p1)?;
                    return explain_pred_list(preds, path, via, in_, &pret, out);
                }
                child_explain(p1, path, via, in_, input, out)
            } else {
                match deriv_child(p1, &input[0])? {
                    Some(d1) => {
                        let pret = op_preturn(&d1)?;
                        explain_pred_list(preds, path, via, in_, &pret, out)
                    }
                    None => child_explain(p1, path, via, in_, input, out),
                }
            }
        }
        RegexOp::Pcat { ps, ks, .. } => {
            // Blame the first child that cannot match empty (or the only
            // child).
            let mut blamed: Option<(usize, &ReChild)> = None;
            if ps.len() == 1 {
                blamed = Some((0, &ps[0]));
            } else {
                for (i, p) in ps.iter().enumerate() {
                    if !child_accept_nil(p)? {
                        blamed = Some((i, p));
                        break;
                    }
                }
            }
            let k = blamed
                .and_then(|(i, _)| ks.as_ref().and_then(|ks| ks.get(i)))
                .cloned();
            let path = match k {
                Some(k) => path_conj(path, k),
                None => path.to_vec(),
            };
            match blamed {
                None => {
                    if input.is_empty() {
                        insufficient(&path, describe_op(op), via, in_, out);
                    }
                    Ok(())
                }
                Some((_, p)) => child_explain(p, &path, via, in_, input, out),
            }
        }
        RegexOp::Alt { ps, ks, .. } => {
            if input.is_empty() {
                insufficient(path, describe_op(op), via, in_, out);
                return Ok(());
            }
            for (i, p) in ps.iter().enumerate() {
                let k = ks.as_ref().and_then(|ks| ks.get(i));
                let path = match k {
                    Some(k) => path_conj(path, k.clone()),
                    None => path.to_vec(),
                };
                child_explain(p, &path, via, in_, input, out)?;
            }
            Ok(())
        }
        RegexOp::Rep { p1, .. } => child_explain(p1, path, via, in_, input, out),
    }
}

fn explain_pred_list(
    preds: &[SpecRef],
    path: &[PathSeg],
    via: &[Keyword],
    in_: &[PathSeg],
    x: &Value,
    out: &mut Vec<Problem>,
) -> Result<(), SpecError> {
    let mut cur = x.clone();
    for p in preds {
        let r = conform_ref(p, &cur)?;
        if r.is_invalid() {
            return explain_ref(p, path, via, in_, &cur, out);
        }
        cur = r;
    }
    Ok(())
}

/// Walk the sequence, tracking the derivative; explain the first dead or
/// unfinished state.
pub(crate) fn re_explain(
    path: &[PathSeg],
    via: &[Keyword],
    in_: &[PathSeg],
    op: &RegexOp,
    xs: &[Value],
    out: &mut Vec<Problem>,
) -> Result<(), SpecError> {
    let mut cur = op.clone();
    let mut i = 0;
    while i < xs.len() {
        match op_deriv(&cur, &xs[i])? {
            Some(next) => {
                cur = next;
                i += 1;
            }
            None => {
                let remaining = Value::Vector(xs[i..].to_vec());
                if matches!(cur, RegexOp::Accept(_)) {
                    out.push(
                        Problem::new(
                            path.to_vec(),
                            describe_op(op),
                            remaining,
                            via.to_vec(),
                            in_.to_vec(),
                        )
                        .with_reason("Extra input"),
                    );
                    return Ok(());
                }
                let before = out.len();
                op_explain(&cur, path, via, &path_conj(in_, i), &xs[i..], out)?;
                if out.len() == before {
                    out.push(
                        Problem::new(
                            path.to_vec(),
                            describe_op(&cur),
                            remaining,
                            via.to_vec(),
                            in_.to_vec(),
                        )
                        .with_reason("Extra input"),
                    );
                }
                return Ok(());
            }
        }
    }
    if op_accept_nil(&cur)? {
        return Ok(());
    }
    op_explain(&cur, path, via, in_, &[], out)
}

// ---------------------------------------------------------------------------
// Generation.

fn child_gen(
    c: &ReChild,
    overrides: &Overrides,
    path: &[PathSeg],
    rmap: &RMap,
) -> Result<Gen, SpecError> {
    match resolve(c)? {
        Resolved::Op(op, name) => {
            let rmap = match name {
                Some(n) => rmap_enter(rmap, RecKey::Name(n.clone())).ok_or_else(|| {
                    SpecError::NoGen {
                        path: path.to_vec(),
                        spec: format!("{n} (recursion limit reached)"),
                    }
                })?,
                None => rmap.clone(),
            };
            re_gen(&op, overrides, path, &rmap)
        }
        Resolved::Leaf(_) => {
            let ReChild::Spec(sref) = c else {
                unreachable!("leaf children are spec refs");
            };
            Ok(gensub(sref, overrides, path, rmap)?.fmap(|v| Value::Vector(vec![v])))
        }
    }
}

/// Sequence generator for a regex op; yields vectors of elements.
pub(crate) fn re_gen(
    op: &RegexOp,
    overrides: &Overrides,
    path: &[PathSeg],
    rmap: &RMap,
) -> Result<Gen, SpecError> {
    match op {
        RegexOp::Accept(v) => Ok(Gen::constant(if v.is_nil_ret() {
            Value::Vector(vec![])
        } else {
            Value::Vector(vec![v.clone()])
        })),
        RegexOp::Pcat { ps, ks, .. } => {
            let mut gens = Vec::with_capacity(ps.len());
            for (i, p) in ps.iter().enumerate() {
                let sub_path = match ks.as_ref().and_then(|ks| ks.get(i)) {
                    Some(k) => path_conj(path, k.clone()),
                    None => path.to_vec(),
                };
                gens.push(child_gen(p, overrides, &sub_path, rmap)?);
            }
            Ok(Gen::new(move |rand| {
                let mut items = Vec::new();
                for g in &gens {
                    match g.sample(rand)? {
                        Value::Vector(part) => items.extend(part),
                        other => items.push(other),
                    }
                }
                Ok(Value::Vector(items))
            }))
        }
        RegexOp::Alt { ps, ks, id } => {
            let rmap = rmap_enter(rmap, RecKey::Id(*id)).ok_or_else(|| SpecError::NoGen {
                path: path.to_vec(),
                spec: describe_op(op),
            })?;
            let mut gens = Vec::new();
            for (i, p) in ps.iter().enumerate() {
                let sub_path = match ks.as_ref().and_then(|ks| ks.get(i)) {
                    Some(k) => path_conj(path, k.clone()),
                    None => path.to_vec(),
                };
                if let Ok(g) = child_gen(p, overrides, &sub_path, &rmap) {
                    gens.push(g);
                }
            }
            if gens.is_empty() {
                return Err(SpecError::NoGen {
                    path: path.to_vec(),
                    spec: describe_op(op),
                });
            }
            Ok(Gen::one_of(gens))
        }
        RegexOp::Rep { p2, id, .. } => match rmap_enter(rmap, RecKey::Id(*id)) {
            None => Ok(Gen::constant(Value::Vector(vec![]))),
            Some(rmap) => {
                let elem = child_gen(p2, overrides, path, &rmap)?;
                Ok(Gen::new(move |rand| {
                    let n = rand.size(config::GEN_MAX_DEFAULT);
                    let mut items = Vec::new();
                    for _ in 0..n {
                        match elem.sample(rand)? {
                            Value::Vector(part) => items.extend(part),
                            other => items.push(other),
                        }
                    }
                    Ok(Value::Vector(items))
                }))
            }
        },
        RegexOp::Amp { p1, preds } => {
            let inner = child_gen(p1, overrides, path, rmap)?;
            let p1 = p1.clone();
            let preds = preds.clone();
            let what = describe_op(op);
            Ok(Gen::new(move |rand| {
                for _ in 0..config::fspec_iterations() {
                    let candidate = inner.sample(rand)?;
                    let xs = candidate.as_vector().unwrap_or(&[]);
                    let matched = match resolve(&p1)? {
                        Resolved::Op(op, _) => re_conform(&op, xs)?,
                        Resolved::Leaf(spec) => match xs {
                            [only] => spec.conform_val(only)?,
                            _ => Value::invalid(),
                        },
                    };
                    if matched.is_invalid() {
                        continue;
                    }
                    if !and_preds(&matched, &preds)?.is_invalid() {
                        return Ok(candidate);
                    }
                }
                Err(SpecError::NoGen {
                    path: vec![],
                    spec: what.clone(),
                })
            }))
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering.

pub(crate) fn describe_child(c: &ReChild) -> String {
    match c {
        ReChild::Op(op) => describe_op(op),
        ReChild::Spec(sref) => sref.describe(),
    }
}

pub(crate) fn describe_op(op: &RegexOp) -> String {
    match op {
        RegexOp::Accept(v) => {
            if v.is_nil_ret() {
                "(accept)".to_string()
            } else {
                format!("(accept {v})")
            }
        }
        RegexOp::Pcat {
            ps, ks, rep_plus, ..
        } => {
            if *rep_plus {
                return format!("(+ {})", describe_child(&ps[0]));
            }
            match ks {
                Some(ks) => {
                    let body: Vec<String> = ks
                        .iter()
                        .zip(ps)
                        .map(|(k, p)| format!("{k} {}", describe_child(p)))
                        .collect();
                    format!("(cat {})", body.join(" "))
                }
                None => {
                    let body: Vec<String> = ps.iter().map(describe_child).collect();
                    format!("(cat {})", body.join(" "))
                }
            }
        }
        RegexOp::Alt { ps, ks, .. } => match ks {
            Some(ks) => {
                let body: Vec<String> = ks
                    .iter()
                    .zip(ps)
                    .map(|(k, p)| format!("{k} {}", describe_child(p)))
                    .collect();
                format!("(alt {})", body.join(" "))
            }
            None => {
                if ps.len() == 2 {
                    if let ReChild::Op(op) = &ps[1] {
                        if matches!(&**op, RegexOp::Accept(v) if v.is_nil_ret()) {
                            return format!("(? {})", describe_child(&ps[0]));
                        }
                    }
                }
                let body: Vec<String> = ps.iter().map(describe_child).collect();
                format!("(alt {})", body.join(" "))
            }
        },
        RegexOp::Rep { p2, .. } => format!("(* {})", describe_child(p2)),
        RegexOp::Amp { p1, preds } => {
            let body: Vec<String> = preds.iter().map(|p| p.describe()).collect();
            format!("(& {} {})", describe_child(p1), body.join(" "))
        }
    }
}
