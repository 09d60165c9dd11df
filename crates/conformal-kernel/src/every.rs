//! Collection specs: sampled membership (`every`) and exhaustive
//! conformance (`coll_of` / `map_of` / `hash_of`).
//!
//! Sampling mode checks at most `coll_check_limit` elements and never
//! rebuilds the container; exhaustive mode conforms every element and
//! rebuilds a container of the input kind (or the `into` target).

use std::collections::{BTreeMap, BTreeSet};

use crate::config;
use crate::error::SpecError;
use crate::explain::{path_conj, PathSeg, Problem};
use crate::gen::{gensub, Gen, Overrides, RMap};
use crate::spec::{conform_ref, explain_ref, tuple, unform_ref, Spec, SpecKind, SpecRef};
use crate::value::{Keyword, Value};

/// Container target for rebuilt collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntoKind {
    Vector,
    Map,
    Set,
}

/// The enumerated options of collection specs. Anything not expressible
/// here is not an option.
#[derive(Clone, Default)]
pub struct EveryOpts {
    /// Container-type predicate checked before membership.
    pub kind: Option<SpecRef>,
    /// Exact element count.
    pub count: Option<usize>,
    /// Inclusive lower bound.
    pub min_count: Option<usize>,
    /// Inclusive upper bound.
    pub max_count: Option<usize>,
    /// Pairwise inequality of elements.
    pub distinct: bool,
    /// Rebuild target for exhaustive conformance.
    pub into: Option<IntoKind>,
    /// Generation size cap (defaults to [`config::GEN_MAX_DEFAULT`]).
    pub gen_max: Option<usize>,
    /// Replacement generator.
    pub gen: Option<Gen>,
}

#[derive(Clone)]
pub struct EverySpec {
    elem: SpecRef,
    conform_all: bool,
    /// Map-entry mode: elements are `[k v]` pairs and the container must be
    /// associative.
    entries: bool,
    kind: Option<SpecRef>,
    count: Option<usize>,
    min_count: Option<usize>,
    max_count: Option<usize>,
    distinct: bool,
    into: Option<IntoKind>,
    gen_max: usize,
}

impl EverySpec {
    pub(crate) fn describe(&self) -> String {
        let head = match (self.entries, self.conform_all) {
            (true, _) => "map-of",
            (false, true) => "coll-of",
            (false, false) => "every",
        };
        format!("({head} {})", self.elem.describe())
    }
}

fn build(elem: SpecRef, conform_all: bool, entries: bool, mut opts: EveryOpts) -> Spec {
    let gen = opts.gen.take();
    let every = EverySpec {
        elem,
        conform_all,
        entries,
        kind: opts.kind,
        count: opts.count,
        min_count: opts.min_count,
        max_count: opts.max_count,
        distinct: opts.distinct,
        into: opts.into,
        gen_max: opts.gen_max.unwrap_or(config::GEN_MAX_DEFAULT),
    };
    let spec = Spec::from_kind(SpecKind::Every(every));
    match gen {
        Some(g) => spec.with_gen(g),
        None => spec,
    }
}

/// Sampled membership check; does not rebuild the container.
pub fn every(elem: impl Into<SpecRef>, opts: EveryOpts) -> Spec {
    build(elem.into(), false, false, opts)
}

/// Exhaustive elementwise conformance.
pub fn coll_of(elem: impl Into<SpecRef>, opts: EveryOpts) -> Spec {
    build(elem.into(), true, false, opts)
}

/// Exhaustive conformance of map entries as `[k v]` tuples.
pub fn map_of(
    kpred: impl Into<SpecRef>,
    vpred: impl Into<SpecRef>,
    mut opts: EveryOpts,
) -> Spec {
    let entry = tuple(vec![kpred.into(), vpred.into()]);
    if opts.into.is_none() {
        opts.into = Some(IntoKind::Map);
    }
    build(SpecRef::from(entry), true, true, opts)
}

/// Associative-kind alias of [`map_of`].
pub fn hash_of(
    kpred: impl Into<SpecRef>,
    vpred: impl Into<SpecRef>,
    opts: EveryOpts,
) -> Spec {
    map_of(kpred, vpred, opts)
}

/// Element stream with value-position segments: indexes for vectors, the
/// element for sets, the key (entry as `[k v]`) for maps.
fn elements(v: &Value) -> Option<Vec<(PathSeg, Value)>> {
    match v {
        Value::Vector(items) => Some(
            items
                .iter()
                .enumerate()
                .map(|(i, e)| (PathSeg::Index(i), e.clone()))
                .collect(),
        ),
        Value::Set(items) => Some(
            items
                .iter()
                .map(|e| (PathSeg::Val(e.clone()), e.clone()))
                .collect(),
        ),
        Value::Map(m) => Some(
            m.iter()
                .map(|(k, val)| {
                    (
                        PathSeg::Val(k.clone()),
                        Value::vector([k.clone(), val.clone()]),
                    )
                })
                .collect(),
        ),
        _ => None,
    }
}

/// Container-shape and size checks shared by conform and explain. Returns
/// the elements when the shape is acceptable.
enum ShapeCheck {
    BadKind(String),
    BadCount { pred: String },
    NotDistinct,
    Ok(Vec<(PathSeg, Value)>),
}

fn check_shape(e: &EverySpec, v: &Value) -> Result<ShapeCheck, SpecError> {
    if e.entries && !matches!(v, Value::Map(_)) {
        return Ok(ShapeCheck::BadKind("map".to_string()));
    }
    if let Some(kind) = &e.kind {
        if conform_ref(kind, v)?.is_invalid() {
            return Ok(ShapeCheck::BadKind(kind.describe()));
        }
    }
    let Some(elems) = elements(v) else {
        return Ok(ShapeCheck::BadKind("collection".to_string()));
    };
    let len = elems.len();
    if let Some(count) = e.count {
        if len != count {
            return Ok(ShapeCheck::BadCount {
                pred: format!("(count = {count})"),
            });
        }
    }
    if e.min_count.map(|min| len < min).unwrap_or(false)
        || e.max_count.map(|max| len > max).unwrap_or(false)
    {
        return Ok(ShapeCheck::BadCount {
            pred: format!(
                "(count-between {} {})",
                e.min_count.map_or("0".to_string(), |n| n.to_string()),
                e.max_count.map_or("inf".to_string(), |n| n.to_string()),
            ),
        });
    }
    if e.distinct {
        let uniq: BTreeSet<&Value> = elems.iter().map(|(_, e)| e).collect();
        if uniq.len() != len {
            return Ok(ShapeCheck::NotDistinct);
        }
    }
    Ok(ShapeCheck::Ok(elems))
}

fn rebuild(e: &EverySpec, input: &Value, conformed: Vec<Value>) -> Value {
    let target = e.into.unwrap_or(match input {
        Value::Set(_) => IntoKind::Set,
        Value::Map(_) => IntoKind::Map,
        _ => IntoKind::Vector,
    });
    match target {
        IntoKind::Vector => Value::Vector(conformed),
        IntoKind::Set => Value::Set(conformed.into_iter().collect()),
        IntoKind::Map => {
            let mut m = BTreeMap::new();
            for pair in conformed {
                match pair.as_vector() {
                    Some([k, v]) => {
                        m.insert(k.clone(), v.clone());
                    }
                    _ => return Value::invalid(),
                }
            }
            Value::Map(m)
        }
    }
}

pub(crate) fn conform(e: &EverySpec, v: &Value) -> Result<Value, SpecError> {
    let elems = match check_shape(e, v)? {
        ShapeCheck::Ok(elems) => elems,
        _ => return Ok(Value::invalid()),
    };
    if e.conform_all {
        let mut out = Vec::with_capacity(elems.len());
        for (_, elem) in &elems {
            let r = conform_ref(&e.elem, elem)?;
            if r.is_invalid() {
                return Ok(Value::invalid());
            }
            out.push(r);
        }
        Ok(rebuild(e, v, out))
    } else {
        for (_, elem) in elems.iter().take(config::coll_check_limit()) {
            if conform_ref(&e.elem, elem)?.is_invalid() {
                return Ok(Value::invalid());
            }
        }
        Ok(v.clone())
    }
}

pub(crate) fn unform(e: &EverySpec, v: &Value) -> Result<Value, SpecError> {
    if !e.conform_all {
        return Ok(v.clone());
    }
    let Some(elems) = elements(v) else {
        return Ok(v.clone());
    };
    let unformed: Result<Vec<Value>, SpecError> = elems
        .iter()
        .map(|(_, elem)| unform_ref(&e.elem, elem))
        .collect();
    Ok(rebuild(e, v, unformed?))
}

pub(crate) fn explain(
    e: &EverySpec,
    path: &[PathSeg],
    via: &[Keyword],
    in_: &[PathSeg],
    v: &Value,
    out: &mut Vec<Problem>,
) -> Result<(), SpecError> {
    let elems = match check_shape(e, v)? {
        ShapeCheck::BadKind(pred) => {
            out.push(Problem::new(
                path.to_vec(),
                pred,
                v.clone(),
                via.to_vec(),
                in_.to_vec(),
            ));
            return Ok(());
        }
        ShapeCheck::BadCount { pred } => {
            out.push(Problem::new(
                path.to_vec(),
                pred,
                v.clone(),
                via.to_vec(),
                in_.to_vec(),
            ));
            return Ok(());
        }
        ShapeCheck::NotDistinct => {
            out.push(Problem::new(
                path.to_vec(),
                "distinct",
                v.clone(),
                via.to_vec(),
                in_.to_vec(),
            ));
            return Ok(());
        }
        ShapeCheck::Ok(elems) => elems,
    };

    let scan = if e.conform_all {
        elems.len()
    } else {
        config::coll_check_limit()
    };
    let budget = config::coll_error_limit();
    let before = out.len();
    for (seg, elem) in elems.into_iter().take(scan) {
        if out.len() - before >= budget {
            break;
        }
        if conform_ref(&e.elem, &elem)?.is_invalid() {
            let in_elem = path_conj(in_, seg);
            explain_ref(&e.elem, path, via, &in_elem, &elem, out)?;
        }
    }
    Ok(())
}

pub(crate) fn gen(
    e: &EverySpec,
    overrides: &Overrides,
    path: &[PathSeg],
    rmap: &RMap,
) -> Result<Gen, SpecError> {
    let elem = gensub(&e.elem, overrides, path, rmap)?;
    let lo = e.count.or(e.min_count).unwrap_or(0);
    let hi = e.count.or(e.max_count).unwrap_or(e.gen_max.max(lo));
    let base = Gen::vector_of(elem, lo, hi);
    let base = if e.distinct {
        base.such_that(
            |v| {
                let items = v.as_vector().unwrap_or(&[]);
                let uniq: BTreeSet<&Value> = items.iter().collect();
                Ok(uniq.len() == items.len())
            },
            e.describe(),
        )
    } else {
        base
    };
    let target = e.into.or(if e.entries { Some(IntoKind::Map) } else { None });
    Ok(match target {
        None | Some(IntoKind::Vector) => base,
        Some(IntoKind::Set) => base.fmap(|v| match v {
            Value::Vector(items) => Value::Set(items.into_iter().collect()),
            other => other,
        }),
        Some(IntoKind::Map) => base.fmap(|v| match v {
            Value::Vector(items) => {
                let mut m = BTreeMap::new();
                for pair in items {
                    if let Some([k, val]) = pair.as_vector().map(|p| [&p[0], &p[1]]) {
                        m.insert(k.clone(), val.clone());
                    }
                }
                Value::Map(m)
            }
            other => other,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{conform, explain_data, valid};
    use crate::value::ValueKind;

    fn ints(items: impl IntoIterator<Item = i64>) -> Value {
        Value::vector(items.into_iter().map(Value::Int))
    }

    #[test]
    fn coll_of_is_exhaustive() {
        let s = coll_of(ValueKind::Int, EveryOpts::default());
        assert_eq!(conform(s, &ints([1, 2, 3])).unwrap(), ints([1, 2, 3]));
        let s = coll_of(ValueKind::Int, EveryOpts::default());
        assert!(conform(s, &Value::vector([Value::from(1), Value::from("x")]))
            .unwrap()
            .is_invalid());
    }

    #[test]
    fn every_samples_at_most_the_check_limit() {
        // A large input whose bad element sits past the sampling window.
        let mut items: Vec<Value> = (0..500).map(|i| Value::Int(i)).collect();
        items.push(Value::from("bad"));
        let s = every(ValueKind::Int, EveryOpts::default());
        assert!(valid(s, &Value::Vector(items.clone())).unwrap());
        // The same input fails the exhaustive form.
        let s = coll_of(ValueKind::Int, EveryOpts::default());
        assert!(!valid(s, &Value::Vector(items)).unwrap());
    }

    #[test]
    fn count_bounds_are_inclusive() {
        let opts = || EveryOpts {
            min_count: Some(2),
            max_count: Some(3),
            ..EveryOpts::default()
        };
        assert!(valid(coll_of(ValueKind::Int, opts()), &ints([1, 2])).unwrap());
        assert!(valid(coll_of(ValueKind::Int, opts()), &ints([1, 2, 3])).unwrap());
        assert!(!valid(coll_of(ValueKind::Int, opts()), &ints([1])).unwrap());
        assert!(!valid(coll_of(ValueKind::Int, opts()), &ints([1, 2, 3, 4])).unwrap());
    }

    #[test]
    fn distinct_rejects_duplicates() {
        let opts = EveryOpts {
            distinct: true,
            ..EveryOpts::default()
        };
        let s = coll_of(ValueKind::Int, opts);
        assert!(!valid(s, &ints([1, 2, 1])).unwrap());
    }

    #[test]
    fn into_set_rebuilds_container() {
        let opts = EveryOpts {
            into: Some(IntoKind::Set),
            ..EveryOpts::default()
        };
        let s = coll_of(ValueKind::Int, opts);
        assert_eq!(
            conform(s, &ints([2, 1, 2])).unwrap(),
            Value::set([Value::from(1), Value::from(2)])
        );
    }

    #[test]
    fn map_of_conforms_entries_and_reports_by_key() {
        let s = map_of(ValueKind::Keyword, ValueKind::Int, EveryOpts::default());
        let good = Value::map([
            (Value::from(crate::value::kw("a")), Value::from(1)),
            (Value::from(crate::value::kw("b")), Value::from(2)),
        ]);
        assert_eq!(conform(&SpecRef::from(s.clone()) as &SpecRef, &good).unwrap(), good);

        let bad = Value::map([(Value::from(crate::value::kw("a")), Value::from("one"))]);
        let expl = explain_data(s, &bad).unwrap().expect("explanation");
        assert_eq!(expl.problems.len(), 1);
        assert_eq!(
            expl.problems[0].in_,
            vec![
                PathSeg::Val(Value::from(crate::value::kw("a"))),
                PathSeg::Index(1)
            ]
        );
        assert_eq!(expl.problems[0].pred, "int");
    }

    #[test]
    fn map_of_rejects_non_maps() {
        let s = map_of(ValueKind::Keyword, ValueKind::Int, EveryOpts::default());
        assert!(!valid(s, &ints([1])).unwrap());
    }

    #[test]
    fn explain_caps_problem_count() {
        let _guard = crate::registry::test_guard();
        config::set_coll_error_limit(3);
        let items: Vec<Value> = (0..10).map(|_| Value::from("bad")).collect();
        let s = coll_of(ValueKind::Int, EveryOpts::default());
        let expl = explain_data(s, &Value::Vector(items))
            .unwrap()
            .expect("explanation");
        assert_eq!(expl.problems.len(), 3);
        config::set_coll_error_limit(config::COLL_ERROR_LIMIT_DEFAULT);
    }

    #[test]
    fn generation_respects_count_and_shape() {
        let opts = EveryOpts {
            count: Some(3),
            ..EveryOpts::default()
        };
        let s = coll_of(ValueKind::Int, opts);
        let g = crate::gen::gen_with(&SpecRef::from(s), &Overrides::new()).expect("gen");
        for seed in 0..10 {
            let v = g.sample_seeded(seed).expect("sample");
            assert_eq!(v.as_vector().expect("vector").len(), 3);
        }
    }
}
