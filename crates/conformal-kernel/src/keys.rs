//! Map specs: key presence expressions and registered-key value checks.
//!
//! A keys spec owns no value specs: every key's value spec is whatever the
//! registry holds under the key's fully-qualified name. Presence
//! requirements are boolean expression trees over qualified names; the
//! `_un` lists match on the local part while still consulting the registry
//! under the full name.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use conformal_rand::Rand;

use crate::error::SpecError;
use crate::explain::{path_conj, via_conj, PathSeg, Problem};
use crate::gen::{gensub, Gen, Overrides, RMap};
use crate::registry;
use crate::spec::{conform_ref, explain_ref, Spec, SpecKind, SpecRef};
use crate::value::{Keyword, Value};

/// Boolean key-presence expression: leaves are qualified names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyExpr {
    Leaf(Keyword),
    And(Vec<KeyExpr>),
    Or(Vec<KeyExpr>),
}

impl KeyExpr {
    pub fn leaves(&self) -> Vec<&Keyword> {
        match self {
            KeyExpr::Leaf(k) => vec![k],
            KeyExpr::And(es) | KeyExpr::Or(es) => es.iter().flat_map(KeyExpr::leaves).collect(),
        }
    }

    fn satisfied(&self, present: &BTreeSet<Keyword>, un: bool) -> bool {
        match self {
            KeyExpr::Leaf(k) => {
                if un {
                    present.contains(&k.unqualified())
                } else {
                    present.contains(k)
                }
            }
            KeyExpr::And(es) => es.iter().all(|e| e.satisfied(present, un)),
            KeyExpr::Or(es) => es.iter().any(|e| e.satisfied(present, un)),
        }
    }

    /// The expression a failure problem cites: `and` flattens to its first
    /// unsatisfied child, `or` is reported whole.
    fn first_failure(&self, present: &BTreeSet<Keyword>, un: bool) -> Option<&KeyExpr> {
        match self {
            KeyExpr::Leaf(_) => (!self.satisfied(present, un)).then_some(self),
            KeyExpr::And(es) => es.iter().find_map(|e| e.first_failure(present, un)),
            KeyExpr::Or(_) => (!self.satisfied(present, un)).then_some(self),
        }
    }

    fn render(&self, un: bool) -> String {
        match self {
            KeyExpr::Leaf(k) => {
                if un {
                    k.unqualified().to_string()
                } else {
                    k.to_string()
                }
            }
            KeyExpr::And(es) => {
                let body: Vec<String> = es.iter().map(|e| e.render(un)).collect();
                format!("(and {})", body.join(" "))
            }
            KeyExpr::Or(es) => {
                let body: Vec<String> = es.iter().map(|e| e.render(un)).collect();
                format!("(or {})", body.join(" "))
            }
        }
    }
}

impl fmt::Display for KeyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render(false))
    }
}

impl From<Keyword> for KeyExpr {
    fn from(k: Keyword) -> Self {
        KeyExpr::Leaf(k)
    }
}

/// Conjunction of presence requirements.
pub fn and_keys(exprs: Vec<KeyExpr>) -> KeyExpr {
    KeyExpr::And(exprs)
}

/// Disjunction of presence requirements.
pub fn or_keys(exprs: Vec<KeyExpr>) -> KeyExpr {
    KeyExpr::Or(exprs)
}

#[derive(Clone)]
pub struct KeysSpec {
    req: Vec<KeyExpr>,
    opt: Vec<KeyExpr>,
    req_un: Vec<KeyExpr>,
    opt_un: Vec<KeyExpr>,
    /// Local name -> qualified registry name, for `_un` value lookup.
    un_lookup: BTreeMap<String, Keyword>,
}

impl KeysSpec {
    pub(crate) fn describe(&self) -> String {
        let part = |label: &str, exprs: &[KeyExpr], un: bool| {
            if exprs.is_empty() {
                return None;
            }
            let body: Vec<String> = exprs.iter().map(|e| e.render(un)).collect();
            Some(format!("{label} [{}]", body.join(" ")))
        };
        let parts: Vec<String> = [
            part(":req", &self.req, false),
            part(":opt", &self.opt, false),
            part(":req-un", &self.req_un, true),
            part(":opt-un", &self.opt_un, true),
        ]
        .into_iter()
        .flatten()
        .collect();
        format!("(keys {})", parts.join(" "))
    }
}

/// Build a keys spec. Every leaf of every expression must be qualified.
pub fn keys(
    req: Vec<KeyExpr>,
    opt: Vec<KeyExpr>,
    req_un: Vec<KeyExpr>,
    opt_un: Vec<KeyExpr>,
) -> Result<Spec, SpecError> {
    for expr in req.iter().chain(&opt).chain(&req_un).chain(&opt_un) {
        for leaf in expr.leaves() {
            if !leaf.is_qualified() {
                return Err(SpecError::InvalidSpec(format!(
                    "keys expressions take qualified names, got {leaf}"
                )));
            }
        }
    }
    let mut un_lookup = BTreeMap::new();
    for expr in req_un.iter().chain(&opt_un) {
        for leaf in expr.leaves() {
            un_lookup.insert(leaf.name().to_string(), leaf.clone());
        }
    }
    Ok(Spec::from_kind(SpecKind::Keys(KeysSpec {
        req,
        opt,
        req_un,
        opt_un,
        un_lookup,
    })))
}

/// Conform against each component and combine conformed maps, last wins.
pub fn merge(specs: Vec<SpecRef>) -> Spec {
    Spec::from_kind(SpecKind::Merge(specs))
}

fn present_keys(m: &BTreeMap<Value, Value>) -> BTreeSet<Keyword> {
    m.keys()
        .filter_map(|k| k.as_keyword().cloned())
        .collect()
}

/// The registered value spec for a map key, if any.
fn value_spec(k: &KeysSpec, key: &Keyword) -> Result<Option<Arc<Spec>>, SpecError> {
    let lookup_name = if key.is_qualified() {
        Some(key.clone())
    } else {
        k.un_lookup.get(key.name()).cloned()
    };
    let Some(name) = lookup_name else {
        return Ok(None);
    };
    registry::lookup(&name)
}

fn presence_ok(k: &KeysSpec, present: &BTreeSet<Keyword>) -> bool {
    k.req.iter().all(|e| e.satisfied(present, false))
        && k.req_un.iter().all(|e| e.satisfied(present, true))
}

pub(crate) fn conform(k: &KeysSpec, v: &Value) -> Result<Value, SpecError> {
    let Some(m) = v.as_map() else {
        return Ok(Value::invalid());
    };
    if !presence_ok(k, &present_keys(m)) {
        return Ok(Value::invalid());
    }
    let mut out = BTreeMap::new();
    for (key, val) in m {
        let conformed = match key.as_keyword() {
            Some(kk) => match value_spec(k, kk)? {
                Some(spec) => {
                    let r = spec.conform_val(val)?;
                    if r.is_invalid() {
                        return Ok(Value::invalid());
                    }
                    r
                }
                None => val.clone(),
            },
            None => val.clone(),
        };
        out.insert(key.clone(), conformed);
    }
    Ok(Value::Map(out))
}

pub(crate) fn unform(k: &KeysSpec, v: &Value) -> Result<Value, SpecError> {
    let Some(m) = v.as_map() else {
        return Ok(v.clone());
    };
    let mut out = BTreeMap::new();
    for (key, val) in m {
        let unformed = match key.as_keyword() {
            Some(kk) => match value_spec(k, kk)? {
                Some(spec) => spec.unform_val(val)?,
                None => val.clone(),
            },
            None => val.clone(),
        };
        out.insert(key.clone(), unformed);
    }
    Ok(Value::Map(out))
}

pub(crate) fn explain(
    k: &KeysSpec,
    path: &[PathSeg],
    via: &[Keyword],
    in_: &[PathSeg],
    v: &Value,
    out: &mut Vec<Problem>,
) -> Result<(), SpecError> {
    let Some(m) = v.as_map() else {
        out.push(Problem::new(
            path.to_vec(),
            "map",
            v.clone(),
            via.to_vec(),
            in_.to_vec(),
        ));
        return Ok(());
    };
    let present = present_keys(m);

    // Presence problems first, in declaration order.
    for (exprs, un) in [(&k.req, false), (&k.req_un, true)] {
        for expr in exprs.iter() {
            if let Some(missing) = expr.first_failure(&present, un) {
                out.push(Problem::new(
                    path.to_vec(),
                    format!("(key? {})", missing.render(un)),
                    v.clone(),
                    via.to_vec(),
                    in_.to_vec(),
                ));
            }
        }
    }

    // Then value problems for present registered keys.
    for (key, val) in m {
        let Some(kk) = key.as_keyword() else {
            continue;
        };
        let Some(spec) = value_spec(k, kk)? else {
            continue;
        };
        if spec.conform_val(val)?.is_invalid() {
            let via = via_conj(via, spec.name());
            spec.explain_val(
                &path_conj(path, kk.clone()),
                &via,
                &path_conj(in_, kk.clone()),
                val,
                out,
            )?;
        }
    }
    Ok(())
}

/// Pick the keys an expression requires: `and` takes all branches, `or`
/// takes one at random.
fn choose_keys<'a>(expr: &'a KeyExpr, rand: &mut dyn Rand, out: &mut Vec<&'a Keyword>) {
    match expr {
        KeyExpr::Leaf(k) => out.push(k),
        KeyExpr::And(es) => {
            for e in es {
                choose_keys(e, rand, out);
            }
        }
        KeyExpr::Or(es) => {
            if !es.is_empty() {
                choose_keys(&es[rand.index(es.len())], rand, out);
            }
        }
    }
}

pub(crate) fn gen(
    k: &KeysSpec,
    overrides: &Overrides,
    path: &[PathSeg],
    rmap: &RMap,
) -> Result<Gen, SpecError> {
    // Required keys must generate; optional keys are dropped when they
    // cannot.
    let mut gens: BTreeMap<Keyword, Gen> = BTreeMap::new();
    for (exprs, required) in [
        (&k.req, true),
        (&k.req_un, true),
        (&k.opt, false),
        (&k.opt_un, false),
    ] {
        for leaf in exprs.iter().flat_map(KeyExpr::leaves) {
            if gens.contains_key(leaf) {
                continue;
            }
            let sub = gensub(
                &SpecRef::Name(leaf.clone()),
                overrides,
                &path_conj(path, leaf.clone()),
                rmap,
            );
            match sub {
                Ok(g) => {
                    gens.insert(leaf.clone(), g);
                }
                Err(e) if required => return Err(e),
                Err(_) => {}
            }
        }
    }

    let req = k.req.clone();
    let req_un = k.req_un.clone();
    let opt = k.opt.clone();
    let opt_un = k.opt_un.clone();
    Ok(Gen::new(move |rand| {
        let mut m = BTreeMap::new();
        for (exprs, un, required) in [
            (&req, false, true),
            (&req_un, true, true),
            (&opt, false, false),
            (&opt_un, true, false),
        ] {
            for expr in exprs.iter() {
                let mut chosen = Vec::new();
                choose_keys(expr, rand, &mut chosen);
                for leaf in chosen {
                    if !required && rand.index(2) == 0 {
                        continue;
                    }
                    let Some(g) = gens.get(leaf) else {
                        continue;
                    };
                    let map_key = if un { leaf.unqualified() } else { leaf.clone() };
                    m.insert(Value::Keyword(map_key), g.sample(rand)?);
                }
            }
        }
        Ok(Value::Map(m))
    }))
}

// ---------------------------------------------------------------------------
// Merge.

pub(crate) fn merge_conform(specs: &[SpecRef], v: &Value) -> Result<Value, SpecError> {
    let mut out = BTreeMap::new();
    for s in specs {
        let r = conform_ref(s, v)?;
        if r.is_invalid() {
            return Ok(Value::invalid());
        }
        if let Value::Map(m) = r {
            // Last component wins on duplicate keys.
            out.extend(m);
        }
    }
    Ok(Value::Map(out))
}

pub(crate) fn merge_unform(specs: &[SpecRef], v: &Value) -> Result<Value, SpecError> {
    let mut out = BTreeMap::new();
    for s in specs {
        let r = crate::spec::unform_ref(s, v)?;
        if let Value::Map(m) = r {
            out.extend(m);
        }
    }
    Ok(Value::Map(out))
}

/// Each component reports its own problems; a bad key shared by several
/// components is reported once per component.
pub(crate) fn merge_explain(
    specs: &[SpecRef],
    path: &[PathSeg],
    via: &[Keyword],
    in_: &[PathSeg],
    v: &Value,
    out: &mut Vec<Problem>,
) -> Result<(), SpecError> {
    for s in specs {
        if conform_ref(s, v)?.is_invalid() {
            explain_ref(s, path, via, in_, v, out)?;
        }
    }
    Ok(())
}

pub(crate) fn merge_gen(
    specs: &[SpecRef],
    overrides: &Overrides,
    path: &[PathSeg],
    rmap: &RMap,
) -> Result<Gen, SpecError> {
    let gens: Result<Vec<Gen>, SpecError> = specs
        .iter()
        .map(|s| gensub(s, overrides, path, rmap))
        .collect();
    let gens = gens?;
    Ok(Gen::new(move |rand| {
        let mut m = BTreeMap::new();
        for g in &gens {
            if let Value::Map(part) = g.sample(rand)? {
                m.extend(part);
            }
        }
        Ok(Value::Map(m))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{def, reset_registry};
    use crate::spec::{conform, explain_data, valid};
    use crate::value::{kw, qkw};
    use crate::value::ValueKind;

    fn person_specs() {
        reset_registry();
        def(qkw("person", "first"), ValueKind::Str).expect("def first");
        def(qkw("person", "age"), ValueKind::Int).expect("def age");
    }

    fn person_map(entries: Vec<(Keyword, Value)>) -> Value {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::Keyword(k), v))
                .collect(),
        )
    }

    #[test]
    fn empty_req_and_empty_map_conforms() {
        let _guard = crate::registry::test_guard();
        reset_registry();
        let s = keys(vec![], vec![], vec![], vec![]).expect("keys");
        assert!(valid(s, &Value::Map(BTreeMap::new())).unwrap());
    }

    #[test]
    fn missing_required_key_is_one_presence_problem() {
        let _guard = crate::registry::test_guard();
        person_specs();
        let s = keys(
            vec![qkw("person", "first").into(), qkw("person", "age").into()],
            vec![],
            vec![],
            vec![],
        )
        .expect("keys");
        let m = person_map(vec![(qkw("person", "first"), Value::from("ada"))]);
        let expl = explain_data(s, &m).unwrap().expect("explanation");
        assert_eq!(expl.problems.len(), 1);
        assert_eq!(expl.problems[0].pred, "(key? :person/age)");
    }

    #[test]
    fn or_keys_reports_the_whole_expression() {
        let _guard = crate::registry::test_guard();
        person_specs();
        let s = keys(
            vec![or_keys(vec![
                qkw("person", "first").into(),
                qkw("person", "age").into(),
            ])],
            vec![],
            vec![],
            vec![],
        )
        .expect("keys");
        assert!(valid(
            &SpecRef::from(s.clone()) as &SpecRef,
            &person_map(vec![(qkw("person", "age"), Value::from(30))])
        )
        .unwrap());
        let expl = explain_data(s, &person_map(vec![]))
            .unwrap()
            .expect("explanation");
        assert_eq!(
            expl.problems[0].pred,
            "(key? (or :person/first :person/age))"
        );
    }

    #[test]
    fn and_keys_flattens_to_first_missing_child() {
        let _guard = crate::registry::test_guard();
        person_specs();
        let s = keys(
            vec![and_keys(vec![
                qkw("person", "first").into(),
                qkw("person", "age").into(),
            ])],
            vec![],
            vec![],
            vec![],
        )
        .expect("keys");
        let m = person_map(vec![(qkw("person", "first"), Value::from("ada"))]);
        let expl = explain_data(s, &m).unwrap().expect("explanation");
        assert_eq!(expl.problems.len(), 1);
        assert_eq!(expl.problems[0].pred, "(key? :person/age)");
    }

    #[test]
    fn registered_values_are_conformed_and_bad_ones_reported_at_key() {
        let _guard = crate::registry::test_guard();
        person_specs();
        let s = keys(
            vec![qkw("person", "first").into()],
            vec![qkw("person", "age").into()],
            vec![],
            vec![],
        )
        .expect("keys");
        let bad = person_map(vec![
            (qkw("person", "first"), Value::from("ada")),
            (qkw("person", "age"), Value::from("old")),
        ]);
        let expl = explain_data(s, &bad).unwrap().expect("explanation");
        assert_eq!(expl.problems.len(), 1);
        assert_eq!(
            expl.problems[0].path,
            vec![PathSeg::Key(qkw("person", "age"))]
        );
        assert_eq!(expl.problems[0].pred, "int");
        assert_eq!(
            expl.problems[0].in_,
            vec![PathSeg::Key(qkw("person", "age"))]
        );
    }

    #[test]
    fn unqualified_lists_match_local_part_but_use_registry_specs() {
        let _guard = crate::registry::test_guard();
        person_specs();
        let s = keys(
            vec![],
            vec![],
            vec![qkw("person", "first").into()],
            vec![qkw("person", "age").into()],
        )
        .expect("keys");
        let good = person_map(vec![
            (kw("first"), Value::from("ada")),
            (kw("age"), Value::from(36)),
        ]);
        assert!(valid(&SpecRef::from(s.clone()) as &SpecRef, &good).unwrap());
        let bad = person_map(vec![(kw("first"), Value::from(1))]);
        let expl = explain_data(s, &bad).unwrap().expect("explanation");
        assert_eq!(expl.problems[0].path, vec![PathSeg::Key(kw("first"))]);
        assert_eq!(expl.problems[0].pred, "string");
    }

    #[test]
    fn unregistered_keys_pass_through_unconformed() {
        let _guard = crate::registry::test_guard();
        person_specs();
        let s = keys(vec![], vec![], vec![], vec![]).expect("keys");
        let m = person_map(vec![(qkw("other", "free"), Value::from("anything"))]);
        assert_eq!(conform(s, &m).unwrap(), m);
    }

    #[test]
    fn merge_last_component_wins_and_double_reports() {
        let _guard = crate::registry::test_guard();
        person_specs();
        def(qkw("account", "id"), ValueKind::Int).expect("def id");
        let left = keys(vec![qkw("person", "first").into()], vec![], vec![], vec![])
            .expect("keys");
        let right = keys(vec![qkw("account", "id").into()], vec![], vec![], vec![])
            .expect("keys");
        let s = merge(vec![left.into(), right.into()]);

        let good = person_map(vec![
            (qkw("person", "first"), Value::from("ada")),
            (qkw("account", "id"), Value::from(7)),
        ]);
        assert_eq!(
            conform(&SpecRef::from(s.clone()) as &SpecRef, &good).unwrap(),
            good
        );

        // A key referenced by both components is reported by each.
        let left2 = keys(vec![qkw("person", "first").into()], vec![], vec![], vec![])
            .expect("keys");
        let right2 = keys(vec![qkw("person", "first").into()], vec![], vec![], vec![])
            .expect("keys");
        let both = merge(vec![left2.into(), right2.into()]);
        let expl = explain_data(both, &person_map(vec![]))
            .unwrap()
            .expect("explanation");
        assert_eq!(expl.problems.len(), 2);
        assert_eq!(expl.problems[0].pred, "(key? :person/first)");
        assert_eq!(expl.problems[1].pred, "(key? :person/first)");
    }
}
