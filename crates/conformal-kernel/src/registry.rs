//! Process-wide spec registry.
//!
//! A single atomic snapshot: readers clone the `Arc` and never hold the
//! lock across spec evaluation; `def` and `reset_registry` swap in a fresh
//! immutable map. Entries are specs or aliases (name -> name), resolved by
//! chain-following at use sites.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};

use conformal_rand::Rand;
use tracing::debug;

use crate::error::SpecError;
use crate::gen::{scalar_gen, Gen};
use crate::pred::Pred;
use crate::spec::{predicate, Spec, SpecRef};
use crate::value::{Keyword, Value, ValueKind, ENGINE_NS};

#[derive(Clone)]
enum RegEntry {
    Spec(Arc<Spec>),
    Alias(Keyword),
}

type RegMap = BTreeMap<Keyword, RegEntry>;

static REGISTRY: OnceLock<RwLock<Arc<RegMap>>> = OnceLock::new();

/// Alias chains longer than this are treated as unresolvable (cycles).
const MAX_ALIAS_HOPS: usize = 100;

fn cell() -> &'static RwLock<Arc<RegMap>> {
    REGISTRY.get_or_init(|| RwLock::new(Arc::new(builtins())))
}

fn snapshot() -> Arc<RegMap> {
    cell().read().expect("registry lock poisoned").clone()
}

/// The qualified name of an engine built-in.
pub fn builtin(name: &str) -> Keyword {
    Keyword::qualified(ENGINE_NS, name)
}

/// Register a spec (or an alias) under a qualified name. Bare predicates
/// are wrapped as predicate specs by the `SpecRef` conversion. Returns the
/// name for chaining.
pub fn def(name: Keyword, target: impl Into<SpecRef>) -> Result<Keyword, SpecError> {
    if !name.is_qualified() {
        return Err(SpecError::UnqualifiedName(name));
    }
    let entry = match target.into() {
        SpecRef::Spec(spec) => RegEntry::Spec(Arc::new(spec.named(name.clone()))),
        SpecRef::Name(alias) => RegEntry::Alias(alias),
    };
    let lock = cell();
    let mut guard = lock.write().expect("registry lock poisoned");
    let mut next = (**guard).clone();
    next.insert(name.clone(), entry);
    *guard = Arc::new(next);
    debug!(name = %name, "registered spec");
    Ok(name)
}

/// Resolve a name through alias chains. `Ok(None)` when the name is simply
/// absent; `Err` when a chain dangles or cycles.
pub(crate) fn lookup(name: &Keyword) -> Result<Option<Arc<Spec>>, SpecError> {
    let map = snapshot();
    let mut cur = name.clone();
    for _ in 0..MAX_ALIAS_HOPS {
        match map.get(&cur) {
            None => {
                return if cur == *name {
                    Ok(None)
                } else {
                    Err(SpecError::Unresolved(cur))
                };
            }
            Some(RegEntry::Spec(spec)) => return Ok(Some(spec.clone())),
            Some(RegEntry::Alias(next)) => cur = next.clone(),
        }
    }
    Err(SpecError::Unresolved(name.clone()))
}

/// Resolve a name to its spec, erroring when it is not registered.
pub(crate) fn resolve(name: &Keyword) -> Result<Arc<Spec>, SpecError> {
    lookup(name)?.ok_or_else(|| SpecError::Unresolved(name.clone()))
}

/// The spec registered under `name`, following aliases.
pub fn get_spec(name: &Keyword) -> Option<Arc<Spec>> {
    lookup(name).ok().flatten()
}

/// Restore the registry to the built-in set.
pub fn reset_registry() {
    let lock = cell();
    let mut guard = lock.write().expect("registry lock poisoned");
    *guard = Arc::new(builtins());
    debug!("registry reset to built-ins");
}

fn builtin_entry(map: &mut RegMap, name: &str, spec: Spec) {
    let key = builtin(name);
    map.insert(key.clone(), RegEntry::Spec(Arc::new(spec.named(key))));
}

fn int_range_gen(lo: i64, hi: i64) -> Gen {
    Gen::new(move |rand| Ok(Value::Int(rand.range_i64(lo, hi))))
}

fn builtins() -> RegMap {
    let mut map = RegMap::new();

    let any = predicate(Pred::func("any?", |_| Ok(true)));
    let any = match scalar_gen() {
        Some(g) => any.with_gen(g),
        None => any,
    };
    builtin_entry(&mut map, "any", any);

    builtin_entry(&mut map, "boolean", predicate(ValueKind::Bool));

    builtin_entry(
        &mut map,
        "positive_integer",
        predicate(Pred::func("pos-int?", |v| {
            Ok(v.as_int().map(|i| i > 0).unwrap_or(false))
        }))
        .with_gen(int_range_gen(1, 10_000)),
    );
    builtin_entry(
        &mut map,
        "natural_integer",
        predicate(Pred::func("nat-int?", |v| {
            Ok(v.as_int().map(|i| i >= 0).unwrap_or(false))
        }))
        .with_gen(int_range_gen(0, 10_000)),
    );
    builtin_entry(
        &mut map,
        "negative_integer",
        predicate(Pred::func("neg-int?", |v| {
            Ok(v.as_int().map(|i| i < 0).unwrap_or(false))
        }))
        .with_gen(int_range_gen(-10_000, -1)),
    );

    builtin_entry(
        &mut map,
        "empty",
        predicate(Pred::func("empty?", |v| Ok(v.is_empty_coll())))
            .with_gen(Gen::constant(Value::Vector(vec![]))),
    );

    map
}

/// Serializes tests that touch process-wide state (registry, config).
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: OnceLock<std::sync::Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| std::sync::Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
