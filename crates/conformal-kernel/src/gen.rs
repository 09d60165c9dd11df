//! Generator composition.
//!
//! A [`Gen`] is a cloneable closure over the primitive [`Rand`] source.
//! Specs compose per-variant generators; callers may override any sub-spec's
//! generator by registered name or by path. Filtered generators retry a
//! bounded number of times and then fail — generation never hangs.

use std::collections::BTreeMap;
use std::sync::Arc;

use conformal_rand::{Rand, SeededRand};
use tracing::{debug, trace};

use crate::config;
use crate::error::SpecError;
use crate::explain::PathSeg;
use crate::registry;
use crate::spec::{conform_ref, SpecRef};
use crate::value::{Keyword, Value, ValueKind};

type GenFn = Arc<dyn Fn(&mut dyn Rand) -> Result<Value, SpecError> + Send + Sync>;

/// A composable value generator.
#[derive(Clone)]
pub struct Gen(GenFn);

impl std::fmt::Debug for Gen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#gen")
    }
}

impl Gen {
    pub fn new(
        f: impl Fn(&mut dyn Rand) -> Result<Value, SpecError> + Send + Sync + 'static,
    ) -> Gen {
        Gen(Arc::new(f))
    }

    /// Always produce `v`.
    pub fn constant(v: Value) -> Gen {
        Gen::new(move |_| Ok(v.clone()))
    }

    /// Draw one value.
    pub fn sample(&self, rand: &mut dyn Rand) -> Result<Value, SpecError> {
        (self.0)(rand)
    }

    /// Draw one value from a fresh seeded stream.
    pub fn sample_seeded(&self, seed: u64) -> Result<Value, SpecError> {
        self.sample(&mut SeededRand::new(seed))
    }

    /// Draw `n` values from a fresh seeded stream.
    pub fn sample_n(&self, n: usize, seed: u64) -> Result<Vec<Value>, SpecError> {
        let mut rand = SeededRand::new(seed);
        (0..n).map(|_| self.sample(&mut rand)).collect()
    }

    /// Post-process each draw.
    pub fn fmap(self, f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Gen {
        Gen::new(move |rand| self.sample(rand).map(&f))
    }

    /// Keep drawing until `test` accepts, up to [`config::SUCH_THAT_TRIES`]
    /// attempts; then fail with a generation error naming `what`.
    pub fn such_that(
        self,
        test: impl Fn(&Value) -> Result<bool, SpecError> + Send + Sync + 'static,
        what: impl Into<String>,
    ) -> Gen {
        let what = what.into();
        Gen::new(move |rand| {
            for _ in 0..config::SUCH_THAT_TRIES {
                let v = self.sample(rand)?;
                if test(&v)? {
                    return Ok(v);
                }
            }
            debug!(spec = %what, "generator filter exhausted its retry budget");
            Err(SpecError::NoGen {
                path: vec![],
                spec: what.clone(),
            })
        })
    }

    /// Uniform choice among `gens`. Empty input is a construction error at
    /// the call site; callers filter before building.
    pub fn one_of(gens: Vec<Gen>) -> Gen {
        Gen::new(move |rand| {
            let g = &gens[rand.index(gens.len())];
            g.sample(rand)
        })
    }

    /// Weighted choice among `pairs`.
    pub fn frequency(pairs: Vec<(u32, Gen)>) -> Gen {
        let weights: Vec<u32> = pairs.iter().map(|(w, _)| *w).collect();
        Gen::new(move |rand| {
            let i = rand.weighted(&weights);
            pairs[i].1.sample(rand)
        })
    }

    /// A vector of `lo..=hi` draws from `elem`.
    pub fn vector_of(elem: Gen, lo: usize, hi: usize) -> Gen {
        Gen::new(move |rand| {
            let extra = rand.size(hi.saturating_sub(lo));
            let n = lo + extra;
            let items: Result<Vec<Value>, SpecError> =
                (0..n).map(|_| elem.sample(rand)).collect();
            Ok(Value::Vector(items?))
        })
    }

    /// One draw from each generator, in order.
    pub fn tuple_of(gens: Vec<Gen>) -> Gen {
        Gen::new(move |rand| {
            let items: Result<Vec<Value>, SpecError> =
                gens.iter().map(|g| g.sample(rand)).collect();
            Ok(Value::Vector(items?))
        })
    }
}

/// Custom generators keyed by registered name or by path.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    by_name: BTreeMap<Keyword, Gen>,
    by_path: BTreeMap<Vec<PathSeg>, Gen>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: Keyword, gen: Gen) -> Self {
        self.by_name.insert(name, gen);
        self
    }

    pub fn path(mut self, path: Vec<PathSeg>, gen: Gen) -> Self {
        self.by_path.insert(path, gen);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty() && self.by_path.is_empty()
    }

    fn lookup(&self, name: Option<&Keyword>, path: &[PathSeg]) -> Option<&Gen> {
        name.and_then(|n| self.by_name.get(n))
            .or_else(|| self.by_path.get(path))
    }
}

/// Recursion-accounting key: regex node id or registered spec name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum RecKey {
    Id(u64),
    Name(Keyword),
}

/// Per-generation counter of re-entries into recursive nodes.
pub(crate) type RMap = BTreeMap<RecKey, usize>;

/// Count one re-entry; `None` once the recursion limit is exceeded, at
/// which point the caller prunes the recursive branch.
pub(crate) fn rmap_enter(rmap: &RMap, key: RecKey) -> Option<RMap> {
    let count = rmap.get(&key).copied().unwrap_or(0);
    if count > config::recursion_limit() {
        return None;
    }
    let mut next = rmap.clone();
    next.insert(key, count + 1);
    Some(next)
}

/// Resolve the generator for a spec-or-name, honoring overrides.
///
/// Precedence: override by registered name, override by path, the spec's
/// own `with_gen` attachment, then the variant's built-up generator. The
/// result is filtered to conforming values.
pub(crate) fn gensub(
    sref: &SpecRef,
    overrides: &Overrides,
    path: &[PathSeg],
    rmap: &RMap,
) -> Result<Gen, SpecError> {
    let (spec, rmap, name) = match sref {
        SpecRef::Name(k) => {
            let spec = registry::resolve(k)?;
            let rmap = rmap_enter(rmap, RecKey::Name(k.clone())).ok_or_else(|| {
                SpecError::NoGen {
                    path: path.to_vec(),
                    spec: format!("{k} (recursion limit reached)"),
                }
            })?;
            let name = spec.name().cloned().or(Some(k.clone()));
            (spec, rmap, name)
        }
        SpecRef::Spec(s) => (s.clone(), rmap.clone(), s.name().cloned()),
    };

    let raw = if let Some(g) = overrides.lookup(name.as_ref(), path) {
        trace!(name = ?name, "generator override selected");
        g.clone()
    } else if let Some(g) = spec.gen_attachment() {
        g.clone()
    } else {
        spec.gen_val(overrides, path, &rmap)?
    };

    let check_ref = SpecRef::Spec(spec);
    let what = check_ref.describe();
    Ok(raw.such_that(
        move |v| Ok(!conform_ref(&check_ref, v)?.is_invalid()),
        what,
    ))
}

/// Generator for a spec, with overrides. Entry point behind `gen`.
pub fn gen_with(sref: &SpecRef, overrides: &Overrides) -> Result<Gen, SpecError> {
    gensub(sref, overrides, &[], &RMap::new())
}

/// Generate `n` values and their conformed forms, deterministically.
pub fn exercise(
    spec: impl Into<SpecRef>,
    n: usize,
    overrides: &Overrides,
) -> Result<Vec<(Value, Value)>, SpecError> {
    let sref = spec.into();
    let g = gen_with(&sref, overrides)?;
    let mut rand = SeededRand::new(config::seed());
    (0..n)
        .map(|_| {
            let v = g.sample(&mut rand)?;
            let conformed = conform_ref(&sref, &v)?;
            Ok((v, conformed))
        })
        .collect()
}

/// Default generator for a value kind; `None` where no generator exists
/// without an override (functions).
pub(crate) fn kind_gen(kind: ValueKind) -> Option<Gen> {
    match kind {
        ValueKind::Nil => Some(Gen::constant(Value::Nil)),
        ValueKind::Bool => Some(Gen::new(|rand| Ok(Value::Bool(rand.index(2) == 1)))),
        ValueKind::Int => Some(Gen::new(|rand| Ok(Value::Int(rand.integer())))),
        ValueKind::Float => Some(Gen::new(|rand| {
            Ok(Value::Float(rand.range_f64(-1.0e6, 1.0e6)))
        })),
        ValueKind::Str => Some(Gen::new(|rand| Ok(Value::Str(rand.string(12))))),
        ValueKind::Keyword => Some(Gen::new(|rand| {
            let mut name = rand.string(8);
            if name.is_empty() {
                name.push('k');
            }
            Ok(Value::Keyword(Keyword::plain(name)))
        })),
        ValueKind::Vector => scalar_gen().map(|g| Gen::vector_of(g, 0, 4)),
        ValueKind::Map => Some(Gen::new(|rand| {
            let n = rand.size(4);
            let mut m = BTreeMap::new();
            for _ in 0..n {
                let mut key = rand.string(6);
                if key.is_empty() {
                    key.push('k');
                }
                m.insert(Value::Keyword(Keyword::plain(key)), scalar_gen_sample(rand)?);
            }
            Ok(Value::Map(m))
        })),
        ValueKind::Set => Some(Gen::new(|rand| {
            let n = rand.size(4);
            let mut s = std::collections::BTreeSet::new();
            for _ in 0..n {
                s.insert(Value::Int(rand.range_i64(-100, 100)));
            }
            Ok(Value::Set(s))
        })),
        ValueKind::Fn => None,
    }
}

fn scalar_gen_sample(rand: &mut dyn Rand) -> Result<Value, SpecError> {
    match rand.index(5) {
        0 => Ok(Value::Int(rand.integer())),
        1 => Ok(Value::Bool(rand.index(2) == 1)),
        2 => Ok(Value::Str(rand.string(8))),
        3 => Ok(Value::Float(rand.range_f64(-1000.0, 1000.0))),
        _ => Ok(Value::Keyword(Keyword::plain(format!(
            "k{}",
            rand.range_i64(0, 99)
        )))),
    }
}

/// Branching generator over scalar kinds; backs `:conformal/any`.
pub(crate) fn scalar_gen() -> Option<Gen> {
    Some(Gen::new(scalar_gen_sample))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_and_fmap() {
        let g = Gen::constant(Value::from(1)).fmap(|v| match v {
            Value::Int(i) => Value::Int(i * 10),
            other => other,
        });
        assert_eq!(g.sample_seeded(0).expect("sample"), Value::from(10));
    }

    #[test]
    fn such_that_retries_then_fails() {
        let g = Gen::new(|rand| Ok(Value::Int(rand.range_i64(0, 9))));
        let even = g
            .clone()
            .such_that(|v| Ok(v.as_int().map(|i| i % 2 == 0).unwrap_or(false)), "even");
        assert!(even
            .sample_seeded(1)
            .expect("even sample")
            .as_int()
            .map(|i| i % 2 == 0)
            .unwrap_or(false));

        let never = g.such_that(|_| Ok(false), "never");
        assert!(matches!(
            never.sample_seeded(1),
            Err(SpecError::NoGen { .. })
        ));
    }

    #[test]
    fn vector_of_respects_bounds() {
        let g = Gen::vector_of(Gen::constant(Value::from(7)), 2, 5);
        for seed in 0..20 {
            let v = g.sample_seeded(seed).expect("vector");
            let len = v.as_vector().expect("vector").len();
            assert!((2..=5).contains(&len));
        }
    }

    #[test]
    fn frequency_respects_zero_weight() {
        let g = Gen::frequency(vec![
            (0, Gen::constant(Value::from("never"))),
            (5, Gen::constant(Value::from("always"))),
        ]);
        for seed in 0..20 {
            assert_eq!(g.sample_seeded(seed).expect("sample"), Value::from("always"));
        }
    }

    #[test]
    fn sampling_is_deterministic_per_seed() {
        let g = kind_gen(ValueKind::Int).expect("int gen");
        assert_eq!(g.sample_n(5, 42).unwrap(), g.sample_n(5, 42).unwrap());
    }

    #[test]
    fn rmap_enter_prunes_past_limit() {
        let mut rmap = RMap::new();
        let key = RecKey::Id(7);
        // Counts 0..=limit are admitted; the next entry is pruned.
        for _ in 0..=config::recursion_limit() {
            rmap = rmap_enter(&rmap, key.clone()).expect("under limit");
        }
        assert!(rmap_enter(&rmap, key).is_none());
    }
}
