//! Function specs: argument/return/relation contracts checked generatively.
//!
//! Conforming a function runs a fixed number of trials: generate an
//! argument list from the `args` regex, call the function, check the
//! return spec and (when present) the relation over `{args, ret}`. Trials
//! are seeded deterministically, so `conform` and `explain` observe the
//! same failure; the failing argument list is greedily shrunk before it is
//! reported.

use std::sync::Mutex;

use conformal_rand::{Rand, SeededRand};
use tracing::debug;

use crate::config;
use crate::error::SpecError;
use crate::explain::{path_conj, PathSeg, Problem};
use crate::gen::{gensub, Gen, Overrides, RMap};
use crate::spec::{conform_ref, explain_ref, Spec, SpecKind, SpecRef};
use crate::value::{kw, Keyword, NativeFn, Value};

/// The `args`/`ret`/`fn`/`block` quartet.
#[derive(Clone)]
pub struct FSpec {
    args: SpecRef,
    ret: Option<SpecRef>,
    relation: Option<SpecRef>,
    block: Option<SpecRef>,
}

impl FSpec {
    /// Start from the argument-list spec (normally a regex).
    pub fn new(args: impl Into<SpecRef>) -> FSpec {
        FSpec {
            args: args.into(),
            ret: None,
            relation: None,
            block: None,
        }
    }

    pub fn ret(mut self, ret: impl Into<SpecRef>) -> FSpec {
        self.ret = Some(ret.into());
        self
    }

    /// Relation over `{:args .. :ret ..}`, checked after the return spec.
    pub fn relation(mut self, rel: impl Into<SpecRef>) -> FSpec {
        self.relation = Some(rel.into());
        self
    }

    /// Function spec for a callable passed as the final argument.
    pub fn block(mut self, block: impl Into<SpecRef>) -> FSpec {
        self.block = Some(block.into());
        self
    }

    pub fn into_spec(self) -> Spec {
        Spec::from_kind(SpecKind::FSpec(self))
    }

    pub(crate) fn describe(&self) -> String {
        let mut out = format!("(fspec :args {}", self.args.describe());
        if let Some(ret) = &self.ret {
            out.push_str(&format!(" :ret {}", ret.describe()));
        }
        if let Some(rel) = &self.relation {
            out.push_str(&format!(" :fn {}", rel.describe()));
        }
        if self.block.is_some() {
            out.push_str(" :block fspec");
        }
        out.push(')');
        out
    }
}

/// `fspec(args, ret)`; use the [`FSpec`] builder for `fn`/`block`.
pub fn fspec(args: impl Into<SpecRef>, ret: impl Into<SpecRef>) -> Spec {
    FSpec::new(args).ret(ret).into_spec()
}

/// Generate `n` argument lists for a function spec, call `f` on each, and
/// return the `(args, ret)` pairs. The companion of `exercise` for
/// functions; a raising call surfaces as an invalid-spec error carrying the
/// message.
pub fn exercise_fspec(
    spec: impl Into<SpecRef>,
    f: &NativeFn,
    n: usize,
) -> Result<Vec<(Value, Value)>, SpecError> {
    let sref = spec.into();
    let resolved = sref.resolve()?;
    let SpecKind::FSpec(fs) = resolved.kind() else {
        return Err(SpecError::InvalidSpec(format!(
            "exercise_fspec takes a function spec, got {}",
            resolved.describe()
        )));
    };
    let args_gen = gensub(&fs.args, &Overrides::new(), &[], &RMap::new())?;
    let mut rand = SeededRand::new(config::seed());
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let args = match args_gen.sample(&mut rand)? {
            Value::Vector(items) => items,
            other => vec![other],
        };
        let ret = f
            .call(&args)
            .map_err(|message| SpecError::InvalidSpec(format!("exercised call raised: {message}")))?;
        out.push((Value::Vector(args), ret));
    }
    Ok(out)
}

enum TrialFailure {
    /// The function raised; message captured.
    Raised(String),
    /// The return value failed the `ret` spec.
    BadRet(Value),
    /// The `{args ret}` pair failed the relation.
    BadRelation(Value),
}

struct Counterexample {
    args: Vec<Value>,
    failure: TrialFailure,
}

fn run_one(fs: &FSpec, f: &NativeFn, args: &[Value]) -> Result<Option<TrialFailure>, SpecError> {
    let ret = match f.call(args) {
        Ok(ret) => ret,
        Err(message) => return Ok(Some(TrialFailure::Raised(message))),
    };
    if let Some(ret_spec) = &fs.ret {
        if conform_ref(ret_spec, &ret)?.is_invalid() {
            return Ok(Some(TrialFailure::BadRet(ret)));
        }
    }
    if let Some(rel) = &fs.relation {
        let pair = Value::map([
            (Value::from(kw("args")), Value::Vector(args.to_vec())),
            (Value::from(kw("ret")), ret),
        ]);
        if conform_ref(rel, &pair)?.is_invalid() {
            return Ok(Some(TrialFailure::BadRelation(pair)));
        }
    }
    Ok(None)
}

/// Candidate replacements that move a value toward "smaller".
fn shrink_value(v: &Value) -> Vec<Value> {
    match v {
        Value::Int(0) => vec![],
        Value::Int(i) => vec![Value::Int(0), Value::Int(i / 2)],
        Value::Float(x) if *x != 0.0 => vec![Value::Float(0.0)],
        Value::Str(s) if !s.is_empty() => {
            let half: String = s.chars().take(s.chars().count() / 2).collect();
            vec![Value::from(""), Value::from(half)]
        }
        Value::Vector(items) if !items.is_empty() => vec![Value::Vector(vec![])],
        _ => vec![],
    }
}

/// Greedy minimization: element drops first, then scalar shrinks, each
/// accepted only while the argument list stays valid and the trial still
/// fails. Bounded, deterministic.
fn shrink(
    fs: &FSpec,
    f: &NativeFn,
    mut args: Vec<Value>,
    mut failure: TrialFailure,
) -> Result<Counterexample, SpecError> {
    const SHRINK_BUDGET: usize = 200;
    let mut attempts = 0;
    let still_fails = |fs: &FSpec,
                       f: &NativeFn,
                       candidate: &[Value]|
     -> Result<Option<TrialFailure>, SpecError> {
        let as_value = Value::Vector(candidate.to_vec());
        if conform_ref(&fs.args, &as_value)?.is_invalid() {
            return Ok(None);
        }
        run_one(fs, f, candidate)
    };

    'outer: loop {
        for i in 0..args.len() {
            if attempts >= SHRINK_BUDGET {
                break 'outer;
            }
            attempts += 1;
            let mut candidate = args.clone();
            candidate.remove(i);
            if let Some(fail) = still_fails(fs, f, &candidate)? {
                args = candidate;
                failure = fail;
                continue 'outer;
            }
        }
        for i in 0..args.len() {
            for replacement in shrink_value(&args[i]) {
                if attempts >= SHRINK_BUDGET {
                    break 'outer;
                }
                attempts += 1;
                let mut candidate = args.clone();
                candidate[i] = replacement;
                if let Some(fail) = still_fails(fs, f, &candidate)? {
                    args = candidate;
                    failure = fail;
                    continue 'outer;
                }
            }
        }
        break;
    }
    Ok(Counterexample { args, failure })
}

/// Run the seeded trial loop; the shrunk first counterexample, if any.
fn check(fs: &FSpec, f: &NativeFn) -> Result<Option<Counterexample>, SpecError> {
    let args_gen = gensub(&fs.args, &Overrides::new(), &[], &RMap::new())?;
    let block_gen = match &fs.block {
        Some(block) => Some(gensub(block, &Overrides::new(), &[], &RMap::new())?),
        None => None,
    };
    let mut rand = SeededRand::new(config::seed());
    for trial in 0..config::fspec_iterations() {
        let generated = args_gen.sample(&mut rand)?;
        let mut args = match generated {
            Value::Vector(items) => items,
            other => vec![other],
        };
        if let Some(block_gen) = &block_gen {
            args.push(block_gen.sample(&mut rand)?);
        }
        if let Some(failure) = run_one(fs, f, &args)? {
            debug!(trial, "function spec trial failed; shrinking");
            return Ok(Some(shrink(fs, f, args, failure)?));
        }
    }
    Ok(None)
}

pub(crate) fn conform_fspec(fs: &FSpec, v: &Value) -> Result<Value, SpecError> {
    let Some(f) = v.as_fn() else {
        return Ok(Value::invalid());
    };
    Ok(match check(fs, f)? {
        None => v.clone(),
        Some(_) => Value::invalid(),
    })
}

pub(crate) fn explain_fspec(
    fs: &FSpec,
    path: &[PathSeg],
    via: &[Keyword],
    in_: &[PathSeg],
    v: &Value,
    out: &mut Vec<Problem>,
) -> Result<(), SpecError> {
    let Some(f) = v.as_fn() else {
        out.push(Problem::new(
            path.to_vec(),
            "fn",
            v.clone(),
            via.to_vec(),
            in_.to_vec(),
        ));
        return Ok(());
    };
    let Some(counterexample) = check(fs, f)? else {
        return Ok(());
    };
    let args = Value::Vector(counterexample.args);
    match counterexample.failure {
        TrialFailure::Raised(message) => {
            out.push(
                Problem::new(
                    path.to_vec(),
                    fs.describe(),
                    args,
                    via.to_vec(),
                    in_.to_vec(),
                )
                .with_reason(message),
            );
        }
        TrialFailure::BadRet(ret) => {
            if let Some(ret_spec) = &fs.ret {
                explain_ref(ret_spec, &path_conj(path, kw("ret")), via, in_, &ret, out)?;
            }
        }
        TrialFailure::BadRelation(pair) => {
            if let Some(rel) = &fs.relation {
                explain_ref(rel, &path_conj(path, kw("fn")), via, in_, &pair, out)?;
            }
        }
    }
    Ok(())
}

/// Generated functions ignore their arguments and return samples of the
/// `ret` spec from a private stream.
pub(crate) fn gen_fspec(
    fs: &FSpec,
    overrides: &Overrides,
    path: &[PathSeg],
    rmap: &RMap,
) -> Result<Gen, SpecError> {
    let ret = fs.ret.as_ref().ok_or_else(|| SpecError::NoGen {
        path: path.to_vec(),
        spec: fs.describe(),
    })?;
    let ret_gen = gensub(ret, overrides, &path_conj(path, kw("ret")), rmap)?;
    Ok(Gen::new(move |rand| {
        let stream = Mutex::new(SeededRand::new(rand.next_u64()));
        let ret_gen = ret_gen.clone();
        Ok(Value::Fn(NativeFn::new("generated-fn", move |_args| {
            let mut stream = stream.lock().map_err(|_| "generator stream poisoned")?;
            ret_gen
                .sample(&mut *stream)
                .map_err(|e| e.to_string())
        })))
    }))
}
