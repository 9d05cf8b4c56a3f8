//! Tree-walking evaluator for validated programs.
//!
//! Identifiers resolve against comprehension frames, then program-level
//! bindings; call targets resolve against the capability registry only.
//! Every node costs one governor step.

use std::collections::{BTreeMap, HashMap};

use super::ast::{BinOp, BoolOp, CmpOp, CompClause, Expr, Program, Stmt, Target, UnaryOp};
use super::error::{SandboxError, SandboxResult};
use super::governor::Governor;
use super::value::{nested_total, Value};
use crate::analysis::Analyzer;
use crate::capabilities::{Args, CallContext, Capability, CapabilityRegistry};
use crate::config::EngineConfig;
use crate::context::ContextStore;

/// Name whose final binding is the execution result.
pub const RESULT_NAME: &str = "result";

type Emit<'e, 'a> = dyn FnMut(&mut Interpreter<'a>) -> SandboxResult<()> + 'e;

pub struct Interpreter<'a> {
    registry: &'a CapabilityRegistry,
    store: &'a ContextStore,
    analyzer: &'a dyn Analyzer,
    limits: &'a EngineConfig,
    governor: Governor,
    globals: HashMap<String, Value>,
    frames: Vec<HashMap<String, Value>>,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        registry: &'a CapabilityRegistry,
        store: &'a ContextStore,
        analyzer: &'a dyn Analyzer,
        limits: &'a EngineConfig,
        governor: Governor,
    ) -> Self {
        Self {
            registry,
            store,
            analyzer,
            limits,
            governor,
            globals: HashMap::new(),
            frames: Vec::new(),
        }
    }

    /// Runs every statement and returns the value bound to `result`.
    pub fn run(&mut self, program: &Program) -> SandboxResult<Value> {
        for stmt in &program.statements {
            self.governor.tick()?;
            match stmt {
                Stmt::Assign { name, value, .. } => {
                    let value = self.eval(value, 0)?;
                    self.globals.insert(name.clone(), value);
                }
                Stmt::Expr(expr) => {
                    self.eval(expr, 0)?;
                }
            }
        }
        Ok(self.globals.remove(RESULT_NAME).unwrap_or_default())
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    // ── expressions ────────────────────────────────────

    /// `depth` is the analysis level the expression runs at.
    fn eval(&mut self, expr: &Expr, depth: u32) -> SandboxResult<Value> {
        self.governor.tick()?;

        match expr {
            Expr::Const(v) => Ok(v.clone()),
            Expr::Name { name, .. } => self.lookup(name),
            Expr::List(items) | Expr::Tuple(items) => {
                let values = items
                    .iter()
                    .map(|item| self.eval(item, depth))
                    .collect::<SandboxResult<Vec<_>>>()?;
                self.governor.check_collection(nested_total(&values))?;
                Ok(Value::List(values))
            }
            Expr::Dict(entries) => {
                let mut map = BTreeMap::new();
                for (k, v) in entries {
                    let key = dict_key(self.eval(k, depth)?)?;
                    let value = self.eval(v, depth)?;
                    map.insert(key, value);
                }
                let map = Value::Dict(map);
                self.governor.check_collection(map.nested_len())?;
                Ok(map)
            }
            Expr::Unary { op, operand } => {
                let v = self.eval(operand, depth)?;
                unary(*op, v)
            }
            Expr::Binary { op, left, right } => {
                let l = self.eval(left, depth)?;
                let r = self.eval(right, depth)?;
                self.binary(*op, l, r)
            }
            Expr::Bool { op, left, right } => {
                let l = self.eval(left, depth)?;
                match (op, l.truthy()) {
                    (BoolOp::And, false) | (BoolOp::Or, true) => Ok(l),
                    _ => self.eval(right, depth),
                }
            }
            Expr::Compare { first, rest } => {
                let mut left = self.eval(first, depth)?;
                for (op, right) in rest {
                    let right = self.eval(right, depth)?;
                    if !compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::IfElse {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond, depth)?.truthy() {
                    self.eval(then, depth)
                } else {
                    self.eval(otherwise, depth)
                }
            }
            Expr::Call {
                func, args, kwargs, ..
            } => self.call(func, args, kwargs, depth),
            Expr::Index { value, index } => {
                let container = self.eval(value, depth)?;
                let index = self.eval(index, depth)?;
                subscript(&container, &index)
            }
            Expr::Slice { value, start, end } => {
                let container = self.eval(value, depth)?;
                let start = self.eval_bound(start.as_deref(), depth)?;
                let end = self.eval_bound(end.as_deref(), depth)?;
                slice(&container, start, end)
            }
            Expr::Attribute { name, .. } => Err(SandboxError::Security(format!(
                "attribute access '.{name}' is not allowed"
            ))),
            Expr::ListComp { element, clauses } => {
                let mut out = Vec::new();
                let mut held = 0usize;
                self.comprehension(clauses, depth, &mut |this: &mut Interpreter<'a>| {
                    let v = this.eval(element, depth)?;
                    held = held.saturating_add(1 + v.nested_len());
                    out.push(v);
                    this.governor.check_collection(held)
                })?;
                Ok(Value::List(out))
            }
            Expr::DictComp {
                key,
                value,
                clauses,
            } => {
                let mut out = BTreeMap::new();
                // Counts overwritten entries too, erring on the high side
                let mut held = 0usize;
                self.comprehension(clauses, depth, &mut |this: &mut Interpreter<'a>| {
                    let k = dict_key(this.eval(key, depth)?)?;
                    let v = this.eval(value, depth)?;
                    held = held.saturating_add(1 + v.nested_len());
                    out.insert(k, v);
                    this.governor.check_collection(held)
                })?;
                Ok(Value::Dict(out))
            }
        }
    }

    /// Reads are copies, charged by the size of what is copied.
    fn lookup(&mut self, name: &str) -> SandboxResult<Value> {
        let value = self
            .frames
            .iter()
            .rev()
            .find_map(|frame| frame.get(name))
            .or_else(|| self.globals.get(name))
            .cloned()
            .ok_or_else(|| SandboxError::runtime(format!("name '{name}' is not defined")))?;
        self.governor.charge(value.nested_len() as u64)?;
        Ok(value)
    }

    fn eval_bound(&mut self, bound: Option<&Expr>, depth: u32) -> SandboxResult<Option<i64>> {
        match bound {
            None => Ok(None),
            Some(expr) => match self.eval(expr, depth)? {
                Value::None => Ok(None),
                v => v.as_int().map(Some).ok_or_else(|| {
                    SandboxError::runtime(format!(
                        "slice indices must be integers, not {}",
                        v.type_name()
                    ))
                }),
            },
        }
    }

    // ── calls ──────────────────────────────────────────

    fn call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        depth: u32,
    ) -> SandboxResult<Value> {
        let Expr::Name { name, .. } = func else {
            return Err(SandboxError::Security(
                "only capabilities can be called".to_string(),
            ));
        };
        let registry = self.registry;
        let capability = registry
            .get(name)
            .ok_or_else(|| SandboxError::UnknownFunction(name.clone()))?;

        if !capability.opens_analysis_frame() {
            return self.invoke(capability, args, kwargs, depth);
        }

        // The level is opened before arguments are evaluated, so an
        // analysis nested in the arguments runs one level deeper.
        let level = self.governor.enter_analysis(depth)?;
        let outcome = self.invoke(capability, args, kwargs, level);
        self.governor.leave_analysis(depth);
        outcome
    }

    fn invoke(
        &mut self,
        capability: &dyn Capability,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        depth: u32,
    ) -> SandboxResult<Value> {
        let positional = args
            .iter()
            .map(|a| self.eval(a, depth))
            .collect::<SandboxResult<Vec<_>>>()?;
        let mut keywords = Vec::with_capacity(kwargs.len());
        for (name, expr) in kwargs {
            keywords.push((name.clone(), self.eval(expr, depth)?));
        }

        let bound = Args::bind(capability.name(), capability.params(), positional, keywords)?;
        let mut cx = CallContext {
            store: self.store,
            governor: &mut self.governor,
            analyzer: self.analyzer,
            limits: self.limits,
            depth,
        };
        capability.call(&bound, &mut cx)
    }

    // ── comprehensions ─────────────────────────────────

    fn comprehension(
        &mut self,
        clauses: &[CompClause],
        depth: u32,
        emit: &mut Emit<'_, 'a>,
    ) -> SandboxResult<()> {
        self.frames.push(HashMap::new());
        let outcome = self.comp_loop(clauses, depth, emit);
        self.frames.pop();
        outcome
    }

    fn comp_loop(
        &mut self,
        clauses: &[CompClause],
        depth: u32,
        emit: &mut Emit<'_, 'a>,
    ) -> SandboxResult<()> {
        let Some((clause, rest)) = clauses.split_first() else {
            return emit(self);
        };

        let items = self.eval(&clause.iter, depth)?.iter_items()?;
        self.governor.check_iterations(items.len())?;

        'items: for item in items {
            self.governor.tick()?;
            self.bind_target(&clause.target, item)?;
            for cond in &clause.conditions {
                if !self.eval(cond, depth)?.truthy() {
                    continue 'items;
                }
            }
            self.comp_loop(rest, depth, emit)?;
        }
        Ok(())
    }

    fn bind_target(&mut self, target: &Target, item: Value) -> SandboxResult<()> {
        let Some(frame) = self.frames.last_mut() else {
            return Err(SandboxError::runtime("loop variable outside a comprehension"));
        };
        match target {
            Target::Name(name) => {
                frame.insert(name.clone(), item);
            }
            Target::Tuple(names) => {
                let values = match item {
                    Value::List(values) if values.len() == names.len() => values,
                    other => {
                        return Err(SandboxError::runtime(format!(
                            "cannot unpack {} into {} names",
                            other.display(),
                            names.len()
                        )))
                    }
                };
                for (name, value) in names.iter().zip(values) {
                    frame.insert(name.clone(), value);
                }
            }
        }
        Ok(())
    }

    // ── operators ──────────────────────────────────────

    fn binary(&mut self, op: BinOp, l: Value, r: Value) -> SandboxResult<Value> {
        if let (Some(a), Some(b)) = (Num::of(&l), Num::of(&r)) {
            return arithmetic(op, a, b);
        }

        match (op, l, r) {
            (BinOp::Add, Value::Str(mut a), Value::Str(b)) => {
                self.governor.check_string(a.len() + b.len())?;
                a.push_str(&b);
                Ok(Value::Str(a))
            }
            (BinOp::Add, Value::List(mut a), Value::List(b)) => {
                self.governor
                    .check_collection(nested_total(&a).saturating_add(nested_total(&b)))?;
                self.governor.charge(b.len() as u64)?;
                a.extend(b);
                Ok(Value::List(a))
            }
            (BinOp::Mul, Value::Str(s), n @ (Value::Int(_) | Value::Bool(_)))
            | (BinOp::Mul, n @ (Value::Int(_) | Value::Bool(_)), Value::Str(s)) => {
                let times = repeat_count(&n);
                self.governor
                    .check_string(s.len().saturating_mul(times))?;
                Ok(Value::Str(s.repeat(times)))
            }
            (BinOp::Mul, Value::List(items), n @ (Value::Int(_) | Value::Bool(_)))
            | (BinOp::Mul, n @ (Value::Int(_) | Value::Bool(_)), Value::List(items)) => {
                let times = repeat_count(&n);
                let total = nested_total(&items).saturating_mul(times);
                self.governor.check_collection(total)?;
                self.governor.charge(total as u64)?;
                Ok(Value::List(
                    std::iter::repeat(items).take(times).flatten().collect(),
                ))
            }
            (op, l, r) => Err(SandboxError::runtime(format!(
                "unsupported operand type(s) for {}: '{}' and '{}'",
                op_symbol(op),
                l.type_name(),
                r.type_name()
            ))),
        }
    }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(v: &Value) -> Option<Self> {
        match v {
            Value::Int(i) => Some(Num::Int(*i)),
            Value::Bool(b) => Some(Num::Int(i64::from(*b))),
            Value::Float(f) => Some(Num::Float(*f)),
            _ => None,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

fn overflow() -> SandboxError {
    SandboxError::runtime("integer overflow")
}

fn arithmetic(op: BinOp, a: Num, b: Num) -> SandboxResult<Value> {
    if let (Num::Int(x), Num::Int(y)) = (a, b) {
        return match op {
            BinOp::Add => x.checked_add(y).map(Value::Int).ok_or_else(overflow),
            BinOp::Sub => x.checked_sub(y).map(Value::Int).ok_or_else(overflow),
            BinOp::Mul => x.checked_mul(y).map(Value::Int).ok_or_else(overflow),
            BinOp::Div => {
                if y == 0 {
                    return Err(SandboxError::runtime("division by zero"));
                }
                Ok(Value::Float(x as f64 / y as f64))
            }
            BinOp::FloorDiv => {
                if y == 0 {
                    return Err(SandboxError::runtime("integer division or modulo by zero"));
                }
                let q = x.checked_div(y).ok_or_else(overflow)?;
                // Round toward negative infinity
                if x % y != 0 && ((x < 0) != (y < 0)) {
                    Ok(Value::Int(q - 1))
                } else {
                    Ok(Value::Int(q))
                }
            }
            BinOp::Mod => {
                if y == 0 {
                    return Err(SandboxError::runtime("integer division or modulo by zero"));
                }
                let r = x.checked_rem(y).ok_or_else(overflow)?;
                // Result takes the sign of the divisor
                if r != 0 && ((r < 0) != (y < 0)) {
                    Ok(Value::Int(r + y))
                } else {
                    Ok(Value::Int(r))
                }
            }
        };
    }

    let (x, y) = (a.as_f64(), b.as_f64());
    match op {
        BinOp::Add => Ok(Value::Float(x + y)),
        BinOp::Sub => Ok(Value::Float(x - y)),
        BinOp::Mul => Ok(Value::Float(x * y)),
        BinOp::Div | BinOp::FloorDiv | BinOp::Mod if y == 0.0 => {
            Err(SandboxError::runtime("float division by zero"))
        }
        BinOp::Div => Ok(Value::Float(x / y)),
        BinOp::FloorDiv => Ok(Value::Float((x / y).floor())),
        BinOp::Mod => {
            let r = x % y;
            if r != 0.0 && ((r < 0.0) != (y < 0.0)) {
                Ok(Value::Float(r + y))
            } else {
                Ok(Value::Float(r))
            }
        }
    }
}

fn repeat_count(n: &Value) -> usize {
    n.as_int().map_or(0, |i| usize::try_from(i).unwrap_or(0))
}

fn op_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::FloorDiv => "//",
        BinOp::Mod => "%",
    }
}

fn unary(op: UnaryOp, v: Value) -> SandboxResult<Value> {
    match (op, Num::of(&v)) {
        (UnaryOp::Not, _) => Ok(Value::Bool(!v.truthy())),
        (UnaryOp::Neg, Some(Num::Int(i))) => i.checked_neg().map(Value::Int).ok_or_else(overflow),
        (UnaryOp::Neg, Some(Num::Float(f))) => Ok(Value::Float(-f)),
        (UnaryOp::Pos, Some(Num::Int(i))) => Ok(Value::Int(i)),
        (UnaryOp::Pos, Some(Num::Float(f))) => Ok(Value::Float(f)),
        (_, None) => Err(SandboxError::runtime(format!(
            "bad operand type for unary {}: '{}'",
            if op == UnaryOp::Neg { "-" } else { "+" },
            v.type_name()
        ))),
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> SandboxResult<bool> {
    use std::cmp::Ordering::{Greater, Less};

    Ok(match op {
        CmpOp::Eq => l.loose_eq(r),
        CmpOp::NotEq => !l.loose_eq(r),
        CmpOp::Lt => l.compare(r)? == Less,
        CmpOp::Le => l.compare(r)? != Greater,
        CmpOp::Gt => l.compare(r)? == Greater,
        CmpOp::Ge => l.compare(r)? != Less,
        CmpOp::In => contains(r, l)?,
        CmpOp::NotIn => !contains(r, l)?,
        // Identity is only meaningful for the singletons
        CmpOp::Is => is_same(l, r),
        CmpOp::IsNot => !is_same(l, r),
    })
}

fn is_same(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        _ => false,
    }
}

fn contains(container: &Value, item: &Value) -> SandboxResult<bool> {
    match (container, item) {
        (Value::Str(haystack), Value::Str(needle)) => Ok(haystack.contains(needle.as_str())),
        (Value::Str(_), other) => Err(SandboxError::runtime(format!(
            "'in <string>' requires string as left operand, not {}",
            other.type_name()
        ))),
        (Value::List(items), _) => Ok(items.iter().any(|v| v.loose_eq(item))),
        (Value::Dict(map), Value::Str(key)) => Ok(map.contains_key(key)),
        (Value::Dict(_), _) => Ok(false),
        (other, _) => Err(SandboxError::runtime(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn dict_key(key: Value) -> SandboxResult<String> {
    match key {
        Value::Str(s) => Ok(s),
        other => Err(SandboxError::runtime(format!(
            "dict keys must be str, not {}",
            other.type_name()
        ))),
    }
}

/// Resolves a possibly negative index against `len`.
fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let resolved = if index < 0 { index + len } else { index };
    (0..len).contains(&resolved).then_some(resolved as usize)
}

fn subscript(container: &Value, index: &Value) -> SandboxResult<Value> {
    match container {
        Value::List(items) => {
            let i = index.as_int().ok_or_else(|| index_type_error("list", index))?;
            resolve_index(i, items.len())
                .map(|i| items[i].clone())
                .ok_or_else(|| SandboxError::runtime("list index out of range"))
        }
        Value::Str(s) => {
            let i = index.as_int().ok_or_else(|| index_type_error("string", index))?;
            let len = s.chars().count();
            resolve_index(i, len)
                .and_then(|i| s.chars().nth(i))
                .map(|c| Value::Str(c.to_string()))
                .ok_or_else(|| SandboxError::runtime("string index out of range"))
        }
        Value::Dict(map) => {
            let key = index.as_str().ok_or_else(|| index_type_error("dict", index))?;
            map.get(key)
                .cloned()
                .ok_or_else(|| SandboxError::runtime(format!("key '{key}' not found")))
        }
        other => Err(SandboxError::runtime(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn index_type_error(kind: &str, index: &Value) -> SandboxError {
    SandboxError::runtime(format!(
        "{kind} indices must be {}, not {}",
        if kind == "dict" { "str" } else { "integers" },
        index.type_name()
    ))
}

/// Clamped `[start, end)` range for sequence slicing.
fn slice_bounds(start: Option<i64>, end: Option<i64>, len: usize) -> (usize, usize) {
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let clamp = |i: i64| {
        if i < 0 {
            (i + len).max(0)
        } else {
            i.min(len)
        }
    };
    let s = start.map_or(0, clamp);
    let e = end.map_or(len, clamp);
    (s as usize, e.max(s) as usize)
}

fn slice(container: &Value, start: Option<i64>, end: Option<i64>) -> SandboxResult<Value> {
    match container {
        Value::List(items) => {
            let (s, e) = slice_bounds(start, end, items.len());
            Ok(Value::List(items[s..e].to_vec()))
        }
        Value::Str(text) => {
            let (s, e) = slice_bounds(start, end, text.chars().count());
            Ok(Value::Str(text.chars().skip(s).take(e - s).collect()))
        }
        other => Err(SandboxError::runtime(format!(
            "'{}' object is not sliceable",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::DescriptiveAnalyzer;
    use crate::config::ContextConfig;
    use crate::context::{Metadata, Role};
    use crate::sandbox::governor::{CancelToken, DepthGauge};
    use crate::sandbox::validator::validate;

    fn run_with(store: &ContextStore, limits: &EngineConfig, code: &str) -> SandboxResult<Value> {
        let registry = CapabilityRegistry::standard();
        let analyzer = DescriptiveAnalyzer::new();
        let program = validate(code, &registry, limits)?;
        let governor = Governor::new(limits, CancelToken::new(), DepthGauge::default());
        Interpreter::new(&registry, store, &analyzer, limits, governor).run(&program)
    }

    fn run(code: &str) -> SandboxResult<Value> {
        let mut store = ContextStore::new(ContextConfig::default());
        store.append(Role::User, "What is quantum computing?", Metadata::new());
        store.append(Role::Assistant, "Quantum computing uses qubits.", Metadata::new());
        store.append(Role::User, "How does it differ from classical computing?", Metadata::new());
        run_with(&store, &EngineConfig::default(), code)
    }

    // ── arithmetic ──────────────────────────────────────

    #[test]
    fn test_arithmetic_precedence_and_floats() {
        assert_eq!(run("result = 1 + 2 * 3").unwrap(), Value::Int(7));
        assert_eq!(run("result = 7 / 2").unwrap(), Value::Float(3.5));
        assert_eq!(run("result = -7 // 2").unwrap(), Value::Int(-4));
        assert_eq!(run("result = -7 % 3").unwrap(), Value::Int(2));
        assert_eq!(run("result = 7 % -3").unwrap(), Value::Int(-2));
        assert_eq!(run("result = 1 + 0.5").unwrap(), Value::Float(1.5));
    }

    #[test]
    fn test_division_by_zero_is_runtime_error() {
        assert!(matches!(run("result = 1 / 0"), Err(SandboxError::Runtime(_))));
        assert!(matches!(run("result = 1 // 0"), Err(SandboxError::Runtime(_))));
        assert!(matches!(run("result = 1.0 % 0"), Err(SandboxError::Runtime(_))));
    }

    #[test]
    fn test_integer_overflow_is_runtime_error() {
        let err = run("result = 9223372036854775807 + 1").unwrap_err();
        assert_eq!(err, SandboxError::runtime("integer overflow"));
    }

    #[test]
    fn test_string_and_list_operators() {
        assert_eq!(run("result = 'ab' + 'cd'").unwrap(), Value::str("abcd"));
        assert_eq!(run("result = 'ab' * 3").unwrap(), Value::str("ababab"));
        assert_eq!(run("result = [1] * 2 + [3]").unwrap(), Value::from(vec![1i64, 1, 3]));
        assert!(matches!(run("result = 'a' + 1"), Err(SandboxError::Runtime(_))));
    }

    #[test]
    fn test_string_repeat_is_bounded() {
        let err = run("result = 'x' * 2000000").unwrap_err();
        assert!(matches!(err, SandboxError::ResourceExceeded(_)));
    }

    #[test]
    fn test_nested_collections_count_against_ceiling() {
        let limits = EngineConfig {
            max_collection_len: 50,
            ..EngineConfig::default()
        };
        let store = ContextStore::new(ContextConfig::default());
        let nested = |code: &str| run_with(&store, &limits, code);

        // 4 rows of 11 items each stay under the ceiling
        let ok = nested("xs = range(10)\nresult = [xs for i in range(4)]").unwrap();
        assert_eq!(ok.nested_len(), 44);

        for code in [
            "xs = range(10)\nresult = [xs for i in range(5)]",
            "xs = range(10)\nresult = {str(i): xs for i in range(5)}",
            "xs = range(10)\nresult = [xs, xs, xs, xs, xs]",
            "xs = range(10)\nresult = [xs] * 5",
            "xs = [range(10), range(10), range(10)]\nresult = xs + xs",
        ] {
            let err = nested(code).unwrap_err();
            assert!(matches!(err, SandboxError::ResourceExceeded(_)), "{code}: {err}");
        }
    }

    #[test]
    fn test_repeated_copies_of_large_binding_fail_cleanly() {
        let err = run("xs = range(100000)\nresult = [xs for i in range(200)]").unwrap_err();
        assert!(matches!(err, SandboxError::ResourceExceeded(_)));
    }

    // ── logic and comparison ────────────────────────────

    #[test]
    fn test_boolean_short_circuit_returns_operand() {
        assert_eq!(run("result = 0 or 'fallback'").unwrap(), Value::str("fallback"));
        assert_eq!(run("result = [] and 1 / 0").unwrap(), Value::List(vec![]));
        assert_eq!(run("result = not []").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_chained_comparison_and_membership() {
        assert_eq!(run("result = 1 < 2 <= 2 < 3").unwrap(), Value::Bool(true));
        assert_eq!(run("result = 1 < 3 < 2").unwrap(), Value::Bool(false));
        assert_eq!(run("result = 'qu' in 'quantum'").unwrap(), Value::Bool(true));
        assert_eq!(run("result = 2 not in [1, 3]").unwrap(), Value::Bool(true));
        assert_eq!(run("result = 'a' in {'a': 1}").unwrap(), Value::Bool(true));
        assert_eq!(run("result = get_message(99) is None").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_ordering_mixed_types_fails() {
        assert!(matches!(run("result = 1 < 'a'"), Err(SandboxError::Runtime(_))));
    }

    // ── subscripts ──────────────────────────────────────

    #[test]
    fn test_indexing_and_slicing() {
        assert_eq!(run("xs = [1, 2, 3]\nresult = xs[-1]").unwrap(), Value::Int(3));
        assert_eq!(run("xs = [1, 2, 3]\nresult = xs[1:]").unwrap(), Value::from(vec![2i64, 3]));
        assert_eq!(run("result = 'quantum'[:2]").unwrap(), Value::str("qu"));
        assert_eq!(run("result = [1, 2][5:9]").unwrap(), Value::List(vec![]));
        assert!(matches!(run("result = [1][3]"), Err(SandboxError::Runtime(_))));
        assert_eq!(
            run("result = find_messages('quantum')[0]['role']").unwrap(),
            Value::str("user")
        );
    }

    #[test]
    fn test_missing_key_is_runtime_error() {
        let err = run("d = {'a': 1}\nresult = d['b']").unwrap_err();
        assert_eq!(err, SandboxError::runtime("key 'b' not found"));
    }

    // ── comprehensions ──────────────────────────────────

    #[test]
    fn test_list_comprehension_with_filter() {
        let out = run("result = [m['id'] for m in find_messages('computing') if m['role'] == 'user']").unwrap();
        assert_eq!(out, Value::from(vec![0i64, 2]));
    }

    #[test]
    fn test_nested_clauses_and_unpacking() {
        let out = run("result = [a * 10 + b for a in range(3) for b in range(a)]").unwrap();
        assert_eq!(out, Value::from(vec![10i64, 20, 21]));
        let out = run("result = {k: v * 2 for k, v in items({'x': 1, 'y': 2})}").unwrap();
        assert_eq!(run("result = {'x': 2, 'y': 4}").unwrap(), out);
    }

    #[test]
    fn test_generator_argument() {
        assert_eq!(run("result = sum(x * x for x in range(4))").unwrap(), Value::Int(14));
    }

    #[test]
    fn test_iteration_ceiling() {
        let limits = EngineConfig {
            max_iterations: 5,
            ..EngineConfig::default()
        };
        let store = ContextStore::new(ContextConfig::default());
        let err = run_with(&store, &limits, "result = [x for x in range(6)]").unwrap_err();
        assert!(matches!(err, SandboxError::ResourceExceeded(_)));
    }

    #[test]
    fn test_unpack_mismatch() {
        let err = run("result = [a for a, b in [[1, 2, 3]]]").unwrap_err();
        assert!(err.to_string().contains("cannot unpack"));
    }

    // ── bindings and calls ──────────────────────────────

    #[test]
    fn test_result_defaults_to_none() {
        assert_eq!(run("x = 1").unwrap(), Value::None);
    }

    #[test]
    fn test_bindings_flow_between_statements() {
        let out = run("hits = find_messages('quantum'); n = len(hits)\nresult = {'n': n, 'first': hits[0]['id']}").unwrap();
        assert_eq!(out, run("result = {'first': 0, 'n': 2}").unwrap());
    }

    #[test]
    fn test_capability_argument_errors() {
        let err = run("result = find_messages()").unwrap_err();
        assert!(err.to_string().contains("missing required argument"));
        let err = run("result = count_messages(color='red')").unwrap_err();
        assert!(err.to_string().contains("unexpected keyword argument"));
    }

    #[test]
    fn test_nested_analysis_depth() {
        let out = run("result = analyze_subsection(analyze_subsection([0, 1]))").unwrap();
        let Value::Dict(outer) = out else {
            panic!("expected dict");
        };
        assert_eq!(outer["depth"], Value::Int(1));
        assert_eq!(outer["message_ids"], Value::from(vec![0i64, 1]));
    }
}
