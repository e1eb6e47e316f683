//! Tree-walking evaluator with step, allocation and deadline metering.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use log::debug;

use super::parser::{BinOp, CmpOp, Expr, Program, Stmt, Target};
use super::value::{range_len, Builtin, DictRef, ListRef, Value};
use super::{CallContext, SandboxError, SandboxLimits, Storage};

/// Fixed per-container overhead charged against the allocation budget.
const SLOT_BYTES: usize = 16;

/// Bytes of string or container work paid for by one step.
const BYTES_PER_STEP: usize = 1024;

/// Budget enforcement shared by every evaluation step.
pub struct Meter {
    steps_left: u64,
    bytes_left: usize,
    deadline: Instant,
    cancel: Arc<AtomicBool>,
}

impl Meter {
    pub fn new(limits: &SandboxLimits, cancel: Arc<AtomicBool>) -> Self {
        Meter {
            steps_left: limits.max_steps,
            bytes_left: limits.max_memory_bytes,
            deadline: Instant::now() + limits.timeout,
            cancel,
        }
    }

    fn tick(&mut self) -> Result<(), SandboxError> {
        if self.steps_left == 0 {
            return Err(SandboxError::OutOfSteps);
        }
        self.steps_left -= 1;

        if self.cancel.load(AtomicOrdering::Relaxed) {
            return Err(SandboxError::Timeout);
        }
        if self.steps_left % 256 == 0 && Instant::now() >= self.deadline {
            return Err(SandboxError::Timeout);
        }
        Ok(())
    }

    /// Allocation also costs steps in proportion to its size.
    fn charge(&mut self, bytes: usize) -> Result<(), SandboxError> {
        if bytes > self.bytes_left {
            self.bytes_left = 0;
            return Err(SandboxError::MemoryLimit);
        }
        self.bytes_left -= bytes;
        self.scan(bytes)
    }

    /// Pays in steps for walking `bytes` of existing data.
    fn scan(&mut self, bytes: usize) -> Result<(), SandboxError> {
        let steps = u64::try_from(bytes / BYTES_PER_STEP).unwrap_or(u64::MAX);
        if steps > self.steps_left {
            self.steps_left = 0;
            return Err(SandboxError::OutOfSteps);
        }
        self.steps_left -= steps;
        Ok(())
    }
}

enum Flow {
    Normal,
    Break,
    Continue,
}

fn runtime(message: impl Into<String>) -> SandboxError {
    SandboxError::Runtime(message.into())
}

/// Bytes charged for every container slot that holds `value`, whether or
/// not the string behind it is shared.
fn footprint(value: &Value) -> usize {
    SLOT_BYTES
        + match value {
            Value::Str(s) => s.len(),
            Value::Exception(message) => message.len(),
            _ => 0,
        }
}

/// Size of the data a comparison or membership test walks through.
fn shallow_size(value: &Value) -> usize {
    match value {
        Value::Str(s) => s.len(),
        Value::List(items) => items.borrow().len().saturating_mul(SLOT_BYTES),
        Value::Dict(entries) => entries.borrow().len().saturating_mul(SLOT_BYTES),
        _ => 0,
    }
}

/// Runs `program` against a copy of the contract storage and returns the
/// storage the program leaves behind.
pub fn run(
    program: &Program,
    storage: &Storage,
    context: &CallContext,
    meter: &mut Meter,
) -> Result<Storage, SandboxError> {
    let storage_value = Value::dict(
        storage
            .iter()
            .map(|(k, v)| Ok((k.clone(), Value::from_json(v)?)))
            .collect::<Result<BTreeMap<_, _>, SandboxError>>()?,
    );

    let amount = i64::try_from(context.amount)
        .map_err(|_| runtime("message value exceeds integer range"))?;
    let mut message = BTreeMap::new();
    message.insert("sender".to_string(), Value::Str(context.sender.0.as_str().into()));
    message.insert("value".to_string(), Value::Int(amount));
    message.insert(
        "data".to_string(),
        context
            .payload
            .as_deref()
            .map_or(Value::None, |data| Value::Str(data.into())),
    );

    let mut interpreter = Interpreter {
        meter,
        variables: HashMap::new(),
    };
    interpreter.variables.insert("storage".to_string(), storage_value);
    interpreter.variables.insert("msg".to_string(), Value::dict(message));

    match interpreter.exec_block(&program.body)? {
        Flow::Normal => {}
        Flow::Break | Flow::Continue => return Err(runtime("'break' or 'continue' outside loop")),
    }

    let storage = interpreter.variables.remove("storage");
    let entries = match &storage {
        Some(Value::Dict(entries)) => Rc::clone(entries),
        Some(other) => {
            return Err(SandboxError::NonSerializable(format!(
                "storage replaced by {}",
                other.type_name()
            )))
        }
        None => return Err(SandboxError::NonSerializable("storage was deleted".to_string())),
    };

    let result = entries
        .borrow()
        .iter()
        .map(|(k, v)| Ok((k.clone(), v.to_json(0)?)))
        .collect::<Result<Storage, SandboxError>>();
    result
}

struct Interpreter<'m> {
    meter: &'m mut Meter,
    variables: HashMap<String, Value>,
}

impl Interpreter<'_> {
    fn exec_block(&mut self, statements: &[Stmt]) -> Result<Flow, SandboxError> {
        for statement in statements {
            match self.exec(statement)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, statement: &Stmt) -> Result<Flow, SandboxError> {
        self.meter.tick()?;

        match statement {
            Stmt::Expr(expr) => {
                self.eval(expr)?;
            }
            Stmt::Assign { target, value } => {
                let value = self.eval(value)?;
                self.assign(target, value)?;
            }
            Stmt::AugAssign { target, op, value } => {
                let current = self.load_target(target)?;
                let rhs = self.eval(value)?;
                let result = self.binary(*op, current, rhs)?;
                self.assign(target, result)?;
            }
            Stmt::If { branches, orelse } => {
                for (cond, body) in branches {
                    if self.eval(cond)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                return self.exec_block(orelse);
            }
            Stmt::While { cond, body } => {
                while self.eval(cond)?.truthy() {
                    self.meter.tick()?;
                    if let Flow::Break = self.exec_block(body)? {
                        break;
                    }
                }
            }
            Stmt::For { var, iter, body } => {
                let iterable = self.eval(iter)?;
                self.exec_for(var, iterable, body)?;
            }
            Stmt::Del(target) => self.delete(target)?,
            Stmt::Assert { cond, message } => {
                if !self.eval(cond)?.truthy() {
                    let text = match message {
                        Some(message) => self.eval(message)?.to_display(0)?,
                        None => String::new(),
                    };
                    return Err(runtime(format!("AssertionError: {}", text)));
                }
            }
            Stmt::Raise(value) => {
                let text = match value {
                    Some(value) => self.eval(value)?.to_display(0)?,
                    None => "exception raised".to_string(),
                };
                return Err(runtime(text));
            }
            Stmt::Import(module) => {
                return Err(SandboxError::Forbidden(format!("import of '{}'", module)))
            }
            Stmt::Pass => {}
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Continue => return Ok(Flow::Continue),
        }
        Ok(Flow::Normal)
    }

    fn exec_for(&mut self, var: &str, iterable: Value, body: &[Stmt]) -> Result<(), SandboxError> {
        if let Value::Range { start, stop, step } = &iterable {
            let (start, stop, step) = (*start, *stop, *step);
            let mut current = start;
            for _ in 0..range_len(start, stop, step) {
                self.meter.tick()?;
                self.variables.insert(var.to_string(), Value::Int(current));
                if let Flow::Break = self.exec_block(body)? {
                    break;
                }
                current = current.saturating_add(step);
            }
            return Ok(());
        }

        for item in self.iterate(&iterable)? {
            self.meter.tick()?;
            self.variables.insert(var.to_string(), item);
            if let Flow::Break = self.exec_block(body)? {
                break;
            }
        }
        Ok(())
    }

    /// Snapshot of the items an iterable yields; ranges are materialized.
    fn iterate(&mut self, iterable: &Value) -> Result<Vec<Value>, SandboxError> {
        let items: Vec<Value> = match iterable {
            Value::List(items) => {
                let items = items.borrow();
                self.meter.scan(items.len().saturating_mul(SLOT_BYTES))?;
                items.clone()
            }
            Value::Dict(entries) => {
                let entries = entries.borrow();
                let bytes: usize = entries.keys().map(String::len).sum();
                self.meter.charge(bytes)?;
                entries.keys().map(|k| Value::Str(k.as_str().into())).collect()
            }
            Value::Str(s) => {
                self.meter.charge(s.len().saturating_mul(SLOT_BYTES))?;
                s.chars().map(|c| Value::Str(c.to_string().into())).collect()
            }
            Value::Range { start, stop, step } => {
                let len = range_len(*start, *stop, *step);
                let bytes = usize::try_from(len)
                    .unwrap_or(usize::MAX)
                    .saturating_mul(SLOT_BYTES);
                self.meter.charge(bytes)?;
                let mut values = Vec::new();
                let mut current = *start;
                for _ in 0..len {
                    values.push(Value::Int(current));
                    current = current.saturating_add(*step);
                }
                values
            }
            other => return Err(runtime(format!("'{}' object is not iterable", other.type_name()))),
        };
        self.meter.charge(items.len().saturating_mul(SLOT_BYTES))?;
        Ok(items)
    }

    fn assign(&mut self, target: &Target, value: Value) -> Result<(), SandboxError> {
        match target {
            Target::Name(name) => {
                self.variables.insert(name.clone(), value);
                Ok(())
            }
            Target::Subscript { object, index } => {
                let container = self.eval(object)?;
                let index = self.eval(index)?;
                match &container {
                    Value::List(items) => {
                        self.ensure_acyclic(&container, &value)?;
                        self.meter.charge(footprint(&value))?;
                        let mut items = items.borrow_mut();
                        let position = list_index(&index, items.len())?;
                        items[position] = value;
                        Ok(())
                    }
                    Value::Dict(entries) => {
                        let key = dict_key(&index)?;
                        self.ensure_acyclic(&container, &value)?;
                        self.meter.charge(key.len() + footprint(&value))?;
                        entries.borrow_mut().insert(key, value);
                        Ok(())
                    }
                    other => Err(runtime(format!(
                        "'{}' object does not support item assignment",
                        other.type_name()
                    ))),
                }
            }
            Target::Attribute { name, .. } => {
                Err(SandboxError::Forbidden(format!("attribute assignment of '{}'", name)))
            }
        }
    }

    fn load_target(&mut self, target: &Target) -> Result<Value, SandboxError> {
        match target {
            Target::Name(name) => self.lookup(name),
            Target::Subscript { object, index } => {
                let container = self.eval(object)?;
                let index = self.eval(index)?;
                self.subscript(&container, &index)
            }
            Target::Attribute { name, .. } => {
                Err(SandboxError::Forbidden(format!("attribute access of '{}'", name)))
            }
        }
    }

    fn delete(&mut self, target: &Target) -> Result<(), SandboxError> {
        match target {
            Target::Name(name) => self
                .variables
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| runtime(format!("name '{}' is not defined", name))),
            Target::Subscript { object, index } => {
                let container = self.eval(object)?;
                let index = self.eval(index)?;
                match &container {
                    Value::List(items) => {
                        let mut items = items.borrow_mut();
                        let position = list_index(&index, items.len())?;
                        items.remove(position);
                        Ok(())
                    }
                    Value::Dict(entries) => {
                        let key = dict_key(&index)?;
                        entries
                            .borrow_mut()
                            .remove(&key)
                            .map(|_| ())
                            .ok_or_else(|| runtime(format!("KeyError: '{}'", key)))
                    }
                    other => Err(runtime(format!(
                        "'{}' object does not support item deletion",
                        other.type_name()
                    ))),
                }
            }
            Target::Attribute { name, .. } => {
                Err(SandboxError::Forbidden(format!("attribute deletion of '{}'", name)))
            }
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, SandboxError> {
        if let Some(value) = self.variables.get(name) {
            return Ok(value.clone());
        }
        Builtin::lookup(name)
            .map(Value::Builtin)
            .ok_or_else(|| runtime(format!("name '{}' is not defined", name)))
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, SandboxError> {
        self.meter.tick()?;

        match expr {
            Expr::None => Ok(Value::None),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Str(s) => {
                self.meter.charge(s.len())?;
                Ok(Value::Str(s.as_str().into()))
            }
            Expr::FString(_) => Err(SandboxError::Forbidden("string interpolation".to_string())),
            Expr::Name(name) => self.lookup(name),
            Expr::List(items) => {
                let values = items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Result<Vec<_>, _>>()?;
                let bytes: usize = values.iter().map(footprint).sum();
                self.meter.charge(bytes + SLOT_BYTES)?;
                Ok(Value::list(values))
            }
            Expr::Dict(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let key = dict_key(&self.eval(key)?)?;
                    let value = self.eval(value)?;
                    self.meter.charge(key.len() + footprint(&value))?;
                    map.insert(key, value);
                }
                self.meter.charge(SLOT_BYTES)?;
                Ok(Value::dict(map))
            }
            Expr::Subscript { object, index } => {
                let container = self.eval(object)?;
                let index = self.eval(index)?;
                self.subscript(&container, &index)
            }
            Expr::Attribute { name, .. } => Err(runtime(format!(
                "attribute '{}' can only be used as a method call",
                name
            ))),
            Expr::Call { func, args } => {
                if let Expr::Attribute { object, name } = func.as_ref() {
                    let receiver = self.eval(object)?;
                    let args = self.eval_args(args)?;
                    return self.call_method(&receiver, name, args);
                }

                let callee = self.eval(func)?;
                let args = self.eval_args(args)?;
                match callee {
                    Value::Builtin(builtin) => self.call_builtin(builtin, args),
                    other => Err(runtime(format!("'{}' object is not callable", other.type_name()))),
                }
            }
            Expr::Neg(operand) => match self.eval(operand)?.as_int() {
                Some(i) => i
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| runtime("integer overflow")),
                None => Err(runtime("bad operand type for unary -")),
            },
            Expr::Not(operand) => Ok(Value::Bool(!self.eval(operand)?.truthy())),
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.binary(*op, left, right)
            }
            Expr::Compare { left, rest } => {
                let mut current = self.eval(left)?;
                for (op, operand) in rest {
                    let next = self.eval(operand)?;
                    if !self.compare(*op, &current, &next)? {
                        return Ok(Value::Bool(false));
                    }
                    current = next;
                }
                Ok(Value::Bool(true))
            }
            Expr::And(left, right) => {
                let left = self.eval(left)?;
                if !left.truthy() {
                    return Ok(left);
                }
                self.eval(right)
            }
            Expr::Or(left, right) => {
                let left = self.eval(left)?;
                if left.truthy() {
                    return Ok(left);
                }
                self.eval(right)
            }
            Expr::IfElse { cond, then, orelse } => {
                if self.eval(cond)?.truthy() {
                    self.eval(then)
                } else {
                    self.eval(orelse)
                }
            }
        }
    }

    /// Refuses to place `value` inside `container` when `container` is
    /// reachable from `value`; shared lists and dicts never form cycles.
    fn ensure_acyclic(&mut self, container: &Value, value: &Value) -> Result<(), SandboxError> {
        let target = match container.container_id() {
            Some(id) => id,
            None => return Ok(()),
        };
        if value.container_id().is_none() {
            return Ok(());
        }

        let mut pending = vec![value.clone()];
        let mut seen = HashSet::new();
        while let Some(current) = pending.pop() {
            let id = match current.container_id() {
                Some(id) => id,
                None => continue,
            };
            if id == target {
                return Err(runtime("a list or dict cannot contain itself"));
            }
            if !seen.insert(id) {
                continue;
            }
            self.meter.tick()?;
            match &current {
                Value::List(items) => pending.extend(
                    items
                        .borrow()
                        .iter()
                        .filter(|item| item.container_id().is_some())
                        .cloned(),
                ),
                Value::Dict(entries) => pending.extend(
                    entries
                        .borrow()
                        .values()
                        .filter(|item| item.container_id().is_some())
                        .cloned(),
                ),
                _ => {}
            }
        }
        Ok(())
    }

    fn eval_args(&mut self, args: &[Expr]) -> Result<Vec<Value>, SandboxError> {
        args.iter().map(|arg| self.eval(arg)).collect()
    }

    fn subscript(&mut self, container: &Value, index: &Value) -> Result<Value, SandboxError> {
        match container {
            Value::List(items) => {
                let items = items.borrow();
                let position = list_index(index, items.len())?;
                Ok(items[position].clone())
            }
            Value::Dict(entries) => {
                let key = dict_key(index)?;
                entries
                    .borrow()
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| runtime(format!("KeyError: '{}'", key)))
            }
            Value::Str(s) => {
                self.meter.scan(s.len())?;
                let position = list_index(index, s.chars().count())?;
                let c = s
                    .chars()
                    .nth(position)
                    .ok_or_else(|| runtime("index out of range"))?;
                self.meter.charge(c.len_utf8())?;
                Ok(Value::Str(c.to_string().into()))
            }
            other => Err(runtime(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    fn binary(&mut self, op: BinOp, left: Value, right: Value) -> Result<Value, SandboxError> {
        match (op, &left, &right) {
            (BinOp::Add, Value::Str(a), Value::Str(b)) => {
                self.meter.charge(a.len() + b.len())?;
                Ok(Value::Str(format!("{}{}", a, b).into()))
            }
            (BinOp::Add, Value::List(a), Value::List(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                let bytes: usize = items.iter().map(footprint).sum();
                self.meter.charge(bytes + SLOT_BYTES)?;
                Ok(Value::list(items))
            }
            (BinOp::Mul, Value::Str(s), count) | (BinOp::Mul, count, Value::Str(s))
                if count.as_int().is_some() =>
            {
                let times = repeat_count(count)?;
                self.meter.charge(s.len().saturating_mul(times))?;
                Ok(Value::Str(s.repeat(times).into()))
            }
            (BinOp::Mul, Value::List(items), count) | (BinOp::Mul, count, Value::List(items))
                if count.as_int().is_some() =>
            {
                let times = repeat_count(count)?;
                let source = items.borrow();
                let bytes: usize = source.iter().map(footprint).sum();
                self.meter.charge(bytes.saturating_mul(times))?;
                let mut repeated = Vec::with_capacity(source.len().saturating_mul(times));
                for _ in 0..times {
                    repeated.extend(source.iter().cloned());
                }
                Ok(Value::list(repeated))
            }
            _ => {
                let (a, b) = match (left.as_int(), right.as_int()) {
                    (Some(a), Some(b)) => (a, b),
                    _ => {
                        return Err(runtime(format!(
                            "unsupported operand types: {} and {}",
                            left.type_name(),
                            right.type_name()
                        )))
                    }
                };
                integer_op(op, a, b).map(Value::Int)
            }
        }
    }

    fn compare(&mut self, op: CmpOp, left: &Value, right: &Value) -> Result<bool, SandboxError> {
        self.meter
            .scan(shallow_size(left).saturating_add(shallow_size(right)))?;
        match op {
            CmpOp::Eq | CmpOp::Is => left.equals(right, 0),
            CmpOp::NotEq | CmpOp::IsNot => Ok(!left.equals(right, 0)?),
            CmpOp::Lt => Ok(left.compare(right)?.is_lt()),
            CmpOp::LtE => Ok(left.compare(right)?.is_le()),
            CmpOp::Gt => Ok(left.compare(right)?.is_gt()),
            CmpOp::GtE => Ok(left.compare(right)?.is_ge()),
            CmpOp::In => self.contains(right, left),
            CmpOp::NotIn => Ok(!self.contains(right, left)?),
        }
    }

    fn contains(&mut self, container: &Value, item: &Value) -> Result<bool, SandboxError> {
        match container {
            Value::Str(s) => match item {
                Value::Str(needle) => Ok(s.contains(&**needle)),
                other => Err(runtime(format!(
                    "'in <string>' requires string as left operand, not {}",
                    other.type_name()
                ))),
            },
            Value::List(items) => {
                for candidate in items.borrow().iter() {
                    self.meter.tick()?;
                    if candidate.equals(item, 0)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Value::Dict(entries) => match item {
                Value::Str(key) => Ok(entries.borrow().contains_key(&**key)),
                _ => Ok(false),
            },
            Value::Range { start, stop, step } => match item.as_int() {
                Some(i) => {
                    let offset = i128::from(i) - i128::from(*start);
                    let in_bounds = if *step > 0 {
                        i >= *start && i < *stop
                    } else {
                        i <= *start && i > *stop
                    };
                    Ok(in_bounds && offset % i128::from(*step) == 0)
                }
                None => Ok(false),
            },
            other => Err(runtime(format!(
                "argument of type '{}' is not iterable",
                other.type_name()
            ))),
        }
    }

    fn call_builtin(&mut self, builtin: Builtin, args: Vec<Value>) -> Result<Value, SandboxError> {
        match builtin {
            Builtin::Len => {
                let [value] = exactly::<1>(args, "len")?;
                let len = match &value {
                    Value::Str(s) => {
                        self.meter.scan(s.len())?;
                        s.chars().count()
                    }
                    Value::List(items) => items.borrow().len(),
                    Value::Dict(entries) => entries.borrow().len(),
                    Value::Range { start, stop, step } => {
                        usize::try_from(range_len(*start, *stop, *step)).unwrap_or(usize::MAX)
                    }
                    other => {
                        return Err(runtime(format!(
                            "object of type '{}' has no len()",
                            other.type_name()
                        )))
                    }
                };
                Ok(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
            }
            Builtin::Int => {
                let [value] = exactly::<1>(args, "int")?;
                match &value {
                    Value::Str(s) => s
                        .trim()
                        .parse::<i64>()
                        .map(Value::Int)
                        .map_err(|_| runtime(format!("invalid literal for int(): '{}'", s))),
                    other => other.as_int().map(Value::Int).ok_or_else(|| {
                        runtime(format!("int() argument must be a string or a number, not '{}'", other.type_name()))
                    }),
                }
            }
            Builtin::Str => {
                let [value] = exactly::<1>(args, "str")?;
                let text = value.to_display(0)?;
                self.meter.charge(text.len())?;
                Ok(Value::Str(text.into()))
            }
            Builtin::Bool => {
                let [value] = exactly::<1>(args, "bool")?;
                Ok(Value::Bool(value.truthy()))
            }
            Builtin::Abs => {
                let [value] = exactly::<1>(args, "abs")?;
                value
                    .as_int()
                    .and_then(i64::checked_abs)
                    .map(Value::Int)
                    .ok_or_else(|| runtime("bad operand type for abs()"))
            }
            Builtin::Min | Builtin::Max => {
                let candidates = if args.len() == 1 {
                    self.iterate(&args[0])?
                } else {
                    args
                };
                let mut best: Option<Value> = None;
                for candidate in candidates {
                    self.meter.tick()?;
                    best = Some(match best {
                        None => candidate,
                        Some(current) => {
                            let ordering = candidate.compare(&current)?;
                            let replace = if builtin == Builtin::Min {
                                ordering.is_lt()
                            } else {
                                ordering.is_gt()
                            };
                            if replace {
                                candidate
                            } else {
                                current
                            }
                        }
                    });
                }
                best.ok_or_else(|| runtime("min()/max() arg is an empty sequence"))
            }
            Builtin::Sum => {
                let [iterable] = exactly::<1>(args, "sum")?;
                let mut total: i64 = 0;
                for item in self.iterate(&iterable)? {
                    self.meter.tick()?;
                    let value = item
                        .as_int()
                        .ok_or_else(|| runtime("sum() only supports integers"))?;
                    total = total
                        .checked_add(value)
                        .ok_or_else(|| runtime("integer overflow"))?;
                }
                Ok(Value::Int(total))
            }
            Builtin::Range => {
                let ints = args
                    .iter()
                    .map(|arg| {
                        arg.as_int()
                            .ok_or_else(|| runtime("range() arguments must be integers"))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let (start, stop, step) = match ints.as_slice() {
                    [stop] => (0, *stop, 1),
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] => (*start, *stop, *step),
                    _ => return Err(runtime("range expected 1 to 3 arguments")),
                };
                if step == 0 {
                    return Err(runtime("range() arg 3 must not be zero"));
                }
                Ok(Value::Range { start, stop, step })
            }
            Builtin::List => match args.len() {
                0 => Ok(Value::list(Vec::new())),
                1 => {
                    let items = self.iterate(&args[0])?;
                    let bytes: usize = items.iter().map(footprint).sum();
                    self.meter.charge(bytes)?;
                    Ok(Value::list(items))
                }
                _ => Err(runtime("list expected at most 1 argument")),
            },
            Builtin::Dict => {
                if !args.is_empty() {
                    return Err(runtime("dict() takes no arguments"));
                }
                self.meter.charge(SLOT_BYTES)?;
                Ok(Value::dict(BTreeMap::new()))
            }
            Builtin::Print => {
                let parts = args
                    .iter()
                    .map(|arg| arg.to_display(0))
                    .collect::<Result<Vec<_>, _>>()?;
                debug!("contract print: {}", parts.join(" "));
                Ok(Value::None)
            }
            Builtin::Exception => {
                let parts = args
                    .iter()
                    .map(|arg| arg.to_display(0))
                    .collect::<Result<Vec<_>, _>>()?;
                let message = parts.join(" ");
                self.meter.charge(message.len())?;
                Ok(Value::Exception(message))
            }
        }
    }

    fn call_method(
        &mut self,
        receiver: &Value,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, SandboxError> {
        match receiver {
            Value::Dict(entries) => self.dict_method(receiver, entries, name, args),
            Value::List(items) => self.list_method(receiver, items, name, args),
            Value::Str(s) => self.str_method(s, name, args),
            other => Err(runtime(format!(
                "'{}' object has no attribute '{}'",
                other.type_name(),
                name
            ))),
        }
    }

    fn dict_method(
        &mut self,
        receiver: &Value,
        entries: &DictRef,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, SandboxError> {
        match name {
            "get" => {
                let (key, default) = key_and_default(args, "get")?;
                let key = dict_key(&key)?;
                Ok(entries
                    .borrow()
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| default.unwrap_or(Value::None)))
            }
            "keys" | "values" | "items" => {
                exactly::<0>(args, name)?;
                let entries = entries.borrow();
                self.meter.charge(SLOT_BYTES)?;
                let mut items = Vec::with_capacity(entries.len());
                for (k, v) in entries.iter() {
                    let item = match name {
                        "keys" => Value::Str(k.as_str().into()),
                        "values" => v.clone(),
                        _ => {
                            let key = Value::Str(k.as_str().into());
                            self.meter
                                .charge(SLOT_BYTES + footprint(&key) + footprint(v))?;
                            Value::list(vec![key, v.clone()])
                        }
                    };
                    self.meter.charge(footprint(&item))?;
                    items.push(item);
                }
                Ok(Value::list(items))
            }
            "pop" => {
                let (key, default) = key_and_default(args, "pop")?;
                let key = dict_key(&key)?;
                match entries.borrow_mut().remove(&key) {
                    Some(value) => Ok(value),
                    None => default.ok_or_else(|| runtime(format!("KeyError: '{}'", key))),
                }
            }
            "setdefault" => {
                let (key, default) = key_and_default(args, "setdefault")?;
                let key = dict_key(&key)?;
                if let Some(existing) = entries.borrow().get(&key) {
                    return Ok(existing.clone());
                }
                let value = default.unwrap_or(Value::None);
                self.ensure_acyclic(receiver, &value)?;
                self.meter.charge(key.len() + footprint(&value))?;
                entries.borrow_mut().insert(key, value.clone());
                Ok(value)
            }
            "update" => {
                let [other] = exactly::<1>(args, "update")?;
                let other = match &other {
                    Value::Dict(other) => other.borrow().clone(),
                    other => {
                        return Err(runtime(format!(
                            "update() expects a dict, not {}",
                            other.type_name()
                        )))
                    }
                };
                for (key, value) in &other {
                    self.ensure_acyclic(receiver, value)?;
                    self.meter.charge(key.len() + footprint(value))?;
                }
                entries.borrow_mut().extend(other);
                Ok(Value::None)
            }
            _ => Err(runtime(format!("'dict' object has no attribute '{}'", name))),
        }
    }

    fn list_method(
        &mut self,
        receiver: &Value,
        items: &ListRef,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, SandboxError> {
        match name {
            "append" => {
                let [value] = exactly::<1>(args, "append")?;
                self.ensure_acyclic(receiver, &value)?;
                self.meter.charge(footprint(&value))?;
                items.borrow_mut().push(value);
                Ok(Value::None)
            }
            "extend" => {
                let [other] = exactly::<1>(args, "extend")?;
                let extra = self.iterate(&other)?;
                for value in &extra {
                    self.ensure_acyclic(receiver, value)?;
                    self.meter.charge(footprint(value))?;
                }
                items.borrow_mut().extend(extra);
                Ok(Value::None)
            }
            "insert" => {
                let [index, value] = exactly::<2>(args, "insert")?;
                let index = index
                    .as_int()
                    .ok_or_else(|| runtime("list indices must be integers"))?;
                self.ensure_acyclic(receiver, &value)?;
                self.meter.charge(footprint(&value))?;
                let mut items = items.borrow_mut();
                let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
                let position = if index < 0 { (len + index).max(0) } else { index.min(len) };
                items.insert(usize::try_from(position).unwrap_or(0), value);
                Ok(Value::None)
            }
            "pop" => {
                let mut items = items.borrow_mut();
                if items.is_empty() {
                    return Err(runtime("pop from empty list"));
                }
                let position = match args.as_slice() {
                    [] => items.len() - 1,
                    [index] => list_index(index, items.len())?,
                    _ => return Err(runtime("pop expected at most 1 argument")),
                };
                Ok(items.remove(position))
            }
            "index" => {
                let [needle] = exactly::<1>(args, "index")?;
                let snapshot = items.borrow().clone();
                for (position, candidate) in snapshot.iter().enumerate() {
                    self.meter.tick()?;
                    if candidate.equals(&needle, 0)? {
                        return Ok(Value::Int(i64::try_from(position).unwrap_or(i64::MAX)));
                    }
                }
                Err(runtime("value is not in list"))
            }
            _ => Err(runtime(format!("'list' object has no attribute '{}'", name))),
        }
    }

    fn str_method(&mut self, s: &str, name: &str, args: Vec<Value>) -> Result<Value, SandboxError> {
        let result = match name {
            "upper" | "lower" | "strip" => {
                exactly::<0>(args, name)?;
                self.meter.charge(s.len())?;
                let text = match name {
                    "upper" => s.to_uppercase(),
                    "lower" => s.to_lowercase(),
                    _ => s.trim().to_string(),
                };
                // Case mapping can grow a string.
                self.meter.charge(text.len().saturating_sub(s.len()))?;
                Value::Str(text.into())
            }
            "startswith" | "endswith" => {
                let [prefix] = exactly::<1>(args, name)?;
                let prefix = string_arg(&prefix, name)?;
                self.meter.scan(prefix.len())?;
                Value::Bool(if name == "startswith" {
                    s.starts_with(&*prefix)
                } else {
                    s.ends_with(&*prefix)
                })
            }
            "split" => {
                let parts: Vec<Value> = match args.as_slice() {
                    [] => s.split_whitespace().map(|p| Value::Str(p.into())).collect(),
                    [separator] => {
                        let separator = string_arg(separator, name)?;
                        if separator.is_empty() {
                            return Err(runtime("empty separator"));
                        }
                        s.split(&*separator).map(|p| Value::Str(p.into())).collect()
                    }
                    _ => return Err(runtime("split expected at most 1 argument")),
                };
                self.meter
                    .charge(s.len() + parts.len().saturating_mul(SLOT_BYTES))?;
                Value::list(parts)
            }
            "replace" => {
                let [old, new] = exactly::<2>(args, name)?;
                let (old, new) = (string_arg(&old, name)?, string_arg(&new, name)?);
                if old.is_empty() {
                    return Err(runtime("replace() with an empty pattern is not supported"));
                }
                self.meter.scan(s.len())?;
                let occurrences = s.matches(&*old).count();
                self.meter
                    .charge(s.len().saturating_add(occurrences.saturating_mul(new.len())))?;
                Value::Str(s.replace(&*old, &new).into())
            }
            "join" => {
                let [iterable] = exactly::<1>(args, name)?;
                let parts = self
                    .iterate(&iterable)?
                    .iter()
                    .map(|part| string_arg(part, name))
                    .collect::<Result<Vec<_>, _>>()?;
                let joined = parts.join(s);
                self.meter.charge(joined.len())?;
                Value::Str(joined.into())
            }
            _ => return Err(runtime(format!("'str' object has no attribute '{}'", name))),
        };
        Ok(result)
    }
}

fn exactly<const N: usize>(args: Vec<Value>, name: &str) -> Result<[Value; N], SandboxError> {
    let count = args.len();
    args.try_into()
        .map_err(|_| runtime(format!("{}() takes {} argument(s) ({} given)", name, N, count)))
}

fn key_and_default(args: Vec<Value>, name: &str) -> Result<(Value, Option<Value>), SandboxError> {
    let mut args = args.into_iter();
    match (args.next(), args.next(), args.next()) {
        (Some(key), default, None) => Ok((key, default)),
        _ => Err(runtime(format!("{}() takes 1 or 2 arguments", name))),
    }
}

fn string_arg(value: &Value, name: &str) -> Result<Rc<str>, SandboxError> {
    match value {
        Value::Str(s) => Ok(Rc::clone(s)),
        other => Err(runtime(format!(
            "{}() expects str, not {}",
            name,
            other.type_name()
        ))),
    }
}

fn dict_key(index: &Value) -> Result<String, SandboxError> {
    match index {
        Value::Str(s) => Ok(s.to_string()),
        other => Err(runtime(format!(
            "dict keys must be strings, not {}",
            other.type_name()
        ))),
    }
}

fn list_index(index: &Value, len: usize) -> Result<usize, SandboxError> {
    let raw = index
        .as_int()
        .ok_or_else(|| runtime("indices must be integers"))?;
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let resolved = if raw < 0 { raw + len_i } else { raw };
    if resolved < 0 || resolved >= len_i {
        return Err(runtime("index out of range"));
    }
    usize::try_from(resolved).map_err(|_| runtime("index out of range"))
}

fn repeat_count(count: &Value) -> Result<usize, SandboxError> {
    let times = count
        .as_int()
        .ok_or_else(|| runtime("can't multiply sequence by non-int"))?;
    Ok(usize::try_from(times.max(0)).unwrap_or(0))
}

fn integer_op(op: BinOp, a: i64, b: i64) -> Result<i64, SandboxError> {
    let overflow = || runtime("integer overflow");
    match op {
        BinOp::Add => a.checked_add(b).ok_or_else(overflow),
        BinOp::Sub => a.checked_sub(b).ok_or_else(overflow),
        BinOp::Mul => a.checked_mul(b).ok_or_else(overflow),
        BinOp::Div => Err(runtime("true division is not supported; use //")),
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(runtime("integer division by zero"));
            }
            let quotient = a.checked_div(b).ok_or_else(overflow)?;
            if a % b != 0 && ((a < 0) != (b < 0)) {
                Ok(quotient - 1)
            } else {
                Ok(quotient)
            }
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(runtime("integer modulo by zero"));
            }
            let remainder = a.checked_rem(b).ok_or_else(overflow)?;
            if remainder != 0 && ((remainder < 0) != (b < 0)) {
                Ok(remainder + b)
            } else {
                Ok(remainder)
            }
        }
        BinOp::Pow => {
            if b < 0 {
                return Err(runtime("negative exponents are not supported"));
            }
            let exponent = u32::try_from(b).map_err(|_| overflow())?;
            a.checked_pow(exponent).ok_or_else(overflow)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::contract::parser::parse;
    use crate::blockchain::crypto::Address;
    use serde_json::json;
    use std::time::Duration;

    fn limits() -> SandboxLimits {
        SandboxLimits {
            max_steps: 50_000,
            max_memory_bytes: 1 << 20,
            timeout: Duration::from_secs(5),
            max_code_bytes: 1 << 16,
        }
    }

    fn context(payload: &str) -> CallContext {
        CallContext {
            sender: Address("ab".repeat(32)),
            payload: Some(payload.to_string()),
            amount: 7,
        }
    }

    fn execute(source: &str, storage: &Storage) -> Result<Storage, SandboxError> {
        let program = parse(source)?;
        let mut meter = Meter::new(&limits(), Arc::new(AtomicBool::new(false)));
        run(&program, storage, &context("go"), &mut meter)
    }

    #[test]
    fn test_counter_increments() {
        let source = "storage['counter'] = storage.get('counter', 0) + 1\n";
        let once = execute(source, &Storage::new()).unwrap();
        assert_eq!(once.get("counter"), Some(&json!(1)));

        let twice = execute(source, &once).unwrap();
        assert_eq!(twice.get("counter"), Some(&json!(2)));
    }

    #[test]
    fn test_message_context() {
        let source = "\
storage['who'] = msg['sender']
storage['paid'] = msg['value'] * 2
if msg['data'] == 'go':
    storage['went'] = True
";
        let storage = execute(source, &Storage::new()).unwrap();
        assert_eq!(storage["who"], json!("ab".repeat(32)));
        assert_eq!(storage["paid"], json!(14));
        assert_eq!(storage["went"], json!(true));
    }

    #[test]
    fn test_containers_and_builtins() {
        let source = "\
items = [3, 1, 2]
items.append(5)
storage['n'] = len(items)
storage['max'] = max(items)
storage['min'] = min(4, 9)
storage['sum'] = sum(range(5))
storage['words'] = 'a b c'.split()
storage['joined'] = '-'.join(['x', 'y'])
book = {}
book['k'] = book.get('k', []) + [1]
storage['book'] = book
storage['neg'] = -7 // 2
storage['mod'] = -7 % 3
storage['has'] = 2 in items and 'k' in book and 'zz' not in book
storage['label'] = 'big' if len(items) > 3 else 'small'
total = 0
for i in range(10):
    if i % 2 == 0:
        continue
    if i > 7:
        break
    total += i
storage['odd'] = total
";
        let storage = execute(source, &Storage::new()).unwrap();
        assert_eq!(storage["n"], json!(4));
        assert_eq!(storage["max"], json!(5));
        assert_eq!(storage["min"], json!(4));
        assert_eq!(storage["sum"], json!(10));
        assert_eq!(storage["words"], json!(["a", "b", "c"]));
        assert_eq!(storage["joined"], json!("x-y"));
        assert_eq!(storage["book"], json!({"k": [1]}));
        assert_eq!(storage["neg"], json!(-4));
        assert_eq!(storage["mod"], json!(2));
        assert_eq!(storage["has"], json!(true));
        assert_eq!(storage["label"], json!("big"));
        assert_eq!(storage["odd"], json!(1 + 3 + 5 + 7));
    }

    #[test]
    fn test_shared_references() {
        let source = "\
storage['list'] = []
alias = storage['list']
alias.append(1)
";
        let storage = execute(source, &Storage::new()).unwrap();
        assert_eq!(storage["list"], json!([1]));
    }

    #[test]
    fn test_runtime_errors() {
        let failing = [
            "raise Exception('boom')",
            "x = 1 // 0",
            "x = {}['missing']",
            "x = undefined_name",
            "x = 9223372036854775807 + 1",
            "x = 5 / 2",
            "assert 1 == 2, 'nope'",
            "x = [1][3]",
            "x = len(5)",
            "storage.missing()",
            "x = 'a' < 1",
        ];

        for source in failing {
            assert!(
                matches!(execute(source, &Storage::new()), Err(SandboxError::Runtime(_))),
                "did not fail: {}",
                source
            );
        }
    }

    #[test]
    fn test_step_limit() {
        let result = execute("while True:\n    pass\n", &Storage::new());
        assert!(matches!(result, Err(SandboxError::OutOfSteps)));
    }

    #[test]
    fn test_memory_limit() {
        let result = execute("x = 'a' * 100000000\n", &Storage::new());
        assert!(matches!(result, Err(SandboxError::MemoryLimit)));

        let result = execute("x = []\nwhile True:\n    x.append(1)\n", &Storage::new());
        assert!(matches!(
            result,
            Err(SandboxError::MemoryLimit) | Err(SandboxError::OutOfSteps)
        ));
    }

    #[test]
    fn test_cancellation_is_observed() {
        let program = parse("while True:\n    pass\n").unwrap();
        let cancel = Arc::new(AtomicBool::new(true));
        let mut meter = Meter::new(&limits(), cancel);

        let result = run(&program, &Storage::new(), &context("go"), &mut meter);
        assert!(matches!(result, Err(SandboxError::Timeout)));
    }

    #[test]
    fn test_non_serializable_storage() {
        let result = execute("storage['f'] = len\n", &Storage::new());
        assert!(matches!(result, Err(SandboxError::NonSerializable(_))));

        let result = execute("storage = 5\n", &Storage::new());
        assert!(matches!(result, Err(SandboxError::NonSerializable(_))));

        let result = execute("storage['r'] = range(3)\n", &Storage::new());
        assert!(matches!(result, Err(SandboxError::NonSerializable(_))));
    }

    #[test]
    fn test_each_stored_copy_of_a_string_is_charged() {
        let source = "\
s = 'a' * 524288
l = []
for i in range(200):
    l.append(s)
storage['n'] = len(l)
";
        assert_eq!(execute(source, &Storage::new()), Err(SandboxError::MemoryLimit));

        let source = "s = 'a' * 400000\nt = s.upper()\nu = s.lower()\nv = s.strip()\n";
        assert_eq!(execute(source, &Storage::new()), Err(SandboxError::MemoryLimit));

        let storage = execute("s = 'ab'\nl = [s, s]\nstorage['n'] = len(l)\n", &Storage::new()).unwrap();
        assert_eq!(storage["n"], json!(2));
    }

    #[test]
    fn test_containers_cannot_hold_themselves() {
        let cyclic = [
            "a = []\na.append(a)\n",
            "a = []\nb = [a]\na.append(b)\n",
            "d = {}\nd['self'] = d\n",
            "a = [0]\na[0] = a\n",
            "a = []\na.extend([a])\n",
            "a = []\na.insert(0, {'x': a})\n",
            "d = {}\nd.update({'x': d})\n",
            "d = {}\nd.setdefault('x', [d])\n",
        ];
        for source in cyclic {
            let result = execute(source, &Storage::new());
            assert!(matches!(result, Err(SandboxError::Runtime(_))), "{}", source);
        }

        let storage = execute(
            "a = [1]\nb = [a, a]\nc = {'x': b, 'y': a}\nstorage['n'] = len(c['x'])\n",
            &Storage::new(),
        )
        .unwrap();
        assert_eq!(storage["n"], json!(2));
    }

    #[test]
    fn test_deep_chains_are_released() {
        let roomy = SandboxLimits {
            max_steps: 2_000_000,
            max_memory_bytes: 64 << 20,
            ..limits()
        };
        let run_with = |source: &str| -> Result<Storage, SandboxError> {
            let program = parse(source)?;
            let mut meter = Meter::new(&roomy, Arc::new(AtomicBool::new(false)));
            run(&program, &Storage::new(), &context("go"), &mut meter)
        };

        let nested = "a = []\nfor i in range(100000):\n    a = [a]\n";
        assert_eq!(run_with(nested), Ok(Storage::new()));

        let downward = "\
root = []
node = root
for i in range(100000):
    child = []
    node.append(child)
    node = child
storage['root'] = root
";
        assert!(matches!(run_with(downward), Err(SandboxError::Runtime(_))));
    }
}
