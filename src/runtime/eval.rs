//! Fuel-bounded IR evaluator.
//!
//! Executes procedure bodies through the emitter's instruction stream and
//! evaluates expressions by walking the tree. Frames are keyed by slot
//! identity, so reparented slots need no renumbering.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use super::{
    builtins::Builtin,
    env::Environment,
    error::RuntimeError,
    fuel::Fuel,
    value::{Closure, Procedure, Value},
};
use crate::compiler::{
    emit::{emit, Insn, Label},
    sexpr::Symbol,
    scope::{TemplateRef, VariableKind},
    tree_il::{BinaryOp, Convention, Entry, Expr, Field, RuntimeService, Type},
    CompiledUnit,
};

pub type Code = Arc<[Insn]>;
pub type Frames = Option<Arc<Frame>>;

pub struct Frame {
    slots: Mutex<HashMap<usize, Value>>,
    parent: Frames,
}

impl Frame {
    pub fn new(parent: Frames) -> Arc<Frame> {
        Arc::new(Frame {
            slots: Mutex::new(HashMap::new()),
            parent,
        })
    }

    fn find(frames: &Frames, addr: usize) -> Option<Value> {
        let mut current = frames.as_ref();
        while let Some(frame) = current {
            if let Some(value) = frame.slots.lock().get(&addr) {
                return Some(value.clone());
            }
            current = frame.parent.as_ref();
        }
        None
    }

    /// Stores `value` in the frame holding `addr`, or in the innermost frame
    /// when no frame holds it yet. `writable` vets the frame first.
    fn assign(
        frames: &Frames,
        name: Symbol,
        addr: usize,
        value: Value,
        writable: impl Fn(&Arc<Frame>) -> bool,
    ) -> Result<(), RuntimeError> {
        let mut current = frames.as_ref();
        while let Some(frame) = current {
            let mut slots = frame.slots.lock();
            if let Some(slot) = slots.get_mut(&addr) {
                if !writable(frame) {
                    return Err(RuntimeError::Escape(name));
                }
                *slot = value;
                return Ok(());
            }
            drop(slots);
            current = frame.parent.as_ref();
        }
        match frames {
            Some(frame) if writable(frame) => {
                frame.slots.lock().insert(addr, value);
                Ok(())
            }
            Some(_) => Err(RuntimeError::Escape(name)),
            None => Err(RuntimeError::Internal(
                "write to a local slot outside any frame".into(),
            )),
        }
    }
}

/// Instruction stream of `template`, emitted on first use.
pub fn code_of(template: &TemplateRef) -> Result<Code, RuntimeError> {
    if let Some(code) = template.get().code.clone() {
        return Ok(code);
    }
    let body = template.get().body.clone();
    let Some(body) = body else {
        let name = template.get().name;
        return Err(RuntimeError::Internal(format!("procedure {} has no body", name)));
    };
    let code: Code = emit(&body).into();
    template.get_mut().code = Some(code.clone());
    Ok(code)
}

/// Private state of a sealed machine. Global writes land in `globals`
/// instead of the shared environment, and only frames in `frames` may be
/// written.
#[derive(Default)]
struct Seal {
    globals: HashMap<Symbol, Value>,
    frames: Vec<Arc<Frame>>,
}

impl Seal {
    fn owns(&self, frame: &Arc<Frame>) -> bool {
        self.frames.iter().any(|own| Arc::ptr_eq(own, frame))
    }
}

pub struct Machine {
    env: Arc<Environment>,
    fuel: Fuel,
    seal: Option<Seal>,
}

impl Machine {
    pub fn new(env: Arc<Environment>) -> Self {
        Self {
            env,
            fuel: Fuel::unlimited(),
            seal: None,
        }
    }

    /// Keeps every effect of this machine to itself: the shared environment
    /// and frames created elsewhere are never written. Writes to closed-over
    /// variables of outside closures fail with [`RuntimeError::Escape`].
    pub fn sealed(mut self) -> Self {
        self.seal = Some(Seal::default());
        self
    }

    /// Whether a sealed machine has written any global.
    pub fn wrote_globals(&self) -> bool {
        self.seal.as_ref().map_or(false, |seal| !seal.globals.is_empty())
    }

    fn new_frame(&mut self, parent: Frames) -> Arc<Frame> {
        let frame = Frame::new(parent);
        if let Some(seal) = &mut self.seal {
            seal.frames.push(frame.clone());
        }
        frame
    }

    /// Machine with an empty environment.
    pub fn detached() -> Self {
        Self::new(Arc::new(Environment::new()))
    }

    pub fn with_fuel(mut self, fuel: Fuel) -> Self {
        self.fuel = fuel;
        self
    }

    pub fn fuel(&self) -> &Fuel {
        &self.fuel
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    fn tick(&mut self) -> Result<(), RuntimeError> {
        self.fuel.consume(1);
        if self.fuel.should_continue() {
            Ok(())
        } else {
            Err(RuntimeError::OutOfFuel)
        }
    }

    pub fn run_unit(&mut self, unit: &CompiledUnit) -> Result<Value, RuntimeError> {
        let frame = self.new_frame(None);
        self.run(&unit.code, &Some(frame))
    }

    pub fn run(&mut self, code: &[Insn], frames: &Frames) -> Result<Value, RuntimeError> {
        let labels = code
            .iter()
            .enumerate()
            .filter_map(|(pc, insn)| match insn {
                Insn::Mark(label) => Some((*label, pc)),
                _ => None,
            })
            .collect::<HashMap<Label, usize>>();
        let target = |label: &Label| {
            labels
                .get(label)
                .copied()
                .ok_or_else(|| RuntimeError::Internal(format!("branch to unmarked {:?}", label)))
        };

        let mut pc = 0;
        while pc < code.len() {
            self.tick()?;
            match &code[pc] {
                Insn::Mark(_) | Insn::Position(_) | Insn::HidePosition => pc += 1,
                Insn::Br(label) => pc = target(label)?,
                Insn::BrFalse(test, label) => {
                    if self.eval(test, frames)?.is_true() {
                        pc += 1;
                    } else {
                        pc = target(label)?;
                    }
                }
                Insn::Eval(e) => {
                    self.eval(e, frames)?;
                    pc += 1;
                }
                Insn::Ret(e) => return self.eval(e, frames),
            }
        }
        Ok(Value::Unspecified)
    }

    fn eval_args(&mut self, args: &[Expr], frames: &Frames) -> Result<Vec<Value>, RuntimeError> {
        args.iter().map(|arg| self.eval(arg, frames)).collect()
    }

    fn unpack(packed: Vec<Value>) -> Result<Vec<Value>, RuntimeError> {
        match packed.as_slice() {
            [Value::Vector(xs)] => Ok(xs.to_vec()),
            _ => Err(RuntimeError::Internal("malformed packed arguments".into())),
        }
    }

    pub fn eval(&mut self, expr: &Expr, frames: &Frames) -> Result<Value, RuntimeError> {
        self.tick()?;
        match expr {
            Expr::Constant(datum) => Ok(Value::from_datum(datum)),
            Expr::Read(slot) => {
                let (name, kind, addr) = {
                    let s = slot.get();
                    (s.name, s.kind, slot.addr())
                };
                if kind == VariableKind::Global {
                    if let Some(value) = self.seal.as_ref().and_then(|seal| seal.globals.get(&name)) {
                        return Ok(value.clone());
                    }
                    return self
                        .env
                        .lookup(name)
                        .map(|binding| binding.value())
                        .ok_or(RuntimeError::Unbound(name));
                }
                Frame::find(frames, addr).ok_or(RuntimeError::Uninitialized(name))
            }
            Expr::Write(slot, value) => {
                let value = self.eval(value, frames)?;
                let (name, kind) = {
                    let s = slot.get();
                    (s.name, s.kind)
                };
                match (&mut self.seal, kind) {
                    (Some(seal), VariableKind::Global) => {
                        seal.globals.insert(name, value);
                    }
                    (None, VariableKind::Global) => self.env.define(name, value),
                    (Some(seal), _) => {
                        Frame::assign(frames, name, slot.addr(), value, |f| seal.owns(f))?
                    }
                    (None, _) => Frame::assign(frames, name, slot.addr(), value, |_| true)?,
                }
                Ok(Value::Unspecified)
            }
            Expr::Call(call) => {
                let callee = self.eval(&call.callee, frames)?;
                let mut args = self.eval_args(&call.args, frames)?;
                if call.convention == Convention::Packed {
                    args = Self::unpack(args)?;
                }
                self.apply(&callee, args)
            }
            Expr::Invoke(invoke) => {
                let mut args = self.eval_args(&invoke.args, frames)?;
                if invoke.entry == Entry::Packed {
                    args = Self::unpack(args)?;
                }
                let env = if invoke.needs_context {
                    match args.first() {
                        Some(Value::Context(env)) => {
                            let env = env.clone();
                            args.remove(0);
                            env
                        }
                        _ => {
                            return Err(RuntimeError::Internal(
                                "direct invocation without its context".into(),
                            ))
                        }
                    }
                } else {
                    None
                };
                self.invoke(&invoke.template, env, args)
            }
            Expr::Native(native) => {
                let mut args = self.eval_args(&native.args, frames)?;
                if native.builtin.overloads[native.overload].needs_context && !args.is_empty() {
                    args.remove(0);
                }
                self.call_native(&native.builtin, native.overload, &args)
            }
            Expr::Runtime(RuntimeService::MakeList, args) => {
                Ok(Value::list(self.eval_args(args, frames)?))
            }
            Expr::Runtime(RuntimeService::ValuesToArray, args) => {
                let [producer] = args.as_slice() else {
                    return Err(RuntimeError::Internal("values->array takes one argument".into()));
                };
                Ok(match self.eval(producer, frames)? {
                    Value::Values(vs) => Value::Vector(vs),
                    single => Value::Vector(Arc::from(vec![single])),
                })
            }
            Expr::MakeClosure(template) => Ok(Value::Procedure(Procedure::Closure(Arc::new(
                Closure {
                    template: template.clone(),
                    env: frames.clone(),
                },
            )))),
            Expr::Conditional(test, then, els) => {
                if self.eval(test, frames)?.is_true() {
                    self.eval(then, frames)
                } else {
                    self.eval(els, frames)
                }
            }
            Expr::Sequence(prefix, tail) => {
                for e in prefix {
                    self.eval(e, frames)?;
                }
                self.eval(tail, frames)
            }
            Expr::TypeTest(e, ty) => Ok(Value::Boolean(self.eval(e, frames)?.is_type(*ty))),
            Expr::Convert(e, ty) => {
                let value = self.eval(e, frames)?;
                match ty {
                    Type::Callable if !matches!(value, Value::Procedure(_)) => {
                        Err(RuntimeError::NotAProcedure(value.to_string()))
                    }
                    Type::Vector | Type::ObjectArray if !matches!(value, Value::Vector(_)) => {
                        Err(RuntimeError::wrong_type("convert", "vector", &value))
                    }
                    _ => Ok(value),
                }
            }
            Expr::Binary(op, l, r) => {
                let l = self.eval(l, frames)?;
                let r = self.eval(r, frames)?;
                let same = l.eq(&r);
                Ok(Value::Boolean(match op {
                    BinaryOp::Eq => same,
                    BinaryOp::NotEq => !same,
                }))
            }
            Expr::NewArray(Type::Byte, elems) => {
                let bytes = self
                    .eval_args(elems, frames)?
                    .iter()
                    .map(|v| match v {
                        Value::Fixnum(x) => {
                            u8::try_from(*x).map_err(|_| RuntimeError::wrong_type("bytevector", "byte", v))
                        }
                        other => Err(RuntimeError::wrong_type("bytevector", "byte", other)),
                    })
                    .collect::<Result<Vec<u8>, _>>()?;
                Ok(Value::Bytevector(bytes.into()))
            }
            Expr::NewArray(_, elems) => Ok(Value::Vector(self.eval_args(elems, frames)?.into())),
            Expr::ArrayIndex(e, index) => match self.eval(e, frames)? {
                Value::Vector(xs) => xs.get(*index).cloned().ok_or(RuntimeError::IndexOutOfRange {
                    index: *index,
                    len: xs.len(),
                }),
                other => Err(RuntimeError::wrong_type("array-index", "vector", &other)),
            },
            Expr::FieldRead(Field::Unspecified) => Ok(Value::Unspecified),
            Expr::FieldRead(Field::Uninitialized) => Ok(Value::Uninitialized),
            Expr::Context => Ok(Value::Context(frames.clone())),
        }
    }

    pub fn call_native(
        &mut self,
        builtin: &Builtin,
        overload: usize,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let overload = &builtin.overloads[overload];
        if !overload.accepts_count(args.len()) {
            return Err(RuntimeError::Arity {
                procedure: builtin.name.to_string(),
                expected: overload.params.len().to_string(),
                got: args.len(),
            });
        }
        (overload.fun)(self, args)
    }

    /// Calls a procedure value with already evaluated arguments.
    pub fn apply(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, RuntimeError> {
        match callee {
            Value::Procedure(Procedure::Builtin(builtin)) => {
                let overload = builtin.select(&args)?;
                self.call_native(builtin, overload, &args)
            }
            Value::Procedure(Procedure::Closure(closure)) => {
                let (required, rest, name) = {
                    let t = closure.template.get();
                    (t.required(), t.rest, t.name)
                };
                let arity_error = || RuntimeError::Arity {
                    procedure: name.to_string(),
                    expected: if rest {
                        format!("at least {}", required)
                    } else {
                        required.to_string()
                    },
                    got: args.len(),
                };
                if rest {
                    if args.len() < required {
                        return Err(arity_error());
                    }
                    let mut args = args;
                    let surplus = args.split_off(required);
                    args.push(Value::list(surplus));
                    self.invoke(&closure.template, closure.env.clone(), args)
                } else {
                    if args.len() != required {
                        return Err(arity_error());
                    }
                    self.invoke(&closure.template, closure.env.clone(), args)
                }
            }
            other => Err(RuntimeError::NotAProcedure(other.to_string())),
        }
    }

    /// Runs `template` with one value per parameter slot.
    pub fn invoke(
        &mut self,
        template: &TemplateRef,
        env: Frames,
        args: Vec<Value>,
    ) -> Result<Value, RuntimeError> {
        let params = template.get().parameters.clone();
        if params.len() != args.len() {
            return Err(RuntimeError::Arity {
                procedure: template.get().name.to_string(),
                expected: params.len().to_string(),
                got: args.len(),
            });
        }
        let frame = self.new_frame(env);
        {
            let mut slots = frame.slots.lock();
            for (param, arg) in params.iter().zip(args) {
                slots.insert(param.addr(), arg);
            }
        }
        let code = code_of(template)?;
        self.run(&code, &Some(frame))
    }
}
