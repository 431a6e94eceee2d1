//! Stack-machine interpreter.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::result::{ExceptionInfo, OutputStream};

use super::program::{CompiledScript, Instr, Program, ValueType};
use super::value::Value;

/// Receives console output and explicit dumps from running code.
pub trait ScriptHost {
    fn write(&self, stream: OutputStream, text: &str);
    fn dump(&self, value: &Value, header: Option<&str>);
}

pub(crate) fn exception(type_name: &str, message: impl Into<String>) -> ExceptionInfo {
    ExceptionInfo::new(type_name, message)
}

fn invalid_program(message: impl Into<String>) -> ExceptionInfo {
    exception("InvalidProgramException", message)
}

/// Run every unit in order and return the submission's result, if it
/// produced one.
///
/// `interrupt` is polled on backward jumps; once set, the run faults with
/// `OperationCanceledException`.
pub fn run(
    script: &CompiledScript,
    host: &dyn ScriptHost,
    interrupt: &AtomicBool,
) -> Result<Option<Value>, ExceptionInfo> {
    let mut slots = vec![Value::Null; script.slots as usize];
    let mut result = None;

    for unit in &script.units {
        let mut machine = Machine {
            program: unit,
            slots: &mut slots,
            stack: Vec::new(),
            host,
            interrupt,
        };
        match machine.run() {
            Ok(value) => {
                if !unit.is_reference {
                    result = value;
                }
            }
            Err((fault, pc)) => {
                let fault = match unit.positions.get(pc) {
                    Some(pos) => {
                        fault.with_frame(format!("at {}:{}:{}", unit.name, pos.line, pos.column))
                    }
                    None => fault,
                };
                if unit.is_reference {
                    return Err(exception(
                        "ReferenceLoadException",
                        format!("reference '{}' failed to load", unit.name),
                    )
                    .with_inner(fault));
                }
                return Err(fault);
            }
        }
    }

    Ok(result)
}

struct Machine<'a> {
    program: &'a Program,
    slots: &'a mut Vec<Value>,
    stack: Vec<Value>,
    host: &'a dyn ScriptHost,
    interrupt: &'a AtomicBool,
}

type Fault = (ExceptionInfo, usize);

impl Machine<'_> {
    fn pop(&mut self) -> Result<Value, ExceptionInfo> {
        self.stack
            .pop()
            .ok_or_else(|| invalid_program("evaluation stack underflow"))
    }

    fn pop_bool(&mut self) -> Result<bool, ExceptionInfo> {
        match self.pop()? {
            Value::Bool(b) => Ok(b),
            other => Err(exception(
                "InvalidOperationException",
                format!("condition must be of type 'bool', found '{}'", other.type_name()),
            )),
        }
    }

    fn slot(&mut self, index: u32) -> Result<&mut Value, ExceptionInfo> {
        self.slots
            .get_mut(index as usize)
            .ok_or_else(|| invalid_program(format!("variable slot {} out of range", index)))
    }

    fn run(&mut self) -> Result<Option<Value>, Fault> {
        let program = self.program;
        let mut pc = 0usize;
        let mut result = None;

        loop {
            let Some(instr) = program.instrs.get(pc) else {
                return Err((invalid_program("execution ran past the end of the program"), pc));
            };
            if matches!(instr, Instr::Halt) {
                return Ok(result);
            }

            let next = self.step(instr, pc, &mut result).map_err(|e| (e, pc))?;
            if next <= pc && self.interrupt.load(Ordering::Relaxed) {
                return Err((
                    exception("OperationCanceledException", "the execution was aborted"),
                    pc,
                ));
            }
            pc = next;
        }
    }

    /// Execute one instruction and return the next program counter.
    fn step(
        &mut self,
        instr: &Instr,
        pc: usize,
        result: &mut Option<Value>,
    ) -> Result<usize, ExceptionInfo> {
        match instr {
            Instr::PushInt(v) => self.stack.push(Value::Int(*v)),
            Instr::PushDouble(v) => self.stack.push(Value::Double(*v)),
            Instr::PushBool(v) => self.stack.push(Value::Bool(*v)),
            Instr::PushStr(s) => self.stack.push(Value::Str(s.clone())),
            Instr::PushNull => self.stack.push(Value::Null),
            Instr::Load(slot) => {
                let value = self.slot(*slot)?.clone();
                self.stack.push(value);
            }
            Instr::Store(slot) => {
                let value = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or_else(|| invalid_program("evaluation stack underflow"))?;
                *self.slot(*slot)? = value;
            }
            Instr::Coerce(ty) => {
                let value = self.pop()?;
                self.stack.push(coerce(value, *ty)?);
            }
            Instr::Neg => {
                let value = match self.pop()? {
                    Value::Int(v) => Value::Int(v.checked_neg().ok_or_else(overflow)?),
                    Value::Double(v) => Value::Double(-v),
                    other => return Err(unary_error("-", &other)),
                };
                self.stack.push(value);
            }
            Instr::Not => {
                let value = match self.pop()? {
                    Value::Bool(b) => Value::Bool(!b),
                    other => return Err(unary_error("!", &other)),
                };
                self.stack.push(value);
            }
            Instr::Add
            | Instr::Sub
            | Instr::Mul
            | Instr::Div
            | Instr::Rem
            | Instr::Eq
            | Instr::Ne
            | Instr::Lt
            | Instr::Le
            | Instr::Gt
            | Instr::Ge => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.stack.push(binary(instr, left, right)?);
            }
            Instr::Jump(target) => return Ok(*target as usize),
            Instr::JumpIfFalse(target) => {
                if !self.pop_bool()? {
                    return Ok(*target as usize);
                }
            }
            Instr::JumpIfTrue(target) => {
                if self.pop_bool()? {
                    return Ok(*target as usize);
                }
            }
            Instr::AssertBool => match self.stack.last() {
                Some(Value::Bool(_)) => {}
                Some(other) => {
                    return Err(exception(
                        "InvalidOperationException",
                        format!(
                            "operands of '&&' and '||' must be of type 'bool', found '{}'",
                            other.type_name()
                        ),
                    ));
                }
                None => return Err(invalid_program("evaluation stack underflow")),
            },
            Instr::Call { builtin, argc } => {
                let argc = *argc as usize;
                let (min, max) = builtin.arity();
                if argc < min || argc > max || argc > self.stack.len() {
                    return Err(invalid_program(format!(
                        "bad call to '{}' with {} argument(s)",
                        builtin.qualified_name(),
                        argc
                    )));
                }
                let args = self.stack.split_off(self.stack.len() - argc);
                let value = builtin.call(args, self.host)?;
                self.stack.push(value);
            }
            Instr::Pop => {
                self.pop()?;
            }
            Instr::Throw => {
                let value = self.pop()?;
                return Err(exception("Exception", value.to_string()));
            }
            Instr::SetResult => {
                *result = Some(self.pop()?);
            }
            Instr::Halt => {}
        }
        Ok(pc + 1)
    }
}

fn overflow() -> ExceptionInfo {
    exception(
        "OverflowException",
        "arithmetic operation resulted in an overflow",
    )
}

fn divide_by_zero() -> ExceptionInfo {
    exception("DivideByZeroException", "attempted to divide by zero")
}

fn unary_error(op: &str, value: &Value) -> ExceptionInfo {
    exception(
        "InvalidOperationException",
        format!(
            "operator '{}' cannot be applied to operand of type '{}'",
            op,
            value.type_name()
        ),
    )
}

fn symbol(instr: &Instr) -> &'static str {
    match instr {
        Instr::Add => "+",
        Instr::Sub => "-",
        Instr::Mul => "*",
        Instr::Div => "/",
        Instr::Rem => "%",
        Instr::Eq => "==",
        Instr::Ne => "!=",
        Instr::Lt => "<",
        Instr::Le => "<=",
        Instr::Gt => ">",
        Instr::Ge => ">=",
        _ => "?",
    }
}

fn binary(instr: &Instr, left: Value, right: Value) -> Result<Value, ExceptionInfo> {
    let type_error = |left: &Value, right: &Value| {
        exception(
            "InvalidOperationException",
            format!(
                "operator '{}' cannot be applied to operands of type '{}' and '{}'",
                symbol(instr),
                left.type_name(),
                right.type_name()
            ),
        )
    };

    match instr {
        Instr::Eq => return Ok(Value::Bool(equals(&left, &right))),
        Instr::Ne => return Ok(Value::Bool(!equals(&left, &right))),
        Instr::Add => {
            if matches!(left, Value::Str(_)) || matches!(right, Value::Str(_)) {
                return Ok(Value::Str(format!(
                    "{}{}",
                    concat_operand(&left),
                    concat_operand(&right)
                )));
            }
        }
        _ => {}
    }

    if let (Value::Int(a), Value::Int(b)) = (&left, &right) {
        let (a, b) = (*a, *b);
        let value = match instr {
            Instr::Add => Value::Int(a.checked_add(b).ok_or_else(overflow)?),
            Instr::Sub => Value::Int(a.checked_sub(b).ok_or_else(overflow)?),
            Instr::Mul => Value::Int(a.checked_mul(b).ok_or_else(overflow)?),
            Instr::Div | Instr::Rem if b == 0 => return Err(divide_by_zero()),
            Instr::Div => Value::Int(a.checked_div(b).ok_or_else(overflow)?),
            Instr::Rem => Value::Int(a.checked_rem(b).ok_or_else(overflow)?),
            Instr::Lt => Value::Bool(a < b),
            Instr::Le => Value::Bool(a <= b),
            Instr::Gt => Value::Bool(a > b),
            Instr::Ge => Value::Bool(a >= b),
            _ => return Err(type_error(&left, &right)),
        };
        return Ok(value);
    }

    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        let value = match instr {
            Instr::Add => Value::Double(a + b),
            Instr::Sub => Value::Double(a - b),
            Instr::Mul => Value::Double(a * b),
            Instr::Div => Value::Double(a / b),
            Instr::Rem => Value::Double(a % b),
            Instr::Lt => Value::Bool(a < b),
            Instr::Le => Value::Bool(a <= b),
            Instr::Gt => Value::Bool(a > b),
            Instr::Ge => Value::Bool(a >= b),
            _ => return Err(type_error(&left, &right)),
        };
        return Ok(value);
    }

    if let (Value::Str(a), Value::Str(b)) = (&left, &right) {
        let value = match instr {
            Instr::Lt => a < b,
            Instr::Le => a <= b,
            Instr::Gt => a > b,
            Instr::Ge => a >= b,
            _ => return Err(type_error(&left, &right)),
        };
        return Ok(Value::Bool(value));
    }

    Err(type_error(&left, &right))
}

/// `null` concatenates as the empty string.
fn concat_operand(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => a == b,
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => left == right,
        },
    }
}

fn coerce(value: Value, ty: ValueType) -> Result<Value, ExceptionInfo> {
    match (ty, value) {
        (ValueType::Int, v @ Value::Int(_)) => Ok(v),
        (ValueType::Double, Value::Int(v)) => Ok(Value::Double(v as f64)),
        (ValueType::Double, v @ Value::Double(_)) => Ok(v),
        (ValueType::Bool, v @ Value::Bool(_)) => Ok(v),
        (ValueType::String, v @ (Value::Str(_) | Value::Null)) => Ok(v),
        (ty, other) => Err(exception(
            "InvalidCastException",
            format!(
                "cannot implicitly convert type '{}' to '{}'",
                other.type_name(),
                ty.name()
            ),
        )),
    }
}
