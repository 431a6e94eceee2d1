//! Builtin functions.
//!
//! Console and dump builtins are always in scope. `Math` and `Text`
//! functions are called qualified (`Math.abs(x)`), or unqualified when their
//! namespace is imported.

use rkyv::{Archive, Deserialize, Serialize};

use crate::result::{ExceptionInfo, OutputStream};

use super::value::Value;
use super::vm::{ScriptHost, exception};

/// Namespaces that can be imported.
pub const NAMESPACES: &[&str] = &["Math", "Text"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum Builtin {
    Print,
    Println,
    Eprintln,
    Dump,
    MathAbs,
    MathMin,
    MathMax,
    MathPow,
    TextLen,
    TextUpper,
    TextLower,
    TextConcat,
    TextParseInt,
}

const ALL: &[Builtin] = &[
    Builtin::Print,
    Builtin::Println,
    Builtin::Eprintln,
    Builtin::Dump,
    Builtin::MathAbs,
    Builtin::MathMin,
    Builtin::MathMax,
    Builtin::MathPow,
    Builtin::TextLen,
    Builtin::TextUpper,
    Builtin::TextLower,
    Builtin::TextConcat,
    Builtin::TextParseInt,
];

impl Builtin {
    pub fn namespace(self) -> Option<&'static str> {
        match self {
            Self::Print | Self::Println | Self::Eprintln | Self::Dump => None,
            Self::MathAbs | Self::MathMin | Self::MathMax | Self::MathPow => Some("Math"),
            Self::TextLen
            | Self::TextUpper
            | Self::TextLower
            | Self::TextConcat
            | Self::TextParseInt => Some("Text"),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Print => "print",
            Self::Println => "println",
            Self::Eprintln => "eprintln",
            Self::Dump => "dump",
            Self::MathAbs => "abs",
            Self::MathMin => "min",
            Self::MathMax => "max",
            Self::MathPow => "pow",
            Self::TextLen => "len",
            Self::TextUpper => "upper",
            Self::TextLower => "lower",
            Self::TextConcat => "concat",
            Self::TextParseInt => "parse_int",
        }
    }

    pub fn qualified_name(self) -> String {
        match self.namespace() {
            Some(ns) => format!("{}.{}", ns, self.name()),
            None => self.name().to_string(),
        }
    }

    /// Accepted argument counts (inclusive).
    pub fn arity(self) -> (usize, usize) {
        match self {
            Self::Print | Self::Eprintln => (1, 1),
            Self::Println => (0, 1),
            Self::Dump => (1, 2),
            Self::MathAbs | Self::TextLen | Self::TextUpper | Self::TextLower => (1, 1),
            Self::TextParseInt => (1, 1),
            Self::MathMin | Self::MathMax | Self::MathPow | Self::TextConcat => (2, 2),
        }
    }

    /// Resolve a call target. Unqualified namespaced names resolve only
    /// through `imports`.
    pub fn lookup(namespace: Option<&str>, name: &str, imports: &[String]) -> Option<Self> {
        ALL.iter().copied().find(|b| {
            b.name() == name
                && match (namespace, b.namespace()) {
                    (Some(wanted), Some(actual)) => wanted == actual,
                    (None, None) => true,
                    (None, Some(actual)) => imports.iter().any(|i| i == actual),
                    (Some(_), None) => false,
                }
        })
    }

    /// A namespaced builtin with this name, ignoring imports. Used to
    /// suggest the qualified form in diagnostics.
    pub fn suggest(name: &str) -> Option<Self> {
        ALL.iter()
            .copied()
            .find(|b| b.name() == name && b.namespace().is_some())
    }

    /// Invoke the builtin. `args` has already been arity-checked.
    pub fn call(self, mut args: Vec<Value>, host: &dyn ScriptHost) -> Result<Value, ExceptionInfo> {
        match self {
            Self::Print => {
                host.write(OutputStream::Stdout, &args[0].to_string());
                Ok(Value::Null)
            }
            Self::Println => {
                let text = args.first().map(|v| v.to_string()).unwrap_or_default();
                host.write(OutputStream::Stdout, &format!("{}\n", text));
                Ok(Value::Null)
            }
            Self::Eprintln => {
                host.write(OutputStream::Stderr, &format!("{}\n", args[0]));
                Ok(Value::Null)
            }
            Self::Dump => {
                let header = args.get(1).map(|h| h.to_string());
                let value = args.swap_remove(0);
                host.dump(&value, header.as_deref());
                Ok(value)
            }
            Self::MathAbs => match &args[0] {
                Value::Int(v) => v.checked_abs().map(Value::Int).ok_or_else(|| {
                    exception("OverflowException", "arithmetic operation resulted in an overflow")
                }),
                Value::Double(v) => Ok(Value::Double(v.abs())),
                other => Err(operand_error(self, other)),
            },
            Self::MathMin | Self::MathMax => {
                let pick_min = self == Self::MathMin;
                match (&args[0], &args[1]) {
                    (Value::Int(a), Value::Int(b)) => {
                        Ok(Value::Int(if pick_min { *a.min(b) } else { *a.max(b) }))
                    }
                    (a, b) => match (a.as_f64(), b.as_f64()) {
                        (Some(a), Some(b)) => {
                            Ok(Value::Double(if pick_min { a.min(b) } else { a.max(b) }))
                        }
                        _ => Err(operand_error(self, if a.is_numeric() { b } else { a })),
                    },
                }
            }
            Self::MathPow => match (args[0].as_f64(), args[1].as_f64()) {
                (Some(base), Some(exp)) => Ok(Value::Double(base.powf(exp))),
                (None, _) => Err(operand_error(self, &args[0])),
                (_, None) => Err(operand_error(self, &args[1])),
            },
            Self::TextLen => match &args[0] {
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                other => Err(operand_error(self, other)),
            },
            Self::TextUpper => match &args[0] {
                Value::Str(s) => Ok(Value::Str(s.to_uppercase())),
                other => Err(operand_error(self, other)),
            },
            Self::TextLower => match &args[0] {
                Value::Str(s) => Ok(Value::Str(s.to_lowercase())),
                other => Err(operand_error(self, other)),
            },
            Self::TextConcat => Ok(Value::Str(format!("{}{}", args[0], args[1]))),
            Self::TextParseInt => match &args[0] {
                Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                    exception(
                        "FormatException",
                        format!("the input string '{}' was not in a correct format", s),
                    )
                }),
                other => Err(operand_error(self, other)),
            },
        }
    }
}

fn operand_error(builtin: Builtin, value: &Value) -> ExceptionInfo {
    exception(
        "InvalidOperationException",
        format!(
            "{} cannot be applied to a value of type '{}'",
            builtin.qualified_name(),
            value.type_name()
        ),
    )
}
