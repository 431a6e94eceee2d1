//! Name resolution and code generation.
//!
//! Reference units are compiled first; their top-level declarations become
//! globals visible to every later unit. All units share one slot space.

use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;

use crate::result::{Diagnostic, InitializationParams, Span};

use super::ast::{BinaryOp, Expr, ExprKind, Stmt, StmtKind, TypeName, UnaryOp, Unit};
use super::builtins::{Builtin, NAMESPACES};
use super::lexer::tokenize;
use super::parser::parse;
use super::program::{CompiledScript, Instr, Position, Program, ValueType};

/// Unit name used for the submission in diagnostics and stack frames.
pub const SUBMISSION_NAME: &str = "<submission>";

#[derive(Debug, Clone)]
struct Reference {
    name: String,
    source: std::result::Result<String, String>,
}

/// Options fixed at worker initialization.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub imports: Vec<String>,
    pub working_directory: PathBuf,
    /// Package configuration, carried but not interpreted.
    pub package_config: serde_json::Value,
    references: Vec<Reference>,
}

impl CompileOptions {
    /// Build options from initialization parameters, reading every reference
    /// file up front. Unreadable references surface as diagnostics on each
    /// compilation rather than failing initialization.
    pub fn from_params(params: &InitializationParams) -> Self {
        let mut options = Self {
            imports: params.imports.clone(),
            working_directory: PathBuf::from(&params.working_directory),
            package_config: params.package_config.clone(),
            references: Vec::new(),
        };
        for name in &params.references {
            let path = options.resolve(name);
            let source = std::fs::read_to_string(&path).map_err(|e| e.to_string());
            options.references.push(Reference {
                name: name.clone(),
                source,
            });
        }
        options
    }

    pub fn with_imports(mut self, imports: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.imports = imports.into_iter().map(Into::into).collect();
        self
    }

    /// Add an in-memory reference unit.
    pub fn with_reference(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.references.push(Reference {
            name: name.into(),
            source: Ok(source.into()),
        });
        self
    }

    /// Resolve a path against the working directory.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() || self.working_directory.as_os_str().is_empty() {
            path.to_path_buf()
        } else {
            self.working_directory.join(path)
        }
    }

    pub fn reference_names(&self) -> impl Iterator<Item = &str> {
        self.references.iter().map(|r| r.name.as_str())
    }
}

/// Output of `compile`.
#[derive(Debug, Clone, Default)]
pub struct Compilation {
    pub diagnostics: Vec<Diagnostic>,
    /// Present only when no diagnostic has Error severity.
    pub program: Option<CompiledScript>,
}

impl Compilation {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    pub fn errors(&self) -> Vec<Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.is_error())
            .cloned()
            .collect()
    }
}

/// Compile a submission together with the configured references.
pub fn compile(code: &str, options: &CompileOptions) -> Compilation {
    let mut diagnostics = Vec::new();

    for import in &options.imports {
        if !NAMESPACES.contains(&import.as_str()) {
            diagnostics.push(
                Diagnostic::warning(
                    "PS3003",
                    format!("the namespace '{}' does not exist", import),
                    Span::new(1, 1, 0),
                )
                .with_source("<imports>"),
            );
        }
    }

    let mut compiler = Compiler::new(&options.imports);
    let mut units = Vec::new();

    for reference in &options.references {
        match &reference.source {
            Ok(source) => {
                let (unit, unit_diagnostics) = parse_unit(source, Some(&reference.name));
                diagnostics.extend(unit_diagnostics);
                units.push(compiler.compile_unit(&unit, &reference.name, true));
            }
            Err(e) => diagnostics.push(
                Diagnostic::error(
                    "PS0010",
                    format!("could not read reference '{}': {}", reference.name, e),
                    Span::new(1, 1, 0),
                )
                .with_source(reference.name.clone()),
            ),
        }
    }

    let (unit, unit_diagnostics) = parse_unit(code, None);
    diagnostics.extend(unit_diagnostics);
    units.push(compiler.compile_unit(&unit, SUBMISSION_NAME, false));

    diagnostics.extend(compiler.diagnostics);

    let program = if diagnostics.iter().any(Diagnostic::is_error) {
        None
    } else {
        Some(CompiledScript {
            units,
            slots: compiler.next_slot,
        })
    };

    Compilation {
        diagnostics,
        program,
    }
}

fn parse_unit(source: &str, name: Option<&str>) -> (Unit, Vec<Diagnostic>) {
    let (tokens, mut diagnostics) = tokenize(source);
    let (unit, parse_diagnostics) = parse(tokens);
    diagnostics.extend(parse_diagnostics);
    if let Some(name) = name {
        for d in &mut diagnostics {
            d.source = Some(name.to_string());
        }
    }
    (unit, diagnostics)
}

#[derive(Debug, Clone)]
struct Local {
    slot: u32,
    ty: Option<ValueType>,
    span: Span,
    used: bool,
}

#[derive(Default)]
struct LoopContext {
    start: u32,
    breaks: Vec<usize>,
}

struct Compiler<'a> {
    imports: &'a [String],
    diagnostics: Vec<Diagnostic>,
    globals: FxHashMap<String, Local>,
    scopes: Vec<FxHashMap<String, Local>>,
    loops: Vec<LoopContext>,
    next_slot: u32,
    // Per-unit state
    source: Option<String>,
    is_reference: bool,
    instrs: Vec<Instr>,
    positions: Vec<Position>,
    position: Position,
}

fn declared_type(ty: TypeName) -> Option<ValueType> {
    match ty {
        TypeName::Int => Some(ValueType::Int),
        TypeName::Double => Some(ValueType::Double),
        TypeName::Bool => Some(ValueType::Bool),
        TypeName::String => Some(ValueType::String),
        TypeName::Inferred => None,
    }
}

fn ends_control_flow(stmt: &Stmt) -> bool {
    matches!(
        stmt.kind,
        StmtKind::Throw(_) | StmtKind::Break | StmtKind::Continue
    )
}

impl<'a> Compiler<'a> {
    fn new(imports: &'a [String]) -> Self {
        Self {
            imports,
            diagnostics: Vec::new(),
            globals: FxHashMap::default(),
            scopes: Vec::new(),
            loops: Vec::new(),
            next_slot: 0,
            source: None,
            is_reference: false,
            instrs: Vec::new(),
            positions: Vec::new(),
            position: Position { line: 1, column: 1 },
        }
    }

    fn compile_unit(&mut self, unit: &Unit, name: &str, is_reference: bool) -> Program {
        self.source = is_reference.then(|| name.to_string());
        self.is_reference = is_reference;
        self.instrs.clear();
        self.positions.clear();

        self.scopes.push(FxHashMap::default());
        self.statements(&unit.statements);

        if let Some(result) = &unit.result {
            if unit.statements.last().is_some_and(ends_control_flow) {
                self.warn("PS3002", "unreachable code detected", result.span);
            }
            self.expr(result);
            if returns_nothing(result) {
                self.emit(Instr::Pop);
            } else {
                self.emit(Instr::SetResult);
            }
        }
        self.emit(Instr::Halt);

        let top = self.pop_scope();
        if is_reference {
            self.globals.extend(top);
        }

        Program {
            name: name.to_string(),
            instrs: std::mem::take(&mut self.instrs),
            positions: std::mem::take(&mut self.positions),
            is_reference,
        }
    }

    fn error(&mut self, code: &str, message: impl Into<String>, span: Span) {
        let mut d = Diagnostic::error(code, message, span);
        d.source = self.source.clone();
        self.diagnostics.push(d);
    }

    fn warn(&mut self, code: &str, message: impl Into<String>, span: Span) {
        let mut d = Diagnostic::warning(code, message, span);
        d.source = self.source.clone();
        self.diagnostics.push(d);
    }

    fn emit(&mut self, instr: Instr) -> usize {
        self.instrs.push(instr);
        self.positions.push(self.position);
        self.instrs.len() - 1
    }

    fn here(&self) -> u32 {
        self.instrs.len() as u32
    }

    fn patch(&mut self, at: usize, target: u32) {
        match &mut self.instrs[at] {
            Instr::Jump(t) | Instr::JumpIfFalse(t) | Instr::JumpIfTrue(t) => *t = target,
            _ => {}
        }
    }

    fn at(&mut self, span: Span) {
        self.position = Position {
            line: span.line,
            column: span.column,
        };
    }

    fn pop_scope(&mut self) -> FxHashMap<String, Local> {
        let scope = self.scopes.pop().unwrap_or_default();
        if !self.is_reference {
            let mut unused: Vec<_> = scope
                .iter()
                .filter(|(name, local)| !local.used && !name.starts_with('_'))
                .collect();
            unused.sort_by_key(|(_, local)| local.slot);
            let warnings: Vec<_> = unused
                .into_iter()
                .map(|(name, local)| (name.clone(), local.span))
                .collect();
            for (name, span) in warnings {
                self.warn(
                    "PS3001",
                    format!("the variable '{}' is declared but never used", name),
                    span,
                );
            }
        }
        scope
    }

    fn lookup(&mut self, name: &str) -> Option<&mut Local> {
        let index = self.scopes.iter().rposition(|s| s.contains_key(name));
        match index {
            Some(i) => self.scopes[i].get_mut(name),
            None => self.globals.get_mut(name),
        }
    }

    fn declare(&mut self, name: &str, ty: Option<ValueType>, span: Span) -> u32 {
        let top_level_reference = self.is_reference && self.scopes.len() == 1;
        let duplicate = self
            .scopes
            .last()
            .is_some_and(|s| s.contains_key(name))
            || (top_level_reference && self.globals.contains_key(name));
        if duplicate {
            self.error(
                "PS2002",
                format!("a local variable named '{}' is already defined in this scope", name),
                span,
            );
        }

        let slot = self.next_slot;
        self.next_slot += 1;
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(
                name.to_string(),
                Local {
                    slot,
                    ty,
                    span,
                    used: false,
                },
            );
        }
        slot
    }

    fn statements(&mut self, statements: &[Stmt]) {
        let mut warned = false;
        for (i, stmt) in statements.iter().enumerate() {
            if !warned && i > 0 && ends_control_flow(&statements[i - 1]) {
                self.warn("PS3002", "unreachable code detected", stmt.span);
                warned = true;
            }
            self.statement(stmt);
        }
    }

    fn statement(&mut self, stmt: &Stmt) {
        self.at(stmt.span);
        match &stmt.kind {
            StmtKind::Let { ty, name, init } => {
                let value_type = declared_type(*ty);
                match (init, value_type) {
                    (Some(init), _) => {
                        self.expr(init);
                        self.at(stmt.span);
                    }
                    (None, None) => {
                        self.error(
                            "PS2005",
                            "implicitly-typed variables must be initialized",
                            stmt.span,
                        );
                        self.emit(Instr::PushNull);
                    }
                    (None, Some(ValueType::Int)) => {
                        self.emit(Instr::PushInt(0));
                    }
                    (None, Some(ValueType::Double)) => {
                        self.emit(Instr::PushDouble(0.0));
                    }
                    (None, Some(ValueType::Bool)) => {
                        self.emit(Instr::PushBool(false));
                    }
                    (None, Some(ValueType::String)) => {
                        self.emit(Instr::PushNull);
                    }
                }
                if let Some(value_type) = value_type {
                    self.emit(Instr::Coerce(value_type));
                }
                let slot = self.declare(name, value_type, stmt.span);
                self.emit(Instr::Store(slot));
                self.emit(Instr::Pop);
            }
            StmtKind::Expr(expr) => {
                self.expr(expr);
                self.emit(Instr::Pop);
            }
            StmtKind::Block(body) => {
                self.scopes.push(FxHashMap::default());
                self.statements(body);
                self.pop_scope();
            }
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.expr(cond);
                self.at(stmt.span);
                let to_else = self.emit(Instr::JumpIfFalse(0));
                self.scoped(then_branch);
                match else_branch {
                    Some(else_branch) => {
                        let to_end = self.emit(Instr::Jump(0));
                        let else_start = self.here();
                        self.patch(to_else, else_start);
                        self.scoped(else_branch);
                        let end = self.here();
                        self.patch(to_end, end);
                    }
                    None => {
                        let end = self.here();
                        self.patch(to_else, end);
                    }
                }
            }
            StmtKind::While { cond, body } => {
                let start = self.here();
                self.expr(cond);
                self.at(stmt.span);
                let to_end = self.emit(Instr::JumpIfFalse(0));

                self.loops.push(LoopContext {
                    start,
                    breaks: Vec::new(),
                });
                self.scoped(body);
                self.at(stmt.span);
                self.emit(Instr::Jump(start));

                let end = self.here();
                self.patch(to_end, end);
                if let Some(ctx) = self.loops.pop() {
                    for at in ctx.breaks {
                        self.patch(at, end);
                    }
                }
            }
            StmtKind::Break => {
                if self.loops.is_empty() {
                    self.error("PS2006", "no enclosing loop out of which to break", stmt.span);
                    return;
                }
                let at = self.emit(Instr::Jump(0));
                if let Some(ctx) = self.loops.last_mut() {
                    ctx.breaks.push(at);
                }
            }
            StmtKind::Continue => match self.loops.last().map(|ctx| ctx.start) {
                Some(start) => {
                    self.emit(Instr::Jump(start));
                }
                None => {
                    self.error(
                        "PS2006",
                        "no enclosing loop out of which to continue",
                        stmt.span,
                    );
                }
            },
            StmtKind::Throw(value) => {
                self.expr(value);
                self.at(stmt.span);
                self.emit(Instr::Throw);
            }
        }
    }

    /// Compile a branch or loop body in its own scope.
    fn scoped(&mut self, stmt: &Stmt) {
        self.scopes.push(FxHashMap::default());
        self.statement(stmt);
        self.pop_scope();
    }

    fn expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Int(v) => {
                self.at(expr.span);
                self.emit(Instr::PushInt(*v));
            }
            ExprKind::Double(v) => {
                self.at(expr.span);
                self.emit(Instr::PushDouble(*v));
            }
            ExprKind::Bool(v) => {
                self.at(expr.span);
                self.emit(Instr::PushBool(*v));
            }
            ExprKind::Str(s) => {
                self.at(expr.span);
                self.emit(Instr::PushStr(s.clone()));
            }
            ExprKind::Null => {
                self.at(expr.span);
                self.emit(Instr::PushNull);
            }
            ExprKind::Name(name) => {
                self.at(expr.span);
                let slot = self.lookup(name).map(|local| {
                    local.used = true;
                    local.slot
                });
                match slot {
                    Some(slot) => {
                        self.emit(Instr::Load(slot));
                    }
                    None => {
                        self.undefined(name, expr.span);
                        self.emit(Instr::PushNull);
                    }
                }
            }
            ExprKind::Assign { name, value } => {
                self.expr(value);
                self.at(expr.span);
                let target = self.lookup(name).map(|local| (local.slot, local.ty));
                match target {
                    Some((slot, ty)) => {
                        if let Some(ty) = ty {
                            self.emit(Instr::Coerce(ty));
                        }
                        self.emit(Instr::Store(slot));
                    }
                    None => self.undefined(name, expr.span),
                }
            }
            ExprKind::Unary { op, operand } => {
                self.expr(operand);
                self.at(expr.span);
                self.emit(match op {
                    UnaryOp::Neg => Instr::Neg,
                    UnaryOp::Not => Instr::Not,
                });
            }
            ExprKind::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => self.short_circuit(expr.span, left, right, false),
            ExprKind::Binary {
                op: BinaryOp::Or,
                left,
                right,
            } => self.short_circuit(expr.span, left, right, true),
            ExprKind::Binary { op, left, right } => {
                self.expr(left);
                self.expr(right);
                self.at(expr.span);
                self.emit(match op {
                    BinaryOp::Add => Instr::Add,
                    BinaryOp::Sub => Instr::Sub,
                    BinaryOp::Mul => Instr::Mul,
                    BinaryOp::Div => Instr::Div,
                    BinaryOp::Rem => Instr::Rem,
                    BinaryOp::Eq => Instr::Eq,
                    BinaryOp::Ne => Instr::Ne,
                    BinaryOp::Lt => Instr::Lt,
                    BinaryOp::Le => Instr::Le,
                    BinaryOp::Gt => Instr::Gt,
                    BinaryOp::Ge => Instr::Ge,
                    BinaryOp::And | BinaryOp::Or => unreachable!("handled by short_circuit"),
                });
            }
            ExprKind::Call {
                namespace,
                name,
                args,
            } => self.call(expr.span, namespace.as_deref(), name, args),
        }
    }

    /// `a && b` / `a || b`: the right operand runs only when needed.
    fn short_circuit(&mut self, span: Span, left: &Expr, right: &Expr, is_or: bool) {
        self.expr(left);
        self.at(span);
        self.emit(Instr::AssertBool);
        let to_short = self.emit(if is_or {
            Instr::JumpIfTrue(0)
        } else {
            Instr::JumpIfFalse(0)
        });
        self.expr(right);
        self.at(span);
        self.emit(Instr::AssertBool);
        let to_end = self.emit(Instr::Jump(0));
        let short = self.here();
        self.patch(to_short, short);
        self.emit(Instr::PushBool(is_or));
        let end = self.here();
        self.patch(to_end, end);
    }

    fn call(&mut self, span: Span, namespace: Option<&str>, name: &str, args: &[Expr]) {
        for arg in args {
            self.expr(arg);
        }
        self.at(span);

        let Some(builtin) = Builtin::lookup(namespace, name, self.imports) else {
            let shown = match namespace {
                Some(ns) => format!("{}.{}", ns, name),
                None => name.to_string(),
            };
            let message = match (namespace, Builtin::suggest(name)) {
                (None, Some(candidate)) => format!(
                    "the function '{}' does not exist in the current context (did you mean '{}'?)",
                    shown,
                    candidate.qualified_name()
                ),
                _ => format!("the function '{}' does not exist in the current context", shown),
            };
            self.error("PS2003", message, span);
            self.emit(Instr::PushNull);
            return;
        };

        let (min, max) = builtin.arity();
        if args.len() < min || args.len() > max {
            self.error(
                "PS2004",
                format!(
                    "no overload for '{}' takes {} argument(s)",
                    builtin.qualified_name(),
                    args.len()
                ),
                span,
            );
        }
        self.emit(Instr::Call {
            builtin,
            argc: args.len() as u32,
        });
    }

    fn undefined(&mut self, name: &str, span: Span) {
        self.error(
            "PS2001",
            format!("the name '{}' does not exist in the current context", name),
            span,
        );
    }
}

/// Console builtins used as the trailing expression produce no result.
fn returns_nothing(expr: &Expr) -> bool {
    matches!(
        &expr.kind,
        ExprKind::Call { namespace: None, name, .. }
            if matches!(name.as_str(), "print" | "println" | "eprintln")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::Severity;

    fn codes(compilation: &Compilation) -> Vec<&str> {
        compilation
            .diagnostics
            .iter()
            .map(|d| d.code.as_str())
            .collect()
    }

    #[test]
    fn test_clean_compile_produces_program() {
        let compilation = compile("int x = 2;\nx * 3", &CompileOptions::default());
        assert!(compilation.diagnostics.is_empty());
        let program = compilation.program.unwrap();
        assert_eq!(program.units.len(), 1);
        assert_eq!(program.slots, 1);
        assert_eq!(program.units[0].instrs.last(), Some(&Instr::Halt));
    }

    #[test]
    fn test_errors_suppress_program() {
        let compilation = compile("int x = ;", &CompileOptions::default());
        assert!(compilation.has_errors());
        assert!(compilation.program.is_none());
        assert_eq!(compilation.errors()[0].severity, Severity::Error);
    }

    #[test]
    fn test_semantic_errors() {
        let source = "y + 1;\nint a = 1;\nint a = 2;\nfoo();\nMath.pow(1);\nbreak;";
        let compilation = compile(source, &CompileOptions::default());
        assert_eq!(
            codes(&compilation),
            ["PS2001", "PS2002", "PS2003", "PS2004", "PS2006", "PS3001"]
        );
    }

    #[test]
    fn test_warnings_do_not_block() {
        let source = "int unused = 1;\nint _ignored = 2;\nwhile (true) { throw \"x\"; println(1); }";
        let compilation = compile(source, &CompileOptions::default());
        assert_eq!(codes(&compilation), ["PS3002", "PS3001"]);
        assert!(compilation.program.is_some());
    }

    #[test]
    fn test_imports_enable_unqualified_calls() {
        let without = compile("abs(-1)", &CompileOptions::default());
        assert_eq!(codes(&without), ["PS2003"]);
        assert!(without.diagnostics[0].message.contains("Math.abs"));

        let with = compile("abs(-1)", &CompileOptions::default().with_imports(["Math"]));
        assert!(with.diagnostics.is_empty());

        let unknown = compile("1", &CompileOptions::default().with_imports(["Nope"]));
        assert_eq!(codes(&unknown), ["PS3003"]);
        assert!(unknown.program.is_some());
    }

    #[test]
    fn test_reference_globals_are_visible() {
        let options = CompileOptions::default().with_reference("lib.pad", "int base = 40;");
        let compilation = compile("base + 2", &options);
        assert!(compilation.diagnostics.is_empty(), "{:?}", compilation.diagnostics);
        let program = compilation.program.unwrap();
        assert_eq!(program.units.len(), 2);
        assert!(program.units[0].is_reference);
        assert_eq!(program.units[1].name, SUBMISSION_NAME);
    }

    #[test]
    fn test_reference_diagnostics_carry_source() {
        let options = CompileOptions::default().with_reference("lib.pad", "int = 1;");
        let compilation = compile("1", &options);
        assert!(compilation.has_errors());
        assert_eq!(compilation.diagnostics[0].source.as_deref(), Some("lib.pad"));
    }

    #[test]
    fn test_missing_reference_file() {
        let dir = tempfile::tempdir().unwrap();
        let params = InitializationParams {
            references: vec!["missing.pad".to_string()],
            working_directory: dir.path().display().to_string(),
            ..Default::default()
        };
        let compilation = compile("1", &CompileOptions::from_params(&params));
        assert_eq!(codes(&compilation), ["PS0010"]);
    }

    #[test]
    fn test_reference_files_resolve_against_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("prelude.pad"), "string greeting = \"hi\";").unwrap();
        let params = InitializationParams {
            references: vec!["prelude.pad".to_string()],
            working_directory: dir.path().display().to_string(),
            ..Default::default()
        };
        let options = CompileOptions::from_params(&params);
        assert_eq!(options.reference_names().collect::<Vec<_>>(), ["prelude.pad"]);
        assert!(!compile("greeting", &options).has_errors());
    }

    #[test]
    fn test_print_as_trailing_expression_has_no_result() {
        let compilation = compile("println(1)", &CompileOptions::default());
        let program = compilation.program.unwrap();
        assert!(!program.units[0].instrs.contains(&Instr::SetResult));
    }
}
