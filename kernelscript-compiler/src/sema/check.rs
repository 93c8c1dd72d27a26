//! Type checker.
//!
//! Consumes the untyped AST plus the symbol table it builds on the way, and
//! produces a typed tree: every expression carries its inferred type and
//! every attributed function its resolved attribute. Unlike the later
//! stages, the checker keeps going after an error and reports everything it
//! found in one pass; IR generation only runs on a clean tree.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::script::ast::{
    AttrSpec, Attribute, BinaryOp, Block, Declaration, Expr, ExprKind, ForRange, Function,
    IntValue, Position, Program, Statement, TcDirection, Type, UnaryOp,
};

use super::builtins::header_declarations;
use super::fold::{fold, ConstEnv};
use super::symbol::{FunctionInfo, MapInfo, Symbol, SymbolKind, SymbolTable};
use super::SemanticError;

/// Result of a successful check: the same program, typed in place, plus the
/// root symbol table for the stages downstream.
#[derive(Debug)]
pub struct TypedProgram {
    pub program: Program,
    pub table: SymbolTable,
    /// Root constant bindings (builtin constants, enum variants, constant
    /// globals), the seed environment for loop analysis downstream.
    pub globals: ConstEnv,
}

/// Where a call happens, for the visibility pass.
#[derive(Debug, Clone)]
struct CallEdge {
    caller: String,
    caller_attr: Option<Attribute>,
    callee: String,
    position: Position,
}

pub fn check(mut program: Program, file: &str) -> Result<TypedProgram, Vec<SemanticError>> {
    program.normalize();

    let mut checker = Checker {
        table: SymbolTable::new(),
        errors: Vec::new(),
        globals: ConstEnv::new(),
        edges: Vec::new(),
        current: None,
    };

    checker.inject_includes(&program);
    checker.resolve_attributes(&mut program);
    checker.declare_top_level(&program);
    checker.validate_main(&program, file);
    checker.validate_attribute_signatures(&program);
    checker.check_bodies(&mut program);
    checker.check_visibility();
    checker.check_kernel_recursion();

    if checker.errors.is_empty() {
        info!(
            "type check passed: {} declarations",
            program.declarations.len()
        );
        Ok(TypedProgram {
            program,
            table: checker.table,
            globals: checker.globals,
        })
    } else {
        debug!("type check failed with {} error(s)", checker.errors.len());
        Err(checker.errors)
    }
}

struct Checker {
    table: SymbolTable,
    errors: Vec<SemanticError>,
    /// Root constant environment: builtin constants, enum variants and
    /// constant global initializers. Cloned as the seed for each body.
    globals: ConstEnv,
    edges: Vec<CallEdge>,
    current: Option<CurrentFn>,
}

#[derive(Debug, Clone)]
struct CurrentFn {
    name: String,
    attribute: Option<Attribute>,
    return_type: Option<Type>,
}

impl Checker {
    // Include-provided declarations resolve before any user code.
    fn inject_includes(&mut self, program: &Program) {
        for include in &program.includes {
            for decl in header_declarations(&include.header) {
                self.declare(&decl);
            }
        }
    }

    fn resolve_attributes(&mut self, program: &mut Program) {
        for decl in &mut program.declarations {
            if let Declaration::Attributed(af) = decl {
                match resolve_attr(&af.attr) {
                    Ok(attr) => af.resolved = Some(attr),
                    Err(e) => self.errors.push(e),
                }
            }
        }
    }

    fn declare_top_level(&mut self, program: &Program) {
        for decl in &program.declarations {
            self.declare(decl);
        }
    }

    fn declare(&mut self, decl: &Declaration) {
        match decl {
            Declaration::Struct(s) => self.define(Symbol {
                name: s.name.clone(),
                kind: SymbolKind::Struct(s.fields.clone()),
                position: s.position.clone(),
            }),
            Declaration::TypeAlias(a) => self.define(Symbol {
                name: a.name.clone(),
                kind: SymbolKind::Alias(a.ty.clone()),
                position: a.position.clone(),
            }),
            Declaration::Enum(e) => {
                // Variants are root-scope constants; unnumbered ones count
                // up from the previous explicit value, C style.
                let mut next = 0i64;
                let mut variants = Vec::new();
                for variant in &e.variants {
                    let value = variant.value.unwrap_or(next);
                    next = value + 1;
                    variants.push((variant.name.clone(), value));
                    self.globals.bind(&variant.name, value);
                    self.define(Symbol {
                        name: variant.name.clone(),
                        kind: SymbolKind::Const {
                            ty: Type::Named(e.name.clone()),
                            value,
                        },
                        position: e.position.clone(),
                    });
                }
                self.define(Symbol {
                    name: e.name.clone(),
                    kind: SymbolKind::Enum(variants),
                    position: e.position.clone(),
                });
            }
            Declaration::Map(m) => {
                if m.config.max_entries == 0 {
                    self.errors.push(SemanticError::MapMisuse {
                        message: format!("map `{}` needs a non-zero size", m.name),
                        position: m.position.clone(),
                    });
                }
                self.define(Symbol {
                    name: m.name.clone(),
                    kind: SymbolKind::Map(MapInfo {
                        key: m.key.clone(),
                        value: m.value.clone(),
                        kind: m.kind,
                        config: m.config.clone(),
                        pinned: m.pinned,
                    }),
                    position: m.position.clone(),
                });
            }
            Declaration::Config(c) => self.define(Symbol {
                name: c.name.clone(),
                kind: SymbolKind::Config(
                    c.fields
                        .iter()
                        .map(|f| (f.name.clone(), f.ty.clone()))
                        .collect(),
                ),
                position: c.position.clone(),
            }),
            Declaration::GlobalVar(g) => {
                let ty = g
                    .ty
                    .clone()
                    .or_else(|| g.init.as_ref().and_then(default_literal_type));
                let ty = match ty {
                    Some(t) => t,
                    None => {
                        self.errors.push(SemanticError::TypeMismatch {
                            expected: "a typed or initialized global".to_string(),
                            got: "neither type nor initializer".to_string(),
                            position: g.position.clone(),
                        });
                        return;
                    }
                };
                if let Some(init) = &g.init {
                    if let Some(value) = fold(init, &self.globals) {
                        self.globals.bind(&g.name, value);
                        self.define(Symbol {
                            name: g.name.clone(),
                            kind: SymbolKind::Const { ty, value },
                            position: g.position.clone(),
                        });
                        return;
                    }
                }
                self.define(Symbol {
                    name: g.name.clone(),
                    kind: SymbolKind::Var(ty),
                    position: g.position.clone(),
                });
            }
            Declaration::Function(f) => self.define(Symbol {
                name: f.name.clone(),
                kind: SymbolKind::Function(FunctionInfo {
                    params: f
                        .params
                        .iter()
                        .map(|p| (p.name.clone(), p.ty.clone()))
                        .collect(),
                    return_type: f.return_type.clone(),
                    attribute: None,
                }),
                position: f.position.clone(),
            }),
            Declaration::Attributed(af) => self.define(Symbol {
                name: af.function.name.clone(),
                kind: SymbolKind::Function(FunctionInfo {
                    params: af
                        .function
                        .params
                        .iter()
                        .map(|p| (p.name.clone(), p.ty.clone()))
                        .collect(),
                    return_type: af.function.return_type.clone(),
                    attribute: af.resolved.clone(),
                }),
                position: af.position.clone(),
            }),
        }
    }

    fn define(&mut self, symbol: Symbol) {
        if let Err(err) = self.table.define(symbol) {
            self.errors.push(err);
        }
    }

    fn validate_main(&mut self, program: &Program, file: &str) {
        let mains: Vec<&Function> = program
            .declarations
            .iter()
            .filter_map(|d| match d {
                Declaration::Function(f) if f.name == "main" => Some(f),
                _ => None,
            })
            .collect();
        let attributed_main = program
            .declarations
            .iter()
            .any(|d| matches!(d, Declaration::Attributed(af) if af.function.name == "main"));

        match mains.len() {
            0 => {
                if attributed_main {
                    // An attributed `main` is not the user-space entry point.
                    self.errors.push(SemanticError::InvalidMainSignature {
                        message: "`main` must be a plain function, not an attributed one"
                            .to_string(),
                        position: Position::new(1, 1, file),
                    });
                } else {
                    self.errors.push(SemanticError::MissingMain {
                        position: Position::new(1, 1, file),
                    });
                }
                return;
            }
            1 => {}
            _ => {
                self.errors.push(SemanticError::MultipleMain {
                    position: mains[1].position.clone(),
                });
                return;
            }
        }

        let main = mains[0];
        if main.return_type != Some(Type::I32) {
            self.errors.push(SemanticError::InvalidMainSignature {
                message: format!(
                    "`main` must return i32, found {}",
                    main.return_type
                        .as_ref()
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "no return type".to_string())
                ),
                position: main.position.clone(),
            });
        }
        match main.params.len() {
            0 => {}
            1 => {
                let param = &main.params[0];
                match self.table.struct_fields(&param.ty) {
                    Some(fields) => {
                        // Every field must be CLI-coercible.
                        for field in &fields {
                            let resolved = self.table.resolve_type(&field.ty);
                            let ok = resolved.is_integer()
                                || matches!(resolved, Type::Str(_) | Type::Bool);
                            if !ok {
                                self.errors.push(SemanticError::InvalidMainSignature {
                                    message: format!(
                                        "args field `{}` has type `{}`, which cannot be parsed from the command line",
                                        field.name, field.ty
                                    ),
                                    position: param.position.clone(),
                                });
                            }
                        }
                    }
                    None => self.errors.push(SemanticError::InvalidMainSignature {
                        message: format!(
                            "`main` parameter must be a declared struct, found `{}`",
                            param.ty
                        ),
                        position: param.position.clone(),
                    }),
                }
            }
            n => self.errors.push(SemanticError::InvalidMainSignature {
                message: format!("`main` takes zero or one parameter, found {n}"),
                position: main.position.clone(),
            }),
        }
    }

    fn validate_attribute_signatures(&mut self, program: &Program) {
        for decl in &program.declarations {
            let af = match decl {
                Declaration::Attributed(af) => af,
                _ => continue,
            };
            let attr = match &af.resolved {
                Some(attr) => attr.clone(),
                None => continue,
            };
            let f = &af.function;
            match attr {
                Attribute::Xdp => {
                    let param_ok = f.params.len() == 1
                        && self.table.resolve_type(&f.params[0].ty)
                            == Type::Pointer(Box::new(Type::Named("xdp_md".to_string())));
                    let ret_ok =
                        matches!(&f.return_type, Some(Type::Named(name)) if name == "xdp_action");
                    if !param_ok || !ret_ok {
                        self.errors.push(SemanticError::AttributeMisuse {
                            message: format!(
                                "`{}` must have signature (ctx: *xdp_md) -> xdp_action",
                                f.name
                            ),
                            position: af.position.clone(),
                        });
                    }
                }
                Attribute::Tc(_) => {
                    let param_ok = f.params.len() == 1
                        && self.table.resolve_type(&f.params[0].ty)
                            == Type::Pointer(Box::new(Type::Named("__sk_buff".to_string())));
                    let ret_ok = f.return_type == Some(Type::I32);
                    if !param_ok || !ret_ok {
                        self.errors.push(SemanticError::AttributeMisuse {
                            message: format!(
                                "`{}` must have signature (ctx: *__sk_buff) -> i32",
                                f.name
                            ),
                            position: af.position.clone(),
                        });
                    }
                }
                // kprobe/kfunc/helper/private accept arbitrary signatures;
                // they are constrained at call sites instead.
                _ => {}
            }
        }
    }

    fn check_bodies(&mut self, program: &mut Program) {
        for decl in &mut program.declarations {
            let (function, attribute) = match decl {
                Declaration::Function(f) => (f, None),
                Declaration::Attributed(af) => {
                    let attr = af.resolved.clone();
                    (&mut af.function, attr)
                }
                _ => continue,
            };
            self.current = Some(CurrentFn {
                name: function.name.clone(),
                attribute,
                return_type: function.return_type.clone(),
            });
            self.table.enter_block();
            for param in &function.params {
                self.define(Symbol {
                    name: param.name.clone(),
                    kind: SymbolKind::Var(param.ty.clone()),
                    position: param.position.clone(),
                });
            }
            let mut env = self.globals.clone();
            let mut body = std::mem::take(&mut function.body);
            self.check_block(&mut body, &mut env);
            function.body = body;
            self.table.exit_block();
            self.current = None;
        }
    }

    fn check_block(&mut self, block: &mut Block, env: &mut ConstEnv) {
        self.table.enter_block();
        for stmt in &mut block.statements {
            self.check_statement(stmt, env);
        }
        self.table.exit_block();
    }

    fn check_statement(&mut self, stmt: &mut Statement, env: &mut ConstEnv) {
        match stmt {
            Statement::VarDecl {
                name,
                ty,
                init,
                position,
            } => {
                let init_ty = self.check_expr(init);
                if matches!(ty, Some(Type::Map { .. }))
                    || matches!(init_ty, Some(Type::Map { .. }))
                {
                    self.errors.push(SemanticError::MapMisuse {
                        message: format!(
                            "map `{name}` cannot be declared inside a function; maps live at top level"
                        ),
                        position: position.clone(),
                    });
                    return;
                }
                let var_ty = match ty {
                    Some(annotated) => {
                        let annotated = annotated.clone();
                        if let Some(actual) = &init_ty {
                            self.require_assignable(&annotated, actual, init, position);
                        }
                        annotated
                    }
                    None => match init_ty {
                        Some(t) => t,
                        None => return, // the initializer already errored
                    },
                };
                self.define(Symbol {
                    name: name.clone(),
                    kind: SymbolKind::Var(var_ty),
                    position: position.clone(),
                });
                match fold(init, env) {
                    Some(value) => env.bind(name, value),
                    None => env.invalidate(name),
                }
            }
            Statement::Assign {
                target,
                value,
                position,
            } => {
                let value_ty = self.check_expr(value);
                self.check_assign_target(target, value, &value_ty, position);
                if let ExprKind::Ident(name) = &target.kind {
                    match fold(value, env) {
                        Some(v) => env.bind(name, v),
                        None => env.invalidate(name),
                    }
                }
            }
            Statement::Delete { target, position } => match &mut target.kind {
                ExprKind::Index(base, key) => {
                    let map = self.map_of(base);
                    let key_ty = self.check_expr(key);
                    match map {
                        Some(info) => {
                            if let Some(actual) = &key_ty {
                                self.require_assignable(&info.key, actual, key, position);
                            }
                        }
                        None => self.errors.push(SemanticError::MapMisuse {
                            message: "delete applies to a map entry".to_string(),
                            position: position.clone(),
                        }),
                    }
                }
                _ => self.errors.push(SemanticError::MapMisuse {
                    message: "delete applies to a map entry, e.g. `delete m[k]`".to_string(),
                    position: position.clone(),
                }),
            },
            Statement::If {
                cond,
                then_block,
                else_block,
                position,
            } => {
                if let Some(ty) = self.check_expr(cond) {
                    if self.table.resolve_type(&ty) != Type::Bool {
                        self.errors.push(SemanticError::TypeMismatch {
                            expected: "bool".to_string(),
                            got: ty.to_string(),
                            position: position.clone(),
                        });
                    }
                }
                let mut then_env = env.clone();
                self.check_block(then_block, &mut then_env);
                if let Some(else_block) = else_block {
                    let mut else_env = env.clone();
                    self.check_block(else_block, &mut else_env);
                }
                // Anything either branch may have reassigned is no longer
                // a known constant afterwards.
                let mut touched = HashSet::new();
                assigned_names(then_block, &mut touched);
                if let Some(else_block) = else_block {
                    assigned_names(else_block, &mut touched);
                }
                for name in touched {
                    env.invalidate(&name);
                }
            }
            Statement::For {
                var,
                range,
                body,
                position,
            } => {
                let elem_ty = match range {
                    ForRange::Range { start, end } => {
                        for bound in [&mut *start, &mut *end] {
                            if let Some(ty) = self.check_expr(bound) {
                                if !self
                                    .table
                                    .resolve_type(ty.unwrap_nullable())
                                    .is_integer()
                                {
                                    self.errors.push(SemanticError::TypeMismatch {
                                        expected: "an integer bound".to_string(),
                                        got: ty.to_string(),
                                        position: bound.position.clone(),
                                    });
                                }
                            }
                        }
                        Type::U64
                    }
                    ForRange::Iter(source) => match self.check_expr(source) {
                        Some(ty) => match self.table.resolve_type(&ty) {
                            Type::Array(elem, _) => *elem,
                            other => {
                                self.errors.push(SemanticError::TypeMismatch {
                                    expected: "a fixed-size array to iterate".to_string(),
                                    got: other.to_string(),
                                    position: position.clone(),
                                });
                                return;
                            }
                        },
                        None => return,
                    },
                };
                self.table.enter_block();
                self.define(Symbol {
                    name: var.clone(),
                    kind: SymbolKind::Var(elem_ty),
                    position: position.clone(),
                });
                // The body runs any number of times: everything it
                // reassigns stops being a constant on entry, not just
                // after the loop.
                let mut touched = HashSet::new();
                assigned_names(body, &mut touched);
                let mut body_env = env.clone();
                body_env.invalidate(var);
                for name in &touched {
                    body_env.invalidate(name);
                }
                self.check_block(body, &mut body_env);
                self.table.exit_block();
                for name in touched {
                    env.invalidate(&name);
                }
            }
            Statement::Return { value, position } => {
                let expected = self.current.as_ref().and_then(|c| c.return_type.clone());
                match (expected, value) {
                    (Some(expected), Some(value)) => {
                        if let Some(actual) = self.check_expr(value) {
                            self.require_assignable(&expected, &actual, value, position);
                        }
                    }
                    (Some(expected), None) => self.errors.push(SemanticError::TypeMismatch {
                        expected: expected.to_string(),
                        got: "return without a value".to_string(),
                        position: position.clone(),
                    }),
                    (None, Some(value)) => {
                        if let Some(actual) = self.check_expr(value) {
                            self.errors.push(SemanticError::TypeMismatch {
                                expected: "no return value".to_string(),
                                got: actual.to_string(),
                                position: position.clone(),
                            });
                        }
                    }
                    (None, None) => {}
                }
            }
            Statement::Expr(expr) => {
                self.check_expr(expr);
            }
        }
    }

    fn check_assign_target(
        &mut self,
        target: &mut Expr,
        value: &mut Expr,
        value_ty: &Option<Type>,
        position: &Position,
    ) {
        match &mut target.kind {
            ExprKind::Ident(name) => {
                let name = name.clone();
                let resolved = self.table.resolve(&name).map(|s| s.kind.clone());
                let target_ty = match resolved {
                    Some(SymbolKind::Var(ty)) => Some(ty),
                    Some(SymbolKind::Const { .. }) => {
                        self.errors.push(SemanticError::TypeMismatch {
                            expected: "an assignable variable".to_string(),
                            got: format!("constant `{name}`"),
                            position: position.clone(),
                        });
                        None
                    }
                    Some(_) => {
                        self.errors.push(SemanticError::TypeMismatch {
                            expected: "an assignable variable".to_string(),
                            got: format!("`{name}`"),
                            position: position.clone(),
                        });
                        None
                    }
                    None => {
                        self.errors.push(SemanticError::UnresolvedSymbol {
                            name,
                            position: position.clone(),
                        });
                        None
                    }
                };
                if let (Some(expected), Some(actual)) = (target_ty, value_ty) {
                    target.ty = Some(expected.clone());
                    self.require_assignable(&expected, actual, value, position);
                }
            }
            ExprKind::Index(base, key) => {
                if let Some(info) = self.map_of(base) {
                    let key_ty = self.check_expr(key);
                    if let Some(actual) = &key_ty {
                        self.require_assignable(&info.key, actual, key, position);
                    }
                    if let Some(actual) = value_ty {
                        self.require_assignable(&info.value, actual, value, position);
                    }
                    target.ty = Some(info.value);
                } else if let Some(base_ty) = self.check_expr(base) {
                    // Array element assignment.
                    match self.table.resolve_type(&base_ty) {
                        Type::Array(elem, _) => {
                            self.check_expr(key);
                            if let Some(actual) = value_ty {
                                self.require_assignable(&elem, actual, value, position);
                            }
                            target.ty = Some(*elem);
                        }
                        other => self.errors.push(SemanticError::TypeMismatch {
                            expected: "a map or array".to_string(),
                            got: other.to_string(),
                            position: position.clone(),
                        }),
                    }
                }
            }
            ExprKind::Field(base, field) => {
                // Config writes (`cfg.field = ...`) are user-space only;
                // struct field writes go through the normal typing path.
                let field = field.clone();
                let config_fields = match &base.kind {
                    ExprKind::Ident(base_name) => match self.table.resolve(base_name) {
                        Some(Symbol {
                            kind: SymbolKind::Config(fields),
                            ..
                        }) => Some((base_name.clone(), fields.clone())),
                        _ => None,
                    },
                    _ => None,
                };
                if let Some((base_name, fields)) = config_fields {
                    base.ty = Some(Type::Named(base_name.clone()));
                    let in_kernel = self
                        .current
                        .as_ref()
                        .map(|c| c.attribute.is_some())
                        .unwrap_or(false);
                    if in_kernel {
                        self.errors.push(SemanticError::MapMisuse {
                            message: format!(
                                "config `{base_name}` is read-only in kernel code; write it from `main`"
                            ),
                            position: position.clone(),
                        });
                    }
                    match fields.iter().find(|(n, _)| *n == field).map(|(_, t)| t.clone()) {
                        Some(expected) => {
                            target.ty = Some(expected.clone());
                            if let Some(actual) = value_ty {
                                self.require_assignable(&expected, actual, value, position);
                            }
                        }
                        None => self.errors.push(SemanticError::UnresolvedSymbol {
                            name: format!("{base_name}.{field}"),
                            position: position.clone(),
                        }),
                    }
                    return;
                }
                if let Some(expected) = self.check_expr(target) {
                    if let Some(actual) = value_ty {
                        self.require_assignable(&expected, actual, value, position);
                    }
                }
            }
            ExprKind::Arrow(..) => {
                if let Some(expected) = self.check_expr(target) {
                    if let Some(actual) = value_ty {
                        self.require_assignable(&expected, actual, value, position);
                    }
                }
            }
            _ => self.errors.push(SemanticError::TypeMismatch {
                expected: "an assignable place".to_string(),
                got: "an expression".to_string(),
                position: position.clone(),
            }),
        }
    }

    /// The map a bare identifier refers to, typing the identifier on the way.
    fn map_of(&mut self, base: &mut Expr) -> Option<MapInfo> {
        let name = match &base.kind {
            ExprKind::Ident(name) => name.clone(),
            _ => return None,
        };
        let info = match self.table.resolve(&name) {
            Some(Symbol {
                kind: SymbolKind::Map(info),
                ..
            }) => info.clone(),
            _ => return None,
        };
        base.ty = Some(Type::Map {
            key: Box::new(info.key.clone()),
            value: Box::new(info.value.clone()),
            kind: info.kind,
            config: info.config.clone(),
        });
        Some(info)
    }

    fn check_expr(&mut self, expr: &mut Expr) -> Option<Type> {
        let ty = self.infer_expr(expr)?;
        expr.ty = Some(ty.clone());
        Some(ty)
    }

    fn infer_expr(&mut self, expr: &mut Expr) -> Option<Type> {
        let position = expr.position.clone();
        match &mut expr.kind {
            ExprKind::Int(value) => Some(value.ty()),
            ExprKind::Bool(_) => Some(Type::Bool),
            ExprKind::Str(s) => Some(Type::Str(s.len())),
            ExprKind::None => Some(Type::Nullable(Box::new(Type::Unit))),
            ExprKind::Ident(name) => {
                let name = name.clone();
                let resolved = self.table.resolve(&name).map(|s| s.kind.clone());
                match resolved {
                    Some(SymbolKind::Var(ty)) => Some(ty),
                    Some(SymbolKind::Const { ty, .. }) => Some(ty),
                    Some(SymbolKind::Map(info)) => Some(Type::Map {
                        key: Box::new(info.key),
                        value: Box::new(info.value),
                        kind: info.kind,
                        config: info.config,
                    }),
                    Some(SymbolKind::Function(_)) => {
                        self.errors.push(SemanticError::NotCallable {
                            what: format!("function `{name}` used as a value"),
                            position,
                        });
                        None
                    }
                    Some(SymbolKind::Config(_)) => Some(Type::Named(name)),
                    Some(SymbolKind::Struct(_))
                    | Some(SymbolKind::Enum(_))
                    | Some(SymbolKind::Alias(_)) => {
                        self.errors.push(SemanticError::TypeMismatch {
                            expected: "a value".to_string(),
                            got: format!("type `{name}`"),
                            position,
                        });
                        None
                    }
                    None => {
                        self.errors.push(SemanticError::UnresolvedSymbol {
                            name,
                            position,
                        });
                        None
                    }
                }
            }
            ExprKind::Field(base, field) => {
                let field = field.clone();
                // Config reads resolve through the config symbol.
                let config_fields = match &base.kind {
                    ExprKind::Ident(base_name) => match self.table.resolve(base_name) {
                        Some(Symbol {
                            kind: SymbolKind::Config(fields),
                            ..
                        }) => Some((base_name.clone(), fields.clone())),
                        _ => None,
                    },
                    _ => None,
                };
                if let Some((base_name, fields)) = config_fields {
                    base.ty = Some(Type::Named(base_name.clone()));
                    return match fields.iter().find(|(n, _)| *n == field) {
                        Some((_, ty)) => Some(ty.clone()),
                        None => {
                            self.errors.push(SemanticError::UnresolvedSymbol {
                                name: format!("{base_name}.{field}"),
                                position,
                            });
                            None
                        }
                    };
                }
                let base_ty = self.check_expr(base)?;
                let struct_ty = self.table.resolve_type(base_ty.unwrap_nullable());
                match self.table.struct_fields(&struct_ty) {
                    Some(fields) => match fields.iter().find(|f| f.name == field) {
                        Some(f) => Some(f.ty.clone()),
                        None => {
                            self.errors.push(SemanticError::UnresolvedSymbol {
                                name: format!("{struct_ty}.{field}"),
                                position,
                            });
                            None
                        }
                    },
                    None => {
                        self.errors.push(SemanticError::TypeMismatch {
                            expected: "a struct value".to_string(),
                            got: base_ty.to_string(),
                            position,
                        });
                        None
                    }
                }
            }
            ExprKind::Arrow(base, field) => {
                let field = field.clone();
                let base_ty = self.check_expr(base)?;
                match self.table.resolve_type(&base_ty) {
                    Type::Pointer(inner) => match self.table.struct_fields(&inner) {
                        Some(fields) => match fields.iter().find(|f| f.name == field) {
                            Some(f) => Some(f.ty.clone()),
                            None => {
                                self.errors.push(SemanticError::UnresolvedSymbol {
                                    name: format!("{inner}.{field}"),
                                    position,
                                });
                                None
                            }
                        },
                        None => {
                            self.errors.push(SemanticError::TypeMismatch {
                                expected: "a pointer to a struct".to_string(),
                                got: base_ty.to_string(),
                                position,
                            });
                            None
                        }
                    },
                    other => {
                        self.errors.push(SemanticError::TypeMismatch {
                            expected: "a pointer".to_string(),
                            got: other.to_string(),
                            position,
                        });
                        None
                    }
                }
            }
            ExprKind::Index(base, key) => {
                if let Some(info) = self.map_of(base) {
                    let key_ty = self.check_expr(key);
                    if let Some(actual) = &key_ty {
                        self.require_assignable(&info.key, actual, key, &position);
                    }
                    // A read may miss: the result is the value or `none`.
                    return Some(Type::Nullable(Box::new(info.value)));
                }
                let base_ty = self.check_expr(base)?;
                match self.table.resolve_type(&base_ty) {
                    Type::Array(elem, _) => {
                        if let Some(idx_ty) = self.check_expr(key) {
                            if !self
                                .table
                                .resolve_type(idx_ty.unwrap_nullable())
                                .is_integer()
                            {
                                self.errors.push(SemanticError::TypeMismatch {
                                    expected: "an integer index".to_string(),
                                    got: idx_ty.to_string(),
                                    position,
                                });
                            }
                        }
                        Some(*elem)
                    }
                    other => {
                        self.errors.push(SemanticError::TypeMismatch {
                            expected: "a map or array".to_string(),
                            got: other.to_string(),
                            position,
                        });
                        None
                    }
                }
            }
            ExprKind::Call { callee, args } => {
                let name = match &callee.kind {
                    ExprKind::Ident(name) => name.clone(),
                    _ => {
                        self.errors.push(SemanticError::NotCallable {
                            what: "this expression".to_string(),
                            position,
                        });
                        return None;
                    }
                };
                self.check_call(&name, args, position)
            }
            ExprKind::Unary { op, operand } => {
                let op = *op;
                let operand_ty = self.check_expr(operand)?;
                let resolved = self.table.resolve_type(operand_ty.unwrap_nullable());
                match op {
                    UnaryOp::Neg => {
                        if resolved.is_integer() {
                            if resolved.is_signed() {
                                Some(resolved)
                            } else {
                                Some(Type::I64)
                            }
                        } else {
                            self.errors.push(SemanticError::TypeMismatch {
                                expected: "an integer".to_string(),
                                got: operand_ty.to_string(),
                                position,
                            });
                            None
                        }
                    }
                    UnaryOp::Not => {
                        if resolved == Type::Bool {
                            Some(Type::Bool)
                        } else {
                            self.errors.push(SemanticError::TypeMismatch {
                                expected: "bool".to_string(),
                                got: operand_ty.to_string(),
                                position,
                            });
                            None
                        }
                    }
                }
            }
            ExprKind::Binary { left, op, right } => {
                let op = *op;
                // Comparisons against the `none` sentinel test map-read
                // presence and only need the other side to be nullable.
                if op == BinaryOp::Eq || op == BinaryOp::Ne {
                    let left_none = matches!(left.kind, ExprKind::None);
                    let right_none = matches!(right.kind, ExprKind::None);
                    if left_none || right_none {
                        let other_ty = if left_none {
                            self.check_expr(right)?
                        } else {
                            self.check_expr(left)?
                        };
                        if !matches!(other_ty, Type::Nullable(_)) {
                            self.errors.push(SemanticError::TypeMismatch {
                                expected: "a map-read result".to_string(),
                                got: other_ty.to_string(),
                                position,
                            });
                        }
                        if left_none {
                            left.ty = Some(Type::Nullable(Box::new(Type::Unit)));
                        } else {
                            right.ty = Some(Type::Nullable(Box::new(Type::Unit)));
                        }
                        return Some(Type::Bool);
                    }
                }

                let left_ty = self.check_expr(left)?;
                let right_ty = self.check_expr(right)?;
                let l = self.table.resolve_type(left_ty.unwrap_nullable());
                let r = self.table.resolve_type(right_ty.unwrap_nullable());

                if op.is_logical() {
                    if l != Type::Bool || r != Type::Bool {
                        self.errors.push(SemanticError::TypeMismatch {
                            expected: "bool operands".to_string(),
                            got: format!("{l} and {r}"),
                            position,
                        });
                        return None;
                    }
                    return Some(Type::Bool);
                }

                let unified = self.unify_numeric(&l, &r, left, right, &position)?;
                if op.is_comparison() {
                    Some(Type::Bool)
                } else {
                    Some(unified)
                }
            }
        }
    }

    /// Unify the operand types of an arithmetic or comparison operator.
    /// Literals adopt the other side's width when the value fits.
    fn unify_numeric(
        &mut self,
        l: &Type,
        r: &Type,
        left: &mut Expr,
        right: &mut Expr,
        position: &Position,
    ) -> Option<Type> {
        if l == r && (l.is_integer() || *l == Type::Bool || matches!(l, Type::Named(_))) {
            return Some(l.clone());
        }
        if l.is_integer() && r.is_integer() {
            if retag_literal(right, l) {
                return Some(l.clone());
            }
            if retag_literal(left, r) {
                return Some(r.clone());
            }
            self.errors.push(SemanticError::TypeMismatch {
                expected: l.to_string(),
                got: r.to_string(),
                position: position.clone(),
            });
            return None;
        }
        // Enum constants compare against their integer representation.
        if matches!(l, Type::Named(_)) && r.is_integer() {
            return Some(l.clone());
        }
        if matches!(r, Type::Named(_)) && l.is_integer() {
            return Some(r.clone());
        }
        self.errors.push(SemanticError::TypeMismatch {
            expected: l.to_string(),
            got: r.to_string(),
            position: position.clone(),
        });
        None
    }

    fn check_call(&mut self, name: &str, args: &mut [Expr], position: Position) -> Option<Type> {
        match name {
            "load" => {
                if args.len() != 1 {
                    self.errors.push(SemanticError::ArityMismatch {
                        name: "load".to_string(),
                        expected: 1,
                        got: args.len(),
                        position,
                    });
                    return None;
                }
                let target = match &args[0].kind {
                    ExprKind::Ident(target) => target.clone(),
                    _ => {
                        self.errors.push(SemanticError::NotCallable {
                            what: "load target must be a function name".to_string(),
                            position,
                        });
                        return None;
                    }
                };
                let resolved = self.table.resolve_root(&target).map(|s| s.kind.clone());
                match resolved {
                    Some(SymbolKind::Function(info))
                        if info.attribute.as_ref().map(|a| a.is_entry()).unwrap_or(false) =>
                    {
                        args[0].ty = Some(Type::ProgramHandle);
                        Some(Type::ProgramHandle)
                    }
                    Some(_) => {
                        self.errors.push(SemanticError::AttributeMisuse {
                            message: format!(
                                "load expects an @xdp, @tc or @kprobe function, `{target}` is not one"
                            ),
                            position,
                        });
                        None
                    }
                    None => {
                        self.errors.push(SemanticError::UnresolvedSymbol {
                            name: target,
                            position,
                        });
                        None
                    }
                }
            }
            "attach" => {
                if args.len() != 3 {
                    self.errors.push(SemanticError::ArityMismatch {
                        name: "attach".to_string(),
                        expected: 3,
                        got: args.len(),
                        position,
                    });
                    return None;
                }
                if let Some(ty) = self.check_expr(&mut args[0]) {
                    if ty != Type::ProgramHandle {
                        let at = args[0].position.clone();
                        self.errors.push(SemanticError::TypeMismatch {
                            expected: "a program handle from load(...)".to_string(),
                            got: ty.to_string(),
                            position: at,
                        });
                    }
                }
                if let Some(ty) = self.check_expr(&mut args[1]) {
                    if !matches!(self.table.resolve_type(&ty), Type::Str(_)) {
                        let at = args[1].position.clone();
                        self.errors.push(SemanticError::TypeMismatch {
                            expected: "an interface name".to_string(),
                            got: ty.to_string(),
                            position: at,
                        });
                    }
                }
                if let Some(ty) = self.check_expr(&mut args[2]) {
                    if !self.table.resolve_type(ty.unwrap_nullable()).is_integer() {
                        let at = args[2].position.clone();
                        self.errors.push(SemanticError::TypeMismatch {
                            expected: "integer flags".to_string(),
                            got: ty.to_string(),
                            position: at,
                        });
                    }
                }
                Some(Type::I32)
            }
            "detach" => {
                if args.len() != 1 {
                    self.errors.push(SemanticError::ArityMismatch {
                        name: "detach".to_string(),
                        expected: 1,
                        got: args.len(),
                        position,
                    });
                    return None;
                }
                if let Some(ty) = self.check_expr(&mut args[0]) {
                    if ty != Type::ProgramHandle {
                        let at = args[0].position.clone();
                        self.errors.push(SemanticError::TypeMismatch {
                            expected: "a program handle from load(...)".to_string(),
                            got: ty.to_string(),
                            position: at,
                        });
                    }
                }
                Some(Type::Unit)
            }
            "print" => {
                if args.is_empty() {
                    self.errors.push(SemanticError::ArityMismatch {
                        name: "print".to_string(),
                        expected: 1,
                        got: 0,
                        position,
                    });
                    return None;
                }
                let format = match &args[0].kind {
                    ExprKind::Str(s) => s.clone(),
                    _ => {
                        let at = args[0].position.clone();
                        self.errors.push(SemanticError::TypeMismatch {
                            expected: "a format string literal".to_string(),
                            got: "an expression".to_string(),
                            position: at,
                        });
                        return Some(Type::Unit);
                    }
                };
                args[0].ty = Some(Type::Str(format.len()));
                let placeholders = count_placeholders(&format);
                if placeholders != args.len() - 1 {
                    self.errors.push(SemanticError::ArityMismatch {
                        name: "print".to_string(),
                        expected: placeholders + 1,
                        got: args.len(),
                        position,
                    });
                }
                for arg in args.iter_mut().skip(1) {
                    self.check_expr(arg);
                }
                Some(Type::Unit)
            }
            _ => {
                let resolved = self.table.resolve(name).map(|s| s.kind.clone());
                let info = match resolved {
                    Some(SymbolKind::Function(info)) => info,
                    Some(_) => {
                        self.errors.push(SemanticError::NotCallable {
                            what: format!("`{name}`"),
                            position,
                        });
                        return None;
                    }
                    None => {
                        self.errors.push(SemanticError::UnresolvedSymbol {
                            name: name.to_string(),
                            position,
                        });
                        return None;
                    }
                };
                if args.len() != info.params.len() {
                    self.errors.push(SemanticError::ArityMismatch {
                        name: name.to_string(),
                        expected: info.params.len(),
                        got: args.len(),
                        position: position.clone(),
                    });
                } else {
                    for (arg, (_, expected)) in args.iter_mut().zip(&info.params) {
                        if let Some(actual) = self.check_expr(arg) {
                            let expected = expected.clone();
                            let at = arg.position.clone();
                            self.require_assignable(&expected, &actual, arg, &at);
                        }
                    }
                }
                if let Some(current) = &self.current {
                    self.edges.push(CallEdge {
                        caller: current.name.clone(),
                        caller_attr: current.attribute.clone(),
                        callee: name.to_string(),
                        position,
                    });
                }
                Some(info.return_type.unwrap_or(Type::Unit))
            }
        }
    }

    fn require_assignable(
        &mut self,
        expected: &Type,
        actual: &Type,
        value: &mut Expr,
        position: &Position,
    ) {
        let e = self.table.resolve_type(expected);
        let a = self.table.resolve_type(actual.unwrap_nullable());
        if e == a {
            return;
        }
        if e.is_integer() && a.is_integer() && retag_literal(value, &e) {
            return;
        }
        if let (Type::Str(n), Type::Str(m)) = (&e, &a) {
            if m <= n {
                return;
            }
        }
        // Enum values flow into integers and vice versa.
        if (matches!(e, Type::Named(_)) && a.is_integer())
            || (e.is_integer() && matches!(a, Type::Named(_)))
        {
            return;
        }
        self.errors.push(SemanticError::TypeMismatch {
            expected: e.to_string(),
            got: actual.to_string(),
            position: position.clone(),
        });
    }

    fn check_visibility(&mut self) {
        let mut errors = Vec::new();
        for edge in &self.edges {
            let callee_attr = match self.table.resolve_root(&edge.callee) {
                Some(Symbol {
                    kind: SymbolKind::Function(info),
                    ..
                }) => info.attribute.clone(),
                _ => continue,
            };
            let caller_kernel = edge.caller_attr.is_some();
            match callee_attr {
                Some(Attribute::Private) => {
                    // Private functions serve @private and @kfunc bodies only.
                    let allowed = matches!(
                        edge.caller_attr,
                        Some(Attribute::Private) | Some(Attribute::Kfunc)
                    );
                    if !allowed {
                        errors.push(SemanticError::PrivateNotExposed {
                            callee: edge.callee.clone(),
                            caller: edge.caller.clone(),
                            position: edge.position.clone(),
                        });
                    }
                }
                Some(attr) if attr.is_entry() => {
                    errors.push(SemanticError::AttributeMisuse {
                        message: format!(
                            "kernel program `{}` cannot be called directly; use load/attach",
                            edge.callee
                        ),
                        position: edge.position.clone(),
                    });
                }
                Some(Attribute::Helper) | Some(Attribute::Kfunc) => {
                    if !caller_kernel {
                        errors.push(SemanticError::AttributeMisuse {
                            message: format!(
                                "`{}` is kernel-side and cannot be called from user space",
                                edge.callee
                            ),
                            position: edge.position.clone(),
                        });
                    }
                }
                _ => {}
            }
        }
        self.errors.extend(errors);
    }

    /// The eBPF verifier rejects recursion; catch it on the kernel-side
    /// call graph before codegen.
    fn check_kernel_recursion(&mut self) {
        let mut adjacency: HashMap<&str, Vec<&CallEdge>> = HashMap::new();
        for edge in &self.edges {
            if edge.caller_attr.is_some() {
                adjacency.entry(edge.caller.as_str()).or_default().push(edge);
            }
        }
        let mut errors = Vec::new();
        for start in adjacency.keys().copied() {
            let mut stack = vec![start];
            let mut visited = HashSet::new();
            while let Some(node) = stack.pop() {
                for edge in adjacency.get(node).into_iter().flatten() {
                    if edge.callee == start {
                        errors.push(SemanticError::VerifierWouldReject {
                            message: format!("recursive call cycle through `{start}`"),
                            position: edge.position.clone(),
                        });
                        stack.clear();
                        break;
                    }
                    if visited.insert(edge.callee.as_str()) {
                        stack.push(edge.callee.as_str());
                    }
                }
            }
        }
        self.errors.extend(errors);
    }
}

fn resolve_attr(spec: &AttrSpec) -> Result<Attribute, SemanticError> {
    match spec.name.as_str() {
        "xdp" => match &spec.arg {
            None => Ok(Attribute::Xdp),
            Some(_) => Err(SemanticError::AttributeMisuse {
                message: "@xdp takes no argument".to_string(),
                position: spec.position.clone(),
            }),
        },
        "tc" => match spec.arg.as_deref() {
            Some("ingress") => Ok(Attribute::Tc(TcDirection::Ingress)),
            Some("egress") => Ok(Attribute::Tc(TcDirection::Egress)),
            Some(other) => Err(SemanticError::AttributeMisuse {
                message: format!(
                    "@tc direction must be \"ingress\" or \"egress\", found \"{other}\""
                ),
                position: spec.position.clone(),
            }),
            None => Err(SemanticError::AttributeMisuse {
                message: "@tc requires a direction argument".to_string(),
                position: spec.position.clone(),
            }),
        },
        "kprobe" => match spec.arg.as_deref() {
            Some(sym) if !sym.is_empty() => Ok(Attribute::Kprobe(sym.to_string())),
            _ => Err(SemanticError::AttributeMisuse {
                message: "@kprobe requires a target symbol".to_string(),
                position: spec.position.clone(),
            }),
        },
        "kfunc" => no_arg(spec, Attribute::Kfunc),
        "helper" => no_arg(spec, Attribute::Helper),
        "private" => no_arg(spec, Attribute::Private),
        other => Err(SemanticError::UnknownAttribute {
            name: other.to_string(),
            position: spec.position.clone(),
        }),
    }
}

fn no_arg(spec: &AttrSpec, attr: Attribute) -> Result<Attribute, SemanticError> {
    match &spec.arg {
        None => Ok(attr),
        Some(_) => Err(SemanticError::AttributeMisuse {
            message: format!("@{} takes no argument", spec.name),
            position: spec.position.clone(),
        }),
    }
}

/// The default type a literal initializer gives an untyped global.
fn default_literal_type(expr: &Expr) -> Option<Type> {
    match &expr.kind {
        ExprKind::Int(v) => Some(v.ty()),
        ExprKind::Bool(_) => Some(Type::Bool),
        ExprKind::Str(s) => Some(Type::Str(s.len())),
        _ => None,
    }
}

/// Retag an integer literal to the expected width if the value fits. The
/// widening stays reversible because the tag records the new width.
fn retag_literal(expr: &mut Expr, expected: &Type) -> bool {
    match &mut expr.kind {
        ExprKind::Int(value) => match value.retag(expected) {
            Some(retagged) => {
                *value = retagged;
                expr.ty = Some(expected.clone());
                true
            }
            None => false,
        },
        ExprKind::Unary {
            op: UnaryOp::Neg,
            operand,
        } => {
            // A negated literal collapses into the literal of the negated
            // value, so the sign survives into codegen.
            if let ExprKind::Int(value) = &operand.kind {
                let wide = -(value.widen());
                if let Some(retagged) =
                    IntValue::I64(0).retag(expected).and_then(|t| t.rewrap(wide))
                {
                    expr.kind = ExprKind::Int(retagged);
                    expr.ty = Some(expected.clone());
                    return true;
                }
            }
            false
        }
        _ => false,
    }
}

/// `{}` placeholder count, honoring `{{`/`}}` escapes.
fn count_placeholders(format: &str) -> usize {
    let mut count = 0;
    let mut chars = format.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                } else if chars.peek() == Some(&'}') {
                    chars.next();
                    count += 1;
                }
            }
            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                }
            }
            _ => {}
        }
    }
    count
}

/// Names assigned anywhere in a block, for conservative invalidation of the
/// constant environment after branches.
pub(crate) fn assigned_names(block: &Block, out: &mut HashSet<String>) {
    for stmt in &block.statements {
        match stmt {
            Statement::VarDecl { name, .. } => {
                out.insert(name.clone());
            }
            Statement::Assign { target, .. } => {
                if let ExprKind::Ident(name) = &target.kind {
                    out.insert(name.clone());
                }
            }
            Statement::If {
                then_block,
                else_block,
                ..
            } => {
                assigned_names(then_block, out);
                if let Some(else_block) = else_block {
                    assigned_names(else_block, out);
                }
            }
            Statement::For { body, .. } => assigned_names(body, out),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parser::parse;

    fn check_src(src: &str) -> Result<TypedProgram, Vec<SemanticError>> {
        let program = parse(src, "test.ks").expect("source should parse");
        check(program, "test.ks")
    }

    const VALID_XDP: &str = r#"
        include "xdp.kh"

        var packet_counts : hash<u32, u64>(1024)

        @xdp fn rate_limit(ctx: *xdp_md) -> xdp_action {
            var cnt = packet_counts[0]
            if cnt == none {
                packet_counts[0] = 1
                return XDP_PASS
            }
            return XDP_DROP
        }

        fn main() -> i32 {
            var prog = load(rate_limit)
            var rc = attach(prog, "eth0", 0)
            return rc
        }
    "#;

    #[test]
    fn test_valid_program_checks() {
        let typed = check_src(VALID_XDP).expect("program should check");
        assert_eq!(typed.program.declarations.len(), 3);
    }

    #[test]
    fn test_missing_main() {
        let errors = check_src(
            r#"
            include "xdp.kh"
            @xdp fn t(ctx: *xdp_md) -> xdp_action {
                return XDP_PASS
            }
            fn helper_fn() -> i32 {
                return 0
            }
            "#,
        )
        .unwrap_err();
        assert!(matches!(errors[0], SemanticError::MissingMain { .. }));
    }

    #[test]
    fn test_multiple_main() {
        let errors = check_src(
            r#"
            fn main() -> i32 {
                return 0
            }
            fn main() -> i32 {
                return 1
            }
            "#,
        )
        .unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SemanticError::MultipleMain { .. })));
    }

    #[test]
    fn test_wrong_main_return_type() {
        let errors = check_src(
            r#"
            fn main() -> u32 {
                return 0
            }
            "#,
        )
        .unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SemanticError::InvalidMainSignature { .. })));
    }

    #[test]
    fn test_main_with_non_struct_param() {
        let errors = check_src(
            r#"
            fn main(count: u32) -> i32 {
                return 0
            }
            "#,
        )
        .unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SemanticError::InvalidMainSignature { .. })));
    }

    #[test]
    fn test_main_with_args_struct() {
        check_src(
            r#"
            struct Args {
                interface: str(20),
                limit: u32,
            }
            fn main(args: Args) -> i32 {
                print("limit {}", args.limit)
                return 0
            }
            "#,
        )
        .expect("struct-typed main should check");
    }

    #[test]
    fn test_xdp_signature_enforced() {
        let errors = check_src(
            r#"
            include "xdp.kh"
            @xdp fn bad(ctx: *xdp_md) -> i32 {
                return 0
            }
            fn main() -> i32 {
                return 0
            }
            "#,
        )
        .unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SemanticError::AttributeMisuse { .. })));
    }

    #[test]
    fn test_tc_direction_validated() {
        let errors = check_src(
            r#"
            include "tc.kh"
            @tc("sideways") fn bad(ctx: *__sk_buff) -> i32 {
                return TC_ACT_OK
            }
            fn main() -> i32 {
                return 0
            }
            "#,
        )
        .unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SemanticError::AttributeMisuse { .. })));
    }

    #[test]
    fn test_unknown_attribute() {
        let errors = check_src(
            r#"
            @uprobe fn bad() -> i32 {
                return 0
            }
            fn main() -> i32 {
                return 0
            }
            "#,
        )
        .unwrap_err();
        assert!(errors.iter().any(
            |e| matches!(e, SemanticError::UnknownAttribute { name, .. } if name == "uprobe")
        ));
    }

    #[test]
    fn test_private_not_exposed_to_xdp() {
        let errors = check_src(
            r#"
            include "xdp.kh"
            @private fn should_drop() -> bool {
                return true
            }
            @xdp fn filter(ctx: *xdp_md) -> xdp_action {
                if should_drop() {
                    return XDP_DROP
                }
                return XDP_PASS
            }
            fn main() -> i32 {
                return 0
            }
            "#,
        )
        .unwrap_err();
        assert!(errors.iter().any(|e| matches!(
            e,
            SemanticError::PrivateNotExposed { callee, .. } if callee == "should_drop"
        )));
    }

    #[test]
    fn test_private_callable_from_kfunc() {
        check_src(
            r#"
            @private fn clamp(v: u64) -> u64 {
                if v > 100 {
                    return 100
                }
                return v
            }
            @kfunc fn normalize(v: u64) -> u64 {
                return clamp(v)
            }
            fn main() -> i32 {
                return 0
            }
            "#,
        )
        .expect("kfunc may call private");
    }

    #[test]
    fn test_userspace_cannot_call_entry_program() {
        let errors = check_src(
            r#"
            include "xdp.kh"
            @xdp fn prog(ctx: *xdp_md) -> xdp_action {
                return XDP_PASS
            }
            fn main() -> i32 {
                var ctx_stub = 0
                prog(ctx_stub)
                return 0
            }
            "#,
        )
        .unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SemanticError::AttributeMisuse { .. })));
    }

    #[test]
    fn test_map_key_type_checked() {
        let errors = check_src(
            r#"
            var counters : hash<u32, u64>(64)
            fn main() -> i32 {
                counters["oops"] = 1
                return 0
            }
            "#,
        )
        .unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SemanticError::TypeMismatch { .. })));
    }

    #[test]
    fn test_local_map_rejected() {
        let errors = check_src(
            r#"
            fn main() -> i32 {
                var local_map : hash<u32, u64>(16) = 0
                return 0
            }
            "#,
        )
        .unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SemanticError::MapMisuse { .. })));
    }

    #[test]
    fn test_kernel_recursion_rejected() {
        let errors = check_src(
            r#"
            @helper fn ping(n: u32) -> u32 {
                return pong(n)
            }
            @helper fn pong(n: u32) -> u32 {
                return ping(n)
            }
            fn main() -> i32 {
                return 0
            }
            "#,
        )
        .unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SemanticError::VerifierWouldReject { .. })));
    }

    #[test]
    fn test_duplicate_top_level_symbol() {
        let errors = check_src(
            r#"
            var counters : hash<u32, u64>(64)
            var counters : hash<u32, u64>(64)
            fn main() -> i32 {
                return 0
            }
            "#,
        )
        .unwrap_err();
        assert!(errors.iter().any(
            |e| matches!(e, SemanticError::DuplicateSymbol { name, .. } if name == "counters")
        ));
    }

    #[test]
    fn test_unresolved_symbol_position() {
        let errors = check_src(
            r#"
            fn main() -> i32 {
                return missing + 1
            }
            "#,
        )
        .unwrap_err();
        match &errors[0] {
            SemanticError::UnresolvedSymbol { name, position } => {
                assert_eq!(name, "missing");
                assert_eq!(position.file, "test.ks");
                assert_eq!(position.line, 3);
            }
            other => panic!("expected UnresolvedSymbol, got {other}"),
        }
    }

    #[test]
    fn test_print_placeholder_arity() {
        let errors = check_src(
            r#"
            fn main() -> i32 {
                print("a {} b {}", 1)
                return 0
            }
            "#,
        )
        .unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SemanticError::ArityMismatch { name, .. } if name == "print")));
    }

    #[test]
    fn test_literal_adopts_declared_width() {
        check_src(
            r#"
            var counters : hash<u32, u64>(64)
            fn main() -> i32 {
                counters[5] = 9
                return 0
            }
            "#,
        )
        .expect("literal keys and values should coerce");
    }

    #[test]
    fn test_none_comparison_requires_map_read() {
        let errors = check_src(
            r#"
            fn main() -> i32 {
                var x = 3
                if x == none {
                    return 1
                }
                return 0
            }
            "#,
        )
        .unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, SemanticError::TypeMismatch { .. })));
    }
}
