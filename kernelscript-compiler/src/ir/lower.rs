//! Lowering from the typed AST to the two-sided IR.
//!
//! Declarations are partitioned into the kernel and user sides: attributed
//! functions (plus the plain functions they reach) go kernel-side, `main`
//! (plus the plain functions it reaches) goes user-side, and a plain
//! function reachable from both is lowered once per side. Map reads nested
//! inside larger expressions are hoisted into named lookups so both
//! emitters see map traffic as explicit statements.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, info};

use crate::script::ast::{
    Attribute, Block, Declaration, Expr, ExprKind, ForRange, IntValue, Position, Statement, Type,
};
use crate::sema::check::assigned_names;
use crate::sema::fold::{fold, ConstEnv};
use crate::sema::loops::{analyze, BoundInfo, LoopLimits, LoopStrategy};
use crate::sema::symbol::{Symbol, SymbolKind, SymbolTable};
use crate::sema::{SemanticError, TypedProgram};

use super::{
    IrConfig, IrMap, IrStmt, KernelFunction, KernelIr, LoopPlan, UserFunction, UserIr,
};

type Result<T> = std::result::Result<T, SemanticError>;

pub fn generate(
    typed: &TypedProgram,
    unit: &str,
    limits: LoopLimits,
) -> Result<(KernelIr, UserIr)> {
    let program = &typed.program;
    let table = &typed.table;

    // Shared catalogs, in declaration order; slots are stable indices.
    let mut maps = Vec::new();
    let mut configs = Vec::new();
    let mut structs = Vec::new();
    let mut enums = Vec::new();
    let mut aliases = Vec::new();
    let mut globals = Vec::new();
    for decl in &program.declarations {
        match decl {
            Declaration::Map(m) => {
                let slot = maps.len();
                maps.push(IrMap {
                    name: m.name.clone(),
                    kind: m.kind,
                    key: table.resolve_type(&m.key),
                    value: table.resolve_type(&m.value),
                    config: m.config.clone(),
                    pinned: m.pinned,
                    slot,
                });
            }
            Declaration::Config(c) => configs.push(IrConfig {
                name: c.name.clone(),
                fields: c
                    .fields
                    .iter()
                    .map(|f| (f.name.clone(), table.resolve_type(&f.ty)))
                    .collect(),
            }),
            Declaration::Struct(s) => structs.push(s.clone()),
            Declaration::Enum(e) => enums.push(e.clone()),
            Declaration::TypeAlias(a) => aliases.push(a.clone()),
            Declaration::GlobalVar(g) => {
                // Constant globals were folded away by the checker; the
                // rest live kernel-side.
                let is_const = matches!(
                    table.resolve_root(&g.name),
                    Some(Symbol {
                        kind: SymbolKind::Const { .. },
                        ..
                    })
                );
                if !is_const {
                    let ty = match table.resolve_root(&g.name) {
                        Some(Symbol {
                            kind: SymbolKind::Var(ty),
                            ..
                        }) => ty.clone(),
                        _ => Type::U64,
                    };
                    globals.push((g.name.clone(), ty, g.init.clone()));
                }
            }
            _ => {}
        }
    }
    let enum_names: HashSet<String> = enums.iter().map(|e| e.name.clone()).collect();

    // Call graph over named functions, for side partitioning.
    let mut calls: HashMap<String, Vec<String>> = HashMap::new();
    for decl in &program.declarations {
        let f = match decl {
            Declaration::Function(f) => f,
            Declaration::Attributed(af) => &af.function,
            _ => continue,
        };
        let mut targets = Vec::new();
        collect_calls(&f.body, &mut targets);
        calls.insert(f.name.clone(), targets);
    }
    let plain: HashSet<String> = program
        .declarations
        .iter()
        .filter_map(|d| match d {
            Declaration::Function(f) if f.name != "main" => Some(f.name.clone()),
            _ => None,
        })
        .collect();

    let kernel_roots: Vec<String> = program
        .declarations
        .iter()
        .filter_map(|d| match d {
            Declaration::Attributed(af) => Some(af.function.name.clone()),
            _ => None,
        })
        .collect();
    let kernel_plain = reachable_plain(&kernel_roots, &calls, &plain);
    let user_plain = reachable_plain(&["main".to_string()], &calls, &plain);

    let mut kernel = KernelIr {
        unit: unit.to_string(),
        maps: maps.clone(),
        configs: configs.clone(),
        structs: structs.clone(),
        enums: enums.clone(),
        aliases: aliases.clone(),
        globals,
        programs: Vec::new(),
        kfuncs: Vec::new(),
        helpers: Vec::new(),
    };
    let mut user = UserIr {
        unit: unit.to_string(),
        args_struct: None,
        args_param: None,
        main_body: Vec::new(),
        functions: Vec::new(),
        structs,
        enums,
        aliases,
        configs,
        maps,
        maps_used: Vec::new(),
        configs_used: Vec::new(),
        loads: Vec::new(),
        uses_skeleton: false,
        has_pinned: false,
    };
    user.has_pinned = kernel.maps.iter().any(|m| m.pinned);

    let mut user_tracking = UserTracking::default();

    for decl in &program.declarations {
        match decl {
            Declaration::Attributed(af) => {
                let attribute = af
                    .resolved
                    .clone()
                    .expect("attributes are resolved on a clean tree");
                let mut ctx = Lower::new(table, &enum_names, limits, Side::Kernel);
                let body = ctx.lower_block(&af.function.body, &mut typed.globals.clone())?;
                let function = KernelFunction {
                    name: af.function.name.clone(),
                    attribute: Some(attribute.clone()),
                    section: attribute.section(),
                    params: af.function.params.clone(),
                    return_type: af.function.return_type.clone(),
                    body,
                    configs_read: ctx.configs_read.into_iter().collect(),
                };
                match attribute {
                    Attribute::Kfunc => kernel.kfuncs.push(function),
                    Attribute::Helper | Attribute::Private => kernel.helpers.push(function),
                    _ => kernel.programs.push(function),
                }
            }
            Declaration::Function(f) if f.name == "main" => {
                let mut ctx = Lower::new(table, &enum_names, limits, Side::User);
                let body = ctx.lower_block(&f.body, &mut typed.globals.clone())?;
                ctx.drain_into(&mut user_tracking);
                user.main_body = body;
                if let Some(param) = f.params.first() {
                    user.args_param = Some(param.name.clone());
                    if let Type::Named(struct_name) = table.resolve_type(&param.ty) {
                        user.args_struct = user
                            .structs
                            .iter()
                            .find(|s| s.name == struct_name)
                            .cloned();
                    }
                }
            }
            Declaration::Function(f) => {
                if kernel_plain.contains(&f.name) {
                    let mut ctx = Lower::new(table, &enum_names, limits, Side::Kernel);
                    let body = ctx.lower_block(&f.body, &mut typed.globals.clone())?;
                    kernel.helpers.push(KernelFunction {
                        name: f.name.clone(),
                        attribute: None,
                        section: None,
                        params: f.params.clone(),
                        return_type: f.return_type.clone(),
                        body,
                        configs_read: ctx.configs_read.into_iter().collect(),
                    });
                }
                if user_plain.contains(&f.name) {
                    let mut ctx = Lower::new(table, &enum_names, limits, Side::User);
                    let body = ctx.lower_block(&f.body, &mut typed.globals.clone())?;
                    ctx.drain_into(&mut user_tracking);
                    user.functions.push(UserFunction {
                        name: f.name.clone(),
                        params: f.params.clone(),
                        return_type: f.return_type.clone(),
                        body,
                    });
                }
            }
            _ => {}
        }
    }

    user.maps_used = user_tracking.maps_used.into_iter().collect();
    user.configs_used = user_tracking.configs_used.into_iter().collect();
    user.loads = user_tracking.loads;
    user.uses_skeleton = !user.loads.is_empty()
        || user_tracking.attaches
        || !user.maps_used.is_empty();

    info!(
        "lowered unit `{}`: {} kernel program(s), {} kfunc(s), {} helper(s), {} map(s)",
        unit,
        kernel.programs.len(),
        kernel.kfuncs.len(),
        kernel.helpers.len(),
        kernel.maps.len()
    );
    Ok((kernel, user))
}

fn collect_calls(block: &Block, out: &mut Vec<String>) {
    fn walk_expr(expr: &Expr, out: &mut Vec<String>) {
        match &expr.kind {
            ExprKind::Call { callee, args } => {
                if let ExprKind::Ident(name) = &callee.kind {
                    out.push(name.clone());
                }
                for arg in args {
                    walk_expr(arg, out);
                }
            }
            ExprKind::Field(base, _) | ExprKind::Arrow(base, _) => walk_expr(base, out),
            ExprKind::Index(base, key) => {
                walk_expr(base, out);
                walk_expr(key, out);
            }
            ExprKind::Unary { operand, .. } => walk_expr(operand, out),
            ExprKind::Binary { left, right, .. } => {
                walk_expr(left, out);
                walk_expr(right, out);
            }
            _ => {}
        }
    }
    for stmt in &block.statements {
        match stmt {
            Statement::VarDecl { init, .. } => walk_expr(init, out),
            Statement::Assign { target, value, .. } => {
                walk_expr(target, out);
                walk_expr(value, out);
            }
            Statement::Delete { target, .. } => walk_expr(target, out),
            Statement::If {
                cond,
                then_block,
                else_block,
                ..
            } => {
                walk_expr(cond, out);
                collect_calls(then_block, out);
                if let Some(else_block) = else_block {
                    collect_calls(else_block, out);
                }
            }
            Statement::For { range, body, .. } => {
                match range {
                    ForRange::Range { start, end } => {
                        walk_expr(start, out);
                        walk_expr(end, out);
                    }
                    ForRange::Iter(source) => walk_expr(source, out),
                }
                collect_calls(body, out);
            }
            Statement::Return { value, .. } => {
                if let Some(value) = value {
                    walk_expr(value, out);
                }
            }
            Statement::Expr(expr) => walk_expr(expr, out),
        }
    }
}

fn reachable_plain(
    roots: &[String],
    calls: &HashMap<String, Vec<String>>,
    plain: &HashSet<String>,
) -> HashSet<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut stack: Vec<String> = roots.to_vec();
    while let Some(node) = stack.pop() {
        for callee in calls.get(&node).into_iter().flatten() {
            if plain.contains(callee) && seen.insert(callee.clone()) {
                stack.push(callee.clone());
            }
        }
    }
    seen
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Kernel,
    User,
}

#[derive(Debug, Default)]
struct UserTracking {
    maps_used: BTreeSet<String>,
    configs_used: BTreeSet<String>,
    loads: Vec<String>,
    attaches: bool,
}

struct Lower<'a> {
    table: &'a SymbolTable,
    /// User-declared enum names; their variant constants stay symbolic in C.
    enum_names: &'a HashSet<String>,
    limits: LoopLimits,
    side: Side,
    /// Fresh-name counter for hoisted lookups; per function.
    tmp: usize,
    /// Program handle variables established by `load(...)`.
    handles: HashMap<String, String>,
    configs_read: BTreeSet<String>,
    maps_used: BTreeSet<String>,
    configs_used: BTreeSet<String>,
    loads: Vec<String>,
    attaches: bool,
}

impl<'a> Lower<'a> {
    fn new(
        table: &'a SymbolTable,
        enum_names: &'a HashSet<String>,
        limits: LoopLimits,
        side: Side,
    ) -> Self {
        Self {
            table,
            enum_names,
            limits,
            side,
            tmp: 0,
            handles: HashMap::new(),
            configs_read: BTreeSet::new(),
            maps_used: BTreeSet::new(),
            configs_used: BTreeSet::new(),
            loads: Vec::new(),
            attaches: false,
        }
    }

    fn drain_into(self, tracking: &mut UserTracking) {
        tracking.maps_used.extend(self.maps_used);
        tracking.configs_used.extend(self.configs_used);
        tracking.loads.extend(self.loads);
        tracking.attaches |= self.attaches;
    }

    fn lower_block(&mut self, block: &Block, env: &mut ConstEnv) -> Result<Vec<IrStmt>> {
        let mut out = Vec::new();
        for stmt in &block.statements {
            self.lower_stmt(stmt, env, &mut out)?;
        }
        Ok(out)
    }

    fn lower_stmt(
        &mut self,
        stmt: &Statement,
        env: &mut ConstEnv,
        out: &mut Vec<IrStmt>,
    ) -> Result<()> {
        match stmt {
            Statement::VarDecl {
                name,
                ty,
                init,
                position,
            } => {
                // `var x = m[k]` keeps the user-chosen name on the lookup.
                if let Some((map, key)) = self.map_index(init) {
                    let key = self.lower_expr(&key, out, position)?;
                    let value_ty = self.map_value_ty(&map);
                    self.note_map(&map);
                    out.push(IrStmt::Lookup {
                        dst: name.clone(),
                        map,
                        key,
                        value_ty,
                    });
                    env.invalidate(name);
                    return Ok(());
                }
                if let Some((program, handle_pos)) = self.load_target(init) {
                    self.require_user("load", &handle_pos)?;
                    self.handles.insert(name.clone(), program.clone());
                    self.loads.push(program.clone());
                    out.push(IrStmt::Load {
                        handle: name.clone(),
                        program,
                    });
                    env.invalidate(name);
                    return Ok(());
                }
                if let Some(attach) = self.attach_stmt(init, Some(name.clone()), position, out)? {
                    out.push(attach);
                    env.invalidate(name);
                    return Ok(());
                }
                let lowered = self.lower_expr(init, out, position)?;
                let nullable = matches!(lowered.ty, Some(Type::Nullable(_)));
                let var_ty = match ty {
                    Some(t) => t.clone(),
                    None => match &lowered.ty {
                        Some(Type::Nullable(inner)) => (**inner).clone(),
                        Some(t) => t.clone(),
                        None => Type::I64,
                    },
                };
                match fold(init, env) {
                    Some(value) => env.bind(name, value),
                    None => env.invalidate(name),
                }
                out.push(IrStmt::Local {
                    name: name.clone(),
                    ty: var_ty,
                    init: Some(lowered),
                    nullable,
                });
                Ok(())
            }
            Statement::Assign {
                target,
                value,
                position,
            } => {
                if let Some((map, key)) = self.map_index(target) {
                    let key = self.lower_expr(&key, out, position)?;
                    let value = self.lower_expr(value, out, position)?;
                    self.note_map(&map);
                    out.push(IrStmt::Update { map, key, value });
                    return Ok(());
                }
                if let Some((config, field, slot)) = self.config_field(target) {
                    let value = self.lower_expr(value, out, position)?;
                    self.configs_used.insert(config.clone());
                    out.push(IrStmt::ConfigWrite {
                        config,
                        field,
                        slot,
                        value,
                    });
                    return Ok(());
                }
                let lowered_target = self.lower_expr(target, out, position)?;
                let lowered_value = self.lower_expr(value, out, position)?;
                if let ExprKind::Ident(name) = &target.kind {
                    match fold(value, env) {
                        Some(v) => env.bind(name, v),
                        None => env.invalidate(name),
                    }
                }
                out.push(IrStmt::Assign {
                    target: lowered_target,
                    value: lowered_value,
                });
                Ok(())
            }
            Statement::Delete { target, position } => {
                let (map, key) = self
                    .map_index(target)
                    .expect("checker guarantees delete targets a map entry");
                let key = self.lower_expr(&key, out, position)?;
                self.note_map(&map);
                out.push(IrStmt::Delete { map, key });
                Ok(())
            }
            Statement::If {
                cond,
                then_block,
                else_block,
                position,
            } => {
                let cond = self.lower_expr(cond, out, position)?;
                let mut then_env = env.clone();
                let then_body = self.lower_block(then_block, &mut then_env)?;
                let else_body = match else_block {
                    Some(else_block) => {
                        let mut else_env = env.clone();
                        self.lower_block(else_block, &mut else_env)?
                    }
                    None => Vec::new(),
                };
                let mut touched = HashSet::new();
                assigned_names(then_block, &mut touched);
                if let Some(else_block) = else_block {
                    assigned_names(else_block, &mut touched);
                }
                for name in touched {
                    env.invalidate(&name);
                }
                out.push(IrStmt::If {
                    cond,
                    then_body,
                    else_body,
                });
                Ok(())
            }
            Statement::For {
                var,
                range,
                body,
                position,
            } => {
                let analysis = analyze(range, env, self.limits);
                debug!(
                    "loop over `{var}` at {position}: {:?} -> {:?}",
                    analysis.bound, analysis.strategy
                );
                let (plan, desugared) = match range {
                    ForRange::Range { start, end } => {
                        let plan = match (analysis.bound, analysis.strategy) {
                            (BoundInfo::Bounded { lo, hi }, LoopStrategy::Unrolled) => {
                                LoopPlan::Unrolled { lo, hi }
                            }
                            (BoundInfo::Bounded { lo, hi }, LoopStrategy::Simple) => {
                                LoopPlan::Simple { lo, hi }
                            }
                            (BoundInfo::Bounded { lo, hi }, LoopStrategy::BpfLoop) => {
                                LoopPlan::BpfLoopConst {
                                    lo,
                                    count: (hi - lo).max(0),
                                }
                            }
                            (BoundInfo::Unbounded, _) => LoopPlan::BpfLoopDyn {
                                start: self.lower_expr(start, out, position)?,
                                end: self.lower_expr(end, out, position)?,
                            },
                        };
                        (plan, None)
                    }
                    ForRange::Iter(source) => {
                        // Desugar `for x in arr` into an index loop binding
                        // `x` from the element each iteration.
                        let source = self.lower_expr(source, out, position)?;
                        let (elem_ty, len) =
                            match self.table.resolve_type(source.ty.as_ref().unwrap_or(&Type::Unit))
                            {
                                Type::Array(elem, len) => ((*elem).clone(), len),
                                _ => (Type::U64, 0),
                            };
                        let idx_name = format!("{var}_idx");
                        let mut element = Expr::new(
                            ExprKind::Index(
                                Box::new(source),
                                Box::new({
                                    let mut idx =
                                        Expr::new(ExprKind::Ident(idx_name.clone()), position.clone());
                                    idx.ty = Some(Type::U64);
                                    idx
                                }),
                            ),
                            position.clone(),
                        );
                        element.ty = Some(elem_ty.clone());
                        let binding = IrStmt::Local {
                            name: var.clone(),
                            ty: elem_ty,
                            init: Some(element),
                            nullable: false,
                        };
                        (
                            LoopPlan::BpfLoopConst {
                                lo: 0,
                                count: len as i64,
                            },
                            Some((idx_name, binding)),
                        )
                    }
                };
                // Reassignments inside the body invalidate constants for
                // the whole body, matching the checker's environment.
                let mut touched = HashSet::new();
                assigned_names(body, &mut touched);
                let mut body_env = env.clone();
                body_env.invalidate(var);
                for name in &touched {
                    body_env.invalidate(name);
                }
                let mut lowered_body = self.lower_block(body, &mut body_env)?;
                let loop_var = match desugared {
                    Some((idx_name, binding)) => {
                        lowered_body.insert(0, binding);
                        idx_name
                    }
                    None => var.clone(),
                };
                for name in touched {
                    env.invalidate(&name);
                }
                out.push(IrStmt::Loop {
                    var: loop_var,
                    plan,
                    body: lowered_body,
                });
                Ok(())
            }
            Statement::Return { value, position } => {
                let value = match value {
                    Some(v) => Some(self.lower_expr(v, out, position)?),
                    None => None,
                };
                out.push(IrStmt::Return { value });
                Ok(())
            }
            Statement::Expr(expr) => {
                if let Some((program, pos)) = self.load_target(expr) {
                    self.require_user("load", &pos)?;
                    let handle = format!("prog{}", self.tmp);
                    self.tmp += 1;
                    self.handles.insert(handle.clone(), program.clone());
                    self.loads.push(program.clone());
                    out.push(IrStmt::Load { handle, program });
                    return Ok(());
                }
                if let Some(attach) = self.attach_stmt(expr, None, &expr.position, out)? {
                    out.push(attach);
                    return Ok(());
                }
                if let ExprKind::Call { callee, args } = &expr.kind {
                    if let ExprKind::Ident(name) = &callee.kind {
                        match name.as_str() {
                            "detach" => {
                                self.require_user("detach", &expr.position)?;
                                let (handle, program) =
                                    self.handle_of(&args[0], &expr.position)?;
                                self.attaches = true;
                                out.push(IrStmt::Detach { handle, program });
                                return Ok(());
                            }
                            "print" => {
                                let format = match &args[0].kind {
                                    ExprKind::Str(s) => s.clone(),
                                    _ => String::new(),
                                };
                                let mut lowered = Vec::new();
                                for arg in &args[1..] {
                                    lowered.push(self.lower_expr(arg, out, &expr.position)?);
                                }
                                out.push(IrStmt::Print {
                                    format,
                                    args: lowered,
                                });
                                return Ok(());
                            }
                            _ => {}
                        }
                    }
                }
                let lowered = self.lower_expr(expr, out, &expr.position)?;
                out.push(IrStmt::Expr(lowered));
                Ok(())
            }
        }
    }

    /// Rewrite an expression, hoisting nested map reads into lookups.
    fn lower_expr(
        &mut self,
        expr: &Expr,
        out: &mut Vec<IrStmt>,
        position: &Position,
    ) -> Result<Expr> {
        if let Some((map, key)) = self.map_index(expr) {
            let key = self.lower_expr(&key, out, position)?;
            let value_ty = self.map_value_ty(&map);
            let dst = format!("lookup{}", self.tmp);
            self.tmp += 1;
            self.note_map(&map);
            out.push(IrStmt::Lookup {
                dst: dst.clone(),
                map,
                key,
                value_ty: value_ty.clone(),
            });
            let mut replacement = Expr::new(ExprKind::Ident(dst), expr.position.clone());
            replacement.ty = Some(Type::Nullable(Box::new(value_ty)));
            return Ok(replacement);
        }
        if let ExprKind::Ident(name) = &expr.kind {
            return self.lower_ident(expr, name, position);
        }

        let mut lowered = expr.clone();
        match &mut lowered.kind {
            ExprKind::Call { callee, args } => {
                if let ExprKind::Ident(name) = &callee.kind {
                    if matches!(name.as_str(), "load" | "attach" | "detach" | "print") {
                        return Err(SemanticError::AttributeMisuse {
                            message: format!(
                                "{name}(...) must be a statement or a variable initializer"
                            ),
                            position: position.clone(),
                        });
                    }
                }
                for arg in args.iter_mut() {
                    *arg = self.lower_expr(arg, out, position)?;
                }
            }
            ExprKind::Field(base, _) => {
                if let ExprKind::Ident(base_name) = &base.kind {
                    if let Some(Symbol {
                        kind: SymbolKind::Config(_),
                        ..
                    }) = self.table.resolve(base_name)
                    {
                        self.configs_read.insert(base_name.clone());
                        self.configs_used.insert(base_name.clone());
                        return Ok(lowered);
                    }
                }
                let new_base = self.lower_expr(base, out, position)?;
                **base = new_base;
            }
            ExprKind::Arrow(base, _) => {
                let new_base = self.lower_expr(base, out, position)?;
                **base = new_base;
            }
            ExprKind::Index(base, key) => {
                let new_base = self.lower_expr(base, out, position)?;
                **base = new_base;
                let new_key = self.lower_expr(key, out, position)?;
                **key = new_key;
            }
            ExprKind::Unary { operand, .. } => {
                let new_operand = self.lower_expr(operand, out, position)?;
                **operand = new_operand;
            }
            ExprKind::Binary { left, right, .. } => {
                let new_left = self.lower_expr(left, out, position)?;
                **left = new_left;
                let new_right = self.lower_expr(right, out, position)?;
                **right = new_right;
            }
            _ => {}
        }
        Ok(lowered)
    }

    /// Identifiers referring to constants are inlined where the emitted C
    /// has no symbol for them; user-declared enum variants stay symbolic on
    /// both sides, builtin enum values only kernel-side (vmlinux.h has
    /// them), and plain constants always become literals.
    fn lower_ident(&self, expr: &Expr, name: &str, position: &Position) -> Result<Expr> {
        match self.table.resolve_root(name) {
            Some(Symbol {
                kind: SymbolKind::Const { ty, value },
                ..
            }) => {
                let symbolic = match ty {
                    Type::Named(enum_name) => {
                        self.enum_names.contains(enum_name) || self.side == Side::Kernel
                    }
                    _ => false,
                };
                if symbolic {
                    Ok(expr.clone())
                } else {
                    let mut literal =
                        Expr::new(ExprKind::Int(IntValue::I64(*value)), expr.position.clone());
                    literal.ty = expr.ty.clone().or_else(|| Some(ty.clone()));
                    Ok(literal)
                }
            }
            Some(Symbol {
                kind: SymbolKind::Var(_),
                ..
            }) if self.side == Side::User => Err(SemanticError::MapMisuse {
                message: format!(
                    "global `{name}` lives kernel-side; share it with user space through a map"
                ),
                position: position.clone(),
            }),
            _ => Ok(expr.clone()),
        }
    }

    /// `m[k]` where `m` names a map: the map name plus the key expression.
    fn map_index(&self, expr: &Expr) -> Option<(String, Expr)> {
        if let ExprKind::Index(base, key) = &expr.kind {
            if let ExprKind::Ident(name) = &base.kind {
                if let Some(Symbol {
                    kind: SymbolKind::Map(_),
                    ..
                }) = self.table.resolve_root(name)
                {
                    return Some((name.clone(), (**key).clone()));
                }
            }
        }
        None
    }

    fn map_value_ty(&self, map: &str) -> Type {
        match self.table.resolve_root(map) {
            Some(Symbol {
                kind: SymbolKind::Map(info),
                ..
            }) => info.value.clone(),
            _ => Type::U64,
        }
    }

    fn note_map(&mut self, map: &str) {
        if self.side == Side::User {
            self.maps_used.insert(map.to_string());
        }
    }

    /// `cfg.field` where `cfg` names a config block.
    fn config_field(&self, expr: &Expr) -> Option<(String, String, usize)> {
        if let ExprKind::Field(base, field) = &expr.kind {
            if let ExprKind::Ident(name) = &base.kind {
                if let Some(Symbol {
                    kind: SymbolKind::Config(fields),
                    ..
                }) = self.table.resolve_root(name)
                {
                    let slot = fields.iter().position(|(n, _)| n == field)?;
                    return Some((name.clone(), field.clone(), slot));
                }
            }
        }
        None
    }

    /// `load(f)`: the loaded program name.
    fn load_target(&self, expr: &Expr) -> Option<(String, Position)> {
        if let ExprKind::Call { callee, args } = &expr.kind {
            if let ExprKind::Ident(name) = &callee.kind {
                if name == "load" && args.len() == 1 {
                    if let ExprKind::Ident(program) = &args[0].kind {
                        return Some((program.clone(), expr.position.clone()));
                    }
                }
            }
        }
        None
    }

    /// `attach(handle, iface, flags)`, as a statement or initializer.
    fn attach_stmt(
        &mut self,
        expr: &Expr,
        result: Option<String>,
        position: &Position,
        out: &mut Vec<IrStmt>,
    ) -> Result<Option<IrStmt>> {
        let args = match &expr.kind {
            ExprKind::Call { callee, args } => match &callee.kind {
                ExprKind::Ident(name) if name == "attach" && args.len() == 3 => args,
                _ => return Ok(None),
            },
            _ => return Ok(None),
        };
        self.require_user("attach", position)?;
        let (handle, program) = self.handle_of(&args[0], position)?;
        let attribute = match self.table.resolve_root(&program) {
            Some(Symbol {
                kind: SymbolKind::Function(info),
                ..
            }) => info.attribute.clone().expect("load targets are attributed"),
            _ => Attribute::Xdp,
        };
        self.attaches = true;
        let iface = self.lower_expr(&args[1], out, position)?;
        let flags = self.lower_expr(&args[2], out, position)?;
        Ok(Some(IrStmt::Attach {
            handle,
            program,
            attribute,
            iface,
            flags,
            result,
        }))
    }

    fn handle_of(&self, expr: &Expr, position: &Position) -> Result<(String, String)> {
        if let ExprKind::Ident(name) = &expr.kind {
            if let Some(program) = self.handles.get(name) {
                return Ok((name.clone(), program.clone()));
            }
        }
        Err(SemanticError::AttributeMisuse {
            message: "program handles must come from load(...) in the same function".to_string(),
            position: position.clone(),
        })
    }

    fn require_user(&self, what: &str, position: &Position) -> Result<()> {
        if self.side == Side::Kernel {
            return Err(SemanticError::AttributeMisuse {
                message: format!("{what}(...) is only available in user-space code"),
                position: position.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parser::parse;
    use crate::sema::check;

    fn lower_src(src: &str) -> (KernelIr, UserIr) {
        let program = parse(src, "test.ks").expect("source should parse");
        let typed = check(program, "test.ks").expect("source should check");
        generate(&typed, "test", LoopLimits::default()).expect("source should lower")
    }

    const COUNTER: &str = r#"
        include "xdp.kh"

        pin var counters : hash<u32, u64>(1024)

        @xdp fn count(ctx: *xdp_md) -> xdp_action {
            var hits = counters[0]
            if hits == none {
                counters[0] = 1
            }
            return XDP_PASS
        }

        fn main() -> i32 {
            var prog = load(count)
            var rc = attach(prog, "eth0", 0)
            counters[0] = 0
            return rc
        }
    "#;

    #[test]
    fn test_partitions_are_disjoint() {
        let (kernel, user) = lower_src(COUNTER);
        assert_eq!(kernel.programs.len(), 1);
        assert_eq!(kernel.programs[0].name, "count");
        assert_eq!(kernel.programs[0].section.as_deref(), Some("xdp"));
        assert!(kernel.helpers.is_empty());
        assert_eq!(user.loads, vec!["count".to_string()]);
        assert!(user.uses_skeleton);
        assert_eq!(user.maps_used, vec!["counters".to_string()]);
        assert!(user.has_pinned);
    }

    #[test]
    fn test_var_lookup_keeps_name() {
        let (kernel, _) = lower_src(COUNTER);
        let body = &kernel.programs[0].body;
        assert!(matches!(
            &body[0],
            IrStmt::Lookup { dst, map, .. } if dst == "hits" && map == "counters"
        ));
    }

    #[test]
    fn test_loop_plans() {
        let (kernel, _) = lower_src(
            r#"
            include "xdp.kh"
            var sums : array<u32, u64>(16)

            @xdp fn scan(ctx: *xdp_md) -> xdp_action {
                for i in 0..3 {
                    sums[0] = 1
                }
                for j in 0..10 {
                    sums[1] = 2
                }
                for k in 0..1000 {
                    sums[2] = 3
                }
                return XDP_PASS
            }

            fn main() -> i32 {
                return 0
            }
            "#,
        );
        let body = &kernel.programs[0].body;
        let plans: Vec<&LoopPlan> = body
            .iter()
            .filter_map(|s| match s {
                IrStmt::Loop { plan, .. } => Some(plan),
                _ => None,
            })
            .collect();
        assert!(matches!(plans[0], LoopPlan::Unrolled { lo: 0, hi: 3 }));
        assert!(matches!(plans[1], LoopPlan::Simple { lo: 0, hi: 10 }));
        assert!(matches!(plans[2], LoopPlan::BpfLoopConst { count: 1000, .. }));
    }

    #[test]
    fn test_folded_bound_feeds_plan() {
        let (kernel, _) = lower_src(
            r#"
            include "xdp.kh"
            var sums : array<u32, u64>(16)

            @xdp fn scan(ctx: *xdp_md) -> xdp_action {
                var a = 2
                var b = a * 3
                for i in 0..b {
                    sums[0] = 1
                }
                return XDP_PASS
            }

            fn main() -> i32 {
                return 0
            }
            "#,
        );
        let body = &kernel.programs[0].body;
        let plan = body
            .iter()
            .find_map(|s| match s {
                IrStmt::Loop { plan, .. } => Some(plan),
                _ => None,
            })
            .expect("one loop");
        assert!(matches!(plan, LoopPlan::Simple { lo: 0, hi: 6 }));
    }

    #[test]
    fn test_nested_map_read_is_hoisted() {
        let (kernel, _) = lower_src(
            r#"
            include "xdp.kh"
            var counters : hash<u32, u64>(64)

            @xdp fn check(ctx: *xdp_md) -> xdp_action {
                if counters[5] == none {
                    return XDP_PASS
                }
                return XDP_DROP
            }

            fn main() -> i32 {
                return 0
            }
            "#,
        );
        let body = &kernel.programs[0].body;
        assert!(matches!(&body[0], IrStmt::Lookup { map, .. } if map == "counters"));
        assert!(matches!(&body[1], IrStmt::If { .. }));
    }

    #[test]
    fn test_config_write_slots() {
        let (_, user) = lower_src(
            r#"
            config rate_cfg {
                limit: u32,
                burst: u32,
            }

            fn main() -> i32 {
                rate_cfg.burst = 7
                return 0
            }
            "#,
        );
        assert!(matches!(
            &user.main_body[0],
            IrStmt::ConfigWrite { config, field, slot: 1, .. }
                if config == "rate_cfg" && field == "burst"
        ));
        assert_eq!(user.configs_used, vec!["rate_cfg".to_string()]);
    }

    #[test]
    fn test_kfunc_and_helper_partitions() {
        let (kernel, _) = lower_src(
            r#"
            @private fn scale(v: u64) -> u64 {
                return v * 2
            }
            @kfunc fn normalize(v: u64) -> u64 {
                return scale(v)
            }
            @helper fn double(v: u64) -> u64 {
                return v + v
            }
            fn main() -> i32 {
                return 0
            }
            "#,
        );
        assert_eq!(kernel.kfuncs.len(), 1);
        assert_eq!(kernel.helpers.len(), 2);
        assert!(kernel.programs.is_empty());
    }
}
