//! Two-sided intermediate representation.
//!
//! The IR deliberately keeps two distinct records, one per emitted side,
//! rather than a single tagged node that is sometimes kernel and sometimes
//! user: the codegen paths never overlap. Expressions stay as typed AST
//! nodes; statements are lowered so that map traffic, config writes,
//! skeleton operations and loop strategies are explicit.

pub mod lower;

pub use lower::generate;

use crate::script::ast::{
    Attribute, EnumDecl, Expr, MapConfig, MapKind, Param, StructDecl, Type, TypeAlias,
};

/// One entry of the shared map catalog. The slot is the map's stable index
/// in declaration order; both sides address maps by name but the slot keeps
/// emission deterministic.
#[derive(Debug, Clone)]
pub struct IrMap {
    pub name: String,
    pub kind: MapKind,
    pub key: Type,
    pub value: Type,
    pub config: MapConfig,
    pub pinned: bool,
    pub slot: usize,
}

/// A config block lowered to its backing single-slot array map.
#[derive(Debug, Clone)]
pub struct IrConfig {
    pub name: String,
    pub fields: Vec<(String, Type)>,
}

/// Loop lowering plan, fixed by the bound analysis.
#[derive(Debug, Clone)]
pub enum LoopPlan {
    Unrolled { lo: i64, hi: i64 },
    Simple { lo: i64, hi: i64 },
    BpfLoopConst { lo: i64, count: i64 },
    BpfLoopDyn { start: Expr, end: Expr },
}

#[derive(Debug, Clone)]
pub enum IrStmt {
    /// A local variable. `nullable` locals carry a value/ok pair in C.
    Local {
        name: String,
        ty: Type,
        init: Option<Expr>,
        nullable: bool,
    },
    /// `dst = map[key]`, materialized as a guarded lookup.
    Lookup {
        dst: String,
        map: String,
        key: Expr,
        value_ty: Type,
    },
    /// `map[key] = value`.
    Update { map: String, key: Expr, value: Expr },
    /// `delete map[key]`.
    Delete { map: String, key: Expr },
    /// Assignment to a non-map lvalue.
    Assign { target: Expr, value: Expr },
    /// `cfg.field = value`; user side only. The slot is the field index.
    ConfigWrite {
        config: String,
        field: String,
        slot: usize,
        value: Expr,
    },
    If {
        cond: Expr,
        then_body: Vec<IrStmt>,
        else_body: Vec<IrStmt>,
    },
    Loop {
        var: String,
        plan: LoopPlan,
        body: Vec<IrStmt>,
    },
    Return { value: Option<Expr> },
    /// Expression evaluated for effect (a call, typically).
    Expr(Expr),
    /// `handle = load(program)`; user side only.
    Load { handle: String, program: String },
    /// `attach(handle, iface, flags)`; the program and its attribute were
    /// resolved through the handle at lowering time.
    Attach {
        handle: String,
        program: String,
        attribute: Attribute,
        iface: Expr,
        flags: Expr,
        result: Option<String>,
    },
    /// `detach(handle)`.
    Detach { handle: String, program: String },
    Print { format: String, args: Vec<Expr> },
}

/// A kernel-side function: an entry program, a kfunc, or an internal
/// helper emitted as a static function.
#[derive(Debug, Clone)]
pub struct KernelFunction {
    pub name: String,
    pub attribute: Option<Attribute>,
    pub section: Option<String>,
    pub params: Vec<Param>,
    pub return_type: Option<Type>,
    pub body: Vec<IrStmt>,
    /// Config blocks this function reads; each gets a lookup prologue.
    pub configs_read: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct UserFunction {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: Option<Type>,
    pub body: Vec<IrStmt>,
}

/// Everything the kernel-side emitter needs.
#[derive(Debug, Clone)]
pub struct KernelIr {
    pub unit: String,
    pub maps: Vec<IrMap>,
    pub configs: Vec<IrConfig>,
    pub structs: Vec<StructDecl>,
    pub enums: Vec<EnumDecl>,
    pub aliases: Vec<TypeAlias>,
    /// Non-constant scalar globals; kernel-side `.data`.
    pub globals: Vec<(String, Type, Option<Expr>)>,
    pub programs: Vec<KernelFunction>,
    pub kfuncs: Vec<KernelFunction>,
    pub helpers: Vec<KernelFunction>,
}

/// Everything the user-space emitter needs.
#[derive(Debug, Clone)]
pub struct UserIr {
    pub unit: String,
    /// The declared args struct when `main(args: S)`.
    pub args_struct: Option<StructDecl>,
    pub args_param: Option<String>,
    pub main_body: Vec<IrStmt>,
    pub functions: Vec<UserFunction>,
    pub structs: Vec<StructDecl>,
    pub enums: Vec<EnumDecl>,
    pub aliases: Vec<TypeAlias>,
    pub configs: Vec<IrConfig>,
    pub maps: Vec<IrMap>,
    /// Maps the user side actually touches; each gets an FD variable.
    pub maps_used: Vec<String>,
    /// Configs the user side reads or writes; each gets an FD and a shadow.
    pub configs_used: Vec<String>,
    pub loads: Vec<String>,
    pub uses_skeleton: bool,
    pub has_pinned: bool,
}

impl KernelIr {
    pub fn map(&self, name: &str) -> Option<&IrMap> {
        self.maps.iter().find(|m| m.name == name)
    }
}

impl UserIr {
    pub fn map(&self, name: &str) -> Option<&IrMap> {
        self.maps.iter().find(|m| m.name == name)
    }
}
