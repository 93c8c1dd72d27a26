//! KernelScript AST.
//!
//! Every node is a closed sum and carries the source position it was parsed
//! from. The tree is produced untyped by the parser; the checker fills in
//! `Expr::ty` in place.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
    pub file: String,
}

impl Position {
    pub fn new(line: usize, column: usize, file: impl Into<String>) -> Self {
        Self {
            line,
            column,
            file: file.into(),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Width-tagged integer literal carrier.
///
/// Constant folding works over the canonical widened `i64`; `rewrap` narrows
/// a folded value back under the original tag and reports overflow as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
}

impl IntValue {
    pub fn widen(self) -> i64 {
        match self {
            IntValue::U8(v) => v as i64,
            IntValue::U16(v) => v as i64,
            IntValue::U32(v) => v as i64,
            IntValue::U64(v) => v as i64,
            IntValue::I8(v) => v as i64,
            IntValue::I16(v) => v as i64,
            IntValue::I32(v) => v as i64,
            IntValue::I64(v) => v,
        }
    }

    /// Re-narrow a widened value under this value's tag.
    pub fn rewrap(self, value: i64) -> Option<IntValue> {
        match self {
            IntValue::U8(_) => u8::try_from(value).ok().map(IntValue::U8),
            IntValue::U16(_) => u16::try_from(value).ok().map(IntValue::U16),
            IntValue::U32(_) => u32::try_from(value).ok().map(IntValue::U32),
            IntValue::U64(_) => u64::try_from(value).ok().map(IntValue::U64),
            IntValue::I8(_) => i8::try_from(value).ok().map(IntValue::I8),
            IntValue::I16(_) => i16::try_from(value).ok().map(IntValue::I16),
            IntValue::I32(_) => i32::try_from(value).ok().map(IntValue::I32),
            IntValue::I64(_) => Some(IntValue::I64(value)),
        }
    }

    pub fn ty(self) -> Type {
        match self {
            IntValue::U8(_) => Type::U8,
            IntValue::U16(_) => Type::U16,
            IntValue::U32(_) => Type::U32,
            IntValue::U64(_) => Type::U64,
            IntValue::I8(_) => Type::I8,
            IntValue::I16(_) => Type::I16,
            IntValue::I32(_) => Type::I32,
            IntValue::I64(_) => Type::I64,
        }
    }

    /// Retag the widened value to `ty`, if it fits.
    pub fn retag(self, ty: &Type) -> Option<IntValue> {
        let wide = self.widen();
        let template = match ty {
            Type::U8 => IntValue::U8(0),
            Type::U16 => IntValue::U16(0),
            Type::U32 => IntValue::U32(0),
            Type::U64 => IntValue::U64(0),
            Type::I8 => IntValue::I8(0),
            Type::I16 => IntValue::I16(0),
            Type::I32 => IntValue::I32(0),
            Type::I64 => IntValue::I64(0),
            _ => return None,
        };
        template.rewrap(wide)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapKind {
    Hash,
    LruHash,
    Array,
    PercpuHash,
    PercpuArray,
    RingBuf,
    PerfEventArray,
}

impl MapKind {
    pub fn from_keyword(kw: &str) -> Option<MapKind> {
        match kw {
            "hash" => Some(MapKind::Hash),
            "lru_hash" => Some(MapKind::LruHash),
            "array" => Some(MapKind::Array),
            "percpu_hash" => Some(MapKind::PercpuHash),
            "percpu_array" => Some(MapKind::PercpuArray),
            "ringbuf" => Some(MapKind::RingBuf),
            "perf_event_array" => Some(MapKind::PerfEventArray),
            _ => None,
        }
    }

    /// The BPF_MAP_TYPE_* constant this kind lowers to.
    pub fn bpf_type(self) -> &'static str {
        match self {
            MapKind::Hash => "BPF_MAP_TYPE_HASH",
            MapKind::LruHash => "BPF_MAP_TYPE_LRU_HASH",
            MapKind::Array => "BPF_MAP_TYPE_ARRAY",
            MapKind::PercpuHash => "BPF_MAP_TYPE_PERCPU_HASH",
            MapKind::PercpuArray => "BPF_MAP_TYPE_PERCPU_ARRAY",
            MapKind::RingBuf => "BPF_MAP_TYPE_RINGBUF",
            MapKind::PerfEventArray => "BPF_MAP_TYPE_PERF_EVENT_ARRAY",
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            MapKind::Hash => "hash",
            MapKind::LruHash => "lru_hash",
            MapKind::Array => "array",
            MapKind::PercpuHash => "percpu_hash",
            MapKind::PercpuArray => "percpu_array",
            MapKind::RingBuf => "ringbuf",
            MapKind::PerfEventArray => "perf_event_array",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MapConfig {
    pub max_entries: u64,
    pub key_size: Option<u64>,
    pub value_size: Option<u64>,
    pub flags: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    Bool,
    /// Fixed-capacity string: at most N characters plus the terminator.
    Str(usize),
    Array(Box<Type>, usize),
    Named(String),
    Pointer(Box<Type>),
    Map {
        key: Box<Type>,
        value: Box<Type>,
        kind: MapKind,
        config: MapConfig,
    },
    /// Result of a map read: the value type or the `none` sentinel.
    Nullable(Box<Type>),
    /// Opaque handle returned by `load(...)`, consumed by attach/detach.
    ProgramHandle,
    /// Statement-like expressions (`print`, `detach`) produce no value.
    Unit,
}

impl Type {
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Type::U8
                | Type::U16
                | Type::U32
                | Type::U64
                | Type::I8
                | Type::I16
                | Type::I32
                | Type::I64
        )
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, Type::I8 | Type::I16 | Type::I32 | Type::I64)
    }

    /// Strips the null sentinel off a map-read result.
    pub fn unwrap_nullable(&self) -> &Type {
        match self {
            Type::Nullable(inner) => inner,
            other => other,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::U8 => write!(f, "u8"),
            Type::U16 => write!(f, "u16"),
            Type::U32 => write!(f, "u32"),
            Type::U64 => write!(f, "u64"),
            Type::I8 => write!(f, "i8"),
            Type::I16 => write!(f, "i16"),
            Type::I32 => write!(f, "i32"),
            Type::I64 => write!(f, "i64"),
            Type::Bool => write!(f, "bool"),
            Type::Str(n) => write!(f, "str({n})"),
            Type::Array(elem, n) => write!(f, "{elem}[{n}]"),
            Type::Named(name) => write!(f, "{name}"),
            Type::Pointer(inner) => write!(f, "*{inner}"),
            Type::Map { key, value, kind, config } => {
                write!(f, "{}<{key}, {value}>({})", kind.keyword(), config.max_entries)
            }
            Type::Nullable(inner) => write!(f, "{inner} | none"),
            Type::ProgramHandle => write!(f, "program"),
            Type::Unit => write!(f, "()"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcDirection {
    Ingress,
    Egress,
}

impl TcDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            TcDirection::Ingress => "ingress",
            TcDirection::Egress => "egress",
        }
    }
}

/// Attribute exactly as written in the source. The parser performs no
/// semantic validation; the checker resolves this into an [`Attribute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrSpec {
    pub name: String,
    pub arg: Option<String>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    Xdp,
    Tc(TcDirection),
    Kprobe(String),
    Kfunc,
    Helper,
    Private,
}

impl Attribute {
    /// ELF section name for the attribute, per libbpf conventions.
    pub fn section(&self) -> Option<String> {
        match self {
            Attribute::Xdp => Some("xdp".to_string()),
            Attribute::Tc(dir) => Some(format!("tc/{}", dir.as_str())),
            Attribute::Kprobe(sym) => Some(format!("kprobe/{sym}")),
            _ => None,
        }
    }

    /// Attributes that compile to kernel entry points reachable only through
    /// load/attach from user space.
    pub fn is_entry(&self) -> bool {
        matches!(self, Attribute::Xdp | Attribute::Tc(_) | Attribute::Kprobe(_))
    }
}

#[derive(Debug, Clone)]
pub struct Program {
    pub declarations: Vec<Declaration>,
    pub includes: Vec<Include>,
}

#[derive(Debug, Clone)]
pub struct Include {
    pub header: String,
    pub position: Position,
}

#[derive(Debug, Clone)]
pub enum Declaration {
    Map(MapDecl),
    GlobalVar(GlobalVarDecl),
    Config(ConfigDecl),
    Struct(StructDecl),
    TypeAlias(TypeAlias),
    Enum(EnumDecl),
    Function(Function),
    Attributed(AttributedFunction),
}

#[derive(Debug, Clone)]
pub struct MapDecl {
    pub name: String,
    pub key: Type,
    pub value: Type,
    pub kind: MapKind,
    pub config: MapConfig,
    pub pinned: bool,
    pub position: Position,
}

#[derive(Debug, Clone)]
pub struct GlobalVarDecl {
    pub name: String,
    pub ty: Option<Type>,
    pub init: Option<Expr>,
    pub pinned: bool,
    pub position: Position,
}

#[derive(Debug, Clone)]
pub struct ConfigDecl {
    pub name: String,
    pub fields: Vec<ConfigField>,
    pub position: Position,
}

#[derive(Debug, Clone)]
pub struct ConfigField {
    pub name: String,
    pub ty: Type,
    pub default: Option<Expr>,
    pub position: Position,
}

#[derive(Debug, Clone)]
pub struct StructDecl {
    pub name: String,
    pub fields: Vec<StructField>,
    pub position: Position,
}

#[derive(Debug, Clone)]
pub struct StructField {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone)]
pub struct TypeAlias {
    pub name: String,
    pub ty: Type,
    pub position: Position,
}

#[derive(Debug, Clone)]
pub struct EnumDecl {
    pub name: String,
    pub variants: Vec<EnumVariant>,
    pub position: Position,
}

#[derive(Debug, Clone)]
pub struct EnumVariant {
    pub name: String,
    pub value: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct AttributedFunction {
    pub attr: AttrSpec,
    pub function: Function,
    pub position: Position,
    /// Filled in by the type checker once the attribute is validated.
    pub resolved: Option<Attribute>,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: Option<Type>,
    pub body: Block,
    pub position: Position,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    pub position: Position,
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone)]
pub enum Statement {
    VarDecl {
        name: String,
        ty: Option<Type>,
        init: Expr,
        position: Position,
    },
    Assign {
        target: Expr,
        value: Expr,
        position: Position,
    },
    Delete {
        target: Expr,
        position: Position,
    },
    If {
        cond: Expr,
        then_block: Block,
        else_block: Option<Block>,
        position: Position,
    },
    For {
        var: String,
        range: ForRange,
        body: Block,
        position: Position,
    },
    Return {
        value: Option<Expr>,
        position: Position,
    },
    Expr(Expr),
}

#[derive(Debug, Clone)]
pub enum ForRange {
    Range { start: Expr, end: Expr },
    Iter(Expr),
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub position: Position,
    /// Filled in by the type checker.
    pub ty: Option<Type>,
}

impl Expr {
    pub fn new(kind: ExprKind, position: Position) -> Self {
        Self {
            kind,
            position,
            ty: None,
        }
    }

    /// The checked type. Only valid after the type checker has run.
    pub fn checked_ty(&self) -> &Type {
        self.ty.as_ref().expect("expression was not type-checked")
    }

    pub fn is_literal(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Int(_) | ExprKind::Bool(_) | ExprKind::Str(_) | ExprKind::None
        )
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Int(IntValue),
    Bool(bool),
    Str(String),
    None,
    Ident(String),
    Field(Box<Expr>, String),
    Arrow(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    /// The C spelling of the operator; identical for both emitted sides.
    pub fn c_op(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

impl Program {
    /// Promote `Map(...)`-typed globals to map declarations.
    ///
    /// `var m : hash<u32, u64>(1024)` parses as a global variable whose type
    /// happens to be a map; after normalization every map in the tree is a
    /// `Declaration::Map` at root scope.
    pub fn normalize(&mut self) {
        for decl in &mut self.declarations {
            let promoted = match decl {
                Declaration::GlobalVar(gv) => match &gv.ty {
                    Some(Type::Map { key, value, kind, config }) => Some(MapDecl {
                        name: gv.name.clone(),
                        key: (**key).clone(),
                        value: (**value).clone(),
                        kind: *kind,
                        config: config.clone(),
                        pinned: gv.pinned,
                        position: gv.position.clone(),
                    }),
                    _ => None,
                },
                _ => None,
            };
            if let Some(map) = promoted {
                *decl = Declaration::Map(map);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_value_widen_rewrap() {
        let v = IntValue::U8(200);
        assert_eq!(v.widen(), 200);
        assert_eq!(v.rewrap(255), Some(IntValue::U8(255)));
        assert_eq!(v.rewrap(256), None);
        assert_eq!(v.rewrap(-1), None);

        let s = IntValue::I16(-5);
        assert_eq!(s.widen(), -5);
        assert_eq!(s.rewrap(-32768), Some(IntValue::I16(-32768)));
        assert_eq!(s.rewrap(40000), None);
    }

    #[test]
    fn test_int_value_retag() {
        let v = IntValue::U32(6);
        assert_eq!(v.retag(&Type::U8), Some(IntValue::U8(6)));
        assert_eq!(IntValue::U32(300).retag(&Type::U8), None);
        assert_eq!(IntValue::I32(-1).retag(&Type::U64), None);
    }

    #[test]
    fn test_map_promotion() {
        let pos = Position::new(1, 1, "test.ks");
        let mut program = Program {
            includes: vec![],
            declarations: vec![Declaration::GlobalVar(GlobalVarDecl {
                name: "counters".to_string(),
                ty: Some(Type::Map {
                    key: Box::new(Type::U32),
                    value: Box::new(Type::U64),
                    kind: MapKind::Hash,
                    config: MapConfig {
                        max_entries: 1024,
                        ..Default::default()
                    },
                }),
                init: None,
                pinned: true,
                position: pos,
            })],
        };
        program.normalize();
        match &program.declarations[0] {
            Declaration::Map(m) => {
                assert_eq!(m.name, "counters");
                assert!(m.pinned);
                assert_eq!(m.kind, MapKind::Hash);
                assert_eq!(m.config.max_entries, 1024);
            }
            other => panic!("expected map declaration, got {other:?}"),
        }
    }

    #[test]
    fn test_attribute_sections() {
        assert_eq!(Attribute::Xdp.section().as_deref(), Some("xdp"));
        assert_eq!(
            Attribute::Tc(TcDirection::Ingress).section().as_deref(),
            Some("tc/ingress")
        );
        assert_eq!(
            Attribute::Kprobe("sys_open".to_string()).section().as_deref(),
            Some("kprobe/sys_open")
        );
        assert_eq!(Attribute::Helper.section(), None);
    }
}
