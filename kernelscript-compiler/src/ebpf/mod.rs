//! Kernel-side code generation: the eBPF C translation unit and its
//! companion BTF-map header.

pub mod codegen;
pub mod maps;

pub use codegen::emit_kernel;
pub use maps::emit_maps_header;

use std::collections::HashSet;

use crate::ir::KernelIr;
use crate::script::ast::Type;

/// Classifies named types so C references render with the right keyword.
pub(crate) struct TypeNames {
    enums: HashSet<String>,
    aliases: HashSet<String>,
}

impl TypeNames {
    pub(crate) fn from_kernel(ir: &KernelIr) -> Self {
        let mut enums: HashSet<String> = ir.enums.iter().map(|e| e.name.clone()).collect();
        // Builtin action enums come from vmlinux.h.
        enums.insert("xdp_action".to_string());
        Self {
            enums,
            aliases: ir.aliases.iter().map(|a| a.name.clone()).collect(),
        }
    }

    pub(crate) fn new(enums: HashSet<String>, aliases: HashSet<String>) -> Self {
        Self { enums, aliases }
    }

    /// The C spelling of a type in value position. Strings and arrays only
    /// make sense through [`c_decl`](Self::c_decl).
    pub(crate) fn c_type(&self, ty: &Type) -> String {
        match ty {
            Type::U8 => "__u8".to_string(),
            Type::U16 => "__u16".to_string(),
            Type::U32 => "__u32".to_string(),
            Type::U64 => "__u64".to_string(),
            Type::I8 => "__s8".to_string(),
            Type::I16 => "__s16".to_string(),
            Type::I32 => "__s32".to_string(),
            Type::I64 => "__s64".to_string(),
            Type::Bool => "bool".to_string(),
            Type::Str(_) => "char".to_string(),
            Type::Array(elem, _) => self.c_type(elem),
            Type::Named(name) => {
                if self.aliases.contains(name) {
                    name.clone()
                } else if self.enums.contains(name) {
                    format!("enum {name}")
                } else {
                    format!("struct {name}")
                }
            }
            Type::Pointer(inner) => format!("{} *", self.c_type(inner)),
            Type::Nullable(inner) => self.c_type(inner),
            Type::Map { .. } | Type::ProgramHandle | Type::Unit => "int".to_string(),
        }
    }

    /// A declarator for `name` of type `ty`, handling array suffixes.
    pub(crate) fn c_decl(&self, name: &str, ty: &Type) -> String {
        match ty {
            Type::Str(n) => format!("char {name}[{}]", n + 1),
            Type::Array(elem, n) => format!("{} {name}[{n}]", self.c_type(elem)),
            Type::Pointer(inner) => format!("{} *{name}", self.c_type(inner)),
            other => format!("{} {name}", self.c_type(other)),
        }
    }

    /// A zero initializer matching `ty`.
    pub(crate) fn zero_value(&self, ty: &Type) -> &'static str {
        match ty {
            Type::Bool => "false",
            Type::Str(_) | Type::Array(..) => "{0}",
            Type::Named(name) if !self.aliases.contains(name) && !self.enums.contains(name) => {
                "{0}"
            }
            _ => "0",
        }
    }

    pub(crate) fn is_aggregate(&self, ty: &Type) -> bool {
        matches!(self.zero_value(ty), "{0}")
    }
}

/// Byte size of flat types, for `__uint(key_size, ...)` fallbacks when a
/// map key or value has no `__type`-able C spelling.
pub(crate) fn byte_size(ty: &Type) -> Option<u64> {
    match ty {
        Type::U8 | Type::I8 | Type::Bool => Some(1),
        Type::U16 | Type::I16 => Some(2),
        Type::U32 | Type::I32 => Some(4),
        Type::U64 | Type::I64 => Some(8),
        Type::Str(n) => Some(*n as u64 + 1),
        Type::Array(elem, n) => byte_size(elem).map(|s| s * *n as u64),
        _ => None,
    }
}
