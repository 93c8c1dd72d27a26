//! Scoped symbol table.
//!
//! A stack of frames: the root frame holds every top-level declaration,
//! function frames hold parameters and locals, block frames nest inside.
//! Lookup walks inner to outer; inner names shadow outer ones.

use std::collections::HashMap;

use crate::script::ast::{Attribute, MapConfig, MapKind, Position, StructField, Type};

use super::SemanticError;

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub position: Position,
}

#[derive(Debug, Clone)]
pub struct MapInfo {
    pub key: Type,
    pub value: Type,
    pub kind: MapKind,
    pub config: MapConfig,
    pub pinned: bool,
}

#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub params: Vec<(String, Type)>,
    pub return_type: Option<Type>,
    /// `None` for plain functions (user-space side), `Some` for kernel-side
    /// attributed functions.
    pub attribute: Option<Attribute>,
}

#[derive(Debug, Clone)]
pub enum SymbolKind {
    Struct(Vec<StructField>),
    Enum(Vec<(String, i64)>),
    Alias(Type),
    Map(MapInfo),
    Config(Vec<(String, Type)>),
    Function(FunctionInfo),
    Const { ty: Type, value: i64 },
    Var(Type),
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    frames: Vec<HashMap<String, Symbol>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            frames: vec![HashMap::new()],
        }
    }

    /// Current nesting depth; the root frame is depth 1.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn enter_block(&mut self) {
        self.frames.push(HashMap::new());
    }

    pub fn exit_block(&mut self) {
        assert!(self.frames.len() > 1, "unbalanced scope exit");
        self.frames.pop();
    }

    /// Define a symbol in the innermost frame. Redefinition within the same
    /// frame is an error; shadowing an outer frame is not.
    pub fn define(&mut self, symbol: Symbol) -> super::Result<()> {
        let frame = self.frames.last_mut().expect("at least the root frame");
        if frame.contains_key(&symbol.name) {
            return Err(SemanticError::DuplicateSymbol {
                name: symbol.name,
                position: symbol.position,
            });
        }
        frame.insert(symbol.name.clone(), symbol);
        Ok(())
    }

    /// Resolve a name, walking inner frames before outer ones.
    pub fn resolve(&self, name: &str) -> Option<&Symbol> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    /// Resolve against the root frame only; used for map and function
    /// lookups that must not be satisfied by shadowing locals.
    pub fn resolve_root(&self, name: &str) -> Option<&Symbol> {
        self.frames.first().and_then(|frame| frame.get(name))
    }

    /// Resolve a named type through aliases down to its representation.
    pub fn resolve_type(&self, ty: &Type) -> Type {
        match ty {
            Type::Named(name) => match self.resolve(name) {
                Some(Symbol {
                    kind: SymbolKind::Alias(target),
                    ..
                }) => self.resolve_type(&target.clone()),
                _ => ty.clone(),
            },
            Type::Pointer(inner) => Type::Pointer(Box::new(self.resolve_type(inner))),
            Type::Nullable(inner) => Type::Nullable(Box::new(self.resolve_type(inner))),
            other => other.clone(),
        }
    }

    /// Field list of a struct type, if `ty` names one.
    pub fn struct_fields(&self, ty: &Type) -> Option<Vec<StructField>> {
        match self.resolve_type(ty) {
            Type::Named(name) => match self.resolve(&name) {
                Some(Symbol {
                    kind: SymbolKind::Struct(fields),
                    ..
                }) => Some(fields.clone()),
                _ => None,
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str, kind: SymbolKind) -> Symbol {
        Symbol {
            name: name.to_string(),
            kind,
            position: Position::new(1, 1, "test.ks"),
        }
    }

    #[test]
    fn test_duplicate_in_same_frame_fails() {
        let mut table = SymbolTable::new();
        table.define(sym("x", SymbolKind::Var(Type::U32))).unwrap();
        let err = table.define(sym("x", SymbolKind::Var(Type::U64))).unwrap_err();
        assert!(matches!(err, SemanticError::DuplicateSymbol { .. }));
    }

    #[test]
    fn test_shadowing_and_inner_to_outer_lookup() {
        let mut table = SymbolTable::new();
        table.define(sym("x", SymbolKind::Var(Type::U32))).unwrap();
        table.enter_block();
        table.define(sym("x", SymbolKind::Var(Type::Bool))).unwrap();
        match table.resolve("x") {
            Some(Symbol {
                kind: SymbolKind::Var(Type::Bool),
                ..
            }) => {}
            other => panic!("inner binding should win, got {other:?}"),
        }
        table.exit_block();
        match table.resolve("x") {
            Some(Symbol {
                kind: SymbolKind::Var(Type::U32),
                ..
            }) => {}
            other => panic!("outer binding should be restored, got {other:?}"),
        }
    }

    #[test]
    fn test_alias_resolution() {
        let mut table = SymbolTable::new();
        table
            .define(sym("ip_count", SymbolKind::Alias(Type::U64)))
            .unwrap();
        assert_eq!(
            table.resolve_type(&Type::Named("ip_count".to_string())),
            Type::U64
        );
    }

    #[test]
    #[should_panic(expected = "unbalanced scope exit")]
    fn test_unbalanced_exit_panics() {
        let mut table = SymbolTable::new();
        table.exit_block();
    }
}
