//! Include-header resolution.
//!
//! `include "x.kh"` is a pure function from the header name to a list of
//! synthetic declarations injected into the root scope before user code
//! resolves. The rest of the pipeline never learns where a type came from;
//! builtin declarations are only registered in the symbol table and are
//! never re-emitted into the generated C (the kernel side gets them from
//! vmlinux.h).

use tracing::warn;

use crate::script::ast::{
    Declaration, EnumDecl, EnumVariant, Expr, ExprKind, GlobalVarDecl, IntValue, Position,
    StructDecl, StructField, Type,
};

fn builtin_pos(header: &str) -> Position {
    Position::new(0, 0, header)
}

fn struct_decl(header: &str, name: &str, fields: &[(&str, Type)]) -> Declaration {
    Declaration::Struct(StructDecl {
        name: name.to_string(),
        fields: fields
            .iter()
            .map(|(fname, ty)| StructField {
                name: fname.to_string(),
                ty: ty.clone(),
            })
            .collect(),
        position: builtin_pos(header),
    })
}

fn enum_decl(header: &str, name: &str, variants: &[(&str, i64)]) -> Declaration {
    Declaration::Enum(EnumDecl {
        name: name.to_string(),
        variants: variants
            .iter()
            .map(|(vname, value)| EnumVariant {
                name: vname.to_string(),
                value: Some(*value),
            })
            .collect(),
        position: builtin_pos(header),
    })
}

fn const_decl(header: &str, name: &str, value: i64) -> Declaration {
    Declaration::GlobalVar(GlobalVarDecl {
        name: name.to_string(),
        ty: Some(Type::I32),
        init: Some(Expr::new(
            ExprKind::Int(IntValue::I32(value as i32)),
            builtin_pos(header),
        )),
        pinned: false,
        position: builtin_pos(header),
    })
}

/// Synthetic root-scope declarations provided by a `*.kh` header.
///
/// An unknown header resolves to the empty set; names it was expected to
/// provide then fail resolution at their use sites.
pub fn header_declarations(header: &str) -> Vec<Declaration> {
    match header {
        "xdp.kh" => vec![
            struct_decl(
                header,
                "xdp_md",
                &[
                    ("data", Type::U32),
                    ("data_end", Type::U32),
                    ("data_meta", Type::U32),
                    ("ingress_ifindex", Type::U32),
                    ("rx_queue_index", Type::U32),
                    ("egress_ifindex", Type::U32),
                ],
            ),
            enum_decl(
                header,
                "xdp_action",
                &[
                    ("XDP_ABORTED", 0),
                    ("XDP_DROP", 1),
                    ("XDP_PASS", 2),
                    ("XDP_TX", 3),
                    ("XDP_REDIRECT", 4),
                ],
            ),
        ],
        "tc.kh" => vec![
            struct_decl(
                header,
                "__sk_buff",
                &[
                    ("len", Type::U32),
                    ("pkt_type", Type::U32),
                    ("mark", Type::U32),
                    ("queue_mapping", Type::U32),
                    ("protocol", Type::U32),
                    ("ifindex", Type::U32),
                    ("priority", Type::U32),
                ],
            ),
            const_decl(header, "TC_ACT_UNSPEC", -1),
            const_decl(header, "TC_ACT_OK", 0),
            const_decl(header, "TC_ACT_RECLASSIFY", 1),
            const_decl(header, "TC_ACT_SHOT", 2),
            const_decl(header, "TC_ACT_PIPE", 3),
            const_decl(header, "TC_ACT_STOLEN", 4),
            const_decl(header, "TC_ACT_REDIRECT", 7),
        ],
        "kprobe.kh" => vec![struct_decl(
            header,
            "pt_regs",
            &[
                ("di", Type::U64),
                ("si", Type::U64),
                ("dx", Type::U64),
                ("cx", Type::U64),
                ("r8", Type::U64),
                ("r9", Type::U64),
                ("sp", Type::U64),
                ("ip", Type::U64),
                ("ax", Type::U64),
            ],
        )],
        other => {
            warn!("include \"{other}\" resolves to no builtin declarations");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xdp_header_provides_ctx_and_actions() {
        let decls = header_declarations("xdp.kh");
        assert!(decls.iter().any(
            |d| matches!(d, Declaration::Struct(s) if s.name == "xdp_md" && s.fields.len() == 6)
        ));
        assert!(decls.iter().any(|d| matches!(
            d,
            Declaration::Enum(e) if e.name == "xdp_action"
                && e.variants.iter().any(|v| v.name == "XDP_PASS" && v.value == Some(2))
        )));
    }

    #[test]
    fn test_tc_header_provides_action_constants() {
        let decls = header_declarations("tc.kh");
        assert!(decls.iter().any(|d| matches!(
            d,
            Declaration::GlobalVar(g) if g.name == "TC_ACT_OK"
        )));
        assert!(decls.iter().any(|d| matches!(
            d,
            Declaration::Struct(s) if s.name == "__sk_buff"
        )));
    }

    #[test]
    fn test_unknown_header_is_empty() {
        assert!(header_declarations("mystery.kh").is_empty());
    }
}
