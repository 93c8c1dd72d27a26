//! BTF-map header emission.
//!
//! Everything both kernel programs and the skeleton need to agree on lands
//! in `<unit>.maps.h`: shared type definitions, the map sections in
//! BTF-map format, and the generated config structs with their single-slot
//! backing maps.

use std::fmt::Write;

use tracing::info;

use crate::ir::{IrMap, KernelIr};
use crate::script::ast::{MapKind, Type};

use super::{byte_size, TypeNames};

pub fn emit_maps_header(ir: &KernelIr) -> String {
    let names = TypeNames::from_kernel(ir);
    let mut out = String::new();
    let guard: String = ir
        .unit
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();

    let _ = writeln!(out, "/* Map and shared type definitions for {}. Generated; do not edit. */", ir.unit);
    let _ = writeln!(out, "#ifndef __{guard}_MAPS_H");
    let _ = writeln!(out, "#define __{guard}_MAPS_H");
    out.push('\n');

    for alias in &ir.aliases {
        let _ = writeln!(out, "typedef {};", names.c_decl(&alias.name, &alias.ty));
    }
    if !ir.aliases.is_empty() {
        out.push('\n');
    }

    for e in &ir.enums {
        let _ = writeln!(out, "enum {} {{", e.name);
        let mut next = 0i64;
        for variant in &e.variants {
            let value = variant.value.unwrap_or(next);
            next = value + 1;
            let _ = writeln!(out, "\t{} = {},", variant.name, value);
        }
        let _ = writeln!(out, "}};");
        out.push('\n');
    }

    for s in &ir.structs {
        let _ = writeln!(out, "struct {} {{", s.name);
        for field in &s.fields {
            let _ = writeln!(out, "\t{};", names.c_decl(&field.name, &field.ty));
        }
        let _ = writeln!(out, "}};");
        out.push('\n');
    }

    for config in &ir.configs {
        let _ = writeln!(out, "struct {}_config {{", config.name);
        for (field, ty) in &config.fields {
            let _ = writeln!(out, "\t{};", names.c_decl(field, ty));
        }
        let _ = writeln!(out, "}};");
        out.push('\n');
        let _ = writeln!(out, "struct {{");
        let _ = writeln!(out, "\t__uint(type, BPF_MAP_TYPE_ARRAY);");
        let _ = writeln!(out, "\t__uint(max_entries, 1);");
        let _ = writeln!(out, "\t__type(key, __u32);");
        let _ = writeln!(out, "\t__type(value, struct {}_config);", config.name);
        let _ = writeln!(out, "}} {}_config_map SEC(\".maps\");", config.name);
        out.push('\n');
    }

    for map in &ir.maps {
        out.push_str(&map_section(&names, map));
        out.push('\n');
    }

    let _ = writeln!(out, "#endif /* __{guard}_MAPS_H */");
    info!(
        "emitted maps header for `{}`: {} map(s), {} config block(s)",
        ir.unit,
        ir.maps.len(),
        ir.configs.len()
    );
    out
}

fn map_section(names: &TypeNames, map: &IrMap) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "struct {{");
    let _ = writeln!(out, "\t__uint(type, {});", map.kind.bpf_type());
    let _ = writeln!(out, "\t__uint(max_entries, {});", map.config.max_entries);

    // Ringbuf and perf event arrays carry no key/value types; explicit
    // key_size/value_size overrides win over inferred types.
    let keyed = !matches!(map.kind, MapKind::RingBuf | MapKind::PerfEventArray);
    if keyed {
        match map.config.key_size {
            Some(size) => {
                let _ = writeln!(out, "\t__uint(key_size, {size});");
            }
            None => {
                let _ = writeln!(out, "\t{};", type_line(names, "key", &map.key));
            }
        }
        match map.config.value_size {
            Some(size) => {
                let _ = writeln!(out, "\t__uint(value_size, {size});");
            }
            None => {
                let _ = writeln!(out, "\t{};", type_line(names, "value", &map.value));
            }
        }
    } else if matches!(map.kind, MapKind::PerfEventArray) {
        let _ = writeln!(out, "\t__uint(key_size, sizeof(__u32));");
        let _ = writeln!(out, "\t__uint(value_size, sizeof(__u32));");
    }

    if let Some(flags) = map.config.flags {
        let _ = writeln!(out, "\t__uint(map_flags, {flags});");
    }
    if map.pinned {
        let _ = writeln!(out, "\t__uint(pinning, LIBBPF_PIN_BY_NAME);");
    }
    let _ = writeln!(out, "}} {} SEC(\".maps\");", map.name);
    out
}

/// `__type` only takes spellable C types; strings and arrays fall back to
/// a byte-size declaration.
fn type_line(names: &TypeNames, slot: &str, ty: &Type) -> String {
    match ty {
        Type::Str(_) | Type::Array(..) => {
            let size = byte_size(ty).unwrap_or(8);
            format!("__uint({slot}_size, {size})")
        }
        other => format!("__type({slot}, {})", names.c_type(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ast::MapConfig;

    fn map(name: &str, kind: MapKind, pinned: bool) -> IrMap {
        IrMap {
            name: name.to_string(),
            kind,
            key: Type::U32,
            value: Type::U64,
            config: MapConfig {
                max_entries: 1024,
                ..Default::default()
            },
            pinned,
            slot: 0,
        }
    }

    fn empty_ir(maps: Vec<IrMap>) -> KernelIr {
        KernelIr {
            unit: "test".to_string(),
            maps,
            configs: Vec::new(),
            structs: Vec::new(),
            enums: Vec::new(),
            aliases: Vec::new(),
            globals: Vec::new(),
            programs: Vec::new(),
            kfuncs: Vec::new(),
            helpers: Vec::new(),
        }
    }

    #[test]
    fn test_hash_map_section() {
        let header = emit_maps_header(&empty_ir(vec![map("counters", MapKind::Hash, false)]));
        assert!(header.contains("__uint(type, BPF_MAP_TYPE_HASH);"));
        assert!(header.contains("__uint(max_entries, 1024);"));
        assert!(header.contains("__type(key, __u32);"));
        assert!(header.contains("__type(value, __u64);"));
        assert!(header.contains("} counters SEC(\".maps\");"));
        assert!(!header.contains("pinning"));
    }

    #[test]
    fn test_pinned_map_uses_pin_by_name() {
        let header = emit_maps_header(&empty_ir(vec![map("g", MapKind::Hash, true)]));
        assert!(header.contains("__uint(pinning, LIBBPF_PIN_BY_NAME);"));
    }

    #[test]
    fn test_ringbuf_has_no_key_type() {
        let header = emit_maps_header(&empty_ir(vec![map("events", MapKind::RingBuf, false)]));
        assert!(header.contains("BPF_MAP_TYPE_RINGBUF"));
        assert!(!header.contains("__type(key"));
    }

    #[test]
    fn test_header_guard_from_unit_name() {
        let header = emit_maps_header(&empty_ir(vec![]));
        assert!(header.starts_with("/*"));
        assert!(header.contains("#ifndef __TEST_MAPS_H"));
        assert!(header.contains("#endif /* __TEST_MAPS_H */"));
    }
}
