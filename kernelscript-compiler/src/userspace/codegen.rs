//! User-space C emission.
//!
//! Prints the orchestrator program: CLI parsing into the declared args
//! struct, the libbpf skeleton lifecycle, map FDs (one per touched map,
//! one shared FD for the pinned globals), config-map writes through a
//! local shadow struct, and the map operations themselves. Nothing
//! implicit is added: no signal handlers, no teardown beyond what the
//! source `main` spells out.

use std::collections::HashSet;
use std::fmt::Write;

use tracing::info;

use crate::ebpf::codegen::{escape_c, printf_conv, render_int};
use crate::ebpf::TypeNames;
use crate::ir::{IrStmt, LoopPlan, UserFunction, UserIr};
use crate::script::ast::{Attribute, BinaryOp, Expr, ExprKind, Type, UnaryOp};

pub fn emit_user(ir: &UserIr, pin_root: &str) -> String {
    let mut emitter = UserEmitter::new(ir, pin_root);
    emitter.emit()
}

struct UserEmitter<'a> {
    ir: &'a UserIr,
    pin_root: String,
    names: TypeNames,
    configs: HashSet<String>,
    out: String,
    // Per-function state.
    tmp: usize,
    locals: Vec<(String, Type, bool)>,
    skeleton_loaded: bool,
}

impl<'a> UserEmitter<'a> {
    fn new(ir: &'a UserIr, pin_root: &str) -> Self {
        Self {
            ir,
            pin_root: pin_root.to_string(),
            names: TypeNames::new(
                ir.enums.iter().map(|e| e.name.clone()).collect(),
                ir.aliases.iter().map(|a| a.name.clone()).collect(),
            ),
            configs: ir.configs.iter().map(|c| c.name.clone()).collect(),
            out: String::new(),
            tmp: 0,
            locals: Vec::new(),
            skeleton_loaded: false,
        }
    }

    fn emit(&mut self) -> String {
        self.emit_prelude();
        self.emit_types();
        self.emit_state();

        let functions = self.ir.functions.clone();
        for f in &functions {
            self.emit_plain_function(f);
        }
        self.emit_main();

        info!(
            "emitted user-space C for `{}`: {} map fd(s), skeleton={}",
            self.ir.unit,
            self.ir.maps_used.len(),
            self.ir.uses_skeleton
        );
        std::mem::take(&mut self.out)
    }

    fn emit_prelude(&mut self) {
        let _ = writeln!(
            self.out,
            "/* User-space orchestrator for {}. Generated; do not edit. */",
            self.ir.unit
        );
        self.out.push_str("#include <stdio.h>\n");
        self.out.push_str("#include <stdlib.h>\n");
        self.out.push_str("#include <string.h>\n");
        self.out.push_str("#include <stdbool.h>\n");
        self.out.push_str("#include <errno.h>\n");
        if self.ir.args_struct.is_some() {
            self.out.push_str("#include <getopt.h>\n");
        }
        if self.has_attach() {
            self.out.push_str("#include <net/if.h>\n");
        }
        self.out.push_str("#include <bpf/libbpf.h>\n");
        self.out.push_str("#include <bpf/bpf.h>\n");
        if self.ir.uses_skeleton {
            let _ = writeln!(self.out, "#include \"{}.skel.h\"", self.ir.unit);
        }
        self.out.push('\n');
    }

    fn has_attach(&self) -> bool {
        fn walk(stmts: &[IrStmt]) -> bool {
            stmts.iter().any(|s| match s {
                IrStmt::Attach { .. } => true,
                IrStmt::If {
                    then_body,
                    else_body,
                    ..
                } => walk(then_body) || walk(else_body),
                IrStmt::Loop { body, .. } => walk(body),
                _ => false,
            })
        }
        walk(&self.ir.main_body) || self.ir.functions.iter().any(|f| walk(&f.body))
    }

    fn emit_types(&mut self) {
        for alias in &self.ir.aliases {
            let _ = writeln!(self.out, "typedef {};", self.names.c_decl(&alias.name, &alias.ty));
        }
        for e in &self.ir.enums {
            let _ = writeln!(self.out, "enum {} {{", e.name);
            let mut next = 0i64;
            for variant in &e.variants {
                let value = variant.value.unwrap_or(next);
                next = value + 1;
                let _ = writeln!(self.out, "\t{} = {},", variant.name, value);
            }
            let _ = writeln!(self.out, "}};");
        }
        for s in &self.ir.structs {
            let _ = writeln!(self.out, "struct {} {{", s.name);
            for field in &s.fields {
                let _ = writeln!(self.out, "\t{};", self.names.c_decl(&field.name, &field.ty));
            }
            let _ = writeln!(self.out, "}};");
        }
        for config in &self.ir.configs {
            let _ = writeln!(self.out, "struct {}_config {{", config.name);
            for (field, ty) in &config.fields {
                let _ = writeln!(self.out, "\t{};", self.names.c_decl(field, ty));
            }
            let _ = writeln!(self.out, "}};");
        }
        if !self.ir.aliases.is_empty()
            || !self.ir.enums.is_empty()
            || !self.ir.structs.is_empty()
            || !self.ir.configs.is_empty()
        {
            self.out.push('\n');
        }
    }

    fn emit_state(&mut self) {
        if self.ir.uses_skeleton {
            let _ = writeln!(self.out, "static struct {}_ebpf *skel;", self.ir.unit);
        }
        for map in &self.ir.maps_used {
            let pinned = self.ir.map(map).map(|m| m.pinned).unwrap_or(false);
            if !pinned {
                let _ = writeln!(self.out, "int {map}_fd = -1;");
            }
        }
        if self.uses_pinned_fd() {
            self.out.push_str("int pinned_globals_map_fd = -1;\n");
        }
        for config in &self.ir.configs_used {
            let _ = writeln!(self.out, "int {config}_config_map_fd = -1;");
            let _ = writeln!(self.out, "static struct {config}_config {config}_shadow;");
        }
        self.out.push('\n');
    }

    fn uses_pinned_fd(&self) -> bool {
        self.ir
            .maps_used
            .iter()
            .any(|m| self.ir.map(m).map(|m| m.pinned).unwrap_or(false))
    }

    fn pinned_path(&self) -> Option<String> {
        self.ir
            .maps
            .iter()
            .find(|m| m.pinned)
            .map(|m| format!("{}/{}", self.pin_root, m.name))
    }

    fn emit_plain_function(&mut self, f: &UserFunction) {
        self.tmp = 0;
        self.locals = f
            .params
            .iter()
            .map(|p| (p.name.clone(), p.ty.clone(), false))
            .collect();
        let ret = match &f.return_type {
            Some(ty) => self.names.c_type(ty),
            None => "void".to_string(),
        };
        let params = if f.params.is_empty() {
            "void".to_string()
        } else {
            f.params
                .iter()
                .map(|p| self.names.c_decl(&p.name, &p.ty))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let _ = writeln!(self.out, "static {ret} {}({params})", f.name);
        self.out.push_str("{\n");
        let mut body = String::new();
        self.emit_stmts(&f.body, 1, &mut body);
        self.out.push_str(&body);
        self.out.push_str("}\n\n");
    }

    fn emit_main(&mut self) {
        self.tmp = 0;
        self.locals = Vec::new();
        self.skeleton_loaded = false;

        let args_struct = self.ir.args_struct.clone();
        let args_param = self.ir.args_param.clone();
        match (&args_struct, &args_param) {
            (Some(args), Some(param)) => {
                self.emit_long_options(args);
                self.out.push_str("int main(int argc, char **argv)\n{\n");
                let _ = writeln!(self.out, "\tstruct {} {param} = {{0}};", args.name);
                self.emit_arg_parsing(args, param);
                self.locals
                    .push((param.clone(), Type::Named(args.name.clone()), false));
            }
            _ => {
                self.out.push_str("int main(void)\n{\n");
            }
        }

        // Without a skeleton load in the source, a pinned map is reached
        // through its bpffs path alone.
        if self.uses_pinned_fd() && self.ir.loads.is_empty() {
            self.emit_pinned_open("\t");
        }

        let mut body = String::new();
        let main_body = self.ir.main_body.clone();
        self.emit_stmts(&main_body, 1, &mut body);
        self.out.push_str(&body);
        if !matches!(self.ir.main_body.last(), Some(IrStmt::Return { .. })) {
            self.out.push_str("\treturn 0;\n");
        }
        self.out.push_str("}\n");
    }

    fn emit_long_options(&mut self, args: &crate::script::ast::StructDecl) {
        self.out
            .push_str("static const struct option long_opts[] = {\n");
        for (i, field) in args.fields.iter().enumerate() {
            let _ = writeln!(
                self.out,
                "\t{{ \"{}\", required_argument, NULL, {} }},",
                field.name,
                i + 1
            );
        }
        self.out.push_str("\t{ NULL, 0, NULL, 0 },\n};\n\n");
    }

    fn emit_arg_parsing(&mut self, args: &crate::script::ast::StructDecl, param: &str) {
        self.out.push_str("\tint opt;\n");
        self.out.push_str(
            "\twhile ((opt = getopt_long(argc, argv, \"\", long_opts, NULL)) != -1) {\n",
        );
        self.out.push_str("\t\tswitch (opt) {\n");
        for (i, field) in args.fields.iter().enumerate() {
            let _ = writeln!(self.out, "\t\tcase {}:", i + 1);
            match &field.ty {
                Type::Str(n) => {
                    // Over-length arguments are rejected, not truncated.
                    let _ = writeln!(self.out, "\t\t\tif (strlen(optarg) > {n}) {{");
                    let _ = writeln!(
                        self.out,
                        "\t\t\t\tfprintf(stderr, \"--{}: argument longer than {n} characters\\n\");",
                        field.name
                    );
                    self.out.push_str("\t\t\t\treturn 1;\n");
                    self.out.push_str("\t\t\t}\n");
                    let _ = writeln!(self.out, "\t\t\tstrcpy({param}.{}, optarg);", field.name);
                }
                Type::Bool => {
                    let _ = writeln!(
                        self.out,
                        "\t\t\t{param}.{} = strtol(optarg, NULL, 0) != 0;",
                        field.name
                    );
                }
                Type::U64 => {
                    let _ = writeln!(
                        self.out,
                        "\t\t\t{param}.{} = strtoull(optarg, NULL, 0);",
                        field.name
                    );
                }
                Type::I64 => {
                    let _ = writeln!(
                        self.out,
                        "\t\t\t{param}.{} = strtoll(optarg, NULL, 0);",
                        field.name
                    );
                }
                ty if ty.is_signed() => {
                    let _ = writeln!(
                        self.out,
                        "\t\t\t{param}.{} = ({})strtol(optarg, NULL, 0);",
                        field.name,
                        self.names.c_type(ty)
                    );
                }
                ty => {
                    let _ = writeln!(
                        self.out,
                        "\t\t\t{param}.{} = ({})strtoul(optarg, NULL, 0);",
                        field.name,
                        self.names.c_type(ty)
                    );
                }
            }
            self.out.push_str("\t\t\tbreak;\n");
        }
        self.out.push_str("\t\tdefault:\n");
        let usage: Vec<String> = args
            .fields
            .iter()
            .map(|f| format!("[--{} <{}>]", f.name, f.ty))
            .collect();
        let _ = writeln!(
            self.out,
            "\t\t\tfprintf(stderr, \"usage: %s {}\\n\", argv[0]);",
            escape_c(&usage.join(" "))
        );
        self.out.push_str("\t\t\treturn 1;\n");
        self.out.push_str("\t\t}\n");
        self.out.push_str("\t}\n\n");
    }

    fn emit_pinned_open(&mut self, ind: &str) {
        let path = match self.pinned_path() {
            Some(path) => path,
            None => return,
        };
        let _ = writeln!(
            self.out,
            "{ind}pinned_globals_map_fd = bpf_obj_get(\"{path}\");"
        );
        let _ = writeln!(self.out, "{ind}if (pinned_globals_map_fd < 0) {{");
        let _ = writeln!(
            self.out,
            "{ind}\tfprintf(stderr, \"failed to open pinned map at {path}: %s\\n\", strerror(errno));"
        );
        let _ = writeln!(self.out, "{ind}\treturn 1;");
        let _ = writeln!(self.out, "{ind}}}");
    }

    fn fd_expr(&self, map: &str) -> String {
        let pinned = self.ir.map(map).map(|m| m.pinned).unwrap_or(false);
        if pinned {
            "pinned_globals_map_fd".to_string()
        } else {
            format!("{map}_fd")
        }
    }

    fn emit_stmts(&mut self, stmts: &[IrStmt], depth: usize, out: &mut String) {
        let scope_mark = self.locals.len();
        for stmt in stmts {
            self.emit_stmt(stmt, depth, out);
        }
        self.locals.truncate(scope_mark);
    }

    fn emit_stmt(&mut self, stmt: &IrStmt, depth: usize, out: &mut String) {
        let ind = "\t".repeat(depth);
        match stmt {
            IrStmt::Local {
                name,
                ty,
                init,
                nullable,
            } => {
                if *nullable {
                    let (val, ok) = match init.as_ref().map(|e| &e.kind) {
                        Some(ExprKind::Ident(src)) => {
                            (format!("{src}_val"), format!("{src}_ok"))
                        }
                        _ => ("0".to_string(), "false".to_string()),
                    };
                    let _ = writeln!(
                        out,
                        "{ind}{} = {val};",
                        self.names.c_decl(&format!("{name}_val"), ty)
                    );
                    let _ = writeln!(out, "{ind}bool {name}_ok = {ok};");
                    self.locals.push((name.clone(), ty.clone(), true));
                    return;
                }
                match init {
                    Some(expr) => {
                        let rendered = self.render_expr(expr);
                        let _ = writeln!(out, "{ind}{} = {rendered};", self.names.c_decl(name, ty));
                    }
                    None => {
                        let _ = writeln!(
                            out,
                            "{ind}{} = {};",
                            self.names.c_decl(name, ty),
                            self.names.zero_value(ty)
                        );
                    }
                }
                self.locals.push((name.clone(), ty.clone(), false));
            }
            IrStmt::Lookup {
                dst,
                map,
                key,
                value_ty,
            } => {
                let key_ty = self.map_key_ty(map);
                let key_ref = self.addr_of(key, &key_ty, "k", &ind, out);
                let _ = writeln!(
                    out,
                    "{ind}{} = {};",
                    self.names.c_decl(&format!("{dst}_val"), value_ty),
                    self.names.zero_value(value_ty)
                );
                let _ = writeln!(out, "{ind}bool {dst}_ok = false;");
                let _ = writeln!(
                    out,
                    "{ind}if (bpf_map_lookup_elem({}, {key_ref}, &{dst}_val) == 0) {{",
                    self.fd_expr(map)
                );
                let _ = writeln!(out, "{ind}\t{dst}_ok = true;");
                let _ = writeln!(out, "{ind}}}");
                self.locals.push((dst.clone(), value_ty.clone(), true));
            }
            IrStmt::Update { map, key, value } => {
                let key_ty = self.map_key_ty(map);
                let value_ty = self.map_value_ty(map);
                let key_ref = self.addr_of(key, &key_ty, "k", &ind, out);
                let value_ref = self.addr_of(value, &value_ty, "v", &ind, out);
                let _ = writeln!(
                    out,
                    "{ind}bpf_map_update_elem({}, {key_ref}, {value_ref}, 0);",
                    self.fd_expr(map)
                );
            }
            IrStmt::Delete { map, key } => {
                let key_ty = self.map_key_ty(map);
                let key_ref = self.addr_of(key, &key_ty, "k", &ind, out);
                let _ = writeln!(
                    out,
                    "{ind}bpf_map_delete_elem({}, {key_ref});",
                    self.fd_expr(map)
                );
            }
            IrStmt::Assign { target, value } => {
                if let Some(Type::Str(n)) = &target.ty {
                    let t = self.render_expr(target);
                    let v = self.render_expr(value);
                    let _ = writeln!(out, "{ind}strncpy({t}, {v}, {n});");
                    let _ = writeln!(out, "{ind}{t}[{n}] = '\\0';");
                    return;
                }
                let t = self.render_expr(target);
                let v = self.render_expr(value);
                let _ = writeln!(out, "{ind}{t} = {v};");
            }
            IrStmt::ConfigWrite {
                config,
                field,
                slot: _,
                value,
            } => {
                let field_ty = self
                    .ir
                    .configs
                    .iter()
                    .find(|c| &c.name == config)
                    .and_then(|c| c.fields.iter().find(|(n, _)| n == field))
                    .map(|(_, t)| t.clone())
                    .unwrap_or(Type::U64);
                let v = self.render_expr(value);
                if let Type::Str(n) = field_ty {
                    let _ = writeln!(out, "{ind}strncpy({config}_shadow.{field}, {v}, {n});");
                    let _ = writeln!(out, "{ind}{config}_shadow.{field}[{n}] = '\\0';");
                } else {
                    let _ = writeln!(out, "{ind}{config}_shadow.{field} = {v};");
                }
                let tmp = format!("k_tmp{}", self.tmp);
                self.tmp += 1;
                let _ = writeln!(out, "{ind}__u32 {tmp} = 0;");
                let _ = writeln!(
                    out,
                    "{ind}bpf_map_update_elem({config}_config_map_fd, &{tmp}, &{config}_shadow, 0);"
                );
            }
            IrStmt::If {
                cond,
                then_body,
                else_body,
            } => {
                let c = self.render_expr(cond);
                let _ = writeln!(out, "{ind}if ({c}) {{");
                self.emit_stmts(then_body, depth + 1, out);
                if else_body.is_empty() {
                    let _ = writeln!(out, "{ind}}}");
                } else {
                    let _ = writeln!(out, "{ind}}} else {{");
                    self.emit_stmts(else_body, depth + 1, out);
                    let _ = writeln!(out, "{ind}}}");
                }
            }
            IrStmt::Loop { var, plan, body } => {
                // The verifier constraints behind the strategy split do not
                // apply in user space; every plan is a plain loop here.
                let (start, end) = match plan {
                    LoopPlan::Unrolled { lo, hi } | LoopPlan::Simple { lo, hi } => {
                        (lo.to_string(), hi.to_string())
                    }
                    LoopPlan::BpfLoopConst { lo, count } => {
                        (lo.to_string(), (lo + count).to_string())
                    }
                    LoopPlan::BpfLoopDyn { start, end } => {
                        (self.render_expr(start), self.render_expr(end))
                    }
                };
                let _ = writeln!(
                    out,
                    "{ind}for (__u64 {var} = {start}; {var} < {end}; {var}++) {{"
                );
                let scope_mark = self.locals.len();
                self.locals.push((var.clone(), Type::U64, false));
                self.emit_stmts(body, depth + 1, out);
                self.locals.truncate(scope_mark);
                let _ = writeln!(out, "{ind}}}");
            }
            IrStmt::Return { value } => match value {
                Some(value) => {
                    let v = self.render_expr(value);
                    let _ = writeln!(out, "{ind}return {v};");
                }
                None => {
                    let _ = writeln!(out, "{ind}return;");
                }
            },
            IrStmt::Expr(expr) => {
                let rendered = self.render_expr(expr);
                let _ = writeln!(out, "{ind}{rendered};");
            }
            IrStmt::Print { format, args } => {
                let (fmt, rendered) = self.printf_format(format, args);
                if rendered.is_empty() {
                    let _ = writeln!(out, "{ind}printf(\"{fmt}\");");
                } else {
                    let _ = writeln!(out, "{ind}printf(\"{fmt}\", {});", rendered.join(", "));
                }
            }
            IrStmt::Load { handle, program } => {
                let _ = writeln!(out, "{ind}struct bpf_program *{handle} = NULL;");
                let _ = writeln!(out, "{ind}struct bpf_link *{handle}_link = NULL;");
                let _ = writeln!(out, "{ind}int {handle}_ifindex = 0;");
                if !self.skeleton_loaded {
                    self.skeleton_loaded = true;
                    let _ = writeln!(
                        out,
                        "{ind}skel = {}_ebpf__open_and_load();",
                        self.ir.unit
                    );
                    let _ = writeln!(out, "{ind}if (!skel) {{");
                    let _ = writeln!(
                        out,
                        "{ind}\tfprintf(stderr, \"failed to open and load BPF skeleton\\n\");"
                    );
                    let _ = writeln!(out, "{ind}\treturn 1;");
                    let _ = writeln!(out, "{ind}}}");
                    for map in &self.ir.maps_used {
                        let pinned = self.ir.map(map).map(|m| m.pinned).unwrap_or(false);
                        if !pinned {
                            let _ = writeln!(
                                out,
                                "{ind}{map}_fd = bpf_map__fd(skel->maps.{map});"
                            );
                        }
                    }
                    for config in &self.ir.configs_used {
                        let _ = writeln!(
                            out,
                            "{ind}{config}_config_map_fd = bpf_map__fd(skel->maps.{config}_config_map);"
                        );
                    }
                    if self.uses_pinned_fd() {
                        if let Some(path) = self.pinned_path() {
                            let _ = writeln!(
                                out,
                                "{ind}pinned_globals_map_fd = bpf_obj_get(\"{path}\");"
                            );
                        }
                    }
                }
                let _ = writeln!(out, "{ind}{handle} = skel->progs.{program};");
            }
            IrStmt::Attach {
                handle,
                program: _,
                attribute,
                iface,
                flags,
                result,
            } => {
                let iface_rendered = self.render_expr(iface);
                let flags_rendered = self.render_expr(flags);
                match attribute {
                    Attribute::Xdp => {
                        let _ = writeln!(
                            out,
                            "{ind}{handle}_ifindex = if_nametoindex({iface_rendered});"
                        );
                        let call = format!(
                            "bpf_xdp_attach({handle}_ifindex, bpf_program__fd({handle}), {flags_rendered}, NULL)"
                        );
                        match result {
                            Some(name) => {
                                let _ = writeln!(out, "{ind}int {name} = {call};");
                                self.locals.push((name.clone(), Type::I32, false));
                            }
                            None => {
                                let _ = writeln!(out, "{ind}{call};");
                            }
                        }
                    }
                    Attribute::Tc(_) => {
                        let _ = writeln!(
                            out,
                            "{ind}{handle}_link = bpf_program__attach_tcx({handle}, if_nametoindex({iface_rendered}), NULL);"
                        );
                        if let Some(name) = result {
                            let _ = writeln!(
                                out,
                                "{ind}int {name} = {handle}_link ? 0 : -errno;"
                            );
                            self.locals.push((name.clone(), Type::I32, false));
                        }
                    }
                    _ => {
                        let _ = writeln!(
                            out,
                            "{ind}{handle}_link = bpf_program__attach({handle});"
                        );
                        if let Some(name) = result {
                            let _ = writeln!(
                                out,
                                "{ind}int {name} = {handle}_link ? 0 : -errno;"
                            );
                            self.locals.push((name.clone(), Type::I32, false));
                        }
                    }
                }
            }
            IrStmt::Detach {
                handle,
                program: _,
            } => {
                let _ = writeln!(out, "{ind}if ({handle}_link) {{");
                let _ = writeln!(out, "{ind}\tbpf_link__destroy({handle}_link);");
                let _ = writeln!(out, "{ind}\t{handle}_link = NULL;");
                let _ = writeln!(out, "{ind}}} else if ({handle}_ifindex) {{");
                let _ = writeln!(
                    out,
                    "{ind}\tbpf_xdp_detach({handle}_ifindex, 0, NULL);"
                );
                let _ = writeln!(out, "{ind}}}");
            }
        }
    }

    /// A pointer argument for the libbpf map calls. Identifiers pass their
    /// own address; literals and compound expressions go through uniquely
    /// named temporaries, never `&(literal)`.
    fn addr_of(
        &mut self,
        expr: &Expr,
        ty: &Type,
        prefix: &str,
        ind: &str,
        out: &mut String,
    ) -> String {
        if let ExprKind::Ident(name) = &expr.kind {
            if let Some((_, _, nullable)) = self.local(name) {
                return if nullable {
                    format!("&{name}_val")
                } else {
                    format!("&{name}")
                };
            }
        }
        if let ExprKind::Field(base, field) = &expr.kind {
            // Struct fields (args.limit) are addressable lvalues.
            if let ExprKind::Ident(base_name) = &base.kind {
                if !self.configs.contains(base_name) && self.local(base_name).is_some() {
                    return format!("&{base_name}.{field}");
                }
            }
        }
        let tmp = format!("{prefix}_tmp{}", self.tmp);
        self.tmp += 1;
        if let Type::Str(n) = ty {
            let rendered = self.render_expr(expr);
            let _ = writeln!(out, "{ind}char {tmp}[{}] = {{0}};", n + 1);
            let _ = writeln!(out, "{ind}strncpy({tmp}, {rendered}, {n});");
            return tmp;
        }
        let rendered = self.render_expr(expr);
        let _ = writeln!(out, "{ind}{} = {rendered};", self.names.c_decl(&tmp, ty));
        format!("&{tmp}")
    }

    fn local(&self, name: &str) -> Option<(String, Type, bool)> {
        self.locals.iter().rev().find(|(n, _, _)| n == name).cloned()
    }

    fn map_key_ty(&self, map: &str) -> Type {
        self.ir.map(map).map(|m| m.key.clone()).unwrap_or(Type::U32)
    }

    fn map_value_ty(&self, map: &str) -> Type {
        self.ir.map(map).map(|m| m.value.clone()).unwrap_or(Type::U64)
    }

    fn render_expr(&self, expr: &Expr) -> String {
        match &expr.kind {
            ExprKind::Int(value) => render_int(*value),
            ExprKind::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            ExprKind::Str(s) => format!("\"{}\"", escape_c(s)),
            ExprKind::None => "0".to_string(),
            ExprKind::Ident(name) => match self.local(name) {
                Some((_, _, true)) => format!("{name}_val"),
                _ => name.to_string(),
            },
            ExprKind::Field(base, field) => {
                if let ExprKind::Ident(base_name) = &base.kind {
                    if self.configs.contains(base_name) {
                        return format!("{base_name}_shadow.{field}");
                    }
                }
                format!("{}.{field}", self.render_expr(base))
            }
            ExprKind::Arrow(base, field) => format!("{}->{field}", self.render_expr(base)),
            ExprKind::Index(base, key) => {
                format!("{}[{}]", self.render_expr(base), self.render_expr(key))
            }
            ExprKind::Call { callee, args } => {
                let name = match &callee.kind {
                    ExprKind::Ident(name) => name.clone(),
                    _ => "/* not callable */".to_string(),
                };
                let rendered: Vec<String> = args.iter().map(|a| self.render_expr(a)).collect();
                format!("{name}({})", rendered.join(", "))
            }
            ExprKind::Unary { op, operand } => match op {
                UnaryOp::Neg => format!("(-{})", self.render_expr(operand)),
                UnaryOp::Not => format!("(!{})", self.render_expr(operand)),
            },
            ExprKind::Binary { left, op, right } => {
                if matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
                    let (none_side, other) = match (&left.kind, &right.kind) {
                        (ExprKind::None, _) => (true, right),
                        (_, ExprKind::None) => (true, left),
                        _ => (false, left),
                    };
                    if none_side {
                        if let ExprKind::Ident(name) = &other.kind {
                            return match op {
                                BinaryOp::Eq => format!("(!{name}_ok)"),
                                _ => format!("({name}_ok)"),
                            };
                        }
                    }
                }
                format!(
                    "({} {} {})",
                    self.render_expr(left),
                    op.c_op(),
                    self.render_expr(right)
                )
            }
        }
    }

    fn printf_format(&self, format: &str, args: &[Expr]) -> (String, Vec<String>) {
        let mut fmt = String::new();
        let mut rendered = Vec::new();
        let mut arg_iter = args.iter();
        let mut chars = format.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    fmt.push('{');
                }
                '{' if chars.peek() == Some(&'}') => {
                    chars.next();
                    match arg_iter.next() {
                        Some(arg) => {
                            fmt.push_str(printf_conv(arg.ty.as_ref()));
                            rendered.push(self.render_expr(arg));
                        }
                        None => fmt.push_str("%u"),
                    }
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    fmt.push('}');
                }
                '%' => fmt.push_str("%%"),
                '"' => fmt.push_str("\\\""),
                '\\' => fmt.push_str("\\\\"),
                other => fmt.push(other),
            }
        }
        fmt.push_str("\\n");
        (fmt, rendered)
    }
}
