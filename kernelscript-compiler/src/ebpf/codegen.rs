//! eBPF C emission.
//!
//! Walks the kernel IR and prints one C translation unit per source file.
//! Loop lowering follows the plan fixed by the bound analysis: small
//! bounded loops unroll inline, medium ones become plain `for` loops with
//! constant bounds, everything else is hoisted into a `bpf_loop()` callback
//! with its free variables carried through a context struct.

use std::collections::HashSet;
use std::fmt::Write;

use tracing::info;

use crate::ir::{IrStmt, KernelFunction, KernelIr, LoopPlan};
use crate::script::ast::{Attribute, BinaryOp, Expr, ExprKind, IntValue, Type, UnaryOp};

use super::TypeNames;

pub fn emit_kernel(ir: &KernelIr) -> String {
    let mut emitter = KernelEmitter::new(ir);
    emitter.emit()
}

struct KernelEmitter<'a> {
    ir: &'a KernelIr,
    names: TypeNames,
    configs: HashSet<String>,
    globals: HashSet<String>,
    out: String,
    /// Hoisted bpf_loop callbacks for the function being emitted.
    callbacks: String,
    // Per-function state.
    fn_name: String,
    fn_ret: String,
    ret_default: String,
    tmp: usize,
    loop_idx: usize,
    locals: Vec<(String, Type, bool)>,
    captures: HashSet<String>,
    in_callback: bool,
    callback_has_ret: bool,
}

impl<'a> KernelEmitter<'a> {
    fn new(ir: &'a KernelIr) -> Self {
        Self {
            ir,
            names: TypeNames::from_kernel(ir),
            configs: ir.configs.iter().map(|c| c.name.clone()).collect(),
            globals: ir.globals.iter().map(|(n, _, _)| n.clone()).collect(),
            out: String::new(),
            callbacks: String::new(),
            fn_name: String::new(),
            fn_ret: "int".to_string(),
            ret_default: "0".to_string(),
            tmp: 0,
            loop_idx: 0,
            locals: Vec::new(),
            captures: HashSet::new(),
            in_callback: false,
            callback_has_ret: false,
        }
    }

    fn emit(&mut self) -> String {
        let has_kprobe = self
            .ir
            .programs
            .iter()
            .any(|p| matches!(p.attribute, Some(Attribute::Kprobe(_))));

        let _ = writeln!(
            self.out,
            "/* eBPF side of {}. Generated; do not edit. */",
            self.ir.unit
        );
        self.out.push_str("#include \"vmlinux.h\"\n");
        self.out.push_str("#include <bpf/bpf_helpers.h>\n");
        if has_kprobe {
            self.out.push_str("#include <bpf/bpf_tracing.h>\n");
        }
        let _ = writeln!(self.out, "#include \"{}.maps.h\"", self.ir.unit);
        self.out.push('\n');
        self.out.push_str("char LICENSE[] SEC(\"license\") = \"GPL\";\n\n");

        for (name, ty, init) in &self.ir.globals {
            let decl = self.names.c_decl(name, ty);
            match init {
                Some(expr) => {
                    let rendered = self.render_expr(expr);
                    let _ = writeln!(self.out, "{decl} = {rendered};");
                }
                None => {
                    let _ = writeln!(self.out, "{decl} = {};", self.names.zero_value(ty));
                }
            }
        }
        if !self.ir.globals.is_empty() {
            self.out.push('\n');
        }

        // Prototypes first so helpers may call each other in any order.
        for f in &self.ir.helpers {
            let _ = writeln!(
                self.out,
                "static __always_inline {};",
                self.signature(f)
            );
        }
        for f in &self.ir.kfuncs {
            let _ = writeln!(self.out, "{};", self.signature(f));
        }
        if !self.ir.helpers.is_empty() || !self.ir.kfuncs.is_empty() {
            self.out.push('\n');
        }

        let helpers = self.ir.helpers.clone();
        for f in &helpers {
            self.emit_function(f, FunctionKind::Helper);
        }
        let kfuncs = self.ir.kfuncs.clone();
        for f in &kfuncs {
            self.emit_function(f, FunctionKind::Kfunc);
        }
        if !kfuncs.is_empty() {
            self.emit_kfunc_registration();
        }
        let programs = self.ir.programs.clone();
        for f in &programs {
            self.emit_function(f, FunctionKind::Program);
        }

        info!(
            "emitted kernel C for `{}`: {} program(s)",
            self.ir.unit,
            self.ir.programs.len()
        );
        std::mem::take(&mut self.out)
    }

    fn signature(&self, f: &KernelFunction) -> String {
        let ret = match f.attribute {
            Some(Attribute::Xdp) | Some(Attribute::Tc(_)) | Some(Attribute::Kprobe(_)) => {
                "int".to_string()
            }
            _ => match &f.return_type {
                Some(ty) => self.names.c_type(ty),
                None => "void".to_string(),
            },
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
        format!("{ret} {}({params})", f.name)
    }

    fn emit_function(&mut self, f: &KernelFunction, kind: FunctionKind) {
        self.fn_name = f.name.clone();
        self.fn_ret = match f.attribute {
            Some(Attribute::Xdp) | Some(Attribute::Tc(_)) | Some(Attribute::Kprobe(_)) => {
                "int".to_string()
            }
            _ => match &f.return_type {
                Some(ty) => self.names.c_type(ty),
                None => "void".to_string(),
            },
        };
        self.ret_default = match f.attribute {
            Some(Attribute::Xdp) => "XDP_PASS".to_string(),
            _ => {
                if self.fn_ret == "void" {
                    String::new()
                } else {
                    "0".to_string()
                }
            }
        };
        self.tmp = 0;
        self.loop_idx = 0;
        self.locals = f
            .params
            .iter()
            .map(|p| (p.name.clone(), p.ty.clone(), false))
            .collect();
        self.captures.clear();
        self.in_callback = false;
        self.callbacks.clear();

        let mut body = String::new();
        for config in &f.configs_read {
            let _ = writeln!(body, "\t__u32 {config}_slot = 0;");
            let _ = writeln!(
                body,
                "\tstruct {config}_config *{config} = bpf_map_lookup_elem(&{config}_config_map, &{config}_slot);"
            );
            let _ = writeln!(body, "\tif (!{config})");
            let _ = writeln!(body, "\t\treturn {};", self.ret_default);
        }
        self.emit_stmts(&f.body, 1, &mut body);
        if matches!(kind, FunctionKind::Program)
            && !matches!(f.body.last(), Some(IrStmt::Return { .. }))
        {
            let _ = writeln!(body, "\treturn {};", self.ret_default);
        }

        // Callbacks hoisted out of the body must precede the function.
        let callbacks = std::mem::take(&mut self.callbacks);
        self.out.push_str(&callbacks);

        match kind {
            FunctionKind::Program => {
                let section = f.section.clone().unwrap_or_else(|| "xdp".to_string());
                let _ = writeln!(self.out, "SEC(\"{section}\")");
                let _ = writeln!(self.out, "{}", self.signature(f));
            }
            FunctionKind::Kfunc => {
                let _ = writeln!(self.out, "__bpf_kfunc {}", self.signature(f));
            }
            FunctionKind::Helper => {
                let _ = writeln!(self.out, "static __always_inline {}", self.signature(f));
            }
        }
        self.out.push_str("{\n");
        self.out.push_str(&body);
        self.out.push_str("}\n\n");
    }

    fn emit_kfunc_registration(&mut self) {
        let unit = &self.ir.unit;
        let _ = writeln!(self.out, "/* kfunc export surface, consumed by the module glue */");
        let _ = writeln!(self.out, "BTF_KFUNCS_START({unit}_kfunc_ids)");
        for f in &self.ir.kfuncs {
            let _ = writeln!(self.out, "BTF_ID_FLAGS(func, {})", f.name);
        }
        let _ = writeln!(self.out, "BTF_KFUNCS_END({unit}_kfunc_ids)");
        self.out.push('\n');
        let _ = writeln!(
            self.out,
            "static const struct btf_kfunc_id_set {unit}_kfunc_set = {{"
        );
        let _ = writeln!(self.out, "\t.owner = THIS_MODULE,");
        let _ = writeln!(self.out, "\t.set = &{unit}_kfunc_ids,");
        let _ = writeln!(self.out, "}};\n");
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
                    // Copy of a map-read result: carry the value/ok pair.
                    let (val, ok) = match init.as_ref().map(|e| &e.kind) {
                        Some(ExprKind::Ident(src)) => {
                            (self.render_ident_val(src), self.render_ident_ok(src))
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
                let vty = self.names.c_type(value_ty);
                let _ = writeln!(
                    out,
                    "{ind}{vty} *{dst}_ptr = bpf_map_lookup_elem(&{map}, {key_ref});"
                );
                let _ = writeln!(
                    out,
                    "{ind}{} = {};",
                    self.names.c_decl(&format!("{dst}_val"), value_ty),
                    self.names.zero_value(value_ty)
                );
                let _ = writeln!(out, "{ind}bool {dst}_ok = false;");
                let _ = writeln!(out, "{ind}if ({dst}_ptr) {{");
                if self.names.is_aggregate(value_ty) && matches!(value_ty, Type::Str(_) | Type::Array(..)) {
                    let _ = writeln!(
                        out,
                        "{ind}\t__builtin_memcpy({dst}_val, {dst}_ptr, sizeof({dst}_val));"
                    );
                } else {
                    let _ = writeln!(out, "{ind}\t{dst}_val = *{dst}_ptr;");
                }
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
                    "{ind}bpf_map_update_elem(&{map}, {key_ref}, {value_ref}, BPF_ANY);"
                );
            }
            IrStmt::Delete { map, key } => {
                let key_ty = self.map_key_ty(map);
                let key_ref = self.addr_of(key, &key_ty, "k", &ind, out);
                let _ = writeln!(out, "{ind}bpf_map_delete_elem(&{map}, {key_ref});");
            }
            IrStmt::Assign { target, value } => {
                if let Some(Type::Str(n)) = &target.ty {
                    let t = self.render_expr(target);
                    let v = self.render_expr(value);
                    let _ = writeln!(out, "{ind}__builtin_memcpy({t}, {v}, {});", n + 1);
                    return;
                }
                let t = self.render_expr(target);
                let v = self.render_expr(value);
                let _ = writeln!(out, "{ind}{t} = {v};");
            }
            IrStmt::ConfigWrite { .. } => {
                unreachable!("config writes never lower to the kernel side")
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
            IrStmt::Loop { var, plan, body } => self.emit_loop(var, plan, body, depth, out),
            IrStmt::Return { value } => self.emit_return(value.as_ref(), &ind, out),
            IrStmt::Expr(expr) => {
                let rendered = self.render_expr(expr);
                let _ = writeln!(out, "{ind}{rendered};");
            }
            IrStmt::Print { format, args } => {
                let (fmt, rendered) = self.printk_format(format, args);
                if rendered.is_empty() {
                    let _ = writeln!(out, "{ind}bpf_printk(\"{fmt}\");");
                } else {
                    let _ = writeln!(out, "{ind}bpf_printk(\"{fmt}\", {});", rendered.join(", "));
                }
            }
            IrStmt::Load { .. } | IrStmt::Attach { .. } | IrStmt::Detach { .. } => {
                unreachable!("skeleton operations never lower to the kernel side")
            }
        }
    }

    fn emit_return(&mut self, value: Option<&Expr>, ind: &str, out: &mut String) {
        if self.in_callback {
            // Early return from inside a bpf_loop body travels through the
            // context struct and stops the iteration.
            if self.callback_has_ret {
                if let Some(value) = value {
                    let v = self.render_expr(value);
                    let _ = writeln!(out, "{ind}c->__ret = {v};");
                }
                let _ = writeln!(out, "{ind}c->__ret_set = true;");
            }
            let _ = writeln!(out, "{ind}return 1;");
            return;
        }
        match value {
            Some(value) => {
                let v = self.render_expr(value);
                let _ = writeln!(out, "{ind}return {v};");
            }
            None => {
                let _ = writeln!(out, "{ind}return;");
            }
        }
    }

    fn emit_loop(
        &mut self,
        var: &str,
        plan: &LoopPlan,
        body: &[IrStmt],
        depth: usize,
        out: &mut String,
    ) {
        let ind = "\t".repeat(depth);
        match plan {
            LoopPlan::Unrolled { lo, hi } => {
                for value in *lo..*hi {
                    let _ = writeln!(out, "{ind}{{");
                    let _ = writeln!(out, "{ind}\t__u64 {var} = {value};");
                    let scope_mark = self.locals.len();
                    self.locals.push((var.to_string(), Type::U64, false));
                    self.emit_stmts(body, depth + 1, out);
                    self.locals.truncate(scope_mark);
                    let _ = writeln!(out, "{ind}}}");
                }
            }
            LoopPlan::Simple { lo, hi } => {
                let _ = writeln!(
                    out,
                    "{ind}for (__u64 {var} = {lo}; {var} < {hi}; {var}++) {{"
                );
                let scope_mark = self.locals.len();
                self.locals.push((var.to_string(), Type::U64, false));
                self.emit_stmts(body, depth + 1, out);
                self.locals.truncate(scope_mark);
                let _ = writeln!(out, "{ind}}}");
            }
            LoopPlan::BpfLoopConst { .. } | LoopPlan::BpfLoopDyn { .. } => {
                self.emit_bpf_loop(var, plan, body, depth, out);
            }
        }
    }

    fn emit_bpf_loop(
        &mut self,
        var: &str,
        plan: &LoopPlan,
        body: &[IrStmt],
        depth: usize,
        out: &mut String,
    ) {
        let ind = "\t".repeat(depth);
        let idx = self.loop_idx;
        self.loop_idx += 1;
        let cb = format!("{}_loop{idx}_cb", self.fn_name);
        let ctx_ty = format!("{}_loop{idx}_ctx", self.fn_name);
        let ctx_var = format!("loop{idx}_ctx");

        // Free variables: locals visible at the loop site and referenced in
        // the body travel through the context struct by value.
        let mut referenced = HashSet::new();
        collect_idents(body, &mut referenced);
        let mut declared = HashSet::new();
        collect_declared(body, &mut declared);
        declared.insert(var.to_string());
        let free: Vec<(String, Type, bool)> = self
            .locals
            .iter()
            .filter(|(name, _, _)| referenced.contains(name) && !declared.contains(name))
            .cloned()
            .collect();
        let has_ret = body_has_return(body);
        let ret_is_void = self.fn_ret == "void";

        // Context struct + callback, hoisted ahead of the function.
        let mut cb_text = String::new();
        let _ = writeln!(cb_text, "struct {ctx_ty} {{");
        for (name, ty, nullable) in &free {
            if *nullable {
                let _ = writeln!(
                    cb_text,
                    "\t{};",
                    self.names.c_decl(&format!("{name}_val"), ty)
                );
                let _ = writeln!(cb_text, "\tbool {name}_ok;");
            } else {
                let _ = writeln!(cb_text, "\t{};", self.names.c_decl(name, ty));
            }
        }
        if matches!(plan, LoopPlan::BpfLoopDyn { .. }) {
            let _ = writeln!(cb_text, "\t__u64 __start;");
        }
        if has_ret {
            if !ret_is_void {
                let _ = writeln!(cb_text, "\t{} __ret;", self.fn_ret);
            }
            let _ = writeln!(cb_text, "\tbool __ret_set;");
        }
        let _ = writeln!(cb_text, "}};\n");
        let _ = writeln!(cb_text, "static long {cb}(__u64 idx, void *data)");
        cb_text.push_str("{\n");
        let _ = writeln!(cb_text, "\tstruct {ctx_ty} *c = data;");
        if has_ret {
            let _ = writeln!(cb_text, "\tif (c->__ret_set)");
            let _ = writeln!(cb_text, "\t\treturn 1;");
        }
        match plan {
            LoopPlan::BpfLoopConst { lo, .. } => {
                let _ = writeln!(cb_text, "\t__u64 {var} = {lo} + idx;");
            }
            LoopPlan::BpfLoopDyn { .. } => {
                let _ = writeln!(cb_text, "\t__u64 {var} = c->__start + idx;");
            }
            _ => unreachable!(),
        }

        let saved_captures = std::mem::replace(
            &mut self.captures,
            free.iter().map(|(n, _, _)| n.clone()).collect(),
        );
        let saved_in_cb = std::mem::replace(&mut self.in_callback, true);
        let saved_has_ret = std::mem::replace(&mut self.callback_has_ret, has_ret);
        let scope_mark = self.locals.len();
        self.locals.push((var.to_string(), Type::U64, false));
        let mut cb_body = String::new();
        self.emit_stmts(body, 1, &mut cb_body);
        self.locals.truncate(scope_mark);
        self.captures = saved_captures;
        self.in_callback = saved_in_cb;
        self.callback_has_ret = saved_has_ret;

        cb_text.push_str(&cb_body);
        cb_text.push_str("\treturn 0;\n}\n\n");
        self.callbacks.push_str(&cb_text);

        // Call site: seed the context, run, copy mutations back.
        let _ = writeln!(out, "{ind}struct {ctx_ty} {ctx_var} = {{");
        for (name, _, nullable) in &free {
            if *nullable {
                let _ = writeln!(
                    out,
                    "{ind}\t.{name}_val = {},",
                    self.render_ident_val(name)
                );
                let _ = writeln!(out, "{ind}\t.{name}_ok = {},", self.render_ident_ok(name));
            } else {
                let _ = writeln!(out, "{ind}\t.{name} = {},", self.render_ident(name));
            }
        }
        if let LoopPlan::BpfLoopDyn { start, .. } = plan {
            let s = self.render_expr(start);
            let _ = writeln!(out, "{ind}\t.__start = {s},");
        }
        let _ = writeln!(out, "{ind}}};");
        match plan {
            LoopPlan::BpfLoopConst { count, .. } => {
                let _ = writeln!(out, "{ind}bpf_loop({count}, {cb}, &{ctx_var}, 0);");
            }
            LoopPlan::BpfLoopDyn { start, end } => {
                let s = self.render_expr(start);
                let e = self.render_expr(end);
                let _ = writeln!(
                    out,
                    "{ind}__u64 loop{idx}_n = ({e} > {s}) ? ({e} - {s}) : 0;"
                );
                let _ = writeln!(out, "{ind}bpf_loop(loop{idx}_n, {cb}, &{ctx_var}, 0);");
            }
            _ => unreachable!(),
        }
        for (name, _, nullable) in &free {
            if *nullable {
                let _ = writeln!(
                    out,
                    "{ind}{} = {ctx_var}.{name}_val;",
                    self.render_ident_val(name)
                );
                let _ = writeln!(
                    out,
                    "{ind}{} = {ctx_var}.{name}_ok;",
                    self.render_ident_ok(name)
                );
            } else {
                let _ = writeln!(out, "{ind}{} = {ctx_var}.{name};", self.render_ident(name));
            }
        }
        if has_ret {
            let _ = writeln!(out, "{ind}if ({ctx_var}.__ret_set) {{");
            if self.in_callback {
                if self.callback_has_ret {
                    if !ret_is_void {
                        let _ = writeln!(out, "{ind}\tc->__ret = {ctx_var}.__ret;");
                    }
                    let _ = writeln!(out, "{ind}\tc->__ret_set = true;");
                }
                let _ = writeln!(out, "{ind}\treturn 1;");
            } else if ret_is_void {
                let _ = writeln!(out, "{ind}\treturn;");
            } else {
                let _ = writeln!(out, "{ind}\treturn {ctx_var}.__ret;");
            }
            let _ = writeln!(out, "{ind}}}");
        }
    }

    /// A reference suitable for a map-helper argument. Identifiers are
    /// addressable directly; everything else, literals included, goes
    /// through a uniquely named temporary. `&(literal)` is never emitted.
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
                    format!("&{}", self.render_ident_val(name))
                } else {
                    format!("&{}", self.render_ident(name))
                };
            }
            if self.globals.contains(name) {
                return format!("&{name}");
            }
        }
        let tmp = format!("{prefix}_tmp{}", self.tmp);
        self.tmp += 1;
        let rendered = self.render_expr(expr);
        let _ = writeln!(out, "{ind}{} = {rendered};", self.names.c_decl(&tmp, ty));
        format!("&{tmp}")
    }

    fn local(&self, name: &str) -> Option<(String, Type, bool)> {
        self.locals.iter().rev().find(|(n, _, _)| n == name).cloned()
    }

    fn map_key_ty(&self, map: &str) -> Type {
        self.ir
            .map(map)
            .map(|m| m.key.clone())
            .unwrap_or(Type::U32)
    }

    fn map_value_ty(&self, map: &str) -> Type {
        self.ir
            .map(map)
            .map(|m| m.value.clone())
            .unwrap_or(Type::U64)
    }

    fn render_ident(&self, name: &str) -> String {
        let base = match self.local(name) {
            Some((_, _, true)) => format!("{name}_val"),
            _ => name.to_string(),
        };
        if self.captures.contains(name) {
            format!("c->{base}")
        } else {
            base
        }
    }

    fn render_ident_val(&self, name: &str) -> String {
        let base = format!("{name}_val");
        if self.captures.contains(name) {
            format!("c->{base}")
        } else {
            base
        }
    }

    fn render_ident_ok(&self, name: &str) -> String {
        let base = format!("{name}_ok");
        if self.captures.contains(name) {
            format!("c->{base}")
        } else {
            base
        }
    }

    fn render_expr(&self, expr: &Expr) -> String {
        match &expr.kind {
            ExprKind::Int(value) => render_int(*value),
            ExprKind::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            ExprKind::Str(s) => format!("\"{}\"", escape_c(s)),
            ExprKind::None => "0".to_string(),
            ExprKind::Ident(name) => self.render_ident(name),
            ExprKind::Field(base, field) => {
                if let ExprKind::Ident(base_name) = &base.kind {
                    if self.configs.contains(base_name) {
                        // Config reads go through the per-function lookup.
                        return format!("{base_name}->{field}");
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
                // `x == none` and `x != none` test map-read presence.
                if matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
                    let (none_side, other) = match (&left.kind, &right.kind) {
                        (ExprKind::None, _) => (true, right),
                        (_, ExprKind::None) => (true, left),
                        _ => (false, left),
                    };
                    if none_side {
                        if let ExprKind::Ident(name) = &other.kind {
                            let ok = self.render_ident_ok(name);
                            return match op {
                                BinaryOp::Eq => format!("(!{ok})"),
                                _ => format!("({ok})"),
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

    fn printk_format(&self, format: &str, args: &[Expr]) -> (String, Vec<String>) {
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

#[derive(Clone, Copy)]
enum FunctionKind {
    Program,
    Kfunc,
    Helper,
}

pub(crate) fn printf_conv(ty: Option<&Type>) -> &'static str {
    match ty.map(|t| t.unwrap_nullable()) {
        Some(Type::U64) => "%llu",
        Some(Type::I64) => "%lld",
        Some(Type::I8) | Some(Type::I16) | Some(Type::I32) => "%d",
        Some(Type::Bool) => "%d",
        Some(Type::Str(_)) => "%s",
        Some(Type::Pointer(_)) => "%p",
        _ => "%u",
    }
}

pub(crate) fn render_int(value: IntValue) -> String {
    let wide = value.widen();
    match value {
        IntValue::U64(v) if v > u32::MAX as u64 => format!("{v}ULL"),
        IntValue::I64(v) if v > i32::MAX as i64 || v < i32::MIN as i64 => format!("{v}LL"),
        _ => format!("{wide}"),
    }
}

pub(crate) fn escape_c(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

fn collect_idents(stmts: &[IrStmt], out: &mut HashSet<String>) {
    fn walk(expr: &Expr, out: &mut HashSet<String>) {
        match &expr.kind {
            ExprKind::Ident(name) => {
                out.insert(name.clone());
            }
            ExprKind::Field(base, _) | ExprKind::Arrow(base, _) => walk(base, out),
            ExprKind::Index(base, key) => {
                walk(base, out);
                walk(key, out);
            }
            ExprKind::Call { args, .. } => {
                for arg in args {
                    walk(arg, out);
                }
            }
            ExprKind::Unary { operand, .. } => walk(operand, out),
            ExprKind::Binary { left, right, .. } => {
                walk(left, out);
                walk(right, out);
            }
            _ => {}
        }
    }
    for stmt in stmts {
        match stmt {
            IrStmt::Local { init, .. } => {
                if let Some(init) = init {
                    walk(init, out);
                }
            }
            IrStmt::Lookup { key, .. } => walk(key, out),
            IrStmt::Update { key, value, .. } => {
                walk(key, out);
                walk(value, out);
            }
            IrStmt::Delete { key, .. } => walk(key, out),
            IrStmt::Assign { target, value } => {
                walk(target, out);
                walk(value, out);
            }
            IrStmt::ConfigWrite { value, .. } => walk(value, out),
            IrStmt::If {
                cond,
                then_body,
                else_body,
            } => {
                walk(cond, out);
                collect_idents(then_body, out);
                collect_idents(else_body, out);
            }
            IrStmt::Loop { plan, body, .. } => {
                if let LoopPlan::BpfLoopDyn { start, end } = plan {
                    walk(start, out);
                    walk(end, out);
                }
                collect_idents(body, out);
            }
            IrStmt::Return { value } => {
                if let Some(value) = value {
                    walk(value, out);
                }
            }
            IrStmt::Expr(expr) => walk(expr, out),
            IrStmt::Print { args, .. } => {
                for arg in args {
                    walk(arg, out);
                }
            }
            IrStmt::Load { .. } | IrStmt::Attach { .. } | IrStmt::Detach { .. } => {}
        }
    }
}

fn collect_declared(stmts: &[IrStmt], out: &mut HashSet<String>) {
    for stmt in stmts {
        match stmt {
            IrStmt::Local { name, .. } => {
                out.insert(name.clone());
            }
            IrStmt::Lookup { dst, .. } => {
                out.insert(dst.clone());
            }
            IrStmt::If {
                then_body,
                else_body,
                ..
            } => {
                collect_declared(then_body, out);
                collect_declared(else_body, out);
            }
            IrStmt::Loop { var, body, .. } => {
                out.insert(var.clone());
                collect_declared(body, out);
            }
            _ => {}
        }
    }
}

fn body_has_return(stmts: &[IrStmt]) -> bool {
    stmts.iter().any(|stmt| match stmt {
        IrStmt::Return { .. } => true,
        IrStmt::If {
            then_body,
            else_body,
            ..
        } => body_has_return(then_body) || body_has_return(else_body),
        IrStmt::Loop { body, .. } => body_has_return(body),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::generate;
    use crate::script::parser::parse;
    use crate::sema::check;
    use crate::sema::loops::LoopLimits;

    fn kernel_c(src: &str) -> String {
        let program = parse(src, "test.ks").expect("source should parse");
        let typed = check(program, "test.ks").expect("source should check");
        let (kernel, _) = generate(&typed, "test", LoopLimits::default()).expect("should lower");
        emit_kernel(&kernel)
    }

    const RATE: &str = r#"
        include "xdp.kh"

        var packet_counts : hash<u32, u64>(1024)

        @xdp fn rate_limit(ctx: *xdp_md) -> xdp_action {
            var cnt = packet_counts[0]
            if cnt == none {
                packet_counts[0] = 1
                return XDP_PASS
            }
            packet_counts[0] = cnt + 1
            return XDP_DROP
        }

        fn main() -> i32 {
            return 0
        }
    "#;

    #[test]
    fn test_program_section_and_signature() {
        let c = kernel_c(RATE);
        assert!(c.contains("SEC(\"xdp\")"));
        assert!(c.contains("int rate_limit(struct xdp_md *ctx)"));
        assert!(c.contains("char LICENSE[] SEC(\"license\") = \"GPL\";"));
        assert!(c.contains("#include \"test.maps.h\""));
    }

    #[test]
    fn test_lookup_is_null_guarded() {
        let c = kernel_c(RATE);
        assert!(c.contains("__u64 *cnt_ptr = bpf_map_lookup_elem(&packet_counts, &k_tmp0);"));
        assert!(c.contains("bool cnt_ok = false;"));
        assert!(c.contains("if (cnt_ptr) {"));
        assert!(c.contains("(!cnt_ok)"));
    }

    #[test]
    fn test_literal_key_goes_through_temp() {
        let c = kernel_c(RATE);
        assert!(!c.contains("&(0)"));
        assert!(!c.contains("&0"));
        assert!(c.contains("__u32 k_tmp0 = 0;"));
    }

    #[test]
    fn test_small_loop_unrolls_three_copies() {
        let c = kernel_c(
            r#"
            include "xdp.kh"
            var hits : array<u32, u64>(8)

            @xdp fn probe(ctx: *xdp_md) -> xdp_action {
                for i in 0..3 {
                    hits[0] = i
                }
                return XDP_PASS
            }

            fn main() -> i32 {
                return 0
            }
            "#,
        );
        assert_eq!(c.matches("__u64 i = ").count(), 3);
        assert!(c.contains("__u64 i = 0;"));
        assert!(c.contains("__u64 i = 1;"));
        assert!(c.contains("__u64 i = 2;"));
        assert!(!c.contains("bpf_loop"));
    }

    #[test]
    fn test_medium_loop_is_plain_for() {
        let c = kernel_c(
            r#"
            include "xdp.kh"
            var hits : array<u32, u64>(8)

            @xdp fn probe(ctx: *xdp_md) -> xdp_action {
                for i in 0..10 {
                    hits[0] = i
                }
                return XDP_PASS
            }

            fn main() -> i32 {
                return 0
            }
            "#,
        );
        assert!(c.contains("for (__u64 i = 0; i < 10; i++) {"));
        assert!(!c.contains("bpf_loop"));
    }

    #[test]
    fn test_large_loop_uses_bpf_loop_callback() {
        let c = kernel_c(
            r#"
            include "xdp.kh"
            var hits : array<u32, u64>(8)

            @xdp fn probe(ctx: *xdp_md) -> xdp_action {
                var total : u64 = 0
                for i in 0..1000 {
                    total = total + 1
                }
                hits[0] = total
                return XDP_PASS
            }

            fn main() -> i32 {
                return 0
            }
            "#,
        );
        assert!(c.contains("static long probe_loop0_cb(__u64 idx, void *data)"));
        assert!(c.contains("bpf_loop(1000, probe_loop0_cb, &loop0_ctx, 0);"));
        // The mutated free variable rides the context struct both ways.
        assert!(c.contains(".total = total,"));
        assert!(c.contains("total = loop0_ctx.total;"));
        assert!(c.contains("c->total = (c->total + 1);"));
    }

    #[test]
    fn test_dynamic_bound_uses_bpf_loop() {
        let c = kernel_c(
            r#"
            include "xdp.kh"
            var hits : array<u32, u64>(8)

            @xdp fn probe(ctx: *xdp_md) -> xdp_action {
                var n = ctx->ingress_ifindex
                for i in 0..n {
                    hits[0] = i
                }
                return XDP_PASS
            }

            fn main() -> i32 {
                return 0
            }
            "#,
        );
        assert!(c.contains("bpf_loop(loop0_n, probe_loop0_cb, &loop0_ctx, 0);"));
        assert!(c.contains(".__start ="));
    }

    #[test]
    fn test_kfunc_definition_and_registration() {
        let c = kernel_c(
            r#"
            @kfunc fn clamp_rate(v: u64) -> u64 {
                if v > 100 {
                    return 100
                }
                return v
            }

            fn main() -> i32 {
                return 0
            }
            "#,
        );
        assert!(c.contains("__bpf_kfunc __u64 clamp_rate(__u64 v)"));
        assert!(c.contains("BTF_KFUNCS_START(test_kfunc_ids)"));
        assert!(c.contains("BTF_ID_FLAGS(func, clamp_rate)"));
        assert!(c.contains(".owner = THIS_MODULE,"));
    }

    #[test]
    fn test_helper_is_static_inline() {
        let c = kernel_c(
            r#"
            include "xdp.kh"

            @helper fn double_it(v: u64) -> u64 {
                return v + v
            }

            @xdp fn probe(ctx: *xdp_md) -> xdp_action {
                var x = double_it(2)
                return XDP_PASS
            }

            fn main() -> i32 {
                return 0
            }
            "#,
        );
        assert!(c.contains("static __always_inline __u64 double_it(__u64 v)"));
        assert!(c.contains("double_it(2)"));
    }

    #[test]
    fn test_config_read_prologue() {
        let c = kernel_c(
            r#"
            include "xdp.kh"

            config rate_cfg {
                limit: u64,
            }

            @xdp fn probe(ctx: *xdp_md) -> xdp_action {
                if rate_cfg.limit > 0 {
                    return XDP_DROP
                }
                return XDP_PASS
            }

            fn main() -> i32 {
                return 0
            }
            "#,
        );
        assert!(c.contains(
            "struct rate_cfg_config *rate_cfg = bpf_map_lookup_elem(&rate_cfg_config_map, &rate_cfg_slot);"
        ));
        assert!(c.contains("if (!rate_cfg)"));
        assert!(c.contains("rate_cfg->limit"));
    }

    #[test]
    fn test_print_lowers_to_bpf_printk() {
        let c = kernel_c(
            r#"
            include "xdp.kh"

            @xdp fn probe(ctx: *xdp_md) -> xdp_action {
                print("ifindex {}", ctx->ingress_ifindex)
                return XDP_PASS
            }

            fn main() -> i32 {
                return 0
            }
            "#,
        );
        assert!(c.contains("bpf_printk(\"ifindex %u\\n\", ctx->ingress_ifindex);"));
    }
}
