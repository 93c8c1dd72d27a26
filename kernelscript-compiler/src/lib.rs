//! KernelScript compiler pipeline.
//!
//! One source file in, two C translation units (plus a shared map header)
//! out: the kernel-side eBPF unit and the user-space orchestrator. The
//! pipeline is a strict left-to-right batch: parse, check, lower to the
//! two-sided IR, emit each side. No stage re-enters an earlier one, and
//! nothing is emitted once any stage has failed.

pub mod ebpf;
pub mod ir;
pub mod script;
pub mod sema;
pub mod userspace;

use std::fmt::Write as _;

use tracing::info;

use script::parser::ParseError;
use sema::loops::LoopLimits;
use sema::SemanticError;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("{0}")]
    Parse(#[from] Box<ParseError>),

    #[error("{}", render_semantic(.0))]
    Semantic(Vec<SemanticError>),
}

impl From<ParseError> for CompileError {
    fn from(err: ParseError) -> Self {
        CompileError::Parse(Box::new(err))
    }
}

impl From<SemanticError> for CompileError {
    fn from(err: SemanticError) -> Self {
        CompileError::Semantic(vec![err])
    }
}

fn render_semantic(errors: &[SemanticError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, CompileError>;

/// Compilation options beyond the source itself.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Root of the bpf filesystem used for pinned maps.
    pub pin_root: String,
    /// Thresholds feeding loop strategy selection.
    pub loop_limits: LoopLimits,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            pin_root: "/sys/fs/bpf".to_string(),
            loop_limits: LoopLimits::default(),
        }
    }
}

/// The three generated artifacts for one source unit.
#[derive(Debug)]
pub struct Artifacts {
    pub unit: String,
    /// `<unit>.c`, the user-space orchestrator.
    pub user_c: String,
    /// `<unit>.ebpf.c`, the kernel-side translation unit.
    pub kernel_c: String,
    /// `<unit>.maps.h`, shared map and type definitions.
    pub maps_header: String,
}

impl Artifacts {
    pub fn user_file_name(&self) -> String {
        format!("{}.c", self.unit)
    }

    pub fn kernel_file_name(&self) -> String {
        format!("{}.ebpf.c", self.unit)
    }

    pub fn maps_header_file_name(&self) -> String {
        format!("{}.maps.h", self.unit)
    }
}

/// The unit name is the input base name with the extension dropped and
/// anything C would reject mapped to underscores; output names derive
/// from it deterministically.
pub fn unit_name(file: &str) -> String {
    let base = std::path::Path::new(file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("out");
    let mut name: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if name.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(true) {
        name.insert(0, '_');
    }
    name
}

/// Compile one source unit end to end.
pub fn compile_source(source: &str, file: &str, options: &CompileOptions) -> Result<Artifacts> {
    info!("compiling {} ({} bytes)", file, source.len());

    let program = script::parser::parse(source, file)?;
    let typed = sema::check(program, file).map_err(CompileError::Semantic)?;

    let unit = unit_name(file);
    let (kernel, user) = ir::generate(&typed, &unit, options.loop_limits)?;

    let maps_header = ebpf::emit_maps_header(&kernel);
    let kernel_c = ebpf::emit_kernel(&kernel);
    let user_c = userspace::emit_user(&user, &options.pin_root);

    info!(
        "compiled `{unit}`: {} bytes kernel C, {} bytes user C",
        kernel_c.len(),
        user_c.len()
    );
    Ok(Artifacts {
        unit,
        user_c,
        kernel_c,
        maps_header,
    })
}

/// Debug dump of the parsed tree, one declaration per block.
pub fn dump_ast(source: &str, file: &str) -> Result<String> {
    let program = script::parser::parse(source, file)?;
    let mut out = String::new();
    let _ = writeln!(out, "=== AST: {file} ===");
    for include in &program.includes {
        let _ = writeln!(out, "include {:?}", include.header);
    }
    for (i, decl) in program.declarations.iter().enumerate() {
        let _ = writeln!(out, "[{i}] {decl:#?}");
    }
    let _ = writeln!(out, "=== end AST ===");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_name_is_deterministic() {
        assert_eq!(unit_name("rate_limiter.ks"), "rate_limiter");
        assert_eq!(unit_name("/tmp/some-dir/rate-limiter.ks"), "rate_limiter");
        assert_eq!(unit_name("9lives.ks"), "_9lives");
    }

    #[test]
    fn test_artifact_names_follow_unit() {
        let artifacts = Artifacts {
            unit: "foo".to_string(),
            user_c: String::new(),
            kernel_c: String::new(),
            maps_header: String::new(),
        };
        assert_eq!(artifacts.user_file_name(), "foo.c");
        assert_eq!(artifacts.kernel_file_name(), "foo.ebpf.c");
        assert_eq!(artifacts.maps_header_file_name(), "foo.maps.h");
    }

    #[test]
    fn test_error_rendering_has_position_prefix() {
        let err = compile_source("fn main( -> i32 {}", "broken.ks", &CompileOptions::default())
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("broken.ks:1:"), "{msg}");
        assert!(msg.contains("ParseError"));
    }

    #[test]
    fn test_semantic_errors_render_one_per_line() {
        let source = r#"
            fn helper_one() -> i32 {
                return missing_a
            }
            fn helper_two() -> i32 {
                return missing_b
            }
            fn main() -> i32 {
                return 0
            }
        "#;
        let err = compile_source(source, "multi.ks", &CompileOptions::default()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.lines().count() >= 2, "{msg}");
        assert!(msg.contains("missing_a"));
        assert!(msg.contains("missing_b"));
    }
}
