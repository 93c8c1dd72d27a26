//! End-to-end pipeline tests: whole sources in, generated C out.

use kernelscript_compiler::sema::SemanticError;
use kernelscript_compiler::{compile_source, Artifacts, CompileError, CompileOptions};

const RATE_LIMITER: &str = include_str!("../../demos/rate_limiter.ks");

fn compile(source: &str, file: &str) -> Result<Artifacts, CompileError> {
    compile_source(source, file, &CompileOptions::default())
}

fn compile_ok(source: &str, file: &str) -> Artifacts {
    compile(source, file).expect("program should compile")
}

fn semantic_errors(source: &str, file: &str) -> Vec<SemanticError> {
    match compile(source, file).expect_err("program should fail") {
        CompileError::Semantic(errors) => errors,
        other => panic!("expected semantic errors, got {other}"),
    }
}

// S1: the worked rate limiter example.
#[test]
fn test_rate_limiter_user_side() {
    let artifacts = compile_ok(RATE_LIMITER, "rate_limiter.ks");
    let user = &artifacts.user_c;

    assert!(user.contains("int packet_counts_fd = -1;"));
    assert!(user.contains("int main(int argc, char **argv)"));
    assert!(user.contains("{ \"interface\", required_argument, NULL, 1 },"));
    assert!(user.contains("{ \"limit\", required_argument, NULL, 2 },"));
    assert!(user.contains("if (strlen(optarg) > 20) {"));
    assert!(user.contains("args.limit = (__u32)strtoul(optarg, NULL, 0);"));
    assert!(user.contains("rate_limiter_ebpf__open_and_load"));
    // The config write burns k_tmp0 on its slot index; the literal map
    // write that follows gets the next two temporaries.
    assert!(user.contains("bpf_map_update_elem(packet_counts_fd, &k_tmp1, &v_tmp2, 0);"));
}

#[test]
fn test_rate_limiter_kernel_side() {
    let artifacts = compile_ok(RATE_LIMITER, "rate_limiter.ks");
    let kernel = &artifacts.kernel_c;

    assert!(kernel.contains("SEC(\"xdp\")"));
    assert!(kernel.contains("int rate_limit(struct xdp_md *ctx)"));
    assert!(kernel.contains("bpf_map_lookup_elem(&packet_counts, &key)"));
    assert!(kernel.contains("rate_cfg->limit"));

    let header = &artifacts.maps_header;
    assert!(header.contains("__uint(type, BPF_MAP_TYPE_HASH);"));
    assert!(header.contains("} packet_counts SEC(\".maps\");"));
    assert!(header.contains("struct rate_cfg_config {"));
}

#[test]
fn test_artifact_names_derive_from_input() {
    let artifacts = compile_ok(RATE_LIMITER, "rate_limiter.ks");
    assert_eq!(artifacts.user_file_name(), "rate_limiter.c");
    assert_eq!(artifacts.kernel_file_name(), "rate_limiter.ebpf.c");
    assert_eq!(artifacts.maps_header_file_name(), "rate_limiter.maps.h");
}

// S2: a program with kernel functions but no main.
#[test]
fn test_missing_main_aborts() {
    let errors = semantic_errors(
        r#"
        include "xdp.kh"
        @xdp fn t(ctx: *xdp_md) -> xdp_action {
            return XDP_PASS
        }
        fn helper_fn() -> i32 {
            return 0
        }
        "#,
        "s2.ks",
    );
    assert!(matches!(errors[0], SemanticError::MissingMain { .. }));
}

// S3: main with the wrong return type.
#[test]
fn test_wrong_main_return_aborts() {
    let errors = semantic_errors(
        r#"
        fn main() -> u32 {
            return 0
        }
        "#,
        "s3.ks",
    );
    assert!(errors
        .iter()
        .any(|e| matches!(e, SemanticError::InvalidMainSignature { .. })));
}

// S4: a private function called from an XDP program.
#[test]
fn test_private_call_from_ebpf_aborts() {
    let errors = semantic_errors(
        r#"
        include "xdp.kh"
        @private fn p() -> bool {
            return true
        }
        @xdp fn x(ctx: *xdp_md) -> xdp_action {
            if p() {
                return XDP_DROP
            }
            return XDP_PASS
        }
        fn main() -> i32 {
            return 0
        }
        "#,
        "s4.ks",
    );
    assert!(errors
        .iter()
        .any(|e| matches!(e, SemanticError::PrivateNotExposed { callee, .. } if callee == "p")));
}

// S5: a small bounded loop unrolls into three inline copies.
#[test]
fn test_small_bounded_loop_unrolls() {
    let artifacts = compile_ok(
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
        "s5.ks",
    );
    let kernel = &artifacts.kernel_c;
    assert_eq!(kernel.matches("__u64 i = ").count(), 3);
    assert!(!kernel.contains("bpf_loop"));
}

// S6: a pinned map shared by the XDP side and main.
#[test]
fn test_pinned_globals_shared_between_sides() {
    let artifacts = compile_ok(
        r#"
        include "xdp.kh"

        pin var g : hash<u32, u32>(1024)

        @xdp fn touch(ctx: *xdp_md) -> xdp_action {
            g[1] = 1
            return XDP_PASS
        }

        fn main() -> i32 {
            g[2] = 2
            return 0
        }
        "#,
        "s6.ks",
    );
    let header = &artifacts.maps_header;
    assert!(header.contains("__uint(pinning, LIBBPF_PIN_BY_NAME);"));
    assert!(header.contains("} g SEC(\".maps\");"));

    let user = &artifacts.user_c;
    assert_eq!(user.matches("int pinned_globals_map_fd = -1;").count(), 1);
    assert!(user.contains("bpf_obj_get(\"/sys/fs/bpf/g\")"));
    assert!(user.contains("bpf_map_update_elem(pinned_globals_map_fd"));
    assert!(!user.contains("int g_fd"));
}

// Property 1: main uniqueness.
#[test]
fn test_multiple_main_aborts() {
    let errors = semantic_errors(
        r#"
        fn main() -> i32 {
            return 0
        }
        fn main() -> i32 {
            return 1
        }
        "#,
        "dup.ks",
    );
    assert!(errors
        .iter()
        .any(|e| matches!(e, SemanticError::MultipleMain { .. })));
}

// Property 2: attribute signature conformance.
#[test]
fn test_xdp_signature_mutations_fail() {
    for source in [
        // wrong return type
        r#"
        include "xdp.kh"
        @xdp fn f(ctx: *xdp_md) -> i32 {
            return 0
        }
        fn main() -> i32 {
            return 0
        }
        "#,
        // wrong parameter type
        r#"
        include "xdp.kh"
        @xdp fn f(ctx: u64) -> xdp_action {
            return XDP_PASS
        }
        fn main() -> i32 {
            return 0
        }
        "#,
        // wrong arity
        r#"
        include "xdp.kh"
        @xdp fn f(ctx: *xdp_md, extra: u32) -> xdp_action {
            return XDP_PASS
        }
        fn main() -> i32 {
            return 0
        }
        "#,
    ] {
        let errors = semantic_errors(source, "attr.ks");
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, SemanticError::AttributeMisuse { .. })),
            "expected AttributeMisuse for {source}"
        );
    }
}

// Property 3: user space cannot call kernel entry programs directly.
#[test]
fn test_userspace_call_into_entry_program_fails() {
    let errors = semantic_errors(
        r#"
        include "xdp.kh"
        @xdp fn prog(ctx: *xdp_md) -> xdp_action {
            return XDP_PASS
        }
        fn main() -> i32 {
            var fake = 1
            prog(fake)
            return 0
        }
        "#,
        "vis.ks",
    );
    assert!(errors
        .iter()
        .any(|e| matches!(e, SemanticError::AttributeMisuse { .. })));
}

// Property 4: loop classification picks the documented strategies.
#[test]
fn test_loop_strategy_selection() {
    let artifacts = compile_ok(
        r#"
        include "xdp.kh"
        var hits : array<u32, u64>(8)

        @xdp fn probe(ctx: *xdp_md) -> xdp_action {
            for a in 0..10 {
                hits[0] = a
            }
            for b in 0..1000 {
                hits[1] = b
            }
            var n = ctx->ingress_ifindex
            for c in 0..n {
                hits[2] = c
            }
            return XDP_PASS
        }

        fn main() -> i32 {
            return 0
        }
        "#,
        "loops.ks",
    );
    let kernel = &artifacts.kernel_c;
    // 10 iterations: a plain C loop.
    assert!(kernel.contains("for (__u64 a = 0; a < 10; a++) {"));
    // 1000 iterations: bpf_loop with a constant trip count.
    assert!(kernel.contains("bpf_loop(1000, probe_loop0_cb, &loop0_ctx, 0);"));
    // dynamic bound: bpf_loop with a computed trip count.
    assert!(kernel.contains("bpf_loop(loop1_n, probe_loop1_cb, &loop1_ctx, 0);"));
}

// Property 5: constants propagate into loop bounds.
#[test]
fn test_constant_folding_feeds_loop_bounds() {
    let artifacts = compile_ok(
        r#"
        include "xdp.kh"
        var hits : array<u32, u64>(8)

        @xdp fn probe(ctx: *xdp_md) -> xdp_action {
            var a = 2
            var b = a * 3
            for i in 0..b {
                hits[0] = i
            }
            return XDP_PASS
        }

        fn main() -> i32 {
            return 0
        }
        "#,
        "fold.ks",
    );
    // Bounded(0, 6): six iterations is above the unroll limit and below
    // the bpf_loop threshold, so it stays a plain loop.
    assert!(artifacts
        .kernel_c
        .contains("for (__u64 i = 0; i < 6; i++) {"));
}

// Property 6: literal keys and values never produce `&(literal)`.
#[test]
fn test_literal_operands_use_fresh_temporaries() {
    let artifacts = compile_ok(
        r#"
        var counters : hash<u32, u64>(64)

        fn main() -> i32 {
            counters[1] = 10
            counters[2] = 20
            delete counters[1]
            return 0
        }
        "#,
        "temps.ks",
    );
    let user = &artifacts.user_c;
    assert!(!user.contains("&("));
    // Adjacent operations get distinct temporaries.
    assert!(user.contains("__u32 k_tmp0 = 1;"));
    assert!(user.contains("__u64 v_tmp1 = 10;"));
    assert!(user.contains("__u32 k_tmp2 = 2;"));
    assert!(user.contains("__u64 v_tmp3 = 20;"));
    assert!(user.contains("__u32 k_tmp4 = 1;"));
    assert!(user.contains("bpf_map_delete_elem(counters_fd, &k_tmp4);"));
}

// Property 8: the skeleton load call appears exactly when load() does.
#[test]
fn test_skeleton_gating() {
    let with_load = compile_ok(
        r#"
        include "xdp.kh"
        @xdp fn f(ctx: *xdp_md) -> xdp_action {
            return XDP_PASS
        }
        fn main() -> i32 {
            var prog = load(f)
            return 0
        }
        "#,
        "gate.ks",
    );
    assert!(with_load.user_c.contains("gate_ebpf__open_and_load"));

    let without_load = compile_ok(
        r#"
        include "xdp.kh"
        @xdp fn f(ctx: *xdp_md) -> xdp_action {
            return XDP_PASS
        }
        fn main() -> i32 {
            print("configured nothing")
            return 0
        }
        "#,
        "gate.ks",
    );
    assert!(!without_load.user_c.contains("open_and_load"));
    assert!(!without_load.user_c.contains(".skel.h"));
}

#[test]
fn test_parse_error_has_position() {
    let err = compile("fn main( -> i32 {}", "broken.ks").unwrap_err();
    let msg = err.to_string();
    assert!(msg.starts_with("broken.ks:1:"), "{msg}");
}

#[test]
fn test_unknown_attribute_rejected() {
    let errors = semantic_errors(
        r#"
        @tracepoint fn f() -> i32 {
            return 0
        }
        fn main() -> i32 {
            return 0
        }
        "#,
        "unknown.ks",
    );
    assert!(errors
        .iter()
        .any(|e| matches!(e, SemanticError::UnknownAttribute { name, .. } if name == "tracepoint")));
}

#[test]
fn test_tc_program_sections() {
    let artifacts = compile_ok(
        r#"
        include "tc.kh"

        @tc("ingress") fn meter_in(ctx: *__sk_buff) -> i32 {
            return TC_ACT_OK
        }

        @tc("egress") fn meter_out(ctx: *__sk_buff) -> i32 {
            return TC_ACT_SHOT
        }

        fn main() -> i32 {
            var prog = load(meter_in)
            attach(prog, "eth0", 0)
            return 0
        }
        "#,
        "tc.ks",
    );
    let kernel = &artifacts.kernel_c;
    assert!(kernel.contains("SEC(\"tc/ingress\")"));
    assert!(kernel.contains("SEC(\"tc/egress\")"));
    // TC action constants inline to their values.
    assert!(kernel.contains("return 0;"));
    assert!(kernel.contains("return 2;"));
    assert!(artifacts.user_c.contains("bpf_program__attach_tcx"));
}

#[test]
fn test_kprobe_section_from_symbol() {
    let artifacts = compile_ok(
        r#"
        include "kprobe.kh"
        var calls : hash<u32, u64>(128)

        @kprobe("sys_openat") fn on_open(ctx: *pt_regs) -> i32 {
            calls[0] = 1
            return 0
        }

        fn main() -> i32 {
            var prog = load(on_open)
            return 0
        }
        "#,
        "probe.ks",
    );
    assert!(artifacts.kernel_c.contains("SEC(\"kprobe/sys_openat\")"));
}

#[test]
fn test_delete_statement_lowering() {
    let artifacts = compile_ok(
        r#"
        include "xdp.kh"
        var counters : hash<u32, u64>(64)

        @xdp fn probe(ctx: *xdp_md) -> xdp_action {
            delete counters[7]
            return XDP_PASS
        }

        fn main() -> i32 {
            delete counters[7]
            return 0
        }
        "#,
        "del.ks",
    );
    assert!(artifacts
        .kernel_c
        .contains("bpf_map_delete_elem(&counters, &k_tmp0);"));
    assert!(artifacts
        .user_c
        .contains("bpf_map_delete_elem(counters_fd, &k_tmp0);"));
}

#[test]
fn test_enum_declarations_flow_to_both_sides() {
    let artifacts = compile_ok(
        r#"
        include "xdp.kh"

        enum verdict {
            ALLOW = 0,
            DENY = 1,
        }

        var verdicts : hash<u32, u32>(64)

        @xdp fn judge(ctx: *xdp_md) -> xdp_action {
            verdicts[0] = DENY
            return XDP_PASS
        }

        fn main() -> i32 {
            verdicts[0] = ALLOW
            return 0
        }
        "#,
        "enums.ks",
    );
    assert!(artifacts.kernel_c.contains("DENY"));
    assert!(artifacts.maps_header.contains("enum verdict {"));
    assert!(artifacts.user_c.contains("enum verdict {"));
    assert!(artifacts.user_c.contains("ALLOW"));
}

#[test]
fn test_no_partial_output_on_error() {
    // A program failing in the checker produces no artifacts at all.
    let result = compile(
        r#"
        fn main() -> i32 {
            return undefined_name
        }
        "#,
        "partial.ks",
    );
    assert!(result.is_err());
}
