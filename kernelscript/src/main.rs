mod args;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use kernelscript_compiler::{compile_source, dump_ast, unit_name, CompileOptions};

// Exit codes: 0 success, 1 compilation error, 2 I/O failure.
const EXIT_COMPILE_ERROR: u8 = 1;
const EXIT_IO_ERROR: u8 = 2;

fn main() -> ExitCode {
    let parsed = args::Args::parse();

    let log_file_path = parsed.log_file.as_ref().and_then(|p| p.to_str());
    if let Err(e) = logging::initialize_logging(log_file_path) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::from(EXIT_IO_ERROR);
    }

    let source = match std::fs::read_to_string(&parsed.input) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("{}: {e}", parsed.input.display());
            return ExitCode::from(EXIT_IO_ERROR);
        }
    };
    let file = parsed.input.to_string_lossy().to_string();

    let output_dir = parsed
        .output_dir
        .clone()
        .or_else(|| {
            parsed
                .input
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from("."));

    if parsed.emit_ast {
        match dump_ast(&source, &file) {
            Ok(dump) => {
                let path = output_dir.join(format!("{}.ast.txt", unit_name(&file)));
                if let Err(e) = std::fs::write(&path, dump) {
                    eprintln!("{}: {e}", path.display());
                    return ExitCode::from(EXIT_IO_ERROR);
                }
                info!("AST dump saved to {}", path.display());
            }
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::from(EXIT_COMPILE_ERROR);
            }
        }
    }

    let options = CompileOptions {
        pin_root: parsed.pin_root.clone(),
        ..CompileOptions::default()
    };

    let artifacts = match compile_source(&source, &file, &options) {
        Ok(artifacts) => artifacts,
        Err(e) => {
            // Diagnostics print as file:line:col: kind: message; nothing
            // is partially emitted on error.
            eprintln!("{e}");
            error!("compilation of {file} failed");
            return ExitCode::from(EXIT_COMPILE_ERROR);
        }
    };

    match write_artifacts(&output_dir, &artifacts) {
        Ok(()) => {
            info!(
                "wrote {}, {} and {} to {}",
                artifacts.user_file_name(),
                artifacts.kernel_file_name(),
                artifacts.maps_header_file_name(),
                output_dir.display()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::from(EXIT_IO_ERROR)
        }
    }
}

fn write_artifacts(
    output_dir: &std::path::Path,
    artifacts: &kernelscript_compiler::Artifacts,
) -> Result<()> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;
    for (name, content) in [
        (artifacts.user_file_name(), &artifacts.user_c),
        (artifacts.kernel_file_name(), &artifacts.kernel_c),
        (artifacts.maps_header_file_name(), &artifacts.maps_header),
    ] {
        let path = output_dir.join(&name);
        std::fs::write(&path, content).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}
