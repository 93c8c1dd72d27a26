use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kernelscript")]
#[command(about = "Compile KernelScript sources into eBPF and user-space C")]
#[command(version = "0.1.0")]
pub struct Args {
    /// KernelScript source file (.ks)
    pub input: PathBuf,

    /// Directory for the generated C files (default: alongside the input)
    #[arg(long, short = 'o', value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Root of the bpf filesystem used for pinned maps
    #[arg(long, value_name = "PATH", default_value = "/sys/fs/bpf")]
    pub pin_root: String,

    /// Save a dump of the parsed AST next to the outputs
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub emit_ast: bool,

    /// Log file path (default: stderr only)
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}
