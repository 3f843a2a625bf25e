//! `modprobe`: load or unload a module (and its dependencies) by name or
//! alias.

use std::path::PathBuf;

use clap::Parser;
use kmodkit::config::{parse_scan, ConfigSet};
use kmodkit::index::IndexFile;
use kmodkit::modprobe::{insmod, rmmod, ModprobeContext, NixKernelOps};
use kmodkit::util::{MODPROBE_CONF_DIR, MODULE_PATH, SYSFS_PATH};
use tracing_subscriber::EnvFilter;

/// Add or remove kernel modules.
#[derive(Parser, Debug)]
#[command(name = "modprobe", version, about)]
struct Args {
    /// Module name or alias to load (or, with `-r`, unload).
    module: String,

    /// Extra `key=value` parameters to pass the module, e.g.
    /// `debug=1`.
    params: Vec<String>,

    /// Remove a module instead of inserting it.
    #[arg(short = 'r', long)]
    remove: bool,

    /// Do everything except actually load/unload the module.
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Kernel release whose module tree to use. Defaults to the running
    /// kernel.
    #[arg(short = 'S', long)]
    set_version: Option<String>,

    /// Increase log verbosity (`-v`, `-vv`).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let release = match &args.set_version {
        Some(r) => r.clone(),
        None => nix::sys::utsname::uname()?.release().to_string(),
    };
    let base_dir = PathBuf::from(MODULE_PATH).join(&release);

    let config: ConfigSet = parse_scan(&PathBuf::from(MODPROBE_CONF_DIR)).unwrap_or_default();
    let modules_dep = std::fs::read_to_string(base_dir.join("modules.dep")).unwrap_or_default();
    let sysfs_root = PathBuf::from(SYSFS_PATH);
    let ctx = ModprobeContext::from_modules_dep(&modules_dep, &config, &sysfs_root);

    let alias_bytes = std::fs::read(base_dir.join("modules.alias.bin")).unwrap_or_default();
    let alias_index = IndexFile::parse(&alias_bytes).ok();

    let cmdline_opts = args.params.join(" ");

    if args.remove {
        if args.dry_run {
            tracing::info!(module = %args.module, "dry run: would remove module");
            return Ok(());
        }
        rmmod(&NixKernelOps, &ctx, &args.module, true)?;
    } else {
        let targets = match &alias_index {
            Some(idx) => kmodkit::modprobe::action::resolve_alias(idx, &args.module),
            None => vec![args.module.clone()],
        };
        for target in targets {
            if args.dry_run {
                tracing::info!(module = %target, "dry run: would insert module");
                continue;
            }
            insmod(&NixKernelOps, &ctx, &target, &cmdline_opts, true)?;
        }
    }

    Ok(())
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
}
