//! `depmod`: scan a kernel module tree and (re)generate its dependency,
//! alias, and symbol index files.

use std::path::PathBuf;

use clap::Parser;
use kmodkit::config::parse_scan;
use kmodkit::depmod::{run_depmod, DepmodRun};
use kmodkit::util::{DEPMOD_CONF_DIR, MODULE_PATH};
use tracing_subscriber::EnvFilter;

/// Generate modules.dep and map files for a kernel module tree.
#[derive(Parser, Debug)]
#[command(name = "depmod", version, about)]
struct Args {
    /// Kernel release to scan, e.g. `6.1.0-generic`. Defaults to the
    /// running kernel.
    kernel_release: Option<String>,

    /// Scan all kernel releases found under the module tree, ignoring
    /// `kernel_release`.
    #[arg(short = 'a', long)]
    all: bool,

    /// Root of the module tree (normally `/lib/modules`).
    #[arg(short = 'b', long, default_value = MODULE_PATH)]
    basedir: PathBuf,

    /// Path to a `System.map` file for the target kernel; undefined
    /// symbols resolved against it are attributed to the kernel.
    #[arg(short = 'F', long)]
    system_map: Option<PathBuf>,

    /// Don't write any output files; just check for errors (unresolved
    /// symbols, dependency cycles).
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Increase log verbosity (`-v`, `-vv`).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let releases = if args.all {
        list_releases(&args.basedir)?
    } else {
        let release = match &args.kernel_release {
            Some(r) => r.clone(),
            None => nix::sys::utsname::uname()?.release().to_string(),
        };
        vec![release]
    };

    for release in releases {
        let base_dir = args.basedir.join(&release);
        let config = parse_scan(&std::path::PathBuf::from(DEPMOD_CONF_DIR)).unwrap_or_default();
        let system_map = match &args.system_map {
            Some(path) => Some(std::fs::read_to_string(path)?),
            None => std::fs::read_to_string(base_dir.join("System.map")).ok(),
        };

        let run = DepmodRun {
            base_dir: base_dir.clone(),
            kernel_release: release.clone(),
            config,
            system_map,
        };

        if args.dry_run {
            kmodkit::depmod::resolve(&run)?;
            tracing::info!(kernel = %release, "dry run: no errors found");
        } else {
            run_depmod(&run)?;
            tracing::info!(kernel = %release, "wrote module index files");
        }
    }

    Ok(())
}

fn list_releases(basedir: &std::path::Path) -> std::io::Result<Vec<String>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(basedir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(out)
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
