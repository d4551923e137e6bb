use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::debug;
use log::info;
use log::warn;

use ldcheck::Collector;
use ldcheck::Config;
use ldcheck::Context;
use ldcheck::Data;
use ldcheck::Error;
use ldcheck::Pacman;
use ldcheck::Resolver;
use ldcheck::StringPool;
use ldcheck::WorkerPool;

mod logger;
mod report;

use self::logger::Logger;

const DEFAULT_CONFIG_FILE: &str = "/etc/ldcheck.conf";

/// Checks that every installed executable and shared library can resolve
/// all of its NEEDED libraries.
#[derive(clap::Parser)]
#[clap(version)]
struct Args {
    /// Suppress progress messages, output only errors.
    #[clap(short = 'q', long = "quiet")]
    quiet: bool,

    /// More output: -v shows warnings and executed commands, -vv is a huge
    /// but grep-friendly debug dump.
    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Don't download and analyze optional dependencies.
    #[clap(short = 'O', long = "no-optional-deps")]
    no_optional_deps: bool,

    /// No network: pretend optional dependencies are already downloaded,
    /// bypass `pacman -Sw` but otherwise process them as usual.
    #[clap(short = 'N', long = "no-network")]
    no_network: bool,

    /// Use the nested report layout instead of the wide table.
    #[clap(short = 'W', long = "narrow")]
    narrow: bool,

    /// Don't colorize the output.
    #[clap(short = 'C', long = "no-color")]
    no_color: bool,

    /// Configuration file (default: /etc/ldcheck.conf).
    #[clap(long = "config", value_name = "FILE")]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    match do_main() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        // A worker task failed; its message is already on stderr.
        Err(Error::Aborted) => ExitCode::from(2),
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(2)
        }
    }
}

fn do_main() -> Result<bool, Error> {
    let args = Args::parse();
    Logger::init(args.quiet, args.verbose)
        .map_err(|e| Error::Unsupported(format!("failed to install logger: {e}")))?;
    if args.no_color {
        colored::control::set_override(false);
    }
    // The package database stores paths without a leading separator; with
    // the root as current directory they work as relative paths too.
    std::env::set_current_dir("/")?;

    let names = StringPool::new();
    let mut config = Config::new(
        &names,
        std::env::var_os("LD_LIBRARY_PATH").as_deref(),
        !args.no_color,
    )?;
    if !config.more_libs.is_empty() {
        info!(
            "Using non-empty LD_LIBRARY_PATH = {}",
            config
                .more_libs
                .iter()
                .map(|sp| format!("`{}`", sp.path))
                .collect::<Vec<_>>()
                .join(" ")
        );
    }
    load_config_file(&names, &mut config, args.config.as_deref())?;

    let ctx = Context {
        names,
        pool: WorkerPool::new(0),
        config,
    };
    let mut data = Data::default();
    let pacman = Pacman::new(&ctx);

    // The configuration references packages, so packages load first.
    pacman.parse_installed(&mut data)?;
    pacman.check_config_references(&data);

    Collector::new(&ctx).execute(&mut data)?;
    let resolver = Resolver::new(&ctx);
    let mut consistent = resolver.execute(&mut data)?;

    if !consistent && !args.no_optional_deps {
        pacman.calculate_optional_deps(&mut data);
        if data.archives_by_opt_dep.is_empty() {
            debug!("no pending optional dependencies; nothing more to try");
        } else {
            pacman.download_optional_deps(&mut data, args.no_network)?;
            pacman.process_optional_deps(&mut data)?;
            consistent = resolver.execute(&mut data)?;
        }
    }

    if consistent {
        info!("All good. :)");
    } else {
        report::render(&resolver.report(&data), !args.narrow)?;
    }
    Ok(consistent)
}

fn load_config_file(
    names: &StringPool,
    config: &mut Config,
    explicit: Option<&Path>,
) -> Result<(), Error> {
    let path = explicit.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
    match fs_err::read_to_string(path) {
        Ok(contents) => {
            debug!("Reading config file: `{}`...", path.display());
            config.apply(names, &contents)
        }
        Err(ref e) if e.kind() == ErrorKind::NotFound && explicit.is_none() => {
            warn!(
                "Config file not found; expect false errors.\n      \
                 Please create {DEFAULT_CONFIG_FILE}."
            );
            Ok(())
        }
        Err(ref e) if e.kind() == ErrorKind::NotFound => {
            Err(Error::Missing(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}
