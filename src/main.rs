// this_file: src/main.rs
//! fcdircache CLI - inspect and maintain font directory caches

use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use fcdircache::{basename, legacy_basename, logging, CacheConfig, FontDirCache, Registry};
use log::{debug, error};
use serde_json::json;

/// fcdircache - font directory cache maintenance tool
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, global = true, default_value = "info")]
    log_level: String,

    /// Enable quiet mode (only errors)
    #[arg(short = 'q', long, global = true, conflicts_with = "log_level")]
    quiet: bool,

    /// JSON configuration file
    #[arg(short = 'c', long, global = true)]
    config: Option<Utf8PathBuf>,

    /// Cache directory to search (repeatable, searched in order)
    #[arg(short = 'd', long = "cache-dir", global = true)]
    cache_dirs: Vec<Utf8PathBuf>,

    /// Prefix applied to every path used for filesystem access
    #[arg(short = 'r', long, global = true)]
    sysroot: Option<Utf8PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the cache file names of a font directory
    Basename {
        /// Font directory
        dir: Utf8PathBuf,
    },

    /// Print the contents of cache files
    Cat {
        /// Cache files to print
        #[arg(required = true)]
        files: Vec<Utf8PathBuf>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Remove invalid and orphaned cache files
    Clean {
        /// List every removed file
        #[arg(short, long)]
        verbose: bool,
    },

    /// Remove the cache files of a font directory
    Unlink {
        /// Font directory
        dir: Utf8PathBuf,
    },

    /// Check whether a font directory has a current cache
    Valid {
        /// Font directory
        dir: Utf8PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.quiet { "error".to_string() } else { cli.log_level.clone() };
    logging::init_logging(&log_level, cli.quiet, false);

    let config = build_config(&cli)?;
    debug!("Using cache directories: {:?}", config.cache_dirs);

    match cli.command {
        Commands::Basename { dir } => {
            println!("{}", basename(&config, &dir).file_name());
            if let Some(legacy) = legacy_basename(&config, &dir) {
                println!("{}", legacy.file_name());
            }
        }
        Commands::Cat { files, json } => {
            cat(&files, json)?;
        }
        Commands::Clean { verbose } => {
            config.validate()?;
            let reports = FontDirCache::new(config).clean(verbose)?;
            for report in reports {
                if verbose {
                    for path in &report.removed {
                        println!("removed {}", path);
                    }
                }
                if !report.skipped {
                    println!(
                        "{}: {} of {} cache files removed",
                        report.cache_dir,
                        report.removed.len(),
                        report.scanned
                    );
                }
            }
        }
        Commands::Unlink { dir } => {
            config.validate()?;
            if FontDirCache::new(config).dir_unlink(&dir)? {
                println!("removed caches for {}", dir);
            } else {
                println!("no caches for {}", dir);
            }
        }
        Commands::Valid { dir } => {
            config.validate()?;
            if FontDirCache::new(config).dir_valid(&dir) {
                println!("{}: valid", dir);
            } else {
                println!("{}: invalid", dir);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Merge the configuration file with command-line overrides.
fn build_config(cli: &Cli) -> Result<CacheConfig> {
    let mut config = match &cli.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("cannot load configuration {}", path))?,
        None => CacheConfig::new(),
    };
    config.cache_dirs.extend(cli.cache_dirs.iter().cloned());
    if let Some(sysroot) = &cli.sysroot {
        config.sysroot = Some(sysroot.clone());
    }
    Ok(config)
}

/// Print cache files, stale or not.
fn cat(files: &[Utf8PathBuf], as_json: bool) -> Result<()> {
    let registry = Registry::new();
    let mut failed = 0;
    for path in files {
        let cache = match fcdircache::loader::inspect_file(&registry, path) {
            Ok(cache) => cache,
            Err(e) => {
                error!("{}: {}", path, e);
                failed += 1;
                continue;
            }
        };
        let font_set = cache.font_set()?;
        if as_json {
            let doc = json!({
                "file": path,
                "dir": cache.dir(),
                "checksum": [cache.checksum(), cache.checksum_nano()],
                "subdirs": cache.subdirs(),
                "fonts": font_set,
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        } else {
            println!("# {}: {}", path, cache.dir());
            for subdir in cache.subdirs() {
                println!("\"{}\"", subdir);
            }
            for pattern in font_set.iter() {
                println!("{}", pattern);
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} cache files could not be read", failed, files.len());
    }
    Ok(())
}
