//! unionctl - Operate on a union of local directories
//!
//! Usage:
//!   unionctl -b upper=rw -b lower=ro ls [dir]    - Merged listing
//!   unionctl -b upper=rw -b lower=ro touch <path> - Create a file
//!   unionctl -b upper=rw -b lower=ro rm <path>    - Remove (whiteout if needed)
//!   unionctl init <branch>...                      - Write a configuration file

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use unionfs::{
    branch::CreatePolicy,
    config::{BranchConfig, Config},
    entry::Dentry,
    Union,
};

#[derive(Parser)]
#[command(name = "unionctl")]
#[command(author = "unionfs Contributors")]
#[command(version)]
#[command(about = "Union of directory branches with whiteouts and copy-up")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Branch as `path=rw` or `path=ro`, highest priority first; overrides
    /// the configuration file
    #[arg(short, long = "branch")]
    branches: Vec<BranchConfig>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file for the given branches
    Init {
        /// Branches as `path=rw` or `path=ro`
        #[arg(required = true)]
        branches: Vec<BranchConfig>,

        /// Create policy (tdp, rr, mfs, mfsrr, pmfs)
        #[arg(long)]
        policy: Option<CreatePolicy>,
    },

    /// Show the branch table
    Status,

    /// List a directory of the merged namespace
    Ls {
        #[arg(default_value = "")]
        dir: PathBuf,
    },

    /// Create an empty regular file
    Touch {
        path: PathBuf,
        #[arg(long, default_value_t = 0o644)]
        mode: u32,
    },

    /// Create a directory
    Mkdir {
        path: PathBuf,
        #[arg(long, default_value_t = 0o755)]
        mode: u32,
    },

    /// Create a symbolic link
    Symlink { target: PathBuf, path: PathBuf },

    /// Create a hard link
    Link { existing: PathBuf, path: PathBuf },

    /// Remove a non-directory entry
    Rm { path: PathBuf },

    /// Remove an empty directory
    Rmdir { path: PathBuf },

    /// Copy an entry up to a writable branch
    CopyUp {
        path: PathBuf,
        /// Target branch index
        #[arg(long)]
        branch: Option<usize>,
    },
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);

    if let Commands::Init { branches, policy } = &cli.command {
        return cmd_init(&config_path, branches, policy.clone());
    }

    let config = if cli.branches.is_empty() {
        Config::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        let mut config = Config {
            branches: cli.branches.clone(),
            ..Default::default()
        };
        config.apply_env_overrides()?;
        config
    };
    let union = Union::from_config(&config)?;

    let result = match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::Status => cmd_status(&union),
        Commands::Ls { dir } => cmd_ls(&union, &dir),
        Commands::Touch { path, mode } => {
            let (parent, name) = split(&union, &path)?;
            union.create(&parent, name.as_os_str(), mode)?;
            Ok(())
        }
        Commands::Mkdir { path, mode } => {
            let (parent, name) = split(&union, &path)?;
            union.mkdir(&parent, name.as_os_str(), mode)?;
            Ok(())
        }
        Commands::Symlink { target, path } => {
            let (parent, name) = split(&union, &path)?;
            union.symlink(&parent, name.as_os_str(), &target)?;
            Ok(())
        }
        Commands::Link { existing, path } => {
            let source = union.lookup_path(&existing)?;
            let (parent, name) = split(&union, &path)?;
            union.link(&source, &parent, name.as_os_str())?;
            Ok(())
        }
        Commands::Rm { path } => {
            let (parent, name) = split(&union, &path)?;
            union.unlink(&parent, name.as_os_str())?;
            Ok(())
        }
        Commands::Rmdir { path } => {
            let (parent, name) = split(&union, &path)?;
            union.rmdir(&parent, name.as_os_str())?;
            Ok(())
        }
        Commands::CopyUp { path, branch } => {
            let entry = union.lookup_path(&path)?;
            let index = union.copy_up(&entry, branch)?;
            info!("{} is now on branch {}", path.display(), index);
            Ok(())
        }
    };

    let leftover = union.unmount();
    if leftover > 0 {
        info!("{} pseudo-links left unconsolidated", leftover);
    }
    result
}

/// Resolve the parent of `path` and return it with the final name
fn split(union: &Union, path: &Path) -> anyhow::Result<(Arc<Dentry>, PathBuf)> {
    let Some(name) = path.file_name() else {
        bail!("{} has no final component", path.display());
    };
    let parent = union.lookup_path(path.parent().unwrap_or(Path::new("")))?;
    Ok((parent, PathBuf::from(name)))
}

fn cmd_init(
    config_path: &Path,
    branches: &[BranchConfig],
    policy: Option<CreatePolicy>,
) -> anyhow::Result<()> {
    info!("Initializing union configuration...");

    let mut config = Config {
        branches: branches.to_vec(),
        ..Default::default()
    };
    if let Some(policy) = policy {
        config.create_policy = policy;
    }
    config.validate()?;
    config.save(config_path)?;

    info!("Configuration saved to {:?}", config_path);
    Ok(())
}

fn cmd_status(union: &Union) -> anyhow::Result<()> {
    let table = union.branches();

    println!("Union Status");
    println!("============");
    println!();
    println!("Generation: {}", union.generation());
    println!("Create policy: {}", union.options().create_policy);
    println!("Pseudo-links: {}", if union.options().plink { "enabled" } else { "disabled" });
    println!();
    for (index, branch) in table.iter().enumerate() {
        println!(
            "{:>3}  {:<4} id={:<4} {}",
            index,
            branch.perm(),
            branch.id(),
            branch.fs().label()
        );
    }
    Ok(())
}

fn cmd_ls(union: &Union, dir: &Path) -> anyhow::Result<()> {
    let entry = union.lookup_path(dir)?;
    for item in union.readdir(&entry)? {
        let marker = if item.kind.is_dir() { "/" } else { "" };
        println!("{}{}", item.name.to_string_lossy(), marker);
    }
    Ok(())
}
