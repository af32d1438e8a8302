//! polyfs command-line front end.
//!
//! Usage:
//!   polyfs ls nfs://filer/exports/home --sort size
//!   polyfs cat iso:///srv/images/disc.iso/README.TXT
//!   polyfs cp ./disk.img 'ovirt://admin%40internal@engine;size=10737418240/data/disk.img'
//!   polyfs caps docker://quay.io/org/app:1.2
//!
//! Logging goes to stderr; set `RUST_LOG=polyfs_core=debug` for detail.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use polyfs_core::ordering::SortCriterion;
use polyfs_core::stream::{TokioWriter, WriteStream, copy_stream};
use polyfs_core::{Address, FileHandle, FileRef, FsError, Vfs, VfsConfig, ops};
use polyfs_types::{Credentials, UNKNOWN_SIZE};
use tracing_subscriber::{EnvFilter, fmt};

/// Browse and move files across local, NFS, ISO, registry and oVirt storage.
#[derive(Parser, Debug)]
#[command(name = "polyfs")]
#[command(about = "Uniform file operations over heterogeneous storage")]
struct Args {
    /// Config file (default: ~/.config/polyfs/config.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Credentials as LOGIN[:PASSWORD] for addresses that carry none
    #[arg(long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory
    Ls {
        address: String,
        /// name, size, date, extension, permissions, owner or group
        #[arg(long, default_value = "name")]
        sort: SortCriterion,
        #[arg(short, long)]
        reverse: bool,
        /// Interleave directories with files
        #[arg(long)]
        mixed: bool,
        /// Long format: kind, size, date, name
        #[arg(short, long)]
        long: bool,
    },
    /// Show attributes
    Stat {
        address: String,
        #[arg(long)]
        json: bool,
    },
    /// Show supported operations
    Caps { address: String },
    /// Write a file to stdout
    Cat { address: String },
    /// Copy a file or tree
    Cp { source: String, target: String },
    /// Move a file or tree
    Mv { source: String, target: String },
    /// Delete a file or, with -r, a tree
    Rm {
        address: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Create a directory
    Mkdir { address: String },
    /// Free and total space
    Df { address: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("polyfs: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config_path: Option<PathBuf> = args
        .config
        .as_deref()
        .map(|p| shellexpand::tilde(p).as_ref().into());
    let config = VfsConfig::load_or_default(config_path.as_deref())?;
    let vfs = Vfs::with_default_backends(config);
    let cli = Cli {
        vfs,
        user: args.user.as_deref().map(parse_user),
    };

    let result = cli.dispatch(args.command).await;
    cli.vfs.close_all().await;
    result
}

fn parse_user(spec: &str) -> Credentials {
    match spec.split_once(':') {
        Some((login, password)) => Credentials::new(login, Some(password.to_string())),
        None => Credentials::new(spec, None),
    }
}

struct Cli {
    vfs: Vfs,
    user: Option<Credentials>,
}

impl Cli {
    fn resolve(&self, input: &str) -> Result<FileRef> {
        let address = Address::parse(input)?;
        if let Some(user) = &self.user {
            if address.credentials().is_none() {
                self.vfs.credentials().store(&address.root(), user.clone());
            }
        }
        Ok(self.vfs.resolve(&address)?)
    }

    async fn dispatch(&self, command: Command) -> Result<()> {
        match command {
            Command::Ls {
                address,
                sort,
                reverse,
                mixed,
                long,
            } => self.ls(&address, sort, !reverse, mixed, long).await,
            Command::Stat { address, json } => self.stat(&address, json).await,
            Command::Caps { address } => {
                let handle = self.resolve(&address)?;
                for capability in handle.capabilities().iter() {
                    println!("{capability}");
                }
                Ok(())
            }
            Command::Cat { address } => self.cat(&address).await,
            Command::Cp { source, target } => {
                let (source, target) = (self.resolve(&source)?, self.resolve(&target)?);
                let stats = ops::copy_file(&source, &target).await?;
                tracing::info!(?stats, "copied");
                Ok(())
            }
            Command::Mv { source, target } => {
                let (source, target) = (self.resolve(&source)?, self.resolve(&target)?);
                Ok(ops::move_file(&source, &target).await?)
            }
            Command::Rm { address, recursive } => {
                let handle = self.resolve(&address)?;
                handle.refresh().await?;
                if recursive {
                    ops::delete_tree(&handle).await?;
                } else {
                    handle.delete().await?;
                }
                Ok(())
            }
            Command::Mkdir { address } => Ok(self.resolve(&address)?.mkdir().await?),
            Command::Df { address } => {
                let handle = self.resolve(&address)?;
                println!("free  {}", handle.free_space().await?);
                println!("total {}", handle.total_space().await?);
                Ok(())
            }
        }
    }

    async fn ls(
        &self,
        address: &str,
        sort: SortCriterion,
        ascending: bool,
        mixed: bool,
        long: bool,
    ) -> Result<()> {
        let dir = self.resolve(address)?;
        let mut children = dir
            .list()
            .await
            .with_context(|| format!("listing {}", dir.address()))?;
        let mut config = self.vfs.config().ordering.clone();
        config.directories_first &= !mixed;
        polyfs_core::FileComparator::from_config(sort, ascending, &config)?.sort(&mut children);

        for child in &children {
            if long {
                println!(
                    "{} {:>12} {:<19} {}",
                    kind_char(child.as_ref()),
                    size_column(child.size()),
                    date_column(child.modified()),
                    child.name()
                );
            } else {
                println!("{}", child.name());
            }
        }
        Ok(())
    }

    async fn stat(&self, address: &str, json: bool) -> Result<()> {
        let handle = self.resolve(address)?;
        let attr = handle.refresh().await?;
        if !attr.exists {
            return Err(FsError::not_found(handle.address().to_string()).into());
        }
        if json {
            println!("{}", serde_json::to_string_pretty(&attr)?);
            return Ok(());
        }
        println!("address  {}", handle.address());
        println!("kind     {:?}", attr.kind);
        println!("size     {}", size_column(attr.size));
        println!("modified {}", date_column(attr.modified));
        if let Some(mode) = attr.permissions {
            println!("mode     {mode:o}");
        }
        if let (Some(owner), Some(group)) = (&attr.owner, &attr.group) {
            println!("owner    {owner}:{group}");
        }
        Ok(())
    }

    async fn cat(&self, address: &str) -> Result<()> {
        let handle = self.resolve(address)?;
        let mut input = handle.input_stream().await?;
        let mut stdout = TokioWriter::new(tokio::io::stdout());
        copy_stream(input.as_mut(), &mut stdout).await?;
        stdout.close().await?;
        Ok(())
    }
}

fn kind_char(handle: &dyn FileHandle) -> char {
    if handle.is_directory() {
        'd'
    } else if handle.is_symlink() {
        'l'
    } else {
        '-'
    }
}

fn size_column(size: i64) -> String {
    if size == UNKNOWN_SIZE {
        "?".to_string()
    } else {
        size.to_string()
    }
}

fn date_column(modified: Option<SystemTime>) -> String {
    match modified {
        Some(time) => DateTime::<Local>::from(time)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => "-".to_string(),
    }
}
