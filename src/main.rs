//! Chaff VFS - deniable, encrypted file storage in a shared block pool.
//!
//! One operation per invocation: mount the branches named by the
//! passphrases, run the command, unmount.

use anyhow::{bail, Context, Result};
use chaff_vfs::config::VfsConfig;
use chaff_vfs::storage::{FileDevice, RandomSource};
use chaff_vfs::vfs::{split_passphrases, ChaffVfs};
use chaff_vfs::Error;
use clap::{Parser, Subcommand};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use zeroize::Zeroizing;

/// Bytes of each chain block shown by `chain`.
const PREVIEW_BYTES: usize = 32;

#[derive(Parser)]
#[command(name = "chaff-vfs")]
#[command(author, version, long_about = None)]
#[command(
    about = "Deniable encrypted file system in a pool of random blocks",
    long_about = "Files live in randomly placed, encrypted blocks of a backing file that is \
                  otherwise filled with random data. Each passphrase opens its own branch; \
                  without the passphrase a branch cannot be told apart from free space."
)]
struct Cli {
    /// JSON configuration file; CHAFF_* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a backing file filled with random data
    Init {
        /// Backing file to create
        image: PathBuf,

        /// Number of blocks in the pool
        #[arg(long)]
        blocks: u32,
    },

    /// List directory contents
    Ls {
        /// Backing file
        image: PathBuf,

        /// VFS path to list (default: /)
        #[arg(default_value = "/")]
        vfs_path: String,
    },

    /// Write a file, replacing its content
    Write {
        /// Backing file
        image: PathBuf,

        /// VFS path of the file
        vfs_path: String,

        /// Input file to write
        #[arg(long, conflicts_with = "data")]
        input: Option<PathBuf>,

        /// String data to write
        #[arg(long, conflicts_with = "input")]
        data: Option<String>,
    },

    /// Read a file
    Read {
        /// Backing file
        image: PathBuf,

        /// VFS path to read
        vfs_path: String,

        /// Output file (default: stdout)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Delete a file
    Rm {
        /// Backing file
        image: PathBuf,

        /// VFS path to delete
        vfs_path: String,
    },

    /// Create a directory
    Mkdir {
        /// Backing file
        image: PathBuf,

        /// VFS path for the new directory
        vfs_path: String,
    },

    /// Remove an empty directory
    Rmdir {
        /// Backing file
        image: PathBuf,

        /// VFS path of the directory
        vfs_path: String,
    },

    /// Rename a file or directory
    Mv {
        /// Backing file
        image: PathBuf,

        from: String,

        to: String,
    },

    /// Set the length of a file
    Truncate {
        /// Backing file
        image: PathBuf,

        vfs_path: String,

        length: u64,
    },

    /// Show pool usage and branch contents
    Info {
        /// Backing file
        image: PathBuf,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Walk the directory chain of the active branch
    Chain {
        /// Backing file
        image: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing(level: &str) {
    let level: tracing::Level = level.parse().unwrap_or(tracing::Level::WARN);
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(io::stderr)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(stderr_layer).init();
}

fn load_config(path: Option<&Path>) -> Result<VfsConfig> {
    let mut config = match path {
        Some(path) => VfsConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => VfsConfig::default(),
    };
    config.apply_env().context("reading CHAFF_* environment")?;
    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init { image, blocks } => cmd_init(&image, blocks, &config),

        Commands::Ls { image, vfs_path } => {
            let vfs = mount(&image, config)?;
            cmd_ls(&vfs, &vfs_path)?;
            unmount(vfs)
        }

        Commands::Write {
            image,
            vfs_path,
            input,
            data,
        } => {
            let content = match (input, data) {
                (Some(path), _) => std::fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, Some(s)) => s.into_bytes(),
                (None, None) => {
                    let mut buffer = Vec::new();
                    io::stdin().read_to_end(&mut buffer)?;
                    buffer
                }
            };
            let mut vfs = mount(&image, config)?;
            cmd_write(&mut vfs, &vfs_path, &content)?;
            unmount(vfs)
        }

        Commands::Read {
            image,
            vfs_path,
            output,
        } => {
            let vfs = mount(&image, config)?;
            cmd_read(&vfs, &vfs_path, output.as_deref())?;
            unmount(vfs)
        }

        Commands::Rm { image, vfs_path } => {
            let mut vfs = mount(&image, config)?;
            vfs.remove_file(&vfs_path)?;
            println!("Deleted {}", vfs_path);
            unmount(vfs)
        }

        Commands::Mkdir { image, vfs_path } => {
            let mut vfs = mount(&image, config)?;
            vfs.create_dir(&vfs_path)?;
            println!("Created directory {}", vfs_path);
            unmount(vfs)
        }

        Commands::Rmdir { image, vfs_path } => {
            let mut vfs = mount(&image, config)?;
            vfs.remove_dir(&vfs_path)?;
            println!("Removed directory {}", vfs_path);
            unmount(vfs)
        }

        Commands::Mv { image, from, to } => {
            let mut vfs = mount(&image, config)?;
            vfs.rename(&from, &to)?;
            println!("Renamed {} to {}", from, to);
            unmount(vfs)
        }

        Commands::Truncate {
            image,
            vfs_path,
            length,
        } => {
            let mut vfs = mount(&image, config)?;
            vfs.truncate(&vfs_path, length)?;
            println!("Truncated {} to {} bytes", vfs_path, length);
            unmount(vfs)
        }

        Commands::Info { image, json } => {
            let vfs = mount(&image, config)?;
            cmd_info(&vfs, json)?;
            unmount(vfs)
        }

        Commands::Chain { image } => {
            let vfs = mount(&image, config)?;
            cmd_chain(&vfs)?;
            unmount(vfs)
        }
    }
}

/// Passphrases are wiped from memory when dropped.
fn prompt_passphrases() -> Result<Vec<Zeroizing<String>>> {
    let prompt = "Passphrases (comma separated, active branch last): ";
    let line = rpassword::prompt_password(prompt).or_else(|_| -> io::Result<String> {
        eprint!("{}", prompt);
        io::stderr().flush()?;
        let mut line = Zeroizing::new(String::new());
        io::stdin().read_line(&mut line)?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    })?;
    let line = Zeroizing::new(line);

    let passphrases = split_passphrases(&line);
    if passphrases.is_empty() {
        bail!("no passphrase given");
    }
    Ok(passphrases)
}

fn mount(image: &Path, config: VfsConfig) -> Result<ChaffVfs<FileDevice>> {
    let passphrases = prompt_passphrases()?;
    let passphrases: Vec<&str> = passphrases.iter().map(|p| p.as_str()).collect();
    let vfs = ChaffVfs::open(image, config, &passphrases)
        .with_context(|| format!("mounting {}", image.display()))?;
    if vfs.report().fell_back_to_empty {
        eprintln!("Warning: no directory found for this passphrase; starting a new branch");
    }
    Ok(vfs)
}

fn unmount(vfs: ChaffVfs<FileDevice>) -> Result<()> {
    vfs.unmount().context("writing the directory")?;
    Ok(())
}

fn cmd_init(image: &Path, blocks: u32, config: &VfsConfig) -> Result<()> {
    if blocks == 0 {
        bail!("the pool needs at least one block");
    }
    let len = u64::from(blocks) * u64::from(config.block_size);
    let mut rng = RandomSource::from_config(config)?;
    FileDevice::create_random(image, len, &mut rng)
        .with_context(|| format!("creating {}", image.display()))?;

    println!("Block pool initialized successfully!");
    println!("  Blocks:      {}", blocks);
    println!("  Block size:  {} bytes", config.block_size);
    println!("  Total size:  {} bytes", len);
    println!("Mount it with a passphrase to create a branch.");

    Ok(())
}

fn cmd_ls(vfs: &ChaffVfs<FileDevice>, vfs_path: &str) -> Result<()> {
    let entries = vfs.list_dir(vfs_path)?;

    if entries.is_empty() {
        println!("(empty)");
    } else {
        for entry in entries {
            let type_char = if entry.is_dir { 'd' } else { '-' };
            let size = if entry.is_dir {
                "-".to_string()
            } else {
                format!("{}", entry.size)
            };
            println!("{} {:>10}  {}", type_char, size, entry.name);
        }
    }

    Ok(())
}

fn cmd_write(vfs: &mut ChaffVfs<FileDevice>, vfs_path: &str, content: &[u8]) -> Result<()> {
    match vfs.create_file(vfs_path) {
        Ok(()) => {}
        Err(Error::AlreadyExists(_)) => vfs.truncate(vfs_path, 0)?,
        Err(e) => return Err(e.into()),
    }
    vfs.write(vfs_path, 0, content)?;
    println!("Wrote {} bytes to {}", content.len(), vfs_path);
    Ok(())
}

fn cmd_read(vfs: &ChaffVfs<FileDevice>, vfs_path: &str, output: Option<&Path>) -> Result<()> {
    let size = vfs.stat(vfs_path)?.size;
    let size = usize::try_from(size).context("file does not fit in memory")?;
    let data = vfs.read(vfs_path, 0, size)?;

    match output {
        Some(path) => {
            std::fs::write(path, &data)?;
            println!("Wrote {} bytes to {}", data.len(), path.display());
        }
        None => {
            io::stdout().write_all(&data)?;
        }
    }

    Ok(())
}

fn cmd_info(vfs: &ChaffVfs<FileDevice>, json: bool) -> Result<()> {
    let info = vfs.info();

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("Chaff VFS Information");
    println!("=====================");
    println!("Block size:       {} bytes", info.block_size);
    println!("Start block:      {}", vfs.start_block());
    println!();
    println!("Pool:");
    println!("  Blocks:         {}", info.block_count);
    println!("  Used:           {}", info.used_blocks);
    println!("  Reserved:       {}", info.reserved_blocks);
    println!("  Free:           {}", info.free_blocks);
    println!("  Directory:      {} blocks", info.chain_blocks);
    println!();
    println!("Contents:");
    println!("  Directories:    {}", info.dir_count);
    println!("  Files:          {}", info.file_count);
    println!("  Total size:     {} bytes", info.total_file_size);
    if info.read_only {
        println!();
        println!("Volume is read-only");
    }
    if info.faults > 0 {
        println!("Integrity faults: {}", info.faults);
    }

    Ok(())
}

fn cmd_chain(vfs: &ChaffVfs<FileDevice>) -> Result<()> {
    let walk = vfs
        .walk_chain()
        .context("this branch has no directory on disk yet")?;

    for &block in &walk.blocks {
        let raw = vfs.raw_block(block)?;
        let preview = &raw[..PREVIEW_BYTES.min(raw.len())];
        println!("block {:>8}  {}", block, hex::encode(preview));

        for record in walk.records.iter().filter(|r| r.block == block) {
            let refs: Vec<String> = record.refs.iter().map(|r| r.index.to_string()).collect();
            println!(
                "  @{:<5} {} len={} from={} blocks=[{}] next=({}, {})",
                record.offset,
                String::from_utf8_lossy(&record.path),
                record.length,
                record.list_offset,
                refs.join(" "),
                record.next_block,
                record.next_offset
            );
        }
    }

    Ok(())
}
