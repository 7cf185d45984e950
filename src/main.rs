use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uf2fs::compose::{ComposeOptions, DEFAULT_FS_SIZE, DEFAULT_FS_START, ERASE_BLOCK_SIZE};
use uf2fs::filesystem::{Erased, FilesystemSource, RawImage};
use uf2fs::image::{build_filesystem, pack_filesystem, write_atomic, Image};
use uf2fs::{Family, MagicCheck, ScanOptions};

#[derive(Parser)]
#[command(name = "uf2fs", about = "Put a flash filesystem into a UF2 firmware image")]
struct Cli {
    /// Repeat for more detail (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Accept blocks with bad magic numbers, logging a warning for each
    #[arg(long, global = true)]
    lenient: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append a filesystem image to every firmware section of a UF2 file
    Append {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        fs: FsArgs,
        /// Erase block size in bytes
        #[arg(long, value_parser = parse_size, default_value_t = ERASE_BLOCK_SIZE)]
        block_size: usize,
        /// Emit firmware and filesystem as two erase-aligned ranges instead of padding
        #[arg(long)]
        sparse: bool,
        /// Replace a filesystem that is already present
        #[arg(long)]
        overwrite: bool,
        /// Skip the check against the firmware's declared binary end
        #[arg(long)]
        no_verify_end: bool,
    },
    /// Wrap a filesystem image in a UF2 file of its own
    Pack {
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        fs: FsArgs,
        /// rp2040, rp2350, or a hex family tag
        #[arg(long, default_value = "rp2040")]
        family: String,
    },
    /// Show sections and firmware metadata of a UF2 file
    Info {
        input: PathBuf,
        #[arg(long)]
        json: bool,
        /// Exit with an error if a declared block device overlaps the program
        #[arg(long)]
        verify: bool,
    },
}

#[derive(Args)]
struct FsArgs {
    /// Pre-built filesystem image; must be exactly --fs-size bytes
    #[arg(short, long, required_unless_present = "erase", conflicts_with = "erase")]
    fs_image: Option<PathBuf>,
    /// Write an erased (all 0xFF) region instead of an image
    #[arg(long)]
    erase: bool,
    /// Flash address of the filesystem
    #[arg(long, value_parser = parse_u32, default_value_t = DEFAULT_FS_START)]
    fs_start: u32,
    /// Filesystem size in bytes (K/M suffixes accepted)
    #[arg(long, value_parser = parse_size, default_value_t = DEFAULT_FS_SIZE)]
    fs_size: usize,
}

impl FsArgs {
    fn source(&self) -> Box<dyn FilesystemSource> {
        match &self.fs_image {
            Some(path) => Box::new(RawImage::new(path)),
            None       => Box::new(Erased),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let magic_check = if cli.lenient { MagicCheck::Lenient } else { MagicCheck::Strict };

    match cli.command {

        // ── Append ───────────────────────────────────────────────────────────
        Commands::Append { input, output, fs, block_size, sparse, overwrite, no_verify_end } => {
            let opts = ComposeOptions {
                fs_start: fs.fs_start,
                fs_size: fs.fs_size,
                erase_block_size: block_size,
                sparse,
                overwrite,
                magic_check,
                verify_binary_end: !no_verify_end,
            };
            let fs_data = build_filesystem(fs.source().as_ref(), &opts)?;
            let image = Image::open(&input)?;
            let out = image.append_filesystem(&fs_data, &opts)?;
            write_atomic(&output, &out)?;
            println!("Created: {} ({} blocks)", output.display(), out.len() / uf2fs::block::BLOCK_SIZE);
        }

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { output, fs, family } => {
            let family = Family::from_name(&family)
                .ok_or_else(|| format!("Unknown family '{family}'"))?;
            let opts = ComposeOptions {
                fs_start: fs.fs_start,
                fs_size: fs.fs_size,
                magic_check,
                ..ComposeOptions::default()
            };
            let fs_data = build_filesystem(fs.source().as_ref(), &opts)?;
            let out = pack_filesystem(&fs_data, family, &opts)?;
            write_atomic(&output, &out)?;
            println!("Created: {} ({family})", output.display());
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, json, verify } => {
            let scan = ScanOptions { magic_check };
            let image = Image::open(&input)?;
            let sections = image.summaries(&scan)?;
            let info = image.binary_info(&scan)?;

            if json {
                let report = serde_json::json!({ "sections": sections, "binary_info": info });
                println!("{}", serde_json::to_string_pretty(&report)?);
                if verify {
                    image.verify(&scan)?;
                }
                return Ok(());
            }

            println!("── UF2 Image ────────────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  Size           {} B", image.bytes().len());
            println!("  Sections       {}", sections.len());
            for s in &sections {
                println!("  [{}] {:#010x}..{:#010x}  {:<14} ranges={} blocks={}  {}",
                    s.index, s.base_address, s.end_address, s.family,
                    s.ranges, s.blocks, &s.digest[..12]);
            }
            if let Some(info) = info {
                println!("── Binary Info ──────────────────────────────────────────");
                let fields = [
                    ("Program", &info.program_name),
                    ("Version", &info.program_version),
                    ("Built", &info.build_date),
                    ("SDK", &info.sdk_version),
                    ("Board", &info.pico_board),
                ];
                for (label, value) in fields {
                    if let Some(v) = value {
                        println!("  {label:<14} {v}");
                    }
                }
                if let Some(end) = info.binary_end {
                    println!("  Binary end     {end:#010x}");
                }
                for dev in &info.block_devices {
                    println!("  Block device   {} {:#010x}..{:#010x} flags={:#06x}",
                        dev.name, dev.address, dev.end(), dev.flags);
                }
                for (gpio, pin) in &info.pins {
                    println!("  GPIO {gpio:<9} {:<6} {}",
                        pin.function.unwrap_or("-"), pin.name.as_deref().unwrap_or(""));
                }
                for group in &info.named_groups {
                    println!("  Group          {} id={:#010x} entries={}", group.label, group.id, group.data.len());
                }
                if !verify {
                    for dev in info.overlapping_block_devices() {
                        eprintln!("warning: block device '{}' starts inside the program image", dev.name);
                    }
                }
            }
            if verify {
                image.verify(&scan)?;
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "uf2fs=warn",
        1 => "uf2fs=info",
        _ => "uf2fs=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None      => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid number '{s}': {e}"))
}

fn parse_size(s: &str) -> Result<usize, String> {
    let (digits, scale) = match s.chars().last() {
        Some('k' | 'K') => (&s[..s.len() - 1], 1024),
        Some('m' | 'M') => (&s[..s.len() - 1], 1024 * 1024),
        _               => (s, 1),
    };
    let n = parse_u32(digits)? as usize;
    n.checked_mul(scale).ok_or_else(|| format!("size '{s}' is too large"))
}
