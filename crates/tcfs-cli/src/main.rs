//! tcfs: TummyCrypt encrypted file tool
//!
//! Commands:
//!   keygen [--out <file>]              - generate a versioned share key file
//!   encrypt <src> <dst>                - encrypt a plaintext file
//!   decrypt <src> [<dst>]              - decrypt to a file (or stdout)
//!   write <file> --offset N --data S   - overwrite bytes in place
//!   truncate <file> <len>              - set the plaintext length
//!   verify <file>                      - check header HMAC and chunk tag tree
//!   info <file>                        - show header fields and sizes
//!   size <real-bytes>                  - plaintext size for a ciphertext size

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use tcfs_core::config::TcfsConfig;
use tcfs_core::CodecKind;
use tcfs_crypto::{generate_share_key, ShareKey};
use tcfs_encfile::{EncFileOptions, EncFileReader, EncFileWriter, FileRegistry};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "tcfs",
    version,
    about = "TummyCrypt encrypted file tool",
    long_about = "tcfs: create, inspect and edit random-access encrypted files"
)]
struct Cli {
    /// Path to tcfs.toml configuration file
    #[arg(long, short = 'c', env = "TCFS_CONFIG", default_value = "/etc/tcfs/config.toml")]
    config: PathBuf,

    /// Log level or filter directive (overrides config)
    #[arg(long, env = "TCFS_LOG")]
    log: Option<String>,

    /// Log format (overrides config)
    #[arg(long, env = "TCFS_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Share key file (JSON: {"version": N, "key": "<base64>"})
    #[arg(long, short = 'k', env = "TCFS_SHARE_KEY")]
    key_file: Option<PathBuf>,

    /// Chunk cipher: auto, gcm, gcm-hw or legacy (overrides config)
    #[arg(long)]
    codec: Option<CodecKind>,

    /// Plaintext chunk size in 16-byte blocks (overrides config)
    #[arg(long)]
    chunk_multiple: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a new share key file
    Keygen {
        /// Output file (default: print to stdout)
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
        /// Share key version recorded in file headers
        #[arg(long, default_value_t = 1)]
        version: u32,
    },

    /// Encrypt a plaintext file into a new encrypted file
    Encrypt {
        src: PathBuf,
        dst: PathBuf,
    },

    /// Decrypt an encrypted file
    Decrypt {
        src: PathBuf,
        /// Destination (default: stdout)
        dst: Option<PathBuf>,
    },

    /// Overwrite plaintext bytes at an offset, growing the file if needed
    Write {
        file: PathBuf,
        #[arg(long)]
        offset: u64,
        /// Bytes to write (UTF-8)
        #[arg(long)]
        data: String,
    },

    /// Truncate or zero-extend an encrypted file
    Truncate {
        file: PathBuf,
        /// New plaintext length in bytes
        len: u64,
    },

    /// Verify the header and every chunk tag against the root tag
    Verify {
        file: PathBuf,
    },

    /// Show header fields and sizes (no key required)
    Info {
        file: PathBuf,
    },

    /// Plaintext size of an encrypted file of the given size
    Size {
        real_bytes: u64,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, found) = load_config(&cli.config)?;

    let level = cli.log.clone().unwrap_or_else(|| config.logging.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.logging.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);
    if !found {
        warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }

    let registry = build_registry(&cli, &config)?;

    match &cli.command {
        Commands::Keygen { out, version } => cmd_keygen(out.as_deref(), *version),
        Commands::Encrypt { src, dst } => {
            let key = load_share_key(&cli, &config)?;
            cmd_encrypt(&registry, &key, src, dst)
        }
        Commands::Decrypt { src, dst } => {
            let key = load_share_key(&cli, &config)?;
            cmd_decrypt(&registry, &key, src, dst.as_deref())
        }
        Commands::Write { file, offset, data } => {
            let key = load_share_key(&cli, &config)?;
            cmd_write(&registry, &key, file, *offset, data.as_bytes())
        }
        Commands::Truncate { file, len } => {
            let key = load_share_key(&cli, &config)?;
            cmd_truncate(&registry, &key, file, *len)
        }
        Commands::Verify { file } => {
            let key = load_share_key(&cli, &config)?;
            cmd_verify(&registry, &key, file)
        }
        Commands::Info { file } => cmd_info(&registry, file),
        Commands::Size { real_bytes } => {
            println!("{}", registry.real_to_virtual_size(*real_bytes));
            Ok(())
        }
    }
}

// ── Config, logging and keys ──────────────────────────────────────────────────

/// Returns the config and whether it came from a file.
fn load_config(path: &Path) -> Result<(TcfsConfig, bool)> {
    if path.exists() {
        let config = TcfsConfig::load(path)
            .with_context(|| format!("loading config: {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((TcfsConfig::default(), false))
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let layer = fmt::layer().with_writer(std::io::stderr);

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(layer.json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    }
}

fn build_registry(cli: &Cli, config: &TcfsConfig) -> Result<FileRegistry> {
    let mut options = EncFileOptions::from(&config.crypto);
    if let Some(codec) = cli.codec {
        options.codec = codec;
    }
    if let Some(multiple) = cli.chunk_multiple {
        options.chunk_multiple = multiple;
    }
    FileRegistry::new(options).context("invalid encrypted file options")
}

/// On-disk share key: the version recorded in file headers plus the key.
#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    version: u32,
    key: String,
}

fn load_share_key(cli: &Cli, config: &TcfsConfig) -> Result<(u32, ShareKey)> {
    let path = cli
        .key_file
        .clone()
        .or_else(|| config.crypto.share_key_file.clone())
        .context(
            "no share key configured\n\
             Pass --key-file, set TCFS_SHARE_KEY, or set crypto.share_key_file in the config.\n\
             Create one with: tcfs keygen --out share.key",
        )?;
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("reading share key: {}", path.display()))?;
    let parsed: KeyFile = serde_json::from_str(&content)
        .with_context(|| format!("parsing share key: {}", path.display()))?;
    let bytes = STANDARD
        .decode(parsed.key.trim())
        .context("share key is not valid base64")?;
    let key = ShareKey::from_slice(&bytes)?;
    Ok((parsed.version, key))
}

fn byte_progress(total: u64, prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )
        .context("progress template")?
        .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    Ok(pb)
}

// ── `tcfs keygen` ─────────────────────────────────────────────────────────────

fn cmd_keygen(out: Option<&Path>, version: u32) -> Result<()> {
    let key = generate_share_key();
    let json = serde_json::to_string_pretty(&KeyFile {
        version,
        key: STANDARD.encode(key.as_bytes()),
    })?;

    let Some(out) = out else {
        println!("{json}");
        return Ok(());
    };
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts
        .open(out)
        .with_context(|| format!("creating key file: {}", out.display()))?;
    writeln!(file, "{json}")?;
    println!("Share key v{version} written to {}", out.display());
    Ok(())
}

// ── `tcfs encrypt` / `tcfs decrypt` ───────────────────────────────────────────

fn cmd_encrypt(
    registry: &FileRegistry,
    (version, key): &(u32, ShareKey),
    src: &Path,
    dst: &Path,
) -> Result<()> {
    let input = File::open(src).with_context(|| format!("opening {}", src.display()))?;
    let total = input.metadata()?.len();

    let file = registry
        .create(dst, *version, key)
        .with_context(|| format!("creating {}", dst.display()))?;
    let pb = byte_progress(total, "encrypt")?;
    let mut writer = EncFileWriter::new(file);
    let copied = std::io::copy(&mut pb.wrap_read(input), &mut writer);
    pb.finish_and_clear();

    let file = writer.into_inner();
    let closed = file.close();
    copied.with_context(|| format!("encrypting {}", src.display()))?;
    closed.with_context(|| format!("closing {}", dst.display()))?;

    info!(src = %src.display(), dst = %dst.display(), bytes = total, "encrypted file");
    println!(
        "Encrypted {} → {} ({total} bytes, {})",
        src.display(),
        dst.display(),
        registry.codec_kind()
    );
    Ok(())
}

fn cmd_decrypt(
    registry: &FileRegistry,
    (_, key): &(u32, ShareKey),
    src: &Path,
    dst: Option<&Path>,
) -> Result<()> {
    let file = registry
        .open(src, false)
        .with_context(|| format!("opening {}", src.display()))?;
    file.init_with_share_key(key)
        .with_context(|| format!("verifying {}", src.display()))?;
    let total = file.length()?;
    let mut reader = EncFileReader::new(file);

    let copied = match dst {
        Some(dst) => {
            let mut out =
                File::create(dst).with_context(|| format!("creating {}", dst.display()))?;
            let pb = byte_progress(total, "decrypt")?;
            let copied = std::io::copy(&mut reader, &mut pb.wrap_write(&mut out));
            pb.finish_and_clear();
            copied
        }
        None => std::io::copy(&mut reader, &mut std::io::stdout().lock()),
    };
    let closed = reader.into_inner().close();
    copied.with_context(|| format!("decrypting {}", src.display()))?;
    closed?;

    if let Some(dst) = dst {
        println!("Decrypted {} → {} ({total} bytes)", src.display(), dst.display());
    }
    Ok(())
}

// ── `tcfs write` / `tcfs truncate` ────────────────────────────────────────────

fn cmd_write(
    registry: &FileRegistry,
    (_, key): &(u32, ShareKey),
    path: &Path,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    let file = registry
        .open(path, true)
        .with_context(|| format!("opening {}", path.display()))?;
    file.init_with_share_key(key)
        .with_context(|| format!("verifying {}", path.display()))?;
    if !file.lock(false)? {
        anyhow::bail!("{} is locked by another process", path.display());
    }
    let written = file.write_at(offset, data);
    let closed = file.close();
    written.with_context(|| format!("writing {}", path.display()))?;
    closed?;

    println!("Wrote {} bytes at offset {offset}", data.len());
    Ok(())
}

fn cmd_truncate(
    registry: &FileRegistry,
    (_, key): &(u32, ShareKey),
    path: &Path,
    len: u64,
) -> Result<()> {
    let file = registry
        .open(path, true)
        .with_context(|| format!("opening {}", path.display()))?;
    file.init_with_share_key(key)
        .with_context(|| format!("verifying {}", path.display()))?;
    if !file.lock(false)? {
        anyhow::bail!("{} is locked by another process", path.display());
    }
    let old = file.length()?;
    let resized = file.set_length(len);
    let closed = file.close();
    resized.with_context(|| format!("resizing {}", path.display()))?;
    closed?;

    println!("{}: {old} → {len} bytes", path.display());
    Ok(())
}

// ── `tcfs verify` / `tcfs info` ───────────────────────────────────────────────

fn cmd_verify(registry: &FileRegistry, (_, key): &(u32, ShareKey), path: &Path) -> Result<()> {
    let file = registry
        .open(path, false)
        .with_context(|| format!("opening {}", path.display()))?;
    let result = file
        .init_with_share_key(key)
        .and_then(|()| file.check_authentication_tag());
    file.close()?;

    match result {
        Ok(true) => {
            println!("{}: OK", path.display());
            Ok(())
        }
        Ok(false) => {
            println!(
                "{}: header OK, no chunk authentication with the {} codec",
                path.display(),
                registry.codec_kind()
            );
            Ok(())
        }
        Err(e) if e.is_integrity() => {
            anyhow::bail!("{}: INTEGRITY FAILURE: {e}", path.display())
        }
        Err(e) => Err(e).with_context(|| format!("verifying {}", path.display())),
    }
}

fn cmd_info(registry: &FileRegistry, path: &Path) -> Result<()> {
    let real = std::fs::metadata(path)
        .with_context(|| format!("reading {}", path.display()))?
        .len();
    let file = registry
        .open(path, false)
        .with_context(|| format!("opening {}", path.display()))?;
    let version = file.share_key_version()?;
    file.close()?;

    let layout = registry.layout();
    println!("path:              {}", path.display());
    println!("codec:             {}", registry.codec_kind());
    println!(
        "share key version: {}",
        version.map_or_else(|| "-".to_string(), |v| v.to_string())
    );
    println!("header size:       {}", layout.header_size());
    println!(
        "chunk size:        {} plaintext / {} stored",
        layout.data_size(),
        layout.enc_size()
    );
    println!("chunks:            {}", layout.chunk_count(real));
    println!("stored size:       {real}");
    println!("plaintext size:    {}", registry.real_to_virtual_size(real));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::ffi::OsStr;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_codec_override_parses() {
        let cli = Cli::try_parse_from(["tcfs", "--codec", "legacy", "size", "78"]).unwrap();
        assert_eq!(cli.codec, Some(CodecKind::Legacy));
        assert!(Cli::try_parse_from(["tcfs", "--codec", "rot13", "size", "78"]).is_err());
    }

    #[test]
    fn test_share_key_file_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("share.key");
        cmd_keygen(Some(&path), 7).unwrap();
        assert!(cmd_keygen(Some(&path), 7).is_err(), "keygen never overwrites");

        let cli = Cli::try_parse_from([
            OsStr::new("tcfs"),
            OsStr::new("--key-file"),
            path.as_os_str(),
            OsStr::new("verify"),
            OsStr::new("x.enc"),
        ])
        .unwrap();
        let (version, key) = load_share_key(&cli, &TcfsConfig::default()).unwrap();
        assert_eq!(version, 7);
        assert_eq!(key.as_bytes().len(), 32);
    }

    #[test]
    fn test_share_key_rejects_short_key() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("bad.key");
        std::fs::write(&path, r#"{"version": 1, "key": "AAAA"}"#).unwrap();

        let mut config = TcfsConfig::default();
        config.crypto.share_key_file = Some(path);
        let cli = Cli::try_parse_from(["tcfs", "size", "0"]).unwrap();
        assert!(load_share_key(&cli, &config).is_err());
    }

    #[test]
    fn test_cli_overrides_config_options() {
        let cli =
            Cli::try_parse_from(["tcfs", "--chunk-multiple", "8", "--codec", "gcm", "size", "0"])
                .unwrap();
        let registry = build_registry(&cli, &TcfsConfig::default()).unwrap();
        assert_eq!(registry.options().chunk_multiple, 8);
        assert_eq!(registry.codec_kind(), CodecKind::Gcm);

        let cli = Cli::try_parse_from(["tcfs", "--chunk-multiple", "0", "size", "0"]).unwrap();
        assert!(build_registry(&cli, &TcfsConfig::default()).is_err());
    }
}
