use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{TcfsError, TcfsResult};
use crate::types::CodecKind;

/// Plaintext chunk size multiple used when nothing else is configured:
/// 4096 AES blocks, i.e. 64 KiB of plaintext per chunk.
pub const DEFAULT_CHUNK_MULTIPLE: usize = 4096;

/// Largest accepted chunk multiple (64 MiB plaintext chunks with AES).
pub const MAX_CHUNK_MULTIPLE: usize = 1 << 22;

/// Top-level configuration (loaded from tcfs.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TcfsConfig {
    pub logging: LoggingConfig,
    pub crypto: CryptoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or EnvFilter directive (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

/// Encrypted random-access file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Chunk cipher: "auto", "gcm", "gcm-hw" or "legacy" (default: auto)
    pub codec: CodecKind,
    /// Plaintext chunk size in cipher blocks (default: 4096)
    pub chunk_multiple: usize,
    /// JSON file holding the versioned share key
    pub share_key_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            codec: CodecKind::Auto,
            chunk_multiple: DEFAULT_CHUNK_MULTIPLE,
            share_key_file: None,
        }
    }
}

impl TcfsConfig {
    pub fn from_toml_str(s: &str) -> TcfsResult<Self> {
        let config: TcfsConfig =
            toml::from_str(s).map_err(|e| TcfsError::Config(format!("parsing config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> TcfsResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> TcfsResult<()> {
        let multiple = self.crypto.chunk_multiple;
        if multiple == 0 || multiple > MAX_CHUNK_MULTIPLE {
            return Err(TcfsError::Config(format!(
                "crypto.chunk_multiple must be between 1 and {MAX_CHUNK_MULTIPLE}, got {multiple}"
            )));
        }
        match self.logging.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(TcfsError::Config(format!(
                "logging.format must be \"json\" or \"text\", got \"{other}\""
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[logging]
level = "tcfs_encfile=trace,info"
format = "json"

[crypto]
codec = "gcm-hw"
chunk_multiple = 256
share_key_file = "/home/user/.config/tcfs/share-key.json"
"#;
        let config = TcfsConfig::from_toml_str(toml_str).unwrap();

        assert_eq!(config.logging.level, "tcfs_encfile=trace,info");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.crypto.codec, CodecKind::GcmHw);
        assert_eq!(config.crypto.chunk_multiple, 256);
        assert_eq!(
            config.crypto.share_key_file,
            Some(PathBuf::from("/home/user/.config/tcfs/share-key.json"))
        );
    }

    #[test]
    fn test_parse_defaults() {
        let config = TcfsConfig::from_toml_str("").unwrap();

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "text");
        assert_eq!(config.crypto.codec, CodecKind::Auto);
        assert_eq!(config.crypto.chunk_multiple, DEFAULT_CHUNK_MULTIPLE);
        assert!(config.crypto.share_key_file.is_none());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[crypto]
codec = "legacy"
"#;
        let config = TcfsConfig::from_toml_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.crypto.codec, CodecKind::Legacy);
        // Defaults
        assert_eq!(config.crypto.chunk_multiple, DEFAULT_CHUNK_MULTIPLE);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_rejects_invalid_values() {
        let zero = TcfsConfig::from_toml_str("[crypto]\nchunk_multiple = 0\n");
        assert!(matches!(zero, Err(TcfsError::Config(_))), "zero chunk multiple must fail");

        let format = TcfsConfig::from_toml_str("[logging]\nformat = \"xml\"\n");
        assert!(matches!(format, Err(TcfsError::Config(_))));

        let codec = TcfsConfig::from_toml_str("[crypto]\ncodec = \"rot13\"\n");
        assert!(matches!(codec, Err(TcfsError::Config(_))), "unknown codec must fail");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tcfs.toml");
        std::fs::write(&path, "[crypto]\nchunk_multiple = 16\n").unwrap();

        let config = TcfsConfig::load(&path).unwrap();
        assert_eq!(config.crypto.chunk_multiple, 16);

        let missing = TcfsConfig::load(&dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(TcfsError::Io(_))));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = TcfsConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed = TcfsConfig::from_toml_str(&toml_str).unwrap();

        assert_eq!(config.crypto.codec, parsed.crypto.codec);
        assert_eq!(config.crypto.chunk_multiple, parsed.crypto.chunk_multiple);
        assert_eq!(config.logging.format, parsed.logging.format);
    }
}
