use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Chunk cipher strategy used for an encrypted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodecKind {
    /// Encrypt-only GCM when the CPU has AES instructions, full-cipher GCM otherwise
    #[default]
    Auto,
    /// AES-256-GCM over the full AES cipher (runtime AES-NI/ARMv8 detection)
    Gcm,
    /// AES-256-GCM over the encrypt-only AES core (no decryption key schedule)
    GcmHw,
    /// AES-256-CBC with a CFB8 tail; no integrity protection
    Legacy,
}

impl CodecKind {
    /// Whether files written with this codec carry chunk and root tags.
    pub fn is_authenticated(self) -> bool {
        !matches!(self, CodecKind::Legacy)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CodecKind::Auto => "auto",
            CodecKind::Gcm => "gcm",
            CodecKind::GcmHw => "gcm-hw",
            CodecKind::Legacy => "legacy",
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodecKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(CodecKind::Auto),
            "gcm" => Ok(CodecKind::Gcm),
            "gcm-hw" => Ok(CodecKind::GcmHw),
            "legacy" => Ok(CodecKind::Legacy),
            other => Err(format!(
                "unknown codec '{other}' (expected auto, gcm, gcm-hw or legacy)"
            )),
        }
    }
}
