//! Cipher configuration for the encfs overlay
//!
//! encfs records the parameters of a volume in `.encfs6.xml` at the root of
//! the encrypted directory. Before the daemon is trusted with an existing
//! volume the marker is read (never written) and compared against the
//! configured [`CipherConfig`].

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Marker file encfs keeps in the root of the encrypted directory
pub const MARKER_FILE: &str = ".encfs6.xml";

/// Block cipher used for file contents and names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherAlgorithm {
    Aes,
    Blowfish,
    Camellia,
}

impl CipherAlgorithm {
    /// Name as written in the marker file
    pub fn marker_name(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes => "ssl/aes",
            CipherAlgorithm::Blowfish => "ssl/blowfish",
            CipherAlgorithm::Camellia => "ssl/camellia",
        }
    }

    fn from_marker_name(name: &str) -> Option<Self> {
        match name {
            "ssl/aes" => Some(CipherAlgorithm::Aes),
            "ssl/blowfish" => Some(CipherAlgorithm::Blowfish),
            "ssl/camellia" => Some(CipherAlgorithm::Camellia),
            _ => None,
        }
    }

    /// Menu entry in the encfs expert configuration dialog
    fn menu_index(&self) -> u32 {
        match self {
            CipherAlgorithm::Aes => 1,
            CipherAlgorithm::Blowfish => 2,
            CipherAlgorithm::Camellia => 3,
        }
    }

    fn valid_key_size(&self, bits: u32) -> bool {
        match self {
            CipherAlgorithm::Aes | CipherAlgorithm::Camellia => matches!(bits, 128 | 192 | 256),
            CipherAlgorithm::Blowfish => (128..=256).contains(&bits) && bits % 32 == 0,
        }
    }
}

/// How encfs encodes file names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameEncoding {
    Block,
    Block32,
    Stream,
    /// Names stored in the clear
    Null,
}

impl NameEncoding {
    pub fn marker_name(&self) -> &'static str {
        match self {
            NameEncoding::Block => "nameio/block",
            NameEncoding::Block32 => "nameio/block32",
            NameEncoding::Stream => "nameio/stream",
            NameEncoding::Null => "nameio/null",
        }
    }

    fn from_marker_name(name: &str) -> Option<Self> {
        match name {
            "nameio/block" => Some(NameEncoding::Block),
            "nameio/block32" => Some(NameEncoding::Block32),
            "nameio/stream" => Some(NameEncoding::Stream),
            "nameio/null" => Some(NameEncoding::Null),
            _ => None,
        }
    }

    fn menu_index(&self) -> u32 {
        match self {
            NameEncoding::Block => 1,
            NameEncoding::Block32 => 2,
            NameEncoding::Null => 3,
            NameEncoding::Stream => 4,
        }
    }
}

/// Parameters of an encrypted volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherConfig {
    pub algorithm: CipherAlgorithm,
    /// Key size in bits
    pub key_size: u32,
    /// Block size in bytes
    pub block_size: u32,
    pub name_encoding: NameEncoding,
    pub chained_name_iv: bool,
    pub unique_iv: bool,
    pub external_iv_chaining: bool,
    /// Bytes of MAC stored with every block (0 disables)
    pub block_mac_bytes: u32,
}

impl Default for CipherConfig {
    fn default() -> Self {
        CipherConfig {
            algorithm: CipherAlgorithm::Aes,
            key_size: 192,
            block_size: 1024,
            name_encoding: NameEncoding::Block,
            chained_name_iv: false,
            unique_iv: false,
            external_iv_chaining: false,
            block_mac_bytes: 0,
        }
    }
}

impl CipherConfig {
    /// Reject parameters encfs would refuse or that would leak file names
    pub fn validate(&self) -> Result<()> {
        if !self.algorithm.valid_key_size(self.key_size) {
            return Err(Error::InvalidSessionConfig(format!(
                "key size {} is not valid for {}",
                self.key_size,
                self.algorithm.marker_name()
            )));
        }
        if !(64..=4096).contains(&self.block_size) || self.block_size % 16 != 0 {
            return Err(Error::InvalidSessionConfig(format!(
                "block size {} must be a multiple of 16 between 64 and 4096",
                self.block_size
            )));
        }
        if self.name_encoding == NameEncoding::Null {
            return Err(Error::InvalidSessionConfig(
                "null name encoding would store file names in the clear".to_string(),
            ));
        }
        if self.external_iv_chaining && !(self.chained_name_iv && self.unique_iv) {
            return Err(Error::InvalidSessionConfig(
                "external IV chaining requires chained name IVs and unique IVs".to_string(),
            ));
        }
        if !matches!(self.block_mac_bytes, 0 | 8) {
            return Err(Error::InvalidSessionConfig(format!(
                "block MAC bytes must be 0 or 8, got {}",
                self.block_mac_bytes
            )));
        }
        Ok(())
    }

    /// Answers for the encfs expert-mode dialog when creating a new volume.
    ///
    /// The key follows on the next line and is appended by the caller.
    pub fn expert_answers(&self) -> String {
        let yes_no = |b: bool| if b { "yes" } else { "no" };
        let block_size = if self.block_size == 1024 {
            String::new()
        } else {
            self.block_size.to_string()
        };

        let mut answers = vec![
            "x".to_string(),
            self.algorithm.menu_index().to_string(),
            self.key_size.to_string(),
            block_size,
            self.name_encoding.menu_index().to_string(),
            yes_no(self.chained_name_iv).to_string(),
            yes_no(self.unique_iv).to_string(),
        ];
        if self.chained_name_iv && self.unique_iv {
            answers.push(yes_no(self.external_iv_chaining).to_string());
        }
        // file holes: keep the default
        answers.push(String::new());
        answers.push(self.block_mac_bytes.to_string());
        // random bytes per block header: keep the default
        answers.push(String::new());

        let mut out = answers.join("\n");
        out.push('\n');
        out
    }

    /// Differences between this configuration and a volume's recorded parameters
    pub fn differences(&self, recorded: &CipherConfig) -> Vec<String> {
        let mut diffs = Vec::new();
        let mut check = |field: &str, want: String, have: String| {
            if want != have {
                diffs.push(format!("{}: configured {}, volume has {}", field, want, have));
            }
        };

        check(
            "cipher",
            self.algorithm.marker_name().to_string(),
            recorded.algorithm.marker_name().to_string(),
        );
        check("key size", self.key_size.to_string(), recorded.key_size.to_string());
        check("block size", self.block_size.to_string(), recorded.block_size.to_string());
        check(
            "name encoding",
            self.name_encoding.marker_name().to_string(),
            recorded.name_encoding.marker_name().to_string(),
        );
        check(
            "chained name IV",
            self.chained_name_iv.to_string(),
            recorded.chained_name_iv.to_string(),
        );
        check("unique IV", self.unique_iv.to_string(), recorded.unique_iv.to_string());
        check(
            "external IV chaining",
            self.external_iv_chaining.to_string(),
            recorded.external_iv_chaining.to_string(),
        );
        check(
            "block MAC bytes",
            self.block_mac_bytes.to_string(),
            recorded.block_mac_bytes.to_string(),
        );

        diffs
    }

    /// Read the parameters recorded in a marker file
    pub fn from_marker(path: &Path) -> Result<CipherConfig> {
        let xml = std::fs::read_to_string(path)?;
        parse_marker(&xml).map_err(|reason| Error::OverlayConfigMismatch {
            marker: path.to_path_buf(),
            reason,
        })
    }
}

impl fmt::Display for CipherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} block {} names {}",
            self.algorithm.marker_name(),
            self.key_size,
            self.block_size,
            self.name_encoding.marker_name()
        )
    }
}

fn parse_marker(xml: &str) -> std::result::Result<CipherConfig, String> {
    let algorithm = section_name(xml, "cipherAlg")?;
    let algorithm = CipherAlgorithm::from_marker_name(&algorithm)
        .ok_or_else(|| format!("unknown cipher '{}'", algorithm))?;
    let names = section_name(xml, "nameAlg")?;
    let name_encoding = NameEncoding::from_marker_name(&names)
        .ok_or_else(|| format!("unknown name encoding '{}'", names))?;

    Ok(CipherConfig {
        algorithm,
        key_size: number(xml, "keySize")?,
        block_size: number(xml, "blockSize")?,
        name_encoding,
        chained_name_iv: number(xml, "chainedNameIV")? != 0,
        unique_iv: number(xml, "uniqueIV")? != 0,
        external_iv_chaining: number(xml, "externalIVChaining")? != 0,
        block_mac_bytes: number(xml, "blockMACBytes")?,
    })
}

fn section_name(xml: &str, section: &str) -> std::result::Result<String, String> {
    let re = Regex::new(&format!(r"<{}\b[^>]*>\s*<name>\s*([^<\s]+)\s*</name>", section))
        .map_err(|e| e.to_string())?;
    re.captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| format!("marker has no <{}> section", section))
}

fn number(xml: &str, tag: &str) -> std::result::Result<u32, String> {
    let re = Regex::new(&format!(r"<{tag}>\s*(\d+)\s*</{tag}>")).map_err(|e| e.to_string())?;
    re.captures(xml)
        .and_then(|c| c.get(1))
        .ok_or_else(|| format!("marker has no <{}> value", tag))?
        .as_str()
        .parse()
        .map_err(|e| format!("bad <{}> value: {}", tag, e))
}

/// Marker text in the layout encfs writes, for tests and fixtures
#[cfg(test)]
pub(crate) fn render_marker(config: &CipherConfig) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes" ?>
<!DOCTYPE boost_serialization>
<boost_serialization signature="serialization::archive" version="7">
    <cfg class_id="0" tracking_level="0" version="20">
        <version>20100713</version>
        <creator>EncFS 1.9.5</creator>
        <cipherAlg class_id="1" tracking_level="0" version="0">
            <name>{}</name>
            <major>3</major>
            <minor>0</minor>
        </cipherAlg>
        <nameAlg>
            <name>{}</name>
            <major>4</major>
            <minor>0</minor>
        </nameAlg>
        <keySize>{}</keySize>
        <blockSize>{}</blockSize>
        <plainData>0</plainData>
        <uniqueIV>{}</uniqueIV>
        <chainedNameIV>{}</chainedNameIV>
        <externalIVChaining>{}</externalIVChaining>
        <blockMACBytes>{}</blockMACBytes>
        <blockMACRandBytes>0</blockMACRandBytes>
        <allowHoles>1</allowHoles>
        <encodedKeySize>44</encodedKeySize>
        <encodedKeyData>
AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA
</encodedKeyData>
    </cfg>
</boost_serialization>
"#,
        config.algorithm.marker_name(),
        config.name_encoding.marker_name(),
        config.key_size,
        config.block_size,
        config.unique_iv as u8,
        config.chained_name_iv as u8,
        config.external_iv_chaining as u8,
        config.block_mac_bytes,
    )
}
