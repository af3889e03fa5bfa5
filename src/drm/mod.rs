//! ClearKey DRM material and CENC decryption.
//!
//! A [`DrmDescriptor`] is built from a `clearkey=KID:KEY[,KID:KEY]` request
//! parameter, a `key_id`/`key` pair, or a ClearKey license response (JWK
//! set). Every KID and KEY must decode to exactly 16 bytes.

pub mod cenc;
pub mod mp4;

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{ProxyError, Result};
use crate::stream::deobfuscate::decode_base64_any;

pub use cenc::{decrypt_init, decrypt_segment, CencDecryptor};

/// Width of a CENC key and key id.
pub const KEY_LEN: usize = 16;

/// W3C ClearKey key system identifier, as used in MPD `ContentProtection`.
pub const CLEARKEY_SCHEME: &str = "urn:uuid:e2719d58-a985-b3c9-781a-b030af78d30e";

/// Encryption scheme the descriptor applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionMethod {
    /// ISO/IEC 23001-7 `cenc`: AES-128 in counter mode.
    CencCtr,
}

/// One ClearKey key id / key pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyPair {
    pub kid: [u8; KEY_LEN],
    pub key: [u8; KEY_LEN],
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key bytes stay out of logs.
        f.debug_struct("KeyPair")
            .field("kid", &hex::encode(self.kid))
            .field("key", &"<redacted>")
            .finish()
    }
}

impl KeyPair {
    /// Parse one `KID:KEY` pair, each side hex or base64.
    pub fn parse(pair: &str) -> Result<Self> {
        let (kid, key) = pair
            .trim()
            .split_once(':')
            .ok_or_else(|| bad(format!("expected KID:KEY, got '{}'", pair.trim())))?;
        Ok(Self {
            kid: decode_16("KID", kid)?,
            key: decode_16("KEY", key)?,
        })
    }

    pub fn kid_hex(&self) -> String {
        hex::encode(self.kid)
    }

    pub fn key_hex(&self) -> String {
        hex::encode(self.key)
    }
}

/// Resolved DRM material for one stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DrmDescriptor {
    pub method: EncryptionMethod,
    pub keys: Vec<KeyPair>,
    /// License server the keys came from, if any.
    pub license_url: Option<String>,
}

impl DrmDescriptor {
    /// Parse `KID:KEY[,KID:KEY...]`.
    pub fn from_clearkey(param: &str) -> Result<Self> {
        let keys = param
            .split(',')
            .filter(|p| !p.trim().is_empty())
            .map(KeyPair::parse)
            .collect::<Result<Vec<_>>>()?;
        if keys.is_empty() {
            return Err(bad("empty clearkey parameter"));
        }
        Ok(Self {
            method: EncryptionMethod::CencCtr,
            keys,
            license_url: None,
        })
    }

    /// Build from separate `key_id` and `key` parameters. Both may hold
    /// comma-separated lists of equal length.
    pub fn from_parts(key_id: &str, key: &str) -> Result<Self> {
        let kids: Vec<&str> = key_id.split(',').map(str::trim).collect();
        let keys: Vec<&str> = key.split(',').map(str::trim).collect();
        if kids.len() != keys.len() {
            return Err(bad(format!(
                "{} key ids but {} keys",
                kids.len(),
                keys.len()
            )));
        }
        let pairs = kids
            .iter()
            .zip(&keys)
            .map(|(kid, key)| KeyPair::parse(&format!("{kid}:{key}")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            method: EncryptionMethod::CencCtr,
            keys: pairs,
            license_url: None,
        })
    }

    /// Parse a ClearKey license response (`{"keys":[{"kty":"oct","kid":..,"k":..}]}`).
    pub fn from_license_response(body: &[u8], license_url: Option<&str>) -> Result<Self> {
        let license: ClearKeyLicense = serde_json::from_slice(body)
            .map_err(|e| bad(format!("license response is not a JWK set: {e}")))?;
        let keys = license
            .keys
            .iter()
            .filter(|k| k.kty.as_deref().map_or(true, |t| t == "oct"))
            .map(|k| {
                Ok(KeyPair {
                    kid: decode_16("KID", &k.kid)?,
                    key: decode_16("KEY", &k.k)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if keys.is_empty() {
            return Err(bad("license response contains no keys"));
        }
        Ok(Self {
            method: EncryptionMethod::CencCtr,
            keys,
            license_url: license_url.map(str::to_string),
        })
    }

    /// Key for a KID, if present.
    pub fn key_for(&self, kid: &[u8; KEY_LEN]) -> Option<&[u8; KEY_LEN]> {
        self.keys.iter().find(|p| &p.kid == kid).map(|p| &p.key)
    }

    /// Hex `KID:KEY,...` form used in proxy links.
    pub fn to_param(&self) -> String {
        self.keys
            .iter()
            .map(|p| format!("{}:{}", p.kid_hex(), p.key_hex()))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// ClearKey license (JWK set) carrying these keys.
    pub fn to_license(&self) -> ClearKeyLicense {
        ClearKeyLicense {
            keys: self
                .keys
                .iter()
                .map(|p| JsonWebKey {
                    kty: Some("oct".to_string()),
                    kid: URL_SAFE_NO_PAD.encode(p.kid),
                    k: URL_SAFE_NO_PAD.encode(p.key),
                })
                .collect(),
            kind: Some("temporary".to_string()),
        }
    }
}

impl Serialize for DrmDescriptor {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        // Only key ids are exposed; keys never leave the process in JSON.
        let kids: Vec<String> = self.keys.iter().map(KeyPair::kid_hex).collect();
        let mut state = serializer.serialize_struct("DrmDescriptor", 3)?;
        state.serialize_field("method", &self.method)?;
        state.serialize_field("key_ids", &kids)?;
        state.serialize_field("license_url", &self.license_url)?;
        state.end()
    }
}

/// JWK set exchanged with ClearKey license servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearKeyLicense {
    pub keys: Vec<JsonWebKey>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonWebKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kty: Option<String>,
    pub kid: String,
    pub k: String,
}

/// ClearKey license request body for a set of KIDs.
pub fn license_request(kids: &[[u8; KEY_LEN]]) -> serde_json::Value {
    serde_json::json!({
        "kids": kids.iter().map(|k| URL_SAFE_NO_PAD.encode(k)).collect::<Vec<_>>(),
        "type": "temporary",
    })
}

/// Decode a 16-byte value given as hex (dashes allowed) or base64.
pub fn decode_16(label: &str, text: &str) -> Result<[u8; KEY_LEN]> {
    let text = text.trim();
    let compact: String = text.chars().filter(|c| *c != '-').collect();
    let bytes = if compact.len() == KEY_LEN * 2 && compact.chars().all(|c| c.is_ascii_hexdigit()) {
        hex::decode(&compact).map_err(|e| bad(format!("{label} is not valid hex: {e}")))?
    } else {
        decode_base64_any(text)
            .ok_or_else(|| bad(format!("{label} is neither 32 hex digits nor base64")))?
    };
    <[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
        bad(format!(
            "{label} must be {KEY_LEN} bytes, got {}",
            bytes.len()
        ))
    })
}

fn bad(msg: impl Into<String>) -> ProxyError {
    ProxyError::BadDrmDescriptor(msg.into())
}
