//! Plugin manifest format and validation.
//!
//! Every plugin package carries a `tibok-plugin.json` at its root describing
//! its identity, version, host requirements and requested capabilities.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

use super::capability::{Capability, TrustAssessment, TrustContext, TrustTier};
use super::versioning::{is_valid_version, satisfies_minimum};

/// Manifest file name inside a plugin directory.
pub const MANIFEST_FILE: &str = "tibok-plugin.json";

const MAX_IDENTIFIER_LEN: usize = 128;

/// Manifest errors.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(String),

    /// Identifier is empty or contains forbidden characters.
    #[error("invalid identifier: '{0}'")]
    InvalidIdentifier(String),

    /// Version is not a dot-separated numeric sequence.
    #[error("invalid version format: '{0}'")]
    InvalidVersion(String),

    /// Any other structural problem.
    #[error("invalid manifest format: {0}")]
    InvalidFormat(String),

    /// Manifest file not found.
    #[error("manifest file not found: {0}")]
    NotFound(String),
}

/// Result type for manifest operations.
pub type Result<T> = std::result::Result<T, ManifestError>;

/// How the plugin's code is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// A dynamically linked native library.
    Native,
    /// Interpreted script code.
    Script,
}

impl PluginKind {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "native" => Some(Self::Native),
            "script" => Some(Self::Script),
            _ => None,
        }
    }
}

/// A command contributed to one of the host's command registries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributedCommand {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Entries a plugin adds to host registries while enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contributions {
    #[serde(default)]
    pub commands: Vec<ContributedCommand>,

    #[serde(default)]
    pub slash_commands: Vec<ContributedCommand>,
}

impl Contributions {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.slash_commands.is_empty()
    }
}

/// A validated plugin manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Globally unique identifier, reverse-DNS by convention.
    pub id: String,

    /// Human readable name.
    pub name: String,

    pub version: String,

    pub description: String,

    pub icon: String,

    pub author: String,

    /// Oldest host version this plugin runs on.
    pub min_host_version: String,

    pub kind: PluginKind,

    /// Requested capabilities, unknown tokens included.
    pub capabilities: Vec<Capability>,

    /// Tier the manifest claims. The effective tier depends on where it came from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_tier: Option<TrustTier>,

    /// Base64 Ed25519 signature over [`PluginManifest::signing_payload`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability_schema: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,

    pub keywords: Vec<String>,

    #[serde(skip_serializing_if = "Contributions::is_empty")]
    pub contributes: Contributions,
}

/// Wire form. Everything optional so missing fields get a precise error.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    description: String,
    #[serde(default, deserialize_with = "lenient_string")]
    icon: String,
    #[serde(default, deserialize_with = "lenient_string")]
    author: String,
    #[serde(default)]
    min_host_version: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    trust_tier: Option<String>,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    capability_schema: Option<Value>,
    #[serde(default)]
    config_schema: Option<Value>,
    #[serde(default)]
    homepage: Option<String>,
    #[serde(default)]
    repository: Option<String>,
    #[serde(default)]
    license: Option<String>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    contributes: Contributions,
}

/// Cosmetic text fields never fail parsing; anything but a string becomes empty.
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        _ => String::new(),
    })
}

fn required(field: Option<String>, name: &str) -> Result<String> {
    match field {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ManifestError::MissingField(name.to_string())),
    }
}

impl PluginManifest {
    /// Loads and validates a manifest file.
    ///
    /// # Errors
    /// Returns error if the file is missing, unreadable, malformed or invalid.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ManifestError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Loads the manifest of a plugin directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load(&dir.join(MANIFEST_FILE))
    }

    /// Parses and validates a manifest from JSON text.
    ///
    /// Unknown capability tokens are kept as [`Capability::Unrecognized`];
    /// they do not make the manifest invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawManifest = serde_json::from_str(json)?;
        let id = required(raw.id, "id")?;
        let name = required(raw.name, "name")?;
        let version = required(raw.version, "version")?;
        let min_host_version = required(raw.min_host_version, "minHostVersion")?;

        let kind_token = required(raw.kind, "kind")?;
        let kind = PluginKind::parse(kind_token.trim()).ok_or_else(|| {
            ManifestError::InvalidFormat(format!(
                "unknown plugin kind '{}' (expected 'native' or 'script')",
                kind_token
            ))
        })?;

        let trust_tier = match raw.trust_tier {
            Some(value) => Some(TrustTier::parse(&value).ok_or_else(|| {
                ManifestError::InvalidFormat(format!("unknown trust tier '{}'", value))
            })?),
            None => None,
        };

        let manifest = Self {
            id,
            name,
            version,
            description: raw.description,
            icon: raw.icon,
            author: raw.author,
            min_host_version,
            kind,
            capabilities: raw.capabilities.into_iter().map(Capability::from).collect(),
            trust_tier,
            signature: raw.signature.filter(|s| !s.trim().is_empty()),
            capability_schema: raw.capability_schema,
            config_schema: raw.config_schema,
            homepage: raw.homepage,
            repository: raw.repository,
            license: raw.license,
            keywords: raw.keywords,
            contributes: raw.contributes,
        };

        manifest.validate()?;
        Ok(manifest)
    }

    /// Best-effort identifier lookup for manifests that fail validation.
    pub fn peek_identifier(json: &str) -> Option<String> {
        let value: Value = serde_json::from_str(json).ok()?;
        value.get("id")?.as_str().map(str::trim).filter(|id| !id.is_empty()).map(String::from)
    }

    /// Validates identifier and version fields.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_identifier(&self.id) {
            return Err(ManifestError::InvalidIdentifier(self.id.clone()));
        }
        if self.name.trim().is_empty() {
            return Err(ManifestError::MissingField("name".to_string()));
        }
        if !is_valid_version(&self.version) {
            return Err(ManifestError::InvalidVersion(self.version.clone()));
        }
        if !is_valid_version(&self.min_host_version) {
            return Err(ManifestError::InvalidVersion(self.min_host_version.clone()));
        }
        Ok(())
    }

    /// Whether a host at `host_version` can run this plugin.
    pub fn is_compatible_with(&self, host_version: &str) -> bool {
        satisfies_minimum(host_version, &self.min_host_version)
    }

    /// Capabilities this host does not recognize.
    pub fn unrecognized_capabilities(&self) -> Vec<&str> {
        self.capabilities.iter().filter(|c| !c.is_recognized()).map(Capability::token).collect()
    }

    /// Resolves the effective tier and capability set for a given source.
    pub fn assess(&self, context: TrustContext) -> TrustAssessment {
        TrustAssessment::new(self.trust_tier, &self.capabilities, context)
    }

    /// Bytes covered by the manifest signature: compact JSON without `signature`.
    pub fn signing_payload(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// Pretty JSON as written to [`MANIFEST_FILE`].
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Checks identifier syntax.
///
/// Allowed: ASCII letters, digits, `.`, `_` and `-`; must start and end with
/// a letter or digit and must not contain `..`.
pub fn is_valid_identifier(id: &str) -> bool {
    if id.is_empty() || id.len() > MAX_IDENTIFIER_LEN || id.contains("..") {
        return false;
    }

    let bytes = id.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_alphanumeric();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return false;
    }

    bytes.iter().all(|&b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn manifest_json(extra: &str) -> String {
        format!(
            r#"{{
                "id": "com.example.tool",
                "name": "Example Tool",
                "version": "1.0.0",
                "minHostVersion": "0.1",
                "kind": "script"{}
            }}"#,
            extra
        )
    }

    #[test]
    fn test_minimal_manifest_defaults() {
        let manifest = PluginManifest::from_json(&manifest_json("")).unwrap();
        assert_eq!(manifest.id, "com.example.tool");
        assert_eq!(manifest.kind, PluginKind::Script);
        assert!(manifest.description.is_empty());
        assert!(manifest.icon.is_empty());
        assert!(manifest.capabilities.is_empty());
        assert!(manifest.trust_tier.is_none());
        assert!(manifest.keywords.is_empty());
        assert!(manifest.contributes.is_empty());
    }

    #[test]
    fn test_full_manifest() {
        let json = manifest_json(
            r#",
            "description": "Does things",
            "author": "Example Co",
            "capabilities": ["network", "document-read"],
            "trustTier": "verified",
            "homepage": "https://example.com",
            "license": "MIT",
            "keywords": ["export"],
            "configSchema": {"type": "object"},
            "contributes": {
                "commands": [{"id": "tool.run", "title": "Run Tool"}],
                "slashCommands": [{"id": "tool", "title": "/tool"}]
            }"#,
        );
        let manifest = PluginManifest::from_json(&json).unwrap();
        assert_eq!(manifest.capabilities, vec![Capability::Network, Capability::DocumentRead]);
        assert_eq!(manifest.trust_tier, Some(TrustTier::Verified));
        assert_eq!(manifest.license.as_deref(), Some("MIT"));
        assert_eq!(manifest.contributes.commands.len(), 1);
        assert_eq!(manifest.contributes.slash_commands[0].id, "tool");
        assert!(manifest.config_schema.is_some());
    }

    #[test]
    fn test_missing_required_fields() {
        let json = r#"{"id": "com.example.tool", "name": "Tool", "version": "1.0.0", "kind": "script"}"#;
        let err = PluginManifest::from_json(json).unwrap_err();
        assert!(matches!(err, ManifestError::MissingField(ref f) if f == "minHostVersion"));

        let json = r#"{"name": "Tool", "version": "1.0.0", "minHostVersion": "1", "kind": "native"}"#;
        let err = PluginManifest::from_json(json).unwrap_err();
        assert!(matches!(err, ManifestError::MissingField(ref f) if f == "id"));

        let json = r#"{"id": "a", "name": "Tool", "version": "1.0.0", "minHostVersion": "1"}"#;
        let err = PluginManifest::from_json(json).unwrap_err();
        assert!(matches!(err, ManifestError::MissingField(ref f) if f == "kind"));
    }

    #[test]
    fn test_invalid_identifier() {
        let json = manifest_json("").replace("com.example.tool", "../escape");
        let err = PluginManifest::from_json(&json).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidIdentifier(_)));
    }

    #[test]
    fn test_invalid_version() {
        let json = manifest_json("").replace("\"1.0.0\"", "\"1.0.0-beta\"");
        let err = PluginManifest::from_json(&json).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidVersion(ref v) if v == "1.0.0-beta"));
    }

    #[test]
    fn test_unknown_kind_and_tier_are_rejected() {
        let json = manifest_json("").replace("\"script\"", "\"wasm\"");
        assert!(matches!(
            PluginManifest::from_json(&json).unwrap_err(),
            ManifestError::InvalidFormat(_)
        ));

        let json = manifest_json(r#", "trustTier": "platinum""#);
        assert!(matches!(
            PluginManifest::from_json(&json).unwrap_err(),
            ManifestError::InvalidFormat(_)
        ));
    }

    #[test]
    fn test_unknown_capability_is_preserved_not_fatal() {
        let json = manifest_json(r#", "capabilities": ["network", "quantum-entanglement"]"#);
        let manifest = PluginManifest::from_json(&json).unwrap();
        assert_eq!(manifest.capabilities.len(), 2);
        assert_eq!(manifest.unrecognized_capabilities(), vec!["quantum-entanglement"]);

        // Round-trips the raw token unchanged.
        let out = manifest.to_json_pretty().unwrap();
        assert!(out.contains("quantum-entanglement"));
    }

    #[test]
    fn test_cosmetic_fields_never_fail() {
        let json = manifest_json(r#", "icon": 42, "description": null, "author": ["a"]"#);
        let manifest = PluginManifest::from_json(&json).unwrap();
        assert!(manifest.icon.is_empty());
        assert!(manifest.description.is_empty());
        assert!(manifest.author.is_empty());
    }

    #[test]
    fn test_peek_identifier() {
        assert_eq!(
            PluginManifest::peek_identifier(r#"{"id": "com.a.b", "version": "x"}"#),
            Some("com.a.b".to_string())
        );
        assert_eq!(PluginManifest::peek_identifier("not json"), None);
        assert_eq!(PluginManifest::peek_identifier(r#"{"id": ""}"#), None);
    }

    #[test]
    fn test_signing_payload_excludes_signature() {
        let mut manifest = PluginManifest::from_json(&manifest_json("")).unwrap();
        let unsigned = manifest.signing_payload().unwrap();
        manifest.signature = Some("c2ln".to_string());
        assert_eq!(manifest.signing_payload().unwrap(), unsigned);
        assert!(!String::from_utf8(unsigned).unwrap().contains("signature"));
    }

    #[test]
    fn test_host_compatibility() {
        let json = manifest_json("").replace("\"0.1\"", "\"1.4\"");
        let manifest = PluginManifest::from_json(&json).unwrap();
        assert!(manifest.is_compatible_with("1.4.0"));
        assert!(manifest.is_compatible_with("2.0"));
        assert!(!manifest.is_compatible_with("1.3.9"));
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_valid_identifier("com.example.tool"));
        assert!(is_valid_identifier("word-count_2"));
        assert!(is_valid_identifier("a"));

        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier(".hidden"));
        assert!(!is_valid_identifier("trailing-"));
        assert!(!is_valid_identifier("com..example"));
        assert!(!is_valid_identifier("has space"));
        assert!(!is_valid_identifier("slash/inside"));
        assert!(!is_valid_identifier(&"a".repeat(129)));
    }

    #[test]
    fn test_load_from_dir() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(MANIFEST_FILE), manifest_json("")).unwrap();

        let manifest = PluginManifest::load_from_dir(temp_dir.path()).unwrap();
        assert_eq!(manifest.name, "Example Tool");
    }

    #[test]
    fn test_load_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let err = PluginManifest::load_from_dir(temp_dir.path()).unwrap_err();
        assert!(matches!(err, ManifestError::NotFound(_)));
    }

    #[test]
    fn test_malformed_json() {
        let err = PluginManifest::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ManifestError::JsonParse(_)));
    }
}
