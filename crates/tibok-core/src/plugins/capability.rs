//! Capabilities, trust tiers and the approval rules built on them.
//!
//! Capabilities are declared in manifests as string tokens. Each known token
//! maps to a [`Capability`] variant with a fixed [`RiskLevel`]; unknown tokens
//! are kept verbatim as [`Capability::Unrecognized`] and rated high risk.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Risk classification of a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Moderate,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Safe => write!(f, "safe"),
            Self::Moderate => write!(f, "moderate"),
            Self::High => write!(f, "high"),
        }
    }
}

/// A named access right requested by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Capability {
    /// Command palette entries.
    Commands,
    /// Slash commands in the editor.
    SlashCommands,
    /// Panels, toolbar items and other interface contributions.
    Ui,
    DocumentRead,
    DocumentWrite,
    Clipboard,
    FilesystemRead,
    FilesystemWrite,
    Network,
    /// Spawning external programs.
    Process,
    /// A token this host does not know. Kept verbatim for forward compatibility.
    Unrecognized(String),
}

impl Capability {
    /// Every capability the host knows about.
    pub const KNOWN: [Capability; 10] = [
        Self::Commands,
        Self::SlashCommands,
        Self::Ui,
        Self::DocumentRead,
        Self::DocumentWrite,
        Self::Clipboard,
        Self::FilesystemRead,
        Self::FilesystemWrite,
        Self::Network,
        Self::Process,
    ];

    /// Maps a manifest token to a capability. Never fails.
    pub fn from_token(token: &str) -> Self {
        match token.trim() {
            "commands" => Self::Commands,
            "slash-commands" => Self::SlashCommands,
            "ui" => Self::Ui,
            "document-read" => Self::DocumentRead,
            "document-write" => Self::DocumentWrite,
            "clipboard" => Self::Clipboard,
            "filesystem-read" => Self::FilesystemRead,
            "filesystem-write" => Self::FilesystemWrite,
            "network" => Self::Network,
            "process" => Self::Process,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    /// The manifest token for this capability.
    pub fn token(&self) -> &str {
        match self {
            Self::Commands => "commands",
            Self::SlashCommands => "slash-commands",
            Self::Ui => "ui",
            Self::DocumentRead => "document-read",
            Self::DocumentWrite => "document-write",
            Self::Clipboard => "clipboard",
            Self::FilesystemRead => "filesystem-read",
            Self::FilesystemWrite => "filesystem-write",
            Self::Network => "network",
            Self::Process => "process",
            Self::Unrecognized(raw) => raw,
        }
    }

    pub fn risk(&self) -> RiskLevel {
        match self {
            Self::Commands | Self::SlashCommands | Self::Ui => RiskLevel::Safe,
            Self::DocumentRead | Self::DocumentWrite | Self::Clipboard | Self::FilesystemRead => {
                RiskLevel::Moderate
            }
            Self::FilesystemWrite | Self::Network | Self::Process | Self::Unrecognized(_) => {
                RiskLevel::High
            }
        }
    }

    /// Short label shown in the approval prompt.
    pub fn display_name(&self) -> String {
        match self {
            Self::Commands => "Command palette entries".to_string(),
            Self::SlashCommands => "Slash commands".to_string(),
            Self::Ui => "Interface contributions".to_string(),
            Self::DocumentRead => "Read the open document".to_string(),
            Self::DocumentWrite => "Modify the open document".to_string(),
            Self::Clipboard => "Clipboard access".to_string(),
            Self::FilesystemRead => "Read files".to_string(),
            Self::FilesystemWrite => "Write files".to_string(),
            Self::Network => "Network access".to_string(),
            Self::Process => "Run external programs".to_string(),
            Self::Unrecognized(raw) => format!("Unlisted capability ({raw})"),
        }
    }

    /// User-facing explanation shown under the display name.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Commands => "Adds entries to the command palette.",
            Self::SlashCommands => "Adds commands that can be typed into the editor with '/'.",
            Self::Ui => "Adds panels, toolbar buttons or menu items.",
            Self::DocumentRead => "Can read the full contents of the document you are editing.",
            Self::DocumentWrite => "Can change the contents of the document you are editing.",
            Self::Clipboard => "Can read from and write to the system clipboard.",
            Self::FilesystemRead => "Can read files on your computer outside the open document.",
            Self::FilesystemWrite => "Can create, modify and delete files on your computer.",
            Self::Network => "Can send and receive data over the internet.",
            Self::Process => "Can launch other programs with your user's permissions.",
            Self::Unrecognized(_) => {
                "This host does not recognize this capability. Treat it as unrestricted access."
            }
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }
}

impl From<String> for Capability {
    fn from(token: String) -> Self {
        Self::from_token(&token)
    }
}

impl From<Capability> for String {
    fn from(capability: Capability) -> Self {
        capability.token().to_string()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Trust classification of a plugin. Ordered from least to most trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    /// Unreviewed third party.
    Community,
    /// Reviewed third party.
    Verified,
    /// Bundled with the host.
    Official,
}

impl TrustTier {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "community" => Some(Self::Community),
            "verified" => Some(Self::Verified),
            "official" => Some(Self::Official),
            _ => None,
        }
    }
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Community => write!(f, "community"),
            Self::Verified => write!(f, "verified"),
            Self::Official => write!(f, "official"),
        }
    }
}

/// Where a manifest came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestOrigin {
    /// Shipped inside the host application.
    Builtin,
    /// Installed from the remote catalog.
    Registry,
    /// Placed into the plugins directory by hand.
    Local,
}

/// Facts about a manifest's source that bound how much it may be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustContext {
    /// Where the manifest came from.
    pub origin: ManifestOrigin,
    /// The manifest signature verified against a trusted key.
    pub signature_verified: bool,
}

impl TrustContext {
    pub fn new(origin: ManifestOrigin) -> Self {
        Self { origin, signature_verified: false }
    }

    pub fn with_verified_signature(mut self, verified: bool) -> Self {
        self.signature_verified = verified;
        self
    }
}

/// Resolves the effective trust tier of a manifest.
///
/// A declared tier is honoured only as far as its source allows: bundled or
/// signed manifests keep it, catalog installs are capped at `verified`, and
/// sideloaded unsigned manifests are always `community`.
pub fn resolve_tier(declared: Option<TrustTier>, context: TrustContext) -> TrustTier {
    let default = match context.origin {
        ManifestOrigin::Builtin => TrustTier::Official,
        ManifestOrigin::Registry | ManifestOrigin::Local => TrustTier::Community,
    };
    let declared = declared.unwrap_or(default);

    if context.signature_verified {
        return declared;
    }

    match context.origin {
        ManifestOrigin::Builtin => declared,
        ManifestOrigin::Registry => declared.min(TrustTier::Verified),
        ManifestOrigin::Local => TrustTier::Community,
    }
}

/// Whether installing or enabling needs an interactive approval.
///
/// Official plugins never do. Everything else does as soon as it asks for
/// any capability at all.
pub fn requires_approval(tier: TrustTier, capabilities: &[Capability]) -> bool {
    tier != TrustTier::Official && !capabilities.is_empty()
}

/// Whether an approval must carry an explicit acknowledgment.
pub fn requires_acknowledgment(tier: TrustTier, capabilities: &[Capability]) -> bool {
    tier == TrustTier::Community && capabilities.iter().any(|c| c.risk() >= RiskLevel::Moderate)
}

/// Highest risk in a capability set, `None` when the set is empty.
pub fn highest_risk(capabilities: &[Capability]) -> Option<RiskLevel> {
    capabilities.iter().map(Capability::risk).max()
}

/// Maps declared tokens to capabilities, dropping duplicates but keeping order.
pub fn resolve_capabilities<S: AsRef<str>>(tokens: &[S]) -> Vec<Capability> {
    let mut resolved: Vec<Capability> = Vec::with_capacity(tokens.len());
    for token in tokens {
        let capability = Capability::from_token(token.as_ref());
        if !resolved.contains(&capability) {
            resolved.push(capability);
        }
    }
    resolved
}

/// The outcome of trust resolution for one manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustAssessment {
    /// Effective tier.
    pub tier: TrustTier,
    /// Declared capabilities, deduplicated.
    pub capabilities: Vec<Capability>,
    pub requires_approval: bool,
    pub requires_acknowledgment: bool,
}

impl TrustAssessment {
    pub fn new(declared: Option<TrustTier>, capabilities: &[Capability], context: TrustContext) -> Self {
        let tier = resolve_tier(declared, context);
        let mut unique: Vec<Capability> = Vec::with_capacity(capabilities.len());
        for capability in capabilities {
            if !unique.contains(capability) {
                unique.push(capability.clone());
            }
        }

        Self {
            tier,
            requires_approval: requires_approval(tier, &unique),
            requires_acknowledgment: requires_acknowledgment(tier, &unique),
            capabilities: unique,
        }
    }

    /// Tokens of every capability that consent must cover.
    pub fn consent_tokens(&self) -> Vec<String> {
        if self.requires_approval {
            self.capabilities.iter().map(|c| c.token().to_string()).collect()
        } else {
            Vec::new()
        }
    }

    /// Whether a previously granted token set covers this assessment.
    pub fn is_covered_by(&self, granted: &[String]) -> bool {
        !self.requires_approval
            || self.capabilities.iter().all(|c| granted.iter().any(|g| g == c.token()))
    }
}
