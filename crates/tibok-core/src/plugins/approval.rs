//! Capability approval gate.
//!
//! Install and enable paths that need consent call [`ApprovalGate::request`]
//! and suspend until the host UI resolves the matching [`ApprovalRequest`]
//! taken from its [`ApprovalInbox`]. A request resolves exactly once:
//! `approve` and `deny` consume it, and dropping it unresolved counts as deny.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::capability::{Capability, TrustAssessment, TrustTier};
use super::manifest::PluginManifest;

/// Outcome of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

/// A pending consent decision for one plugin.
#[derive(Debug)]
pub struct ApprovalRequest {
    manifest: PluginManifest,
    assessment: TrustAssessment,
    acknowledged: bool,
    responder: Option<oneshot::Sender<ApprovalDecision>>,
}

impl ApprovalRequest {
    fn new(
        manifest: PluginManifest,
        assessment: TrustAssessment,
        responder: oneshot::Sender<ApprovalDecision>,
    ) -> Self {
        Self { manifest, assessment, acknowledged: false, responder: Some(responder) }
    }

    /// Manifest of the plugin asking for access.
    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    /// Capabilities to show in the prompt.
    pub fn capabilities(&self) -> &[Capability] {
        &self.assessment.capabilities
    }

    pub fn tier(&self) -> TrustTier {
        self.assessment.tier
    }

    /// Community plugins asking for moderate or high risk access must be
    /// acknowledged before they can be approved.
    pub fn requires_acknowledgment(&self) -> bool {
        self.assessment.requires_acknowledgment
    }

    /// Whether the host recorded an acknowledgment.
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    /// Records that the user read and accepted the risk warning.
    pub fn acknowledge(&mut self) {
        self.acknowledged = true;
    }

    /// Grants the requested capabilities.
    ///
    /// Hands the request back unresolved when an acknowledgment is required
    /// but was not given.
    pub fn approve(mut self) -> Result<(), Self> {
        if self.requires_acknowledgment() && !self.acknowledged {
            return Err(self);
        }
        debug!(plugin = %self.manifest.id, "Capability approval granted");
        self.resolve(ApprovalDecision::Approve);
        Ok(())
    }

    /// Refuses the requested capabilities.
    pub fn deny(mut self) {
        debug!(plugin = %self.manifest.id, "Capability approval denied");
        self.resolve(ApprovalDecision::Deny);
    }

    fn resolve(&mut self, decision: ApprovalDecision) {
        if let Some(responder) = self.responder.take() {
            // The waiting operation may already be gone; nothing to report then.
            let _ = responder.send(decision);
        }
    }
}

impl Drop for ApprovalRequest {
    fn drop(&mut self) {
        if self.responder.is_some() {
            debug!(plugin = %self.manifest.id, "Approval dismissed without a choice, denying");
            self.resolve(ApprovalDecision::Deny);
        }
    }
}

/// Sending half, held by the installer.
#[derive(Debug, Clone)]
pub struct ApprovalGate {
    sender: mpsc::Sender<ApprovalRequest>,
}

/// Receiving half, held by whatever presents approvals to the user.
#[derive(Debug)]
pub struct ApprovalInbox {
    receiver: mpsc::Receiver<ApprovalRequest>,
}

/// Creates a connected gate and inbox.
pub fn approval_channel(buffer: usize) -> (ApprovalGate, ApprovalInbox) {
    let (sender, receiver) = mpsc::channel(buffer.max(1));
    (ApprovalGate { sender }, ApprovalInbox { receiver })
}

impl ApprovalGate {
    /// Raises an approval request and waits for its resolution.
    ///
    /// Resolves to [`ApprovalDecision::Deny`] if nobody is listening or the
    /// request is dropped unanswered. There is no timeout.
    pub async fn request(
        &self,
        manifest: PluginManifest,
        assessment: TrustAssessment,
    ) -> ApprovalDecision {
        let (tx, rx) = oneshot::channel();
        let id = manifest.id.clone();
        let request = ApprovalRequest::new(manifest, assessment, tx);

        if self.sender.send(request).await.is_err() {
            warn!(plugin = %id, "No approval handler is listening, denying");
            return ApprovalDecision::Deny;
        }

        rx.await.unwrap_or(ApprovalDecision::Deny)
    }
}

impl ApprovalInbox {
    /// Waits for the next request. `None` once every gate is dropped.
    pub async fn next(&mut self) -> Option<ApprovalRequest> {
        self.receiver.recv().await
    }

    /// Returns a queued request without waiting.
    pub fn try_next(&mut self) -> Option<ApprovalRequest> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::capability::{ManifestOrigin, TrustContext};

    fn manifest(capabilities: &str) -> PluginManifest {
        PluginManifest::from_json(&format!(
            r#"{{"id": "com.example.tool", "name": "Tool", "version": "1.0.0",
                "minHostVersion": "0.1", "kind": "script", "capabilities": {}}}"#,
            capabilities
        ))
        .unwrap()
    }

    fn pending(capabilities: &str) -> (PluginManifest, TrustAssessment) {
        let manifest = manifest(capabilities);
        let assessment = manifest.assess(TrustContext::new(ManifestOrigin::Registry));
        (manifest, assessment)
    }

    #[tokio::test]
    async fn test_approve_resolves_waiting_request() {
        let (gate, mut inbox) = approval_channel(4);
        let (manifest, assessment) = pending(r#"["commands"]"#);

        let waiter = tokio::spawn(async move { gate.request(manifest, assessment).await });
        let request = inbox.next().await.unwrap();
        assert!(!request.requires_acknowledgment());
        assert_eq!(request.capabilities(), &[Capability::Commands]);
        request.approve().unwrap();

        assert_eq!(waiter.await.unwrap(), ApprovalDecision::Approve);
    }

    #[tokio::test]
    async fn test_deny_resolves_waiting_request() {
        let (gate, mut inbox) = approval_channel(4);
        let (manifest, assessment) = pending(r#"["network"]"#);

        let waiter = tokio::spawn(async move { gate.request(manifest, assessment).await });
        inbox.next().await.unwrap().deny();

        assert_eq!(waiter.await.unwrap(), ApprovalDecision::Deny);
    }

    #[tokio::test]
    async fn test_dismissed_request_is_denied() {
        let (gate, mut inbox) = approval_channel(4);
        let (manifest, assessment) = pending(r#"["network"]"#);

        let waiter = tokio::spawn(async move { gate.request(manifest, assessment).await });
        drop(inbox.next().await.unwrap());

        assert_eq!(waiter.await.unwrap(), ApprovalDecision::Deny);
    }

    #[tokio::test]
    async fn test_acknowledgment_required_before_approval() {
        let (gate, mut inbox) = approval_channel(4);
        let (manifest, assessment) = pending(r#"["process"]"#);

        let waiter = tokio::spawn(async move { gate.request(manifest, assessment).await });
        let request = inbox.next().await.unwrap();
        assert!(request.requires_acknowledgment());

        let mut request = request.approve().unwrap_err();
        assert!(!request.is_acknowledged());
        request.acknowledge();
        request.approve().unwrap();

        assert_eq!(waiter.await.unwrap(), ApprovalDecision::Approve);
    }

    #[tokio::test]
    async fn test_no_listener_denies() {
        let (gate, inbox) = approval_channel(1);
        drop(inbox);
        let (manifest, assessment) = pending(r#"["network"]"#);

        assert_eq!(gate.request(manifest, assessment).await, ApprovalDecision::Deny);
    }

    #[tokio::test]
    async fn test_inbox_closes_when_gates_dropped() {
        let (gate, mut inbox) = approval_channel(1);
        assert!(inbox.try_next().is_none());
        drop(gate);
        assert!(inbox.next().await.is_none());
    }
}
