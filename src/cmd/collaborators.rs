//! Minimal stand-ins for the two collaborators SPEC_FULL.md places outside
//! this crate's boundary: the secret-encryption primitive (§1, "the
//! secret-encryption primitive") and the email transport (§4.9,
//! `EmailSender`). Production deployments replace both with the real
//! subsystems; these exist so the daemon binary links and runs end to end.

use async_trait::async_trait;
use tracing::info;

use ando_core::model::{Build, Project, Secret};
use ando_core::status::EmailSender;
use ando_core::SecretDecryptor;

/// Treats a secret's stored bytes as already-decrypted UTF-8. The actual
/// cipher and key management are an out-of-scope collaborator (§1); this
/// crate only decides when to call it.
pub struct PassthroughSecretDecryptor;

#[async_trait]
impl SecretDecryptor for PassthroughSecretDecryptor {
    async fn decrypt(&self, secret: &Secret) -> anyhow::Result<String> {
        Ok(String::from_utf8_lossy(&secret.encrypted_value).to_string())
    }
}

/// Logs the intent to send a failure notification instead of dispatching
/// one. Address resolution (driven by the out-of-scope user-management
/// subsystem) is not wired up, so `resolve_address` always reports "no
/// address" and `maybe_notify_failure` becomes a no-op — exactly the
/// "unresolvable address" case §4.9 already requires callers to handle
/// silently.
pub struct LoggingEmailSender;

#[async_trait]
impl EmailSender for LoggingEmailSender {
    async fn send_failure_notification(&self, address: &str, project: &Project, build: &Build) -> anyhow::Result<()> {
        info!(address, project_id = project.id.0, build_id = build.id.0, "would send failure notification email");
        Ok(())
    }

    async fn resolve_address(&self, _project: &Project) -> Option<String> {
        None
    }
}
