//! The seam between the negotiation engines and the native security
//! package. `ClientCtx`/`ServerCtx` drive everything through this trait;
//! the production implementation is the `Sspi` adapter on Windows and
//! [`crate::mock::MockProvider`] everywhere tests need a scripted package.

use std::fmt;

use crate::{context::CtxFlags, error::Result, util::SecretBuf};

/// Security package to negotiate with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mech {
    #[default]
    Kerberos,
    Negotiate,
}

/// Explicit credentials for an initiator. Borrowed from the caller; the
/// engine keeps any copies it derives in wiped buffers.
#[derive(Clone, Copy)]
pub struct AuthIdentity<'a> {
    pub user: &'a str,
    pub domain: Option<&'a str>,
    pub password: Option<&'a str>,
}

impl fmt::Debug for AuthIdentity<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthIdentity")
            .field("user", &self.user)
            .field("domain", &self.domain)
            .field("password", &self.password.map(|_| "<redacted>"))
            .finish()
    }
}

/// Message protection level for [`SecurityProvider::encrypt`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Qop {
    /// Sign only; the payload stays readable.
    Integrity,
    /// Sign and seal.
    Confidential,
}

/// One handshake round's output.
#[derive(Debug)]
pub struct ProviderStep {
    pub token: Vec<u8>,
    pub complete: bool,
}

/// Per-context buffer sizes reported by the package. `security_trailer`
/// and `block_size` bound the trailer and padding segments of a wrapped
/// message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContextSizes {
    pub security_trailer: u32,
    pub block_size: u32,
}

/// Output of [`SecurityProvider::encrypt`]: the three wire segments,
/// already truncated to the lengths the package reported back.
#[derive(Debug)]
pub struct Sealed {
    pub trailer: Vec<u8>,
    pub payload: Vec<u8>,
    pub padding: Vec<u8>,
}

/// Output of [`SecurityProvider::decrypt`].
#[derive(Debug)]
pub struct Unsealed {
    pub payload: SecretBuf,
    /// True when the package reports a protection level other than
    /// integrity-only.
    pub encrypted: bool,
}

/// Native security package operations, one method per capability.
///
/// Handle types own their native resources: dropping a `Credential` or
/// `Context` releases it exactly once (release failures are logged and
/// swallowed, the handle is going away regardless).
pub trait SecurityProvider {
    type Credential;
    type Context;

    /// Largest byte length the package can address in one call. Inputs are
    /// checked against this before any native call is made.
    fn max_input_len(&self) -> usize;

    /// `principal` selects whose credentials the handle references (`None`
    /// means the current security context); `identity` supplies explicit
    /// user/domain/password material.
    fn acquire_client_credentials(
        &self,
        mech: Mech,
        principal: Option<&str>,
        identity: Option<&AuthIdentity<'_>>,
    ) -> Result<Self::Credential>;

    /// `service` is the SPN to accept for; `None` accepts with the process
    /// default credentials.
    fn acquire_server_credentials(
        &self,
        mech: Mech,
        service: Option<&str>,
    ) -> Result<Self::Credential>;

    /// Create or advance an initiator context. `ctx` is an in/out slot:
    /// `None` on the first round, the live handle afterwards. On error the
    /// slot is left untouched so the caller can release whatever handle
    /// exists.
    fn initialize_context(
        &self,
        cred: &Self::Credential,
        ctx: &mut Option<Self::Context>,
        target: &str,
        flags: CtxFlags,
        input: Option<&[u8]>,
    ) -> Result<ProviderStep>;

    /// Acceptor counterpart of [`initialize_context`].
    ///
    /// [`initialize_context`]: SecurityProvider::initialize_context
    fn accept_context(
        &self,
        cred: &Self::Credential,
        ctx: &mut Option<Self::Context>,
        input: &[u8],
    ) -> Result<ProviderStep>;

    fn query_sizes(&self, ctx: &Self::Context) -> Result<ContextSizes>;

    /// Name of the authenticated peer principal.
    fn query_authenticated_name(&self, ctx: &Self::Context) -> Result<String>;

    /// SPN the initiator targeted, as seen by the acceptor.
    fn query_target_name(&self, ctx: &Self::Context) -> Result<String>;

    fn encrypt(
        &self,
        ctx: &Self::Context,
        qop: Qop,
        sizes: ContextSizes,
        payload: &[u8],
    ) -> Result<Sealed>;

    fn decrypt(&self, ctx: &Self::Context, sealed: &[u8]) -> Result<Unsealed>;

    fn impersonate(&self, ctx: &Self::Context) -> Result<()>;

    fn revert(&self, ctx: &Self::Context) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_debug_redacts_password() {
        let id = AuthIdentity {
            user: "alice",
            domain: Some("EXAMPLE"),
            password: Some("hunter2"),
        };
        let s = format!("{:?}", id);
        assert!(s.contains("alice"));
        assert!(!s.contains("hunter2"));
    }
}
