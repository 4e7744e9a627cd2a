//! Client and server halves of the token negotiation state machine.
//!
//! A context is created with credentials already acquired, walks through
//! `Negotiating` while base64 tokens cross the wire, and reaches
//! `Established` when the security package reports completion. A provider
//! failure is terminal: both handles are released on the spot and the
//! error is returned again from every later call until `destroy`.

use std::{fmt, mem};

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::{
    codec,
    error::{Error, Result},
    name,
    provider::{AuthIdentity, Mech, Qop, SecurityProvider},
    util::SecretString,
};

// SEC_E_INTERNAL_ERROR
const INTERNAL_ERROR: i32 = 0x8009_0304_u32 as i32;

/// First byte selects no SASL security layer, the remaining three
/// advertise a zero maximum buffer size.
const NO_SECURITY_LAYER: [u8; 4] = [1, 0, 0, 0];

bitflags! {
    /// Context requirement flags, numerically identical to the
    /// `ISC_REQ_*` bits they are handed to the provider as.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CtxFlags: u32 {
        const DELEGATE = 0x0000_0001;
        const MUTUAL_AUTH = 0x0000_0002;
        const REPLAY_DETECT = 0x0000_0004;
        const SEQUENCE_DETECT = 0x0000_0008;
        const CONFIDENTIALITY = 0x0000_0010;
        const INTEGRITY = 0x0001_0000;
    }
}

impl Default for CtxFlags {
    fn default() -> Self {
        CtxFlags::MUTUAL_AUTH | CtxFlags::SEQUENCE_DETECT
    }
}

/// Outcome of a successful handshake operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthStatus {
    /// Send `response` to the peer and call `step` with its reply.
    Continue,
    /// The context is established.
    Complete,
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<()> {
    if len > max {
        Err(Error::ValueTooLarge { field })
    } else {
        Ok(())
    }
}

fn reserve(buf: &mut Vec<u8>, bytes: usize) -> Result<()> {
    buf.try_reserve_exact(bytes)
        .map_err(|_| Error::Allocation { bytes })
}

fn decode_limited<P: SecurityProvider>(provider: &P, token: &str) -> Result<Vec<u8>> {
    let buf = codec::decode(token)?;
    check_len("challenge", buf.len(), provider.max_input_len())?;
    Ok(buf)
}

enum ClientState<P: SecurityProvider> {
    Uninitialized,
    Credentialed {
        cred: P::Credential,
    },
    // ctx precedes cred so the context handle is released first.
    Negotiating {
        ctx: P::Context,
        cred: P::Credential,
    },
    Established {
        ctx: P::Context,
        // Never read again, but must stay live until destroy or drop.
        #[allow(dead_code)]
        cred: P::Credential,
        username: String,
    },
    Failed(Error),
}

impl<P: SecurityProvider> ClientState<P> {
    fn resume(cred: P::Credential, ctx: Option<P::Context>) -> Self {
        match ctx {
            Some(ctx) => ClientState::Negotiating { ctx, cred },
            None => ClientState::Credentialed { cred },
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ClientState::Uninitialized => "Uninitialized",
            ClientState::Credentialed { .. } => "Credentialed",
            ClientState::Negotiating { .. } => "Negotiating",
            ClientState::Established { .. } => "Established",
            ClientState::Failed(_) => "Failed",
        }
    }
}

/// Client side of a handshake. Owns the credential and context handles
/// and the most recent base64 response token.
pub struct ClientCtx<P: SecurityProvider> {
    provider: P,
    target: String,
    flags: CtxFlags,
    mech: Mech,
    state: ClientState<P>,
    response: Option<SecretString>,
    response_encrypted: bool,
}

impl<P: SecurityProvider> ClientCtx<P> {
    /// Acquire client credentials and return a context ready to `step`.
    ///
    /// `service` is rewritten from `service@host` to `service/host` form
    /// when it contains no `/`. When `identity` is absent but `principal`
    /// is given, the user and password are derived by splitting the
    /// principal on its first `:` (both halves percent-decoded) and the
    /// principal is not passed through to the provider.
    pub fn init(
        provider: P,
        mech: Mech,
        service: &str,
        principal: Option<&str>,
        flags: CtxFlags,
        identity: Option<AuthIdentity<'_>>,
    ) -> Result<ClientCtx<P>> {
        let target = name::normalize_spn(service);
        let derived = match (&identity, principal) {
            (None, Some(principal)) => Some(name::split_principal(principal)),
            _ => None,
        };
        let (principal, identity) = match &derived {
            Some((user, password)) => (
                None,
                Some(AuthIdentity {
                    user,
                    domain: None,
                    password: password.as_deref(),
                }),
            ),
            None => (principal, identity),
        };
        let max = provider.max_input_len();
        check_len("service", service.len(), max)?;
        if let Some(principal) = principal {
            check_len("principal", principal.len(), max)?;
        }
        if let Some(id) = &identity {
            check_len("user", id.user.len(), max)?;
            if let Some(domain) = id.domain {
                check_len("domain", domain.len(), max)?;
            }
            if let Some(password) = id.password {
                check_len("password", password.len(), max)?;
            }
        }
        let cred = provider.acquire_client_credentials(mech, principal, identity.as_ref())?;
        Ok(ClientCtx {
            provider,
            target,
            flags,
            mech,
            state: ClientState::Credentialed { cred },
            response: None,
            response_encrypted: false,
        })
    }

    /// Feed the server's latest token to the provider. The challenge is
    /// ignored on the first call, before a context handle exists. Any
    /// output token replaces `response`; the previous one is discarded
    /// before anything else happens, so a failed step never leaves a
    /// stale response behind.
    pub fn step(&mut self, challenge: &str) -> Result<AuthStatus> {
        self.response = None;
        let (cred, mut ctx) = match mem::replace(&mut self.state, ClientState::Uninitialized) {
            ClientState::Credentialed { cred } => (cred, None),
            ClientState::Negotiating { ctx, cred } => (cred, Some(ctx)),
            st @ ClientState::Established { .. } => {
                self.state = st;
                return Ok(AuthStatus::Complete);
            }
            ClientState::Failed(e) => {
                self.state = ClientState::Failed(e.clone());
                return Err(e);
            }
            ClientState::Uninitialized => return Err(Error::UninitializedContext),
        };
        let input = if ctx.is_none() {
            None
        } else {
            match decode_limited(&self.provider, challenge) {
                Ok(buf) => Some(buf),
                Err(e) => {
                    self.state = ClientState::resume(cred, ctx);
                    return Err(e);
                }
            }
        };
        let step = match self.provider.initialize_context(
            &cred,
            &mut ctx,
            &self.target,
            self.flags,
            input.as_deref(),
        ) {
            Ok(step) => step,
            Err(e) => return self.fail(e),
        };
        if !step.token.is_empty() {
            self.response = Some(SecretString::from(codec::encode(&step.token)));
        }
        let Some(ctx) = ctx else {
            return self.fail(Error::provider(
                "InitializeSecurityContext",
                INTERNAL_ERROR,
                "provider reported success without a context handle",
            ));
        };
        if step.complete {
            let username = match self.provider.query_authenticated_name(&ctx) {
                Ok(name) => name,
                Err(e) => return self.fail(e),
            };
            debug!(username = %username, target = %self.target, "client context established");
            self.state = ClientState::Established { ctx, cred, username };
            Ok(AuthStatus::Complete)
        } else {
            self.state = ClientState::Negotiating { ctx, cred };
            Ok(AuthStatus::Continue)
        }
    }

    /// Protect a message for the peer. `data` is the base64 payload to
    /// seal; when `user` is given it is ignored and the SASL authorization
    /// payload (no-security-layer prefix plus the user name) is sealed
    /// instead. With `protect` the provider must encrypt, otherwise it
    /// only signs. The framed result (trailer, payload, padding) lands
    /// base64-encoded in `response`.
    pub fn wrap(&mut self, data: &str, user: Option<&str>, protect: bool) -> Result<AuthStatus> {
        self.response = None;
        let ctx = match &self.state {
            ClientState::Established { ctx, .. } => ctx,
            ClientState::Failed(e) => return Err(e.clone()),
            _ => return Err(Error::UninitializedContext),
        };
        let max = self.provider.max_input_len();
        let payload = match user {
            Some(user) => {
                let len = user.len().saturating_add(NO_SECURITY_LAYER.len());
                check_len("user", len, max)?;
                let mut msg = Vec::new();
                reserve(&mut msg, len)?;
                msg.extend_from_slice(&NO_SECURITY_LAYER);
                msg.extend_from_slice(user.as_bytes());
                msg
            }
            None => {
                let buf = codec::decode(data)?;
                check_len("data", buf.len(), max)?;
                buf
            }
        };
        if protect && !self.flags.contains(CtxFlags::CONFIDENTIALITY) {
            warn!("confidentiality requested on a context negotiated without the confidentiality flag");
        }
        let qop = if protect { Qop::Confidential } else { Qop::Integrity };
        let sizes = match self.provider.query_sizes(ctx) {
            Ok(sizes) => sizes,
            Err(e) => return self.fail(e),
        };
        let sealed = match self.provider.encrypt(ctx, qop, sizes, &payload) {
            Ok(sealed) => sealed,
            Err(e) => return self.fail(e),
        };
        let total = sealed.trailer.len() + sealed.payload.len() + sealed.padding.len();
        let mut frame = Vec::new();
        reserve(&mut frame, total)?;
        frame.extend_from_slice(&sealed.trailer);
        frame.extend_from_slice(&sealed.payload);
        frame.extend_from_slice(&sealed.padding);
        self.response = Some(SecretString::from(codec::encode(&frame)));
        Ok(AuthStatus::Complete)
    }

    /// Unprotect a message from the peer. Stores whether the provider
    /// reported the message as encrypted (see [`response_encrypted`]) and
    /// leaves the decrypted payload base64-encoded in `response`.
    ///
    /// [`response_encrypted`]: ClientCtx::response_encrypted
    pub fn unwrap(&mut self, challenge: &str) -> Result<AuthStatus> {
        self.response = None;
        let ctx = match &self.state {
            ClientState::Established { ctx, .. } => ctx,
            ClientState::Failed(e) => return Err(e.clone()),
            _ => return Err(Error::UninitializedContext),
        };
        let sealed = decode_limited(&self.provider, challenge)?;
        let unsealed = match self.provider.decrypt(ctx, &sealed) {
            Ok(unsealed) => unsealed,
            Err(e) => return self.fail(e),
        };
        self.response_encrypted = unsealed.encrypted;
        if !unsealed.payload.is_empty() {
            self.response = Some(SecretString::from(codec::encode(&unsealed.payload)));
        }
        Ok(AuthStatus::Complete)
    }

    /// The most recent output token or unwrapped payload, base64-encoded.
    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    /// Whether the last unwrapped message was actually encrypted rather
    /// than only signed.
    pub fn response_encrypted(&self) -> bool {
        self.response_encrypted
    }

    /// The authenticated principal, available once established.
    pub fn username(&self) -> Option<&str> {
        match &self.state {
            ClientState::Established { username, .. } => Some(username),
            _ => None,
        }
    }

    pub fn mech(&self) -> Mech {
        self.mech
    }

    /// The flags requested at construction time.
    pub fn flags(&self) -> CtxFlags {
        self.flags
    }

    pub fn established(&self) -> bool {
        matches!(self.state, ClientState::Established { .. })
    }

    /// No-op. Handles are released by [`destroy`](ClientCtx::destroy) or
    /// when the context is dropped.
    pub fn clean(&mut self) {}

    /// Release the context handle, then the credential handle, and wipe
    /// the response buffer. Idempotent; later calls do nothing and later
    /// operations fail with [`Error::UninitializedContext`].
    pub fn destroy(&mut self) {
        self.state = ClientState::Uninitialized;
        self.response = None;
        self.response_encrypted = false;
        self.target = String::new();
    }

    fn fail<T>(&mut self, e: Error) -> Result<T> {
        self.state = ClientState::Failed(e.clone());
        Err(e)
    }
}

impl<P: SecurityProvider> fmt::Debug for ClientCtx<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCtx")
            .field("target", &self.target)
            .field("mech", &self.mech)
            .field("state", &self.state.name())
            .finish()
    }
}

enum ServerState<P: SecurityProvider> {
    Uninitialized,
    Credentialed {
        cred: P::Credential,
    },
    // ctx precedes cred so the context handle is released first.
    Negotiating {
        ctx: P::Context,
        cred: P::Credential,
    },
    Established {
        ctx: P::Context,
        // Never read again, but must stay live until destroy or drop.
        #[allow(dead_code)]
        cred: P::Credential,
        username: String,
        target: Option<String>,
    },
    Failed(Error),
}

impl<P: SecurityProvider> ServerState<P> {
    fn resume(cred: P::Credential, ctx: Option<P::Context>) -> Self {
        match ctx {
            Some(ctx) => ServerState::Negotiating { ctx, cred },
            None => ServerState::Credentialed { cred },
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ServerState::Uninitialized => "Uninitialized",
            ServerState::Credentialed { .. } => "Credentialed",
            ServerState::Negotiating { .. } => "Negotiating",
            ServerState::Established { .. } => "Established",
            ServerState::Failed(_) => "Failed",
        }
    }
}

/// Server side of a handshake.
pub struct ServerCtx<P: SecurityProvider> {
    provider: P,
    mech: Mech,
    explicit_service: bool,
    state: ServerState<P>,
    response: Option<SecretString>,
}

impl<P: SecurityProvider> ServerCtx<P> {
    /// Acquire server credentials. `service` names the service principal
    /// to accept for (normalized like the client's) and may be `None` or
    /// empty to accept for any principal the provider can vouch for; in
    /// that case the client-specified target is captured on completion
    /// and exposed through [`target_name`](ServerCtx::target_name).
    pub fn init(provider: P, mech: Mech, service: Option<&str>) -> Result<ServerCtx<P>> {
        let service = service.filter(|s| !s.is_empty());
        if let Some(service) = service {
            check_len("service", service.len(), provider.max_input_len())?;
        }
        let spn = service.map(name::normalize_spn);
        let cred = provider.acquire_server_credentials(mech, spn.as_deref())?;
        Ok(ServerCtx {
            provider,
            mech,
            explicit_service: spn.is_some(),
            state: ServerState::Credentialed { cred },
            response: None,
        })
    }

    /// Feed the client's latest token to the provider. On completion the
    /// authenticated client name is captured, and the client-specified
    /// target as well when no explicit service was given at `init`.
    pub fn step(&mut self, challenge: &str) -> Result<AuthStatus> {
        self.response = None;
        let (cred, mut ctx) = match mem::replace(&mut self.state, ServerState::Uninitialized) {
            ServerState::Credentialed { cred } => (cred, None),
            ServerState::Negotiating { ctx, cred } => (cred, Some(ctx)),
            st @ ServerState::Established { .. } => {
                self.state = st;
                return Ok(AuthStatus::Complete);
            }
            ServerState::Failed(e) => {
                self.state = ServerState::Failed(e.clone());
                return Err(e);
            }
            ServerState::Uninitialized => return Err(Error::UninitializedContext),
        };
        let input = match decode_limited(&self.provider, challenge) {
            Ok(buf) => buf,
            Err(e) => {
                self.state = ServerState::resume(cred, ctx);
                return Err(e);
            }
        };
        let step = match self.provider.accept_context(&cred, &mut ctx, &input) {
            Ok(step) => step,
            Err(e) => return self.fail(e),
        };
        if !step.token.is_empty() {
            self.response = Some(SecretString::from(codec::encode(&step.token)));
        }
        let Some(ctx) = ctx else {
            return self.fail(Error::provider(
                "AcceptSecurityContext",
                INTERNAL_ERROR,
                "provider reported success without a context handle",
            ));
        };
        if step.complete {
            let username = match self.provider.query_authenticated_name(&ctx) {
                Ok(name) => name,
                Err(e) => return self.fail(e),
            };
            let target = if self.explicit_service {
                None
            } else {
                match self.provider.query_target_name(&ctx) {
                    Ok(target) => Some(target),
                    Err(e) => return self.fail(e),
                }
            };
            debug!(username = %username, "server context established");
            self.state = ServerState::Established {
                ctx,
                cred,
                username,
                target,
            };
            Ok(AuthStatus::Complete)
        } else {
            self.state = ServerState::Negotiating { ctx, cred };
            Ok(AuthStatus::Continue)
        }
    }

    /// Run following calls on this thread as the authenticated client.
    /// Requires an established context.
    pub fn impersonate(&mut self) -> Result<()> {
        let ctx = match &self.state {
            ServerState::Established { ctx, .. } => ctx,
            ServerState::Failed(e) => return Err(e.clone()),
            _ => return Err(Error::UninitializedContext),
        };
        match self.provider.impersonate(ctx) {
            Ok(()) => Ok(()),
            Err(e) => self.fail(e),
        }
    }

    /// Undo a previous [`impersonate`](ServerCtx::impersonate).
    pub fn revert(&mut self) -> Result<()> {
        let ctx = match &self.state {
            ServerState::Established { ctx, .. } => ctx,
            ServerState::Failed(e) => return Err(e.clone()),
            _ => return Err(Error::UninitializedContext),
        };
        match self.provider.revert(ctx) {
            Ok(()) => Ok(()),
            Err(e) => self.fail(e),
        }
    }

    /// The most recent output token, base64-encoded.
    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    /// The authenticated client principal, available once established.
    pub fn username(&self) -> Option<&str> {
        match &self.state {
            ServerState::Established { username, .. } => Some(username),
            _ => None,
        }
    }

    /// The target the client asked for. Only captured when `init` was
    /// given no explicit service name.
    pub fn target_name(&self) -> Option<&str> {
        match &self.state {
            ServerState::Established { target, .. } => target.as_deref(),
            _ => None,
        }
    }

    pub fn mech(&self) -> Mech {
        self.mech
    }

    pub fn established(&self) -> bool {
        matches!(self.state, ServerState::Established { .. })
    }

    /// No-op. Handles are released by [`destroy`](ServerCtx::destroy) or
    /// when the context is dropped.
    pub fn clean(&mut self) {}

    /// Release the context handle, then the credential handle, and wipe
    /// the response buffer. Idempotent.
    pub fn destroy(&mut self) {
        self.state = ServerState::Uninitialized;
        self.response = None;
    }

    fn fail<T>(&mut self, e: Error) -> Result<T> {
        self.state = ServerState::Failed(e.clone());
        Err(e)
    }
}

impl<P: SecurityProvider> fmt::Debug for ServerCtx<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCtx")
            .field("mech", &self.mech)
            .field("state", &self.state.name())
            .finish()
    }
}
