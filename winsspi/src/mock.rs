//! Scripted security package for exercising the engines without a native
//! provider. Every operation is counted, handle releases are recorded so
//! tests can assert each handle is freed exactly once, and handshake
//! rounds are driven from a script.

use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;

use crate::{
    context::CtxFlags,
    error::{Error, Result},
    provider::{
        AuthIdentity, ContextSizes, Mech, ProviderStep, Qop, Sealed, SecurityProvider, Unsealed,
    },
    util::SecretBuf,
};

const INVALID_TOKEN: i32 = 0x8009_0308_u32 as i32;

/// One scripted handshake round.
#[derive(Clone, Debug)]
pub struct Round {
    pub token: Vec<u8>,
    pub complete: bool,
}

impl Round {
    /// More rounds follow this token.
    pub fn partial(token: &[u8]) -> Round {
        Round {
            token: token.to_vec(),
            complete: false,
        }
    }

    /// This token (possibly empty) finishes the handshake.
    pub fn finished(token: &[u8]) -> Round {
        Round {
            token: token.to_vec(),
            complete: true,
        }
    }
}

/// Per-operation call counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Calls {
    pub acquire_client: usize,
    pub acquire_server: usize,
    pub initialize: usize,
    pub accept: usize,
    pub query_sizes: usize,
    pub query_name: usize,
    pub query_target: usize,
    pub encrypt: usize,
    pub decrypt: usize,
    pub impersonate: usize,
    pub revert: usize,
}

impl Calls {
    pub fn total(&self) -> usize {
        self.acquire_client
            + self.acquire_server
            + self.initialize
            + self.accept
            + self.query_sizes
            + self.query_name
            + self.query_target
            + self.encrypt
            + self.decrypt
            + self.impersonate
            + self.revert
    }
}

/// Arguments seen by an acquire call, password reduced to presence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcquireRecord {
    pub mech: Mech,
    pub principal: Option<String>,
    pub user: Option<String>,
    pub domain: Option<String>,
    pub has_password: bool,
}

struct Ledger {
    calls: Calls,
    next_id: u64,
    issued_creds: Vec<u64>,
    freed_creds: Vec<u64>,
    issued_ctxs: Vec<u64>,
    freed_ctxs: Vec<u64>,
    init_script: VecDeque<Result<Round>>,
    accept_script: VecDeque<Result<Round>>,
    init_inputs: Vec<Option<Vec<u8>>>,
    init_targets: Vec<String>,
    init_flags: Vec<CtxFlags>,
    accept_inputs: Vec<Vec<u8>>,
    client_acquires: Vec<AcquireRecord>,
    server_acquires: Vec<Option<String>>,
    acquire_error: Option<Error>,
    query_name_error: Option<Error>,
    query_target_error: Option<Error>,
    encrypt_error: Option<Error>,
    decrypt_error: Option<Error>,
    impersonate_error: Option<Error>,
    encrypt_qops: Vec<Qop>,
    encrypt_payloads: Vec<Vec<u8>>,
    decrypt_inputs: Vec<Vec<u8>>,
    unseal: Option<(Vec<u8>, bool)>,
    sizes: ContextSizes,
    max_input_len: usize,
    username: String,
    target: String,
}

impl Ledger {
    fn new() -> Ledger {
        Ledger {
            calls: Calls::default(),
            next_id: 0,
            issued_creds: Vec::new(),
            freed_creds: Vec::new(),
            issued_ctxs: Vec::new(),
            freed_ctxs: Vec::new(),
            init_script: VecDeque::new(),
            accept_script: VecDeque::new(),
            init_inputs: Vec::new(),
            init_targets: Vec::new(),
            init_flags: Vec::new(),
            accept_inputs: Vec::new(),
            client_acquires: Vec::new(),
            server_acquires: Vec::new(),
            acquire_error: None,
            query_name_error: None,
            query_target_error: None,
            encrypt_error: None,
            decrypt_error: None,
            impersonate_error: None,
            encrypt_qops: Vec::new(),
            encrypt_payloads: Vec::new(),
            decrypt_inputs: Vec::new(),
            unseal: None,
            sizes: ContextSizes {
                security_trailer: 16,
                block_size: 8,
            },
            max_input_len: usize::MAX,
            username: "mock@REALM".to_string(),
            target: "service/host".to_string(),
        }
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Credential handle issued by [`MockProvider`]. Dropping it records the
/// release in the shared ledger.
pub struct MockCredential {
    id: u64,
    ledger: Arc<Mutex<Ledger>>,
}

impl Drop for MockCredential {
    fn drop(&mut self) {
        self.ledger.lock().freed_creds.push(self.id);
    }
}

/// Context handle issued by [`MockProvider`].
pub struct MockContext {
    id: u64,
    ledger: Arc<Mutex<Ledger>>,
}

impl Drop for MockContext {
    fn drop(&mut self) {
        self.ledger.lock().freed_ctxs.push(self.id);
    }
}

/// Shared-state scripted provider. Clones observe the same ledger, so a
/// test can keep one clone for assertions while the engine owns another.
#[derive(Clone)]
pub struct MockProvider {
    ledger: Arc<Mutex<Ledger>>,
}

impl MockProvider {
    pub fn new() -> MockProvider {
        MockProvider {
            ledger: Arc::new(Mutex::new(Ledger::new())),
        }
    }

    pub fn with_max_input_len(self, len: usize) -> Self {
        self.ledger.lock().max_input_len = len;
        self
    }

    pub fn with_sizes(self, security_trailer: u32, block_size: u32) -> Self {
        self.ledger.lock().sizes = ContextSizes {
            security_trailer,
            block_size,
        };
        self
    }

    pub fn with_username(self, name: &str) -> Self {
        self.ledger.lock().username = name.to_string();
        self
    }

    pub fn with_target(self, name: &str) -> Self {
        self.ledger.lock().target = name.to_string();
        self
    }

    /// Queue outcomes for successive `initialize_context` calls.
    pub fn script_initialize(&self, rounds: impl IntoIterator<Item = Round>) {
        self.ledger.lock().init_script.extend(rounds.into_iter().map(Ok));
    }

    /// Queue outcomes for successive `accept_context` calls.
    pub fn script_accept(&self, rounds: impl IntoIterator<Item = Round>) {
        self.ledger.lock().accept_script.extend(rounds.into_iter().map(Ok));
    }

    /// Queue a failing handshake round.
    pub fn fail_initialize(&self, code: i32, message: &str) {
        self.ledger
            .lock()
            .init_script
            .push_back(Err(Error::provider("InitializeSecurityContext", code, message)));
    }

    pub fn fail_accept(&self, code: i32, message: &str) {
        self.ledger
            .lock()
            .accept_script
            .push_back(Err(Error::provider("AcceptSecurityContext", code, message)));
    }

    /// Make the next acquire call fail.
    pub fn fail_acquire(&self, code: i32, message: &str) {
        self.ledger.lock().acquire_error =
            Some(Error::provider("AcquireCredentialsHandle", code, message));
    }

    /// Make the next authenticated-name query fail.
    pub fn fail_query_name(&self, code: i32, message: &str) {
        self.ledger.lock().query_name_error =
            Some(Error::provider("QueryContextAttributes", code, message));
    }

    /// Make the next target-name query fail.
    pub fn fail_query_target(&self, code: i32, message: &str) {
        self.ledger.lock().query_target_error =
            Some(Error::provider("QueryContextAttributes", code, message));
    }

    /// Make the next encrypt call fail.
    pub fn fail_encrypt(&self, code: i32, message: &str) {
        self.ledger.lock().encrypt_error =
            Some(Error::provider("EncryptMessage", code, message));
    }

    /// Make the next decrypt call fail.
    pub fn fail_decrypt(&self, code: i32, message: &str) {
        self.ledger.lock().decrypt_error =
            Some(Error::provider("DecryptMessage", code, message));
    }

    /// Make the next impersonate call fail.
    pub fn fail_impersonate(&self, code: i32, message: &str) {
        self.ledger.lock().impersonate_error =
            Some(Error::provider("ImpersonateSecurityContext", code, message));
    }

    /// Fix the payload and protection flag the next decrypt returns.
    pub fn set_unsealed(&self, payload: &[u8], encrypted: bool) {
        self.ledger.lock().unseal = Some((payload.to_vec(), encrypted));
    }

    pub fn calls(&self) -> Calls {
        self.ledger.lock().calls
    }

    pub fn client_acquires(&self) -> Vec<AcquireRecord> {
        self.ledger.lock().client_acquires.clone()
    }

    pub fn server_acquires(&self) -> Vec<Option<String>> {
        self.ledger.lock().server_acquires.clone()
    }

    pub fn initialize_inputs(&self) -> Vec<Option<Vec<u8>>> {
        self.ledger.lock().init_inputs.clone()
    }

    pub fn initialize_targets(&self) -> Vec<String> {
        self.ledger.lock().init_targets.clone()
    }

    pub fn initialize_flags(&self) -> Vec<CtxFlags> {
        self.ledger.lock().init_flags.clone()
    }

    pub fn accept_inputs(&self) -> Vec<Vec<u8>> {
        self.ledger.lock().accept_inputs.clone()
    }

    pub fn encrypt_qops(&self) -> Vec<Qop> {
        self.ledger.lock().encrypt_qops.clone()
    }

    pub fn encrypt_payloads(&self) -> Vec<Vec<u8>> {
        self.ledger.lock().encrypt_payloads.clone()
    }

    pub fn decrypt_inputs(&self) -> Vec<Vec<u8>> {
        self.ledger.lock().decrypt_inputs.clone()
    }

    /// Number of handles issued and not yet released.
    pub fn live_handles(&self) -> usize {
        let lg = self.ledger.lock();
        (lg.issued_creds.len() - lg.freed_creds.len())
            + (lg.issued_ctxs.len() - lg.freed_ctxs.len())
    }

    /// Every issued handle must have been released exactly once.
    pub fn assert_freed_once(&self) {
        let lg = self.ledger.lock();
        let sorted = |ids: &[u64]| {
            let mut ids = ids.to_vec();
            ids.sort_unstable();
            ids
        };
        assert_eq!(
            sorted(&lg.issued_creds),
            sorted(&lg.freed_creds),
            "credential handles not freed exactly once"
        );
        assert_eq!(
            sorted(&lg.issued_ctxs),
            sorted(&lg.freed_ctxs),
            "context handles not freed exactly once"
        );
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        MockProvider::new()
    }
}

impl SecurityProvider for MockProvider {
    type Credential = MockCredential;
    type Context = MockContext;

    fn max_input_len(&self) -> usize {
        self.ledger.lock().max_input_len
    }

    fn acquire_client_credentials(
        &self,
        mech: Mech,
        principal: Option<&str>,
        identity: Option<&AuthIdentity<'_>>,
    ) -> Result<MockCredential> {
        let mut lg = self.ledger.lock();
        lg.calls.acquire_client += 1;
        lg.client_acquires.push(AcquireRecord {
            mech,
            principal: principal.map(str::to_string),
            user: identity.map(|i| i.user.to_string()),
            domain: identity.and_then(|i| i.domain.map(str::to_string)),
            has_password: identity.and_then(|i| i.password).is_some(),
        });
        if let Some(e) = lg.acquire_error.take() {
            return Err(e);
        }
        let id = lg.alloc_id();
        lg.issued_creds.push(id);
        Ok(MockCredential {
            id,
            ledger: self.ledger.clone(),
        })
    }

    fn acquire_server_credentials(
        &self,
        _mech: Mech,
        service: Option<&str>,
    ) -> Result<MockCredential> {
        let mut lg = self.ledger.lock();
        lg.calls.acquire_server += 1;
        lg.server_acquires.push(service.map(str::to_string));
        if let Some(e) = lg.acquire_error.take() {
            return Err(e);
        }
        let id = lg.alloc_id();
        lg.issued_creds.push(id);
        Ok(MockCredential {
            id,
            ledger: self.ledger.clone(),
        })
    }

    fn initialize_context(
        &self,
        _cred: &MockCredential,
        ctx: &mut Option<MockContext>,
        target: &str,
        flags: CtxFlags,
        input: Option<&[u8]>,
    ) -> Result<ProviderStep> {
        let mut lg = self.ledger.lock();
        lg.calls.initialize += 1;
        lg.init_inputs.push(input.map(<[u8]>::to_vec));
        lg.init_targets.push(target.to_string());
        lg.init_flags.push(flags);
        let round = lg
            .init_script
            .pop_front()
            .expect("unscripted InitializeSecurityContext call")?;
        if ctx.is_none() {
            let id = lg.alloc_id();
            lg.issued_ctxs.push(id);
            *ctx = Some(MockContext {
                id,
                ledger: self.ledger.clone(),
            });
        }
        Ok(ProviderStep {
            token: round.token,
            complete: round.complete,
        })
    }

    fn accept_context(
        &self,
        _cred: &MockCredential,
        ctx: &mut Option<MockContext>,
        input: &[u8],
    ) -> Result<ProviderStep> {
        let mut lg = self.ledger.lock();
        lg.calls.accept += 1;
        lg.accept_inputs.push(input.to_vec());
        let round = lg
            .accept_script
            .pop_front()
            .expect("unscripted AcceptSecurityContext call")?;
        if ctx.is_none() {
            let id = lg.alloc_id();
            lg.issued_ctxs.push(id);
            *ctx = Some(MockContext {
                id,
                ledger: self.ledger.clone(),
            });
        }
        Ok(ProviderStep {
            token: round.token,
            complete: round.complete,
        })
    }

    fn query_sizes(&self, _ctx: &MockContext) -> Result<ContextSizes> {
        let mut lg = self.ledger.lock();
        lg.calls.query_sizes += 1;
        Ok(lg.sizes)
    }

    fn query_authenticated_name(&self, _ctx: &MockContext) -> Result<String> {
        let mut lg = self.ledger.lock();
        lg.calls.query_name += 1;
        if let Some(e) = lg.query_name_error.take() {
            return Err(e);
        }
        Ok(lg.username.clone())
    }

    fn query_target_name(&self, _ctx: &MockContext) -> Result<String> {
        let mut lg = self.ledger.lock();
        lg.calls.query_target += 1;
        if let Some(e) = lg.query_target_error.take() {
            return Err(e);
        }
        Ok(lg.target.clone())
    }

    fn encrypt(
        &self,
        _ctx: &MockContext,
        qop: Qop,
        sizes: ContextSizes,
        payload: &[u8],
    ) -> Result<Sealed> {
        let mut lg = self.ledger.lock();
        lg.calls.encrypt += 1;
        lg.encrypt_qops.push(qop);
        lg.encrypt_payloads.push(payload.to_vec());
        if let Some(e) = lg.encrypt_error.take() {
            return Err(e);
        }
        let sealed_payload = match qop {
            Qop::Integrity => payload.to_vec(),
            Qop::Confidential => payload.iter().map(|b| b ^ 0x5a).collect(),
        };
        Ok(Sealed {
            trailer: vec![b'T'; sizes.security_trailer as usize],
            payload: sealed_payload,
            padding: vec![b'P'; sizes.block_size as usize],
        })
    }

    fn decrypt(&self, _ctx: &MockContext, sealed: &[u8]) -> Result<Unsealed> {
        let mut lg = self.ledger.lock();
        lg.calls.decrypt += 1;
        lg.decrypt_inputs.push(sealed.to_vec());
        if let Some(e) = lg.decrypt_error.take() {
            return Err(e);
        }
        if let Some((payload, encrypted)) = lg.unseal.take() {
            return Ok(Unsealed {
                payload: SecretBuf::from(payload),
                encrypted,
            });
        }
        // Default unseal strips the configured trailer and padding.
        let trailer = lg.sizes.security_trailer as usize;
        let padding = lg.sizes.block_size as usize;
        if sealed.len() < trailer + padding {
            return Err(Error::provider(
                "DecryptMessage",
                INVALID_TOKEN,
                "The token supplied to the function is invalid",
            ));
        }
        Ok(Unsealed {
            payload: SecretBuf::from(sealed[trailer..sealed.len() - padding].to_vec()),
            encrypted: false,
        })
    }

    fn impersonate(&self, _ctx: &MockContext) -> Result<()> {
        let mut lg = self.ledger.lock();
        lg.calls.impersonate += 1;
        if let Some(e) = lg.impersonate_error.take() {
            return Err(e);
        }
        Ok(())
    }

    fn revert(&self, _ctx: &MockContext) -> Result<()> {
        let mut lg = self.ledger.lock();
        lg.calls.revert += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_record_their_release() {
        let mock = MockProvider::new();
        let cred = mock.acquire_client_credentials(Mech::Kerberos, None, None).unwrap();
        let mut ctx = None;
        mock.script_initialize([Round::finished(b"tok")]);
        mock.initialize_context(&cred, &mut ctx, "svc/host", CtxFlags::default(), None)
            .unwrap();
        assert_eq!(mock.live_handles(), 2);
        drop(ctx);
        drop(cred);
        assert_eq!(mock.live_handles(), 0);
        mock.assert_freed_once();
    }

    #[test]
    fn scripted_failure_leaves_slot_untouched() {
        let mock = MockProvider::new();
        let cred = mock.acquire_client_credentials(Mech::Kerberos, None, None).unwrap();
        let mut ctx = None;
        mock.fail_initialize(INVALID_TOKEN, "bad token");
        let err = mock
            .initialize_context(&cred, &mut ctx, "svc/host", CtxFlags::default(), None)
            .unwrap_err();
        assert!(matches!(err, Error::Provider { operation: "InitializeSecurityContext", .. }));
        assert!(ctx.is_none());
    }

    #[test]
    fn default_encrypt_frames_with_marker_bytes() {
        let mock = MockProvider::new().with_sizes(4, 2);
        let cred = mock.acquire_client_credentials(Mech::Kerberos, None, None).unwrap();
        mock.script_initialize([Round::finished(b"")]);
        let mut ctx = None;
        mock.initialize_context(&cred, &mut ctx, "svc/host", CtxFlags::default(), None)
            .unwrap();
        let ctx = ctx.unwrap();
        let sizes = mock.query_sizes(&ctx).unwrap();
        let sealed = mock.encrypt(&ctx, Qop::Integrity, sizes, b"hi").unwrap();
        assert_eq!(sealed.trailer, b"TTTT");
        assert_eq!(sealed.payload, b"hi");
        assert_eq!(sealed.padding, b"PP");
    }
}
