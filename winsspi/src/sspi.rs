//! Adapter over the native Windows security packages. Wraps the raw
//! handle types so release happens exactly once on drop, and copies
//! provider-allocated buffers out before freeing them.

use std::{
    ffi::c_void,
    ops::{Deref, DerefMut},
    ptr,
};

use tracing::warn;
use windows::{
    core::{w, PCWSTR, PWSTR},
    Win32::{
        Foundation::{SEC_E_OK, SEC_I_CONTINUE_NEEDED},
        Security::{
            Authentication::Identity::{
                AcceptSecurityContext, AcquireCredentialsHandleW, DecryptMessage,
                DeleteSecurityContext, EncryptMessage, FreeContextBuffer,
                FreeCredentialsHandle, ImpersonateSecurityContext, InitializeSecurityContextW,
                QueryContextAttributesW, RevertSecurityContext, SecBuffer, SecBufferDesc,
                SecPkgContext_ClientSpecifiedTarget, SecPkgContext_NamesW, SecPkgContext_Sizes,
                ASC_REQ_ALLOCATE_MEMORY, ISC_REQ_ALLOCATE_MEMORY, ISC_REQ_FLAGS, SECBUFFER_DATA,
                SECBUFFER_PADDING, SECBUFFER_STREAM, SECBUFFER_TOKEN, SECBUFFER_VERSION,
                SECPKG_ATTR_CLIENT_SPECIFIED_TARGET, SECPKG_ATTR_NAMES, SECPKG_ATTR_SIZES,
                SECPKG_CRED, SECPKG_CRED_INBOUND, SECPKG_CRED_OUTBOUND, SECQOP_WRAP_NO_ENCRYPT,
                SECURITY_NETWORK_DREP, SEC_WINNT_AUTH_IDENTITY_UNICODE, SEC_WINNT_AUTH_IDENTITY_W,
            },
            Credentials::SecHandle,
        },
    },
};

use crate::{
    context::CtxFlags,
    error::{Error, Result},
    provider::{AuthIdentity, ContextSizes, Mech, ProviderStep, Qop, Sealed, SecurityProvider, Unsealed},
    util::{wipe, wipe_wide, SecretBuf},
};

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn provider_err(operation: &'static str, e: &windows::core::Error) -> Error {
    Error::provider(operation, e.code().0, e.message())
}

/// Owned credential handle, freed exactly once on drop.
pub struct CredHandle(SecHandle);

impl Drop for CredHandle {
    fn drop(&mut self) {
        if let Err(e) = unsafe { FreeCredentialsHandle(&self.0) } {
            warn!(error = %e, "FreeCredentialsHandle failed");
        }
    }
}

/// Owned security context handle, deleted exactly once on drop.
#[derive(Default)]
pub struct CtxHandle(SecHandle);

impl Deref for CtxHandle {
    type Target = SecHandle;

    fn deref(&self) -> &SecHandle {
        &self.0
    }
}

impl DerefMut for CtxHandle {
    fn deref_mut(&mut self) -> &mut SecHandle {
        &mut self.0
    }
}

impl Drop for CtxHandle {
    fn drop(&mut self) {
        // A zeroed handle was never established by the package.
        if self.0.dwLower == 0 && self.0.dwUpper == 0 {
            return;
        }
        if let Err(e) = unsafe { DeleteSecurityContext(&self.0) } {
            warn!(error = %e, "DeleteSecurityContext failed");
        }
    }
}

// Wide-character copies of an identity, alive for the duration of one
// acquire call. The password copy is wiped on drop.
struct WideIdentity {
    user: Vec<u16>,
    domain: Vec<u16>,
    password: Vec<u16>,
}

impl WideIdentity {
    fn new(id: &AuthIdentity<'_>) -> WideIdentity {
        WideIdentity {
            user: to_wide(id.user),
            domain: id.domain.map(to_wide).unwrap_or_default(),
            password: id.password.map(to_wide).unwrap_or_default(),
        }
    }

    fn as_raw(&mut self) -> SEC_WINNT_AUTH_IDENTITY_W {
        SEC_WINNT_AUTH_IDENTITY_W {
            User: self.user.as_mut_ptr(),
            UserLength: (self.user.len() - 1) as u32,
            Domain: if self.domain.is_empty() {
                ptr::null_mut()
            } else {
                self.domain.as_mut_ptr()
            },
            DomainLength: self.domain.len().saturating_sub(1) as u32,
            Password: if self.password.is_empty() {
                ptr::null_mut()
            } else {
                self.password.as_mut_ptr()
            },
            PasswordLength: self.password.len().saturating_sub(1) as u32,
            Flags: SEC_WINNT_AUTH_IDENTITY_UNICODE,
        }
    }
}

impl Drop for WideIdentity {
    fn drop(&mut self) {
        wipe_wide(&mut self.password);
    }
}

fn acquire(
    package: PCWSTR,
    usage: SECPKG_CRED,
    principal: Option<&str>,
    identity: Option<&AuthIdentity<'_>>,
) -> Result<CredHandle> {
    let principal_wide = principal.map(to_wide);
    let principal_ptr = principal_wide
        .as_ref()
        .map(|w| w.as_ptr())
        .unwrap_or(ptr::null());
    let mut wide_identity = identity.map(WideIdentity::new);
    let auth_data = wide_identity.as_mut().map(WideIdentity::as_raw);
    let mut handle = SecHandle::default();
    let mut expiry = 0i64;
    unsafe {
        AcquireCredentialsHandleW(
            PCWSTR(principal_ptr),
            package,
            usage,
            None,
            auth_data
                .as_ref()
                .map(|a| ptr::from_ref(a) as *const c_void),
            None,
            None,
            &mut handle,
            Some(&mut expiry),
        )
    }
    .map_err(|e| provider_err("AcquireCredentialsHandle", &e))?;
    Ok(CredHandle(handle))
}

/// Copy a package-allocated token out of `buf` and release it.
fn take_token(buf: &SecBuffer) -> Vec<u8> {
    if buf.pvBuffer.is_null() || buf.cbBuffer == 0 {
        return Vec::new();
    }
    let token =
        unsafe { std::slice::from_raw_parts(buf.pvBuffer as *const u8, buf.cbBuffer as usize) }
            .to_vec();
    if let Err(e) = unsafe { FreeContextBuffer(buf.pvBuffer) } {
        warn!(error = %e, "FreeContextBuffer failed");
    }
    token
}

fn wide_attr_string(p: PWSTR) -> String {
    if p.is_null() {
        return String::new();
    }
    let s = unsafe { String::from_utf16_lossy(p.as_wide()) };
    if let Err(e) = unsafe { FreeContextBuffer(p.0 as *mut c_void) } {
        warn!(error = %e, "FreeContextBuffer failed");
    }
    s
}

/// Security provider backed by the platform's native packages.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sspi;

impl Sspi {
    fn package(mech: Mech) -> PCWSTR {
        match mech {
            Mech::Kerberos => w!("Kerberos"),
            Mech::Negotiate => w!("Negotiate"),
        }
    }
}

impl SecurityProvider for Sspi {
    type Credential = CredHandle;
    type Context = CtxHandle;

    fn max_input_len(&self) -> usize {
        u32::MAX as usize
    }

    fn acquire_client_credentials(
        &self,
        mech: Mech,
        principal: Option<&str>,
        identity: Option<&AuthIdentity<'_>>,
    ) -> Result<CredHandle> {
        acquire(Sspi::package(mech), SECPKG_CRED_OUTBOUND, principal, identity)
    }

    fn acquire_server_credentials(&self, mech: Mech, service: Option<&str>) -> Result<CredHandle> {
        acquire(Sspi::package(mech), SECPKG_CRED_INBOUND, service, None)
    }

    fn initialize_context(
        &self,
        cred: &CredHandle,
        ctx: &mut Option<CtxHandle>,
        target: &str,
        flags: CtxFlags,
        input: Option<&[u8]>,
    ) -> Result<ProviderStep> {
        let target_wide = to_wide(target);
        let mut in_token = input.map(|token| SecBuffer {
            cbBuffer: token.len() as u32,
            BufferType: SECBUFFER_TOKEN,
            pvBuffer: token.as_ptr() as *mut c_void,
        });
        let in_desc = in_token.as_mut().map(|buf| SecBufferDesc {
            ulVersion: SECBUFFER_VERSION,
            cBuffers: 1,
            pBuffers: buf,
        });
        let mut out_token = SecBuffer {
            cbBuffer: 0,
            BufferType: SECBUFFER_TOKEN,
            pvBuffer: ptr::null_mut(),
        };
        let mut out_desc = SecBufferDesc {
            ulVersion: SECBUFFER_VERSION,
            cBuffers: 1,
            pBuffers: &mut out_token,
        };
        let mut attributes = 0u32;
        let mut slot = ctx.take();
        let had_ctx = slot.is_some();
        let hres = unsafe {
            InitializeSecurityContextW(
                Some(&cred.0),
                slot.as_deref().map(ptr::from_ref),
                Some(target_wide.as_ptr()),
                ISC_REQ_ALLOCATE_MEMORY | ISC_REQ_FLAGS(flags.bits()),
                0,
                SECURITY_NETWORK_DREP,
                in_desc.as_ref().map(ptr::from_ref),
                0,
                Some(slot.get_or_insert_default().deref_mut()),
                Some(&mut out_desc),
                &mut attributes,
                None,
            )
        };
        match hres {
            SEC_E_OK | SEC_I_CONTINUE_NEEDED => {
                *ctx = slot;
                Ok(ProviderStep {
                    token: take_token(&out_token),
                    complete: hres == SEC_E_OK,
                })
            }
            e => {
                if had_ctx {
                    *ctx = slot;
                }
                Err(Error::provider("InitializeSecurityContext", e.0, e.message()))
            }
        }
    }

    fn accept_context(
        &self,
        cred: &CredHandle,
        ctx: &mut Option<CtxHandle>,
        input: &[u8],
    ) -> Result<ProviderStep> {
        let mut in_token = SecBuffer {
            cbBuffer: input.len() as u32,
            BufferType: SECBUFFER_TOKEN,
            pvBuffer: input.as_ptr() as *mut c_void,
        };
        let in_desc = SecBufferDesc {
            ulVersion: SECBUFFER_VERSION,
            cBuffers: 1,
            pBuffers: &mut in_token,
        };
        let mut out_token = SecBuffer {
            cbBuffer: 0,
            BufferType: SECBUFFER_TOKEN,
            pvBuffer: ptr::null_mut(),
        };
        let mut out_desc = SecBufferDesc {
            ulVersion: SECBUFFER_VERSION,
            cBuffers: 1,
            pBuffers: &mut out_token,
        };
        let mut attributes = 0u32;
        let mut slot = ctx.take();
        let had_ctx = slot.is_some();
        let hres = unsafe {
            AcceptSecurityContext(
                Some(&cred.0),
                slot.as_deref().map(ptr::from_ref),
                Some(&in_desc),
                ASC_REQ_ALLOCATE_MEMORY,
                SECURITY_NETWORK_DREP,
                Some(slot.get_or_insert_default().deref_mut()),
                Some(&mut out_desc),
                &mut attributes,
                None,
            )
        };
        match hres {
            SEC_E_OK | SEC_I_CONTINUE_NEEDED => {
                *ctx = slot;
                Ok(ProviderStep {
                    token: take_token(&out_token),
                    complete: hres == SEC_E_OK,
                })
            }
            e => {
                if had_ctx {
                    *ctx = slot;
                }
                Err(Error::provider("AcceptSecurityContext", e.0, e.message()))
            }
        }
    }

    fn query_sizes(&self, ctx: &CtxHandle) -> Result<ContextSizes> {
        let mut sizes = SecPkgContext_Sizes::default();
        unsafe {
            QueryContextAttributesW(
                &ctx.0,
                SECPKG_ATTR_SIZES,
                ptr::from_mut(&mut sizes) as *mut c_void,
            )
        }
        .map_err(|e| provider_err("QueryContextAttributes", &e))?;
        Ok(ContextSizes {
            security_trailer: sizes.cbSecurityTrailer,
            block_size: sizes.cbBlockSize,
        })
    }

    fn query_authenticated_name(&self, ctx: &CtxHandle) -> Result<String> {
        let mut names = SecPkgContext_NamesW::default();
        unsafe {
            QueryContextAttributesW(
                &ctx.0,
                SECPKG_ATTR_NAMES,
                ptr::from_mut(&mut names) as *mut c_void,
            )
        }
        .map_err(|e| provider_err("QueryContextAttributes", &e))?;
        Ok(wide_attr_string(names.sUserName))
    }

    fn query_target_name(&self, ctx: &CtxHandle) -> Result<String> {
        let mut target = SecPkgContext_ClientSpecifiedTarget::default();
        unsafe {
            QueryContextAttributesW(
                &ctx.0,
                SECPKG_ATTR_CLIENT_SPECIFIED_TARGET,
                ptr::from_mut(&mut target) as *mut c_void,
            )
        }
        .map_err(|e| provider_err("QueryContextAttributes", &e))?;
        Ok(wide_attr_string(target.sTargetName))
    }

    fn encrypt(
        &self,
        ctx: &CtxHandle,
        qop: Qop,
        sizes: ContextSizes,
        payload: &[u8],
    ) -> Result<Sealed> {
        let mut trailer = vec![0u8; sizes.security_trailer as usize];
        let mut data = payload.to_vec();
        let mut padding = vec![0u8; sizes.block_size as usize];
        let mut buffers = [
            SecBuffer {
                cbBuffer: trailer.len() as u32,
                BufferType: SECBUFFER_TOKEN,
                pvBuffer: trailer.as_mut_ptr() as *mut c_void,
            },
            SecBuffer {
                cbBuffer: data.len() as u32,
                BufferType: SECBUFFER_DATA,
                pvBuffer: data.as_mut_ptr() as *mut c_void,
            },
            SecBuffer {
                cbBuffer: padding.len() as u32,
                BufferType: SECBUFFER_PADDING,
                pvBuffer: padding.as_mut_ptr() as *mut c_void,
            },
        ];
        let desc = SecBufferDesc {
            ulVersion: SECBUFFER_VERSION,
            cBuffers: buffers.len() as u32,
            pBuffers: buffers.as_mut_ptr(),
        };
        let fqop = match qop {
            Qop::Confidential => 0,
            Qop::Integrity => SECQOP_WRAP_NO_ENCRYPT,
        };
        let hres = unsafe { EncryptMessage(&ctx.0, fqop, &desc, 0) };
        if hres != SEC_E_OK {
            return Err(Error::provider("EncryptMessage", hres.0, hres.message()));
        }
        // The package shrinks each cbBuffer to the bytes actually used.
        trailer.truncate(buffers[0].cbBuffer as usize);
        data.truncate(buffers[1].cbBuffer as usize);
        padding.truncate(buffers[2].cbBuffer as usize);
        Ok(Sealed {
            trailer,
            payload: data,
            padding,
        })
    }

    fn decrypt(&self, ctx: &CtxHandle, sealed: &[u8]) -> Result<Unsealed> {
        let mut stream = sealed.to_vec();
        let mut buffers = [
            SecBuffer {
                cbBuffer: stream.len() as u32,
                BufferType: SECBUFFER_STREAM,
                pvBuffer: stream.as_mut_ptr() as *mut c_void,
            },
            SecBuffer {
                cbBuffer: 0,
                BufferType: SECBUFFER_DATA,
                pvBuffer: ptr::null_mut(),
            },
        ];
        let desc = SecBufferDesc {
            ulVersion: SECBUFFER_VERSION,
            cBuffers: buffers.len() as u32,
            pBuffers: buffers.as_mut_ptr(),
        };
        let mut qop = 0u32;
        let hres = unsafe { DecryptMessage(&ctx.0, &desc, 0, Some(&mut qop)) };
        if hres != SEC_E_OK {
            return Err(Error::provider("DecryptMessage", hres.0, hres.message()));
        }
        // The data buffer points into the stream copy, so there is
        // nothing separate to free, but the copy now holds plaintext
        // and is wiped before release.
        let data = &buffers[1];
        let payload = if data.pvBuffer.is_null() || data.cbBuffer == 0 {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(data.pvBuffer as *const u8, data.cbBuffer as usize) }
                .to_vec()
        };
        wipe(&mut stream);
        Ok(Unsealed {
            payload: SecretBuf::from(payload),
            encrypted: qop != SECQOP_WRAP_NO_ENCRYPT,
        })
    }

    fn impersonate(&self, ctx: &CtxHandle) -> Result<()> {
        unsafe { ImpersonateSecurityContext(&ctx.0) }
            .map_err(|e| provider_err("ImpersonateSecurityContext", &e))
    }

    fn revert(&self, ctx: &CtxHandle) -> Result<()> {
        unsafe { RevertSecurityContext(&ctx.0) }
            .map_err(|e| provider_err("RevertSecurityContext", &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_wide_appends_a_terminator() {
        assert_eq!(to_wide("ab"), vec![0x61, 0x62, 0]);
        assert_eq!(to_wide(""), vec![0]);
    }

    #[test]
    fn to_wide_handles_supplementary_plane_chars() {
        // U+1D11E takes a surrogate pair.
        let wide = to_wide("\u{1d11e}");
        assert_eq!(wide.len(), 3);
        assert_eq!(wide[2], 0);
    }
}
