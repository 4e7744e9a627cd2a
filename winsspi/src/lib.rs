//! SASL-style Kerberos and Negotiate authentication built on the
//! Windows security support interface.
//!
//! The negotiation engines ([`ClientCtx`] and [`ServerCtx`]) own their
//! credential and context handles, exchange base64 tokens, and after
//! completion protect application data with the trailer + payload +
//! padding framing the SASL GSSAPI profile expects. All provider
//! traffic goes through the [`SecurityProvider`] trait: on Windows the
//! `Sspi` adapter talks to the real security packages, everywhere else
//! (and in tests) the [`mock`] provider stands in.
//!
//! A handshake relays tokens until the client reports completion:
//!
//! ```
//! use winsspi::{AuthStatus, ClientCtx, CtxFlags, Mech, ServerCtx};
//! use winsspi::mock::{MockProvider, Round};
//!
//! # fn main() -> winsspi::Result<()> {
//! let provider = MockProvider::new().with_username("alice@EXAMPLE.COM");
//! provider.script_initialize([Round::partial(b"hello"), Round::finished(b"")]);
//! provider.script_accept([Round::finished(b"welcome")]);
//!
//! let mut client = ClientCtx::init(
//!     provider.clone(),
//!     Mech::Kerberos,
//!     "ldap@dc.example.com",
//!     None,
//!     CtxFlags::default(),
//!     None,
//! )?;
//! let mut server = ServerCtx::init(provider.clone(), Mech::Kerberos, None)?;
//!
//! let mut status = client.step("")?;
//! while status == AuthStatus::Continue {
//!     let token = client.response().unwrap_or("").to_string();
//!     server.step(&token)?;
//!     let reply = server.response().unwrap_or("").to_string();
//!     status = client.step(&reply)?;
//! }
//! assert_eq!(client.username(), Some("alice@EXAMPLE.COM"));
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod context;
pub mod error;
pub mod mock;
mod name;
pub mod provider;
pub mod registry;
#[cfg(windows)]
pub mod sspi;
mod util;

pub use context::{AuthStatus, ClientCtx, CtxFlags, ServerCtx};
pub use error::{Error, Result};
pub use provider::{
    AuthIdentity, ContextSizes, Mech, ProviderStep, Qop, Sealed, SecurityProvider, Unsealed,
};
pub use registry::{Registry, Token};
#[cfg(windows)]
pub use sspi::Sspi;
pub use util::{SecretBuf, SecretString};
