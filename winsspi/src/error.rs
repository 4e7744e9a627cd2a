use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the negotiation engine and the underlying security
/// package. Provider failures carry the native status code and the
/// system-formatted message for it.
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("SSPI: {operation}: {message} (status {code:#010x})")]
    Provider {
        operation: &'static str,
        code: i32,
        message: String,
    },
    #[error(
        "Uninitialized security context. You must complete the token \
         exchange before calling this function."
    )]
    UninitializedContext,
    #[error("{field} too large")]
    ValueTooLarge { field: &'static str },
    #[error("failed to reserve {bytes} bytes")]
    Allocation { bytes: usize },
    #[error("invalid base64 token: {0}")]
    Decode(#[from] base64::DecodeError),
}

impl Error {
    pub(crate) fn provider(
        operation: &'static str,
        code: i32,
        message: impl Into<String>,
    ) -> Error {
        let mut message = message.into();
        if message.is_empty() {
            message = "operation failed".into();
        }
        Error::Provider {
            operation,
            code,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_display_names_the_operation() {
        let e = Error::provider("AcquireCredentialsHandle", -0x7ff8fff2, "No credentials");
        let s = e.to_string();
        assert!(s.contains("AcquireCredentialsHandle"));
        assert!(s.contains("No credentials"));
    }

    #[test]
    fn provider_message_falls_back() {
        let e = Error::provider("EncryptMessage", 5, "");
        assert!(e.to_string().contains("operation failed"));
    }
}
