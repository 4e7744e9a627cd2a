//! Wipe-on-drop buffers for secret material (passwords, decrypted
//! payloads). Wiping uses volatile writes so it survives optimization of
//! stores to memory that is about to be freed.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    ptr,
    sync::atomic::{compiler_fence, Ordering},
};

pub(crate) fn wipe(bytes: &mut [u8]) {
    for b in bytes.iter_mut() {
        unsafe { ptr::write_volatile(b, 0) };
    }
    compiler_fence(Ordering::SeqCst);
}

#[cfg(windows)]
pub(crate) fn wipe_wide(chars: &mut [u16]) {
    for c in chars.iter_mut() {
        unsafe { ptr::write_volatile(c, 0) };
    }
    compiler_fence(Ordering::SeqCst);
}

/// Owned byte buffer, zeroed before its memory is returned to the
/// allocator.
pub struct SecretBuf(Vec<u8>);

impl From<Vec<u8>> for SecretBuf {
    fn from(v: Vec<u8>) -> Self {
        SecretBuf(v)
    }
}

impl Deref for SecretBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for SecretBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl Drop for SecretBuf {
    fn drop(&mut self) {
        wipe(&mut self.0);
    }
}

impl fmt::Debug for SecretBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBuf({} bytes)", self.0.len())
    }
}

/// Owned string, zeroed before its memory is returned to the allocator.
pub struct SecretString(String);

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        SecretString(s)
    }
}

impl Deref for SecretString {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Drop for SecretString {
    fn drop(&mut self) {
        // NUL bytes keep the buffer valid UTF-8.
        wipe(unsafe { self.0.as_mut_vec() });
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wipe_zeroes_in_place() {
        let mut buf = vec![0xde, 0xad, 0xbe, 0xef];
        wipe(&mut buf);
        assert_eq!(buf, [0, 0, 0, 0]);
    }

    #[test]
    fn secret_string_reads_as_str() {
        let s = SecretString::from("hunter2".to_string());
        assert_eq!(&*s, "hunter2");
        assert_eq!(format!("{:?}", s), "SecretString(7 bytes)");
    }

    #[test]
    fn secret_buf_redacts_debug() {
        let b = SecretBuf::from(vec![1, 2, 3]);
        assert_eq!(format!("{:?}", b), "SecretBuf(3 bytes)");
    }
}
