use std::fmt::{self, Display};

use sha2::{Digest, Sha256};

pub mod debounce;
pub mod file;
pub mod http;

/// One-shot cancellation condition. It travels inside `anyhow::Error` so any
/// layer can recognize it with [`is_cancelled`] and unwind quietly.
#[derive(Debug, Clone, Copy)]
pub struct Cancelled;

impl Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "The task was canceled")
    }
}

impl std::error::Error for Cancelled {}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<Cancelled>())
}

#[inline]
pub fn random_scratch_id() -> String {
    nano_id::base62::<12>()
}

pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use anyhow::bail;

    use super::{is_cancelled, sha256_hex, Cancelled};

    #[test]
    fn test_cancelled_roundtrip() {
        let result: anyhow::Result<()> = (|| bail!(Cancelled))();
        let err = result.unwrap_err().context("while doing something");
        assert!(is_cancelled(&err));

        let other = anyhow::anyhow!("some other error");
        assert!(!is_cancelled(&other));
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
