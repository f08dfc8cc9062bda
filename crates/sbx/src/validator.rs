//! Pre-spawn checks on a `vm` call. Failures here never reach a worker.

use std::time::Duration;

use crate::error::SandboxError;

/// Default maximum source size in bytes (256 KB).
pub const DEFAULT_MAX_CODE_SIZE: usize = 256 * 1024;

/// Validates the untrusted source before it is wrapped.
pub fn validate_source(source: &str, max_size: Option<usize>) -> Result<(), SandboxError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_CODE_SIZE);

    if source.len() > max {
        return Err(SandboxError::SourceTooLarge {
            max,
            actual: source.len(),
        });
    }

    if source.trim().is_empty() {
        return Err(SandboxError::invalid("source is empty"));
    }

    Ok(())
}

/// A requested timeout must be at least one millisecond.
pub fn validate_timeout(timeout: Option<Duration>) -> Result<(), SandboxError> {
    match timeout {
        Some(t) if t.as_millis() == 0 => Err(SandboxError::invalid(
            "timeout must be at least 1ms (omit it for no limit)",
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn accepts_ordinary_source() {
        assert!(validate_source("var x = 10; return x;", None).is_ok());
    }

    #[test]
    fn rejects_empty_and_whitespace() {
        for src in ["", "   ", "\n\t\n"] {
            let err = validate_source(src, None).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
            assert!(err.to_string().contains("empty"));
        }
    }

    #[test]
    fn rejects_oversized_source() {
        let err = validate_source(&"x".repeat(11), Some(10)).unwrap_err();
        assert!(matches!(
            err,
            SandboxError::SourceTooLarge {
                max: 10,
                actual: 11
            }
        ));
        assert!(validate_source(&"x".repeat(10), Some(10)).is_ok());
    }

    #[test]
    fn zero_timeout_is_invalid() {
        assert!(validate_timeout(None).is_ok());
        assert!(validate_timeout(Some(Duration::from_millis(1))).is_ok());
        let err = validate_timeout(Some(Duration::from_micros(500))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
