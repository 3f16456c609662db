//! Kernel error taxonomy
//!
//! Recoverable failures are returned to the calling thread as negative
//! return words. Kernel invariant violations are not errors, they panic.

use core::fmt;

use crate::types::Word;

/// Kernel return code (base-hw style, zero or positive means success)
pub type CallRet = isize;

/// Success
pub const CALL_SUCCESS: CallRet = 0;
/// Object missing, of the wrong kind, or not accessible by the caller
pub const CALL_DENIED: CallRet = -1;
/// Object table or capability space exhausted
pub const CALL_OUT_OF_RESOURCES: CallRet = -2;
/// Malformed argument (CPU, priority, line, size)
pub const CALL_INVALID_ARGUMENT: CallRet = -3;

/// Recoverable kernel error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Nonexistent, wrong-kind or unauthorized object
    Denied,
    /// Object pool or id allocator full
    OutOfResources,
    /// Argument outside its valid range
    InvalidArgument,
}

impl KernelError {
    /// Name for log output
    pub fn name(self) -> &'static str {
        match self {
            Self::Denied => "denied",
            Self::OutOfResources => "out of resources",
            Self::InvalidArgument => "invalid argument",
        }
    }

    /// Return code handed back to user space
    pub fn code(self) -> CallRet {
        match self {
            Self::Denied => CALL_DENIED,
            Self::OutOfResources => CALL_OUT_OF_RESOURCES,
            Self::InvalidArgument => CALL_INVALID_ARGUMENT,
        }
    }

    /// Return code encoded as call-return word
    pub fn as_word(self) -> Word {
        ret_word(self.code())
    }

    /// Decode a return word, `None` for success values
    pub fn from_word(word: Word) -> Option<Self> {
        match word as CallRet {
            CALL_DENIED => Some(Self::Denied),
            CALL_OUT_OF_RESOURCES => Some(Self::OutOfResources),
            CALL_INVALID_ARGUMENT => Some(Self::InvalidArgument),
            _ => None,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result type for kernel operations
pub type KernResult<T> = Result<T, KernelError>;

/// Encode a signed return code as register word
#[inline]
pub fn ret_word(code: CallRet) -> Word {
    code as Word
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_words() {
        for err in [
            KernelError::Denied,
            KernelError::OutOfResources,
            KernelError::InvalidArgument,
        ] {
            assert_eq!(KernelError::from_word(err.as_word()), Some(err));
        }
        assert_eq!(KernelError::from_word(0), None);
        assert_eq!(KernelError::from_word(42), None);
        assert_eq!(KernelError::Denied.as_word(), usize::MAX);
    }
}
