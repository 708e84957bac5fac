//! Helpers shared by the AWS SDK adapters.

use turndown_core::ProviderKind;

use crate::error::ProviderError;

/// Clamp an SDK `i32` count to `u32`.
pub(crate) fn count(value: Option<i32>) -> u32 {
    value.unwrap_or(0).max(0) as u32
}

/// Wrap an SDK error with its full source chain.
pub(crate) fn sdk_error<E: std::error::Error>(provider: ProviderKind, context: &str, err: E) -> ProviderError {
    ProviderError::api(
        provider,
        format!("{context}: {}", aws_sdk_eks::error::DisplayErrorContext(&err)),
    )
}
