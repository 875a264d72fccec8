//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
///
/// Everything except [`GpuError::PresentFailed`] is fatal for the frame being
/// submitted: the caller should stop rendering rather than retry.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// A recorded command has no submit-kind mapping.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A synchronization primitive could not be allocated.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The driver rejected a queue submission.
    #[error("Submission failed: {0}")]
    SubmissionFailed(String),

    /// Waiting on a fence failed or timed out, usually a GPU hang.
    #[error("Fence wait failed: {0}")]
    FenceWaitFailed(String),

    /// Presentation failed; the swapchain should be recreated.
    #[error("Present failed: {0}")]
    PresentFailed(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Whether the caller can recover by recreating the swapchain and skipping the frame.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::PresentFailed(_))
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_present_failures_are_recoverable() {
        assert!(GpuError::PresentFailed("out of date".into()).is_recoverable());
        assert!(!GpuError::SubmissionFailed("rejected".into()).is_recoverable());
        assert!(!GpuError::FenceWaitFailed("timeout".into()).is_recoverable());
        assert!(!GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST).is_recoverable());
    }

    #[test]
    fn vulkan_results_convert() {
        let err: GpuError = vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into();
        assert!(matches!(
            err,
            GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        ));
    }
}
