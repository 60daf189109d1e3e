//! Error taxonomy of the allocator.

use ash::vk;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed caller input: zero size, incompatible flag combination,
    /// invalid memory type index, non-power-of-two alignment.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The request cannot be satisfied: budget exceeded, or every candidate
    /// block is full and growth is denied.
    #[error("out of device memory")]
    OutOfDeviceMemory,

    /// The device rejected a memory map call.
    #[error("mapping device memory failed: {0}")]
    MapFailed(vk::Result),

    /// No memory type matches the requested properties, or a requested
    /// feature is not available.
    #[error("feature not present: {0}")]
    FeatureNotPresent(&'static str),

    /// Passthrough of an unexpected status from the graphics API.
    #[error("driver returned {0}")]
    Driver(vk::Result),

    /// An internal invariant was violated.
    #[error("validation failed: {0}")]
    Validation(&'static str),

    /// The operation was issued against a defunct object, e.g. a wait
    /// scheduler that already recorded a fatal driver status.
    #[error("invalid operation, stored status {0}")]
    InvalidOperation(vk::Result),
}

impl From<vk::Result> for Error {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Error::OutOfDeviceMemory,
            vk::Result::ERROR_MEMORY_MAP_FAILED => Error::MapFailed(result),
            vk::Result::ERROR_FEATURE_NOT_PRESENT => {
                Error::FeatureNotPresent("reported by driver")
            }
            other => Error::Driver(other),
        }
    }
}
