// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for readout operations

use flx_format::FormatError;
use thiserror::Error;

/// Result type alias for readout operations
pub type Result<T> = std::result::Result<T, FlxError>;

/// Errors that can occur while configuring or running a card reader
#[derive(Debug, Error)]
pub enum FlxError {
    /// Card could not be opened
    #[error("Failed to open card {device}: {reason}")]
    CardOpen {
        /// Absolute device number (card id + logical unit)
        device: u32,
        /// Reason for failure
        reason: String,
    },

    /// The requested DMA channel is locked by another process
    #[error("DMA {dma_id} of card {device} is locked by another process (lock mask {mask:#x})")]
    CardLocked {
        /// Absolute device number
        device: u32,
        /// DMA channel requested
        dma_id: u32,
        /// Lock mask reported by the driver
        mask: u32,
    },

    /// Pinned memory could not be allocated
    #[error("Failed to allocate {size} bytes of pinned memory: {reason}")]
    Allocation {
        /// Requested size in bytes
        size: usize,
        /// Reason for failure
        reason: String,
    },

    /// Registered link pipelines do not match the enabled links
    #[error("Elink configuration inconsistent: {enabled} links enabled, {registered} registered")]
    ElinkInconsistency {
        /// Links enabled in the configuration
        enabled: usize,
        /// Link pipelines registered
        registered: usize,
    },

    /// Block size and trailer size cannot be combined
    #[error("Block size {block_size} B incompatible with {trailer_bits}-bit trailers: {reason}")]
    BlockSizeInconsistency {
        /// Configured block size in bytes
        block_size: usize,
        /// Configured trailer width in bits
        trailer_bits: u32,
        /// Why the combination was rejected
        reason: String,
    },

    /// Any other invalid configuration value
    #[error("Invalid configuration: {reason}")]
    Configuration {
        /// Reason for rejection
        reason: String,
    },

    /// Operation not allowed in the current state
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Operation timeout
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Hardware-level error reported by the card
    #[error("Hardware error: {reason}")]
    Hardware {
        /// Reason for failure
        reason: String,
    },

    /// I/O error, e.g. spawning a worker thread
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Format parameter error
    #[error("Format error: {source}")]
    Format {
        /// Underlying format error
        #[from]
        source: FormatError,
    },
}

impl FlxError {
    /// Create a card open error
    pub fn card_open(device: u32, reason: impl Into<String>) -> Self {
        Self::CardOpen {
            device,
            reason: reason.into(),
        }
    }

    /// Create an allocation error
    pub fn allocation(size: usize, reason: impl Into<String>) -> Self {
        Self::Allocation {
            size,
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a hardware error
    pub fn hardware(reason: impl Into<String>) -> Self {
        Self::Hardware {
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    #[allow(clippy::cast_possible_truncation)]
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Whether the error must abort startup.
    ///
    /// Everything except a stop timeout is fatal: the unit is left
    /// unconfigured or stopped.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Timeout { .. })
    }
}
