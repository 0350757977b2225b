//! Engine error codes and conversions to UEFI status values.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

/// A specialized [`Result`](core::result::Result) type for engine operations.
pub type Result<T> = core::result::Result<T, EfiError>;

use r_efi::efi;

/// The errors the resource allocation engine can produce.
///
/// A subset of the EDK II error codes, kept convertible to [`efi::Status`]
/// so callers embedding the engine behind a firmware protocol surface can
/// return the status directly.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EfiError {
    /// The parameter was incorrect.
    InvalidParameter,
    /// The operation is not supported.
    Unsupported,
    /// A phase was invoked out of order, or a required submission is missing.
    NotReady,
    /// Allocation could not satisfy a request.
    OutOfResources,
    /// The item was not found.
    NotFound,
    /// Access was denied.
    AccessDenied,
}

impl EfiError {
    /// Converts an `r_efi::efi::Status` to a `Result`.
    ///
    /// If the status is `SUCCESS`, it returns `Ok(())`. Statuses outside the
    /// engine's error set map to `Unsupported`.
    pub fn status_to_result(status: efi::Status) -> Result<()> {
        match status {
            efi::Status::SUCCESS => Ok(()),
            efi::Status::INVALID_PARAMETER => Err(EfiError::InvalidParameter),
            efi::Status::NOT_READY => Err(EfiError::NotReady),
            efi::Status::OUT_OF_RESOURCES => Err(EfiError::OutOfResources),
            efi::Status::NOT_FOUND => Err(EfiError::NotFound),
            efi::Status::ACCESS_DENIED => Err(EfiError::AccessDenied),
            _ => Err(EfiError::Unsupported),
        }
    }
}

impl From<EfiError> for efi::Status {
    fn from(e: EfiError) -> efi::Status {
        match e {
            EfiError::InvalidParameter => efi::Status::INVALID_PARAMETER,
            EfiError::Unsupported => efi::Status::UNSUPPORTED,
            EfiError::NotReady => efi::Status::NOT_READY,
            EfiError::OutOfResources => efi::Status::OUT_OF_RESOURCES,
            EfiError::NotFound => efi::Status::NOT_FOUND,
            EfiError::AccessDenied => efi::Status::ACCESS_DENIED,
        }
    }
}

impl From<efi::Status> for EfiError {
    fn from(status: efi::Status) -> EfiError {
        EfiError::status_to_result(status).map_or_else(|e| e, |_| EfiError::Unsupported)
    }
}
