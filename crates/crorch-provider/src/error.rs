//! ---
//! crorch_section: "05-networking-external-interfaces"
//! crorch_subsection: "module"
//! crorch_type: "source"
//! crorch_scope: "code"
//! crorch_description: "Provider error taxonomy and vendor code classification."
//! crorch_version: "v0.1.0"
//! crorch_owner: "platform"
//! ---
//! Provider error classification.
//!
//! Vendor error codes are folded into a small taxonomy so that the client can
//! decide what to retry and handlers can treat "already gone" and "already
//! there" as idempotent outcomes.

use thiserror::Error;

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Control-plane error categories.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    /// The addressed resource does not exist.
    #[error("{code}: {message}")]
    NotFound { code: String, message: String },

    /// A resource with the same identity already exists.
    #[error("{code}: {message}")]
    AlreadyExists { code: String, message: String },

    /// Rate limit exceeded (retryable).
    #[error("{code}: {message}")]
    Throttled { code: String, message: String },

    /// A dependency created moments ago is not visible yet (retryable).
    #[error("{code}: {message}")]
    NotYetVisible { code: String, message: String },

    /// The resource is referenced by, or associated with, another resource.
    #[error("{code}: {message}")]
    InUse { code: String, message: String },

    /// An account or service quota was hit.
    #[error("{code}: {message}")]
    LimitExceeded { code: String, message: String },

    /// The request references something that does not exist.
    #[error("{code}: {message}")]
    InvalidReference { code: String, message: String },

    /// Optimistic lock token was outdated (retryable with a fresh token).
    #[error("{code}: {message}")]
    StaleLockToken { code: String, message: String },

    /// The request itself is malformed.
    #[error("{code}: {message}")]
    InvalidParameter { code: String, message: String },

    /// Service side failure (retryable).
    #[error("{code}: {message}")]
    Unavailable { code: String, message: String },

    /// Any other rejection.
    #[error("{code}: {message}")]
    Rejected { code: String, message: String },

    #[error("{operation} gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: usize,
        last: Box<ProviderError>,
    },

    #[error("{operation} retry budget exhausted after {attempts} attempts: {last}")]
    RetryBudgetExhausted {
        operation: String,
        attempts: usize,
        last: Box<ProviderError>,
    },
}

impl ProviderError {
    /// Whether the client should retry the call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Throttled { .. }
                | ProviderError::NotYetVisible { .. }
                | ProviderError::StaleLockToken { .. }
                | ProviderError::Unavailable { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ProviderError::AlreadyExists { .. })
    }

    pub fn is_in_use(&self) -> bool {
        matches!(self, ProviderError::InUse { .. })
    }

    /// Vendor error code, looking through retry wrappers.
    pub fn code(&self) -> &str {
        match self {
            ProviderError::NotFound { code, .. }
            | ProviderError::AlreadyExists { code, .. }
            | ProviderError::Throttled { code, .. }
            | ProviderError::NotYetVisible { code, .. }
            | ProviderError::InUse { code, .. }
            | ProviderError::LimitExceeded { code, .. }
            | ProviderError::InvalidReference { code, .. }
            | ProviderError::StaleLockToken { code, .. }
            | ProviderError::InvalidParameter { code, .. }
            | ProviderError::Unavailable { code, .. }
            | ProviderError::Rejected { code, .. } => code,
            ProviderError::RetriesExhausted { last, .. }
            | ProviderError::RetryBudgetExhausted { last, .. } => last.code(),
        }
    }
}

const NOT_FOUND_CODES: &[&str] = &[
    "WAFNonexistentItemException",
    "InvalidLaunchTemplateId.NotFound",
    "InvalidLaunchTemplateName.NotFoundException",
    "InvalidLaunchTemplateId.VersionNotFound",
    "NoSuchHostedZone",
    "ResourceNotFound",
];

const ALREADY_EXISTS_CODES: &[&str] = &[
    "AlreadyExists",
    "InvalidLaunchTemplateName.AlreadyExistsException",
    "WAFDuplicateItemException",
];

const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "PriorRequestNotComplete",
];

const NOT_YET_VISIBLE_CODES: &[&str] = &["WAFUnavailableEntityException"];

const IN_USE_CODES: &[&str] = &[
    "WAFAssociatedItemException",
    "ResourceInUse",
    "ScalingActivityInProgress",
];

const LIMIT_CODES: &[&str] = &[
    "LimitExceeded",
    "WAFLimitsExceededException",
    "LaunchTemplateLimitExceeded",
    "VcpuLimitExceeded",
];

const INVALID_REFERENCE_CODES: &[&str] = &[
    "InvalidAMIID.NotFound",
    "InvalidSubnetID.NotFound",
    "InvalidGroup.NotFound",
    "WAFNonexistentContainerException",
];

const STALE_LOCK_CODES: &[&str] = &["WAFOptimisticLockException"];

const INVALID_PARAMETER_CODES: &[&str] = &[
    "ValidationError",
    "InvalidParameterValue",
    "InvalidParameterCombination",
    "WAFInvalidParameterException",
    "InvalidInput",
    "InvalidChangeBatch",
];

const UNAVAILABLE_CODES: &[&str] = &[
    "InternalFailure",
    "InternalError",
    "ServiceUnavailable",
    "WAFInternalErrorException",
];

/// Classify a vendor error code and message.
pub fn classify(code: &str, message: &str) -> ProviderError {
    let code_owned = code.to_owned();
    let message_owned = message.to_owned();
    let lowered = message.to_ascii_lowercase();

    match code {
        // Scaling and DNS APIs report missing targets through generic codes.
        "ValidationError" | "InvalidChangeBatch" if lowered.contains("not found") => {
            ProviderError::NotFound {
                code: code_owned,
                message: message_owned,
            }
        }
        "ValidationError" if lowered.contains("does not exist") => {
            ProviderError::InvalidReference {
                code: code_owned,
                message: message_owned,
            }
        }
        _ if lowered.contains("invalid iam instance profile") => ProviderError::NotYetVisible {
            code: code_owned,
            message: message_owned,
        },
        c if NOT_FOUND_CODES.contains(&c) => ProviderError::NotFound {
            code: code_owned,
            message: message_owned,
        },
        c if ALREADY_EXISTS_CODES.contains(&c) => ProviderError::AlreadyExists {
            code: code_owned,
            message: message_owned,
        },
        c if THROTTLING_CODES.contains(&c) => ProviderError::Throttled {
            code: code_owned,
            message: message_owned,
        },
        c if NOT_YET_VISIBLE_CODES.contains(&c) => ProviderError::NotYetVisible {
            code: code_owned,
            message: message_owned,
        },
        c if IN_USE_CODES.contains(&c) => ProviderError::InUse {
            code: code_owned,
            message: message_owned,
        },
        c if LIMIT_CODES.contains(&c) => ProviderError::LimitExceeded {
            code: code_owned,
            message: message_owned,
        },
        c if INVALID_REFERENCE_CODES.contains(&c) => ProviderError::InvalidReference {
            code: code_owned,
            message: message_owned,
        },
        c if STALE_LOCK_CODES.contains(&c) => ProviderError::StaleLockToken {
            code: code_owned,
            message: message_owned,
        },
        c if INVALID_PARAMETER_CODES.contains(&c) => ProviderError::InvalidParameter {
            code: code_owned,
            message: message_owned,
        },
        c if UNAVAILABLE_CODES.contains(&c) => ProviderError::Unavailable {
            code: code_owned,
            message: message_owned,
        },
        _ => ProviderError::Rejected {
            code: code_owned,
            message: message_owned,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_codes() {
        for code in NOT_FOUND_CODES {
            let err = classify(code, "gone");
            assert!(err.is_not_found(), "expected NotFound for {code}");
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn already_exists_codes() {
        for code in ALREADY_EXISTS_CODES {
            assert!(classify(code, "dup").is_already_exists(), "{code}");
        }
    }

    #[test]
    fn transient_codes_are_retryable() {
        for code in THROTTLING_CODES
            .iter()
            .chain(NOT_YET_VISIBLE_CODES)
            .chain(STALE_LOCK_CODES)
            .chain(UNAVAILABLE_CODES)
        {
            assert!(classify(code, "later").is_retryable(), "{code}");
        }
    }

    #[test]
    fn permanent_codes_are_not_retryable() {
        for code in IN_USE_CODES
            .iter()
            .chain(LIMIT_CODES)
            .chain(INVALID_REFERENCE_CODES)
        {
            assert!(!classify(code, "no").is_retryable(), "{code}");
        }
        assert!(classify("WAFAssociatedItemException", "referenced").is_in_use());
    }

    #[test]
    fn generic_validation_codes_look_at_the_message() {
        let missing = classify("ValidationError", "AutoScalingGroup name not found - web");
        assert!(missing.is_not_found());

        let dangling = classify(
            "ValidationError",
            "The specified launch template, with template ID lt-1, does not exist.",
        );
        assert!(matches!(dangling, ProviderError::InvalidReference { .. }));

        let bad = classify("ValidationError", "Max bound must be >= min bound");
        assert!(matches!(bad, ProviderError::InvalidParameter { .. }));

        let record = classify(
            "InvalidChangeBatch",
            "Tried to delete resource record set [name='a.example.com.', type='A'] but it was not found",
        );
        assert!(record.is_not_found());
    }

    #[test]
    fn iam_propagation_delay_is_transient() {
        let err = classify("InvalidParameterValue", "Invalid IAM Instance Profile name");
        assert!(matches!(err, ProviderError::NotYetVisible { .. }));
    }

    #[test]
    fn unknown_codes_are_rejections() {
        let err = classify("SomethingNew", "details");
        assert!(matches!(err, ProviderError::Rejected { .. }));
        assert_eq!(err.to_string(), "SomethingNew: details");
    }

    #[test]
    fn wrappers_expose_the_inner_code() {
        let err = ProviderError::RetryBudgetExhausted {
            operation: "UpdateIPSet".into(),
            attempts: 2,
            last: Box::new(classify("Throttling", "Rate exceeded")),
        };
        assert_eq!(err.code(), "Throttling");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("retry budget exhausted"));
    }
}
