use shared::FailureCategory;

/// Result code for "initiator information is invalid".
const RESULT_INITIATOR_INVALID: &str = "2001";

/// Best-effort mapping of a provider failure onto a [`FailureCategory`].
///
/// Only the user-facing message depends on this; booking state does not.
pub fn classify_failure(code: Option<&str>, message: &str) -> FailureCategory {
    if code == Some(RESULT_INITIATOR_INVALID) {
        return FailureCategory::Validation;
    }

    let message = message.to_lowercase();
    if message.contains("initiator") || message.contains("invalid") {
        FailureCategory::Validation
    } else {
        FailureCategory::Generic
    }
}
