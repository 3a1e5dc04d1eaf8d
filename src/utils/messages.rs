//! Default message catalog

use crate::traits::MessageCatalog;
use crate::types::ErrorKind;

/// English fallback messages; other locales are left to the host
pub struct DefaultMessages;

impl MessageCatalog for DefaultMessages {
    fn message(&self, kind: ErrorKind, locale: &str) -> Option<String> {
        if !locale.to_ascii_lowercase().starts_with("en") {
            return None;
        }
        let text = match kind {
            ErrorKind::Conflict => "The record was changed by someone else. Reload and try again.",
            ErrorKind::NotEditable => "The record can no longer be changed in its current status.",
            ErrorKind::GuardViolation => "This action is not allowed for you or in the current state.",
            ErrorKind::InUse => "The record is still in use and cannot be deleted.",
            ErrorKind::EmptyBody => "The document must contain at least one line.",
            ErrorKind::Validation => "Some fields are invalid.",
            ErrorKind::NotFound => "The record does not exist.",
            ErrorKind::Internal => "An internal error occurred.",
        };
        Some(text.to_string())
    }
}
