//! Small helper functions shared across the ingest engine

/// The max length a persisted job error message is allowed to reach (spec §7)
pub const MAX_ERROR_MESSAGE_BYTES: usize = 4096;

/// Truncate an error message to [`MAX_ERROR_MESSAGE_BYTES`] so a runaway subprocess/extractor
/// error can't blow up the `jobs.error_message` column
#[must_use]
pub fn truncate_error_message(msg: &str) -> String {
    if msg.len() <= MAX_ERROR_MESSAGE_BYTES {
        return msg.to_string();
    }
    // find a char boundary at or before the cap so we don't split a multi-byte char
    let mut cut = MAX_ERROR_MESSAGE_BYTES;
    while cut > 0 && !msg.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... (truncated)", &msg[..cut])
}
