//! Helper macros for the ingest engine

/// Update a value if the new value is not `None`
#[doc(hidden)]
#[macro_export]
macro_rules! update {
    ($orig:expr, $update:expr) => {
        if let Some(new) = $update {
            $orig = new;
        }
    };
    // map the updated value with a fallible mapping function before setting the value
    ($orig:expr, $update:expr, $map:expr) => {
        if let Some(new) = $update {
            $orig = $map(new)?;
        }
    };
}

/// Update a value if the new value is not `None`, keeping the field wrapped in `Option`
#[doc(hidden)]
#[macro_export]
macro_rules! update_opt {
    ($orig:expr, $update:expr) => {
        if let Some(new) = $update.take() {
            $orig = Some(new);
        }
    };
}

/// Logs an error that would normally be lost by an iterator filter
///
/// # Arguments
///
/// * `res` - The result to check for an error to log
#[cfg(feature = "api")]
pub fn log_err<T>(res: Result<T, crate::utils::ApiError>) -> Option<T> {
    match res {
        Ok(res) => Some(res),
        Err(error) => {
            tracing::error!(%error, "dropped error in iterator");
            None
        }
    }
}
