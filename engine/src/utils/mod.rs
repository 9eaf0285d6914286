//! Utilities for the ingest engine

#[cfg(feature = "api")]
#[path = ""]
mod utils_api_reexport {
    pub mod bounder;
    pub mod errors;
    pub mod macros;
    pub mod shared;
    pub use errors::ApiError;
    pub use shared::{AppState, Shared};
}

#[cfg(feature = "api")]
pub use utils_api_reexport::*;

#[cfg(feature = "api")]
pub mod ids;

#[cfg(feature = "trace")]
#[path = ""]
mod trace_reexport {
    pub mod trace;
}

#[cfg(feature = "trace")]
pub use trace_reexport::*;

pub mod helpers;
