#[cfg(feature = "api")]
#[path = ""]
mod routes_reexport {
    pub mod basic;
    pub mod docs;
    pub mod events;
    pub mod jobs;
    pub mod system;
}

#[cfg(feature = "api")]
pub use routes_reexport::*;
