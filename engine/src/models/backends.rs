//! The persistence layer backing the data models in [`super`]: the Job Store (§4.1),
//! the Tag Cache (§4.2), the Event Bus (§4.3), Global Settings (§3 `GlobalConfig`), and
//! per-user credentials (§3 `UserConfig`). Postgres backs everything relational; Redis
//! backs only the Event Bus's pub/sub fan-out.

#[cfg(feature = "api")]
#[path = "backends"]
mod backends_reexport {
    pub mod events;
    pub mod jobs;
    pub mod setup;
    pub mod system;
    pub mod tags;
    pub mod users;
}

#[cfg(feature = "api")]
pub use backends_reexport::*;
