//! The ingestion pipeline: the Site Handler Registry, the Extractor, the Tagger, and the
//! per-media Pipeline Stages that tie them together with the Booru Client and Tag Cache
//! (spec §4.4-§4.8).

pub mod error;

#[cfg(feature = "client")]
pub mod handlers;

#[cfg(feature = "client")]
pub mod extractor;

pub mod tagger;

#[cfg(feature = "api")]
pub mod stages;
