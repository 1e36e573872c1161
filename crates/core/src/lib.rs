//! Kinst core types: resources, manifests and the cluster client seam.

#![forbid(unsafe_code)]

mod client;
mod error;
mod manifest;
mod resource;
pub mod yaml;

pub use client::ResourceClient;
pub use error::{ClientError, ManifestError};
pub use manifest::{predicates, Manifest};
pub use resource::{Resource, ResourceKey};

pub mod prelude {
    pub use super::predicates::*;
    pub use super::{ClientError, Manifest, ManifestError, Resource, ResourceClient, ResourceKey};
}
