//! Kinst reconciler: build a component's manifest through ordered stages,
//! apply it, and delete what an earlier install left behind.

#![forbid(unsafe_code)]

mod component;
mod config;
mod error;
pub mod obsolete;
mod reconciler;
pub mod source;
pub mod stages;

pub use component::{Component, ComponentSpec, ComponentStatus, Eventing, Serving};
pub use config::{ProtectedKinds, ReconcileConfig, DATA_PATH_ENV, DEFAULT_DATA_PATH, DEFAULT_FIELD_MANAGER, FIELD_MANAGER_ENV, PROTECTED_KINDS_ENV};
pub use error::{PruneFailure, ReconcileError};
pub use obsolete::{delete_obsolete_resources, obsolete, prune, DeleteObsoleteResources, InstalledAccessor, PruneReport, StatusInstalled, StoreInstalled};
pub use reconciler::{install_stages, uninstall_stages, ReconcileOutcome, Reconciler};
pub use stages::{from_fn, AppendInstalled, AppendTarget, NoOp, OwnerLabels, Stage, StageContext, StageFuture, Stages};
