//! Well-known labels, annotations and the finalizer.

pub const GROUP: &str = "fluxcd.controlplane.io";
pub const API_VERSION: &str = "fluxcd.controlplane.io/v1";

pub const FINALIZER: &str = "fluxcd.controlplane.io/finalizer";

/// Owner labels stamped on every object a ResourceSet applies.
pub const OWNER_NAME_LABEL: &str = "resourceset.fluxcd.controlplane.io/name";
pub const OWNER_NAMESPACE_LABEL: &str = "resourceset.fluxcd.controlplane.io/namespace";

pub const RECONCILE_ANNOTATION: &str = "fluxcd.controlplane.io/reconcile";
pub const RECONCILE_EVERY_ANNOTATION: &str = "fluxcd.controlplane.io/reconcileEvery";
pub const RECONCILE_TIMEOUT_ANNOTATION: &str = "fluxcd.controlplane.io/reconcileTimeout";
pub const REQUESTED_AT_ANNOTATION: &str = "reconcile.fluxcd.io/requestedAt";

pub const SSA_ANNOTATION: &str = "fluxcd.controlplane.io/ssa";
pub const FORCE_ANNOTATION: &str = "fluxcd.controlplane.io/force";
pub const PRUNE_ANNOTATION: &str = "fluxcd.controlplane.io/prune";
pub const COPY_FROM_ANNOTATION: &str = "fluxcd.controlplane.io/copyFrom";

pub const ENABLED_VALUE: &str = "enabled";
pub const DISABLED_VALUE: &str = "disabled";
