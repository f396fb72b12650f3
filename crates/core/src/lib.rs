//! ResourceSet core types: CRDs, conditions, inventory, history and changesets.

#![forbid(unsafe_code)]

pub mod changeset;
pub mod conditions;
pub mod crd;
pub mod digest;
pub mod duration;
pub mod history;
pub mod inventory;
pub mod meta;
pub mod object;
pub mod selector;

/// Raw Kubernetes object as carried through build, apply and prune.
pub type Json = serde_json::Value;

/// One input record: an ordered map handed to the builder as `inputs`.
pub type InputValues = std::collections::BTreeMap<String, Json>;

pub mod prelude {
    pub use super::changeset::{Action, ChangeSet, ChangeSetEntry};
    pub use super::conditions::{Condition, ConditionStatus};
    pub use super::crd::{
        CommonMetadata, Dependency, InputProviderRef, InputStrategy, InputStrategyName, ResourceSet,
        ResourceSetInputProvider, ResourceSetInputProviderSpec, ResourceSetInputProviderStatus,
        ResourceSetSpec, ResourceSetStatus,
    };
    pub use super::history::{History, HistoryEntry};
    pub use super::inventory::{ResourceInventory, ResourceRef};
    pub use super::object::ObjectKey;
    pub use super::selector::LabelSelector;
    pub use super::{InputValues, Json};
}
