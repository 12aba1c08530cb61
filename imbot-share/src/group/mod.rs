//! 群元数据缓存：存储、去重拉取、事件合并

mod fetch;
mod reconcile;
mod store;

pub use fetch::{FetchCoordinator, GroupFetcher};
pub use reconcile::{
    AttributeChange, DEFAULT_MAX_REFRESH_FAILURES, EventReconciler, MembershipAction,
    MembershipChange, apply_membership,
};
pub use store::MetadataStore;
