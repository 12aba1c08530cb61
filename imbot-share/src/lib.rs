pub mod model;
pub mod error;
pub mod group;
pub mod session;
pub mod dispatch;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use model::{CachedGroup, GroupId, GroupPatch, MemberId, Participant, RawGroup, Role, Roster};
pub use error::{FetchError, LifecycleError, ReconcileError};
pub use group::{
    AttributeChange, EventReconciler, FetchCoordinator, GroupFetcher, MembershipAction,
    MembershipChange, MetadataStore,
};
pub use session::{
    ConnectionState, Connector, CredentialStore, DisconnectAction, LifecycleManager,
    ReconnectPolicy, SessionHandle, SessionId,
};
pub use dispatch::{EventDispatcher, SessionEvent};
