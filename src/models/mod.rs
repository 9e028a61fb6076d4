pub mod store;
pub mod workspace;

pub use store::{FileWorkspaceStore, MemoryWorkspaceStore, StoreError, WorkspaceStore};
pub use workspace::{
    container_name, volume_name, ContainerRecord, ContainerStatus, MemorySize, ResourceLimits,
    WorkspaceDescriptor, WorkspaceHandle, WorkspaceId,
};
