use loghub_utils::partition::PartitionId;

/// Errors surfaced by the store and the endpoints that wrap it.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("uid {uid} may not access the {partition} partition")]
    PermissionDenied { uid: u32, partition: PartitionId },

    #[error("subscription limit reached ({0})")]
    Resource(usize),
}
