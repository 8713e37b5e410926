use nest_types::ObjectId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Published once per completed batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootChanged {
    /// New `current` commit of the top root (`None` if it has no commit).
    pub hash: Option<ObjectId>,
    /// Global paths of every root the batch touched, innermost first.
    pub roots: Vec<String>,
}

/// Receiver for [`RootChanged`] events.
pub type EventStream = broadcast::Receiver<RootChanged>;
