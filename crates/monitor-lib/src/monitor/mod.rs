//! The polling loop and its foreground handle
//!
//! One background task drives the tick cycle; foreground callers interact
//! through [`MonitorHandle`], which reads shared state through snapshot
//! copies and funnels registry-mutating commands onto the loop task.

mod handle;
mod r#loop;

pub use handle::MonitorHandle;
pub use r#loop::{MonitorConfig, MonitorLoop};

use crate::error::EngineResult;
use crate::models::{ScalingEvent, SnapshotBatch};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, oneshot};

/// The update channel's sender, shared between the loop and its handles.
/// The loop empties the slot when it exits, closing the channel for
/// every subscriber no matter how many handle clones are still alive.
pub(crate) type SharedBatchSender = Arc<RwLock<Option<broadcast::Sender<SnapshotBatch>>>>;

/// Commands executed on the loop task so that registry mutation stays
/// single-owner
#[derive(Debug)]
pub(crate) enum Command {
    RequestClone {
        original_id: String,
        reply: oneshot::Sender<EngineResult<ScalingEvent>>,
    },
}
