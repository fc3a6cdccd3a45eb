use std::sync::Arc;

use async_trait::async_trait;
use reelforge_common::events::{EventBus, EventPayload};
use reelforge_common::TaskId;
use reelforge_exec::progress::{ObserverError, ProgressObserver, ProgressSample};

/// Forwards a run's progress samples onto the [`EventBus`].
pub struct EventBusObserver {
    bus: Arc<EventBus>,
    task_id: TaskId,
}

impl EventBusObserver {
    pub fn new(bus: Arc<EventBus>, task_id: TaskId) -> Self {
        Self { bus, task_id }
    }
}

#[async_trait]
impl ProgressObserver for EventBusObserver {
    async fn on_progress(&self, sample: &ProgressSample) -> Result<(), ObserverError> {
        self.bus.broadcast(
            &self.task_id,
            EventPayload::Progress {
                percent: sample.percent,
                message: sample.message.clone(),
                eta_secs: sample.eta_secs,
            },
        );
        Ok(())
    }
}
