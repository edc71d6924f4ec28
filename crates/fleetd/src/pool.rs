//! The supervisor seen as a scaling and rollout target.

use fleet_autoscale::ScaleTarget;
use fleet_core::{BoxFuture, ScaleDirection, SlotId};
use fleet_rollout::RolloutTarget;
use fleet_supervisor::SupervisorHandle;

#[derive(Clone)]
pub struct Pool {
    supervisor: SupervisorHandle,
}

impl Pool {
    pub fn new(supervisor: SupervisorHandle) -> Self {
        Self { supervisor }
    }
}

impl ScaleTarget for Pool {
    fn live_workers(&self) -> BoxFuture<'_, anyhow::Result<u32>> {
        Box::pin(async move { Ok(self.supervisor.worker_count().await? as u32) })
    }

    fn scale(&self, direction: ScaleDirection, count: u32) -> BoxFuture<'_, anyhow::Result<u32>> {
        Box::pin(async move {
            match direction {
                ScaleDirection::Up => self.supervisor.scale_up(count).await?,
                ScaleDirection::Down => self.supervisor.scale_down(count).await?,
            };
            Ok(self.supervisor.worker_count().await? as u32)
        })
    }
}

impl RolloutTarget for Pool {
    fn live_slots(&self) -> BoxFuture<'_, anyhow::Result<Vec<SlotId>>> {
        Box::pin(async move {
            let status = self.supervisor.status().await?;
            Ok(status
                .workers
                .iter()
                .filter(|w| w.status.is_live())
                .map(|w| w.slot)
                .collect())
        })
    }

    fn set_version<'a>(&'a self, version: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move { Ok(self.supervisor.set_version(version).await?) })
    }

    fn replace(&self, slot: SlotId) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.supervisor.replace(slot).await?;
            Ok(())
        })
    }
}
