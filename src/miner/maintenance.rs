//! Maintenance scheduler: timed wakeups for channel cleanup, bonus points,
//! and the forced hourly reload.

use std::sync::Arc;

use chrono::{Duration, Utc};

use super::{Miner, State};

/// Unclaimed-bonus check cadence.
const CLAIM_PERIOD_MINUTES: i64 = 30;
/// Forced full reload cadence; the task ends itself here and a new one is
/// started by the next inventory fetch.
const RELOAD_PERIOD_MINUTES: i64 = 60;

impl Miner {
    /// Replace the running maintenance task with a fresh one. Called at the
    /// end of every inventory fetch.
    pub(crate) fn restart_maintenance(&self) {
        let Some(miner) = self.arc() else {
            return;
        };
        let task = tokio::spawn(maintenance_task(miner));
        if let Ok(mut slot) = self.mnt_task.lock() {
            if let Some(old) = slot.replace(task) {
                old.abort();
            }
        }
    }
}

async fn maintenance_task(miner: Arc<Miner>) {
    let claim_period = Duration::minutes(CLAIM_PERIOD_MINUTES);
    let period_end = Utc::now() + Duration::minutes(RELOAD_PERIOD_MINUTES);
    loop {
        let now = Utc::now();
        if now >= period_end {
            break;
        }
        let mut next_trigger = (now + claim_period).min(period_end);
        let mut trigger_cleanup = false;
        if let Ok(mut inventory) = miner.inventory.write() {
            // campaign transitions coalesce into one wake at the latest one
            // inside the window
            while inventory
                .triggers
                .first()
                .is_some_and(|t| *t <= next_trigger)
            {
                next_trigger = inventory.triggers.remove(0);
                trigger_cleanup = true;
            }
        }
        let trigger_type = if next_trigger == period_end {
            "reload"
        } else if trigger_cleanup {
            "cleanup"
        } else {
            "points"
        };
        tracing::debug!("Maintenance task waiting until {next_trigger} ({trigger_type})");
        let wait = (next_trigger - Utc::now()).num_milliseconds().max(0) as u64;
        if miner
            .close
            .guard(tokio::time::sleep(std::time::Duration::from_millis(wait)))
            .await
            .is_err()
        {
            return;
        }
        if Utc::now() >= period_end {
            break;
        }
        if trigger_cleanup {
            tracing::debug!("Maintenance task requests channels cleanup");
            miner.change_state(State::ChannelsCleanup);
        }
        // make sure no points bonus sits unclaimed on the watched channel
        if let Some(mut channel) = miner.watching.get().and_then(|id| miner.channel_clone(id)) {
            // anything going wrong here is intentionally ignored
            if channel.claim_bonus(&miner.http).await.is_ok() {
                miner.store_channel(channel);
            }
        }
    }
    tracing::debug!("Maintenance task requests a reload");
    miner.change_state(State::InventoryFetch);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::ui::{CloseSignal, Ui};

    fn test_miner() -> Arc<Miner> {
        let close = CloseSignal::new();
        let ui = Ui::new(close.clone(), false);
        Miner::new(Settings::default(), ui, close).unwrap()
    }

    #[tokio::test]
    async fn test_restart_maintenance_replaces_task() {
        let miner = test_miner();
        miner.restart_maintenance();
        let first = miner.mnt_task.lock().unwrap().is_some();
        assert!(first);
        miner.restart_maintenance();
        assert!(miner.mnt_task.lock().unwrap().is_some());
        // shut the task down
        miner.close.request_close();
    }

    #[tokio::test]
    async fn test_maintenance_exits_on_close() {
        let miner = test_miner();
        miner.restart_maintenance();
        miner.close.request_close();
        let task = miner.mnt_task.lock().unwrap().take().unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("maintenance should exit on close")
            .unwrap();
    }
}
