//! The watch loop: emits a heartbeat on a fixed cadence to the watched
//! channel and cross-checks drop progress via pub/sub, then GQL, then the
//! locally cached inventory.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::{Miner, State};
use crate::constants::{gql_operations, HEALTHCHECK_PATH, WATCH_INTERVAL};
use crate::error::MinerError;
use crate::utils::touch_healthcheck;

/// How long to wait for a pub/sub progress event after a heartbeat.
const DROP_UPDATE_WINDOW: Duration = Duration::from_secs(10);

pub(crate) async fn watch_loop(miner: Arc<Miner>) {
    // the loop is the sole source of truth for locally bumped minutes; one
    // bump per watch interval, no matter how the fallback path is entered
    let mut last_bump: Option<Instant> = None;
    loop {
        let channel_id = match miner.close.guard(miner.watching.wait()).await {
            Ok(id) => id,
            Err(_) => return,
        };
        let Some(mut channel) = miner.channel_clone(channel_id) else {
            // the registry dropped the channel between cleanups
            miner.stop_watching();
            continue;
        };
        let result = channel.send_watch(&miner.http).await;
        miner.store_channel(channel.clone());
        let (succeeded, repeat_now) = match result {
            Ok(outcome) => outcome,
            Err(MinerError::ExitRequest) => return,
            Err(e) => {
                tracing::warn!("Watch heartbeat failed: {e}");
                (false, false)
            }
        };
        tracing::debug!("Heartbeat sent, succeeded: {succeeded}, repeat_now: {repeat_now}");
        if !succeeded {
            // the campaign commonly expires mid-mining this way; the
            // maintenance task switches the channel right after
            if !repeat_now {
                watch_sleep(&miner, WATCH_INTERVAL).await;
            }
            continue;
        }
        touch_healthcheck(HEALTHCHECK_PATH);
        let last_watch = Instant::now();

        // rendezvous with the pub/sub drops handler
        let (tx, rx) = tokio::sync::oneshot::channel();
        miner.set_drop_update(tx);
        let outcome = tokio::time::timeout(DROP_UPDATE_WINDOW, rx).await;
        let _ = miner.take_drop_update();
        let handled = matches!(outcome, Ok(Ok(true)));
        if !handled {
            if outcome.is_err() {
                tracing::debug!("No drop update from the websocket received");
            }
            let mut use_active = false;
            match fetch_current_drop(&miner, channel_id).await {
                Ok(Some((drop_id, minutes))) => {
                    let known = miner
                        .inventory
                        .read()
                        .map(|inv| inv.drop_by_id(&drop_id).is_some())
                        .unwrap_or(false);
                    if !known {
                        // a campaign changed between reloads
                        tracing::info!("Missing drop detected, reloading...");
                        miner.change_state(State::InventoryFetch);
                        use_active = true;
                    } else if !miner
                        .inventory
                        .read()
                        .map(|inv| inv.drop_can_earn(&drop_id, &channel))
                        .unwrap_or(false)
                    {
                        tracing::debug!("Current drop mismatch: {drop_id}");
                        use_active = true;
                    } else {
                        if let Ok(mut inventory) = miner.inventory.write() {
                            if let Some(drop) = inventory.drop_by_id_mut(&drop_id) {
                                drop.update_minutes(minutes);
                            }
                        }
                        display_drop_progress(&miner, &drop_id);
                    }
                }
                Ok(None) => use_active = true,
                Err(MinerError::ExitRequest) => return,
                Err(e) => {
                    tracing::warn!("Current drop check failed: {e}");
                    use_active = true;
                }
            }
            if use_active {
                // even GQL can fail to name the right drop; fall back to the
                // locally computed active drop and bump it by one minute
                let active = miner
                    .inventory
                    .read()
                    .ok()
                    .and_then(|inv| inv.active_drop(&channel));
                match active {
                    Some(drop) => {
                        let due = last_bump
                            .map_or(true, |at| at.elapsed() >= WATCH_INTERVAL);
                        if due {
                            if let Ok(mut inventory) = miner.inventory.write() {
                                if let Some(drop) = inventory.drop_by_id_mut(&drop.id) {
                                    drop.bump_minutes();
                                }
                            }
                            last_bump = Some(Instant::now());
                            display_drop_progress(&miner, &drop.id);
                        }
                    }
                    None => tracing::debug!("No active drop could be determined"),
                }
            }
        }

        let elapsed = last_watch.elapsed();
        if elapsed < WATCH_INTERVAL {
            watch_sleep(&miner, WATCH_INTERVAL - elapsed).await;
        }
    }
}

/// Sleep that the `restart` signal (and close) can cut short.
async fn watch_sleep(miner: &Arc<Miner>, delay: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = miner.watch_restart.notified() => {}
        _ = miner.close.closed() => {}
    }
}

/// Ask GQL for the current drop session; `Ok(None)` when there is none.
async fn fetch_current_drop(
    miner: &Arc<Miner>,
    channel_id: u64,
) -> crate::error::Result<Option<(String, u32)>> {
    let data = miner
        .http
        .gql(
            &gql_operations::CURRENT_DROP,
            Some(serde_json::json!({
                "channelID": channel_id.to_string(),
                "channelLogin": "",
            })),
        )
        .await?;
    let session = data.pointer("/currentUser/dropCurrentSession");
    let Some(session) = session.filter(|s| !s.is_null()) else {
        return Ok(None);
    };
    let drop_id = session
        .get("dropID")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let minutes = session
        .get("currentMinutesWatched")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32;
    Ok(drop_id.map(|id| (id, minutes)))
}

/// Put the mined drop's progress on the status line.
pub(crate) fn display_drop_progress(miner: &Arc<Miner>, drop_id: &str) {
    let Ok(inventory) = miner.inventory.read() else {
        return;
    };
    let (Some(drop), Some(campaign)) = (
        inventory.drop_by_id(drop_id),
        inventory.campaign_of_drop(drop_id),
    ) else {
        return;
    };
    miner.ui.display_drop(&format!(
        "{} ({}, {}/{})",
        drop.name, campaign.game.name, drop.current_minutes, drop.required_minutes
    ));
}

/// Follow-up for a pub/sub `drop-claim` event: claim the drop, wait for the
/// platform to switch to the next drop, then restart watching or reload.
pub(crate) async fn handle_drop_claim(miner: &Arc<Miner>, drop_id: &str, drop_instance_id: &str) {
    {
        let Ok(mut inventory) = miner.inventory.write() else {
            return;
        };
        match inventory.drop_by_id_mut(drop_id) {
            Some(drop) => drop.update_claim(drop_instance_id.to_string()),
            None => {
                tracing::error!(
                    "Received a drop claim ID for a non-existing drop: {drop_id}\n\
                     Drop claim ID: {drop_instance_id}"
                );
                return;
            }
        }
    }
    match miner.claim_drop(drop_id).await {
        Ok(true) => {}
        Ok(false) => tracing::error!("Drop claim has potentially failed! Drop ID: {drop_id}"),
        Err(e) => {
            tracing::warn!("Drop claim errored: {e}");
            return;
        }
    }

    // about 4-20s after claiming, the next drop can be started by re-sending
    // the watch payload; poll the current drop until its id moves on
    if miner
        .close
        .guard(tokio::time::sleep(Duration::from_secs(4)))
        .await
        .is_err()
    {
        return;
    }
    if let Some(channel_id) = miner.watching.get() {
        for _attempt in 0..8 {
            match fetch_current_drop(miner, channel_id).await {
                Ok(Some((current_id, _))) if current_id == drop_id => {}
                _ => break,
            }
            if miner
                .close
                .guard(tokio::time::sleep(Duration::from_secs(2)))
                .await
                .is_err()
            {
                return;
            }
        }
    }

    let can_still_earn = miner
        .watching
        .get()
        .and_then(|id| miner.channel_clone(id))
        .map(|channel| {
            miner
                .inventory
                .read()
                .map(|inv| {
                    inv.campaign_of_drop(drop_id)
                        .map(|c| c.can_earn(Some(&channel)))
                        .unwrap_or(false)
                })
                .unwrap_or(false)
        })
        .unwrap_or(false);
    if can_still_earn {
        miner.restart_watching();
    } else {
        miner.change_state(State::InventoryFetch);
    }
}

// =============================================================================
// Tests
// =============================================================================
