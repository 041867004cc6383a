//! Pub/sub event dispatch: decoded events arrive over a channel and are
//! handled as detached tasks, so handling never blocks receiving. Handlers
//! are idempotent.

use std::sync::Arc;

use super::{watch, Miner, State};
use crate::constants::{gql_operations, ONLINE_DELAY};
use crate::models::Channel;
use crate::ws::WsEvent;

pub(crate) async fn event_loop(
    miner: Arc<Miner>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<WsEvent>,
) {
    loop {
        tokio::select! {
            _ = miner.close.closed() => break,
            event = events.recv() => match event {
                Some(event) => {
                    let miner = miner.clone();
                    tokio::spawn(async move { handle_event(miner, event).await });
                }
                None => break,
            },
        }
    }
}

async fn handle_event(miner: Arc<Miner>, event: WsEvent) {
    match event {
        WsEvent::DropProgress {
            drop_id,
            current_minutes,
        } => handle_drop_progress(&miner, &drop_id, current_minutes),
        WsEvent::DropClaim {
            drop_id,
            drop_instance_id,
        } => watch::handle_drop_claim(&miner, &drop_id, &drop_instance_id).await,
        WsEvent::PointsEarned {
            channel_id,
            points,
            balance,
        } => {
            if let Some(mut channel) = miner.channel_clone(channel_id) {
                channel.points = Some(balance);
                miner.store_channel(channel);
            }
            miner
                .ui
                .print(&format!("Earned {points} points, balance: {balance}"));
        }
        WsEvent::PointsClaimAvailable {
            channel_id,
            claim_id,
        } => {
            let result = miner
                .http
                .gql(
                    &gql_operations::CLAIM_COMMUNITY_POINTS,
                    Some(serde_json::json!({
                        "input": {"channelID": channel_id.to_string(), "claimID": claim_id}
                    })),
                )
                .await;
            match result {
                Ok(_) => miner.ui.print("Claimed bonus points"),
                Err(e) => tracing::warn!("Bonus points claim failed: {e}"),
            }
        }
        WsEvent::DropReminderNotification { notification_id } => {
            // a reward reminder means our inventory view is stale
            miner.change_state(State::InventoryFetch);
            let result = miner
                .http
                .gql(
                    &gql_operations::NOTIFICATIONS_DELETE,
                    Some(serde_json::json!({"input": {"id": notification_id}})),
                )
                .await;
            if let Err(e) = result {
                tracing::debug!("Notification delete failed: {e}");
            }
        }
        WsEvent::StreamUp { channel_id } => {
            debounced_online_check(&miner, channel_id).await;
        }
        WsEvent::StreamDown { channel_id } => {
            let Some(mut channel) = miner.channel_clone(channel_id) else {
                tracing::error!("Stream state change for a non-existing channel: {channel_id}");
                return;
            };
            let was_online = channel.online;
            channel.set_offline();
            miner.store_channel(channel.clone());
            on_channel_update(&miner, was_online, &channel);
        }
        WsEvent::ViewCount {
            channel_id,
            viewers,
        } => {
            let Some(mut channel) = miner.channel_clone(channel_id) else {
                tracing::error!("Viewcount for a non-existing channel: {channel_id}");
                return;
            };
            if channel.online {
                channel.viewers = Some(viewers);
                miner.store_channel(channel);
            } else {
                // receiving viewer counts means it's live after all
                debounced_online_check(&miner, channel_id).await;
            }
        }
        WsEvent::StreamUpdate { channel_id } => {
            // title/tags/game changed; refresh the stream facts after the
            // usual debounce so rapid edits coalesce
            tracing::debug!("Channel update from websocket: {channel_id}");
            debounced_online_check(&miner, channel_id).await;
        }
    }
}

/// Websocket progress events race with the watch loop's 10s window; the
/// rendezvous resolves the race. `true` means the payload matched the drop
/// being mined and was applied here.
fn handle_drop_progress(miner: &Arc<Miner>, drop_id: &str, current_minutes: u32) {
    let Some(sender) = miner.take_drop_update() else {
        // nobody is waiting for a progress update right now
        return;
    };
    let watching = miner.watching.get().and_then(|id| miner.channel_clone(id));
    let relevant = watching
        .as_ref()
        .map(|channel| {
            miner
                .inventory
                .read()
                .map(|inv| inv.drop_can_earn(drop_id, channel))
                .unwrap_or(false)
        })
        .unwrap_or(false);
    if relevant {
        if let Ok(mut inventory) = miner.inventory.write() {
            if let Some(drop) = inventory.drop_by_id_mut(drop_id) {
                drop.update_minutes(current_minutes);
            }
        }
        watch::display_drop_progress(miner, drop_id);
    } else {
        tracing::debug!("Drop update for an unrelated drop: {drop_id}");
    }
    // the consumer may have timed out already; a lost send is fine
    let _ = sender.send(relevant);
}

/// Wait out the online-debounce window, then refresh the channel's stream
/// facts and react to the change.
async fn debounced_online_check(miner: &Arc<Miner>, channel_id: u64) {
    {
        let Some(mut channel) = miner.channel_clone(channel_id) else {
            return;
        };
        if channel.pending_online {
            // a check is already scheduled
            return;
        }
        channel.pending_online = true;
        miner.store_channel(channel);
    }
    if miner
        .close
        .guard(tokio::time::sleep(ONLINE_DELAY))
        .await
        .is_err()
    {
        return;
    }
    let Some(mut channel) = miner.channel_clone(channel_id) else {
        return;
    };
    let was_online = channel.online;
    if let Err(e) = channel.update_stream(&miner.http).await {
        channel.pending_online = false;
        miner.store_channel(channel);
        tracing::warn!("Stream update failed for {channel_id}: {e}");
        return;
    }
    miner.store_channel(channel.clone());
    on_channel_update(miner, was_online, &channel);
}

/// React to a channel's status change.
fn on_channel_update(miner: &Arc<Miner>, was_online: bool, channel: &Channel) {
    let watching_id = miner.watching.get();
    if !was_online && channel.online {
        // channel going ONLINE
        if miner.can_watch(channel) && miner.should_switch(channel) {
            miner.ui.print(&format!("{} goes online", channel.name()));
            miner.watch(channel.id);
        } else {
            tracing::info!("{} goes ONLINE", channel.name());
        }
    } else if watching_id == Some(channel.id) && !miner.can_watch(channel) {
        // the watched channel stopped qualifying
        if !channel.online {
            miner.ui.print(&format!("{} goes offline", channel.name()));
        } else {
            tracing::info!("{} status updated, switching...", channel.name());
        }
        miner.change_state(State::ChannelSwitch);
    } else if !channel.online {
        tracing::info!("{} goes OFFLINE", channel.name());
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::inventory::{DropsCampaign, Game, TimedDrop};
    use crate::settings::Settings;
    use crate::ui::{CloseSignal, Ui};
    use chrono::{Duration, Utc};

    fn test_miner() -> Arc<Miner> {
        let close = CloseSignal::new();
        let ui = Ui::new(close.clone(), false);
        Miner::new(Settings::default(), ui, close).unwrap()
    }

    fn game(id: &str) -> Game {
        Game {
            id: id.to_string(),
            name: format!("Game {id}"),
            slug: None,
        }
    }

    fn campaign_with_drop(id: &str, g: Game) -> DropsCampaign {
        let now = Utc::now();
        DropsCampaign {
            id: id.to_string(),
            name: format!("{id} campaign"),
            game: g,
            starts_at: now - Duration::hours(1),
            ends_at: now + Duration::hours(12),
            linked: true,
            link_url: String::new(),
            allowed_channels: vec![],
            drops: vec![TimedDrop {
                id: format!("{id}-d1"),
                campaign_id: id.to_string(),
                name: "Drop".to_string(),
                starts_at: now - Duration::hours(1),
                ends_at: now + Duration::hours(12),
                required_minutes: 60,
                current_minutes: 10,
                claim_instance_id: None,
                is_claimed: false,
                benefits: vec![],
            }],
        }
    }

    #[tokio::test]
    async fn test_drop_progress_updates_matching_drop() {
        let miner = test_miner();
        let g = game("g1");
        miner
            .inventory
            .write()
            .unwrap()
            .replace(vec![campaign_with_drop("c1", g.clone())], vec![]);
        let mut channel = Channel::for_test(1, "streamer", Some(g.clone()));
        channel.online = true;
        miner.channels.lock().unwrap().insert(1, channel);
        miner.watching.set(1);
        miner
            .wanted_games
            .lock()
            .unwrap()
            .insert("g1".to_string(), (g, 1.0));

        let (tx, rx) = tokio::sync::oneshot::channel();
        miner.set_drop_update(tx);
        handle_drop_progress(&miner, "c1-d1", 42);

        assert_eq!(rx.await.unwrap(), true);
        let inventory = miner.inventory.read().unwrap();
        assert_eq!(inventory.drop_by_id("c1-d1").unwrap().current_minutes, 42);
    }

    #[tokio::test]
    async fn test_drop_progress_for_unrelated_drop_signals_false() {
        let miner = test_miner();
        let (tx, rx) = tokio::sync::oneshot::channel();
        miner.set_drop_update(tx);
        handle_drop_progress(&miner, "unknown-drop", 42);
        assert_eq!(rx.await.unwrap(), false);
    }

    #[tokio::test]
    async fn test_drop_progress_without_waiter_is_ignored() {
        let miner = test_miner();
        // no rendezvous installed: nothing happens, nothing panics
        handle_drop_progress(&miner, "whatever", 1);
        assert!(miner.take_drop_update().is_none());
    }

    #[test]
    fn test_on_channel_update_switches_to_better_channel() {
        let miner = test_miner();
        let g = game("g1");
        miner
            .inventory
            .write()
            .unwrap()
            .replace(vec![campaign_with_drop("c1", g.clone())], vec![]);
        miner
            .wanted_games
            .lock()
            .unwrap()
            .insert("g1".to_string(), (g.clone(), 2.0));
        let mut channel = Channel::for_test(5, "streamer", Some(g));
        channel.online = true;
        miner.channels.lock().unwrap().insert(5, channel.clone());

        on_channel_update(&miner, false, &channel);
        assert_eq!(miner.watching.get(), Some(5));
    }

    #[test]
    fn test_watched_channel_going_offline_requests_switch() {
        let miner = test_miner();
        let g = game("g1");
        miner
            .wanted_games
            .lock()
            .unwrap()
            .insert("g1".to_string(), (g.clone(), 1.0));
        let mut channel = Channel::for_test(5, "streamer", Some(g));
        channel.online = true;
        miner.channels.lock().unwrap().insert(5, channel.clone());
        miner.watching.set(5);

        channel.set_offline();
        miner.store_channel(channel.clone());
        on_channel_update(&miner, true, &channel);
        assert_eq!(miner.current_state(), State::ChannelSwitch);
    }
}
