//! The orchestration root: owns auth, the pub/sub pool, the inventory, and
//! the channel registry, and drives the main state machine.

pub mod events;
pub mod inventory;
pub mod maintenance;
pub mod watch;

pub use inventory::Inventory;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{Duration, Utc};
use tokio::sync::{mpsc, oneshot, watch as tokio_watch, Notify};

use crate::auth::AuthState;
use crate::constants::{gql_operations, HEALTHCHECK_PATH, MAX_CHANNELS};
use crate::error::{MinerError, Result};
use crate::http::HttpClient;
use crate::models::{Channel, Game};
use crate::scoring::{campaign_score, ScoreContext};
use crate::settings::{PriorityAlgorithm, Settings};
use crate::ui::{CloseSignal, Ui};
use crate::utils::touch_healthcheck;
use crate::ws::{TopicKind, WsEvent, WsPool, WsTopic};

/// Main state machine states. `Exit` is terminal; a fresh run starts at
/// `InventoryFetch` right after login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    InventoryFetch,
    GamesUpdate,
    ChannelsCleanup,
    ChannelsFetch,
    ChannelSwitch,
    Exit,
}

pub struct Miner {
    /// Back-reference to the owning `Arc`, for spawning tasks from `&self`.
    me: std::sync::Weak<Miner>,
    pub settings: Mutex<Settings>,
    pub auth: Arc<AuthState>,
    pub http: HttpClient,
    pub ui: Ui,
    pub close: CloseSignal,
    pub ws: WsPool,
    ws_events: Mutex<Option<mpsc::UnboundedReceiver<WsEvent>>>,
    state: tokio_watch::Sender<State>,
    pub(crate) inventory: RwLock<Inventory>,
    pub(crate) channels: Mutex<HashMap<u64, Channel>>,
    /// game id -> (game, priority score); recomputed in GAMES_UPDATE
    pub(crate) wanted_games: Mutex<HashMap<String, (Game, f64)>>,
    /// The single watched-channel slot, holding the channel id.
    pub(crate) watching: crate::utils::AwaitableValue<u64>,
    pub(crate) watch_restart: Notify,
    /// One-shot rendezvous between the pub/sub drops handler and the watch
    /// loop; the consumer tolerates spurious producers.
    pub(crate) drop_update: Mutex<Option<oneshot::Sender<bool>>>,
    pub(crate) mnt_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    full_cleanup: AtomicBool,
}

impl Miner {
    pub fn new(settings: Settings, ui: Ui, close: CloseSignal) -> Result<Arc<Self>> {
        let auth = Arc::new(AuthState::new());
        let http = HttpClient::new(auth.clone(), close.clone(), Some(settings.proxy.as_str()))?;
        let (ws, ws_events) = WsPool::new(auth.clone(), close.clone());
        let (state, _rx) = tokio_watch::channel(State::Idle);
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            settings: Mutex::new(settings),
            auth,
            http,
            ui,
            close,
            ws,
            ws_events: Mutex::new(Some(ws_events)),
            state,
            inventory: RwLock::new(Inventory::default()),
            channels: Mutex::new(HashMap::new()),
            wanted_games: Mutex::new(HashMap::new()),
            watching: crate::utils::AwaitableValue::new(),
            watch_restart: Notify::new(),
            drop_update: Mutex::new(None),
            mnt_task: Mutex::new(None),
            full_cleanup: AtomicBool::new(false),
        }))
    }

    /// The owning `Arc`; present for the whole lifetime of any method call.
    pub(crate) fn arc(&self) -> Option<Arc<Self>> {
        self.me.upgrade()
    }

    pub fn current_state(&self) -> State {
        *self.state.borrow()
    }

    pub fn change_state(&self, new_state: State) {
        tracing::info!("State change: {:?} -> {:?}", self.current_state(), new_state);
        self.state.send_replace(new_state);
    }

    /// Run the miner until exit or a fatal error.
    pub async fn run(&self) -> Result<()> {
        self.auth.validate(&self.http, &self.ui).await?;
        let user_id = self
            .auth
            .user_id()
            .ok_or_else(|| MinerError::Login("no user id after validation".into()))?;
        self.ws.start();
        self.ws.add_topics([
            WsTopic::new(TopicKind::UserDrops, user_id),
            WsTopic::new(TopicKind::UserCommunityPoints, user_id),
            WsTopic::new(TopicKind::UserNotifications, user_id),
        ])?;

        // pub/sub dispatch and the watch loop run concurrently with the
        // state machine
        let this = self
            .arc()
            .ok_or_else(|| MinerError::miner("miner already shut down"))?;
        if let Some(events) = self.ws_events.lock().ok().and_then(|mut rx| rx.take()) {
            tokio::spawn(events::event_loop(this.clone(), events));
        }
        tokio::spawn(watch::watch_loop(this));

        self.change_state(State::InventoryFetch);
        let mut state_rx = self.state.subscribe();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                State::Idle => {
                    self.ui.status("Idle");
                    self.stop_watching();
                    touch_healthcheck(HEALTHCHECK_PATH);
                }
                State::InventoryFetch => {
                    self.ws.start();
                    self.fetch_inventory().await?;
                    if let Ok(mut settings) = self.settings.lock() {
                        let _ = settings.save(false);
                    }
                    self.change_state(State::GamesUpdate);
                }
                State::GamesUpdate => {
                    self.games_update().await?;
                    self.change_state(State::ChannelsCleanup);
                }
                State::ChannelsCleanup => {
                    self.channels_cleanup()?;
                }
                State::ChannelsFetch => {
                    self.channels_fetch().await?;
                    self.change_state(State::ChannelSwitch);
                }
                State::ChannelSwitch => {
                    self.channel_switch();
                }
                State::Exit => {
                    self.ui.status("Exiting...");
                    break;
                }
            }
            // wait for the next state change; a transition made while
            // handling resumes immediately, otherwise we sleep here
            if !state_rx.has_changed().unwrap_or(false) {
                if self.close.guard(state_rx.changed()).await.is_err() {
                    break;
                }
            }
        }
        self.ws.stop(true).await;
        Ok(())
    }

    // =========================================================================
    // GAMES_UPDATE
    // =========================================================================

    /// Claim everything claimable, then recompute `wanted_games` with the
    /// active priority algorithm.
    pub(crate) async fn games_update(&self) -> Result<()> {
        let claimable: Vec<String> = {
            let inventory = self
                .inventory
                .read()
                .map_err(|_| MinerError::miner("inventory poisoned"))?;
            inventory
                .campaigns
                .iter()
                .filter(|c| !c.upcoming())
                .flat_map(|c| c.drops.iter())
                .filter(|d| d.can_claim())
                .map(|d| d.id.clone())
                .collect()
        };
        for drop_id in claimable {
            self.claim_drop(&drop_id).await?;
        }

        let (exclude, priority, priority_only, unlinked_campaigns, algorithm) = {
            let settings = self
                .settings
                .lock()
                .map_err(|_| MinerError::miner("settings poisoned"))?;
            (
                settings.exclude.clone(),
                settings.priority.clone(),
                settings.priority_only,
                settings.unlinked_campaigns,
                settings.priority_algorithm,
            )
        };

        let now = Utc::now();
        let next_hour = now + Duration::hours(1);
        let mut wanted: HashMap<String, (Game, f64)> = HashMap::new();
        {
            let inventory = self
                .inventory
                .read()
                .map_err(|_| MinerError::miner("inventory poisoned"))?;
            let mut filtered: Vec<&crate::models::DropsCampaign> = Vec::new();
            let mut seen_games: std::collections::HashSet<String> = std::collections::HashSet::new();
            for campaign in &inventory.campaigns {
                let game = &campaign.game;
                if seen_games.contains(&game.id)
                    || exclude.contains(&game.name)
                    || (priority_only && !priority.contains(&game.name))
                    || (!unlinked_campaigns && !campaign.linked)
                    || !campaign.can_earn_within_at(next_hour, now)
                {
                    continue;
                }
                seen_games.insert(game.id.clone());
                filtered.push(campaign);
            }
            if algorithm == PriorityAlgorithm::EndingSoonest {
                filtered.sort_by_key(|c| c.ends_at);
            }
            let ctx = ScoreContext {
                algorithm,
                priority: &priority,
                filtered_len: filtered.len(),
            };
            for (index, campaign) in filtered.iter().enumerate() {
                let score = campaign_score(&ctx, campaign, index, now);
                wanted.insert(campaign.game.id.clone(), (campaign.game.clone(), score));
            }
        }
        tracing::info!("Wanted games: {}", wanted.len());
        if let Ok(mut wanted_games) = self.wanted_games.lock() {
            *wanted_games = wanted;
        }
        self.full_cleanup.store(true, Ordering::SeqCst);
        self.restart_watching();
        Ok(())
    }

    // =========================================================================
    // CHANNELS_CLEANUP
    // =========================================================================

    pub(crate) fn channels_cleanup(&self) -> Result<()> {
        self.ui.status("Cleaning up channels...");
        let full_cleanup = self.full_cleanup.swap(false, Ordering::SeqCst);
        let wanted_empty = self
            .wanted_games
            .lock()
            .map(|w| w.is_empty())
            .unwrap_or(true);
        let to_remove: Vec<u64> = {
            let channels = self
                .channels
                .lock()
                .map_err(|_| MinerError::miner("channel registry poisoned"))?;
            if wanted_empty || full_cleanup {
                channels.keys().copied().collect()
            } else {
                let wanted = self.wanted_games.lock().map_err(|_| {
                    MinerError::miner("wanted games poisoned")
                })?;
                channels
                    .values()
                    .filter(|channel| {
                        !channel.acl_based
                            && (!channel.online
                                || channel
                                    .game
                                    .as_ref()
                                    .map_or(true, |g| !wanted.contains_key(&g.id)))
                    })
                    .map(|channel| channel.id)
                    .collect()
            }
        };
        if !to_remove.is_empty() {
            self.ws
                .remove_topics(to_remove.iter().flat_map(|id| channel_topic_strings(*id)))?;
            if let Ok(mut channels) = self.channels.lock() {
                for id in &to_remove {
                    channels.remove(id);
                }
            }
        }
        if wanted_empty {
            self.ui.print("No active campaigns to mine");
            touch_healthcheck(HEALTHCHECK_PATH);
            self.change_state(State::Idle);
        } else {
            self.change_state(State::ChannelsFetch);
        }
        Ok(())
    }

    // =========================================================================
    // CHANNELS_FETCH
    // =========================================================================

    pub(crate) async fn channels_fetch(&self) -> Result<()> {
        self.ui.status("Gathering channels...");
        // start from whatever survived cleanup
        let mut pool: Vec<Channel> = {
            let mut channels = self
                .channels
                .lock()
                .map_err(|_| MinerError::miner("channel registry poisoned"))?;
            channels.drain().map(|(_, channel)| channel).collect()
        };

        // ACL channels of still-earnable campaigns, and the games that need
        // a directory query instead
        let now = Utc::now();
        let next_hour = now + Duration::hours(1);
        let (acl_refs, no_acl_games) = {
            let wanted = self
                .wanted_games
                .lock()
                .map_err(|_| MinerError::miner("wanted games poisoned"))?;
            let inventory = self
                .inventory
                .read()
                .map_err(|_| MinerError::miner("inventory poisoned"))?;
            let mut acl_refs: Vec<crate::models::AclChannelRef> = Vec::new();
            let mut no_acl: Vec<Game> = Vec::new();
            for campaign in &inventory.campaigns {
                if !wanted.contains_key(&campaign.game.id)
                    || !campaign.can_earn_within_at(next_hour, now)
                {
                    continue;
                }
                if campaign.acl_based() {
                    acl_refs.extend(campaign.allowed_channels.iter().cloned());
                } else if !no_acl.contains(&campaign.game) {
                    no_acl.push(campaign.game.clone());
                }
            }
            (acl_refs, no_acl)
        };
        for reference in acl_refs {
            if !pool.iter().any(|c| c.id == reference.id) {
                pool.push(Channel::from_acl(&reference));
            }
        }
        for game in no_acl_games {
            for channel in self.get_live_streams(&game, 30).await? {
                if !pool.iter().any(|c| c.id == channel.id) {
                    pool.push(channel);
                }
            }
        }

        // stable sorts: viewers desc, then ACL-based desc, then priority
        // desc; the tail past MAX_CHANNELS is non-priority/low-viewers
        pool.sort_by_key(|c| std::cmp::Reverse(c.viewers.map(|v| v as i64).unwrap_or(-1)));
        pool.sort_by_key(|c| std::cmp::Reverse(c.acl_based));
        pool.sort_by(|a, b| {
            self.get_priority(b)
                .partial_cmp(&self.get_priority(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let dropped = pool.split_off(pool.len().min(MAX_CHANNELS));
        if !dropped.is_empty() {
            self.ws
                .remove_topics(dropped.iter().flat_map(|c| channel_topic_strings(c.id)))?;
        }

        // install the new registry and subscribe its topics
        let kept_ids: Vec<u64> = pool.iter().map(|c| c.id).collect();
        {
            let mut channels = self
                .channels
                .lock()
                .map_err(|_| MinerError::miner("channel registry poisoned"))?;
            *channels = pool.into_iter().map(|c| (c.id, c)).collect();
        }
        self.ws
            .add_topics(kept_ids.iter().flat_map(|id| channel_topics(*id)))?;

        // keep the watched channel if it survived and still qualifies
        if let Some(watching_id) = self.watching.get() {
            let keep = self
                .channel_clone(watching_id)
                .map(|c| self.can_watch(&c))
                .unwrap_or(false);
            if !keep {
                self.stop_watching();
            }
        }
        Ok(())
    }

    async fn get_live_streams(&self, game: &Game, limit: u32) -> Result<Vec<Channel>> {
        let data = self
            .http
            .gql(
                &gql_operations::GAME_DIRECTORY,
                Some(serde_json::json!({
                    "limit": limit,
                    "slug": game.slug(),
                    "options": {
                        "includeRestricted": ["SUB_ONLY_LIVE"],
                        "systemFilters": ["DROPS_ENABLED"],
                    },
                })),
            )
            .await
            .map_err(|e| MinerError::miner(format!("game directory ({}): {e}", game.slug())))?;
        let mut streams = Vec::new();
        if let Some(edges) = data.pointer("/game/streams/edges").and_then(|v| v.as_array()) {
            for edge in edges {
                let Some(node) = edge.get("node") else { continue };
                match Channel::from_directory(node, game.clone()) {
                    Some(channel) => streams.push(channel),
                    None => {
                        self.ui.print(&format!(
                            "Could not load channel for {}",
                            game.name
                        ));
                    }
                }
            }
        }
        Ok(streams)
    }

    // =========================================================================
    // CHANNEL_SWITCH
    // =========================================================================

    pub(crate) fn channel_switch(&self) {
        self.ui.status("Switching channels...");
        let mut new_watching: Option<u64> = None;
        // a channel picked in the UI wins as long as it's watchable
        if let Some(selected) = self.ui.get_selection() {
            if let Some(channel) = self.channel_clone(selected) {
                if self.can_watch(&channel) {
                    new_watching = Some(selected);
                }
            }
        }
        if new_watching.is_none() {
            // channels aren't game-tied, so the order has to be recomputed
            // every time
            let mut candidates: Vec<Channel> = self
                .channels
                .lock()
                .map(|channels| channels.values().cloned().collect())
                .unwrap_or_default();
            candidates.sort_by(|a, b| {
                self.get_priority(b)
                    .partial_cmp(&self.get_priority(a))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            for channel in candidates {
                if self.can_watch(&channel) && self.should_switch(&channel) {
                    new_watching = Some(channel.id);
                    break;
                }
            }
        }
        let watching = self.watching.get();
        if let Some(id) = new_watching {
            self.watch(id);
        } else if let Some(id) = watching {
            if let Some(channel) = self.channel_clone(id) {
                self.ui.status(&format!("Watching: {}", channel.name()));
            }
        } else {
            self.ui.print("No channels to watch");
            touch_healthcheck(HEALTHCHECK_PATH);
            self.change_state(State::Idle);
        }
    }

    // =========================================================================
    // Watch predicates
    // =========================================================================

    /// Whether the channel qualifies as a watching candidate.
    pub(crate) fn can_watch(&self, channel: &Channel) -> bool {
        let Ok(wanted) = self.wanted_games.lock() else {
            return false;
        };
        if wanted.is_empty() || !channel.online {
            return false;
        }
        let Some(game) = channel.game.as_ref() else {
            return false;
        };
        if !wanted.contains_key(&game.id) {
            return false;
        }
        drop(wanted);
        let Ok(inventory) = self.inventory.read() else {
            return false;
        };
        inventory
            .campaigns
            .iter()
            .any(|c| c.game == *game && c.can_earn(Some(channel)))
    }

    /// Whether the channel beats the currently watched one.
    pub(crate) fn should_switch(&self, channel: &Channel) -> bool {
        let Some(watching) = self.watching.get().and_then(|id| self.channel_clone(id)) else {
            return true;
        };
        let channel_order = self.get_priority(channel);
        let watching_order = self.get_priority(&watching);
        channel_order > watching_order
            || (channel_order == watching_order && channel.acl_based && !watching.acl_based)
    }

    pub(crate) fn get_priority(&self, channel: &Channel) -> f64 {
        channel
            .game
            .as_ref()
            .and_then(|game| {
                self.wanted_games
                    .lock()
                    .ok()
                    .and_then(|wanted| wanted.get(&game.id).map(|(_, score)| *score))
            })
            .unwrap_or(0.0)
    }

    pub(crate) fn watch(&self, channel_id: u64) {
        if let Some(channel) = self.channel_clone(channel_id) {
            self.ui.set_watching(channel.name());
            self.ui.status(&format!("Watching: {}", channel.name()));
        }
        self.watching.set(channel_id);
    }

    pub(crate) fn stop_watching(&self) {
        if self.watching.has_value() {
            self.watching.clear();
            self.ui.clear_watching();
        }
    }

    /// Clear the watch loop's current sleep; the next iteration re-awaits a
    /// possibly-changed watched channel.
    pub(crate) fn restart_watching(&self) {
        self.watch_restart.notify_one();
    }

    // =========================================================================
    // Channel registry helpers
    // =========================================================================

    pub(crate) fn channel_clone(&self, channel_id: u64) -> Option<Channel> {
        self.channels
            .lock()
            .ok()
            .and_then(|channels| channels.get(&channel_id).cloned())
    }

    /// Write a mutated channel copy back, unless it was removed meanwhile.
    pub(crate) fn store_channel(&self, channel: Channel) {
        if let Ok(mut channels) = self.channels.lock() {
            if let std::collections::hash_map::Entry::Occupied(mut entry) =
                channels.entry(channel.id)
            {
                entry.insert(channel);
            }
        }
    }

    /// Take the drop-update rendezvous producer, if the watch loop is
    /// currently waiting for one.
    pub(crate) fn take_drop_update(&self) -> Option<oneshot::Sender<bool>> {
        self.drop_update.lock().ok().and_then(|mut slot| slot.take())
    }

    pub(crate) fn set_drop_update(&self, sender: oneshot::Sender<bool>) {
        if let Ok(mut slot) = self.drop_update.lock() {
            *slot = Some(sender);
        }
    }
}

/// The two per-channel topics.
pub(crate) fn channel_topics(channel_id: u64) -> [WsTopic; 2] {
    [
        WsTopic::new(TopicKind::ChannelStreamState, channel_id),
        WsTopic::new(TopicKind::ChannelStreamUpdate, channel_id),
    ]
}

pub(crate) fn channel_topic_strings(channel_id: u64) -> [String; 2] {
    channel_topics(channel_id).map(|t| t.to_string())
}

// =============================================================================
// Tests
// =============================================================================
