//! Channel model: per-channel stream state, the watch heartbeat, and the
//! bonus points claim.

use std::sync::LazyLock;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use regex_lite::Regex;
use serde::Serialize;
use serde_json::Value;

use super::inventory::{AclChannelRef, Game};
use crate::constants::{gql_operations, CLIENT_ANDROID_APP, CLIENT_WEB};
use crate::error::{MinerError, Result};
use crate::http::HttpClient;

// Lazy-compiled regex patterns - compiled once at first use, reused forever
static SPADE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""beacon_?url": ?"(https://video-edge-[\.\w\-/]+\.ts(?:\?allow_stream=true)?)""#)
        .expect("Invalid spade pattern regex")
});

static SETTINGS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"src="(https://[\w\.]+/config/settings\.[0-9a-f]{32}\.js)""#)
        .expect("Invalid settings pattern regex")
});

/// The spade payload sent to certify watching.
#[derive(Debug, Clone, Serialize)]
struct SpadeEvent {
    event: &'static str,
    properties: SpadeProperties,
}

#[derive(Debug, Clone, Serialize)]
struct SpadeProperties {
    broadcast_id: String,
    channel_id: String,
    channel: String,
    hidden: bool,
    live: bool,
    location: &'static str,
    logged_in: bool,
    muted: bool,
    player: &'static str,
    user_id: u64,
}

/// A live-stream candidate.
///
/// Created either from a campaign ACL (`acl_based = true`, never pruned by
/// cleanup) or from a game directory query; destroyed at cleanup when
/// non-ACL and offline or off-game.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: u64,
    pub login: String,
    pub display_name: String,
    pub online: bool,
    /// Debounce window after a stream-up event, before stream facts arrive.
    pub pending_online: bool,
    pub drops_enabled: bool,
    /// Present in a campaign ACL; survives cleanup regardless of state.
    pub acl_based: bool,
    pub game: Option<Game>,
    pub viewers: Option<u64>,
    pub points: Option<u64>,
    /// Spade/edge URL cached per stream.
    spade_url: Option<String>,
    /// Current broadcast id, refreshed with the stream facts.
    broadcast_id: Option<String>,
    /// Media playlist URL of the lowest-quality variant, cached per stream.
    playlist_url: Option<String>,
    /// The broadcast the cached playlist was fetched under.
    playlist_broadcast_id: Option<String>,
}

impl Channel {
    pub fn from_acl(reference: &AclChannelRef) -> Self {
        Self {
            id: reference.id,
            login: reference.name.to_lowercase(),
            display_name: reference.name.clone(),
            online: false,
            pending_online: false,
            drops_enabled: false,
            acl_based: true,
            game: None,
            viewers: None,
            points: None,
            spade_url: None,
            broadcast_id: None,
            playlist_url: None,
            playlist_broadcast_id: None,
        }
    }

    /// Build a channel from a `GameDirectory` stream node.
    pub fn from_directory(node: &Value, game: Game) -> Option<Self> {
        let broadcaster = node.get("broadcaster")?;
        let id = broadcaster.get("id")?.as_str()?.parse().ok()?;
        let login = broadcaster.get("login")?.as_str()?.to_string();
        let display_name = broadcaster
            .get("displayName")
            .and_then(|v| v.as_str())
            .unwrap_or(&login)
            .to_string();
        Some(Self {
            id,
            login,
            display_name,
            online: true,
            pending_online: false,
            // the directory query is filtered by DROPS_ENABLED
            drops_enabled: true,
            acl_based: false,
            game: Some(game),
            viewers: node.get("viewersCount").and_then(|v| v.as_u64()),
            points: None,
            spade_url: None,
            broadcast_id: node
                .get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            playlist_url: None,
            playlist_broadcast_id: None,
        })
    }

    #[cfg(test)]
    pub fn for_test(id: u64, login: &str, game: Option<Game>) -> Self {
        Self {
            id,
            login: login.to_string(),
            display_name: login.to_string(),
            online: false,
            pending_online: false,
            drops_enabled: true,
            acl_based: false,
            game,
            viewers: None,
            points: None,
            spade_url: None,
            broadcast_id: None,
            playlist_url: None,
            playlist_broadcast_id: None,
        }
    }

    pub fn name(&self) -> &str {
        if self.display_name.is_empty() {
            &self.login
        } else {
            &self.display_name
        }
    }

    pub fn url(&self) -> String {
        format!("https://www.twitch.tv/{}", self.login)
    }

    /// Mark the channel offline and drop the per-stream caches.
    pub fn set_offline(&mut self) {
        self.online = false;
        self.pending_online = false;
        self.clear_stream_cache();
    }

    fn clear_stream_cache(&mut self) {
        self.spade_url = None;
        self.broadcast_id = None;
        self.playlist_url = None;
        self.playlist_broadcast_id = None;
        self.viewers = None;
    }

    /// Refresh stream facts from GQL. Flips `online` according to whether a
    /// stream is present, and clears `pending_online`.
    pub async fn update_stream(&mut self, http: &HttpClient) -> Result<()> {
        let data = http
            .gql(
                &gql_operations::STREAM_INFO,
                Some(serde_json::json!({ "channel": self.login })),
            )
            .await?;
        self.pending_online = false;
        let stream = data.get("user").and_then(|u| u.get("stream"));
        match stream {
            Some(stream) if !stream.is_null() => {
                let was_broadcast = self.broadcast_id.take();
                self.broadcast_id = stream
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                if self.broadcast_id != was_broadcast {
                    // new stream: the per-stream URL caches are stale
                    self.spade_url = None;
                    self.playlist_url = None;
                    self.playlist_broadcast_id = None;
                }
                self.game = stream
                    .get("game")
                    .filter(|g| !g.is_null())
                    .and_then(|g| serde_json::from_value(g.clone()).ok());
                self.viewers = stream.get("viewersCount").and_then(|v| v.as_u64());
                self.online = true;
            }
            _ => self.set_offline(),
        }
        Ok(())
    }

    /// Extract the spade URL from the channel page (or its settings.js).
    async fn fetch_spade_url(&self, http: &HttpClient) -> Result<Option<String>> {
        let html = http.get_text(&self.url(), CLIENT_WEB.user_agent).await?;
        if let Some(captures) = SPADE_PATTERN.captures(&html) {
            return Ok(captures.get(1).map(|m| m.as_str().to_string()));
        }
        if let Some(captures) = SETTINGS_PATTERN.captures(&html) {
            let settings_url = captures.get(1).map(|m| m.as_str().to_string());
            if let Some(settings_url) = settings_url {
                let settings_js = http.get_text(&settings_url, CLIENT_WEB.user_agent).await?;
                if let Some(captures) = SPADE_PATTERN.captures(&settings_js) {
                    return Ok(captures.get(1).map(|m| m.as_str().to_string()));
                }
            }
        }
        Ok(None)
    }

    fn spade_payload(&self, user_id: u64, broadcast_id: &str) -> String {
        let event = SpadeEvent {
            event: "minute-watched",
            properties: SpadeProperties {
                broadcast_id: broadcast_id.to_string(),
                channel_id: self.id.to_string(),
                channel: self.login.clone(),
                hidden: false,
                live: true,
                location: "channel",
                logged_in: true,
                muted: false,
                player: "site",
                user_id,
            },
        };
        let json = serde_json::to_string(&[event]).unwrap_or_default();
        BASE64.encode(json.as_bytes())
    }

    /// Fetch a playback access token and resolve the media playlist URL of
    /// the lowest-quality variant from the usher master playlist.
    async fn fetch_playlist_url(&self, http: &HttpClient) -> Result<Option<String>> {
        let data = http
            .gql(
                &gql_operations::PLAYBACK_ACCESS_TOKEN,
                Some(serde_json::json!({
                    "isLive": true,
                    "isVod": false,
                    "login": self.login,
                    "platform": "android",
                    "playerType": "channel_home_live",
                    "vodID": "",
                })),
            )
            .await?;
        let token = data.pointer("/streamPlaybackAccessToken");
        let value = token
            .and_then(|t| t.get("value"))
            .and_then(|v| v.as_str());
        let signature = token
            .and_then(|t| t.get("signature"))
            .and_then(|v| v.as_str());
        let (Some(value), Some(signature)) = (value, signature) else {
            return Ok(None);
        };
        let master_url = url::Url::parse_with_params(
            &format!("https://usher.ttvnw.net/api/channel/hls/{}.m3u8", self.login),
            &[
                ("sig", signature),
                ("token", value),
                ("allow_source", "true"),
                ("allow_audio_only", "true"),
                ("fast_bread", "true"),
            ],
        )
        .map_err(|e| MinerError::miner(format!("bad usher url: {e}")))?;
        let (status, master) = http
            .get_page(master_url.as_str(), CLIENT_ANDROID_APP.user_agent)
            .await?;
        if !(200..300).contains(&status) {
            tracing::warn!("Master playlist for {} returned {status}", self.login);
            return Ok(None);
        }
        Ok(last_playlist_uri(&master))
    }

    /// Emit one watch heartbeat: GET a playback segment of the stream, then
    /// send the minute-watched spade pulse.
    ///
    /// Returns `(succeeded, repeat_now)`: `succeeded` is false when the
    /// stream has gone away (campaign expiry mid-mining commonly surfaces
    /// this way); `repeat_now` asks the caller to retry without waiting a
    /// full interval because a stale per-stream cache was just refreshed.
    pub async fn send_watch(&mut self, http: &HttpClient) -> Result<(bool, bool)> {
        if !self.online {
            return Ok((false, false));
        }
        let Some(broadcast_id) = self.broadcast_id.clone() else {
            // stream facts are stale; refresh and ask for an immediate retry
            self.update_stream(http).await?;
            return Ok((false, self.online));
        };
        // the cached playlist belongs to an older broadcast
        if self.playlist_url.is_some()
            && self.playlist_broadcast_id.as_deref() != Some(broadcast_id.as_str())
        {
            self.playlist_url = None;
            self.playlist_broadcast_id = None;
            return Ok((false, false));
        }
        // pick the lowest-quality variant and keep it for the stream's life
        let mut token_refreshed = false;
        if self.playlist_url.is_none() {
            match self.fetch_playlist_url(http).await? {
                Some(playlist_url) => {
                    self.playlist_url = Some(playlist_url);
                    self.playlist_broadcast_id = Some(broadcast_id.clone());
                    token_refreshed = true;
                }
                None => return Ok((false, false)),
            }
        }
        let Some(playlist_url) = self.playlist_url.clone() else {
            return Ok((false, false));
        };
        let (status, media) = http
            .get_page(&playlist_url, CLIENT_ANDROID_APP.user_agent)
            .await?;
        if status == 403 || status == 404 {
            // the access token behind the playlist URL expired; refetch once
            self.playlist_url = None;
            self.playlist_broadcast_id = None;
            return Ok((false, !token_refreshed));
        }
        if !(200..300).contains(&status) || media.contains("#EXT-X-ENDLIST") {
            return Ok((false, false));
        }
        // GET the newest segment; this is what registers as playback
        let Some(segment_url) =
            last_playlist_uri(&media).and_then(|uri| resolve_playlist_uri(&playlist_url, &uri))
        else {
            return Ok((false, false));
        };
        let (segment_status, _) = http
            .get_page(&segment_url, CLIENT_ANDROID_APP.user_agent)
            .await?;
        if !(200..300).contains(&segment_status) {
            return Ok((false, false));
        }
        // the spade pulse is what credits the drop minutes
        let spade_url = match self.spade_url.clone() {
            Some(url) => url,
            None => match self.fetch_spade_url(http).await? {
                Some(url) => {
                    self.spade_url = Some(url.clone());
                    url
                }
                None => return Ok((false, false)),
            },
        };
        let user_id = http.auth().user_id().unwrap_or_default();
        let payload = self.spade_payload(user_id, &broadcast_id);
        let status = http.spade_post(&spade_url, &payload).await?;
        if status == 204 {
            Ok((true, false))
        } else {
            // stale spade URL: refetch on the immediate retry
            self.spade_url = None;
            Ok((false, false))
        }
    }

    /// Claim the channel points bonus if one is available. Updates the
    /// local balance as a side effect.
    pub async fn claim_bonus(&mut self, http: &HttpClient) -> Result<()> {
        let data = http
            .gql(
                &gql_operations::CHANNEL_POINTS_CONTEXT,
                Some(serde_json::json!({ "channelLogin": self.login })),
            )
            .await?;
        let points = data
            .pointer("/community/channel/self/communityPoints")
            .cloned()
            .unwrap_or(Value::Null);
        if let Some(balance) = points.get("balance").and_then(|v| v.as_u64()) {
            self.points = Some(balance);
        }
        let claim_id = points
            .pointer("/availableClaim/id")
            .and_then(|v| v.as_str());
        if let Some(claim_id) = claim_id {
            http.gql(
                &gql_operations::CLAIM_COMMUNITY_POINTS,
                Some(serde_json::json!({
                    "input": {"channelID": self.id.to_string(), "claimID": claim_id}
                })),
            )
            .await?;
        }
        Ok(())
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Channel {}

/// The last URI in an m3u8 playlist. In a master playlist the variants are
/// listed best-first, so this is the lowest-quality one; in a media playlist
/// it's the newest segment.
fn last_playlist_uri(playlist: &str) -> Option<String> {
    playlist
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .next_back()
        .map(str::to_string)
}

/// Segment URIs can be relative to the media playlist they came from.
fn resolve_playlist_uri(playlist_url: &str, uri: &str) -> Option<String> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Some(uri.to_string());
    }
    url::Url::parse(playlist_url)
        .ok()?
        .join(uri)
        .ok()
        .map(|joined| joined.to_string())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn game(id: &str, name: &str) -> Game {
        Game {
            id: id.to_string(),
            name: name.to_string(),
            slug: None,
        }
    }

    #[test]
    fn test_channel_from_acl() {
        let reference = AclChannelRef {
            id: 42,
            name: "CoolStreamer".to_string(),
        };
        let channel = Channel::from_acl(&reference);
        assert_eq!(channel.id, 42);
        assert_eq!(channel.login, "coolstreamer");
        assert!(channel.acl_based);
        assert!(!channel.online);
        assert_eq!(channel.url(), "https://www.twitch.tv/coolstreamer");
    }

    #[test]
    fn test_channel_from_directory_node() {
        let node = serde_json::json!({
            "id": "broadcast-9",
            "broadcaster": {"id": "12345", "login": "streamer", "displayName": "Streamer"},
            "viewersCount": 5000,
            "game": {"id": "g1", "name": "Game"}
        });
        let channel = Channel::from_directory(&node, game("g1", "Game")).unwrap();
        assert_eq!(channel.id, 12345);
        assert!(channel.online);
        assert!(channel.drops_enabled);
        assert!(!channel.acl_based);
        assert_eq!(channel.viewers, Some(5000));
        assert_eq!(channel.broadcast_id.as_deref(), Some("broadcast-9"));
    }

    #[test]
    fn test_directory_node_without_broadcaster_is_skipped() {
        let node = serde_json::json!({"id": "b", "broadcaster": null, "title": "orphan"});
        assert!(Channel::from_directory(&node, game("g1", "Game")).is_none());
    }

    #[test]
    fn test_set_offline_clears_stream_cache() {
        let mut channel = Channel::for_test(1, "streamer", Some(game("g1", "Game")));
        channel.online = true;
        channel.viewers = Some(10);
        channel.spade_url = Some("https://video-edge-x.ts".to_string());
        channel.broadcast_id = Some("b1".to_string());
        channel.playlist_url = Some("https://usher.example/media.m3u8".to_string());
        channel.playlist_broadcast_id = Some("b1".to_string());

        channel.set_offline();
        assert!(!channel.online);
        assert!(channel.spade_url.is_none());
        assert!(channel.broadcast_id.is_none());
        assert!(channel.playlist_url.is_none());
        assert!(channel.playlist_broadcast_id.is_none());
        assert!(channel.viewers.is_none());
        // game sticks around; cleanup decides what to do with it
        assert!(channel.game.is_some());
    }

    #[test]
    fn test_spade_payload_structure() {
        let channel = Channel::for_test(98765, "streamer", None);
        let payload = channel.spade_payload(12345678, "broadcast123");

        let decoded = BASE64.decode(&payload).expect("Should be valid base64");
        let json_str = String::from_utf8(decoded).expect("Should be valid UTF-8");
        let parsed: Vec<Value> = serde_json::from_str(&json_str).expect("Should be valid JSON");

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["event"], "minute-watched");
        let props = &parsed[0]["properties"];
        assert_eq!(props["channel_id"], "98765");
        assert_eq!(props["channel"], "streamer");
        assert_eq!(props["broadcast_id"], "broadcast123");
        assert_eq!(props["user_id"], 12345678);
        assert_eq!(props["live"], true);
        assert_eq!(props["logged_in"], true);
        assert_eq!(props["player"], "site");
        for field in [
            "broadcast_id",
            "channel_id",
            "channel",
            "hidden",
            "live",
            "location",
            "logged_in",
            "muted",
            "player",
            "user_id",
        ] {
            assert!(props.get(field).is_some(), "missing field {field}");
        }
    }

    #[test]
    fn test_spade_pattern_extraction() {
        let html = r#"prefix "beacon_url": "https://video-edge-1234.abc/v1/segment.ts?allow_stream=true" suffix"#;
        let captures = SPADE_PATTERN.captures(html).unwrap();
        assert_eq!(
            captures.get(1).unwrap().as_str(),
            "https://video-edge-1234.abc/v1/segment.ts?allow_stream=true"
        );
    }

    #[test]
    fn test_settings_pattern_extraction() {
        let html = r#"<script src="https://static.twitchcdn.net/config/settings.0123456789abcdef0123456789abcdef.js"></script>"#;
        let captures = SETTINGS_PATTERN.captures(html).unwrap();
        assert!(captures.get(1).unwrap().as_str().ends_with(".js"));
    }

    #[test]
    fn test_channel_equality_by_id() {
        let a = Channel::for_test(1, "a", None);
        let b = Channel::for_test(1, "b", None);
        let c = Channel::for_test(2, "a", None);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_master_playlist_picks_last_variant() {
        let master = "\
#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=8000000,RESOLUTION=1920x1080
https://video-weaver.example/v1/source.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=1500000,RESOLUTION=852x480
https://video-weaver.example/v1/480p30.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=300000,RESOLUTION=284x160
https://video-weaver.example/v1/160p30.m3u8
";
        assert_eq!(
            last_playlist_uri(master).as_deref(),
            Some("https://video-weaver.example/v1/160p30.m3u8")
        );
    }

    #[test]
    fn test_media_playlist_picks_newest_segment() {
        let media = "\
#EXTM3U
#EXT-X-TARGETDURATION:6
#EXTINF:2.000,
https://video-edge.example/v1/seg-100.ts
#EXTINF:2.000,
https://video-edge.example/v1/seg-101.ts
";
        assert_eq!(
            last_playlist_uri(media).as_deref(),
            Some("https://video-edge.example/v1/seg-101.ts")
        );
    }

    #[test]
    fn test_playlist_without_uris_yields_none() {
        assert_eq!(last_playlist_uri("#EXTM3U\n#EXT-X-ENDLIST\n"), None);
        assert_eq!(last_playlist_uri(""), None);
    }

    #[test]
    fn test_resolve_playlist_uri_absolute_and_relative() {
        let playlist = "https://video-weaver.example/v1/160p30.m3u8";
        assert_eq!(
            resolve_playlist_uri(playlist, "https://video-edge.example/seg.ts").as_deref(),
            Some("https://video-edge.example/seg.ts")
        );
        assert_eq!(
            resolve_playlist_uri(playlist, "seg-42.ts").as_deref(),
            Some("https://video-weaver.example/v1/seg-42.ts")
        );
    }
}
