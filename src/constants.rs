//! Core constants: GQL operation definitions, WebSocket topics, client
//! configuration data, intervals and file paths.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use crate::utils::json_load;

/// Interval between watch pulses (simulating viewing)
pub const WATCH_INTERVAL: Duration = Duration::from_secs(59);

/// Interval between WebSocket PINGs
pub const PING_INTERVAL: Duration = Duration::from_secs(180); // 3 minutes

/// How long to wait for a PONG before forcing a reconnect
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum WebSocket connections
pub const MAX_WEBSOCKETS: usize = 8;

/// Topics limit per WebSocket
pub const WS_TOPICS_LIMIT: usize = 50;

/// Maximum channels tracked in the registry
pub const MAX_CHANNELS: usize = 100;

/// Debounce delay between a stream-up event and the online flip
pub const ONLINE_DELAY: Duration = Duration::from_secs(120);

/// Maximum backoff delay for HTTP retries and websocket reconnects
pub const BACKOFF_MAX: Duration = Duration::from_secs(180);

pub const GQL_URL: &str = "https://gql.twitch.tv/gql";
pub const PUBSUB_URL: &str = "wss://pubsub-edge.twitch.tv/v1";

// Well-known file paths, relative to the working directory.
pub const SETTINGS_PATH: &str = "settings.json";
pub const COOKIES_PATH: &str = "cookies.json";
pub const LOCK_PATH: &str = "lock.file";
pub const LOG_PATH: &str = "log.txt";
pub const HEALTHCHECK_PATH: &str = "healthcheck.timestamp";
pub const GQL_HASHES_PATH: &str = "gql_hashes.json";

// =============================================================================
// Client Configuration
// =============================================================================

/// Client type configuration for Twitch API access.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_url: &'static str,
    pub client_id: &'static str,
    pub user_agent: &'static str,
}

/// Web client configuration
pub const CLIENT_WEB: ClientInfo = ClientInfo {
    client_url: "https://www.twitch.tv",
    client_id: "kimne78kx3ncx6brgo4mv6wki5h1ko",
    user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36",
};

/// Android app client configuration - bypasses integrity checks!
pub const CLIENT_ANDROID_APP: ClientInfo = ClientInfo {
    client_url: "https://www.twitch.tv",
    client_id: "kd1unb4b3q4t58fwlpcbzcbnm76a8fp",
    user_agent: "Dalvik/2.1.0 (Linux; U; Android 16; SM-S911B Build/TP1A.220624.014) tv.twitch.android.app/25.3.0/2503006",
};

// =============================================================================
// GQL Operations
// =============================================================================

/// A GraphQL operation with its persisted query hash.
///
/// The hash returned by [`GqlOperation::sha256`] can be overridden at runtime
/// through `gql_hashes.json` (a map of operation name to hash), so stale
/// hashes can be refreshed without a code change.
#[derive(Debug, Clone)]
pub struct GqlOperation {
    pub name: &'static str,
    default_sha256: &'static str,
}

static HASH_OVERRIDES: OnceLock<HashMap<String, String>> = OnceLock::new();

impl GqlOperation {
    pub const fn new(name: &'static str, sha256: &'static str) -> Self {
        Self {
            name,
            default_sha256: sha256,
        }
    }

    /// The persisted query hash, preferring a `gql_hashes.json` override.
    pub fn sha256(&self) -> &str {
        let overrides = HASH_OVERRIDES.get_or_init(|| json_load(GQL_HASHES_PATH, HashMap::new()));
        overrides
            .get(self.name)
            .map(String::as_str)
            .unwrap_or(self.default_sha256)
    }
}

/// All GQL operations used by the miner.
/// The SHA256 hashes are required for Twitch's persisted query system.
pub mod gql_operations {
    use super::GqlOperation;

    /// Returns all in-progress campaigns plus already-claimed benefits
    pub const INVENTORY: GqlOperation = GqlOperation::new(
        "Inventory",
        "d86775d0ef16a63a33ad52e80eaff963b2d5b72fada7c991504a57496e1d8e4b",
    );

    /// Returns all available campaigns
    pub const CAMPAIGNS: GqlOperation = GqlOperation::new(
        "ViewerDropsDashboard",
        "5a4da2ab3d5b47c9f9ce864e727b2cb346af1e3ea8b897fe8f704a97ff017619",
    );

    /// Returns extended information about a campaign
    pub const CAMPAIGN_DETAILS: GqlOperation = GqlOperation::new(
        "DropCampaignDetails",
        "039277bf98f3130929262cc7c6efd9c141ca3749cb6dca442fc8ead9a53f77c1",
    );

    /// Returns current drop progress for the watched channel
    pub const CURRENT_DROP: GqlOperation = GqlOperation::new(
        "DropCurrentSessionContext",
        "4d06b702d25d652afb9ef835d2a550031f1cf762b193523a92166f40ea3d142b",
    );

    /// Claim a drop reward
    pub const CLAIM_DROP: GqlOperation = GqlOperation::new(
        "DropsPage_ClaimDropRewards",
        "a455deea71bdc9015b78eb49f4acfbce8baa7ccbedd28e549bb025bd0f751930",
    );

    /// Claim channel points
    pub const CLAIM_COMMUNITY_POINTS: GqlOperation = GqlOperation::new(
        "ClaimCommunityPoints",
        "46aaeebe02c99afdf4fc97c7c0cba964124bf6b0af229395f1f6d1feed05b3d0",
    );

    /// Returns current state of points for a channel
    pub const CHANNEL_POINTS_CONTEXT: GqlOperation = GqlOperation::new(
        "ChannelPointsContext",
        "374314de591e69925fce3ddc2bcf085796f56ebb8cad67a0daa3165c03adc345",
    );

    /// Delete an on-site notification after acting on it
    pub const NOTIFICATIONS_DELETE: GqlOperation = GqlOperation::new(
        "OnsiteNotifications_DeleteNotification",
        "13a51ba8a2b8e1a8e64b5bb8a31a9b809e4a2f7c74c2dbb8a2c6c8e0f9a7d441",
    );

    /// Returns live channels for a game
    pub const GAME_DIRECTORY: GqlOperation = GqlOperation::new(
        "DirectoryPage_Game",
        "98a996c3c3ebb1ba4fd65d6671c6028d7ee8d615cb540b0731b3db2a911d3649",
    );

    /// Returns stream information for a particular channel
    pub const STREAM_INFO: GqlOperation = GqlOperation::new(
        "VideoPlayerStreamInfoOverlayChannel",
        "198492e0857f6aedead9665c81c5a06d67b25b58034649687124083ff288597d",
    );

    /// Returns stream playback access token
    pub const PLAYBACK_ACCESS_TOKEN: GqlOperation = GqlOperation::new(
        "PlaybackAccessToken",
        "ed230aa1e33e07eebb8928504583da78a5173989fadfb1ac94be06a04f3cdbe9",
    );
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_info() {
        assert_eq!(CLIENT_WEB.client_id, "kimne78kx3ncx6brgo4mv6wki5h1ko");
        assert!(CLIENT_WEB.client_url.starts_with("https://"));
        assert!(CLIENT_ANDROID_APP.user_agent.contains("tv.twitch.android.app"));
    }

    #[test]
    fn test_gql_operations_hashes() {
        assert_eq!(
            gql_operations::INVENTORY.sha256(),
            "d86775d0ef16a63a33ad52e80eaff963b2d5b72fada7c991504a57496e1d8e4b"
        );
        assert_eq!(
            gql_operations::CLAIM_DROP.sha256(),
            "a455deea71bdc9015b78eb49f4acfbce8baa7ccbedd28e549bb025bd0f751930"
        );
        // every hash must be a 64-char hex digest
        for op in [
            &gql_operations::INVENTORY,
            &gql_operations::CAMPAIGNS,
            &gql_operations::CAMPAIGN_DETAILS,
            &gql_operations::CURRENT_DROP,
            &gql_operations::CLAIM_DROP,
            &gql_operations::CLAIM_COMMUNITY_POINTS,
            &gql_operations::CHANNEL_POINTS_CONTEXT,
            &gql_operations::NOTIFICATIONS_DELETE,
            &gql_operations::GAME_DIRECTORY,
            &gql_operations::STREAM_INFO,
            &gql_operations::PLAYBACK_ACCESS_TOKEN,
        ] {
            assert_eq!(op.sha256().len(), 64, "bad hash length for {}", op.name);
            assert!(op.sha256().chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_intervals() {
        assert_eq!(WATCH_INTERVAL.as_secs(), 59);
        assert_eq!(PING_INTERVAL.as_secs(), 180);
        assert_eq!(PING_TIMEOUT.as_secs(), 10);
        assert!(MAX_WEBSOCKETS * WS_TOPICS_LIMIT >= MAX_CHANNELS * 2);
    }
}
