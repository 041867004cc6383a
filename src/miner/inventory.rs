//! Inventory engine: fetches in-progress and available campaigns, deep-merges
//! the JSON trees, builds campaign objects, and computes maintenance
//! triggers.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use super::Miner;
use crate::constants::gql_operations;
use crate::error::{MinerError, Result};
use crate::models::gql::GqlRequest;
use crate::models::{Channel, DropsCampaign, TimedDrop};
use crate::settings::PriorityAlgorithm;

const DETAILS_CHUNK: usize = 20;

/// Deep-merge two JSON trees, preferring `primary` values.
///
/// For each key in the union: if present in both and both values are
/// objects, recurse; mismatched value types at a shared key are a fatal
/// inconsistency; otherwise the primary value wins.
pub fn deep_merge(primary: &Value, secondary: &Value) -> Result<Value> {
    let (Some(primary_map), Some(secondary_map)) = (primary.as_object(), secondary.as_object())
    else {
        return Err(MinerError::miner("inconsistent merge data"));
    };
    let mut merged = serde_json::Map::new();
    for (key, vp) in primary_map {
        match secondary_map.get(key) {
            Some(vs) => {
                if vp.is_object() && vs.is_object() {
                    merged.insert(key.clone(), deep_merge(vp, vs)?);
                } else if same_kind(vp, vs) {
                    merged.insert(key.clone(), vp.clone());
                } else {
                    return Err(MinerError::miner("inconsistent merge data"));
                }
            }
            None => {
                merged.insert(key.clone(), vp.clone());
            }
        }
    }
    for (key, vs) in secondary_map {
        if !primary_map.contains_key(key) {
            merged.insert(key.clone(), vs.clone());
        }
    }
    Ok(Value::Object(merged))
}

fn same_kind(a: &Value, b: &Value) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
        // a null can stand in for any missing sub-tree
        || a.is_null()
        || b.is_null()
}

// =============================================================================
// Inventory
// =============================================================================

/// The campaign inventory plus the id-indexed drop map used to resolve
/// drop -> campaign back-references.
#[derive(Debug, Default)]
pub struct Inventory {
    pub campaigns: Vec<DropsCampaign>,
    /// drop id -> owning campaign id
    drop_index: HashMap<String, String>,
    /// Future campaign transitions the maintenance task wakes at.
    pub triggers: Vec<DateTime<Utc>>,
}

impl Inventory {
    pub fn replace(&mut self, campaigns: Vec<DropsCampaign>, triggers: Vec<DateTime<Utc>>) {
        self.drop_index = campaigns
            .iter()
            .flat_map(|c| c.drops.iter().map(|d| (d.id.clone(), c.id.clone())))
            .collect();
        self.campaigns = campaigns;
        self.triggers = triggers;
    }

    pub fn campaign(&self, campaign_id: &str) -> Option<&DropsCampaign> {
        self.campaigns.iter().find(|c| c.id == campaign_id)
    }

    pub fn campaign_of_drop(&self, drop_id: &str) -> Option<&DropsCampaign> {
        self.drop_index
            .get(drop_id)
            .and_then(|cid| self.campaign(cid))
    }

    pub fn drop_by_id(&self, drop_id: &str) -> Option<&TimedDrop> {
        self.campaign_of_drop(drop_id)
            .and_then(|c| c.drops.iter().find(|d| d.id == drop_id))
    }

    pub fn drop_by_id_mut(&mut self, drop_id: &str) -> Option<&mut TimedDrop> {
        let campaign_id = self.drop_index.get(drop_id)?.clone();
        self.campaigns
            .iter_mut()
            .find(|c| c.id == campaign_id)?
            .drops
            .iter_mut()
            .find(|d| d.id == drop_id)
    }

    /// Whether mining `channel` can progress the drop right now.
    pub fn drop_can_earn(&self, drop_id: &str, channel: &Channel) -> bool {
        let now = Utc::now();
        let Some(campaign) = self.campaign_of_drop(drop_id) else {
            return false;
        };
        let Some(drop) = self.drop_by_id(drop_id) else {
            return false;
        };
        campaign.can_earn_at(Some(channel), now) && drop.earnable() && drop.is_within(now, now)
    }

    /// The drop that mining `channel` is currently progressing: the earnable
    /// drop with the least remaining minutes across matching campaigns.
    pub fn active_drop(&self, channel: &Channel) -> Option<TimedDrop> {
        let now = Utc::now();
        let game = channel.game.as_ref()?;
        self.campaigns
            .iter()
            .filter(|c| c.game == *game && c.can_earn_at(Some(channel), now))
            .flat_map(|c| c.drops.iter())
            .filter(|d| d.earnable() && d.is_within(now, now))
            .min_by_key(|d| d.remaining_minutes())
            .cloned()
    }
}

// =============================================================================
// Fetch flow
// =============================================================================

impl Miner {
    /// Fetch and rebuild the campaign inventory, then restart the
    /// maintenance task.
    pub async fn fetch_inventory(&self) -> Result<()> {
        self.ui.status("Fetching inventory...");

        // in-progress campaigns plus the claimed-benefit award log
        let response = self
            .http
            .gql(
                &gql_operations::INVENTORY,
                Some(serde_json::json!({"fetchRewardCampaigns": true})),
            )
            .await?;
        let inventory = response
            .pointer("/currentUser/inventory")
            .cloned()
            .unwrap_or(Value::Null);
        let claimed_benefits: HashMap<String, DateTime<Utc>> = inventory
            .get("gameEventDrops")
            .and_then(|v| v.as_array())
            .map(|benefits| {
                benefits
                    .iter()
                    .filter_map(|b| {
                        let id = b.get("id")?.as_str()?.to_string();
                        let awarded = b
                            .get("lastAwardedAt")?
                            .as_str()?
                            .parse::<DateTime<Utc>>()
                            .ok()?;
                        Some((id, awarded))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let mut merged_data: HashMap<String, Value> = inventory
            .get("dropCampaignsInProgress")
            .and_then(|v| v.as_array())
            .map(|campaigns| {
                campaigns
                    .iter()
                    .filter_map(|c| Some((c.get("id")?.as_str()?.to_string(), c.clone())))
                    .collect()
            })
            .unwrap_or_default();

        // all available campaigns with an applicable status
        let response = self
            .http
            .gql(
                &gql_operations::CAMPAIGNS,
                Some(serde_json::json!({"fetchRewardCampaigns": false})),
            )
            .await?;
        let available: HashMap<String, Value> = response
            .pointer("/currentUser/dropCampaigns")
            .and_then(|v| v.as_array())
            .map(|campaigns| {
                campaigns
                    .iter()
                    .filter(|c| {
                        matches!(
                            c.get("status").and_then(|s| s.as_str()),
                            Some("ACTIVE") | Some("UPCOMING")
                        )
                    })
                    .filter_map(|c| Some((c.get("id")?.as_str()?.to_string(), c.clone())))
                    .collect()
            })
            .unwrap_or_default();

        // fetch detailed data for each campaign, in chunks of 20, merging
        // each returned tree into the inventory tree as it lands
        self.ui.status("Fetching campaign details...");
        let user_id = self.auth.user_id().unwrap_or_default().to_string();
        let ids: Vec<(String, Value)> = available.into_iter().collect();
        for chunk in ids.chunks(DETAILS_CHUNK) {
            let requests: Vec<GqlRequest> = chunk
                .iter()
                .map(|(id, _)| {
                    GqlRequest::new(
                        &gql_operations::CAMPAIGN_DETAILS,
                        Some(serde_json::json!({
                            "channelLogin": user_id,
                            "dropID": id,
                        })),
                    )
                })
                .collect();
            let responses = self.http.gql_batch(requests).await?;
            let mut chunk_data: HashMap<String, Value> = chunk.iter().cloned().collect();
            for response in responses {
                let Some(details) = response.pointer("/user/dropCampaign").cloned() else {
                    continue;
                };
                let Some(id) = details.get("id").and_then(|v| v.as_str()).map(String::from)
                else {
                    continue;
                };
                let merged = match chunk_data.get(&id) {
                    Some(base) => deep_merge(base, &details)?,
                    None => details,
                };
                chunk_data.insert(id, merged);
            }
            for (id, data) in chunk_data {
                let merged = match merged_data.get(&id) {
                    Some(primary) => deep_merge(primary, &data)?,
                    None => data,
                };
                merged_data.insert(id, merged);
            }
        }

        // build and sort campaign objects; each sort is stable, so the last
        // one dominates
        let now = Utc::now();
        let mut campaigns: Vec<DropsCampaign> = merged_data
            .into_values()
            .filter_map(|data| match serde_json::from_value(data) {
                Ok(data) => Some(DropsCampaign::from_data(data, &claimed_benefits)),
                Err(e) => {
                    tracing::warn!("Failed to parse campaign: {e}");
                    None
                }
            })
            .collect();
        campaigns.sort_by_key(|c| std::cmp::Reverse(c.active_at(now)));
        campaigns.sort_by_key(|c| {
            if c.upcoming_at(now) {
                c.starts_at
            } else {
                c.ends_at
            }
        });
        campaigns.sort_by_key(|c| std::cmp::Reverse(c.linked));
        let algorithm = self
            .settings
            .lock()
            .map(|s| s.priority_algorithm)
            .unwrap_or_default();
        if algorithm == PriorityAlgorithm::EndingSoonest {
            campaigns.sort_by_key(|c| c.ends_at);
        }

        // collect maintenance triggers from campaigns earnable within the
        // next hour
        let next_hour = now + Duration::hours(1);
        let mut triggers: Vec<DateTime<Utc>> = campaigns
            .iter()
            .filter(|c| c.can_earn_within_at(next_hour, now))
            .flat_map(|c| c.time_triggers(now))
            .collect();
        triggers.sort_unstable();
        triggers.dedup();

        let total = campaigns.len();
        // swap the inventory atomically between suspension points
        if let Ok(mut inventory) = self.inventory.write() {
            inventory.replace(campaigns, triggers);
        }
        tracing::info!("Fetched {total} campaigns");

        // the maintenance task is restarted at the end of every fetch
        self.restart_maintenance();
        Ok(())
    }

    /// Claim a drop that reached its required minutes. Prints the claim and
    /// notifies on success.
    pub async fn claim_drop(&self, drop_id: &str) -> Result<bool> {
        let Some((instance_id, drop_text, campaign_text)) = ({
            let inventory = self
                .inventory
                .read()
                .map_err(|_| MinerError::miner("inventory poisoned"))?;
            inventory.drop_by_id(drop_id).and_then(|drop| {
                let campaign = inventory.campaign_of_drop(drop_id)?;
                let instance_id = drop.claim_instance_id.clone()?;
                Some((
                    instance_id,
                    format!("{} ({})", drop.rewards_text(), campaign.game.name),
                    format!(
                        "{} ({}/{})",
                        campaign.game.name,
                        campaign.claimed_drops() + 1,
                        campaign.total_drops()
                    ),
                ))
            })
        }) else {
            return Ok(false);
        };
        let response = self
            .http
            .gql(
                &gql_operations::CLAIM_DROP,
                Some(serde_json::json!({
                    "input": {"dropInstanceID": instance_id}
                })),
            )
            .await?;
        let status = response
            .pointer("/claimDropRewards/status")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let mined = matches!(status, "" | "ELIGIBLE_FOR_ALL" | "DROP_INSTANCE_ALREADY_CLAIMED");
        if mined {
            if let Ok(mut inventory) = self.inventory.write() {
                if let Some(drop) = inventory.drop_by_id_mut(drop_id) {
                    drop.mark_claimed();
                }
            }
            self.ui.print(&format!("Claimed drop: {drop_text}"));
            self.ui.notify(&campaign_text, "Drop claimed");
        } else {
            tracing::error!("Drop claim has potentially failed! Drop ID: {drop_id}");
        }
        Ok(mined)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::inventory::Game;
    use serde_json::json;

    #[test]
    fn test_merge_identity() {
        let a = json!({"id": "1", "nested": {"x": 1, "y": [1, 2]}});
        assert_eq!(deep_merge(&a, &a).unwrap(), a);
    }

    #[test]
    fn test_merge_with_empty_is_identity() {
        let a = json!({"id": "1", "nested": {"x": 1}});
        let empty = json!({});
        assert_eq!(deep_merge(&a, &empty).unwrap(), a);
        assert_eq!(deep_merge(&empty, &a).unwrap(), a);
    }

    #[test]
    fn test_merge_disjoint_is_union() {
        let a = json!({"x": 1});
        let b = json!({"y": 2});
        assert_eq!(deep_merge(&a, &b).unwrap(), json!({"x": 1, "y": 2}));
    }

    #[test]
    fn test_merge_prefers_primary_on_shared_scalar() {
        let a = json!({"x": 1, "shared": "primary"});
        let b = json!({"shared": "secondary"});
        assert_eq!(
            deep_merge(&a, &b).unwrap(),
            json!({"x": 1, "shared": "primary"})
        );
    }

    #[test]
    fn test_merge_recurses_into_objects() {
        let a = json!({"obj": {"kept": 1, "shared": "a"}});
        let b = json!({"obj": {"extra": 2, "shared": "b"}});
        assert_eq!(
            deep_merge(&a, &b).unwrap(),
            json!({"obj": {"kept": 1, "shared": "a", "extra": 2}})
        );
    }

    #[test]
    fn test_merge_type_mismatch_is_fatal() {
        let a = json!({"x": {"nested": true}});
        let b = json!({"x": [1, 2, 3]});
        assert!(deep_merge(&a, &b).is_err());
    }

    #[test]
    fn test_merge_null_is_not_a_mismatch() {
        let a = json!({"x": null});
        let b = json!({"x": "value"});
        assert_eq!(deep_merge(&a, &b).unwrap(), json!({"x": null}));
    }

    fn test_campaign(id: &str, game_id: &str, drops: Vec<TimedDrop>) -> DropsCampaign {
        let now = Utc::now();
        DropsCampaign {
            id: id.to_string(),
            name: format!("{id} campaign"),
            game: Game {
                id: game_id.to_string(),
                name: format!("Game {game_id}"),
                slug: None,
            },
            starts_at: now - Duration::hours(2),
            ends_at: now + Duration::hours(24),
            linked: true,
            link_url: String::new(),
            allowed_channels: vec![],
            drops,
        }
    }

    fn test_drop(id: &str, campaign_id: &str, current: u32, required: u32) -> TimedDrop {
        let now = Utc::now();
        TimedDrop {
            id: id.to_string(),
            campaign_id: campaign_id.to_string(),
            name: format!("Drop {id}"),
            starts_at: now - Duration::hours(2),
            ends_at: now + Duration::hours(24),
            required_minutes: required,
            current_minutes: current,
            claim_instance_id: None,
            is_claimed: false,
            benefits: vec![],
        }
    }

    #[test]
    fn test_inventory_drop_index_resolution() {
        let mut inventory = Inventory::default();
        inventory.replace(
            vec![
                test_campaign("c1", "g1", vec![test_drop("d1", "c1", 0, 60)]),
                test_campaign("c2", "g2", vec![test_drop("d2", "c2", 30, 60)]),
            ],
            vec![],
        );
        assert_eq!(inventory.campaign_of_drop("d2").unwrap().id, "c2");
        assert_eq!(inventory.drop_by_id("d1").unwrap().required_minutes, 60);
        assert!(inventory.drop_by_id("missing").is_none());

        inventory.drop_by_id_mut("d1").unwrap().update_minutes(10);
        assert_eq!(inventory.drop_by_id("d1").unwrap().current_minutes, 10);
    }

    #[test]
    fn test_active_drop_picks_least_remaining() {
        let mut inventory = Inventory::default();
        inventory.replace(
            vec![test_campaign(
                "c1",
                "g1",
                vec![
                    test_drop("d1", "c1", 0, 60),
                    test_drop("d2", "c1", 50, 60),
                ],
            )],
            vec![],
        );
        let mut channel = Channel::for_test(
            1,
            "streamer",
            Some(Game {
                id: "g1".to_string(),
                name: "Game g1".to_string(),
                slug: None,
            }),
        );
        channel.online = true;
        let active = inventory.active_drop(&channel).unwrap();
        assert_eq!(active.id, "d2");

        // off-game channel gets nothing
        channel.game = Some(Game {
            id: "g9".to_string(),
            name: "Other".to_string(),
            slug: None,
        });
        assert!(inventory.active_drop(&channel).is_none());
    }

    #[test]
    fn test_drop_can_earn_checks_channel() {
        let mut inventory = Inventory::default();
        inventory.replace(
            vec![test_campaign("c1", "g1", vec![test_drop("d1", "c1", 0, 60)])],
            vec![],
        );
        let mut channel = Channel::for_test(
            1,
            "streamer",
            Some(Game {
                id: "g1".to_string(),
                name: "Game g1".to_string(),
                slug: None,
            }),
        );
        channel.online = true;
        assert!(inventory.drop_can_earn("d1", &channel));
        channel.online = false;
        assert!(!inventory.drop_can_earn("d1", &channel));
    }
}
