//! Priority scoring: four pluggable algorithms producing the ranking key
//! that drives game and channel selection. Higher is better; expired
//! campaigns always score negative infinity.

use chrono::{DateTime, Utc};

use crate::models::DropsCampaign;
use crate::settings::PriorityAlgorithm;

/// Campaigns ending within this many hours count as urgent for BALANCED.
const URGENCY_WINDOW_HOURS: f64 = 72.0;
/// Extra time margin ADAPTIVE assumes mining will need.
const RISK_BUFFER: f64 = 1.2;

/// Inputs shared by every scoring call in one GAMES_UPDATE pass.
pub struct ScoreContext<'a> {
    pub algorithm: PriorityAlgorithm,
    /// User priority list, top first.
    pub priority: &'a [String],
    /// Length of the filtered campaign list being scored.
    pub filtered_len: usize,
}

impl ScoreContext<'_> {
    /// Reverse index into the priority list: top entry gets the highest
    /// value, absent games get 0.
    fn user_priority(&self, game_name: &str) -> usize {
        self.priority
            .iter()
            .position(|name| name == game_name)
            .map(|idx| self.priority.len() - idx)
            .unwrap_or(0)
    }
}

/// Score one campaign. `index` is the campaign's position in the filtered
/// list, which for ENDING_SOONEST must be sorted by `ends_at` ascending.
pub fn campaign_score(
    ctx: &ScoreContext<'_>,
    campaign: &DropsCampaign,
    index: usize,
    now: DateTime<Utc>,
) -> f64 {
    let hours_left = (campaign.ends_at - now).num_seconds() as f64 / 3600.0;
    if hours_left <= 0.0 {
        return f64::NEG_INFINITY;
    }
    let p = ctx.user_priority(&campaign.game.name);
    match ctx.algorithm {
        PriorityAlgorithm::List => {
            if p > 0 {
                p as f64
            } else {
                -(index as f64)
            }
        }
        PriorityAlgorithm::EndingSoonest => {
            if p > 0 {
                (ctx.filtered_len - index) as f64
            } else {
                -(index as f64)
            }
        }
        PriorityAlgorithm::Balanced => {
            if p == 0 {
                return -hours_left;
            }
            let urgency = (100.0 * (1.0 - hours_left / URGENCY_WINDOW_HOURS)).clamp(0.0, 100.0);
            let list_len = ctx.priority.len().max(1) as f64;
            let inverted = p as f64;
            let priority_score = (inverted / list_len) * 100.0;
            let blend = 0.60 * priority_score + 0.40 * urgency;
            (blend / 100.0) * inverted + 0.1 * blend
        }
        PriorityAlgorithm::Adaptive => {
            if p == 0 {
                return -hours_left;
            }
            let inverted = p as f64;
            let hours_needed = campaign.remaining_minutes() as f64 / 60.0;
            let risk = if hours_needed > 0.0 {
                (1.0 - hours_left / (hours_needed * RISK_BUFFER)).max(0.0)
            } else {
                0.0
            };
            inverted + inverted * risk * 10.0
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::inventory::{Game, TimedDrop};
    use chrono::Duration;

    fn campaign(game_name: &str, ends_in_hours: i64, remaining_minutes: u32) -> DropsCampaign {
        let now = Utc::now();
        DropsCampaign {
            id: format!("c-{game_name}"),
            name: format!("{game_name} campaign"),
            game: Game {
                id: format!("g-{game_name}"),
                name: game_name.to_string(),
                slug: None,
            },
            starts_at: now - Duration::days(1),
            ends_at: now + Duration::hours(ends_in_hours),
            linked: true,
            link_url: String::new(),
            allowed_channels: vec![],
            drops: vec![TimedDrop {
                id: format!("d-{game_name}"),
                campaign_id: format!("c-{game_name}"),
                name: "Drop".to_string(),
                starts_at: now - Duration::days(1),
                ends_at: now + Duration::hours(ends_in_hours),
                required_minutes: remaining_minutes,
                current_minutes: 0,
                claim_instance_id: None,
                is_claimed: false,
                benefits: vec![],
            }],
        }
    }

    fn ctx<'a>(algorithm: PriorityAlgorithm, priority: &'a [String]) -> ScoreContext<'a> {
        ScoreContext {
            algorithm,
            priority,
            filtered_len: 2,
        }
    }

    #[test]
    fn test_expired_campaign_scores_neg_infinity_for_all_algorithms() {
        let priority = vec!["A".to_string()];
        let now = Utc::now();
        let mut c = campaign("A", 5, 60);
        c.ends_at = now - Duration::hours(1);
        for algorithm in [
            PriorityAlgorithm::List,
            PriorityAlgorithm::Adaptive,
            PriorityAlgorithm::Balanced,
            PriorityAlgorithm::EndingSoonest,
        ] {
            let score = campaign_score(&ctx(algorithm, &priority), &c, 0, now);
            assert_eq!(score, f64::NEG_INFINITY, "{algorithm:?}");
        }
    }

    #[test]
    fn test_list_uses_reverse_index() {
        let priority = vec!["A".to_string(), "B".to_string()];
        let now = Utc::now();
        let a = campaign_score(&ctx(PriorityAlgorithm::List, &priority), &campaign("A", 48, 60), 0, now);
        let b = campaign_score(&ctx(PriorityAlgorithm::List, &priority), &campaign("B", 2, 60), 1, now);
        assert_eq!(a, 2.0);
        assert_eq!(b, 1.0);
        assert!(a > b);
    }

    #[test]
    fn test_list_non_priority_never_positive() {
        let priority = vec!["A".to_string()];
        let now = Utc::now();
        for index in 0..5 {
            let score = campaign_score(
                &ctx(PriorityAlgorithm::List, &priority),
                &campaign("Other", 48, 60),
                index,
                now,
            );
            assert!(score <= 0.0);
        }
    }

    #[test]
    fn test_ending_soonest_prefers_earlier_end() {
        // B ends in 2h, A in 48h; sorted by ends_at B is index 0
        let priority = vec!["A".to_string(), "B".to_string()];
        let now = Utc::now();
        let context = ctx(PriorityAlgorithm::EndingSoonest, &priority);
        let b = campaign_score(&context, &campaign("B", 2, 60), 0, now);
        let a = campaign_score(&context, &campaign("A", 48, 60), 1, now);
        assert!(b > a);

        // with LIST the same pair flips
        let context = ctx(PriorityAlgorithm::List, &priority);
        let b = campaign_score(&context, &campaign("B", 2, 60), 0, now);
        let a = campaign_score(&context, &campaign("A", 48, 60), 1, now);
        assert!(a > b);
    }

    #[test]
    fn test_adaptive_zero_remaining_reduces_to_inverted_priority() {
        let priority = vec!["A".to_string(), "B".to_string()];
        let now = Utc::now();
        let score = campaign_score(
            &ctx(PriorityAlgorithm::Adaptive, &priority),
            &campaign("A", 10, 0),
            0,
            now,
        );
        assert_eq!(score, 2.0);
    }

    #[test]
    fn test_adaptive_boosts_at_risk_campaigns() {
        let priority = vec!["A".to_string()];
        let now = Utc::now();
        // 10 hours of mining left but only 5 hours of campaign: high risk
        let risky = campaign_score(
            &ctx(PriorityAlgorithm::Adaptive, &priority),
            &campaign("A", 5, 600),
            0,
            now,
        );
        // plenty of time: no risk boost
        let safe = campaign_score(
            &ctx(PriorityAlgorithm::Adaptive, &priority),
            &campaign("A", 200, 600),
            0,
            now,
        );
        assert!(risky > safe);
        assert!((safe - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_balanced_clamps_urgency() {
        let priority = vec!["A".to_string()];
        let now = Utc::now();
        // far-future campaign: urgency clamps to 0, score stays positive
        let far = campaign_score(
            &ctx(PriorityAlgorithm::Balanced, &priority),
            &campaign("A", 1000, 60),
            0,
            now,
        );
        // nearly-over campaign: urgency clamps to 100
        let near = campaign_score(
            &ctx(PriorityAlgorithm::Balanced, &priority),
            &campaign("A", 1, 60),
            0,
            now,
        );
        assert!(far > 0.0);
        assert!(near > far);
        // with invP = L = 1: blend <= 100, score <= 1*1 + 10
        assert!(near <= 11.0);
    }

    #[test]
    fn test_balanced_non_priority_uses_negative_hours() {
        let priority = vec!["A".to_string()];
        let now = Utc::now();
        let sooner = campaign_score(
            &ctx(PriorityAlgorithm::Balanced, &priority),
            &campaign("X", 2, 60),
            0,
            now,
        );
        let later = campaign_score(
            &ctx(PriorityAlgorithm::Balanced, &priority),
            &campaign("Y", 50, 60),
            1,
            now,
        );
        assert!(sooner < 0.0 && later < 0.0);
        assert!(sooner > later);
    }
}
