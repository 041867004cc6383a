//! Data models for the drops miner.

pub mod channel;
pub mod gql;
pub mod inventory;

pub use channel::Channel;
pub use gql::{GqlRequest, GqlResponse};
pub use inventory::{
    AclChannelRef, CampaignData, DropBenefit, DropsCampaign, Game, TimedDrop,
};
