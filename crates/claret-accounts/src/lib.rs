//! Account pool: the set of upstream accounts, their credentials,
//! capabilities and quota state, persisted as a single JSON file.

mod account;
mod cooldown;
mod store;

pub use account::{
    Account, AccountPatch, AuthKind, Capability, ModelTier, OAuthTokens, PreferredTransport,
    now_epoch,
};
pub use cooldown::CooldownQueue;
pub use store::{AccountStore, StoreError};
