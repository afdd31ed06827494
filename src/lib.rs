pub mod bot;
pub mod config;
pub mod cooldown;
pub mod error;
pub mod keeper;
pub mod keys;
pub mod redeem;
pub mod registry;
pub mod storage;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use keeper::Keeper;
pub use redeem::{RejectReason, Verdict};
pub use registry::{CommunityId, RoleId};
