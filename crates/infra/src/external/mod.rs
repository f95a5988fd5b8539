//! Clients for external payment providers.

pub mod wechat;

pub use wechat::{WeChatConfig, WeChatLedgerClient};
