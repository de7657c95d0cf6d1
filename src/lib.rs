//! funnelbot — multi-tenant conversational funnel host.
//!
//! Each tenant runs an independently-branded Telegram bot that walks users
//! through a fixed gating sequence (channel subscription → registration →
//! minimum deposit → reward tiers). Progress is driven by chat interaction
//! and by affiliate postbacks arriving out of band.

pub mod config;
pub mod engine;
pub mod error;
pub mod funnel;
pub mod gateway;
pub mod intake;
pub mod parent;
pub mod screens;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod telegram;
