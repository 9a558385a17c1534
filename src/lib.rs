//! Multi-channel customer chat backend: platform webhooks, chat sessions, live
//! viewers and automatic answers with hand-over to human consultants.

pub mod admin;
pub mod answer;
pub mod app;
pub mod channels;
pub mod config;
pub mod delivery;
pub mod error;
pub mod flood;
pub mod labels;
pub mod locks;
pub mod pipeline;
pub mod profile;
pub mod prompting;
pub mod realtime;
pub mod router;
pub mod signature;
pub mod status;
pub mod store;
pub mod types;
pub mod webhooks;
pub mod widget;
pub mod ws;
