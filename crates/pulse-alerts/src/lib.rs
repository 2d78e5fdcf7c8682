//! Rules engine, alert filtering, notification fan-out and lifecycle
//! tracking for the Pulsewatch pipeline
//!
//! Candidate alerts produced by the rules engine pass through the filter
//! (mute windows, rate limit, dedup); survivors are registered with the
//! lifecycle manager and fanned out by the dispatcher.

pub mod channels;
pub mod dispatcher;
pub mod filter;
pub mod lifecycle;
pub mod rules;

pub use channels::{
    ChannelSettings, ChatChannel, EmailChannel, NotificationChannel, PagerChannel, SendResult,
    WebhookChannel,
};
pub use dispatcher::{DispatchOutcome, NotificationDispatcher};
pub use filter::{dedup_key_for, is_muted_at, AlertFilter, FilterConfig, FilterVerdict};
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use rules::RulesEngine;
