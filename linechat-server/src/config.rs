//! Server configuration.

use std::time::Duration;

use clap::Parser;

use crate::error::RelayError;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8000";
pub const DEFAULT_IDLE_TICKS: u32 = 10;
pub const DEFAULT_TICK_MS: u64 = 1000;
pub const DEFAULT_CLIENT_QUEUE: usize = 64;
pub const DEFAULT_EVENT_QUEUE: usize = 1024;
pub const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;

/// Chat relay configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "linechat-server", about = "Line-oriented TCP chat relay")]
pub struct ServerConfig {
    /// Address to listen on for chat connections.
    #[arg(long, env = "LINECHAT_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: String,

    /// Number of silent ticks before an idle connection is closed.
    #[arg(long, env = "LINECHAT_IDLE_TICKS", default_value_t = DEFAULT_IDLE_TICKS)]
    pub idle_ticks: u32,

    /// Length of one idle tick, in milliseconds.
    #[arg(long, env = "LINECHAT_TICK_MS", default_value_t = DEFAULT_TICK_MS)]
    pub tick_ms: u64,

    /// Outgoing lines buffered per client before the broadcaster starts
    /// dropping messages for that client.
    #[arg(long, env = "LINECHAT_CLIENT_QUEUE", default_value_t = DEFAULT_CLIENT_QUEUE)]
    pub client_queue: usize,

    /// Pending events buffered in front of the broadcaster.
    #[arg(long, env = "LINECHAT_EVENT_QUEUE", default_value_t = DEFAULT_EVENT_QUEUE)]
    pub event_queue: usize,

    /// Longest accepted input line in bytes; longer lines are dropped.
    #[arg(long, env = "LINECHAT_MAX_LINE_LEN", default_value_t = DEFAULT_MAX_LINE_LEN)]
    pub max_line_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            idle_ticks: DEFAULT_IDLE_TICKS,
            tick_ms: DEFAULT_TICK_MS,
            client_queue: DEFAULT_CLIENT_QUEUE,
            event_queue: DEFAULT_EVENT_QUEUE,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

impl ServerConfig {
    /// Duration of a single idle tick.
    pub fn idle_period(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Reject values that would make the relay unusable.
    ///
    /// tokio channels panic on a zero capacity, and a zero countdown would
    /// close every connection on accept.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.idle_ticks == 0 {
            return Err(RelayError::Config("idle-ticks must be at least 1".into()));
        }
        if self.tick_ms == 0 {
            return Err(RelayError::Config("tick-ms must be at least 1".into()));
        }
        if self.client_queue == 0 {
            return Err(RelayError::Config("client-queue must be at least 1".into()));
        }
        if self.event_queue == 0 {
            return Err(RelayError::Config("event-queue must be at least 1".into()));
        }
        if self.max_line_len == 0 {
            return Err(RelayError::Config("max-line-len must be at least 1".into()));
        }
        Ok(())
    }
}
