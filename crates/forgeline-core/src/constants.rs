//! Centralized defaults

pub mod pipeline {
    /// Auto-retries of the transformation/validation loop.
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_CHECKPOINT_TIMEOUT_SECS: u64 = 30 * 60;
    /// Grace window a terminal session stays queryable before eviction.
    pub const DEFAULT_SESSION_TTL_SECS: u64 = 60 * 60;
    pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
    pub const BRANCH_PREFIX: &str = "forgeline/";
}

pub mod build {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 15 * 60;
    pub const RAW_CAPTURE_MAX_LINES: usize = 20_000;
    pub const RAW_CAPTURE_MAX_BYTES: usize = 4_000_000;
    pub const OUTPUT_TAIL_LINES: usize = 200;
    pub const READER_JOIN_TIMEOUT_MS: u64 = 2_000;
    pub const KILL_GRACE_MS: u64 = 800;
}

pub mod ai {
    pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
    pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
    pub const MAX_OUTPUT_TOKENS: usize = 16_000;
    pub const REQUEST_TIMEOUT_SECS: u64 = 300;
    pub const MAX_ATTEMPTS: u32 = 4;
    pub const ANTHROPIC_VERSION: &str = "2023-06-01";
    /// Source files larger than this are not inlined into transform prompts.
    pub const MAX_INLINE_FILE_BYTES: usize = 60_000;
}

pub mod server {
    pub const DEFAULT_PORT: u16 = 3000;
}

pub mod ui {
    pub const CONFIG_DIR_NAME: &str = ".forgeline";
    pub const CONFIG_FILE_NAME: &str = "config.toml";
}
