use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::error::AppError;

/// SFU worker pool sizing and placement.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Workers created at startup.
    pub initial_workers: usize,
    /// Hard ceiling for auto-scaling.
    pub max_workers: usize,
    pub auto_scale: bool,
    /// Average rooms-per-worker above which one worker is added.
    pub scale_load_threshold: f64,
    /// First UDP port handed to worker slot 0; each slot gets a disjoint
    /// range of `ports_per_worker` ports above it.
    pub rtc_min_port: u16,
    pub ports_per_worker: u16,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            initial_workers: 4,
            max_workers: 8,
            auto_scale: true,
            scale_load_threshold: 0.8,
            rtc_min_port: 40000,
            ports_per_worker: 100,
        }
    }
}

/// Room lifecycle knobs.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub max_participants: usize,
    /// How long an empty (draining) room survives before the sweeper
    /// deletes it.
    pub inactivity_threshold: Duration,
    pub sweep_interval: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_participants: 100,
            inactivity_threshold: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Admission control limits. All three limiters share one window length.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub ip_connection_limit: u32,
    pub user_connection_limit: u32,
    pub user_message_limit: u32,
    pub window: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            ip_connection_limit: 10,
            user_connection_limit: 5,
            user_message_limit: 30,
            window: Duration::from_secs(60),
        }
    }
}

/// Signaling-boundary validation and batching.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub max_tip_amount: u64,
    pub max_message_len: usize,
    pub viewer_flush_interval: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            max_tip_amount: 10_000,
            max_message_len: 500,
            viewer_flush_interval: Duration::from_secs(5),
        }
    }
}

/// Endpoints of the external collaborators.
#[derive(Debug, Clone)]
pub struct CollaboratorConfig {
    pub database_url: Option<String>,
    pub redis_url: String,
    pub wallet_service_url: String,
    pub chat_service_url: String,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: "redis://127.0.0.1:6379".into(),
            wallet_service_url: "http://wallet-service:8080".into(),
            chat_service_url: "http://chat-service:8080".into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub workers: WorkerPoolConfig,
    pub rooms: RoomConfig,
    pub gate: GateConfig,
    pub signaling: SignalingConfig,
    pub collaborators: CollaboratorConfig,
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn parse_env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let defaults = Config::default();

        let workers = WorkerPoolConfig {
            initial_workers: parse_env("WORKER_COUNT", defaults.workers.initial_workers),
            max_workers: parse_env("MAX_WORKERS", defaults.workers.max_workers),
            auto_scale: parse_env("AUTO_SCALE_ENABLED", defaults.workers.auto_scale),
            scale_load_threshold: parse_env(
                "SCALE_LOAD_THRESHOLD",
                defaults.workers.scale_load_threshold,
            ),
            rtc_min_port: parse_env("RTC_MIN_PORT", defaults.workers.rtc_min_port),
            ports_per_worker: parse_env("RTC_PORTS_PER_WORKER", defaults.workers.ports_per_worker),
        };

        if workers.initial_workers == 0 {
            return Err(AppError::Config("WORKER_COUNT must be at least 1".into()));
        }
        if workers.max_workers < workers.initial_workers {
            return Err(AppError::Config(
                "MAX_WORKERS must be >= WORKER_COUNT".into(),
            ));
        }
        if workers.ports_per_worker == 0 {
            return Err(AppError::Config(
                "RTC_PORTS_PER_WORKER must be at least 1".into(),
            ));
        }

        let rooms = RoomConfig {
            max_participants: parse_env("MAX_CONNECTIONS_PER_ROOM", defaults.rooms.max_participants),
            inactivity_threshold: parse_env_secs(
                "ROOM_INACTIVITY_SECS",
                defaults.rooms.inactivity_threshold,
            ),
            sweep_interval: parse_env_secs("ROOM_SWEEP_INTERVAL_SECS", defaults.rooms.sweep_interval),
        };

        let gate = GateConfig {
            ip_connection_limit: parse_env("IP_CONNECTION_LIMIT", defaults.gate.ip_connection_limit),
            user_connection_limit: parse_env(
                "USER_CONNECTION_LIMIT",
                defaults.gate.user_connection_limit,
            ),
            user_message_limit: parse_env("USER_MESSAGE_LIMIT", defaults.gate.user_message_limit),
            window: parse_env_secs("RATE_LIMIT_WINDOW_SECS", defaults.gate.window),
        };

        let signaling = SignalingConfig {
            max_tip_amount: parse_env("MAX_TIP_AMOUNT", defaults.signaling.max_tip_amount),
            max_message_len: parse_env("MAX_MESSAGE_LEN", defaults.signaling.max_message_len),
            viewer_flush_interval: parse_env_secs(
                "VIEWER_FLUSH_INTERVAL_SECS",
                defaults.signaling.viewer_flush_interval,
            ),
        };

        let collaborators = CollaboratorConfig {
            database_url: env::var("DATABASE_URL").ok(),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| defaults.collaborators.redis_url.clone()),
            wallet_service_url: env::var("WALLET_SERVICE_URL")
                .unwrap_or_else(|_| defaults.collaborators.wallet_service_url.clone()),
            chat_service_url: env::var("CHAT_SERVICE_URL")
                .unwrap_or_else(|_| defaults.collaborators.chat_service_url.clone()),
        };

        Ok(Self {
            workers,
            rooms,
            gate,
            signaling,
            collaborators,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_limits() {
        let cfg = Config::default();
        assert_eq!(cfg.gate.ip_connection_limit, 10);
        assert_eq!(cfg.gate.user_connection_limit, 5);
        assert_eq!(cfg.gate.user_message_limit, 30);
        assert_eq!(cfg.gate.window, Duration::from_secs(60));
        assert_eq!(cfg.rooms.inactivity_threshold, Duration::from_secs(1800));
        assert_eq!(cfg.rooms.sweep_interval, Duration::from_secs(300));
        assert_eq!(cfg.signaling.viewer_flush_interval, Duration::from_secs(5));
        assert_eq!(cfg.signaling.max_tip_amount, 10_000);
        assert!((cfg.workers.scale_load_threshold - 0.8).abs() < f64::EPSILON);
    }

    // Env mutations stay in one test so parallel test threads never
    // observe each other's variables.
    #[test]
    fn test_env_overrides_and_validation() {
        env::set_var("MAX_TIP_AMOUNT", "2500");
        let cfg = Config::from_env().expect("config");
        assert_eq!(cfg.signaling.max_tip_amount, 2500);
        env::remove_var("MAX_TIP_AMOUNT");

        env::set_var("WORKER_COUNT", "0");
        let err = Config::from_env().unwrap_err();
        assert_eq!(err.code(), "config");
        env::remove_var("WORKER_COUNT");
    }
}
