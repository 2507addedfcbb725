use std::env;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub app_env: String,
    pub cors_origins: Vec<String>,
    pub store: StoreBackend,
    pub db: DbConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub tenant: TenantConfig,
    pub billing: BillingConfig,
    pub usage: UsageConfig,
}

#[derive(Clone, Debug)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub pool_min: u32,
    pub pool_max: u32,
}

#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: u8,
    pub key_prefix: String,
    pub plan_cache_secs: u64,
}

#[derive(Clone, Debug)]
pub struct JwtConfig {
    pub secret: String,
    pub leeway_secs: u64,
    pub issuer: Option<String>,
}

#[derive(Clone, Debug)]
pub struct TenantConfig {
    pub hint_header: String,
}

#[derive(Clone, Debug)]
pub struct BillingConfig {
    pub webhook_secret: String,
    pub signature_header: String,
    pub signature_tolerance_secs: i64,
    pub trial_days: i64,
    pub grace_period_secs: i64,
    pub default_plan: String,
}

#[derive(Clone, Debug)]
pub struct UsageConfig {
    pub warning_thresholds: Vec<u8>,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
}

const PLACEHOLDER_JWT_SECRET: &str = "change-me-to-a-secure-random-string";

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_or_parse("PORT", 3000),
            app_env: env_or("APP_ENV", "development"),
            cors_origins: split_list(&env_or("CORS_ORIGINS", "http://localhost:3000")),
            store: match env_or("STORE_BACKEND", "postgres").to_ascii_lowercase().as_str() {
                "memory" => StoreBackend::Memory,
                _ => StoreBackend::Postgres,
            },
            db: DbConfig {
                host: env_or("DB_HOST", "localhost"),
                port: env_or_parse("DB_PORT", 5432),
                database: env_or("DB_NAME", "tenancy"),
                user: env_or("DB_USER", "tenancy"),
                password: env_or("DB_PASSWORD", ""),
                pool_min: env_or_parse("DB_POOL_MIN", 2),
                pool_max: env_or_parse("DB_POOL_MAX", 20),
            },
            redis: RedisConfig {
                enabled: env_or_parse("REDIS_ENABLED", false),
                host: env_or("REDIS_HOST", "localhost"),
                port: env_or_parse("REDIS_PORT", 6379),
                password: env::var("REDIS_PASSWORD").ok().filter(|s| !s.is_empty()),
                db: env_or_parse("REDIS_DB", 0),
                key_prefix: env_or("REDIS_KEY_PREFIX", "tenancy:"),
                plan_cache_secs: parse_duration_to_secs(&env_or("PLAN_CACHE_TTL", "1h")) as u64,
            },
            jwt: JwtConfig {
                secret: env_or("JWT_SECRET", PLACEHOLDER_JWT_SECRET),
                leeway_secs: env_or_parse("JWT_LEEWAY_SECS", 30),
                issuer: env::var("JWT_ISSUER").ok().filter(|s| !s.is_empty()),
            },
            tenant: TenantConfig {
                hint_header: env_or("TENANT_HINT_HEADER", "x-tenant-id").to_ascii_lowercase(),
            },
            billing: BillingConfig {
                webhook_secret: env_or("BILLING_WEBHOOK_SECRET", ""),
                signature_header: env_or("BILLING_SIGNATURE_HEADER", "x-billing-signature")
                    .to_ascii_lowercase(),
                signature_tolerance_secs: parse_duration_to_secs(&env_or(
                    "BILLING_SIGNATURE_TOLERANCE",
                    "5m",
                )),
                trial_days: env_or_parse("TRIAL_DAYS", 14),
                grace_period_secs: parse_duration_to_secs(&env_or("PAST_DUE_GRACE", "7d")),
                default_plan: env_or("DEFAULT_PLAN", "starter"),
            },
            usage: UsageConfig {
                warning_thresholds: parse_thresholds(&env_or("USAGE_WARNING_THRESHOLDS", "80,90")),
                retry_attempts: env_or_parse("USAGE_RETRY_ATTEMPTS", 3),
                retry_backoff: Duration::from_millis(env_or_parse("USAGE_RETRY_BACKOFF_MS", 25)),
            },
        }
    }

    pub fn database_url(&self) -> String {
        if let Ok(url) = env::var("DATABASE_URL") {
            return url;
        }
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.db.user, self.db.password, self.db.host, self.db.port, self.db.database
        )
    }

    pub fn redis_url(&self) -> String {
        if let Ok(url) = env::var("REDIS_URL") {
            return url;
        }
        match &self.redis.password {
            Some(pw) if !pw.is_empty() => format!(
                "redis://:{}@{}:{}/{}",
                pw, self.redis.host, self.redis.port, self.redis.db
            ),
            _ => format!(
                "redis://{}:{}/{}",
                self.redis.host, self.redis.port, self.redis.db
            ),
        }
    }

    pub fn is_production(&self) -> bool {
        self.app_env == "production"
    }

    /// Settings that must never reach production unchanged.
    pub fn check(&self) -> Result<(), String> {
        if !self.is_production() {
            return Ok(());
        }
        if self.jwt.secret == PLACEHOLDER_JWT_SECRET || self.jwt.secret.len() < 32 {
            return Err("JWT_SECRET must be set to at least 32 characters in production".into());
        }
        if self.store == StoreBackend::Memory {
            return Err("STORE_BACKEND=memory is not allowed in production".into());
        }
        Ok(())
    }
}

impl Default for Config {
    /// Settings for an in-memory deployment with no external services.
    fn default() -> Self {
        Self {
            port: 3000,
            app_env: "test".to_string(),
            cors_origins: Vec::new(),
            store: StoreBackend::Memory,
            db: DbConfig {
                host: "localhost".to_string(),
                port: 5432,
                database: "tenancy".to_string(),
                user: "tenancy".to_string(),
                password: String::new(),
                pool_min: 1,
                pool_max: 5,
            },
            redis: RedisConfig {
                enabled: false,
                host: "localhost".to_string(),
                port: 6379,
                password: None,
                db: 0,
                key_prefix: "tenancy:".to_string(),
                plan_cache_secs: 3600,
            },
            jwt: JwtConfig {
                secret: "test-secret".to_string(),
                leeway_secs: 0,
                issuer: None,
            },
            tenant: TenantConfig {
                hint_header: "x-tenant-id".to_string(),
            },
            billing: BillingConfig {
                webhook_secret: String::new(),
                signature_header: "x-billing-signature".to_string(),
                signature_tolerance_secs: 300,
                trial_days: 14,
                grace_period_secs: 7 * 86400,
                default_plan: "starter".to_string(),
            },
            usage: UsageConfig {
                warning_thresholds: vec![80, 90],
                retry_attempts: 3,
                retry_backoff: Duration::from_millis(5),
            },
        }
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_thresholds(s: &str) -> Vec<u8> {
    let mut thresholds: Vec<u8> = s
        .split(',')
        .filter_map(|t| t.trim().parse().ok())
        .filter(|t| (1..=100).contains(t))
        .collect();
    thresholds.sort_unstable();
    thresholds.dedup();
    thresholds
}

fn parse_duration_to_secs(s: &str) -> i64 {
    let s = s.trim();
    if s.is_empty() {
        return 3600;
    }
    let (num_str, unit) = s.split_at(s.len() - 1);
    let num: i64 = num_str.parse().unwrap_or(1);
    match unit {
        "s" => num,
        "m" => num * 60,
        "h" => num * 3600,
        "d" => num * 86400,
        _ => s.parse().unwrap_or(3600),
    }
}
