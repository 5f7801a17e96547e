//! Runtime configuration.
//!
//! Every knob reads from a `FOLIO_*` environment variable with a
//! sensible default, so a bare `Config::from_env()` works against a
//! local MinIO with no `.env` file at all.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::convert::types::ImageFormat;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub convert: ConvertConfig,
    pub recovery: RecoveryConfig,
    pub access: AccessConfig,
    pub session: SessionConfig,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            storage: StorageConfig::from_env(),
            database: DatabaseConfig::from_env(),
            cache: CacheConfig::from_env(),
            convert: ConvertConfig::from_env(),
            recovery: RecoveryConfig::from_env(),
            access: AccessConfig::from_env(),
            session: SessionConfig::from_env(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            convert: ConvertConfig::default(),
            recovery: RecoveryConfig::default(),
            access: AccessConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// S3-compatible storage endpoint.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub force_path_style: bool,
}

impl StorageConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            endpoint: env_string("FOLIO_S3_ENDPOINT", &defaults.endpoint),
            bucket: env_string("FOLIO_S3_BUCKET", &defaults.bucket),
            region: env_string("FOLIO_S3_REGION", &defaults.region),
            access_key: env_string("FOLIO_S3_ACCESS_KEY", &defaults.access_key),
            secret_key: env_string("FOLIO_S3_SECRET_KEY", &defaults.secret_key),
            force_path_style: env_or("FOLIO_S3_FORCE_PATH_STYLE", defaults.force_path_style),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".to_string(),
            bucket: "folio".to_string(),
            region: "us-east-1".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            force_path_style: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

impl DatabaseConfig {
    fn from_env() -> Self {
        Self {
            url: env_string("FOLIO_DATABASE_URL", &Self::default().url),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:folio.db".to_string(),
        }
    }
}

/// Page cache freshness policy.
///
/// The page TTL is deliberately much longer than the signed-URL TTLs
/// in [`AccessConfig`]: a converted page stays valid for days, while
/// any single URL pointing at it dies within hours.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub page_ttl_days: i64,
    pub sweep_interval_secs: u64,
}

impl CacheConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            page_ttl_days: env_or("FOLIO_PAGE_TTL_DAYS", defaults.page_ttl_days),
            sweep_interval_secs: env_or("FOLIO_CACHE_SWEEP_SECS", defaults.sweep_interval_secs),
        }
    }

    pub fn page_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.page_ttl_days)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_ttl_days: 7,
            sweep_interval_secs: 3600,
        }
    }
}

/// Rasterization and encoding settings.
#[derive(Debug, Clone)]
pub struct ConvertConfig {
    /// Render scale relative to the page's natural size at 72 DPI.
    pub scale: f32,
    pub format: ImageFormat,
    /// JPEG quality (1-100); ignored for PNG.
    pub quality: u8,
    pub render_timeout_secs: u64,
    /// Pages rasterized concurrently per conversion run.
    pub max_parallel_renders: usize,
    /// Open documents kept warm for page-level re-renders.
    pub renderer_cache_size: usize,
    pub thumbnail_max_px: u32,
}

impl ConvertConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            scale: env_or("FOLIO_RENDER_SCALE", defaults.scale),
            format: env_or("FOLIO_PAGE_FORMAT", defaults.format),
            quality: env_or("FOLIO_PAGE_QUALITY", defaults.quality),
            render_timeout_secs: env_or("FOLIO_RENDER_TIMEOUT_SECS", defaults.render_timeout_secs),
            max_parallel_renders: env_or("FOLIO_MAX_PARALLEL_RENDERS", defaults.max_parallel_renders),
            renderer_cache_size: env_or("FOLIO_RENDERER_CACHE_SIZE", defaults.renderer_cache_size),
            thumbnail_max_px: env_or("FOLIO_THUMBNAIL_MAX_PX", defaults.thumbnail_max_px),
        }
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    pub fn render_options(&self) -> crate::convert::types::RenderOptions {
        crate::convert::types::RenderOptions {
            scale: self.scale,
            format: self.format,
            quality: self.quality,
        }
    }

    /// Settings for the re-encode fallback after a failed conversion:
    /// lossless PNG at a reduced scale, trading fidelity for a render
    /// that is much more likely to succeed.
    pub fn relaxed_options(&self) -> crate::convert::types::RenderOptions {
        crate::convert::types::RenderOptions {
            scale: (self.scale * 0.75).max(0.5),
            format: ImageFormat::Png,
            quality: self.quality,
        }
    }
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            scale: 1.5,
            format: ImageFormat::Jpeg,
            quality: 85,
            render_timeout_secs: 30,
            max_parallel_renders: 2,
            renderer_cache_size: 16,
            thumbnail_max_px: 200,
        }
    }
}

/// Bounds on automatic fault recovery.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Hard cap on strategies tried per fault.
    pub max_attempts: u32,
    pub strategy_timeout_secs: u64,
    /// Public CDN mirror of the blob bucket, if one exists.
    pub cdn_base_url: Option<String>,
}

impl RecoveryConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_or("FOLIO_RECOVERY_MAX_ATTEMPTS", defaults.max_attempts),
            strategy_timeout_secs: env_or(
                "FOLIO_STRATEGY_TIMEOUT_SECS",
                defaults.strategy_timeout_secs,
            ),
            cdn_base_url: env::var("FOLIO_CDN_BASE_URL").ok(),
        }
    }

    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_secs(self.strategy_timeout_secs)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy_timeout_secs: 10,
            cdn_base_url: None,
        }
    }
}

/// Signed-URL lifetimes per viewer role, in seconds.
///
/// Less-trusted roles get shorter-lived URLs and watermarked pages.
#[derive(Debug, Clone)]
pub struct AccessConfig {
    pub url_ttl_anonymous_secs: u64,
    pub url_ttl_shared_secs: u64,
    pub url_ttl_member_secs: u64,
    pub url_ttl_owner_secs: u64,
    pub url_ttl_admin_secs: u64,
    /// Watermark pages served to anonymous and share-link viewers.
    pub watermark_untrusted: bool,
}

impl AccessConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url_ttl_anonymous_secs: env_or(
                "FOLIO_URL_TTL_ANONYMOUS_SECS",
                defaults.url_ttl_anonymous_secs,
            ),
            url_ttl_shared_secs: env_or("FOLIO_URL_TTL_SHARED_SECS", defaults.url_ttl_shared_secs),
            url_ttl_member_secs: env_or("FOLIO_URL_TTL_MEMBER_SECS", defaults.url_ttl_member_secs),
            url_ttl_owner_secs: env_or("FOLIO_URL_TTL_OWNER_SECS", defaults.url_ttl_owner_secs),
            url_ttl_admin_secs: env_or("FOLIO_URL_TTL_ADMIN_SECS", defaults.url_ttl_admin_secs),
            watermark_untrusted: env_or("FOLIO_WATERMARK_UNTRUSTED", defaults.watermark_untrusted),
        }
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            url_ttl_anonymous_secs: 900,
            url_ttl_shared_secs: 900,
            url_ttl_member_secs: 3600,
            url_ttl_owner_secs: 43200,
            url_ttl_admin_secs: 86400,
            watermark_untrusted: true,
        }
    }
}

/// Viewing session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Pages preloaded on each side of the current page.
    pub preload_window: u32,
    pub idle_timeout_mins: i64,
    pub cleanup_interval_secs: u64,
}

impl SessionConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            preload_window: env_or("FOLIO_PRELOAD_WINDOW", defaults.preload_window),
            idle_timeout_mins: env_or("FOLIO_SESSION_IDLE_MINS", defaults.idle_timeout_mins),
            cleanup_interval_secs: env_or(
                "FOLIO_SESSION_SWEEP_SECS",
                defaults.cleanup_interval_secs,
            ),
        }
    }

    pub fn idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.idle_timeout_mins)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            preload_window: 2,
            idle_timeout_mins: 30,
            cleanup_interval_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let config = Config::default();
        assert_eq!(config.cache.page_ttl_days, 7);
        assert_eq!(config.recovery.max_attempts, 3);
        assert_eq!(config.session.preload_window, 2);
        assert!(config.storage.force_path_style);
    }

    #[test]
    fn page_ttl_dwarfs_every_url_ttl() {
        let config = Config::default();
        let page_ttl_secs = config.cache.page_ttl().num_seconds() as u64;
        for url_ttl in [
            config.access.url_ttl_anonymous_secs,
            config.access.url_ttl_shared_secs,
            config.access.url_ttl_member_secs,
            config.access.url_ttl_owner_secs,
            config.access.url_ttl_admin_secs,
        ] {
            assert!(url_ttl < page_ttl_secs);
        }
    }

    #[test]
    fn relaxed_options_fall_back_to_png() {
        let convert = ConvertConfig::default();
        let relaxed = convert.relaxed_options();
        assert_eq!(relaxed.format, ImageFormat::Png);
        assert!(relaxed.scale < convert.scale);
    }
}
