use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub access_secret: String,
    pub access_ttl_minutes: i64,
    pub refresh_secret: String,
    pub refresh_ttl_minutes: i64,
    pub issuer: String,
    pub audience: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    /// Base URL under which uploaded objects are publicly reachable.
    pub public_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub jwt: JwtConfig,
    pub storage: StorageConfig,
    pub cookie_secure: bool,
    pub upload_dir: PathBuf,
    pub cors_origin: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| lookup(key).with_context(|| format!("{key} must be set"));
        let minutes_or = |key: &str, default: i64| -> anyhow::Result<i64> {
            let Some(v) = lookup(key) else {
                return Ok(default);
            };
            let minutes = v
                .trim()
                .parse::<i64>()
                .with_context(|| format!("invalid {key} {v}"))?;
            anyhow::ensure!(minutes > 0, "{key} must be positive, got {minutes}");
            Ok(minutes)
        };

        let jwt = JwtConfig {
            access_secret: required("ACCESS_TOKEN_SECRET")?,
            access_ttl_minutes: minutes_or("ACCESS_TOKEN_TTL_MINUTES", 15)?,
            refresh_secret: required("REFRESH_TOKEN_SECRET")?,
            refresh_ttl_minutes: minutes_or("REFRESH_TOKEN_TTL_MINUTES", 60 * 24 * 14)?,
            issuer: lookup("JWT_ISSUER").unwrap_or_else(|| "userhub".into()),
            audience: lookup("JWT_AUDIENCE").unwrap_or_else(|| "userhub-users".into()),
        };
        anyhow::ensure!(
            jwt.access_secret != jwt.refresh_secret,
            "ACCESS_TOKEN_SECRET and REFRESH_TOKEN_SECRET must differ"
        );

        let endpoint = required("MINIO_ENDPOINT")?;
        let bucket = required("MINIO_BUCKET")?;
        let public_url = lookup("MEDIA_PUBLIC_URL")
            .unwrap_or_else(|| format!("{}/{}", endpoint.trim_end_matches('/'), bucket));
        let storage = StorageConfig {
            access_key: required("MINIO_ACCESS_KEY")?,
            secret_key: required("MINIO_SECRET_KEY")?,
            region: lookup("MINIO_REGION").unwrap_or_else(|| "us-east-1".into()),
            public_url,
            endpoint,
            bucket,
        };

        let port = match lookup("APP_PORT") {
            Some(v) => v.parse::<u16>().with_context(|| format!("invalid APP_PORT {v}"))?,
            None => 8080,
        };

        Ok(Self {
            host: lookup("APP_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            database_url: required("DATABASE_URL")?,
            jwt,
            storage,
            cookie_secure: lookup("COOKIE_SECURE")
                .map(|v| !matches!(v.as_str(), "false" | "0"))
                .unwrap_or(true),
            upload_dir: lookup("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            cors_origin: lookup("CORS_ORIGIN").filter(|v| !v.is_empty()),
        })
    }
}
