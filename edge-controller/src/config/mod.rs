use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// Public base URL of this controller; the `iss` of every token it mints.
    pub issuer: String,
    pub jwt: JwtConfig,
    pub pki: PkiConfig,
    pub session: SessionConfig,
    pub enrollment: EnrollmentConfig,
    pub mfa: MfaConfig,
    pub bootstrap: BootstrapConfig,
    pub security: SecurityConfig,
    pub oidc: OidcConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    /// PKCS#8 PEM of a P-256 key. When unset an ephemeral key is generated
    /// at startup and every token is invalidated by a restart.
    pub signing_key_path: Option<String>,
    pub access_token_expiry_minutes: i64,
    pub id_token_expiry_minutes: i64,
    pub refresh_token_expiry_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PkiConfig {
    pub ca_cert_path: Option<String>,
    pub ca_key_path: Option<String>,
    pub cert_validity_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Idle timeout for legacy `zt-session` tokens.
    pub timeout_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollmentConfig {
    /// Default lifetime of enrollments created alongside an identity.
    pub duration_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MfaConfig {
    /// Issuer label shown by authenticator apps.
    pub issuer: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapConfig {
    pub admin_name: String,
    pub admin_username: String,
    pub admin_password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    /// Header the TLS terminator forwards the URL-encoded client certificate in.
    pub client_cert_header: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OidcConfig {
    pub redirect_uris: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub auth_attempts: u32,
    pub auth_window_seconds: u64,
    pub global_ip_limit: u32,
    pub global_ip_window_seconds: u64,
}

const DEV_ADMIN_PASSWORD: &str = "admin-password";

impl ControllerConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = ControllerConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("edge-controller"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: get_optional_env("OTLP_ENDPOINT"),
            issuer: get_env("CONTROLLER_ISSUER", Some("https://localhost:1280"), is_prod)?,
            jwt: JwtConfig {
                signing_key_path: get_optional_env("JWT_SIGNING_KEY_PATH"),
                access_token_expiry_minutes: parse_env(
                    "JWT_ACCESS_TOKEN_EXPIRY_MINUTES",
                    "30",
                    is_prod,
                )?,
                id_token_expiry_minutes: parse_env("JWT_ID_TOKEN_EXPIRY_MINUTES", "30", is_prod)?,
                refresh_token_expiry_hours: parse_env(
                    "JWT_REFRESH_TOKEN_EXPIRY_HOURS",
                    "24",
                    is_prod,
                )?,
            },
            pki: PkiConfig {
                ca_cert_path: get_optional_env("CA_CERT_PATH"),
                ca_key_path: get_optional_env("CA_KEY_PATH"),
                cert_validity_days: parse_env("CERT_VALIDITY_DAYS", "365", is_prod)?,
            },
            session: SessionConfig {
                timeout_minutes: parse_env("SESSION_TIMEOUT_MINUTES", "30", is_prod)?,
            },
            enrollment: EnrollmentConfig {
                duration_minutes: parse_env("ENROLLMENT_DURATION_MINUTES", "180", is_prod)?,
            },
            mfa: MfaConfig {
                issuer: get_env("MFA_ISSUER", Some("edge-controller"), is_prod)?,
            },
            bootstrap: BootstrapConfig {
                admin_name: get_env("ADMIN_NAME", Some("Default Admin"), is_prod)?,
                admin_username: get_env("ADMIN_USERNAME", Some("admin"), is_prod)?,
                admin_password: get_env("ADMIN_PASSWORD", Some(DEV_ADMIN_PASSWORD), is_prod)?,
            },
            security: SecurityConfig {
                allowed_origins: split_list(&get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?),
                client_cert_header: get_env("CLIENT_CERT_HEADER", Some("x-client-cert"), is_prod)?
                    .to_lowercase(),
            },
            oidc: OidcConfig {
                redirect_uris: split_list(&get_env(
                    "OIDC_REDIRECT_URIS",
                    Some("http://localhost:*/auth/callback,openziti://auth/callback"),
                    is_prod,
                )?),
            },
            rate_limit: RateLimitConfig {
                auth_attempts: parse_env("RATE_LIMIT_AUTH_ATTEMPTS", "20", is_prod)?,
                auth_window_seconds: parse_env("RATE_LIMIT_AUTH_WINDOW_SECONDS", "60", is_prod)?,
                global_ip_limit: parse_env("RATE_LIMIT_GLOBAL_IP_LIMIT", "600", is_prod)?,
                global_ip_window_seconds: parse_env(
                    "RATE_LIMIT_GLOBAL_IP_WINDOW_SECONDS",
                    "60",
                    is_prod,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "APP__PORT must be greater than 0"
            )));
        }

        if self.issuer.trim().is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "CONTROLLER_ISSUER must not be empty"
            )));
        }

        let durations = [
            ("JWT_ACCESS_TOKEN_EXPIRY_MINUTES", self.jwt.access_token_expiry_minutes),
            ("JWT_ID_TOKEN_EXPIRY_MINUTES", self.jwt.id_token_expiry_minutes),
            ("JWT_REFRESH_TOKEN_EXPIRY_HOURS", self.jwt.refresh_token_expiry_hours),
            ("CERT_VALIDITY_DAYS", self.pki.cert_validity_days),
            ("SESSION_TIMEOUT_MINUTES", self.session.timeout_minutes),
            ("ENROLLMENT_DURATION_MINUTES", self.enrollment.duration_minutes),
        ];
        for (key, value) in durations {
            if value <= 0 {
                return Err(AppError::ConfigError(anyhow::anyhow!("{} must be positive", key)));
            }
        }

        if self.pki.ca_cert_path.is_some() != self.pki.ca_key_path.is_some() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "CA_CERT_PATH and CA_KEY_PATH must be set together"
            )));
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if self.bootstrap.admin_password == DEV_ADMIN_PASSWORD {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "ADMIN_PASSWORD must be changed in production"
                )));
            }

            if self.jwt.signing_key_path.is_none() {
                tracing::warn!("JWT_SIGNING_KEY_PATH unset; tokens will not survive a restart");
            }
        }

        Ok(())
    }
}

/// Reads `key`. Falls back to `default` when present; a variable with no
/// default is required, and in production every variable without a default
/// must be set explicitly.
fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => match default {
            Some(def) => Ok(def.to_string()),
            None if is_prod => Err(AppError::ConfigError(anyhow::anyhow!(
                "{} is required in production but not set",
                key
            ))),
            None => Err(AppError::ConfigError(anyhow::anyhow!(
                "{} is required but not set",
                key
            ))),
        },
    }
}

fn get_optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
