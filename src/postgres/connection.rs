// ABOUTME: Driver configuration and TLS policy for tokio-postgres connections
// ABOUTME: Shared by the pool manager of each database tier

use std::time::Duration;

use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::config::SslMode;

use crate::config::{DatabaseConfig, TlsMode};
use crate::error::{SyncError, SyncResult};

/// Build the driver configuration for a tier.
pub fn pg_config(config: &DatabaseConfig, connect_timeout: Duration) -> tokio_postgres::Config {
    let mut pg = tokio_postgres::Config::new();
    pg.host(&config.host)
        .port(config.port)
        .dbname(&config.database)
        .user(&config.user)
        .application_name("replica-sync")
        .connect_timeout(connect_timeout)
        // Keep idle connections alive through load balancers
        .keepalives(true)
        .keepalives_idle(Duration::from_secs(60))
        .ssl_mode(match config.tls_mode {
            TlsMode::Disable => SslMode::Disable,
            TlsMode::Prefer => SslMode::Prefer,
            TlsMode::Require => SslMode::Require,
        });
    if !config.password.is_empty() {
        pg.password(&config.password);
    }
    pg
}

/// TLS connector for tiers that use `prefer` or `require`.
///
/// `accept_invalid_certs` is the escape hatch for self-signed servers.
pub fn tls_connector(config: &DatabaseConfig) -> SyncResult<MakeTlsConnector> {
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(config.accept_invalid_certs)
        .build()
        .map_err(|e| SyncError::Connectivity(format!("TLS setup failed: {}", e)))?;
    Ok(MakeTlsConnector::new(connector))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pg_config_maps_settings() {
        let config = DatabaseConfig {
            host: "db.internal".to_string(),
            port: 6432,
            database: "appdb".to_string(),
            user: "svc".to_string(),
            password: "pw".to_string(),
            tls_mode: TlsMode::Require,
            ..DatabaseConfig::default()
        };
        let pg = pg_config(&config, Duration::from_secs(2));
        assert_eq!(pg.get_ports(), &[6432]);
        assert_eq!(pg.get_dbname(), Some("appdb"));
        assert_eq!(pg.get_user(), Some("svc"));
        assert_eq!(pg.get_password(), Some(&b"pw"[..]));
        assert_eq!(pg.get_ssl_mode(), SslMode::Require);
        assert_eq!(pg.get_connect_timeout(), Some(&Duration::from_secs(2)));
    }

    #[test]
    fn test_pg_config_omits_empty_password() {
        let pg = pg_config(&DatabaseConfig::default(), Duration::from_secs(1));
        assert_eq!(pg.get_password(), None);
    }

    #[test]
    fn test_tls_connector_builds() {
        let config = DatabaseConfig {
            accept_invalid_certs: true,
            ..DatabaseConfig::default()
        };
        assert!(tls_connector(&config).is_ok());
    }
}
