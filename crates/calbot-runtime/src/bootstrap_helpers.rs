use std::sync::Arc;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use calbot_core::{
    AuditLog, AuditLogConfig, CircuitBreaker, CircuitBreakerConfig, HealthCounters,
};

use crate::startup_config::StatePaths;

pub const AUDIT_SERVICE_NAME: &str = "calbot";

pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

/// Soft components shared by the bot loop and the operator subcommands.
#[derive(Clone)]
pub struct CoreServices {
    pub health: Arc<HealthCounters>,
    pub audit: Arc<AuditLog>,
    pub breaker: Arc<CircuitBreaker>,
}

pub fn build_core_services(
    paths: &StatePaths,
    audit_retention_days: u64,
    breaker_config: CircuitBreakerConfig,
) -> CoreServices {
    let health = Arc::new(HealthCounters::default());
    let mut audit_config = AuditLogConfig::new(paths.audit_dir.clone(), AUDIT_SERVICE_NAME);
    audit_config.retention_days = audit_retention_days;
    let audit = Arc::new(AuditLog::new(audit_config).with_health(health.clone()));
    let breaker = Arc::new(
        CircuitBreaker::new(paths.circuit_state_file.clone(), breaker_config)
            .with_health(health.clone()),
    );
    CoreServices {
        health,
        audit,
        breaker,
    }
}
