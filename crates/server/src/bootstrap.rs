use std::sync::Arc;

use dialectic_agent::{build_gateway, PipelineOrchestrator};
use dialectic_core::audit::{AuditSink, TracingAuditSink};
use dialectic_core::config::AppConfig;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub orchestrator: Arc<PipelineOrchestrator>,
}

/// Wires the governed gateway and orchestrator for an already loaded config.
pub fn bootstrap_with_config(config: AppConfig) -> Application {
    let gateway = build_gateway(&config);
    let providers = gateway.providers().len();
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let orchestrator =
        Arc::new(PipelineOrchestrator::from_config(&config, Arc::new(gateway), audit));

    info!(
        event_name = "system.bootstrap.orchestrator_ready",
        correlation_id = "bootstrap",
        providers,
        max_rounds = config.pipeline.max_rounds,
        llm_provider = %config.roles.llm,
        "orchestrator initialized"
    );

    Application { config, orchestrator }
}
