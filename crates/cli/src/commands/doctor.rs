use dialectic_core::config::{AppConfig, LoadOptions, ProviderKind};
use serde::Serialize;

use super::CommandResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    if json_output {
        return CommandResult::json(exit_code, &report);
    }

    CommandResult { exit_code, output: render_human(&report) }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_credentials("llm_credentials", &config, &config.roles.llm));
            checks.push(check_credentials(
                "deep_research_credentials",
                &config,
                &config.roles.deep_research,
            ));
            checks.push(check_search_routes(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["llm_credentials", "deep_research_credentials", "search_routes"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

/// Sessions routed to a provider without a key abort on their first call.
fn check_credentials(name: &'static str, config: &AppConfig, provider_id: &str) -> DoctorCheck {
    match config.provider(provider_id) {
        Some(provider) if provider.has_api_key() => DoctorCheck {
            name,
            status: CheckStatus::Pass,
            details: format!("provider `{provider_id}` has an api key"),
        },
        Some(_) => DoctorCheck {
            name,
            status: CheckStatus::Fail,
            details: format!(
                "provider `{provider_id}` has no api key; set providers.{provider_id}.api_key"
            ),
        },
        None => DoctorCheck {
            name,
            status: CheckStatus::Fail,
            details: format!("provider `{provider_id}` is not configured"),
        },
    }
}

fn check_search_routes(config: &AppConfig) -> DoctorCheck {
    let mut problems = Vec::new();
    for route in &config.roles.search {
        match config.provider(&route.provider) {
            Some(provider) if provider.kind == ProviderKind::JsonSearch => {}
            Some(provider) => problems.push(format!(
                "{} -> `{}` is {}, expected json_search",
                route.channel.as_str(),
                route.provider,
                provider.kind.as_str()
            )),
            None => problems.push(format!(
                "{} -> `{}` is not configured",
                route.channel.as_str(),
                route.provider
            )),
        }
    }

    if config.roles.search.is_empty() {
        return DoctorCheck {
            name: "search_routes",
            status: CheckStatus::Fail,
            details: "no search channels are routed; every search would return zero results"
                .to_string(),
        };
    }

    if problems.is_empty() {
        DoctorCheck {
            name: "search_routes",
            status: CheckStatus::Pass,
            details: format!("{} search channel(s) routed", config.roles.search.len()),
        }
    } else {
        DoctorCheck { name: "search_routes", status: CheckStatus::Fail, details: problems.join("; ") }
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}
