use async_trait::async_trait;
use serde::Serialize;

use crate::{chain::ChainClient, error::report_message};

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_height: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catching_up: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Something the health endpoint can ask whether the service is healthy.
#[async_trait]
pub trait HealthSource: Send + Sync + 'static {
    async fn check(&self) -> HealthReport;
}

/// Always healthy.
#[derive(Debug, Clone, Default)]
pub struct StaticHealth;

/// Healthy if the chain node answers the status probe.
#[derive(Clone)]
pub struct ChainHealth {
    client: ChainClient,
}

impl ChainHealth {
    pub fn new(client: ChainClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthSource for StaticHealth {
    async fn check(&self) -> HealthReport {
        HealthReport::healthy()
    }
}

#[async_trait]
impl HealthSource for ChainHealth {
    async fn check(&self) -> HealthReport {
        match self.client.probe().await {
            Ok(health) => HealthReport {
                healthy: true,
                latest_height: Some(health.latest_height),
                catching_up: Some(health.catching_up),
                message: None,
            },
            Err(err) => HealthReport {
                healthy: false,
                latest_height: None,
                catching_up: None,
                message: Some(report_message(&err)),
            },
        }
    }
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            latest_height: None,
            catching_up: None,
            message: None,
        }
    }
}
