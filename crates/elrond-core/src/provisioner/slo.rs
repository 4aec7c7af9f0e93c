//! SLO gate over a Prometheus-compatible query endpoint.
//!
//! The gate evaluates a multi-window multi-burn-rate error budget
//! expression per installation group. Any returned series carrying an
//! `slo_service` label is treated as a firing alert and fails the gate
//! closed with the name of the firing service.

use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::model::InstallationGroup;

use super::ProvisionerError;

/// Per-attempt query timeout.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum query attempts before the gate gives up.
const MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: QueryData,
    #[serde(default)]
    warnings: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<QuerySeries>,
}

#[derive(Debug, Deserialize)]
struct QuerySeries {
    #[serde(default)]
    metric: std::collections::BTreeMap<String, String>,
}

/// Queries SLO burn rates for installation groups under release.
pub struct SloGate {
    endpoint: String,
    client: reqwest::Client,
}

impl SloGate {
    /// Creates a gate querying the given Prometheus-compatible endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying HTTP client cannot be
    /// constructed.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ProvisionerError> {
        let client = reqwest::Client::builder().timeout(QUERY_TIMEOUT).build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    /// Evaluates the error budget expression for each group. Fails
    /// closed with [`ProvisionerError::SloBreach`] when any series
    /// carries an `slo_service` label.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionerError::SloBreach`] on a firing alert, or a
    /// query error after all retries are exhausted.
    pub async fn check_groups(&self, groups: &[InstallationGroup]) -> Result<(), ProvisionerError> {
        for group in groups {
            let expression = burn_rate_expression(&group.name, &group.provisioner_group_id);
            let series = self.query_with_retries(&expression).await?;

            for metric in &series {
                if let Some(service) = metric.metric.get("slo_service") {
                    return Err(ProvisionerError::SloBreach {
                        service: service.clone(),
                    });
                }
            }

            info!(
                installation_group = %group.id,
                "SLO metric checks looking good"
            );
        }

        Ok(())
    }

    async fn query_with_retries(
        &self,
        expression: &str,
    ) -> Result<Vec<QuerySeries>, ProvisionerError> {
        let mut last_error = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
            }

            match self.query_once(expression).await {
                Ok(series) => return Ok(series),
                Err(err) => {
                    warn!(attempt, error = %err, "SLO query failed, retrying");
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ProvisionerError::Other("SLO query failed".into())))
    }

    async fn query_once(&self, expression: &str) -> Result<Vec<QuerySeries>, ProvisionerError> {
        let url = format!("{}/api/v1/query", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(&[("query", expression)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProvisionerError::Api {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let body: QueryResponse = response.json().await?;
        if !body.warnings.is_empty() {
            warn!(warnings = ?body.warnings, "SLO query returned partial results");
        }
        if body.status != "success" {
            return Err(ProvisionerError::Other(format!(
                "SLO query status {}",
                body.status
            )));
        }

        Ok(body.data.result)
    }
}

/// The multi-window multi-burn-rate expression for one installation
/// group, parameterized by its name and provisioner group ID.
fn burn_rate_expression(group_name: &str, provisioner_group_id: &str) -> String {
    let service = format!("{group_name}-ring-{provisioner_group_id}");
    format!(
        "((slo:sli_error:ratio_rate5m{{slo_service='{service}'}} > (14.4 * 0.005)) \
         and ignoring(slo_window)(slo:sli_error:ratio_rate1h{{slo_service='{service}'}} > (14.4 * 0.005))) \
         or ignoring(slo_window)((slo:sli_error:ratio_rate30m{{slo_service='{service}'}} > (6 * 0.005)) \
         and ignoring(slo_window)(slo:sli_error:ratio_rate6h{{slo_service='{service}'}} > (3.3 * 0.005)))"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expression_embeds_group_and_provisioner_id() {
        let expression = burn_rate_expression("payments", "pg1");
        assert!(expression.contains("slo_service='payments-ring-pg1'"));
        assert!(expression.contains("ratio_rate5m"));
        assert!(expression.contains("ratio_rate6h"));
    }

    #[test]
    fn firing_series_parse() {
        let raw = r#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"slo_service": "payments-ring-pg1"}, "value": [0, "1"]}
                ]
            }
        }"#;
        let parsed: QueryResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.status, "success");
        assert_eq!(
            parsed.data.result[0].metric.get("slo_service").unwrap(),
            "payments-ring-pg1"
        );
    }
}
