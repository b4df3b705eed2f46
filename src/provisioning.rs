use anyhow::{Context, Result, anyhow};
use reqwest::Method;
use serde_json::Value;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::client::{Callbacks, Client};
use crate::error::SlideruleError;

const MAX_CLUSTER_WAIT: Duration = Duration::from_secs(600);

#[derive(Debug, serde::Deserialize)]
struct OrgNodes {
    min_nodes: u32,
    max_nodes: u32,
}

impl Client {
    /// Requests `desired_nodes` for the organization's cluster (if given) and
    /// reports `(available, requested)` node counts.
    ///
    /// The request is clamped to the organization's limits. `time_to_live` is
    /// in minutes.
    pub fn update_available_servers(
        &self,
        desired_nodes: Option<u32>,
        time_to_live: Option<u32>,
    ) -> Result<(u32, u32)> {
        let mut requested = 0;

        if let Some(desired) = desired_nodes {
            let org = self
                .organization
                .as_deref()
                .ok_or_else(|| anyhow!("scaling the cluster requires an organization"))?;
            let token = self.access_token()?;
            requested = desired;

            match self.ps_call::<OrgNodes>(
                Method::GET,
                &format!("/api/org_num_nodes/{}/", org),
                token.as_deref(),
                None,
            ) {
                Ok(limits) => {
                    requested = desired.min(limits.max_nodes).max(limits.min_nodes);
                    if requested != desired {
                        info!("Provisioning system desired nodes overridden to {}", requested);
                    }
                }
                Err(e) => info!("Provisioning system status request returned error => {:#}", e),
            }

            let update = match time_to_live {
                Some(ttl) => self.ps_call::<Value>(
                    Method::POST,
                    &format!("/api/desired_org_num_nodes_ttl/{}/{}/{}/", org, requested, ttl),
                    token.as_deref(),
                    None,
                ),
                None => self.ps_call::<Value>(
                    Method::PUT,
                    &format!("/api/desired_org_num_nodes/{}/{}/", org, requested),
                    token.as_deref(),
                    None,
                ),
            };
            if let Err(e) = update {
                error!("Provisioning system update request error => {:#}", e);
            }
        }

        let status = self.request(
            "/discovery",
            "status",
            &serde_json::json!({ "service": "sliderule" }),
            false,
            &mut Callbacks::new(),
            true,
        );
        let available = match status {
            Ok(rsps) => {
                let nodes = rsps
                    .into_json()?
                    .get("nodes")
                    .and_then(Value::as_u64)
                    .context("discovery status has no node count")?;
                u32::try_from(nodes)
                    .with_context(|| format!("discovery status node count {} out of range", nodes))?
            }
            Err(e) => match e.downcast_ref::<SlideruleError>() {
                Some(SlideruleError::Fatal(_)) => 0,
                _ => return Err(e),
            },
        };

        Ok((available, requested))
    }

    /// Scales the cluster and waits until it reaches the requested capacity
    /// (or gives up after ten minutes).
    pub fn scaleout(&self, desired_nodes: Option<u32>, time_to_live: Option<u32>) -> Result<()> {
        let Some(desired) = desired_nodes else {
            return Ok(());
        };

        let start = Instant::now();
        let (mut available, requested) =
            self.update_available_servers(Some(desired), time_to_live)?;

        let mut scale_up_needed = false;
        while available < requested {
            scale_up_needed = true;
            info!(
                "Waiting while cluster scales to desired capacity (currently at {} nodes, desired is {} nodes)... {} seconds",
                available,
                desired,
                start.elapsed().as_secs()
            );
            thread::sleep(self.poll_interval);
            available = self.update_available_servers(None, None)?.0;
            if start.elapsed() > MAX_CLUSTER_WAIT {
                error!("Maximum time allowed waiting for cluster has been exceeded");
                break;
            }
        }

        if scale_up_needed {
            info!(
                "Cluster has reached capacity of {} nodes... {} seconds",
                available,
                start.elapsed().as_secs()
            );
        }
        Ok(())
    }
}
