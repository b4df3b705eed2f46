use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};
use tracing::warn;

use crate::client::Client;
use crate::util::parse_version;

impl Client {
    /// Version information of the running servers, plus this client and organization.
    pub fn get_version(&self) -> Result<Value> {
        let mut rsps = self.source("version", &json!({}), false)?.into_json()?;
        let obj = rsps
            .as_object_mut()
            .ok_or_else(|| anyhow!("version response is not an object"))?;
        obj.insert(
            "client".to_string(),
            json!({ "version": format!("v{}", env!("CARGO_PKG_VERSION")) }),
        );
        obj.insert("organization".to_string(), json!(self.organization));
        Ok(rsps)
    }

    /// Checks this client against the server and the named plugins.
    ///
    /// Fails when a major version differs. Returns `false` when the server or
    /// a plugin is a newer minor version than the client.
    pub fn check_version(&self, plugins: &[&str]) -> Result<bool> {
        let info = self.get_version()?;
        let version_of = |entity: &str| -> Result<(u32, u32, u32)> {
            let v = info
                .get(entity)
                .and_then(|e| e.get("version"))
                .and_then(Value::as_str)
                .with_context(|| format!("no version reported for {}", entity))?;
            parse_version(v).with_context(|| format!("unparsable {} version [{}]", entity, v))
        };

        let client = version_of("client")?;
        let server = version_of("server")?;
        let mut pkgs = Vec::with_capacity(plugins.len());
        for pkg in plugins {
            pkgs.push((*pkg, version_of(*pkg)?));
        }

        if server.0 != client.0 {
            bail!(
                "Client (version {:?}) is incompatible with the server (version {:?})",
                client,
                server
            );
        }
        for (pkg, v) in &pkgs {
            if v.0 != client.0 {
                bail!(
                    "Client (version {:?}) is incompatible with the {} plugin (version {:?})",
                    client,
                    pkg,
                    v
                );
            }
        }

        let mut status = true;
        if server.1 > client.1 {
            warn!(
                "Client (version {:?}) is out of date with the server (version {:?})",
                client, server
            );
            status = false;
        }
        for (pkg, v) in &pkgs {
            if v.1 > client.1 {
                warn!(
                    "Client (version {:?}) is out of date with the {} plugin (version {:?})",
                    client, pkg, v
                );
                status = false;
            }
        }
        Ok(status)
    }

    /// Converts seconds since the GPS epoch to a UTC date string via the server.
    pub fn gps2utc(&self, gps_time: f64) -> Result<String> {
        let rqst = json!({
            "time": (gps_time * 1000.0) as i64,
            "input": "GPS",
            "output": "DATE",
        });
        let rsps = self.source("time", &rqst, false)?.into_json()?;
        rsps.get("time")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("time response has no date string"))
    }
}
