//! ICESat-2 processing requests.

use anyhow::{Context, Result, bail};
use serde::{Serialize, Serializer};
use serde_json::{Value, json};
use tracing::info;

use crate::client::Client;
use crate::pending::Pending;
use crate::record::{FieldValue, Record};
use crate::region::Coordinate;

/// Record types carrying ATL06 elevations.
const ATL06_RECORDS: [&str; 2] = ["atl06rec", "atl06rec-compact"];

/// Dataset the ATL06 algorithm reads its photons from.
const ATL03: &str = "ATL03";

/// ATL03 photon signal confidence (`cnf`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalConfidence {
    #[serde(rename = "atl03_tep")]
    Tep,
    #[serde(rename = "atl03_not_considered")]
    NotConsidered,
    #[serde(rename = "atl03_background")]
    Background,
    #[serde(rename = "atl03_within_10m")]
    Within10m,
    #[serde(rename = "atl03_low")]
    Low,
    #[serde(rename = "atl03_medium")]
    Medium,
    #[serde(rename = "atl03_high")]
    High,
}

/// Surface reference type (`srt`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceType {
    Dynamic = -1,
    Land = 0,
    Ocean = 1,
    SeaIce = 2,
    LandIce = 3,
    InlandWater = 4,
}

impl Serialize for SurfaceType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(*self as i32)
    }
}

/// Parameters of an ATL06 (land ice height) request.
///
/// Unset fields are left to the server defaults. Any `Serialize` value is
/// accepted by [`Client::atl06p`], so `serde_json::json!` works as well.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Atl06Parms {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srt: Option<SurfaceType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cnf: Option<SignalConfidence>,
    /// Minimum along-track spread (meters).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ats: Option<f64>,
    /// Minimum photon count per segment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cnt: Option<u32>,
    /// Segment length (meters).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub len: Option<f64>,
    /// Step distance (meters).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub res: Option<f64>,
    /// Maximum fit iterations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxi: Option<u32>,
    #[serde(rename = "H_min_win", skip_serializing_if = "Option::is_none")]
    pub h_min_win: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sigma_r_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poly: Option<Vec<Coordinate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t0: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t1: Option<String>,
}

impl Client {
    /// Runs ATL06 processing over `resources` and returns the elevations.
    ///
    /// With an empty `resources` list the ATL03 granules intersecting the
    /// `poly` parameter (between `t0` and `t1` when given) are found with
    /// [`Client::cmr`] first.
    ///
    /// ```no_run
    /// use sliderule::{Client, ClientConfig};
    /// use serde_json::json;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let client = Client::init(ClientConfig::new("localhost", None))?;
    /// let parms = json!({"cnf": "atl03_high", "ats": 20.0, "cnt": 10, "len": 40.0, "res": 20.0, "maxi": 1});
    /// let elevations = client.atl06p(&parms, &["ATL03_20181019065445_03150111_005_01.h5"])?;
    /// println!("{}", elevations.len());
    /// # Ok(())
    /// # }
    /// ```
    pub fn atl06p<P: Serialize>(
        &self,
        parms: &P,
        resources: &[impl AsRef<str>],
    ) -> Result<Vec<Record>> {
        let parms = serde_json::to_value(parms).context("failed to serialize atl06 parameters")?;
        let resources = if resources.is_empty() {
            self.query_resources(&parms)?
        } else {
            check_resources(resources)?
        };
        let rqst = json!({ "atl06": parms, "resources": resources });
        let rsps = self.source("atl06p", &rqst, true)?.into_records()?;
        let elevations = flatten_elevations(rsps);
        info!(
            resources = resources.len(),
            elevations = elevations.len(),
            "atl06p complete"
        );
        Ok(elevations)
    }

    /// [`Client::atl06p`] on a background worker; the caller does not block.
    pub fn atl06p_async<P: Serialize>(
        &self,
        parms: &P,
        resources: &[impl AsRef<str>],
    ) -> Pending<Vec<Record>> {
        let client = self.clone();
        let parms = serde_json::to_value(parms);
        let resources: Vec<String> = resources.iter().map(|r| r.as_ref().to_string()).collect();
        Pending::spawn(move || client.atl06p(&parms?, &resources))
    }

    fn query_resources(&self, parms: &Value) -> Result<Vec<String>> {
        let Some(poly) = parms.get("poly").filter(|p| !p.is_null()) else {
            bail!("no resources supplied and no poly region to search for them");
        };
        let poly: Vec<Coordinate> = serde_json::from_value(poly.clone())
            .context("poly must be a list of {lat, lon} points")?;
        let t0 = parms.get("t0").and_then(Value::as_str);
        let t1 = parms.get("t1").and_then(Value::as_str);

        let resources = self.cmr(ATL03, Some(&poly), t0, t1)?;
        if resources.is_empty() {
            bail!("no {} granules found for the requested region", ATL03);
        }
        Ok(resources)
    }
}

pub(crate) fn check_resources(resources: &[impl AsRef<str>]) -> Result<Vec<String>> {
    if resources.is_empty() {
        bail!("no resources supplied");
    }
    let mut out = Vec::with_capacity(resources.len());
    for r in resources {
        let r = r.as_ref().trim();
        if r.is_empty() {
            bail!("resource identifiers must be non-empty");
        }
        out.push(r.to_string());
    }
    Ok(out)
}

fn flatten_elevations(rsps: Vec<Record>) -> Vec<Record> {
    let mut elevations = Vec::new();
    for mut rec in rsps {
        if !ATL06_RECORDS.contains(&rec.rectype.as_str()) {
            continue;
        }
        match rec.fields.remove("elevation") {
            Some(FieldValue::Records(items)) => elevations.extend(items),
            Some(FieldValue::Record(item)) => elevations.push(item),
            _ => {}
        }
    }
    elevations
}
