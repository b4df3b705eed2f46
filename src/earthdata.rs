//! Granule search against NASA's Common Metadata Repository (CMR).
//!
//! Processing requests name their input files explicitly. When they don't,
//! the files intersecting a region and time span are looked up here.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{debug, info};

use crate::client::Client;
use crate::error::{fatal, format_http_error};
use crate::region::Coordinate;
use crate::util::urljoin;

pub const CMR_URL: &str = "https://cmr.earthdata.nasa.gov";
pub const DEFAULT_MAX_RESOURCES: usize = 300;

const CMR_PAGE_SIZE: u32 = 2000;
const DEFAULT_TIME_START: &str = "2018-01-01T00:00:00Z";
const SCROLL_ID: &str = "cmr-scroll-id";

#[derive(Debug, Clone, Copy, PartialEq)]
struct Dataset {
    provider: &'static str,
    version: Option<&'static str>,
    formats: &'static [&'static str],
}

fn dataset(short_name: &str) -> Result<Dataset> {
    let (provider, version, formats): (_, _, &'static [&'static str]) = match short_name {
        "ATL03" | "ATL06" | "ATL08" => ("NSIDC_ECS", Some("006"), &[".h5"]),
        "GEDI01_B" | "GEDI02_A" => ("LPDAAC_ECS", Some("002"), &[".h5"]),
        "GEDI02_B" => ("LPDAAC_ECS", Some("002"), &[".tiff"]),
        "GEDI_L3_LandSurface_Metrics_V2_1952" | "GEDI_L4A_AGB_Density_V2_1_2056" => {
            ("ORNL_CLOUD", None, &[".h5"])
        }
        "GEDI_L4B_Gridded_Biomass_2017" => ("ORNL_CLOUD", None, &[".tiff"]),
        other => bail!("Must supply a supported dataset: {}", other),
    };
    Ok(Dataset {
        provider,
        version,
        formats,
    })
}

#[derive(Debug, Default, Deserialize)]
struct SearchPage {
    #[serde(default)]
    feed: Feed,
}

#[derive(Debug, Default, Deserialize)]
struct Feed {
    #[serde(default)]
    entry: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: Option<String>,
    #[serde(default)]
    inherited: bool,
    rel: Option<String>,
    title: Option<String>,
}

impl Link {
    /// File name of a downloadable data link, if this is one.
    fn data_file(&self) -> Option<&str> {
        let href = self.href.as_deref()?;
        if self.inherited {
            return None;
        }
        if self.rel.as_deref().is_some_and(|rel| !rel.contains("data#")) {
            return None;
        }
        if self
            .title
            .as_deref()
            .is_some_and(|t| t.to_ascii_lowercase().contains("opendap"))
        {
            return None;
        }
        href.rsplit('/').next()
    }
}

/// Data file names of one search page, skipping names already in `seen`.
fn filter_urls(page: &SearchPage, formats: &[&str], seen: &mut HashSet<String>) -> Vec<String> {
    let mut urls = Vec::new();
    for link in page.feed.entry.iter().flat_map(|e| &e.links) {
        let Some(name) = link.data_file() else {
            continue;
        };
        if !seen.insert(name.to_string()) {
            continue;
        }
        if formats.iter().any(|ext| name.ends_with(ext)) {
            urls.push(name.to_string());
        }
    }
    urls
}

/// `lon,lat,lon,lat,...` as CMR expects it.
fn polygon_param(polygon: &[Coordinate]) -> String {
    polygon
        .iter()
        .flat_map(|c| [c.lon, c.lat])
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl Client {
    /// Lists the granules of `short_name` that intersect `polygon` within the
    /// time span (`YYYY-MM-DDTHH:MM:SSZ`; open-ended when `time_end` is `None`).
    ///
    /// Fails when more than the configured maximum number of resources
    /// (see [`Client::with_max_resources`]) is found.
    pub fn cmr(
        &self,
        short_name: &str,
        polygon: Option<&[Coordinate]>,
        time_start: Option<&str>,
        time_end: Option<&str>,
    ) -> Result<Vec<String>> {
        let ds = dataset(short_name)?;

        let mut query: Vec<(&str, String)> = vec![
            ("provider", ds.provider.to_string()),
            ("sort_key[]", "start_date".to_string()),
            ("sort_key[]", "producer_granule_id".to_string()),
            ("scroll", "true".to_string()),
            ("page_size", CMR_PAGE_SIZE.to_string()),
            ("short_name", short_name.to_string()),
        ];
        if let Some(version) = ds.version {
            query.push(("version", version.to_string()));
        }
        query.push((
            "temporal[]",
            format!(
                "{},{}",
                time_start.unwrap_or(DEFAULT_TIME_START),
                time_end.unwrap_or_default()
            ),
        ));
        if let Some(polygon) = polygon.filter(|p| !p.is_empty()) {
            query.push(("polygon", polygon_param(polygon)));
        }

        let url = urljoin(&self.cmr_url, "/search/granules.json");
        let mut scroll_id: Option<String> = None;
        let mut seen = HashSet::new();
        let mut resources = Vec::new();

        loop {
            let mut req = self.http.get(&url).query(&query).timeout(self.timeout);
            if let Some(id) = &scroll_id {
                req = req.header(SCROLL_ID, id);
            }
            debug!(url = %url, scroll = scroll_id.is_some(), "cmr request");

            let resp = req
                .send()
                .with_context(|| format!("could not connect to {}", url))?;
            let status = resp.status();
            let next_scroll = resp
                .headers()
                .get(SCROLL_ID)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let text = resp
                .text()
                .with_context(|| format!("failed to read CMR response from {}", url))?;
            if !status.is_success() {
                return Err(format_http_error(status, &url, &text));
            }

            let page: SearchPage = serde_json::from_str(&text)
                .with_context(|| format!("failed to parse CMR response from {}", url))?;
            let urls = filter_urls(&page, ds.formats, &mut seen);
            if urls.is_empty() {
                break;
            }
            resources.extend(urls);

            if scroll_id.is_none() {
                scroll_id = next_scroll;
            }
            if scroll_id.is_none() {
                break;
            }
        }

        if resources.len() > self.max_resources {
            return Err(fatal(format!(
                "Exceeded maximum requested resources: {} (current max is {})",
                resources.len(),
                self.max_resources
            )));
        }
        info!("Identified {} resources to process", resources.len());
        Ok(resources)
    }
}
