// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::debug;

use crate::cfg::config::LookupConfig;

const GEOCODE_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";
const STATIC_MAP_URL: &str = "https://maps.googleapis.com/maps/api/staticmap";

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    #[serde(default)]
    types: Vec<String>,
    formatted_address: String,
}

/// HTTP clients for the two external services the pipeline enriches from.
/// One reused `reqwest::Client` per service concern; each request runs
/// under its own configured timeout.
#[derive(Debug)]
pub struct GeoLookup {
    client: reqwest::Client,
    api_key: String,
    geocode_timeout: Duration,
    map_timeout: Duration,
}

impl GeoLookup {
    pub fn new(cfg: &LookupConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("trackerd/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            api_key: cfg.google_api_key.clone(),
            geocode_timeout: cfg.geocode_http_timeout,
            map_timeout: cfg.map_http_timeout,
        })
    }

    /// Reverse-geocode a coordinate into a formatted street address.
    /// Prefers a `street_address` result, falls back to the first result.
    pub async fn reverse_geocode(&self, lat: f64, lon: f64) -> Result<String> {
        let mut query: Vec<(&str, String)> = vec![("latlng", format!("{lat:.6},{lon:.6}"))];
        if !self.api_key.is_empty() {
            query.push(("key", self.api_key.clone()));
        }

        let resp = self
            .client
            .get(GEOCODE_URL)
            .query(&query)
            .timeout(self.geocode_timeout)
            .send()
            .await
            .context("geocode request")?;
        if !resp.status().is_success() {
            bail!("geocode service returned {}", resp.status());
        }

        let body: GeocodeResponse = resp.json().await.context("geocode response body")?;
        if body.status != "OK" {
            bail!("geocode status {}", body.status);
        }

        let best = body
            .results
            .iter()
            .find(|r| r.types.iter().any(|t| t == "street_address"))
            .or_else(|| body.results.first())
            .context("geocode reply had no results")?;

        debug!(lat, lon, address = %best.formatted_address, "reverse geocoded");
        Ok(best.formatted_address.clone())
    }

    /// Fetch one static map tile as PNG bytes.
    pub async fn fetch_static_map(
        &self,
        lat: f64,
        lon: f64,
        zoom: u8,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>> {
        let center = format!("{lat:.6},{lon:.6}");
        let mut query: Vec<(&str, String)> = vec![
            ("center", center.clone()),
            ("zoom", zoom.to_string()),
            ("size", format!("{width}x{height}")),
            ("format", "png".to_string()),
            ("markers", center),
        ];
        if !self.api_key.is_empty() {
            query.push(("key", self.api_key.clone()));
        }

        let resp = self
            .client
            .get(STATIC_MAP_URL)
            .query(&query)
            .timeout(self.map_timeout)
            .send()
            .await
            .context("static map request")?;
        if !resp.status().is_success() {
            bail!("static map service returned {}", resp.status());
        }

        let bytes = resp.bytes().await.context("static map body")?;
        Ok(bytes.to_vec())
    }
}
