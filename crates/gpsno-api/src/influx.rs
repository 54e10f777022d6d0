// ── InfluxDB v2 writer ──
//
// Posts line protocol to `/api/v2/write`. Authentication is the v2 token
// scheme (`Authorization: Token <token>`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use crate::error::Error;
use crate::sink::{Point, TimeSeriesSink};

/// Connection settings for an InfluxDB v2 server.
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    /// Server root, e.g. `http://localhost:8086`.
    pub url: Url,
    pub org: String,
    pub bucket: String,
    pub token: SecretString,
    pub timeout: Duration,
}

/// Writes points straight to InfluxDB, one HTTP request per call.
#[derive(Debug, Clone)]
pub struct InfluxWriter {
    http: reqwest::Client,
    base_url: Url,
    write_url: Url,
    token: SecretString,
}

#[derive(Debug, Deserialize)]
struct Health {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

impl InfluxWriter {
    pub fn new(config: &InfluxConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Self::with_client(http, config)
    }

    /// Build a writer around an existing HTTP client.
    pub fn with_client(http: reqwest::Client, config: &InfluxConfig) -> Result<Self, Error> {
        let mut write_url = config.url.join("api/v2/write")?;
        write_url
            .query_pairs_mut()
            .append_pair("org", &config.org)
            .append_pair("bucket", &config.bucket)
            .append_pair("precision", "ns");

        Ok(Self {
            http,
            base_url: config.url.clone(),
            write_url,
            token: config.token.clone(),
        })
    }

    /// `GET /health`; fails unless the server reports `"pass"`.
    pub async fn health(&self) -> Result<(), Error> {
        let resp = self.http.get(self.base_url.join("health")?).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::SinkRejected {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let health: Health = resp.json().await?;
        if health.status == "pass" {
            Ok(())
        } else {
            Err(Error::SinkRejected {
                status: status.as_u16(),
                body: health
                    .message
                    .unwrap_or_else(|| format!("health status '{}'", health.status)),
            })
        }
    }
}

#[async_trait]
impl TimeSeriesSink for InfluxWriter {
    async fn write(&self, points: &[Point]) -> Result<(), Error> {
        if points.is_empty() {
            return Ok(());
        }

        let body = points
            .iter()
            .map(Point::to_line_protocol)
            .collect::<Vec<_>>()
            .join("\n");

        let resp = self
            .http
            .post(self.write_url.clone())
            .header(
                AUTHORIZATION,
                format!("Token {}", self.token.expose_secret()),
            )
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            tracing::trace!(points = points.len(), "wrote points to InfluxDB");
            Ok(())
        } else {
            Err(Error::SinkRejected {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            })
        }
    }
}
