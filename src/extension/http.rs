//! HTTP requests through `reqwest`
//!
//! The request URL is built from the host name and the `http` protocol
//! configuration:
//!
//! ```json
//! { "http": { "port": 8080, "https": false, "username": "admin", "password": "secret" } }
//! ```
//!
//! The response body is kept as the table's raw data (for Json2Csv/Xml2Csv) and
//! also parsed as `;` separated lines.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{instrument, trace};
use url::Url;

use crate::config::HostConfiguration;
use crate::connector::{Criterion, CriterionType, HttpMethod, Source, SourceKind, SourceType};
use crate::error::{EngineError, EngineResult};
use crate::table::SourceTable;

use super::{CriterionTestResult, ProtocolExtension};

const PROTOCOL: &str = "http";

/// Decoded `http` protocol configuration
#[derive(Debug, Clone, Deserialize)]
struct HttpConfiguration {
    #[serde(default)]
    https: bool,

    #[serde(default)]
    port: Option<u16>,

    #[serde(default)]
    username: Option<String>,

    #[serde(default)]
    password: Option<String>,
}

impl HttpConfiguration {
    fn from_host(host: &HostConfiguration) -> EngineResult<Self> {
        let value = host
            .protocol(PROTOCOL)
            .ok_or_else(|| EngineError::MissingConfiguration(PROTOCOL.to_string()))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    fn url(&self, hostname: &str, path: &str) -> EngineResult<Url> {
        let scheme = if self.https { "https" } else { "http" };
        let mut base = Url::parse(&format!("{scheme}://{hostname}"))?;
        if let Some(port) = self.port {
            base.set_port(Some(port))
                .map_err(|_| EngineError::Protocol(format!("cannot set port on {base}")))?;
        }
        Ok(base.join(path)?)
    }
}

/// One parsed request, shared by sources and criteria
struct HttpRequest<'a> {
    method: HttpMethod,
    path: &'a str,
    header: Option<&'a str>,
    body: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct HttpExtension {
    client: reqwest::Client,
}

impl HttpExtension {
    pub fn new() -> Self {
        Self::default()
    }

    async fn send(&self, request: HttpRequest<'_>, host: &HostConfiguration) -> EngineResult<String> {
        let config = HttpConfiguration::from_host(host)?;
        let url = config.url(&host.hostname, request.path)?;
        trace!("{:?} {url}", request.method);

        let mut builder = self.client.request(request.method.as_reqwest(), url);
        if let Some(username) = &config.username {
            builder = builder.basic_auth(username, config.password.as_deref());
        }
        for (name, value) in request.header.into_iter().flat_map(parse_headers) {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body.to_string());
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(EngineError::Protocol(format!("HTTP error: {}", response.status())));
        }
        Ok(response.text().await?)
    }
}

/// `Name: value` lines
fn parse_headers(header: &str) -> impl Iterator<Item = (&str, &str)> {
    header.lines().filter_map(|line| {
        let (name, value) = line.split_once(':')?;
        let name = name.trim();
        (!name.is_empty()).then_some((name, value.trim()))
    })
}

#[async_trait]
impl ProtocolExtension for HttpExtension {
    fn identifier(&self) -> &'static str {
        "http"
    }

    fn is_valid_configuration(&self, protocol: &str, configuration: &serde_json::Value) -> bool {
        protocol.eq_ignore_ascii_case(PROTOCOL)
            && serde_json::from_value::<HttpConfiguration>(configuration.clone()).is_ok()
    }

    fn supported_sources(&self) -> &[SourceType] {
        &[SourceType::Http]
    }

    fn supported_criteria(&self) -> &[CriterionType] {
        &[CriterionType::Http]
    }

    #[instrument(skip_all, fields(host = %host.hostname, source = %source.key))]
    async fn process_source(
        &self,
        source: &Source,
        _connector_id: &str,
        host: &HostConfiguration,
    ) -> EngineResult<SourceTable> {
        let SourceKind::Http {
            method,
            path,
            header,
            body,
        } = &source.kind
        else {
            return Err(EngineError::Unsupported {
                extension: "http",
                variant: source.source_type().to_string(),
            });
        };

        let request = HttpRequest {
            method: *method,
            path,
            header: header.as_deref(),
            body: body.as_deref(),
        };
        let text = self.send(request, host).await?;
        Ok(SourceTable::from_raw(text))
    }

    async fn process_criterion(
        &self,
        criterion: &Criterion,
        _connector_id: &str,
        host: &HostConfiguration,
    ) -> CriterionTestResult {
        let Criterion::Http {
            method,
            path,
            header,
            body,
            expected_result,
        } = criterion
        else {
            return CriterionTestResult::failure(
                format!("http cannot test {}", criterion.criterion_type()),
                None,
            );
        };

        let description = format!("HTTP {method:?} {path}");
        let request = HttpRequest {
            method: *method,
            path,
            header: header.as_deref(),
            body: body.as_deref(),
        };
        match self.send(request, host).await {
            Ok(text) => CriterionTestResult::from_output(&description, text, expected_result.as_deref()),
            Err(e) => CriterionTestResult::failure(format!("{description} failed: {e}"), None),
        }
    }

    /// Up when the web server answers at all, whatever the status
    async fn health_check(&self, host: &HostConfiguration) -> Option<bool> {
        let config = HttpConfiguration::from_host(host).ok()?;
        let url = config.url(&host.hostname, "/").ok()?;
        let up = self.client.get(url).send().await.is_ok();
        trace!("http health check on {}: {up}", host.hostname);
        Some(up)
    }
}
