//! REST callout builder
//!
//! ```yaml
//! builder: rest
//! builder_spec:
//!   url: https://scores.internal/v1/users/{entity_id}
//!   method: GET
//!   headers: { authorization: "Bearer ..." }
//! ```
//!
//! The JSON response goes to the feature's program when one is registered
//! and is otherwise converted to the feature's primitive.

use super::compute::{run_program, served_fresh, ProgramRegistry};
use super::{compute_stage, FeatureBuilder};
use crate::engine::EngineHandle;
use crate::feature::MiddlewareBundle;
use crate::pipeline::{Exchange, Middleware, Next};
use async_trait::async_trait;
use kestrel_core::{Error, FeatureDescriptor, Payload, Result, SharedClock, Value};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
pub struct RestSpec {
    /// `{entity_id}` is replaced by the requested entity
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

pub struct Rest {
    programs: Arc<ProgramRegistry>,
}

impl Rest {
    pub fn new(programs: Arc<ProgramRegistry>) -> Self {
        Self { programs }
    }
}

impl FeatureBuilder for Rest {
    fn apply(&self, fd: &FeatureDescriptor, bundle: &mut MiddlewareBundle, engine: &EngineHandle) -> Result<()> {
        if fd.is_windowed() {
            return Err(Error::invalid_feature(&fd.fqn, "aggregation is not supported by the rest builder"));
        }
        let spec: RestSpec = serde_json::from_value(fd.builder_spec.clone())
            .map_err(|e| Error::invalid_feature(&fd.fqn, format!("invalid rest spec: {}", e)))?;
        let method = Method::from_bytes(spec.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::invalid_feature(&fd.fqn, format!("invalid HTTP method '{}'", spec.method)))?;

        let mut headers = HeaderMap::new();
        for (k, v) in &spec.headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|_| Error::invalid_feature(&fd.fqn, format!("invalid header name '{}'", k)))?;
            let value = HeaderValue::from_str(v)
                .map_err(|_| Error::invalid_feature(&fd.fqn, format!("invalid value for header '{}'", k)))?;
            headers.insert(name, value);
        }

        let timeout = match fd.timeout.mul_f64(0.8) {
            t if t.is_zero() => DEFAULT_TIMEOUT,
            t => t,
        };
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {}", e)))?;

        bundle.add(
            compute_stage(fd),
            0,
            Arc::new(RestCall {
                url: spec.url,
                body: spec.body,
                method,
                client,
                programs: self.programs.clone(),
                clock: engine.upgrade()?.clock().clone(),
                engine: engine.clone(),
            }),
        );
        Ok(())
    }
}

struct RestCall {
    url: String,
    body: Option<String>,
    method: Method,
    client: Client,
    programs: Arc<ProgramRegistry>,
    engine: EngineHandle,
    clock: SharedClock,
}

impl RestCall {
    async fn fetch(&self, entity_id: &str) -> Result<serde_json::Value> {
        let url = self.url.replace("{entity_id}", entity_id);
        let mut request = self.client.request(self.method.clone(), &url);
        if let Some(body) = &self.body {
            request = request.body(body.clone());
        }
        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::internal(format!("request to {} failed: {}", url, e)))?;
        response
            .json()
            .await
            .map_err(|e| Error::internal(format!("response from {} is not JSON: {}", url, e)))
    }
}

#[async_trait]
impl Middleware for RestCall {
    fn name(&self) -> &str {
        "rest"
    }

    async fn handle(&self, ex: &mut Exchange, next: Next<'_>) -> Result<()> {
        if served_fresh(ex) {
            return next.run(ex).await;
        }
        let response = ex.ctx.guard(self.fetch(&ex.entity_id)).await?;
        match self.programs.get(&ex.fd.fqn) {
            Some(program) => run_program(program.as_ref(), ex, Some(&response), &self.engine, &self.clock).await?,
            None => {
                let payload = Payload::from_json(&response, ex.fd.primitive)?;
                ex.value = Some(Value::new(payload, self.clock.now()).fresh(true));
            }
        }
        next.run(ex).await
    }
}
