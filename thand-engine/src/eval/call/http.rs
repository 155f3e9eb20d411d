//! Implementation of the built-in HTTP caller.

use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;
use reqwest::Method;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::ActivityInvocation;
use crate::CallRequest;
use crate::TaskPath;
use crate::WorkflowResult;
use crate::config::HttpConfig;
use crate::error::validation;
use crate::registry::CallHandler;

/// The output modes of the HTTP caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    /// The base64-encoded response body.
    Raw,
    /// The parsed response body.
    Content,
    /// The full response envelope, including the request echo.
    Response,
}

impl OutputMode {
    /// Parses an output mode argument.
    fn parse(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(Self::Raw),
            "content" => Ok(Self::Content),
            "response" => Ok(Self::Response),
            other => bail!("unsupported output mode `{other}`"),
        }
    }
}

/// Expands an RFC 6570 URI template using simple string expansion.
///
/// Only top-level identifiers are supported; a dotted name is looked up
/// verbatim, not traversed. Operators (`+`, `#`, `.`, `/`, `;`, `?`, `&`)
/// are rejected.
pub(crate) fn expand_uri_template(
    template: &str,
    resolve: impl Fn(&str) -> Option<String>,
) -> Result<String> {
    let mut expanded = String::with_capacity(template.len());
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '{' {
            expanded.push(c);
            continue;
        }

        let mut name = String::new();
        loop {
            match chars.next() {
                Some('}') => break,
                Some(c) => name.push(c),
                None => bail!("unterminated template expression in `{template}`"),
            }
        }

        if name.is_empty() {
            bail!("empty template expression in `{template}`");
        }

        if let Some(operator) = name.chars().next().filter(|c| "+#./;?&|!@".contains(*c)) {
            bail!(
                "unsupported template operator `{operator}` in `{{{name}}}`; only simple string \
                 expansion is supported"
            );
        }

        let value = resolve(&name)
            .ok_or_else(|| anyhow!("undefined template variable `{name}` in `{template}`"))?;
        expanded.push_str(&urlencoding::encode(&value));
    }

    Ok(expanded)
}

/// Converts a template variable value to its string form.
fn template_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Represents the built-in HTTP caller.
pub struct HttpCallHandler {
    /// The HTTP client used for requests.
    client: reqwest::Client,
}

impl HttpCallHandler {
    /// Constructs a new caller with the given configuration.
    pub fn new(config: HttpConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .expect("failed to build the HTTP client");

        Self { client }
    }

    /// Resolves a template variable against the call arguments and the task
    /// input.
    fn resolve<'a>(with: &'a IndexMap<String, Value>, input: &'a Value) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            with.get(name)
                .and_then(template_value)
                .or_else(|| input.get(name).and_then(template_value))
        }
    }
}

#[async_trait]
impl CallHandler for HttpCallHandler {
    async fn validate(&self, call: &CallRequest) -> WorkflowResult<()> {
        let reference = TaskPath::new("/functions/http");

        for required in ["method", "endpoint"] {
            match call.with.get(required) {
                Some(Value::String(_)) => {}
                Some(other) => {
                    return Err(validation(
                        format!("the `{required}` argument must be a string, found `{other}`"),
                        &reference,
                    ));
                }
                None => {
                    return Err(validation(
                        format!("the HTTP caller requires the `{required}` argument"),
                        &reference,
                    ));
                }
            }
        }

        if let Some(Value::String(output)) = call.with.get("output") {
            OutputMode::parse(output)
                .map_err(|e| validation(e.to_string(), &reference))?;
        }

        Ok(())
    }

    async fn execute(&self, invocation: ActivityInvocation) -> Result<Value> {
        let with = &invocation.call.with;

        let method = with
            .get("method")
            .and_then(Value::as_str)
            .context("missing `method` argument")?;
        let method = Method::from_bytes(method.to_uppercase().as_bytes())
            .with_context(|| format!("invalid HTTP method `{method}`"))?;

        let endpoint = with
            .get("endpoint")
            .and_then(Value::as_str)
            .context("missing `endpoint` argument")?;
        let endpoint = expand_uri_template(endpoint, Self::resolve(with, &invocation.input))?;
        let url = Url::parse(&endpoint).with_context(|| format!("invalid endpoint `{endpoint}`"))?;

        let mode = match with.get("output").and_then(Value::as_str) {
            Some(output) => OutputMode::parse(output)?,
            None => OutputMode::Content,
        };

        let mut request = self.client.request(method.clone(), url.clone());

        let mut sent_headers = Map::new();
        if let Some(Value::Object(headers)) = with.get("headers") {
            for (name, value) in headers {
                let value = value
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                sent_headers.insert(name.clone(), json!(value));
                request = request.header(name, value);
            }
        }

        if let Some(Value::Object(query)) = with.get("query") {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(name, value)| {
                    (
                        name.clone(),
                        value
                            .as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| value.to_string()),
                    )
                })
                .collect();
            request = request.query(&pairs);
        }

        if let Some(body) = with.get("body") {
            request = request.json(body);
        }

        debug!("HTTP {method} {url}");

        let response = request
            .send()
            .await
            .with_context(|| format!("request to `{url}` failed"))?;

        let status = response.status();
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            headers.insert(
                name.as_str().to_string(),
                json!(String::from_utf8_lossy(value.as_bytes())),
            );
        }

        let json_body = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("json"))
            .unwrap_or(false);

        let bytes = response.bytes().await.context("failed to read response body")?;

        let content = if bytes.is_empty() {
            None
        } else if json_body {
            serde_json::from_slice(&bytes).ok()
        } else {
            Some(json!(String::from_utf8_lossy(&bytes)))
        };

        match mode {
            OutputMode::Raw => Ok(json!(BASE64.encode(&bytes))),
            OutputMode::Content => {
                if !status.is_success() {
                    bail!("request to `{url}` returned status {status}");
                }
                Ok(content.unwrap_or(Value::Null))
            }
            OutputMode::Response => {
                let mut request_echo = json!({
                    "method": method.as_str(),
                    "uri": url.to_string(),
                });
                if !sent_headers.is_empty() {
                    request_echo["headers"] = Value::Object(sent_headers);
                }

                let mut envelope = json!({
                    "request": request_echo,
                    "statusCode": status.as_u16(),
                    "headers": Value::Object(headers),
                });
                if let Some(content) = content {
                    envelope["content"] = content;
                }

                Ok(envelope)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn simple_expansion() {
        let resolve = |name: &str| match name {
            "petId" => Some("42".to_string()),
            "user.id" => Some("alice".to_string()),
            _ => None,
        };

        assert_eq!(
            expand_uri_template("https://example.com/pets/{petId}", resolve)
                .expect("should expand"),
            "https://example.com/pets/42"
        );

        // Dotted names are looked up verbatim, not traversed.
        assert_eq!(
            expand_uri_template("https://example.com/users/{user.id}", resolve)
                .expect("should expand"),
            "https://example.com/users/alice"
        );

        assert_eq!(
            expand_uri_template("https://example.com/plain", resolve).expect("should expand"),
            "https://example.com/plain"
        );
    }

    #[test]
    fn expansion_percent_encodes() {
        let resolve = |_: &str| Some("a value/with reserved".to_string());
        assert_eq!(
            expand_uri_template("https://example.com/{q}", resolve).expect("should expand"),
            "https://example.com/a%20value%2Fwith%20reserved"
        );
    }

    #[test]
    fn operators_are_rejected() {
        let resolve = |_: &str| Some("x".to_string());
        for template in ["{+path}", "{#frag}", "{?query}", "{/seg}"] {
            assert!(
                expand_uri_template(template, resolve).is_err(),
                "`{template}` should be rejected"
            );
        }
    }

    #[test]
    fn undefined_variables_are_an_error() {
        let resolve = |_: &str| None;
        assert!(expand_uri_template("https://example.com/{missing}", resolve).is_err());
    }
}
