use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::{
    config::Settings,
    credential::Credential,
    error::GatewayError,
    models::{Completion, Message, ModelDescriptor, Pricing, Usage},
    telemetry,
};

/** \brief 缺失 provider 时的占位值。 */
pub const UNKNOWN_PROVIDER: &str = "unknown";

/**
 * \brief 网关抽象：模型目录与单次补全。测试执行流程只依赖该接口。
 */
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /**
     * \brief 拉取模型目录。
     */
    async fn list_models(&self, credential: &Credential)
        -> Result<Vec<ModelDescriptor>, GatewayError>;

    /**
     * \brief 发送一次补全请求，不重试。
     */
    async fn complete(
        &self,
        credential: &Credential,
        model_id: &str,
        messages: &[Message],
    ) -> Result<Completion, GatewayError>;
}

/**
 * \brief 基于 reqwest 的网关客户端。
 */
#[derive(Debug, Clone)]
pub struct GatewayClient {
    base_url: String,
    referer: HeaderValue,
    title: HeaderValue,
    http: reqwest::Client,
}

impl GatewayClient {
    /**
     * \brief 构造客户端；Referer 与 Title 在这里校验，非法取值视为配置错误而非鉴权失败。
     */
    pub fn new(settings: &Settings) -> Result<Self, GatewayError> {
        Ok(Self {
            base_url: settings.gateway_url.trim_end_matches('/').to_string(),
            referer: setting_header("referer", &settings.referer)?,
            title: setting_header("app_title", &settings.app_title)?,
            http: reqwest::Client::builder().build()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self, credential: &Credential) -> Result<HeaderMap, GatewayError> {
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
            .map_err(GatewayError::InvalidCredential)?;
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, bearer);
        headers.insert("http-referer", self.referer.clone());
        headers.insert("x-title", self.title.clone());
        Ok(headers)
    }
}

fn setting_header(name: &'static str, value: &str) -> Result<HeaderValue, GatewayError> {
    HeaderValue::from_str(value).map_err(|source| GatewayError::InvalidSetting { name, source })
}

#[async_trait]
impl ModelGateway for GatewayClient {
    async fn list_models(
        &self,
        credential: &Credential,
    ) -> Result<Vec<ModelDescriptor>, GatewayError> {
        let url = format!("{}/models", self.base_url);
        let resp = self
            .http
            .get(url)
            .headers(self.headers(credential)?)
            .send()
            .await?;
        let v: Value = check_status(resp).await?.json().await?;
        Ok(parse_model_catalog(&v))
    }

    async fn complete(
        &self,
        credential: &Credential,
        model_id: &str,
        messages: &[Message],
    ) -> Result<Completion, GatewayError> {
        let url = format!("{}/chat/completions", self.base_url);
        let wire: Vec<_> = messages.iter().map(Message::to_wire).collect();
        let body = json!({
            "model": model_id,
            "messages": wire,
        });

        let resp = self
            .http
            .post(url)
            .headers(self.headers(credential)?)
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;
        let v: Value = check_status(resp).await?.json().await?;
        parse_completion(&v)
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let status = status.as_u16();
    if status == 401 || status == 403 {
        Err(GatewayError::Auth { status, body })
    } else {
        Err(GatewayError::Status { status, body })
    }
}

/**
 * \brief 容错解析模型目录：缺失字段取默认值，缺少 id 的条目跳过，重复 id 只保留第一条。
 */
pub fn parse_model_catalog(v: &Value) -> Vec<ModelDescriptor> {
    let Some(items) = v.get("data").and_then(|d| d.as_array()) else {
        telemetry::log_error("gateway.models", &format!("unexpected catalog payload: {}", v));
        return Vec::new();
    };
    let mut seen = HashSet::new();
    items
        .iter()
        .filter_map(parse_model_entry)
        .filter(|model| {
            let fresh = seen.insert(model.id.clone());
            if !fresh {
                telemetry::log_event(
                    "gateway.models",
                    &format!("duplicate id skipped: {}", model.id),
                );
            }
            fresh
        })
        .collect()
}

fn parse_model_entry(item: &Value) -> Option<ModelDescriptor> {
    let id = item
        .get("id")
        .and_then(|s| s.as_str())
        .filter(|s| !s.is_empty())?
        .to_string();
    let name = non_empty_str(item.get("name")).unwrap_or_else(|| id.clone());
    let provider = item
        .get("provider")
        .and_then(|p| non_empty_str(Some(p)).or_else(|| non_empty_str(p.get("name"))))
        .unwrap_or_else(|| UNKNOWN_PROVIDER.to_string());
    let capabilities = item
        .get("capabilities")
        .and_then(|c| c.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|c| c.as_str())
                .map(|c| c.to_string())
                .collect()
        })
        .unwrap_or_default();
    let description = non_empty_str(item.get("description"));
    let pricing = item.get("pricing");
    let pricing = Pricing {
        prompt: rate(pricing.and_then(|p| p.get("prompt"))),
        completion: rate(pricing.and_then(|p| p.get("completion"))),
    };
    Some(ModelDescriptor {
        id,
        name,
        provider,
        capabilities,
        description,
        pricing: Some(pricing),
    })
}

fn non_empty_str(v: Option<&Value>) -> Option<String> {
    v.and_then(|s| s.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
}

fn rate(v: Option<&Value>) -> f64 {
    match v {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    }
}

/**
 * \brief 从补全响应中取出首个回复与用量。
 */
pub fn parse_completion(v: &Value) -> Result<Completion, GatewayError> {
    let content = v
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| GatewayError::Payload(format!("missing choices[0].message: {}", v)))?
        .to_string();
    let usage = v
        .get("usage")
        .cloned()
        .and_then(|u| serde_json::from_value::<Usage>(u).ok())
        .unwrap_or_default();
    Ok(Completion { content, usage })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_defaults_missing_fields() {
        let v = json!({
            "data": [{"id": "m1", "name": null, "provider": null, "pricing": null}]
        });
        let models = parse_model_catalog(&v);
        assert_eq!(
            models,
            vec![ModelDescriptor {
                id: "m1".into(),
                name: "m1".into(),
                provider: "unknown".into(),
                capabilities: vec![],
                description: None,
                pricing: Some(Pricing {
                    prompt: 0.0,
                    completion: 0.0
                }),
            }]
        );
    }

    #[test]
    fn test_catalog_reads_full_entry() {
        let v = json!({
            "data": [{
                "id": "openai/gpt-4o",
                "name": "GPT-4o",
                "provider": {"name": "OpenAI"},
                "capabilities": ["chat", 7, "vision"],
                "description": "flagship",
                "pricing": {"prompt": 0.005, "completion": "0.015"}
            }]
        });
        let model = &parse_model_catalog(&v)[0];
        assert_eq!(model.name, "GPT-4o");
        assert_eq!(model.provider, "OpenAI");
        assert_eq!(model.capabilities, vec!["chat", "vision"]);
        assert_eq!(model.description.as_deref(), Some("flagship"));
        assert_eq!(
            model.pricing,
            Some(Pricing {
                prompt: 0.005,
                completion: 0.015
            })
        );
    }

    #[test]
    fn test_catalog_skips_entries_without_id_and_tolerates_bad_shape() {
        let v = json!({"data": [{"name": "orphan"}, {"id": "m2", "provider": "acme"}]});
        let models = parse_model_catalog(&v);
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].provider, "acme");

        assert!(parse_model_catalog(&json!({"error": "nope"})).is_empty());
    }

    #[test]
    fn test_bad_header_setting_is_not_an_auth_failure() {
        let settings = Settings {
            referer: "http://bad\nreferer".into(),
            ..Settings::default()
        };
        let err = GatewayClient::new(&settings).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::InvalidSetting {
                name: "referer",
                ..
            }
        ));
        assert!(!err.is_auth());
    }

    #[test]
    fn test_bad_credential_header_is_an_auth_failure() {
        let client = GatewayClient::new(&Settings::default()).unwrap();
        let credential = Credential::new("sk-bad\nkey").unwrap();
        let err = client.headers(&credential).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidCredential(_)));
        assert!(err.is_auth());
    }

    #[test]
    fn test_catalog_keeps_first_of_duplicate_ids() {
        let v = json!({"data": [
            {"id": "m1", "name": "First"},
            {"id": "m2"},
            {"id": "m1", "name": "Second"}
        ]});
        let models = parse_model_catalog(&v);
        let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
        assert_eq!(models[0].name, "First");
    }

    #[test]
    fn test_parse_completion() {
        let v = json!({
            "choices": [{"message": {"role": "assistant", "content": "hello"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        });
        let completion = parse_completion(&v).unwrap();
        assert_eq!(completion.content, "hello");
        assert_eq!(completion.usage.prompt_tokens, 12);
        assert_eq!(completion.usage.completion_tokens, 3);
    }

    #[test]
    fn test_parse_completion_without_choices_fails() {
        let err = parse_completion(&json!({"choices": []})).unwrap_err();
        assert!(matches!(err, GatewayError::Payload(_)));
    }
}
