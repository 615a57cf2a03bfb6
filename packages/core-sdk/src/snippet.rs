use std::{fmt, str::FromStr};

use anyhow::{anyhow, Error, Result};
use serde::{Deserialize, Serialize};

use crate::{credential::Credential, models::Message};

/**
 * \brief 代码片段内嵌明文凭证，展示时必须附带该提示。
 */
pub const SNIPPET_SECRET_WARNING: &str =
    "This snippet embeds your real API key in plain text. Do not share or commit it.";

/**
 * \brief 代码片段目标语言。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnippetLanguage {
    Javascript,
    Python,
    Curl,
}

impl fmt::Display for SnippetLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SnippetLanguage::Javascript => "javascript",
            SnippetLanguage::Python => "python",
            SnippetLanguage::Curl => "curl",
        })
    }
}

impl FromStr for SnippetLanguage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "javascript" | "js" => Ok(SnippetLanguage::Javascript),
            "python" | "py" => Ok(SnippetLanguage::Python),
            "curl" | "shell" => Ok(SnippetLanguage::Curl),
            other => Err(anyhow!("unsupported snippet language: {}", other)),
        }
    }
}

/**
 * \brief 生成复现补全请求的代码片段。
 * \param gateway_url 网关基地址
 */
pub fn generate_snippet(
    credential: &Credential,
    gateway_url: &str,
    model_id: &str,
    messages: &[Message],
    language: SnippetLanguage,
) -> Result<String> {
    let wire: Vec<_> = messages.iter().map(Message::to_wire).collect();
    let formatted = serde_json::to_string_pretty(&wire)?;
    let endpoint = format!("{}/chat/completions", gateway_url.trim_end_matches('/'));
    let key = credential.expose();

    let snippet = match language {
        SnippetLanguage::Javascript => format!(
            r#"
const axios = require('axios');

async function callGateway() {{
  const response = await axios.post(
    '{endpoint}',
    {{
      model: "{model_id}",
      messages: {formatted}
    }},
    {{
      headers: {{
        'Authorization': 'Bearer {key}',
        'HTTP-Referer': 'YOUR_SITE_URL', // Replace with your site URL
        'X-Title': 'YOUR_APP_NAME' // Replace with your app name
      }}
    }}
  );

  return response.data;
}}

callGateway()
  .then(result => console.log(result))
  .catch(error => console.error(error));
"#
        ),
        SnippetLanguage::Python => format!(
            r#"
import requests
import json

def call_gateway():
    url = "{endpoint}"
    headers = {{
        "Authorization": "Bearer {key}",
        "HTTP-Referer": "YOUR_SITE_URL",  # Replace with your site URL
        "X-Title": "YOUR_APP_NAME",  # Replace with your app name
        "Content-Type": "application/json"
    }}

    payload = {{
        "model": "{model_id}",
        "messages": {formatted}
    }}

    response = requests.post(url, headers=headers, json=payload)
    return response.json()

result = call_gateway()
print(json.dumps(result, indent=2))
"#
        ),
        SnippetLanguage::Curl => {
            let indented = formatted.replace('\n', "\n  ");
            format!(
                r#"
curl -X POST \
  {endpoint} \
  -H "Authorization: Bearer {key}" \
  -H "HTTP-Referer: YOUR_SITE_URL" \
  -H "X-Title: YOUR_APP_NAME" \
  -H "Content-Type: application/json" \
  -d '{{
  "model": "{model_id}",
  "messages": {indented}
}}'
"#
            )
        }
    };
    Ok(snippet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn messages() -> Vec<Message> {
        vec![
            Message {
                id: "local-1".into(),
                role: Role::System,
                content: "be brief".into(),
            },
            Message {
                id: "local-2".into(),
                role: Role::User,
                content: "hi".into(),
            },
        ]
    }

    #[test]
    fn test_snippets_reproduce_request() {
        let credential = Credential::new("sk-live").unwrap();
        for language in [
            SnippetLanguage::Javascript,
            SnippetLanguage::Python,
            SnippetLanguage::Curl,
        ] {
            let snippet = generate_snippet(
                &credential,
                "https://gateway.test/api/v1/",
                "m1",
                &messages(),
                language,
            )
            .unwrap();
            assert!(snippet.contains("https://gateway.test/api/v1/chat/completions"));
            assert!(snippet.contains("Bearer sk-live"));
            assert!(snippet.contains("\"m1\""));
            assert!(snippet.contains("\"content\": \"be brief\""));
            assert!(!snippet.contains("local-1"));
        }
    }

    #[test]
    fn test_curl_body_is_indented() {
        let credential = Credential::new("sk").unwrap();
        let snippet =
            generate_snippet(&credential, "http://x", "m1", &messages(), SnippetLanguage::Curl)
                .unwrap();
        assert!(snippet.contains("\"messages\": [\n    {\n      \"role\": \"system\""));
        assert!(snippet.trim_end().ends_with("}'"));
    }

    #[test]
    fn test_language_parse() {
        assert_eq!("JS".parse::<SnippetLanguage>().unwrap(), SnippetLanguage::Javascript);
        assert_eq!("python".parse::<SnippetLanguage>().unwrap(), SnippetLanguage::Python);
        assert!("ruby".parse::<SnippetLanguage>().is_err());
    }
}
