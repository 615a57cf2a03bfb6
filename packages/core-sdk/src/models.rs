use std::{fmt, str::FromStr};

use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/**
 * \brief 生成新的唯一 ID（UUID v4）。
 */
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/**
 * \brief 当前 UTC 时间的毫秒时间戳。
 */
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/**
 * \brief 消息角色，仅允许 system/user/assistant 三种取值。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(anyhow!("unknown role: {}", other)),
        }
    }
}

/**
 * \brief Prompt 内的一条消息；id 仅在所属 Prompt 内唯一，不会发送给网关。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 本地消息 ID */
    #[serde(default = "generate_id")]
    pub id: String,
    /** \brief 角色 */
    pub role: Role,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            role,
            content: content.into(),
        }
    }

    /** \brief 转换为线上格式（去掉本地 id）。 */
    pub fn to_wire(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/**
 * \brief 发送给网关的消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/**
 * \brief 用户编写的 Prompt 文档。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default = "now_millis")]
    pub created_at: i64,
    #[serde(default = "now_millis")]
    pub updated_at: i64,
}

impl Prompt {
    /**
     * \brief 新建空 Prompt，分配 ID 与时间戳。
     */
    pub fn new(name: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: generate_id(),
            name: name.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.touch();
    }

    /**
     * \brief 追加消息，返回新消息的 ID。
     */
    pub fn add_message(&mut self, role: Role, content: impl Into<String>) -> String {
        let message = Message::new(role, content);
        let id = message.id.clone();
        self.messages.push(message);
        self.touch();
        id
    }

    /**
     * \brief 原地修改消息内容；消息不存在时返回 false。
     */
    pub fn update_message_content(&mut self, message_id: &str, content: impl Into<String>) -> bool {
        match self.messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) => {
                message.content = content.into();
                self.touch();
                true
            }
            None => false,
        }
    }

    pub fn set_message_role(&mut self, message_id: &str, role: Role) -> bool {
        match self.messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) => {
                message.role = role;
                self.touch();
                true
            }
            None => false,
        }
    }

    pub fn remove_message(&mut self, message_id: &str) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != message_id);
        if self.messages.len() == before {
            return false;
        }
        self.touch();
        true
    }

    /**
     * \brief 刷新 updated_at，保证单调不回退。
     */
    pub fn touch(&mut self) {
        self.updated_at = now_millis().max(self.updated_at);
    }

    pub fn wire_messages(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(Message::to_wire).collect()
    }
}

/**
 * \brief 每千 token 的价格。
 */
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pricing {
    pub prompt: f64,
    pub completion: f64,
}

/**
 * \brief 网关目录中的模型描述。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<Pricing>,
}

/**
 * \brief 单次测试结果；prompt 字段是消息快照，不随原 Prompt 变化。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub id: String,
    pub prompt_id: String,
    pub model_id: String,
    pub prompt: Vec<Message>,
    pub response: String,
    pub cost: f64,
    pub timestamp: i64,
}

/** \brief token 用量。 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/**
 * \brief 一次补全调用的结果：回复文本与 token 用量。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!("System".parse::<Role>().unwrap(), Role::System);
        assert_eq!(" user ".parse::<Role>().unwrap(), Role::User);
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert!("tool".parse::<Role>().is_err());
    }

    #[test]
    fn test_prompt_message_editing() {
        let mut prompt = Prompt::new("draft");
        let sys = prompt.add_message(Role::System, "be brief");
        let user = prompt.add_message(Role::User, "hi");
        assert_eq!(prompt.messages.len(), 2);

        assert!(prompt.update_message_content(&user, "hello"));
        assert!(prompt.set_message_role(&sys, Role::Assistant));
        assert_eq!(prompt.messages[0].role, Role::Assistant);
        assert_eq!(prompt.messages[1].content, "hello");

        assert!(prompt.remove_message(&sys));
        assert_eq!(prompt.messages.len(), 1);
        assert_eq!(prompt.messages[0].id, user);
    }

    #[test]
    fn test_unknown_message_id_leaves_prompt_unchanged() {
        let mut prompt = Prompt::new("draft");
        prompt.add_message(Role::User, "hi");
        let before = prompt.clone();
        assert!(!prompt.update_message_content("missing", "x"));
        assert!(!prompt.set_message_role("missing", Role::System));
        assert!(!prompt.remove_message("missing"));
        assert_eq!(prompt, before);
    }

    #[test]
    fn test_updated_at_never_moves_backwards() {
        let mut prompt = Prompt::new("draft");
        prompt.updated_at = i64::MAX - 1;
        prompt.rename("later");
        assert_eq!(prompt.updated_at, i64::MAX - 1);
        assert_eq!(prompt.name, "later");
    }

    #[test]
    fn test_wire_messages_strip_local_id() {
        let mut prompt = Prompt::new("draft");
        prompt.add_message(Role::User, "hi");
        let wire = serde_json::to_value(prompt.wire_messages()).unwrap();
        assert_eq!(wire, serde_json::json!([{"role": "user", "content": "hi"}]));
    }

    #[test]
    fn test_test_result_uses_camel_case_keys() {
        let result = TestResult {
            id: "r1".into(),
            prompt_id: "p1".into(),
            model_id: "m1".into(),
            prompt: vec![],
            response: "ok".into(),
            cost: 0.5,
            timestamp: 42,
        };
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["promptId"], "p1");
        assert_eq!(v["modelId"], "m1");
        assert_eq!(v["timestamp"], 42);
    }
}
