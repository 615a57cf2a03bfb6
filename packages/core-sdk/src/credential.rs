use std::{fmt, sync::Arc};

use anyhow::Result;

use crate::{error::ValidationError, kv::KeyValueStore};

/** \brief 会话存储中保存凭证的固定键。 */
pub const CREDENTIAL_KEY: &str = "openrouter_api_key";

/**
 * \brief Bearer 凭证；Debug 输出做脱敏处理。
 */
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /**
     * \brief 构造凭证，空白字符串视为未设置。
     */
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /** \brief 返回明文，仅用于请求头与代码片段。 */
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(****)")
    }
}

/**
 * \brief 会话级凭证持有者，状态只存放在会话存储中。
 */
#[derive(Clone)]
pub struct CredentialHolder {
    session: Arc<dyn KeyValueStore>,
}

impl CredentialHolder {
    pub fn new(session: Arc<dyn KeyValueStore>) -> Self {
        Self { session }
    }

    /**
     * \brief 设置凭证；空值返回 MissingCredential。
     */
    pub fn set(&self, raw: &str) -> Result<Credential> {
        let credential = Credential::new(raw).ok_or(ValidationError::MissingCredential)?;
        self.session.set(CREDENTIAL_KEY, credential.expose())?;
        Ok(credential)
    }

    pub fn clear(&self) -> Result<()> {
        self.session.remove(CREDENTIAL_KEY)
    }

    pub fn current(&self) -> Result<Option<Credential>> {
        Ok(self.session.get(CREDENTIAL_KEY)?.and_then(Credential::new))
    }

    pub fn is_set(&self) -> Result<bool> {
        Ok(self.current()?.is_some())
    }
}
