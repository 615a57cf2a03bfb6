use std::{marker::PhantomData, sync::Arc};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    kv::KeyValueStore,
    models::{Prompt, TestResult},
};

/** \brief 已保存 Prompt 列表的键。 */
pub const PROMPTS_KEY: &str = "prompts";
/** \brief 已保存测试结果列表的键。 */
pub const RESULTS_KEY: &str = "testResults";

/**
 * \brief 可按 ID 存取的实体。
 */
pub trait Entity: Serialize + DeserializeOwned + Clone {
    fn entity_id(&self) -> &str;
}

impl Entity for Prompt {
    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl Entity for TestResult {
    fn entity_id(&self) -> &str {
        &self.id
    }
}

/**
 * \brief 以 JSON 数组形式存放在单个键下的实体集合。
 * \details 每次写入都会整体覆盖该键；无事务、无乐观锁，后写覆盖先写（单用户单窗口场景）。
 */
pub struct JsonListStore<T> {
    kv: Arc<dyn KeyValueStore>,
    key: &'static str,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for JsonListStore<T> {
    fn clone(&self) -> Self {
        Self {
            kv: Arc::clone(&self.kv),
            key: self.key,
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> JsonListStore<T> {
    pub fn new(kv: Arc<dyn KeyValueStore>, key: &'static str) -> Self {
        Self {
            kv,
            key,
            _entity: PhantomData,
        }
    }

    /**
     * \brief 按存储顺序返回全部实体；存储内容损坏时直接报错。
     */
    pub fn list(&self) -> Result<Vec<T>> {
        match self.kv.get(self.key)? {
            Some(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("stored `{}` is not valid JSON", self.key)),
            None => Ok(Vec::new()),
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<T>> {
        Ok(self.list()?.into_iter().find(|e| e.entity_id() == id))
    }

    /**
     * \brief 保存实体：ID 已存在则原地替换，否则追加到末尾。
     */
    pub fn save(&self, entity: &T) -> Result<()> {
        let mut items = self.list()?;
        match items
            .iter_mut()
            .find(|e| e.entity_id() == entity.entity_id())
        {
            Some(existing) => *existing = entity.clone(),
            None => items.push(entity.clone()),
        }
        self.write(&items)
    }

    /**
     * \brief 按 ID 删除；返回是否删除了条目。
     */
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut items = self.list()?;
        let before = items.len();
        items.retain(|e| e.entity_id() != id);
        if items.len() == before {
            return Ok(false);
        }
        self.write(&items)?;
        Ok(true)
    }

    fn write(&self, items: &[T]) -> Result<()> {
        let raw = serde_json::to_string(items)?;
        self.kv.set(self.key, &raw)
    }
}

pub type PromptStore = JsonListStore<Prompt>;
pub type ResultStore = JsonListStore<TestResult>;

impl JsonListStore<Prompt> {
    pub fn prompts(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::new(kv, PROMPTS_KEY)
    }
}

impl JsonListStore<TestResult> {
    pub fn results(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::new(kv, RESULTS_KEY)
    }

    /**
     * \brief 列出某个 Prompt 的全部测试结果。
     */
    pub fn for_prompt(&self, prompt_id: &str) -> Result<Vec<TestResult>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.prompt_id == prompt_id)
            .collect())
    }
}
