use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::models::TestResult;

/**
 * \brief 把 [a-zA-Z0-9] 以外的字符替换为下划线。
 */
pub fn sanitize_model_id(model_id: &str) -> String {
    model_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/**
 * \brief 导出文件名：`{timestamp}-{模型ID}.json`。
 */
pub fn export_file_name(result: &TestResult) -> String {
    format!(
        "{}-{}.json",
        result.timestamp,
        sanitize_model_id(&result.model_id)
    )
}

/**
 * \brief 结果文件内容（带缩进的 JSON）。
 */
pub fn to_pretty_json(result: &TestResult) -> Result<String> {
    Ok(serde_json::to_string_pretty(result)?)
}

/**
 * \brief 可直接复用的请求配置：模型与去掉本地 id 的消息。
 */
pub fn prompt_config(result: &TestResult) -> Value {
    let messages: Vec<_> = result.prompt.iter().map(|m| m.to_wire()).collect();
    json!({
        "model": result.model_id,
        "messages": messages,
    })
}

/**
 * \brief 把结果写入本地目录。
 */
#[derive(Debug, Clone)]
pub struct ResultExporter {
    dir: PathBuf,
}

impl ResultExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /**
     * \brief 写出单个结果，返回文件路径。
     */
    pub fn write(&self, result: &TestResult) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create export dir {}", self.dir.display()))?;
        let path = self.dir.join(export_file_name(result));
        std::fs::write(&path, to_pretty_json(result)?)
            .with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}
