use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::RwLock,
};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/** \brief 日志文件名，位于日志目录下。 */
pub const LOG_FILE_NAME: &str = "promptlab.log";

const DEFAULT_LOG_DIR: &str = "logs";

static TELEMETRY_ENABLED: Lazy<RwLock<bool>> = Lazy::new(|| RwLock::new(false));

static LOG_DIR: Lazy<RwLock<PathBuf>> = Lazy::new(|| RwLock::new(PathBuf::from(DEFAULT_LOG_DIR)));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Error => "ERROR",
        }
    }
}

/**
 * \brief 更新遥测开关状态（默认关闭）。开关只控制常规事件，错误总是记录。
 */
pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = TELEMETRY_ENABLED.write() {
        *guard = enabled;
    }
}

pub fn is_enabled() -> bool {
    TELEMETRY_ENABLED.read().map(|g| *g).unwrap_or(false)
}

/**
 * \brief 修改日志目录，默认 ./logs。
 */
pub fn set_log_dir(dir: impl AsRef<Path>) {
    if let Ok(mut guard) = LOG_DIR.write() {
        *guard = dir.as_ref().to_path_buf();
    }
}

pub fn log_path() -> PathBuf {
    LOG_DIR
        .read()
        .map(|g| g.clone())
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR))
        .join(LOG_FILE_NAME)
}

/**
 * \brief 记录常规事件，如目录拉取数量、测试分发与汇总。
 */
pub fn log_event(category: &str, message: &str) {
    record(Level::Info, category, message);
}

/**
 * \brief 记录错误事件：单模型失败、网关诊断信息等。不受遥测开关影响。
 */
pub fn log_error(category: &str, message: &str) {
    record(Level::Error, category, message);
}

fn should_write(level: Level, enabled: bool) -> bool {
    enabled || level == Level::Error
}

fn record(level: Level, category: &str, message: &str) {
    if !should_write(level, is_enabled()) {
        return;
    }
    if let Err(err) = append_line(&log_path(), level, category, message) {
        eprintln!("telemetry write failed: {:#}", err);
    }
}

fn append_line(path: &Path, level: Level, category: &str, message: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create log dir {}", dir.display()))?;
    }
    let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {}", path.display()))?;
    writeln!(file, "{}", format_line(&timestamp, level, category, message))?;
    Ok(())
}

fn format_line(timestamp: &str, level: Level, category: &str, message: &str) -> String {
    format!(
        "{} [{}] {} - {}",
        timestamp,
        level.as_str(),
        category,
        redact_secrets(message)
    )
}

/**
 * \brief 网关错误体可能回显凭证，写入前把 `sk-` 开头的片段替换掉。
 */
pub fn redact_secrets(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(pos) = rest.find("sk-") {
        let starts_token = rest[..pos]
            .chars()
            .next_back()
            .map(|c| !is_token_char(c))
            .unwrap_or(true);
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let end = tail
            .char_indices()
            .find(|(_, c)| !is_token_char(*c))
            .map(|(i, _)| i)
            .unwrap_or(tail.len());
        if starts_token {
            out.push_str("sk-***");
        } else {
            out.push_str(&tail[..end]);
        }
        rest = &tail[end..];
    }
    out.push_str(rest);
    out
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_embedded_keys() {
        assert_eq!(
            redact_secrets("401 -> {\"error\":\"bad key sk-or-v1-abc123\"}"),
            "401 -> {\"error\":\"bad key sk-***\"}"
        );
        assert_eq!(redact_secrets("Bearer sk-a and sk-b."), "Bearer sk-*** and sk-***.");
    }

    #[test]
    fn test_leaves_non_key_text_alone() {
        assert_eq!(redact_secrets("task-sk-runner ok"), "task-sk-runner ok");
        assert_eq!(redact_secrets("no secrets here"), "no secrets here");
    }

    #[test]
    fn test_errors_written_while_switch_off() {
        assert!(should_write(Level::Error, false));
        assert!(should_write(Level::Error, true));
        assert!(!should_write(Level::Info, false));
        assert!(should_write(Level::Info, true));
    }

    #[test]
    fn test_line_format() {
        let line = format_line("2024-01-01T00:00:00Z", Level::Error, "runner", "model m1 failed");
        assert_eq!(line, "2024-01-01T00:00:00Z [ERROR] runner - model m1 failed");
    }

    #[test]
    fn test_append_creates_dir_and_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(LOG_FILE_NAME);
        append_line(&path, Level::Info, "catalog", "fetched models=3").unwrap();
        append_line(&path, Level::Error, "runner", "key sk-secret leaked").unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO] catalog - fetched models=3"));
        assert!(lines[1].ends_with("[ERROR] runner - key sk-*** leaked"));
    }
}
