use std::path::PathBuf;

/** \brief 默认网关地址。 */
pub const DEFAULT_GATEWAY_URL: &str = "https://openrouter.ai/api/v1";
/** \brief 默认应用标题（X-Title 请求头）。 */
pub const DEFAULT_APP_TITLE: &str = "Prompt Tester Tool";
/** \brief 默认来源（HTTP-Referer 请求头）。 */
pub const DEFAULT_REFERER: &str = "http://127.0.0.1:5173";
/** \brief 默认结果导出目录，每次保存结果都会写出一个文件。 */
pub const DEFAULT_EXPORT_DIR: &str = "results";

/**
 * \brief 运行配置，默认值可被环境变量覆盖。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /** \brief 网关 API 基地址 */
    pub gateway_url: String,
    /** \brief HTTP-Referer 请求头 */
    pub referer: String,
    /** \brief X-Title 请求头 */
    pub app_title: String,
    /** \brief 持久化数据库路径 */
    pub db_path: PathBuf,
    /** \brief 结果文件导出目录，默认 ./results */
    pub export_dir: Option<PathBuf>,
    /** \brief 前端静态资源目录 */
    pub ui_dir: PathBuf,
    /** \brief 遥测日志目录 */
    pub log_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            referer: DEFAULT_REFERER.to_string(),
            app_title: DEFAULT_APP_TITLE.to_string(),
            db_path: PathBuf::from("promptlab.db"),
            export_dir: Some(PathBuf::from(DEFAULT_EXPORT_DIR)),
            ui_dir: PathBuf::from("web"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl Settings {
    /**
     * \brief 从 PROMPTLAB_* 环境变量读取配置。
     */
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            gateway_url: non_empty("PROMPTLAB_GATEWAY_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.gateway_url),
            referer: non_empty("PROMPTLAB_REFERER").unwrap_or(defaults.referer),
            app_title: non_empty("PROMPTLAB_TITLE").unwrap_or(defaults.app_title),
            db_path: non_empty("PROMPTLAB_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            export_dir: non_empty("PROMPTLAB_EXPORT_DIR")
                .map(PathBuf::from)
                .or(defaults.export_dir),
            ui_dir: non_empty("PROMPTLAB_UI_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.ui_dir),
            log_dir: non_empty("PROMPTLAB_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
        }
    }
}
