use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    config::Settings,
    credential::CredentialHolder,
    db::{self, SqliteKv},
    error::{GatewayError, RunError, ValidationError},
    export::ResultExporter,
    gateway::{GatewayClient, ModelGateway},
    kv::{KeyValueStore, MemoryKv},
    models::{ModelDescriptor, Prompt},
    runner::{ProgressEvent, RunReport, TestRunner},
    store::{PromptStore, ResultStore},
    telemetry,
};

/**
 * \brief 应用根上下文：凭证、两类存储与网关客户端都从这里显式传递。
 */
pub struct AppContext<G> {
    pub settings: Settings,
    pub credential: CredentialHolder,
    pub prompts: PromptStore,
    pub results: ResultStore,
    pub gateway: G,
    pub exporter: Option<ResultExporter>,
    durable: Arc<SqliteKv>,
}

impl AppContext<GatewayClient> {
    /**
     * \brief 按配置打开持久化存储并构造网关客户端。
     */
    pub fn open(settings: Settings) -> Result<Self> {
        let durable = SqliteKv::open(&settings.db_path)
            .with_context(|| format!("open database {}", settings.db_path.display()))?;
        let gateway = GatewayClient::new(&settings).context("build gateway client failed")?;
        Ok(Self::with_parts(settings, durable, gateway))
    }
}

impl<G: ModelGateway> AppContext<G> {
    /**
     * \brief 使用给定的持久化存储与网关组装上下文；会话存储总是新建。
     */
    pub fn with_parts(settings: Settings, durable: SqliteKv, gateway: G) -> Self {
        let durable = Arc::new(durable);
        let shared: Arc<dyn KeyValueStore> = durable.clone();
        telemetry::set_log_dir(&settings.log_dir);
        if let Ok(enabled) = durable.with_conn(db::get_telemetry_enabled) {
            telemetry::set_enabled(enabled);
        }
        Self {
            exporter: settings.export_dir.clone().map(ResultExporter::new),
            credential: CredentialHolder::new(Arc::new(MemoryKv::new())),
            prompts: PromptStore::prompts(Arc::clone(&shared)),
            results: ResultStore::results(shared),
            settings,
            gateway,
            durable,
        }
    }

    pub fn telemetry_enabled(&self) -> Result<bool> {
        self.durable.with_conn(db::get_telemetry_enabled)
    }

    /**
     * \brief 持久化并立即生效遥测开关。
     */
    pub fn set_telemetry_enabled(&self, enabled: bool) -> Result<()> {
        self.durable
            .with_conn(|conn| db::set_telemetry_enabled(conn, enabled))?;
        telemetry::set_enabled(enabled);
        Ok(())
    }

    /**
     * \brief 使用当前凭证拉取模型目录。
     */
    pub async fn fetch_catalog(&self) -> Result<Vec<ModelDescriptor>> {
        let credential = self
            .credential
            .current()?
            .ok_or(ValidationError::MissingCredential)?;
        match self.gateway.list_models(&credential).await {
            Ok(models) => {
                telemetry::log_event("catalog", &format!("fetched models={}", models.len()));
                Ok(models)
            }
            Err(err) => {
                telemetry::log_error("catalog", &format!("fetch failed: {}", err));
                Err(err.into())
            }
        }
    }

    /**
     * \brief 对选中的模型执行测试。
     */
    pub async fn run_tests(
        &self,
        prompt: Option<&Prompt>,
        models: &[ModelDescriptor],
        progress: Option<UnboundedSender<ProgressEvent>>,
    ) -> Result<RunReport, RunError> {
        let credential = self.credential.current().unwrap_or_else(|err| {
            telemetry::log_error("runner", &format!("read credential failed: {:#}", err));
            None
        });
        let mut runner =
            TestRunner::new(&self.gateway, &self.results).with_exporter(self.exporter.as_ref());
        if let Some(tx) = progress {
            runner = runner.with_progress(tx);
        }
        runner.run(credential.as_ref(), prompt, models).await
    }
}

/**
 * \brief 判断错误是否来自网关鉴权失败。
 */
pub fn is_auth_failure(err: &anyhow::Error) -> bool {
    err.downcast_ref::<GatewayError>()
        .map(GatewayError::is_auth)
        .unwrap_or(false)
}
