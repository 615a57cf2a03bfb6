use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    cost::estimate_cost,
    credential::Credential,
    error::{RunError, ValidationError},
    export::ResultExporter,
    gateway::ModelGateway,
    models::{generate_id, now_millis, ModelDescriptor, Prompt, TestResult},
    store::ResultStore,
    telemetry,
};

/**
 * \brief 单个模型的执行进度，仅用于界面提示。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProgress {
    NotStarted,
    InFlight,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub model_id: String,
    pub state: ModelProgress,
}

/**
 * \brief 单个模型的最终结果。失败原因只用于日志与排查，不单独展示给用户。
 */
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutcome {
    Succeeded(TestResult),
    Failed { model_id: String, reason: String },
}

/**
 * \brief 一次测试的汇总，按 join 返回顺序排列。
 */
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunReport {
    pub outcomes: Vec<ModelOutcome>,
}

impl RunReport {
    pub fn results(&self) -> Vec<&TestResult> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                ModelOutcome::Succeeded(result) => Some(result),
                ModelOutcome::Failed { .. } => None,
            })
            .collect()
    }

    pub fn into_results(self) -> Vec<TestResult> {
        self.outcomes
            .into_iter()
            .filter_map(|o| match o {
                ModelOutcome::Succeeded(result) => Some(result),
                ModelOutcome::Failed { .. } => None,
            })
            .collect()
    }

    /** \brief 被静默丢弃的模型 ID。 */
    pub fn dropped_models(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                ModelOutcome::Failed { model_id, .. } => Some(model_id.as_str()),
                ModelOutcome::Succeeded(_) => None,
            })
            .collect()
    }
}

/**
 * \brief 发起前的前置校验；任何一项失败都不会发出请求。
 */
pub fn validate<'p, 'c>(
    prompt: Option<&'p Prompt>,
    models: &[ModelDescriptor],
    credential: Option<&'c Credential>,
) -> Result<(&'p Prompt, &'c Credential), ValidationError> {
    let prompt = prompt
        .filter(|p| !p.is_empty())
        .ok_or(ValidationError::EmptyPrompt)?;
    if models.is_empty() {
        return Err(ValidationError::NoModelsSelected);
    }
    let credential = credential.ok_or(ValidationError::MissingCredential)?;
    Ok((prompt, credential))
}

/**
 * \brief 多模型测试执行：并发向每个模型发送一次请求，等待全部结束（settle-all）。
 * \details 单个模型失败不会取消其它请求；成功结果计算费用后立即持久化。
 */
pub struct TestRunner<'a, G: ?Sized> {
    gateway: &'a G,
    results: &'a ResultStore,
    exporter: Option<&'a ResultExporter>,
    progress: Option<UnboundedSender<ProgressEvent>>,
}

impl<'a, G: ModelGateway + ?Sized> TestRunner<'a, G> {
    pub fn new(gateway: &'a G, results: &'a ResultStore) -> Self {
        Self {
            gateway,
            results,
            exporter: None,
            progress: None,
        }
    }

    /** \brief 成功结果额外写出到导出目录。 */
    pub fn with_exporter(mut self, exporter: Option<&'a ResultExporter>) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn with_progress(mut self, progress: UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    /**
     * \brief 执行测试。全部失败时返回 AllFailed，部分失败视为成功。
     */
    pub async fn run(
        &self,
        credential: Option<&Credential>,
        prompt: Option<&Prompt>,
        models: &[ModelDescriptor],
    ) -> Result<RunReport, RunError> {
        let (prompt, credential) = validate(prompt, models, credential)?;

        for model in models {
            self.emit(&model.id, ModelProgress::NotStarted);
        }
        telemetry::log_event(
            "runner",
            &format!(
                "dispatch prompt={} models={} msgs={}",
                prompt.id,
                models.len(),
                prompt.messages.len()
            ),
        );

        let outcomes = join_all(
            models
                .iter()
                .map(|model| self.run_model(credential, prompt, model)),
        )
        .await;
        let report = RunReport { outcomes };

        let succeeded = report.results().len();
        telemetry::log_event(
            "runner",
            &format!(
                "settled prompt={} succeeded={} failed={}",
                prompt.id,
                succeeded,
                models.len() - succeeded
            ),
        );
        if succeeded == 0 {
            return Err(RunError::AllFailed {
                attempted: models.len(),
            });
        }
        Ok(report)
    }

    async fn run_model(
        &self,
        credential: &Credential,
        prompt: &Prompt,
        model: &ModelDescriptor,
    ) -> ModelOutcome {
        self.emit(&model.id, ModelProgress::InFlight);
        match self.execute(credential, prompt, model).await {
            Ok(result) => {
                self.emit(&model.id, ModelProgress::Succeeded);
                ModelOutcome::Succeeded(result)
            }
            Err(err) => {
                telemetry::log_error(
                    "runner",
                    &format!("model {} failed: {:#}", model.id, err),
                );
                self.emit(&model.id, ModelProgress::Failed);
                ModelOutcome::Failed {
                    model_id: model.id.clone(),
                    reason: format!("{:#}", err),
                }
            }
        }
    }

    async fn execute(
        &self,
        credential: &Credential,
        prompt: &Prompt,
        model: &ModelDescriptor,
    ) -> anyhow::Result<TestResult> {
        let completion = self
            .gateway
            .complete(credential, &model.id, &prompt.messages)
            .await?;
        let cost = estimate_cost(
            model.pricing.as_ref(),
            completion.usage.prompt_tokens,
            completion.usage.completion_tokens,
        );
        let result = TestResult {
            id: generate_id(),
            prompt_id: prompt.id.clone(),
            model_id: model.id.clone(),
            prompt: prompt.messages.clone(),
            response: completion.content,
            cost,
            timestamp: now_millis(),
        };
        self.results.save(&result)?;

        if let Some(exporter) = self.exporter {
            if let Err(err) = exporter.write(&result) {
                telemetry::log_error("runner", &format!("export {} failed: {:#}", result.id, err));
            }
        }
        Ok(result)
    }

    fn emit(&self, model_id: &str, state: ModelProgress) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(ProgressEvent {
                model_id: model_id.to_string(),
                state,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::GatewayError,
        kv::MemoryKv,
        models::{Completion, Message, Pricing, Role, Usage},
    };
    use async_trait::async_trait;
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    struct FakeGateway {
        failing: HashSet<String>,
        calls: AtomicUsize,
    }

    impl FakeGateway {
        fn failing(ids: &[&str]) -> Self {
            Self {
                failing: ids.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelGateway for FakeGateway {
        async fn list_models(
            &self,
            _credential: &Credential,
        ) -> Result<Vec<ModelDescriptor>, GatewayError> {
            Ok(Vec::new())
        }

        async fn complete(
            &self,
            _credential: &Credential,
            model_id: &str,
            messages: &[Message],
        ) -> Result<Completion, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.failing.contains(model_id) {
                return Err(GatewayError::Status {
                    status: 500,
                    body: "boom".into(),
                });
            }
            Ok(Completion {
                content: format!("{} saw {} messages", model_id, messages.len()),
                usage: Usage {
                    prompt_tokens: 1000,
                    completion_tokens: 2000,
                    total_tokens: 3000,
                },
            })
        }
    }

    fn model(id: &str) -> ModelDescriptor {
        ModelDescriptor {
            id: id.into(),
            name: id.into(),
            provider: "test".into(),
            capabilities: vec![],
            description: None,
            pricing: Some(Pricing {
                prompt: 0.5,
                completion: 1.0,
            }),
        }
    }

    fn prompt() -> Prompt {
        let mut prompt = Prompt::new("greeting");
        prompt.add_message(Role::User, "hello");
        prompt
    }

    fn credential() -> Credential {
        Credential::new("sk-test").unwrap()
    }

    fn store() -> ResultStore {
        ResultStore::results(Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn test_partial_failure_is_silent_success() {
        let gateway = FakeGateway::failing(&["m2"]);
        let results = store();
        let runner = TestRunner::new(&gateway, &results);
        let models = vec![model("m1"), model("m2"), model("m3")];

        let report = runner
            .run(Some(&credential()), Some(&prompt()), &models)
            .await
            .expect("partial success");

        assert_eq!(gateway.calls(), 3);
        assert_eq!(report.results().len(), 2);
        assert_eq!(report.dropped_models(), vec!["m2"]);
        assert_eq!(results.list().unwrap().len(), 2);
        for result in report.results() {
            assert!((result.cost - 2.5).abs() < 1e-12);
        }
    }

    #[tokio::test]
    async fn test_all_failed_reports_single_error() {
        let gateway = FakeGateway::failing(&["m1", "m2"]);
        let results = store();
        let runner = TestRunner::new(&gateway, &results);

        let err = runner
            .run(
                Some(&credential()),
                Some(&prompt()),
                &[model("m1"), model("m2")],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::AllFailed { attempted: 2 }));
        assert_eq!(gateway.calls(), 2);
        assert!(results.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_validation_blocks_dispatch() {
        let gateway = FakeGateway::failing(&[]);
        let results = store();
        let runner = TestRunner::new(&gateway, &results);
        let models = vec![model("m1")];

        let err = runner
            .run(Some(&credential()), Some(&Prompt::new("empty")), &models)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RunError::Validation(ValidationError::EmptyPrompt)
        ));

        let err = runner
            .run(Some(&credential()), None, &models)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RunError::Validation(ValidationError::EmptyPrompt)
        ));

        let err = runner
            .run(Some(&credential()), Some(&prompt()), &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RunError::Validation(ValidationError::NoModelsSelected)
        ));

        let err = runner.run(None, Some(&prompt()), &models).await.unwrap_err();
        assert!(matches!(
            err,
            RunError::Validation(ValidationError::MissingCredential)
        ));

        assert_eq!(gateway.calls(), 0);
    }

    #[tokio::test]
    async fn test_result_snapshot_survives_prompt_edits() {
        let gateway = FakeGateway::failing(&[]);
        let results = store();
        let runner = TestRunner::new(&gateway, &results);
        let mut live = prompt();

        let report = runner
            .run(Some(&credential()), Some(&live), &[model("m1")])
            .await
            .unwrap();
        let result_id = report.results()[0].id.clone();

        let msg_id = live.messages[0].id.clone();
        live.update_message_content(&msg_id, "changed");
        live.add_message(Role::Assistant, "more");

        let stored = results.get(&result_id).unwrap().unwrap();
        assert_eq!(stored.prompt.len(), 1);
        assert_eq!(stored.prompt[0].content, "hello");
        assert_eq!(stored.prompt_id, live.id);
    }

    #[tokio::test]
    async fn test_progress_events_reach_terminal_state() {
        let gateway = FakeGateway::failing(&["bad"]);
        let results = store();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let runner = TestRunner::new(&gateway, &results).with_progress(tx);

        runner
            .run(
                Some(&credential()),
                Some(&prompt()),
                &[model("good"), model("bad")],
            )
            .await
            .unwrap();
        drop(runner);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let states_for = |id: &str| -> Vec<ModelProgress> {
            events
                .iter()
                .filter(|e| e.model_id == id)
                .map(|e| e.state)
                .collect()
        };
        assert_eq!(
            states_for("good"),
            vec![
                ModelProgress::NotStarted,
                ModelProgress::InFlight,
                ModelProgress::Succeeded
            ]
        );
        assert_eq!(
            states_for("bad"),
            vec![
                ModelProgress::NotStarted,
                ModelProgress::InFlight,
                ModelProgress::Failed
            ]
        );
    }

    #[tokio::test]
    async fn test_exporter_writes_successful_results() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exporter = ResultExporter::new(dir.path());
        let gateway = FakeGateway::failing(&[]);
        let results = store();
        let runner = TestRunner::new(&gateway, &results).with_exporter(Some(&exporter));

        let report = runner
            .run(Some(&credential()), Some(&prompt()), &[model("vendor/m1")])
            .await
            .unwrap();
        let result = report.results()[0];
        let expected = dir
            .path()
            .join(format!("{}-vendor_m1.json", result.timestamp));
        assert!(expected.exists());
    }
}
