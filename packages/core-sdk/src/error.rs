use reqwest::header::InvalidHeaderValue;
use thiserror::Error;

/**
 * \brief 网关调用失败时展示给用户的统一提示；细节只写日志。
 */
pub const GATEWAY_FAILURE_MESSAGE: &str =
    "Request to the model gateway failed. Please check your API key and try again.";

/**
 * \brief 网关错误：鉴权失败与其它网络错误分开，由调用方决定如何展示。
 */
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication rejected: {status} -> {body}")]
    Auth { status: u16, body: String },

    #[error("request failed: {status} -> {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response payload: {0}")]
    Payload(String),

    #[error("credential is not a valid header value")]
    InvalidCredential(#[source] InvalidHeaderValue),

    #[error("setting `{name}` is not a valid header value")]
    InvalidSetting {
        name: &'static str,
        #[source]
        source: InvalidHeaderValue,
    },
}

impl GatewayError {
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            GatewayError::Auth { .. } | GatewayError::InvalidCredential(_)
        )
    }
}

/**
 * \brief 发起测试前的前置校验错误，每种都有独立的用户提示。
 */
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please create a prompt with at least one message.")]
    EmptyPrompt,

    #[error("Please select at least one model to test.")]
    NoModelsSelected,

    #[error("Please set your OpenRouter API key.")]
    MissingCredential,
}

/**
 * \brief 测试执行流程的整体错误；单个模型失败不会出现在这里。
 */
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("All tests failed. Please check the logs for details.")]
    AllFailed { attempted: usize },
}
