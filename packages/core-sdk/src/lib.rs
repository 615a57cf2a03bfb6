pub mod catalog;
pub mod config;
pub mod context;
pub mod cost;
pub mod credential;
pub mod db;
pub mod error;
pub mod export;
pub mod gateway;
pub mod kv;
pub mod models;
pub mod runner;
pub mod server;
pub mod snippet;
pub mod store;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::catalog;
    pub use crate::config::Settings;
    pub use crate::context::AppContext;
    pub use crate::credential::{Credential, CredentialHolder};
    pub use crate::error::{GatewayError, RunError, ValidationError};
    pub use crate::gateway::{GatewayClient, ModelGateway};
    pub use crate::models::{Message, ModelDescriptor, Prompt, Role, TestResult};
    pub use crate::runner::{ModelOutcome, ProgressEvent, RunReport, TestRunner};
    pub use crate::telemetry;
}
