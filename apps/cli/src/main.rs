use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};

use promptlab_core_sdk::{
    catalog,
    config::Settings,
    context::AppContext,
    cost::{estimate_tokens, format_cost},
    error::{ValidationError, GATEWAY_FAILURE_MESSAGE},
    export::{self, ResultExporter},
    gateway::GatewayClient,
    models::{Prompt, Role, TestResult},
    runner::ProgressEvent,
    server,
    snippet::{self, SnippetLanguage, SNIPPET_SECRET_WARNING},
    telemetry,
};

/**
 * \brief CLI 程序入口：多模型 Prompt 测试。
 */
#[derive(Parser, Debug)]
#[command(name = "promptlab", version, about = "Compare one prompt across many models")]
struct Cli {
    /** \brief 网关 API Key，仅在本进程内有效 */
    #[arg(long, env = "PROMPTLAB_API_KEY", global = true, hide_env_values = true)]
    api_key: Option<String>,

    /** \brief 数据库路径，覆盖 PROMPTLAB_DB */
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 列出网关上的模型。
     */
    Models {
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        provider: Option<String>,
    },

    /**
     * \brief 管理已保存的 Prompt。
     */
    #[command(subcommand)]
    Prompt(PromptCommand),

    /**
     * \brief 对多个模型并发执行同一个 Prompt。
     */
    Run {
        #[arg(long)]
        prompt: String,
        #[arg(long = "model", required = true)]
        models: Vec<String>,
        /** \brief 覆盖默认的结果导出目录 */
        #[arg(long)]
        export_dir: Option<PathBuf>,
    },

    /**
     * \brief 查看与导出测试结果。
     */
    #[command(subcommand)]
    Results(ResultsCommand),

    /**
     * \brief 修改本地配置。
     */
    Config {
        #[arg(long)]
        telemetry: Option<bool>,
    },

    /**
     * \brief 启动本地 HTTP 服务并提供前端页面。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum PromptCommand {
    New {
        #[arg(long, default_value = "New Prompt")]
        name: String,
    },
    List,
    Show {
        id: String,
    },
    Rename {
        id: String,
        name: String,
    },
    AddMessage {
        id: String,
        #[arg(long)]
        role: Role,
        #[arg(long)]
        content: String,
    },
    EditMessage {
        id: String,
        message_id: String,
        #[arg(long)]
        role: Option<Role>,
        #[arg(long)]
        content: Option<String>,
    },
    RemoveMessage {
        id: String,
        message_id: String,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum ResultsCommand {
    List {
        #[arg(long)]
        prompt: Option<String>,
    },
    Show {
        id: String,
    },
    Delete {
        id: String,
    },
    Export {
        id: String,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    Snippet {
        id: String,
        #[arg(long, default_value = "javascript")]
        lang: SnippetLanguage,
    },
    Config {
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if let Some(db) = cli.db {
        settings.db_path = db;
    }
    let ctx = AppContext::open(settings).context("open application context failed")?;
    if let Some(key) = cli.api_key.as_deref() {
        ctx.credential.set(key).context("invalid api key")?;
    }

    match cli.command {
        Commands::Models { search, provider } => {
            let models = ctx.fetch_catalog().await.map_err(gateway_failure)?;
            for model in catalog::filter_models(&models, search.as_deref(), provider.as_deref()) {
                let pricing = model.pricing.unwrap_or_default();
                println!(
                    "{}\t{}\t{}\tprompt={}/1k completion={}/1k\t{}",
                    model.id,
                    model.name,
                    model.provider,
                    pricing.prompt,
                    pricing.completion,
                    model.capabilities.join(",")
                );
            }
        }
        Commands::Prompt(cmd) => prompt_command(&ctx, cmd)?,
        Commands::Run {
            prompt,
            models,
            export_dir,
        } => run_command(ctx, &prompt, &models, export_dir).await?,
        Commands::Results(cmd) => results_command(&ctx, cmd)?,
        Commands::Config { telemetry } => {
            if let Some(enabled) = telemetry {
                ctx.set_telemetry_enabled(enabled)
                    .context("save telemetry failed")?;
            }
            println!("telemetry={}", ctx.telemetry_enabled()?);
        }
        Commands::Serve { addr } => {
            server::run(ctx, &addr).await?;
        }
    }

    Ok(())
}

fn gateway_failure(err: anyhow::Error) -> anyhow::Error {
    telemetry::log_error("cli.gateway", &format!("{:#}", err));
    match err.downcast::<ValidationError>() {
        Ok(validation) => validation.into(),
        Err(_) => anyhow!(GATEWAY_FAILURE_MESSAGE),
    }
}

fn load_prompt(ctx: &AppContext<GatewayClient>, id: &str) -> Result<Prompt> {
    ctx.prompts
        .get(id)
        .context("load prompts failed")?
        .with_context(|| format!("prompt {} not found", id))
}

fn load_result(ctx: &AppContext<GatewayClient>, id: &str) -> Result<TestResult> {
    ctx.results
        .get(id)
        .context("load results failed")?
        .with_context(|| format!("result {} not found", id))
}

fn print_prompt(prompt: &Prompt) {
    println!("{}  {}  (updated {})", prompt.id, prompt.name, prompt.updated_at);
    for message in &prompt.messages {
        println!(
            "  [{}] {:<9} ~{} tokens: {}",
            message.id,
            message.role,
            estimate_tokens(&message.content),
            message.content
        );
    }
}

fn prompt_command(ctx: &AppContext<GatewayClient>, cmd: PromptCommand) -> Result<()> {
    match cmd {
        PromptCommand::New { name } => {
            let prompt = Prompt::new(name);
            ctx.prompts.save(&prompt).context("save prompt failed")?;
            println!("Created prompt id={}", prompt.id);
        }
        PromptCommand::List => {
            for prompt in ctx.prompts.list().context("load prompts failed")? {
                println!(
                    "{}\t{}\t{} message(s)",
                    prompt.id,
                    prompt.name,
                    prompt.messages.len()
                );
            }
        }
        PromptCommand::Show { id } => print_prompt(&load_prompt(ctx, &id)?),
        PromptCommand::Rename { id, name } => {
            let mut prompt = load_prompt(ctx, &id)?;
            prompt.rename(name);
            ctx.prompts.save(&prompt).context("save prompt failed")?;
        }
        PromptCommand::AddMessage { id, role, content } => {
            let mut prompt = load_prompt(ctx, &id)?;
            let message_id = prompt.add_message(role, content);
            ctx.prompts.save(&prompt).context("save prompt failed")?;
            println!("Added message id={}", message_id);
        }
        PromptCommand::EditMessage {
            id,
            message_id,
            role,
            content,
        } => {
            let mut prompt = load_prompt(ctx, &id)?;
            if role.is_none() && content.is_none() {
                bail!("nothing to change, pass --role and/or --content");
            }
            if let Some(role) = role {
                if !prompt.set_message_role(&message_id, role) {
                    bail!("message {} not found", message_id);
                }
            }
            if let Some(content) = content {
                if !prompt.update_message_content(&message_id, content) {
                    bail!("message {} not found", message_id);
                }
            }
            ctx.prompts.save(&prompt).context("save prompt failed")?;
        }
        PromptCommand::RemoveMessage { id, message_id } => {
            let mut prompt = load_prompt(ctx, &id)?;
            if !prompt.remove_message(&message_id) {
                bail!("message {} not found", message_id);
            }
            ctx.prompts.save(&prompt).context("save prompt failed")?;
        }
        PromptCommand::Delete { id } => {
            if !ctx.prompts.delete(&id).context("delete prompt failed")? {
                bail!("prompt {} not found", id);
            }
        }
    }
    Ok(())
}

async fn run_command(
    mut ctx: AppContext<GatewayClient>,
    prompt_id: &str,
    model_ids: &[String],
    export_dir: Option<PathBuf>,
) -> Result<()> {
    if let Some(dir) = export_dir {
        ctx.exporter = Some(ResultExporter::new(dir));
    }
    let prompt = load_prompt(&ctx, prompt_id)?;
    let catalog_models = ctx.fetch_catalog().await.map_err(gateway_failure)?;
    let (models, missing) = catalog::select_models(&catalog_models, model_ids);
    if !missing.is_empty() {
        bail!("unknown model(s): {}", missing.join(", "));
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ProgressEvent>();
    let printer = async {
        while let Some(event) = rx.recv().await {
            eprintln!("  {:<40} {:?}", event.model_id, event.state);
        }
    };
    let (outcome, ()) =
        futures_util::future::join(ctx.run_tests(Some(&prompt), &models, Some(tx)), printer).await;
    let report = outcome?;

    for result in report.results() {
        println!("=== {} ({})", result.model_id, format_cost(result.cost));
        println!("{}", result.response);
        println!("result id={}", result.id);
    }
    Ok(())
}

fn results_command(ctx: &AppContext<GatewayClient>, cmd: ResultsCommand) -> Result<()> {
    match cmd {
        ResultsCommand::List { prompt } => {
            let results = match prompt {
                Some(prompt_id) => ctx.results.for_prompt(&prompt_id),
                None => ctx.results.list(),
            }
            .context("load results failed")?;
            for result in results {
                println!(
                    "{}\t{}\t{}\t{}",
                    result.id,
                    result.model_id,
                    format_cost(result.cost),
                    result.timestamp
                );
            }
        }
        ResultsCommand::Show { id } => {
            let result = load_result(ctx, &id)?;
            println!("{}", export::to_pretty_json(&result)?);
        }
        ResultsCommand::Delete { id } => {
            if !ctx.results.delete(&id).context("delete result failed")? {
                bail!("result {} not found", id);
            }
        }
        ResultsCommand::Export { id, dir } => {
            let result = load_result(ctx, &id)?;
            let path = ResultExporter::new(dir).write(&result)?;
            println!("Exported {}", path.display());
        }
        ResultsCommand::Snippet { id, lang } => {
            let credential = ctx
                .credential
                .current()?
                .context("an api key is required to build a snippet")?;
            let result = load_result(ctx, &id)?;
            let code = snippet::generate_snippet(
                &credential,
                ctx.gateway.base_url(),
                &result.model_id,
                &result.prompt,
                lang,
            )?;
            eprintln!("WARNING: {}", SNIPPET_SECRET_WARNING);
            println!("{}", code);
        }
        ResultsCommand::Config { id } => {
            let result = load_result(ctx, &id)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&export::prompt_config(&result))?
            );
        }
    }
    Ok(())
}
