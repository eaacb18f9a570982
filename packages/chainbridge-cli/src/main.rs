use anyhow::{Context, Result};
use chainbridge_core::{
    chain_adapter::DefaultConnectorFactory,
    proposal::{Proposal, ProposalStore},
    relayer::Relayer,
    Config,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tabled::{settings::Style, Table, Tabled};
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 验证并解析配置文件
    ValidateConfig {
        /// 配置文件路径（.json 或 .toml）
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// 启动中继器服务
    Start {
        /// 配置文件路径（.json 或 .toml）
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// 查看提案快照
    Proposals {
        /// 快照文件路径
        #[arg(short, long, value_name = "FILE")]
        store: PathBuf,
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },
}

#[derive(Tabled)]
struct ChainRow {
    #[tabled(rename = "ID")]
    id: u8,
    #[tabled(rename = "名称")]
    name: String,
    #[tabled(rename = "类型")]
    kind: String,
    #[tabled(rename = "节点")]
    endpoint: String,
    #[tabled(rename = "阈值")]
    threshold: usize,
    #[tabled(rename = "确认数")]
    confirmations: u64,
    #[tabled(rename = "提案有效期")]
    expiry: u64,
}

#[derive(Tabled)]
struct ProposalRow {
    #[tabled(rename = "源链")]
    source: u8,
    #[tabled(rename = "Nonce")]
    nonce: u64,
    #[tabled(rename = "资源")]
    resource: String,
    #[tabled(rename = "状态")]
    status: String,
    #[tabled(rename = "票数")]
    votes: usize,
    #[tabled(rename = "过期区块")]
    expires_at: u64,
}

impl From<&Proposal> for ProposalRow {
    fn from(p: &Proposal) -> Self {
        let key = p.key();
        Self {
            source: key.source,
            nonce: key.deposit_nonce,
            resource: key.resource_id.to_hex(),
            status: p.status().to_string(),
            votes: p.votes().len(),
            expires_at: p.expires_at_block(),
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// 等待 SIGINT 或 SIGTERM
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("无法监听 Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("无法监听 SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到 Ctrl+C，开始关闭"),
        _ = terminate => info!("收到 SIGTERM，开始关闭"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::ValidateConfig { config } => {
            info!("正在验证配置文件: {:?}", config);
            let config = Config::load(&config).with_context(|| format!("配置文件 {:?} 无效", config))?;
            println!("配置文件验证成功!");
            println!("- 链:");
            let rows: Vec<ChainRow> = config
                .chains
                .iter()
                .map(|c| ChainRow {
                    id: c.id,
                    name: c.name.clone(),
                    kind: c.kind.to_string(),
                    endpoint: c.endpoint.clone(),
                    threshold: c.threshold,
                    confirmations: c.block_confirmations,
                    expiry: c.proposal_expiry,
                })
                .collect();
            println!("{}", Table::new(rows).with(Style::modern()));
            println!("- 中继器配置:");
            println!("  - 最大重试次数: {}", config.relayer.max_retries);
            println!(
                "  - 退避区间: {}ms ~ {}ms",
                config.relayer.initial_backoff_ms, config.relayer.max_backoff_ms
            );
            println!("  - 加价比例: {}%", config.relayer.gas_bump_percent);
            println!("  - 上链等待超时: {}秒", config.relayer.inclusion_timeout_secs);
            println!("  - 并发处理上限: {}", config.relayer.max_in_flight);
            Ok(())
        }
        Commands::Start { config } => {
            info!("正在启动中继器服务");
            info!("使用配置文件: {:?}", config);

            let config = Config::load(&config)?;
            let relayer = Relayer::new(config, &DefaultConnectorFactory).await?;
            info!("中继器初始化成功，开始运行...");

            if let Err(e) = relayer.run(wait_for_shutdown_signal()).await {
                error!("中继器服务异常退出: {}", e);
                return Err(e.into());
            }

            Ok(())
        }
        Commands::Proposals { store, json } => {
            // 只读查看，链 id 与阈值不影响快照内容
            let proposals = ProposalStore::load(&store, 0, 1, 1)
                .await
                .with_context(|| format!("无法读取提案快照 {:?}", store))?
                .snapshot()
                .await;
            if json {
                println!("{}", serde_json::to_string_pretty(&proposals)?);
            } else if proposals.is_empty() {
                println!("快照中没有提案");
            } else {
                let rows: Vec<ProposalRow> = proposals.iter().map(ProposalRow::from).collect();
                println!("{}", Table::new(rows).with(Style::modern()));
            }
            Ok(())
        }
    }
}
