use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use interop_core::{relayer::SendOptions, Bridge, Config, Payload};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabled::{Table, Tabled};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use unicode_width::UnicodeWidthStr;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, value_name = "FILE", global = true, default_value = "config.toml")]
    config: PathBuf,

    /// 状态快照文件：每次运行前恢复、结束后写回，保证通道序号跨进程不重复
    #[arg(long, value_name = "FILE", global = true, default_value = "interop-state.json")]
    state: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 验证并解析配置文件
    ValidateConfig,
    /// 启动中继器服务
    Start,
    /// 发送一笔跨链转账
    Transfer {
        #[arg(long)]
        to: String,
        #[arg(long)]
        asset: String,
        #[arg(long)]
        amount: u128,
        #[arg(long)]
        recipient: String,
        /// 指定源通道（IBC）
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        timeout_minutes: Option<u64>,
        /// 构建与提交的总期限，秒
        #[arg(long)]
        deadline: Option<u64>,
    },
    /// 发送一次远程调用
    Call {
        #[arg(long)]
        to: String,
        /// hex 编码的调用数据
        #[arg(long)]
        data: String,
        #[arg(long)]
        weight: u64,
        #[arg(long)]
        deadline: Option<u64>,
    },
    /// 从远端回读通道、路由和资产
    Sync {
        #[arg(long)]
        chain: String,
    },
    /// 在中继链上登记本平行链，并同步中继链高度
    RegisterParachain {
        #[arg(long)]
        chain: String,
        #[arg(long)]
        endpoint: String,
    },
}

#[derive(Tabled)]
struct ChainRow {
    #[tabled(rename = "链")]
    id: String,
    #[tabled(rename = "协议")]
    protocol: String,
    #[tabled(rename = "中继端点")]
    relayer_url: String,
    #[tabled(rename = "平行链")]
    parachain: String,
}

#[derive(Tabled)]
struct ChannelRow {
    #[tabled(rename = "通道")]
    channel: String,
    #[tabled(rename = "对端")]
    counterparty: String,
    #[tabled(rename = "状态")]
    state: String,
    #[tabled(rename = "下一序号")]
    next_sequence: u64,
}

#[derive(Tabled)]
struct AssetRow {
    #[tabled(rename = "资产")]
    id: String,
    #[tabled(rename = "名称")]
    name: String,
    #[tabled(rename = "原生链")]
    origin: String,
}

/// 按显示宽度截断，避免宽字符撑破表格
fn clip(text: &str, max: usize) -> String {
    if text.width() <= max {
        return text.to_string();
    }
    let mut out = String::new();
    for ch in text.chars() {
        if out.width() + 1 >= max {
            break;
        }
        out.push(ch);
    }
    out.push('…');
    out
}

fn print_summary(config: &Config) {
    let chains: Vec<ChainRow> = config
        .chains
        .iter()
        .map(|c| ChainRow {
            id: c.id.clone(),
            protocol: c.protocol.to_string(),
            relayer_url: clip(&c.relayer_url, 40),
            parachain: c.parachain_id.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
        })
        .collect();
    let channels: Vec<ChannelRow> = config
        .channels
        .iter()
        .map(|c| ChannelRow {
            channel: format!("{}/{}", c.port_id, c.channel_id),
            counterparty: format!("{} {}/{}", c.counterparty_chain, c.counterparty_port_id, c.counterparty_channel_id),
            state: c.state.to_string(),
            next_sequence: c.next_sequence,
        })
        .collect();
    let assets: Vec<AssetRow> = config
        .assets
        .iter()
        .map(|a| AssetRow {
            id: a.id.clone(),
            name: clip(&a.name, 24),
            origin: a.origin_chain.clone(),
        })
        .collect();

    println!("配置文件验证成功!");
    println!("本地链: {}", config.local_chain.id);
    println!("{}", Table::new(chains));
    if !channels.is_empty() {
        println!("{}", Table::new(channels));
    }
    if !assets.is_empty() {
        println!("{}", Table::new(assets));
    }
    println!("- 路由数量: {}", config.routes.len());
    println!("- 受信任链数量: {}", config.trusted_chains.len());
    println!("- 中继器配置:");
    println!("  - 轮询间隔: {}秒", config.relayer.poll_interval);
    println!("  - 最大重试次数: {}", config.relayer.max_retries);
    println!("  - 重试延迟: {}秒", config.relayer.retry_delay);
}

/// 创建桥并恢复上一次运行留下的状态
fn open_bridge(config: Config, state: &Path) -> Result<Bridge> {
    let bridge = Bridge::new(config)?;
    if bridge
        .load_state(state)
        .with_context(|| format!("恢复状态失败: {:?}", state))?
    {
        info!(path = ?state, "State restored");
    }
    Ok(bridge)
}

/// 无论命令成功与否都写回状态，已分配的序号不会在下次运行中重复
fn finish<T>(bridge: &Bridge, state: &Path, result: Result<T>) -> Result<T> {
    let saved = bridge
        .save_state(state)
        .with_context(|| format!("写入状态文件失败: {:?}", state));
    let value = result?;
    saved?;
    Ok(value)
}

/// 发送后短暂轮询一次，打印消息当前状态
async fn report(bridge: &Bridge, id: &str) -> Result<()> {
    let status = match bridge.poll(id, Some(Duration::from_secs(30))).await {
        Ok(status) => status,
        Err(e) => {
            error!(message_id = %id, error = %e, "Status poll failed");
            bridge.get_status(id)?
        }
    };
    println!("消息 ID: {}", id);
    println!("状态: {}", status);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    info!(config = ?cli.config, "Loading configuration");
    let config = Config::load(&cli.config)?;

    let state = cli.state;

    match cli.command {
        Commands::ValidateConfig => {
            print_summary(&config);
            Ok(())
        }
        Commands::Start => {
            let bridge = open_bridge(config, &state)?;
            info!("Relayer initialised, running");

            let result = tokio::select! {
                r = bridge.start() => r.map_err(anyhow::Error::from),
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    Ok(())
                }
            };
            if let Err(e) = &result {
                error!(error = %e, "Relayer exited with error");
            }
            finish(&bridge, &state, result)
        }
        Commands::Transfer {
            to,
            asset,
            amount,
            recipient,
            channel,
            timeout_minutes,
            deadline,
        } => {
            let bridge = open_bridge(config, &state)?;
            let options = SendOptions {
                channel,
                timeout_minutes,
                deadline: deadline.map(Duration::from_secs),
                memo: None,
            };
            let result: Result<()> = async {
                let payload = Payload::transfer(asset, amount, recipient)?;
                let id = bridge.send(&to, payload, options).await?;
                report(&bridge, &id).await
            }
            .await;
            finish(&bridge, &state, result)
        }
        Commands::Call {
            to,
            data,
            weight,
            deadline,
        } => {
            let bridge = open_bridge(config, &state)?;
            let options = SendOptions {
                deadline: deadline.map(Duration::from_secs),
                ..SendOptions::default()
            };
            let result: Result<()> = async {
                let id = bridge.send(&to, Payload::call(data, weight)?, options).await?;
                report(&bridge, &id).await
            }
            .await;
            finish(&bridge, &state, result)
        }
        Commands::Sync { chain } => {
            let bridge = open_bridge(config, &state)?;
            let result = bridge
                .sync_registries(&chain)
                .await
                .map_err(anyhow::Error::from);
            let report = finish(&bridge, &state, result)?;
            println!(
                "同步完成: 通道 {} 个, 路由 {} 个, 资产 {} 个",
                report.channels, report.routes, report.assets
            );
            Ok(())
        }
        Commands::RegisterParachain { chain, endpoint } => {
            let bridge = open_bridge(config, &state)?;
            let result: Result<u64> = async {
                bridge.register_parachain(&chain, &endpoint).await?;
                Ok(bridge.sync_relay_chain(&chain).await?)
            }
            .await;
            let height = finish(&bridge, &state, result)?;
            println!("已登记到 {}，同步高度 {}", chain, height);
            Ok(())
        }
    }
}
