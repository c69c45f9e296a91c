/// 命令行定义
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "relay-tunnel", version, about = "Multi-protocol tunneling proxy")]
pub struct Cli {
    /// 日志详细程度（-v info, -vv debug, -vvv trace）
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 启动服务
    Serve {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,
    },

    /// 校验配置文件
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,
    },
}
