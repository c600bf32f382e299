use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "rucert - 实时证书透明度(CT)子域监控与验证工具",
    long_about = "NAME:\n  rucert - 实时证书透明度(CT)子域监控与验证工具\n\nUSAGE:\n  rucert <SUBCOMMAND> [OPTIONS]\n\nCOMMANDS:\n  start (s)   连接 certstream,按通配符过滤新证书域名并做 DNS/HTTP 验证\n  version     打印版本信息\n\n说明:\n  - 通配符来源由配置文件中的 apis 列表定义,定期刷新。\n  - 命中后执行 DNS 解析、内网 IP 过滤、HTTP 存活探测,再推送 Discord 通知与指纹识别任务。\n  - 无法解析的域名进入重试队列,按计划任务定期重试。\n\n快速示例:\n  rucert start --config config.yaml\n  rucert start --config config.yaml --log-level debug"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 启动监控 (start) - certstream 摄取、通配符过滤、验证与通知
    #[command(alias = "s")]
    Start(StartArgs),
    /// 打印版本信息
    Version,
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// 配置文件路径
    #[arg(long = "config", default_value = "config.yaml")]
    pub config: PathBuf,

    /// 日志级别: error|warn|info|debug|trace (覆盖配置文件)
    #[arg(long = "log-level", value_parser = ["error", "warn", "info", "debug", "trace"])]
    pub log_level: Option<String>,
}
