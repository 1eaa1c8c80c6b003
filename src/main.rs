use anyhow::{Context, Result};
use clap::Parser;
use resumable_uploader::{
    config::UploaderConfig,
    events::UploadEvent,
    logging,
    uploader::{FileSource, HttpTransport, LocalFileSource, UploadSession},
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "resumable-uploader")]
#[command(about = "分片断点续传上传工具", long_about = None)]
struct Cli {
    /// 配置文件路径
    #[arg(long, short, default_value = "config/uploader.toml")]
    config: String,

    /// 覆盖配置中的上传地址
    #[arg(long, short)]
    target: Option<String>,

    /// 以 JSON 输出上传结果
    #[arg(long)]
    json: bool,

    /// 要上传的文件
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = UploaderConfig::load_or_default(&cli.config).await;
    let _log_guard = logging::init_logging(&config.log);

    info!("resumable-uploader v{} 启动", env!("CARGO_PKG_VERSION"));

    if let Some(target) = cli.target {
        config.upload.target = target;
    }

    let transport = Arc::new(HttpTransport::new(Arc::new(config.upload.clone()))?);
    let session = UploadSession::new(config.upload, transport)?;
    let mut events = session.subscribe();

    let mut sources: Vec<Arc<dyn FileSource>> = Vec::with_capacity(cli.files.len());
    for path in &cli.files {
        let source = LocalFileSource::open(path)
            .await
            .with_context(|| format!("无法打开文件: {:?}", path))?
            .with_relative_path(path.to_string_lossy());
        sources.push(Arc::new(source));
    }

    let report = session.add_sources(sources).await?;
    for rejected in &report.rejected {
        warn!("跳过文件: {}", rejected);
    }
    for name in &report.skipped {
        warn!("跳过重复文件: {}", name);
    }
    if report.added.is_empty() {
        anyhow::bail!("没有可上传的文件");
    }

    session.start();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(UploadEvent::Progress { progress }) => {
                    info!("总进度: {:.1}%", progress * 100.0);
                }
                Some(UploadEvent::FileSuccess { file_id, .. }) => {
                    info!("文件上传成功: {}", file_id);
                }
                Some(UploadEvent::FileError { file_id, message }) => {
                    error!("文件上传失败: {}, 错误: {}", file_id, message);
                }
                Some(UploadEvent::Complete) | None => break,
                Some(_) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("收到中断信号，取消上传");
                session.cancel_all();
                anyhow::bail!("上传已取消");
            }
        }
    }

    let files = session.files();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&files)?);
    } else {
        for file in &files {
            match &file.error {
                Some(message) => println!("✗ {} ({} bytes): {}", file.relative_path, file.size, message),
                None => println!(
                    "✓ {} ({} bytes, {} 个分片)",
                    file.relative_path, file.size, file.total_chunks
                ),
            }
        }
    }

    let failed = files.iter().filter(|f| f.error.is_some()).count();
    if failed > 0 {
        anyhow::bail!("{} 个文件上传失败", failed);
    }

    info!("全部 {} 个文件上传完成", files.len());
    Ok(())
}
