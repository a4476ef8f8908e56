//! downbit 命令行入口：下载、续传、删除和列出下载任务。

use clap::{Parser, Subcommand};
use downbit::{DownloadId, DownloadInfo, Downloader, DownloaderConfig, Outcome, SessionHandle};
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;

/// 可暂停、可断点续传的多线程分块下载器。
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 下载目录，默认为 ~/Downloads/DownBitDownloads
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// 下载记录文件，默认为 ~/DownBit/database/downloads.json
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 开始下载一个 URL。按 Ctrl-C 暂停并保存进度。
    Get { url: String },
    /// 续传一个已暂停的下载。
    Resume { id: DownloadId },
    /// 删除一个下载及其部分文件。
    Cancel { id: DownloadId },
    /// 列出所有下载记录。
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> downbit::Result<()> {
    let mut config = DownloaderConfig::default();
    if let Some(dir) = args.dir {
        config.download_dir = dir;
    }
    if let Some(store) = args.store {
        config.store_path = store;
    }
    let downloader = Downloader::new(config, reqwest::ClientBuilder::new)?;

    match args.command {
        Command::Get { url } => {
            spawn_progress_printer(&downloader);
            let handle = downloader.start(url).await?;
            println!("下载 ID: {}", handle.id());
            drive(handle).await
        }
        Command::Resume { id } => {
            spawn_progress_printer(&downloader);
            drive(downloader.resume(id).await?).await
        }
        Command::Cancel { id } => {
            downloader.cancel_by_id(id).await?;
            println!("已删除 {id}");
            Ok(())
        }
        Command::List => {
            for record in downloader.list().await? {
                let total = record
                    .total_size()
                    .map_or_else(|| "?".to_string(), |t| t.to_string());
                println!(
                    "{}  {:<9}  {}/{}  {}",
                    record.id,
                    format!("{:?}", record.status),
                    record.downloaded,
                    total,
                    record.file_name
                );
            }
            Ok(())
        }
    }
}

/// 等待会话结束；期间收到 Ctrl-C 则暂停。
async fn drive(handle: SessionHandle) -> downbit::Result<()> {
    let id = handle.id();
    let pause = handle.pause_signal();
    let wait = handle.wait();
    tokio::pin!(wait);

    let outcome = tokio::select! {
        outcome = &mut wait => outcome?,
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl-C，正在暂停...");
            pause.cancel();
            wait.await?
        }
    };
    match outcome {
        Outcome::Finished => println!("\n下载完成: {id}"),
        Outcome::Paused => println!("\n下载已暂停，使用 `downbit resume {id}` 继续。"),
        Outcome::Cancelled => println!("\n下载已取消: {id}"),
    }
    Ok(())
}

fn spawn_progress_printer(downloader: &Downloader) {
    let mut info_rx = downloader.subscribe();
    tokio::spawn(async move {
        while let Ok(info) = info_rx.recv().await {
            match info {
                DownloadInfo::Progress { fraction, speed, downloaded, total, .. } => match total {
                    Some(_) => eprint!(
                        "\r下载进度: {:6.2}%, 速度: {:8.2} MB/s",
                        fraction * 100.0,
                        speed / 1024.0 / 1024.0
                    ),
                    None => eprint!(
                        "\r已下载: {downloaded} 字节, 速度: {:8.2} MB/s",
                        speed / 1024.0 / 1024.0
                    ),
                },
                DownloadInfo::ChunkFailed { chunk, error, .. } => {
                    eprintln!("\n块 {chunk} 失败: {error}")
                }
                _ => {}
            }
        }
    });
}
