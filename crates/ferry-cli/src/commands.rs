use anyhow::Context;
use chrono::{TimeZone, Utc};
use colored::Colorize;
use ferry_protocol::ProtocolServer;
use ferry_storage::{
    FerryConfig, ListOptions, PathCreateOptions, ReadOptions, Storage, StorageContext,
    StorageHandler, WriteOptions, RESULT_HASH, RESULT_REPO_SIZE, RESULT_SIZE,
};
use ferry_transport::BoxChannel;
use ferry_types::{StorageInfo, StorageType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::cli::*;

const PUT_CHUNK: usize = 1024 * 1024;

pub async fn run_command(cli: Cli, config: FerryConfig) -> anyhow::Result<()> {
    let context = StorageContext::new(config);
    let result = dispatch(&context, cli).await;
    // release connections and reap remote processes even when the command failed
    let closed = context.close().await;
    result?;
    Ok(closed?)
}

async fn dispatch(context: &StorageContext, cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Ls(args) => cmd_ls(context, args, &cli.format).await,
        Command::Info(args) => cmd_info(context, args, &cli.format).await,
        Command::Get(args) => cmd_get(context, args).await,
        Command::Put(args) => cmd_put(context, args).await,
        Command::Rm(args) => {
            let repo = context.repo(true).await?;
            repo.remove(&args.path, !args.force).await?;
            println!("{} Removed {}", "✓".green(), args.path.bold());
            Ok(())
        }
        Command::Mkdir(args) => cmd_mkdir(context, args).await,
        Command::Rmdir(args) => {
            let repo = context.repo(true).await?;
            repo.path_remove(&args.path, args.recurse).await?;
            println!("{} Removed path {}", "✓".green(), args.path.bold());
            Ok(())
        }
        Command::Cp(args) => cmd_cp(context, args).await,
        Command::Remote => cmd_remote(context).await,
    }
}

fn format_time(time: i64) -> String {
    match Utc.timestamp_opt(time, 0).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "-".into(),
    }
}

/// One listing line: type code, size, modification time, name.
fn format_entry(info: &StorageInfo) -> String {
    let name = match info.kind {
        StorageType::Path => format!("{}/", info.name).blue().bold().to_string(),
        StorageType::Link => match &info.link_destination {
            Some(target) => format!("{} -> {target}", info.name.cyan()),
            None => info.name.cyan().to_string(),
        },
        _ => info.name.clone(),
    };
    format!(
        "{} {:>12} {} {}",
        info.kind.code(),
        info.size,
        format_time(info.time_modified).dimmed(),
        name
    )
}

fn parse_mode(mode: &str) -> anyhow::Result<u32> {
    u32::from_str_radix(mode, 8).with_context(|| format!("invalid octal mode '{mode}'"))
}

async fn cmd_ls(context: &StorageContext, args: LsArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let repo = context.repo(false).await?;
    let mut options = ListOptions::new();
    if let Some(filter) = args.filter {
        options = options.pattern(filter);
    }
    if args.recurse {
        options = options.recurse();
    }
    let entries = repo.info_list(&args.path, &options).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Text => {
            for entry in &entries {
                println!("{}", format_entry(entry));
            }
        }
    }
    Ok(())
}

async fn cmd_info(context: &StorageContext, args: InfoArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let repo = context.repo(false).await?;
    let info = repo.info(&args.path, !args.no_follow).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&info)?),
        OutputFormat::Text => {
            println!("{}", repo.path_of(&args.path)?.bold());
            println!("  Type: {:?}", info.kind);
            println!("  Size: {}", info.size);
            println!("  Modified: {}", format_time(info.time_modified));
            if let Some(mode) = info.mode {
                println!("  Mode: {mode:04o}");
            }
            if let (Some(user), Some(group)) = (&info.user, &info.group) {
                println!("  Owner: {user}:{group}");
            }
            if let Some(etag) = &info.etag {
                println!("  ETag: {}", etag.yellow());
            }
        }
    }
    Ok(())
}

async fn cmd_get(context: &StorageContext, args: GetArgs) -> anyhow::Result<()> {
    let repo = context.repo(false).await?;
    let mut options = ReadOptions::new().range(args.offset, args.limit);
    if args.ignore_missing {
        options = options.ignore_missing();
    }
    let mut read = repo.open_read(&args.path, options).await?;
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = read.read().await? {
        stdout.write_all(&chunk).await?;
    }
    stdout.flush().await?;
    read.close().await?;
    Ok(())
}

async fn cmd_put(context: &StorageContext, args: PutArgs) -> anyhow::Result<()> {
    let repo = context.repo(true).await?;
    let mut input: Box<dyn tokio::io::AsyncRead + Unpin + Send> = match &args.source {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("unable to open '{}'", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    let mut options = WriteOptions::new();
    if args.raw {
        options = options.incompressible();
    }
    let mut write = repo.open_write(&args.path, options).await?;
    let mut buffer = vec![0u8; PUT_CHUNK];
    loop {
        let read = input.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        write.write(&buffer[..read]).await?;
    }
    let results = write.close().await?;
    println!(
        "{} Stored {} ({} bytes, {} in repository)",
        "✓".green().bold(),
        args.path.bold(),
        results.size(RESULT_SIZE).unwrap_or(0),
        results.size(RESULT_REPO_SIZE).unwrap_or(0)
    );
    if let Some(hash) = results.hash(RESULT_HASH) {
        println!("  SHA-256: {}", hash.yellow());
    }
    Ok(())
}

async fn cmd_mkdir(context: &StorageContext, args: MkdirArgs) -> anyhow::Result<()> {
    let repo = context.repo(true).await?;
    let options = PathCreateOptions {
        mode: args.mode.as_deref().map(parse_mode).transpose()?,
        error_on_exists: false,
        recurse: args.parents,
    };
    repo.path_create(&args.path, options).await?;
    println!("{} Created path {}", "✓".green(), args.path.bold());
    Ok(())
}

async fn cmd_cp(context: &StorageContext, args: CpArgs) -> anyhow::Result<()> {
    let repo = context.repo(true).await?;
    let copied = Storage::copy(
        repo.open_read(&args.from, ReadOptions::new()).await?,
        repo.open_write(&args.to, WriteOptions::new()).await?,
    )
    .await?;
    if copied {
        println!("{} Copied {} → {}", "✓".green(), args.from.bold(), args.to.bold());
    }
    Ok(())
}

/// Serve the protocol on stdin/stdout until the client exits.
async fn cmd_remote(context: &StorageContext) -> anyhow::Result<()> {
    let driver = context.driver().await?;
    tracing::info!(
        target: "ferry::cli",
        driver = driver.name(),
        root = driver.root(),
        "serving remote storage"
    );
    let channel: BoxChannel = Box::new(tokio::io::join(tokio::io::stdin(), tokio::io::stdout()));
    let end = ProtocolServer::new(StorageHandler::new(driver)).serve(channel).await?;
    tracing::debug!(target: "ferry::cli", ?end, "remote session finished");
    Ok(())
}
