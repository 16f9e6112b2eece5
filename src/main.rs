// ABOUTME: CLI entrypoint for the notedown command
// ABOUTME: Handles error exit codes and command dispatch

use clap::Parser;
use notedown::api::ApiClient;
use notedown::archive::import_dir;
use notedown::auth::resolve_token;
use notedown::cli::{Cli, Commands};
use notedown::config::Config;
use notedown::convert::Converter;
use notedown::storage::Store;
use notedown::sync::{SyncOptions, Syncer};
use notedown::{Error, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("notedown: [E{}] {}", e.exit_code(), e);
        std::process::exit(e.exit_code());
    }
}

async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("notedown=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("config.json"));
    let mut config = Config::load(Some(&config_path))?;

    if let Some(api_base) = &cli.api_base {
        config.api.server = Some(api_base.clone());
    }
    if let Some(kb) = &cli.kb {
        config.api.kb_guid = Some(kb.clone());
    }
    if let Some(output) = &cli.output {
        config.download.output_dir = output.clone();
    }

    match cli.command() {
        Commands::Sync {
            folders,
            incremental,
            no_convert,
            flat,
            concurrency,
            no_attachments,
            no_frontmatter,
        } => {
            let client = Arc::new(build_client(&cli, &config)?);
            let store = Arc::new(Store::open(
                &config.download.output_dir,
                config.format.preserve_structure && !flat,
            )?);

            let converter = if config.format.convert_to_markdown && !no_convert {
                Some(Converter::new(
                    config.format.extract_images,
                    config.format.add_metadata && !no_frontmatter,
                ))
            } else {
                None
            };

            let syncer = Syncer::new(
                client,
                store.clone(),
                converter,
                SyncOptions {
                    team: config.sync.team.clone(),
                    incremental: config.sync.incremental || incremental,
                    exclude: config.sync.exclude_folders.clone(),
                    max_concurrent: concurrency.unwrap_or(config.download.max_concurrent),
                    download_attachments: config.download.download_attachments && !no_attachments,
                },
            );

            let cancel = syncer.cancel_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, finishing the current folder");
                    cancel.store(true, Ordering::Relaxed);
                }
            });

            let stats = syncer.run(&folders).await?;
            print!("{}", stats.render_report(&store.statistics()));
        }
        Commands::Folders => {
            let client = build_client(&cli, &config)?;
            for folder in client.list_folders().await? {
                println!("{}", folder);
            }
        }
        Commands::Import { dir, team } => {
            let store = Store::open(
                &config.download.output_dir,
                config.format.preserve_structure,
            )?;
            let converter = if config.format.convert_to_markdown {
                Some(Converter::new(
                    config.format.extract_images,
                    config.format.add_metadata,
                ))
            } else {
                None
            };

            let stats = import_dir(&dir, &store, converter.as_ref(), &team)?;
            print!("{}", stats.render_report(&store.statistics()));
        }
    }

    Ok(())
}

fn build_client(cli: &Cli, config: &Config) -> Result<ApiClient> {
    let server = config
        .api
        .server
        .clone()
        .ok_or_else(|| Error::Config("kb server not set (--api-base or config api.server)".into()))?;
    let kb_guid = config
        .api
        .kb_guid
        .clone()
        .ok_or_else(|| Error::Config("kb guid not set (--kb or config api.kb_guid)".into()))?;
    let token = resolve_token(cli.token.clone())?;

    ApiClient::with_timeout(
        token,
        kb_guid,
        server,
        Duration::from_secs(config.api.timeout_secs),
    )
}
