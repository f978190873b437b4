use accountgeo::app::{App, open_cache, open_storage};
use accountgeo::cli::{Args, Command};
use accountgeo::config::Config;
use accountgeo::coordinator::{ResolveError, ResolveOptions};
use accountgeo::logging::setup_logging;
use clap::Parser;
use futures::future::join_all;
use serde_json::json;
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Config comes before logging so startup logs are never silently dropped
    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };
    setup_logging(&config, args.tracing);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT_SHORT"),
        "starting accountgeo"
    );

    match run(config, args.command).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = ?e, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, command: Command) -> anyhow::Result<ExitCode> {
    match command {
        Command::Resolve { names, force } => {
            let app = App::new(config).await?;
            let options = ResolveOptions { force };
            let coordinator = app.coordinator().clone();

            let results = join_all(names.iter().map(|name| {
                let coordinator = coordinator.clone();
                async move { (name, coordinator.resolve(name, options).await) }
            }))
            .await;

            let mut failed = false;
            for (name, result) in results {
                let line = match result {
                    Ok(Some(resolution)) => json!({
                        "name": name,
                        "status": if resolution.has_location() { "found" } else { "unknown" },
                        "location": resolution.location,
                        "locationAccurate": resolution.location_accurate,
                    }),
                    Ok(None) => json!({ "name": name, "status": "unknown" }),
                    Err(e) => {
                        failed = true;
                        let message = match &e {
                            ResolveError::Fetch { source, .. } => format!("{e}: {source}"),
                            ResolveError::Shutdown { .. } => e.to_string(),
                        };
                        json!({ "name": name, "status": "error", "error": message })
                    }
                };
                println!("{line}");
            }

            info!(stats = ?app.coordinator().stats(), "resolution finished");
            app.shutdown().await;
            Ok(if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Command::Peek { name } => {
            let cache = open_cache(&config, open_storage(&config).await?).await;
            let line = json!({
                "name": name,
                "usable": cache.peek(&name),
                "location": cache.location(&name).flatten(),
                "hasProfile": cache.profile(&name).is_some(),
            });
            println!("{line}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Clear { name } => {
            let cache = open_cache(&config, open_storage(&config).await?).await;
            match name {
                Some(name) => cache.clear_one(&name).await,
                None => cache.clear_all().await,
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Stats => {
            let cache = open_cache(&config, open_storage(&config).await?).await;
            let line = json!({
                "cachedLocations": cache.len(),
                "cachedProfiles": cache.profile_count(),
                "maxCacheSize": config.max_cache_size,
                "storage": config.storage_dir.join(format!("{}.json", config.storage_key)),
            });
            println!("{line}");
            Ok(ExitCode::SUCCESS)
        }
    }
}
