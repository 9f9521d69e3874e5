use anyhow::{Context, Result};
use apphost_config::{Config, EnvVars, load_secrets};
use comfy_table::{Cell, Color, Table};
use futures::future::select;
use futures::stream::{self, StreamExt};
use service_orchestration::{
    Deployment, MemorySecretStore, Orchestrator, ReadinessState, ResourceStatus, Shutdown,
};
use std::path::Path;
use std::pin::pin;
use tracing::{info, warn};

pub async fn run(config_path: &Path, config: &Config, follow_logs: bool) -> Result<()> {
    let model = config
        .to_model_with(&EnvVars::from_process())
        .context("Failed to build app model")?;

    let secrets = load_secrets(config, config_path).context("Failed to load secrets")?;
    let missing = config.missing_secrets(&secrets);
    if !missing.is_empty() {
        warn!("Secret store keys not found: {}", missing.join(", "));
    }
    let store = secrets
        .into_iter()
        .fold(MemorySecretStore::new(), |store, (key, value)| store.with(key, value));

    let orchestrator = Orchestrator::new(model).with_secret_store(store);
    let plan = orchestrator.plan()?;

    let shutdown = Shutdown::new();
    watch_signals(&shutdown)?;

    println!(
        "Starting {} resources in {} batches...",
        plan.len(),
        plan.batches().len()
    );
    let deployment = orchestrator.run(&plan, &shutdown).await?;
    display_status(&deployment.status());

    let report = deployment.report();
    for (name, cause) in &report.failed {
        eprintln!("  ✗ {}: {}", name, cause);
    }

    if report.ready.is_empty() || shutdown.is_triggered() {
        warn!("No resource left running");
    } else {
        println!("Press Ctrl+C to stop");
        if follow_logs {
            follow(&deployment, &report.ready, &shutdown).await?;
        } else {
            shutdown.wait().await;
        }
    }

    println!("Stopping resources...");
    deployment
        .shutdown()
        .await
        .context("Failed to stop every resource")?;
    println!("✓ All resources stopped");

    report.into_result()?;
    Ok(())
}

/// Print the merged logs of `names` until shutdown
async fn follow(deployment: &Deployment, names: &[String], shutdown: &Shutdown) -> Result<()> {
    let mut streams = Vec::with_capacity(names.len());
    for name in names {
        let prefix = name.clone();
        let lines = deployment.logs(name).await?;
        streams.push(lines.map(move |line| format!("[{}] {}", prefix, line)));
    }

    let printer = async {
        let mut merged = stream::select_all(streams);
        while let Some(line) = merged.next().await {
            println!("{}", line);
        }
        // Every log ended; keep running until asked to stop
        shutdown.wait().await;
    };
    select(pin!(printer), pin!(shutdown.wait())).await;
    Ok(())
}

#[cfg(unix)]
fn watch_signals(shutdown: &Shutdown) -> Result<()> {
    use signal_hook::{
        consts::{SIGINT, SIGTERM},
        iterator::Signals,
    };

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("Failed to register signal handlers")?;
    let shutdown = shutdown.clone();

    std::thread::spawn(move || {
        for (received, signal) in signals.forever().enumerate() {
            if received == 0 {
                info!("Received signal {}, shutting down", signal);
                shutdown.trigger();
            } else {
                eprintln!("Forced exit");
                std::process::exit(130);
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn watch_signals(_shutdown: &Shutdown) -> Result<()> {
    Ok(())
}

fn display_status(statuses: &[ResourceStatus]) {
    let mut table = Table::new();
    table.set_header(vec!["RESOURCE", "KIND", "STATE", "PID/CONTAINER", "ENDPOINTS"]);

    for status in statuses {
        let color = match status.state {
            ReadinessState::Pending | ReadinessState::Stopped => Color::DarkGrey,
            ReadinessState::Starting => Color::Yellow,
            ReadinessState::Ready => Color::Green,
            ReadinessState::Failed => Color::Red,
        };
        let state = match &status.failure {
            Some(failure) => format!("{} ({})", status.state, failure),
            None => status.state.to_string(),
        };

        let process_info = if let Some(pid) = status.pid {
            format!("PID {}", pid)
        } else if let Some(container) = &status.container_id {
            format!("Container {}", container.chars().take(12).collect::<String>())
        } else {
            "-".to_string()
        };

        let endpoints = if status.endpoints.is_empty() {
            "-".to_string()
        } else {
            status
                .endpoints
                .iter()
                .map(|(name, url)| format!("{}={}", name, url))
                .collect::<Vec<_>>()
                .join(", ")
        };

        table.add_row(vec![
            Cell::new(&status.name),
            Cell::new(&status.kind),
            Cell::new(state).fg(color),
            Cell::new(process_info),
            Cell::new(endpoints),
        ]);
    }

    println!("{}", table);
}
