use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use harbor_session::{
    Listener, ReadinessOptions, ReadinessTracker, Session, SessionEndpoints, SessionOptions,
    SocketIoTransport,
};
use harbor_spawn::{SpawnClient, SpawnResult};
use tracing::{info, warn};

use crate::cli::{ConnectArgs, MessagingArgs, RunArgs, SpawnArgs, WaitArgs};

pub async fn spawn(args: SpawnArgs) -> Result<()> {
    let result = spawn_backend(&args).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

pub async fn wait(args: WaitArgs) -> Result<()> {
    let options = readiness_options(args.timeout);
    let tracker = ReadinessTracker::from_status_url(&args.status_url, options)
        .context("failed to start readiness check")?;
    let outcome = tracker.wait().await;
    for event in tracker.statuses() {
        println!("{}\t{}", event.time, event.state);
    }
    outcome.with_context(|| format!("backend at {} did not become ready", args.status_url))?;
    println!("ready");
    Ok(())
}

pub async fn connect(args: ConnectArgs) -> Result<()> {
    let endpoints = SessionEndpoints::parse(&args.url, &args.status_url)?;
    let tracker = ReadinessTracker::from_status_url(
        &endpoints.status_url,
        readiness_options(args.messaging.ready_timeout),
    )?;
    let transport = SocketIoTransport::new(&endpoints.url).with_bearer_token(args.bearer_token);
    let session = Session::from_parts(tracker, Arc::new(transport), endpoints);
    converse(&session, &args.messaging).await
}

pub async fn run(args: RunArgs) -> Result<()> {
    let result = spawn_backend(&args.spawn).await?;
    let options = SessionOptions::default()
        .with_readiness(readiness_options(args.messaging.ready_timeout));
    let session = Session::open(&result, options)?;
    converse(&session, &args.messaging).await
}

async fn spawn_backend(args: &SpawnArgs) -> Result<SpawnResult> {
    let client = SpawnClient::new(args.control_plane.to_config()?)?;
    let result = client
        .spawn(&args.service, &args.to_request())
        .await
        .with_context(|| format!("failed to spawn a backend for '{}'", args.service))?;
    info!(
        target = "harbor::probe",
        name = %result.name,
        url = %result.url,
        spawned = result.spawned,
        "backend assigned"
    );
    Ok(result)
}

pub fn readiness_options(timeout_secs: Option<u64>) -> ReadinessOptions {
    ReadinessOptions::default().with_ready_timeout(timeout_secs.map(Duration::from_secs))
}

/// Register listeners and sends before readiness so they go through the
/// buffered path, then stay connected until the linger time or ctrl-c.
async fn converse(session: &Session, messaging: &MessagingArgs) -> Result<()> {
    for event in &messaging.listen {
        let name = event.clone();
        session.add_listener(
            event,
            Listener::new(move |payload| println!("{name}\t{payload}")),
        );
    }
    for (event, payload) in &messaging.send {
        session.send(event, payload);
    }

    if let Err(err) = session.wait_ready().await {
        session.destroy();
        bail!("backend did not become ready: {err}");
    }
    eprintln!("ready; connected to {}", session.url());

    match messaging.linger {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(target = "harbor::probe", error = %err, "ctrl-c handler failed");
            }
        }
    }
    session.destroy();
    Ok(())
}
