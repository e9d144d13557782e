use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use order_sync::{
    load_settings, load_settings_from,
    view::{action_label, source_label},
    workflow, AuthClient, AuthSession, FileCredentialStore, KanbanView, LiveChannel, Settings,
    SyncEngine, SyncError, SyncEvent, ViewProjector,
};
use rust_decimal::Decimal;
use shared::{
    domain::{OrderId, OrderSource, OrderStatus},
    protocol::NewOrder,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// TOML settings file; defaults to ./order_sync.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    api_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        email: String,
        #[arg(long)]
        password: String,
    },
    Logout,
    /// Prints the current board once.
    List,
    Create {
        customer_name: String,
        customer_email: String,
        total_amount: Decimal,
        #[arg(long, default_value = "manual")]
        source: String,
    },
    SetStatus {
        order_id: i64,
        status: OrderStatus,
    },
    /// Keeps the board live until Ctrl-C.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => load_settings_from(Some(path.as_path())),
        None => load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(api_url) = cli.api_url {
        settings.api_url = api_url;
    }

    let auth = Arc::new(AuthSession::new(Arc::new(FileCredentialStore::new(
        &settings.credentials_path,
    ))));
    auth.init().await;

    match cli.command {
        Command::Login { email, password } => {
            let client = AuthClient::new(settings.auth_url.clone(), settings.request_timeout)?;
            let credentials = client.login(&email, &password).await?;
            let role = credentials.user.role;
            auth.sign_in(credentials)
                .await
                .context("failed to persist credentials")?;
            println!("signed in as {email} ({role})");
        }
        Command::Logout => {
            auth.teardown().await.context("failed to clear credentials")?;
            println!("signed out");
        }
        Command::List => {
            let engine = SyncEngine::from_settings(&settings, Arc::clone(&auth))?;
            engine.initialize().await?;
            render(&ViewProjector::project(&engine.store().list()));
        }
        Command::Create {
            customer_name,
            customer_email,
            total_amount,
            source,
        } => {
            let engine = SyncEngine::from_settings(&settings, Arc::clone(&auth))?;
            let created = engine
                .create_order(NewOrder {
                    customer_name,
                    customer_email,
                    total_amount,
                    source: OrderSource::from(source),
                })
                .await?;
            println!(
                "created order #{} for {} ({:.2})",
                created.id, created.customer_name, created.total_amount
            );
        }
        Command::SetStatus { order_id, status } => {
            set_status(&settings, auth, OrderId(order_id), status).await?;
        }
        Command::Watch => watch(&settings, auth).await?,
    }

    Ok(())
}

async fn set_status(
    settings: &Settings,
    auth: Arc<AuthSession>,
    order_id: OrderId,
    status: OrderStatus,
) -> Result<()> {
    let role = auth.role().await.ok_or(SyncError::AuthMissing)?;
    let engine = SyncEngine::from_settings(settings, auth)?;
    engine.initialize().await?;

    match engine.request_status_change(order_id, status, role).await {
        Ok(order) => {
            println!("order #{} is now {}", order.id, order.status);
            Ok(())
        }
        Err(SyncError::InvalidTransition { from, .. }) | Err(SyncError::NotPermitted { from, .. }) => {
            let options = workflow::allowed_targets_for(role, from)
                .into_iter()
                .filter_map(|target| {
                    workflow::classify(from, target)
                        .map(|action| format!("{} ({target})", action_label(action, target)))
                })
                .collect::<Vec<_>>();
            if options.is_empty() {
                println!("order #{order_id} ({from}) has no moves available to a {role}");
            } else {
                println!(
                    "cannot move order #{order_id} from {from} to {status}; available: {}",
                    options.join(", ")
                );
            }
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn watch(settings: &Settings, auth: Arc<AuthSession>) -> Result<()> {
    let engine = SyncEngine::from_settings(settings, auth)?;
    let store = engine.store();
    let subscription = ViewProjector::attach(&store, |view| render(&view));

    let mut events = engine.subscribe_events();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SyncEvent::Error(message) => eprintln!("sync error: {message}"),
                SyncEvent::RolledBack { order_id, restored } => {
                    eprintln!("order #{order_id} rolled back to {restored}")
                }
                _ => {}
            }
        }
    });

    let channel = LiveChannel::spawn(Arc::clone(&engine), settings)?;
    info!("console: watching orders, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    channel.close();
    store.unsubscribe(subscription);
    reporter.abort();
    Ok(())
}

fn render(view: &KanbanView) {
    println!();
    for column in &view.columns {
        println!("== {} ({}) ==", column.title(), column.count());
        for order in &column.orders {
            println!(
                "  #{:<5} {:<24} {:<28} {:>10.2}  {:<12} {}",
                order.id,
                order.customer_name,
                order.customer_email,
                order.total_amount,
                source_label(&order.source),
                order.created_at.format("%Y-%m-%d %H:%M"),
            );
        }
    }
    println!("total: {}", view.total());
}
