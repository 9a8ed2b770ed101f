//! VisaHub CLI - a thin command-line front end over the client core.
//!
//! Handy for poking at the backend: sign in, issue authenticated requests
//! and watch live updates stream in.

use std::io::{self, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use visahub_core::{Config, HubClient, Topic};

const LOG_FILE: &str = "visahub.log";

const USAGE: &str = "\
Usage: visahub <command>

Commands:
  login [email]              Sign in (prompts for the password)
  logout                     Sign out and forget the saved session
  status                     Show the current session
  get <path>                 Authenticated GET, prints the JSON response
  watch <kind> [scope]       Print live updates for a topic until Ctrl-C
";

/// Initialize the tracing subscriber for logging.
///
/// Use RUST_LOG to control the level (e.g. RUST_LOG=visahub_core=debug).
/// When the cache directory is available, a copy goes to a daily log file.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut config = Config::load()?;
    let log_dir = config.cache_dir().ok();
    let _guard = init_tracing(log_dir.as_deref());

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprint!("{}", USAGE);
        return Ok(());
    };

    let client = HubClient::new(config.clone())?;
    client.restore().await?;
    info!(command, "VisaHub CLI starting");

    let result = match command {
        "login" => login(&client, &mut config, args.get(1).cloned()).await,
        "logout" => logout(&client).await,
        "status" => status(&client),
        "get" => match args.get(1) {
            Some(path) => get(&client, path).await,
            None => bail!("get needs a path\n\n{}", USAGE),
        },
        "watch" => match args.get(1) {
            Some(kind) => watch(&client, kind, args.get(2)).await,
            None => bail!("watch needs a topic kind\n\n{}", USAGE),
        },
        "help" | "--help" | "-h" => {
            print!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    };

    client.channel().disconnect().await;
    info!("VisaHub CLI shutting down");
    result
}

async fn login(client: &HubClient, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    if email.is_empty() {
        bail!("Email required");
    }
    let password = rpassword::prompt_password("Password: ")?;
    if password.is_empty() {
        bail!("Password required");
    }

    let user = client.api().login(&email, &password).await?;
    println!(
        "Signed in as {} ({})",
        user.display_name.as_deref().unwrap_or(&user.email),
        user.id
    );

    config.last_email = Some(email);
    config.save()?;
    Ok(())
}

async fn logout(client: &HubClient) -> Result<()> {
    if !client.session().is_authenticated() {
        println!("Not signed in");
        return Ok(());
    }
    client.api().logout().await;
    println!("Signed out");
    Ok(())
}

fn status(client: &HubClient) -> Result<()> {
    let session = client.session().current();
    match session.user {
        Some(user) if session.is_authenticated => {
            println!("Signed in as {} <{}>", user.id, user.email);
            if let Some(role) = user.role {
                println!("Role: {}", role);
            }
        }
        _ => println!("Not signed in"),
    }
    println!("API: {}", client.config().api_base_url);
    println!("Live updates: {}", client.config().ws_url);
    Ok(())
}

async fn get(client: &HubClient, path: &str) -> Result<()> {
    let value: Value = client
        .api()
        .get(path)
        .await
        .with_context(|| format!("GET {} failed", path))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn watch(client: &HubClient, kind: &str, scope: Option<&String>) -> Result<()> {
    if !client.session().is_authenticated() {
        bail!("Sign in first with `visahub login`");
    }

    let topic = match scope {
        Some(scope) => Topic::scoped(kind, scope.as_str()),
        None => Topic::global(kind),
    };
    let label = topic.to_string();
    client
        .channel()
        .subscribe(topic, move |data| {
            println!("[{}] {}", label, data);
        })
        .await;

    eprintln!("Watching {} (Ctrl-C to stop)", kind);
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
