//! BitDrop CLI - a terminal host for the BitDrop session lifecycle.
//!
//! Signs in, signs up, signs out and reports which view the app would show.
//! Stands in for the mobile presentation layer: it calls `start()` once and
//! renders from the resulting `AuthStatus`.

use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bitdrop_core::auth::validation::validate_password_confirmation;
use bitdrop_core::auth::{OAuthProvider, SupabaseAuth};
use bitdrop_core::{ApiClient, AuthError, AuthStatus, Config, RootView, SessionManager};
use futures::StreamExt;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

/// Log file name prefix in the cache directory
const LOG_FILE_PREFIX: &str = "bitdrop.log";

/// Deep link the auth provider redirects to after an OAuth sign-in
const OAUTH_REDIRECT: &str = "bitdrop://auth-callback";

/// How long to wait for the provider event after an OAuth redirect
const OAUTH_EVENT_TIMEOUT_SECS: u64 = 5;

const USAGE: &str = "\
Usage: bitdrop <command>

Commands:
  status                      Show the current session state
  login [email]               Sign in with email and password
  signup <username> <email>   Create an account and sign in
  logout                      Sign out and forget the stored token
  oauth <provider>            Sign in with google, apple or github
  oauth-complete <url>        Finish an OAuth sign-in from its redirect URL

Environment:
  BITDROP_EMAIL, BITDROP_PASSWORD   Credentials for non-interactive login
  API_BASE, SUPABASE_URL, SUPABASE_ANON_KEY, BITDROP_TOKEN_STORE
  RUST_LOG                          Log filter (default: warn)";

enum Command {
    Status,
    Login { email: Option<String> },
    SignUp { username: String, email: String },
    Logout,
    OAuth(OAuthProvider),
    OAuthComplete { redirect: String },
}

impl Command {
    fn parse(args: &[String]) -> Result<Self> {
        let arg = |i: usize| args.get(i).cloned();
        match args.first().map(String::as_str) {
            None | Some("status") => Ok(Command::Status),
            Some("login") => Ok(Command::Login { email: arg(1) }),
            Some("signup") => match (arg(1), arg(2)) {
                (Some(username), Some(email)) => Ok(Command::SignUp { username, email }),
                _ => bail!("signup needs <username> <email>\n\n{}", USAGE),
            },
            Some("logout") => Ok(Command::Logout),
            Some("oauth") => {
                let provider = arg(1).unwrap_or_else(|| "google".to_string());
                Ok(Command::OAuth(provider.parse()?))
            }
            Some("oauth-complete") => match arg(1) {
                Some(redirect) => Ok(Command::OAuthComplete { redirect }),
                None => bail!("oauth-complete needs <redirect-url>\n\n{}", USAGE),
            },
            Some(other) => bail!("Unknown command '{}'\n\n{}", other, USAGE),
        }
    }
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if matches!(args.first().map(String::as_str), Some("-h" | "--help" | "help")) {
        println!("{}", USAGE);
        return Ok(ExitCode::SUCCESS);
    }
    let command = Command::parse(&args)?;

    let mut config = Config::load().context("Failed to load configuration")?;
    let _guard = init_tracing(config.cache_dir().ok().as_deref());
    config.validate()?;
    info!("BitDrop CLI starting");

    let provider = Arc::new(SupabaseAuth::new(&config)?.with_redirect_to(OAUTH_REDIRECT));
    let api = Arc::new(ApiClient::new(&config)?);
    let store = config.token_store()?;
    let manager = SessionManager::new(provider.clone(), api, store);

    let status = manager.start().await;
    let code = match command {
        Command::Status => {
            render(status);
            ExitCode::SUCCESS
        }
        Command::Login { email } => login(&manager, &mut config, email).await?,
        Command::SignUp { username, email } => sign_up(&manager, &mut config, &username, &email).await?,
        Command::Logout => {
            manager.sign_out().await;
            render(manager.status());
            ExitCode::SUCCESS
        }
        Command::OAuth(oauth) => oauth_login(&manager, &provider, oauth).await?,
        Command::OAuthComplete { redirect } => {
            complete_oauth(&manager, &provider, &redirect).await
        }
    };

    manager.shutdown();
    info!("BitDrop CLI shutting down");
    Ok(code)
}

fn render(status: AuthStatus) {
    match status.root_view() {
        RootView::Loading => println!("Checking session..."),
        RootView::Main => println!("Signed in."),
        RootView::AuthFlow => println!("Signed out."),
    }
}

fn report(err: &AuthError) -> ExitCode {
    let errors = err.field_errors();
    if errors.to_string().is_empty() {
        eprintln!("{}", err);
    } else {
        eprintln!("{}", errors);
    }
    ExitCode::FAILURE
}

fn prompt_line(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn password_from_env_or_prompt(label: &str) -> Result<String> {
    match std::env::var("BITDROP_PASSWORD") {
        Ok(password) if !password.is_empty() => Ok(password),
        _ => Ok(rpassword::prompt_password(label)?),
    }
}

fn remember_email(config: &mut Config, email: &str) {
    config.last_email = Some(email.to_string());
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }
}

async fn login(manager: &SessionManager, config: &mut Config, email: Option<String>) -> Result<ExitCode> {
    if manager.is_authenticated() {
        println!("Already signed in. Run `bitdrop logout` first to switch accounts.");
        return Ok(ExitCode::SUCCESS);
    }

    let email = match email
        .or_else(|| std::env::var("BITDROP_EMAIL").ok())
        .or_else(|| config.last_email.clone())
    {
        Some(email) => email,
        None => prompt_line("Email: ")?,
    };
    let password = password_from_env_or_prompt("Password: ")?;

    match manager.sign_in(&email, &password).await {
        Ok(signed_in) => {
            remember_email(config, &email);
            if let Some(warning) = signed_in.warning() {
                eprintln!("{}", warning.field_errors());
            }
            render(manager.status());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => Ok(report(&e)),
    }
}

async fn sign_up(
    manager: &SessionManager,
    config: &mut Config,
    username: &str,
    email: &str,
) -> Result<ExitCode> {
    if let Err(e) = manager.check_availability(username, email).await {
        return Ok(report(&e));
    }

    let password = password_from_env_or_prompt("Password: ")?;
    let confirm = match std::env::var("BITDROP_PASSWORD") {
        Ok(password) if !password.is_empty() => password,
        _ => rpassword::prompt_password("Confirm password: ")?,
    };
    if let Err(e) = validate_password_confirmation(&password, &confirm).into_result() {
        return Ok(report(&e));
    }

    match manager.sign_up(username, email, &password).await {
        Ok(signed_in) => {
            remember_email(config, email);
            if let Some(warning) = signed_in.warning() {
                eprintln!("{}", warning.field_errors());
            }
            render(manager.status());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => Ok(report(&e)),
    }
}

async fn oauth_login(
    manager: &SessionManager,
    provider: &SupabaseAuth,
    oauth: OAuthProvider,
) -> Result<ExitCode> {
    let url = match manager.begin_oauth(oauth) {
        Ok(url) => url,
        Err(e) => return Ok(report(&e)),
    };
    println!("Open this URL to continue with {}:\n\n  {}\n", oauth, url);

    let redirect = prompt_line("Paste the URL you were redirected to: ")?;
    Ok(complete_oauth(manager, provider, &redirect).await)
}

async fn complete_oauth(manager: &SessionManager, provider: &SupabaseAuth, redirect: &str) -> ExitCode {
    if let Err(e) = provider.complete_oauth_redirect(redirect).await {
        return report(&AuthError::from(e));
    }

    // The session reaches the manager through the provider's event stream
    let mut changes = Box::pin(manager.status_changes());
    let signed_in = tokio::time::timeout(
        Duration::from_secs(OAUTH_EVENT_TIMEOUT_SECS),
        async {
            while let Some(status) = changes.next().await {
                if status.is_authenticated() {
                    return true;
                }
            }
            false
        },
    )
    .await
    .unwrap_or(false);

    render(manager.status());
    if signed_in {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        Command::parse(&args)
    }

    #[test]
    fn test_parse_oauth_complete() {
        let command = parse(&["oauth-complete", "bitdrop://auth-callback#access_token=tok"]).unwrap();
        assert!(matches!(
            command,
            Command::OAuthComplete { ref redirect } if redirect == "bitdrop://auth-callback#access_token=tok"
        ));

        let err = parse(&["oauth-complete"]).err().unwrap();
        assert!(err.to_string().contains("oauth-complete needs <redirect-url>"));
        assert!(USAGE.contains("oauth-complete <url>"));
    }

    #[test]
    fn test_parse_commands() {
        assert!(matches!(parse(&[]).unwrap(), Command::Status));
        assert!(matches!(parse(&["logout"]).unwrap(), Command::Logout));
        assert!(matches!(parse(&["oauth", "github"]).unwrap(), Command::OAuth(OAuthProvider::Github)));
        assert!(matches!(
            parse(&["login", "a@b.com"]).unwrap(),
            Command::Login { email: Some(ref e) } if e == "a@b.com"
        ));
        assert!(parse(&["signup", "alice"]).is_err());
        assert!(parse(&["frobnicate"]).is_err());
    }
}
