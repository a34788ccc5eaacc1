use anyhow::{Context, Result};
use dialoguer::{Input, Password};
use std::sync::Arc;
use tokio::sync::broadcast;

use booking_session::auth::{
    AuthClient, ClientRegistration, InvalidationReason, SessionEvent, SessionManager, SessionState,
    SqliteTokenStore,
};
use booking_session::config::{Command, Config};
use booking_session::error::ApiError;
use booking_session::http_client::SessionHttpClient;

#[tokio::main]
async fn main() -> Result<()> {
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!("API base URL: {}", config.api_base_url);

    let store = Arc::new(SqliteTokenStore::open(&config.session_db_file)?);
    let session = SessionManager::restore(store.clone());
    let mut events = session.subscribe();

    let http = SessionHttpClient::new(session.clone(), &config.http_settings())?;
    let auth = AuthClient::new(http.client().clone(), &config.api_base_url, session.clone());

    let outcome = run(command, &store, &session, &auth, &http).await;

    if let Err(e) = &outcome {
        if let Some(ApiError::Session(reason)) = e.downcast_ref::<ApiError>() {
            if reason.requires_login() {
                eprintln!("Not signed in ({}).", reason);
            }
        }
    }

    // Stand-in for the UI observers: point the user back at a login entry point
    report_events(&mut events);

    outcome
}

async fn run(
    command: Command,
    store: &SqliteTokenStore,
    session: &SessionManager,
    auth: &AuthClient,
    http: &SessionHttpClient,
) -> Result<()> {
    match command {
        Command::LoginClient { email, password } => {
            let password = password_or_prompt(password)?;
            auth.login_client(&email, &password).await?;
            println!("Signed in as client {}", email);
        }

        Command::LoginBusiness { email, password } => {
            let password = password_or_prompt(password)?;
            auth.login_business_admin(&email, &password).await?;
            println!("Signed in as business admin {}", email);
        }

        Command::SendOtp { phone } => {
            let dispatch = auth.request_otp(&phone).await?;
            println!("{} ({})", dispatch.message, dispatch.phone);
            if let Some(code) = dispatch.debug_code {
                println!("Development code: {}", code);
            }
        }

        Command::VerifyOtp { phone, code } => {
            let code = match code {
                Some(code) => code,
                None => Input::new()
                    .with_prompt("One-time code")
                    .interact_text()
                    .context("Failed to read one-time code")?,
            };
            auth.verify_otp(&phone, &code).await?;
            println!("Signed in as client {}", phone.trim());
        }

        Command::Register {
            email,
            name,
            phone,
            password,
        } => {
            let password = password_or_prompt(password)?;
            let registration = ClientRegistration {
                email: email.clone(),
                password,
                name,
                phone,
            };
            auth.register_client(&registration).await?;
            println!("Registered and signed in as {}", email);
        }

        Command::Status => match session.snapshot() {
            SessionState::Anonymous => println!("Not signed in"),
            SessionState::Authenticated(pair, kind) | SessionState::Refreshing(pair, kind) => {
                println!("Signed in as {}", kind);
                println!("Issued at: {}", pair.issued_at.to_rfc3339());
                println!("Stored in: {}", store.path().display());
            }
        },

        Command::Logout => {
            auth.logout();
            println!("Signed out");
        }

        Command::Get { path } => {
            let response = http.get(&path).await?;
            println!("{}", response.text().await?);
        }

        Command::Post { path, body } => {
            let body: serde_json::Value =
                serde_json::from_str(&body).context("Request body is not valid JSON")?;
            let response = http.post_json(&path, &body).await?;
            println!("{}", response.text().await?);
        }
    }

    Ok(())
}

fn password_or_prompt(password: Option<String>) -> Result<String> {
    match password {
        Some(password) => Ok(password),
        None => Password::new()
            .with_prompt("Password")
            .interact()
            .context("Failed to read password"),
    }
}

fn report_events(events: &mut broadcast::Receiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::Invalidated(InvalidationReason::Logout) => {}
            SessionEvent::Invalidated(reason) => {
                eprintln!(
                    "Session ended ({}). Sign in again with `booking-session login-client`, \
                     `login-business` or `verify-otp`.",
                    reason
                );
            }
        }
    }
}
