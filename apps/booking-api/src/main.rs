use booking_api::config::AppConfig;
use booking_api::{AppState, create_app};
use core_lib::adapters::{
    InMemoryCache, InMemoryIdentityProvider, InMemoryNotifier, InMemoryStore, PostgresStore,
    ProviderNotifier, RedisCache, RetryingIdentityProvider,
    smtp_email::SmtpEmailSender, supabase_identity::SupabaseIdentityProvider,
    twilio_sms::TwilioSmsSender,
};
use core_lib::{Cache, IdentityProvider, NotificationGateway};
use sqlx::postgres::PgPoolOptions;
use std::error::Error;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

type BoxError = Box<dyn Error + Send + Sync>;

const CACHE_DEFAULT_TTL_SECS: u64 = 300;

async fn connect_postgres(db_url: &str) -> Result<PostgresStore, BoxError> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await?;

    info!("Applying database migrations...");
    let migrator = sqlx::migrate::Migrator::new(std::path::Path::new("./migrations")).await?;
    migrator.run(&pool).await?;
    info!("Migrations applied successfully.");

    Ok(PostgresStore::new(pool))
}

async fn build_state(config: &AppConfig) -> Result<AppState, BoxError> {
    let identity: Arc<dyn IdentityProvider> = match &config.supabase {
        Some(supabase) => {
            info!(url = %supabase.url, "Using Supabase identity provider");
            Arc::new(RetryingIdentityProvider::new(
                SupabaseIdentityProvider::new(supabase.clone())?,
                config.retry,
            ))
        }
        None => {
            warn!("SUPABASE_URL not set; accounts live in process memory");
            Arc::new(RetryingIdentityProvider::new(
                InMemoryIdentityProvider::default(),
                config.retry,
            ))
        }
    };

    let providers = ProviderNotifier::new(
        config.smtp.clone().map(SmtpEmailSender::new).transpose()?,
        config.twilio.clone().map(TwilioSmsSender::new).transpose()?,
    );
    let notifier: Arc<dyn NotificationGateway> = if providers.has_any_channel() {
        if config.smtp.is_none() {
            warn!("SMTP_HOST not set; email delivery disabled");
        }
        if config.twilio.is_none() {
            warn!("Twilio settings not set; SMS delivery disabled");
        }
        Arc::new(providers)
    } else {
        warn!("No SMTP or Twilio settings; notifications are only logged");
        Arc::new(InMemoryNotifier::new())
    };

    let cache: Arc<dyn Cache> = match &config.redis_url {
        Some(url) => {
            info!("Using Redis for sessions and query cache");
            Arc::new(RedisCache::new(url, CACHE_DEFAULT_TTL_SECS).await?)
        }
        None => {
            warn!("REDIS_URL not set; sessions are kept in process memory");
            Arc::new(InMemoryCache::default())
        }
    };

    let state = match &config.database_url {
        Some(url) => {
            let store = connect_postgres(url).await?;
            info!("Connected to Postgres");
            AppState::from_store(store, identity, notifier, cache, config.api.clone())
        }
        None => {
            warn!("DATABASE_URL not set; using the in-memory store");
            AppState::from_store(
                InMemoryStore::default(),
                identity,
                notifier,
                cache,
                config.api.clone(),
            )
        }
    };
    Ok(state)
}

async fn run() -> Result<(), BoxError> {
    let config = AppConfig::from_env()?;
    let app = create_app(build_state(&config).await?);

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("TarTrack booking API listening on {}", config.bind_addr);
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }

    info!("Starting booking API v{}...", env!("CARGO_PKG_VERSION"));
    if let Err(e) = run().await {
        error!("Booking API stopped: {}", e);
        std::process::exit(1);
    }
}
