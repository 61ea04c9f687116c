use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use common::cache::{RedisConfig, RedisPool};
use common::clock::SystemClock;
use common::database::{DatabaseConfig, init_pool};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use telehealth::config::TelehealthConfig;
use telehealth::middleware::AuthKeys;
use telehealth::notifications::LogNotifier;
use telehealth::repositories::{
    MemoryAppointmentStore, MemoryConsentStore, MemoryRecordingStore, MemorySessionStore,
    PgAppointmentStore, PgConsentStore, PgRecordingStore, PgSessionStore,
};
use telehealth::retention::{SweepLease, start_scheduler};
use telehealth::routes::create_router;
use telehealth::state::{AppState, Collaborators};
use telehealth::storage::{MemoryObjectStore, ObjectStore, S3Storage};
use telehealth::video::{TwilioVideoClient, VideoProvider};

/// `RUST_LOG` when set, INFO otherwise
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .init();

    info!("Starting telehealth service");

    let config = TelehealthConfig::load().context("failed to load telehealth configuration")?;
    let auth = AuthKeys::from_config(&config.auth)?;

    let video = Arc::new(TwilioVideoClient::new(&config.video)?);
    if !video.is_configured() {
        warn!("Video provider credentials missing; sessions will use offline mock rooms");
    }

    let storage: Arc<dyn ObjectStore> = match &config.storage.bucket {
        Some(_) => {
            // Initialize AWS S3 client
            let aws_config = aws_config::load_defaults(BehaviorVersion::latest()).await;
            let s3_client = aws_sdk_s3::Client::new(&aws_config);
            Arc::new(S3Storage::new(s3_client, &config.storage))
        }
        None => {
            warn!("No recording bucket configured; using in-memory object storage");
            Arc::new(MemoryObjectStore::new(config.storage.bucket_name()))
        }
    };

    let collaborators = if DatabaseConfig::is_configured() {
        let db_config = DatabaseConfig::from_env()?;
        let pool = init_pool(&db_config).await?;

        if common::database::health_check(&pool).await? {
            info!("Database connection successful");
        } else {
            anyhow::bail!("Failed to connect to database");
        }

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run telehealth migrations")?;

        Collaborators {
            sessions: Arc::new(PgSessionStore::new(pool.clone())),
            recordings: Arc::new(PgRecordingStore::new(pool.clone())),
            consents: Arc::new(PgConsentStore::new(pool.clone())),
            appointments: Arc::new(PgAppointmentStore::new(pool)),
            video,
            storage,
            notifier: Arc::new(LogNotifier),
            clock: Arc::new(SystemClock),
        }
    } else {
        warn!("DATABASE_URL not set; running on in-memory stores (development mode)");
        Collaborators {
            sessions: Arc::new(MemorySessionStore::new()),
            recordings: Arc::new(MemoryRecordingStore::new()),
            consents: Arc::new(MemoryConsentStore::new()),
            appointments: Arc::new(MemoryAppointmentStore::new()),
            video,
            storage,
            notifier: Arc::new(LogNotifier),
            clock: Arc::new(SystemClock),
        }
    };

    let state = AppState::new(collaborators, &config, auth);

    let mut scheduler = if config.retention.enabled {
        let lease = match &config.redis_url {
            Some(url) => Some(SweepLease {
                redis: RedisPool::new(&RedisConfig { url: url.clone() }).await?,
                ttl_seconds: config.retention.lease_ttl_secs,
            }),
            None => {
                warn!("No Redis configured; every replica will run the retention sweep");
                None
            }
        };
        Some(start_scheduler(state.retention.clone(), &config.retention.schedule, lease).await?)
    } else {
        warn!("Retention sweep scheduler disabled");
        None
    };

    // Start the web server
    let app = create_router(state);
    let listener = TcpListener::bind(&config.server.bind_address).await?;
    info!("Telehealth service listening on {}", config.server.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    if let Some(scheduler) = scheduler.as_mut() {
        scheduler.shutdown().await?;
    }
    info!("Shutting down telehealth service");

    Ok(())
}
