mod escrow_api;
mod http;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bet_domain::Amount;
use bet_store::{
    BetRepository, InMemoryBetRepository, InMemorySettlementEventRepository,
    PostgresBetRepository, PostgresSettlementEventRepository, SettlementEventRepository,
};
use escrow_engine::{EscrowService, FeePolicy, StakeLimits, WebhookReconciler};
use payment_gateway::{PaymentGateway, RestPaymentGateway, WebhookVerifier};
use service_core::{init_tracing, AppConfig};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use escrow_api::{DynEscrowService, EscrowApi};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("load configuration")?;
    init_tracing(&config.app.service_name, &config.observability.log_filter);

    // The gateway client is constructed once, here, and handed down; nothing
    // below reaches for ambient credentials.
    let gateway: Arc<dyn PaymentGateway> = Arc::new(
        RestPaymentGateway::new(
            &config.gateway.base_url,
            &config.gateway.secret_key,
            Duration::from_millis(config.gateway.request_timeout_ms),
        )
        .context("build gateway client")?,
    );

    let (bets, events): (Arc<dyn BetRepository>, Arc<dyn SettlementEventRepository>) =
        if config.database.url.is_empty() {
            info!("database url not set, using in-memory stores");
            (
                Arc::new(InMemoryBetRepository::new()),
                Arc::new(InMemorySettlementEventRepository::new()),
            )
        } else {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&config.database.url)
                .await
                .context("connect to postgres")?;
            (
                Arc::new(PostgresBetRepository::new(pool.clone())),
                Arc::new(PostgresSettlementEventRepository::new(pool)),
            )
        };

    let fee_policy = FeePolicy::new(config.escrow.fee_bps).context("fee policy")?;
    let service: Arc<DynEscrowService> = Arc::new(
        EscrowService::new(bets, events, gateway, fee_policy)
            .with_stake_limits(StakeLimits {
                min: Amount(config.escrow.min_stake_cents),
                max: Amount(config.escrow.max_stake_cents),
            })
            .with_currency(&config.escrow.currency),
    );

    let verifier = WebhookVerifier::new(&config.gateway.webhook_secret)
        .with_tolerance_secs(config.gateway.webhook_tolerance_secs);
    let reconciler = Arc::new(WebhookReconciler::new(verifier, Arc::clone(&service)));
    let api = Arc::new(EscrowApi::new(service, reconciler));

    let router = http::build_router(api);
    let listener = tokio::net::TcpListener::bind(&config.app.http_bind_addr)
        .await
        .with_context(|| format!("bind {}", config.app.http_bind_addr))?;
    info!(
        addr = %config.app.http_bind_addr,
        env = config.app.env.as_str(),
        fee_bps = config.escrow.fee_bps,
        "escrow server listening"
    );
    axum::serve(listener, router).await.context("serve http")?;
    Ok(())
}
