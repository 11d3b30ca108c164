pub mod config;
pub mod error;
pub mod groups;
pub mod hub;
pub mod inbox;
pub mod models;
pub mod rate_limit;
pub mod registry;
pub mod retention;
pub mod routes;
pub mod signature;
pub mod storage;
pub mod webhooks;

use rate_limit::{RateLimitConfig, RateLimiter};
use rocket_cors::CorsOptions;
use std::sync::Arc;

use config::HubConfig;
use hub::Hub;

/// Builds the hub from the environment (spec §6 "Environment
/// configuration") the way the teacher's `rocket()` reads `DATABASE_PATH`.
pub fn rocket() -> rocket::Rocket<rocket::Build> {
    let config = HubConfig::from_env();
    let rate_limit_config = RateLimitConfig::from_env();
    build_rocket(Hub::new(config), rate_limit_config)
}

/// Test/embedding entry point that takes an already-constructed hub,
/// mirroring the teacher's `rocket_with_db_and_config`.
pub fn rocket_with_hub_and_config(
    hub: Hub,
    rate_config: RateLimitConfig,
) -> rocket::Rocket<rocket::Build> {
    build_rocket(hub, rate_config)
}

fn build_rocket(hub: Hub, rate_limit_config: RateLimitConfig) -> rocket::Rocket<rocket::Build> {
    let cors_origin = hub.config.cors_origin.clone();
    let port = hub.config.port;
    let hub = Arc::new(hub);
    let rate_limiter = RateLimiter::new();

    // `CORS_ORIGIN` (spec §6) restricts the teacher's wide-open
    // `CorsOptions::default()` to an explicit allow-list when set.
    let cors_options = match cors_origin {
        Some(origins) => {
            let allowed = rocket_cors::AllowedOrigins::some_exact(
                &origins.split(',').map(str::trim).collect::<Vec<_>>(),
            );
            rocket_cors::CorsOptions { allowed_origins: allowed, ..Default::default() }
        }
        None => CorsOptions::default(),
    };
    let cors = cors_options.to_cors().expect("Failed to create CORS");

    // 10MB JSON limit, retained from the teacher's figment override — group
    // fanout posts and message bodies are arbitrary JSON and can be large.
    let mut figment = rocket::Config::figment().merge(("limits.json", 10 * 1024 * 1024));
    if let Some(port) = port {
        figment = figment.merge(("port", port));
    }

    let webhook_hub = hub.clone();
    let sweeper_hub = hub.clone();

    rocket::custom(figment)
        .manage(hub)
        .manage(rate_limit_config)
        .manage(rate_limiter)
        .attach(cors)
        .register(
            "/",
            rocket::catchers![routes::too_many_requests, routes::not_found],
        )
        .mount(
            "/",
            rocket::routes![
                routes::health,
                routes::stats,
                routes::register_agent,
                routes::list_agents,
                routes::get_agent,
                routes::deregister_agent,
                routes::heartbeat,
                routes::rotate_key,
                routes::set_webhook,
                routes::delete_webhook,
                routes::deliver_message,
                routes::pull_message,
                routes::ack_message,
                routes::nack_message,
                routes::reply_message,
                routes::force_reclaim,
                routes::inbox_stats,
                routes::create_group,
                routes::list_groups,
                routes::get_group,
                routes::join_group,
                routes::leave_group,
                routes::invite_member,
                routes::remove_member,
                routes::delete_group,
                routes::post_to_group,
                routes::group_history,
            ],
        )
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Webhook Dispatcher",
            move |_rocket| {
                Box::pin(async move {
                    webhooks::spawn_dispatcher(webhook_hub);
                    println!("🔗 Webhook dispatcher started");
                })
            },
        ))
        .attach(rocket::fairing::AdHoc::on_liftoff("Sweeper", move |_rocket| {
            Box::pin(async move {
                retention::spawn_sweeper(sweeper_hub);
                println!("🧹 Sweeper task started");
            })
        }))
}
