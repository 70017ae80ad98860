use std::sync::Arc;

use rocket::{routes, Build, Rocket};

use crate::api::*;
use crate::classifier::EmailClassifier;
use crate::config::Config;
use crate::csv_ingest::import_job::ImportManager;
use crate::csv_ingest::CsvValidator;
use crate::database::DbPool;
use crate::governor::GrowthGovernor;
use crate::membership::MembershipStore;
use crate::snowball::SnowballEngine;
use crate::worker::ForwardRouter;

pub mod routes;

pub struct ServerState {
    pub config: Config,
    pub db_pool: DbPool,
    pub classifier: Arc<EmailClassifier>,
    pub store: MembershipStore,
    pub governor: GrowthGovernor,
    pub imports: ImportManager,
    pub router: ForwardRouter,
}

/// Wire the engine together and hand rocket the managed state. The
/// forward router and its workers outlive individual requests.
pub fn build_rocket(config: Config, db_pool: DbPool) -> Rocket<Build> {
    let classifier = Arc::new(EmailClassifier::new(&config.classifier));
    let store = MembershipStore::new(db_pool.clone());
    let governor = GrowthGovernor::new(db_pool.clone(), config.governor.clone());

    let validator = CsvValidator::new(
        &config.ingestion,
        EmailClassifier::new(&config.classifier),
    );
    let imports = ImportManager::new(
        db_pool.clone(),
        validator,
        config.ingestion.progress_interval,
    );

    let engine = Arc::new(SnowballEngine::new(
        db_pool.clone(),
        EmailClassifier::new(&config.classifier),
        governor.clone(),
        config.retention.max_forwarders_tracked,
    ));
    let router = ForwardRouter::spawn(engine);

    let figment = rocket::Config::figment()
        .merge(("address", config.server.address.clone()))
        .merge(("port", config.server.port));

    let state = ServerState {
        config,
        db_pool,
        classifier,
        store,
        governor,
        imports,
        router,
    };

    rocket::custom(figment).manage(state).mount(
        "/api",
        routes![
            // Health and info endpoints
            routes::health::health_check,
            routes::health::index,
            // Repositories and membership
            create_repo,
            get_repo,
            archive_repo,
            get_settings,
            update_settings,
            add_member,
            verify_member,
            opt_out_member,
            remove_member,
            record_engagement,
            get_digest_recipients,
            // Imports
            upload_import,
            get_import,
            cancel_import,
            // Forwards and delivery webhooks
            submit_forward,
            record_bounce,
            record_complaint,
            // Analytics
            get_analytics,
        ],
    )
}
