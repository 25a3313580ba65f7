use std::net::TcpListener;
use std::sync::Arc;

use actix_multipart::form::text::TextConfig;
use actix_multipart::form::MultipartFormConfig;
use actix_multipart::MultipartError;
use actix_web::dev::Server;
use actix_web::error::JsonPayloadError;
use actix_web::error::QueryPayloadError;
use actix_web::web;
use actix_web::App;
use actix_web::HttpRequest;
use actix_web::HttpServer;
use anyhow::Context;
use tracing_actix_web::TracingLogger;

use crate::configuration::Settings;
use crate::dispatcher::Dispatcher;
use crate::email_client::EmailClient;
use crate::email_client::MailTransport;
use crate::recipients::RecipientResolver;
use crate::routes::campaign_members;
use crate::routes::clear_templates;
use crate::routes::compose;
use crate::routes::create_campaign;
use crate::routes::delete_campaign;
use crate::routes::delete_template;
use crate::routes::health_check;
use crate::routes::list_campaigns;
use crate::routes::list_templates;
use crate::routes::save_template;
use crate::routes::subscribe;
use crate::routes::unsubscribe;
use crate::routes::update_template;
use crate::routes::ApiError;
use crate::store::Store;
use crate::upload::UploadAssembler;

/// Wrapper for actix's `Server` with access to the bound port. Not to be
/// confused with actix's `App`!
pub struct Application {
    /// Left private; use `get_port` to access
    port: u16,
    server: Server,
    /// Shared with the staging sweeper, so that it never removes an upload that
    /// is still receiving chunks
    uploads: Arc<UploadAssembler>,
}

impl Application {
    /// Build the server with the SMTP transport described by `cfg`. An
    /// incomplete SMTP section is not an error here; dispatch will refuse to
    /// send until it is fixed.
    pub async fn build(cfg: Settings) -> Result<Self, anyhow::Error> {
        let email_client =
            EmailClient::from_settings(&cfg.email_client).context("could not build SMTP transport")?;
        Self::build_with_transport(cfg, Arc::new(email_client)).await
    }

    /// Like `build`, but mail goes through `transport` (tests inject a recording
    /// one here).
    pub async fn build_with_transport(
        cfg: Settings,
        transport: Arc<dyn MailTransport>,
    ) -> Result<Self, anyhow::Error> {
        let addr = format!("{}:{}", cfg.application.host, cfg.application.port);
        let listener = TcpListener::bind(addr)?;
        // port 0 means the OS picked one
        let port = listener.local_addr()?.port();

        let store = Store::new(&cfg.database);
        store
            .migrate()
            .await
            .context("could not run database migrations")?;

        tokio::fs::create_dir_all(&cfg.application.staging_dir)
            .await
            .with_context(|| {
                format!(
                    "could not create staging directory {}",
                    cfg.application.staging_dir.display()
                )
            })?;
        let uploads = Arc::new(UploadAssembler::new(&cfg.application.staging_dir));
        let dispatcher = Dispatcher::new(transport, cfg.application.dispatch_concurrency);

        let server = run(
            listener,
            store,
            uploads.clone(),
            dispatcher,
            cfg.application.max_upload_bytes,
        )?;

        Ok(Self {
            port,
            server,
            uploads,
        })
    }

    pub fn get_port(&self) -> u16 { self.port }

    pub fn uploads(&self) -> Arc<UploadAssembler> { self.uploads.clone() }

    /// Because this consumes `self`, this should be the final function call (or
    /// passed to `tokio::spawn`)
    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> { self.server.await }
}

// extractor failures are reported in the same JSON shape as handler errors

fn json_error(
    e: JsonPayloadError,
    _: &HttpRequest,
) -> actix_web::Error {
    ApiError::Validation(e.to_string()).into()
}

fn query_error(
    e: QueryPayloadError,
    _: &HttpRequest,
) -> actix_web::Error {
    ApiError::Validation(e.to_string()).into()
}

fn multipart_error(
    e: MultipartError,
    _: &HttpRequest,
) -> actix_web::Error {
    ApiError::Validation(e.to_string()).into()
}

/// The server is not responsible for binding to an address, it only listens to
/// an already bound address.
///
/// Declares all API endpoints.
pub fn run(
    listener: TcpListener,
    store: Store,
    uploads: Arc<UploadAssembler>,
    dispatcher: Dispatcher,
    max_upload_bytes: usize,
) -> Result<Server, anyhow::Error> {
    let resolver = web::Data::new(RecipientResolver::new(store.clone()));
    let store = web::Data::new(store);
    let uploads = web::Data::from(uploads);
    let dispatcher = web::Data::new(dispatcher);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .route("/health_check", web::get().to(health_check))
            .route("/templates", web::get().to(list_templates))
            .route("/templates", web::post().to(save_template))
            .route("/templates", web::delete().to(clear_templates))
            .route("/templates/{id}", web::put().to(update_template))
            .route("/templates/{id}", web::delete().to(delete_template))
            .route("/campaigns", web::get().to(list_campaigns))
            .route("/campaigns", web::post().to(create_campaign))
            // before `/campaigns/{name}`, which would otherwise match it
            .route("/campaigns/members", web::get().to(campaign_members))
            .route("/campaigns/{name}", web::delete().to(delete_campaign))
            .route("/campaigns/{name}/subscribers", web::post().to(subscribe))
            .route(
                "/campaigns/{name}/subscribers/{email}",
                web::delete().to(unsubscribe),
            )
            .route("/compose", web::post().to(compose))
            .app_data(web::JsonConfig::default().error_handler(json_error))
            .app_data(web::QueryConfig::default().error_handler(query_error))
            .app_data(
                MultipartFormConfig::default()
                    .total_limit(max_upload_bytes)
                    .memory_limit(max_upload_bytes)
                    .error_handler(multipart_error),
            )
            // browsers and http clients don't always label text parts
            .app_data(TextConfig::default().validate_content_type(false))
            .app_data(store.clone())
            .app_data(resolver.clone())
            .app_data(uploads.clone())
            .app_data(dispatcher.clone())
    })
    .listen(listener)?
    .run();

    Ok(server)
}
