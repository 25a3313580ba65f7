pub mod configuration;
pub mod dispatcher;
pub mod domain;
pub mod email_client;
pub mod recipients;
pub mod routes;
pub mod startup;
pub mod store;
pub mod telemetry;
pub mod upload;
pub mod utils;
