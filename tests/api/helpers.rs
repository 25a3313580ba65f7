use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use campaign_mailer::configuration::get_configuration;
use campaign_mailer::configuration::Settings;
use campaign_mailer::email_client::MailTransport;
use campaign_mailer::startup::Application;
use campaign_mailer::store::Store;
use campaign_mailer::telemetry::get_subscriber;
use campaign_mailer::telemetry::init_subscriber;
use lettre::message::Mailbox;
use lettre::Message;
use once_cell::sync::Lazy;
use reqwest::multipart::Form;
use serde_json::Value;
use tempfile::TempDir;

/// To opt in to verbose logging, use the env var `TEST_LOG`:
///
/// ```sh
///      TEST_LOG=true cargo test [test_name] | bunyan
/// ```
static TRACING: Lazy<()> = Lazy::new(|| {
    match std::env::var("TEST_LOG") {
        Ok(_) => {
            let subscriber = get_subscriber("test", "debug", std::io::stdout);
            init_subscriber(subscriber);
        }
        Err(_) => {
            let subscriber = get_subscriber("test", "debug", std::io::sink);
            init_subscriber(subscriber);
        }
    };
});

/// Stands in for the SMTP server: keeps every message it is handed, and fails
/// for the addresses it was told to.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Message>>,
    failing: Mutex<HashSet<String>>,
}

#[async_trait]
impl MailTransport for RecordingTransport {
    fn sender(&self) -> Result<Mailbox, anyhow::Error> { Ok("news@campaign.test".parse()?) }

    async fn send(
        &self,
        message: Message,
    ) -> Result<(), anyhow::Error> {
        let to: Vec<String> = message
            .envelope()
            .to()
            .iter()
            .map(|a| a.to_string())
            .collect();
        self.sent.lock().unwrap().push(message);
        let failing = self.failing.lock().unwrap();
        if to.iter().any(|t| failing.contains(t)) {
            anyhow::bail!("550 mailbox unavailable");
        }
        Ok(())
    }
}

impl RecordingTransport {
    pub fn fail_for(
        &self,
        email: &str,
    ) {
        self.failing.lock().unwrap().insert(email.to_string());
    }

    pub fn n_sent(&self) -> usize { self.sent.lock().unwrap().len() }

    /// Envelope recipients of every message, in the order they were sent
    pub fn recipients(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .flat_map(|m| m.envelope().to().iter().map(|a| a.to_string()).collect::<Vec<_>>())
            .collect()
    }

    /// Raw RFC 5322 text of every message
    pub fn formatted(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| String::from_utf8_lossy(&m.formatted()).to_string())
            .collect()
    }
}

pub struct TestApp {
    pub addr: String,
    pub store: Store,
    pub transport: Arc<RecordingTransport>,
    pub staging_dir: PathBuf,
    pub api_client: reqwest::Client,
    // removed (with the db and staged files) when the test ends
    _root: TempDir,
}

impl TestApp {
    pub async fn get_templates(&self) -> reqwest::Response {
        self.api_client
            .get(format!("{}/templates", self.addr))
            .send()
            .await
            .expect("execute request")
    }

    pub async fn post_template(
        &self,
        body: &Value,
    ) -> reqwest::Response {
        self.api_client
            .post(format!("{}/templates", self.addr))
            .json(body)
            .send()
            .await
            .expect("execute request")
    }

    pub async fn get_campaigns(&self) -> reqwest::Response {
        self.api_client
            .get(format!("{}/campaigns", self.addr))
            .send()
            .await
            .expect("execute request")
    }

    pub async fn post_campaign(
        &self,
        body: &Value,
    ) -> reqwest::Response {
        self.api_client
            .post(format!("{}/campaigns", self.addr))
            .json(body)
            .send()
            .await
            .expect("execute request")
    }

    pub async fn get_members(
        &self,
        campaign: &str,
    ) -> reqwest::Response {
        self.api_client
            .get(format!("{}/campaigns/members", self.addr))
            .query(&[("name", campaign)])
            .send()
            .await
            .expect("execute request")
    }

    /// Members of an existing campaign
    pub async fn members(
        &self,
        campaign: &str,
    ) -> Vec<String> {
        let resp = self.get_members(campaign).await;
        assert_eq!(resp.status().as_u16(), 200);
        resp.json().await.unwrap()
    }

    pub async fn subscribe(
        &self,
        campaign: &str,
        email: &str,
    ) -> reqwest::Response {
        self.api_client
            .post(format!("{}/campaigns/{campaign}/subscribers", self.addr))
            .json(&serde_json::json!({ "email": email }))
            .send()
            .await
            .expect("execute request")
    }

    pub async fn unsubscribe(
        &self,
        campaign: &str,
        email: &str,
    ) -> reqwest::Response {
        self.api_client
            .delete(format!("{}/campaigns/{campaign}/subscribers/{email}", self.addr))
            .send()
            .await
            .expect("execute request")
    }

    pub async fn delete_campaign(
        &self,
        campaign: &str,
    ) -> reqwest::Response {
        self.api_client
            .delete(format!("{}/campaigns/{campaign}", self.addr))
            .send()
            .await
            .expect("execute request")
    }

    pub async fn post_compose(
        &self,
        form: Form,
    ) -> reqwest::Response {
        self.api_client
            .post(format!("{}/compose", self.addr))
            .multipart(form)
            .send()
            .await
            .expect("execute request")
    }

    /// Number of entries left in the staging area
    pub fn n_staged(&self) -> usize {
        std::fs::read_dir(&self.staging_dir)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    pub async fn count_rows(
        &self,
        table: &str,
    ) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(self.store.pool())
            .await
            .unwrap()
    }
}

/// Default config, pointed at a throwaway directory: a fresh sqlite file and
/// staging area per test, and a random port.
fn test_configuration(root: &TempDir) -> Settings {
    let mut cfg = get_configuration().expect("read configuration");
    cfg.database.filename = root.path().join("campaigns.db");
    cfg.database.create_if_missing = true;
    cfg.application.host = "127.0.0.1".to_string();
    cfg.application.port = 0;
    cfg.application.staging_dir = root.path().join("staging");
    cfg
}

async fn start(
    root: TempDir,
    cfg: Settings,
    app: Application,
    transport: Arc<RecordingTransport>,
) -> TestApp {
    let addr = format!("http://127.0.0.1:{}", app.get_port());
    // migrations already ran in `build`
    let store = Store::new(&cfg.database);
    tokio::spawn(app.run_until_stopped());

    TestApp {
        addr,
        store,
        transport,
        staging_dir: cfg.application.staging_dir,
        api_client: reqwest::Client::new(),
        _root: root,
    }
}

/// Spawn the app with a `RecordingTransport` instead of SMTP.
pub async fn spawn_app() -> TestApp {
    Lazy::force(&TRACING);

    let root = TempDir::new().unwrap();
    let cfg = test_configuration(&root);
    let transport = Arc::new(RecordingTransport::default());
    let app = Application::build_with_transport(cfg.clone(), transport.clone())
        .await
        .unwrap();
    start(root, cfg, app, transport).await
}

/// Spawn the app with the real SMTP client but no SMTP host configured.
/// `transport` is unused; nothing can reach it.
pub async fn spawn_app_without_smtp() -> TestApp {
    Lazy::force(&TRACING);

    let root = TempDir::new().unwrap();
    let mut cfg = test_configuration(&root);
    cfg.email_client.host = String::new();
    let app = Application::build(cfg.clone()).await.unwrap();
    start(root, cfg, app, Arc::new(RecordingTransport::default())).await
}
