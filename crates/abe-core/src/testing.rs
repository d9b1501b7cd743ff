//! Integration-test harness.
//!
//! Runs an [`Engine`] through the real [`Engine::run`] lifecycle on an
//! ephemeral port and talks to it over HTTP.
//!
//! ```rust,ignore
//! #[tokio::test]
//! async fn test_hello() {
//!     let engine = TestApp::engine("{}").await.unwrap();
//!     engine.add_controller([controller::provider(HelloController)]);
//!     let app = TestApp::start(engine, "/api").await.unwrap();
//!
//!     let res = app.client.get(&app.url("/api/hello")).await;
//!     assert_eq!(res.status, 200);
//!     app.shutdown().await.unwrap();
//! }
//! ```

use std::net::SocketAddr;

use axum::http::HeaderMap;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::engine::Engine;
use crate::error::AbeError;
use crate::server::RunOptions;

/// A running engine bound to `127.0.0.1:<random>`.
pub struct TestApp {
    pub addr: SocketAddr,
    pub client: TestClient,
    pub engine: Engine,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), AbeError>>>,
}

impl TestApp {
    /// Engine built from `yaml` layered over the defaults, without touching
    /// the global tracing subscriber.
    pub async fn engine(yaml: &str) -> Result<Engine, AbeError> {
        let config = Config::from_yaml_str(yaml)?;
        Engine::builder(config).skip_logging().build().await
    }

    /// Run `engine` in the background, mounting controllers under
    /// `base_path`.
    pub async fn start(engine: Engine, base_path: &str) -> Result<Self, AbeError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (stop, stopped) = oneshot::channel::<()>();

        let options = RunOptions::new()
            .base_path(base_path)
            .listener(listener)
            .shutdown_signal(async move {
                let _ = stopped.await;
            });
        let runner = engine.clone();
        let task = tokio::spawn(async move { runner.run(options).await });

        Ok(TestApp {
            addr,
            client: TestClient::new(addr),
            engine,
            stop: Some(stop),
            task: Some(task),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Trigger shutdown and return what [`Engine::run`] returned.
    pub async fn shutdown(mut self) -> Result<(), AbeError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| AbeError::Server(format!("engine task failed: {e}")))?,
            None => Ok(()),
        }
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Thin reqwest wrapper returning buffered responses.
#[derive(Clone)]
pub struct TestClient {
    inner: reqwest::Client,
    base_addr: SocketAddr,
}

impl TestClient {
    pub fn new(addr: SocketAddr) -> Self {
        TestClient {
            inner: reqwest::Client::new(),
            base_addr: addr,
        }
    }

    pub async fn get(&self, url: &str) -> TestResponse {
        self.send(self.inner.get(url)).await
    }

    pub async fn get_with_headers(&self, url: &str, headers: &[(&str, &str)]) -> TestResponse {
        let mut request = self.inner.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        self.send(request).await
    }

    pub async fn get_with_auth(&self, url: &str, token: &str) -> TestResponse {
        self.send(self.inner.get(url).bearer_auth(token)).await
    }

    /// POST a JSON body.
    pub async fn post(&self, url: &str, body: &str) -> TestResponse {
        self.send(
            self.inner
                .post(url)
                .header("Content-Type", "application/json")
                .body(body.to_string()),
        )
        .await
    }

    pub async fn post_with_auth(&self, url: &str, token: &str, body: &str) -> TestResponse {
        self.send(
            self.inner
                .post(url)
                .bearer_auth(token)
                .header("Content-Type", "application/json")
                .body(body.to_string()),
        )
        .await
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.base_addr)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> TestResponse {
        let res = request.send().await.expect("request failed");
        TestResponse::from_response(res).await
    }
}

/// Buffered response for assertions.
#[derive(Debug)]
pub struct TestResponse {
    pub status: u16,
    pub body: String,
    pub headers: HeaderMap,
}

impl TestResponse {
    async fn from_response(res: reqwest::Response) -> Self {
        let status = res.status().as_u16();
        let mut headers = HeaderMap::new();
        for (name, value) in res.headers() {
            if let (Ok(name), Ok(value)) = (
                axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
                axum::http::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }
        let body = res.text().await.unwrap_or_default();
        TestResponse {
            status,
            body,
            headers,
        }
    }

    /// # Panics
    ///
    /// Panics when the body is not JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("response body is not JSON")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// `data` of a success envelope.
    pub fn data(&self) -> serde_json::Value {
        self.json()["data"].clone()
    }

    /// Business code of either envelope (`0` on success).
    pub fn code(&self) -> i64 {
        self.json()["code"].as_i64().unwrap_or(-1)
    }
}
