use std::path::PathBuf;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use crate::db::Job;

pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new() -> anyhow::Result<Self> {
        let runtime_dir = crate::paths::runtime_dir()?;
        Ok(Self {
            socket_path: runtime_dir.join("grab.sock"),
        })
    }

    async fn request(
        &self,
        method: hyper::Method,
        uri: &str,
        body: Option<&str>,
    ) -> anyhow::Result<(hyper::StatusCode, String)> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            anyhow::anyhow!(
                "could not connect to daemon at {}: {e}\nIs the daemon running? Start it with: grab daemon start",
                self.socket_path.display(),
            )
        })?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(conn);

        let req_body = match body {
            Some(b) => Full::new(Bytes::from(b.to_owned())),
            None => Full::new(Bytes::new()),
        };

        let mut builder = hyper::Request::builder()
            .method(method)
            .uri(uri)
            .header("host", "localhost");

        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }

        let req = builder.body(req_body)?;
        let res = sender.send_request(req).await?;
        let status = res.status();
        let res_bytes = res.into_body().collect().await?.to_bytes();
        let text = String::from_utf8(res_bytes.to_vec())?;

        Ok((status, text))
    }

    pub async fn queue_download(
        &self,
        urls: &[String],
        format: Option<&str>,
        extra_params: &serde_json::Value,
        force_generic_extractor: bool,
    ) -> anyhow::Result<Vec<String>> {
        let payload = serde_json::json!({
            "urls": urls,
            "format": format,
            "extra_params": extra_params,
            "force_generic_extractor": force_generic_extractor,
        })
        .to_string();
        let (status, body) = self
            .request(hyper::Method::POST, "/downloads", Some(&payload))
            .await?;
        if !status.is_success() {
            anyhow::bail!("{}", extract_error(&body));
        }
        let accepted: serde_json::Value = serde_json::from_str(&body)?;
        Ok(accepted["urls"]
            .as_array()
            .map(|urls| {
                urls.iter()
                    .filter_map(|u| u.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn list_jobs(
        &self,
        status: Option<&str>,
        show_logs: bool,
    ) -> anyhow::Result<Vec<Job>> {
        let mut uri = format!("/jobs?show_logs={show_logs}");
        if let Some(status) = status {
            uri.push_str(&format!("&status={status}"));
        }
        let (status, body) = self.request(hyper::Method::GET, &uri, None).await?;
        if !status.is_success() {
            anyhow::bail!("{}", extract_error(&body));
        }
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn get_job(&self, id: i64) -> anyhow::Result<Job> {
        let uri = format!("/jobs/{id}");
        let (status, body) = self.request(hyper::Method::GET, &uri, None).await?;
        if !status.is_success() {
            anyhow::bail!("{}", extract_error(&body));
        }
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn stop_job(&self, id: i64) -> anyhow::Result<bool> {
        let uri = format!("/jobs/{id}/stop");
        let (status, body) = self.request(hyper::Method::POST, &uri, None).await?;
        if !status.is_success() {
            anyhow::bail!("{}", extract_error(&body));
        }
        let result: serde_json::Value = serde_json::from_str(&body)?;
        Ok(result["success"].as_bool().unwrap_or(false))
    }

    pub async fn retry_job(&self, id: i64) -> anyhow::Result<()> {
        let uri = format!("/jobs/{id}/retry");
        let (status, body) = self.request(hyper::Method::POST, &uri, None).await?;
        if !status.is_success() {
            anyhow::bail!("{}", extract_error(&body));
        }
        Ok(())
    }

    pub async fn delete_job(&self, id: i64) -> anyhow::Result<()> {
        let uri = format!("/jobs/{id}");
        let (status, body) = self.request(hyper::Method::DELETE, &uri, None).await?;
        if !status.is_success() {
            anyhow::bail!("{}", extract_error(&body));
        }
        Ok(())
    }

    pub async fn clean_jobs(&self) -> anyhow::Result<()> {
        let (status, body) = self.request(hyper::Method::POST, "/jobs/clean", None).await?;
        if !status.is_success() {
            anyhow::bail!("{}", extract_error(&body));
        }
        Ok(())
    }

    pub async fn purge_jobs(&self) -> anyhow::Result<()> {
        let (status, body) = self.request(hyper::Method::POST, "/jobs/purge", None).await?;
        if !status.is_success() {
            anyhow::bail!("{}", extract_error(&body));
        }
        Ok(())
    }

    pub async fn stats(&self) -> anyhow::Result<serde_json::Value> {
        let (status, body) = self.request(hyper::Method::GET, "/stats", None).await?;
        if !status.is_success() {
            anyhow::bail!("{}", extract_error(&body));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

fn extract_error(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error")?.as_str().map(String::from))
        .unwrap_or_else(|| body.to_string())
}
