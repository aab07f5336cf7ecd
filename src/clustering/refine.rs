// src/clustering/refine.rs
//
// OpenRefine backend: one throwaway project per artifact, binning clusterer
// with the n-gram fingerprint keyer, project deleted afterwards.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::{multipart, redirect, Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use url::Url;

use super::Clusterer;
use crate::artifact::{WorkingArtifact, FIELD_DELIMITER};
use crate::errors::ClusteringError;
use crate::models::{ClusterGroup, ClusterMember};

const PROJECT_FORMAT: &str = "text/line-based/*sv";

#[derive(Deserialize)]
struct CsrfTokenResponse {
    token: String,
}

/// One value inside an OpenRefine cluster: `{"v": value, "c": count}`.
#[derive(Debug, Deserialize)]
struct RefineClusterEntry {
    v: JsonValue,
    c: u64,
}

/// Thin client over the OpenRefine command API.
#[derive(Debug, Clone)]
pub struct RefineServer {
    client: Client,
    base: Url,
}

impl RefineServer {
    pub fn new(base_url: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .with_context(|| format!("Invalid OpenRefine URL '{}'", base_url))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        // The project id comes back in the redirect Location, so redirects stay manual.
        let mut builder = Client::builder().redirect(redirect::Policy::none());
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to build OpenRefine HTTP client")?;

        Ok(Self { client, base })
    }

    fn command_url(&self, command: &str) -> Result<Url> {
        self.base
            .join(&format!("command/core/{}", command))
            .with_context(|| format!("Failed to build URL for command {}", command))
    }

    /// Fetches a CSRF token. Servers predating the token endpoint answer
    /// 404, in which case requests go out without one.
    async fn csrf_token(&self) -> Result<Option<String>> {
        let response = self
            .client
            .get(self.command_url("get-csrf-token")?)
            .send()
            .await
            .context("Failed to reach OpenRefine for CSRF token")?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("OpenRefine has no CSRF endpoint; continuing without token");
            return Ok(None);
        }
        let body: CsrfTokenResponse = response
            .error_for_status()
            .context("OpenRefine rejected CSRF token request")?
            .json()
            .await
            .context("Failed to parse CSRF token response")?;
        Ok(Some(body.token))
    }

    fn with_token(&self, mut url: Url, token: &Option<String>) -> Url {
        if let Some(token) = token {
            url.query_pairs_mut().append_pair("csrf_token", token);
        }
        url
    }

    /// Uploads the artifact as a new project and returns its handle.
    pub async fn create_project(&self, artifact: &WorkingArtifact) -> Result<RefineProject<'_>> {
        let token = self.csrf_token().await?;
        let project_name = artifact
            .file_name()
            .trim_end_matches(".csv")
            .to_string();

        let mut url = self.with_token(self.command_url("create-project-from-upload")?, &token);
        url.query_pairs_mut()
            .append_pair("format", PROJECT_FORMAT)
            .append_pair("options", &import_options(&project_name).to_string());

        let bytes = tokio::fs::read(artifact.path())
            .await
            .with_context(|| format!("Failed to read artifact {}", artifact.path().display()))?;
        let file_part = multipart::Part::bytes(bytes)
            .file_name(artifact.file_name().to_string())
            .mime_str("text/csv")
            .context("Failed to build multipart file part")?;
        let form = multipart::Form::new()
            .text("project-name", project_name.clone())
            .part("project-file", file_part);

        let response = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .context("Failed to upload artifact to OpenRefine")?;

        let status = response.status();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let id = match location {
            Some(location) if status.is_redirection() => parse_project_id(&self.base, &location)?,
            _ => {
                let body = response.text().await.unwrap_or_default();
                bail!(
                    "OpenRefine did not create project {} (status {}): {}",
                    project_name,
                    status,
                    body.chars().take(200).collect::<String>()
                );
            }
        };

        info!("Created OpenRefine project {} for {}", id, artifact.file_name());
        Ok(RefineProject {
            server: self,
            id,
            name: project_name,
        })
    }
}

/// Live project on the server. `delete` must be called to release it.
#[derive(Debug)]
pub struct RefineProject<'a> {
    server: &'a RefineServer,
    id: String,
    name: String,
}

impl<'a> RefineProject<'a> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn compute_clusters(&self, column_name: &str, ngram_size: usize) -> Result<Vec<ClusterGroup>> {
        let token = self.server.csrf_token().await?;
        let mut url = self
            .server
            .with_token(self.server.command_url("compute-clusters")?, &token);
        url.query_pairs_mut().append_pair("project", &self.id);

        let engine = json!({"facets": [], "mode": "row-based"}).to_string();
        let clusterer = clusterer_params(column_name, ngram_size).to_string();

        let body: JsonValue = self
            .server
            .client
            .post(url)
            .form(&[("engine", engine.as_str()), ("clusterer", clusterer.as_str())])
            .send()
            .await
            .with_context(|| format!("Failed to request clusters for project {}", self.id))?
            .error_for_status()
            .with_context(|| format!("OpenRefine rejected compute-clusters for project {}", self.id))?
            .json()
            .await
            .with_context(|| format!("Failed to parse clusters of project {}", self.id))?;

        parse_cluster_response(body)
    }

    pub async fn delete(self) -> Result<()> {
        let token = self.server.csrf_token().await?;
        let url = self
            .server
            .with_token(self.server.command_url("delete-project")?, &token);

        let body: JsonValue = self
            .server
            .client
            .post(url)
            .form(&[("project", self.id.as_str())])
            .send()
            .await
            .with_context(|| format!("Failed to delete project {}", self.id))?
            .error_for_status()
            .with_context(|| format!("OpenRefine rejected delete of project {}", self.id))?
            .json()
            .await
            .unwrap_or(JsonValue::Null);

        if body.get("code").and_then(JsonValue::as_str) == Some("error") {
            bail!("OpenRefine could not delete project {}: {}", self.id, body);
        }
        debug!("Deleted OpenRefine project {} ({})", self.id, self.name);
        Ok(())
    }
}

/// Import options for a single-column, pipe-separated file with one header line.
fn import_options(project_name: &str) -> JsonValue {
    json!({
        "encoding": "UTF-8",
        "separator": FIELD_DELIMITER.to_string(),
        "ignoreLines": -1,
        "headerLines": 1,
        "skipDataLines": 0,
        "limit": -1,
        "storeBlankRows": true,
        "guessCellValueTypes": false,
        "processQuotes": true,
        "storeBlankCellsAsNulls": true,
        "includeFileSources": false,
        "projectName": project_name,
    })
}

fn clusterer_params(column_name: &str, ngram_size: usize) -> JsonValue {
    json!({
        "type": "binning",
        "function": "ngram-fingerprint",
        "column": column_name,
        "params": {"ngram-size": ngram_size},
    })
}

/// Extracts `project=<id>` from the redirect issued after an upload.
fn parse_project_id(base: &Url, location: &str) -> Result<String> {
    let url = base
        .join(location)
        .with_context(|| format!("Unparseable redirect location '{}'", location))?;
    url.query_pairs()
        .find(|(k, _)| k == "project")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("No project id in redirect location '{}'", location))
}

fn parse_cluster_response(body: JsonValue) -> Result<Vec<ClusterGroup>> {
    if let Some(message) = body.get("message").and_then(JsonValue::as_str) {
        bail!("OpenRefine returned an error: {}", message);
    }

    let raw: Vec<Vec<RefineClusterEntry>> =
        serde_json::from_value(body).context("Unexpected compute-clusters payload")?;

    Ok(raw
        .into_iter()
        .map(|entries| {
            ClusterGroup::new(
                entries
                    .into_iter()
                    .map(|e| {
                        let value = match e.v {
                            JsonValue::String(s) => s,
                            other => other.to_string(),
                        };
                        ClusterMember::new(value, e.c)
                    })
                    .collect(),
            )
        })
        .filter(|group| !group.is_empty())
        .collect())
}

/// `Clusterer` backed by a running OpenRefine server.
#[derive(Debug, Clone)]
pub struct RefineClusterer {
    server: RefineServer,
    ngram_size: usize,
}

impl RefineClusterer {
    pub fn new(base_url: &str, timeout: Option<Duration>, ngram_size: usize) -> Result<Self> {
        Ok(Self {
            server: RefineServer::new(base_url, timeout)?,
            ngram_size: ngram_size.max(1),
        })
    }
}

#[async_trait]
impl Clusterer for RefineClusterer {
    async fn cluster(
        &self,
        artifact: &WorkingArtifact,
        column_name: &str,
    ) -> Result<Vec<ClusterGroup>, ClusteringError> {
        let project = self
            .server
            .create_project(artifact)
            .await
            .map_err(|e| ClusteringError::ProjectCreation {
                artifact: artifact.file_name().to_string(),
                cause: e,
            })?;

        let result = project.compute_clusters(column_name, self.ngram_size).await;

        let project_id = project.id().to_string();
        if let Err(e) = project.delete().await {
            warn!("Failed to tear down OpenRefine project {}: {:#}", project_id, e);
        }

        result.map_err(|e| ClusteringError::Compute {
            artifact: artifact.file_name().to_string(),
            cause: e,
        })
    }

    fn name(&self) -> &'static str {
        "openrefine"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::build_artifact;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Reads one HTTP request, body included, and returns its head.
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return String::from_utf8_lossy(&buf).into_owned();
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
        let lowered = head.to_lowercase();
        let content_length = lowered
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok());
        let chunked = lowered.contains("transfer-encoding: chunked");

        loop {
            let body = &buf[header_end..];
            let complete = match content_length {
                Some(len) => body.len() >= len,
                None if chunked => body.ends_with(b"0\r\n\r\n"),
                None => true,
            };
            if complete {
                break;
            }
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        head
    }

    fn json_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        )
    }

    /// Minimal OpenRefine stand-in. Records the command of every request and
    /// answers compute-clusters with `clusters_status` / `clusters_body`.
    async fn spawn_stub_server(
        clusters_status: &'static str,
        clusters_body: &'static str,
    ) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let commands = seen.clone();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let head = read_request(&mut socket).await;
                let target = head.split_whitespace().nth(1).unwrap_or("").to_string();
                let command = target
                    .split('?')
                    .next()
                    .and_then(|p| p.rsplit('/').next())
                    .unwrap_or("")
                    .to_string();
                commands.lock().unwrap().push(command.clone());

                let response = match command.as_str() {
                    "get-csrf-token" => json_response("200 OK", r#"{"token":"stub-token"}"#),
                    "create-project-from-upload" => "HTTP/1.1 302 Found\r\nLocation: /project?project=1\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
                    "compute-clusters" => json_response(clusters_status, clusters_body),
                    "delete-project" => json_response("200 OK", r#"{"code":"ok"}"#),
                    _ => json_response("404 Not Found", "{}"),
                };
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}/", addr), seen)
    }

    fn scenario_artifact(dir: &tempfile::TempDir) -> WorkingArtifact {
        let names: Vec<String> = ["Parafuso 3mm", "parafuso 3mm", "Prego 2pol"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        build_artifact(dir.path(), "1001", "NOME", &names).unwrap()
    }

    #[tokio::test]
    async fn test_compute_failure_still_deletes_project() {
        let (url, seen) = spawn_stub_server(
            "500 Internal Server Error",
            r#"{"code":"error","message":"boom"}"#,
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let artifact = scenario_artifact(&dir);

        let clusterer = RefineClusterer::new(&url, Some(Duration::from_secs(5)), 1).unwrap();
        let err = clusterer.cluster(&artifact, "NOME").await.unwrap_err();

        match err {
            ClusteringError::Compute { artifact, .. } => assert_eq!(artifact, "1001.csv"),
            other => panic!("unexpected error {:?}", other),
        }
        let commands = seen.lock().unwrap().clone();
        assert!(commands.contains(&"compute-clusters".to_string()));
        assert_eq!(commands.last().map(String::as_str), Some("delete-project"));
    }

    #[tokio::test]
    async fn test_successful_clustering_deletes_project() {
        let (url, seen) = spawn_stub_server(
            "200 OK",
            r#"[[{"v":"Parafuso 3mm","c":1},{"v":"parafuso 3mm","c":1}]]"#,
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let artifact = scenario_artifact(&dir);

        let clusterer = RefineClusterer::new(&url, Some(Duration::from_secs(5)), 1).unwrap();
        let groups = clusterer.cluster(&artifact, "NOME").await.unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].representative().unwrap().value, "Parafuso 3mm");
        assert_eq!(groups[0].total_count(), 2);
        let commands = seen.lock().unwrap().clone();
        assert_eq!(
            commands.iter().filter(|c| c.as_str() == "delete-project").count(),
            1
        );
    }

    fn base() -> Url {
        Url::parse("http://127.0.0.1:3333/").unwrap()
    }

    #[test]
    fn test_parse_project_id_from_relative_location() {
        assert_eq!(parse_project_id(&base(), "/project?project=1717171717").unwrap(), "1717171717");
        assert_eq!(
            parse_project_id(&base(), "http://127.0.0.1:3333/project?project=42&x=1").unwrap(),
            "42"
        );
        assert!(parse_project_id(&base(), "/error?message=bad").is_err());
    }

    #[test]
    fn test_parse_cluster_response() {
        let body = json!([
            [{"v": "Parafuso 3mm", "c": 2}, {"v": "parafuso 3mm", "c": 1}],
            [{"v": 123, "c": 1}, {"v": "123", "c": 4}],
            []
        ]);
        let groups = parse_cluster_response(body).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].representative().unwrap().value, "Parafuso 3mm");
        assert_eq!(groups[0].total_count(), 3);
        assert_eq!(groups[1].members[0], ClusterMember::new("123", 1));
    }

    #[test]
    fn test_parse_cluster_error_response() {
        let body = json!({"code": "error", "message": "Column NOME not found"});
        let err = parse_cluster_response(body).unwrap_err();
        assert!(err.to_string().contains("Column NOME not found"));
    }

    #[test]
    fn test_clusterer_params() {
        let params = clusterer_params("NOME", 1);
        assert_eq!(params["type"], "binning");
        assert_eq!(params["function"], "ngram-fingerprint");
        assert_eq!(params["column"], "NOME");
        assert_eq!(params["params"]["ngram-size"], 1);
    }

    #[test]
    fn test_import_options_use_pipe_separator() {
        let options = import_options("1001");
        assert_eq!(options["separator"], "|");
        assert_eq!(options["headerLines"], 1);
    }

    #[test]
    fn test_server_url_normalization() {
        let server = RefineServer::new("http://localhost:3333/refine", None).unwrap();
        assert_eq!(
            server.command_url("delete-project").unwrap().as_str(),
            "http://localhost:3333/refine/command/core/delete-project"
        );
        assert!(RefineServer::new("not a url", None).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_project_creation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = build_artifact(dir.path(), "3003", "NOME", &["a".to_string()]).unwrap();
        // Port 9 (discard) is closed on test hosts; the connect fails fast.
        let clusterer =
            RefineClusterer::new("http://127.0.0.1:9", Some(Duration::from_secs(2)), 1).unwrap();
        let err = clusterer.cluster(&artifact, "NOME").await.unwrap_err();
        assert!(matches!(err, ClusteringError::ProjectCreation { .. }));
    }
}
