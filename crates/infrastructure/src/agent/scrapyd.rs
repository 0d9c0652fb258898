//! Scrapyd兼容的单个Agent客户端
//!
//! | 操作 | 接口 |
//! |---|---|
//! | 启动 | `POST schedule.json` |
//! | 取消 | `POST cancel.json` |
//! | 运行列表 | `GET listjobs.json?project=` |
//! | 爬虫列表 | `GET listspiders.json?project=` |
//! | 删除项目 | `POST delproject.json` |
//! | 日志 | `GET logs/<project>/<spider>/<run_id>.log` |

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use keeper_core::{
    AgentsConfig, KeeperError, KeeperResult, RemoteJob, RemoteJobStatus, SpiderArguments,
};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScheduleResponse {
    status: String,
    #[serde(default)]
    jobid: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScrapydJob {
    id: String,
    #[serde(default)]
    spider: Option<String>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListJobsResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    pending: Vec<ScrapydJob>,
    #[serde(default)]
    running: Vec<ScrapydJob>,
    #[serde(default)]
    finished: Vec<ScrapydJob>,
}

#[derive(Debug, Deserialize)]
struct ListSpidersResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    spiders: Vec<String>,
}

/// 单个Scrapyd Agent
///
/// 每次调用同时受HTTP客户端超时和外层 `tokio::time::timeout` 约束，
/// 超时与连接错误都映射为 `AgentUnreachable`。
#[derive(Debug, Clone)]
pub struct ScrapydAgent {
    server: String,
    client: Client,
    timeout: Duration,
    credentials: Option<(String, String)>,
}

impl ScrapydAgent {
    pub fn new(server: impl Into<String>, config: &AgentsConfig) -> KeeperResult<Self> {
        let timeout = Duration::from_secs(config.request_timeout_seconds);
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| KeeperError::Configuration(format!("创建HTTP客户端失败: {e}")))?;
        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        };

        Ok(Self {
            server: server.into().trim_end_matches('/').to_string(),
            client,
            timeout,
            credentials,
        })
    }

    /// Agent地址，同时作为主机标识
    pub fn server(&self) -> &str {
        &self.server
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.server, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, Some(password)),
            None => request,
        }
    }

    async fn with_timeout<T, F>(&self, call: F) -> KeeperResult<T>
    where
        F: Future<Output = KeeperResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(KeeperError::agent_unreachable(
                &self.server,
                format!("请求超时 ({}s)", self.timeout.as_secs()),
            )),
        }
    }

    async fn send(&self, request: RequestBuilder) -> KeeperResult<reqwest::Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| KeeperError::agent_unreachable(&self.server, e))?;
        if !response.status().is_success() {
            return Err(KeeperError::agent_unreachable(
                &self.server,
                format!("HTTP {}", response.status()),
            ));
        }
        Ok(response)
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> KeeperResult<T> {
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| KeeperError::agent_unreachable(&self.server, format!("无效的响应: {e}")))
    }

    /// 启动爬虫，返回Agent分配的运行标识
    pub async fn schedule(
        &self,
        project: &str,
        spider: &str,
        arguments: &SpiderArguments,
    ) -> KeeperResult<String> {
        self.with_timeout(async {
            let mut form: Vec<(String, String)> = vec![
                ("project".to_string(), project.to_string()),
                ("spider".to_string(), spider.to_string()),
            ];
            form.extend(arguments.pairs().iter().cloned());

            let response = self
                .authorize(self.client.post(self.url("schedule.json")).form(&form))
                .send()
                .await
                .map_err(|e| KeeperError::agent_unreachable(&self.server, e))?;

            let status = response.status();
            if status.is_server_error() {
                return Err(KeeperError::agent_unreachable(
                    &self.server,
                    format!("HTTP {status}"),
                ));
            }
            if !status.is_success() {
                return Err(KeeperError::dispatch_rejected(
                    &self.server,
                    format!("HTTP {status}"),
                ));
            }

            let body: ScheduleResponse = response.json().await.map_err(|e| {
                KeeperError::dispatch_rejected(&self.server, format!("无效的响应: {e}"))
            })?;
            match (body.status.as_str(), body.jobid) {
                ("ok", Some(jobid)) if !jobid.is_empty() => Ok(jobid),
                _ => Err(KeeperError::dispatch_rejected(
                    &self.server,
                    body.message.unwrap_or_else(|| format!("status={}", body.status)),
                )),
            }
        })
        .await
    }

    pub async fn cancel(&self, project: &str, run_id: &str) -> KeeperResult<()> {
        self.with_timeout(async {
            let body: StatusResponse = self
                .send_json(
                    self.client
                        .post(self.url("cancel.json"))
                        .form(&[("project", project), ("job", run_id)]),
                )
                .await?;
            self.expect_ok(body.status, body.message)
        })
        .await
    }

    pub async fn list_jobs(&self, project: &str) -> KeeperResult<Vec<RemoteJob>> {
        self.with_timeout(async {
            let body: ListJobsResponse = self
                .send_json(
                    self.client
                        .get(self.url("listjobs.json"))
                        .query(&[("project", project)]),
                )
                .await?;
            self.expect_ok(body.status, body.message)?;

            let mut jobs = Vec::with_capacity(
                body.pending.len() + body.running.len() + body.finished.len(),
            );
            let groups = [
                (RemoteJobStatus::Pending, body.pending),
                (RemoteJobStatus::Running, body.running),
                (RemoteJobStatus::Finished, body.finished),
            ];
            for (status, group) in groups {
                jobs.extend(group.into_iter().map(|job| RemoteJob {
                    run_id: job.id,
                    spider_name: job.spider,
                    status,
                    start_time: job.start_time.as_deref().and_then(parse_agent_time),
                    end_time: job.end_time.as_deref().and_then(parse_agent_time),
                }));
            }
            debug!("Agent {} 项目 {} 共 {} 条运行记录", self.server, project, jobs.len());
            Ok(jobs)
        })
        .await
    }

    pub async fn list_spiders(&self, project: &str) -> KeeperResult<Vec<String>> {
        self.with_timeout(async {
            let body: ListSpidersResponse = self
                .send_json(
                    self.client
                        .get(self.url("listspiders.json"))
                        .query(&[("project", project)]),
                )
                .await?;
            self.expect_ok(body.status, body.message)?;
            Ok(body.spiders)
        })
        .await
    }

    pub async fn delete_project(&self, project: &str) -> KeeperResult<()> {
        self.with_timeout(async {
            let body: StatusResponse = self
                .send_json(
                    self.client
                        .post(self.url("delproject.json"))
                        .form(&[("project", project)]),
                )
                .await?;
            self.expect_ok(body.status, body.message)
        })
        .await
    }

    /// 获取日志文本，日志不存在时返回空字符串
    pub async fn fetch_log(&self, project: &str, spider: &str, run_id: &str) -> KeeperResult<String> {
        self.with_timeout(async {
            let request = self
                .client
                .get(self.url(&format!("logs/{project}/{spider}/{run_id}.log")));
            let response = self
                .authorize(request)
                .send()
                .await
                .map_err(|e| KeeperError::agent_unreachable(&self.server, e))?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(String::new());
            }
            if !response.status().is_success() {
                return Err(KeeperError::agent_unreachable(
                    &self.server,
                    format!("HTTP {}", response.status()),
                ));
            }
            response
                .text()
                .await
                .map_err(|e| KeeperError::agent_unreachable(&self.server, e))
        })
        .await
    }

    fn expect_ok(&self, status: String, message: Option<String>) -> KeeperResult<()> {
        if status == "ok" {
            Ok(())
        } else {
            Err(KeeperError::agent_unreachable(
                &self.server,
                message.unwrap_or_else(|| format!("status={status}")),
            ))
        }
    }
}

/// 解析Agent上报的时间
///
/// Scrapyd输出不带时区的本地时间 `YYYY-MM-DD HH:MM:SS[.ffffff]`，按UTC处理；
/// 也接受RFC 3339格式。
pub fn parse_agent_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|t| t.with_timezone(&Utc)))
        .ok()
}
