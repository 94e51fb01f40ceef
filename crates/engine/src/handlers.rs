//! 内置任务处理器
//!
//! 二进制入口默认注册的两个处理器：Shell命令与HTTP请求。
//! 作为库使用时由调用方自行注册业务处理器。

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use taskherd_core::{SchedulerError, SchedulerResult};

use crate::registry::TaskHandler;

/// Shell任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellTaskParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Shell任务处理器：执行命令并以退出码判定成败
pub struct ShellHandler;

#[async_trait]
impl TaskHandler for ShellHandler {
    async fn run(&self, params: serde_json::Value) -> SchedulerResult<()> {
        let shell: ShellTaskParams = serde_json::from_value(params)
            .map_err(|e| SchedulerError::InvalidTaskParams(format!("解析Shell任务参数失败: {e}")))?;

        info!("执行Shell任务: command={}, args={:?}", shell.command, shell.args);

        let mut cmd = Command::new(&shell.command);
        cmd.args(&shell.args);
        if let Some(dir) = &shell.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &shell.env {
            cmd.env(key, value);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| SchedulerError::HandlerExecution(format!("启动Shell命令失败: {e}")))?;

        if output.status.success() {
            debug!("Shell命令 {} 执行成功", shell.command);
            Ok(())
        } else {
            Err(SchedulerError::HandlerExecution(format!(
                "Shell命令退出码 {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// HTTP任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTaskParams {
    pub url: String,
    #[serde(default = "default_http_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: Option<serde_json::Value>,
    pub timeout_seconds: Option<u64>,
}

fn default_http_method() -> String {
    "GET".to_string()
}

/// HTTP任务处理器：发起请求并以状态码判定成败
pub struct HttpHandler {
    client: reqwest::Client,
}

impl HttpHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for HttpHandler {
    async fn run(&self, params: serde_json::Value) -> SchedulerResult<()> {
        let http: HttpTaskParams = serde_json::from_value(params)
            .map_err(|e| SchedulerError::InvalidTaskParams(format!("解析HTTP任务参数失败: {e}")))?;

        let method: reqwest::Method = http
            .method
            .parse()
            .map_err(|_| SchedulerError::InvalidTaskParams(format!("无效的HTTP方法: {}", http.method)))?;

        info!("执行HTTP任务: {} {}", http.method, http.url);

        let mut request = self.client.request(method, &http.url);
        for (key, value) in &http.headers {
            request = request.header(key, value);
        }
        if let Some(body) = &http.body {
            request = request.json(body);
        }
        if let Some(timeout) = http.timeout_seconds {
            request = request.timeout(std::time::Duration::from_secs(timeout));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SchedulerError::HandlerExecution(format!("HTTP请求失败: {e}")))?;

        let status = response.status();
        if status.is_success() {
            debug!("HTTP任务 {} 返回 {}", http.url, status);
            Ok(())
        } else {
            Err(SchedulerError::HandlerExecution(format!(
                "HTTP请求返回非成功状态: {status}"
            )))
        }
    }
}
