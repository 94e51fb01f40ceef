//! 应用配置
//!
//! 从TOML文件加载，支持 `TASKHERD_` 前缀的环境变量覆盖，
//! 未提供配置文件时使用内置默认值。

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// 连接URL，sqlite: 或 postgres:// 开头
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 节点标识，缺省时由主机名加随机后缀生成
    pub node_id: Option<String>,
    /// 清扫周期（秒），同时也是到期判定的前瞻窗口
    pub check_interval_seconds: u64,
    /// 认领周期（秒），与清扫周期互相独立
    pub claim_interval_seconds: u64,
    /// 认领时间戳超过该时长视为失主，启动时强制回收
    pub recapture_delay_seconds: u64,
    /// 计划时间早于该时长的记录启动时无条件清除
    pub expiry_delay_seconds: u64,
    /// 诊断日志开关
    pub verbose: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite:taskherd.db".to_string(),
                max_connections: 5,
                min_connections: 1,
            },
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            check_interval_seconds: 10,
            claim_interval_seconds: 60,
            recapture_delay_seconds: 120,
            expiry_delay_seconds: 86400,
            verbose: false,
        }
    }
}

impl AppConfig {
    /// 加载配置。显式指定的文件必须存在；未指定时依次探测默认路径，
    /// 都不存在则使用内置默认值。环境变量始终参与覆盖。
    pub fn load(config_path: Option<&str>) -> SchedulerResult<Self> {
        let mut builder = ConfigBuilder::builder()
            .set_default("database.url", "sqlite:taskherd.db")
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?
            .set_default("database.max_connections", 5)
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?
            .set_default("database.min_connections", 1)
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?
            .set_default("scheduler.check_interval_seconds", 10)
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?
            .set_default("scheduler.claim_interval_seconds", 60)
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?
            .set_default("scheduler.recapture_delay_seconds", 120)
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?
            .set_default("scheduler.expiry_delay_seconds", 86400)
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?
            .set_default("scheduler.verbose", false)
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?;

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(SchedulerError::Configuration(format!(
                    "配置文件不存在: {path}"
                )));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = ["config/taskherd.toml", "taskherd.toml"];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(Environment::with_prefix("TASKHERD").separator("__"));

        let config: AppConfig = builder
            .build()
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?
            .try_deserialize()
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        self.database.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.url.is_empty() {
            return Err(SchedulerError::Configuration(
                "database.url 不能为空".to_string(),
            ));
        }
        if !self.url.starts_with("sqlite:")
            && !self.url.starts_with("postgres://")
            && !self.url.starts_with("postgresql://")
        {
            return Err(SchedulerError::Configuration(format!(
                "不支持的数据库URL: {}",
                self.url
            )));
        }
        if self.max_connections == 0 {
            return Err(SchedulerError::Configuration(
                "database.max_connections 必须大于0".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(SchedulerError::Configuration(
                "database.min_connections 不能大于 max_connections".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_sqlite(&self) -> bool {
        self.url.starts_with("sqlite:")
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.check_interval_seconds == 0 {
            return Err(SchedulerError::Configuration(
                "scheduler.check_interval_seconds 必须大于0".to_string(),
            ));
        }
        if self.claim_interval_seconds == 0 {
            return Err(SchedulerError::Configuration(
                "scheduler.claim_interval_seconds 必须大于0".to_string(),
            ));
        }
        if self.recapture_delay_seconds == 0 {
            return Err(SchedulerError::Configuration(
                "scheduler.recapture_delay_seconds 必须大于0".to_string(),
            ));
        }
        if self.expiry_delay_seconds == 0 {
            return Err(SchedulerError::Configuration(
                "scheduler.expiry_delay_seconds 必须大于0".to_string(),
            ));
        }
        if let Some(node_id) = &self.node_id {
            if node_id.is_empty() {
                return Err(SchedulerError::Configuration(
                    "scheduler.node_id 不能为空字符串".to_string(),
                ));
            }
        }
        Ok(())
    }
}
