//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SWARM__*` 覆盖
//! （双下划线表示嵌套，如 `SWARM__BUILDER__MAX_CONCURRENCY=8`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::agents::{BuilderConfig, CoordinatorConfig, ReviewerConfig};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub builder: BuilderConfig,
    #[serde(default)]
    pub reviewer: ReviewerConfig,
    #[serde(default)]
    pub memory: MemorySection,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            coordinator: CoordinatorConfig::default(),
            builder: BuilderConfig::default(),
            reviewer: ReviewerConfig::default(),
            memory: MemorySection::default(),
        }
    }
}

/// [app] 段：应用名
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [memory] 段：嵌入缓存上限与清理后保留量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    #[serde(default = "default_embed_cache_max")]
    pub embed_cache_max: usize,
    #[serde(default = "default_embed_cache_keep")]
    pub embed_cache_keep: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            embed_cache_max: default_embed_cache_max(),
            embed_cache_keep: default_embed_cache_keep(),
        }
    }
}

fn default_embed_cache_max() -> usize {
    1000
}

fn default_embed_cache_keep() -> usize {
    500
}

/// 从 config 目录加载配置，环境变量 SWARM__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SWARM__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SWARM")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
