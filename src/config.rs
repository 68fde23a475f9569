//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `C2C__*` 覆盖（双下划线表示嵌套，如 `C2C__LIMITS__SEND_TIMEOUT_SECS=60`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub collector: CollectorSection,
    #[serde(default)]
    pub backend: BackendSection,
}

/// [storage] 段：会话记录目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageSection {
    /// 未设置时用 ~/.c2c/conversations
    pub dir: Option<PathBuf>,
}

impl StorageSection {
    /// 实际使用的目录；以 `~/` 开头时展开为用户主目录
    pub fn resolved_dir(&self) -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        match &self.dir {
            Some(dir) => match dir.strip_prefix("~") {
                Ok(rest) => home.join(rest),
                Err(_) => dir.clone(),
            },
            None => home.join(".c2c").join("conversations"),
        }
    }
}

/// [limits] 段：三个操作超时与同一会话的最小发送间隔
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_create_timeout_secs")]
    pub create_timeout_secs: u64,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_end_timeout_secs")]
    pub end_timeout_secs: u64,
    /// 秒，可为小数
    #[serde(default = "default_min_message_interval_secs")]
    pub min_message_interval_secs: f64,
}

fn default_create_timeout_secs() -> u64 {
    30
}

fn default_send_timeout_secs() -> u64 {
    30
}

fn default_end_timeout_secs() -> u64 {
    10
}

fn default_min_message_interval_secs() -> f64 {
    2.0
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            create_timeout_secs: default_create_timeout_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            end_timeout_secs: default_end_timeout_secs(),
            min_message_interval_secs: default_min_message_interval_secs(),
        }
    }
}

impl LimitsSection {
    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn end_timeout(&self) -> Duration {
        Duration::from_secs(self.end_timeout_secs)
    }

    /// 负数或 NaN 视为 0
    pub fn min_message_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.min_message_interval_secs).unwrap_or(Duration::ZERO)
    }
}

/// [collector] 段：响应收集的单元上限与「首段内容即停」开关
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorSection {
    #[serde(default = "default_max_units")]
    pub max_units: usize,
    /// 为 false 时只依赖终止标记与 max_units，可收集多段回复
    #[serde(default = "default_stop_on_first_content")]
    pub stop_on_first_content: bool,
}

fn default_max_units() -> usize {
    10
}

fn default_stop_on_first_content() -> bool {
    true
}

impl Default for CollectorSection {
    fn default() -> Self {
        Self {
            max_units: default_max_units(),
            stop_on_first_content: default_stop_on_first_content(),
        }
    }
}

/// [backend] 段：后端类型与 stdio 后端的启动命令
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    /// stdio / mock
    #[serde(default = "default_backend_kind")]
    pub kind: String,
    #[serde(default = "default_backend_command")]
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

fn default_backend_kind() -> String {
    "stdio".to_string()
}

fn default_backend_command() -> Vec<String> {
    vec![
        "claude".into(),
        "-p".into(),
        "--input-format".into(),
        "stream-json".into(),
        "--output-format".into(),
        "stream-json".into(),
        "--verbose".into(),
    ]
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            command: default_backend_command(),
            working_dir: None,
        }
    }
}

/// 从 config 目录加载配置，环境变量 C2C__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 C2C__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("C2C")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
