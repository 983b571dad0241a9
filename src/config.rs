//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CHATBRIDGE__*` 覆盖（双下划线表示嵌套，
//! 如 `CHATBRIDGE__LLM__PROVIDER=openai`）。`PORT` 单独覆盖监听端口。

use std::path::PathBuf;

use serde::Deserialize;

use crate::llm::GenerationConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub session: SessionSection,
    pub assistant: AssistantSection,
    pub generation: GenerationConfig,
    pub context: ContextSection,
    pub access: AccessSection,
    pub reconnect: ReconnectSection,
    pub llm: LlmSection,
}

/// [server] 段：运维页面监听地址与静态文件目录
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_client_dir")]
    pub client_dir: PathBuf,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_client_dir() -> PathBuf {
    PathBuf::from("client")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            client_dir: default_client_dir(),
        }
    }
}

/// [session] 段：凭据目录；设为空字符串则只存内存
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_credentials_dir")]
    pub credentials_dir: PathBuf,
}

fn default_credentials_dir() -> PathBuf {
    PathBuf::from("auth_info")
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            credentials_dir: default_credentials_dir(),
        }
    }
}

/// [assistant] 段：命令、种子问候与固定回复文本
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantSection {
    /// 重置会话命令（去空白后大小写不敏感匹配）
    #[serde(default = "default_reset_command")]
    pub reset_command: String,
    /// 种子 user 轮次模板，`{name}` 替换为对端显示名
    #[serde(default = "default_seed_prompt")]
    pub seed_prompt: String,
    /// 种子 assistant 轮次（人设）
    #[serde(default = "default_seed_reply")]
    pub seed_reply: String,
    /// AI 失败时的固定致歉
    #[serde(default = "default_failure_reply")]
    pub failure_reply: String,
    /// 未授权私聊的礼貌回复
    #[serde(default = "default_unauthorized_reply")]
    pub unauthorized_reply: String,
    /// 单条回复最大字符数，超出分段发送
    #[serde(default = "default_max_reply_chars")]
    pub max_reply_chars: usize,
}

fn default_reset_command() -> String {
    "/new".to_string()
}

fn default_seed_prompt() -> String {
    "Hello, my name is: {name}".to_string()
}

fn default_seed_reply() -> String {
    "Hello! I am your personal assistant: helpful, creative, smart and friendly.".to_string()
}

fn default_failure_reply() -> String {
    "The server is having trouble. Please try again later.".to_string()
}

fn default_unauthorized_reply() -> String {
    "Sorry, you are not authorized to use this assistant.".to_string()
}

fn default_max_reply_chars() -> usize {
    4000
}

impl Default for AssistantSection {
    fn default() -> Self {
        Self {
            reset_command: default_reset_command(),
            seed_prompt: default_seed_prompt(),
            seed_reply: default_seed_reply(),
            failure_reply: default_failure_reply(),
            unauthorized_reply: default_unauthorized_reply(),
            max_reply_chars: default_max_reply_chars(),
        }
    }
}

/// [context] 段：每个会话保留的对话轮数（不含种子对）
#[derive(Debug, Clone, Deserialize)]
pub struct ContextSection {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

fn default_max_turns() -> usize {
    20
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
        }
    }
}

/// 白名单作用范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessScope {
    Groups,
    Direct,
    #[default]
    Both,
}

/// [access] 段：可选白名单；两个列表都为空表示不启用
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AccessSection {
    /// 允许的群组地址（如 `120363xxxx@g.us`）
    #[serde(default)]
    pub allowed_groups: Vec<String>,
    /// 允许的联系人（完整地址或号码）
    #[serde(default)]
    pub allowed_contacts: Vec<String>,
    #[serde(default)]
    pub scope: AccessScope,
    /// 被拒绝的私聊是否回复礼貌提示（群聊永不回复）
    #[serde(default)]
    pub reply_unauthorized_direct: bool,
}

/// [reconnect] 段：重连退避（毫秒）
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 CHATBRIDGE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 叠加环境变量 CHATBRIDGE__*（双下划线表示嵌套键）
/// 4. 最后应用 `PORT`
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
        config::Environment::with_prefix("CHATBRIDGE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("access.allowed_groups")
            .with_list_parse_key("access.allowed_contacts")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let mut cfg: AppConfig = c.try_deserialize()?;
    if let Ok(port) = std::env::var("PORT") {
        cfg.server.bind_addr = with_port(&cfg.server.bind_addr, &port);
    }
    cfg.validate()?;
    Ok(cfg)
}

impl AppConfig {
    /// 拒绝会让桥接行为失真的取值
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.context.max_turns == 0 {
            return Err(config::ConfigError::Message(
                "context.max_turns must be at least 1".to_string(),
            ));
        }
        if self.assistant.max_reply_chars == 0 {
            return Err(config::ConfigError::Message(
                "assistant.max_reply_chars must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// 替换 `host:port` 中的端口
fn with_port(bind_addr: &str, port: &str) -> String {
    let host = bind_addr
        .rsplit_once(':')
        .map(|(h, _)| h)
        .unwrap_or(bind_addr);
    format!("{}:{}", host, port)
}
