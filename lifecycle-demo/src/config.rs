use envconfig::Envconfig;
use lifecycle::{EnvMsDuration, LifecycleConfig};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(from = "METRICS_BIND", default = "0.0.0.0:9090")]
    pub metrics_bind: String,

    #[envconfig(from = "DEBUG", default = "false")]
    pub debug: bool,

    #[envconfig(default = "1000")]
    pub tick_interval: EnvMsDuration,

    /// How long the demo closer takes; above the shutdown timeout it gets abandoned.
    #[envconfig(default = "500")]
    pub flush_duration: EnvMsDuration,

    #[envconfig(nested = true)]
    pub lifecycle: LifecycleConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
