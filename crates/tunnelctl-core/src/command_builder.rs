//! C3: produces argument vectors for the external `cloudflared` binary and
//! emits the ingress YAML it reads, always routed through one config path.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub struct CommandBuilder {
    config_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngressConfig {
    pub tunnel: String,
    #[serde(rename = "credentials-file")]
    pub credentials_file: PathBuf,
    pub ingress: Vec<IngressRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngressRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub service: String,
}

impl CommandBuilder {
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// `cloudflared tunnel login` — the sole command that never takes `--config`.
    pub fn login(&self) -> Vec<String> {
        vec!["tunnel".to_string(), "login".to_string()]
    }

    pub fn create(&self, name: &str) -> Vec<String> {
        self.with_config(["tunnel", "create", name])
    }

    pub fn route_dns(&self, id_or_name: &str, host: &str, overwrite: bool) -> Vec<String> {
        let mut args = vec!["tunnel".to_string(), "route".to_string(), "dns".to_string()];
        if overwrite {
            args.push("--overwrite".to_string());
        }
        args.push(id_or_name.to_string());
        args.push(host.to_string());
        self.prepend_config(args)
    }

    /// Named-run. `id` is accepted but redundant when the config file already
    /// names a tunnel; both forms are tolerated by the external binary.
    pub fn run(&self, id: Option<&str>) -> Vec<String> {
        let mut args = vec!["tunnel".to_string(), "run".to_string()];
        if let Some(id) = id {
            args.push(id.to_string());
        }
        self.prepend_config(args)
    }

    /// Quick-tunnel run never takes `--config`; it actively refuses to start
    /// if a config file is present (see supervisor's displace/restore dance).
    pub fn run_quick(&self, local_port: u16) -> Vec<String> {
        vec![
            "tunnel".to_string(),
            "--url".to_string(),
            format!("http://localhost:{local_port}"),
        ]
    }

    pub fn delete(&self, id: &str) -> Vec<String> {
        self.with_config(["tunnel", "delete", id])
    }

    pub fn list(&self) -> Vec<String> {
        self.with_config(["tunnel", "list"])
    }

    fn with_config<const N: usize>(&self, tail: [&str; N]) -> Vec<String> {
        self.prepend_config(tail.iter().map(|s| s.to_string()).collect())
    }

    fn prepend_config(&self, tail: Vec<String>) -> Vec<String> {
        let mut args = vec![
            "--config".to_string(),
            self.config_path.display().to_string(),
        ];
        args.extend(tail);
        args
    }

    /// Builds the ingress YAML for a named tunnel routing one hostname (or a
    /// bare catch-all when `hostname` is `None`).
    pub fn build_ingress(
        tunnel_id: &str,
        credentials_file: PathBuf,
        hostname: Option<&str>,
        local_port: u16,
    ) -> IngressConfig {
        let mut ingress = Vec::new();
        if let Some(host) = hostname {
            ingress.push(IngressRule {
                hostname: Some(host.to_string()),
                service: format!("http://localhost:{local_port}"),
            });
        }
        ingress.push(IngressRule {
            hostname: None,
            service: "http_status:404".to_string(),
        });
        IngressConfig {
            tunnel: tunnel_id.to_string(),
            credentials_file,
            ingress,
        }
    }

    pub fn render_yaml(config: &IngressConfig) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(config)?)
    }

    pub fn parse_yaml(text: &str) -> anyhow::Result<IngressConfig> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub async fn write_ingress(&self, config: &IngressConfig) -> anyhow::Result<()> {
        let yaml = Self::render_yaml(config)?;
        if let Some(parent) = self.config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.config_path, yaml).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> CommandBuilder {
        CommandBuilder::new(PathBuf::from("/home/user/.cloudflared/config.yml"))
    }

    #[test]
    fn login_never_carries_config() {
        assert_eq!(builder().login(), vec!["tunnel", "login"]);
    }

    #[test]
    fn create_carries_config_first() {
        let args = builder().create("my-tunnel");
        assert_eq!(
            args,
            vec![
                "--config",
                "/home/user/.cloudflared/config.yml",
                "tunnel",
                "create",
                "my-tunnel",
            ]
        );
    }

    #[test]
    fn route_dns_overwrite_flag_is_positioned_before_id_and_host() {
        let args = builder().route_dns("abc-123", "app.example.com", true);
        assert_eq!(
            args,
            vec![
                "--config",
                "/home/user/.cloudflared/config.yml",
                "tunnel",
                "route",
                "dns",
                "--overwrite",
                "abc-123",
                "app.example.com",
            ]
        );
    }

    #[test]
    fn run_quick_has_no_config_flag() {
        let args = builder().run_quick(8080);
        assert!(!args.contains(&"--config".to_string()));
        assert_eq!(args, vec!["tunnel", "--url", "http://localhost:8080"]);
    }

    #[test]
    fn ingress_with_hostname_has_exactly_one_rule_then_catchall() {
        let cfg = CommandBuilder::build_ingress(
            "abc-123",
            PathBuf::from("/home/user/.cloudflared/abc-123.json"),
            Some("app.example.com"),
            8080,
        );
        assert_eq!(cfg.ingress.len(), 2);
        assert_eq!(cfg.ingress[0].hostname.as_deref(), Some("app.example.com"));
        assert_eq!(cfg.ingress[0].service, "http://localhost:8080");
        assert!(cfg.ingress[1].hostname.is_none());
        assert_eq!(cfg.ingress[1].service, "http_status:404");
    }

    #[test]
    fn catch_all_only_ingress_has_single_rule() {
        let cfg = CommandBuilder::build_ingress(
            "abc-123",
            PathBuf::from("/home/user/.cloudflared/abc-123.json"),
            None,
            8080,
        );
        assert_eq!(cfg.ingress.len(), 1);
        assert_eq!(cfg.ingress[0].service, "http_status:404");
    }

    /// L1: generate then parse yields an equal structure (ingress order preserved).
    #[test]
    fn yaml_round_trips() {
        let cfg = CommandBuilder::build_ingress(
            "abc-123",
            PathBuf::from("/home/user/.cloudflared/abc-123.json"),
            Some("app.example.com"),
            8080,
        );
        let yaml = CommandBuilder::render_yaml(&cfg).unwrap();
        let parsed = CommandBuilder::parse_yaml(&yaml).unwrap();
        assert_eq!(parsed, cfg);
    }
}
