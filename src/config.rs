use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use eyre::{eyre, Result};
use humantime::parse_duration;
use reqwest::Url;

use crate::backend::{CommandConfig, KubernetesDrainConfig};
use crate::engine::{EngineConfig, DEFAULT_DRAIN_EVENT_TYPES};
use crate::metadata::MetadataConfig;
use crate::notification::{Notifier, MESSAGE_PLACEHOLDER};

const DEFAULT_INSTANCE_URL: &str =
    "http://169.254.169.254/metadata/instance?api-version=2019-08-01";
const DEFAULT_SCHEDULED_EVENTS_URL: &str =
    "http://169.254.169.254/metadata/scheduledevents?api-version=2019-08-01";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DrainMode {
    Kubernetes,
    Command,
}

#[derive(Clone, Debug, Parser)]
#[command(version, about)]
pub struct Config {
    /// Log as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,

    #[arg(long, env = "SERVER_BIND", default_value = "0.0.0.0:8080")]
    pub server_bind: SocketAddr,

    /// Interval between two scheduled event polls
    #[arg(long, env = "SCRAPE_TIME", default_value = "1m", value_parser = parse_duration)]
    pub scrape_time: Duration,

    #[arg(long, env = "METADATA_INSTANCE_URL", default_value = DEFAULT_INSTANCE_URL, value_parser = parse_metadata_url)]
    pub metadata_instance_url: Url,

    #[arg(long, env = "METADATA_SCHEDULEDEVENTS_URL", default_value = DEFAULT_SCHEDULED_EVENTS_URL, value_parser = parse_metadata_url)]
    pub metadata_scheduledevents_url: Url,

    #[arg(long, env = "METADATA_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub metadata_timeout: Duration,

    /// Consecutive failed polls tolerated before giving up, 0 tolerates any number
    #[arg(long, env = "METADATA_ERROR_THRESHOLD", default_value_t = 0)]
    pub metadata_error_threshold: u32,

    /// Approve scheduled events for this instance so they start early
    #[arg(long, env = "APPROVE_SCHEDULED_EVENT")]
    pub approve_scheduled_event: bool,

    /// Resource name of this instance, read from the instance metadata when absent
    #[arg(long, env = "VM_NODENAME")]
    pub vm_node_name: Option<String>,

    #[arg(long, env = "DRAIN_ENABLE")]
    pub drain_enable: bool,

    #[arg(long, env = "DRAIN_MODE", value_enum, required_if_eq("drain_enable", "true"))]
    pub drain_mode: Option<DrainMode>,

    /// Drain this long before the event is due
    #[arg(long, env = "DRAIN_NOT_BEFORE", default_value = "5m", value_parser = parse_duration)]
    pub drain_not_before: Duration,

    /// Event types that trigger a drain, case-insensitive
    #[arg(long, env = "DRAIN_EVENTS", value_delimiter = ',', default_values = DEFAULT_DRAIN_EVENT_TYPES)]
    pub drain_events: Vec<String>,

    #[arg(long, env = "DRAIN_WAIT_BEFORE_CMD", default_value = "0s", value_parser = parse_duration)]
    pub drain_wait_before_cmd: Duration,

    #[arg(long, env = "DRAIN_WAIT_AFTER_CMD", default_value = "0s", value_parser = parse_duration)]
    pub drain_wait_after_cmd: Duration,

    #[arg(long, env = "COMMAND_TEST_CMD")]
    pub command_test_cmd: Option<String>,

    #[arg(long, env = "COMMAND_DRAIN_CMD")]
    pub command_drain_cmd: Option<String>,

    #[arg(long, env = "COMMAND_UNCORDON_CMD")]
    pub command_uncordon_cmd: Option<String>,

    #[arg(long, env = "KUBE_NODENAME", required_if_eq("drain_mode", "kubernetes"))]
    pub kube_node_name: Option<String>,

    /// Overrides the termination grace period of evicted pods
    #[arg(long, env = "KUBE_DRAIN_GRACE_PERIOD", value_parser = parse_duration)]
    pub kube_drain_grace_period: Option<Duration>,

    #[arg(long, env = "KUBE_DRAIN_TIMEOUT", default_value = "5m", value_parser = parse_duration)]
    pub kube_drain_timeout: Duration,

    /// Also evict pods not managed by a controller
    #[arg(long, env = "KUBE_DRAIN_FORCE")]
    pub kube_drain_force: bool,

    #[arg(long, env = "KUBE_DRAIN_IGNORE_DAEMONSETS")]
    pub kube_drain_ignore_daemonsets: bool,

    #[arg(long, env = "KUBE_DRAIN_DELETE_EMPTYDIR_DATA")]
    pub kube_drain_delete_emptydir_data: bool,

    /// Only evict pods matching this label selector
    #[arg(long, env = "KUBE_DRAIN_POD_SELECTOR")]
    pub kube_drain_pod_selector: Option<String>,

    #[arg(long, env = "KUBE_DRAIN_DRY_RUN")]
    pub kube_drain_dry_run: bool,

    /// Webhook URLs notified before a drain
    #[arg(long, env = "NOTIFICATION", value_delimiter = ',')]
    pub notification: Vec<Url>,

    #[arg(long, env = "NOTIFICATION_MESSAGE_TEMPLATE", default_value = MESSAGE_PLACEHOLDER)]
    pub notification_message_template: String,

    /// Record the latency of scheduled event polls
    #[arg(long, env = "METRICS_REQUESTSTATS")]
    pub metrics_request_stats: bool,
}

impl Config {
    pub fn metadata_config(&self) -> MetadataConfig {
        MetadataConfig {
            scheduled_events_url: self.metadata_scheduledevents_url.clone(),
            instance_url: self.metadata_instance_url.clone(),
            timeout: self.metadata_timeout,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            poll_interval: self.scrape_time,
            not_before_lead_time: self.drain_not_before,
            error_threshold: self.metadata_error_threshold,
            drain_enabled: self.drain_enable,
            drain_event_types: self
                .drain_events
                .iter()
                .map(|event_type| event_type.trim().to_owned())
                .filter(|event_type| !event_type.is_empty())
                .collect(),
            approve_events: self.approve_scheduled_event,
            wait_before_drain: self.drain_wait_before_cmd,
            wait_after_drain: self.drain_wait_after_cmd,
            request_stats: self.metrics_request_stats,
        }
    }

    pub fn command_config(&self) -> CommandConfig {
        CommandConfig {
            test: self.command_test_cmd.clone(),
            drain: self.command_drain_cmd.clone(),
            uncordon: self.command_uncordon_cmd.clone(),
        }
    }

    pub fn kube_drain_config(&self) -> KubernetesDrainConfig {
        KubernetesDrainConfig {
            grace_period: self.kube_drain_grace_period,
            timeout: self.kube_drain_timeout,
            force: self.kube_drain_force,
            ignore_daemonsets: self.kube_drain_ignore_daemonsets,
            delete_emptydir_data: self.kube_drain_delete_emptydir_data,
            pod_selector: self.kube_drain_pod_selector.clone(),
            dry_run: self.kube_drain_dry_run,
        }
    }

    pub fn notifier(&self) -> Notifier {
        Notifier::new(
            self.notification.clone(),
            self.notification_message_template.clone(),
        )
    }
}

fn parse_metadata_url(input: &str) -> Result<Url> {
    let url = Url::parse(input)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(eyre!("metadata url should be http or https"));
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, clap::Error> {
        Config::try_parse_from(std::iter::once("scheduled-events-drain").chain(args.iter().copied()))
    }

    #[test]
    fn defaults() {
        let config = parse(&[]).unwrap();

        assert_eq!(config.scrape_time, Duration::from_secs(60));
        assert_eq!(config.drain_not_before, Duration::from_secs(300));
        assert_eq!(config.metadata_timeout, Duration::from_secs(30));
        assert_eq!(config.metadata_error_threshold, 0);
        assert_eq!(
            config.drain_events,
            vec!["reboot", "redeploy", "preempt", "terminate"]
        );
        assert_eq!(
            config.metadata_scheduledevents_url.as_str(),
            DEFAULT_SCHEDULED_EVENTS_URL
        );
        assert!(!config.drain_enable);
        assert!(config.notification.is_empty());
    }

    #[test]
    fn should_split_drain_events() {
        let config = parse(&["--drain-events", "Reboot, Freeze"]).unwrap();

        assert_eq!(
            config.engine_config().drain_event_types,
            vec!["Reboot".to_owned(), "Freeze".to_owned()]
        );
    }

    #[test]
    fn should_reject_non_http_metadata_url() {
        assert!(parse(&["--metadata-instance-url", "ftp://169.254.169.254/x"]).is_err());
        assert!(parse(&["--metadata-scheduledevents-url", "https://metadata.local/x"]).is_ok());
    }

    #[test]
    fn drain_mode_is_required_when_enabled() {
        assert!(parse(&["--drain-enable"]).is_err());
        assert!(parse(&["--drain-enable", "--drain-mode", "command"]).is_ok());
    }

    #[test]
    fn kube_node_name_is_required_in_kubernetes_mode() {
        assert!(parse(&["--drain-enable", "--drain-mode", "kubernetes"]).is_err());

        let config = parse(&[
            "--drain-enable",
            "--drain-mode",
            "kubernetes",
            "--kube-node-name",
            "aks-nodepool-1",
            "--kube-drain-timeout",
            "90s",
        ])
        .unwrap();
        assert_eq!(config.drain_mode, Some(DrainMode::Kubernetes));
        assert_eq!(config.kube_drain_config().timeout, Duration::from_secs(90));
    }
}
