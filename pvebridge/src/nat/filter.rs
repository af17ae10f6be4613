//! Packet-filter control: applying, retracting and listing DNAT rules.
//!
//! The reconciler depends only on the [`PacketFilter`] trait; the shipped
//! implementation shells out to iptables, but a netlink binding or a test
//! mock can stand in behind the same apply/retract/list contract.

use crate::error::{BridgeError, BridgeResult, CommandError};
use crate::nat::rule::NatRule;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// One live rule in the NAT redirect chain, as reported by the engine.
///
/// `spec` holds the rule specification tokens after `-A PREROUTING`, in the
/// engine's own declaration order, so the exact rule can be replayed with
/// `-D` for retraction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveRule {
    pub spec: Vec<String>,
    pub comment: String,
}

impl LiveRule {
    /// Rule id embedded in the ownership comment, when present.
    pub fn rule_id(&self) -> Option<i64> {
        self.comment
            .split_whitespace()
            .find_map(|field| field.strip_prefix("rule_id="))
            .and_then(|id| id.parse().ok())
    }
}

/// Capability surface over the packet-filtering engine.
#[async_trait]
pub trait PacketFilter: Send + Sync {
    /// Install the DNAT redirect for one rule.
    async fn apply(&self, rule: &NatRule) -> BridgeResult<()>;

    /// Remove the DNAT redirect for one rule, matching what `apply` installed.
    async fn retract(&self, rule: &NatRule) -> BridgeResult<()>;

    /// Remove one live rule by replaying its listed specification.
    async fn retract_live(&self, live: &LiveRule) -> BridgeResult<()>;

    /// Live rules carrying this system's ownership tag, in declaration order.
    async fn list(&self) -> BridgeResult<Vec<LiveRule>>;
}

/// iptables-backed implementation.
pub struct IptablesFilter {
    binary: String,
    timeout: Duration,
    owner_tag: String,
}

impl IptablesFilter {
    pub fn new(binary: String, timeout: Duration, owner_tag: String) -> Self {
        Self {
            binary,
            timeout,
            owner_tag,
        }
    }

    /// Argument vector for adding or deleting the redirect of one rule.
    fn rule_args(&self, rule: &NatRule, add: bool) -> Vec<String> {
        vec![
            "-t".into(),
            "nat".into(),
            if add { "-A" } else { "-D" }.into(),
            "PREROUTING".into(),
            "-p".into(),
            rule.protocol.to_string(),
            "--dport".into(),
            rule.host_port.to_string(),
            "-j".into(),
            "DNAT".into(),
            "--to-destination".into(),
            rule.destination(),
            "-m".into(),
            "comment".into(),
            "--comment".into(),
            rule.comment(&self.owner_tag),
        ]
    }

    async fn run(&self, args: &[String]) -> BridgeResult<String> {
        tracing::debug!(binary = %self.binary, ?args, "invoking packet filter");

        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .env("LC_ALL", "C")
            .env("LANG", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    BridgeError::Command(CommandError::BinaryMissing(self.binary.clone()))
                } else {
                    BridgeError::Command(CommandError::Io(e.to_string()))
                }
            })?,
            Err(_) => {
                tracing::error!(binary = %self.binary, timeout_secs = self.timeout.as_secs(), "packet filter command timed out");
                return Err(BridgeError::Command(CommandError::Timeout(
                    self.timeout.as_secs(),
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let diagnostic = if stderr.is_empty() { stdout } else { stderr };
            let code = output.status.code().unwrap_or(-1);
            tracing::error!(binary = %self.binary, code, %diagnostic, "packet filter command failed");
            return Err(BridgeError::Command(CommandError::Failed {
                code,
                output: diagnostic,
            }));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl PacketFilter for IptablesFilter {
    async fn apply(&self, rule: &NatRule) -> BridgeResult<()> {
        self.run(&self.rule_args(rule, true)).await?;
        tracing::info!(rule_id = rule.id, dest = %rule.destination(), "applied NAT rule");
        Ok(())
    }

    async fn retract(&self, rule: &NatRule) -> BridgeResult<()> {
        self.run(&self.rule_args(rule, false)).await?;
        tracing::info!(rule_id = rule.id, dest = %rule.destination(), "retracted NAT rule");
        Ok(())
    }

    async fn retract_live(&self, live: &LiveRule) -> BridgeResult<()> {
        let mut args: Vec<String> = vec![
            "-t".into(),
            "nat".into(),
            "-D".into(),
            "PREROUTING".into(),
        ];
        args.extend(live.spec.iter().cloned());
        self.run(&args).await?;
        Ok(())
    }

    async fn list(&self) -> BridgeResult<Vec<LiveRule>> {
        let args: Vec<String> = vec![
            "-t".into(),
            "nat".into(),
            "-S".into(),
            "PREROUTING".into(),
        ];
        let stdout = self.run(&args).await?;
        Ok(parse_rule_listing(&stdout, &self.owner_tag))
    }
}

/// Parse `iptables -t nat -S PREROUTING` output, keeping only rules whose
/// comment carries the owner tag. Order is preserved as listed.
fn parse_rule_listing(output: &str, owner_tag: &str) -> Vec<LiveRule> {
    let tag_prefix = format!("{}:", owner_tag);
    let mut rules = Vec::new();

    for line in output.lines() {
        let tokens = tokenize(line);
        if tokens.len() < 2 || tokens[0] != "-A" || tokens[1] != "PREROUTING" {
            continue;
        }
        let spec: Vec<String> = tokens[2..].to_vec();

        let comment = spec
            .windows(2)
            .find(|pair| pair[0] == "--comment")
            .map(|pair| pair[1].clone());
        let Some(comment) = comment else {
            continue;
        };
        if !comment.starts_with(&tag_prefix) {
            continue;
        }

        rules.push(LiveRule { spec, comment });
    }

    rules
}

/// Split one rule line into tokens, honoring double quotes and backslash
/// escapes the way iptables renders comments.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in line.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
