//! Desired-state NAT rule types.

use crate::error::BridgeError;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Maximum length of a description embedded in a filter-rule comment.
pub const MAX_COMMENT_DESC_LEN: usize = 100;

/// Maximum length iptables accepts for a whole comment.
const MAX_COMMENT_LEN: usize = 255;

/// Transport protocol of a forwarded port. Stored lowercase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(BridgeError::Config(format!(
                "unsupported protocol '{}', expected tcp or udp",
                other
            ))),
        }
    }
}

impl ToSql for Protocol {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(ValueRef::Text(
            self.as_str().as_bytes(),
        )))
    }
}

impl FromSql for Protocol {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(std::io::Error::other(format!("{}", e)))))
    }
}

/// One persisted port-forwarding rule: the desired state for a single
/// host-port/protocol mapping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NatRule {
    pub id: i64,
    pub node: String,
    pub vmid: u32,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
    /// Address snapshot taken when the rule was last applied.
    pub container_ip: IpAddr,
    pub description: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NatRule {
    /// Ownership comment embedded in the applied filter rule, so that a
    /// later listing can recognize rules this system owns.
    pub fn comment(&self, owner_tag: &str) -> String {
        let base = format!(
            "{}: rule_id={} node={} vmid={}",
            owner_tag, self.id, self.node, self.vmid
        );

        let comment = match &self.description {
            Some(desc) if !desc.is_empty() => {
                format!("{} desc={}", base, sanitize_description(desc))
            }
            _ => base.clone(),
        };

        if comment.len() > MAX_COMMENT_LEN {
            // Drop the description rather than emit an invalid comment.
            base.chars().take(MAX_COMMENT_LEN).collect()
        } else {
            comment
        }
    }

    /// Destination of the DNAT redirect.
    pub fn destination(&self) -> String {
        format!("{}:{}", self.container_ip, self.container_port)
    }
}

fn sanitize_description(desc: &str) -> String {
    let sane: String = desc
        .chars()
        .map(|c| match c {
            '"' => '\'',
            ';' => '_',
            c => c,
        })
        .collect();
    if sane.chars().count() > MAX_COMMENT_DESC_LEN {
        let truncated: String = sane.chars().take(MAX_COMMENT_DESC_LEN - 3).collect();
        format!("{}...", truncated)
    } else {
        sane
    }
}

/// Input for creating a rule. The container address is resolved at creation
/// time, not supplied by the caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewRule {
    pub node: String,
    pub vmid: u32,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
    pub description: Option<String>,
}

/// Partial update of a rule; unset fields keep their value.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RuleUpdate {
    pub host_port: Option<u16>,
    pub container_port: Option<u16>,
    pub protocol: Option<Protocol>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn rule(id: i64) -> NatRule {
        NatRule {
            id,
            node: "pve".into(),
            vmid: 105,
            host_port: 8080,
            container_port: 80,
            protocol: Protocol::Tcp,
            container_ip: "10.0.0.5".parse().unwrap(),
            description: None,
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn protocol_parse_is_case_insensitive() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("icmp".parse::<Protocol>().is_err());
    }

    #[test]
    fn comment_without_description() {
        let rule = rule(7);
        assert_eq!(rule.comment("pvebridge"), "pvebridge: rule_id=7 node=pve vmid=105");
    }

    #[test]
    fn comment_with_description() {
        let mut rule = rule(7);
        rule.description = Some("web \"frontend\"; port".into());
        assert_eq!(
            rule.comment("pvebridge"),
            "pvebridge: rule_id=7 node=pve vmid=105 desc=web 'frontend'_ port"
        );
    }

    #[test]
    fn long_description_is_truncated() {
        let mut rule = rule(7);
        rule.description = Some("x".repeat(300));
        let comment = rule.comment("pvebridge");
        assert!(comment.len() <= 255);
        assert!(comment.ends_with("..."));
        let desc = comment.split("desc=").nth(1).unwrap();
        assert_eq!(desc.chars().count(), MAX_COMMENT_DESC_LEN);
    }

    #[test]
    fn destination_format() {
        assert_eq!(rule(1).destination(), "10.0.0.5:80");
    }
}
