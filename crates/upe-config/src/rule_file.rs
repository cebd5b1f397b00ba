//! INI-style rule-file loader, per `spec.md` §6.
//!
//! A hand-rolled line parser rather than a generic INI crate: the format is
//! a handful of `[rule]` sections with flat `key = value` pairs and `#`/`;`
//! comments, the same shape as the original's `rule_config.c`.
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use upe_core::parser::{PROTO_ICMP, PROTO_ICMPV6, PROTO_TCP, PROTO_UDP};
use upe_core::MaskedAddr;

use crate::error::ConfigError;

/// A rule's action, with the egress interface still an unresolved name —
/// resolving it to an `ifindex` requires a socket syscall, which belongs to
/// `upe-net`, not this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedAction {
    Drop,
    Fwd { out_iface: String },
}

/// One `[rule]` section, validated but not yet bound to an `ifindex`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRule {
    pub priority: u32,
    pub ip_version: Option<u8>,
    pub protocol: u8,
    pub src: MaskedAddr,
    pub dst: MaskedAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub action: ParsedAction,
}

struct RawBlock {
    start_line: usize,
    fields: Vec<(String, String)>,
}

/// Parses the rule file at `path` into an ordered list of [`ParsedRule`]s.
///
/// # Errors
/// [`ConfigError::RuleFileOpen`] if the file cannot be read, or
/// [`ConfigError::RuleParse`]/[`ConfigError::MissingOutIface`] for a
/// malformed section.
pub fn load(path: &Path) -> Result<Vec<ParsedRule>, ConfigError> {
    let text = fs::read_to_string(path).map_err(|e| ConfigError::RuleFileOpen(path.to_path_buf(), e))?;
    let blocks = split_blocks(&text);

    blocks.into_iter().map(|block| parse_block(path, &block)).collect()
}

fn split_blocks(text: &str) -> Vec<RawBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<RawBlock> = None;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('[') {
            if let Some(block) = current.take() {
                blocks.push(block);
            }
            if line.eq_ignore_ascii_case("[rule]") {
                current = Some(RawBlock { start_line: line_no, fields: Vec::new() });
            }
            continue;
        }

        if let Some(block) = current.as_mut() {
            if let Some((key, value)) = line.split_once('=') {
                block.fields.push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
            }
        }
    }

    if let Some(block) = current.take() {
        blocks.push(block);
    }
    blocks
}

fn strip_comment(line: &str) -> &str {
    line.find(['#', ';']).map_or(line, |idx| &line[..idx])
}

fn field<'a>(block: &'a RawBlock, key: &str) -> Option<&'a str> {
    block.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

fn parse_err(path: &Path, line: usize, reason: impl Into<String>) -> ConfigError {
    ConfigError::RuleParse { path: path.to_path_buf(), line, reason: reason.into() }
}

fn parse_block(path: &Path, block: &RawBlock) -> Result<ParsedRule, ConfigError> {
    let line = block.start_line;

    let priority: u32 = field(block, "priority")
        .ok_or_else(|| parse_err(path, line, "missing priority"))?
        .parse()
        .map_err(|_| parse_err(path, line, "priority must be a non-negative integer"))?;

    let ip_version = match field(block, "ip_version") {
        None => None,
        Some("4") => Some(4),
        Some("6") => Some(6),
        Some(other) => return Err(parse_err(path, line, format!("invalid ip_version {other:?}"))),
    };

    let protocol = match field(block, "protocol") {
        None => 0,
        Some("tcp") => PROTO_TCP,
        Some("udp") => PROTO_UDP,
        Some("icmp") => PROTO_ICMP,
        Some("icmpv6") => PROTO_ICMPV6,
        Some(other) => other
            .parse()
            .map_err(|_| parse_err(path, line, format!("invalid protocol {other:?}")))?,
    };

    let version_for_cidr = ip_version.unwrap_or(4);
    let src = match field(block, "src") {
        Some(text) => parse_cidr(path, line, text, version_for_cidr)?,
        None => MaskedAddr::wildcard(version_for_cidr),
    };
    let dst = match field(block, "dst") {
        Some(text) => parse_cidr(path, line, text, version_for_cidr)?,
        None => MaskedAddr::wildcard(version_for_cidr),
    };

    let src_port = parse_port(path, line, field(block, "src_port"))?;
    let dst_port = parse_port(path, line, field(block, "dst_port"))?;

    let action = match field(block, "action") {
        Some("drop") => ParsedAction::Drop,
        Some("fwd") => {
            let out_iface = field(block, "out_iface")
                .ok_or_else(|| ConfigError::MissingOutIface { path: path.to_path_buf(), line })?;
            ParsedAction::Fwd { out_iface: out_iface.to_string() }
        }
        Some(other) => return Err(parse_err(path, line, format!("invalid action {other:?}"))),
        None => return Err(parse_err(path, line, "missing action")),
    };

    Ok(ParsedRule { priority, ip_version, protocol, src, dst, src_port, dst_port, action })
}

fn parse_port(path: &Path, line: usize, text: Option<&str>) -> Result<u16, ConfigError> {
    match text {
        None => Ok(0),
        Some(s) => s.parse().map_err(|_| parse_err(path, line, format!("invalid port {s:?}"))),
    }
}

fn parse_cidr(path: &Path, line: usize, text: &str, ip_version: u8) -> Result<MaskedAddr, ConfigError> {
    let (addr_part, prefix_part) = text.split_once('/').unzip();
    let addr_part = addr_part.unwrap_or(text);

    if ip_version == 6 {
        let addr: Ipv6Addr = addr_part
            .parse()
            .map_err(|_| parse_err(path, line, format!("invalid IPv6 address {addr_part:?}")))?;
        let prefix = match prefix_part {
            Some(p) => p.parse().map_err(|_| parse_err(path, line, format!("invalid prefix {p:?}")))?,
            None => 128,
        };
        Ok(MaskedAddr::from_prefix_v6(addr.octets(), prefix))
    } else {
        let addr: Ipv4Addr = addr_part
            .parse()
            .map_err(|_| parse_err(path, line, format!("invalid IPv4 address {addr_part:?}")))?;
        let prefix = match prefix_part {
            Some(p) => p.parse().map_err(|_| parse_err(path, line, format!("invalid prefix {p:?}")))?,
            None => 32,
        };
        Ok(MaskedAddr::from_prefix_v4(u32::from(addr), prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_rules(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("upe_rules_{}_{}.ini", std::process::id(), contents.len()));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_drop_and_fwd_rules_with_cidr() {
        let path = write_rules(
            "# comment\n\
             [rule]\n\
             priority = 10\n\
             ip_version = 4\n\
             protocol = tcp\n\
             src = 10.0.0.0/24\n\
             dst = 10.0.1.1\n\
             dst_port = 443\n\
             action = drop\n\
             \n\
             [rule]\n\
             priority = 20\n\
             protocol = udp\n\
             action = fwd\n\
             out_iface = eth1 ; egress\n",
        );

        let rules = load(&path).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].priority, 10);
        assert_eq!(rules[0].dst_port, 443);
        assert_eq!(rules[0].action, ParsedAction::Drop);
        assert_eq!(rules[1].action, ParsedAction::Fwd { out_iface: "eth1".to_string() });

        fs::remove_file(&path).ok();
    }

    #[test]
    fn fwd_without_out_iface_is_rejected() {
        let path = write_rules("[rule]\npriority = 1\naction = fwd\n");
        assert!(matches!(load(&path), Err(ConfigError::MissingOutIface { .. })));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn bare_address_implies_full_prefix() {
        let path = write_rules("[rule]\npriority = 1\nsrc = 192.168.1.5\naction = drop\n");
        let rules = load(&path).unwrap();
        match rules[0].src {
            MaskedAddr::V4 { mask, .. } => assert_eq!(mask, u32::MAX),
            MaskedAddr::V6 { .. } => panic!("expected v4"),
        }
        fs::remove_file(&path).ok();
    }
}
