//! BIND zone file rendering.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_TTL: u32 = 3600;

/// Longest character-string a TXT record may carry in one piece.
const TXT_CHUNK: usize = 255;

static SERIAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{10})\s*;\s*serial").unwrap());

#[derive(Debug, Error, PartialEq)]
#[error("Unsupported record type: {0}")]
pub struct UnknownRecordType(pub String);

/// Record types in zone emit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    NS,
    A,
    AAAA,
    CNAME,
    MX,
    TXT,
    SRV,
    CAA,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NS => "NS",
            Self::A => "A",
            Self::AAAA => "AAAA",
            Self::CNAME => "CNAME",
            Self::MX => "MX",
            Self::TXT => "TXT",
            Self::SRV => "SRV",
            Self::CAA => "CAA",
        }
    }

    pub fn has_priority(&self) -> bool {
        matches!(self, Self::MX | Self::SRV)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = UnknownRecordType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NS" => Ok(Self::NS),
            "A" => Ok(Self::A),
            "AAAA" => Ok(Self::AAAA),
            "CNAME" => Ok(Self::CNAME),
            "MX" => Ok(Self::MX),
            "TXT" => Ok(Self::TXT),
            "SRV" => Ok(Self::SRV),
            "CAA" => Ok(Self::CAA),
            _ => Err(UnknownRecordType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneRecord {
    /// Relative owner name; `@` is the apex.
    pub name: String,
    pub record_type: RecordType,
    pub content: String,
    pub ttl: u32,
    /// MX preference or SRV priority.
    pub priority: Option<u16>,
}

impl ZoneRecord {
    pub fn new(name: &str, record_type: RecordType, content: &str) -> Self {
        Self {
            name: name.to_string(),
            record_type,
            content: content.to_string(),
            ttl: DEFAULT_TTL,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = Some(priority);
        self
    }

    fn sort_key(&self) -> (RecordType, bool, &str, Option<u16>, &str) {
        (
            self.record_type,
            self.name != "@",
            &self.name,
            self.priority,
            &self.content,
        )
    }

    fn rdata(&self) -> String {
        let content = match self.record_type {
            RecordType::TXT => quote_txt(&self.content),
            _ => self.content.clone(),
        };
        match (self.record_type.has_priority(), self.priority) {
            (true, p) => format!("{} {}", p.unwrap_or(10), content),
            (false, _) => content,
        }
    }
}

/// Quote TXT content unless it already is, splitting long values into
/// consecutive character-strings.
pub fn quote_txt(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        return trimmed.to_string();
    }
    let escaped = trimmed.replace('\\', "\\\\").replace('"', "\\\"");
    let chars: Vec<char> = escaped.chars().collect();
    if chars.is_empty() {
        return "\"\"".to_string();
    }
    chars
        .chunks(TXT_CHUNK)
        .map(|chunk| format!("\"{}\"", chunk.iter().collect::<String>()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `YYYYMMDDHH` of `now`.
pub fn serial_for(now: DateTime<Utc>) -> u64 {
    now.format("%Y%m%d%H")
        .to_string()
        .parse()
        .unwrap_or_default()
}

/// Serial for the next write: the clock serial, or one past the previous
/// serial when several writes land within the same hour.
pub fn next_serial(previous: Option<u64>, now: DateTime<Utc>) -> u64 {
    let clock = serial_for(now);
    match previous {
        Some(prev) if prev >= clock => prev + 1,
        _ => clock,
    }
}

/// Serial of an existing zone file, if it carries one.
pub fn parse_serial(zone: &str) -> Option<u64> {
    SERIAL_RE
        .captures(zone)
        .and_then(|caps| caps[1].parse().ok())
}

fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

/// Records every new zone starts with.
pub fn default_records(domain: &str, server_ip: &str, nameservers: &[String]) -> Vec<ZoneRecord> {
    let (address_type, spf_mechanism) = match server_ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => (RecordType::AAAA, "ip6"),
        _ => (RecordType::A, "ip4"),
    };
    let mail_host = format!("mail.{}.", domain);

    let mut records: Vec<ZoneRecord> = ["@", "www", "mail", "ftp"]
        .iter()
        .map(|name| ZoneRecord::new(name, address_type, server_ip))
        .collect();
    records.push(ZoneRecord::new("webmail", RecordType::CNAME, &mail_host));
    records.push(ZoneRecord::new("@", RecordType::MX, &mail_host).with_priority(10));
    records.push(ZoneRecord::new(
        "@",
        RecordType::TXT,
        &format!("v=spf1 a mx {}:{} ~all", spf_mechanism, server_ip),
    ));
    for ns in nameservers.iter().take(2) {
        records.push(ZoneRecord::new("@", RecordType::NS, &fqdn(ns)));
    }
    records
}

/// Render a complete zone. Output depends only on the arguments.
pub fn render_zone(domain: &str, serial: u64, nameservers: &[String], records: &[ZoneRecord]) -> String {
    let primary = nameservers
        .first()
        .map(|ns| fqdn(ns))
        .unwrap_or_else(|| format!("ns1.{}.", domain));

    let mut out = format!(
        "\
$ORIGIN {origin}
$TTL {ttl}
@\tIN\tSOA\t{primary} hostmaster.{origin} (
\t\t{serial}\t; serial
\t\t3600\t\t; refresh
\t\t1800\t\t; retry
\t\t1209600\t\t; expire
\t\t86400 )\t\t; minimum
",
        origin = fqdn(domain),
        ttl = DEFAULT_TTL,
        primary = primary,
        serial = serial,
    );

    let mut sorted: Vec<&ZoneRecord> = records.iter().collect();
    sorted.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    let mut current: Option<RecordType> = None;
    for record in sorted {
        if current != Some(record.record_type) {
            out.push('\n');
            current = Some(record.record_type);
        }
        out.push_str(&format!(
            "{}\t{}\tIN\t{}\t{}\n",
            record.name,
            record.ttl,
            record.record_type,
            record.rdata()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn nameservers() -> Vec<String> {
        vec!["ns1.panel.example".to_string(), "ns2.panel.example".to_string()]
    }

    #[test]
    fn test_serial_format() {
        let now = Utc.with_ymd_and_hms(2026, 3, 7, 9, 41, 0).unwrap();
        assert_eq!(serial_for(now), 2026030709);
    }

    #[test]
    fn test_serial_strictly_increases_within_hour() {
        let now = Utc.with_ymd_and_hms(2026, 3, 7, 9, 0, 0).unwrap();
        let first = next_serial(None, now);
        let second = next_serial(Some(first), now);
        let third = next_serial(Some(second), now);
        assert!(first < second && second < third);
        let later = Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap();
        assert_eq!(next_serial(Some(third), later), 2026030712);
    }

    #[test]
    fn test_parse_serial_from_rendered_zone() {
        let zone = render_zone("alice.example", 2026030709, &nameservers(), &[]);
        assert_eq!(parse_serial(&zone), Some(2026030709));
        assert_eq!(parse_serial("no serial here"), None);
    }

    #[test]
    fn test_default_records() {
        let records = default_records("alice.example", "203.0.113.10", &nameservers());
        let find = |name: &str, t: RecordType| {
            records
                .iter()
                .find(|r| r.name == name && r.record_type == t)
                .cloned()
        };
        for name in ["@", "www", "mail", "ftp"] {
            assert_eq!(find(name, RecordType::A).unwrap().content, "203.0.113.10");
        }
        assert_eq!(find("webmail", RecordType::CNAME).unwrap().content, "mail.alice.example.");
        let mx = find("@", RecordType::MX).unwrap();
        assert_eq!((mx.content.as_str(), mx.priority), ("mail.alice.example.", Some(10)));
        assert_eq!(
            find("@", RecordType::TXT).unwrap().content,
            "v=spf1 a mx ip4:203.0.113.10 ~all"
        );
        let ns: Vec<_> = records.iter().filter(|r| r.record_type == RecordType::NS).collect();
        assert_eq!(ns.len(), 2);
        assert_eq!(ns[0].content, "ns1.panel.example.");
    }

    #[test]
    fn test_ipv6_defaults() {
        let records = default_records("alice.example", "2001:db8::1", &nameservers());
        assert!(records.iter().any(|r| r.record_type == RecordType::AAAA && r.name == "www"));
        assert!(records.iter().any(|r| r.content.contains("ip6:2001:db8::1")));
    }

    #[test]
    fn test_group_order_and_apex_first() {
        let mut records = default_records("alice.example", "203.0.113.10", &nameservers());
        records.push(ZoneRecord::new("@", RecordType::CAA, "0 issue \"letsencrypt.org\""));
        records.push(
            ZoneRecord::new("_sip._tcp", RecordType::SRV, "5 5060 sip.alice.example.").with_priority(20),
        );
        records.reverse();
        let zone = render_zone("alice.example", 2026030709, &nameservers(), &records);

        let pos = |needle: &str| zone.find(needle).unwrap();
        assert!(pos("\tIN\tNS\t") < pos("\tIN\tA\t"));
        assert!(pos("\tIN\tA\t") < pos("\tIN\tCNAME\t"));
        assert!(pos("\tIN\tCNAME\t") < pos("\tIN\tMX\t"));
        assert!(pos("\tIN\tMX\t") < pos("\tIN\tTXT\t"));
        assert!(pos("\tIN\tTXT\t") < pos("\tIN\tSRV\t"));
        assert!(pos("\tIN\tSRV\t") < pos("\tIN\tCAA\t"));

        assert!(pos("@\t3600\tIN\tA\t") < pos("ftp\t3600\tIN\tA\t"));
        assert!(pos("ftp\t3600\tIN\tA\t") < pos("mail\t3600\tIN\tA\t"));
        assert!(pos("mail\t3600\tIN\tA\t") < pos("www\t3600\tIN\tA\t"));

        assert!(zone.contains("@\t3600\tIN\tMX\t10 mail.alice.example.\n"));
        assert!(zone.contains("_sip._tcp\t3600\tIN\tSRV\t20 5 5060 sip.alice.example.\n"));
        assert!(zone.contains("@\t3600\tIN\tTXT\t\"v=spf1 a mx ip4:203.0.113.10 ~all\"\n"));
    }

    #[test]
    fn test_soa_header() {
        let zone = render_zone("alice.example", 2026030709, &nameservers(), &[]);
        assert!(zone.starts_with("$ORIGIN alice.example.\n$TTL 3600\n"));
        assert!(zone.contains("SOA\tns1.panel.example. hostmaster.alice.example. ("));
    }

    #[test]
    fn test_txt_quoting() {
        assert_eq!(quote_txt("hello"), "\"hello\"");
        assert_eq!(quote_txt("\"already\""), "\"already\"");
        assert_eq!(quote_txt("say \"hi\""), "\"say \\\"hi\\\"\"");
        let long = "k".repeat(300);
        let quoted = quote_txt(&long);
        assert_eq!(quoted, format!("\"{}\" \"{}\"", "k".repeat(255), "k".repeat(45)));
    }

    #[test]
    fn test_record_type_parsing() {
        assert_eq!("mx".parse::<RecordType>().unwrap(), RecordType::MX);
        assert!("PTR".parse::<RecordType>().is_err());
        assert_eq!(serde_json::to_string(&RecordType::AAAA).unwrap(), "\"AAAA\"");
    }
}
