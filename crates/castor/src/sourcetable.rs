use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::debug;

/// One `STR` entry of a sourcetable.
#[derive(Debug, Clone, Serialize)]
pub struct SourceLine {
    pub mountpoint: String,
    /// The STR line as received.
    pub raw: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub bitrate: Option<u32>,
    pub is_virtual: bool,
    pub on_demand: bool,
}

impl SourceLine {
    /// Parses a `STR;...` line. Position and bitrate are kept when
    /// they parse; the raw line is preserved either way.
    pub fn parse(raw: &str) -> Option<Self> {
        let fields: Vec<&str> = raw.split(';').collect();
        if fields.first() != Some(&"STR") || fields.len() < 2 || fields[1].is_empty() {
            return None;
        }
        Some(Self {
            mountpoint: fields[1].to_string(),
            lat: fields.get(9).and_then(|s| s.parse().ok()),
            lon: fields.get(10).and_then(|s| s.parse().ok()),
            bitrate: fields.get(17).and_then(|s| s.parse().ok()),
            is_virtual: false,
            on_demand: false,
            raw: raw.to_string(),
        })
    }
}

/// A sourcetable advertised by one caster: `CAS`/`NET` header lines
/// plus `STR` entries keyed by mountpoint in arrival order.
#[derive(Debug, Clone, Serialize)]
pub struct Sourcetable {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub priority: i32,
    /// Whether mountpoint streams may be pulled from this caster on
    /// demand.
    pub pullable: bool,
    pub fetched: DateTime<Utc>,
    header_lines: Vec<String>,
    entries: IndexMap<String, SourceLine>,
}

impl Sourcetable {
    pub fn new(host: &str, port: u16, tls: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            tls,
            priority: 0,
            pullable: false,
            fetched: Utc::now(),
            header_lines: Vec::new(),
            entries: IndexMap::new(),
        }
    }

    /// Feeds one received line. Unknown prefixes are ignored; real
    /// tables carry comment noise more often than not.
    pub fn parse_line(&mut self, line: &str) {
        if line.starts_with("STR;") {
            match SourceLine::parse(line) {
                Some(entry) => {
                    self.entries.insert(entry.mountpoint.clone(), entry);
                }
                None => debug!(line, "unparseable STR line"),
            }
        } else if line.starts_with("CAS;") || line.starts_with("NET;") {
            self.header_lines.push(line.to_string());
        } else if !line.is_empty() {
            debug!(line, "ignoring sourcetable line");
        }
    }

    pub fn nentries(&self, omit_virtual: bool) -> usize {
        if omit_virtual {
            self.entries.values().filter(|e| !e.is_virtual).count()
        } else {
            self.entries.len()
        }
    }

    pub fn find_mountpoint(&self, mountpoint: &str) -> Option<&SourceLine> {
        self.entries.get(mountpoint)
    }

    pub fn header_lines(&self) -> &[String] {
        &self.header_lines
    }
}

/// Priority-ordered stack of sourcetables, at most one per upstream
/// `(host, port)`.
#[derive(Default)]
pub struct SourcetableStack {
    /// Ordered by decreasing priority.
    tables: Mutex<Vec<Arc<Sourcetable>>>,
}

impl SourcetableStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs, replaces, or removes (`None`) the table for
    /// `(host, port)`. Host comparison is case-insensitive.
    pub fn replace_host(&self, host: &str, port: u16, table: Option<Sourcetable>) {
        let mut tables = self.tables.lock().unwrap();
        tables.retain(|t| !(t.host.eq_ignore_ascii_case(host) && t.port == port));
        if let Some(table) = table {
            let pos = tables
                .iter()
                .position(|t| t.priority < table.priority)
                .unwrap_or(tables.len());
            tables.insert(pos, Arc::new(table));
        }
    }

    pub fn table_for(&self, host: &str, port: u16) -> Option<Arc<Sourcetable>> {
        self.tables
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.host.eq_ignore_ascii_case(host) && t.port == port)
            .cloned()
    }

    /// Highest-priority entry for a mountpoint across the stack.
    pub fn find_mountpoint(&self, mountpoint: &str) -> Option<(Arc<Sourcetable>, SourceLine)> {
        let tables = self.tables.lock().unwrap();
        for table in tables.iter() {
            if let Some(line) = table.find_mountpoint(mountpoint) {
                return Some((table.clone(), line.clone()));
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.tables.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STR_LINE: &str = "STR;MP1;;RTCM 3.2;;;;;;48.85;2.35;0;0;;;;;9600";

    #[test]
    fn parses_str_entries() {
        let line = SourceLine::parse(STR_LINE).unwrap();
        assert_eq!(line.mountpoint, "MP1");
        assert_eq!(line.lat, Some(48.85));
        assert_eq!(line.lon, Some(2.35));
        assert_eq!(line.bitrate, Some(9600));
    }

    #[test]
    fn table_collects_entries_and_headers() {
        let mut table = Sourcetable::new("caster.example.com", 2101, false);
        table.parse_line("CAS;caster.example.com;2101;;;0;FRA;48.8;2.3;");
        table.parse_line(STR_LINE);
        table.parse_line("STR;;broken line without mountpoint");
        table.parse_line("# noise");

        assert_eq!(table.nentries(false), 1);
        assert_eq!(table.header_lines().len(), 1);
        assert!(table.find_mountpoint("MP1").is_some());
        assert!(table.find_mountpoint("MP2").is_none());
    }

    #[test]
    fn stack_orders_by_decreasing_priority() {
        let stack = SourcetableStack::new();
        let mut low = Sourcetable::new("low.example.com", 2101, false);
        low.priority = 10;
        let mut high = Sourcetable::new("high.example.com", 2101, false);
        high.priority = 90;
        low.parse_line(STR_LINE);
        high.parse_line(STR_LINE);

        stack.replace_host("low.example.com", 2101, Some(low));
        stack.replace_host("high.example.com", 2101, Some(high));

        let (winner, _) = stack.find_mountpoint("MP1").unwrap();
        assert_eq!(winner.host, "high.example.com");
    }

    #[test]
    fn replace_host_swaps_and_removes() {
        let stack = SourcetableStack::new();
        stack.replace_host("h", 2101, Some(Sourcetable::new("h", 2101, false)));
        assert_eq!(stack.len(), 1);

        // replacement, not accumulation, and case-insensitive host match
        stack.replace_host("H", 2101, Some(Sourcetable::new("H", 2101, false)));
        assert_eq!(stack.len(), 1);

        stack.replace_host("h", 2101, None);
        assert!(stack.is_empty());
    }
}
