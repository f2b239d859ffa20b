use anyhow::ensure;
use serde::Deserialize;

use super::event::{Addr, PeerId};
use crate::sim::config::Config;
use crate::timeq::Cycle;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Mesi,
    Msi,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementKind {
    #[default]
    Lru,
    Fifo,
    Random,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HashKind {
    #[default]
    None,
    Mix,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CoherenceConfig {
    pub name: String,
    pub id: PeerId,
    pub line_size: usize,
    pub protocol: Protocol,
    // data array
    pub lines: usize,
    pub associativity: usize,
    pub replacement: ReplacementKind,
    // directory array
    pub dir_lines: usize,
    pub dir_associativity: usize,
    pub dir_replacement: ReplacementKind,
    pub hash: HashKind,
    pub seed: u64,
    pub mshr_size: usize,
    pub mshr_forward_reserve: usize,
    pub flush_queue_size: usize,
    pub access_latency: Cycle,
    pub tag_latency: Cycle,
    pub mshr_latency: Cycle,
    pub last_level: bool,
    pub silent_evict_clean: bool,
    pub writeback_clean_blocks: bool,
    pub recv_writeback_ack: bool,
    pub flush_helper: bool,
    pub downstream: Vec<PeerId>,
    pub upstream: Vec<PeerId>,
}

impl Config for CoherenceConfig {
    fn validate(&self) -> anyhow::Result<()> {
        self.ensure_valid()
    }
}

impl Default for CoherenceConfig {
    fn default() -> Self {
        Self {
            name: String::from("l2"),
            id: PeerId(100),
            line_size: 64,
            protocol: Protocol::Mesi,
            lines: 256,
            associativity: 4,
            replacement: ReplacementKind::Lru,
            dir_lines: 1024,
            dir_associativity: 8,
            dir_replacement: ReplacementKind::Lru,
            hash: HashKind::None,
            seed: 0,
            mshr_size: 16,
            mshr_forward_reserve: 2,
            flush_queue_size: 2,
            access_latency: 4,
            tag_latency: 1,
            mshr_latency: 1,
            last_level: false,
            silent_evict_clean: false,
            writeback_clean_blocks: false,
            recv_writeback_ack: false,
            flush_helper: true,
            downstream: vec![PeerId(200)],
            upstream: Vec::new(),
        }
    }
}

impl CoherenceConfig {
    pub fn ensure_valid(&self) -> anyhow::Result<()> {
        ensure!(self.line_size > 0, "line_size must be > 0");
        ensure!(self.line_size.is_power_of_two(), "line_size must be a power of two");
        ensure!(self.lines > 0, "lines must be > 0");
        ensure!(self.associativity > 0, "associativity must be > 0");
        ensure!(
            self.lines % self.associativity == 0,
            "lines ({}) must be a multiple of associativity ({})",
            self.lines,
            self.associativity
        );
        ensure!(self.dir_lines > 0, "dir_lines must be > 0");
        ensure!(self.dir_associativity > 0, "dir_associativity must be > 0");
        ensure!(
            self.dir_lines % self.dir_associativity == 0,
            "dir_lines ({}) must be a multiple of dir_associativity ({})",
            self.dir_lines,
            self.dir_associativity
        );
        ensure!(self.mshr_size > 0, "mshr_size must be > 0");
        ensure!(self.flush_queue_size > 0, "flush_queue_size must be > 0");
        ensure!(!self.downstream.is_empty(), "at least one downstream peer is required");
        ensure!(
            !self.downstream.contains(&self.id) && !self.upstream.contains(&self.id),
            "controller id {} must differ from its peers",
            self.id
        );
        Ok(())
    }

    pub fn line_addr(&self, addr: Addr) -> Addr {
        addr & !(self.line_size as Addr - 1)
    }

    /// Downstream peer responsible for `addr` (interleaved by line).
    pub fn downstream_for(&self, addr: Addr) -> PeerId {
        let line = addr / self.line_size as Addr;
        self.downstream[(line % self.downstream.len() as Addr) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoherenceConfig::default();
        config.ensure_valid().unwrap();
        assert_eq!(config.line_addr(0x7f), 0x40);
    }

    #[test]
    fn parses_section() {
        let text = r#"
            name = "llc"
            id = 7
            protocol = "msi"
            lines = 8
            associativity = 2
            replacement = "random"
            hash = "mix"
            downstream = [20, 21]
            upstream = [1, 2, 3]
        "#;
        let value: toml::Value = toml::from_str(text).unwrap();
        let config = CoherenceConfig::from_section(Some(&value)).unwrap();
        assert_eq!(config.name, "llc");
        assert_eq!(config.id, PeerId(7));
        assert_eq!(config.protocol, Protocol::Msi);
        assert_eq!(config.replacement, ReplacementKind::Random);
        assert_eq!(config.hash, HashKind::Mix);
        assert_eq!(config.dir_lines, 1024);
        assert_eq!(config.downstream_for(0x00), PeerId(20));
        assert_eq!(config.downstream_for(0x40), PeerId(21));
        assert_eq!(config.upstream.len(), 3);
    }

    #[test]
    fn missing_section_falls_back_to_defaults() {
        let config = CoherenceConfig::from_section(None).unwrap();
        assert_eq!(config.mshr_size, CoherenceConfig::default().mshr_size);
    }

    #[test]
    fn rejects_uneven_sets() {
        let config = CoherenceConfig {
            lines: 6,
            associativity: 4,
            ..CoherenceConfig::default()
        };
        let err = config.ensure_valid().unwrap_err();
        assert!(err.to_string().contains("multiple of associativity"), "{}", err);
    }

    #[test]
    fn invalid_section_is_an_error() {
        let value: toml::Value = toml::from_str("line_size = 48").unwrap();
        let err = CoherenceConfig::from_section(Some(&value)).unwrap_err();
        assert!(format!("{:#}", err).contains("power of two"), "{:#}", err);

        let value: toml::Value = toml::from_str("id = 200").unwrap();
        assert!(CoherenceConfig::from_section(Some(&value)).is_err());
    }
}
