use crate::channel::EventKind;
use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "pebsmon")]
#[command(about = "PEBS-based page access monitor for Linux processes")]
#[command(version)]
pub struct Cli {
    /// Process IDs to monitor
    #[arg(required = true)]
    pub pids: Vec<i32>,

    /// Sampling period (hardware events per sample)
    #[arg(long, short = 'n', default_value = "100000")]
    pub period: u64,

    /// Hardware events to sample
    #[arg(long, short = 'e', value_enum, default_value = "llc-miss")]
    pub events: Vec<EventArg>,

    /// Wait budget per poll iteration
    #[arg(long, default_value = "100ms", value_parser = parse_duration)]
    pub poll_timeout: Duration,

    /// Stop after this long (default: until Ctrl-C)
    #[arg(long, short = 'd', value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// Accesses per interval beyond which a page counts as hot
    #[arg(long, default_value = "1")]
    pub hot_threshold: u32,

    /// How often to classify pages as hot or cold
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    pub classify_interval: Duration,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum EventArg {
    LlcMiss,
    AllLoads,
    AllStores,
}

impl EventArg {
    pub fn kind(self) -> EventKind {
        match self {
            EventArg::LlcMiss => EventKind::LlcMiss,
            EventArg::AllLoads => EventKind::AllLoads,
            EventArg::AllStores => EventKind::AllStores,
        }
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    // Try humantime first
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }

    // Try bare number as seconds
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    Err(format!("Invalid duration '{}'. Examples: 100ms, 30s, 5m", s))
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if self.period == 0 {
            return Err("Sampling period must be non-zero".to_string());
        }
        if let Some(&pid) = self.pids.iter().find(|&&p| p <= 0) {
            return Err(format!("Invalid PID {pid}"));
        }
        Ok(())
    }
}
