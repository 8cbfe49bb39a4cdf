use anyhow::Result;
use ipt_core::{EngineError, LoadReport, Table, Verdict};
use prometheus::{
    Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Prometheus counters and gauges for the rule engine
pub struct EngineMetrics {
    registry: Registry,

    // Evaluation metrics
    verdicts: IntCounterVec,
    evaluation_errors: IntCounterVec,

    // Rule load metrics
    skipped_lines: IntCounterVec,

    // Table state
    chain_rules: IntGaugeVec,
    established_connections: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let verdicts = IntCounterVec::new(
            Opts::new("iptsim_verdicts_total", "Packets evaluated, by chain and verdict"),
            &["chain", "verdict"],
        )?;
        registry.register(Box::new(verdicts.clone()))?;

        let evaluation_errors = IntCounterVec::new(
            Opts::new(
                "iptsim_evaluation_errors_total",
                "Evaluations aborted by a traversal error",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(evaluation_errors.clone()))?;

        let skipped_lines = IntCounterVec::new(
            Opts::new(
                "iptsim_skipped_lines_total",
                "Rule file lines that were not applied",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(skipped_lines.clone()))?;

        let chain_rules = IntGaugeVec::new(
            Opts::new("iptsim_chain_rules", "Number of rules per chain"),
            &["chain"],
        )?;
        registry.register(Box::new(chain_rules.clone()))?;

        let established_connections = IntGauge::new(
            "iptsim_established_connections",
            "Flows currently tracked as established",
        )?;
        registry.register(Box::new(established_connections.clone()))?;

        Ok(Self {
            registry,
            verdicts,
            evaluation_errors,
            skipped_lines,
            chain_rules,
            established_connections,
        })
    }

    pub fn record_verdict(&self, chain: &str, verdict: Verdict) {
        self.verdicts
            .with_label_values(&[chain, verdict.as_str()])
            .inc();
    }

    pub fn record_error(&self, error: &EngineError) {
        self.evaluation_errors
            .with_label_values(&[error.kind()])
            .inc();
    }

    /// Count skipped lines of a finished load, by reason
    pub fn observe_load(&self, report: &LoadReport) {
        for skipped in &report.skipped {
            self.skipped_lines
                .with_label_values(&[skipped.reason.kind()])
                .inc();
        }
    }

    /// Refresh the gauges from the current table
    pub fn observe_table(&self, table: &Table) {
        for chain in table.chains() {
            self.chain_rules
                .with_label_values(&[chain.name()])
                .set(chain.len() as i64);
        }
        self.established_connections
            .set(table.conntrack().len() as i64);
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
