//! Prometheus metric definitions exposed on `/metrics`.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub struct Metrics {
    pub registry: Registry,
    pub retrieve_requests_total: IntCounter,
    pub refresh_requests_total: IntCounter,
    pub cdc_processed_total: IntCounter,
    pub cdc_errors_total: IntCounterVec,
    pub embed_latency_seconds: Histogram,
    pub rerank_latency_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let retrieve_requests_total = IntCounter::with_opts(Opts::new(
            "retrieve_requests_total",
            "Total /retrieve requests served",
        ))?;
        let refresh_requests_total = IntCounter::with_opts(Opts::new(
            "refresh_requests_total",
            "Total /refresh and /bulk-refresh requests served",
        ))?;
        let cdc_processed_total = IntCounter::with_opts(Opts::new(
            "cdc_processed_count",
            "Total CDC events successfully embedded and stored",
        ))?;
        let cdc_errors_total = IntCounterVec::new(
            Opts::new("cdc_error_count", "Total CDC events that failed processing, by stage"),
            &["stage"],
        )?;
        let embed_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "embedding_latency_seconds",
            "Latency of embedding model calls",
        ))?;
        let rerank_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "rerank_latency_seconds",
            "Latency of cross-encoder rerank calls",
        ))?;

        registry.register(Box::new(retrieve_requests_total.clone()))?;
        registry.register(Box::new(refresh_requests_total.clone()))?;
        registry.register(Box::new(cdc_processed_total.clone()))?;
        registry.register(Box::new(cdc_errors_total.clone()))?;
        registry.register(Box::new(embed_latency_seconds.clone()))?;
        registry.register(Box::new(rerank_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            retrieve_requests_total,
            refresh_requests_total,
            cdc_processed_total,
            cdc_errors_total,
            embed_latency_seconds,
            rerank_latency_seconds,
        })
    }

    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_prometheus_text_format() {
        let metrics = Metrics::new().unwrap();
        metrics.retrieve_requests_total.inc();
        let text = metrics.render().unwrap();
        assert!(text.contains("retrieve_requests_total"));
    }
}
