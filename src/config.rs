use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SchedulerConfig {
    pub interval_sec: u64,
    pub batch_size: i64,
    pub lock_ttl_sec: u64,
    pub parse_concurrency: usize,
    pub job_max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_sec: 300,
            batch_size: 50,
            lock_ttl_sec: 60,
            parse_concurrency: 4,
            job_max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ParserConfig {
    pub incremental_minutes: i64,
    pub lpa_max_age_hours: i64,
    pub historical_hours: i64,
    pub stats_window_days: i64,
    pub chunk_size: usize,
    pub quarantine_ttl_sec: u64,
    pub post_retention_days: i64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            incremental_minutes: 5,
            lpa_max_age_hours: 48,
            historical_hours: 24,
            stats_window_days: 14,
            chunk_size: 200,
            quarantine_ttl_sec: 3600,
            post_retention_days: 90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FeatureConfig {
    pub adaptive_thresholds: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            adaptive_thresholds: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StageConfig {
    pub batch_size: usize,
    pub block_ms: usize,
    pub pending_idle_ms: u64,
    pub max_retries: u64,
    pub tagging_workers: usize,
    pub enrichment_workers: usize,
    pub indexing_workers: usize,
    pub graph_workers: usize,
    pub vision_workers: usize,
    pub trend_workers: usize,
    pub digest_workers: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            block_ms: 5000,
            pending_idle_ms: 30_000,
            max_retries: 3,
            tagging_workers: 2,
            enrichment_workers: 2,
            indexing_workers: 2,
            graph_workers: 1,
            vision_workers: 2,
            trend_workers: 1,
            digest_workers: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TrendConfig {
    pub freq_ratio_threshold: f64,
    pub min_source_diversity: usize,
    pub coherence_threshold: f64,
    pub similarity_threshold: f64,
    /// A near-miss at or above this (but below `similarity_threshold`)
    /// seeds a subtopic under the closest main topic instead of an
    /// unrelated new cluster.
    pub subtopic_similarity_threshold: f64,
    pub cooldown_minutes: i64,
    pub baseline_alpha: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            freq_ratio_threshold: 3.0,
            min_source_diversity: 3,
            coherence_threshold: 0.55,
            similarity_threshold: 0.83,
            subtopic_similarity_threshold: 0.70,
            cooldown_minutes: 120,
            baseline_alpha: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct QuotaConfig {
    pub per_tenant_max_gb: f64,
    pub tagging_bucket_capacity: u32,
    pub tagging_refill_per_sec: f64,
    pub crawl_bucket_capacity: u32,
    pub crawl_refill_per_sec: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            per_tenant_max_gb: 2.0,
            tagging_bucket_capacity: 60,
            tagging_refill_per_sec: 1.0,
            crawl_bucket_capacity: 20,
            crawl_refill_per_sec: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VisionConfig {
    pub ocr_fallback_enabled: bool,
    pub schema_version: u32,
    /// Empty list means every channel is allowed.
    pub channel_allowlist: Vec<String>,
    pub trigger_tags: Vec<String>,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            ocr_fallback_enabled: true,
            schema_version: 1,
            channel_allowlist: Vec::new(),
            trigger_tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EnrichmentConfig {
    pub trigger_tags: Vec<String>,
    pub min_word_count: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            trigger_tags: Vec::new(),
            min_word_count: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GatewayConfig {
    pub base_url: String,
    pub token: String,
    pub page_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://tg-gateway:8081".into(),
            token: String::new(),
            page_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProvidersConfig {
    pub tagging_url: String,
    pub tagging_model: String,
    pub vision_url: String,
    pub vision_model: String,
    pub ocr_url: String,
    pub embedding_url: String,
    pub embedding_model: String,
    pub graph_url: String,
    pub crawl_url: String,
    pub digest_url: String,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            tagging_url: "http://tagger:8100".into(),
            tagging_model: "tags-small".into(),
            vision_url: "http://vision:8101".into(),
            vision_model: "vision-base".into(),
            ocr_url: "http://ocr:8102".into(),
            embedding_url: "http://embeddings:8103".into(),
            embedding_model: "embed-v2".into(),
            graph_url: "http://graph:8104".into(),
            crawl_url: "http://crawler:8105".into(),
            digest_url: "http://digester:8106".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Tenants this deployment serves. Streams and quotas are scoped per
    /// entry.
    pub tenants: Vec<String>,
    pub redis_url: String,
    pub s3_bucket: String,
    pub db_pool_size: u32,
    pub metrics_port: u16,
    pub gateway: GatewayConfig,
    pub scheduler: SchedulerConfig,
    pub parser: ParserConfig,
    pub feature: FeatureConfig,
    pub stages: StageConfig,
    pub trend: TrendConfig,
    pub quota: QuotaConfig,
    pub vision: VisionConfig,
    pub enrichment: EnrichmentConfig,
    pub providers: ProvidersConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tenants: vec!["default".into()],
            redis_url: "redis://redis:6379/0".into(),
            s3_bucket: "tgpulse".into(),
            db_pool_size: 20,
            metrics_port: 9184,
            gateway: Default::default(),
            scheduler: Default::default(),
            parser: Default::default(),
            feature: Default::default(),
            stages: Default::default(),
            trend: Default::default(),
            quota: Default::default(),
            vision: Default::default(),
            enrichment: Default::default(),
            providers: Default::default(),
        }
    }
}

impl PipelineConfig {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file("TGPULSE.toml"))
            .merge(Env::prefixed("TGPULSE_").split("__"))
    }

    pub fn config() -> figment::Result<Self> {
        Self::figment().extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_surface() {
        let config = PipelineConfig::default();
        assert_eq!(config.parser.incremental_minutes, 5);
        assert_eq!(config.parser.lpa_max_age_hours, 48);
        assert_eq!(config.parser.historical_hours, 24);
        assert_eq!(config.parser.stats_window_days, 14);
        assert_eq!(config.scheduler.interval_sec, 300);
        assert_eq!(config.scheduler.batch_size, 50);
        assert!(config.feature.adaptive_thresholds);
        assert_eq!(config.trend.freq_ratio_threshold, 3.0);
        assert_eq!(config.trend.min_source_diversity, 3);
        assert_eq!(config.trend.coherence_threshold, 0.55);
        assert!(config.trend.subtopic_similarity_threshold < config.trend.similarity_threshold);
        assert_eq!(config.quota.per_tenant_max_gb, 2.0);
        assert!(config.vision.ocr_fallback_enabled);
        assert_eq!(config.enrichment.min_word_count, 500);
    }
}
