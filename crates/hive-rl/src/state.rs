//! State and Action types for the YouTube optimization RL loop

use hive_core::MetricMap;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Per-video performance metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoMetrics {
    pub views: f64,
    pub likes: f64,
    pub comments: f64,
    pub watch_time_seconds: f64,
    /// Click-through rate, already a fraction in [0, 1]
    pub ctr: f64,
    /// Engagement rate, already a fraction in [0, 1]
    pub engagement_rate: f64,
}

/// Channel-level metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelMetrics {
    pub subscribers: f64,
    pub total_views: f64,
    pub avg_engagement_rate: f64,
}

/// Wall-clock context stamped at observation time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemporalContext {
    pub hour: u32,
    pub day_of_week: u32,
    pub month: u32,
}

/// Content descriptors for the video under consideration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentContext {
    pub video_category: Option<String>,
    pub duration_minutes: f64,
    pub language: Option<String>,
}

/// Audience descriptors
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudienceContext {
    pub demographic: Option<String>,
    pub region: Option<String>,
    pub device_type: Option<String>,
}

/// State snapshot for the RL loop.
///
/// States are constructed fresh on every observation and never mutated;
/// each decision cycle produces a new value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    pub video_metrics: VideoMetrics,
    pub channel_metrics: ChannelMetrics,
    pub temporal_context: TemporalContext,
    pub content_context: ContentContext,
    pub audience_context: AudienceContext,
}

impl State {
    /// Convert the state to a fixed-length normalized feature vector.
    ///
    /// Counting metrics are min-max normalized against fixed reference
    /// scales (views against 1M, likes against 10k, ...); rates are used
    /// as-is. The resulting vector feeds the discretizer for Q-table
    /// hashing.
    pub fn to_features(&self) -> Vec<f64> {
        let v = &self.video_metrics;
        let c = &self.channel_metrics;

        vec![
            (v.views / 1_000_000.0).min(1.0),
            (v.likes / 10_000.0).min(1.0),
            (v.comments / 1_000.0).min(1.0),
            (v.watch_time_seconds / 3_600.0).min(1.0),
            v.ctr,
            v.engagement_rate,
            (c.subscribers / 1_000_000.0).min(1.0),
            (c.total_views / 100_000_000.0).min(1.0),
            c.avg_engagement_rate,
            f64::from(self.temporal_context.hour) / 24.0,
            f64::from(self.temporal_context.day_of_week) / 7.0,
            (self.content_context.duration_minutes / 60.0).min(1.0),
        ]
    }

    /// Feature vector dimension
    pub fn dimension(&self) -> usize {
        self.to_features().len()
    }

    /// Flatten the video and channel metrics into a raw metric snapshot,
    /// keyed the way the reward calculator expects.
    pub fn metric_snapshot(&self) -> MetricMap {
        let mut map = MetricMap::new();
        map.insert("views".to_string(), self.video_metrics.views);
        map.insert("likes".to_string(), self.video_metrics.likes);
        map.insert("comments".to_string(), self.video_metrics.comments);
        map.insert("watch_time".to_string(), self.video_metrics.watch_time_seconds);
        map.insert("ctr".to_string(), self.video_metrics.ctr);
        map.insert("engagement_rate".to_string(), self.video_metrics.engagement_rate);
        map.insert("subscribers".to_string(), self.channel_metrics.subscribers);
        map.insert("total_views".to_string(), self.channel_metrics.total_views);
        map
    }
}

/// The closed set of optimization action kinds.
///
/// Declaration order is significant: greedy selection iterates `ALL` in this
/// order and keeps the first maximum, so ties break toward earlier variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    UploadTimeOptimization,
    TitleOptimization,
    ThumbnailOptimization,
    DescriptionOptimization,
    TagOptimization,
    ContentStrategy,
    AudienceEngagement,
}

impl ActionKind {
    /// All action kinds in tie-break order
    pub const ALL: [ActionKind; 7] = [
        ActionKind::UploadTimeOptimization,
        ActionKind::TitleOptimization,
        ActionKind::ThumbnailOptimization,
        ActionKind::DescriptionOptimization,
        ActionKind::TagOptimization,
        ActionKind::ContentStrategy,
        ActionKind::AudienceEngagement,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::UploadTimeOptimization => "upload_time_optimization",
            ActionKind::TitleOptimization => "title_optimization",
            ActionKind::ThumbnailOptimization => "thumbnail_optimization",
            ActionKind::DescriptionOptimization => "description_optimization",
            ActionKind::TagOptimization => "tag_optimization",
            ActionKind::ContentStrategy => "content_strategy",
            ActionKind::AudienceEngagement => "audience_engagement",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind-specific action parameters.
///
/// Parameters are sampled from small curated option sets with an unseeded
/// RNG: identical states can legitimately yield different parameters on
/// repeated exploitation. This variety is intentional, not a bug.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionParams {
    UploadTime {
        suggested_hour: u32,
        reason: String,
    },
    Title {
        strategy: String,
        max_length: u32,
        include_keywords: bool,
    },
    Thumbnail {
        style: String,
        face_detection: bool,
        text_size: String,
    },
    ContentStrategy {
        content_type: String,
        duration_target_secs: u32,
        series_potential: bool,
    },
    Generic,
}

/// Peak engagement hours for upload-time suggestions
const SUGGESTED_HOURS: [u32; 4] = [8, 12, 16, 20];

const TITLE_STRATEGIES: [&str; 4] = [
    "emotional_trigger",
    "curiosity_gap",
    "number_based",
    "question_based",
];

const THUMBNAIL_STYLES: [&str; 4] = [
    "bright_colors",
    "contrast_face",
    "text_overlay",
    "emotional_expression",
];

const CONTENT_TYPES: [&str; 4] = ["tutorial", "entertainment", "educational", "trending_topic"];

const DURATION_TARGETS: [u32; 3] = [600, 900, 1200];

impl ActionParams {
    /// Sample parameters for the given kind from its curated option set
    pub fn sample<R: Rng + ?Sized>(kind: ActionKind, rng: &mut R) -> Self {
        match kind {
            ActionKind::UploadTimeOptimization => ActionParams::UploadTime {
                suggested_hour: *SUGGESTED_HOURS.choose(rng).unwrap_or(&12),
                reason: "peak_engagement_time".to_string(),
            },
            ActionKind::TitleOptimization => ActionParams::Title {
                strategy: (*TITLE_STRATEGIES.choose(rng).unwrap_or(&"curiosity_gap")).to_string(),
                max_length: 60,
                include_keywords: true,
            },
            ActionKind::ThumbnailOptimization => ActionParams::Thumbnail {
                style: (*THUMBNAIL_STYLES.choose(rng).unwrap_or(&"bright_colors")).to_string(),
                face_detection: true,
                text_size: if rng.gen_bool(0.5) { "large" } else { "medium" }.to_string(),
            },
            ActionKind::ContentStrategy => ActionParams::ContentStrategy {
                content_type: (*CONTENT_TYPES.choose(rng).unwrap_or(&"tutorial")).to_string(),
                duration_target_secs: *DURATION_TARGETS.choose(rng).unwrap_or(&600),
                series_potential: rng.gen_bool(0.5),
            },
            ActionKind::DescriptionOptimization
            | ActionKind::TagOptimization
            | ActionKind::AudienceEngagement => ActionParams::Generic,
        }
    }
}

/// An optimization action chosen by the Q-agent.
///
/// Immutable value object once returned; confidence is derived from the
/// Q-value of the chosen kind in the current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub params: ActionParams,
    pub confidence: f64,
}
