use strum::{Display, EnumString, IntoStaticStr};

/// Pipeline position of a post. Transitions are monotonic; `Failed` and
/// `Skipped` are terminal for the current pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum EnrichmentStatus {
    Pending,
    Tagged,
    Enriched,
    Indexed,
    Failed,
    Skipped,
}

impl EnrichmentStatus {
    /// The statuses a row is allowed to be in immediately before moving to
    /// `self`. Used as the WHERE guard on status updates so a replayed
    /// event can never move a post backwards.
    pub fn allowed_predecessors(self) -> &'static [EnrichmentStatus] {
        use EnrichmentStatus::*;
        match self {
            Pending => &[],
            Tagged => &[Pending],
            Enriched => &[Pending, Tagged],
            Indexed => &[Pending, Tagged, Enriched],
            Failed => &[Pending, Tagged, Enriched],
            Skipped => &[Pending, Tagged, Enriched],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum IndexStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ClusterStatus {
    Emerging,
    Stable,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum DigestStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum PostSource {
    Channel,
    Group,
    Dm,
    Persona,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_text_roundtrip() {
        for status in [
            EnrichmentStatus::Pending,
            EnrichmentStatus::Tagged,
            EnrichmentStatus::Enriched,
            EnrichmentStatus::Indexed,
            EnrichmentStatus::Failed,
            EnrichmentStatus::Skipped,
        ] {
            let text = status.to_string();
            assert_eq!(EnrichmentStatus::from_str(&text).unwrap(), status);
        }
    }

    #[test]
    fn static_str_matches_display() {
        assert_eq!(<&'static str>::from(PostSource::Dm), "dm");
        assert_eq!(<&'static str>::from(ClusterStatus::Emerging), "emerging");
        assert_eq!(<&'static str>::from(DigestStatus::Sent), "sent");
        assert_eq!(
            <&'static str>::from(EnrichmentStatus::Pending),
            EnrichmentStatus::Pending.to_string()
        );
    }

    #[test]
    fn terminal_statuses_never_precede_anything() {
        for status in [
            EnrichmentStatus::Tagged,
            EnrichmentStatus::Enriched,
            EnrichmentStatus::Indexed,
            EnrichmentStatus::Failed,
            EnrichmentStatus::Skipped,
        ] {
            let preds = status.allowed_predecessors();
            assert!(!preds.contains(&EnrichmentStatus::Failed));
            assert!(!preds.contains(&EnrichmentStatus::Skipped));
            assert!(!preds.contains(&EnrichmentStatus::Indexed));
        }
    }
}
