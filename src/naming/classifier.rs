use crate::context::StageContext;
use crate::error::ClassificationError;
use crate::models::SeriesMetadata;

const LOCALIZER_TYPES: &[&str] = &["LOCALIZER", "SCOUT"];
const LOCALIZER_DESCRIPTIONS: &[&str] = &["SCOUT", "LOCALIZER", "LOCALISER", "SURVEY", "LOCATOR"];
const DERIVED_TYPES: &[&str] = &["DERIVED", "SECONDARY"];

/// Outcome of classifying one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub convert: bool,
    pub error: Option<ClassificationError>,
    pub exclude_reason: Option<String>,
}

impl Classification {
    fn convert() -> Self {
        Self {
            convert: true,
            error: None,
            exclude_reason: None,
        }
    }

    fn exclude(reason: &str) -> Self {
        Self {
            convert: false,
            error: None,
            exclude_reason: Some(reason.to_string()),
        }
    }

    fn failed(error: ClassificationError) -> Self {
        Self {
            convert: false,
            exclude_reason: Some(error.to_string()),
            error: Some(error),
        }
    }
}

pub trait Classifier: Send + Sync {
    fn classify(&self, ctx: &StageContext, metadata: &SeriesMetadata) -> Classification;
}

/// Header-driven classifier: skips localizers and, unless forced, derived images.
#[derive(Debug, Clone, Default)]
pub struct MetadataClassifier {
    pub force_derived: bool,
}

impl MetadataClassifier {
    pub fn new(force_derived: bool) -> Self {
        Self { force_derived }
    }
}

impl Classifier for MetadataClassifier {
    fn classify(&self, ctx: &StageContext, metadata: &SeriesMetadata) -> Classification {
        if metadata.series_uid.is_none() {
            let result = Classification::failed(ClassificationError::MissingTag("SERIES_UID"));
            ctx.warn("series has no SeriesInstanceUID; not converting");
            return result;
        }
        if metadata.modality.is_none() {
            ctx.warn("series has no Modality; not converting");
            return Classification::failed(ClassificationError::MissingTag("MODALITY"));
        }

        let image_type: Vec<String> = metadata
            .image_type
            .iter()
            .map(|t| t.to_uppercase())
            .collect();
        let description = metadata
            .series_description
            .as_deref()
            .unwrap_or_default()
            .to_uppercase();

        if image_type.iter().any(|t| LOCALIZER_TYPES.contains(&t.as_str()))
            || LOCALIZER_DESCRIPTIONS.iter().any(|k| description.contains(k))
        {
            ctx.debug("excluded as localizer");
            return Classification::exclude("Localizer");
        }

        let derived = image_type
            .iter()
            .any(|t| DERIVED_TYPES.contains(&t.as_str()));
        if derived && !self.force_derived {
            ctx.debug("excluded as derived");
            return Classification::exclude("Derived");
        }

        Classification::convert()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(image_type: &[&str], description: &str) -> SeriesMetadata {
        SeriesMetadata {
            series_uid: Some("1.2.3".into()),
            modality: Some("MR".into()),
            image_type: image_type.iter().map(|s| s.to_string()).collect(),
            series_description: Some(description.into()),
            ..Default::default()
        }
    }

    #[test]
    fn original_series_is_converted() {
        let c = MetadataClassifier::default();
        let out = c.classify(&StageContext::default(), &series(&["ORIGINAL", "PRIMARY"], "AX T2"));
        assert!(out.convert);
    }

    #[test]
    fn localizers_are_skipped_even_when_forcing_derived() {
        let c = MetadataClassifier::new(true);
        let ctx = StageContext::default();
        assert!(!c.classify(&ctx, &series(&["ORIGINAL", "PRIMARY", "LOCALIZER"], "x")).convert);
        let out = c.classify(&ctx, &series(&["ORIGINAL", "PRIMARY"], "3-plane Scout"));
        assert_eq!(out.exclude_reason.as_deref(), Some("Localizer"));
    }

    #[test]
    fn derived_needs_override_flag() {
        let derived = series(&["DERIVED", "SECONDARY", "ADC"], "ADC map");
        let ctx = StageContext::default();
        assert!(!MetadataClassifier::new(false).classify(&ctx, &derived).convert);
        assert!(MetadataClassifier::new(true).classify(&ctx, &derived).convert);
    }

    #[test]
    fn missing_uid_is_recorded_not_dropped() {
        let mut meta = series(&["ORIGINAL"], "AX T1");
        meta.series_uid = None;
        let out = MetadataClassifier::default().classify(&StageContext::default(), &meta);
        assert!(!out.convert);
        assert_eq!(out.error.map(|e| e.code()).as_deref(), Some("MISSING_SERIES_UID"));
    }
}
