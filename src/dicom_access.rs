use dicom::core::Tag;
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::{DefaultDicomObject, InMemDicomObject};

/// Small helper trait to pull trimmed string values from different DICOM object shapes.
pub trait ElementAccess {
    fn raw_str(&self, tag: Tag) -> Option<String>;
    fn has_element(&self, tag: Tag) -> bool;

    /// Non-empty value with DICOM padding stripped.
    fn element_str(&self, tag: Tag) -> Option<String> {
        self.raw_str(tag)
            .map(|s| s.trim_matches(|c: char| c.is_whitespace() || c == '\0').to_string())
            .filter(|s| !s.is_empty())
    }

    /// Multi-valued elements split on the DICOM backslash separator.
    fn element_values(&self, tag: Tag) -> Vec<String> {
        self.element_str(tag)
            .map(|s| {
                s.split('\\')
                    .map(|part| part.trim().to_string())
                    .filter(|part| !part.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn element_f64(&self, tag: Tag) -> Option<f64> {
        self.element_values(tag)
            .first()
            .and_then(|v| v.parse::<f64>().ok())
    }

    fn element_f64s(&self, tag: Tag) -> Vec<f64> {
        self.element_values(tag)
            .iter()
            .filter_map(|v| v.parse::<f64>().ok())
            .collect()
    }
}

impl ElementAccess for DefaultDicomObject {
    fn raw_str(&self, tag: Tag) -> Option<String> {
        self.element(tag)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.into_owned())
    }

    fn has_element(&self, tag: Tag) -> bool {
        self.element(tag).is_ok()
    }
}

impl ElementAccess for InMemDicomObject<StandardDataDictionary> {
    fn raw_str(&self, tag: Tag) -> Option<String> {
        self.element(tag)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.into_owned())
    }

    fn has_element(&self, tag: Tag) -> bool {
        self.element(tag).is_ok()
    }
}
