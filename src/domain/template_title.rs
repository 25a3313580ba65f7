use unicode_segmentation::UnicodeSegmentation;

/// Display name of an email template: non-empty after trimming, at most 256
/// graphemes. Uniqueness is the store's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateTitle(String);

impl TemplateTitle {
    pub fn parse(title: String) -> Result<Self, String> {
        let title = title.trim();
        if title.is_empty() {
            return Err("Template title cannot be empty".to_string());
        }
        if title.graphemes(true).count() > 256 {
            return Err(format!("Template title is too long: {title:?}"));
        }
        Ok(Self(title.to_string()))
    }
}

impl AsRef<str> for TemplateTitle {
    fn as_ref(&self) -> &str { &self.0 }
}
